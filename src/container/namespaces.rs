//! Well-known capability namespaces, directives, and attributes
//!
//! Namespaces are opaque strings to the container; these constants cover the
//! namespaces the container itself understands (identity for singleton
//! handling, host for fragment attachment) and the attribute keys used for
//! version ordering.

/// Identity namespace: one capability per named revision
pub const IDENTITY_NAMESPACE: &str = "module.identity";

/// Package namespace: exported/imported code packages
pub const PACKAGE_NAMESPACE: &str = "module.package";

/// Module dependency namespace: whole-module requirements
pub const MODULE_NAMESPACE: &str = "module.require";

/// Host namespace: fragment-to-host attachment
pub const HOST_NAMESPACE: &str = "module.host";

/// Attribute carrying the symbolic name on an identity capability
pub const IDENTITY_NAME_ATTRIBUTE: &str = "identity";

/// Version attribute on identity capabilities
pub const IDENTITY_VERSION_ATTRIBUTE: &str = "version";

/// Version attribute on package capabilities
pub const PACKAGE_VERSION_ATTRIBUTE: &str = "package.version";

/// Version attribute on module dependency capabilities
pub const MODULE_VERSION_ATTRIBUTE: &str = "module.version";

/// Version attribute on host capabilities
pub const HOST_VERSION_ATTRIBUTE: &str = "host.version";

/// Directive marking an identity capability as singleton
pub const SINGLETON_DIRECTIVE: &str = "singleton";

/// Directive carrying a requirement's filter expression
pub const FILTER_DIRECTIVE: &str = "filter";

/// Directive controlling whether a requirement is mandatory or optional
pub const RESOLUTION_DIRECTIVE: &str = "resolution";

/// [`RESOLUTION_DIRECTIVE`] value for optional requirements
pub const RESOLUTION_OPTIONAL: &str = "optional";

/// Directive declaring when a requirement takes effect
pub const EFFECTIVE_DIRECTIVE: &str = "effective";

/// [`EFFECTIVE_DIRECTIVE`] value considered during resolution (the default)
pub const EFFECTIVE_RESOLVE: &str = "resolve";

/// The version attribute key for a namespace.
///
/// Identity, package, module, and host namespaces each name their own version
/// attribute; every other namespace falls back to the identity key.
pub fn version_attribute(namespace: &str) -> &'static str {
    match namespace {
        PACKAGE_NAMESPACE => PACKAGE_VERSION_ATTRIBUTE,
        MODULE_NAMESPACE => MODULE_VERSION_ATTRIBUTE,
        HOST_NAMESPACE => HOST_VERSION_ATTRIBUTE,
        _ => IDENTITY_VERSION_ATTRIBUTE,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_attribute_per_namespace() {
        assert_eq!(version_attribute(IDENTITY_NAMESPACE), "version");
        assert_eq!(version_attribute(PACKAGE_NAMESPACE), "package.version");
        assert_eq!(version_attribute(MODULE_NAMESPACE), "module.version");
        assert_eq!(version_attribute(HOST_NAMESPACE), "host.version");
        // Unknown namespaces fall back to the identity key
        assert_eq!(version_attribute("vendor.custom"), "version");
    }
}
