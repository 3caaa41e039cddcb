//! Shared test utilities for container integration tests
//!
//! Provides builders for the module shapes the tests install: plain named
//! modules, singletons, package providers/consumers, and fragment/host pairs.

#![allow(dead_code)]

use std::collections::BTreeMap;

use module_container::container::namespaces;
use module_container::{
    AttrValue, ContainerConfig, ModuleContainer, ModuleRevisionBuilder, RevisionTypes,
};
use semver::Version;

/// Initialize test logging; safe to call repeatedly
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
}

/// A container with the default in-memory strategies
pub fn container() -> ModuleContainer {
    init_tracing();
    ModuleContainer::with_defaults(ContainerConfig::default())
}

pub fn v(version: &str) -> Version {
    Version::parse(version).unwrap()
}

/// A plain named module with no declared capabilities or requirements beyond
/// its identity
pub fn module(name: &str, version: &str) -> ModuleRevisionBuilder {
    ModuleRevisionBuilder::new()
        .symbolic_name(name)
        .version(v(version))
}

/// A singleton module: at most one resolved revision per name
pub fn singleton(name: &str, version: &str) -> ModuleRevisionBuilder {
    module(name, version).singleton(true)
}

/// Directive map carrying a single filter expression
pub fn filter_directives(filter: &str) -> BTreeMap<String, String> {
    let mut directives = BTreeMap::new();
    directives.insert(namespaces::FILTER_DIRECTIVE.to_string(), filter.to_string());
    directives
}

/// A module exporting one package capability
pub fn provider(name: &str, version: &str, package: &str) -> ModuleRevisionBuilder {
    let mut attributes = BTreeMap::new();
    attributes.insert("package".to_string(), AttrValue::from(package));
    attributes.insert(
        namespaces::PACKAGE_VERSION_ATTRIBUTE.to_string(),
        AttrValue::Version(v(version)),
    );
    module(name, version).add_capability(
        namespaces::PACKAGE_NAMESPACE,
        BTreeMap::new(),
        attributes,
    )
}

/// A module with one mandatory package requirement
pub fn consumer(name: &str, version: &str, package: &str) -> ModuleRevisionBuilder {
    module(name, version).add_requirement(
        namespaces::PACKAGE_NAMESPACE,
        filter_directives(&format!("(package={})", package)),
        BTreeMap::new(),
    )
}

/// A module with one optional package requirement
pub fn optional_consumer(name: &str, version: &str, package: &str) -> ModuleRevisionBuilder {
    let mut directives = filter_directives(&format!("(package={})", package));
    directives.insert(
        namespaces::RESOLUTION_DIRECTIVE.to_string(),
        namespaces::RESOLUTION_OPTIONAL.to_string(),
    );
    module(name, version).add_requirement(
        namespaces::PACKAGE_NAMESPACE,
        directives,
        BTreeMap::new(),
    )
}

/// A module exporting a host capability fragments can attach to
pub fn host(name: &str, version: &str) -> ModuleRevisionBuilder {
    let mut attributes = BTreeMap::new();
    attributes.insert("host".to_string(), AttrValue::from(name));
    attributes.insert(
        namespaces::HOST_VERSION_ATTRIBUTE.to_string(),
        AttrValue::Version(v(version)),
    );
    module(name, version).add_capability(namespaces::HOST_NAMESPACE, BTreeMap::new(), attributes)
}

/// A fragment attaching to `host_name`
pub fn fragment(name: &str, version: &str, host_name: &str) -> ModuleRevisionBuilder {
    module(name, version)
        .types(RevisionTypes::FRAGMENT)
        .add_requirement(
            namespaces::HOST_NAMESPACE,
            filter_directives(&format!("(host={})", host_name)),
            BTreeMap::new(),
        )
}
