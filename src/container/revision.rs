//! Module data model
//!
//! A [`Module`] is the mutable identity of one installed unit. It owns exactly
//! one [`ModuleRevisions`] history of immutable [`ModuleRevision`] snapshots,
//! newest first. Revisions carry declared capabilities and requirements;
//! everything below the module level is immutable once built.

use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use bitflags::bitflags;
use parking_lot::Mutex;
use semver::Version;
use serde::{Deserialize, Serialize};

use crate::container::namespaces;

bitflags! {
    /// Revision type bitmask
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct RevisionTypes: u32 {
        /// The revision is a fragment that attaches to a host
        const FRAGMENT = 0b0001;
    }
}

/// Typed attribute value on a capability or requirement
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttrValue {
    String(String),
    Version(Version),
    Long(i64),
    Double(f64),
    List(Vec<AttrValue>),
}

impl AttrValue {
    /// The value as a version, if it is one or parses as one
    pub fn as_version(&self) -> Option<Version> {
        match self {
            AttrValue::Version(v) => Some(v.clone()),
            AttrValue::String(s) => Version::parse(s).ok(),
            _ => None,
        }
    }
}

impl fmt::Display for AttrValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttrValue::String(s) => write!(f, "{}", s),
            AttrValue::Version(v) => write!(f, "{}", v),
            AttrValue::Long(n) => write!(f, "{}", n),
            AttrValue::Double(d) => write!(f, "{}", d),
            AttrValue::List(items) => {
                let rendered: Vec<String> = items.iter().map(|i| i.to_string()).collect();
                write!(f, "{}", rendered.join(","))
            }
        }
    }
}

impl From<&str> for AttrValue {
    fn from(value: &str) -> Self {
        AttrValue::String(value.to_string())
    }
}

impl From<String> for AttrValue {
    fn from(value: String) -> Self {
        AttrValue::String(value)
    }
}

impl From<Version> for AttrValue {
    fn from(value: Version) -> Self {
        AttrValue::Version(value)
    }
}

impl From<i64> for AttrValue {
    fn from(value: i64) -> Self {
        AttrValue::Long(value)
    }
}

/// Directive map: semantics attached to a capability or requirement
pub type Directives = BTreeMap<String, String>;

/// Attribute map: typed values attached to a capability or requirement
pub type Attributes = BTreeMap<String, AttrValue>;

/// A named, attributed thing a revision offers
pub struct ModuleCapability {
    namespace: String,
    directives: Directives,
    attributes: Attributes,
    revision: Weak<ModuleRevision>,
}

impl ModuleCapability {
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn directives(&self) -> &Directives {
        &self.directives
    }

    pub fn attributes(&self) -> &Attributes {
        &self.attributes
    }

    /// The revision declaring this capability
    pub fn revision(&self) -> Arc<ModuleRevision> {
        self.revision
            .upgrade()
            .expect("capability outlives its revision")
    }

    /// The capability's version under its namespace's version attribute
    pub fn version(&self) -> Option<Version> {
        self.attributes
            .get(namespaces::version_attribute(&self.namespace))
            .and_then(AttrValue::as_version)
    }
}

impl fmt::Debug for ModuleCapability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ModuleCapability[{}]{:?}", self.namespace, self.attributes)
    }
}

/// A named, filtered thing a revision needs
pub struct ModuleRequirement {
    namespace: String,
    directives: Directives,
    attributes: Attributes,
    revision: Weak<ModuleRevision>,
}

impl ModuleRequirement {
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn directives(&self) -> &Directives {
        &self.directives
    }

    pub fn attributes(&self) -> &Attributes {
        &self.attributes
    }

    /// The revision declaring this requirement
    pub fn revision(&self) -> Arc<ModuleRevision> {
        self.revision
            .upgrade()
            .expect("requirement outlives its revision")
    }

    /// The filter expression constraining candidate capabilities, if any
    pub fn filter(&self) -> Option<&str> {
        self.directives
            .get(namespaces::FILTER_DIRECTIVE)
            .map(String::as_str)
    }

    /// Whether an unsatisfied requirement fails resolution
    pub fn is_optional(&self) -> bool {
        self.directives
            .get(namespaces::RESOLUTION_DIRECTIVE)
            .map(|v| v == namespaces::RESOLUTION_OPTIONAL)
            .unwrap_or(false)
    }
}

impl fmt::Debug for ModuleRequirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.filter() {
            Some(filter) => write!(f, "ModuleRequirement[{}]{}", self.namespace, filter),
            None => write!(f, "ModuleRequirement[{}]", self.namespace),
        }
    }
}

/// One immutable version snapshot of a module.
///
/// A revision is "current" iff it is the head of its owning revisions list
/// and that list is not uninstalled.
pub struct ModuleRevision {
    name: Option<String>,
    version: Version,
    types: RevisionTypes,
    capabilities: Vec<Arc<ModuleCapability>>,
    requirements: Vec<Arc<ModuleRequirement>>,
    revisions: Weak<ModuleRevisions>,
    /// Monotonic, never reused; assigned at install/update time and used for
    /// stable candidate tie-breaking and as the wiring map key
    serial: u64,
}

impl ModuleRevision {
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn version(&self) -> &Version {
        &self.version
    }

    pub fn types(&self) -> RevisionTypes {
        self.types
    }

    pub fn is_fragment(&self) -> bool {
        self.types.contains(RevisionTypes::FRAGMENT)
    }

    /// Declared capabilities, optionally restricted to one namespace
    pub fn capabilities(&self, namespace: Option<&str>) -> Vec<Arc<ModuleCapability>> {
        self.capabilities
            .iter()
            .filter(|c| namespace.map_or(true, |ns| c.namespace() == ns))
            .cloned()
            .collect()
    }

    /// Declared requirements, optionally restricted to one namespace
    pub fn requirements(&self, namespace: Option<&str>) -> Vec<Arc<ModuleRequirement>> {
        self.requirements
            .iter()
            .filter(|r| namespace.map_or(true, |ns| r.namespace() == ns))
            .cloned()
            .collect()
    }

    /// The owning revisions history
    pub fn revisions(&self) -> Arc<ModuleRevisions> {
        self.revisions
            .upgrade()
            .expect("revision outlives its module")
    }

    /// The owning revisions history, or `None` once the module itself has
    /// been dropped (possible for evicted revisions kept alive by old wires)
    pub(crate) fn try_revisions(&self) -> Option<Arc<ModuleRevisions>> {
        self.revisions.upgrade()
    }

    /// The owning module
    pub fn module(&self) -> Arc<Module> {
        self.revisions().module()
    }

    /// Whether this revision is the current head of a live module
    pub fn is_current(self: &Arc<Self>) -> bool {
        match self.revisions.upgrade() {
            Some(owner) => owner
                .current()
                .map_or(false, |head| head.serial == self.serial),
            None => false,
        }
    }

    /// Whether the identity capability declares the singleton directive
    pub fn is_singleton(&self) -> bool {
        self.capabilities
            .iter()
            .filter(|c| c.namespace() == namespaces::IDENTITY_NAMESPACE)
            .any(|c| {
                c.directives()
                    .get(namespaces::SINGLETON_DIRECTIVE)
                    .map(|v| v == "true")
                    .unwrap_or(false)
            })
    }

    pub(crate) fn serial(&self) -> u64 {
        self.serial
    }
}

impl fmt::Display for ModuleRevision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.name {
            Some(name) => write!(f, "{} {}", name, self.version),
            None => write!(f, "(anonymous) {}", self.version),
        }
    }
}

impl fmt::Debug for ModuleRevision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ModuleRevision[{} #{}]", self, self.serial)
    }
}

impl PartialEq for ModuleRevision {
    fn eq(&self, other: &Self) -> bool {
        self.serial == other.serial
    }
}

impl Eq for ModuleRevision {}

impl PartialOrd for ModuleRevision {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ModuleRevision {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.serial.cmp(&other.serial)
    }
}

impl Hash for ModuleRevision {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.serial.hash(state);
    }
}

/// Per-module ordered history of revision snapshots, newest first.
///
/// Mutation is append-at-head, guarded by an internal monitor distinct from
/// the global container lock; many readers walk this list.
pub struct ModuleRevisions {
    module: Weak<Module>,
    location: String,
    id: u64,
    revisions: Mutex<Vec<Arc<ModuleRevision>>>,
    /// Terminal flag, set once and never cleared
    uninstalled: AtomicBool,
}

impl ModuleRevisions {
    fn new(module: Weak<Module>, location: String, id: u64) -> Self {
        Self {
            module,
            location,
            id,
            revisions: Mutex::new(Vec::new()),
            uninstalled: AtomicBool::new(false),
        }
    }

    /// The owning module
    pub fn module(&self) -> Arc<Module> {
        self.module.upgrade().expect("revisions outlive their module")
    }

    /// The unique install location
    pub fn location(&self) -> &str {
        &self.location
    }

    /// The monotonically assigned module id
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The current (head) revision, or `None` once uninstalled
    pub fn current(&self) -> Option<Arc<ModuleRevision>> {
        if self.is_uninstalled() {
            return None;
        }
        self.revisions.lock().first().cloned()
    }

    /// Snapshot of the full history, newest first
    pub fn revisions(&self) -> Vec<Arc<ModuleRevision>> {
        self.revisions.lock().clone()
    }

    pub fn is_uninstalled(&self) -> bool {
        self.uninstalled.load(Ordering::Acquire)
    }

    pub(crate) fn add_revision(&self, revision: Arc<ModuleRevision>) {
        self.revisions.lock().insert(0, revision);
    }

    pub(crate) fn remove_revision(&self, revision: &Arc<ModuleRevision>) {
        self.revisions.lock().retain(|r| r != revision);
    }

    pub(crate) fn mark_uninstalled(&self) {
        self.uninstalled.store(true, Ordering::Release);
    }
}

impl fmt::Debug for ModuleRevisions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleRevisions")
            .field("location", &self.location)
            .field("id", &self.id)
            .field("uninstalled", &self.is_uninstalled())
            .finish()
    }
}

/// The mutable identity of one installed unit
pub struct Module {
    revisions: Arc<ModuleRevisions>,
}

impl Module {
    pub(crate) fn new(location: &str, id: u64) -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<Module>| Module {
            revisions: Arc::new(ModuleRevisions::new(
                weak.clone(),
                location.to_string(),
                id,
            )),
        })
    }

    /// The revision history owned by this module
    pub fn revisions(&self) -> &Arc<ModuleRevisions> {
        &self.revisions
    }

    /// The current revision, or `None` once uninstalled
    pub fn current_revision(&self) -> Option<Arc<ModuleRevision>> {
        self.revisions.current()
    }

    pub fn location(&self) -> &str {
        self.revisions.location()
    }

    pub fn id(&self) -> u64 {
        self.revisions.id()
    }
}

impl fmt::Debug for Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Module[{} #{}]", self.location(), self.id())
    }
}

impl PartialEq for Module {
    fn eq(&self, other: &Self) -> bool {
        self.id() == other.id()
    }
}

impl Eq for Module {}

impl Hash for Module {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id().hash(state);
    }
}

#[derive(Debug, Clone)]
struct DeclaredItem {
    namespace: String,
    directives: Directives,
    attributes: Attributes,
}

/// Builder for one immutable revision snapshot.
///
/// Passed to install/update; the database turns it into the new head revision
/// of a module's history.
#[derive(Debug, Clone, Default)]
pub struct ModuleRevisionBuilder {
    name: Option<String>,
    version: Option<Version>,
    types: RevisionTypes,
    singleton: bool,
    capabilities: Vec<DeclaredItem>,
    requirements: Vec<DeclaredItem>,
}

impl ModuleRevisionBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Symbolic name of the revision. Nameless revisions are permitted.
    pub fn symbolic_name(mut self, name: &str) -> Self {
        self.name = Some(name.to_string());
        self
    }

    pub fn version(mut self, version: Version) -> Self {
        self.version = Some(version);
        self
    }

    pub fn types(mut self, types: RevisionTypes) -> Self {
        self.types = types;
        self
    }

    /// Declare the identity capability singleton: at most one resolved
    /// revision with this name may exist at a time
    pub fn singleton(mut self, singleton: bool) -> Self {
        self.singleton = singleton;
        self
    }

    pub fn add_capability(
        mut self,
        namespace: &str,
        directives: Directives,
        attributes: Attributes,
    ) -> Self {
        self.capabilities.push(DeclaredItem {
            namespace: namespace.to_string(),
            directives,
            attributes,
        });
        self
    }

    pub fn add_requirement(
        mut self,
        namespace: &str,
        directives: Directives,
        attributes: Attributes,
    ) -> Self {
        self.requirements.push(DeclaredItem {
            namespace: namespace.to_string(),
            directives,
            attributes,
        });
        self
    }

    pub(crate) fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub(crate) fn effective_version(&self) -> Version {
        self.version.clone().unwrap_or_else(|| Version::new(0, 0, 0))
    }

    /// Build the immutable revision.
    ///
    /// Synthesizes the identity capability from the symbolic name and version
    /// unless one was declared explicitly.
    pub(crate) fn build(self, owner: Weak<ModuleRevisions>, serial: u64) -> Arc<ModuleRevision> {
        let version = self.effective_version();
        let mut capabilities = self.capabilities;
        let declares_identity = capabilities
            .iter()
            .any(|c| c.namespace == namespaces::IDENTITY_NAMESPACE);
        if let Some(name) = &self.name {
            if !declares_identity {
                let mut directives = Directives::new();
                if self.singleton {
                    directives.insert(
                        namespaces::SINGLETON_DIRECTIVE.to_string(),
                        "true".to_string(),
                    );
                }
                let mut attributes = Attributes::new();
                attributes.insert(
                    namespaces::IDENTITY_NAME_ATTRIBUTE.to_string(),
                    AttrValue::String(name.clone()),
                );
                attributes.insert(
                    namespaces::IDENTITY_VERSION_ATTRIBUTE.to_string(),
                    AttrValue::Version(version.clone()),
                );
                capabilities.insert(
                    0,
                    DeclaredItem {
                        namespace: namespaces::IDENTITY_NAMESPACE.to_string(),
                        directives,
                        attributes,
                    },
                );
            }
        }
        let requirements = self.requirements;
        let name = self.name;
        let types = self.types;
        Arc::new_cyclic(|weak: &Weak<ModuleRevision>| ModuleRevision {
            name,
            version,
            types,
            capabilities: capabilities
                .into_iter()
                .map(|item| {
                    Arc::new(ModuleCapability {
                        namespace: item.namespace,
                        directives: item.directives,
                        attributes: item.attributes,
                        revision: weak.clone(),
                    })
                })
                .collect(),
            requirements: requirements
                .into_iter()
                .map(|item| {
                    Arc::new(ModuleRequirement {
                        namespace: item.namespace,
                        directives: item.directives,
                        attributes: item.attributes,
                        revision: weak.clone(),
                    })
                })
                .collect(),
            revisions: owner,
            serial,
        })
    }
}
