//! Module database
//!
//! The authoritative store: location to module, name to revisions, revision
//! to wiring, plus capability-namespace indexing delegated to a pluggable
//! [`CapabilityStore`].
//!
//! All operations here are pure data operations assumed to run under a
//! caller-held lock; this component performs no locking of its own. The
//! container drives it under the upgradeable read/write lock.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use semver::Version;
use tracing::debug;

use crate::container::error::ContainerError;
use crate::container::filter::Filter;
use crate::container::revision::{
    Module, ModuleCapability, ModuleRequirement, ModuleRevision, ModuleRevisionBuilder,
};
use crate::container::wiring::{ModuleWire, ModuleWiring};

/// Pluggable persistence and capability-index strategy.
///
/// Supplies module id and timestamp generation and maintains the capability
/// index consulted during resolution. Implementations may be purely in-memory
/// or backed by persistent storage; operations are fallible so a persistent
/// backend can surface its failures.
pub trait CapabilityStore: Send + Sync {
    /// Next module id; monotonically increasing, never reused
    fn next_module_id(&mut self) -> Result<u64>;

    /// Current database timestamp
    fn timestamp(&self) -> Result<u64>;

    /// Bump the database timestamp, returning the new value
    fn increment_timestamp(&mut self) -> Result<u64>;

    /// Index the capabilities declared by a revision
    fn add_capabilities(&mut self, revision: &Arc<ModuleRevision>) -> Result<()>;

    /// Remove a revision's capabilities from the index
    fn remove_capabilities(&mut self, revision: &Arc<ModuleRevision>) -> Result<()>;

    /// Candidate capabilities for a requirement. The caller may reorder and
    /// filter the returned list.
    fn find_capabilities(
        &self,
        requirement: &ModuleRequirement,
    ) -> Result<Vec<Arc<ModuleCapability>>>;
}

/// Default in-memory store: a namespace-keyed capability index with filter
/// matching, and plain counters for ids and timestamps
#[derive(Default)]
pub struct InMemoryStore {
    next_id: u64,
    timestamp: u64,
    index: HashMap<String, Vec<Arc<ModuleCapability>>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CapabilityStore for InMemoryStore {
    fn next_module_id(&mut self) -> Result<u64> {
        self.next_id += 1;
        Ok(self.next_id)
    }

    fn timestamp(&self) -> Result<u64> {
        Ok(self.timestamp)
    }

    fn increment_timestamp(&mut self) -> Result<u64> {
        self.timestamp += 1;
        Ok(self.timestamp)
    }

    fn add_capabilities(&mut self, revision: &Arc<ModuleRevision>) -> Result<()> {
        for capability in revision.capabilities(None) {
            self.index
                .entry(capability.namespace().to_string())
                .or_default()
                .push(capability);
        }
        Ok(())
    }

    fn remove_capabilities(&mut self, revision: &Arc<ModuleRevision>) -> Result<()> {
        for capabilities in self.index.values_mut() {
            capabilities.retain(|c| c.revision().as_ref() != revision.as_ref());
        }
        Ok(())
    }

    fn find_capabilities(
        &self,
        requirement: &ModuleRequirement,
    ) -> Result<Vec<Arc<ModuleCapability>>> {
        let candidates = match self.index.get(requirement.namespace()) {
            Some(candidates) => candidates,
            None => return Ok(Vec::new()),
        };
        let filter = match requirement.filter() {
            Some(expression) => Some(Filter::parse(expression)?),
            None => None,
        };
        Ok(candidates
            .iter()
            .filter(|c| {
                filter
                    .as_ref()
                    .map_or(true, |f| f.matches(c.attributes()))
            })
            .cloned()
            .collect())
    }
}

/// The authoritative in-memory module database.
///
/// Invariant: every revision reachable from a live (non-uninstalled) module
/// is present in at most one wiring entry; absence means unresolved.
pub struct ModuleDatabase {
    modules_by_location: HashMap<String, Arc<Module>>,
    revisions_by_name: HashMap<String, Vec<Arc<ModuleRevision>>>,
    wirings: HashMap<Arc<ModuleRevision>, Arc<ModuleWiring>>,
    store: Box<dyn CapabilityStore>,
    next_serial: u64,
}

impl ModuleDatabase {
    pub fn new(store: Box<dyn CapabilityStore>) -> Self {
        Self {
            modules_by_location: HashMap::new(),
            revisions_by_name: HashMap::new(),
            wirings: HashMap::new(),
            store,
            next_serial: 0,
        }
    }

    /// Install a new module at `location`, building its first revision
    pub fn install(
        &mut self,
        location: &str,
        builder: ModuleRevisionBuilder,
    ) -> Result<Arc<Module>, ContainerError> {
        if self.modules_by_location.contains_key(location) {
            return Err(ContainerError::LocationInUse(location.to_string()));
        }
        let id = self.store.next_module_id()?;
        let module = Module::new(location, id);
        let revision = self.add_revision(&module, builder)?;
        self.modules_by_location
            .insert(location.to_string(), Arc::clone(&module));
        self.store.increment_timestamp()?;
        debug!("installed {:?} as {:?}", revision, module);
        Ok(module)
    }

    /// Append a new head revision to an installed module.
    ///
    /// The previous revision stays in the name index and remains reachable
    /// through existing wires until refreshed away, but its capabilities are
    /// withdrawn from the index so new resolutions wire to the new head.
    pub fn update(
        &mut self,
        module: &Arc<Module>,
        builder: ModuleRevisionBuilder,
    ) -> Result<Arc<ModuleRevision>, ContainerError> {
        if module.revisions().is_uninstalled() {
            return Err(ContainerError::AlreadyUninstalled(
                module.location().to_string(),
            ));
        }
        let previous = module.current_revision();
        let revision = self.add_revision(module, builder)?;
        if let Some(previous) = previous {
            self.store.remove_capabilities(&previous)?;
        }
        self.store.increment_timestamp()?;
        debug!("updated {:?} to {:?}", module, revision);
        Ok(revision)
    }

    /// Remove a module: drop its indices, withdraw its capabilities, and mark
    /// its history uninstalled. Existing wirings survive until refreshed.
    pub fn uninstall(&mut self, module: &Arc<Module>) -> Result<(), ContainerError> {
        if module.revisions().is_uninstalled() {
            return Err(ContainerError::AlreadyUninstalled(
                module.location().to_string(),
            ));
        }
        self.modules_by_location.remove(module.location());
        for revision in module.revisions().revisions() {
            self.store.remove_capabilities(&revision)?;
            self.remove_from_name_index(&revision);
        }
        module.revisions().mark_uninstalled();
        self.store.increment_timestamp()?;
        debug!("uninstalled {:?}", module);
        Ok(())
    }

    /// The module installed at `location`, if any
    pub fn get_module(&self, location: &str) -> Option<Arc<Module>> {
        self.modules_by_location.get(location).cloned()
    }

    /// All installed modules
    pub fn modules(&self) -> Vec<Arc<Module>> {
        self.modules_by_location.values().cloned().collect()
    }

    /// Revisions under `name`; exact-version lookup when `version` is given
    pub fn get_revisions(
        &self,
        name: &str,
        version: Option<&Version>,
    ) -> Vec<Arc<ModuleRevision>> {
        self.revisions_by_name
            .get(name)
            .map(|revisions| {
                revisions
                    .iter()
                    .filter(|r| version.map_or(true, |v| r.version() == v))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// The wiring attached to a revision, if it is resolved
    pub fn get_wiring(&self, revision: &Arc<ModuleRevision>) -> Option<Arc<ModuleWiring>> {
        self.wirings.get(revision).cloned()
    }

    /// Defensive full copy of the wiring map, for lock-free reads during
    /// resolution
    pub fn wirings_copy(&self) -> HashMap<Arc<ModuleRevision>, Arc<ModuleWiring>> {
        self.wirings.clone()
    }

    /// Current revisions of live modules that have no wiring
    pub fn unresolved(&self) -> Vec<Arc<ModuleRevision>> {
        let mut revisions: Vec<Arc<ModuleRevision>> = self
            .modules_by_location
            .values()
            .filter_map(|m| m.current_revision())
            .filter(|r| !self.wirings.contains_key(r))
            .collect();
        revisions.sort();
        revisions
    }

    /// Apply a resolution delta: `delta` maps each newly resolved revision to
    /// its required wires.
    ///
    /// Newly resolved revisions get entirely new wiring objects. Revisions
    /// that already had a wiring only have their provided wires refreshed, so
    /// existing references to those wiring objects remain valid.
    pub fn apply_wiring(
        &mut self,
        delta: std::collections::BTreeMap<Arc<ModuleRevision>, Vec<Arc<ModuleWire>>>,
    ) -> Result<(), ContainerError> {
        if delta.is_empty() {
            return Ok(());
        }
        let mut provided: HashMap<Arc<ModuleRevision>, Vec<Arc<ModuleWire>>> = HashMap::new();
        for wires in delta.values() {
            for wire in wires {
                provided
                    .entry(Arc::clone(wire.provider()))
                    .or_default()
                    .push(Arc::clone(wire));
            }
        }

        // Refresh the provided side of already-resolved providers in place
        for (provider, new_wires) in &provided {
            if delta.contains_key(provider) {
                continue;
            }
            if let Some(wiring) = self.wirings.get(provider) {
                let mut all = wiring.provided_wires(None);
                all.extend(new_wires.iter().cloned());
                wiring.set_provided(all);
            }
        }

        // New wiring objects for newly resolved revisions
        for (revision, required) in delta {
            let provided_wires = provided.remove(&revision).unwrap_or_default();
            let wiring = ModuleWiring::new(
                Arc::clone(&revision),
                revision.capabilities(None),
                revision.requirements(None),
                provided_wires,
                required,
            );
            self.wirings.insert(revision, wiring);
        }
        self.store.increment_timestamp()?;
        Ok(())
    }

    /// Remove and invalidate the wirings of `revisions`, evicting superseded
    /// (non-current) revisions entirely.
    ///
    /// Surviving wirings that provided to a removed requirer have those wires
    /// scrubbed from their provided side (wholesale replacement, object
    /// identity preserved); re-resolution adds fresh wires instead of
    /// duplicating stale ones.
    pub fn unresolve(
        &mut self,
        revisions: &[Arc<ModuleRevision>],
    ) -> Result<(), ContainerError> {
        for revision in revisions {
            if let Some(wiring) = self.wirings.remove(revision) {
                wiring.invalidate();
            }
            if !revision.is_current() {
                self.store.remove_capabilities(revision)?;
                self.remove_from_name_index(revision);
                if let Some(owner) = revision.try_revisions() {
                    owner.remove_revision(revision);
                }
                debug!("evicted superseded {:?}", revision);
            }
        }
        for wiring in self.wirings.values() {
            let provided = wiring.provided_wires(None);
            let surviving: Vec<Arc<ModuleWire>> = provided
                .iter()
                .filter(|w| !revisions.contains(w.requirer()))
                .cloned()
                .collect();
            if surviving.len() != provided.len() {
                wiring.set_provided(surviving);
            }
        }
        self.store.increment_timestamp()?;
        Ok(())
    }

    /// Candidate capabilities for a requirement, from the pluggable index
    pub fn find_capabilities(
        &self,
        requirement: &ModuleRequirement,
    ) -> Result<Vec<Arc<ModuleCapability>>, ContainerError> {
        Ok(self.store.find_capabilities(requirement)?)
    }

    /// Current database timestamp; bumped on every mutation
    pub fn timestamp(&self) -> Result<u64, ContainerError> {
        Ok(self.store.timestamp()?)
    }

    fn add_revision(
        &mut self,
        module: &Arc<Module>,
        builder: ModuleRevisionBuilder,
    ) -> Result<Arc<ModuleRevision>, ContainerError> {
        self.next_serial += 1;
        let revision = builder.build(Arc::downgrade(module.revisions()), self.next_serial);
        module.revisions().add_revision(Arc::clone(&revision));
        if let Some(name) = revision.name() {
            self.revisions_by_name
                .entry(name.to_string())
                .or_default()
                .push(Arc::clone(&revision));
        }
        self.store.add_capabilities(&revision)?;
        Ok(revision)
    }

    fn remove_from_name_index(&mut self, revision: &Arc<ModuleRevision>) {
        if let Some(name) = revision.name() {
            if let Some(revisions) = self.revisions_by_name.get_mut(name) {
                revisions.retain(|r| r != revision);
                if revisions.is_empty() {
                    self.revisions_by_name.remove(name);
                }
            }
        }
    }
}

impl std::fmt::Debug for ModuleDatabase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleDatabase")
            .field("modules", &self.modules_by_location.len())
            .field("wirings", &self.wirings.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::namespaces;
    use crate::container::revision::{AttrValue, Attributes, Directives};

    fn database() -> ModuleDatabase {
        ModuleDatabase::new(Box::new(InMemoryStore::new()))
    }

    fn simple_builder(name: &str, version: &str) -> ModuleRevisionBuilder {
        ModuleRevisionBuilder::new()
            .symbolic_name(name)
            .version(Version::parse(version).unwrap())
    }

    #[test]
    fn test_install_indexes_by_location_and_name() {
        let mut db = database();
        let module = db.install("mem:a", simple_builder("pkg", "1.0.0")).unwrap();
        assert_eq!(db.get_module("mem:a").unwrap().id(), module.id());
        assert_eq!(db.get_revisions("pkg", None).len(), 1);
        let exact = db.get_revisions("pkg", Some(&Version::new(1, 0, 0)));
        assert_eq!(exact.len(), 1);
        assert!(db
            .get_revisions("pkg", Some(&Version::new(2, 0, 0)))
            .is_empty());
    }

    #[test]
    fn test_install_duplicate_location_rejected() {
        let mut db = database();
        db.install("mem:a", simple_builder("pkg", "1.0.0")).unwrap();
        let err = db
            .install("mem:a", simple_builder("other", "1.0.0"))
            .unwrap_err();
        assert!(matches!(err, ContainerError::LocationInUse(_)));
    }

    #[test]
    fn test_update_appends_head_and_keeps_old_queryable() {
        let mut db = database();
        let module = db.install("mem:a", simple_builder("pkg", "1.0.0")).unwrap();
        let old = module.current_revision().unwrap();
        let new = db.update(&module, simple_builder("pkg", "2.0.0")).unwrap();
        assert!(new.is_current());
        assert!(!old.is_current());
        // Both revisions stay queryable by name until refreshed away
        assert_eq!(db.get_revisions("pkg", None).len(), 2);
        assert_eq!(module.revisions().revisions().len(), 2);
    }

    #[test]
    fn test_update_withdraws_old_capabilities() {
        let mut db = database();
        let mut attributes = Attributes::new();
        attributes.insert("package".to_string(), AttrValue::from("util"));
        let module = db
            .install(
                "mem:a",
                simple_builder("pkg", "1.0.0").add_capability(
                    namespaces::PACKAGE_NAMESPACE,
                    Directives::new(),
                    attributes.clone(),
                ),
            )
            .unwrap();
        db.update(&module, simple_builder("pkg", "2.0.0")).unwrap();

        // Build a probe requirement against the package namespace
        let mut probe_db = database();
        let probe = probe_db
            .install(
                "mem:probe",
                simple_builder("probe", "1.0.0").add_requirement(
                    namespaces::PACKAGE_NAMESPACE,
                    Directives::new(),
                    Attributes::new(),
                ),
            )
            .unwrap();
        let requirements = probe.current_revision().unwrap().requirements(None);
        // The 1.0.0 capability was withdrawn on update; 2.0.0 declares none
        assert!(db.find_capabilities(&requirements[0]).unwrap().is_empty());
    }

    #[test]
    fn test_uninstall_is_terminal() {
        let mut db = database();
        let module = db.install("mem:a", simple_builder("pkg", "1.0.0")).unwrap();
        db.uninstall(&module).unwrap();
        assert!(db.get_module("mem:a").is_none());
        assert!(db.get_revisions("pkg", None).is_empty());
        assert!(module.revisions().is_uninstalled());
        let err = db.uninstall(&module).unwrap_err();
        assert!(matches!(err, ContainerError::AlreadyUninstalled(_)));
    }

    #[test]
    fn test_timestamp_bumps_on_mutation() {
        let mut db = database();
        let t0 = db.timestamp().unwrap();
        let module = db.install("mem:a", simple_builder("pkg", "1.0.0")).unwrap();
        let t1 = db.timestamp().unwrap();
        assert!(t1 > t0);
        db.uninstall(&module).unwrap();
        assert!(db.timestamp().unwrap() > t1);
    }

    #[test]
    fn test_unresolved_lists_current_unwired_revisions() {
        let mut db = database();
        db.install("mem:a", simple_builder("a", "1.0.0")).unwrap();
        db.install("mem:b", simple_builder("b", "1.0.0")).unwrap();
        assert_eq!(db.unresolved().len(), 2);
    }
}
