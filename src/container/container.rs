//! Module container
//!
//! The orchestrator: install/update/uninstall/resolve/refresh entry points,
//! lock acquisition order, application of resolution deltas to the database,
//! and refresh-closure computation.
//!
//! Lock order: per-identity locks (location, then name) are always acquired
//! before the database lock, and the database lock is never held while
//! waiting on an identity lock. Resolution reads a consistent snapshot under
//! an upgrade-reservation read hold, computes off the exclusive lock, then
//! upgrades to apply the delta.

use std::collections::BTreeSet;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::config::ContainerConfig;
use crate::container::database::{CapabilityStore, InMemoryStore, ModuleDatabase};
use crate::container::error::ContainerError;
use crate::container::hooks::{
    CollisionOperation, DefaultCollisionHook, DefaultResolverHookFactory, ModuleCollisionHook,
    ResolverHookFactory,
};
use crate::container::namespaces;
use crate::container::resolve::{self, ResolutionReport};
use crate::container::resolver::{ConstraintResolver, DefaultResolver};
use crate::container::revision::{Module, ModuleRevision, ModuleRevisionBuilder};
use crate::container::wiring::ModuleWiring;
use crate::sync::{LockSet, UpgradeableRwLock};

/// The module container.
///
/// Owns the module database and serializes all mutation through the
/// upgradeable read/write lock; competing install/update attempts on the same
/// location or name are serialized through per-identity locks with a bounded
/// wait.
pub struct ModuleContainer {
    config: ContainerConfig,
    db: UpgradeableRwLock<ModuleDatabase>,
    locations: LockSet<String>,
    names: LockSet<String>,
    resolver: Box<dyn ConstraintResolver>,
    hook_factory: Box<dyn ResolverHookFactory>,
    collision_hook: Box<dyn ModuleCollisionHook>,
}

impl ModuleContainer {
    /// Create a container with explicit strategies
    pub fn new(
        config: ContainerConfig,
        store: Box<dyn CapabilityStore>,
        resolver: Box<dyn ConstraintResolver>,
        hook_factory: Box<dyn ResolverHookFactory>,
        collision_hook: Box<dyn ModuleCollisionHook>,
    ) -> Self {
        let reentrant = config.reentrant_identity_locks;
        Self {
            config,
            db: UpgradeableRwLock::new(ModuleDatabase::new(store)),
            locations: LockSet::new(reentrant),
            names: LockSet::new(reentrant),
            resolver,
            hook_factory,
            collision_hook,
        }
    }

    /// Create a container with the in-memory store, the default resolver, and
    /// the default hook policies
    pub fn with_defaults(config: ContainerConfig) -> Self {
        Self::new(
            config,
            Box::new(InMemoryStore::new()),
            Box::new(DefaultResolver),
            Box::new(DefaultResolverHookFactory),
            Box::new(DefaultCollisionHook),
        )
    }

    /// Install a module at `location`.
    ///
    /// Idempotent by location: if a module is already installed there and is
    /// visible from `origin`, the existing module is returned unchanged.
    /// Fails if the identity locks cannot be obtained within the configured
    /// timeout, if the origin cannot see an existing install at the location,
    /// or if the collision hook rejects a name+version duplicate.
    pub fn install(
        &self,
        origin: Option<&Arc<Module>>,
        location: &str,
        builder: ModuleRevisionBuilder,
    ) -> Result<Arc<Module>, ContainerError> {
        let timeout = self.config.lock_timeout();
        let _location_guard = self
            .locations
            .try_lock_for(location.to_string(), timeout)
            .ok_or_else(|| ContainerError::LockTimeout(location.to_string()))?;

        let existing = {
            let db = self.db.read();
            db.get_module(location)
        };
        if let Some(existing) = existing {
            return if self.collision_hook.is_visible(origin, &existing) {
                debug!("install at {} returns the existing module", location);
                Ok(existing)
            } else {
                warn!("existing module at {} is not visible from origin", location);
                Err(ContainerError::VisibilityDenied(location.to_string()))
            };
        }

        let name = builder.name().map(str::to_string);
        let _name_guard = match &name {
            Some(name) => Some(
                self.names
                    .try_lock_for(name.clone(), timeout)
                    .ok_or_else(|| ContainerError::LockTimeout(name.clone()))?,
            ),
            None => None,
        };
        if let Some(name) = &name {
            self.check_collisions(
                CollisionOperation::Install,
                origin,
                name,
                &builder,
                None,
            )?;
        }

        let mut db = self.db.write();
        let module = db.install(location, builder)?;
        info!("installed module {} at {}", module.id(), location);
        Ok(module)
    }

    /// Append a new revision to an installed module.
    ///
    /// The identity lock is scoped to the module name only; the location does
    /// not change on update.
    pub fn update(
        &self,
        module: &Arc<Module>,
        builder: ModuleRevisionBuilder,
    ) -> Result<Arc<ModuleRevision>, ContainerError> {
        let timeout = self.config.lock_timeout();
        let name = builder.name().map(str::to_string);
        let _name_guard = match &name {
            Some(name) => Some(
                self.names
                    .try_lock_for(name.clone(), timeout)
                    .ok_or_else(|| ContainerError::LockTimeout(name.clone()))?,
            ),
            None => None,
        };
        if let Some(name) = &name {
            self.check_collisions(
                CollisionOperation::Update,
                Some(module),
                name,
                &builder,
                Some(module),
            )?;
        }

        let mut db = self.db.write();
        let revision = db.update(module, builder)?;
        info!("updated module {} to {}", module.location(), revision);
        Ok(revision)
    }

    /// Uninstall a module. Its wirings survive until refreshed away.
    pub fn uninstall(&self, module: &Arc<Module>) -> Result<(), ContainerError> {
        let mut db = self.db.write();
        db.uninstall(module)?;
        info!("uninstalled module at {}", module.location());
        Ok(())
    }

    /// Resolve the trigger revisions.
    ///
    /// Reads a consistent snapshot under an upgrade-reservation read hold,
    /// computes the wiring delta off the exclusive lock, then upgrades to
    /// apply it atomically. If the database changed while computing, the
    /// attempt is retried against a fresh snapshot.
    ///
    /// On success every trigger the resolver reported as resolvable has a
    /// wiring; already-resolved revisions keep their wiring object identity,
    /// only their provided wires are refreshed.
    pub fn resolve(
        &self,
        triggers: &[Arc<ModuleRevision>],
    ) -> Result<ResolutionReport, ContainerError> {
        loop {
            let guard = self.db.upgradeable_read();
            let timestamp = guard.timestamp()?;
            let snapshot = guard.wirings_copy();
            let unresolved = guard.unresolved();
            let active_triggers: Vec<Arc<ModuleRevision>> = triggers
                .iter()
                .filter(|t| unresolved.contains(*t))
                .cloned()
                .collect();
            let outcome = resolve::run(
                &guard,
                &snapshot,
                unresolved,
                &active_triggers,
                self.resolver.as_ref(),
                self.hook_factory.as_ref(),
            )?;

            let mut write = guard.upgrade();
            if write.timestamp()? != timestamp {
                debug!("database changed during resolution; retrying");
                drop(write);
                continue;
            }
            let resolved: Vec<Arc<ModuleRevision>> = outcome.delta.keys().cloned().collect();
            write.apply_wiring(outcome.delta)?;
            info!("resolved {} revision(s)", resolved.len());
            return Ok(ResolutionReport {
                resolved,
                disabled: outcome.disabled,
            });
        }
    }

    /// Resolve everything currently unresolved
    pub fn resolve_all(&self) -> Result<ResolutionReport, ContainerError> {
        let triggers = {
            let db = self.db.read();
            db.unresolved()
        };
        self.resolve(&triggers)
    }

    /// Remove the wirings of the refresh closure of `initial`.
    ///
    /// The closure covers every revision whose resolution depends, directly
    /// or transitively through provided wires or fragment/host edges, on
    /// something in the initial set. Superseded (non-current) revisions in
    /// the closure are evicted entirely. Returns the closure members that are
    /// still current and can be re-resolved.
    pub fn unresolve(
        &self,
        initial: &[Arc<ModuleRevision>],
    ) -> Result<Vec<Arc<ModuleRevision>>, ContainerError> {
        let guard = self.db.upgradeable_read();
        let closure = Self::refresh_closure(&guard, initial);
        let mut write = guard.upgrade();
        let members: Vec<Arc<ModuleRevision>> = closure.into_iter().collect();
        write.unresolve(&members)?;
        info!("unresolved {} revision(s)", members.len());

        // The affected modules' current revisions are what a refresh
        // re-resolves; superseded members were just evicted
        let mut survivors: Vec<Arc<ModuleRevision>> = Vec::new();
        for revision in &members {
            let Some(owner) = revision.try_revisions() else {
                continue;
            };
            if owner.is_uninstalled() {
                continue;
            }
            if let Some(current) = owner.current() {
                if !survivors.contains(&current) {
                    survivors.push(current);
                }
            }
        }
        Ok(survivors)
    }

    /// Refresh: unresolve the closure of `initial`, then re-resolve its
    /// still-current members
    pub fn refresh(
        &self,
        initial: &[Arc<ModuleRevision>],
    ) -> Result<ResolutionReport, ContainerError> {
        let survivors = self.unresolve(initial)?;
        self.resolve(&survivors)
    }

    /// The wiring attached to a revision, if it is resolved
    pub fn get_wiring(&self, revision: &Arc<ModuleRevision>) -> Option<Arc<ModuleWiring>> {
        self.db.read().get_wiring(revision)
    }

    /// The module installed at `location`, if any
    pub fn get_module(&self, location: &str) -> Option<Arc<Module>> {
        self.db.read().get_module(location)
    }

    /// All installed modules
    pub fn modules(&self) -> Vec<Arc<Module>> {
        self.db.read().modules()
    }

    /// Depth-first reachability over the provided-wires graph (dependents),
    /// also walking fragment-to-host edges
    fn refresh_closure(
        db: &ModuleDatabase,
        initial: &[Arc<ModuleRevision>],
    ) -> BTreeSet<Arc<ModuleRevision>> {
        let mut closure = BTreeSet::new();
        let mut stack: Vec<Arc<ModuleRevision>> = initial.to_vec();
        while let Some(revision) = stack.pop() {
            if !closure.insert(Arc::clone(&revision)) {
                continue;
            }
            if let Some(wiring) = db.get_wiring(&revision) {
                for wire in wiring.provided_wires(None) {
                    stack.push(Arc::clone(wire.requirer()));
                }
                if revision.is_fragment() {
                    for wire in wiring.required_wires(Some(namespaces::HOST_NAMESPACE)) {
                        stack.push(Arc::clone(wire.provider()));
                    }
                }
            }
        }
        closure
    }

    fn check_collisions(
        &self,
        operation: CollisionOperation,
        origin: Option<&Arc<Module>>,
        name: &str,
        builder: &ModuleRevisionBuilder,
        exclude: Option<&Arc<Module>>,
    ) -> Result<(), ContainerError> {
        let version = builder.effective_version();
        let candidates: Vec<Arc<Module>> = {
            let db = self.db.read();
            let mut modules: Vec<Arc<Module>> = Vec::new();
            for revision in db.get_revisions(name, Some(&version)) {
                let module = revision.module();
                if exclude.map_or(false, |m| m.id() == module.id()) {
                    continue;
                }
                if !modules.iter().any(|m| m.id() == module.id()) {
                    modules.push(module);
                }
            }
            modules
        };
        if candidates.is_empty() {
            return Ok(());
        }
        let collisions = self
            .collision_hook
            .filter_collisions(operation, origin, &candidates);
        if let Some(existing) = collisions.first() {
            warn!(
                "{} of {} {} rejected: collides with module at {}",
                operation,
                name,
                version,
                existing.location()
            );
            return Err(ContainerError::Collision {
                operation,
                existing: existing.location().to_string(),
            });
        }
        Ok(())
    }
}

impl std::fmt::Debug for ModuleContainer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleContainer")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
