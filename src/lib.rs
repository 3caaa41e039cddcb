//! Module container - in-memory database of versioned modules and their wiring
//!
//! This crate provides the module container and resolution subsystem: the
//! authoritative in-memory database of modules, revisions, and wirings, the
//! delta-resolution algorithm that connects each requirement to the capability
//! satisfying it, and the concurrency primitives that keep the database
//! consistent under concurrent install/update/resolve/refresh traffic.
//!
//! ## Architecture
//!
//! - **Container**: orchestrates install/update/uninstall/resolve/refresh,
//!   owning the lock acquisition order and the application of wiring deltas
//! - **Database**: location, name, and wiring indices over installed modules,
//!   with a pluggable persistence/index strategy
//! - **Resolution**: hook filtering, singleton collision resolution, and
//!   delegation to a pluggable constraint resolver
//! - **Locking**: a keyed lock set serializing competing installs per identity,
//!   and an upgradeable read/write lock guarding the database
//!
//! Class loading, manifest parsing, and other consumers of the resolved wiring
//! are outside this crate; they are reached through the pluggable strategy and
//! hook traits in [`container`].
//!
//! ## Design Principles
//!
//! 1. **Snapshot, compute, apply**: resolution runs against a copied snapshot
//!    while holding only a shared read lock; the exclusive lock is taken just
//!    long enough to apply the computed delta
//! 2. **Wholesale substitution**: wire lists are replaced as whole objects,
//!    never edited in place, so readers never observe a torn wiring
//! 3. **Pluggable seams**: the capability index, constraint resolver, and
//!    resolver/collision hooks are trait objects injected at construction

pub mod config;
pub mod container;
pub mod sync;

pub use config::ContainerConfig;

// Re-export commonly used container types
pub use container::{
    AttrValue, CapabilityStore, ConstraintResolver, ContainerError, DisabledReason, InMemoryStore,
    Module, ModuleCapability, ModuleCollisionHook, ModuleContainer, ModuleDatabase,
    ModuleRequirement, ModuleRevision, ModuleRevisionBuilder, ModuleRevisions, ModuleWire,
    ModuleWiring, ResolutionError, ResolutionReport, ResolverHook, ResolverHookFactory,
    RevisionTypes,
};

pub use sync::{LockSet, UpgradeableRwLock};
