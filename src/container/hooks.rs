//! Resolver and collision hooks
//!
//! Pluggable policy seams injected at container construction. Hooks return
//! new collections rather than mutating caller-supplied ones; anything a hook
//! drops from its input is excluded from the operation at hand.

use std::fmt;
use std::sync::Arc;

use crate::container::revision::{Module, ModuleRevision};

/// Operation a collision check applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollisionOperation {
    Install,
    Update,
}

impl fmt::Display for CollisionOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CollisionOperation::Install => write!(f, "install"),
            CollisionOperation::Update => write!(f, "update"),
        }
    }
}

/// One resolver-hook session, scoped to a trigger set
pub trait ResolverHook {
    /// Which of the unresolved candidates may take part in this resolution
    /// attempt. Candidates absent from the returned set become disabled for
    /// the attempt.
    fn filter_resolvable(&mut self, candidates: &[Arc<ModuleRevision>]) -> Vec<Arc<ModuleRevision>>;

    /// Which of `candidates` collide with `singleton`. Candidates absent from
    /// the returned set are treated as non-colliding.
    fn filter_singleton_collisions(
        &mut self,
        singleton: &Arc<ModuleRevision>,
        candidates: &[Arc<ModuleRevision>],
    ) -> Vec<Arc<ModuleRevision>>;

    /// Session end; called exactly once, also on failure
    fn end(&mut self);
}

/// Factory opening one hook session per resolution attempt
pub trait ResolverHookFactory: Send + Sync {
    fn begin(&self, triggers: &[Arc<ModuleRevision>]) -> Box<dyn ResolverHook>;
}

/// Default hook: nothing is disabled, all same-name singletons collide
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultResolverHookFactory;

struct DefaultResolverHook;

impl ResolverHook for DefaultResolverHook {
    fn filter_resolvable(&mut self, candidates: &[Arc<ModuleRevision>]) -> Vec<Arc<ModuleRevision>> {
        candidates.to_vec()
    }

    fn filter_singleton_collisions(
        &mut self,
        _singleton: &Arc<ModuleRevision>,
        candidates: &[Arc<ModuleRevision>],
    ) -> Vec<Arc<ModuleRevision>> {
        candidates.to_vec()
    }

    fn end(&mut self) {}
}

impl ResolverHookFactory for DefaultResolverHookFactory {
    fn begin(&self, _triggers: &[Arc<ModuleRevision>]) -> Box<dyn ResolverHook> {
        Box::new(DefaultResolverHook)
    }
}

/// Collision policy for install and update
pub trait ModuleCollisionHook: Send + Sync {
    /// Filter name+version collisions from the perspective of the requesting
    /// module. Modules surviving in the returned set still collide; an empty
    /// return permits the operation.
    fn filter_collisions(
        &self,
        operation: CollisionOperation,
        origin: Option<&Arc<Module>>,
        candidates: &[Arc<Module>],
    ) -> Vec<Arc<Module>>;

    /// Whether an already-installed module is visible from `origin`. Governs
    /// idempotent install at an existing location.
    fn is_visible(&self, _origin: Option<&Arc<Module>>, _existing: &Arc<Module>) -> bool {
        true
    }
}

/// Default policy: every duplicate collides, so duplicate name+version
/// installs are rejected
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultCollisionHook;

impl ModuleCollisionHook for DefaultCollisionHook {
    fn filter_collisions(
        &self,
        _operation: CollisionOperation,
        _origin: Option<&Arc<Module>>,
        candidates: &[Arc<Module>],
    ) -> Vec<Arc<Module>> {
        candidates.to_vec()
    }
}

/// Permissive policy: no duplicate ever collides. Useful for embedders that
/// allow several modules with the same name and version.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAllCollisionHook;

impl ModuleCollisionHook for AllowAllCollisionHook {
    fn filter_collisions(
        &self,
        _operation: CollisionOperation,
        _origin: Option<&Arc<Module>>,
        _candidates: &[Arc<Module>],
    ) -> Vec<Arc<Module>> {
        Vec::new()
    }
}
