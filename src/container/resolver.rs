//! Constraint resolver seam and default implementation
//!
//! The actual requirement-to-capability matching is pluggable: the container
//! hands a [`ResolveContext`] to a [`ConstraintResolver`] and applies the
//! returned wire delta. [`DefaultResolver`] ships with the crate as a
//! straightforward first-provider resolver.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use semver::Version;
use tracing::debug;

use crate::container::database::ModuleDatabase;
use crate::container::error::{ContainerError, ResolutionError, UnsatisfiedRequirement};
use crate::container::namespaces;
use crate::container::revision::{ModuleCapability, ModuleRequirement, ModuleRevision};
use crate::container::wiring::{ModuleWire, ModuleWiring};

/// A computed wire delta: each newly resolved revision mapped to its required
/// wires. Never applied by the resolver itself; the container applies it
/// under the exclusive lock.
pub type ResolutionDelta = BTreeMap<Arc<ModuleRevision>, Vec<Arc<ModuleWire>>>;

/// The resolution context handed to a [`ConstraintResolver`].
///
/// Exposes the candidate universe of one resolution attempt: the wiring
/// snapshot, the enabled unresolved revisions, and provider lookup with the
/// canonical candidate ordering.
pub struct ResolveContext<'a> {
    db: &'a ModuleDatabase,
    wirings: &'a HashMap<Arc<ModuleRevision>, Arc<ModuleWiring>>,
    enabled: BTreeSet<Arc<ModuleRevision>>,
    triggers: Vec<Arc<ModuleRevision>>,
}

impl<'a> ResolveContext<'a> {
    pub(crate) fn new(
        db: &'a ModuleDatabase,
        wirings: &'a HashMap<Arc<ModuleRevision>, Arc<ModuleWiring>>,
        enabled: Vec<Arc<ModuleRevision>>,
        triggers: Vec<Arc<ModuleRevision>>,
    ) -> Self {
        Self {
            db,
            wirings,
            enabled: enabled.into_iter().collect(),
            triggers,
        }
    }

    /// The revisions that must resolve for the attempt to succeed
    pub fn triggers(&self) -> &[Arc<ModuleRevision>] {
        &self.triggers
    }

    /// Enabled unresolved revisions the resolver may resolve opportunistically
    /// in addition to the triggers
    pub fn optional_resources(&self) -> Vec<Arc<ModuleRevision>> {
        self.enabled
            .iter()
            .filter(|r| !self.triggers.contains(*r))
            .cloned()
            .collect()
    }

    /// The wiring snapshot this attempt computes against
    pub fn wirings(&self) -> &HashMap<Arc<ModuleRevision>, Arc<ModuleWiring>> {
        self.wirings
    }

    /// Whether `revision` is resolved in the snapshot
    pub fn is_resolved(&self, revision: &Arc<ModuleRevision>) -> bool {
        self.wirings.contains_key(revision)
    }

    /// Whether `revision` is an enabled candidate of this attempt
    pub fn is_enabled(&self, revision: &Arc<ModuleRevision>) -> bool {
        self.enabled.contains(revision)
    }

    /// Whether a requirement takes effect during resolution
    pub fn is_effective(&self, requirement: &ModuleRequirement) -> bool {
        requirement
            .directives()
            .get(namespaces::EFFECTIVE_DIRECTIVE)
            .map(|v| v == namespaces::EFFECTIVE_RESOLVE)
            .unwrap_or(true)
    }

    /// Candidate capabilities for `requirement`, restricted to resolved or
    /// enabled providers and sorted by the candidate ordering
    pub fn find_providers(
        &self,
        requirement: &ModuleRequirement,
    ) -> Result<Vec<Arc<ModuleCapability>>, ContainerError> {
        let mut capabilities: Vec<Arc<ModuleCapability>> = self
            .db
            .find_capabilities(requirement)?
            .into_iter()
            .filter(|c| {
                let revision = c.revision();
                self.is_resolved(&revision) || self.is_enabled(&revision)
            })
            .collect();
        capabilities.sort_by(|a, b| self.compare_capabilities(a, b));
        Ok(capabilities)
    }

    /// Binary-insert a hosted capability into an already-sorted candidate
    /// list, returning the insertion index
    pub fn insert_hosted_capability(
        &self,
        capabilities: &mut Vec<Arc<ModuleCapability>>,
        capability: Arc<ModuleCapability>,
    ) -> usize {
        let index = capabilities
            .binary_search_by(|existing| self.compare_capabilities(existing, &capability))
            .unwrap_or_else(|i| i);
        capabilities.insert(index, Arc::clone(&capability));
        index
    }

    /// Canonical candidate ordering: already-resolved capabilities sort before
    /// unresolved ones; within that, higher version first (under the
    /// namespace's version attribute); ties broken by lower revision serial
    /// (insertion order, stable)
    pub fn compare_capabilities(
        &self,
        a: &Arc<ModuleCapability>,
        b: &Arc<ModuleCapability>,
    ) -> Ordering {
        let revision_a = a.revision();
        let revision_b = b.revision();
        let resolved_a = self.is_resolved(&revision_a);
        let resolved_b = self.is_resolved(&revision_b);
        if resolved_a != resolved_b {
            return if resolved_a {
                Ordering::Less
            } else {
                Ordering::Greater
            };
        }
        let version_a = a.version().unwrap_or_else(|| Version::new(0, 0, 0));
        let version_b = b.version().unwrap_or_else(|| Version::new(0, 0, 0));
        version_b
            .cmp(&version_a)
            .then_with(|| revision_a.serial().cmp(&revision_b.serial()))
    }
}

/// Pluggable constraint resolver.
///
/// Computes a wire delta for the context's triggers. Read-only with respect
/// to the database: resolution failure surfaces as an error, never as a
/// partially applied wiring.
pub trait ConstraintResolver: Send + Sync {
    fn resolve(&self, context: &ResolveContext<'_>) -> Result<ResolutionDelta, ContainerError>;
}

/// Default first-provider resolver.
///
/// For each mandatory, effective requirement of each candidate the first
/// provider in candidate order is taken, resolving providers transitively and
/// tolerating dependency cycles. Optional requirements that find no provider
/// are skipped. A mandatory requirement without a provider fails the
/// candidate; a failed trigger fails the attempt.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultResolver;

impl DefaultResolver {
    #[allow(clippy::too_many_arguments)]
    fn try_resolve(
        &self,
        revision: &Arc<ModuleRevision>,
        context: &ResolveContext<'_>,
        delta: &mut ResolutionDelta,
        failed: &mut BTreeSet<Arc<ModuleRevision>>,
        unsatisfied: &mut Vec<UnsatisfiedRequirement>,
        visiting: &mut BTreeSet<Arc<ModuleRevision>>,
    ) -> Result<bool, ContainerError> {
        if context.is_resolved(revision)
            || delta.contains_key(revision)
            || visiting.contains(revision)
        {
            return Ok(true);
        }
        if failed.contains(revision) || !context.is_enabled(revision) {
            return Ok(false);
        }
        visiting.insert(Arc::clone(revision));
        let mut wires = Vec::new();
        let mut success = true;
        for requirement in revision.requirements(None) {
            if !context.is_effective(&requirement) {
                continue;
            }
            let providers = context.find_providers(&requirement)?;
            let mut wired = false;
            for capability in providers {
                let provider = capability.revision();
                if self.try_resolve(&provider, context, delta, failed, unsatisfied, visiting)? {
                    wires.push(Arc::new(ModuleWire::new(
                        capability,
                        provider,
                        Arc::clone(&requirement),
                        Arc::clone(revision),
                    )));
                    wired = true;
                    break;
                }
            }
            if !wired && !requirement.is_optional() {
                debug!("cannot resolve {}: no provider for {:?}", revision, requirement);
                unsatisfied.push(UnsatisfiedRequirement {
                    requirer: revision.to_string(),
                    namespace: requirement.namespace().to_string(),
                    filter: requirement.filter().map(str::to_string),
                });
                success = false;
                break;
            }
        }
        visiting.remove(revision);
        if success {
            delta.insert(Arc::clone(revision), wires);
        } else {
            failed.insert(Arc::clone(revision));
        }
        Ok(success)
    }
}

impl ConstraintResolver for DefaultResolver {
    fn resolve(&self, context: &ResolveContext<'_>) -> Result<ResolutionDelta, ContainerError> {
        let mut delta = ResolutionDelta::new();
        let mut failed: BTreeSet<Arc<ModuleRevision>> = BTreeSet::new();
        let mut unsatisfied: Vec<UnsatisfiedRequirement> = Vec::new();
        for trigger in context.triggers() {
            let mut visiting = BTreeSet::new();
            self.try_resolve(
                trigger,
                context,
                &mut delta,
                &mut failed,
                &mut unsatisfied,
                &mut visiting,
            )?;
        }

        // Wires created under the in-cycle assumption may point at providers
        // that failed later; drop such entries until a fixpoint
        loop {
            let stale: Vec<Arc<ModuleRevision>> = delta
                .iter()
                .filter(|(_, wires)| wires.iter().any(|w| failed.contains(w.provider())))
                .map(|(revision, _)| Arc::clone(revision))
                .collect();
            if stale.is_empty() {
                break;
            }
            for revision in stale {
                delta.remove(&revision);
                failed.insert(revision);
            }
        }

        let trigger_failed = context
            .triggers()
            .iter()
            .any(|t| !context.is_resolved(t) && !delta.contains_key(t));
        if trigger_failed {
            return Err(ResolutionError { unsatisfied }.into());
        }
        Ok(delta)
    }
}
