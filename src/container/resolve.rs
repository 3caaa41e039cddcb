//! Resolution process
//!
//! Given the unresolved revisions and a trigger set, opens a resolver-hook
//! session, filters out hook-disabled candidates, performs singleton
//! collision resolution, and delegates the remaining matching work to the
//! pluggable constraint resolver. Read-only with respect to the database:
//! the outcome is a wire delta for the caller to apply.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;

use tracing::debug;

use crate::container::database::ModuleDatabase;
use crate::container::error::ContainerError;
use crate::container::hooks::{ResolverHook, ResolverHookFactory};
use crate::container::resolver::{ConstraintResolver, ResolutionDelta, ResolveContext};
use crate::container::revision::ModuleRevision;
use crate::container::wiring::ModuleWiring;

/// Why a candidate was excluded from a resolution attempt
#[derive(Debug, Clone)]
pub enum DisabledReason {
    /// The resolver hook removed the candidate from the resolvable set
    ByHook,
    /// The candidate lost a singleton collision against `winner`
    SingletonLoss { winner: Arc<ModuleRevision> },
}

impl fmt::Display for DisabledReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DisabledReason::ByHook => write!(f, "disabled by resolver hook"),
            DisabledReason::SingletonLoss { winner } => {
                write!(f, "singleton collision lost against {}", winner)
            }
        }
    }
}

/// Outcome of a successful resolution attempt
#[derive(Debug, Default)]
pub struct ResolutionReport {
    /// Revisions newly resolved by this attempt
    pub resolved: Vec<Arc<ModuleRevision>>,
    /// Candidates excluded from this attempt, with the reason each was
    /// disabled. Singleton losers land here rather than failing the attempt.
    pub disabled: BTreeMap<Arc<ModuleRevision>, DisabledReason>,
}

pub(crate) struct ResolveOutcome {
    pub delta: ResolutionDelta,
    pub disabled: BTreeMap<Arc<ModuleRevision>, DisabledReason>,
}

/// Run one resolution attempt against a wiring snapshot.
///
/// The hook session is ended on every path, including failure.
pub(crate) fn run(
    db: &ModuleDatabase,
    wirings: &HashMap<Arc<ModuleRevision>, Arc<ModuleWiring>>,
    unresolved: Vec<Arc<ModuleRevision>>,
    triggers: &[Arc<ModuleRevision>],
    resolver: &dyn ConstraintResolver,
    hook_factory: &dyn ResolverHookFactory,
) -> Result<ResolveOutcome, ContainerError> {
    let mut hook = hook_factory.begin(triggers);
    let result = run_session(db, wirings, unresolved, triggers, resolver, hook.as_mut());
    hook.end();
    result
}

fn run_session(
    db: &ModuleDatabase,
    wirings: &HashMap<Arc<ModuleRevision>, Arc<ModuleWiring>>,
    unresolved: Vec<Arc<ModuleRevision>>,
    triggers: &[Arc<ModuleRevision>],
    resolver: &dyn ConstraintResolver,
    hook: &mut dyn ResolverHook,
) -> Result<ResolveOutcome, ContainerError> {
    let mut disabled: BTreeMap<Arc<ModuleRevision>, DisabledReason> = BTreeMap::new();

    // Anything the hook drops from the resolvable set is disabled for this
    // attempt
    let kept: BTreeSet<Arc<ModuleRevision>> =
        hook.filter_resolvable(&unresolved).into_iter().collect();
    let mut enabled: BTreeSet<Arc<ModuleRevision>> = BTreeSet::new();
    for candidate in unresolved {
        if kept.contains(&candidate) {
            enabled.insert(candidate);
        } else {
            debug!("{:?} disabled by resolver hook", candidate);
            disabled.insert(candidate, DisabledReason::ByHook);
        }
    }

    select_singletons(&mut enabled, &mut disabled, wirings, hook);

    let enabled_triggers: Vec<Arc<ModuleRevision>> = triggers
        .iter()
        .filter(|t| enabled.contains(*t))
        .cloned()
        .collect();
    let context = ResolveContext::new(
        db,
        wirings,
        enabled.into_iter().collect(),
        enabled_triggers,
    );
    let delta = resolver.resolve(&context)?;
    Ok(ResolveOutcome { delta, disabled })
}

/// Singleton collision resolution.
///
/// For every name with singleton candidates: the selection is seeded with the
/// already-resolved singleton of that name (at most one exists), the pairwise
/// collision map comes from the hook, candidates colliding with a selection
/// are disabled, and mutually colliding candidates are reduced to one winner
/// by highest version. Independent across names.
fn select_singletons(
    enabled: &mut BTreeSet<Arc<ModuleRevision>>,
    disabled: &mut BTreeMap<Arc<ModuleRevision>, DisabledReason>,
    wirings: &HashMap<Arc<ModuleRevision>, Arc<ModuleWiring>>,
    hook: &mut dyn ResolverHook,
) {
    let mut groups: BTreeMap<String, Vec<Arc<ModuleRevision>>> = BTreeMap::new();
    for revision in enabled.iter() {
        if revision.is_singleton() {
            if let Some(name) = revision.name() {
                groups
                    .entry(name.to_string())
                    .or_default()
                    .push(Arc::clone(revision));
            }
        }
    }

    // At most one singleton per name may already be resolved
    let mut resolved_by_name: BTreeMap<String, Arc<ModuleRevision>> = BTreeMap::new();
    for revision in wirings.keys() {
        if revision.is_singleton() {
            if let Some(name) = revision.name() {
                resolved_by_name.insert(name.to_string(), Arc::clone(revision));
            }
        }
    }

    for (name, mut group) in groups {
        // Highest version first; stable tie-break on insertion order
        group.sort_by(|a, b| {
            b.version()
                .cmp(a.version())
                .then_with(|| a.serial().cmp(&b.serial()))
        });
        let seed = resolved_by_name.get(&name).cloned();

        // Pairwise collision map, symmetric closure over the hook's answers
        let mut collisions: BTreeMap<Arc<ModuleRevision>, BTreeSet<Arc<ModuleRevision>>> =
            BTreeMap::new();
        for candidate in &group {
            let mut others: Vec<Arc<ModuleRevision>> = group
                .iter()
                .filter(|other| *other != candidate)
                .cloned()
                .collect();
            if let Some(seed) = &seed {
                others.push(Arc::clone(seed));
            }
            if others.is_empty() {
                continue;
            }
            for peer in hook.filter_singleton_collisions(candidate, &others) {
                collisions
                    .entry(Arc::clone(candidate))
                    .or_default()
                    .insert(Arc::clone(&peer));
                collisions
                    .entry(peer)
                    .or_default()
                    .insert(Arc::clone(candidate));
            }
        }

        let mut selected: BTreeSet<Arc<ModuleRevision>> = BTreeSet::new();
        if let Some(seed) = &seed {
            selected.insert(Arc::clone(seed));
        }
        for candidate in &group {
            if disabled.contains_key(candidate) || selected.contains(candidate) {
                continue;
            }
            let peers = collisions.get(candidate).cloned().unwrap_or_default();
            if let Some(winner) = peers.iter().find(|p| selected.contains(*p)) {
                debug!("{:?} loses singleton collision against {:?}", candidate, winner);
                disabled.insert(
                    Arc::clone(candidate),
                    DisabledReason::SingletonLoss {
                        winner: Arc::clone(winner),
                    },
                );
                continue;
            }
            // Pick one of the mutually colliding candidates: highest version
            // wins, all others with that name are disabled
            let mut pick_one: Vec<Arc<ModuleRevision>> = vec![Arc::clone(candidate)];
            for peer in &peers {
                if group.contains(peer)
                    && !selected.contains(peer)
                    && !disabled.contains_key(peer)
                {
                    pick_one.push(Arc::clone(peer));
                }
            }
            let winner = pick_one
                .iter()
                .max_by(|a, b| {
                    a.version()
                        .cmp(b.version())
                        .then_with(|| b.serial().cmp(&a.serial()))
                })
                .cloned()
                .expect("pick-one set contains at least the candidate");
            selected.insert(Arc::clone(&winner));
            for loser in pick_one {
                if loser != winner {
                    debug!("{:?} loses singleton collision against {:?}", loser, winner);
                    disabled.insert(
                        loser,
                        DisabledReason::SingletonLoss {
                            winner: Arc::clone(&winner),
                        },
                    );
                }
            }
        }
    }

    enabled.retain(|revision| !disabled.contains_key(revision));
}
