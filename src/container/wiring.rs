//! Resolved wiring graph
//!
//! A [`ModuleWire`] is one resolved edge from a requirement to the capability
//! satisfying it. A [`ModuleWiring`] is the set of provided/required wires
//! attached to one resolved revision. Wire lists are replaced wholesale via an
//! atomically swapped pointer, never edited in place, so concurrent readers
//! always observe a consistent set.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;

use crate::container::revision::{ModuleCapability, ModuleRequirement, ModuleRevision};

/// A resolved edge: `requirement` of `requirer` is satisfied by `capability`
/// of `provider`
pub struct ModuleWire {
    capability: Arc<ModuleCapability>,
    provider: Arc<ModuleRevision>,
    requirement: Arc<ModuleRequirement>,
    requirer: Arc<ModuleRevision>,
}

impl ModuleWire {
    pub fn new(
        capability: Arc<ModuleCapability>,
        provider: Arc<ModuleRevision>,
        requirement: Arc<ModuleRequirement>,
        requirer: Arc<ModuleRevision>,
    ) -> Self {
        Self {
            capability,
            provider,
            requirement,
            requirer,
        }
    }

    pub fn capability(&self) -> &Arc<ModuleCapability> {
        &self.capability
    }

    pub fn provider(&self) -> &Arc<ModuleRevision> {
        &self.provider
    }

    pub fn requirement(&self) -> &Arc<ModuleRequirement> {
        &self.requirement
    }

    pub fn requirer(&self) -> &Arc<ModuleRevision> {
        &self.requirer
    }
}

impl fmt::Debug for ModuleWire {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ModuleWire[{} -> {} ({})]",
            self.requirer,
            self.provider,
            self.capability.namespace()
        )
    }
}

#[derive(Default)]
struct WireSet {
    provided: Vec<Arc<ModuleWire>>,
    required: Vec<Arc<ModuleWire>>,
}

/// The full set of wires attached to one resolved revision.
///
/// Holds the capabilities and requirements as exposed at resolution time.
/// Once invalidated (superseded by refresh), all graph queries return empty
/// rather than stale data.
pub struct ModuleWiring {
    revision: Arc<ModuleRevision>,
    capabilities: Vec<Arc<ModuleCapability>>,
    requirements: Vec<Arc<ModuleRequirement>>,
    wires: ArcSwap<WireSet>,
    valid: AtomicBool,
}

impl ModuleWiring {
    pub(crate) fn new(
        revision: Arc<ModuleRevision>,
        capabilities: Vec<Arc<ModuleCapability>>,
        requirements: Vec<Arc<ModuleRequirement>>,
        provided: Vec<Arc<ModuleWire>>,
        required: Vec<Arc<ModuleWire>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            revision,
            capabilities,
            requirements,
            wires: ArcSwap::from_pointee(WireSet { provided, required }),
            valid: AtomicBool::new(true),
        })
    }

    /// The resolved revision this wiring is attached to
    pub fn revision(&self) -> &Arc<ModuleRevision> {
        &self.revision
    }

    /// Whether this wiring is still in use. Cleared exactly once when the
    /// wiring is superseded or invalidated.
    pub fn is_valid(&self) -> bool {
        self.valid.load(Ordering::Acquire)
    }

    /// Capabilities exposed at resolution time; empty once invalidated
    pub fn capabilities(&self, namespace: Option<&str>) -> Vec<Arc<ModuleCapability>> {
        if !self.is_valid() {
            return Vec::new();
        }
        self.capabilities
            .iter()
            .filter(|c| namespace.map_or(true, |ns| c.namespace() == ns))
            .cloned()
            .collect()
    }

    /// Requirements exposed at resolution time; empty once invalidated
    pub fn requirements(&self, namespace: Option<&str>) -> Vec<Arc<ModuleRequirement>> {
        if !self.is_valid() {
            return Vec::new();
        }
        self.requirements
            .iter()
            .filter(|r| namespace.map_or(true, |ns| r.namespace() == ns))
            .cloned()
            .collect()
    }

    /// Wires from other revisions' requirements to this revision's
    /// capabilities; empty once invalidated
    pub fn provided_wires(&self, namespace: Option<&str>) -> Vec<Arc<ModuleWire>> {
        if !self.is_valid() {
            return Vec::new();
        }
        self.wires
            .load()
            .provided
            .iter()
            .filter(|w| namespace.map_or(true, |ns| w.capability().namespace() == ns))
            .cloned()
            .collect()
    }

    /// Wires from this revision's requirements to other revisions'
    /// capabilities; empty once invalidated
    pub fn required_wires(&self, namespace: Option<&str>) -> Vec<Arc<ModuleWire>> {
        if !self.is_valid() {
            return Vec::new();
        }
        self.wires
            .load()
            .required
            .iter()
            .filter(|w| namespace.map_or(true, |ns| w.requirement().namespace() == ns))
            .cloned()
            .collect()
    }

    /// Replace the provided wires wholesale, keeping the required wires.
    ///
    /// Re-resolution refreshes the provided side of already-resolved
    /// revisions in place so that references to this wiring stay valid.
    pub(crate) fn set_provided(&self, provided: Vec<Arc<ModuleWire>>) {
        let current = self.wires.load();
        self.wires.store(Arc::new(WireSet {
            provided,
            required: current.required.clone(),
        }));
    }

    pub(crate) fn invalidate(&self) {
        self.valid.store(false, Ordering::Release);
    }
}

impl fmt::Debug for ModuleWiring {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let wires = self.wires.load();
        f.debug_struct("ModuleWiring")
            .field("revision", &self.revision)
            .field("valid", &self.is_valid())
            .field("provided", &wires.provided.len())
            .field("required", &wires.required.len())
            .finish()
    }
}
