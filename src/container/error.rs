//! Container error taxonomy
//!
//! All failures are local, synchronous, and caller-reported; there is no
//! background retry inside the container. Misuse of the upgradeable lock's
//! contract is a panic, not an error value (see [`crate::sync::upgradeable`]).

use thiserror::Error;

use crate::container::filter::FilterError;
use crate::container::hooks::CollisionOperation;

/// Module container errors
#[derive(Debug, Error)]
pub enum ContainerError {
    #[error("timed out waiting for identity lock: {0}")]
    LockTimeout(String),

    #[error("{operation} collision: conflicting module already installed at {existing}")]
    Collision {
        operation: CollisionOperation,
        existing: String,
    },

    #[error("module at {0} is not visible from the requesting origin")]
    VisibilityDenied(String),

    #[error("location already in use: {0}")]
    LocationInUse(String),

    #[error("module at {0} is already uninstalled")]
    AlreadyUninstalled(String),

    #[error(transparent)]
    ResolutionFailed(#[from] ResolutionError),

    #[error(transparent)]
    Filter(#[from] FilterError),

    #[error("capability store error: {0}")]
    Store(#[from] anyhow::Error),
}

/// Aggregate resolution failure.
///
/// Reports which requirements could not be satisfied; no partial wiring is
/// ever surfaced alongside it.
#[derive(Debug, Clone, Error)]
#[error("unable to resolve: {} unsatisfied requirement(s): {}", .unsatisfied.len(), format_unsatisfied(.unsatisfied))]
pub struct ResolutionError {
    /// The requirements no candidate capability satisfied
    pub unsatisfied: Vec<UnsatisfiedRequirement>,
}

/// One requirement the resolver could not satisfy
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnsatisfiedRequirement {
    /// Display name of the requiring revision
    pub requirer: String,
    /// Namespace of the unsatisfied requirement
    pub namespace: String,
    /// Filter expression of the unsatisfied requirement, if any
    pub filter: Option<String>,
}

impl std::fmt::Display for UnsatisfiedRequirement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.filter {
            Some(filter) => write!(f, "{} needs {} {}", self.requirer, self.namespace, filter),
            None => write!(f, "{} needs {}", self.requirer, self.namespace),
        }
    }
}

fn format_unsatisfied(unsatisfied: &[UnsatisfiedRequirement]) -> String {
    unsatisfied
        .iter()
        .map(|u| u.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolution_error_display() {
        let err = ResolutionError {
            unsatisfied: vec![UnsatisfiedRequirement {
                requirer: "app 1.0.0".to_string(),
                namespace: "module.package".to_string(),
                filter: Some("(package=util)".to_string()),
            }],
        };
        let message = err.to_string();
        assert!(message.contains("1 unsatisfied"));
        assert!(message.contains("app 1.0.0 needs module.package (package=util)"));
    }
}
