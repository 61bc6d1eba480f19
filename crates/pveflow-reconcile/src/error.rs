//! Reconciliation error taxonomy

use pveflow_core::CoreError;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReconcileError {
    #[error("Invalid configuration: {0}")]
    Configuration(String),

    #[error("Instance not found: {0}")]
    NotFound(String),

    #[error("Cannot {action} {volume}: it is not owned by instance {vm_id}")]
    Ownership {
        action: String,
        volume: String,
        vm_id: u32,
    },

    #[error("Unsupported operation: {0}")]
    UnsupportedOperation(String),

    #[error("Transient API error: {0}")]
    TransientApi(String),

    #[error("API error: {0}")]
    Api(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("{} errors during reconciliation:\n{}", .0.len(), format_errors(.0))]
    Multiple(Vec<ReconcileError>),
}

fn format_errors(errors: &[ReconcileError]) -> String {
    errors
        .iter()
        .map(|e| format!("  - {}", e))
        .collect::<Vec<_>>()
        .join("\n")
}

impl ReconcileError {
    pub fn ownership(action: impl Into<String>, volume: impl Into<String>, vm_id: u32) -> Self {
        ReconcileError::Ownership {
            action: action.into(),
            volume: volume.into(),
            vm_id,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, ReconcileError::NotFound(_))
    }

    /// Retried inside polling loops only, never for one-shot mutations.
    pub fn is_transient(&self) -> bool {
        matches!(self, ReconcileError::TransientApi(_))
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, ReconcileError::Timeout(_))
    }

    /// Folds a pass's errors into one: `None` for none, the error itself for
    /// one, [`ReconcileError::Multiple`] otherwise. Nested aggregates are flattened.
    pub fn aggregate(errors: Vec<ReconcileError>) -> Option<ReconcileError> {
        let mut flat: Vec<ReconcileError> = Vec::with_capacity(errors.len());
        for error in errors {
            match error {
                ReconcileError::Multiple(inner) => flat.extend(inner),
                other => flat.push(other),
            }
        }
        match flat.len() {
            0 => None,
            1 => flat.pop(),
            _ => Some(ReconcileError::Multiple(flat)),
        }
    }
}

impl From<CoreError> for ReconcileError {
    fn from(err: CoreError) -> Self {
        ReconcileError::Configuration(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ReconcileError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aggregate() {
        assert_eq!(ReconcileError::aggregate(vec![]), None);

        let single = ReconcileError::aggregate(vec![ReconcileError::Timeout("start".into())]);
        assert_eq!(single, Some(ReconcileError::Timeout("start".into())));

        let nested = ReconcileError::aggregate(vec![
            ReconcileError::Api("a".into()),
            ReconcileError::Multiple(vec![
                ReconcileError::Api("b".into()),
                ReconcileError::Api("c".into()),
            ]),
        ]);
        match nested {
            Some(ReconcileError::Multiple(errors)) => assert_eq!(errors.len(), 3),
            other => panic!("expected Multiple, got {:?}", other),
        }
    }

    #[test]
    fn test_multiple_display_lists_each_error() {
        let err = ReconcileError::Multiple(vec![
            ReconcileError::UnsupportedOperation("shrink".into()),
            ReconcileError::ownership("move", "local-lvm:base-9000-disk-0", 100),
        ]);
        let text = err.to_string();
        assert!(text.starts_with("2 errors"));
        assert!(text.contains("shrink"));
        assert!(text.contains("not owned by instance 100"));
    }

    #[test]
    fn test_core_error_is_configuration() {
        let err: ReconcileError = CoreError::InvalidInterface("nvme0".into()).into();
        assert!(matches!(err, ReconcileError::Configuration(_)));
    }
}
