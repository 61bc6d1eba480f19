//! Proxmox VE client errors

use pveflow_reconcile::ReconcileError;
use thiserror::Error;

/// Errors from the Proxmox VE REST client
#[derive(Error, Debug)]
pub enum PveError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Resource does not exist: {0}")]
    NotFound(String),

    #[error("API error (HTTP {status}): {message}")]
    Status { status: u16, message: String },

    #[error("Task {upid} failed: {exit_status}")]
    TaskFailed { upid: String, exit_status: String },

    #[error("Unexpected response: {0}")]
    InvalidResponse(String),

    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid client configuration: {0}")]
    InvalidConfig(String),
}

impl PveError {
    /// Classifies a non-2xx response.
    ///
    /// Proxmox answers a missing instance with either 404 or a 500 whose
    /// message says the configuration file "does not exist".
    pub fn from_status(status: u16, body: &str) -> Self {
        let message = error_message(body);
        if status == 404 || (status == 500 && message.contains("does not exist")) {
            return PveError::NotFound(message);
        }
        PveError::Status { status, message }
    }

    pub fn is_transient(&self) -> bool {
        match self {
            PveError::Http(e) => e.is_connect() || e.is_timeout(),
            PveError::Status { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

/// Joins `message` and the per-parameter `errors` map of an error body.
fn error_message(body: &str) -> String {
    let Ok(value) = serde_json::from_str::<serde_json::Value>(body) else {
        return body.trim().to_string();
    };
    let mut parts = Vec::new();
    if let Some(message) = value.get("message").and_then(|m| m.as_str()) {
        parts.push(message.trim().to_string());
    }
    if let Some(errors) = value.get("errors").and_then(|e| e.as_object()) {
        for (key, err) in errors {
            let text = err.as_str().map(str::to_string).unwrap_or_else(|| err.to_string());
            parts.push(format!("{}: {}", key, text.trim()));
        }
    }
    if parts.is_empty() {
        body.trim().to_string()
    } else {
        parts.join(", ")
    }
}

impl From<PveError> for ReconcileError {
    fn from(err: PveError) -> Self {
        if err.is_transient() {
            return ReconcileError::TransientApi(err.to_string());
        }
        match err {
            PveError::NotFound(message) => ReconcileError::NotFound(message),
            PveError::InvalidConfig(message) => ReconcileError::Configuration(message),
            other => ReconcileError::Api(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, PveError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_config_is_not_found() {
        let body = r#"{"data":null,"message":"Configuration file 'nodes/pve1/qemu-server/100.conf' does not exist\n"}"#;
        assert!(matches!(
            PveError::from_status(500, body),
            PveError::NotFound(_)
        ));
        assert!(matches!(PveError::from_status(404, ""), PveError::NotFound(_)));
    }

    #[test]
    fn test_parameter_errors_are_joined() {
        let body = r#"{"data":null,"errors":{"cores":"value must be at least 1"}}"#;
        match PveError::from_status(400, body) {
            PveError::Status { status, message } => {
                assert_eq!(status, 400);
                assert_eq!(message, "cores: value must be at least 1");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_reconcile_error_mapping() {
        let server: ReconcileError = PveError::from_status(503, "busy").into();
        assert!(server.is_transient());

        let client: ReconcileError = PveError::from_status(403, "permission denied").into();
        assert_eq!(
            client,
            ReconcileError::Api("API error (HTTP 403): permission denied".into())
        );

        let task: ReconcileError = PveError::TaskFailed {
            upid: "UPID:pve1:1".into(),
            exit_status: "can't lock file".into(),
        }
        .into();
        assert!(matches!(task, ReconcileError::Api(m) if m.contains("can't lock file")));

        let missing: ReconcileError = PveError::from_status(404, "").into();
        assert!(missing.is_not_found());
    }
}
