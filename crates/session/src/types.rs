use std::collections::BTreeSet;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::SessionError;
use crate::managed::SandboxState;

/// One script submitted to one sandbox.
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    pub request_id: String,
    pub sandbox_id: String,
    pub script: String,
    pub timeout: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Success,
    Error,
    Timeout,
}

/// A typed value emitted by a script through an `@@output` line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StructuredOutput {
    pub kind: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    pub request_id: String,
    pub sandbox_id: String,
    pub status: ExecutionStatus,
    pub stdout: String,
    pub stderr: String,
    pub structured_outputs: Vec<StructuredOutput>,
    pub duration_ms: u64,
}

impl ExecutionResult {
    /// Convert timeout/error results into the matching [`SessionError`] for
    /// callers that want `?` propagation.
    pub fn into_result(self) -> Result<Self, SessionError> {
        match self.status {
            ExecutionStatus::Success => Ok(self),
            ExecutionStatus::Timeout => Err(SessionError::ExecutionTimeout {
                sandbox_id: self.sandbox_id,
                duration_ms: self.duration_ms,
            }),
            ExecutionStatus::Error => Err(SessionError::ExecutionError {
                stderr: self.stderr,
            }),
        }
    }

    /// First structured output of the given kind.
    pub fn output(&self, kind: &str) -> Option<&StructuredOutput> {
        self.structured_outputs.iter().find(|o| o.kind == kind)
    }
}

/// Events yielded by an [`InstallStream`](crate::InstallStream). A stream
/// always ends with exactly one `Done`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InstallEvent {
    Progress { message: String },
    Done { success: bool, message: String },
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub id: String,
    pub project_key: String,
    pub runtime_version: String,
    pub state: SandboxState,
    pub installed_packages: BTreeSet<String>,
    pub created_at: DateTime<Utc>,
    pub last_used_at: DateTime<Utc>,
    /// Milliseconds since the sandbox was last used.
    pub idle_ms: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(status: ExecutionStatus) -> ExecutionResult {
        ExecutionResult {
            request_id: "r1".into(),
            sandbox_id: "s1".into(),
            status,
            stdout: String::new(),
            stderr: "Traceback: boom".into(),
            structured_outputs: vec![],
            duration_ms: 512,
        }
    }

    #[test]
    fn execution_result_uses_camel_case() {
        let json = serde_json::to_value(result(ExecutionStatus::Success)).unwrap();
        assert_eq!(json["status"], "success");
        assert_eq!(json["durationMs"], 512);
        assert!(json.get("structuredOutputs").is_some());
    }

    #[test]
    fn into_result_maps_taxonomy() {
        assert!(result(ExecutionStatus::Success).into_result().is_ok());
        assert!(matches!(
            result(ExecutionStatus::Timeout).into_result(),
            Err(SessionError::ExecutionTimeout { duration_ms: 512, .. })
        ));
        match result(ExecutionStatus::Error).into_result() {
            Err(SessionError::ExecutionError { stderr }) => assert_eq!(stderr, "Traceback: boom"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn install_event_serializes_tagged() {
        let json = serde_json::to_value(InstallEvent::Done {
            success: false,
            message: "no wheel".into(),
        })
        .unwrap();
        assert_eq!(json["type"], "done");
        assert_eq!(json["success"], false);
    }
}
