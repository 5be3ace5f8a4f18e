//! Capabilities borrowed from the host wallet runtime: transaction signing
//! and receipt lookup.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::gateway::Address;

/// One state-changing contract call handed to the host for signing.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ActionCall {
    pub target: Address,
    pub function_signature: String,
    #[serde(default)]
    pub args: Vec<Value>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubmitStatus {
    Success,
    Error,
}

/// Identifier the host assigns to a submitted action.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ActionHandle(pub String);

impl fmt::Display for ActionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitOutcome {
    pub status: SubmitStatus,
    #[serde(default)]
    pub action_handle: Option<ActionHandle>,
    /// Host-specific reason attached to an error status.
    #[serde(default)]
    pub error_code: Option<String>,
}

impl SubmitOutcome {
    pub fn success(handle: impl Into<String>) -> Self {
        Self {
            status: SubmitStatus::Success,
            action_handle: Some(ActionHandle(handle.into())),
            error_code: None,
        }
    }

    pub fn error(code: impl Into<String>) -> Self {
        Self {
            status: SubmitStatus::Error,
            action_handle: None,
            error_code: Some(code.into()),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Confirmation {
    pub confirmed: bool,
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum HostError {
    #[error("host wallet runtime is not installed")]
    NotInstalled,
    #[error("host rejected the request: {0}")]
    Rejected(String),
    #[error("host transport error: {0}")]
    Transport(String),
}

#[async_trait]
pub trait HostSigner: Send + Sync {
    fn is_installed(&self) -> bool;

    async fn submit_action(&self, calls: Vec<ActionCall>) -> Result<SubmitOutcome, HostError>;
}

#[async_trait]
pub trait ReceiptSource: Send + Sync {
    async fn await_confirmation(&self, handle: &ActionHandle) -> Result<Confirmation, HostError>;
}

/// Stand-in used when the process runs outside a host wallet.
#[derive(Clone, Copy, Debug, Default)]
pub struct UnavailableHost;

#[async_trait]
impl HostSigner for UnavailableHost {
    fn is_installed(&self) -> bool {
        false
    }

    async fn submit_action(&self, _calls: Vec<ActionCall>) -> Result<SubmitOutcome, HostError> {
        Err(HostError::NotInstalled)
    }
}

#[async_trait]
impl ReceiptSource for UnavailableHost {
    async fn await_confirmation(&self, _handle: &ActionHandle) -> Result<Confirmation, HostError> {
        Err(HostError::NotInstalled)
    }
}

#[derive(Default)]
struct StubHostState {
    outcomes: VecDeque<Result<SubmitOutcome, HostError>>,
    submitted: Vec<Vec<ActionCall>>,
    pending_polls: usize,
    confirmation_polls: usize,
}

/// Scripted host for tests and dry runs. Unscripted submissions succeed
/// with a sequential handle.
#[derive(Clone)]
pub struct StubHost {
    installed: bool,
    state: Arc<Mutex<StubHostState>>,
}

impl Default for StubHost {
    fn default() -> Self {
        Self {
            installed: true,
            state: Arc::default(),
        }
    }
}

impl StubHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn not_installed() -> Self {
        Self {
            installed: false,
            ..Self::default()
        }
    }

    pub fn with_outcome(self, outcome: Result<SubmitOutcome, HostError>) -> Self {
        self.push_outcome(outcome);
        self
    }

    /// Confirmation polls report `confirmed: false` this many times first.
    pub fn with_pending_polls(self, polls: usize) -> Self {
        self.state.lock().pending_polls = polls;
        self
    }

    pub fn push_outcome(&self, outcome: Result<SubmitOutcome, HostError>) {
        self.state.lock().outcomes.push_back(outcome);
    }

    pub fn submitted(&self) -> Vec<Vec<ActionCall>> {
        self.state.lock().submitted.clone()
    }

    pub fn confirmation_polls(&self) -> usize {
        self.state.lock().confirmation_polls
    }
}

#[async_trait]
impl HostSigner for StubHost {
    fn is_installed(&self) -> bool {
        self.installed
    }

    async fn submit_action(&self, calls: Vec<ActionCall>) -> Result<SubmitOutcome, HostError> {
        let mut state = self.state.lock();
        state.submitted.push(calls);
        let sequence = state.submitted.len();
        state
            .outcomes
            .pop_front()
            .unwrap_or_else(|| Ok(SubmitOutcome::success(format!("stub-{sequence}"))))
    }
}

#[async_trait]
impl ReceiptSource for StubHost {
    async fn await_confirmation(&self, _handle: &ActionHandle) -> Result<Confirmation, HostError> {
        let mut state = self.state.lock();
        state.confirmation_polls += 1;
        if state.pending_polls > 0 {
            state.pending_polls -= 1;
            return Ok(Confirmation { confirmed: false });
        }
        Ok(Confirmation { confirmed: true })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn submit_outcome_reads_host_payload() {
        let outcome: SubmitOutcome = serde_json::from_str(
            r#"{"status":"error","error_code":"user_rejected"}"#,
        )
        .expect("decode");
        assert_eq!(outcome, SubmitOutcome::error("user_rejected"));

        let outcome: SubmitOutcome =
            serde_json::from_str(r#"{"status":"success","action_handle":"tx-1"}"#)
                .expect("decode");
        assert_eq!(outcome.action_handle, Some(ActionHandle("tx-1".into())));
    }

    #[tokio::test]
    async fn stub_host_replays_script_then_succeeds() {
        let host = StubHost::new().with_outcome(Err(HostError::Rejected("user_rejected".into())));
        assert!(host.submit_action(Vec::new()).await.is_err());
        let outcome = host.submit_action(Vec::new()).await.expect("default success");
        assert_eq!(outcome.action_handle, Some(ActionHandle("stub-2".into())));
        assert_eq!(host.submitted().len(), 2);
    }
}
