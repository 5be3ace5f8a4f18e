//! Submission of the two state-changing income actions through the host
//! signing capability.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::time::{sleep, Instant};
use tracing::{debug, error, info, warn};

use crate::accrual::TrackerError;
use crate::gateway::{Address, CLAIM_REWARDS, STAKE};
use crate::host::{ActionCall, ActionHandle, HostError, HostSigner, ReceiptSource, SubmitStatus};
use crate::telemetry;

pub const DEFAULT_CONFIRMATION_POLL_INTERVAL: Duration = Duration::from_secs(2);
pub const DEFAULT_CONFIRMATION_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum IncomeAction {
    /// `stake()`: enrolls the address so accrual starts.
    Activate,
    /// `claimRewards()`: withdraws everything claimable.
    Claim,
}

impl IncomeAction {
    pub fn function_signature(self) -> &'static str {
        match self {
            IncomeAction::Activate => STAKE,
            IncomeAction::Claim => CLAIM_REWARDS,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            IncomeAction::Activate => "activate",
            IncomeAction::Claim => "claim",
        }
    }

    pub fn call(self, target: Address) -> ActionCall {
        ActionCall {
            target,
            function_signature: self.function_signature().to_string(),
            args: Vec::new(),
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ActionError {
    #[error("another action is still in flight")]
    Busy,
    #[error("host wallet runtime is unavailable")]
    HostUnavailable,
    #[error("action rejected: {0}")]
    Rejected(String),
    #[error(transparent)]
    Host(HostError),
    #[error("no address is bound")]
    NotBound,
    #[error("session has shut down")]
    SessionStopped,
}

impl ActionError {
    pub fn label(&self) -> &'static str {
        match self {
            ActionError::Busy => "busy",
            ActionError::HostUnavailable => "host_unavailable",
            ActionError::Rejected(_) => "rejected",
            ActionError::Host(_) => "host_error",
            ActionError::NotBound => "not_bound",
            ActionError::SessionStopped => "stopped",
        }
    }
}

impl From<HostError> for ActionError {
    fn from(err: HostError) -> Self {
        match err {
            HostError::NotInstalled => ActionError::HostUnavailable,
            HostError::Rejected(reason) => ActionError::Rejected(reason),
            other => ActionError::Host(other),
        }
    }
}

impl From<TrackerError> for ActionError {
    fn from(err: TrackerError) -> Self {
        match err {
            TrackerError::NotBound => ActionError::NotBound,
            TrackerError::ActionPending => ActionError::Busy,
        }
    }
}

/// Proof that the caller owns the single action slot. Releasing it (drop)
/// lets the next action through.
#[derive(Debug)]
pub struct ActionPermit {
    busy: Arc<AtomicBool>,
}

impl Drop for ActionPermit {
    fn drop(&mut self) {
        self.busy.store(false, Ordering::SeqCst);
    }
}

#[derive(Clone)]
pub struct ActionSubmitter {
    signer: Arc<dyn HostSigner>,
    receipts: Arc<dyn ReceiptSource>,
    busy: Arc<AtomicBool>,
    poll_interval: Duration,
    confirmation_timeout: Duration,
}

impl ActionSubmitter {
    pub fn new(signer: Arc<dyn HostSigner>, receipts: Arc<dyn ReceiptSource>) -> Self {
        Self {
            signer,
            receipts,
            busy: Arc::new(AtomicBool::new(false)),
            poll_interval: DEFAULT_CONFIRMATION_POLL_INTERVAL,
            confirmation_timeout: DEFAULT_CONFIRMATION_TIMEOUT,
        }
    }

    pub fn with_confirmation_polling(mut self, poll_interval: Duration, timeout: Duration) -> Self {
        self.poll_interval = poll_interval;
        self.confirmation_timeout = timeout;
        self
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::SeqCst)
    }

    pub fn host_available(&self) -> bool {
        self.signer.is_installed()
    }

    pub fn try_acquire(&self) -> Result<ActionPermit, ActionError> {
        if self
            .busy
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(ActionError::Busy);
        }
        Ok(ActionPermit {
            busy: self.busy.clone(),
        })
    }

    /// Issues exactly one host call for `action` against `target`. Failures
    /// are returned as-is; nothing is retried.
    pub async fn submit(
        &self,
        _permit: &ActionPermit,
        action: IncomeAction,
        target: Address,
    ) -> Result<ActionHandle, ActionError> {
        let result = self.submit_inner(action, target).await;
        match &result {
            Ok(handle) => {
                telemetry::record_action(action.as_str(), "submitted");
                info!(action = action.as_str(), %target, %handle, "action submitted");
            }
            Err(err) => {
                telemetry::record_action(action.as_str(), err.label());
                error!(action = action.as_str(), %target, error = %err, "action failed");
            }
        }
        result
    }

    async fn submit_inner(
        &self,
        action: IncomeAction,
        target: Address,
    ) -> Result<ActionHandle, ActionError> {
        if !self.signer.is_installed() {
            return Err(ActionError::HostUnavailable);
        }
        let outcome = self.signer.submit_action(vec![action.call(target)]).await?;
        match outcome.status {
            SubmitStatus::Success => outcome
                .action_handle
                .ok_or_else(|| ActionError::Rejected("host returned no action handle".into())),
            SubmitStatus::Error => Err(ActionError::Rejected(
                outcome
                    .error_code
                    .unwrap_or_else(|| "unknown_error".to_string()),
            )),
        }
    }

    /// Polls the receipt capability until the action is confirmed or the
    /// timeout passes. `Ok(false)` means it never confirmed in time.
    pub async fn track_confirmation(&self, handle: &ActionHandle) -> Result<bool, ActionError> {
        let deadline = Instant::now() + self.confirmation_timeout;
        loop {
            let confirmation = self.receipts.await_confirmation(handle).await?;
            if confirmation.confirmed {
                telemetry::record_action("confirmation", "confirmed");
                debug!(%handle, "action confirmed");
                return Ok(true);
            }
            if Instant::now() + self.poll_interval > deadline {
                telemetry::record_action("confirmation", "timeout");
                warn!(%handle, "action not confirmed before timeout");
                return Ok(false);
            }
            sleep(self.poll_interval).await;
        }
    }
}
