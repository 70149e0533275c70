use std::future::Future;
use std::sync::{Arc, Mutex};

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::models::{Outcome, RunEvent, Stage};
use crate::traits::AuditLog;

/// Per-run state threaded explicitly through every stage: the correlation
/// id stamped on each event, the audit sink, and the caller's cancellation.
pub struct RunContext {
    run_id: String,
    audit: Arc<dyn AuditLog>,
    cancel: CancellationToken,
    log_failure: Mutex<Option<Error>>,
}

impl RunContext {
    pub fn new(audit: Arc<dyn AuditLog>, cancel: CancellationToken) -> Self {
        Self::with_id(Uuid::new_v4().to_string(), audit, cancel)
    }

    pub fn with_id(run_id: String, audit: Arc<dyn AuditLog>, cancel: CancellationToken) -> Self {
        Self {
            run_id,
            audit,
            cancel,
            log_failure: Mutex::new(None),
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Emit one run event. Audit failures never interrupt the pipeline; the
    /// first one is kept so the run can report it when nothing else failed.
    pub async fn record(&self, stage: Stage, outcome: Outcome, message: impl Into<String>) {
        let message = message.into();
        match outcome {
            Outcome::Success => info!(run_id = %self.run_id, stage = %stage, "{}", message),
            Outcome::Fail => warn!(run_id = %self.run_id, stage = %stage, "{}", message),
        }

        let event = RunEvent {
            run_id: Some(self.run_id.clone()),
            stage,
            outcome,
            message: Some(message),
        };
        if let Err(e) = self.audit.append(&event).await {
            warn!(run_id = %self.run_id, error = %e, "audit append failed");
            let mut slot = self.log_failure.lock().unwrap_or_else(|p| p.into_inner());
            if slot.is_none() {
                *slot = Some(Error::AuditLog(e.to_string()));
            }
        }
    }

    pub fn take_log_failure(&self) -> Option<Error> {
        self.log_failure
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take()
    }

    /// Run a network future, aborting with `Error::Cancelled` as soon as the
    /// run's token fires.
    pub async fn guard<T, F>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        tokio::select! {
            _ = self.cancel.cancelled() => Err(Error::Cancelled),
            result = fut => result,
        }
    }
}
