//! In-process fakes for unit tests.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::llm::ChatModel;
use crate::models::RunEvent;
use crate::run::RunContext;
use crate::traits::AuditLog;

#[derive(Default)]
pub struct RecordingAudit {
    events: Mutex<Vec<RunEvent>>,
    fail: bool,
}

impl RecordingAudit {
    pub fn failing() -> Self {
        Self {
            events: Mutex::new(Vec::new()),
            fail: true,
        }
    }

    pub fn events(&self) -> Vec<RunEvent> {
        self.events.lock().unwrap().clone()
    }
}

#[async_trait]
impl AuditLog for RecordingAudit {
    async fn append(&self, event: &RunEvent) -> Result<()> {
        if self.fail {
            return Err(Error::Database("disk full".into()));
        }
        self.events.lock().unwrap().push(event.clone());
        Ok(())
    }
}

/// Replays canned responses in order and remembers every prompt it saw.
#[derive(Default)]
pub struct ScriptedModel {
    replies: Mutex<VecDeque<Result<String>>>,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedModel {
    pub fn new(replies: Vec<Result<String>>) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
            prompts: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> usize {
        self.prompts.lock().unwrap().len()
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }
}

#[async_trait]
impl ChatModel for ScriptedModel {
    async fn complete(&self, prompt: &str, _schema: Option<&serde_json::Value>) -> Result<String> {
        self.prompts.lock().unwrap().push(prompt.to_string());
        self.replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(Error::Llm("no scripted reply left".into())))
    }
}

pub fn run_context(audit: Arc<RecordingAudit>) -> RunContext {
    RunContext::with_id("test-run".into(), audit, CancellationToken::new())
}
