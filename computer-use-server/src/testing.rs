//! In-memory collaborators for handler and tool tests.

use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::{LlmError, SandboxError};
use crate::llm::{AgentEvent, ChatCall, ChatProvider, Generation};
use crate::sandbox::{CommandOutput, DesktopAction, SandboxHandle, SandboxService};

#[derive(Default)]
pub struct RecordingSandbox {
    fail_connect: bool,
    fail_kill: bool,
    screenshot: Vec<u8>,
    command_output: CommandOutput,
    connects: Mutex<Vec<Option<String>>>,
    kills: Mutex<Vec<String>>,
    commands: Mutex<Vec<String>>,
    actions: Mutex<Vec<(String, DesktopAction)>>,
}

impl RecordingSandbox {
    pub fn with_screenshot(png: Vec<u8>) -> Self {
        Self {
            screenshot: png,
            ..Default::default()
        }
    }

    pub fn with_command_output(output: CommandOutput) -> Self {
        Self {
            command_output: output,
            ..Default::default()
        }
    }

    pub fn failing_connect() -> Self {
        Self {
            fail_connect: true,
            ..Default::default()
        }
    }

    pub fn failing_kill() -> Self {
        Self {
            fail_kill: true,
            ..Default::default()
        }
    }

    pub fn connects(&self) -> Vec<Option<String>> {
        self.connects.lock().unwrap().clone()
    }

    pub fn kills(&self) -> Vec<String> {
        self.kills.lock().unwrap().clone()
    }

    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().unwrap().clone()
    }

    pub fn actions(&self) -> Vec<(String, DesktopAction)> {
        self.actions.lock().unwrap().clone()
    }
}

#[async_trait]
impl SandboxService for RecordingSandbox {
    async fn connect(&self, sandbox_id: Option<&str>) -> Result<SandboxHandle, SandboxError> {
        self.connects
            .lock()
            .unwrap()
            .push(sandbox_id.map(str::to_string));
        if self.fail_connect {
            return Err(SandboxError::Api {
                status: 503,
                message: "no capacity".to_string(),
            });
        }
        let id = sandbox_id.unwrap_or("sbx-test").to_string();
        Ok(SandboxHandle {
            stream_url: format!("https://stream.test/{id}"),
            id,
        })
    }

    async fn kill(&self, sandbox_id: &str) -> Result<(), SandboxError> {
        self.kills.lock().unwrap().push(sandbox_id.to_string());
        if self.fail_kill {
            return Err(SandboxError::NotFound(sandbox_id.to_string()));
        }
        Ok(())
    }

    async fn run_command(
        &self,
        _sandbox_id: &str,
        command: &str,
    ) -> Result<CommandOutput, SandboxError> {
        self.commands.lock().unwrap().push(command.to_string());
        Ok(self.command_output.clone())
    }

    async fn screenshot(&self, _sandbox_id: &str) -> Result<Vec<u8>, SandboxError> {
        Ok(self.screenshot.clone())
    }

    async fn perform(&self, sandbox_id: &str, action: &DesktopAction) -> Result<(), SandboxError> {
        self.actions
            .lock()
            .unwrap()
            .push((sandbox_id.to_string(), action.clone()));
        Ok(())
    }
}

/// Replays canned results and records every call it receives.
#[derive(Default)]
pub struct StubProvider {
    generation: Option<Generation>,
    events: Vec<AgentEvent>,
    fail: bool,
    stall: bool,
    calls: Mutex<Vec<ChatCall>>,
}

impl StubProvider {
    pub fn generating(generation: Generation) -> Self {
        Self {
            generation: Some(generation),
            ..Default::default()
        }
    }

    pub fn streaming(events: Vec<AgentEvent>) -> Self {
        Self {
            events,
            ..Default::default()
        }
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Default::default()
        }
    }

    /// Never answers.
    pub fn stalling() -> Self {
        Self {
            stall: true,
            ..Default::default()
        }
    }

    pub fn calls(&self) -> Vec<ChatCall> {
        self.calls.lock().unwrap().clone()
    }

    fn failure() -> LlmError {
        LlmError::Api {
            status: 529,
            message: "overloaded".to_string(),
        }
    }
}

#[async_trait]
impl ChatProvider for StubProvider {
    async fn generate(&self, call: ChatCall) -> Result<Generation, LlmError> {
        self.calls.lock().unwrap().push(call);
        if self.stall {
            std::future::pending::<()>().await;
        }
        if self.fail {
            return Err(Self::failure());
        }
        self.generation
            .clone()
            .ok_or_else(|| LlmError::Stream("no generation configured".to_string()))
    }

    async fn stream(
        &self,
        call: ChatCall,
    ) -> Result<mpsc::UnboundedReceiver<AgentEvent>, LlmError> {
        self.calls.lock().unwrap().push(call);
        if self.stall {
            std::future::pending::<()>().await;
        }
        if self.fail {
            return Err(Self::failure());
        }
        let (tx, rx) = mpsc::unbounded_channel();
        for event in &self.events {
            let _ = tx.send(event.clone());
        }
        Ok(rx)
    }
}
