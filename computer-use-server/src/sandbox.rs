//! Client for the remote sandbox service that provisions desktops.
//!
//! The service owns sandbox lifecycle, networking and isolation. This module
//! only creates, locates and destroys sandboxes by id and forwards the
//! primitive desktop/shell operations the tools need.

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info, warn};

use crate::config::SandboxConfig;
use crate::error::SandboxError;

/// A live sandbox: its id and the URL a viewer can use to watch the desktop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxHandle {
    pub id: String,
    pub stream_url: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct CommandOutput {
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
    #[serde(default)]
    pub exit_code: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MouseButton {
    Left,
    Right,
    Middle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScrollDirection {
    Up,
    Down,
    Left,
    Right,
}

/// Primitive input operations understood by the sandbox service.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DesktopAction {
    Click {
        x: u32,
        y: u32,
        button: MouseButton,
        count: u8,
    },
    MoveMouse {
        x: u32,
        y: u32,
    },
    Drag {
        from: [u32; 2],
        to: [u32; 2],
    },
    Write {
        text: String,
    },
    Press {
        keys: Vec<String>,
    },
    Scroll {
        x: u32,
        y: u32,
        direction: ScrollDirection,
        amount: u32,
    },
}

#[async_trait]
pub trait SandboxService: Send + Sync {
    /// Re-attach to `sandbox_id` when it is still alive, otherwise provision a
    /// fresh sandbox. Returns the handle with a live stream URL.
    async fn connect(&self, sandbox_id: Option<&str>) -> Result<SandboxHandle, SandboxError>;

    async fn kill(&self, sandbox_id: &str) -> Result<(), SandboxError>;

    async fn run_command(
        &self,
        sandbox_id: &str,
        command: &str,
    ) -> Result<CommandOutput, SandboxError>;

    /// PNG bytes of the current screen.
    async fn screenshot(&self, sandbox_id: &str) -> Result<Vec<u8>, SandboxError>;

    async fn perform(&self, sandbox_id: &str, action: &DesktopAction) -> Result<(), SandboxError>;
}

/// Result of a best-effort teardown. Logged by the caller, never escalated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CleanupOutcome {
    Destroyed,
    Failed(String),
}

/// Destroy a sandbox after a failed request. Errors from the destroy call are
/// swallowed into the returned outcome.
pub async fn destroy_on_failure(sandbox: &dyn SandboxService, sandbox_id: &str) -> CleanupOutcome {
    match sandbox.kill(sandbox_id).await {
        Ok(()) => {
            info!("Destroyed sandbox {} after failed request", sandbox_id);
            CleanupOutcome::Destroyed
        }
        Err(e) => {
            warn!("Failed to destroy sandbox {}: {}", sandbox_id, e);
            CleanupOutcome::Failed(e.to_string())
        }
    }
}

#[derive(Deserialize)]
struct SandboxRecord {
    id: String,
}

#[derive(Deserialize)]
struct StreamInfo {
    url: String,
}

pub struct RemoteSandboxService {
    client: Client,
    config: SandboxConfig,
}

impl RemoteSandboxService {
    pub fn new(config: SandboxConfig) -> Self {
        info!("Using sandbox service at {}", config.api_url);
        Self {
            client: Client::new(),
            config,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.api_url.trim_end_matches('/'), path)
    }

    /// URL under `/sandboxes/{id}`. Ids must form a single plain path segment;
    /// anything else is treated as an unknown sandbox and never sent upstream.
    fn sandbox_url(&self, sandbox_id: &str, suffix: &str) -> Result<String, SandboxError> {
        if !is_plain_id(sandbox_id) {
            warn!("Rejecting malformed sandbox id {:?}", sandbox_id);
            return Err(SandboxError::NotFound(sandbox_id.to_string()));
        }
        Ok(self.url(&format!("/sandboxes/{sandbox_id}{suffix}")))
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.config.api_key {
            Some(key) => request.header("X-API-Key", key),
            None => request,
        }
    }

    async fn create(&self) -> Result<String, SandboxError> {
        let body = json!({
            "template": self.config.template,
            "timeoutMs": self.config.timeout.as_millis() as u64,
        });
        let response = self
            .authorized(self.client.post(self.url("/sandboxes")).json(&body))
            .send()
            .await?;
        let record: SandboxRecord = check(response).await?.json().await?;
        info!("Created sandbox {}", record.id);
        Ok(record.id)
    }

    async fn find(&self, sandbox_id: &str) -> Result<String, SandboxError> {
        let response = self
            .authorized(self.client.get(self.sandbox_url(sandbox_id, "")?))
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(SandboxError::NotFound(sandbox_id.to_string()));
        }
        let record: SandboxRecord = check(response).await?.json().await?;
        Ok(record.id)
    }

    async fn stream_url(&self, sandbox_id: &str) -> Result<String, SandboxError> {
        let response = self
            .authorized(self.client.post(self.sandbox_url(sandbox_id, "/stream")?))
            .send()
            .await?;
        let info: StreamInfo = check(response).await?.json().await?;
        Ok(info.url)
    }
}

#[async_trait]
impl SandboxService for RemoteSandboxService {
    async fn connect(&self, sandbox_id: Option<&str>) -> Result<SandboxHandle, SandboxError> {
        let id = match sandbox_id {
            Some(existing) => match self.find(existing).await {
                Ok(id) => id,
                Err(SandboxError::NotFound(_)) => {
                    debug!("Sandbox {} is gone, provisioning a new one", existing);
                    self.create().await?
                }
                Err(e) => return Err(e),
            },
            None => self.create().await?,
        };
        let stream_url = self.stream_url(&id).await?;
        Ok(SandboxHandle { id, stream_url })
    }

    async fn kill(&self, sandbox_id: &str) -> Result<(), SandboxError> {
        let response = self
            .authorized(self.client.delete(self.sandbox_url(sandbox_id, "")?))
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(SandboxError::NotFound(sandbox_id.to_string()));
        }
        check(response).await?;
        Ok(())
    }

    async fn run_command(
        &self,
        sandbox_id: &str,
        command: &str,
    ) -> Result<CommandOutput, SandboxError> {
        debug!("Running command in sandbox {}: {}", sandbox_id, command);
        let response = self
            .authorized(
                self.client
                    .post(self.sandbox_url(sandbox_id, "/commands")?)
                    .json(&json!({ "command": command })),
            )
            .send()
            .await?;
        Ok(check(response).await?.json().await?)
    }

    async fn screenshot(&self, sandbox_id: &str) -> Result<Vec<u8>, SandboxError> {
        let response = self
            .authorized(self.client.get(self.sandbox_url(sandbox_id, "/screenshot")?))
            .send()
            .await?;
        let bytes = check(response).await?.bytes().await?;
        if bytes.is_empty() {
            return Err(SandboxError::InvalidResponse("empty screenshot".to_string()));
        }
        Ok(bytes.to_vec())
    }

    async fn perform(&self, sandbox_id: &str, action: &DesktopAction) -> Result<(), SandboxError> {
        debug!("Sandbox {} action: {:?}", sandbox_id, action);
        let response = self
            .authorized(
                self.client
                    .post(self.sandbox_url(sandbox_id, "/actions")?)
                    .json(action),
            )
            .send()
            .await?;
        check(response).await?;
        Ok(())
    }
}

fn is_plain_id(sandbox_id: &str) -> bool {
    !sandbox_id.is_empty()
        && sandbox_id != "."
        && sandbox_id != ".."
        && sandbox_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

async fn check(response: Response) -> Result<Response, SandboxError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let message = response.text().await.unwrap_or_default();
    Err(SandboxError::Api {
        status: status.as_u16(),
        message,
    })
}
