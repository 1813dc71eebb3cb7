//! The two tools the model may call, each bound to one sandbox.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use crate::config::DisplaySize;
use crate::error::ToolError;
use crate::sandbox::{DesktopAction, MouseButton, SandboxService, ScrollDirection};

pub const COMPUTER_TOOL: &str = "computer";
pub const BASH_TOOL: &str = "bash";

const MAX_WAIT_SECS: f64 = 10.0;

#[derive(Debug, Clone, PartialEq)]
pub enum ToolOutput {
    Text(String),
    /// Base64-encoded PNG.
    Image { data: String },
}

impl ToolOutput {
    /// Shape reported to the UI as the invocation result.
    pub fn to_ui_value(&self) -> Value {
        match self {
            Self::Text(text) => Value::String(text.clone()),
            Self::Image { data } => json!({ "type": "image", "data": data }),
        }
    }
}

#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &'static str;

    /// Tool definition in the provider's request format.
    fn definition(&self) -> Value;

    async fn execute(&self, input: Value) -> Result<ToolOutput, ToolError>;
}

/// The tools registered for one request.
pub struct Toolset {
    tools: Vec<Box<dyn Tool>>,
}

impl Toolset {
    pub fn for_sandbox(
        sandbox: Arc<dyn SandboxService>,
        sandbox_id: &str,
        display: DisplaySize,
    ) -> Self {
        Self {
            tools: vec![
                Box::new(ComputerTool {
                    sandbox: sandbox.clone(),
                    sandbox_id: sandbox_id.to_string(),
                    display,
                }),
                Box::new(BashTool {
                    sandbox,
                    sandbox_id: sandbox_id.to_string(),
                }),
            ],
        }
    }

    pub fn definitions(&self) -> Vec<Value> {
        self.tools.iter().map(|tool| tool.definition()).collect()
    }

    pub async fn execute(&self, name: &str, input: Value) -> Result<ToolOutput, ToolError> {
        let tool = self
            .tools
            .iter()
            .find(|tool| tool.name() == name)
            .ok_or_else(|| ToolError::Unknown(name.to_string()))?;
        tool.execute(input).await
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
enum ComputerAction {
    Screenshot,
    Wait {
        #[serde(default)]
        duration: Option<f64>,
    },
    LeftClick {
        coordinate: [u32; 2],
    },
    RightClick {
        coordinate: [u32; 2],
    },
    MiddleClick {
        coordinate: [u32; 2],
    },
    DoubleClick {
        coordinate: [u32; 2],
    },
    MouseMove {
        coordinate: [u32; 2],
    },
    LeftClickDrag {
        start_coordinate: [u32; 2],
        coordinate: [u32; 2],
    },
    Type {
        text: String,
    },
    Key {
        text: String,
    },
    Scroll {
        coordinate: [u32; 2],
        scroll_direction: ScrollDirection,
        #[serde(default = "default_scroll_amount")]
        scroll_amount: u32,
    },
}

fn default_scroll_amount() -> u32 {
    3
}

pub struct ComputerTool {
    sandbox: Arc<dyn SandboxService>,
    sandbox_id: String,
    display: DisplaySize,
}

impl ComputerTool {
    async fn click(
        &self,
        [x, y]: [u32; 2],
        button: MouseButton,
        count: u8,
        label: &str,
    ) -> Result<ToolOutput, ToolError> {
        self.sandbox
            .perform(&self.sandbox_id, &DesktopAction::Click { x, y, button, count })
            .await?;
        Ok(ToolOutput::Text(format!("{label} at {x}, {y}")))
    }
}

#[async_trait]
impl Tool for ComputerTool {
    fn name(&self) -> &'static str {
        COMPUTER_TOOL
    }

    fn definition(&self) -> Value {
        json!({
            "type": "computer_20250124",
            "name": COMPUTER_TOOL,
            "display_width_px": self.display.width,
            "display_height_px": self.display.height,
            "display_number": 1,
        })
    }

    async fn execute(&self, input: Value) -> Result<ToolOutput, ToolError> {
        let action: ComputerAction =
            serde_json::from_value(input).map_err(|e| ToolError::InvalidInput {
                name: COMPUTER_TOOL.to_string(),
                reason: e.to_string(),
            })?;
        debug!("computer action on {}: {:?}", self.sandbox_id, action);

        match action {
            ComputerAction::Screenshot => {
                let png = self.sandbox.screenshot(&self.sandbox_id).await?;
                Ok(ToolOutput::Image {
                    data: STANDARD.encode(png),
                })
            }
            ComputerAction::Wait { duration } => {
                let secs = duration.unwrap_or(1.0).clamp(0.0, MAX_WAIT_SECS);
                tokio::time::sleep(Duration::from_secs_f64(secs)).await;
                Ok(ToolOutput::Text(format!("Waited for {secs} seconds")))
            }
            ComputerAction::LeftClick { coordinate } => {
                self.click(coordinate, MouseButton::Left, 1, "Left clicked").await
            }
            ComputerAction::RightClick { coordinate } => {
                self.click(coordinate, MouseButton::Right, 1, "Right clicked").await
            }
            ComputerAction::MiddleClick { coordinate } => {
                self.click(coordinate, MouseButton::Middle, 1, "Middle clicked").await
            }
            ComputerAction::DoubleClick { coordinate } => {
                self.click(coordinate, MouseButton::Left, 2, "Double clicked").await
            }
            ComputerAction::MouseMove { coordinate: [x, y] } => {
                self.sandbox
                    .perform(&self.sandbox_id, &DesktopAction::MoveMouse { x, y })
                    .await?;
                Ok(ToolOutput::Text(format!("Moved mouse to {x}, {y}")))
            }
            ComputerAction::LeftClickDrag {
                start_coordinate,
                coordinate,
            } => {
                let action = DesktopAction::Drag {
                    from: start_coordinate,
                    to: coordinate,
                };
                self.sandbox.perform(&self.sandbox_id, &action).await?;
                Ok(ToolOutput::Text(format!(
                    "Dragged from {}, {} to {}, {}",
                    start_coordinate[0], start_coordinate[1], coordinate[0], coordinate[1]
                )))
            }
            ComputerAction::Type { text } => {
                self.sandbox
                    .perform(&self.sandbox_id, &DesktopAction::Write { text: text.clone() })
                    .await?;
                Ok(ToolOutput::Text(format!("Typed: {text}")))
            }
            ComputerAction::Key { text } => {
                let keys = text
                    .split('+')
                    .map(|k| k.trim().to_string())
                    .filter(|k| !k.is_empty())
                    .collect::<Vec<_>>();
                if keys.is_empty() {
                    return Err(ToolError::InvalidInput {
                        name: COMPUTER_TOOL.to_string(),
                        reason: "key action needs at least one key".to_string(),
                    });
                }
                self.sandbox
                    .perform(&self.sandbox_id, &DesktopAction::Press { keys })
                    .await?;
                Ok(ToolOutput::Text(format!("Pressed key: {text}")))
            }
            ComputerAction::Scroll {
                coordinate: [x, y],
                scroll_direction,
                scroll_amount,
            } => {
                let action = DesktopAction::Scroll {
                    x,
                    y,
                    direction: scroll_direction,
                    amount: scroll_amount,
                };
                self.sandbox.perform(&self.sandbox_id, &action).await?;
                let direction = match scroll_direction {
                    ScrollDirection::Up => "up",
                    ScrollDirection::Down => "down",
                    ScrollDirection::Left => "left",
                    ScrollDirection::Right => "right",
                };
                Ok(ToolOutput::Text(format!(
                    "Scrolled {direction} by {scroll_amount} at {x}, {y}"
                )))
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct BashInput {
    command: String,
}

pub struct BashTool {
    sandbox: Arc<dyn SandboxService>,
    sandbox_id: String,
}

#[async_trait]
impl Tool for BashTool {
    fn name(&self) -> &'static str {
        BASH_TOOL
    }

    fn definition(&self) -> Value {
        json!({ "type": "bash_20250124", "name": BASH_TOOL })
    }

    async fn execute(&self, input: Value) -> Result<ToolOutput, ToolError> {
        let BashInput { command } =
            serde_json::from_value(input).map_err(|e| ToolError::InvalidInput {
                name: BASH_TOOL.to_string(),
                reason: e.to_string(),
            })?;

        let output = self.sandbox.run_command(&self.sandbox_id, &command).await?;
        let mut text = if !output.stdout.is_empty() {
            output.stdout
        } else if !output.stderr.is_empty() {
            output.stderr
        } else {
            "(no output)".to_string()
        };
        if output.exit_code != 0 {
            text.push_str(&format!("\n(exit code {})", output.exit_code));
        }
        Ok(ToolOutput::Text(text))
    }
}
