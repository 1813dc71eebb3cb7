//! Bounds the context sent upstream by dropping stale screenshots.

use computer_use_shared::{ToolInvocation, UiMessage, UiPart};
use serde_json::Value;

pub const SCREENSHOT_PLACEHOLDER: &str = "[screenshot omitted]";

fn is_image(invocation: &ToolInvocation) -> bool {
    invocation
        .result
        .as_ref()
        .and_then(|result| result.get("type"))
        .and_then(Value::as_str)
        == Some("image")
}

/// Replace every screenshot result except the most recent one with a short
/// placeholder. All other content passes through untouched.
pub fn prune_messages(mut messages: Vec<UiMessage>) -> Vec<UiMessage> {
    let mut seen_latest = false;

    for message in messages.iter_mut().rev() {
        for part in message.parts.iter_mut().rev() {
            let UiPart::ToolInvocation { tool_invocation } = part else {
                continue;
            };
            if !is_image(tool_invocation) {
                continue;
            }
            if seen_latest {
                tool_invocation.result = Some(Value::String(SCREENSHOT_PLACEHOLDER.to_string()));
            } else {
                seen_latest = true;
            }
        }
    }

    messages
}

#[cfg(test)]
mod tests {
    use super::*;
    use computer_use_shared::{MessageRole, ToolInvocationState};
    use serde_json::json;

    fn screenshot(id: &str) -> UiPart {
        UiPart::ToolInvocation {
            tool_invocation: ToolInvocation {
                state: ToolInvocationState::Result,
                tool_call_id: id.to_string(),
                tool_name: "computer".to_string(),
                args: json!({ "action": "screenshot" }),
                result: Some(json!({ "type": "image", "data": format!("png-{id}") })),
            },
        }
    }

    fn assistant(parts: Vec<UiPart>) -> UiMessage {
        UiMessage {
            id: None,
            role: MessageRole::Assistant,
            content: String::new(),
            parts,
        }
    }

    fn result_of(message: &UiMessage, index: usize) -> Value {
        match &message.parts[index] {
            UiPart::ToolInvocation { tool_invocation } => tool_invocation.result.clone().unwrap(),
            other => panic!("not a tool invocation: {other:?}"),
        }
    }

    #[test]
    fn keeps_only_latest_screenshot() {
        let pruned = prune_messages(vec![
            assistant(vec![screenshot("a"), screenshot("b")]),
            assistant(vec![
                UiPart::Text {
                    text: "done".into(),
                },
                screenshot("c"),
            ]),
        ]);

        assert_eq!(result_of(&pruned[0], 0), json!(SCREENSHOT_PLACEHOLDER));
        assert_eq!(result_of(&pruned[0], 1), json!(SCREENSHOT_PLACEHOLDER));
        assert_eq!(result_of(&pruned[1], 1)["data"], "png-c");
    }

    #[test]
    fn text_results_are_untouched() {
        let bash = UiPart::ToolInvocation {
            tool_invocation: ToolInvocation {
                state: ToolInvocationState::Result,
                tool_call_id: "t1".into(),
                tool_name: "bash".into(),
                args: json!({ "command": "pwd" }),
                result: Some(json!("/home/user")),
            },
        };
        let pruned = prune_messages(vec![assistant(vec![bash, screenshot("s")])]);
        assert_eq!(result_of(&pruned[0], 0), json!("/home/user"));
        assert_eq!(result_of(&pruned[0], 1)["type"], "image");
    }
}
