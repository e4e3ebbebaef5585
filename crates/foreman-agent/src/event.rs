use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A single NDJSON message emitted by Claude Code (`--output-format stream-json`).
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    /// First message on stream: session initialisation.
    System(SystemEvent),

    /// An assistant turn (text or tool calls).
    Assistant(AssistantEvent),

    /// A user turn (tool results injected back into the conversation).
    User(UserEvent),

    /// Final result message, emitted once at the end of the stream.
    Result(ResultEvent),

    /// Any message type not explicitly handled above.
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SystemEvent {
    pub subtype: Option<String>,
    pub session_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AssistantEvent {
    pub message: Option<AssistantMessage>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AssistantMessage {
    pub role: Option<String>,
    pub content: Option<Vec<ContentBlock>>,
    pub model: Option<String>,
    pub stop_reason: Option<String>,
    pub usage: Option<Usage>,
}

/// A single content block inside an assistant or user message.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    /// Plain text output.
    Text { text: String },

    /// A tool invocation by the agent.
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },

    /// Result returned by a tool (appears in user turn).
    ToolResult {
        tool_use_id: String,
        content: Option<Value>,
        is_error: Option<bool>,
    },

    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct UserEvent {
    pub message: Option<UserMessage>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct UserMessage {
    pub role: Option<String>,
    pub content: Option<Vec<ContentBlock>>,
}

/// Final result event, emitted once when the agent finishes.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ResultEvent {
    pub subtype: Option<String>,
    /// Textual output (may be empty if last turn was a tool call).
    pub result: Option<String>,
    pub session_id: Option<String>,
    pub is_error: Option<bool>,
    pub cost_usd: Option<f64>,
    pub duration_ms: Option<u64>,
    pub num_turns: Option<u64>,
    pub usage: Option<Usage>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Usage {
    pub input_tokens: Option<u64>,
    pub output_tokens: Option<u64>,
    pub cache_read_input_tokens: Option<u64>,
    pub cache_creation_input_tokens: Option<u64>,
}

/// Everything worth keeping from a full NDJSON stream.
#[derive(Debug, Clone, Default)]
pub struct ParsedStream {
    /// Text of the final result event, if any.
    pub result_text: String,
    /// All assistant text blocks in order, newline-joined.
    pub assistant_text: String,
    pub session_id: Option<String>,
    pub total_input_tokens: u64,
    pub total_output_tokens: u64,
}

impl ParsedStream {
    /// Assistant narration plus the final result: the text runners scan for
    /// sentinels and summaries.
    pub fn full_text(&self) -> String {
        match (self.assistant_text.is_empty(), self.result_text.is_empty()) {
            (true, true) => String::new(),
            (true, false) => self.result_text.clone(),
            (false, true) => self.assistant_text.clone(),
            (false, false) => {
                if self.assistant_text.ends_with(&self.result_text) {
                    self.assistant_text.clone()
                } else {
                    format!("{}\n{}", self.assistant_text, self.result_text)
                }
            }
        }
    }
}

/// Parse a full NDJSON stream. Unparseable lines are skipped: partial or
/// interleaved output must never poison the whole stream.
pub fn parse_stream(data: &str) -> ParsedStream {
    let mut parsed = ParsedStream::default();
    let mut assistant_parts: Vec<String> = Vec::new();

    for line in data.lines() {
        if line.is_empty() {
            continue;
        }
        let event: AgentEvent = match serde_json::from_str(line) {
            Ok(e) => e,
            Err(_) => continue,
        };
        match event {
            AgentEvent::System(e) => {
                if let Some(sid) = e.session_id {
                    parsed.session_id = Some(sid);
                }
            }
            AgentEvent::Assistant(e) => {
                if let Some(msg) = e.message {
                    if let Some(usage) = &msg.usage {
                        parsed.total_input_tokens += usage.input_tokens.unwrap_or(0);
                        parsed.total_output_tokens += usage.output_tokens.unwrap_or(0);
                    }
                    if let Some(blocks) = msg.content {
                        for block in blocks {
                            if let ContentBlock::Text { text } = block {
                                assistant_parts.push(text);
                            }
                        }
                    }
                }
            }
            AgentEvent::Result(e) => {
                if let Some(sid) = e.session_id {
                    parsed.session_id = Some(sid);
                }
                if let Some(usage) = &e.usage {
                    parsed.total_input_tokens =
                        parsed.total_input_tokens.max(usage.input_tokens.unwrap_or(0));
                    parsed.total_output_tokens =
                        parsed.total_output_tokens.max(usage.output_tokens.unwrap_or(0));
                }
                if let Some(text) = e.result {
                    parsed.result_text = text;
                }
            }
            _ => {}
        }
    }

    parsed.assistant_text = assistant_parts.join("\n");
    parsed
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_stream_extracts_result_and_session() {
        let data = r#"{"type":"system","subtype":"init","session_id":"sess-1"}
{"type":"assistant","message":{"role":"assistant","content":[{"type":"text","text":"Working on it."}]}}
{"type":"result","subtype":"success","result":"All done.","session_id":"sess-1"}"#;
        let parsed = parse_stream(data);
        assert_eq!(parsed.result_text, "All done.");
        assert_eq!(parsed.assistant_text, "Working on it.");
        assert_eq!(parsed.session_id.as_deref(), Some("sess-1"));
        assert_eq!(parsed.full_text(), "Working on it.\nAll done.");
    }

    #[test]
    fn test_parse_stream_skips_garbage_lines() {
        let data = "not json\n{\"type\":\"result\",\"result\":\"ok\"}\n{broken";
        let parsed = parse_stream(data);
        assert_eq!(parsed.result_text, "ok");
    }

    #[test]
    fn test_parse_stream_accumulates_usage() {
        let data = r#"{"type":"assistant","message":{"usage":{"input_tokens":100,"output_tokens":50}}}
{"type":"assistant","message":{"usage":{"input_tokens":200,"output_tokens":75}}}"#;
        let parsed = parse_stream(data);
        assert_eq!(parsed.total_input_tokens, 300);
        assert_eq!(parsed.total_output_tokens, 125);
    }

    #[test]
    fn test_full_text_falls_back_to_either_side() {
        let only_result = parse_stream(r#"{"type":"result","result":"done"}"#);
        assert_eq!(only_result.full_text(), "done");

        let only_assistant = parse_stream(
            r#"{"type":"assistant","message":{"content":[{"type":"text","text":"hi"}]}}"#,
        );
        assert_eq!(only_assistant.full_text(), "hi");

        assert_eq!(parse_stream("").full_text(), "");
    }

    #[test]
    fn test_unknown_event_types_are_tolerated() {
        let data = r#"{"type":"tool_progress","pct":50}
{"type":"result","result":"fine"}"#;
        let parsed = parse_stream(data);
        assert_eq!(parsed.result_text, "fine");
    }
}
