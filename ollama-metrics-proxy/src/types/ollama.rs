//! Ollama API types.
//!
//! Based on the official Ollama API documentation:
//! https://github.com/ollama/ollama/blob/main/docs/api.md

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// The two fields the proxy needs from a native request.
///
/// Native bodies are forwarded byte for byte, so only these are decoded.
#[derive(Debug, Clone, Deserialize)]
pub struct RequestHead {
    pub model: String,

    /// Ollama streams unless told otherwise
    #[serde(default)]
    pub stream: Option<bool>,
}

impl RequestHead {
    pub fn is_streaming(&self) -> bool {
        self.stream.unwrap_or(true)
    }
}

/// Request body for POST /api/generate
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GenerateRequest {
    /// Model name (required)
    pub model: String,

    /// The prompt to generate a response for
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,

    /// Text after the model response
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suffix: Option<String>,

    /// Format of the response: "json" or JSON schema
    #[serde(skip_serializing_if = "Option::is_none")]
    pub format: Option<serde_json::Value>,

    /// Model-specific options
    #[serde(skip_serializing_if = "Option::is_none")]
    pub options: Option<ModelOptions>,

    /// System prompt
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,

    /// Enable streaming (default: true)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,

    /// Disable prompt formatting
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw: Option<bool>,

    /// How long to keep model loaded (e.g. "5m" or a number of seconds)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub keep_alive: Option<serde_json::Value>,
}

/// Response from POST /api/generate
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GenerateResponse {
    /// Model name
    #[serde(default)]
    pub model: String,

    /// Timestamp
    #[serde(default)]
    pub created_at: String,

    /// Generated text (streaming: partial, final: complete)
    #[serde(default)]
    pub response: String,

    /// Whether generation is complete
    #[serde(default)]
    pub done: bool,

    /// Reason for completion
    #[serde(skip_serializing_if = "Option::is_none")]
    pub done_reason: Option<String>,

    #[serde(flatten)]
    pub timings: Timings,
}

/// Request body for POST /api/chat
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChatRequest {
    /// Model name (required)
    pub model: String,

    /// Chat messages
    pub messages: Vec<Message>,

    /// Format of the response
    #[serde(skip_serializing_if = "Option::is_none")]
    pub format: Option<serde_json::Value>,

    /// Model-specific options
    #[serde(skip_serializing_if = "Option::is_none")]
    pub options: Option<ModelOptions>,

    /// Enable streaming (default: true)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,

    /// How long to keep model loaded
    #[serde(skip_serializing_if = "Option::is_none")]
    pub keep_alive: Option<serde_json::Value>,

    /// Tools available to the model (for function calling)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<Tool>>,
}

/// Response from POST /api/chat
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChatResponse {
    /// Model name
    #[serde(default)]
    pub model: String,

    /// Timestamp
    #[serde(default)]
    pub created_at: String,

    /// The assistant's message
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<Message>,

    /// Whether generation is complete
    #[serde(default)]
    pub done: bool,

    /// Reason for completion
    #[serde(skip_serializing_if = "Option::is_none")]
    pub done_reason: Option<String>,

    #[serde(flatten)]
    pub timings: Timings,
}

/// Counters and durations Ollama attaches to the final chunk.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timings {
    /// Total generation time in nanoseconds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_duration: Option<u64>,

    /// Time loading the model in nanoseconds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub load_duration: Option<u64>,

    /// Number of tokens in the prompt
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt_eval_count: Option<u32>,

    /// Time evaluating the prompt in nanoseconds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt_eval_duration: Option<u64>,

    /// Number of tokens in the response
    #[serde(skip_serializing_if = "Option::is_none")]
    pub eval_count: Option<u32>,

    /// Time generating the response in nanoseconds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub eval_duration: Option<u64>,
}

impl Timings {
    pub fn stats(&self) -> EvalStats {
        EvalStats {
            prompt_tokens: self.prompt_eval_count.unwrap_or(0),
            completion_tokens: self.eval_count.unwrap_or(0),
            eval_duration: Duration::from_nanos(self.eval_duration.unwrap_or(0)),
            load_duration: self.load_duration.map(Duration::from_nanos),
        }
    }
}

/// Authoritative generation statistics.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct EvalStats {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub eval_duration: Duration,
    pub load_duration: Option<Duration>,
}

impl EvalStats {
    /// Generated tokens per second; 0 when no generation time was reported.
    pub fn tokens_per_second(&self) -> f64 {
        let secs = self.eval_duration.as_secs_f64();
        if secs > 0.0 {
            self.completion_tokens as f64 / secs
        } else {
            0.0
        }
    }

    pub fn total_tokens(&self) -> u32 {
        self.prompt_tokens + self.completion_tokens
    }
}

/// One line of a native stream, from either /api/generate or /api/chat.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StreamChunk {
    #[serde(default)]
    pub model: String,

    /// Text fragment on /api/generate
    #[serde(default)]
    pub response: Option<String>,

    /// Message fragment on /api/chat
    #[serde(default)]
    pub message: Option<Message>,

    #[serde(default)]
    pub done: bool,

    #[serde(default)]
    pub done_reason: Option<String>,

    /// In-band error reported mid-stream
    #[serde(default)]
    pub error: Option<String>,

    #[serde(flatten)]
    pub timings: Timings,
}

impl StreamChunk {
    /// Generated text carried by this chunk.
    pub fn content(&self) -> &str {
        match (&self.response, &self.message) {
            (Some(text), _) => text,
            (None, Some(message)) => &message.content,
            (None, None) => "",
        }
    }

    pub fn tool_calls(&self) -> Option<&[ToolCall]> {
        self.message.as_ref()?.tool_calls.as_deref().filter(|c| !c.is_empty())
    }
}

/// Chat message
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Message {
    /// Role: "system", "user", "assistant", or "tool"
    pub role: String,

    /// Message content
    #[serde(default)]
    pub content: String,

    /// Images for multimodal (base64)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub images: Option<Vec<String>>,

    /// Tool calls made by the assistant
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
}

/// Tool definition for function calling
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tool {
    /// Type of tool (always "function")
    #[serde(rename = "type")]
    pub tool_type: String,

    /// Function definition
    pub function: FunctionDefinition,
}

/// Function definition within a tool
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionDefinition {
    pub name: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// JSON Schema for the function parameters
    pub parameters: serde_json::Value,
}

/// Tool call made by the model
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub function: FunctionCall,
}

/// Function call within a tool call
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionCall {
    pub name: String,

    /// Arguments as JSON object
    pub arguments: serde_json::Value,
}

/// Model-specific options
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelOptions {
    /// Number of tokens to predict (-1 for infinite, -2 for fill context)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub num_predict: Option<i32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,

    /// Seed for reproducibility
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seed: Option<i64>,

    /// Stop sequences
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop: Option<Vec<String>>,
}

impl ModelOptions {
    pub fn is_empty(&self) -> bool {
        *self == ModelOptions::default()
    }
}

/// Response from GET /api/tags
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TagsResponse {
    pub models: Vec<ModelInfo>,
}

/// Model information
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelInfo {
    pub name: String,

    #[serde(default)]
    pub modified_at: String,

    #[serde(default)]
    pub size: u64,

    #[serde(default)]
    pub digest: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<ModelDetails>,
}

/// Model details
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelDetails {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,

    /// Model family (e.g., "llama", "mistral")
    #[serde(skip_serializing_if = "Option::is_none")]
    pub family: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub parameter_size: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub quantization_level: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_head_defaults_to_streaming() {
        let head: RequestHead = serde_json::from_str(r#"{"model":"llama2","prompt":"hi"}"#).unwrap();
        assert!(head.is_streaming());

        let head: RequestHead =
            serde_json::from_str(r#"{"model":"llama2","stream":false,"keep_alive":0}"#).unwrap();
        assert!(!head.is_streaming());
    }

    #[test]
    fn test_tokens_per_second() {
        let stats = EvalStats {
            completion_tokens: 150,
            eval_duration: Duration::from_secs(3),
            ..Default::default()
        };
        assert_eq!(stats.tokens_per_second(), 50.0);
    }

    #[test]
    fn test_tokens_per_second_zero_duration() {
        let stats = EvalStats { completion_tokens: 150, ..Default::default() };
        let tps = stats.tokens_per_second();
        assert_eq!(tps, 0.0);
        assert!(tps.is_finite());
    }

    #[test]
    fn test_stream_chunk_content() {
        let generate: StreamChunk =
            serde_json::from_str(r#"{"model":"m","response":"Hel","done":false}"#).unwrap();
        assert_eq!(generate.content(), "Hel");

        let chat: StreamChunk = serde_json::from_str(
            r#"{"model":"m","message":{"role":"assistant","content":"lo"},"done":false}"#,
        )
        .unwrap();
        assert_eq!(chat.content(), "lo");
    }

    #[test]
    fn test_final_chunk_stats() {
        let chunk: StreamChunk = serde_json::from_str(
            r#"{"model":"m","response":"","done":true,"prompt_eval_count":8,
                "eval_count":7,"eval_duration":3500000000,"load_duration":1000000}"#,
        )
        .unwrap();
        let stats = chunk.timings.stats();
        assert!(chunk.done);
        assert_eq!(stats.prompt_tokens, 8);
        assert_eq!(stats.completion_tokens, 7);
        assert_eq!(stats.total_tokens(), 15);
        assert_eq!(stats.tokens_per_second(), 2.0);
        assert_eq!(stats.load_duration, Some(Duration::from_millis(1)));
    }

    #[test]
    fn test_empty_options_skipped() {
        let request = ChatRequest { model: "m".into(), ..Default::default() };
        let json = serde_json::to_value(&request).unwrap();
        assert!(json.get("options").is_none());
        assert!(ModelOptions::default().is_empty());
    }
}
