//! Conversion layer between OpenAI and Ollama API formats.
//!
//! This module handles bidirectional conversion so OpenAI-compatible clients
//! can work with an Ollama backend. Zero or unset sampling values are left
//! out of the native request so Ollama applies its own defaults.

use std::collections::HashMap;

use tracing::{debug, warn};
use uuid::Uuid;

use crate::types::ollama::{self, EvalStats};
use crate::types::openai;

/// Built-in aliases from OpenAI model names to local models.
const DEFAULT_ALIASES: &[(&str, &str)] = &[
    ("gpt-4", "llama2:70b"),
    ("gpt-4-turbo", "llama2:70b"),
    ("gpt-3.5-turbo", "llama2:13b"),
    ("gpt-3.5-turbo-16k", "llama2:13b"),
    ("text-davinci-003", "llama2:7b"),
    ("text-davinci-002", "llama2:7b"),
    ("code-davinci-002", "codellama:7b"),
    ("text-embedding-ada-002", "nomic-embed-text"),
];

/// Immutable model-name mapping built once at startup.
#[derive(Debug, Clone)]
pub struct ModelAliases {
    map: HashMap<String, String>,
}

impl Default for ModelAliases {
    fn default() -> Self {
        Self {
            map: DEFAULT_ALIASES
                .iter()
                .map(|(from, to)| (from.to_string(), to.to_string()))
                .collect(),
        }
    }
}

impl ModelAliases {
    /// Defaults overridden by `name=alias` pairs separated by commas.
    ///
    /// Malformed entries are skipped with a warning.
    pub fn with_overrides(entries: &str) -> Self {
        let mut aliases = Self::default();
        for entry in entries.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            match entry.split_once('=') {
                Some((from, to)) if !from.trim().is_empty() && !to.trim().is_empty() => {
                    aliases.map.insert(from.trim().to_string(), to.trim().to_string());
                }
                _ => warn!(entry = %entry, "Ignoring malformed model alias"),
            }
        }
        aliases
    }

    /// Local model for `name`; unknown names pass through unchanged.
    pub fn resolve(&self, name: &str) -> String {
        self.map.get(name).cloned().unwrap_or_else(|| name.to_string())
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

/// Native sampling options with zero/unset values omitted.
pub fn build_options(
    temperature: Option<f32>,
    top_p: Option<f32>,
    max_tokens: Option<u32>,
    stop: Option<openai::StopSequences>,
    seed: Option<i64>,
) -> Option<ollama::ModelOptions> {
    let options = ollama::ModelOptions {
        num_predict: max_tokens
            .filter(|n| *n > 0)
            .map(|n| i32::try_from(n).unwrap_or(i32::MAX)),
        temperature: temperature.filter(|t| *t > 0.0),
        top_p: top_p.filter(|p| *p > 0.0),
        seed: seed.filter(|s| *s != 0),
        stop: stop.map(openai::StopSequences::into_vec).filter(|s| !s.is_empty()),
    };

    (!options.is_empty()).then_some(options)
}

/// Convert an OpenAI chat request to an Ollama chat request
pub fn chat_request_to_native(
    request: openai::ChatCompletionRequest,
    aliases: &ModelAliases,
) -> ollama::ChatRequest {
    let model = aliases.resolve(&request.model);
    debug!(
        requested = %request.model,
        model = %model,
        messages = request.messages.len(),
        "Converting chat request to Ollama format"
    );

    ollama::ChatRequest {
        model,
        messages: request.messages.iter().map(convert_message_to_ollama).collect(),
        format: request.response_format.as_ref().and_then(|rf| {
            (rf.format_type == "json_object").then(|| serde_json::json!("json"))
        }),
        options: build_options(
            request.temperature,
            request.top_p,
            request.max_tokens,
            request.stop,
            request.seed,
        ),
        stream: Some(request.stream),
        keep_alive: None,
        tools: request
            .tools
            .as_ref()
            .map(|tools| tools.iter().map(convert_tool_to_ollama).collect()),
    }
}

/// Convert an OpenAI completion request to an Ollama generate request
pub fn completion_request_to_native(
    request: openai::CompletionRequest,
    aliases: &ModelAliases,
) -> ollama::GenerateRequest {
    let model = aliases.resolve(&request.model);
    debug!(requested = %request.model, model = %model, "Converting completion request to Ollama format");

    ollama::GenerateRequest {
        model,
        prompt: Some(request.prompt.first().to_string()),
        suffix: request.suffix.filter(|s| !s.is_empty()),
        options: build_options(
            request.temperature,
            request.top_p,
            request.max_tokens,
            request.stop,
            request.seed,
        ),
        stream: Some(request.stream),
        ..Default::default()
    }
}

/// Convert a single message from OpenAI to Ollama format
fn convert_message_to_ollama(msg: &openai::ChatMessage) -> ollama::Message {
    ollama::Message {
        role: msg.role.to_string(),
        content: msg.content.as_ref().map(|c| c.to_text()).unwrap_or_default(),
        images: None,
        tool_calls: msg
            .tool_calls
            .as_ref()
            .map(|calls| calls.iter().map(convert_tool_call_to_ollama).collect()),
    }
}

/// Convert tool definition from OpenAI to Ollama format
fn convert_tool_to_ollama(tool: &openai::Tool) -> ollama::Tool {
    ollama::Tool {
        tool_type: tool.tool_type.clone(),
        function: ollama::FunctionDefinition {
            name: tool.function.name.clone(),
            description: tool.function.description.clone(),
            parameters: tool.function.parameters.clone(),
        },
    }
}

/// Convert tool call from OpenAI to Ollama format
fn convert_tool_call_to_ollama(call: &openai::ToolCall) -> ollama::ToolCall {
    // Arguments arrive as a JSON string
    let arguments =
        serde_json::from_str(&call.function.arguments).unwrap_or_else(|_| serde_json::json!({}));

    ollama::ToolCall {
        function: ollama::FunctionCall { name: call.function.name.clone(), arguments },
    }
}

/// Convert tool calls from Ollama to OpenAI format
pub(crate) fn convert_tool_calls_to_openai(calls: &[ollama::ToolCall]) -> Vec<openai::ToolCall> {
    calls
        .iter()
        .map(|call| openai::ToolCall {
            id: format!("call_{}", &Uuid::new_v4().simple().to_string()[..24]),
            call_type: "function".to_string(),
            function: openai::FunctionCall {
                name: call.function.name.clone(),
                arguments: serde_json::to_string(&call.function.arguments).unwrap_or_default(),
            },
        })
        .collect()
}

/// OpenAI finish reason for a native `done_reason`.
pub fn finish_reason(done_reason: Option<&str>) -> &'static str {
    match done_reason {
        Some("length") => "length",
        _ => "stop",
    }
}

pub fn usage(stats: &EvalStats) -> openai::Usage {
    openai::Usage {
        prompt_tokens: stats.prompt_tokens,
        completion_tokens: stats.completion_tokens,
        total_tokens: stats.total_tokens(),
    }
}

/// Current Unix time in seconds.
pub fn unix_now() -> u64 {
    chrono::Utc::now().timestamp().max(0) as u64
}

/// Convert a buffered Ollama chat response to an OpenAI chat completion
pub fn chat_response_to_compatible(
    response: &ollama::ChatResponse,
    id: &str,
    model: &str,
) -> openai::ChatCompletionResponse {
    let message = response.message.as_ref();
    let tool_calls = message
        .and_then(|m| m.tool_calls.as_deref())
        .filter(|calls| !calls.is_empty())
        .map(convert_tool_calls_to_openai);

    let finish = if tool_calls.is_some() {
        "tool_calls"
    } else {
        finish_reason(response.done_reason.as_deref())
    };

    let content = message.map(|m| m.content.clone()).unwrap_or_default();
    let stats = response.timings.stats();

    openai::ChatCompletionResponse {
        id: id.to_string(),
        object: "chat.completion".to_string(),
        created: unix_now(),
        model: model.to_string(),
        choices: vec![openai::Choice {
            index: 0,
            message: openai::ChatMessage {
                role: openai::Role::Assistant,
                content: if content.is_empty() && tool_calls.is_some() {
                    None
                } else {
                    Some(content.into())
                },
                name: None,
                tool_calls,
                tool_call_id: None,
            },
            finish_reason: Some(finish.to_string()),
        }],
        usage: usage(&stats),
    }
}

/// Convert a buffered Ollama generate response to an OpenAI text completion
pub fn generate_response_to_completion(
    response: &ollama::GenerateResponse,
    id: &str,
    model: &str,
) -> openai::CompletionResponse {
    let stats = response.timings.stats();

    openai::CompletionResponse {
        id: id.to_string(),
        object: "text_completion".to_string(),
        created: unix_now(),
        model: model.to_string(),
        choices: vec![openai::CompletionChoice {
            text: response.response.clone(),
            index: 0,
            logprobs: None,
            finish_reason: Some(finish_reason(response.done_reason.as_deref()).to_string()),
        }],
        usage: Some(usage(&stats)),
    }
}

/// Convert the Ollama model list to the OpenAI model list
pub fn tags_to_models(tags: ollama::TagsResponse) -> openai::ModelsResponse {
    let data = tags
        .models
        .into_iter()
        .map(|m| openai::Model {
            created: chrono::DateTime::parse_from_rfc3339(&m.modified_at)
                .map(|dt| dt.timestamp().max(0) as u64)
                .unwrap_or(0),
            owned_by: m
                .details
                .and_then(|d| d.family)
                .unwrap_or_else(|| "ollama".to_string()),
            id: m.name,
            object: "model".to_string(),
        })
        .collect();

    openai::ModelsResponse { object: "list".to_string(), data }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chat_request(json: serde_json::Value) -> openai::ChatCompletionRequest {
        serde_json::from_value(json).unwrap()
    }

    #[test]
    fn test_alias_resolution() {
        let aliases = ModelAliases::default();
        assert_eq!(aliases.resolve("gpt-3.5-turbo"), "llama2:13b");
        assert_eq!(aliases.resolve("gpt-4"), "llama2:70b");
        assert_eq!(aliases.resolve("mistral:7b"), "mistral:7b");
        assert_eq!(aliases.len(), 8);
    }

    #[test]
    fn test_alias_overrides() {
        let aliases = ModelAliases::with_overrides("gpt-4=llama3:70b, my-model = phi3 ,broken");
        assert_eq!(aliases.resolve("gpt-4"), "llama3:70b");
        assert_eq!(aliases.resolve("my-model"), "phi3");
        assert_eq!(aliases.resolve("gpt-3.5-turbo"), "llama2:13b");
        assert_eq!(aliases.resolve("broken"), "broken");
    }

    #[test]
    fn test_chat_request_translation() {
        let request = chat_request(serde_json::json!({
            "model": "gpt-3.5-turbo",
            "messages": [
                {"role": "system", "content": "Be brief."},
                {"role": "user", "content": "Hello!"}
            ],
            "temperature": 0.7,
            "max_tokens": 100,
            "stop": ["\n\n"],
            "seed": 42,
            "stream": true
        }));

        let native = chat_request_to_native(request, &ModelAliases::default());
        assert_eq!(native.model, "llama2:13b");
        assert_eq!(native.messages.len(), 2);
        assert_eq!(native.messages[0].role, "system");
        assert_eq!(native.messages[1].content, "Hello!");
        assert_eq!(native.stream, Some(true));

        let options = native.options.unwrap();
        assert_eq!(options.temperature, Some(0.7));
        assert_eq!(options.num_predict, Some(100));
        assert_eq!(options.stop, Some(vec!["\n\n".to_string()]));
        assert_eq!(options.seed, Some(42));
        assert_eq!(options.top_p, None);
    }

    #[test]
    fn test_zero_values_omitted() {
        let request = chat_request(serde_json::json!({
            "model": "llama2",
            "messages": [{"role": "user", "content": "hi"}],
            "temperature": 0.0,
            "top_p": 0.0,
            "max_tokens": 0,
            "seed": 0
        }));

        let native = chat_request_to_native(request, &ModelAliases::default());
        assert!(native.options.is_none());

        let json = serde_json::to_value(&native).unwrap();
        assert!(json.get("options").is_none());
    }

    #[test]
    fn test_completion_request_translation() {
        let request: openai::CompletionRequest = serde_json::from_value(serde_json::json!({
            "model": "text-davinci-003",
            "prompt": ["Say hi", "ignored"],
            "max_tokens": 16,
            "stop": "."
        }))
        .unwrap();

        let native = completion_request_to_native(request, &ModelAliases::default());
        assert_eq!(native.model, "llama2:7b");
        assert_eq!(native.prompt.as_deref(), Some("Say hi"));
        assert_eq!(native.stream, Some(false));
        let options = native.options.unwrap();
        assert_eq!(options.num_predict, Some(16));
        assert_eq!(options.stop, Some(vec![".".to_string()]));
    }

    #[test]
    fn test_chat_response_translation() {
        let response: ollama::ChatResponse = serde_json::from_value(serde_json::json!({
            "model": "llama2:13b",
            "created_at": "2024-01-01T00:00:00Z",
            "message": {"role": "assistant", "content": "Hello! How can I help?"},
            "done": true,
            "done_reason": "stop",
            "prompt_eval_count": 10,
            "eval_count": 15,
            "eval_duration": 500000000
        }))
        .unwrap();

        let out = chat_response_to_compatible(&response, "chatcmpl-abc", "gpt-3.5-turbo");
        assert_eq!(out.id, "chatcmpl-abc");
        assert_eq!(out.object, "chat.completion");
        assert_eq!(out.model, "gpt-3.5-turbo");
        assert_eq!(out.choices[0].message.role, openai::Role::Assistant);
        assert_eq!(
            out.choices[0].message.content,
            Some(openai::MessageContent::Text("Hello! How can I help?".into()))
        );
        assert_eq!(out.choices[0].finish_reason.as_deref(), Some("stop"));
        assert_eq!(out.usage, openai::Usage { prompt_tokens: 10, completion_tokens: 15, total_tokens: 25 });
    }

    #[test]
    fn test_tool_calls_translation() {
        let response: ollama::ChatResponse = serde_json::from_value(serde_json::json!({
            "model": "mistral:7b",
            "message": {
                "role": "assistant",
                "content": "",
                "tool_calls": [{"function": {"name": "get_weather", "arguments": {"location": "Paris"}}}]
            },
            "done": true
        }))
        .unwrap();

        let out = chat_response_to_compatible(&response, "chatcmpl-1", "mistral:7b");
        let choice = &out.choices[0];
        assert_eq!(choice.finish_reason.as_deref(), Some("tool_calls"));
        assert!(choice.message.content.is_none());
        let call = &choice.message.tool_calls.as_ref().unwrap()[0];
        assert_eq!(call.function.name, "get_weather");
        assert!(call.function.arguments.contains("Paris"));
        assert!(call.id.starts_with("call_"));
    }

    #[test]
    fn test_generate_response_translation() {
        let response: ollama::GenerateResponse = serde_json::from_value(serde_json::json!({
            "model": "llama2:7b",
            "response": "Hi there",
            "done": true,
            "done_reason": "length",
            "prompt_eval_count": 3,
            "eval_count": 2
        }))
        .unwrap();

        let out = generate_response_to_completion(&response, "cmpl-1", "text-davinci-003");
        assert_eq!(out.object, "text_completion");
        assert_eq!(out.choices[0].text, "Hi there");
        assert_eq!(out.choices[0].finish_reason.as_deref(), Some("length"));
        assert_eq!(out.usage.unwrap().total_tokens, 5);
    }

    #[test]
    fn test_tags_to_models() {
        let tags: ollama::TagsResponse = serde_json::from_value(serde_json::json!({
            "models": [
                {"name": "llama2:7b", "modified_at": "2024-01-01T00:00:00Z", "size": 1, "digest": "d",
                 "details": {"family": "llama"}},
                {"name": "phi3", "modified_at": "not a date", "size": 1, "digest": "d"}
            ]
        }))
        .unwrap();

        let models = tags_to_models(tags);
        assert_eq!(models.object, "list");
        assert_eq!(models.data[0].id, "llama2:7b");
        assert_eq!(models.data[0].owned_by, "llama");
        assert_eq!(models.data[0].created, 1704067200);
        assert_eq!(models.data[1].owned_by, "ollama");
        assert_eq!(models.data[1].created, 0);
    }
}
