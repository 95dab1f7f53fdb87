use bytes::Bytes;
use serde::Serialize;
use serde_json::{Map, Value};

use super::{GatewayError, QueryDefaults};
use crate::types::{ChatCompletionRequest, ChatMessage, MessageContent, Role};

const OWNED_BY: &str = "asksage";

/// Body of one backend `/query` call.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct QueryPayload {
    pub message: String,
    pub model: String,
    pub temperature: f64,
    pub persona: String,
    pub dataset: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<Value>,
    pub live: u32,
    pub limit_references: u32,
}

/// Answer extracted from either backend reply shape.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct BackendAnswer {
    pub text: String,
    pub tool_calls: Option<Vec<Value>>,
}

impl BackendAnswer {
    pub fn finish_reason(&self) -> &'static str {
        if self.tool_calls.is_some() {
            "tool_calls"
        } else {
            "stop"
        }
    }
}

/// Text parts joined by newlines; other parts contribute nothing.
pub fn extract_text(content: &MessageContent) -> String {
    match content {
        MessageContent::Text(text) => text.clone(),
        MessageContent::Parts(parts) => parts
            .iter()
            .filter(|part| part.is_text())
            .filter_map(|part| part.text.as_deref())
            .collect::<Vec<_>>()
            .join("\n"),
    }
}

fn message_text(message: &ChatMessage) -> String {
    message.content.as_ref().map(extract_text).unwrap_or_default()
}

/// Collapses a chat history into the backend's single `message` string.
///
/// A lone user turn is sent as its bare text. Anything longer becomes one
/// `label: text` block per message, in order, separated by blank lines.
/// Tool results are labelled with the call they answer and assistant tool
/// calls are appended as JSON.
pub fn flatten_messages(messages: &[ChatMessage]) -> String {
    if let [only] = messages {
        if only.role == Role::User && only.tool_calls.is_none() {
            return message_text(only);
        }
    }

    let mut blocks = Vec::<String>::with_capacity(messages.len());
    for message in messages {
        let mut body = message_text(message);
        if let Some(tool_calls) = message.tool_calls.as_ref().filter(|calls| !calls.is_empty()) {
            if !body.is_empty() {
                body.push('\n');
            }
            body.push_str("tool_calls: ");
            body.push_str(&Value::Array(tool_calls.clone()).to_string());
        }
        if body.is_empty() {
            continue;
        }
        blocks.push(format!("{}: {body}", message_label(message)));
    }
    blocks.join("\n\n")
}

fn message_label(message: &ChatMessage) -> String {
    let role = message.role.as_str();
    match (message.role, message.tool_call_id.as_deref(), message.name.as_deref()) {
        (Role::Tool, Some(call_id), _) => format!("{role} ({call_id})"),
        (_, _, Some(name)) if !name.trim().is_empty() => format!("{role} ({name})"),
        _ => role.to_string(),
    }
}

pub fn to_backend_payload(
    request: &ChatCompletionRequest,
    defaults: &QueryDefaults,
) -> Result<QueryPayload, GatewayError> {
    if request.model.trim().is_empty() {
        return Err(GatewayError::invalid_request("model is required"));
    }
    if request.messages.is_empty() {
        return Err(GatewayError::invalid_request("messages must not be empty"));
    }

    let tools = request
        .tools
        .as_ref()
        .filter(|tools| !tools.is_null())
        .map(Value::to_string);
    let tool_choice = request
        .tool_choice
        .clone()
        .filter(|choice| !choice.is_null());

    Ok(QueryPayload {
        message: flatten_messages(&request.messages),
        model: request.model.clone(),
        temperature: request.temperature.unwrap_or(defaults.temperature),
        persona: request
            .persona
            .clone()
            .unwrap_or_else(|| defaults.persona.clone()),
        dataset: request
            .dataset
            .clone()
            .unwrap_or_else(|| defaults.dataset.clone()),
        tools,
        tool_choice,
        live: request.live.unwrap_or(defaults.live),
        limit_references: request.limit_references.unwrap_or(defaults.limit_references),
    })
}

/// Normalizes the flat `{response: "..."}` and nested
/// `{response: {response, message, ...}}` reply shapes.
pub fn normalize_answer(raw: &Value) -> Result<BackendAnswer, GatewayError> {
    let malformed = || GatewayError::MalformedBackendResponse { raw: raw.clone() };

    match raw.get("response") {
        Some(Value::String(text)) => Ok(BackendAnswer {
            text: text.clone(),
            tool_calls: tool_calls_of(raw),
        }),
        Some(Value::Object(inner)) => {
            let inner_response = inner.get("response").and_then(Value::as_str);
            let text = inner_response
                .filter(|text| !text.is_empty())
                .or_else(|| inner.get("message").and_then(Value::as_str))
                .or(inner_response);
            let tool_calls = inner
                .get("tool_calls")
                .and_then(normalize_tool_calls)
                .or_else(|| tool_calls_of(raw));
            match (text, tool_calls) {
                (Some(text), tool_calls) => Ok(BackendAnswer {
                    text: text.to_string(),
                    tool_calls,
                }),
                (None, Some(tool_calls)) => Ok(BackendAnswer {
                    text: String::new(),
                    tool_calls: Some(tool_calls),
                }),
                (None, None) => Err(malformed()),
            }
        }
        _ => Err(malformed()),
    }
}

fn tool_calls_of(raw: &Value) -> Option<Vec<Value>> {
    raw.get("tool_calls").and_then(normalize_tool_calls)
}

fn normalize_tool_calls(value: &Value) -> Option<Vec<Value>> {
    let calls = value.as_array()?;
    let out: Vec<Value> = calls
        .iter()
        .enumerate()
        .filter_map(|(idx, call)| normalize_tool_call(idx, call))
        .collect();
    (!out.is_empty()).then_some(out)
}

fn normalize_tool_call(idx: usize, call: &Value) -> Option<Value> {
    let obj = call.as_object()?;
    let function = obj.get("function").and_then(Value::as_object);
    let name = function
        .and_then(|function| function.get("name"))
        .or_else(|| obj.get("name"))
        .and_then(Value::as_str)?;
    let arguments = function
        .and_then(|function| function.get("arguments"))
        .or_else(|| obj.get("arguments"));
    let arguments = match arguments {
        Some(Value::String(raw)) => raw.clone(),
        Some(Value::Null) | None => "{}".to_string(),
        Some(other) => other.to_string(),
    };
    let id = obj
        .get("id")
        .and_then(Value::as_str)
        .filter(|id| !id.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| format!("call_{idx}"));

    Some(serde_json::json!({
        "id": id,
        "type": "function",
        "function": { "name": name, "arguments": arguments },
    }))
}

pub fn estimate_tokens_from_length(len: usize) -> u64 {
    len.div_ceil(4) as u64
}

pub fn estimate_tokens(text: &str) -> u64 {
    estimate_tokens_from_length(text.chars().count())
}

fn usage_value(prompt_tokens: u64, completion_tokens: u64) -> Value {
    serde_json::json!({
        "prompt_tokens": prompt_tokens,
        "completion_tokens": completion_tokens,
        "total_tokens": prompt_tokens.saturating_add(completion_tokens),
    })
}

pub fn to_chat_completion(
    answer: &BackendAnswer,
    id: &str,
    model: &str,
    created: u64,
    prompt_tokens: u64,
) -> Value {
    let mut message = Map::<String, Value>::new();
    message.insert("role".to_string(), Value::String("assistant".to_string()));
    match &answer.tool_calls {
        Some(tool_calls) => {
            let content = if answer.text.is_empty() {
                Value::Null
            } else {
                Value::String(answer.text.clone())
            };
            message.insert("content".to_string(), content);
            message.insert("tool_calls".to_string(), Value::Array(tool_calls.clone()));
        }
        None => {
            message.insert("content".to_string(), Value::String(answer.text.clone()));
        }
    }

    serde_json::json!({
        "id": id,
        "object": "chat.completion",
        "created": created,
        "model": model,
        "choices": [{
            "index": 0,
            "message": Value::Object(message),
            "finish_reason": answer.finish_reason(),
        }],
        "usage": usage_value(prompt_tokens, estimate_tokens(&answer.text)),
    })
}

/// Splits `text` into pieces of at most `max_chars` characters; 0 keeps it whole.
pub fn segment_answer(text: &str, max_chars: usize) -> Vec<&str> {
    if max_chars == 0 || text.is_empty() {
        return vec![text];
    }
    let mut out = Vec::new();
    let mut start = 0usize;
    let mut count = 0usize;
    for (byte_idx, _) in text.char_indices() {
        if count == max_chars {
            out.push(&text[start..byte_idx]);
            start = byte_idx;
            count = 0;
        }
        count += 1;
    }
    out.push(&text[start..]);
    out
}

fn chat_chunk_bytes(
    id: &str,
    model: &str,
    created: u64,
    delta: Value,
    finish_reason: Option<&str>,
    usage: Option<Value>,
) -> Bytes {
    let mut choice = Map::<String, Value>::new();
    choice.insert("index".to_string(), Value::Number(0.into()));
    choice.insert("delta".to_string(), delta);
    choice.insert(
        "finish_reason".to_string(),
        finish_reason
            .map(|reason| Value::String(reason.to_string()))
            .unwrap_or(Value::Null),
    );

    let mut out = Map::<String, Value>::new();
    out.insert("id".to_string(), Value::String(id.to_string()));
    out.insert(
        "object".to_string(),
        Value::String("chat.completion.chunk".to_string()),
    );
    out.insert("created".to_string(), Value::Number(created.into()));
    out.insert("model".to_string(), Value::String(model.to_string()));
    out.insert(
        "choices".to_string(),
        Value::Array(vec![Value::Object(choice)]),
    );
    if let Some(usage) = usage {
        out.insert("usage".to_string(), usage);
    }

    let json = Value::Object(out).to_string();
    Bytes::from(format!("data: {json}\n\n"))
}

pub const DONE_EVENT: &[u8] = b"data: [DONE]\n\n";

/// Replays a finished answer as an OpenAI chunk stream: content deltas (the
/// first carrying the assistant role), tool calls if any, a terminal chunk
/// with the finish reason and usage, then the `[DONE]` sentinel.
pub fn chat_completion_chunks(
    answer: &BackendAnswer,
    id: &str,
    model: &str,
    created: u64,
    prompt_tokens: u64,
    chunk_chars: usize,
) -> Vec<Bytes> {
    let mut out = Vec::<Bytes>::new();
    for (idx, piece) in segment_answer(&answer.text, chunk_chars)
        .into_iter()
        .enumerate()
    {
        let delta = if idx == 0 {
            serde_json::json!({ "role": "assistant", "content": piece })
        } else {
            serde_json::json!({ "content": piece })
        };
        out.push(chat_chunk_bytes(id, model, created, delta, None, None));
    }

    if let Some(tool_calls) = &answer.tool_calls {
        let indexed: Vec<Value> = tool_calls
            .iter()
            .enumerate()
            .map(|(idx, call)| {
                let mut call = call.clone();
                if let Some(obj) = call.as_object_mut() {
                    obj.insert("index".to_string(), Value::Number(idx.into()));
                }
                call
            })
            .collect();
        out.push(chat_chunk_bytes(
            id,
            model,
            created,
            serde_json::json!({ "tool_calls": indexed }),
            None,
            None,
        ));
    }

    out.push(chat_chunk_bytes(
        id,
        model,
        created,
        Value::Object(Map::new()),
        Some(answer.finish_reason()),
        Some(usage_value(prompt_tokens, estimate_tokens(&answer.text))),
    ));
    out.push(Bytes::from_static(DONE_EVENT));
    out
}

/// Maps a `/get-models` reply onto an OpenAI model list. Accepts a bare
/// array or one under `response` or `data`, of ids or objects naming one.
pub fn models_list_to_openai(raw: &Value, created: u64) -> Result<Value, GatewayError> {
    let entries = match raw {
        Value::Array(items) => Some(items),
        Value::Object(obj) => ["response", "data", "models"]
            .iter()
            .find_map(|field| obj.get(*field).and_then(Value::as_array)),
        _ => None,
    }
    .ok_or_else(|| GatewayError::MalformedBackendResponse { raw: raw.clone() })?;

    let data: Vec<Value> = entries
        .iter()
        .filter_map(|entry| match entry {
            Value::String(id) => Some(id.as_str()),
            Value::Object(obj) => ["id", "model", "name"]
                .iter()
                .find_map(|field| obj.get(*field).and_then(Value::as_str)),
            _ => None,
        })
        .filter(|id| !id.trim().is_empty())
        .map(|id| {
            serde_json::json!({
                "id": id,
                "object": "model",
                "created": created,
                "owned_by": OWNED_BY,
            })
        })
        .collect();

    Ok(serde_json::json!({ "object": "list", "data": data }))
}
