//! OpenAI wire shapes and the parsing the gateway needs around them:
//! token estimation, max-token clamping, usage extraction and the SSE relay.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::io::Write;
use std::sync::LazyLock;
use tiktoken_rs::{cl100k_base, CoreBPE};

static TOKENIZER: LazyLock<Option<CoreBPE>> = LazyLock::new(|| cl100k_base().ok());

/// Role marker and separators around every chat message.
const MESSAGE_OVERHEAD: u64 = 4;
/// Priming tokens for the assistant reply.
const REPLY_OVERHEAD: u64 = 3;

pub fn count_tokens(text: &str) -> u64 {
    match TOKENIZER.as_ref() {
        Some(bpe) => bpe.encode_with_special_tokens(text).len() as u64,
        None => text.len().div_ceil(4) as u64,
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatCompletionRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub stream: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_completion_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream_options: Option<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<MessageContent>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Plain text, or the multi-part form used for images and audio.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentPart {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl MessageContent {
    /// Text that counts toward the prompt; non-text parts contribute nothing.
    pub fn text(&self) -> String {
        match self {
            MessageContent::Text(s) => s.clone(),
            MessageContent::Parts(parts) => parts
                .iter()
                .filter_map(|p| p.text.as_deref())
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }
}

impl ChatCompletionRequest {
    pub fn estimate_prompt_tokens(&self) -> u64 {
        let mut total = REPLY_OVERHEAD;
        for m in &self.messages {
            total += MESSAGE_OVERHEAD + count_tokens(&m.role);
            if let Some(c) = &m.content {
                total += count_tokens(&c.text());
            }
        }
        total
    }

    /// Caps the requested completion length; absent limits stay absent.
    pub fn clamp_max_tokens(&mut self, ceiling: u64, model_max: u64) {
        let limit = if model_max > 0 { ceiling.min(model_max) } else { ceiling };
        if let Some(v) = self.max_tokens.as_mut() {
            *v = (*v).min(limit);
        }
        if let Some(v) = self.max_completion_tokens.as_mut() {
            *v = (*v).min(limit);
        }
    }

    /// Asks the upstream to report usage in the terminal stream chunk.
    pub fn request_stream_usage(&mut self) {
        if !self.stream {
            return;
        }
        let opts = self
            .stream_options
            .get_or_insert_with(|| Value::Object(Map::new()));
        if !opts.is_object() {
            *opts = Value::Object(Map::new());
        }
        if let Some(obj) = opts.as_object_mut() {
            obj.insert("include_usage".to_string(), Value::Bool(true));
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingRequest {
    pub model: String,
    pub input: EmbeddingInput,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EmbeddingInput {
    Text(String),
    Texts(Vec<String>),
    Tokens(Vec<u32>),
    TokenBatches(Vec<Vec<u32>>),
}

impl EmbeddingRequest {
    pub fn estimate_prompt_tokens(&self) -> u64 {
        match &self.input {
            EmbeddingInput::Text(s) => count_tokens(s),
            EmbeddingInput::Texts(list) => list.iter().map(|s| count_tokens(s)).sum(),
            EmbeddingInput::Tokens(t) => t.len() as u64,
            EmbeddingInput::TokenBatches(b) => b.iter().map(|t| t.len() as u64).sum(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpeechRequest {
    pub model: String,
    pub input: String,
    pub voice: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_format: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl SpeechRequest {
    /// Speech is billed per input character.
    pub fn billed_characters(&self) -> u64 {
        self.input.chars().count() as u64
    }

    pub fn content_type(&self) -> &'static str {
        speech_content_type(self.response_format.as_deref())
    }
}

pub fn speech_content_type(format: Option<&str>) -> &'static str {
    match format {
        Some("opus") => "audio/ogg",
        Some("aac") => "audio/aac",
        Some("flac") => "audio/flac",
        Some("pcm") => "audio/L16",
        Some("wav") => "audio/wav",
        _ => "audio/mpeg",
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

pub fn extract_usage(v: &Value) -> Option<TokenUsage> {
    let usage = v.get("usage")?;
    let prompt = usage.get("prompt_tokens").and_then(Value::as_u64);
    let completion = usage.get("completion_tokens").and_then(Value::as_u64);
    let total = usage.get("total_tokens").and_then(Value::as_u64);
    if prompt.is_none() && completion.is_none() && total.is_none() {
        return None;
    }
    let prompt = prompt.unwrap_or(0);
    // embeddings report only prompt + total
    let completion = completion.unwrap_or_else(|| total.unwrap_or(0).saturating_sub(prompt));
    Some(TokenUsage {
        prompt_tokens: prompt,
        completion_tokens: completion,
    })
}

/// Parses a complete JSON response body, decompressing gzip first.
pub fn json_body(body: &[u8], gzip: bool) -> Option<Value> {
    if gzip {
        let plain = GzipDecoder::new().push(body).ok()?;
        serde_json::from_slice(&plain).ok()
    } else {
        serde_json::from_slice(body).ok()
    }
}

/// Incremental gzip decoder for bodies that arrive in chunks.
pub struct GzipDecoder {
    inner: flate2::write::GzDecoder<Vec<u8>>,
}

impl GzipDecoder {
    pub fn new() -> Self {
        Self {
            inner: flate2::write::GzDecoder::new(Vec::new()),
        }
    }

    /// Feeds compressed bytes, returning whatever plain text became available.
    pub fn push(&mut self, input: &[u8]) -> std::io::Result<Vec<u8>> {
        self.inner.write_all(input)?;
        self.inner.flush()?;
        Ok(std::mem::take(self.inner.get_mut()))
    }
}

impl Default for GzipDecoder {
    fn default() -> Self {
        Self::new()
    }
}

pub const DONE_FRAME: &[u8] = b"data: [DONE]\n\n";

/// Line-oriented pass-through for an upstream event stream.
///
/// Complete lines are forwarded as they arrive. The upstream's own `[DONE]`
/// marker is withheld so that exactly one terminal marker is emitted by
/// [`SseRelay::finish`], whether the upstream ended cleanly or not.
#[derive(Default)]
pub struct SseRelay {
    buf: Vec<u8>,
    usage: Option<TokenUsage>,
    response_id: Option<String>,
    saw_data: bool,
    skip_blank: bool,
}

impl SseRelay {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn usage(&self) -> Option<TokenUsage> {
        self.usage
    }

    /// `id` of the first event, e.g. `chatcmpl-...`.
    pub fn response_id(&self) -> Option<&str> {
        self.response_id.as_deref()
    }

    /// Returns the bytes to forward for this chunk, if any line completed.
    pub fn push(&mut self, chunk: &[u8]) -> Option<Bytes> {
        self.buf.extend_from_slice(chunk);
        let Some(last_nl) = self.buf.iter().rposition(|&b| b == b'\n') else {
            return None;
        };
        let rest = self.buf.split_off(last_nl + 1);
        let complete = std::mem::replace(&mut self.buf, rest);

        let mut out = Vec::with_capacity(complete.len());
        for line in complete.split_inclusive(|&b| b == b'\n') {
            self.relay_line(line, &mut out);
        }
        if out.is_empty() {
            None
        } else {
            Some(Bytes::from(out))
        }
    }

    /// Flushes a trailing partial line and appends the single terminal marker.
    pub fn finish(&mut self) -> Bytes {
        let mut out = Vec::new();
        if !self.buf.is_empty() {
            let mut tail = std::mem::take(&mut self.buf);
            tail.push(b'\n');
            self.relay_line(&tail, &mut out);
            if !out.is_empty() && !out.ends_with(b"\n\n") {
                out.push(b'\n');
            }
        }
        out.extend_from_slice(DONE_FRAME);
        Bytes::from(out)
    }

    fn relay_line(&mut self, line: &[u8], out: &mut Vec<u8>) {
        let text = trim_eol(line);
        if text.is_empty() {
            if !std::mem::take(&mut self.skip_blank) {
                out.extend_from_slice(line);
            }
            return;
        }
        self.skip_blank = false;
        if let Some(data) = text.strip_prefix(b"data:") {
            let data = data.trim_ascii();
            if data == b"[DONE]" {
                self.skip_blank = true;
                return;
            }
            let wants_id = !self.saw_data;
            let has_usage = data.windows(7).any(|w| w == b"\"usage\"");
            self.saw_data = true;
            if wants_id || has_usage {
                if let Ok(v) = serde_json::from_slice::<Value>(data) {
                    if wants_id {
                        self.response_id = v.get("id").and_then(Value::as_str).map(str::to_owned);
                    }
                    if let Some(u) = extract_usage(&v) {
                        self.usage = Some(u);
                    }
                }
            }
        }
        out.extend_from_slice(line);
    }
}

fn trim_eol(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}
