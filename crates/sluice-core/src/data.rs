//! Tokenization in, incremental detokenization out.
//!
//! The input side turns `text`/`messages` into token ids (or clamps client
//! supplied `input_ids`) and always extends the request's EOS set with the
//! model's canonical EOS ids. The output side decodes streamed token ids
//! incrementally: a byte-level tokenizer may need several ids before a
//! character boundary is reached, so each request keeps a decode cursor and
//! pieces are only emitted once they are stable.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

use tokenizers::Tokenizer;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::engine::task::{Task, TokenId};
use crate::error::{Error, Result};
use crate::validate::{GenerateRequest, Message};

/// Incomplete UTF-8 shows up as a trailing replacement character; hold the
/// piece back until the tokenizer has enough ids to finish it.
const REPLACEMENT: char = '\u{FFFD}';

/// Per-request incremental decode cursor.
#[derive(Debug, Default)]
struct DecodeState {
    prefix_offset: usize,
    read_offset: usize,
    ids: Vec<TokenId>,
    texts: Vec<String>,
}

pub struct DataProcessor {
    tokenizer: Tokenizer,
    /// Truncation window for tokenized prompts.
    src_length: usize,
    max_seq_len: usize,
    dec_len_limit: usize,
    canonical_eos: Vec<TokenId>,
    decode_status: Mutex<HashMap<String, DecodeState>>,
}

impl DataProcessor {
    /// Load the tokenizer and EOS ids from the model directory.
    pub fn from_path(cfg: &EngineConfig) -> Result<Self> {
        let tokenizer_path = cfg.model_dir.join("tokenizer.json");
        let tokenizer = Tokenizer::from_file(&tokenizer_path)
            .map_err(|e| Error::TokenizationError(format!("{:?}: {}", tokenizer_path, e)))?;
        let canonical_eos = load_eos_ids(&cfg.model_dir);
        if canonical_eos.is_empty() {
            warn!("no eos_token_id found under {:?}", cfg.model_dir);
        }
        info!(
            "loaded tokenizer from {:?}, vocab size {}, eos ids {:?}",
            tokenizer_path,
            tokenizer.get_vocab_size(true),
            canonical_eos
        );
        Ok(Self::from_tokenizer(tokenizer, canonical_eos, cfg))
    }

    pub fn from_tokenizer(
        tokenizer: Tokenizer,
        canonical_eos: Vec<TokenId>,
        cfg: &EngineConfig,
    ) -> Self {
        Self {
            tokenizer,
            src_length: cfg.src_length(),
            max_seq_len: cfg.max_seq_len,
            dec_len_limit: cfg.dec_len_limit,
            canonical_eos,
            decode_status: Mutex::new(HashMap::new()),
        }
    }

    /// Turn a validated request into an executable task.
    pub fn process_request(&self, req: &GenerateRequest) -> Result<Task> {
        let input_ids = if let Some(input_ids) = &req.input_ids {
            // Pre-tokenized input still gets clamped to the model bound.
            let limit = self.max_seq_len.saturating_sub(1);
            input_ids.iter().copied().take(limit).collect()
        } else if let Some(messages) = &req.messages {
            self.text2ids(&render_messages(req.system.as_deref(), messages))?
        } else if let Some(text) = &req.text {
            self.text2ids(text)?
        } else {
            return Err(Error::ValidationError(vec![
                "request carries neither text, input_ids nor messages".to_string(),
            ]));
        };

        let mut task = Task::from_request(req, input_ids, self.dec_len_limit);
        for eos in &self.canonical_eos {
            if !task.eos_token_ids.contains(eos) {
                task.eos_token_ids.push(*eos);
            }
        }
        debug!(
            "processed request {}: {} input tokens, eos ids {:?}",
            task.req_id,
            task.input_len(),
            task.eos_token_ids
        );
        Ok(task)
    }

    pub fn text2ids(&self, text: &str) -> Result<Vec<TokenId>> {
        let encoding = self
            .tokenizer
            .encode(text, true)
            .map_err(|e| Error::TokenizationError(e.to_string()))?;
        Ok(encoding
            .get_ids()
            .iter()
            .copied()
            .take(self.src_length)
            .collect())
    }

    /// Decode newly generated ids for a request, returning the stable text
    /// piece (possibly empty while a multi-byte sequence is pending).
    pub fn ids2tokens(&self, req_id: &str, token_ids: &[TokenId]) -> Result<String> {
        let mut status = self.decode_status.lock().unwrap();
        let state = status.entry(req_id.to_string()).or_default();
        state.ids.extend_from_slice(token_ids);

        let prefix_text = self
            .tokenizer
            .decode(&state.ids[state.prefix_offset..state.read_offset], false)
            .map_err(|e| Error::TokenizationError(e.to_string()))?;
        let full_text = self
            .tokenizer
            .decode(&state.ids[state.prefix_offset..], false)
            .map_err(|e| Error::TokenizationError(e.to_string()))?;

        let piece = if full_text.len() > prefix_text.len() && !full_text.ends_with(REPLACEMENT) {
            state.prefix_offset = state.read_offset;
            state.read_offset = state.ids.len();
            full_text[prefix_text.len()..].to_string()
        } else {
            String::new()
        };
        state.texts.push(piece.clone());
        Ok(piece)
    }

    /// Drop a request's decode state, returning the concatenated text.
    pub fn clear_request_status(&self, req_id: &str) -> String {
        self.decode_status
            .lock()
            .unwrap()
            .remove(req_id)
            .map(|state| state.texts.concat())
            .unwrap_or_default()
    }

    /// Canonical EOS ids of the loaded model.
    pub fn eos_token_ids(&self) -> &[TokenId] {
        &self.canonical_eos
    }
}

/// Render a conversation into a plain prompt. Models shipped with a chat
/// template have it applied by the export pipeline; this is the fallback
/// textual form.
fn render_messages(system: Option<&str>, messages: &[Message]) -> String {
    let mut prompt = String::new();
    if let Some(system) = system {
        prompt.push_str(system);
        prompt.push('\n');
    }
    for message in messages {
        let role = if message.role == "assistant" {
            "Assistant"
        } else {
            "User"
        };
        prompt.push_str(role);
        prompt.push_str(": ");
        prompt.push_str(message.content.as_deref().unwrap_or_default());
        prompt.push('\n');
    }
    prompt.push_str("Assistant:");
    prompt
}

fn load_eos_ids(model_dir: &Path) -> Vec<TokenId> {
    for name in ["generation_config.json", "config.json"] {
        let Ok(text) = std::fs::read_to_string(model_dir.join(name)) else {
            continue;
        };
        let Ok(value) = serde_json::from_str::<serde_json::Value>(&text) else {
            continue;
        };
        match value.get("eos_token_id") {
            Some(serde_json::Value::Number(n)) => {
                if let Some(id) = n.as_u64() {
                    return vec![id as TokenId];
                }
            }
            Some(serde_json::Value::Array(ids)) => {
                return ids
                    .iter()
                    .filter_map(|v| v.as_u64().map(|id| id as TokenId))
                    .collect();
            }
            _ => {}
        }
    }
    Vec::new()
}
