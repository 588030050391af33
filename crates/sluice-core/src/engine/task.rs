//! The unit of work flowing through the engine.

use std::time::Instant;

use crate::validate::GenerateRequest;

/// Vocabulary token id.
pub type TokenId = u32;

/// Index of a KV cache block in the shared pool.
pub type BlockId = usize;

/// A validated, tokenized generation request on its way through admission,
/// execution and retirement. Created by the submission path, moved through
/// the queue into a batch slot, destroyed on recycle.
#[derive(Debug, Clone)]
pub struct Task {
    pub req_id: String,
    pub input_ids: Vec<TokenId>,

    // Sampling parameters.
    pub max_dec_len: usize,
    pub min_dec_len: usize,
    pub topp: f32,
    pub temperature: f32,
    pub penalty_score: f32,
    pub frequency_score: f32,
    pub presence_score: f32,
    pub eos_token_ids: Vec<TokenId>,
    /// Filled at admission when the client did not pin one.
    pub infer_seed: Option<i64>,
    pub return_all_tokens: bool,

    // Admission state; meaningless until the task occupies a slot.
    pub slot: Option<usize>,
    pub block_tables: Vec<BlockId>,
    pub inference_start_time: Option<Instant>,
    pub inference_time_cost: f64,
    pub tokens_all_num: usize,
}

impl Task {
    /// Build a task from a validated request and its tokenized prompt.
    ///
    /// `dec_len_limit` caps the decode length regardless of what the client
    /// asked for; the executor enforces the resulting bound.
    pub fn from_request(
        req: &GenerateRequest,
        input_ids: Vec<TokenId>,
        dec_len_limit: usize,
    ) -> Self {
        let max_dec_len = req
            .max_dec_len
            .map(|v| v.max(1) as usize)
            .unwrap_or(dec_len_limit)
            .min(dec_len_limit);

        Self {
            req_id: req.req_id.clone().unwrap_or_default(),
            input_ids,
            max_dec_len,
            min_dec_len: req.min_dec_len.map(|v| v.max(1) as usize).unwrap_or(1),
            topp: req.topp.unwrap_or(0.7),
            temperature: req.temperature.unwrap_or(0.95),
            penalty_score: req.penalty_score.unwrap_or(1.0),
            frequency_score: req.frequency_score.unwrap_or(0.0),
            presence_score: req.presence_score.unwrap_or(0.0),
            eos_token_ids: req.eos_token_ids.clone().unwrap_or_default(),
            infer_seed: req.infer_seed,
            return_all_tokens: req.return_all_tokens.unwrap_or(false),
            slot: None,
            block_tables: Vec::new(),
            inference_start_time: None,
            inference_time_cost: -1.0,
            tokens_all_num: 0,
        }
    }

    pub fn input_len(&self) -> usize {
        self.input_ids.len()
    }

    pub fn is_eos(&self, token_id: TokenId) -> bool {
        self.eos_token_ids.contains(&token_id)
    }
}

/// A read-only view of one occupied slot, handed to the executor alongside
/// newly admitted tasks so every rank sees the same batch layout.
#[derive(Debug, Clone)]
pub struct SlotView {
    pub slot: usize,
    pub req_id: String,
    pub input_len: usize,
    pub block_tables: Vec<BlockId>,
}

/// Snapshot of the active batch at the moment a step is launched.
#[derive(Debug, Clone)]
pub struct BatchView {
    pub real_bsz: usize,
    pub slots: Vec<SlotView>,
}
