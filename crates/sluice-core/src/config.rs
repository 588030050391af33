//! Engine configuration.
//!
//! All parameters are read from the environment exactly once at startup;
//! later changes to the environment are ignored. Raw values go through
//! `derive()` to produce the block-capacity constants and `check()` to
//! reject invalid deployments before any thread is spawned.

use std::env;
use std::fmt::Display;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{Error, Result};

/// Resolved engine configuration, raw and derived values together.
#[derive(Debug, Clone, Serialize)]
pub struct EngineConfig {
    /// Directory holding tokenizer.json and (optionally) config.json.
    pub model_dir: PathBuf,
    /// Number of model-parallel worker ranks behind the executor.
    pub mp_num: usize,
    /// Fixed width of the executor batch (slot count).
    pub max_batch_size: usize,
    /// Maximum prompt length the loaded model supports.
    pub max_seq_len: usize,
    /// Maximum decode length the loaded model supports.
    pub max_dec_len: usize,
    /// KV token positions per cache block.
    pub block_size: usize,
    /// Sizing factor: how many worst-case sequences the pool should hold.
    pub block_bs: f32,
    /// Fraction of the sized pool actually handed to the free list.
    pub block_ratio: f32,
    /// Blocks reserved up front for decoding, per task.
    pub enc_dec_block_num: usize,
    /// Port of the native inference worker the executor dials.
    pub infer_port: u16,
    /// Per-`get` cap on tasks handed to a rank; `None` means drain everything.
    pub max_get_num: Option<usize>,
    /// Seconds of heartbeat silence before the live probe reports a hang.
    pub check_health_interval: u64,
    /// Request-side ceiling on prompt length.
    pub seq_len_limit: usize,
    /// Request-side ceiling on decode length.
    pub dec_len_limit: usize,
    /// Context length of the model, used to size the truncation window.
    pub model_max_length: usize,

    // Derived in `derive()`.
    pub dec_token_num: usize,
    pub max_query_block_num: usize,
    pub total_block_num: usize,
    pub max_block_num: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let mut cfg = Self {
            model_dir: PathBuf::from("/opt/serving/models"),
            mp_num: 1,
            max_batch_size: 50,
            max_seq_len: 8192,
            max_dec_len: 1024,
            block_size: 64,
            block_bs: 50.0,
            block_ratio: 0.75,
            enc_dec_block_num: 2,
            infer_port: 56666,
            max_get_num: None,
            check_health_interval: 10,
            seq_len_limit: 7168,
            dec_len_limit: 1024,
            model_max_length: 8192,
            dec_token_num: 0,
            max_query_block_num: 0,
            total_block_num: 0,
            max_block_num: 0,
        };
        cfg.derive();
        cfg
    }
}

impl EngineConfig {
    /// Read configuration from the environment, apply model-file overrides,
    /// derive capacity constants and validate.
    pub fn from_env() -> Result<Self> {
        let model_dir = PathBuf::from(
            env::var("MODEL_DIR").unwrap_or_else(|_| "/opt/serving/models".to_string()),
        );
        if !model_dir.is_dir() {
            return Err(Error::ConfigError(format!(
                "MODEL_DIR {:?} is not a readable directory",
                model_dir
            )));
        }

        let max_seq_len = env_parse("MAX_SEQ_LEN", 8192usize)?;
        let max_dec_len = env_parse("MAX_DEC_LEN", 1024usize)?;
        let max_get_num = match env_parse("ENGINE_MAX_NEED_NUM", 0usize)? {
            0 => None,
            n => Some(n),
        };

        let mut cfg = Self {
            mp_num: env_parse("MP_NUM", 1usize)?,
            max_batch_size: env_parse("MAX_BATCH_SIZE", 50usize)?,
            max_seq_len,
            max_dec_len,
            block_size: env_parse("BLOCK_SIZE", 64usize)?,
            block_bs: env_parse("BLOCK_BS", 50.0f32)?,
            block_ratio: env_parse("BLOCK_RATIO", 0.75f32)?,
            enc_dec_block_num: env_parse("ENC_DEC_BLOCK_NUM", 2usize)?,
            infer_port: env_parse("INFER_QUEUE_PORT", 56666u16)?,
            max_get_num,
            check_health_interval: env_parse("CHECK_HEALTH_INTERVAL", 10u64)?,
            // The exported limits double as the request-side ceilings; the
            // tighter fallback leaves headroom for special tokens.
            seq_len_limit: env_parse("MAX_SEQ_LEN", 7168usize)?,
            dec_len_limit: env_parse("MAX_DEC_LEN", 1024usize)?,
            model_max_length: max_seq_len,
            model_dir,
            dec_token_num: 0,
            max_query_block_num: 0,
            total_block_num: 0,
            max_block_num: 0,
        };

        cfg.apply_model_file_overrides();
        cfg.derive();
        cfg.check()?;
        info!("{}", cfg.summary());
        Ok(cfg)
    }

    /// Model exports may pin the block size and sequence length they were
    /// compiled for; those values win over the environment.
    fn apply_model_file_overrides(&mut self) {
        let path = self.model_dir.join("config.json");
        let Ok(text) = std::fs::read_to_string(&path) else {
            return;
        };
        let parsed: ModelFileConfig = match serde_json::from_str(&text) {
            Ok(p) => p,
            Err(e) => {
                warn!("ignoring unparseable model config {:?}: {}", path, e);
                return;
            }
        };
        if let Some(block_size) = parsed.infer_model_block_size {
            info!("model config overrides block_size = {}", block_size);
            self.block_size = block_size;
        }
        if let Some(max_seq_len) = parsed.infer_model_max_seq_len {
            info!("model config overrides max_seq_len = {}", max_seq_len);
            self.max_seq_len = max_seq_len;
        }
        if let Some(max_length) = parsed.max_length {
            self.model_max_length = max_length;
        }
    }

    /// Compute the capacity constants from the raw values.
    pub fn derive(&mut self) {
        if self.block_ratio >= 1.0 {
            self.enc_dec_block_num = div_ceil(self.max_dec_len, self.block_size);
        }
        self.dec_token_num = self.enc_dec_block_num * self.block_size;
        self.max_query_block_num = div_ceil(self.max_dec_len + self.max_seq_len, self.block_size);
        self.total_block_num = (self.block_bs * self.max_query_block_num as f32) as usize;
        self.max_block_num = (self.total_block_num as f32 * self.block_ratio) as usize;
    }

    /// Reject configurations the engine cannot serve.
    pub fn check(&self) -> Result<()> {
        if self.max_batch_size == 0 || self.max_batch_size > 256 {
            return Err(Error::ConfigError(format!(
                "MAX_BATCH_SIZE must be in [1, 256], got {}",
                self.max_batch_size
            )));
        }
        if self.block_size == 0 {
            return Err(Error::ConfigError("BLOCK_SIZE must be positive".to_string()));
        }
        if !(self.block_ratio > 0.0 && self.block_ratio <= 1.0) {
            return Err(Error::ConfigError(format!(
                "BLOCK_RATIO must be in (0, 1], got {}",
                self.block_ratio
            )));
        }
        if self.mp_num == 0 || self.mp_num > 64 {
            return Err(Error::ConfigError(format!(
                "MP_NUM must be in [1, 64], got {}",
                self.mp_num
            )));
        }
        if self.seq_len_limit > self.max_seq_len {
            return Err(Error::ConfigError(format!(
                "the exported MAX_SEQ_LEN ({}) exceeds the model limit {}",
                self.seq_len_limit, self.max_seq_len
            )));
        }
        if self.dec_len_limit > self.max_seq_len {
            return Err(Error::ConfigError(format!(
                "the exported MAX_DEC_LEN ({}) exceeds the model limit {}",
                self.dec_len_limit, self.max_seq_len
            )));
        }
        if self.max_block_num == 0 {
            return Err(Error::ConfigError(
                "derived max_block_num is zero; raise BLOCK_BS or BLOCK_RATIO".to_string(),
            ));
        }
        Ok(())
    }

    /// Truncation window for tokenized prompts.
    pub fn src_length(&self) -> usize {
        self.model_max_length.saturating_sub(self.seq_len_limit).max(1)
    }

    /// One-line startup summary.
    pub fn summary(&self) -> String {
        format!(
            "engine config: max_batch_size={} block_size={} max_block_num={} \
             max_query_block_num={} dec_token_num={} mp_num={} model_dir={:?}",
            self.max_batch_size,
            self.block_size,
            self.max_block_num,
            self.max_query_block_num,
            self.dec_token_num,
            self.mp_num,
            self.model_dir,
        )
    }
}

#[derive(Debug, Default, Deserialize)]
struct ModelFileConfig {
    infer_model_block_size: Option<usize>,
    infer_model_max_seq_len: Option<usize>,
    max_length: Option<usize>,
}

fn env_parse<T: FromStr>(key: &str, default: T) -> Result<T>
where
    T::Err: Display,
{
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|e| Error::ConfigError(format!("invalid {}={:?}: {}", key, raw, e))),
        Err(_) => Ok(default),
    }
}

fn div_ceil(num: usize, den: usize) -> usize {
    (num + den - 1) / den
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> EngineConfig {
        EngineConfig {
            max_batch_size: 4,
            max_seq_len: 128,
            max_dec_len: 64,
            block_size: 4,
            block_bs: 2.0,
            block_ratio: 0.5,
            enc_dec_block_num: 1,
            seq_len_limit: 128,
            dec_len_limit: 64,
            ..EngineConfig::default()
        }
    }

    #[test]
    fn derived_constants() {
        let mut cfg = base();
        cfg.derive();
        assert_eq!(cfg.dec_token_num, 4);
        // (64 + 128 + 3) / 4
        assert_eq!(cfg.max_query_block_num, 48);
        assert_eq!(cfg.total_block_num, 96);
        assert_eq!(cfg.max_block_num, 48);
        assert!(cfg.check().is_ok());
    }

    #[test]
    fn full_ratio_overrides_decoder_reserve() {
        let mut cfg = base();
        cfg.block_ratio = 1.0;
        cfg.derive();
        // ceil(64 / 4) blocks are reserved for decode when the whole pool
        // is handed out.
        assert_eq!(cfg.enc_dec_block_num, 16);
        assert_eq!(cfg.dec_token_num, 64);
    }

    #[test]
    fn limits_above_model_bounds_are_rejected() {
        let mut cfg = base();
        cfg.seq_len_limit = 1024;
        cfg.derive();
        assert!(cfg.check().is_err());

        let mut cfg = base();
        cfg.dec_len_limit = 1024;
        cfg.derive();
        assert!(cfg.check().is_err());
    }

    #[test]
    fn oversized_batch_is_rejected() {
        let mut cfg = base();
        cfg.max_batch_size = 300;
        cfg.derive();
        assert!(cfg.check().is_err());
    }
}
