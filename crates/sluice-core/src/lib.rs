//! Sluice Core - LLM Serving Control Plane
//!
//! This crate is the scheduling side of an LLM inference service: it accepts
//! generation requests, admits them under bounded batch and KV-cache
//! capacity, fans work out to model-parallel workers, and pumps sampled
//! token ids back through an incremental detokenizer into per-request
//! result streams.
//!
//! # Architecture
//!
//! - Fixed batch slots plus a paged KV block free list (`ResourceManager`)
//! - Broadcast-barrier task queue so every worker rank sees the same batch
//! - A persistent scheduler thread and token-processor thread per rank
//! - The model executor stays behind the [`engine::ModelExecutor`] seam;
//!   this crate never touches tensors
//!
//! # Example
//!
//! ```ignore
//! use sluice_core::{DataProcessor, Engine, EngineConfig, GenerateRequest};
//! use sluice_core::engine::SocketExecutor;
//! use std::sync::Arc;
//!
//! let cfg = EngineConfig::from_env()?;
//! let data = DataProcessor::from_path(&cfg)?;
//! let executor = Arc::new(SocketExecutor::connect(cfg.infer_port)?);
//! let engine = Engine::start(cfg, data, executor)?;
//!
//! let mut stream = engine.submit(GenerateRequest {
//!     text: Some("Hello".to_string()),
//!     ..GenerateRequest::default()
//! })?;
//! ```

pub mod config;
pub mod data;
pub mod engine;
pub mod error;
pub mod validate;

pub use config::EngineConfig;
pub use data::DataProcessor;
pub use engine::{
    Engine, HealthError, HealthState, ModelExecutor, OutputRouter, ResourceManager, ResultEvent,
    Scheduler, SocketExecutor, StepOutput, Task, TaskQueue, TokenProcessor,
};
pub use error::{Error, Result};
pub use validate::{add_default_params, check_basic_params, GenerateRequest, Message};
