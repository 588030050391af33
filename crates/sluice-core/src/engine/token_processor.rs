//! Step-output consumption and result emission.
//!
//! One consumer thread per rank blocks on the executor's output channel and
//! turns each step frame into per-request result events: split the frame by
//! slot, detokenize incrementally, and retire tasks whose EOS arrived. The
//! per-request `send_idx` is strictly increasing from 0 and the terminal
//! event always carries the totals.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use tracing::{error, info};

use crate::config::EngineConfig;
use crate::data::DataProcessor;
use crate::error::Result;

use super::executor::{ModelExecutor, StepOutput};
use super::health::HealthState;
use super::output::{OutputRouter, ResultEvent};
use super::resource_manager::ResourceManager;
use super::task::TokenId;

pub struct TokenProcessor {
    cfg: Arc<EngineConfig>,
    resources: Arc<Mutex<ResourceManager>>,
    router: Arc<OutputRouter>,
    data: Arc<DataProcessor>,
    health: Arc<HealthState>,
    /// Generated (non-EOS) tokens per slot.
    all_tokens: Vec<Vec<TokenId>>,
    /// Next `send_idx` per live request.
    tokens_counter: HashMap<String, u64>,
}

impl TokenProcessor {
    pub fn new(
        cfg: Arc<EngineConfig>,
        resources: Arc<Mutex<ResourceManager>>,
        router: Arc<OutputRouter>,
        data: Arc<DataProcessor>,
        health: Arc<HealthState>,
    ) -> Self {
        let all_tokens = (0..cfg.max_batch_size).map(|_| Vec::new()).collect();
        Self {
            cfg,
            resources,
            router,
            data,
            health,
            all_tokens,
            tokens_counter: HashMap::new(),
        }
    }

    /// Spawn the consumer thread for `rank`. The thread exits when the
    /// executor's output channel closes; in-flight tasks are then lost and
    /// the health probe reports the gap.
    pub fn spawn(mut self, executor: Arc<dyn ModelExecutor>, rank: usize) -> Result<JoinHandle<()>> {
        let handle = std::thread::Builder::new()
            .name(format!("token-processor-{}", rank))
            .spawn(move || loop {
                match executor.recv_step(rank) {
                    Ok(step) => {
                        self.health.heartbeat();
                        if step.is_skip() {
                            continue;
                        }
                        self.process_step(&step);
                    }
                    Err(e) => {
                        error!("rank {} step output stream ended: {}", rank, e);
                        break;
                    }
                }
            })?;
        Ok(handle)
    }

    /// Handle one step frame. Public within the crate so tests can drive
    /// frames without the executor thread.
    pub(crate) fn process_step(&mut self, step: &StepOutput) {
        let batch = step.batch_len().min(self.cfg.max_batch_size);
        let mut events = Vec::new();

        {
            let mut resources = self.resources.lock().unwrap();
            for slot in 0..batch {
                if resources.stop_flags[slot] {
                    continue;
                }
                let word = step.slot_word(slot);
                if word < 0 {
                    continue;
                }
                let token_id = word as TokenId;

                let generated = self.all_tokens[slot].len();
                let (req_id, is_eos, infer_seed, return_all_tokens, time_cost) = {
                    let Some(task) = resources.tasks_list[slot].as_mut() else {
                        continue;
                    };
                    let time_cost = task
                        .inference_start_time
                        .map(|t| t.elapsed().as_secs_f64())
                        .unwrap_or_default();
                    task.inference_time_cost = time_cost;
                    task.tokens_all_num = generated;
                    (
                        task.req_id.clone(),
                        task.is_eos(token_id),
                        task.infer_seed,
                        task.return_all_tokens,
                        time_cost,
                    )
                };

                let send_idx = *self.tokens_counter.entry(req_id.clone()).or_insert(0);
                self.tokens_counter.insert(req_id.clone(), send_idx + 1);

                if !is_eos {
                    self.all_tokens[slot].push(token_id);
                    let token = match self.data.ids2tokens(&req_id, &[token_id]) {
                        Ok(piece) => piece,
                        Err(e) => {
                            error!("req_id: {} detokenization failed: {}", req_id, e);
                            String::new()
                        }
                    };
                    events.push(ResultEvent {
                        req_id,
                        is_end: 0,
                        token,
                        token_ids: vec![token_id],
                        send_idx,
                        inference_time_cost: Some(time_cost),
                        infer_seed,
                        return_all_tokens: Some(return_all_tokens),
                        tokens_all_num: None,
                        tokens_all_ids: None,
                        result: None,
                        error_msg: String::new(),
                        error_code: 0,
                    });
                } else {
                    let tokens_all_ids = std::mem::take(&mut self.all_tokens[slot]);
                    let result = self.data.clear_request_status(&req_id);
                    self.tokens_counter.remove(&req_id);
                    resources.recycle(slot);
                    info!("req_id: {} finished", req_id);
                    info!("{}", resources.info());

                    events.push(ResultEvent {
                        req_id,
                        is_end: 1,
                        token: String::new(),
                        token_ids: Vec::new(),
                        send_idx,
                        inference_time_cost: Some(time_cost),
                        infer_seed,
                        return_all_tokens: Some(return_all_tokens),
                        // The EOS step itself counts.
                        tokens_all_num: Some(tokens_all_ids.len() + 1),
                        tokens_all_ids: Some(tokens_all_ids),
                        result: Some(result),
                        error_msg: String::new(),
                        error_code: 0,
                    });
                }
            }
        }

        for event in events {
            self.router.send(event);
        }
    }
}
