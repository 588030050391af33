//! Batch slot and KV block accounting.
//!
//! Owns the fixed array of batch slots and the free list of paged KV cache
//! blocks. Admission walks candidate tasks and slots in ascending order,
//! reserving enough blocks for the prompt plus the decode allowance before a
//! slot is occupied. Retirement returns blocks to the free list; the list is
//! a LIFO stack so recently freed blocks are reused first.

use std::sync::Arc;
use std::time::Instant;

use rand::Rng;
use tracing::{debug, error, info};

use crate::config::EngineConfig;

use super::task::{BatchView, BlockId, SlotView, Task};

/// Result of one admission pass.
///
/// `admitted` holds the tasks that received a slot and blocks this round;
/// `deferred` holds the ones that did not fit and should be re-offered;
/// `dropped` holds oversize tasks, rejected for good.
#[derive(Debug, Default)]
pub struct AllocateOutcome {
    pub admitted: Vec<Task>,
    pub deferred: Vec<Task>,
    pub dropped: Vec<Task>,
}

pub struct ResourceManager {
    cfg: Arc<EngineConfig>,
    /// `true` means the slot is free. Parallel to `tasks_list`.
    pub(crate) stop_flags: Vec<bool>,
    pub(crate) tasks_list: Vec<Option<Task>>,
    /// Stack of free block indices; popped from the top.
    free_list: Vec<BlockId>,
    real_bsz: usize,
}

impl ResourceManager {
    pub fn new(cfg: Arc<EngineConfig>) -> Self {
        let manager = Self {
            stop_flags: vec![true; cfg.max_batch_size],
            tasks_list: (0..cfg.max_batch_size).map(|_| None).collect(),
            free_list: (0..cfg.max_block_num).rev().collect(),
            real_bsz: 0,
            cfg,
        };
        info!("{}", manager.info());
        manager
    }

    /// Blocks needed to hold a prompt of `input_token_num` tokens plus the
    /// decode allowance.
    pub fn required_block_num(&self, input_token_num: usize) -> usize {
        (input_token_num + self.cfg.block_size - 1 + self.cfg.dec_token_num) / self.cfg.block_size
    }

    /// Blocks needed for the prompt alone.
    pub fn encoder_block_num(&self, input_token_num: usize) -> usize {
        (input_token_num + self.cfg.block_size - 1) / self.cfg.block_size
    }

    /// Blocks reserved for decoding, per task.
    pub fn decoder_block_num(&self) -> usize {
        (self.cfg.dec_token_num + self.cfg.block_size - 1) / self.cfg.block_size
    }

    /// Size of the pool handed out at startup.
    pub fn total_block_num(&self) -> usize {
        self.cfg.max_block_num
    }

    pub fn available_batch(&self) -> usize {
        self.stop_flags.iter().filter(|free| **free).count()
    }

    pub fn available_block_num(&self) -> usize {
        self.free_list.len()
    }

    /// Largest occupied slot index plus one; zero when the batch is idle.
    pub fn real_bsz(&self) -> usize {
        self.real_bsz
    }

    /// Whether a new task of the given prompt length could be admitted now.
    pub fn is_resource_sufficient(&self, input_token_num: usize) -> bool {
        if self.available_batch() < 1 {
            return false;
        }
        self.required_block_num(input_token_num) <= self.available_block_num()
    }

    /// Admit as many candidate tasks as capacity allows.
    ///
    /// Best-effort, order-preserving and non-blocking: candidates are walked
    /// in input order, slots in ascending index order. A candidate whose
    /// prompt exceeds `max_seq_len` is dropped; one that cannot get its
    /// blocks is deferred without occupying a slot.
    pub fn allocate(&mut self, tasks: Vec<Task>) -> AllocateOutcome {
        let input_num = tasks.len();
        let mut outcome = AllocateOutcome::default();
        let mut slot = 0usize;

        for mut task in tasks {
            if task.input_len() > self.cfg.max_seq_len {
                error!(
                    "req_id: {} input_ids len:{} > {}",
                    task.req_id,
                    task.input_len(),
                    self.cfg.max_seq_len
                );
                outcome.dropped.push(task);
                continue;
            }

            while slot < self.cfg.max_batch_size && !self.stop_flags[slot] {
                slot += 1;
            }
            if slot >= self.cfg.max_batch_size {
                outcome.deferred.push(task);
                continue;
            }

            let block_tables = self.dispatch_blocks(task.input_len());
            if block_tables.is_empty() {
                error!("req_id: {} block_tables is empty", task.req_id);
                outcome.deferred.push(task);
                continue;
            }

            if task.infer_seed.is_none() {
                task.infer_seed = Some(rand::thread_rng().gen_range(0..=i64::MAX));
            }
            task.slot = Some(slot);
            task.block_tables = block_tables;
            task.inference_start_time = Some(Instant::now());
            task.inference_time_cost = -1.0;
            task.tokens_all_num = 0;

            self.stop_flags[slot] = false;
            self.tasks_list[slot] = Some(task.clone());
            info!(
                "allocate req_id: {}, slot: {}, input_ids_length: {}",
                task.req_id,
                slot,
                task.input_len()
            );
            outcome.admitted.push(task);
            slot += 1;
        }

        self.recompute_real_bsz();
        info!(
            "in num:{} new task num:{} real_bsz is:{}",
            input_num,
            outcome.admitted.len(),
            self.real_bsz
        );
        info!("{}", self.info());
        outcome
    }

    /// Free the slot and return its blocks to the pool.
    ///
    /// Returns the retired task. Blocks are appended as-is; handing the same
    /// block back twice is a caller bug and would corrupt the pool.
    pub fn recycle(&mut self, slot: usize) -> Option<Task> {
        if slot >= self.cfg.max_batch_size {
            return None;
        }
        let mut task = self.tasks_list[slot].take()?;
        self.stop_flags[slot] = true;
        let blocks = std::mem::take(&mut task.block_tables);
        self.recycle_blocks(blocks);
        self.recompute_real_bsz();
        Some(task)
    }

    /// Snapshot of the occupied slots for the executor.
    pub fn batch_view(&self) -> BatchView {
        let slots = self
            .tasks_list
            .iter()
            .enumerate()
            .filter_map(|(slot, task)| {
                task.as_ref().map(|t| SlotView {
                    slot,
                    req_id: t.req_id.clone(),
                    input_len: t.input_len(),
                    block_tables: t.block_tables.clone(),
                })
            })
            .collect();
        BatchView {
            real_bsz: self.real_bsz,
            slots,
        }
    }

    pub fn info(&self) -> String {
        format!(
            "ResourceManager info, total_block_number: {}, total_batch_number: {}, \
             available_block_num: {}, available_batch: {}",
            self.total_block_num(),
            self.stop_flags.len(),
            self.available_block_num(),
            self.available_batch()
        )
    }

    fn dispatch_blocks(&mut self, input_token_num: usize) -> Vec<BlockId> {
        let block_num = self
            .required_block_num(input_token_num)
            .min(self.cfg.max_query_block_num);
        if block_num > self.free_list.len() {
            error!(
                "block_num:{} > free_list len:{}",
                block_num,
                self.free_list.len()
            );
            return Vec::new();
        }
        let mut block_tables = Vec::with_capacity(block_num);
        for _ in 0..block_num {
            if let Some(block) = self.free_list.pop() {
                block_tables.push(block);
            }
        }
        debug!("dispatch {} blocks", block_tables.len());
        block_tables
    }

    fn recycle_blocks(&mut self, block_tables: Vec<BlockId>) {
        let recycled = block_tables.len();
        self.free_list.extend(block_tables);
        debug!("recycle {} blocks", recycled);
    }

    fn recompute_real_bsz(&mut self) {
        self.real_bsz = self
            .stop_flags
            .iter()
            .rposition(|free| !free)
            .map(|i| i + 1)
            .unwrap_or(0);
    }
}
