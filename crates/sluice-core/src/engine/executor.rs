//! Seam to the native model executor.
//!
//! The engine never interprets model internals: it hands the executor a
//! batch descriptor (newly admitted tasks plus the active slot layout) and
//! reads back one fixed-shape step output per decode iteration. The step
//! frame layout is `[control, batch, token_0 .. token_{batch-1}]` where a
//! control word of `-2` means "no output this step" and a per-slot `-1`
//! means the slot produced nothing.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::Mutex;

use serde::Serialize;
use tracing::{debug, info};

use crate::error::{Error, Result};

use super::task::{BatchView, Task};

/// Control word: the executor produced nothing this step.
pub const STEP_SKIP: i64 = -2;
/// Per-slot word: this slot produced no token this step.
pub const SLOT_IDLE: i64 = -1;

/// One decode step worth of sampled token ids.
#[derive(Debug, Clone)]
pub struct StepOutput(Vec<i64>);

impl StepOutput {
    pub fn new(words: Vec<i64>) -> Self {
        Self(words)
    }

    pub fn control(&self) -> i64 {
        self.0.first().copied().unwrap_or(STEP_SKIP)
    }

    pub fn is_skip(&self) -> bool {
        self.control() == STEP_SKIP
    }

    /// Active batch count advertised by the executor.
    pub fn batch_len(&self) -> usize {
        self.0.get(1).copied().unwrap_or(0).max(0) as usize
    }

    /// Raw word for slot `i`; negative when the slot produced nothing.
    pub fn slot_word(&self, i: usize) -> i64 {
        self.0.get(2 + i).copied().unwrap_or(SLOT_IDLE)
    }
}

/// The model executor as the engine sees it.
pub trait ModelExecutor: Send + Sync {
    /// Launch the next prefill+decode step.
    fn start_batch(&self, new_tasks: &[Task], view: &BatchView) -> Result<()>;

    /// Block until the executor publishes the next step output for `rank`.
    fn recv_step(&self, rank: usize) -> Result<StepOutput>;
}

#[derive(Serialize)]
struct TaskDescriptor<'a> {
    req_id: &'a str,
    slot: usize,
    input_ids: &'a [u32],
    block_tables: &'a [usize],
    max_dec_len: usize,
    min_dec_len: usize,
    topp: f32,
    temperature: f32,
    penalty_score: f32,
    frequency_score: f32,
    presence_score: f32,
    eos_token_ids: &'a [u32],
    infer_seed: i64,
}

#[derive(Serialize)]
struct SlotDescriptor<'a> {
    slot: usize,
    req_id: &'a str,
    input_len: usize,
    block_tables: &'a [usize],
}

#[derive(Serialize)]
struct BatchDescriptor<'a> {
    real_bsz: usize,
    new_tasks: Vec<TaskDescriptor<'a>>,
    active_slots: Vec<SlotDescriptor<'a>>,
}

/// Bridge to a native worker process over a length-prefixed TCP protocol.
///
/// Batch descriptors go out as a big-endian u32 length followed by JSON;
/// step outputs come back as a big-endian u32 byte length followed by that
/// many little-endian i64 words.
pub struct SocketExecutor {
    writer: Mutex<TcpStream>,
    reader: Mutex<TcpStream>,
}

impl SocketExecutor {
    /// Dial the worker. Startup fails if the worker is not listening.
    pub fn connect(port: u16) -> Result<Self> {
        let stream = TcpStream::connect(("127.0.0.1", port)).map_err(|e| {
            Error::ExecutorError(format!("cannot reach inference worker on port {}: {}", port, e))
        })?;
        stream.set_nodelay(true)?;
        let reader = stream.try_clone()?;
        info!("connected to inference worker on port {}", port);
        Ok(Self {
            writer: Mutex::new(stream),
            reader: Mutex::new(reader),
        })
    }
}

impl ModelExecutor for SocketExecutor {
    fn start_batch(&self, new_tasks: &[Task], view: &BatchView) -> Result<()> {
        let descriptor = BatchDescriptor {
            real_bsz: view.real_bsz,
            new_tasks: new_tasks
                .iter()
                .map(|t| TaskDescriptor {
                    req_id: &t.req_id,
                    slot: t.slot.unwrap_or_default(),
                    input_ids: &t.input_ids,
                    block_tables: &t.block_tables,
                    max_dec_len: t.max_dec_len,
                    min_dec_len: t.min_dec_len,
                    topp: t.topp,
                    temperature: t.temperature,
                    penalty_score: t.penalty_score,
                    frequency_score: t.frequency_score,
                    presence_score: t.presence_score,
                    eos_token_ids: &t.eos_token_ids,
                    infer_seed: t.infer_seed.unwrap_or_default(),
                })
                .collect(),
            active_slots: view
                .slots
                .iter()
                .map(|s| SlotDescriptor {
                    slot: s.slot,
                    req_id: &s.req_id,
                    input_len: s.input_len,
                    block_tables: &s.block_tables,
                })
                .collect(),
        };

        let payload = serde_json::to_vec(&descriptor)?;
        let mut writer = self.writer.lock().unwrap();
        writer.write_all(&(payload.len() as u32).to_be_bytes())?;
        writer.write_all(&payload)?;
        writer.flush()?;
        debug!(
            "dispatched batch: {} new tasks, real_bsz {}",
            new_tasks.len(),
            view.real_bsz
        );
        Ok(())
    }

    fn recv_step(&self, rank: usize) -> Result<StepOutput> {
        let mut reader = self.reader.lock().unwrap();
        let mut length_buf = [0u8; 4];
        reader.read_exact(&mut length_buf)?;
        let byte_len = u32::from_be_bytes(length_buf) as usize;
        if byte_len % 8 != 0 {
            return Err(Error::ExecutorError(format!(
                "rank {}: step frame of {} bytes is not a whole number of words",
                rank, byte_len
            )));
        }

        let mut payload = vec![0u8; byte_len];
        reader.read_exact(&mut payload)?;
        let words = payload
            .chunks_exact(8)
            .map(|chunk| {
                let mut buf = [0u8; 8];
                buf.copy_from_slice(chunk);
                i64::from_le_bytes(buf)
            })
            .collect();
        Ok(StepOutput::new(words))
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Channel-backed executor for driving the engine in tests.

    use std::sync::mpsc::{channel, Receiver, Sender};
    use std::sync::{Arc, Mutex};

    use super::*;

    pub(crate) struct ChannelExecutor {
        steps: Mutex<Receiver<StepOutput>>,
        pub(crate) batches: Mutex<Vec<(Vec<Task>, BatchView)>>,
    }

    impl ChannelExecutor {
        pub(crate) fn new() -> (Arc<Self>, Sender<StepOutput>) {
            let (tx, rx) = channel();
            let executor = Arc::new(Self {
                steps: Mutex::new(rx),
                batches: Mutex::new(Vec::new()),
            });
            (executor, tx)
        }
    }

    impl ModelExecutor for ChannelExecutor {
        fn start_batch(&self, new_tasks: &[Task], view: &BatchView) -> Result<()> {
            self.batches
                .lock()
                .unwrap()
                .push((new_tasks.to_vec(), view.clone()));
            Ok(())
        }

        fn recv_step(&self, _rank: usize) -> Result<StepOutput> {
            self.steps
                .lock()
                .unwrap()
                .recv()
                .map_err(|_| Error::ExecutorError("step output channel closed".to_string()))
        }
    }

    #[test]
    fn step_output_layout() {
        let step = StepOutput::new(vec![0, 2, 11, -1]);
        assert!(!step.is_skip());
        assert_eq!(step.batch_len(), 2);
        assert_eq!(step.slot_word(0), 11);
        assert_eq!(step.slot_word(1), SLOT_IDLE);
        // Out-of-range slots read as idle.
        assert_eq!(step.slot_word(5), SLOT_IDLE);

        assert!(StepOutput::new(vec![STEP_SKIP, 0]).is_skip());
    }
}
