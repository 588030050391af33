//! Engine assembly.
//!
//! Wires the queue, resource manager, output router and the two persistent
//! threads (scheduler, token processor) around the executor seam, and
//! exposes the submission entry point the serving edge calls.

pub mod executor;
pub mod health;
pub mod output;
pub mod resource_manager;
pub mod scheduler;
pub mod task;
pub mod task_queue;
pub mod token_processor;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use tokio::sync::mpsc::UnboundedReceiver;
use tracing::info;

use crate::config::EngineConfig;
use crate::data::DataProcessor;
use crate::error::{Error, Result};
use crate::validate::{add_default_params, check_basic_params, GenerateRequest};

pub use executor::{ModelExecutor, SocketExecutor, StepOutput, SLOT_IDLE, STEP_SKIP};
pub use health::{HealthError, HealthState};
pub use output::{OutputRouter, ResultEvent};
pub use resource_manager::{AllocateOutcome, ResourceManager};
pub use scheduler::Scheduler;
pub use task::{BatchView, BlockId, SlotView, Task, TokenId};
pub use task_queue::TaskQueue;
pub use token_processor::TokenProcessor;

pub struct Engine {
    cfg: Arc<EngineConfig>,
    data: Arc<DataProcessor>,
    resources: Arc<Mutex<ResourceManager>>,
    queue: Arc<TaskQueue>,
    router: Arc<OutputRouter>,
    health: Arc<HealthState>,
    shutdown: Arc<AtomicBool>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl Engine {
    /// Wire the engine around an executor and spawn its threads.
    pub fn start(
        cfg: EngineConfig,
        data: DataProcessor,
        executor: Arc<dyn ModelExecutor>,
    ) -> Result<Arc<Self>> {
        let cfg = Arc::new(cfg);
        let data = Arc::new(data);
        let resources = Arc::new(Mutex::new(ResourceManager::new(cfg.clone())));
        // One in-process consumer; fan-out to the `mp_num` model-parallel
        // ranks happens behind the executor seam.
        let queue = Arc::new(TaskQueue::new(1, cfg.max_get_num));
        let router = Arc::new(OutputRouter::new());
        let health = Arc::new(HealthState::new(cfg.check_health_interval));
        let shutdown = Arc::new(AtomicBool::new(false));

        let scheduler = Scheduler::new(
            0,
            queue.clone(),
            resources.clone(),
            executor.clone(),
            router.clone(),
            health.clone(),
            shutdown.clone(),
        );
        let scheduler_handle = scheduler.spawn()?;

        let processor = TokenProcessor::new(
            cfg.clone(),
            resources.clone(),
            router.clone(),
            data.clone(),
            health.clone(),
        );
        let processor_handle = processor.spawn(executor, 0)?;

        health.mark_started();
        health.mark_ready();
        health.heartbeat();
        info!("engine started: {}", cfg.summary());

        Ok(Arc::new(Self {
            cfg,
            data,
            resources,
            queue,
            router,
            health,
            shutdown,
            threads: Mutex::new(vec![scheduler_handle, processor_handle]),
        }))
    }

    /// Validate, normalize, tokenize and enqueue a request.
    ///
    /// On success the caller gets the request's result stream; validation
    /// failures are returned synchronously and the request is never
    /// enqueued. May block briefly while a prior batch is mid-consumption;
    /// async callers should wrap this in a blocking section.
    pub fn submit(&self, mut req: GenerateRequest) -> Result<UnboundedReceiver<ResultEvent>> {
        let errors = check_basic_params(&mut req);
        if !errors.is_empty() {
            return Err(Error::ValidationError(errors));
        }
        add_default_params(&mut req);

        let task = self.data.process_request(&req)?;
        let rx = self.router.subscribe(&task.req_id)?;
        self.queue.put(task);
        Ok(rx)
    }

    pub fn health(&self) -> &HealthState {
        &self.health
    }

    pub fn config(&self) -> &EngineConfig {
        &self.cfg
    }

    /// Current admission headroom, for logging and introspection.
    pub fn resource_info(&self) -> String {
        self.resources.lock().unwrap().info()
    }

    /// Stop the scheduler loop. The token processor exits once the executor
    /// closes its output stream; threads still blocked there are left to
    /// the process rather than joined.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        std::thread::sleep(std::time::Duration::from_millis(5));
        let mut threads = self.threads.lock().unwrap();
        for handle in threads.drain(..) {
            if handle.is_finished() {
                let _ = handle.join();
            }
        }
        info!("engine shut down, {} streams still open", self.router.active_streams());
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::executor::testing::ChannelExecutor;
    use super::*;
    use crate::data::tests::word_tokenizer;

    fn test_engine() -> (Arc<Engine>, Arc<ChannelExecutor>, std::sync::mpsc::Sender<StepOutput>)
    {
        let cfg = EngineConfig {
            max_batch_size: 2,
            max_seq_len: 16,
            max_dec_len: 8,
            block_size: 4,
            dec_token_num: 4,
            max_query_block_num: 8,
            max_block_num: 16,
            seq_len_limit: 16,
            dec_len_limit: 8,
            model_max_length: 32,
            ..EngineConfig::default()
        };
        let data = DataProcessor::from_tokenizer(word_tokenizer(), vec![7], &cfg);
        let (executor, step_tx) = ChannelExecutor::new();
        let engine = Engine::start(cfg, data, executor.clone()).expect("engine start");
        (engine, executor, step_tx)
    }

    fn request(req_id: &str, text: &str) -> GenerateRequest {
        GenerateRequest {
            req_id: Some(req_id.to_string()),
            text: Some(text.to_string()),
            ..GenerateRequest::default()
        }
    }

    #[test]
    fn submit_streams_tokens_to_completion() {
        let (engine, executor, step_tx) = test_engine();
        let mut rx = engine.submit(request("e2e", "hello world")).unwrap();

        // Wait until the scheduler admitted and dispatched the task.
        for _ in 0..500 {
            if !executor.batches.lock().unwrap().is_empty() {
                break;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        assert!(!executor.batches.lock().unwrap().is_empty());

        step_tx.send(StepOutput::new(vec![0, 1, 0])).unwrap();
        step_tx.send(StepOutput::new(vec![0, 1, 1])).unwrap();
        step_tx.send(StepOutput::new(vec![0, 1, 7])).unwrap();

        let first = rx.blocking_recv().expect("first event");
        assert_eq!(first.send_idx, 0);
        assert_eq!(first.token, "hello");
        let second = rx.blocking_recv().expect("second event");
        assert_eq!(second.token, " world");
        let terminal = rx.blocking_recv().expect("terminal event");
        assert_eq!(terminal.is_end, 1);
        assert_eq!(terminal.result.as_deref(), Some("hello world"));
        assert!(rx.blocking_recv().is_none());

        engine.shutdown();
    }

    #[test]
    fn validation_failures_are_synchronous() {
        let (engine, _executor, _step_tx) = test_engine();
        let result = engine.submit(GenerateRequest {
            req_id: Some("bad".to_string()),
            text: Some(String::new()),
            ..GenerateRequest::default()
        });
        match result {
            Err(Error::ValidationError(errors)) => {
                assert_eq!(errors.len(), 1);
                assert!(errors[0].contains("`text`"));
            }
            other => panic!("expected validation error, got {:?}", other.map(|_| ())),
        }
        engine.shutdown();
    }

    #[test]
    fn an_active_req_id_cannot_be_resubmitted() {
        let (engine, _executor, _step_tx) = test_engine();
        let _rx = engine.submit(request("dup", "hello")).unwrap();
        assert!(matches!(
            engine.submit(request("dup", "hello")),
            Err(Error::DuplicateRequest(_))
        ));
        engine.shutdown();
    }
}
