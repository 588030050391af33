//! The admission loop.
//!
//! One persistent thread per rank: drain the broadcast queue into a local
//! backlog, admit what fits through the ResourceManager, hand the admitted
//! batch and the active-slot layout to the executor, stamp the liveness
//! heartbeat. Tasks that do not fit stay in the backlog and are re-offered
//! on the next tick; capacity shortfall is back-pressure, never an error.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::{debug, error};

use crate::error::Result;

use super::executor::ModelExecutor;
use super::health::HealthState;
use super::output::{OutputRouter, ResultEvent};
use super::resource_manager::ResourceManager;
use super::task::Task;
use super::task_queue::TaskQueue;

const TICK: Duration = Duration::from_millis(2);

pub struct Scheduler {
    rank: usize,
    queue: Arc<TaskQueue>,
    resources: Arc<Mutex<ResourceManager>>,
    executor: Arc<dyn ModelExecutor>,
    router: Arc<OutputRouter>,
    health: Arc<HealthState>,
    shutdown: Arc<AtomicBool>,
    /// Tasks pulled from the queue but not yet admitted.
    backlog: Vec<Task>,
}

impl Scheduler {
    pub fn new(
        rank: usize,
        queue: Arc<TaskQueue>,
        resources: Arc<Mutex<ResourceManager>>,
        executor: Arc<dyn ModelExecutor>,
        router: Arc<OutputRouter>,
        health: Arc<HealthState>,
        shutdown: Arc<AtomicBool>,
    ) -> Self {
        Self {
            rank,
            queue,
            resources,
            executor,
            router,
            health,
            shutdown,
            backlog: Vec::new(),
        }
    }

    pub fn spawn(mut self) -> Result<JoinHandle<()>> {
        let handle = std::thread::Builder::new()
            .name(format!("scheduler-{}", self.rank))
            .spawn(move || {
                while !self.shutdown.load(Ordering::Acquire) {
                    self.tick();
                    std::thread::sleep(TICK);
                }
                debug!("scheduler rank {} stopped", self.rank);
            })?;
        Ok(handle)
    }

    fn tick(&mut self) {
        self.health.heartbeat();

        let (items, _) = self.queue.get(self.rank);
        if !items.is_empty() {
            debug!("rank {} pulled {} tasks from queue", self.rank, items.len());
            self.backlog.extend(items);
        }
        if self.backlog.is_empty() {
            return;
        }

        let (admitted, dropped, view) = {
            let mut resources = self.resources.lock().unwrap();
            let outcome = resources.allocate(std::mem::take(&mut self.backlog));
            self.backlog = outcome.deferred;
            (outcome.admitted, outcome.dropped, resources.batch_view())
        };
        for task in dropped {
            // Rejected for good; terminate the client stream instead of
            // letting it idle out.
            self.router.send(ResultEvent::error(
                task.req_id,
                "input_ids length exceeds max_seq_len",
                400,
            ));
        }
        if admitted.is_empty() {
            // Nothing fit this round; the backlog is re-offered next tick.
            return;
        }

        if let Err(e) = self.executor.start_batch(&admitted, &view) {
            error!("rank {} failed to dispatch batch: {}", self.rank, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::engine::executor::testing::ChannelExecutor;
    use crate::validate::GenerateRequest;

    fn test_config(max_batch_size: usize) -> Arc<EngineConfig> {
        Arc::new(EngineConfig {
            max_batch_size,
            max_seq_len: 16,
            max_dec_len: 8,
            block_size: 4,
            dec_token_num: 4,
            max_query_block_num: 8,
            max_block_num: 16,
            ..EngineConfig::default()
        })
    }

    fn task(req_id: &str) -> Task {
        let req = GenerateRequest {
            req_id: Some(req_id.to_string()),
            ..GenerateRequest::default()
        };
        Task::from_request(&req, vec![1, 2], 8)
    }

    fn wait_for<F: Fn() -> bool>(what: &str, predicate: F) {
        for _ in 0..500 {
            if predicate() {
                return;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        panic!("timed out waiting for {}", what);
    }

    #[test]
    fn admits_from_queue_and_dispatches_to_the_executor() {
        let cfg = test_config(2);
        let queue = Arc::new(TaskQueue::new(1, None));
        let resources = Arc::new(Mutex::new(ResourceManager::new(cfg)));
        let (executor, _step_tx) = ChannelExecutor::new();
        let router = Arc::new(OutputRouter::new());
        let health = Arc::new(HealthState::new(10));
        let shutdown = Arc::new(AtomicBool::new(false));

        let scheduler = Scheduler::new(
            0,
            queue.clone(),
            resources.clone(),
            executor.clone(),
            router,
            health,
            shutdown.clone(),
        );
        let handle = scheduler.spawn().unwrap();

        queue.put(task("q1"));
        wait_for("batch dispatch", || {
            !executor.batches.lock().unwrap().is_empty()
        });

        let batches = executor.batches.lock().unwrap();
        let (new_tasks, view) = &batches[0];
        assert_eq!(new_tasks.len(), 1);
        assert_eq!(new_tasks[0].req_id, "q1");
        assert_eq!(new_tasks[0].slot, Some(0));
        assert_eq!(view.real_bsz, 1);
        drop(batches);

        shutdown.store(true, Ordering::Release);
        handle.join().unwrap();
    }

    #[test]
    fn deferred_tasks_are_retried_when_capacity_frees() {
        let cfg = test_config(1);
        let queue = Arc::new(TaskQueue::new(1, None));
        let resources = Arc::new(Mutex::new(ResourceManager::new(cfg)));
        let (executor, _step_tx) = ChannelExecutor::new();
        let router = Arc::new(OutputRouter::new());
        let health = Arc::new(HealthState::new(10));
        let shutdown = Arc::new(AtomicBool::new(false));

        let scheduler = Scheduler::new(
            0,
            queue.clone(),
            resources.clone(),
            executor.clone(),
            router,
            health,
            shutdown.clone(),
        );
        let handle = scheduler.spawn().unwrap();

        queue.put(task("first"));
        queue.put(task("second"));
        wait_for("first dispatch", || {
            !executor.batches.lock().unwrap().is_empty()
        });
        // Only one slot exists, so "second" waits in the backlog.
        assert_eq!(resources.lock().unwrap().available_batch(), 0);

        resources.lock().unwrap().recycle(0);
        wait_for("second dispatch", || {
            executor.batches.lock().unwrap().len() >= 2
        });
        let batches = executor.batches.lock().unwrap();
        assert_eq!(batches[1].0[0].req_id, "second");
        drop(batches);

        shutdown.store(true, Ordering::Release);
        handle.join().unwrap();
    }

    #[test]
    fn oversize_tasks_get_a_terminal_error_event() {
        let cfg = test_config(2);
        let queue = Arc::new(TaskQueue::new(1, None));
        let resources = Arc::new(Mutex::new(ResourceManager::new(cfg)));
        let (executor, _step_tx) = ChannelExecutor::new();
        let router = Arc::new(OutputRouter::new());
        let health = Arc::new(HealthState::new(10));
        let shutdown = Arc::new(AtomicBool::new(false));

        let scheduler = Scheduler::new(
            0,
            queue.clone(),
            resources,
            executor,
            router.clone(),
            health,
            shutdown.clone(),
        );
        let handle = scheduler.spawn().unwrap();

        let mut rx = router.subscribe("huge").unwrap();
        let req = GenerateRequest {
            req_id: Some("huge".to_string()),
            ..GenerateRequest::default()
        };
        queue.put(Task::from_request(&req, vec![1; 200], 8));

        wait_for("rejection event", || router.active_streams() == 0);
        let event = rx.blocking_recv().expect("error event");
        assert_eq!(event.is_end, 1);
        assert_eq!(event.error_code, 400);
        assert!(!event.error_msg.is_empty());

        shutdown.store(true, Ordering::Release);
        handle.join().unwrap();
    }
}
