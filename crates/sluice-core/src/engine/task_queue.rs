//! Broadcast task queue for model-parallel workers.
//!
//! The scheduler is a single logical producer, but every worker rank must
//! observe the same batch on each round, so this is a broadcast barrier
//! rather than a work-stealing queue. A bitmask records which ranks have
//! consumed the current batch; the batch is only dropped once the mask is
//! full. `put` waits out a batch that is mid-consumption so no rank can see
//! a partially replaced list.

use std::sync::Mutex;
use std::thread;
use std::time::Duration;

use tracing::debug;

use super::task::Task;

struct Inner {
    items: Vec<Task>,
    /// Bit `r` set means rank `r` has consumed the current batch.
    consumed: u64,
}

pub struct TaskQueue {
    total_mask: u64,
    max_get_num: Option<usize>,
    inner: Mutex<Inner>,
}

impl TaskQueue {
    pub fn new(mp_num: usize, max_get_num: Option<usize>) -> Self {
        let total_mask = if mp_num >= 64 {
            u64::MAX
        } else {
            (1u64 << mp_num) - 1
        };
        Self {
            total_mask,
            max_get_num,
            inner: Mutex::new(Inner {
                items: Vec::new(),
                consumed: 0,
            }),
        }
    }

    /// Append a task for the next batch.
    ///
    /// Blocks (1 ms spin-sleep) while some but not all ranks have consumed
    /// the current batch; a put between batches never waits.
    pub fn put(&self, task: Task) {
        loop {
            {
                let mut inner = self.inner.lock().unwrap();
                let mid_consumption =
                    inner.consumed > 0 && inner.consumed < self.total_mask;
                if !mid_consumption {
                    if self.max_get_num.is_none() && inner.consumed == self.total_mask {
                        inner.items.clear();
                    }
                    inner.consumed = 0;
                    inner.items.push(task);
                    debug!("put item to queue success");
                    return;
                }
            }
            thread::sleep(Duration::from_millis(1));
        }
    }

    /// Non-blocking fetch for one rank.
    ///
    /// Copies up to `max_get_num` items (all, when unbounded) unless this
    /// rank already consumed the current batch. Returns the items and
    /// whether this call drained the batch (all ranks done).
    pub fn get(&self, rank: usize) -> (Vec<Task>, bool) {
        let position = 1u64 << rank;
        let mut items = Vec::new();
        let mut drained = false;

        let mut inner = self.inner.lock().unwrap();
        if inner.consumed & position == 0 && !inner.items.is_empty() {
            let take = self
                .max_get_num
                .unwrap_or(inner.items.len())
                .min(inner.items.len());
            items.extend(inner.items[..take].iter().cloned());

            let mut consumed = inner.consumed | position;
            debug!("rank: {} set consumed mask: {:#b}", rank, consumed);
            if consumed >= self.total_mask {
                if self.max_get_num.is_some() {
                    inner.items.drain(..take);
                } else {
                    inner.items.clear();
                }
                consumed = 0;
                drained = true;
            }
            inner.consumed = consumed;
        }
        (items, drained)
    }

    pub fn empty(&self) -> bool {
        self.inner.lock().unwrap().items.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::validate::GenerateRequest;

    fn task(req_id: &str) -> Task {
        let req = GenerateRequest {
            req_id: Some(req_id.to_string()),
            ..GenerateRequest::default()
        };
        Task::from_request(&req, vec![1, 2], 64)
    }

    fn ids(tasks: &[Task]) -> Vec<String> {
        tasks.iter().map(|t| t.req_id.clone()).collect()
    }

    #[test]
    fn all_ranks_observe_the_same_batch() {
        let queue = TaskQueue::new(3, None);
        queue.put(task("a"));
        queue.put(task("b"));

        let (items0, drained0) = queue.get(0);
        assert_eq!(ids(&items0), ["a", "b"]);
        assert!(!drained0);
        assert!(!queue.empty());

        // A rank that already consumed gets nothing until the next batch.
        let (again, _) = queue.get(0);
        assert!(again.is_empty());

        let (items1, drained1) = queue.get(1);
        assert_eq!(ids(&items1), ["a", "b"]);
        assert!(!drained1);

        let (items2, drained2) = queue.get(2);
        assert_eq!(ids(&items2), ["a", "b"]);
        assert!(drained2);
        assert!(queue.empty());

        // The mask was reset, so the next put proceeds without spinning.
        queue.put(task("c"));
        let (items0, _) = queue.get(0);
        assert_eq!(ids(&items0), ["c"]);
    }

    #[test]
    fn bounded_get_drains_only_the_consumed_prefix() {
        let queue = TaskQueue::new(2, Some(2));
        for name in ["a", "b", "c"] {
            queue.put(task(name));
        }

        let (items0, _) = queue.get(0);
        assert_eq!(ids(&items0), ["a", "b"]);
        let (items1, drained) = queue.get(1);
        assert_eq!(ids(&items1), ["a", "b"]);
        assert!(drained);

        // The tail is still queued for the next round.
        let (items0, _) = queue.get(0);
        assert_eq!(ids(&items0), ["c"]);
        let (items1, drained) = queue.get(1);
        assert_eq!(ids(&items1), ["c"]);
        assert!(drained);
        assert!(queue.empty());
    }

    #[test]
    fn put_waits_for_a_batch_mid_consumption() {
        let queue = Arc::new(TaskQueue::new(2, None));
        queue.put(task("a"));

        let (items, _) = queue.get(0);
        assert_eq!(ids(&items), ["a"]);

        // Rank 1 has not consumed yet, so this put must wait.
        let producer = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || queue.put(task("b")))
        };
        thread::sleep(Duration::from_millis(20));
        assert!(!producer.is_finished());

        let (items, drained) = queue.get(1);
        assert_eq!(ids(&items), ["a"]);
        assert!(drained);
        producer.join().unwrap();

        // "b" starts a fresh batch visible to both ranks.
        let (items0, _) = queue.get(0);
        assert_eq!(ids(&items0), ["b"]);
        let (items1, drained) = queue.get(1);
        assert_eq!(ids(&items1), ["b"]);
        assert!(drained);
    }

    #[test]
    fn single_rank_queue_drains_immediately() {
        let queue = TaskQueue::new(1, None);
        queue.put(task("a"));
        let (items, drained) = queue.get(0);
        assert_eq!(ids(&items), ["a"]);
        assert!(drained);
        assert!(queue.empty());
    }
}
