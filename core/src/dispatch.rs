//! Bounded-concurrency, de-duplicating task queue
//!
//! Repeated lookups of the same key collapse onto one in-flight task:
//! every caller that adds a key while a task for it is queued or
//! running gets the same result. At most `max_concurrency` tasks run
//! at once; the rest wait in FIFO order.

use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::debug;

/// Dispatch error types
#[derive(Debug, Clone, Error)]
pub enum DispatchError {
    #[error("Task failed: {0}")]
    TaskFailed(String),
    #[error("Task dropped before it started")]
    Cleared,
}

pub type DispatchResult<T> = Result<T, DispatchError>;

type Waiter<T> = oneshot::Sender<DispatchResult<T>>;

struct QueuedTask<K, T> {
    key: K,
    task: BoxFuture<'static, Result<T, String>>,
    waiters: Vec<Waiter<T>>,
}

struct State<K, T> {
    /// Waiter lists for tasks currently executing, by key
    running: HashMap<K, Vec<Waiter<T>>>,
    queued: VecDeque<QueuedTask<K, T>>,
    in_flight: usize,
}

/// Handle to a shared task queue. Clones share the queue.
pub struct DispatchQueue<K, T> {
    state: Arc<Mutex<State<K, T>>>,
    max_concurrency: usize,
}

impl<K, T> Clone for DispatchQueue<K, T> {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
            max_concurrency: self.max_concurrency,
        }
    }
}

impl<K, T> DispatchQueue<K, T>
where
    K: Eq + Hash + Clone + Send + 'static,
    T: Clone + Send + 'static,
{
    pub fn new(max_concurrency: usize) -> Self {
        Self {
            state: Arc::new(Mutex::new(State {
                running: HashMap::new(),
                queued: VecDeque::new(),
                in_flight: 0,
            })),
            max_concurrency: max_concurrency.max(1),
        }
    }

    /// Schedule `task` under `key`, or attach to the task already
    /// queued or running under it. The receiver resolves with the
    /// task's result, shared by every coalesced caller.
    pub fn add<F>(&self, key: K, task: F) -> oneshot::Receiver<DispatchResult<T>>
    where
        F: Future<Output = Result<T, String>> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        {
            let mut state = self.state.lock();
            if let Some(waiters) = state.running.get_mut(&key) {
                waiters.push(tx);
                return rx;
            }
            if let Some(queued) = state.queued.iter_mut().find(|queued| queued.key == key) {
                queued.waiters.push(tx);
                return rx;
            }
            state.queued.push_back(QueuedTask {
                key,
                task: task.boxed(),
                waiters: vec![tx],
            });
        }
        self.pump();
        rx
    }

    /// Drop every queued-but-unstarted task; their callers resolve
    /// with `Cleared`. Running tasks finish normally.
    pub fn clear(&self) {
        let dropped: Vec<QueuedTask<K, T>> = {
            let mut state = self.state.lock();
            state.queued.drain(..).collect()
        };
        if !dropped.is_empty() {
            debug!(count = dropped.len(), "clearing queued tasks");
        }
        for task in dropped {
            for waiter in task.waiters {
                let _ = waiter.send(Err(DispatchError::Cleared));
            }
        }
    }

    pub fn queued_len(&self) -> usize {
        self.state.lock().queued.len()
    }

    pub fn in_flight(&self) -> usize {
        self.state.lock().in_flight
    }

    /// Start queued tasks while capacity allows.
    fn pump(&self) {
        loop {
            let (key, task) = {
                let mut state = self.state.lock();
                if state.in_flight >= self.max_concurrency {
                    return;
                }
                match state.queued.pop_front() {
                    Some(QueuedTask { key, task, waiters }) => {
                        state.in_flight += 1;
                        state.running.insert(key.clone(), waiters);
                        (key, task)
                    }
                    None => return,
                }
            };

            let queue = self.clone();
            tokio::spawn(async move {
                let result = task.await;
                let waiters = {
                    let mut state = queue.state.lock();
                    state.in_flight -= 1;
                    state.running.remove(&key).unwrap_or_default()
                };
                for waiter in waiters {
                    let shared = match &result {
                        Ok(value) => Ok(value.clone()),
                        Err(error) => Err(DispatchError::TaskFailed(error.clone())),
                    };
                    let _ = waiter.send(shared);
                }
                queue.pump();
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::Notify;

    #[tokio::test]
    async fn test_same_key_coalesces_to_one_execution() {
        let queue: DispatchQueue<String, u32> = DispatchQueue::new(4);
        let executions = Arc::new(AtomicUsize::new(0));
        let gate = Arc::new(Notify::new());

        let mut receivers = Vec::new();
        for _ in 0..5 {
            let executions = Arc::clone(&executions);
            let gate = Arc::clone(&gate);
            receivers.push(queue.add("alice".to_string(), async move {
                gate.notified().await;
                executions.fetch_add(1, Ordering::SeqCst);
                Ok(7)
            }));
        }
        // let the first task start, then release it
        tokio::time::sleep(Duration::from_millis(10)).await;
        gate.notify_waiters();

        for receiver in receivers {
            assert_eq!(receiver.await.unwrap().unwrap(), 7);
        }
        assert_eq!(executions.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_distinct_keys_run_independently() {
        let queue: DispatchQueue<String, String> = DispatchQueue::new(4);
        let a = queue.add("a".to_string(), async { Ok("ra".to_string()) });
        let b = queue.add("b".to_string(), async { Ok("rb".to_string()) });
        assert_eq!(a.await.unwrap().unwrap(), "ra");
        assert_eq!(b.await.unwrap().unwrap(), "rb");
    }

    #[tokio::test]
    async fn test_failure_reaches_every_caller_then_key_is_free() {
        let queue: DispatchQueue<String, u32> = DispatchQueue::new(1);
        let gate = Arc::new(Notify::new());

        let first = {
            let gate = Arc::clone(&gate);
            queue.add("k".to_string(), async move {
                gate.notified().await;
                Err("boom".to_string())
            })
        };
        let second = queue.add("k".to_string(), async { Ok(1) });
        tokio::time::sleep(Duration::from_millis(10)).await;
        gate.notify_waiters();

        for receiver in [first, second] {
            match receiver.await.unwrap() {
                Err(DispatchError::TaskFailed(message)) => assert_eq!(message, "boom"),
                other => panic!("unexpected result: {other:?}"),
            }
        }

        // a fresh attempt under the same key runs again
        let retry = queue.add("k".to_string(), async { Ok(2) });
        assert_eq!(retry.await.unwrap().unwrap(), 2);
    }

    #[tokio::test]
    async fn test_concurrency_is_bounded() {
        let queue: DispatchQueue<u32, u32> = DispatchQueue::new(2);
        let live = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut receivers = Vec::new();
        for key in 0..6 {
            let live = Arc::clone(&live);
            let peak = Arc::clone(&peak);
            receivers.push(queue.add(key, async move {
                let now = live.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                live.fetch_sub(1, Ordering::SeqCst);
                Ok(key)
            }));
        }
        for receiver in receivers {
            receiver.await.unwrap().unwrap();
        }
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn test_clear_drops_queued_but_not_running() {
        let queue: DispatchQueue<u32, u32> = DispatchQueue::new(1);
        let gate = Arc::new(Notify::new());

        let running = {
            let gate = Arc::clone(&gate);
            queue.add(1, async move {
                gate.notified().await;
                Ok(10)
            })
        };
        let queued = queue.add(2, async { Ok(20) });
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(queue.queued_len(), 1);

        queue.clear();
        assert!(matches!(queued.await.unwrap(), Err(DispatchError::Cleared)));

        gate.notify_waiters();
        assert_eq!(running.await.unwrap().unwrap(), 10);
    }
}
