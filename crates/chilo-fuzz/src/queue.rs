//! Bounded FIFO queues connecting pipeline stages.
//!
//! `spec.md` §5 models these as queues with "standard producer/consumer
//! blocking semantics" shared by a configurable number of worker tasks per
//! stage. `tokio::sync::mpsc` channels are single-consumer by construction,
//! so [`Queue`] wraps the receiving half in an `Arc<tokio::sync::Mutex<_>>`
//! that worker tasks take turns locking — the same role a shared
//! `queue.Queue` plays across `threading.Thread`s in the original.

use std::sync::Arc;

use tokio::sync::{mpsc, Mutex as AsyncMutex};

use crate::pool::MutatorArtifact;
use crate::seed::SeedId;

/// `{seed_id, mutate_budget, from_structural}` — carried by the parse,
/// generate, and structural queues. `from_structural` tracks whether this
/// task re-entered the pipeline via a structural rewrite rather than a
/// host-supplied seed, so it can be threaded onto the artifact it eventually
/// produces (`spec.md` §9's `is_from_structural_mutator`).
#[derive(Debug, Clone)]
pub struct SeedTask {
    pub seed_id: SeedId,
    pub mutate_budget: u32,
    pub from_structural: bool,
}

/// `{seed_id, mutate_budget, code_text, from_structural}` — carried by the
/// fix queue.
#[derive(Debug, Clone)]
pub struct FixTask {
    pub seed_id: SeedId,
    pub mutate_budget: u32,
    pub code_text: String,
    pub from_structural: bool,
}

/// A bounded, multi-consumer FIFO queue.
#[derive(Debug)]
pub struct Queue<T> {
    sender: mpsc::Sender<T>,
    receiver: Arc<AsyncMutex<mpsc::Receiver<T>>>,
}

impl<T> Clone for Queue<T> {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
            receiver: Arc::clone(&self.receiver),
        }
    }
}

impl<T> Queue<T> {
    pub fn bounded(capacity: usize) -> Self {
        let (sender, receiver) = mpsc::channel(capacity);
        Self {
            sender,
            receiver: Arc::new(AsyncMutex::new(receiver)),
        }
    }

    /// Enqueues a task. Never used on the host's hot `fuzz()`/`fuzz_count()`
    /// path directly; those call [`Queue::try_send`] so they never suspend.
    pub async fn send(&self, item: T) {
        // The queue only closes when every worker task (and thus every
        // receiver clone) has been dropped, which happens only at process
        // exit; a closed channel here indicates the process is tearing down.
        let _ = self.sender.send(item).await;
    }

    pub fn try_send(&self, item: T) -> Result<(), mpsc::error::TrySendError<T>> {
        self.sender.try_send(item)
    }

    /// Waits for the next task, sharing the receiver across worker tasks.
    pub async fn recv(&self) -> Option<T> {
        let mut receiver = self.receiver.lock().await;
        receiver.recv().await
    }

    /// Non-blocking dequeue, used by `mutate_once`'s first selection phase.
    pub fn try_recv(&self) -> Option<T> {
        let mut receiver = self.receiver.try_lock().ok()?;
        receiver.try_recv().ok()
    }

    /// Blocks the calling (non-async) thread until an item is available.
    /// Only ever called from the host's synchronous `fuzz()` entry point,
    /// never from inside a stage worker.
    pub fn blocking_recv(&self) -> Option<T> {
        let mut receiver = self.receiver.blocking_lock();
        receiver.blocking_recv()
    }

    pub fn len(&self) -> usize {
        self.sender.max_capacity() - self.sender.capacity()
    }
}

/// The five queues wiring the pipeline together, per `spec.md` §2.
#[derive(Debug, Clone)]
pub struct Queues {
    pub parse: Queue<SeedTask>,
    pub generate: Queue<SeedTask>,
    pub fix: Queue<FixTask>,
    pub ready: Queue<MutatorArtifact>,
    pub structural: Queue<SeedTask>,
}

impl Queues {
    pub fn new(capacity: usize) -> Self {
        Self {
            parse: Queue::bounded(capacity),
            generate: Queue::bounded(capacity),
            fix: Queue::bounded(capacity),
            ready: Queue::bounded(capacity.max(64)),
            structural: Queue::bounded(capacity),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn send_then_recv_round_trips() {
        let queue: Queue<u32> = Queue::bounded(4);
        queue.send(7).await;
        assert_eq!(queue.recv().await, Some(7));
    }

    #[tokio::test]
    async fn try_recv_on_empty_queue_is_none() {
        let queue: Queue<u32> = Queue::bounded(4);
        assert_eq!(queue.try_recv(), None);
    }

    #[tokio::test]
    async fn multiple_consumers_share_the_receiver() {
        let queue: Queue<u32> = Queue::bounded(4);
        queue.send(1).await;
        queue.send(2).await;
        let clone = queue.clone();
        let first = queue.recv().await;
        let second = clone.recv().await;
        let mut results = vec![first.unwrap(), second.unwrap()];
        results.sort_unstable();
        assert_eq!(results, vec![1, 2]);
    }
}
