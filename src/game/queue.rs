//! The engine task queue: the world's only serializing point.
//!
//! Producers on any thread push tasks; the single engine thread pops and
//! runs them in arrival order. Deferred tasks sit in a min-heap beside the
//! FIFO and become eligible at their deadline, earliest first, FIFO among
//! equal deadlines. Tasks carry a creature tag so a despawn can drop
//! whatever is still queued for that creature.

use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, VecDeque};
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::world::creature::CreatureId;

pub struct TaskQueue<T> {
    inner: Mutex<Inner<T>>,
    cond: Condvar,
}

struct Inner<T> {
    fifo: VecDeque<(CreatureId, T)>,
    deferred: BinaryHeap<Deferred<T>>,
    next_seq: u64,
    shutdown: bool,
}

struct Deferred<T> {
    deadline: Instant,
    seq: u64,
    tag: CreatureId,
    task: T,
}

impl<T> PartialEq for Deferred<T> {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl<T> Eq for Deferred<T> {}

impl<T> PartialOrd for Deferred<T> {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for Deferred<T> {
    // Reversed so the BinaryHeap pops the earliest deadline first.
    fn cmp(&self, other: &Self) -> CmpOrdering {
        (other.deadline, other.seq).cmp(&(self.deadline, self.seq))
    }
}

impl<T> Default for TaskQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> TaskQueue<T> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                fifo: VecDeque::new(),
                deferred: BinaryHeap::new(),
                next_seq: 0,
                shutdown: false,
            }),
            cond: Condvar::new(),
        }
    }

    pub fn push(&self, tag: CreatureId, task: T) {
        let mut inner = self.inner.lock().expect("queue lock");
        if inner.shutdown {
            return;
        }
        inner.fifo.push_back((tag, task));
        self.cond.notify_one();
    }

    pub fn push_at(&self, tag: CreatureId, deadline: Instant, task: T) {
        let mut inner = self.inner.lock().expect("queue lock");
        if inner.shutdown {
            return;
        }
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.deferred.push(Deferred {
            deadline,
            seq,
            tag,
            task,
        });
        self.cond.notify_one();
    }

    pub fn push_deferred(&self, tag: CreatureId, delay: Duration, task: T) {
        self.push_at(tag, Instant::now() + delay, task);
    }

    /// Drops every queued and deferred task carrying the tag.
    pub fn cancel_all(&self, tag: CreatureId) {
        let mut inner = self.inner.lock().expect("queue lock");
        inner.fifo.retain(|(t, _)| *t != tag);
        let deferred = std::mem::take(&mut inner.deferred);
        inner.deferred = deferred.into_iter().filter(|d| d.tag != tag).collect();
    }

    /// Starts the drain: pending FIFO tasks still pop, not-yet-due deferred
    /// tasks are dropped, and `pop` returns `None` once the FIFO is empty.
    pub fn shutdown(&self) {
        let mut inner = self.inner.lock().expect("queue lock");
        inner.shutdown = true;
        inner.deferred.clear();
        self.cond.notify_all();
    }

    /// Blocks until a task is runnable. Ready deferred tasks go before FIFO
    /// tasks so movement cooldowns stay punctual under load.
    pub fn pop(&self) -> Option<T> {
        let mut inner = self.inner.lock().expect("queue lock");
        loop {
            let now = Instant::now();
            if inner
                .deferred
                .peek()
                .map(|d| d.deadline <= now)
                .unwrap_or(false)
            {
                return Some(inner.deferred.pop().expect("peeked").task);
            }
            if let Some((_, task)) = inner.fifo.pop_front() {
                return Some(task);
            }
            if inner.shutdown {
                return None;
            }
            match inner.deferred.peek().map(|d| d.deadline) {
                Some(deadline) => {
                    let wait = deadline.saturating_duration_since(now);
                    let (guard, _) = self
                        .cond
                        .wait_timeout(inner, wait)
                        .expect("queue lock");
                    inner = guard;
                }
                None => {
                    inner = self.cond.wait(inner).expect("queue lock");
                }
            }
        }
    }

    /// Non-blocking variant for loops that interleave other work.
    pub fn try_pop(&self) -> Option<T> {
        let mut inner = self.inner.lock().expect("queue lock");
        let now = Instant::now();
        if inner
            .deferred
            .peek()
            .map(|d| d.deadline <= now)
            .unwrap_or(false)
        {
            return Some(inner.deferred.pop().expect("peeked").task);
        }
        inner.fifo.pop_front().map(|(_, task)| task)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    const TAG_A: CreatureId = CreatureId(1);
    const TAG_B: CreatureId = CreatureId(2);

    #[test]
    fn fifo_order_is_preserved() {
        let queue: TaskQueue<u32> = TaskQueue::new();
        for i in 0..10 {
            queue.push(TAG_A, i);
        }
        for i in 0..10 {
            assert_eq!(queue.try_pop(), Some(i));
        }
        assert_eq!(queue.try_pop(), None);
    }

    #[test]
    fn ready_deferred_tasks_run_before_fifo() {
        let queue: TaskQueue<&str> = TaskQueue::new();
        queue.push_at(TAG_A, Instant::now() - Duration::from_millis(1), "deferred");
        queue.push(TAG_B, "fifo");
        assert_eq!(queue.try_pop(), Some("deferred"));
        assert_eq!(queue.try_pop(), Some("fifo"));
    }

    #[test]
    fn deferred_tasks_fire_earliest_first_fifo_on_ties() {
        let queue: TaskQueue<&str> = TaskQueue::new();
        let base = Instant::now() - Duration::from_millis(10);
        queue.push_at(TAG_A, base + Duration::from_millis(5), "late");
        queue.push_at(TAG_A, base, "early-1");
        queue.push_at(TAG_A, base, "early-2");
        assert_eq!(queue.try_pop(), Some("early-1"));
        assert_eq!(queue.try_pop(), Some("early-2"));
        assert_eq!(queue.try_pop(), Some("late"));
    }

    #[test]
    fn future_deferred_tasks_wait_until_due() {
        let queue: TaskQueue<&str> = TaskQueue::new();
        queue.push_at(TAG_A, Instant::now() + Duration::from_millis(30), "later");
        assert_eq!(queue.try_pop(), None);
        let start = Instant::now();
        assert_eq!(queue.pop(), Some("later"));
        assert!(start.elapsed() >= Duration::from_millis(25));
    }

    #[test]
    fn cancel_all_drops_only_the_tag() {
        let queue: TaskQueue<&str> = TaskQueue::new();
        queue.push(TAG_A, "a1");
        queue.push(TAG_B, "b1");
        queue.push_at(TAG_A, Instant::now() - Duration::from_millis(1), "a2");
        queue.cancel_all(TAG_A);
        assert_eq!(queue.try_pop(), Some("b1"));
        assert_eq!(queue.try_pop(), None);
    }

    #[test]
    fn shutdown_drains_fifo_then_ends() {
        let queue: TaskQueue<&str> = TaskQueue::new();
        queue.push(TAG_A, "pending");
        queue.push_at(TAG_A, Instant::now() + Duration::from_secs(60), "never");
        queue.shutdown();
        assert_eq!(queue.pop(), Some("pending"));
        assert_eq!(queue.pop(), None);
        queue.push(TAG_A, "ignored");
        assert_eq!(queue.pop(), None);
    }

    #[test]
    fn cross_thread_push_wakes_a_blocked_pop() {
        let queue: Arc<TaskQueue<u32>> = Arc::new(TaskQueue::new());
        let producer = Arc::clone(&queue);
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            producer.push(TAG_A, 7);
        });
        assert_eq!(queue.pop(), Some(7));
        handle.join().expect("join");
    }
}
