//! Bounded lock-free MPMC work queue, counting semaphores and the worker
//! pool stepping operator batches in parallel.
//!
//! The queue is the classic bounded MPMC design: a power-of-two ring of
//! cells, each carrying a sequence stamp that encodes whether the cell is
//! free for the producer or holds a value for the consumer. Producers and
//! consumers claim cells with a CAS on their position counter.
//!
//! The pool owns long-lived worker threads. Work items reference operator
//! batches by raw pointer; the rank barrier in `step_operator_range` keeps
//! every reference alive until all batches of the range completed, and the
//! batches of one range are pairwise disjoint.

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use tracing::trace;

use crate::operators::Operator;
use crate::OPERATORS_PER_TASK;

struct Cell<T> {
    sequence: AtomicUsize,
    value: UnsafeCell<MaybeUninit<T>>,
}

/// Bounded MPMC queue with power-of-two capacity.
pub struct BoundedQueue<T> {
    buffer: Box<[Cell<T>]>,
    mask: usize,
    enqueue_pos: AtomicUsize,
    dequeue_pos: AtomicUsize,
}

unsafe impl<T: Send> Send for BoundedQueue<T> {}
unsafe impl<T: Send> Sync for BoundedQueue<T> {}

impl<T> BoundedQueue<T> {
    /// `capacity` must be a power of two.
    pub fn new(capacity: usize) -> BoundedQueue<T> {
        assert!(capacity.is_power_of_two() && capacity >= 2);

        let buffer = (0..capacity)
            .map(|i| Cell {
                sequence: AtomicUsize::new(i),
                value: UnsafeCell::new(MaybeUninit::uninit()),
            })
            .collect();

        BoundedQueue {
            buffer,
            mask: capacity - 1,
            enqueue_pos: AtomicUsize::new(0),
            dequeue_pos: AtomicUsize::new(0),
        }
    }

    /// Attempts to enqueue; `false` when the queue is full.
    pub fn enqueue(&self, value: T) -> bool {
        let mut pos = self.enqueue_pos.load(Ordering::Relaxed);

        loop {
            let cell = &self.buffer[pos & self.mask];
            let seq = cell.sequence.load(Ordering::Acquire);
            let diff = seq as isize - pos as isize;

            if diff == 0 {
                match self.enqueue_pos.compare_exchange_weak(
                    pos,
                    pos + 1,
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        unsafe { (*cell.value.get()).write(value) };
                        cell.sequence.store(pos + 1, Ordering::Release);
                        return true;
                    }
                    Err(actual) => pos = actual,
                }
            } else if diff < 0 {
                return false;
            } else {
                pos = self.enqueue_pos.load(Ordering::Relaxed);
            }
        }
    }

    /// Attempts to dequeue; `None` when the queue is empty.
    pub fn dequeue(&self) -> Option<T> {
        let mut pos = self.dequeue_pos.load(Ordering::Relaxed);

        loop {
            let cell = &self.buffer[pos & self.mask];
            let seq = cell.sequence.load(Ordering::Acquire);
            let diff = seq as isize - (pos + 1) as isize;

            if diff == 0 {
                match self.dequeue_pos.compare_exchange_weak(
                    pos,
                    pos + 1,
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        let value = unsafe { (*cell.value.get()).assume_init_read() };
                        cell.sequence
                            .store(pos + self.mask + 1, Ordering::Release);
                        return Some(value);
                    }
                    Err(actual) => pos = actual,
                }
            } else if diff < 0 {
                return None;
            } else {
                pos = self.dequeue_pos.load(Ordering::Relaxed);
            }
        }
    }
}

impl<T> Drop for BoundedQueue<T> {
    fn drop(&mut self) {
        while self.dequeue().is_some() {}
    }
}

/// Counting semaphore over mutex + condvar.
pub struct Semaphore {
    count: Mutex<i64>,
    cv: Condvar,
}

impl Default for Semaphore {
    fn default() -> Self {
        Self::new(0)
    }
}

impl Semaphore {
    pub fn new(initial: i64) -> Semaphore {
        Semaphore {
            count: Mutex::new(initial),
            cv: Condvar::new(),
        }
    }

    pub fn wait(&self) {
        let mut count = self.count.lock().unwrap();
        while *count == 0 {
            count = self.cv.wait(count).unwrap();
        }
        *count -= 1;
    }

    pub fn signal(&self, n: i64) {
        let mut count = self.count.lock().unwrap();
        *count += n;
        self.cv.notify_all();
    }

    pub fn count(&self) -> i64 {
        *self.count.lock().unwrap()
    }
}

/// A batch of operators to step. `ops == null` is the quit message.
#[derive(Clone, Copy)]
struct Work {
    ops: *mut Operator,
    count: usize,
}

// Batches of one rank range are disjoint and outlive the range barrier.
unsafe impl Send for Work {}

struct WorkQueue {
    queue: BoundedQueue<Work>,
    task_sem: Semaphore,
    tasks_done_sem: Semaphore,
}

const WORK_QUEUE_SIZE: usize = 32;

fn step_work(work: Work) {
    // Safety: the enqueuing thread guarantees the batch stays alive and
    // exclusively ours until it waits out the done semaphore.
    let ops = unsafe { std::slice::from_raw_parts_mut(work.ops, work.count) };

    for op in ops {
        op.step();
    }
}

fn worker_loop(queue: Arc<WorkQueue>, id: usize) {
    trace!(target: "analysis", worker = id, "worker starting");

    loop {
        queue.task_sem.wait();

        // The caller drains the queue alongside the workers, so a credit
        // may find the queue empty; go back to waiting in that case.
        let Some(work) = queue.queue.dequeue() else {
            continue;
        };

        if work.ops.is_null() {
            queue.tasks_done_sem.signal(1);
            break;
        }

        step_work(work);
        queue.tasks_done_sem.signal(1);
    }

    trace!(target: "analysis", worker = id, "worker quitting");
}

/// Long-lived worker threads stepping rank-equal operator ranges in fixed
/// size batches. With zero workers all stepping happens on the caller.
pub struct WorkerPool {
    queue: Arc<WorkQueue>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn new(worker_count: usize) -> WorkerPool {
        let queue = Arc::new(WorkQueue {
            queue: BoundedQueue::new(WORK_QUEUE_SIZE),
            task_sem: Semaphore::new(0),
            tasks_done_sem: Semaphore::new(0),
        });

        let workers = (0..worker_count)
            .map(|id| {
                let queue = Arc::clone(&queue);
                std::thread::spawn(move || worker_loop(queue, id))
            })
            .collect();

        WorkerPool { queue, workers }
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Steps all operators in `ops`, which must all belong to one rank:
    /// they are partitioned into batches executed in any order, with the
    /// caller draining the queue alongside the workers. Returns only after
    /// every batch completed, making a rank boundary a hard barrier.
    pub fn step_operator_range(&self, ops: &mut [Operator]) {
        if ops.is_empty() {
            return;
        }

        if self.workers.is_empty() {
            for op in ops {
                op.step();
            }
            return;
        }

        debug_assert_eq!(self.queue.tasks_done_sem.count(), 0);

        let mut tasks_queued = 0i64;

        for batch in ops.chunks_mut(OPERATORS_PER_TASK) {
            let work = Work {
                ops: batch.as_mut_ptr(),
                count: batch.len(),
            };

            // The queue is sized generously; if it ever fills, draining a
            // task here makes room.
            while !self.queue.queue.enqueue(work) {
                if let Some(other) = self.queue.queue.dequeue() {
                    step_work(other);
                    self.queue.tasks_done_sem.signal(1);
                }
            }

            tasks_queued += 1;
        }

        self.queue.task_sem.signal(tasks_queued);

        // Work alongside the workers until the queue drains.
        while let Some(work) = self.queue.queue.dequeue() {
            if work.ops.is_null() {
                // Shutdown raced in; put it back for a worker.
                while !self.queue.queue.enqueue(work) {}
                continue;
            }

            step_work(work);
            self.queue.tasks_done_sem.signal(1);
        }

        // Barrier: all batches of this range are done.
        for _ in 0..tasks_queued {
            self.queue.tasks_done_sem.wait();
        }
    }

    /// Stops and joins all workers. Idempotent.
    pub fn shutdown(&mut self) {
        if self.workers.is_empty() {
            return;
        }

        let count = self.workers.len() as i64;

        for _ in 0..count {
            while !self.queue.queue.enqueue(Work { ops: std::ptr::null_mut(), count: 0 }) {}
        }

        self.queue.task_sem.signal(count);

        for _ in 0..count {
            self.queue.tasks_done_sem.wait();
        }

        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}
