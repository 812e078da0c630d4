//! Fixed-size worker pool executing priority-ordered, move-only tasks.
//!
//! Tasks return their value through a one-shot channel wrapped as a
//! [`TaskFuture`]. A worker always takes a task of the highest priority
//! present; there is no work stealing. Shutdown is cooperative: workers
//! finish their current task and exit, dropping whatever is still queued
//! (by then nobody holds the matching futures anymore).

use crossbeam_channel::{bounded, Receiver};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

/// Handle to a submitted task's eventual result.
pub struct TaskFuture<T> {
    receiver: Receiver<T>,
}

impl<T> TaskFuture<T> {
    /// Blocks until the task finishes.
    pub fn wait(self) -> T {
        self.receiver
            .recv()
            .expect("worker dropped a task whose future is still alive")
    }

    /// Returns the result if the task already finished. After `Some`, the
    /// future is spent.
    pub fn poll(&self) -> Option<T> {
        self.receiver.try_recv().ok()
    }
}

type Job = Box<dyn FnOnce() + Send + 'static>;

struct PoolState {
    /// Priority -> FIFO of jobs. Higher keys run first.
    queues: BTreeMap<i32, VecDeque<Job>>,
    running: bool,
}

struct Shared {
    state: Mutex<PoolState>,
    available: Condvar,
}

/// Worker index -> logical core to pin it to.
pub type ThreadPinning = HashMap<usize, usize>;

pub struct ThreadPool {
    shared: Arc<Shared>,
    workers: Vec<JoinHandle<()>>,
    capacity: usize,
}

impl ThreadPool {
    pub fn new(thread_count: usize, pinning: ThreadPinning) -> Self {
        let shared = Arc::new(Shared {
            state: Mutex::new(PoolState {
                queues: BTreeMap::new(),
                running: true,
            }),
            available: Condvar::new(),
        });

        let workers = (0..thread_count)
            .map(|index| {
                let shared = shared.clone();
                let core = pinning.get(&index).copied();
                std::thread::spawn(move || worker_main(&shared, core))
            })
            .collect();

        Self {
            shared,
            workers,
            capacity: thread_count,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Queues a task. Tasks of equal priority run in submission order. With
    /// a zero-sized pool the task runs inline, which keeps single-threaded
    /// operation deadlock-free.
    pub fn submit<T, F>(&self, priority: i32, task: F) -> TaskFuture<T>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let (sender, receiver) = bounded(1);
        if self.capacity == 0 {
            let _ = sender.send(task());
            return TaskFuture { receiver };
        }

        let job: Job = Box::new(move || {
            let _ = sender.send(task());
        });
        {
            let mut state = self.shared.state.lock().unwrap();
            state.queues.entry(priority).or_default().push_back(job);
        }
        self.shared.available.notify_one();
        TaskFuture { receiver }
    }

    /// Tasks waiting in the queues (not the ones currently running).
    pub fn pending_tasks(&self) -> usize {
        let state = self.shared.state.lock().unwrap();
        state.queues.values().map(VecDeque::len).sum()
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        {
            let mut state = self.shared.state.lock().unwrap();
            state.running = false;
        }
        self.shared.available.notify_all();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

fn worker_main(shared: &Shared, pin_to: Option<usize>) {
    if let Some(core) = pin_to {
        pin_to_core(core);
    }

    loop {
        let job = {
            let mut state = shared.state.lock().unwrap();
            loop {
                if let Some(job) = pop_highest_priority(&mut state.queues) {
                    break job;
                }
                if !state.running {
                    return;
                }
                state = shared.available.wait(state).unwrap();
            }
        };
        job();
    }
}

fn pop_highest_priority(queues: &mut BTreeMap<i32, VecDeque<Job>>) -> Option<Job> {
    let (&priority, queue) = queues.iter_mut().next_back()?;
    let job = queue.pop_front();
    if queue.is_empty() {
        queues.remove(&priority);
    }
    job
}

#[cfg(target_os = "linux")]
fn pin_to_core(core: usize) {
    unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_ZERO(&mut set);
        libc::CPU_SET(core % libc::CPU_SETSIZE as usize, &mut set);
        libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set);
    }
}

#[cfg(not(target_os = "linux"))]
fn pin_to_core(_core: usize) {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn runs_tasks_and_returns_results() {
        let pool = ThreadPool::new(4, ThreadPinning::new());
        let futures: Vec<_> = (0..32)
            .map(|i| pool.submit(0, move || i * i))
            .collect();
        let results: Vec<_> = futures.into_iter().map(TaskFuture::wait).collect();
        assert_eq!(results, (0..32).map(|i| i * i).collect::<Vec<_>>());
    }

    #[test]
    fn higher_priority_tasks_run_first() {
        let pool = ThreadPool::new(1, ThreadPinning::new());
        let (gate_tx, gate_rx) = bounded::<()>(0);
        // Occupy the single worker so the queue builds up.
        let blocker = pool.submit(0, move || {
            gate_rx.recv().unwrap();
        });

        let order = Arc::new(Mutex::new(Vec::new()));
        let futures: Vec<_> = [0, 5, 1, 5, -3]
            .iter()
            .map(|&priority| {
                let order = order.clone();
                pool.submit(priority, move || {
                    order.lock().unwrap().push(priority);
                })
            })
            .collect();

        gate_tx.send(()).unwrap();
        blocker.wait();
        for future in futures {
            future.wait();
        }
        assert_eq!(*order.lock().unwrap(), vec![5, 5, 1, 0, -3]);
    }

    #[test]
    fn poll_reports_completion_without_blocking() {
        let pool = ThreadPool::new(1, ThreadPinning::new());
        let (gate_tx, gate_rx) = bounded::<()>(0);
        let future = pool.submit(0, move || {
            gate_rx.recv().unwrap();
            7
        });
        assert_eq!(future.poll(), None);
        gate_tx.send(()).unwrap();
        // The worker finishes shortly after the gate opens.
        let mut result = None;
        for _ in 0..1000 {
            result = future.poll();
            if result.is_some() {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(1));
        }
        assert_eq!(result, Some(7));
    }

    #[test]
    fn zero_sized_pool_runs_inline() {
        let pool = ThreadPool::new(0, ThreadPinning::new());
        let counter = AtomicUsize::new(0);
        let future = pool.submit(3, || 41 + 1);
        assert_eq!(future.wait(), 42);
        assert_eq!(counter.load(Ordering::Relaxed), 0);
        assert_eq!(pool.pending_tasks(), 0);
    }

    #[test]
    fn drop_joins_workers() {
        let pool = ThreadPool::new(4, ThreadPinning::new());
        let counter = Arc::new(AtomicUsize::new(0));
        let futures: Vec<_> = (0..8)
            .map(|_| {
                let counter = counter.clone();
                pool.submit(0, move || {
                    counter.fetch_add(1, Ordering::Relaxed);
                })
            })
            .collect();
        for future in futures {
            future.wait();
        }
        drop(pool);
        assert_eq!(counter.load(Ordering::Relaxed), 8);
    }
}
