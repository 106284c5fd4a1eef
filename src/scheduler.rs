//! Shared background task pool
//!
//! One pool serves every engine in a database: periodic maintenance sweeps,
//! coalesced durable dumps and spin-down monitors all run here, while user
//! operations stay on caller threads. Tasks are plain closures; periodic
//! tasks observe a [`CancellationToken`] and stop rescheduling themselves
//! once it fires.

use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam::channel::{unbounded, Receiver, Sender};
use parking_lot::{Condvar, Mutex};

type Job = Box<dyn FnOnce() + Send>;

/// Cooperative cancellation flag shared with a periodic task.
#[derive(Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

enum TimerJob {
    OneShot(Job),
    Periodic {
        every: Duration,
        token: CancellationToken,
        task: Arc<dyn Fn() + Send + Sync>,
    },
}

struct TimerEntry {
    at: Instant,
    job: TimerJob,
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.at == other.at
    }
}

impl Eq for TimerEntry {}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // BinaryHeap is a max-heap; invert so the earliest deadline pops first.
        other.at.cmp(&self.at)
    }
}

struct TimerState {
    queue: BinaryHeap<TimerEntry>,
    shutdown: bool,
}

struct Shared {
    timer: Mutex<TimerState>,
    timer_signal: Condvar,
}

/// Fixed-size worker pool with a timer thread for delayed and periodic work.
///
/// The pool owns one end of the job channel; dropping it (or calling
/// [`TaskPool::shutdown`]) disconnects the workers once the timer thread
/// has also released its clone, so every thread winds down.
pub struct TaskPool {
    shared: Arc<Shared>,
    sender: Mutex<Option<Sender<Job>>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl TaskPool {
    pub fn new(workers: usize) -> Arc<Self> {
        let workers = workers.max(1);
        let (sender, receiver) = unbounded::<Job>();
        let shared = Arc::new(Shared {
            timer: Mutex::new(TimerState {
                queue: BinaryHeap::new(),
                shutdown: false,
            }),
            timer_signal: Condvar::new(),
        });

        let mut handles = Vec::with_capacity(workers + 1);
        for _ in 0..workers {
            let rx: Receiver<Job> = receiver.clone();
            handles.push(std::thread::spawn(move || {
                while let Ok(job) = rx.recv() {
                    job();
                }
            }));
        }

        let timer_shared = Arc::clone(&shared);
        let timer_sender = sender.clone();
        handles.push(std::thread::spawn(move || {
            Self::timer_loop(timer_shared, timer_sender)
        }));

        Arc::new(Self {
            shared,
            sender: Mutex::new(Some(sender)),
            handles: Mutex::new(handles),
        })
    }

    /// Run a job on the pool as soon as a worker is free.
    pub fn execute(&self, job: impl FnOnce() + Send + 'static) {
        if let Some(sender) = self.sender.lock().as_ref() {
            let _ = sender.send(Box::new(job));
        }
    }

    /// Run a job after the given delay.
    pub fn schedule_after(&self, delay: Duration, job: impl FnOnce() + Send + 'static) {
        let mut timer = self.shared.timer.lock();
        if timer.shutdown {
            return;
        }
        timer.queue.push(TimerEntry {
            at: Instant::now() + delay,
            job: TimerJob::OneShot(Box::new(job)),
        });
        drop(timer);
        self.shared.timer_signal.notify_one();
    }

    /// Run a task every `every` until the token is cancelled. The first run
    /// happens one full interval from now.
    pub fn schedule_periodic(
        &self,
        every: Duration,
        token: CancellationToken,
        task: impl Fn() + Send + Sync + 'static,
    ) {
        let mut timer = self.shared.timer.lock();
        if timer.shutdown {
            return;
        }
        timer.queue.push(TimerEntry {
            at: Instant::now() + every,
            job: TimerJob::Periodic {
                every,
                token,
                task: Arc::new(task),
            },
        });
        drop(timer);
        self.shared.timer_signal.notify_one();
    }

    fn timer_loop(shared: Arc<Shared>, sender: Sender<Job>) {
        let mut timer = shared.timer.lock();
        loop {
            if timer.shutdown {
                return;
            }
            let now = Instant::now();
            // dispatch everything due
            while timer.queue.peek().map(|e| e.at <= now).unwrap_or(false) {
                let Some(entry) = timer.queue.pop() else {
                    break;
                };
                match entry.job {
                    TimerJob::OneShot(job) => {
                        let _ = sender.send(job);
                    }
                    TimerJob::Periodic { every, token, task } => {
                        if token.is_cancelled() {
                            continue;
                        }
                        let run = Arc::clone(&task);
                        let _ = sender.send(Box::new(move || run()));
                        timer.queue.push(TimerEntry {
                            at: now + every,
                            job: TimerJob::Periodic { every, token, task },
                        });
                    }
                }
            }
            match timer.queue.peek().map(|e| e.at) {
                Some(next) => {
                    let wait = next.saturating_duration_since(Instant::now());
                    shared
                        .timer_signal
                        .wait_for(&mut timer, wait.max(Duration::from_millis(1)));
                }
                None => shared.timer_signal.wait(&mut timer),
            }
        }
    }

    /// Stop the timer, disconnect the workers and join every thread. Called
    /// (without the join) on drop.
    pub fn shutdown(&self) {
        if !self.request_stop() {
            return;
        }
        let handles = std::mem::take(&mut *self.handles.lock());
        for handle in handles {
            let _ = handle.join();
        }
    }

    fn request_stop(&self) -> bool {
        {
            let mut timer = self.shared.timer.lock();
            if timer.shutdown {
                return false;
            }
            timer.shutdown = true;
            timer.queue.clear();
        }
        self.shared.timer_signal.notify_all();
        // workers disconnect once this and the timer thread's clone are gone
        *self.sender.lock() = None;
        true
    }
}

impl Drop for TaskPool {
    fn drop(&mut self) {
        // no join here: a worker may hold the last Arc to this pool
        self.request_stop();
    }
}

/// One-shot completion cell. Producers complete it exactly once; any number
/// of threads may wait, and late waiters observe the recorded outcome.
#[derive(Clone)]
pub struct Completion {
    inner: Arc<CompletionInner>,
}

struct CompletionInner {
    // None = pending; Some(None) = success; Some(Some(msg)) = failure
    state: Mutex<Option<Option<String>>>,
    signal: Condvar,
}

impl Completion {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(CompletionInner {
                state: Mutex::new(None),
                signal: Condvar::new(),
            }),
        }
    }

    pub fn complete_ok(&self) {
        self.complete(None);
    }

    pub fn complete_err(&self, message: impl Into<String>) {
        self.complete(Some(message.into()));
    }

    fn complete(&self, outcome: Option<String>) {
        let mut state = self.inner.state.lock();
        if state.is_none() {
            *state = Some(outcome);
            self.inner.signal.notify_all();
        }
    }

    pub fn is_done(&self) -> bool {
        self.inner.state.lock().is_some()
    }

    /// Block until completed; `Err` carries the failure message.
    pub fn wait(&self) -> std::result::Result<(), String> {
        let mut state = self.inner.state.lock();
        loop {
            match &*state {
                Some(None) => return Ok(()),
                Some(Some(message)) => return Err(message.clone()),
                None => self.inner.signal.wait(&mut state),
            }
        }
    }
}

impl Default for Completion {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn execute_runs_jobs() {
        let pool = TaskPool::new(2);
        let done = Completion::new();
        let signal = done.clone();
        pool.execute(move || signal.complete_ok());
        assert!(done.wait().is_ok());
        pool.shutdown();
    }

    #[test]
    fn schedule_after_delays() {
        let pool = TaskPool::new(1);
        let started = Instant::now();
        let done = Completion::new();
        let signal = done.clone();
        pool.schedule_after(Duration::from_millis(30), move || signal.complete_ok());
        done.wait().unwrap();
        assert!(started.elapsed() >= Duration::from_millis(25));
        pool.shutdown();
    }

    #[test]
    fn periodic_task_stops_on_cancel() {
        let pool = TaskPool::new(1);
        let token = CancellationToken::new();
        let count = Arc::new(AtomicUsize::new(0));

        let task_count = Arc::clone(&count);
        pool.schedule_periodic(Duration::from_millis(5), token.clone(), move || {
            task_count.fetch_add(1, Ordering::SeqCst);
        });

        std::thread::sleep(Duration::from_millis(60));
        token.cancel();
        let seen = count.load(Ordering::SeqCst);
        assert!(seen >= 3, "expected several runs, saw {seen}");

        std::thread::sleep(Duration::from_millis(30));
        let after = count.load(Ordering::SeqCst);
        // at most one in-flight run after cancellation
        assert!(after <= seen + 1);
        pool.shutdown();
    }

    #[test]
    fn completion_reports_failure_to_all_waiters() {
        let done = Completion::new();
        let w1 = done.clone();
        let w2 = done.clone();
        let t1 = std::thread::spawn(move || w1.wait());
        let t2 = std::thread::spawn(move || w2.wait());
        done.complete_err("disk on fire");
        assert_eq!(t1.join().unwrap().unwrap_err(), "disk on fire");
        assert_eq!(t2.join().unwrap().unwrap_err(), "disk on fire");
        // completing twice is a no-op
        done.complete_ok();
        assert_eq!(done.wait().unwrap_err(), "disk on fire");
    }
}
