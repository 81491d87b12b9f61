//! Background job processing for the Brio JIT backend
//!
//! The job processor is the thread-pool collaborator the code generator
//! registers with: the generator supplies job ids, the pool calls back
//! through [`JobManager`] to process them and to report completion or
//! failure. Jobs are identified by plain ids so the manager keeps full
//! ownership of the underlying work items; the processor only ever holds
//! ids, which keeps the lock ordering one-directional (manager lock is
//! never taken while the processor lock is held by the same call chain).
//!
//! Two implementations exist: [`BackgroundJobProcessor`] with a pool of
//! dedicated worker threads, and [`ForegroundJobProcessor`] for the
//! degenerate single-threaded configuration, where jobs only run when a
//! caller explicitly waits for them.

use parking_lot::{Condvar, Mutex, MutexGuard};
use rustc_hash::FxHashSet;
use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use std::thread;
use tracing::{debug, trace};

/// Identifies one job. The manager maps ids back to its own work items.
pub type JobId = u64;

/// Callbacks the processor makes into the owner of the jobs.
///
/// All callbacks are invoked without the processor's internal lock held,
/// so a manager may call back into the processor from any of them.
pub trait JobManager: Send + Sync + 'static {
    /// Process one job. `background` is false when the job runs inline on
    /// the requesting thread. Returns whether the job succeeded.
    fn process(&self, job: JobId, background: bool) -> bool;

    /// Called exactly once per job after processing, or with
    /// `succeeded = false` for jobs drained unprocessed at close.
    fn job_processed(&self, job: JobId, succeeded: bool);

    /// Asked before falling back to inline processing when the queue is
    /// deep; the manager decides based on current queue depth.
    fn should_process_in_foreground(&self, queue_depth: usize) -> bool {
        let _ = queue_depth;
        false
    }

    /// A job was picked up by a worker without anyone waiting on it.
    fn job_selected_without_wait(&self, job: JobId) {
        let _ = job;
    }

    /// Profiling hooks around a blocking wait for a specific job.
    fn before_wait(&self) {}
    fn after_wait(&self) {}
}

/// The processor interface the code generator schedules against.
pub trait JobProcessor: Send + Sync {
    /// Attach the manager the processor calls back into. Must be called
    /// before any job is added.
    fn register_manager(&self, manager: Weak<dyn JobManager>);

    /// Queue a job. Critical jobs form a higher class that is dequeued
    /// before any normal job regardless of arrival order; order within a
    /// class is FIFO. A deep queue may instead run the job inline on the
    /// calling thread when the manager's
    /// [`JobManager::should_process_in_foreground`] says so.
    fn add_job(&self, job: JobId, critical: bool);

    /// Whether the job is currently queued or in flight.
    fn was_added(&self, job: JobId) -> bool;

    /// Move a queued job to the front of its class. Returns false if the
    /// job is not queued (already running, done, or never added).
    fn prioritize_job(&self, job: JobId) -> bool;

    /// Move the job to the front and block until it completes. Returns
    /// false if the job is unknown to the processor.
    fn prioritize_job_and_wait(&self, job: JobId) -> bool;

    /// Best-effort removal of a queued job. Returns false if the job has
    /// already started processing; the caller must then leave it alone.
    fn remove_job(&self, job: JobId) -> bool;

    /// Approximate number of queued (not yet started) jobs.
    fn queue_depth(&self) -> usize;

    /// Whether jobs actually run on background threads.
    fn is_background(&self) -> bool;

    /// Stop accepting work, drain queued jobs as failures, and join the
    /// workers. Safe to call while jobs are in flight; in-flight jobs run
    /// to completion (no preemption primitive exists).
    fn close(&self);
}

#[derive(Default)]
struct ProcessorState {
    /// Critical jobs; drained before any normal job.
    high: VecDeque<JobId>,
    normal: VecDeque<JobId>,
    in_flight: FxHashSet<JobId>,
    completed: FxHashSet<JobId>,
    closed: bool,
    manager: Option<Weak<dyn JobManager>>,
}

impl ProcessorState {
    fn pop_next(&mut self) -> Option<JobId> {
        self.high.pop_front().or_else(|| self.normal.pop_front())
    }

    fn is_queued(&self, job: JobId) -> bool {
        self.high.contains(&job) || self.normal.contains(&job)
    }

    fn queue_len(&self) -> usize {
        self.high.len() + self.normal.len()
    }

    fn push(&mut self, job: JobId, critical: bool) {
        if critical {
            self.high.push_back(job);
        } else {
            self.normal.push_back(job);
        }
    }

    /// Move a queued job to the front of whichever class it sits in.
    fn move_to_class_front(&mut self, job: JobId) -> bool {
        for queue in [&mut self.high, &mut self.normal] {
            if let Some(pos) = queue.iter().position(|&j| j == job) {
                queue.remove(pos);
                queue.push_front(job);
                return true;
            }
        }
        false
    }

    fn remove_queued(&mut self, job: JobId) -> bool {
        for queue in [&mut self.high, &mut self.normal] {
            if let Some(pos) = queue.iter().position(|&j| j == job) {
                queue.remove(pos);
                return true;
            }
        }
        false
    }

    /// Drain everything still queued, critical class first.
    fn drain_queued(&mut self) -> Vec<JobId> {
        self.high.drain(..).chain(self.normal.drain(..)).collect()
    }
}

struct Shared {
    state: Mutex<ProcessorState>,
    work_available: Condvar,
    job_done: Condvar,
}

impl Shared {
    fn manager(&self) -> Option<Arc<dyn JobManager>> {
        self.state.lock().manager.as_ref().and_then(Weak::upgrade)
    }
}

/// Thread-pool job processor.
pub struct BackgroundJobProcessor {
    shared: Arc<Shared>,
    workers: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl BackgroundJobProcessor {
    pub fn new(thread_count: usize) -> Self {
        let shared = Arc::new(Shared {
            state: Mutex::new(ProcessorState::default()),
            work_available: Condvar::new(),
            job_done: Condvar::new(),
        });

        let mut workers = Vec::with_capacity(thread_count);
        for i in 0..thread_count.max(1) {
            let shared = Arc::clone(&shared);
            let handle = thread::Builder::new()
                .name(format!("brio-jit-bg-{i}"))
                .spawn(move || worker_loop(shared))
                .expect("failed to spawn jit worker thread");
            workers.push(handle);
        }

        Self {
            shared,
            workers: Mutex::new(workers),
        }
    }
}

fn worker_loop(shared: Arc<Shared>) {
    loop {
        let job = {
            let mut state = shared.state.lock();
            loop {
                if state.closed {
                    return;
                }
                if let Some(job) = state.pop_next() {
                    state.in_flight.insert(job);
                    break job;
                }
                shared.work_available.wait(&mut state);
            }
        };

        let Some(manager) = shared.manager() else {
            // Manager dropped out from under us; retire the job quietly.
            let mut state = shared.state.lock();
            state.in_flight.remove(&job);
            state.completed.insert(job);
            shared.job_done.notify_all();
            continue;
        };

        manager.job_selected_without_wait(job);
        trace!(job, "processing background job");
        let succeeded = manager.process(job, true);

        {
            let mut state = shared.state.lock();
            state.in_flight.remove(&job);
            state.completed.insert(job);
        }
        manager.job_processed(job, succeeded);
        shared.job_done.notify_all();
    }
}

impl JobProcessor for BackgroundJobProcessor {
    fn register_manager(&self, manager: Weak<dyn JobManager>) {
        self.shared.state.lock().manager = Some(manager);
    }

    fn add_job(&self, job: JobId, critical: bool) {
        let manager = self.shared.manager();
        let depth = {
            let state = self.shared.state.lock();
            if state.closed {
                return;
            }
            state.queue_len()
        };
        // A deep queue means the background threads are far behind; the
        // manager may prefer running this one inline over queueing it at
        // the back.
        if let Some(m) = manager.filter(|m| m.should_process_in_foreground(depth)) {
            {
                let mut state = self.shared.state.lock();
                if state.closed {
                    return;
                }
                state.in_flight.insert(job);
            }
            trace!(job, depth, "deep queue, processing inline");
            let succeeded = m.process(job, false);
            {
                let mut state = self.shared.state.lock();
                state.in_flight.remove(&job);
                state.completed.insert(job);
            }
            m.job_processed(job, succeeded);
            self.shared.job_done.notify_all();
            return;
        }
        {
            let mut state = self.shared.state.lock();
            if state.closed {
                return;
            }
            state.push(job, critical);
        }
        self.shared.work_available.notify_one();
    }

    fn was_added(&self, job: JobId) -> bool {
        let state = self.shared.state.lock();
        state.is_queued(job) || state.in_flight.contains(&job)
    }

    fn prioritize_job(&self, job: JobId) -> bool {
        self.shared.state.lock().move_to_class_front(job)
    }

    fn prioritize_job_and_wait(&self, job: JobId) -> bool {
        let manager = self.shared.manager();
        let mut state = self.shared.state.lock();
        if !state.is_queued(job)
            && !state.in_flight.contains(&job)
            && !state.completed.contains(&job)
        {
            return false;
        }
        if state.move_to_class_front(job) {
            self.shared.work_available.notify_one();
        }
        while !state.completed.contains(&job) {
            if state.closed && !state.in_flight.contains(&job) && !state.is_queued(job) {
                return false;
            }
            if let Some(m) = &manager {
                // Callbacks run unlocked; before_wait may add jobs, so
                // recheck completion before committing to the wait.
                MutexGuard::unlocked(&mut state, || m.before_wait());
                if state.completed.contains(&job) {
                    break;
                }
            }
            self.shared.job_done.wait(&mut state);
            if let Some(m) = &manager {
                MutexGuard::unlocked(&mut state, || m.after_wait());
            }
        }
        true
    }

    fn remove_job(&self, job: JobId) -> bool {
        let mut state = self.shared.state.lock();
        if state.in_flight.contains(&job) {
            // Too late: a worker already started it.
            return false;
        }
        state.remove_queued(job)
    }

    fn queue_depth(&self) -> usize {
        self.shared.state.lock().queue_len()
    }

    fn is_background(&self) -> bool {
        true
    }

    fn close(&self) {
        let manager = self.shared.manager();
        let drained: Vec<JobId> = {
            let mut state = self.shared.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            let drained = state.drain_queued();
            for &job in &drained {
                state.completed.insert(job);
            }
            drained
        };
        debug!(drained = drained.len(), "closing background job processor");

        if let Some(manager) = manager {
            for job in drained {
                manager.job_processed(job, false);
            }
        }
        self.shared.work_available.notify_all();
        self.shared.job_done.notify_all();

        let workers = std::mem::take(&mut *self.workers.lock());
        for handle in workers {
            let _ = handle.join();
        }
    }
}

impl Drop for BackgroundJobProcessor {
    fn drop(&mut self) {
        self.close();
    }
}

/// Degenerate single-threaded processor: jobs sit queued until a caller
/// waits for one, at which point it runs inline on the calling thread.
pub struct ForegroundJobProcessor {
    state: Mutex<ProcessorState>,
}

impl ForegroundJobProcessor {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ProcessorState::default()),
        }
    }

    fn manager(&self) -> Option<Arc<dyn JobManager>> {
        self.state.lock().manager.as_ref().and_then(Weak::upgrade)
    }
}

impl Default for ForegroundJobProcessor {
    fn default() -> Self {
        Self::new()
    }
}

impl JobProcessor for ForegroundJobProcessor {
    fn register_manager(&self, manager: Weak<dyn JobManager>) {
        self.state.lock().manager = Some(manager);
    }

    fn add_job(&self, job: JobId, critical: bool) {
        let mut state = self.state.lock();
        if state.closed {
            return;
        }
        state.push(job, critical);
    }

    fn was_added(&self, job: JobId) -> bool {
        self.state.lock().is_queued(job)
    }

    fn prioritize_job(&self, job: JobId) -> bool {
        self.state.lock().move_to_class_front(job)
    }

    fn prioritize_job_and_wait(&self, job: JobId) -> bool {
        let found = {
            let mut state = self.state.lock();
            if state.completed.contains(&job) {
                return true;
            }
            state.remove_queued(job)
        };
        if !found {
            return false;
        }
        let Some(manager) = self.manager() else {
            return false;
        };
        let succeeded = manager.process(job, false);
        self.state.lock().completed.insert(job);
        manager.job_processed(job, succeeded);
        true
    }

    fn remove_job(&self, job: JobId) -> bool {
        self.state.lock().remove_queued(job)
    }

    fn queue_depth(&self) -> usize {
        self.state.lock().queue_len()
    }

    fn is_background(&self) -> bool {
        false
    }

    fn close(&self) {
        let manager = self.manager();
        let drained: Vec<JobId> = {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            let drained = state.drain_queued();
            for &job in &drained {
                state.completed.insert(job);
            }
            drained
        };
        if let Some(manager) = manager {
            for job in drained {
                manager.job_processed(job, false);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct CountingManager {
        processed: AtomicUsize,
        failed: AtomicUsize,
        retired: AtomicUsize,
    }

    impl CountingManager {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                processed: AtomicUsize::new(0),
                failed: AtomicUsize::new(0),
                retired: AtomicUsize::new(0),
            })
        }
    }

    impl JobManager for CountingManager {
        fn process(&self, _job: JobId, _background: bool) -> bool {
            self.processed.fetch_add(1, Ordering::SeqCst);
            true
        }

        fn job_processed(&self, _job: JobId, succeeded: bool) {
            if !succeeded {
                self.failed.fetch_add(1, Ordering::SeqCst);
            }
            self.retired.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn background_processor_runs_jobs() {
        let manager = CountingManager::new();
        let processor = BackgroundJobProcessor::new(2);
        processor.register_manager(Arc::downgrade(&manager) as Weak<dyn JobManager>);

        for job in 0..8 {
            processor.add_job(job, false);
        }
        for job in 0..8 {
            assert!(processor.prioritize_job_and_wait(job));
        }
        assert_eq!(manager.processed.load(Ordering::SeqCst), 8);
        assert_eq!(manager.failed.load(Ordering::SeqCst), 0);
        processor.close();
    }

    #[test]
    fn close_drains_unstarted_jobs_as_failures() {
        let manager = CountingManager::new();
        // Zero requested threads still spawns one worker; park it behind a
        // slow job so queued work stays unstarted.
        struct SlowManager(Arc<CountingManager>);
        impl JobManager for SlowManager {
            fn process(&self, job: JobId, background: bool) -> bool {
                thread::sleep(Duration::from_millis(100));
                self.0.process(job, background)
            }
            fn job_processed(&self, job: JobId, succeeded: bool) {
                self.0.job_processed(job, succeeded);
            }
        }
        let slow = Arc::new(SlowManager(Arc::clone(&manager)));
        let processor = BackgroundJobProcessor::new(1);
        processor.register_manager(Arc::downgrade(&slow) as Weak<dyn JobManager>);

        for job in 0..4 {
            processor.add_job(job, false);
        }
        // Give the worker a moment to pick up the first job.
        thread::sleep(Duration::from_millis(20));
        processor.close();

        let retired = manager.retired.load(Ordering::SeqCst);
        let failed = manager.failed.load(Ordering::SeqCst);
        assert_eq!(retired, 4);
        assert!(failed >= 3, "queued jobs must be drained as failures, failed={failed}");
    }

    #[test]
    fn remove_job_is_best_effort() {
        let manager = CountingManager::new();
        let processor = BackgroundJobProcessor::new(1);
        processor.register_manager(Arc::downgrade(&manager) as Weak<dyn JobManager>);

        // Not added at all.
        assert!(!processor.remove_job(42));

        processor.add_job(1, false);
        processor.add_job(2, false);
        // One of the two may already be in flight; the other must still be
        // removable or already done.
        let _ = processor.remove_job(2);
        processor.close();
    }

    #[test]
    fn critical_jobs_drain_ahead_of_normal_ones() {
        struct OrderManager(Mutex<Vec<JobId>>);
        impl JobManager for OrderManager {
            fn process(&self, _job: JobId, _background: bool) -> bool {
                true
            }
            fn job_processed(&self, job: JobId, _succeeded: bool) {
                self.0.lock().push(job);
            }
        }

        let manager = Arc::new(OrderManager(Mutex::new(Vec::new())));
        let processor = ForegroundJobProcessor::new();
        processor.register_manager(Arc::downgrade(&manager) as Weak<dyn JobManager>);
        processor.add_job(1, false);
        processor.add_job(2, true);
        processor.add_job(3, false);
        assert_eq!(processor.queue_depth(), 3);
        assert!(processor.was_added(2));
        // Front of its own class, not past the critical job.
        assert!(processor.prioritize_job(3));

        processor.close();
        assert_eq!(*manager.0.lock(), vec![2, 3, 1]);
    }

    #[test]
    fn deep_queue_runs_new_jobs_inline() {
        struct InlineManager {
            backgrounds: Mutex<Vec<bool>>,
        }
        impl JobManager for InlineManager {
            fn process(&self, _job: JobId, background: bool) -> bool {
                self.backgrounds.lock().push(background);
                true
            }
            fn job_processed(&self, _job: JobId, _succeeded: bool) {}
            fn should_process_in_foreground(&self, _queue_depth: usize) -> bool {
                true
            }
        }

        let manager = Arc::new(InlineManager {
            backgrounds: Mutex::new(Vec::new()),
        });
        let processor = BackgroundJobProcessor::new(1);
        processor.register_manager(Arc::downgrade(&manager) as Weak<dyn JobManager>);

        // The manager always claims the queue is too deep, so add_job
        // runs the job on this thread before returning.
        processor.add_job(1, false);
        assert_eq!(*manager.backgrounds.lock(), vec![false]);
        assert_eq!(processor.queue_depth(), 0);
        assert!(processor.prioritize_job_and_wait(1));
        processor.close();
    }

    #[test]
    fn foreground_processor_runs_inline_on_wait() {
        let manager = CountingManager::new();
        let processor = ForegroundJobProcessor::new();
        processor.register_manager(Arc::downgrade(&manager) as Weak<dyn JobManager>);

        processor.add_job(7, false);
        assert_eq!(manager.processed.load(Ordering::SeqCst), 0);
        assert!(processor.prioritize_job_and_wait(7));
        assert_eq!(manager.processed.load(Ordering::SeqCst), 1);
        assert!(!processor.prioritize_job_and_wait(8));
    }
}
