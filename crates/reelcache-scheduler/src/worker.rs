//! Caching worker pool.
//!
//! Workers are persistent threads that park on a condition variable between
//! dispatches. A dispatch bumps a generation counter; each worker runs its
//! caching loop once per generation it observes, so any number of wake-ups
//! during a loop coalesce into one more pass. A cooperative stop flag is
//! checked between frames.

use crate::evaluator::EvalContext;
use crate::scheduler::{admit, Shared};
use parking_lot::{Condvar, Mutex};
use reelcache_core::{CacheError, Frame, Result};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

/// What a worker is doing right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WorkerState {
    #[default]
    Idle,
    Selecting,
    Evaluating,
    Admitting,
}

struct SignalState {
    generation: u64,
    stopping: bool,
    shutdown: bool,
    active: usize,
    seen: Vec<u64>,
    states: Vec<WorkerState>,
}

/// Park/wake and stop coordination shared by the pool and the scheduler.
pub(crate) struct Signal {
    state: Mutex<SignalState>,
    cond: Condvar,
    /// Mirrors `stopping || shutdown` for lock-free checks between frames.
    halt: AtomicBool,
}

impl Signal {
    pub(crate) fn new(workers: usize) -> Self {
        Self {
            state: Mutex::new(SignalState {
                generation: 0,
                stopping: false,
                shutdown: false,
                active: 0,
                seen: vec![0; workers],
                states: vec![WorkerState::Idle; workers],
            }),
            cond: Condvar::new(),
            halt: AtomicBool::new(false),
        }
    }

    /// Start a new generation. Parked workers run their loop again.
    pub(crate) fn awaken(&self) {
        let mut s = self.state.lock();
        s.generation += 1;
        trace!(generation = s.generation, "awakening workers");
        self.cond.notify_all();
    }

    pub(crate) fn halted(&self) -> bool {
        self.halt.load(Ordering::Acquire)
    }

    /// Stop every worker between frames and wait until all are parked.
    /// Wake-ups issued before the call are discarded.
    pub(crate) fn stop_and_wait(&self) {
        let mut s = self.state.lock();
        if s.shutdown {
            return;
        }
        s.stopping = true;
        self.halt.store(true, Ordering::Release);
        while s.active > 0 {
            self.cond.wait(&mut s);
        }
        let generation = s.generation;
        s.seen.iter_mut().for_each(|seen| *seen = generation);
        s.stopping = false;
        self.halt.store(false, Ordering::Release);
    }

    pub(crate) fn shutdown(&self) {
        let mut s = self.state.lock();
        s.shutdown = true;
        self.halt.store(true, Ordering::Release);
        self.cond.notify_all();
    }

    /// Park until there is a generation this worker has not run. Returns
    /// false on shutdown.
    fn wait_for_work(&self, id: usize) -> bool {
        let mut s = self.state.lock();
        loop {
            if s.shutdown {
                return false;
            }
            if !s.stopping && s.seen[id] != s.generation {
                s.seen[id] = s.generation;
                s.active += 1;
                return true;
            }
            self.cond.wait(&mut s);
        }
    }

    fn finished(&self, id: usize) {
        let mut s = self.state.lock();
        s.active -= 1;
        s.states[id] = WorkerState::Idle;
        self.cond.notify_all();
    }

    fn set_state(&self, id: usize, state: WorkerState) {
        self.state.lock().states[id] = state;
    }

    pub(crate) fn states(&self) -> Vec<WorkerState> {
        self.state.lock().states.clone()
    }

    pub(crate) fn is_running(&self) -> bool {
        self.state.lock().active > 0
    }

    /// Wait until every worker has run the latest generation and parked.
    pub(crate) fn wait_until_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut s = self.state.lock();
        loop {
            let generation = s.generation;
            if s.active == 0 && s.seen.iter().all(|&seen| seen == generation) {
                return true;
            }
            if self.cond.wait_until(&mut s, deadline).timed_out() {
                let generation = s.generation;
                return s.active == 0 && s.seen.iter().all(|&seen| seen == generation);
            }
        }
    }
}

/// The caching threads.
pub(crate) struct WorkerPool {
    workers: Vec<Worker>,
}

impl WorkerPool {
    pub(crate) fn spawn(shared: &Arc<Shared>, count: usize) -> Result<Self> {
        let mut workers = Vec::with_capacity(count);
        for id in 0..count {
            workers.push(Worker::spawn(id, Arc::clone(shared))?);
        }
        debug!(count, "caching workers started");
        Ok(Self { workers })
    }

    pub(crate) fn len(&self) -> usize {
        self.workers.len()
    }

    /// Join every thread. The signal must already be shut down.
    pub(crate) fn join(&mut self) {
        for worker in &mut self.workers {
            if let Some(thread) = worker.thread.take() {
                if thread.join().is_err() {
                    warn!(worker = worker.id, "caching worker panicked");
                }
            }
        }
    }
}

struct Worker {
    id: usize,
    thread: Option<JoinHandle<()>>,
}

impl Worker {
    fn spawn(id: usize, shared: Arc<Shared>) -> Result<Self> {
        let thread = thread::Builder::new()
            .name(format!("reelcache-worker-{}", id))
            .spawn(move || Self::run(id, &shared))
            .map_err(CacheError::Io)?;
        Ok(Self {
            id,
            thread: Some(thread),
        })
    }

    fn run(id: usize, shared: &Shared) {
        while shared.signal.wait_for_work(id) {
            // Only the single-thread lane reads slow media.
            if id == 0 || !shared.slow_media.load(Ordering::Acquire) {
                cache_loop(id, shared);
            }
            shared.signal.finished(id);
        }
        trace!(worker = id, "caching worker exiting");
    }
}

/// One worker's caching pass: keep selecting, evaluating and admitting
/// frames until there is nothing worth caching, the cache pushes back, or
/// the pass is stopped.
fn cache_loop(id: usize, shared: &Shared) {
    let lane = id == 0;
    let signal = &shared.signal;
    let mut max_group = shared.config.max_group_size(shared.slow_media.load(Ordering::Acquire));
    let mut group: Vec<Frame> = Vec::new();
    let mut failed: BTreeSet<Frame> = BTreeSet::new();
    let mut cached = 0usize;

    while !signal.halted() {
        if let Some(node) = shared.pop_output() {
            signal.set_state(id, WorkerState::Evaluating);
            match shared.evaluator.evaluate_output(&node, &EvalContext::worker(id)) {
                Ok(Some(buffer)) => {
                    shared.cache.lock().add(buffer, 0, false, Some(&node));
                }
                Ok(None) => {}
                Err(e) => warn!(worker = id, node = %node, error = %e, "output evaluation failed"),
            }
            continue;
        }

        if group.is_empty() {
            signal.set_state(id, WorkerState::Selecting);
            shared
                .cache
                .lock()
                .initiate_caching_of_best_frame_group(&mut group, max_group);
        }
        // Groups come in decreasing order; take the lowest frame first.
        let Some(frame) = group.pop() else {
            trace!(worker = id, "nothing worth caching");
            break;
        };
        if failed.contains(&frame) {
            shared.cache.lock().complete_caching_of_frame(frame);
            debug!(worker = id, frame, "frame failed earlier in this pass, parking");
            break;
        }

        let poor_access = match shared.evaluator.test_evaluate(frame) {
            Ok(report) => Some(report.poor_random_access),
            Err(e) => {
                warn!(worker = id, frame, error = %e, "test evaluation failed");
                None
            }
        };

        if lane {
            let slow = poor_access.unwrap_or(false);
            shared.slow_media.store(slow, Ordering::Release);
            let size = shared.config.max_group_size(slow);
            if size != max_group {
                // The claimed group was sized for the old policy.
                debug!(worker = id, from = max_group, to = size, "group size changed");
                let mut cache = shared.cache.lock();
                cache.complete_caching_of_frame(frame);
                for f in group.drain(..) {
                    cache.complete_caching_of_frame(f);
                }
                max_group = size;
                continue;
            }
        }
        let skip = match poor_access {
            None => true,
            Some(poor) => poor && !lane,
        };
        if skip {
            shared.cache.lock().complete_caching_of_frame(frame);
            trace!(worker = id, frame, "skipping frame");
            break;
        }

        signal.set_state(id, WorkerState::Evaluating);
        let mut back_pressure = false;
        match shared.evaluator.evaluate(frame, &EvalContext::worker(id)) {
            Ok(image) if image.buffers.is_empty() => {
                debug!(worker = id, frame, "evaluator produced no buffers");
                failed.insert(frame);
            }
            Ok(image) => {
                signal.set_state(id, WorkerState::Admitting);
                let mut cache = shared.cache.lock();
                if admit(&mut cache, frame, image, false) {
                    cached += 1;
                } else {
                    back_pressure = true;
                }
            }
            Err(e) if e.is_back_pressure() => back_pressure = true,
            Err(e) => {
                warn!(worker = id, frame, error = %e, "evaluation failed, abandoning frame");
                failed.insert(frame);
            }
        }

        {
            let mut cache = shared.cache.lock();
            cache.complete_caching_of_frame(frame);
            if lane {
                shared.publish_stats_if_due(&mut cache);
            }
        }

        if back_pressure {
            debug!(worker = id, frame, "cache full, parking");
            break;
        }
    }

    {
        let mut cache = shared.cache.lock();
        for f in group.drain(..) {
            cache.complete_caching_of_frame(f);
        }
        shared.publish_stats(&mut cache);
    }
    debug!(worker = id, cached, "caching pass finished");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_awaken_runs_each_worker_once_per_generation() {
        let signal = Signal::new(2);
        signal.awaken();
        assert!(signal.wait_for_work(0));
        assert!(signal.wait_for_work(1));
        assert!(signal.is_running());
        assert!(!signal.wait_until_idle(Duration::from_millis(1)));
        signal.finished(0);
        signal.finished(1);
        assert!(signal.wait_until_idle(Duration::from_millis(1)));
    }

    #[test]
    fn test_stop_discards_pending_wakeups() {
        let signal = Signal::new(1);
        signal.awaken();
        signal.awaken();
        signal.stop_and_wait();
        assert!(!signal.halted());
        assert!(signal.wait_until_idle(Duration::from_millis(1)));
    }

    #[test]
    fn test_shutdown_releases_parked_worker() {
        let signal = Arc::new(Signal::new(1));
        let parked = Arc::clone(&signal);
        let handle = thread::spawn(move || parked.wait_for_work(0));
        thread::sleep(Duration::from_millis(10));
        signal.shutdown();
        assert!(!handle.join().unwrap());
        assert!(signal.halted());
    }

    #[test]
    fn test_states_track_workers() {
        let signal = Signal::new(2);
        signal.set_state(1, WorkerState::Evaluating);
        assert_eq!(signal.states(), vec![WorkerState::Idle, WorkerState::Evaluating]);
        signal.awaken();
        assert!(signal.wait_for_work(1));
        signal.finished(1);
        assert_eq!(signal.states()[1], WorkerState::Idle);
    }
}
