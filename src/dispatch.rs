//! Background compilation dispatcher
//!
//! Jobs that may execute off-thread are detached and handed to a single
//! worker thread. Detachment is move semantics: [`DetachedJob`] consumes the
//! job, proving the owning thread keeps no reference to it — ownership
//! transfers unconditionally to the dispatcher at enqueue and comes back
//! only when the orchestrator takes the finished job for finalize. The
//! worker runs the execute phase only; prepare already ran and finalize
//! always runs back on the owning thread.
//!
//! `finish_now` is the sole blocking operation, used when baseline progress
//! urgently needs an outstanding optimization drained.

use crate::descriptor::DescriptorId;
use crate::job::{CompilationJob, JobState};
use rustc_hash::FxHashSet;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// How long `finish_now` is willing to wait for the worker before giving up
const FINISH_NOW_DEADLINE: Duration = Duration::from_secs(10);

/// A job detached from its owning thread for background execution.
///
/// Constructing one asserts the backend is background-capable and the job
/// has already been prepared; consuming it runs the execute phase.
#[derive(Debug)]
pub struct DetachedJob(CompilationJob);

impl DetachedJob {
    /// Detach a prepared job from the owning thread
    pub fn detach(job: CompilationJob) -> Self {
        assert!(
            job.can_execute_on_background(),
            "backend '{}' cannot execute on a background thread",
            job.backend_name()
        );
        assert_eq!(
            job.state(),
            JobState::ReadyToExecute,
            "detach requires a prepared job"
        );
        Self(job)
    }

    /// Run the execute phase and yield the job back for reattachment
    fn run(mut self) -> CompilationJob {
        let _ = self.0.execute();
        self.0
    }
}

#[derive(Debug)]
struct DispatcherShared {
    /// Jobs whose execute phase completed, awaiting finalize
    finished: Mutex<VecDeque<CompilationJob>>,
    finished_cv: Condvar,
    /// Descriptors with a job between enqueue and finalize pickup
    inflight: Mutex<FxHashSet<DescriptorId>>,
    /// Jobs enqueued but not yet executed
    queued: AtomicUsize,
    capacity: usize,
}

/// Dispatcher owning the background compilation worker
#[derive(Debug)]
pub struct OptimizingDispatcher {
    sender: Option<Sender<DetachedJob>>,
    shared: Arc<DispatcherShared>,
    worker: Option<JoinHandle<()>>,
}

impl OptimizingDispatcher {
    /// Start the worker thread with the given queue capacity
    pub fn new(capacity: usize) -> Self {
        let (sender, receiver) = mpsc::channel::<DetachedJob>();
        let shared = Arc::new(DispatcherShared {
            finished: Mutex::new(VecDeque::new()),
            finished_cv: Condvar::new(),
            inflight: Mutex::new(FxHashSet::default()),
            queued: AtomicUsize::new(0),
            capacity,
        });

        let worker_shared = Arc::clone(&shared);
        let worker = std::thread::Builder::new()
            .name("tiercel-optimizer".into())
            .spawn(move || {
                for detached in receiver {
                    let job = detached.run();
                    worker_shared.queued.fetch_sub(1, Ordering::SeqCst);
                    worker_shared.finished.lock().unwrap().push_back(job);
                    worker_shared.finished_cv.notify_all();
                }
            })
            .expect("failed to spawn optimizer thread");

        Self {
            sender: Some(sender),
            shared,
            worker: Some(worker),
        }
    }

    /// Whether the admission check passes for another concurrent job
    pub fn is_queue_available(&self) -> bool {
        self.shared.queued.load(Ordering::SeqCst) < self.shared.capacity
    }

    /// Jobs enqueued and not yet executed
    pub fn queued_count(&self) -> usize {
        self.shared.queued.load(Ordering::SeqCst)
    }

    /// Whether a job for this descriptor is anywhere between enqueue and
    /// finalize pickup
    pub fn is_enqueued(&self, id: DescriptorId) -> bool {
        self.shared.inflight.lock().unwrap().contains(&id)
    }

    /// Hand a prepared job to the worker. On a closed channel the job is
    /// returned so the caller can fail the attempt on the owning thread.
    pub fn enqueue(&self, job: CompilationJob) -> Result<(), CompilationJob> {
        let id = job.descriptor();
        let detached = DetachedJob::detach(job);
        self.shared.inflight.lock().unwrap().insert(id);
        self.shared.queued.fetch_add(1, Ordering::SeqCst);
        match self
            .sender
            .as_ref()
            .expect("dispatcher already shut down")
            .send(detached)
        {
            Ok(()) => Ok(()),
            Err(mpsc::SendError(detached)) => {
                self.shared.queued.fetch_sub(1, Ordering::SeqCst);
                self.shared.inflight.lock().unwrap().remove(&id);
                Err(detached.0)
            }
        }
    }

    /// Non-blocking: take the finished job for a specific descriptor
    pub fn take_finished_for(&self, id: DescriptorId) -> Option<CompilationJob> {
        let mut finished = self.shared.finished.lock().unwrap();
        let pos = finished.iter().position(|job| job.descriptor() == id)?;
        let job = finished.remove(pos);
        if job.is_some() {
            self.shared.inflight.lock().unwrap().remove(&id);
        }
        job
    }

    /// Non-blocking: take any finished job
    pub fn take_any_finished(&self) -> Option<CompilationJob> {
        let job = self.shared.finished.lock().unwrap().pop_front();
        if let Some(ref job) = job {
            self.shared
                .inflight
                .lock()
                .unwrap()
                .remove(&job.descriptor());
        }
        job
    }

    /// Block until the in-flight job for `id` has executed, then take it.
    /// Returns `None` when nothing is enqueued for the descriptor.
    pub fn finish_now(&self, id: DescriptorId) -> Option<CompilationJob> {
        let deadline = Instant::now() + FINISH_NOW_DEADLINE;
        let mut finished = self.shared.finished.lock().unwrap();
        loop {
            if let Some(pos) = finished.iter().position(|job| job.descriptor() == id) {
                let job = finished.remove(pos);
                if job.is_some() {
                    self.shared.inflight.lock().unwrap().remove(&id);
                }
                return job;
            }
            if !self.shared.inflight.lock().unwrap().contains(&id) {
                return None;
            }
            if Instant::now() >= deadline {
                tracing::warn!(descriptor = id.0, "finish_now timed out");
                return None;
            }
            let (guard, _timeout) = self
                .shared
                .finished_cv
                .wait_timeout(finished, Duration::from_millis(50))
                .unwrap();
            finished = guard;
        }
    }
}

impl Drop for OptimizingDispatcher {
    fn drop(&mut self) {
        // Closing the channel stops the worker after it drains the queue
        drop(self.sender.take());
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::code::{BaselineCode, BytecodeChunk, Opcode};
    use crate::descriptor::DescriptorTable;
    use crate::job::{CompilationInfo, ParsedFunction, PhaseResult, TierBackend};
    use crate::parse::{analyze, parse_function};
    use crate::tiers::OptimizingBackend;

    fn prepared_job(table: &mut DescriptorTable, line: &str, literal_id: u32) -> CompilationJob {
        let script = table.register_script(format!("script-{}", literal_id));
        let literal = std::sync::Arc::new(parse_function(line, 1, literal_id).unwrap());
        let id = table.get_or_create(&literal, script);
        let mut chunk = BytecodeChunk::new(literal.params.len() as u8);
        chunk.write_op(Opcode::Return);
        table
            .get_mut(id)
            .install_baseline(BaselineCode::Bytecode(std::sync::Arc::new(chunk)));
        let scope = analyze(&literal).unwrap();
        let parsed = std::sync::Arc::new(ParsedFunction { literal, scope });
        let info = CompilationInfo::for_optimization(id, "test");
        let mut job = CompilationJob::new(Box::new(OptimizingBackend::new()), info, parsed);
        job.prepare(table);
        job
    }

    #[test]
    fn test_enqueue_execute_take() {
        let mut table = DescriptorTable::new();
        let dispatcher = OptimizingDispatcher::new(4);
        let job = prepared_job(&mut table, "fn f(x) = x + 1", 0);
        let id = job.descriptor();

        dispatcher.enqueue(job).unwrap();
        assert!(dispatcher.is_enqueued(id));

        let job = dispatcher.finish_now(id).expect("job should finish");
        assert_eq!(job.state(), JobState::ReadyToFinalize);
        assert!(job.executed_on_background());
        assert!(!dispatcher.is_enqueued(id));
    }

    #[test]
    fn test_finish_now_without_enqueued_job() {
        let dispatcher = OptimizingDispatcher::new(4);
        assert!(dispatcher.finish_now(DescriptorId(99)).is_none());
    }

    #[test]
    fn test_take_finished_for_specific_descriptor() {
        let mut table = DescriptorTable::new();
        let dispatcher = OptimizingDispatcher::new(4);
        let job_a = prepared_job(&mut table, "fn a(x) = x + 1", 0);
        let job_b = prepared_job(&mut table, "fn b(x) = x * 2", 0);
        let id_a = job_a.descriptor();
        let id_b = job_b.descriptor();
        dispatcher.enqueue(job_a).unwrap();
        dispatcher.enqueue(job_b).unwrap();

        let b = dispatcher.finish_now(id_b).expect("b should finish");
        assert_eq!(b.descriptor(), id_b);
        let a = dispatcher.finish_now(id_a).expect("a should finish");
        assert_eq!(a.descriptor(), id_a);
        assert!(dispatcher.take_any_finished().is_none());
    }

    /// Backend that blocks in execute until released, for capacity tests
    struct StallingBackend {
        gate: std::sync::Arc<(Mutex<bool>, Condvar)>,
    }

    impl TierBackend for StallingBackend {
        fn name(&self) -> &'static str {
            "stalling"
        }

        fn can_execute_on_background(&self) -> bool {
            true
        }

        fn prepare(
            &mut self,
            _info: &mut CompilationInfo,
            _parsed: &ParsedFunction,
            _table: &DescriptorTable,
        ) -> PhaseResult {
            Ok(())
        }

        fn execute(&mut self, _info: &mut CompilationInfo, _parsed: &ParsedFunction) -> PhaseResult {
            let (lock, cv) = &*self.gate;
            let mut released = lock.lock().unwrap();
            while !*released {
                released = cv.wait(released).unwrap();
            }
            Ok(())
        }

        fn finalize(
            &mut self,
            _info: &mut CompilationInfo,
            _parsed: &ParsedFunction,
            _table: &DescriptorTable,
        ) -> PhaseResult {
            Ok(())
        }
    }

    #[test]
    fn test_queue_capacity_admission() {
        let table = DescriptorTable::new();
        let dispatcher = OptimizingDispatcher::new(1);
        let gate = std::sync::Arc::new((Mutex::new(false), Condvar::new()));

        let literal = std::sync::Arc::new(parse_function("fn f(x) = x", 1, 0).unwrap());
        let scope = analyze(&literal).unwrap();
        let parsed = std::sync::Arc::new(ParsedFunction { literal, scope });
        let info = CompilationInfo::for_optimization(DescriptorId(0), "f");
        let mut job = CompilationJob::new(
            Box::new(StallingBackend {
                gate: std::sync::Arc::clone(&gate),
            }),
            info,
            parsed,
        );
        job.prepare(&table);

        assert!(dispatcher.is_queue_available());
        dispatcher.enqueue(job).unwrap();
        // Worker is stalled inside execute; the single slot is taken
        assert!(!dispatcher.is_queue_available());

        // Release the gate and drain
        {
            let (lock, cv) = &*gate;
            *lock.lock().unwrap() = true;
            cv.notify_all();
        }
        let finished = dispatcher.finish_now(DescriptorId(0));
        assert!(finished.is_some());
        assert!(dispatcher.is_queue_available());
    }
}
