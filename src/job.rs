//! Compilation job state machine
//!
//! A [`CompilationJob`] wraps one compilation attempt for one tier and walks
//! it through three single-shot phases:
//!
//! ```text
//! prepare():  ReadyToPrepare  -> ReadyToExecute  | Failed
//! execute():  ReadyToExecute  -> ReadyToFinalize | Failed
//! finalize(): ReadyToFinalize -> Succeeded      | Failed
//! ```
//!
//! The job itself is tier-agnostic: it enforces phase ordering, times each
//! phase, and tracks whether execute ran on a background thread. The actual
//! work is delegated to a [`TierBackend`] injected at construction. Calling
//! a phase out of order is a programming-contract violation and panics.

use crate::code::{BaselineCode, DependencySet, OptimizedCode, OsrTarget};
use crate::descriptor::{DescriptorId, DescriptorTable};
use crate::error::{BailoutReason, Error};
use crate::parse::{FunctionLiteral, ScopeInfo};
use std::sync::Arc;
use std::thread::ThreadId;
use std::time::{Duration, Instant};

/// Job lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    ReadyToPrepare,
    ReadyToExecute,
    ReadyToFinalize,
    Succeeded,
    Failed,
}

/// Outcome of a phase call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Succeeded,
    Failed,
}

/// Failure raised by a backend phase
#[derive(Debug)]
pub enum PhaseError {
    /// Tier-level bailout; baseline code keeps running
    Bailout(BailoutReason),
    /// Resource exhaustion or internal failure that must surface to the
    /// caller once control is back on the owning thread
    Fatal(Error),
}

impl From<BailoutReason> for PhaseError {
    fn from(reason: BailoutReason) -> Self {
        PhaseError::Bailout(reason)
    }
}

impl From<Error> for PhaseError {
    fn from(err: Error) -> Self {
        PhaseError::Fatal(err)
    }
}

/// Result type for backend phases
pub type PhaseResult = std::result::Result<(), PhaseError>;

/// Parse result a job holds for its whole lifetime
#[derive(Debug)]
pub struct ParsedFunction {
    /// The literal being compiled
    pub literal: Arc<FunctionLiteral>,
    /// Scope analysis output
    pub scope: ScopeInfo,
}

/// Artifact produced by a finished job
#[derive(Debug)]
pub enum CompiledArtifact {
    Baseline(BaselineCode),
    Optimized(Arc<OptimizedCode>),
}

/// Per-attempt compilation state, owned by exactly one job
#[derive(Debug)]
pub struct CompilationInfo {
    /// Target descriptor
    pub descriptor: DescriptorId,
    /// Function name, for logging off the owning thread
    pub function_name: String,
    /// This attempt targets the optimizing tier
    pub optimizing: bool,
    /// Compiling with debug support
    pub is_debug: bool,
    /// Folded in a specific closure's lexical context
    pub context_specialized: bool,
    /// Specialized to a specific stack frame
    pub frame_specialized: bool,
    /// OSR entry this attempt targets, if any
    pub osr_target: Option<OsrTarget>,
    /// Speculative assumptions recorded during prepare/execute
    pub dependencies: Arc<DependencySet>,
    /// Why the attempt bailed out, if it did
    pub bailout: Option<BailoutReason>,
    /// Set by abort: the orchestrator must never retry this function
    pub disable_future_optimization: bool,
    /// Fatal error captured during a detached execute, re-surfaced on the
    /// owning thread
    pub fatal_error: Option<Error>,
    /// The produced artifact
    pub output: Option<CompiledArtifact>,
}

impl CompilationInfo {
    /// Info for a baseline-tier attempt
    pub fn new(descriptor: DescriptorId, function_name: impl Into<String>) -> Self {
        Self {
            descriptor,
            function_name: function_name.into(),
            optimizing: false,
            is_debug: false,
            context_specialized: false,
            frame_specialized: false,
            osr_target: None,
            dependencies: Arc::new(DependencySet::new()),
            bailout: None,
            disable_future_optimization: false,
            fatal_error: None,
            output: None,
        }
    }

    /// Info for an optimizing-tier attempt
    pub fn for_optimization(descriptor: DescriptorId, function_name: impl Into<String>) -> Self {
        let mut info = Self::new(descriptor, function_name);
        info.optimizing = true;
        info
    }

    /// Record a retryable bailout; the function stays eligible
    pub fn retry(&mut self, reason: BailoutReason) {
        self.bailout = Some(reason);
    }

    /// Record a terminal bailout; the orchestrator disables the function
    pub fn abort(&mut self, reason: BailoutReason) {
        if self.bailout.is_none() {
            self.bailout = Some(reason);
        }
        self.disable_future_optimization = true;
    }

    /// Take the produced artifact out of the info
    pub fn take_output(&mut self) -> Option<CompiledArtifact> {
        self.output.take()
    }
}

/// One compilation strategy, implemented per tier.
///
/// `prepare` and `finalize` always run on the owning thread and may read the
/// descriptor table; `execute` receives no table at all, so a backend that
/// runs detached is structurally unable to touch shared heap state — it must
/// operate on whatever it snapshotted during prepare.
pub trait TierBackend: Send {
    /// Backend name for logs
    fn name(&self) -> &'static str;

    /// Whether execute may run on a background thread
    fn can_execute_on_background(&self) -> bool {
        false
    }

    fn prepare(
        &mut self,
        info: &mut CompilationInfo,
        parsed: &ParsedFunction,
        table: &DescriptorTable,
    ) -> PhaseResult;

    fn execute(&mut self, info: &mut CompilationInfo, parsed: &ParsedFunction) -> PhaseResult;

    fn finalize(
        &mut self,
        info: &mut CompilationInfo,
        parsed: &ParsedFunction,
        table: &DescriptorTable,
    ) -> PhaseResult;
}

/// Time spent in each phase
#[derive(Debug, Clone, Copy, Default)]
pub struct PhaseTimes {
    pub prepare: Duration,
    pub execute: Duration,
    pub finalize: Duration,
}

impl PhaseTimes {
    /// Total wall time across phases
    pub fn total(&self) -> Duration {
        self.prepare + self.execute + self.finalize
    }
}

/// A single compilation attempt walking the three-phase lifecycle
pub struct CompilationJob {
    state: JobState,
    info: CompilationInfo,
    parsed: Arc<ParsedFunction>,
    backend: Box<dyn TierBackend>,
    times: PhaseTimes,
    owning_thread: ThreadId,
    executed_on_background: bool,
}

impl std::fmt::Debug for CompilationJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompilationJob")
            .field("state", &self.state)
            .field("backend", &self.backend.name())
            .field("descriptor", &self.info.descriptor)
            .finish()
    }
}

impl CompilationJob {
    /// Create a job in `ReadyToPrepare`. The constructing thread becomes the
    /// owning thread; prepare and finalize must run there.
    pub fn new(
        backend: Box<dyn TierBackend>,
        info: CompilationInfo,
        parsed: Arc<ParsedFunction>,
    ) -> Self {
        Self {
            state: JobState::ReadyToPrepare,
            info,
            parsed,
            backend,
            times: PhaseTimes::default(),
            owning_thread: std::thread::current().id(),
            executed_on_background: false,
        }
    }

    /// Current lifecycle state
    pub fn state(&self) -> JobState {
        self.state
    }

    /// Attempt state
    pub fn info(&self) -> &CompilationInfo {
        &self.info
    }

    /// Mutable attempt state
    pub fn info_mut(&mut self) -> &mut CompilationInfo {
        &mut self.info
    }

    /// Target descriptor
    pub fn descriptor(&self) -> DescriptorId {
        self.info.descriptor
    }

    /// Name of the backend driving this job
    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    /// Per-phase timing
    pub fn times(&self) -> PhaseTimes {
        self.times
    }

    /// Whether this job may hand execute to a background thread
    pub fn can_execute_on_background(&self) -> bool {
        self.backend.can_execute_on_background()
    }

    /// Whether execute actually ran detached
    pub fn executed_on_background(&self) -> bool {
        self.executed_on_background
    }

    /// Run the prepare phase on the owning thread
    pub fn prepare(&mut self, table: &DescriptorTable) -> JobStatus {
        assert_eq!(
            self.state,
            JobState::ReadyToPrepare,
            "prepare called in state {:?}",
            self.state
        );
        assert_eq!(
            std::thread::current().id(),
            self.owning_thread,
            "prepare must run on the owning thread"
        );
        let start = Instant::now();
        let result = self.backend.prepare(&mut self.info, &self.parsed, table);
        self.times.prepare += start.elapsed();
        self.advance(result, JobState::ReadyToExecute)
    }

    /// Run the execute phase, possibly on a background thread
    pub fn execute(&mut self) -> JobStatus {
        assert_eq!(
            self.state,
            JobState::ReadyToExecute,
            "execute called in state {:?}",
            self.state
        );
        let current = std::thread::current().id();
        if current != self.owning_thread {
            assert!(
                self.backend.can_execute_on_background(),
                "backend '{}' executed off the owning thread",
                self.backend.name()
            );
            self.executed_on_background = true;
        }
        let start = Instant::now();
        let result = self.backend.execute(&mut self.info, &self.parsed);
        self.times.execute += start.elapsed();
        self.advance(result, JobState::ReadyToFinalize)
    }

    /// Run the finalize phase back on the owning thread
    pub fn finalize(&mut self, table: &DescriptorTable) -> JobStatus {
        assert_eq!(
            self.state,
            JobState::ReadyToFinalize,
            "finalize called in state {:?}",
            self.state
        );
        assert_eq!(
            std::thread::current().id(),
            self.owning_thread,
            "finalize must run on the owning thread"
        );
        debug_assert!(
            !self.info.dependencies.has_aborted(),
            "finalize with an aborted dependency set"
        );
        let start = Instant::now();
        let result = self.backend.finalize(&mut self.info, &self.parsed, table);
        self.times.finalize += start.elapsed();
        self.advance(result, JobState::Succeeded)
    }

    /// Fail the attempt but leave the function eligible for later retries
    pub fn retry_optimization(&mut self, reason: BailoutReason) -> JobStatus {
        debug_assert!(self.info.optimizing);
        self.info.retry(reason);
        self.state = JobState::Failed;
        JobStatus::Failed
    }

    /// Fail the attempt and mark the function never-again for this tier
    pub fn abort_optimization(&mut self, reason: BailoutReason) -> JobStatus {
        debug_assert!(self.info.optimizing);
        self.info.abort(reason);
        self.state = JobState::Failed;
        JobStatus::Failed
    }

    /// Tear the job down, releasing attempt-scoped state
    pub fn into_info(self) -> CompilationInfo {
        self.info
    }

    fn advance(&mut self, result: PhaseResult, next: JobState) -> JobStatus {
        match result {
            Ok(()) => {
                self.state = next;
                JobStatus::Succeeded
            }
            Err(PhaseError::Bailout(reason)) => {
                self.info.retry(reason);
                self.state = JobState::Failed;
                JobStatus::Failed
            }
            Err(PhaseError::Fatal(err)) => {
                self.info.fatal_error = Some(err);
                self.state = JobState::Failed;
                JobStatus::Failed
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parse::{analyze, parse_function};

    /// Backend whose phases succeed or fail on demand
    struct ScriptedBackend {
        fail_on: Option<JobState>,
        background: bool,
    }

    impl ScriptedBackend {
        fn ok() -> Box<Self> {
            Box::new(Self {
                fail_on: None,
                background: false,
            })
        }

        fn failing_at(state: JobState) -> Box<Self> {
            Box::new(Self {
                fail_on: Some(state),
                background: false,
            })
        }
    }

    impl TierBackend for ScriptedBackend {
        fn name(&self) -> &'static str {
            "scripted"
        }

        fn can_execute_on_background(&self) -> bool {
            self.background
        }

        fn prepare(
            &mut self,
            _info: &mut CompilationInfo,
            _parsed: &ParsedFunction,
            _table: &DescriptorTable,
        ) -> PhaseResult {
            if self.fail_on == Some(JobState::ReadyToPrepare) {
                return Err(BailoutReason::CodegenFailed.into());
            }
            Ok(())
        }

        fn execute(&mut self, _info: &mut CompilationInfo, _parsed: &ParsedFunction) -> PhaseResult {
            if self.fail_on == Some(JobState::ReadyToExecute) {
                return Err(Error::stack_overflow(100, 64).into());
            }
            Ok(())
        }

        fn finalize(
            &mut self,
            _info: &mut CompilationInfo,
            _parsed: &ParsedFunction,
            _table: &DescriptorTable,
        ) -> PhaseResult {
            if self.fail_on == Some(JobState::ReadyToFinalize) {
                return Err(BailoutReason::CodegenFailed.into());
            }
            Ok(())
        }
    }

    fn parsed() -> Arc<ParsedFunction> {
        let literal = Arc::new(parse_function("fn f(x) = x + 1", 1, 0).unwrap());
        let scope = analyze(&literal).unwrap();
        Arc::new(ParsedFunction { literal, scope })
    }

    fn job(backend: Box<dyn TierBackend>) -> CompilationJob {
        let info = CompilationInfo::for_optimization(DescriptorId(0), "f");
        CompilationJob::new(backend, info, parsed())
    }

    #[test]
    fn test_happy_path_transitions() {
        let table = DescriptorTable::new();
        let mut job = job(ScriptedBackend::ok());
        assert_eq!(job.state(), JobState::ReadyToPrepare);
        assert_eq!(job.prepare(&table), JobStatus::Succeeded);
        assert_eq!(job.state(), JobState::ReadyToExecute);
        assert_eq!(job.execute(), JobStatus::Succeeded);
        assert_eq!(job.state(), JobState::ReadyToFinalize);
        assert_eq!(job.finalize(&table), JobStatus::Succeeded);
        assert_eq!(job.state(), JobState::Succeeded);
        assert!(!job.executed_on_background());
    }

    #[test]
    fn test_prepare_failure_records_bailout() {
        let table = DescriptorTable::new();
        let mut job = job(ScriptedBackend::failing_at(JobState::ReadyToPrepare));
        assert_eq!(job.prepare(&table), JobStatus::Failed);
        assert_eq!(job.state(), JobState::Failed);
        assert_eq!(job.info().bailout, Some(BailoutReason::CodegenFailed));
    }

    #[test]
    fn test_execute_fatal_error_is_captured_not_thrown() {
        let table = DescriptorTable::new();
        let mut job = job(ScriptedBackend::failing_at(JobState::ReadyToExecute));
        job.prepare(&table);
        assert_eq!(job.execute(), JobStatus::Failed);
        assert!(matches!(
            job.info().fatal_error,
            Some(Error::StackOverflow(_))
        ));
    }

    #[test]
    #[should_panic(expected = "execute called in state")]
    fn test_execute_before_prepare_panics() {
        let mut job = job(ScriptedBackend::ok());
        job.execute();
    }

    #[test]
    #[should_panic(expected = "finalize called in state")]
    fn test_finalize_before_execute_panics() {
        let table = DescriptorTable::new();
        let mut job = job(ScriptedBackend::ok());
        job.prepare(&table);
        job.finalize(&table);
    }

    #[test]
    #[should_panic(expected = "prepare called in state")]
    fn test_prepare_is_single_shot() {
        let table = DescriptorTable::new();
        let mut job = job(ScriptedBackend::ok());
        job.prepare(&table);
        job.prepare(&table);
    }

    #[test]
    #[should_panic(expected = "executed off the owning thread")]
    fn test_foreground_backend_rejects_background_execute() {
        let table = DescriptorTable::new();
        let mut job = job(ScriptedBackend::ok());
        job.prepare(&table);
        std::thread::scope(|s| {
            let handle = s.spawn(|| {
                job.execute();
            });
            if let Err(payload) = handle.join() {
                std::panic::resume_unwind(payload);
            }
        });
    }

    #[test]
    fn test_retry_leaves_descriptor_eligible() {
        let table = DescriptorTable::new();
        let mut job = job(ScriptedBackend::ok());
        job.prepare(&table);
        let status = job.retry_optimization(BailoutReason::DependencyChange);
        assert_eq!(status, JobStatus::Failed);
        assert_eq!(job.state(), JobState::Failed);
        assert_eq!(job.info().bailout, Some(BailoutReason::DependencyChange));
        assert!(!job.info().disable_future_optimization);
    }

    #[test]
    fn test_abort_disables_future_optimization() {
        let table = DescriptorTable::new();
        let mut job = job(ScriptedBackend::ok());
        job.prepare(&table);
        job.abort_optimization(BailoutReason::OptimizationDisabledForTest);
        assert!(job.info().disable_future_optimization);
        assert_eq!(
            job.info().bailout,
            Some(BailoutReason::OptimizationDisabledForTest)
        );
    }

    #[test]
    fn test_phase_times_recorded() {
        let table = DescriptorTable::new();
        let mut job = job(ScriptedBackend::ok());
        job.prepare(&table);
        job.execute();
        job.finalize(&table);
        // Wall-clock durations are small but accumulate to the total
        let times = job.times();
        assert_eq!(
            times.total(),
            times.prepare + times.execute + times.finalize
        );
    }
}
