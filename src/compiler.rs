//! Compilation orchestrator
//!
//! The front door of the pipeline: decides which tier compiles a function,
//! drives [`CompilationJob`]s through their phases (synchronously or through
//! the background dispatcher), installs results on descriptors, closures and
//! the optimized-code cache, and applies the retry/bailout protocol when an
//! attempt fails. Optimization failures are silent — the function keeps
//! running baseline code; only parse/analysis failures and resource
//! exhaustion surface to the caller.

use crate::cache;
use crate::code::{BaselineCode, DependencySet, OptimizedCode, OsrTarget};
use crate::config::CompilerConfig;
use crate::descriptor::{
    ClosureInstance, DescriptorFlags, DescriptorId, DescriptorTable, ScriptId,
};
use crate::dispatch::OptimizingDispatcher;
use crate::error::{BailoutReason, Error, Result};
use crate::heap::MemoryPressureMonitor;
use crate::job::{
    CompilationInfo, CompilationJob, CompiledArtifact, JobState, JobStatus, ParsedFunction,
    TierBackend,
};
use crate::parse::{analyze, FunctionLiteral};
use crate::tiers::{
    check_optimization_eligibility, select_unoptimized_strategy, use_numeric_backend,
    InterpreterBackend, LegacyBaselineBackend, NumericModuleBackend, OptimizingBackend,
    UnoptimizedStrategy,
};
use regex::Regex;
use rustc_hash::{FxHashMap, FxHashSet};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, trace};

/// Whether an optimization request may use the background thread
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConcurrencyMode {
    Synchronous,
    Concurrent,
}

/// Caller-visible outcome of an optimization request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptimizeStatus {
    /// Optimized code is installed on the closure
    Optimized,
    /// A concurrent job is outstanding; the closure runs baseline code and
    /// probes [`Compiler::poll_pending`] until the attempt resolves
    Pending,
    /// Admission rejected (queue full or memory pressure); nothing was
    /// mutated and the caller may simply re-request later
    TryAgainLater,
    /// The attempt bailed out; baseline code remains installed
    NotOptimized,
}

/// Attempt-count instrumentation for the whole pipeline
#[derive(Debug, Clone, Copy, Default)]
pub struct CompileStats {
    /// Baseline jobs constructed
    pub baseline_attempts: u64,
    /// Baseline compiles that installed code
    pub baseline_compile_count: u64,
    /// Optimizing jobs constructed
    pub optimize_attempts: u64,
    /// Optimizing attempts that installed code
    pub optimize_succeeded: u64,
    /// Optimization requests resolved without installing code
    pub optimize_bailouts: u64,
    /// Optimized-code cache hits
    pub cache_hits: u64,
    /// OSR compilations requested
    pub osr_compiles: u64,
    /// Jobs handed to the background dispatcher
    pub concurrent_queued: u64,
    /// Background results discarded at finalize time
    pub concurrent_discarded: u64,
    /// Closure-level deoptimizations
    pub deoptimizations: u64,
}

impl fmt::Display for CompileStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "=== Compilation Summary ===")?;
        writeln!(
            f,
            "Baseline: {} attempts, {} installed",
            self.baseline_attempts, self.baseline_compile_count
        )?;
        writeln!(
            f,
            "Optimized: {} attempts, {} installed, {} bailouts, {} cache hits",
            self.optimize_attempts, self.optimize_succeeded, self.optimize_bailouts, self.cache_hits
        )?;
        writeln!(
            f,
            "Concurrent: {} queued, {} discarded at finalize",
            self.concurrent_queued, self.concurrent_discarded
        )?;
        writeln!(
            f,
            "OSR compiles: {}, deoptimizations: {}",
            self.osr_compiles, self.deoptimizations
        )?;
        Ok(())
    }
}

/// The orchestrator. One per isolate-equivalent; owns the descriptor table,
/// the background dispatcher, and the admission state.
pub struct Compiler {
    config: CompilerConfig,
    opt_filter: Option<Regex>,
    table: DescriptorTable,
    dispatcher: OptimizingDispatcher,
    memory: MemoryPressureMonitor,
    /// Descriptors with an optimizing job in flight (single-flight guard)
    pending: FxHashSet<DescriptorId>,
    /// Dependency sets of in-flight jobs, reachable for invalidation
    inflight_deps: FxHashMap<DescriptorId, Arc<DependencySet>>,
    stats: CompileStats,
}

impl Compiler {
    /// Create a compiler from a configuration
    pub fn new(config: CompilerConfig) -> Result<Self> {
        let opt_filter = match &config.opt_filter {
            Some(pattern) => Some(Regex::new(pattern).map_err(|e| {
                Error::InternalError(format!("invalid opt_filter '{}': {}", pattern, e))
            })?),
            None => None,
        };
        let dispatcher = OptimizingDispatcher::new(config.concurrent_queue_capacity);
        let memory = MemoryPressureMonitor::new(config.memory_budget);
        Ok(Self {
            config,
            opt_filter,
            table: DescriptorTable::new(),
            dispatcher,
            memory,
            pending: FxHashSet::default(),
            inflight_deps: FxHashMap::default(),
            stats: CompileStats::default(),
        })
    }

    /// The active configuration
    pub fn config(&self) -> &CompilerConfig {
        &self.config
    }

    /// Attempt-count instrumentation
    pub fn stats(&self) -> &CompileStats {
        &self.stats
    }

    /// Read-only view of the descriptor table
    pub fn table(&self) -> &DescriptorTable {
        &self.table
    }

    /// Register a script and return its id
    pub fn register_script(&mut self, name: impl Into<String>) -> ScriptId {
        self.table.register_script(name)
    }

    /// Find or create the shared descriptor for a literal
    pub fn get_or_create_descriptor(
        &mut self,
        literal: &Arc<FunctionLiteral>,
        script: ScriptId,
    ) -> DescriptorId {
        self.table.get_or_create(literal, script)
    }

    /// Create a closure over a descriptor, picking up already-installed
    /// baseline code and any cached optimized code.
    pub fn instantiate(&mut self, id: DescriptorId) -> ClosureInstance {
        let mut closure = ClosureInstance::new(id);
        if let Some(baseline) = self.table.get(id).baseline_code().cloned() {
            closure.install_baseline(baseline);
            if let Some(code) = cache::lookup(&mut self.table, id, None) {
                closure.install_optimized(code);
            }
        }
        closure
    }

    /// Attach a debugger breakpoint to a function
    pub fn set_breakpoint(&mut self, id: DescriptorId) {
        self.table.get_mut(id).flags |= DescriptorFlags::HAS_BREAKPOINT;
    }

    /// Detach the debugger breakpoint
    pub fn clear_breakpoint(&mut self, id: DescriptorId) {
        self.table.get_mut(id).flags -= DescriptorFlags::HAS_BREAKPOINT;
    }

    /// Record one profiler tick against a function
    pub fn record_profiler_tick(&mut self, id: DescriptorId) {
        self.table.get_mut(id).profile.tick();
    }

    /// Record one invocation of a function
    pub fn record_invocation(&mut self, id: DescriptorId) {
        self.table.get_mut(id).profile.record_invocation();
    }

    /// Permanently disable optimization for a function (test directive)
    pub fn never_optimize(&mut self, id: DescriptorId) {
        self.table
            .get_mut(id)
            .disable_optimization(BailoutReason::OptimizationDisabledForTest);
    }

    /// Whether an optimizing job for this descriptor is outstanding
    /// (queued, executing, or awaiting finalize)
    pub fn has_pending_optimization(&self, id: DescriptorId) -> bool {
        self.pending.contains(&id)
    }

    /// Compile baseline code for a closure. No-op when the descriptor is
    /// already compiled. Baseline compilation always runs synchronously and
    /// is never starved by outstanding optimization work.
    pub fn compile_baseline(&mut self, closure: &mut ClosureInstance) -> Result<()> {
        let id = closure.descriptor();
        if self.table.get(id).is_compiled() {
            if !closure.is_compiled() {
                if let Some(baseline) = self.table.get(id).baseline_code().cloned() {
                    closure.install_baseline(baseline);
                }
                if let Some(code) = cache::lookup(&mut self.table, id, None) {
                    trace!(
                        function = self.table.name_of(id),
                        "found optimized code during unoptimized compile"
                    );
                    closure.install_optimized(code);
                }
            }
            return Ok(());
        }

        let parsed = self.parse_and_analyze(id)?;
        let baseline = self.generate_baseline_code(id, &parsed, false)?;
        self.memory.record_allocation(baseline.size_bytes());
        self.table.get_mut(id).install_baseline(baseline.clone());
        closure.install_baseline(baseline);
        self.stats.baseline_compile_count += 1;
        debug!(function = self.table.name_of(id), "installed baseline code");

        if self.config.always_opt {
            let _ = self.compile_optimized(closure, ConcurrencyMode::Synchronous)?;
        }
        Ok(())
    }

    /// Request optimized code for a closure. Synchronous from the caller's
    /// perspective in both modes; `Concurrent` returns as soon as the job is
    /// queued, leaving the closure in the observable pending state.
    pub fn compile_optimized(
        &mut self,
        closure: &mut ClosureInstance,
        mode: ConcurrencyMode,
    ) -> Result<OptimizeStatus> {
        let id = closure.descriptor();
        if closure.is_optimized() {
            return Ok(OptimizeStatus::Optimized);
        }
        // Keep the closure's view of baseline code current before anything
        // else; another closure may have compiled the descriptor already.
        if !closure.is_compiled() {
            if let Some(baseline) = self.table.get(id).baseline_code().cloned() {
                closure.install_baseline(baseline);
            }
        }

        // Single-flight per descriptor: coalesce with an outstanding job
        if self.pending.contains(&id) {
            match mode {
                ConcurrencyMode::Concurrent => {
                    if closure.is_compiled() && !closure.is_optimize_pending() {
                        closure.mark_optimize_pending();
                    }
                    return Ok(OptimizeStatus::Pending);
                }
                ConcurrencyMode::Synchronous => {
                    // Drain the in-flight job rather than racing a second one
                    self.drain_inflight(id)?;
                }
            }
        }

        if let Some(code) = cache::lookup(&mut self.table, id, None) {
            debug!(
                function = self.table.name_of(id),
                "found optimized code in cache"
            );
            self.stats.cache_hits += 1;
            closure.install_optimized(code);
            return Ok(OptimizeStatus::Optimized);
        }

        // The function is no longer considered hot once a request lands here
        self.table.get_mut(id).profile.profiler_ticks = 0;

        let name = self.table.name_of(id).to_string();
        if let Err(reason) =
            check_optimization_eligibility(self.table.get(id), &name, self.opt_filter.as_ref(), &self.config)
        {
            debug!(function = %name, reason = %reason, "did not optimize");
            self.table.get_mut(id).profile.last_bailout = Some(reason);
            self.stats.optimize_bailouts += 1;
            closure.clear_optimize_pending();
            return Ok(OptimizeStatus::NotOptimized);
        }

        // Admission checks run before any job object exists; a rejected
        // request retains nothing and mutates no cache state
        if mode == ConcurrencyMode::Concurrent {
            if !self.dispatcher.is_queue_available() {
                trace!(function = %name, "compilation queue full, will retry later");
                self.table.get_mut(id).profile.last_bailout = Some(BailoutReason::QueueFull);
                return Ok(OptimizeStatus::TryAgainLater);
            }
            if self.memory.high_memory_pressure() {
                trace!(function = %name, "high memory pressure, will retry later");
                self.table.get_mut(id).profile.last_bailout =
                    Some(BailoutReason::HighMemoryPressure);
                return Ok(OptimizeStatus::TryAgainLater);
            }
        }

        let parsed = self.parse_and_analyze(id)?;
        let info = CompilationInfo::for_optimization(id, name.clone());
        let deps = Arc::clone(&info.dependencies);
        let mut job = CompilationJob::new(Box::new(OptimizingBackend::new()), info, parsed);
        self.stats.optimize_attempts += 1;

        match mode {
            ConcurrencyMode::Synchronous => {
                debug!(function = %name, backend = job.backend_name(), "optimizing");
                if job.prepare(&self.table) == JobStatus::Succeeded
                    && job.execute() == JobStatus::Succeeded
                {
                    if deps.has_aborted() {
                        job.retry_optimization(BailoutReason::DependencyChange);
                    } else if job.finalize(&self.table) == JobStatus::Succeeded {
                        let times = job.times();
                        let mut info = job.into_info();
                        let artifact = info.take_output().ok_or_else(|| {
                            Error::InternalError("optimizing job produced no code".into())
                        })?;
                        let code = self.install_optimized_artifact(&info, artifact)?;
                        closure.install_optimized(code);
                        debug!(
                            function = %name,
                            prepare_us = times.prepare.as_micros() as u64,
                            execute_us = times.execute.as_micros() as u64,
                            finalize_us = times.finalize.as_micros() as u64,
                            "completed optimizing"
                        );
                        return Ok(OptimizeStatus::Optimized);
                    }
                }
                self.handle_failed_optimize_job(job.into_info())?;
                closure.clear_optimize_pending();
                Ok(OptimizeStatus::NotOptimized)
            }
            ConcurrencyMode::Concurrent => {
                // Prepare must run on the owning thread
                if job.prepare(&self.table) == JobStatus::Failed {
                    self.handle_failed_optimize_job(job.into_info())?;
                    return Ok(OptimizeStatus::NotOptimized);
                }

                self.pending.insert(id);
                self.inflight_deps.insert(id, deps);
                match self.dispatcher.enqueue(job) {
                    Ok(()) => {
                        closure.mark_optimize_pending();
                        self.stats.concurrent_queued += 1;
                        debug!(function = %name, "queued for concurrent optimization");
                        Ok(OptimizeStatus::Pending)
                    }
                    Err(job) => {
                        self.pending.remove(&id);
                        self.inflight_deps.remove(&id);
                        self.handle_failed_optimize_job(job.into_info())?;
                        Ok(OptimizeStatus::NotOptimized)
                    }
                }
            }
        }
    }

    /// Compile optimized code targeting one in-flight activation. Always
    /// synchronous and frame-specialized; the result is handed to the
    /// requesting activation and never enters the shared cache.
    pub fn compile_for_osr(
        &mut self,
        closure: &ClosureInstance,
        osr_target: OsrTarget,
    ) -> Result<Option<Arc<OptimizedCode>>> {
        let id = closure.descriptor();
        self.stats.osr_compiles += 1;

        let name = self.table.name_of(id).to_string();
        if let Err(reason) =
            check_optimization_eligibility(self.table.get(id), &name, self.opt_filter.as_ref(), &self.config)
        {
            debug!(function = %name, reason = %reason, "did not OSR-optimize");
            self.table.get_mut(id).profile.last_bailout = Some(reason);
            self.stats.optimize_bailouts += 1;
            return Ok(None);
        }

        let parsed = self.parse_and_analyze(id)?;
        let mut info = CompilationInfo::for_optimization(id, name.clone());
        info.osr_target = Some(osr_target);
        info.frame_specialized = true;
        let mut job = CompilationJob::new(Box::new(OptimizingBackend::new()), info, parsed);
        self.stats.optimize_attempts += 1;

        debug!(function = %name, target = osr_target.0, "optimizing for OSR");
        if job.prepare(&self.table) == JobStatus::Succeeded
            && job.execute() == JobStatus::Succeeded
            && job.finalize(&self.table) == JobStatus::Succeeded
        {
            let mut info = job.into_info();
            let artifact = info.take_output().ok_or_else(|| {
                Error::InternalError("OSR job produced no code".into())
            })?;
            // Policy no-op for OSR artifacts, kept on the install path so
            // every successful optimize goes through the same cache gate
            cache::insert(&mut self.table, &info, &artifact);
            match artifact {
                CompiledArtifact::Optimized(code) => {
                    self.memory.record_allocation(code.size_bytes());
                    self.stats.optimize_succeeded += 1;
                    return Ok(Some(code));
                }
                CompiledArtifact::Baseline(_) => {
                    return Err(Error::InternalError("OSR job produced baseline code".into()))
                }
            }
        }
        self.handle_failed_optimize_job(job.into_info())?;
        Ok(None)
    }

    /// The fast-path probe a pending closure's calls make: if the background
    /// job finished, finalize it and resolve the closure to optimized code
    /// (cache) or back to plain baseline.
    pub fn poll_pending(&mut self, closure: &mut ClosureInstance) -> Result<OptimizeStatus> {
        let id = closure.descriptor();
        if closure.is_optimized() {
            return Ok(OptimizeStatus::Optimized);
        }
        if self.pending.contains(&id) {
            match self.dispatcher.take_finished_for(id) {
                Some(job) => self.finalize_background_job(job)?,
                None => return Ok(OptimizeStatus::Pending),
            }
        }
        self.resolve_from_descriptor(closure)
    }

    /// Block until the outstanding optimization for this closure's
    /// descriptor resolves, then install the outcome. The only blocking
    /// point in the pipeline.
    pub fn finish_optimization_now(
        &mut self,
        closure: &mut ClosureInstance,
    ) -> Result<OptimizeStatus> {
        let id = closure.descriptor();
        if self.pending.contains(&id) {
            self.drain_inflight(id)?;
        }
        if closure.is_optimized() {
            return Ok(OptimizeStatus::Optimized);
        }
        self.resolve_from_descriptor(closure)
    }

    /// Finalize every background job whose execute phase has completed.
    /// Returns how many jobs were finalized.
    pub fn process_finished_jobs(&mut self) -> Result<usize> {
        let mut count = 0;
        while let Some(job) = self.dispatcher.take_any_finished() {
            self.finalize_background_job(job)?;
            count += 1;
        }
        Ok(count)
    }

    /// Recompile a function with debug support. Debug code always uses the
    /// bytecode tier; the previous baseline representation is replaced and
    /// any cached optimized code is dropped.
    pub fn compile_for_debugging(&mut self, id: DescriptorId) -> Result<()> {
        let parsed = self.parse_and_analyze(id)?;
        let (status, mut info) =
            self.run_sync_job(id, Box::new(InterpreterBackend::new()), &parsed, true);
        self.stats.baseline_attempts += 1;
        if status == JobStatus::Failed {
            if let Some(err) = info.fatal_error.take() {
                return Err(err);
            }
            return Err(Error::CompileError(format!(
                "failed to compile '{}' for debugging",
                self.table.name_of(id)
            )));
        }
        match info.take_output() {
            Some(CompiledArtifact::Baseline(code)) => {
                if let Some(old) = self.table.get(id).baseline_code() {
                    self.memory.record_release(old.size_bytes());
                }
                self.memory.record_allocation(code.size_bytes());
                self.table.get_mut(id).replace_baseline_for_debug(code);
                cache::clear(&mut self.table, id);
                self.stats.baseline_compile_count += 1;
                debug!(function = self.table.name_of(id), "installed debug code");
                Ok(())
            }
            other => Err(Error::InternalError(format!(
                "debug compile produced unexpected artifact: {:?}",
                other
            ))),
        }
    }

    /// External dependency breakage: abort any in-flight attempt's
    /// assumptions and invalidate installed optimized code for the
    /// descriptor. The cache slot is cleared either way.
    pub fn invalidate_assumptions(&mut self, id: DescriptorId) {
        if let Some(deps) = self.inflight_deps.get(&id) {
            deps.abort();
        }
        if let Some(code) = self.table.get(id).profile.optimized_code() {
            code.dependencies.abort();
            code.mark_for_deoptimization();
            self.memory.record_release(code.size_bytes());
        }
        cache::clear(&mut self.table, id);
        debug!(descriptor = id.0, "invalidated speculative assumptions");
    }

    /// The one-way `Optimized -> Baseline` transition for a closure whose
    /// optimized artifact was invalidated. Routes through the same cleanup
    /// as assumption breakage so the cache slot cannot serve the artifact
    /// again.
    pub fn deoptimize(&mut self, closure: &mut ClosureInstance) -> Result<()> {
        let id = closure.descriptor();
        self.invalidate_assumptions(id);
        self.table.get_mut(id).profile.record_deopt();
        self.stats.deoptimizations += 1;
        let baseline = self
            .table
            .get(id)
            .baseline_code()
            .cloned()
            .ok_or_else(|| {
                Error::InternalError("deoptimizing a function without baseline code".into())
            })?;
        closure.deoptimize_to(baseline);
        debug!(function = self.table.name_of(id), "deoptimized to baseline");
        Ok(())
    }

    // ---- internals ----

    fn parse_and_analyze(&self, id: DescriptorId) -> Result<Arc<ParsedFunction>> {
        let literal = Arc::clone(&self.table.get(id).literal);
        let scope = analyze(&literal)?;
        Ok(Arc::new(ParsedFunction { literal, scope }))
    }

    /// Generate baseline code: numeric-module validator first when selected,
    /// falling back to the standard strategy if validation fails.
    fn generate_baseline_code(
        &mut self,
        id: DescriptorId,
        parsed: &Arc<ParsedFunction>,
        is_debug: bool,
    ) -> Result<BaselineCode> {
        let literal = Arc::clone(&parsed.literal);
        if use_numeric_backend(&literal, self.table.get(id), &self.config, is_debug) {
            let (status, mut info) =
                self.run_sync_job(id, Box::new(NumericModuleBackend::new()), parsed, is_debug);
            self.stats.baseline_attempts += 1;
            match status {
                JobStatus::Succeeded => {
                    if let Some(CompiledArtifact::Baseline(code)) = info.take_output() {
                        return Ok(code);
                    }
                    return Err(Error::InternalError(
                        "numeric backend produced no baseline code".into(),
                    ));
                }
                JobStatus::Failed => {
                    if let Some(err) = info.fatal_error.take() {
                        return Err(err);
                    }
                    // Validation failed: the module is off limits forever,
                    // and control falls through to the standard strategy
                    debug!(
                        function = self.table.name_of(id),
                        "numeric module validation failed, falling back"
                    );
                    self.table.get_mut(id).flags |= DescriptorFlags::NUMERIC_MODULE_BROKEN;
                }
            }
        }

        let strategy = select_unoptimized_strategy(&literal, self.table.get(id), &self.config);
        let backend: Box<dyn TierBackend> = match strategy {
            UnoptimizedStrategy::LegacyBaseline => Box::new(LegacyBaselineBackend::new()),
            UnoptimizedStrategy::BytecodeInterpreter => Box::new(InterpreterBackend::new()),
        };
        trace!(
            function = self.table.name_of(id),
            strategy = ?strategy,
            "selected baseline strategy"
        );
        let (status, mut info) = self.run_sync_job(id, backend, parsed, is_debug);
        self.stats.baseline_attempts += 1;
        if status == JobStatus::Failed {
            if let Some(err) = info.fatal_error.take() {
                return Err(err);
            }
            return Err(Error::CompileError(format!(
                "failed to compile '{}'",
                self.table.name_of(id)
            )));
        }
        match info.take_output() {
            Some(CompiledArtifact::Baseline(code)) => Ok(code),
            other => Err(Error::InternalError(format!(
                "baseline job produced unexpected artifact: {:?}",
                other
            ))),
        }
    }

    /// Run all three phases of a baseline-tier job on the calling thread
    fn run_sync_job(
        &mut self,
        id: DescriptorId,
        backend: Box<dyn TierBackend>,
        parsed: &Arc<ParsedFunction>,
        is_debug: bool,
    ) -> (JobStatus, CompilationInfo) {
        let mut info = CompilationInfo::new(id, self.table.name_of(id));
        info.is_debug = is_debug;
        let mut job = CompilationJob::new(backend, info, Arc::clone(parsed));
        let mut status = job.prepare(&self.table);
        if status == JobStatus::Succeeded {
            status = job.execute();
        }
        if status == JobStatus::Succeeded {
            status = job.finalize(&self.table);
        }
        (status, job.into_info())
    }

    /// Install a successful optimizing attempt: cache insert per policy,
    /// memory accounting, stats.
    fn install_optimized_artifact(
        &mut self,
        info: &CompilationInfo,
        artifact: CompiledArtifact,
    ) -> Result<Arc<OptimizedCode>> {
        cache::insert(&mut self.table, info, &artifact);
        match artifact {
            CompiledArtifact::Optimized(code) => {
                self.memory.record_allocation(code.size_bytes());
                self.stats.optimize_succeeded += 1;
                Ok(code)
            }
            CompiledArtifact::Baseline(_) => Err(Error::InternalError(
                "optimizing job produced baseline code".into(),
            )),
        }
    }

    /// Interpret a failed optimizing attempt: record the bailout, apply the
    /// abort-vs-retry protocol, and re-surface fatal errors on the owning
    /// thread. Optimization failures themselves stay silent.
    fn handle_failed_optimize_job(&mut self, mut info: CompilationInfo) -> Result<()> {
        self.stats.optimize_bailouts += 1;
        if let Some(reason) = info.bailout {
            debug!(
                function = %info.function_name,
                reason = %reason,
                "aborted optimizing"
            );
            self.table.get_mut(info.descriptor).profile.last_bailout = Some(reason);
            if info.disable_future_optimization {
                self.table.get_mut(info.descriptor).disable_optimization(reason);
            }
        }
        if let Some(err) = info.fatal_error.take() {
            return Err(err);
        }
        Ok(())
    }

    /// Drain the in-flight job for a descriptor through the blocking path
    fn drain_inflight(&mut self, id: DescriptorId) -> Result<()> {
        match self.dispatcher.finish_now(id) {
            Some(job) => self.finalize_background_job(job),
            None => {
                // Nothing to drain; drop the stale marker
                self.pending.remove(&id);
                self.inflight_deps.remove(&id);
                Ok(())
            }
        }
    }

    /// Finalize one background job back on the owning thread, re-validating
    /// the conditions that may have changed while it executed.
    fn finalize_background_job(&mut self, mut job: CompilationJob) -> Result<()> {
        let id = job.descriptor();
        self.pending.remove(&id);
        self.inflight_deps.remove(&id);
        // Completing the attempt consumes the function's hotness either way
        self.table.get_mut(id).profile.profiler_ticks = 0;

        if job.state() == JobState::ReadyToFinalize {
            if self.table.get(id).optimization_disabled() {
                job.retry_optimization(BailoutReason::OptimizationDisabled);
            } else if job.info().dependencies.has_aborted() {
                job.retry_optimization(BailoutReason::DependencyChange);
            } else if job.finalize(&self.table) == JobStatus::Succeeded {
                let mut info = job.into_info();
                let artifact = info.take_output().ok_or_else(|| {
                    Error::InternalError("background job produced no code".into())
                })?;
                let _code = self.install_optimized_artifact(&info, artifact)?;
                debug!(function = %info.function_name, "completed concurrent optimizing");
                return Ok(());
            }
        }

        self.stats.concurrent_discarded += 1;
        self.handle_failed_optimize_job(job.into_info())
    }

    /// Resolve a (possibly pending) closure against the descriptor's
    /// current state: cached optimized code wins, otherwise plain baseline.
    fn resolve_from_descriptor(&mut self, closure: &mut ClosureInstance) -> Result<OptimizeStatus> {
        let id = closure.descriptor();
        if let Some(code) = cache::lookup(&mut self.table, id, None) {
            closure.install_optimized(code);
            Ok(OptimizeStatus::Optimized)
        } else {
            closure.clear_optimize_pending();
            Ok(OptimizeStatus::NotOptimized)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parse::parse_function;

    fn compiler() -> Compiler {
        Compiler::new(CompilerConfig::default()).unwrap()
    }

    fn declare(compiler: &mut Compiler, line: &str, literal_id: u32) -> DescriptorId {
        let script = compiler.register_script("test.fn");
        let literal = Arc::new(parse_function(line, 1, literal_id).unwrap());
        compiler.get_or_create_descriptor(&literal, script)
    }

    #[test]
    fn test_compile_baseline_installs_and_runs() {
        let mut compiler = compiler();
        let id = declare(&mut compiler, "fn add(a, b) = a + b", 0);
        let mut closure = compiler.instantiate(id);
        compiler.compile_baseline(&mut closure).unwrap();
        assert!(closure.is_compiled());
        assert_eq!(closure.call(&[40.0, 2.0]).unwrap(), 42.0);
        assert_eq!(compiler.stats().baseline_compile_count, 1);
    }

    #[test]
    fn test_compile_baseline_idempotent() {
        let mut compiler = compiler();
        let id = declare(&mut compiler, "fn f(x) = x * 2", 0);
        let mut closure = compiler.instantiate(id);
        compiler.compile_baseline(&mut closure).unwrap();
        let attempts = compiler.stats().baseline_attempts;
        compiler.compile_baseline(&mut closure).unwrap();
        assert_eq!(compiler.stats().baseline_attempts, attempts);
    }

    #[test]
    fn test_analysis_failure_propagates() {
        let mut compiler = compiler();
        let id = declare(&mut compiler, "fn bad(x) = x + missing", 0);
        let mut closure = compiler.instantiate(id);
        let err = compiler.compile_baseline(&mut closure).unwrap_err();
        assert!(err.is_source_error());
        assert!(!closure.is_compiled());
    }

    #[test]
    fn test_numeric_module_fallback_marks_broken() {
        let mut compiler = compiler();
        // Fractional constant fails numeric validation
        let id = declare(&mut compiler, "numeric fn f(a) = a * 1.5", 0);
        let mut closure = compiler.instantiate(id);
        compiler.compile_baseline(&mut closure).unwrap();
        assert!(compiler.table().get(id).numeric_module_broken());
        // Fell back to the interpreter and still runs
        assert_eq!(closure.call(&[2.0]).unwrap(), 3.0);
    }

    #[test]
    fn test_sync_optimize_installs_and_caches() {
        let mut compiler = compiler();
        let id = declare(&mut compiler, "fn f(x) = x * (2 + 3)", 0);
        let mut closure = compiler.instantiate(id);
        compiler.compile_baseline(&mut closure).unwrap();
        let status = compiler
            .compile_optimized(&mut closure, ConcurrencyMode::Synchronous)
            .unwrap();
        assert_eq!(status, OptimizeStatus::Optimized);
        assert!(closure.is_optimized());
        assert_eq!(closure.call(&[4.0]).unwrap(), 20.0);
        assert!(compiler.table().get(id).profile.optimized_code().is_some());
    }

    #[test]
    fn test_optimize_uncompiled_function_bails() {
        let mut compiler = compiler();
        let id = declare(&mut compiler, "fn f(x) = x", 0);
        let mut closure = compiler.instantiate(id);
        let status = compiler
            .compile_optimized(&mut closure, ConcurrencyMode::Synchronous)
            .unwrap();
        assert_eq!(status, OptimizeStatus::NotOptimized);
        assert_eq!(
            compiler.table().get(id).profile.last_bailout,
            Some(BailoutReason::NotCompiled)
        );
        assert_eq!(compiler.stats().optimize_attempts, 0);
    }

    #[test]
    fn test_always_opt_optimizes_after_baseline() {
        let mut compiler = Compiler::new(CompilerConfig {
            always_opt: true,
            ..Default::default()
        })
        .unwrap();
        let id = declare(&mut compiler, "fn f(x) = x + 1", 0);
        let mut closure = compiler.instantiate(id);
        compiler.compile_baseline(&mut closure).unwrap();
        assert!(closure.is_optimized());
        assert_eq!(closure.call(&[1.0]).unwrap(), 2.0);
        assert!(compiler.table().get(id).profile.optimized_code().is_some());
    }

    #[test]
    fn test_instantiate_picks_up_cached_code() {
        let mut compiler = compiler();
        let id = declare(&mut compiler, "fn f(x) = x + 1", 0);
        let mut first = compiler.instantiate(id);
        compiler.compile_baseline(&mut first).unwrap();
        compiler
            .compile_optimized(&mut first, ConcurrencyMode::Synchronous)
            .unwrap();

        let second = compiler.instantiate(id);
        assert!(second.is_optimized());
    }

    #[test]
    fn test_deoptimize_round_trip() {
        let mut compiler = compiler();
        let id = declare(&mut compiler, "fn f(x) = x * 3", 0);
        let mut closure = compiler.instantiate(id);
        compiler.compile_baseline(&mut closure).unwrap();
        compiler
            .compile_optimized(&mut closure, ConcurrencyMode::Synchronous)
            .unwrap();
        assert!(closure.is_optimized());

        compiler.deoptimize(&mut closure).unwrap();
        assert!(!closure.is_optimized());
        assert!(closure.is_compiled());
        assert!(compiler.table().get(id).profile.optimized_code().is_none());
        assert_eq!(compiler.stats().deoptimizations, 1);
        // Still runs on baseline
        assert_eq!(closure.call(&[2.0]).unwrap(), 6.0);
        // And can be optimized again later
        let status = compiler
            .compile_optimized(&mut closure, ConcurrencyMode::Synchronous)
            .unwrap();
        assert_eq!(status, OptimizeStatus::Optimized);
    }

    #[test]
    fn test_compile_for_debugging_replaces_code_and_clears_cache() {
        let mut compiler = compiler();
        let id = declare(&mut compiler, "fn f(x) = x + 1", 0);
        let mut closure = compiler.instantiate(id);
        compiler.compile_baseline(&mut closure).unwrap();
        compiler
            .compile_optimized(&mut closure, ConcurrencyMode::Synchronous)
            .unwrap();

        compiler.compile_for_debugging(id).unwrap();
        assert!(compiler.table().get(id).profile.optimized_code().is_none());
        let descriptor = compiler.table().get(id);
        let baseline = descriptor.baseline_code().unwrap();
        assert!(baseline.for_debugging());
    }

    #[test]
    fn test_invalid_opt_filter_is_rejected() {
        let config = CompilerConfig {
            opt_filter: Some("(unclosed".into()),
            ..Default::default()
        };
        assert!(Compiler::new(config).is_err());
    }

    #[test]
    fn test_stats_display() {
        let compiler = compiler();
        let text = format!("{}", compiler.stats());
        assert!(text.contains("Compilation Summary"));
        assert!(text.contains("Baseline"));
    }
}
