//! Function descriptors, execution profiles, and closures
//!
//! A [`FunctionDescriptor`] is the shared, table-owned record of a function's
//! static identity: its baseline code, execution profile, and flags. Many
//! [`ClosureInstance`]s may reference one descriptor; closures hold a
//! [`DescriptorId`] into the [`DescriptorTable`] rather than a direct
//! reference, so concurrent optimization never aliases a mutable descriptor.

use crate::code::{BaselineCode, OptimizedCode};
use crate::error::{BailoutReason, Error, Result};
use crate::parse::FunctionLiteral;
use bitflags::bitflags;
use rustc_hash::FxHashMap;
use std::sync::Arc;
use string_interner::{DefaultStringInterner, DefaultSymbol};

bitflags! {
    /// Per-descriptor flag word
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DescriptorFlags: u8 {
        /// Optimization is permanently disabled for this function
        const OPTIMIZATION_DISABLED = 1 << 0;
        /// Declared at program scope
        const IS_TOPLEVEL = 1 << 1;
        /// May be compiled lazily on first call
        const ALLOWS_LAZY_COMPILATION = 1 << 2;
        /// Numeric-module validation failed once; never revalidated
        const NUMERIC_MODULE_BROKEN = 1 << 3;
        /// A debugger breakpoint is attached
        const HAS_BREAKPOINT = 1 << 4;
    }
}

/// Stable identifier of a function descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DescriptorId(pub u32);

/// Stable identifier of a registered script
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ScriptId(pub u32);

/// Per-function runtime feedback record.
///
/// Holds the single optimized-code slot; attaching or clearing code resets
/// the profiler tick counter so the function must become hot again before
/// the next optimization request.
#[derive(Debug, Default)]
pub struct ExecutionProfile {
    /// Total recorded invocations
    pub invocation_count: u64,
    /// Ticks since code was last attached
    pub profiler_ticks: u32,
    /// Times this function deoptimized
    pub deopt_count: u32,
    /// The optimized-code slot (normal entry only; OSR code is never stored)
    optimized: Option<Arc<OptimizedCode>>,
    /// Most recent optimization bailout, for diagnostics
    pub last_bailout: Option<BailoutReason>,
}

impl ExecutionProfile {
    /// Current optimized code, if any (no eviction; see the cache module)
    pub fn optimized_code(&self) -> Option<&Arc<OptimizedCode>> {
        self.optimized.as_ref()
    }

    /// Attach optimized code and reset the tick counter
    pub fn set_optimized_code(&mut self, code: Arc<OptimizedCode>) {
        self.optimized = Some(code);
        self.profiler_ticks = 0;
    }

    /// Drop the slot and reset the tick counter
    pub fn clear_optimized_code(&mut self) {
        self.optimized = None;
        self.profiler_ticks = 0;
    }

    /// Record one profiler tick
    pub fn tick(&mut self) {
        self.profiler_ticks = self.profiler_ticks.saturating_add(1);
    }

    /// Record one invocation
    pub fn record_invocation(&mut self) {
        self.invocation_count += 1;
    }

    /// Record a deoptimization event
    pub fn record_deopt(&mut self) {
        self.deopt_count += 1;
    }
}

/// Shared record of a function's static identity
#[derive(Debug)]
pub struct FunctionDescriptor {
    /// Stable id
    pub id: DescriptorId,
    /// Owning script
    pub script: ScriptId,
    /// Interned function name
    name: DefaultSymbol,
    /// Flag word
    pub flags: DescriptorFlags,
    /// At most one baseline representation at a time
    baseline: Option<BaselineCode>,
    /// Runtime feedback
    pub profile: ExecutionProfile,
    /// The parsed literal this descriptor was created from
    pub literal: Arc<FunctionLiteral>,
    /// Why optimization was permanently disabled, if it was
    pub disable_reason: Option<BailoutReason>,
}

impl FunctionDescriptor {
    /// Whether any baseline representation is installed
    pub fn is_compiled(&self) -> bool {
        self.baseline.is_some()
    }

    /// The installed baseline code
    pub fn baseline_code(&self) -> Option<&BaselineCode> {
        self.baseline.as_ref()
    }

    /// Install baseline code. A descriptor holds at most one baseline
    /// representation; installing over live code is a contract violation.
    pub fn install_baseline(&mut self, code: BaselineCode) {
        assert!(
            self.baseline.is_none(),
            "baseline code already installed for descriptor {:?}",
            self.id
        );
        self.baseline = Some(code);
    }

    /// Replace baseline code for a debug recompile. The old representation
    /// is dropped first, keeping the single-representation invariant.
    pub fn replace_baseline_for_debug(&mut self, code: BaselineCode) {
        self.baseline = None;
        self.install_baseline(code);
    }

    /// Permanently disable optimization, recording the reason
    pub fn disable_optimization(&mut self, reason: BailoutReason) {
        self.flags |= DescriptorFlags::OPTIMIZATION_DISABLED;
        self.disable_reason = Some(reason);
    }

    /// Whether optimization is permanently disabled
    pub fn optimization_disabled(&self) -> bool {
        self.flags.contains(DescriptorFlags::OPTIMIZATION_DISABLED)
    }

    /// Whether a debugger breakpoint is attached
    pub fn has_breakpoint(&self) -> bool {
        self.flags.contains(DescriptorFlags::HAS_BREAKPOINT)
    }

    /// Whether this descriptor's numeric-module validation is broken
    pub fn numeric_module_broken(&self) -> bool {
        self.flags.contains(DescriptorFlags::NUMERIC_MODULE_BROKEN)
    }
}

/// Table owning every function descriptor, indexed by stable id.
///
/// Created once per compiler; descriptors are never removed while the table
/// lives, so ids stay valid for the whole session.
#[derive(Debug, Default)]
pub struct DescriptorTable {
    descriptors: Vec<FunctionDescriptor>,
    names: DefaultStringInterner,
    scripts: Vec<String>,
    by_literal: FxHashMap<(ScriptId, u32), DescriptorId>,
}

impl DescriptorTable {
    /// Create an empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a script and return its id
    pub fn register_script(&mut self, name: impl Into<String>) -> ScriptId {
        let id = ScriptId(self.scripts.len() as u32);
        self.scripts.push(name.into());
        id
    }

    /// Name of a registered script
    pub fn script_name(&self, id: ScriptId) -> &str {
        &self.scripts[id.0 as usize]
    }

    /// Find or create the descriptor for a literal within a script.
    /// Descriptor flags are seeded from the literal on first creation.
    pub fn get_or_create(
        &mut self,
        literal: &Arc<FunctionLiteral>,
        script: ScriptId,
    ) -> DescriptorId {
        let key = (script, literal.literal_id);
        if let Some(&existing) = self.by_literal.get(&key) {
            return existing;
        }
        let id = DescriptorId(self.descriptors.len() as u32);
        let name = self.names.get_or_intern(&literal.name);
        let mut flags = DescriptorFlags::IS_TOPLEVEL;
        if !literal.numeric_module {
            // Numeric modules are validated eagerly and cannot defer
            // compilation to first call.
            flags |= DescriptorFlags::ALLOWS_LAZY_COMPILATION;
        }
        self.descriptors.push(FunctionDescriptor {
            id,
            script,
            name,
            flags,
            baseline: None,
            profile: ExecutionProfile::default(),
            literal: Arc::clone(literal),
            disable_reason: None,
        });
        self.by_literal.insert(key, id);
        id
    }

    /// Borrow a descriptor
    pub fn get(&self, id: DescriptorId) -> &FunctionDescriptor {
        &self.descriptors[id.0 as usize]
    }

    /// Mutably borrow a descriptor
    pub fn get_mut(&mut self, id: DescriptorId) -> &mut FunctionDescriptor {
        &mut self.descriptors[id.0 as usize]
    }

    /// Resolve a descriptor's function name
    pub fn name_of(&self, id: DescriptorId) -> &str {
        self.names
            .resolve(self.get(id).name)
            .unwrap_or("<anonymous>")
    }

    /// Number of descriptors
    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    /// Whether the table is empty
    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }

    /// Iterate all descriptor ids
    pub fn ids(&self) -> impl Iterator<Item = DescriptorId> + '_ {
        (0..self.descriptors.len() as u32).map(DescriptorId)
    }
}

/// Executable-code state of a closure, observed externally as
/// `Uncompiled → Baseline → {Baseline, OptimizedPending, Optimized}` with
/// `OptimizedPending → {Optimized, Baseline}` and a single
/// `Optimized → Baseline` transition per artifact (deoptimization).
#[derive(Debug, Clone)]
pub enum CodeState {
    /// No executable code installed
    Uncompiled,
    /// Running baseline code
    Baseline(BaselineCode),
    /// Running baseline code while a concurrent optimization is in flight
    OptimizedPending(BaselineCode),
    /// Running optimized code
    Optimized(Arc<OptimizedCode>),
}

impl CodeState {
    /// Short name for diagnostics
    pub fn name(&self) -> &'static str {
        match self {
            CodeState::Uncompiled => "uncompiled",
            CodeState::Baseline(_) => "baseline",
            CodeState::OptimizedPending(_) => "optimized-pending",
            CodeState::Optimized(_) => "optimized",
        }
    }
}

/// A runtime instance of a function bound to a specific lexical context
#[derive(Debug, Clone)]
pub struct ClosureInstance {
    descriptor: DescriptorId,
    code: CodeState,
}

impl ClosureInstance {
    /// Create an uncompiled closure over a descriptor
    pub fn new(descriptor: DescriptorId) -> Self {
        Self {
            descriptor,
            code: CodeState::Uncompiled,
        }
    }

    /// The shared descriptor this closure references
    pub fn descriptor(&self) -> DescriptorId {
        self.descriptor
    }

    /// Current executable-code state
    pub fn code(&self) -> &CodeState {
        &self.code
    }

    /// Whether any executable code is installed
    pub fn is_compiled(&self) -> bool {
        !matches!(self.code, CodeState::Uncompiled)
    }

    /// Whether optimized code is installed
    pub fn is_optimized(&self) -> bool {
        matches!(self.code, CodeState::Optimized(_))
    }

    /// Whether a concurrent optimization is outstanding
    pub fn is_optimize_pending(&self) -> bool {
        matches!(self.code, CodeState::OptimizedPending(_))
    }

    /// Install baseline code (from `Uncompiled`, or restoring after a
    /// discarded optimization attempt)
    pub fn install_baseline(&mut self, code: BaselineCode) {
        self.code = CodeState::Baseline(code);
    }

    /// Enter the transient pending state while a background job runs.
    /// Baseline code keeps executing until finalize resolves the attempt.
    pub fn mark_optimize_pending(&mut self) {
        let current = std::mem::replace(&mut self.code, CodeState::Uncompiled);
        self.code = match current {
            CodeState::Baseline(baseline) => CodeState::OptimizedPending(baseline),
            other => other,
        };
    }

    /// Leave the pending state, restoring plain baseline execution
    pub fn clear_optimize_pending(&mut self) {
        let current = std::mem::replace(&mut self.code, CodeState::Uncompiled);
        self.code = match current {
            CodeState::OptimizedPending(baseline) => CodeState::Baseline(baseline),
            other => other,
        };
    }

    /// Swap in optimized code
    pub fn install_optimized(&mut self, code: Arc<OptimizedCode>) {
        self.code = CodeState::Optimized(code);
    }

    /// The one-way `Optimized → Baseline` transition after deoptimization
    pub fn deoptimize_to(&mut self, baseline: BaselineCode) {
        assert!(
            matches!(self.code, CodeState::Optimized(_)),
            "deoptimize on a closure without optimized code"
        );
        self.code = CodeState::Baseline(baseline);
    }

    /// Execute the closure's installed code
    pub fn call(&self, args: &[f64]) -> Result<f64> {
        match &self.code {
            CodeState::Uncompiled => {
                Err(Error::CompileError("function is not compiled".into()))
            }
            CodeState::Baseline(code) | CodeState::OptimizedPending(code) => code.run(args),
            CodeState::Optimized(code) => code.run(args),
        }
    }
}
