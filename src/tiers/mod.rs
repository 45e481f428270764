//! Compilation tiers
//!
//! Tier selection is pure decision logic over function properties and the
//! process configuration; the per-tier backends implement the
//! [`TierBackend`](crate::job::TierBackend) phases the job state machine
//! drives.

mod interpreter;
mod legacy;
mod numeric;
mod optimizing;

pub use interpreter::InterpreterBackend;
pub use legacy::LegacyBaselineBackend;
pub use numeric::NumericModuleBackend;
pub use optimizing::{OptimizingBackend, MAX_OPT_INSTRUCTIONS};

use crate::config::CompilerConfig;
use crate::descriptor::FunctionDescriptor;
use crate::error::BailoutReason;
use crate::parse::FunctionLiteral;
use regex::Regex;

/// Baseline compilation strategies
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnoptimizedStrategy {
    /// Legacy machine-code baseline backend
    LegacyBaseline,
    /// Bytecode interpreter tier
    BytecodeInterpreter,
}

/// Choose the baseline strategy for a function. Rules apply in order:
///
/// 1. functions the legacy backend cannot represent use the interpreter;
/// 2. validated numeric-subset modules prefer the legacy backend, which has
///    the specialized numeric lowering interpreter tiers lack;
/// 3. the legacy stress flag forces the legacy backend;
/// 4. everything else uses the interpreter.
pub fn select_unoptimized_strategy(
    literal: &FunctionLiteral,
    descriptor: &FunctionDescriptor,
    config: &CompilerConfig,
) -> UnoptimizedStrategy {
    if literal.must_use_interpreter() {
        return UnoptimizedStrategy::BytecodeInterpreter;
    }
    if literal.numeric_module
        && config.validate_numeric_modules
        && !descriptor.numeric_module_broken()
    {
        return UnoptimizedStrategy::LegacyBaseline;
    }
    if config.stress_legacy_baseline {
        return UnoptimizedStrategy::LegacyBaseline;
    }
    UnoptimizedStrategy::BytecodeInterpreter
}

/// Whether the numeric-module validator backend should get the first shot at
/// this function. Validation failures mark the descriptor broken, and broken
/// modules are off limits forever.
pub fn use_numeric_backend(
    literal: &FunctionLiteral,
    descriptor: &FunctionDescriptor,
    config: &CompilerConfig,
    is_debug: bool,
) -> bool {
    if !config.validate_numeric_modules {
        return false;
    }
    if descriptor.numeric_module_broken() {
        return false;
    }
    // Compiling for debugging is not supported by the numeric backend
    if is_debug {
        return false;
    }
    if config.stress_validate_numeric {
        return true;
    }
    literal.numeric_module
}

/// Check whether a function is eligible for the optimizing tier. Every
/// refusal carries its own distinguishable [`BailoutReason`].
pub fn check_optimization_eligibility(
    descriptor: &FunctionDescriptor,
    name: &str,
    opt_filter: Option<&Regex>,
    config: &CompilerConfig,
) -> Result<(), BailoutReason> {
    if descriptor.has_breakpoint() {
        return Err(BailoutReason::FunctionBeingDebugged);
    }
    if descriptor.optimization_disabled() {
        return Err(
            if descriptor.disable_reason == Some(BailoutReason::OptimizationDisabledForTest) {
                BailoutReason::OptimizationDisabledForTest
            } else {
                BailoutReason::OptimizationDisabled
            },
        );
    }
    if !config.opt_enabled {
        return Err(BailoutReason::OptimizationDisabled);
    }
    if let Some(filter) = opt_filter {
        if !filter.is_match(name) {
            return Err(BailoutReason::OptimizationDisabled);
        }
    }
    if !descriptor.is_compiled() {
        return Err(BailoutReason::NotCompiled);
    }
    Ok(())
}
