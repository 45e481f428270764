//! Speculative optimizing tier
//!
//! The only backend whose execute phase may run on a background thread. The
//! prepare phase snapshots everything execute needs into an owned
//! [`OptSnapshot`] — profile summary plus a lowered instruction stream — so
//! execute operates purely on self-contained data and never touches the
//! descriptor table. Constant folding collapses subtrees whose operands are
//! all known; the assumptions behind the specialization are recorded in the
//! job's dependency set and checked again at finalize time.

use crate::code::{OptInst, OptimizedCode};
use crate::descriptor::DescriptorTable;
use crate::error::{BailoutReason, Error};
use crate::job::{CompilationInfo, CompiledArtifact, ParsedFunction, PhaseResult, TierBackend};
use crate::parse::{apply_intrinsic, intrinsic_arity, intrinsic_index, BinaryOp, Expr, ScopeInfo};
use std::sync::Arc;

/// Upper bound on the instruction stream the optimizer will traverse.
/// Exceeding it is resource exhaustion, surfaced on the owning thread.
pub const MAX_OPT_INSTRUCTIONS: usize = 10_000;

/// Self-contained input for the detached execute phase
#[derive(Debug)]
struct OptSnapshot {
    /// Lowered, unoptimized instruction stream
    base: Vec<OptInst>,
    /// Parameter count at snapshot time
    param_count: u8,
    /// Invocation count at snapshot time, for logging
    invocations: u64,
}

/// Graph-based optimizing backend (linear rendition)
pub struct OptimizingBackend {
    snapshot: Option<OptSnapshot>,
    optimized: Option<Vec<OptInst>>,
}

impl OptimizingBackend {
    pub fn new() -> Self {
        Self {
            snapshot: None,
            optimized: None,
        }
    }
}

impl Default for OptimizingBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl TierBackend for OptimizingBackend {
    fn name(&self) -> &'static str {
        "optimizing"
    }

    fn can_execute_on_background(&self) -> bool {
        true
    }

    fn prepare(
        &mut self,
        info: &mut CompilationInfo,
        parsed: &ParsedFunction,
        table: &DescriptorTable,
    ) -> PhaseResult {
        let descriptor = table.get(info.descriptor);
        if !descriptor.is_compiled() {
            return Err(BailoutReason::NotCompiled.into());
        }

        // The specialized code is only valid while these hold; breaking any
        // of them after installation must deoptimize.
        info.dependencies.assume(format!(
            "function '{}' keeps its compiled shape",
            parsed.literal.name
        ));
        info.dependencies
            .assume("call arguments remain numeric".to_string());

        self.snapshot = Some(OptSnapshot {
            base: lower(&parsed.literal.body, &parsed.scope)?,
            param_count: parsed.scope.param_count(),
            invocations: descriptor.profile.invocation_count,
        });
        Ok(())
    }

    fn execute(&mut self, _info: &mut CompilationInfo, _parsed: &ParsedFunction) -> PhaseResult {
        let snapshot = self
            .snapshot
            .as_ref()
            .ok_or_else(|| Error::InternalError("execute without snapshot".into()))?;
        if snapshot.base.len() > MAX_OPT_INSTRUCTIONS {
            return Err(Error::stack_overflow(snapshot.base.len(), MAX_OPT_INSTRUCTIONS).into());
        }
        tracing::trace!(
            invocations = snapshot.invocations,
            len = snapshot.base.len(),
            "folding instruction stream"
        );
        self.optimized = Some(fold(&snapshot.base)?);
        Ok(())
    }

    fn finalize(
        &mut self,
        info: &mut CompilationInfo,
        _parsed: &ParsedFunction,
        _table: &DescriptorTable,
    ) -> PhaseResult {
        let snapshot = self
            .snapshot
            .take()
            .ok_or_else(|| Error::InternalError("finalize without snapshot".into()))?;
        let instructions = self
            .optimized
            .take()
            .ok_or_else(|| Error::InternalError("finalize without optimized stream".into()))?;

        let mut code = OptimizedCode::new(
            instructions,
            snapshot.param_count,
            Arc::clone(&info.dependencies),
        );
        code.osr_target = info.osr_target;
        code.context_specialized = info.context_specialized;
        code.frame_specialized = info.frame_specialized;
        info.output = Some(CompiledArtifact::Optimized(Arc::new(code)));
        Ok(())
    }
}

/// Lower an expression to the linear optimizer input form
fn lower(expr: &Expr, scope: &ScopeInfo) -> std::result::Result<Vec<OptInst>, crate::job::PhaseError> {
    let mut out = Vec::new();
    lower_into(expr, scope, &mut out)?;
    Ok(out)
}

fn lower_into(expr: &Expr, scope: &ScopeInfo, out: &mut Vec<OptInst>) -> PhaseResult {
    match expr {
        Expr::Number(value) => out.push(OptInst::Const(*value)),
        Expr::Ident(name) => {
            let slot = scope.resolve(name).ok_or_else(|| {
                Error::InternalError(format!("unresolved identifier '{}'", name))
            })?;
            out.push(OptInst::Param(slot));
        }
        Expr::Neg(inner) => {
            lower_into(inner, scope, out)?;
            out.push(OptInst::Neg);
        }
        Expr::Binary { op, lhs, rhs } => {
            lower_into(lhs, scope, out)?;
            lower_into(rhs, scope, out)?;
            out.push(match op {
                BinaryOp::Add => OptInst::Add,
                BinaryOp::Sub => OptInst::Sub,
                BinaryOp::Mul => OptInst::Mul,
                BinaryOp::Div => OptInst::Div,
            });
        }
        Expr::Call { callee, args } => {
            for arg in args {
                lower_into(arg, scope, out)?;
            }
            let idx = intrinsic_index(callee).ok_or_else(|| {
                Error::InternalError(format!("unknown intrinsic '{}'", callee))
            })?;
            out.push(OptInst::Intrinsic(idx));
        }
    }
    Ok(())
}

/// Abstract value on the folding stack: either a known constant or the
/// instruction sequence computing a dynamic value.
enum Folded {
    Const(f64),
    Dynamic(Vec<OptInst>),
}

impl Folded {
    fn materialize(self, out: &mut Vec<OptInst>) {
        match self {
            Folded::Const(value) => out.push(OptInst::Const(value)),
            Folded::Dynamic(code) => out.extend(code),
        }
    }

    fn into_code(self) -> Vec<OptInst> {
        let mut out = Vec::new();
        self.materialize(&mut out);
        out
    }
}

/// Constant-fold a linear instruction stream by abstract stack simulation
fn fold(input: &[OptInst]) -> std::result::Result<Vec<OptInst>, crate::job::PhaseError> {
    let mut stack: Vec<Folded> = Vec::new();
    let underflow = || Error::InternalError("optimizer stack underflow".into());

    for inst in input {
        match inst {
            OptInst::Const(value) => stack.push(Folded::Const(*value)),
            OptInst::Param(slot) => stack.push(Folded::Dynamic(vec![OptInst::Param(*slot)])),
            OptInst::Neg => {
                let a = stack.pop().ok_or_else(underflow)?;
                stack.push(match a {
                    Folded::Const(value) => Folded::Const(-value),
                    Folded::Dynamic(mut code) => {
                        code.push(OptInst::Neg);
                        Folded::Dynamic(code)
                    }
                });
            }
            OptInst::Add | OptInst::Sub | OptInst::Mul | OptInst::Div => {
                let b = stack.pop().ok_or_else(underflow)?;
                let a = stack.pop().ok_or_else(underflow)?;
                stack.push(match (a, b) {
                    (Folded::Const(x), Folded::Const(y)) => Folded::Const(match inst {
                        OptInst::Add => x + y,
                        OptInst::Sub => x - y,
                        OptInst::Mul => x * y,
                        _ => x / y,
                    }),
                    (a, b) => {
                        let mut code = a.into_code();
                        b.materialize(&mut code);
                        code.push(*inst);
                        Folded::Dynamic(code)
                    }
                });
            }
            OptInst::Intrinsic(idx) => {
                let arity = intrinsic_arity(*idx);
                let mut operands = Vec::with_capacity(arity);
                for _ in 0..arity {
                    operands.push(stack.pop().ok_or_else(underflow)?);
                }
                operands.reverse();
                if operands.iter().all(|o| matches!(o, Folded::Const(_))) {
                    let args: Vec<f64> = operands
                        .iter()
                        .map(|o| match o {
                            Folded::Const(value) => *value,
                            Folded::Dynamic(_) => f64::NAN,
                        })
                        .collect();
                    stack.push(Folded::Const(apply_intrinsic(*idx, &args)));
                } else {
                    let mut code = Vec::new();
                    for operand in operands {
                        operand.materialize(&mut code);
                    }
                    code.push(OptInst::Intrinsic(*idx));
                    stack.push(Folded::Dynamic(code));
                }
            }
        }
    }

    let result = stack.pop().ok_or_else(underflow)?;
    if !stack.is_empty() {
        return Err(Error::InternalError("optimizer stack not consumed".into()).into());
    }
    Ok(result.into_code())
}
