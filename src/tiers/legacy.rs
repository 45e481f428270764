//! Legacy baseline backend
//!
//! The older machine-code baseline: a linear op stream with specialized
//! numeric lowering but no intrinsic-call support and no resumable
//! activations. Tier selection keeps incompatible functions away from it;
//! encountering one here is an internal error, not a bailout.

use crate::code::{BaselineCode, LegacyCode, LegacyInst};
use crate::descriptor::DescriptorTable;
use crate::error::Error;
use crate::job::{CompilationInfo, CompiledArtifact, ParsedFunction, PhaseResult, TierBackend};
use crate::parse::{BinaryOp, Expr, ScopeInfo};
use std::sync::Arc;

/// Legacy machine-code generator
pub struct LegacyBaselineBackend {
    code: Option<LegacyCode>,
}

impl LegacyBaselineBackend {
    pub fn new() -> Self {
        Self { code: None }
    }
}

impl Default for LegacyBaselineBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl TierBackend for LegacyBaselineBackend {
    fn name(&self) -> &'static str {
        "legacy-baseline"
    }

    fn prepare(
        &mut self,
        _info: &mut CompilationInfo,
        parsed: &ParsedFunction,
        _table: &DescriptorTable,
    ) -> PhaseResult {
        if parsed.literal.must_use_interpreter() {
            return Err(Error::InternalError(format!(
                "legacy backend selected for incompatible function '{}'",
                parsed.literal.name
            ))
            .into());
        }
        Ok(())
    }

    fn execute(&mut self, _info: &mut CompilationInfo, parsed: &ParsedFunction) -> PhaseResult {
        self.code = Some(emit_legacy(parsed, false)?);
        Ok(())
    }

    fn finalize(
        &mut self,
        info: &mut CompilationInfo,
        _parsed: &ParsedFunction,
        _table: &DescriptorTable,
    ) -> PhaseResult {
        let code = self
            .code
            .take()
            .ok_or_else(|| Error::InternalError("finalize without generated code".into()))?;
        info.output = Some(CompiledArtifact::Baseline(BaselineCode::Legacy(Arc::new(
            code,
        ))));
        Ok(())
    }
}

/// Lower a function to the legacy op stream. Shared with the numeric-module
/// backend, which emits the same instruction set after validation.
pub(crate) fn emit_legacy(
    parsed: &ParsedFunction,
    from_numeric_module: bool,
) -> std::result::Result<LegacyCode, crate::job::PhaseError> {
    let mut code = LegacyCode {
        ops: Vec::new(),
        param_count: parsed.scope.param_count(),
        from_numeric_module,
    };
    emit_expr(&parsed.literal.body, &parsed.scope, &mut code.ops)?;
    Ok(code)
}

fn emit_expr(expr: &Expr, scope: &ScopeInfo, ops: &mut Vec<LegacyInst>) -> PhaseResult {
    match expr {
        Expr::Number(value) => ops.push(LegacyInst::PushConst(*value)),
        Expr::Ident(name) => {
            let slot = scope.resolve(name).ok_or_else(|| {
                Error::InternalError(format!("unresolved identifier '{}'", name))
            })?;
            ops.push(LegacyInst::PushParam(slot));
        }
        Expr::Neg(inner) => {
            emit_expr(inner, scope, ops)?;
            ops.push(LegacyInst::Neg);
        }
        Expr::Binary { op, lhs, rhs } => {
            emit_expr(lhs, scope, ops)?;
            emit_expr(rhs, scope, ops)?;
            ops.push(match op {
                BinaryOp::Add => LegacyInst::Add,
                BinaryOp::Sub => LegacyInst::Sub,
                BinaryOp::Mul => LegacyInst::Mul,
                BinaryOp::Div => LegacyInst::Div,
            });
        }
        Expr::Call { callee, .. } => {
            return Err(Error::InternalError(format!(
                "legacy backend has no lowering for intrinsic '{}'",
                callee
            ))
            .into());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::DescriptorId;
    use crate::job::{CompilationJob, JobStatus};
    use crate::parse::{analyze, parse_function};

    fn parsed(line: &str) -> Arc<ParsedFunction> {
        let literal = Arc::new(parse_function(line, 1, 0).unwrap());
        let scope = analyze(&literal).unwrap();
        Arc::new(ParsedFunction { literal, scope })
    }

    fn run_job(line: &str) -> (JobStatus, Option<CompiledArtifact>) {
        let info = CompilationInfo::new(DescriptorId(0), "test");
        let mut job = CompilationJob::new(Box::new(LegacyBaselineBackend::new()), info, parsed(line));
        let table = DescriptorTable::new();
        if job.prepare(&table) == JobStatus::Failed {
            return (JobStatus::Failed, None);
        }
        if job.execute() == JobStatus::Failed {
            return (JobStatus::Failed, None);
        }
        let status = job.finalize(&table);
        (status, job.into_info().take_output())
    }

    #[test]
    fn test_compile_and_run_arithmetic() {
        let (status, artifact) = run_job("fn f(a, b) = a * b - (a + b)");
        assert_eq!(status, JobStatus::Succeeded);
        match artifact {
            Some(CompiledArtifact::Baseline(code)) => {
                assert_eq!(code.run(&[3.0, 4.0]).unwrap(), 5.0);
            }
            other => panic!("unexpected artifact: {:?}", other),
        }
    }

    #[test]
    fn test_rejects_incompatible_function() {
        let (status, artifact) = run_job("fn f(a) = sqrt(a)");
        assert_eq!(status, JobStatus::Failed);
        assert!(artifact.is_none());
    }

    #[test]
    fn test_emit_legacy_marks_numeric_origin() {
        let code = emit_legacy(&parsed("fn f(a) = a + 1"), true).unwrap();
        assert!(code.from_numeric_module);
        assert_eq!(code.run(&[1.0]).unwrap(), 2.0);
    }
}
