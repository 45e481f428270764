//! Bytecode interpreter tier
//!
//! The default baseline strategy: lowers a function body to stack bytecode.
//! Handles every function kind, including resumable functions and intrinsic
//! calls the legacy backend cannot represent.

use crate::code::{BaselineCode, BytecodeChunk, Opcode};
use crate::descriptor::DescriptorTable;
use crate::error::Error;
use crate::job::{CompilationInfo, CompiledArtifact, ParsedFunction, PhaseResult, TierBackend};
use crate::parse::{intrinsic_index, BinaryOp, Expr, ScopeInfo};
use std::sync::Arc;

/// Baseline bytecode generator
pub struct InterpreterBackend {
    chunk: Option<BytecodeChunk>,
}

impl InterpreterBackend {
    pub fn new() -> Self {
        Self { chunk: None }
    }
}

impl Default for InterpreterBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl TierBackend for InterpreterBackend {
    fn name(&self) -> &'static str {
        "interpreter"
    }

    fn prepare(
        &mut self,
        _info: &mut CompilationInfo,
        parsed: &ParsedFunction,
        _table: &DescriptorTable,
    ) -> PhaseResult {
        if parsed.literal.params.len() > u8::MAX as usize {
            return Err(Error::InternalError("too many parameters".into()).into());
        }
        Ok(())
    }

    fn execute(&mut self, info: &mut CompilationInfo, parsed: &ParsedFunction) -> PhaseResult {
        let mut chunk = BytecodeChunk::new(parsed.scope.param_count());
        chunk.for_debugging = info.is_debug;
        emit_expr(&parsed.literal.body, &parsed.scope, &mut chunk)?;
        chunk.write_op(Opcode::Return);
        self.chunk = Some(chunk);
        Ok(())
    }

    fn finalize(
        &mut self,
        info: &mut CompilationInfo,
        _parsed: &ParsedFunction,
        _table: &DescriptorTable,
    ) -> PhaseResult {
        let chunk = self
            .chunk
            .take()
            .ok_or_else(|| Error::InternalError("finalize without generated chunk".into()))?;
        info.output = Some(CompiledArtifact::Baseline(BaselineCode::Bytecode(
            Arc::new(chunk),
        )));
        Ok(())
    }
}

/// Lower one expression onto the chunk's value stack
fn emit_expr(expr: &Expr, scope: &ScopeInfo, chunk: &mut BytecodeChunk) -> PhaseResult {
    match expr {
        Expr::Number(value) => {
            let idx = chunk.add_constant(*value);
            chunk.write_op(Opcode::LoadConst);
            chunk.write_byte(idx);
        }
        Expr::Ident(name) => {
            let slot = scope.resolve(name).ok_or_else(|| {
                Error::InternalError(format!("unresolved identifier '{}'", name))
            })?;
            chunk.write_op(Opcode::LoadParam);
            chunk.write_byte(slot);
        }
        Expr::Neg(inner) => {
            emit_expr(inner, scope, chunk)?;
            chunk.write_op(Opcode::Neg);
        }
        Expr::Binary { op, lhs, rhs } => {
            emit_expr(lhs, scope, chunk)?;
            emit_expr(rhs, scope, chunk)?;
            chunk.write_op(match op {
                BinaryOp::Add => Opcode::Add,
                BinaryOp::Sub => Opcode::Sub,
                BinaryOp::Mul => Opcode::Mul,
                BinaryOp::Div => Opcode::Div,
            });
        }
        Expr::Call { callee, args } => {
            for arg in args {
                emit_expr(arg, scope, chunk)?;
            }
            let idx = intrinsic_index(callee).ok_or_else(|| {
                Error::InternalError(format!("unknown intrinsic '{}'", callee))
            })?;
            chunk.write_op(Opcode::Intrinsic);
            chunk.write_byte(idx);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::DescriptorId;
    use crate::job::CompilationJob;
    use crate::parse::{analyze, parse_function};

    fn compile(line: &str) -> BaselineCode {
        let literal = Arc::new(parse_function(line, 1, 0).unwrap());
        let scope = analyze(&literal).unwrap();
        let parsed = Arc::new(ParsedFunction { literal, scope });
        let info = CompilationInfo::new(DescriptorId(0), "test");
        let mut job = CompilationJob::new(Box::new(InterpreterBackend::new()), info, parsed);
        let table = DescriptorTable::new();
        job.prepare(&table);
        job.execute();
        job.finalize(&table);
        match job.into_info().take_output() {
            Some(CompiledArtifact::Baseline(code)) => code,
            other => panic!("unexpected artifact: {:?}", other),
        }
    }

    #[test]
    fn test_compile_and_run_arithmetic() {
        let code = compile("fn f(a, b) = a * b + 1");
        assert_eq!(code.run(&[6.0, 7.0]).unwrap(), 43.0);
    }

    #[test]
    fn test_compile_and_run_negation() {
        let code = compile("fn f(a) = -a - 2");
        assert_eq!(code.run(&[5.0]).unwrap(), -7.0);
    }

    #[test]
    fn test_compile_and_run_intrinsic() {
        let code = compile("fn hyp(a, b) = sqrt(a * a + b * b)");
        assert_eq!(code.run(&[3.0, 4.0]).unwrap(), 5.0);
    }

    #[test]
    fn test_compile_and_run_min_max() {
        let code = compile("fn clamp01(x) = min(max(x, 0), 1)");
        assert_eq!(code.run(&[-0.5]).unwrap(), 0.0);
        assert_eq!(code.run(&[0.25]).unwrap(), 0.25);
        assert_eq!(code.run(&[3.0]).unwrap(), 1.0);
    }

    #[test]
    fn test_debug_flag_propagates() {
        let literal = Arc::new(parse_function("fn f(x) = x", 1, 0).unwrap());
        let scope = analyze(&literal).unwrap();
        let parsed = Arc::new(ParsedFunction { literal, scope });
        let mut info = CompilationInfo::new(DescriptorId(0), "f");
        info.is_debug = true;
        let mut job = CompilationJob::new(Box::new(InterpreterBackend::new()), info, parsed);
        let table = DescriptorTable::new();
        job.prepare(&table);
        job.execute();
        job.finalize(&table);
        match job.into_info().take_output() {
            Some(CompiledArtifact::Baseline(code)) => assert!(code.for_debugging()),
            other => panic!("unexpected artifact: {:?}", other),
        }
    }
}
