//! Numeric-subset module backend
//!
//! An asm-like fast path: `numeric fn` declarations promise to stay inside a
//! validated numeric subset (plain arithmetic over parameters and integral
//! constants, no intrinsic calls). Validation runs during prepare; a module
//! that fails is compiled by the standard strategy instead, and the
//! orchestrator marks its descriptor broken so it is never revalidated.

use crate::code::BaselineCode;
use crate::descriptor::DescriptorTable;
use crate::error::{BailoutReason, Error};
use crate::job::{CompilationInfo, CompiledArtifact, ParsedFunction, PhaseResult, TierBackend};
use crate::parse::Expr;
use crate::tiers::legacy::emit_legacy;
use std::sync::Arc;

/// Validator + legacy-op emitter for numeric-subset modules
pub struct NumericModuleBackend {
    code: Option<crate::code::LegacyCode>,
}

impl NumericModuleBackend {
    pub fn new() -> Self {
        Self { code: None }
    }
}

impl Default for NumericModuleBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl TierBackend for NumericModuleBackend {
    fn name(&self) -> &'static str {
        "numeric-module"
    }

    fn prepare(
        &mut self,
        _info: &mut CompilationInfo,
        parsed: &ParsedFunction,
        _table: &DescriptorTable,
    ) -> PhaseResult {
        if !validates_as_numeric(&parsed.literal.body) {
            return Err(BailoutReason::NumericModuleInvalid.into());
        }
        Ok(())
    }

    fn execute(&mut self, _info: &mut CompilationInfo, parsed: &ParsedFunction) -> PhaseResult {
        self.code = Some(emit_legacy(parsed, true)?);
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

/// Whether an expression stays inside the validated numeric subset:
/// arithmetic over parameters and finite integral constants only.
pub fn validates_as_numeric(expr: &Expr) -> bool {
    match expr {
        Expr::Number(value) => value.is_finite() && value.fract() == 0.0,
        Expr::Ident(_) => true,
        Expr::Neg(inner) => validates_as_numeric(inner),
        Expr::Binary { lhs, rhs, .. } => validates_as_numeric(lhs) && validates_as_numeric(rhs),
        Expr::Call { .. } => false,
    }
}
