//! Optimized-code cache
//!
//! One slot per function descriptor, stored in its execution profile,
//! holding the best known optimized code for the normal entry point. OSR
//! compiles target a single in-flight activation and are never cached.
//! Specialized code (context- or frame-folded) is not shareable across
//! closures, so inserting it instead clears any existing shared entry —
//! a stale shared artifact must not be served alongside a never-cached
//! specialized one.
//!
//! The slot is mutated only on the owning thread, inside finalize or an
//! explicit clear; it is a single `Arc` swap, and fast-path readers treat
//! any inconsistency as a miss.

use crate::code::{OptimizedCode, OsrTarget};
use crate::descriptor::{DescriptorId, DescriptorTable};
use crate::job::{CompilationInfo, CompiledArtifact};
use std::sync::Arc;

/// Look up cached optimized code for a descriptor. Entries that were marked
/// for deoptimization since insertion are evicted and reported as a miss.
pub fn lookup(
    table: &mut DescriptorTable,
    id: DescriptorId,
    osr_target: Option<OsrTarget>,
) -> Option<Arc<OptimizedCode>> {
    // Each OSR compile is single-use; the cache only serves the normal entry
    if osr_target.is_some() {
        return None;
    }
    let profile = &mut table.get_mut(id).profile;
    let code = Arc::clone(profile.optimized_code()?);
    if code.marked_for_deoptimization() {
        tracing::debug!(descriptor = id.0, "evicting invalidated optimized code");
        profile.clear_optimized_code();
        return None;
    }
    Some(code)
}

/// Install a finished attempt's artifact into the cache, applying the
/// sharing policy. Baseline artifacts are not cache material.
pub fn insert(table: &mut DescriptorTable, info: &CompilationInfo, artifact: &CompiledArtifact) {
    let code = match artifact {
        CompiledArtifact::Optimized(code) => code,
        CompiledArtifact::Baseline(_) => return,
    };
    if info.osr_target.is_some() {
        return;
    }
    if info.context_specialized || info.frame_specialized {
        clear(table, info.descriptor);
        return;
    }
    table
        .get_mut(info.descriptor)
        .profile
        .set_optimized_code(Arc::clone(code));
}

/// Unconditionally drop the slot and reset the profiler tick counter
pub fn clear(table: &mut DescriptorTable, id: DescriptorId) {
    table.get_mut(id).profile.clear_optimized_code();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::code::{DependencySet, OptInst};
    use crate::parse::parse_function;
    use std::sync::Arc;

    fn setup() -> (DescriptorTable, DescriptorId) {
        let mut table = DescriptorTable::new();
        let script = table.register_script("test.fn");
        let literal = Arc::new(parse_function("fn f(x) = x", 1, 0).unwrap());
        let id = table.get_or_create(&literal, script);
        (table, id)
    }

    fn optimized() -> Arc<OptimizedCode> {
        Arc::new(OptimizedCode::new(
            vec![OptInst::Param(0)],
            1,
            Arc::new(DependencySet::new()),
        ))
    }

    #[test]
    fn test_insert_then_lookup_hits() {
        let (mut table, id) = setup();
        let info = CompilationInfo::for_optimization(id, "f");
        let code = optimized();
        insert(&mut table, &info, &CompiledArtifact::Optimized(Arc::clone(&code)));
        let hit = lookup(&mut table, id, None).unwrap();
        assert!(Arc::ptr_eq(&hit, &code));
    }

    #[test]
    fn test_lookup_miss_on_empty_slot() {
        let (mut table, id) = setup();
        assert!(lookup(&mut table, id, None).is_none());
    }

    #[test]
    fn test_osr_lookup_always_misses() {
        let (mut table, id) = setup();
        let info = CompilationInfo::for_optimization(id, "f");
        insert(&mut table, &info, &CompiledArtifact::Optimized(optimized()));
        assert!(lookup(&mut table, id, Some(OsrTarget(4))).is_none());
        // The normal entry is still served
        assert!(lookup(&mut table, id, None).is_some());
    }

    #[test]
    fn test_osr_insert_never_populates_slot() {
        let (mut table, id) = setup();
        let mut info = CompilationInfo::for_optimization(id, "f");
        info.osr_target = Some(OsrTarget(4));
        insert(&mut table, &info, &CompiledArtifact::Optimized(optimized()));
        assert!(table.get(id).profile.optimized_code().is_none());
    }

    #[test]
    fn test_specialized_insert_clears_existing_entry() {
        let (mut table, id) = setup();
        let info = CompilationInfo::for_optimization(id, "f");
        insert(&mut table, &info, &CompiledArtifact::Optimized(optimized()));
        assert!(table.get(id).profile.optimized_code().is_some());

        let mut specialized = CompilationInfo::for_optimization(id, "f");
        specialized.context_specialized = true;
        insert(
            &mut table,
            &specialized,
            &CompiledArtifact::Optimized(optimized()),
        );
        assert!(table.get(id).profile.optimized_code().is_none());
    }

    #[test]
    fn test_baseline_artifact_is_ignored() {
        use crate::code::{BaselineCode, BytecodeChunk};
        let (mut table, id) = setup();
        let info = CompilationInfo::new(id, "f");
        let artifact = CompiledArtifact::Baseline(BaselineCode::Bytecode(Arc::new(
            BytecodeChunk::new(0),
        )));
        insert(&mut table, &info, &artifact);
        assert!(table.get(id).profile.optimized_code().is_none());
    }

    #[test]
    fn test_deopt_marked_entry_is_evicted_on_lookup() {
        let (mut table, id) = setup();
        let info = CompilationInfo::for_optimization(id, "f");
        let code = optimized();
        insert(&mut table, &info, &CompiledArtifact::Optimized(Arc::clone(&code)));
        code.mark_for_deoptimization();
        assert!(lookup(&mut table, id, None).is_none());
        // Evicted, not just skipped
        assert!(table.get(id).profile.optimized_code().is_none());
    }

    #[test]
    fn test_clear_resets_profiler_ticks() {
        let (mut table, id) = setup();
        let info = CompilationInfo::for_optimization(id, "f");
        insert(&mut table, &info, &CompiledArtifact::Optimized(optimized()));
        table.get_mut(id).profile.tick();
        table.get_mut(id).profile.tick();
        clear(&mut table, id);
        assert_eq!(table.get(id).profile.profiler_ticks, 0);
        assert!(table.get(id).profile.optimized_code().is_none());
    }
}
