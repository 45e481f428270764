//! Tiercel: a tiered function compiler written in Rust
//!
//! Tiercel is the orchestration layer of a multi-tier function compiler:
//! given a function and its script context it decides which compilation tier
//! to run, drives that tier through a uniform three-phase job lifecycle,
//! hands optimizing work to a background thread when concurrent compilation
//! is requested, and maintains a per-function cache of optimized code with
//! speculative-invalidation support.
//!
//! # Quick Start
//!
//! ```no_run
//! use tiercel::{Compiler, CompilerConfig, ConcurrencyMode};
//! use std::sync::Arc;
//!
//! fn main() -> tiercel::Result<()> {
//!     let mut compiler = Compiler::new(CompilerConfig::default())?;
//!     let script = compiler.register_script("demo.fn");
//!     let literal = Arc::new(tiercel::parse::parse_function("fn add(a, b) = a + b", 1, 0)?);
//!     let id = compiler.get_or_create_descriptor(&literal, script);
//!     let mut closure = compiler.instantiate(id);
//!     compiler.compile_baseline(&mut closure)?;
//!     compiler.compile_optimized(&mut closure, ConcurrencyMode::Synchronous)?;
//!     println!("add(1, 2) = {}", closure.call(&[1.0, 2.0])?);
//!     Ok(())
//! }
//! ```
//!
//! # Module Overview
//!
//! A compile request flows: [`parse`] → tier selection ([`tiers`]) →
//! [`job`] lifecycle (optionally via [`dispatch`]) → install on
//! [`descriptor`] + [`cache`].
//!
//! | Category | Modules |
//! |----------|---------|
//! | **Core** | [`compiler`], [`job`], [`tiers`], [`cache`] |
//! | **Data** | [`descriptor`], [`code`], [`parse`] |
//! | **Infrastructure** | [`dispatch`], [`heap`], [`config`], [`error`](Error) |

pub mod cache;
pub mod code;
pub mod compiler;
pub mod config;
pub mod descriptor;
pub mod dispatch;
pub mod heap;
pub mod job;
pub mod parse;
pub mod tiers;

mod error;

pub use compiler::{CompileStats, Compiler, ConcurrencyMode, OptimizeStatus};
pub use config::CompilerConfig;
pub use descriptor::{ClosureInstance, DescriptorId, ScriptId};
pub use error::{BailoutReason, Error, Result, SourceLocation};

/// Tiercel version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
