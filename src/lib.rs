#![doc(html_no_source)]
#![deny(missing_docs)]

//! # cilstrip
//!
//! A protection-removal engine for managed bytecode modules. `cilstrip`
//! takes an in-memory [`Module`] that an obfuscator has worked over and runs
//! a catalog of transformation passes against it: anti-tooling probe spans,
//! watermark literals, flattened control flow, proxy indirection, string and
//! resource encryption, stack noise, metadata vandalism, junk code and full
//! code virtualization are each detected and undone by a dedicated pass.
//!
//! ## Quick Start
//!
//! ```rust
//! use cilstrip::{EngineConfig, Module, NullLogger, ProtectionEngine};
//!
//! let mut engine = ProtectionEngine::new(EngineConfig::default());
//! let mut module = Module::new("sample.exe");
//!
//! let summary = engine.process(&mut module, &NullLogger)?;
//! println!("{}", summary.summary());
//! # Ok::<(), cilstrip::Error>(())
//! ```
//!
//! ## Architecture
//!
//! - [`model`] - Token-identified module tree and arena-backed method bodies
//! - [`passes`] - The pass catalog and the [`passes::ProtectionPass`] trait
//! - [`vm`] - Virtualization detection and removal
//! - [`flow`] / [`integrity`] - Control-flow utilities and reference repair
//! - [`ProtectionEngine`] - Orchestration: ordering, isolation, finalization
//! - [`EventLog`] - Structured record of every transformation in a run
//!
//! Passes never abort a run: a failing pass is logged, counted and skipped
//! while the remaining passes continue. After the last pass the engine
//! repairs reference integrity module-wide and performs a final branch
//! cleanup, so the module that comes back is always structurally consistent.
//!
//! ## Selecting Passes
//!
//! [`EngineConfig`] carries a [`ProtectionFlags`] bitset selecting which
//! passes run, plus every heuristic threshold the detectors consult.
//! [`EngineConfig::minimal`] and [`EngineConfig::aggressive`] are the two
//! built-in presets next to the default standard set.
//!
//! ```rust
//! use cilstrip::{EngineConfig, ProtectionFlags};
//!
//! let config = EngineConfig::default()
//!     .with_passes(ProtectionFlags::ANTI | ProtectionFlags::WATERMARKS);
//! assert!(config.validate().is_ok());
//! ```

#[macro_use]
mod error;

pub mod config;
pub mod engine;
pub mod events;
pub mod flow;
pub mod integrity;
pub mod logger;
pub mod model;
pub mod passes;
pub mod vm;

#[cfg(test)]
pub(crate) mod test;

pub use config::{EngineConfig, ProtectionFlags, VmThresholds};
pub use engine::{EngineState, PassOutcome, PassStatus, ProtectionEngine, RunSummary};
pub use error::Error;
pub use events::{DerivedStats, Event, EventKind, EventLog};
pub use logger::{EventLogger, Logger, NullLogger};
pub use model::{
    Body, FieldDef, InstrId, Instruction, MethodDef, Module, Opcode, Operand, Resource, Token,
    TypeDef,
};
pub use passes::{PassContext, PassKind, ProtectionPass, RunCaches};

/// Convenience alias for operations that can fail with [`enum@Error`].
pub type Result<T> = std::result::Result<T, Error>;
