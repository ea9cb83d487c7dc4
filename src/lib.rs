//! Slipway - a phase-governed, modular build system.
//!
//! This crate provides the core build engine: the bounded-parallel task
//! scheduler, the tri-state phase mutex, the scope/target/variable model,
//! the rule match/apply/execute pipeline, and the meta-operation dispatch
//! that drives them.

pub mod build;
pub mod core;
pub mod engine;
pub mod module;
pub mod ops;
pub mod phase;
pub mod sched;
pub mod util;

pub use crate::core::{Action, Recipe, Rule, Target, TargetId, TargetState};
pub use crate::engine::{Engine, EngineConfig};
pub use crate::phase::{PhaseLock, PhaseMutex, PhaseSwitch, RunPhase};
pub use crate::sched::{Scheduler, TaskCount, WorkQueue};
