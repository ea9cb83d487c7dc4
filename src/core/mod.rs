//! The build model: scopes, variables, targets, prerequisites, rules,
//! actions, and the declaration stream that populates them.

pub mod action;
pub mod decl;
pub mod prerequisite;
pub mod rule;
pub mod scope;
pub mod target;
pub mod variable;

pub use action::{Action, ExecutionMode, MetaOperationId, OperationId};
pub use prerequisite::Prerequisite;
pub use rule::{MatchOutcome, Recipe, Rule};
pub use scope::{Scope, ScopeId, ScopeMap, GLOBAL_SCOPE};
pub use target::{Target, TargetId, TargetKey, TargetKind, TargetSet, TargetState, TargetType};
pub use variable::{Name, Value, ValueType, VarPool, Variable, VariableMap, VariableOverride};
