//! Rules and recipes.
//!
//! A rule is a polymorphic handler registered per target type per operation.
//! Matching is non-destructive: `matches` only tests whether the rule can
//! handle the target now (possibly steering via a prerequisite or group).
//! `apply` is destructive: it resolves prerequisites, fixes member and
//! extension fields, injects synthetic dependencies, and produces the
//! recipe to be executed later.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use anyhow::Result;

use crate::core::action::{Action, OperationId, DEFAULT_ID};
use crate::core::target::{Target, TargetId, TargetState};
use crate::engine::Engine;
use crate::util::Symbol;

/// The result of a non-destructive match test.
#[derive(Debug, Clone, Default)]
pub enum MatchOutcome {
    /// The rule does not handle this target.
    #[default]
    None,
    /// The rule handles this target.
    Match,
    /// The rule handles this target; the referenced target (a prerequisite
    /// or a group) steered the decision and is passed back to `apply`.
    MatchWith(TargetId),
}

impl MatchOutcome {
    pub fn is_match(&self) -> bool {
        !matches!(self, MatchOutcome::None)
    }
}

/// A rule: match/apply capability pair.
pub trait Rule: Send + Sync {
    /// Rule name for diagnostics.
    fn name(&self) -> &'static str;

    /// Non-destructive test whether this rule can handle this target for
    /// this action now.
    fn matches(
        &self,
        engine: &Engine,
        action: Action,
        target: &Arc<Target>,
        hint: &str,
    ) -> Result<MatchOutcome>;

    /// Resolve prerequisites and produce the recipe. Only called with the
    /// outcome a prior `matches` returned.
    fn apply(
        &self,
        engine: &Engine,
        action: Action,
        target: &Arc<Target>,
        outcome: &MatchOutcome,
    ) -> Result<Recipe>;
}

/// The callable produced by `apply`, executed once per target per action.
#[derive(Clone)]
pub enum Recipe {
    /// Do nothing; the target is trivially in its desired state.
    Noop,
    /// Forward to prerequisites (execute them, combine their states).
    Default,
    /// Execute the group's recipe; this target is a member.
    Group,
    /// A bespoke recipe.
    Custom(Arc<RecipeFn>),
}

/// A recipe body returns the resulting target state; internal errors must
/// be converted into a `Failed` state write by the execute engine, never
/// propagated across the scheduler boundary.
pub type RecipeFn = dyn Fn(&Engine, Action, TargetId) -> Result<TargetState> + Send + Sync;

impl Recipe {
    pub fn custom<F>(f: F) -> Self
    where
        F: Fn(&Engine, Action, TargetId) -> Result<TargetState> + Send + Sync + 'static,
    {
        Recipe::Custom(Arc::new(f))
    }
}

impl fmt::Debug for Recipe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Recipe::Noop => f.write_str("Recipe::Noop"),
            Recipe::Default => f.write_str("Recipe::Default"),
            Recipe::Group => f.write_str("Recipe::Group"),
            Recipe::Custom(_) => f.write_str("Recipe::Custom(..)"),
        }
    }
}

/// A rule registration: a priority/hint string plus the rule.
#[derive(Clone)]
pub struct RegisteredRule {
    pub hint: String,
    pub rule: Arc<dyn Rule>,
}

/// Per-scope rule registry, keyed by operation and target type.
///
/// Registration order within a key is preserved and breaks ties. The
/// wildcard type `*` and the default operation id act as fallbacks.
#[derive(Default)]
pub struct RuleMap {
    map: HashMap<(OperationId, Symbol), Vec<RegisteredRule>>,
}

impl RuleMap {
    pub fn new() -> Self {
        RuleMap::default()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Register a rule for an operation and target type (`*` for any).
    pub fn insert(
        &mut self,
        operation: OperationId,
        ty: Symbol,
        hint: impl Into<String>,
        rule: Arc<dyn Rule>,
    ) {
        self.map
            .entry((operation, ty))
            .or_default()
            .push(RegisteredRule { hint: hint.into(), rule });
    }

    /// Rules for this (operation, type), most specific key first:
    /// exact, then wildcard type, then the default-operation fallbacks.
    pub fn lookup(&self, operation: OperationId, ty: Symbol) -> Vec<RegisteredRule> {
        let wildcard = Symbol::new("*");
        let mut out = Vec::new();

        for key in [
            (operation, ty),
            (operation, wildcard),
            (OperationId(DEFAULT_ID), ty),
            (OperationId(DEFAULT_ID), wildcard),
        ] {
            if let Some(rules) = self.map.get(&key) {
                out.extend(rules.iter().cloned());
            }
        }

        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NullRule;

    impl Rule for NullRule {
        fn name(&self) -> &'static str {
            "null"
        }

        fn matches(
            &self,
            _: &Engine,
            _: Action,
            _: &Arc<Target>,
            _: &str,
        ) -> Result<MatchOutcome> {
            Ok(MatchOutcome::None)
        }

        fn apply(
            &self,
            _: &Engine,
            _: Action,
            _: &Arc<Target>,
            _: &MatchOutcome,
        ) -> Result<Recipe> {
            Ok(Recipe::Noop)
        }
    }

    #[test]
    fn test_lookup_order() {
        let update = OperationId(1);
        let file = Symbol::new("file");

        let mut rules = RuleMap::new();
        rules.insert(update, Symbol::new("*"), "fallback", Arc::new(NullRule));
        rules.insert(update, file, "exact", Arc::new(NullRule));
        rules.insert(OperationId(DEFAULT_ID), file, "default-op", Arc::new(NullRule));

        let found = rules.lookup(update, file);
        let hints: Vec<&str> = found.iter().map(|r| r.hint.as_str()).collect();
        assert_eq!(hints, ["exact", "fallback", "default-op"]);
    }

    #[test]
    fn test_registration_order_preserved() {
        let op = OperationId(2);
        let ty = Symbol::new("gen");

        let mut rules = RuleMap::new();
        rules.insert(op, ty, "first", Arc::new(NullRule));
        rules.insert(op, ty, "second", Arc::new(NullRule));

        let found = rules.lookup(op, ty);
        assert_eq!(found[0].hint, "first");
        assert_eq!(found[1].hint, "second");
    }

    #[test]
    fn test_match_outcome_truthiness() {
        assert!(!MatchOutcome::None.is_match());
        assert!(MatchOutcome::Match.is_match());
        assert!(MatchOutcome::MatchWith(TargetId(3)).is_match());
    }
}
