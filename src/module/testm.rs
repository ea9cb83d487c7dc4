//! The test module: rule registration for the `test` operation.
//!
//! A target with its `test` variable set to true gets executed as a test;
//! everything else forwards to its prerequisites so the traversal reaches
//! the testable leaves.

use std::process::Command;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};

use crate::build::matcher;
use crate::core::action::Action;
use crate::core::rule::{MatchOutcome, Recipe, Rule};
use crate::core::scope::Scope;
use crate::core::target::{Target, TargetId, TargetState};
use crate::engine::Engine;
use crate::module::{ConfigHints, Module};
use crate::ops::OP_TEST;
use crate::util::diagnostic::{text, verbosity, Location};
use crate::util::Symbol;

pub struct TestModule;

impl Module for TestModule {
    fn name(&self) -> &'static str {
        "test"
    }

    fn boot(&self, _engine: &Engine, _root: &Arc<Scope>, _loc: &Location) -> Result<()> {
        Ok(())
    }

    fn init(
        &self,
        _engine: &Engine,
        root: &Arc<Scope>,
        _base: &Arc<Scope>,
        _first: bool,
        _optional: bool,
        _hints: &ConfigHints,
    ) -> Result<bool> {
        root.rules().write().unwrap().insert(
            OP_TEST,
            Symbol::new("*"),
            "test",
            Arc::new(TestRule),
        );
        Ok(true)
    }
}

/// Runs targets marked `test = true`, forwards everything else.
pub struct TestRule;

impl Rule for TestRule {
    fn name(&self) -> &'static str {
        "test"
    }

    fn matches(&self, _: &Engine, a: Action, _: &Arc<Target>, _: &str) -> Result<MatchOutcome> {
        Ok(if a.operation == OP_TEST { MatchOutcome::Match } else { MatchOutcome::None })
    }

    fn apply(&self, e: &Engine, a: Action, t: &Arc<Target>, _: &MatchOutcome) -> Result<Recipe> {
        let shared = e.shared();
        matcher::search_and_match_prerequisites(&shared, a, t)?;

        let scope = e.scopes.scope_of(&t.key.out_dir);
        let testable = e
            .value_of(scope.id, Some(t.as_ref()), "test")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);

        if testable {
            Ok(Recipe::custom(perform_test))
        } else {
            Ok(Recipe::Default)
        }
    }
}

fn perform_test(e: &Engine, a: Action, id: TargetId) -> Result<TargetState> {
    let shared = e.shared();
    let t = e.targets.get(id);

    crate::build::executor::execute_prerequisites_state(&shared, a, &t)?;

    let path = t
        .path()
        .ok_or_else(|| anyhow!("no executable path for test {}", t))?;

    if verbosity() >= 2 {
        text(2, path.display().to_string());
    } else {
        text(1, format!("test {}", t));
    }

    if e.dry_run {
        return Ok(TargetState::Unchanged);
    }

    // The test inherits our stdio and runs in its own directory; the
    // child is part of this active task.
    let status = Command::new(&path)
        .current_dir(&t.key.out_dir)
        .status()
        .with_context(|| format!("unable to execute {}", path.display()))?;

    if !status.success() {
        return Err(anyhow!("test {} failed with exit code {:?}", t, status.code()));
    }

    Ok(TargetState::Unchanged)
}
