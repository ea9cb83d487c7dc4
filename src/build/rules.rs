//! Builtin rules: aliases, output directories, and existing files.

use std::sync::Arc;

use anyhow::Result;

use crate::build::{executor, matcher};
use crate::core::action::Action;
use crate::core::rule::{MatchOutcome, Recipe, Rule};
use crate::core::target::{Target, TargetKind, TargetState, TargetType};
use crate::engine::Engine;
use crate::ops::{OP_CLEAN, OP_DEFAULT};
use crate::util::diagnostic::text;
use crate::util::fs::{self, RmdirStatus};
use crate::util::Symbol;

/// Matches alias targets (`all`, the directory alias): no filesystem
/// presence, forwards to prerequisites.
pub struct AliasRule;

impl Rule for AliasRule {
    fn name(&self) -> &'static str {
        "alias"
    }

    fn matches(&self, _: &Engine, _: Action, _: &Arc<Target>, _: &str) -> Result<MatchOutcome> {
        Ok(MatchOutcome::Match)
    }

    fn apply(
        &self,
        e: &Engine,
        a: Action,
        t: &Arc<Target>,
        _: &MatchOutcome,
    ) -> Result<Recipe> {
        let e = engine_arc(e);
        matcher::search_and_match_prerequisites(&e, a, t)?;
        Ok(Recipe::Default)
    }
}

/// Matches `fsdir{}` targets: creates the directory on update, removes it
/// (when empty) on clean.
pub struct FsdirRule;

impl Rule for FsdirRule {
    fn name(&self) -> &'static str {
        "fsdir"
    }

    fn matches(&self, _: &Engine, _: Action, _: &Arc<Target>, _: &str) -> Result<MatchOutcome> {
        Ok(MatchOutcome::Match)
    }

    fn apply(
        &self,
        e: &Engine,
        a: Action,
        t: &Arc<Target>,
        _: &MatchOutcome,
    ) -> Result<Recipe> {
        let e = engine_arc(e);
        matcher::search_and_match_prerequisites(&e, a, t)?;

        if a.operation == OP_CLEAN {
            return Ok(Recipe::custom(perform_clean_dir));
        }
        Ok(Recipe::custom(perform_mkdir))
    }
}

fn perform_mkdir(e: &Engine, a: Action, id: crate::core::target::TargetId) -> Result<TargetState> {
    let e = engine_arc(e);
    let t = e.targets.get(id);
    let dir = t.key.out_dir.clone();

    let mut ts = executor::execute_prerequisites_state(&e, a, &t)?;

    if fs::exists(&dir) {
        return Ok(ts);
    }

    text(1, format!("mkdir {}", dir.display()));
    if !e.dry_run {
        fs::mkdir(&dir)?;
    }
    ts |= TargetState::Changed;
    Ok(ts)
}

fn perform_clean_dir(
    e: &Engine,
    a: Action,
    id: crate::core::target::TargetId,
) -> Result<TargetState> {
    let e = engine_arc(e);
    let t = e.targets.get(id);
    let dir = t.key.out_dir.clone();

    // The directory goes before its (reverse-ordered) prerequisites.
    let mut ts = TargetState::Unchanged;

    if fs::exists(&dir) && !e.dry_run {
        match fs::rmdir(&dir)? {
            RmdirStatus::Removed => {
                text(1, format!("rmdir {}", dir.display()));
                ts = TargetState::Changed;
            }
            RmdirStatus::NotEmpty | RmdirStatus::NotFound => {}
        }
    }

    ts |= executor::reverse_execute_prerequisites(&e, a, &t);
    Ok(ts)
}

/// Matches file targets that exist on disk (out tree first, then src
/// tree): sources are trivially in their desired state.
pub struct FileRule;

impl Rule for FileRule {
    fn name(&self) -> &'static str {
        "file"
    }

    fn matches(&self, e: &Engine, _: Action, t: &Arc<Target>, _: &str) -> Result<MatchOutcome> {
        Ok(match matcher::search_existing_file(e, t, None) {
            Some(_) => MatchOutcome::Match,
            None => MatchOutcome::None,
        })
    }

    fn apply(&self, _: &Engine, _: Action, _: &Arc<Target>, _: &MatchOutcome) -> Result<Recipe> {
        Ok(Recipe::Noop)
    }
}

/// The engine is shared behind an Arc by the driver; recover it for task
/// spawning inside rule bodies.
fn engine_arc(e: &Engine) -> Arc<Engine> {
    e.shared()
}

/// Register the builtin target types and rules in the global scope.
pub fn register_builtins(e: &Engine) {
    let global = e.scopes.global();

    global.register_target_type(TargetType::new("file", TargetKind::File));
    global.register_target_type(TargetType::new("dir", TargetKind::Alias));
    global.register_target_type(TargetType::new("alias", TargetKind::Alias));
    global.register_target_type(TargetType::new("fsdir", TargetKind::Dir));

    let mut rules = global.rules().write().unwrap();
    rules.insert(OP_DEFAULT, Symbol::new("alias"), "build.alias", Arc::new(AliasRule));
    rules.insert(OP_DEFAULT, Symbol::new("dir"), "build.alias", Arc::new(AliasRule));
    rules.insert(OP_DEFAULT, Symbol::new("fsdir"), "build.fsdir", Arc::new(FsdirRule));
    rules.insert(OP_DEFAULT, Symbol::new("file"), "build.file", Arc::new(FileRule));
}
