//! The match engine: rule selection and prerequisite resolution, per
//! target per action.
//!
//! Matching the same target from multiple threads is resolved by the
//! target's state machine: the first thread transitions it from unknown to
//! matching and the rest park on its task count. Per target per action,
//! `matches` is invoked at most once across all threads.

use std::cell::RefCell;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, bail, Result};

use crate::core::action::Action;
use crate::core::prerequisite::Prerequisite;
use crate::core::target::{MatchClaim, Target, TargetId, TargetKey, TargetState};
use crate::engine::Engine;
use crate::phase::{PhaseLock, PhaseUnlock, RunPhase};
use crate::sched::{TaskCount, WorkQueue};
use crate::util::diagnostic::Diagnostic;
use crate::util::Symbol;

thread_local! {
    /// Targets this thread is currently matching, for cycle detection.
    static IN_PROGRESS: RefCell<Vec<TargetId>> = const { RefCell::new(Vec::new()) };
}

/// Ensure a target is matched (or terminally failed) for the action.
///
/// Rule and prerequisite failures fail the target and emit diagnostics;
/// the error return is reserved for a cycle reaching back into this
/// thread's own in-progress chain (the caller's target is the one at
/// fault) and for scheduler cancellation.
pub fn match_target(e: &Arc<Engine>, a: Action, id: TargetId) -> Result<()> {
    let t = e.targets.get(id);

    loop {
        match t.try_claim_match(a) {
            MatchClaim::Won => {
                IN_PROGRESS.with(|s| s.borrow_mut().push(id));
                let result = do_match(e, a, &t);
                IN_PROGRESS.with(|s| {
                    s.borrow_mut().pop();
                });

                match result {
                    Ok(recipe) => {
                        t.finish_match(recipe);
                    }
                    Err(err) => {
                        Diagnostic::error(format!("{:#}", err))
                            .while_doing(format!("{} {}", e.verbs().doing, t))
                            .emit();
                        t.fail();
                    }
                }
                e.sched.resume(&t.task_count);
                return Ok(());
            }

            MatchClaim::Wait => {
                let ours = IN_PROGRESS.with(|s| s.borrow().contains(&id));
                if ours {
                    bail!("dependency cycle detected involving {}", t);
                }

                // Park at a safe point: release our phase lock so a
                // pending exclusive load or execute switch can drain.
                let _unlock = PhaseUnlock::new(&e.phase, &e.sched);
                e.sched.wait(0, &t.task_count, WorkQueue::None)?;
            }

            MatchClaim::Done => return Ok(()),
        }
    }
}

/// Rule search and apply for a target whose matching claim we won.
fn do_match(e: &Arc<Engine>, a: Action, t: &Arc<Target>) -> Result<crate::core::rule::Recipe> {
    let scope = e.scopes.scope_of(&t.key.out_dir);

    // Rules registered for a base type apply to types derived from it.
    let mut type_chain = vec![t.key.ty];
    {
        let mut cur = t.key.ty;
        while let Some(tt) = e.scopes.find_target_type(scope.id, &cur) {
            match tt.base {
                Some(base) => {
                    type_chain.push(base);
                    cur = base;
                }
                None => break,
            }
        }
    }

    // Walk the scope chain, most specific first; registration order
    // breaks ties within a scope.
    let mut cur = Some(scope.id);
    while let Some(sid) = cur {
        let s = e.scopes.get(sid);

        for &ty in &type_chain {
            let candidates = s.rules().read().unwrap().lookup(a.operation, ty);

            for candidate in candidates {
                let outcome = candidate.rule.matches(e, a, t, &candidate.hint)?;
                if outcome.is_match() {
                    tracing::trace!(rule = candidate.rule.name(), "matched {}", t);
                    return candidate.rule.apply(e, a, t, &outcome);
                }
            }
        }

        cur = s.parent.or(if sid == crate::core::scope::GLOBAL_SCOPE {
            None
        } else {
            Some(crate::core::scope::GLOBAL_SCOPE)
        });
    }

    bail!("no rule to {} {}", e.verbs().do_, t)
}

/// Resolve a prerequisite to a concrete target.
///
/// Search policy: look in the out tree, then the src tree; qualified
/// references go through import.
pub fn search(e: &Engine, t: &Target, p: &Prerequisite) -> Result<TargetId> {
    if let Some(project) = p.project {
        return search_import(e, project, p);
    }

    let out_dir = if p.dir.is_absolute() {
        p.dir.clone()
    } else {
        t.key.out_dir.join(&p.dir)
    };

    let mut key = TargetKey::new(p.ty, out_dir, p.name);
    if let Some(ext) = p.ext {
        key = key.with_ext(ext);
    }

    let (target, _) = e.targets.insert(key, e.load_generation());
    Ok(target.id)
}

/// Resolve a project-qualified prerequisite against a known project root.
fn search_import(e: &Engine, project: Symbol, p: &Prerequisite) -> Result<TargetId> {
    for scope in e
        .scopes
        .global()
        .subprojects()
        .iter()
        .filter_map(|dir| e.scopes.find_exact(dir))
    {
        if scope.project() == Some(project) {
            let out_dir = scope.out_path.join(&p.dir);
            let mut key = TargetKey::new(p.ty, out_dir, p.name);
            if let Some(ext) = p.ext {
                key = key.with_ext(ext);
            }
            let (target, _) = e.targets.insert(key, e.load_generation());
            return Ok(target.id);
        }
    }

    // Fall back to any registered root scope with that project name.
    for s in (0..e.scopes.len() as u32).map(|i| e.scopes.get(crate::core::scope::ScopeId(i))) {
        if s.is_project_root() && s.project() == Some(project) {
            let out_dir = s.out_path.join(&p.dir);
            let mut key = TargetKey::new(p.ty, out_dir, p.name);
            if let Some(ext) = p.ext {
                key = key.with_ext(ext);
            }
            let (target, _) = e.targets.insert(key, e.load_generation());
            return Ok(target.id);
        }
    }

    Err(anyhow!("unable to import target {}", p))
}

/// Search all declared prerequisites and match them in parallel,
/// populating the target's per-action prerequisite list. Duplicate edges
/// collapse here.
pub fn search_and_match_prerequisites(
    e: &Arc<Engine>,
    a: Action,
    t: &Arc<Target>,
) -> Result<()> {
    let mut ids = Vec::new();
    let mut seen = HashSet::new();
    for p in t.prerequisites() {
        let id = search(e, t, &p)?;
        if seen.insert(id) {
            ids.push(id);
        }
    }

    match_in_parallel(e, a, &ids)?;

    for &id in &ids {
        e.dependency_count.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        e.targets.get(id).dependents.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        t.push_prerequisite_target(id);
    }

    // Matching failures surface on the dependent as prerequisite
    // failures.
    let failed: Vec<String> = ids
        .iter()
        .map(|&id| e.targets.get(id))
        .filter(|p| p.executed_state() == Some(TargetState::Failed))
        .map(|p| p.to_string())
        .collect();
    if !failed.is_empty() {
        bail!("failed to match {}", failed.join(", "));
    }

    Ok(())
}

/// Match a set of targets through the scheduler, waiting for completion.
pub fn match_in_parallel(e: &Arc<Engine>, a: Action, ids: &[TargetId]) -> Result<()> {
    let tc = TaskCount::new();

    for &id in ids {
        let e2 = e.clone();
        e.sched.spawn(0, &tc, move || {
            let _pl = PhaseLock::new(&e2.phase, &e2.sched, RunPhase::Match);
            if let Err(err) = match_target(&e2, a, id) {
                let t = e2.targets.get(id);
                Diagnostic::error(format!("{:#}", err))
                    .while_doing(format!("{} {}", e2.verbs().doing, t))
                    .emit();
                t.fail();
                e2.sched.resume(&t.task_count);
            }
        })?;
    }

    let _unlock = PhaseUnlock::new(&e.phase, &e.sched);
    e.sched.wait(0, &tc, WorkQueue::All)?;
    Ok(())
}

/// Inject a synthetic dependency on the target's output directory so it
/// gets created before the target and cleaned after it.
pub fn inject_parent_dir(e: &Arc<Engine>, a: Action, t: &Arc<Target>) -> Result<()> {
    let scope = e.scopes.scope_of(&t.key.out_dir);
    let Some(root) = e.scopes.root_of(scope.id) else {
        return Ok(());
    };
    if t.key.out_dir == root.out_path || scope.out_eq_src() {
        return Ok(());
    }

    let key = TargetKey::new(Symbol::new("fsdir"), t.key.out_dir.clone(), Symbol::empty());
    let (dir, _) = e.targets.insert(key, e.load_generation());

    match_target(e, a, dir.id)?;

    e.dependency_count.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
    dir.dependents.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
    t.push_prerequisite_target(dir.id);
    Ok(())
}

/// Resolve a group's members by matching the group. The group's matching
/// rule assigns the members; re-resolution returns the same set.
pub fn resolve_group_members(e: &Arc<Engine>, a: Action, group: TargetId) -> Result<()> {
    match_target(e, a, group)
}

/// Build a target in the middle of matching another one (e.g. a generated
/// header the matcher needs to inspect). The sole legitimate match/execute
/// interleaving: the thread briefly becomes an execute-phase thread.
pub fn update_during_match(e: &Arc<Engine>, a: Action, id: TargetId) -> Result<TargetState> {
    match_target(e, a, id)?;

    let t = e.targets.get(id);
    if t.executed_state() == Some(TargetState::Failed) {
        bail!("failed to match {}", t);
    }

    let state = {
        let _switch = e.phase_switch(RunPhase::Execute);
        crate::build::executor::execute(e, a, id)
    };

    if state == TargetState::Failed {
        bail!("failed to {} {}", e.verbs().do_, t);
    }
    Ok(state)
}

/// Derive the output path of a file target from its identity and the
/// registered default extension, and fix it on the target.
pub fn derive_path(e: &Engine, t: &Arc<Target>, default_ext: Option<&str>) -> PathBuf {
    if let Some(p) = t.path() {
        return p;
    }

    let ext = t
        .key
        .ext
        .map(|s| s.to_string())
        .or_else(|| default_ext.map(|s| s.to_string()))
        .or_else(|| {
            let scope = e.scopes.scope_of(&t.key.out_dir);
            e.scopes
                .find_target_type(scope.id, &t.key.ty)
                .and_then(|tt| tt.default_ext)
                .map(|s| s.to_string())
        });

    let file = match ext {
        Some(ref ext) if !ext.is_empty() => format!("{}.{}", t.key.name, ext),
        _ => t.key.name.to_string(),
    };

    let path = t.key.out_dir.join(file);
    t.set_path(path.clone());
    path
}

/// Map an out-tree directory to its src-tree counterpart.
pub fn src_out(e: &Engine, out_dir: &std::path::Path) -> Option<PathBuf> {
    let scope = e.scopes.scope_of(out_dir);
    let root = e.scopes.root_of(scope.id)?;
    if root.out_eq_src() {
        return None;
    }
    let rel = out_dir.strip_prefix(&root.out_path).ok()?;
    Some(root.src_path().join(rel))
}

/// Find an existing file for a source target: the out tree first, then
/// the src tree. Fixes the target's path on success.
pub fn search_existing_file(e: &Engine, t: &Arc<Target>, default_ext: Option<&str>) -> Option<PathBuf> {
    if let Some(p) = t.path() {
        return crate::util::fs::exists(&p).then_some(p);
    }

    let ext = t
        .key
        .ext
        .map(|s| s.to_string())
        .or_else(|| default_ext.map(|s| s.to_string()))
        .or_else(|| {
            let scope = e.scopes.scope_of(&t.key.out_dir);
            e.scopes
                .find_target_type(scope.id, &t.key.ty)
                .and_then(|tt| tt.default_ext)
                .map(|s| s.to_string())
        });
    let file = match ext {
        Some(ref ext) if !ext.is_empty() => format!("{}.{}", t.key.name, ext),
        _ => t.key.name.to_string(),
    };

    let out = t.key.out_dir.join(&file);
    if crate::util::fs::exists(&out) {
        t.set_path(out.clone());
        return Some(out);
    }

    if let Some(src_dir) = src_out(e, &t.key.out_dir) {
        let src = src_dir.join(&file);
        if crate::util::fs::exists(&src) {
            t.set_path(src.clone());
            return Some(src);
        }
    }

    None
}
