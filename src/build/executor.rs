//! The execute engine: recipe execution, state propagation, ordering.
//!
//! `execute` returns the cached state if the target already executed in
//! this batch, waits if another thread is executing it, and otherwise
//! claims the `matched -> executing` transition and runs the recipe. A
//! recipe is invoked at most once per target per action; internal errors
//! become a `failed` state write and a diagnostic, never a propagated
//! panic or error across the scheduler boundary.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::SystemTime;

use anyhow::{bail, Result};

use crate::core::action::{Action, ExecutionMode};
use crate::core::rule::Recipe;
use crate::core::target::{ExecClaim, Target, TargetId, TargetState};
use crate::engine::Engine;
use crate::phase::{PhaseLock, PhaseUnlock, RunPhase};
use crate::sched::{TaskCount, WorkQueue};
use crate::util::diagnostic::Diagnostic;

/// Execute a matched target for the action, returning its state.
pub fn execute(e: &Arc<Engine>, a: Action, id: TargetId) -> TargetState {
    let t = e.targets.get(id);

    loop {
        match t.try_claim_execute() {
            ExecClaim::Won => {
                let recipe = t.recipe().unwrap_or(Recipe::Noop);
                let ts = run_recipe(e, a, &t, recipe);
                t.finish_execute(ts);
                e.target_count.fetch_add(1, Ordering::Relaxed);
                e.sched.resume(&t.task_count);
                return ts;
            }

            ExecClaim::Wait => {
                let _unlock = PhaseUnlock::new(&e.phase, &e.sched);
                if e.sched.wait(0, &t.task_count, WorkQueue::None).is_err() {
                    return TargetState::Failed;
                }
            }

            ExecClaim::Done(ts) => return ts,

            ExecClaim::NotMatched => {
                debug_assert!(false, "execute of unmatched target {}", t);
                Diagnostic::error(format!("{} executed without being matched", t)).emit();
                t.fail();
                e.sched.resume(&t.task_count);
                return TargetState::Failed;
            }
        }
    }
}

fn run_recipe(e: &Arc<Engine>, a: Action, t: &Arc<Target>, recipe: Recipe) -> TargetState {
    let result = match recipe {
        Recipe::Noop => Ok(TargetState::Unchanged),

        Recipe::Default => {
            // Forward to prerequisites, honoring the operation's
            // execution mode.
            match e.current().mode {
                ExecutionMode::First => execute_prerequisites_state(e, a, t),
                ExecutionMode::Last => Ok(reverse_execute_prerequisites(e, a, t)),
            }
        }

        Recipe::Group => match t.group() {
            Some(g) => Ok(execute(e, a, g)),
            None => Err(anyhow::anyhow!("group recipe for {} without a group", t)),
        },

        Recipe::Custom(f) => f(e, a, t.id),
    };

    match result {
        Ok(ts) => ts,
        Err(err) => {
            Diagnostic::error(format!("{:#}", err))
                .while_doing(format!("{} {}", e.verbs().doing, t))
                .emit();
            TargetState::Failed
        }
    }
}

/// Shared prerequisite execution: enqueue every prerequisite target,
/// wait, decrement the dependency accounting, and combine the states.
fn execute_prerequisites_inner(
    e: &Arc<Engine>,
    a: Action,
    t: &Arc<Target>,
) -> Result<(TargetState, Option<SystemTime>)> {
    let ids = t.prerequisite_targets();
    if ids.is_empty() {
        return Ok((TargetState::Unchanged, None));
    }

    let tc = TaskCount::new();
    for &id in &ids {
        let e2 = e.clone();
        e.sched.spawn(0, &tc, move || {
            let _pl = PhaseLock::new(&e2.phase, &e2.sched, RunPhase::Execute);
            execute(&e2, a, id);
        })?;
    }

    {
        let _unlock = PhaseUnlock::new(&e.phase, &e.sched);
        e.sched.wait(0, &tc, WorkQueue::All)?;
    }

    let mut combined = TargetState::Unchanged;
    let mut newest: Option<SystemTime> = None;

    for &id in &ids {
        let p = e.targets.get(id);

        e.dependency_count.fetch_sub(1, Ordering::Relaxed);
        p.dependents.fetch_sub(1, Ordering::Relaxed);

        let ts = p.executed_state().unwrap_or(TargetState::Failed);
        combined |= ts;

        if let Ok(Some(m)) = p.mtime() {
            newest = Some(newest.map_or(m, |n| n.max(m)));
        }
    }

    Ok((combined, newest))
}

/// Execute prerequisites for a `first`-mode recipe and decide whether the
/// target is out of date: returns the most recent prerequisite mtime, or
/// None if the target (with the given mtime) is already up to date.
pub fn execute_prerequisites(
    e: &Arc<Engine>,
    a: Action,
    t: &Arc<Target>,
    target_mtime: Option<SystemTime>,
) -> Result<Option<SystemTime>> {
    let (combined, newest) = execute_prerequisites_inner(e, a, t)?;

    if combined == TargetState::Failed {
        bail!("failed to {} prerequisites of {}", e.verbs().do_, t);
    }

    let out_of_date = match target_mtime {
        None => true,
        Some(tm) => {
            combined >= TargetState::Changed || newest.is_some_and(|n| n > tm)
        }
    };

    if out_of_date {
        Ok(Some(newest.unwrap_or(SystemTime::UNIX_EPOCH)))
    } else {
        Ok(None)
    }
}

/// Combine prerequisite states for a forwarding (default) recipe.
pub fn execute_prerequisites_state(
    e: &Arc<Engine>,
    a: Action,
    t: &Arc<Target>,
) -> Result<TargetState> {
    let (combined, _) = execute_prerequisites_inner(e, a, t)?;
    Ok(combined)
}

/// Execute prerequisites in reverse declaration order, serially, after
/// the target itself (`last` mode): the start of each prerequisite's
/// execution happens after the end of the next one's. "Reverse" applies
/// only to prerequisite ordering, not target-graph traversal.
pub fn reverse_execute_prerequisites(e: &Arc<Engine>, a: Action, t: &Arc<Target>) -> TargetState {
    let ids = t.prerequisite_targets();
    let mut combined = TargetState::Unchanged;

    for &id in ids.iter().rev() {
        let p = e.targets.get(id);
        e.dependency_count.fetch_sub(1, Ordering::Relaxed);
        p.dependents.fetch_sub(1, Ordering::Relaxed);
        combined |= execute(e, a, id);
    }

    combined
}

/// Execute a set of root targets through the scheduler and combine their
/// states (the driver's entry point for the execute phase).
pub fn execute_roots(e: &Arc<Engine>, a: Action, ids: &[TargetId]) -> Result<TargetState> {
    let tc = TaskCount::new();

    for &id in ids {
        let e2 = e.clone();
        e.sched.spawn(0, &tc, move || {
            let _pl = PhaseLock::new(&e2.phase, &e2.sched, RunPhase::Execute);
            execute(&e2, a, id);
        })?;

        if !e.keep_going {
            // Serialize roots so the first failure stops scheduling new
            // ones.
            let _unlock = PhaseUnlock::new(&e.phase, &e.sched);
            e.sched.wait(0, &tc, WorkQueue::All)?;
            let t = e.targets.get(id);
            if t.executed_state() == Some(TargetState::Failed) {
                return Ok(TargetState::Failed);
            }
        }
    }

    {
        let _unlock = PhaseUnlock::new(&e.phase, &e.sched);
        e.sched.wait(0, &tc, WorkQueue::All)?;
    }

    let mut combined = TargetState::Unchanged;
    for &id in ids {
        combined |= e.targets.get(id).executed_state().unwrap_or(TargetState::Failed);
    }
    Ok(combined)
}
