//! Meta-operation/operation dispatch.
//!
//! Given a parsed buildspec, the driver runs each meta-operation batch
//! through its hooks: `pre`, then per operation load -> match -> execute
//! under the respective phase locks, then the post hooks. Between
//! incompatible meta-operation batches the build state is reset.

pub mod buildspec;
pub mod configure;

use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};

use crate::build::{executor, matcher};
use crate::core::action::{Action, ExecutionMode, MetaOperationId, OperationId, OperationInfo};
use crate::core::scope::{Scope, ScopeId};
use crate::core::target::{TargetId, TargetKey, TargetState};
use crate::engine::Engine;
use crate::phase::RunPhase;
use crate::util::diagnostic::{ActionVerbs, Location};
use crate::util::fs;
use crate::util::Symbol;

use buildspec::{MetaOpSpec, TargetSpec};

// Operation ids.
pub const OP_DEFAULT: OperationId = OperationId(0);
pub const OP_UPDATE: OperationId = OperationId(1);
pub const OP_CLEAN: OperationId = OperationId(2);
pub const OP_TEST: OperationId = OperationId(3);
pub const OP_INSTALL: OperationId = OperationId(4);
pub const OP_UNINSTALL: OperationId = OperationId(5);

// Meta-operation ids.
pub const MID_PERFORM: MetaOperationId = MetaOperationId(1);
pub const MID_CONFIGURE: MetaOperationId = MetaOperationId(2);
pub const MID_DISFIGURE: MetaOperationId = MetaOperationId(3);
pub const MID_INFO: MetaOperationId = MetaOperationId(4);

/// The default operation (stands for "the operation the meta-operation
/// chooses", e.g. update for perform, everything for configure).
pub const DEFAULT_OPERATION: OperationInfo = OperationInfo::new(
    OP_DEFAULT,
    "default",
    ActionVerbs::new("do", "doing", "did", "is done"),
    ExecutionMode::First,
);

pub const UPDATE: OperationInfo = OperationInfo::new(
    OP_UPDATE,
    "update",
    ActionVerbs::new("update", "updating", "updated", "is up to date"),
    ExecutionMode::First,
);

pub const CLEAN: OperationInfo = OperationInfo::new(
    OP_CLEAN,
    "clean",
    ActionVerbs::new("clean", "cleaning", "cleaned", "is clean"),
    ExecutionMode::Last,
);

pub const TEST: OperationInfo = OperationInfo::new(
    OP_TEST,
    "test",
    ActionVerbs::new("test", "testing", "tested", "has passed"),
    ExecutionMode::First,
);

pub const INSTALL: OperationInfo = OperationInfo::new(
    OP_INSTALL,
    "install",
    ActionVerbs::new("install", "installing", "installed", "is installed"),
    ExecutionMode::First,
);

pub const UNINSTALL: OperationInfo = OperationInfo::new(
    OP_UNINSTALL,
    "uninstall",
    ActionVerbs::new("uninstall", "uninstalling", "uninstalled", "is uninstalled"),
    ExecutionMode::Last,
);

const OPERATIONS: &[OperationInfo] =
    &[DEFAULT_OPERATION, UPDATE, CLEAN, TEST, INSTALL, UNINSTALL];

pub fn find_operation(name: &str) -> Option<OperationInfo> {
    OPERATIONS.iter().copied().find(|o| o.name == name)
}

pub fn operation_info(id: OperationId) -> OperationInfo {
    OPERATIONS[id.0 as usize]
}

/// What an operation acts on: a target, or (for configure/disfigure) a
/// whole project.
#[derive(Debug, Clone, Copy)]
pub enum ActionTarget {
    Target(TargetId),
    Scope(ScopeId),
}

/// A meta-operation: the outermost verb selecting the kind of traversal.
pub trait MetaOperation: Send + Sync {
    fn id(&self) -> MetaOperationId;
    fn name(&self) -> &'static str;

    fn pre(&self, _e: &Arc<Engine>) -> Result<()> {
        Ok(())
    }

    /// Translate the default operation; perform turns it into update,
    /// configure and disfigure keep it (unspecified means "everything").
    fn operation_pre(&self, _e: &Arc<Engine>, o: OperationId) -> Result<OperationId> {
        Ok(if o == OP_DEFAULT { OP_UPDATE } else { o })
    }

    /// Whether project buildfiles are loaded.
    fn wants_load(&self) -> bool {
        true
    }

    /// Whether action targets are collected and matched.
    fn wants_match(&self) -> bool {
        true
    }

    fn execute(
        &self,
        e: &Arc<Engine>,
        a: Action,
        roots: &[ActionTarget],
    ) -> Result<TargetState>;

    fn operation_post(&self, _e: &Arc<Engine>, _o: OperationId) -> Result<()> {
        Ok(())
    }

    fn post(&self, _e: &Arc<Engine>) -> Result<()> {
        Ok(())
    }
}

/// `perform`: the workhorse traversal executing matched recipes.
pub struct Perform;

impl MetaOperation for Perform {
    fn id(&self) -> MetaOperationId {
        MID_PERFORM
    }

    fn name(&self) -> &'static str {
        "perform"
    }

    fn execute(
        &self,
        e: &Arc<Engine>,
        a: Action,
        roots: &[ActionTarget],
    ) -> Result<TargetState> {
        let ids: Vec<TargetId> = roots
            .iter()
            .filter_map(|r| match r {
                ActionTarget::Target(id) => Some(*id),
                ActionTarget::Scope(_) => None,
            })
            .collect();
        executor::execute_roots(e, a, &ids)
    }
}

/// `info`: print project information.
pub struct Info;

impl MetaOperation for Info {
    fn id(&self) -> MetaOperationId {
        MID_INFO
    }

    fn name(&self) -> &'static str {
        "info"
    }

    fn operation_pre(&self, _e: &Arc<Engine>, o: OperationId) -> Result<OperationId> {
        Ok(o)
    }

    fn wants_match(&self) -> bool {
        false
    }

    fn execute(
        &self,
        e: &Arc<Engine>,
        _a: Action,
        roots: &[ActionTarget],
    ) -> Result<TargetState> {
        for r in roots {
            let ActionTarget::Scope(sid) = r else { continue };
            let scope = e.scopes.get(*sid);

            println!(
                "project: {}",
                scope.project().map(|p| p.to_string()).unwrap_or_default()
            );
            println!("out_root: {}", scope.out_path.display());
            println!("src_root: {}", scope.src_path().display());
            println!(
                "subprojects: {}",
                scope
                    .subprojects()
                    .iter()
                    .map(|p| p.display().to_string())
                    .collect::<Vec<_>>()
                    .join(" ")
            );
        }
        Ok(TargetState::Unchanged)
    }
}

pub fn find_meta(name: &str) -> Option<Arc<dyn MetaOperation>> {
    match name {
        "perform" => Some(Arc::new(Perform)),
        "configure" => Some(Arc::new(configure::Configure)),
        "disfigure" => Some(Arc::new(configure::Disfigure)),
        "info" => Some(Arc::new(Info)),
        _ => None,
    }
}

fn meta_name(name: &str) -> bool {
    // `dist` parses as a meta-operation and is then reported as
    // unsupported by resolution.
    find_meta(name).is_some() || name == "dist"
}

/// Inner/outer operation pairing: install drives update as its inner
/// operation.
fn inner_outer(o: OperationId) -> (OperationId, Option<OperationId>) {
    match o {
        OP_INSTALL => (OP_UPDATE, Some(OP_INSTALL)),
        _ => (o, None),
    }
}

/// Parse and run a buildspec. Returns the combined target state; `Err` is
/// a usage/configuration error.
pub fn run(e: &Arc<Engine>, spec: &str) -> Result<TargetState> {
    let batches = buildspec::parse(spec, meta_name)?;
    run_batches(e, &batches)
}

pub fn run_batches(e: &Arc<Engine>, batches: &[MetaOpSpec]) -> Result<TargetState> {
    let mut overall = TargetState::Unchanged;
    let mut prev: Option<MetaOperationId> = None;

    for batch in batches {
        let mif = find_meta(&batch.name)
            .ok_or_else(|| anyhow!("unknown meta-operation '{}'", batch.name))?;

        // Between incompatible meta-operation batches the configuration
        // may have changed; start from a clean model.
        if prev.is_some_and(|p| p != mif.id()) {
            e.reset();
        }

        e.set_current_meta(mif.id(), mif.name());
        mif.pre(e)?;

        for op in &batch.operations {
            let oinfo = find_operation(&op.name)
                .ok_or_else(|| anyhow!("unknown operation '{}'", op.name))?;
            let oid = mif.operation_pre(e, oinfo.id)?;
            let (inner, outer) = inner_outer(oid);

            e.set_current_operation(operation_info(inner), outer.map(operation_info));
            let a = match outer {
                Some(out) => Action::with_outer(mif.id(), inner, out),
                None => Action::new(mif.id(), inner),
            };

            let state = run_operation(e, &*mif, a, &op.targets)?;
            overall |= state;

            mif.operation_post(e, oid)?;

            if mif.id() == MID_PERFORM && state != TargetState::Failed {
                let dc = e.dependency_count.load(Ordering::Relaxed);
                debug_assert_eq!(dc, 0, "dependency count not drained");
                if dc != 0 {
                    tracing::warn!(count = dc, "dependency count not drained");
                }
            }

            // Per-action state does not survive into the next operation.
            for t in e.targets.all() {
                t.reset_slot();
            }

            if state == TargetState::Failed && !e.keep_going {
                return Ok(TargetState::Failed);
            }
        }

        mif.post(e)?;
        prev = Some(mif.id());
    }

    Ok(overall)
}

fn run_operation(
    e: &Arc<Engine>,
    mif: &dyn MetaOperation,
    a: Action,
    targets: &[TargetSpec],
) -> Result<TargetState> {
    let mut state = TargetState::Unchanged;

    // Load.
    let mut projects: Vec<(Arc<Scope>, TargetSpec)> = Vec::new();
    {
        let _load = e.phase_lock(RunPhase::Load);
        for ts in targets {
            let scope = bootstrap_project(e, ts, mif.wants_load())
                .with_context(|| format!("while loading {}", ts.dir.display()))?;
            projects.push((scope, ts.clone()));
        }
    }

    // Collect and match.
    let mut roots: Vec<ActionTarget> = Vec::new();
    if mif.wants_match() {
        let _match = e.phase_lock(RunPhase::Match);

        let mut ids = Vec::new();
        for (scope, ts) in &projects {
            let id = collect_target(e, scope, ts)?;
            ids.push(id);
            roots.push(ActionTarget::Target(id));
        }

        matcher::match_in_parallel(e, a, &ids)?;

        if ids
            .iter()
            .any(|&id| e.targets.get(id).executed_state() == Some(TargetState::Failed))
        {
            state |= TargetState::Failed;
            if !e.keep_going {
                return Ok(state);
            }
        }
    } else {
        for (scope, _) in &projects {
            roots.push(ActionTarget::Scope(scope.id));
        }
    }

    // Execute, with a progress line fed by the scheduler's monitor hook.
    {
        let _exec = e.phase_lock(RunPhase::Execute);

        let bar = (crate::util::diagnostic::verbosity() == 1
            && mif.id() == MID_PERFORM
            && !e.sched.serial())
        .then(|| {
            let bar = indicatif::ProgressBar::new_spinner();
            bar.set_style(
                indicatif::ProgressStyle::default_spinner()
                    .template("{spinner:.green} {pos} targets")
                    .expect("static template"),
            );
            bar
        });

        let monitor = bar.as_ref().map(|bar| {
            let bar = bar.clone();
            e.sched.monitor(&e.target_count, 1, move |v| {
                bar.set_position(v as u64);
                v + 1
            })
        });

        state |= mif.execute(e, a, &roots)?;

        drop(monitor);
        if let Some(bar) = bar {
            bar.finish_and_clear();
        }
    }

    Ok(state)
}

/// Resolve a target spec's directory against the working directory.
fn resolve_dir(e: &Engine, dir: &Path) -> PathBuf {
    if dir.is_absolute() {
        fs::normalize(dir)
    } else {
        fs::normalize(&e.work_dir.join(dir))
    }
}

/// Find the project's out root for a directory: the nearest enclosing
/// directory with build state or a buildfile, else the directory itself.
fn find_out_root(dir: &Path) -> PathBuf {
    let mut cur = dir;
    loop {
        if cur.join("build").is_dir() || cur.join("buildfile").is_file() {
            return cur.to_path_buf();
        }
        match cur.parent() {
            Some(p) if !p.as_os_str().is_empty() => cur = p,
            _ => return dir.to_path_buf(),
        }
    }
}

/// Set up the project containing a buildspec target: create and mark the
/// root scope, fix src_root (from the `@` qualifier or the persisted
/// `src-root.build`), boot the config module, and load the root
/// buildfile. Must run under the `load` phase lock.
pub fn bootstrap_project(
    e: &Arc<Engine>,
    ts: &TargetSpec,
    load_buildfiles: bool,
) -> Result<Arc<Scope>> {
    let dir = resolve_dir(e, &ts.dir);
    let out_root =
        if ts.src_base.is_some() { dir.clone() } else { find_out_root(&dir) };

    let scope = e.scopes.insert(&out_root, e.load_generation());
    if !scope.is_project_root() {
        scope.set_project_root();
    }

    if let Some(src) = &ts.src_base {
        scope.set_src_path(resolve_dir(e, src));
    } else if let Some(src) = configure::read_src_root(&out_root)? {
        scope.set_src_path(src);
    }

    if scope.project().is_none() {
        if let Some(name) = out_root.file_name() {
            scope.set_project(Symbol::new(name.to_string_lossy()));
        }
    }

    // The config module is always booted: it brings in persisted
    // configuration before the first buildfile declaration.
    e.modules.boot(e, &scope, "config", &Location::default())?;

    if load_buildfiles {
        let bf = scope.src_path().join("buildfile");
        if fs::exists(&bf) && scope.add_buildfile(bf.clone()) {
            e.load_buildfile(&scope, &bf)?;
        }
    }

    Ok(scope)
}

/// Resolve a buildspec target to a concrete action root target.
fn collect_target(e: &Arc<Engine>, scope: &Arc<Scope>, ts: &TargetSpec) -> Result<TargetId> {
    let dir = resolve_dir(e, &ts.dir);

    if let Some(ty) = ts.ty {
        if e.scopes.find_target_type(scope.id, &ty).is_none() {
            bail!("unknown target type '{}' in buildspec", ty);
        }
        let (t, _) = e
            .targets
            .insert(TargetKey::new(ty, dir, ts.name), e.load_generation());
        return Ok(t.id);
    }

    if ts.name.is_empty() {
        // The directory's default target.
        let (t, _) = e.targets.insert(
            TargetKey::new(Symbol::new("dir"), dir, Symbol::empty()),
            e.load_generation(),
        );
        return Ok(t.id);
    }

    let (t, _) = e.targets.insert(
        TargetKey::new(Symbol::new("alias"), dir, ts.name),
        e.load_generation(),
    );
    Ok(t.id)
}
