//! The engine: the one value that owns the scheduler, the phase mutex,
//! the scope/target/variable state, and the current-action bookkeeping.
//!
//! A build process serves one configuration at a time, so these are truly
//! process-global; instead of singletons the engine is created in `main`
//! and passed by shared reference to every component. Per-thread context
//! (phase lock nesting, in-progress match stacks) lives in thread-local
//! storage keyed to the engine's members.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};

use anyhow::{bail, Result};

use crate::core::action::{ExecutionMode, MetaOperationId, OperationInfo};
use crate::core::decl::{self, Loader};
use crate::core::prerequisite::Prerequisite;
use crate::core::scope::{Scope, ScopeId, ScopeMap};
use crate::core::target::{TargetId, TargetKey, TargetSet};
use crate::core::variable::{
    OverrideKind, Value, VarPool, VariableOverride,
};
use crate::module::ModuleHost;
use crate::phase::{PhaseLock, PhaseMutex, PhaseSwitch, RunPhase};
use crate::sched::Scheduler;
use crate::util::diagnostic::ActionVerbs;
use crate::util::Symbol;

/// Engine construction parameters (mostly the command line).
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Maximum simultaneously active threads (`-j`).
    pub max_active: usize,
    /// Keep going after a target fails (`-k`).
    pub keep_going: bool,
    /// Print what would be done without mutating external state.
    pub dry_run: bool,
    /// Command-line variable overrides (including `BUILD2_VAR_OVR`).
    pub overrides: Vec<VariableOverride>,
    /// The process working directory.
    pub work_dir: PathBuf,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            max_active: 1,
            keep_going: false,
            dry_run: false,
            overrides: Vec::new(),
            work_dir: std::env::current_dir().unwrap_or_default(),
        }
    }
}

/// The active (meta-)operation, re-published on each switch.
#[derive(Debug, Clone, Copy)]
pub struct Current {
    pub meta: Option<MetaOperationId>,
    pub meta_name: &'static str,
    pub inner: Option<OperationInfo>,
    pub outer: Option<OperationInfo>,
    /// 1-based operation number in the meta-operation batch.
    pub number: usize,
    pub mode: ExecutionMode,
}

impl Default for Current {
    fn default() -> Self {
        Current {
            meta: None,
            meta_name: "",
            inner: None,
            outer: None,
            number: 0,
            mode: ExecutionMode::First,
        }
    }
}

/// The build engine.
pub struct Engine {
    pub sched: Scheduler,
    pub phase: PhaseMutex,
    pub scopes: ScopeMap,
    pub targets: TargetSet,
    pub var_pool: VarPool,
    pub modules: ModuleHost,

    pub keep_going: bool,
    pub dry_run: bool,
    pub work_dir: PathBuf,
    pub overrides: Vec<VariableOverride>,

    /// Total dependency edges in the current action; incremented during
    /// match, decremented during execute, asserted zero per batch.
    pub dependency_count: AtomicUsize,

    /// Targets executed in the current operation; drives the progress
    /// monitor.
    pub target_count: crate::sched::TaskCount,

    current: RwLock<Current>,
    loader: RwLock<Option<Box<dyn Loader>>>,
    first_targets: Mutex<HashMap<ScopeId, TargetId>>,
    self_ref: Weak<Engine>,
}

impl Engine {
    pub fn new(cfg: EngineConfig) -> Arc<Self> {
        let engine = Arc::new_cyclic(|weak| Engine {
            sched: Scheduler::new(cfg.max_active.max(1)),
            phase: PhaseMutex::new(),
            scopes: ScopeMap::new(),
            targets: TargetSet::new(),
            var_pool: VarPool::new(),
            modules: ModuleHost::with_builtins(),
            keep_going: cfg.keep_going,
            dry_run: cfg.dry_run,
            work_dir: cfg.work_dir,
            overrides: cfg.overrides,
            dependency_count: AtomicUsize::new(0),
            target_count: crate::sched::TaskCount::new(),
            current: RwLock::new(Current::default()),
            loader: RwLock::new(None),
            first_targets: Mutex::new(HashMap::new()),
            self_ref: weak.clone(),
        });

        // Command-line overrides are overridable by definition.
        for o in &engine.overrides {
            engine
                .var_pool
                .insert(o.name, None, crate::core::variable::Visibility::Global, true)
                .expect("untyped insertion cannot conflict");
        }

        crate::build::rules::register_builtins(&engine);
        engine
    }

    /// The shared handle to this engine (for task spawning from rule and
    /// recipe bodies, which receive `&Engine`).
    pub fn shared(&self) -> Arc<Engine> {
        self.self_ref.upgrade().expect("engine owner alive")
    }

    /// Discard all non-global state between meta-operation batches (the
    /// configuration may have changed).
    pub fn reset(&self) {
        tracing::debug!("resetting build state");
        self.targets.clear();
        self.scopes.clear_except_global();
        self.modules.clear();
        self.first_targets.lock().unwrap().clear();
        self.phase.reset_generation();
        self.dependency_count.store(0, Ordering::Relaxed);
    }

    // Phase helpers.

    pub fn load_generation(&self) -> usize {
        self.phase.generation()
    }

    pub fn phase_lock(&self, p: RunPhase) -> PhaseLock<'_> {
        PhaseLock::new(&self.phase, &self.sched, p)
    }

    pub fn phase_switch(&self, to: RunPhase) -> PhaseSwitch<'_> {
        PhaseSwitch::new(&self.phase, &self.sched, to)
    }

    // Current action.

    pub fn current(&self) -> Current {
        *self.current.read().unwrap()
    }

    /// Publish the meta-operation; resets the operation number.
    pub fn set_current_meta(&self, id: MetaOperationId, name: &'static str) {
        let mut cur = self.current.write().unwrap();
        cur.meta = Some(id);
        cur.meta_name = name;
        cur.number = 0;
    }

    /// Publish the operation (inner, plus outer for inner/outer pairs).
    pub fn set_current_operation(&self, inner: OperationInfo, outer: Option<OperationInfo>) {
        let mut cur = self.current.write().unwrap();
        cur.inner = Some(inner);
        cur.outer = outer;
        cur.number += 1;
        cur.mode = inner.mode;
        drop(cur);
        self.dependency_count.store(0, Ordering::Relaxed);
        self.target_count.store(0, Ordering::Relaxed);
    }

    /// Diagnostic verbs of the current (outer) operation.
    pub fn verbs(&self) -> ActionVerbs {
        let cur = self.current.read().unwrap();
        cur.outer
            .or(cur.inner)
            .map(|o| o.verbs)
            .unwrap_or(ActionVerbs::new("do", "doing", "did", "is done"))
    }

    // Buildfile loading.

    pub fn set_loader(&self, l: Box<dyn Loader>) {
        *self.loader.write().unwrap() = Some(l);
    }

    /// Load one buildfile into a scope through the installed loader.
    /// Must be called while holding a `load` phase lock.
    pub fn load_buildfile(&self, scope: &Arc<Scope>, path: &Path) -> Result<()> {
        debug_assert_eq!(self.phase.phase(), RunPhase::Load);

        let loader = self.loader.read().unwrap();
        let Some(loader) = loader.as_ref() else {
            bail!(
                "no buildfile loader installed (needed for {})",
                path.display()
            );
        };

        tracing::debug!(buildfile = %path.display(), "loading");
        let decls = loader.load(self, scope, path)?;
        drop(loader);

        decl::apply(self, scope, &decls)
    }

    /// Record the first target declared in a scope and keep the scope's
    /// directory alias pointing at it.
    pub fn note_first_target(&self, scope: &Arc<Scope>, id: TargetId) {
        let mut firsts = self.first_targets.lock().unwrap();
        if firsts.contains_key(&scope.id) {
            return;
        }
        firsts.insert(scope.id, id);
        drop(firsts);

        // The implicit current-directory alias collects the buildfile's
        // first-defined target.
        let t = self.targets.get(id);
        let (alias, _) = self.targets.insert(
            TargetKey::new(Symbol::new("dir"), scope.out_path.clone(), Symbol::empty()),
            self.load_generation(),
        );
        let mut p = Prerequisite::new(t.key.ty, "", t.key.name);
        if let Some(e) = t.key.ext {
            p = p.with_ext(e);
        }
        alias.add_prerequisite(p);
    }

    /// The directory alias target of a scope, if any target was declared.
    pub fn dir_alias(&self, scope: &Arc<Scope>) -> Option<TargetId> {
        self.targets
            .find(&TargetKey::new(
                Symbol::new("dir"),
                scope.out_path.clone(),
                Symbol::empty(),
            ))
            .map(|t| t.id)
    }

    // Variable lookup.

    /// Look up a variable for a target (or a bare scope), applying
    /// target-type/pattern variables and command-line overrides.
    pub fn value_of(
        &self,
        scope: ScopeId,
        target: Option<&crate::core::target::Target>,
        name: &str,
    ) -> Option<Value> {
        let var = self.var_pool.find(name)?;

        let mut val: Option<Value> = None;

        if let Some(t) = target {
            val = t.vars().read().unwrap().value(name).cloned();

            // Target-type/pattern variables along the scope chain.
            if val.is_none() {
                let mut cur = Some(scope);
                while let Some(id) = cur {
                    let s = self.scopes.get(id);
                    if let Some(v) = s.pattern_var(t.key.ty, &t.key.name, name) {
                        val = Some(v);
                        break;
                    }
                    cur = s.parent.or(if id == crate::core::scope::GLOBAL_SCOPE {
                        None
                    } else {
                        Some(crate::core::scope::GLOBAL_SCOPE)
                    });
                }
            }
        }

        if val.is_none() {
            val = self.scopes.lookup(scope, &var).map(|(v, _)| v);
        }

        // Command-line overrides shadow project values.
        if var.overridable {
            for o in self.overrides.iter().filter(|o| o.name == var.name) {
                let ov = Value::Untyped(o.value.clone());
                val = Some(match (o.kind, val.take()) {
                    (OverrideKind::Assign, _) => ov,
                    (OverrideKind::Append, None) | (OverrideKind::Prepend, None) => ov,
                    (OverrideKind::Append, Some(Value::Untyped(mut names))) => {
                        names.extend(o.value.clone());
                        Value::Untyped(names)
                    }
                    (OverrideKind::Prepend, Some(Value::Untyped(names))) => {
                        let mut v = o.value.clone();
                        v.extend(names);
                        Value::Untyped(v)
                    }
                    // A typed base value: the override replaces it.
                    (_, Some(_)) => ov,
                });
            }
        }

        val
    }

    /// Convenience: the value as a bool, defaulting to false.
    pub fn bool_of(&self, scope: ScopeId, name: &str) -> bool {
        self.value_of(scope, None, name).and_then(|v| v.as_bool()).unwrap_or(false)
    }

    /// Shut down the scheduler and return its statistics.
    pub fn shutdown(&self) -> crate::sched::SchedStats {
        self.sched.shutdown()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::variable::Name;

    fn engine() -> Arc<Engine> {
        Engine::new(EngineConfig::default())
    }

    #[test]
    fn test_override_shadows_project_value() {
        let mut cfg = EngineConfig::default();
        cfg.overrides = vec![VariableOverride::parse("config.cc=clang").unwrap()];
        let e = Engine::new(cfg);

        let root = e.scopes.insert(Path::new("/p"), 0);
        root.set_project_root();

        let var = e.var_pool.find("config.cc").unwrap();
        root.vars()
            .write()
            .unwrap()
            .assign(&var, Some(Value::from_str_untyped("gcc")), 0)
            .unwrap();

        let v = e.value_of(root.id, None, "config.cc").unwrap();
        assert_eq!(v.as_str(), Some("clang"));
    }

    #[test]
    fn test_append_override_extends() {
        let mut cfg = EngineConfig::default();
        cfg.overrides = vec![VariableOverride::parse("gen.options+=-v").unwrap()];
        let e = Engine::new(cfg);

        let root = e.scopes.insert(Path::new("/p"), 0);
        let var = e.var_pool.find("gen.options").unwrap();
        root.vars()
            .write()
            .unwrap()
            .assign(
                &var,
                Some(Value::Untyped(vec![Name::simple("--fast")])),
                0,
            )
            .unwrap();

        let v = e.value_of(root.id, None, "gen.options").unwrap();
        let names: Vec<String> = v.to_names().iter().map(|n| n.to_string()).collect();
        assert_eq!(names, ["--fast", "-v"]);
    }

    #[test]
    fn test_first_target_feeds_dir_alias() {
        let e = engine();
        let scope = e.scopes.insert(Path::new("/p"), 0);

        let (t, _) = e.targets.insert(
            TargetKey::new(Symbol::new("file"), "/p", Symbol::new("foo")),
            0,
        );
        e.note_first_target(&scope, t.id);

        let alias = e.dir_alias(&scope).map(|id| e.targets.get(id)).unwrap();
        let prereqs = alias.prerequisites();
        assert_eq!(prereqs.len(), 1);
        assert_eq!(prereqs[0].name, "foo");

        // A second target does not displace the first.
        let (t2, _) = e.targets.insert(
            TargetKey::new(Symbol::new("file"), "/p", Symbol::new("bar")),
            0,
        );
        e.note_first_target(&scope, t2.id);
        assert_eq!(e.targets.get(e.dir_alias(&scope).unwrap()).prerequisites().len(), 1);
    }

    #[test]
    fn test_reset_clears_model() {
        let e = engine();
        e.scopes.insert(Path::new("/p"), 0);
        e.targets
            .insert(TargetKey::new(Symbol::new("file"), "/p", Symbol::new("x")), 0);

        e.reset();
        assert!(e.targets.is_empty());
        assert!(e.scopes.is_empty());
    }

    #[test]
    fn test_current_operation_sequencing() {
        use crate::util::diagnostic::ActionVerbs;

        let e = engine();
        e.set_current_meta(MetaOperationId(1), "perform");
        assert_eq!(e.current().number, 0);

        let info = OperationInfo::new(
            crate::core::action::OperationId(1),
            "update",
            ActionVerbs::new("update", "updating", "updated", "is up to date"),
            ExecutionMode::First,
        );
        e.set_current_operation(info, None);
        assert_eq!(e.current().number, 1);
        assert_eq!(e.current().mode, ExecutionMode::First);

        e.set_current_operation(info, None);
        assert_eq!(e.current().number, 2);
    }
}
