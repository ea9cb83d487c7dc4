//! Scopes: directory-rooted tree nodes holding variables, target types,
//! and rules.
//!
//! Scopes are keyed by absolute out-tree directory; lookup uses the
//! nearest-ancestor rule with the global scope as the root of everything.
//! A scope's out path is immutable; its src path is immutable once set
//! during project setup.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, RwLock};

use crate::core::rule::RuleMap;
use crate::core::target::TargetType;
use crate::core::variable::{Value, Variable, VariableMap, Visibility};
use crate::util::Symbol;

/// Stable handle to a scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ScopeId(pub u32);

/// The global scope's id.
pub const GLOBAL_SCOPE: ScopeId = ScopeId(0);

/// Target-type/pattern-specific variables (`type{*}: var = value`).
pub struct PatternVars {
    pub ty: Symbol,
    pub pattern: String,
    pub vars: VariableMap,
}

/// Match a target name against a `*` glob pattern.
pub fn pattern_matches(pattern: &str, name: &str) -> bool {
    match pattern.split_once('*') {
        Some((prefix, suffix)) => {
            name.len() >= prefix.len() + suffix.len()
                && name.starts_with(prefix)
                && name.ends_with(suffix)
        }
        None => pattern == name,
    }
}

/// A scope.
pub struct Scope {
    pub id: ScopeId,
    pub parent: Option<ScopeId>,
    pub out_path: PathBuf,
    /// Load generation this scope was created in.
    pub generation: usize,

    src_path: OnceLock<PathBuf>,
    is_root: AtomicBool,
    root: RwLock<Option<ScopeId>>,

    vars: RwLock<VariableMap>,
    pattern_vars: RwLock<Vec<PatternVars>>,
    target_types: RwLock<HashMap<Symbol, Arc<TargetType>>>,
    rules: RwLock<RuleMap>,

    project: RwLock<Option<Symbol>>,
    subprojects: RwLock<Vec<PathBuf>>,
    buildfiles: RwLock<HashSet<PathBuf>>,
}

impl Scope {
    fn new(id: ScopeId, parent: Option<ScopeId>, out_path: PathBuf, generation: usize) -> Self {
        Scope {
            id,
            parent,
            out_path,
            generation,
            src_path: OnceLock::new(),
            is_root: AtomicBool::new(false),
            root: RwLock::new(None),
            vars: RwLock::new(VariableMap::new()),
            pattern_vars: RwLock::new(Vec::new()),
            target_types: RwLock::new(HashMap::new()),
            rules: RwLock::new(RuleMap::new()),
            project: RwLock::new(None),
            subprojects: RwLock::new(Vec::new()),
            buildfiles: RwLock::new(HashSet::new()),
        }
    }

    /// The source directory for in-source/out-of-source builds; equals the
    /// out path when building in source.
    pub fn src_path(&self) -> &Path {
        self.src_path.get().map(|p| p.as_path()).unwrap_or(&self.out_path)
    }

    /// Fix the src path. May be called once; later calls with a different
    /// path are ignored (the path is immutable after setup).
    pub fn set_src_path(&self, p: PathBuf) {
        let _ = self.src_path.set(p);
    }

    pub fn out_eq_src(&self) -> bool {
        self.src_path() == self.out_path
    }

    /// Mark this scope as a project root.
    pub fn set_project_root(&self) {
        self.is_root.store(true, Ordering::Release);
        *self.root.write().unwrap() = Some(self.id);
    }

    pub fn is_project_root(&self) -> bool {
        self.is_root.load(Ordering::Acquire)
    }

    pub fn root(&self) -> Option<ScopeId> {
        *self.root.read().unwrap()
    }

    pub(crate) fn set_root(&self, r: Option<ScopeId>) {
        *self.root.write().unwrap() = r;
    }

    /// True if `path` is in this scope's subtree.
    pub fn contains(&self, path: &Path) -> bool {
        path.starts_with(&self.out_path)
    }

    pub fn vars(&self) -> &RwLock<VariableMap> {
        &self.vars
    }

    pub fn rules(&self) -> &RwLock<RuleMap> {
        &self.rules
    }

    pub fn project(&self) -> Option<Symbol> {
        *self.project.read().unwrap()
    }

    pub fn set_project(&self, name: Symbol) {
        *self.project.write().unwrap() = Some(name);
    }

    pub fn subprojects(&self) -> Vec<PathBuf> {
        self.subprojects.read().unwrap().clone()
    }

    pub fn add_subproject(&self, p: PathBuf) {
        self.subprojects.write().unwrap().push(p);
    }

    /// Record a buildfile as included; false if it already was (so
    /// `include` is once-only).
    pub fn add_buildfile(&self, p: PathBuf) -> bool {
        self.buildfiles.write().unwrap().insert(p)
    }

    pub fn register_target_type(&self, tt: TargetType) {
        self.target_types.write().unwrap().insert(tt.name, Arc::new(tt));
    }

    pub fn find_target_type_here(&self, name: &str) -> Option<Arc<TargetType>> {
        self.target_types.read().unwrap().get(name).cloned()
    }

    /// Set a target-type/pattern variable.
    pub fn assign_pattern_var(
        &self,
        ty: Symbol,
        pattern: impl Into<String>,
        var: &Variable,
        value: Option<Value>,
        generation: usize,
    ) -> Result<(), crate::core::variable::ValueError> {
        let pattern = pattern.into();
        let mut pvs = self.pattern_vars.write().unwrap();

        if let Some(pv) =
            pvs.iter_mut().find(|pv| pv.ty == ty && pv.pattern == pattern)
        {
            pv.vars.assign(var, value, generation)?;
            return Ok(());
        }

        let mut vars = VariableMap::new();
        vars.assign(var, value, generation)?;
        pvs.push(PatternVars { ty, pattern, vars });
        Ok(())
    }

    /// Look up a target-type/pattern variable for a concrete target.
    pub fn pattern_var(&self, ty: Symbol, target_name: &str, var: &str) -> Option<Value> {
        let pvs = self.pattern_vars.read().unwrap();
        for pv in pvs.iter() {
            if pv.ty == ty && pattern_matches(&pv.pattern, target_name) {
                if let Some(v) = pv.vars.value(var) {
                    return Some(v.clone());
                }
            }
        }
        None
    }
}

/// The scope tree: a path-indexed map over an arena. The global scope is
/// created up front and survives resets.
pub struct ScopeMap {
    by_out: RwLock<BTreeMap<PathBuf, ScopeId>>,
    arena: RwLock<Vec<Arc<Scope>>>,
}

impl Default for ScopeMap {
    fn default() -> Self {
        Self::new()
    }
}

impl ScopeMap {
    pub fn new() -> Self {
        let global = Arc::new(Scope::new(GLOBAL_SCOPE, None, PathBuf::new(), 0));
        global.set_src_path(PathBuf::new());
        ScopeMap {
            by_out: RwLock::new(BTreeMap::new()),
            arena: RwLock::new(vec![global]),
        }
    }

    pub fn global(&self) -> Arc<Scope> {
        self.get(GLOBAL_SCOPE)
    }

    pub fn get(&self, id: ScopeId) -> Arc<Scope> {
        self.arena.read().unwrap()[id.0 as usize].clone()
    }

    /// Insert (or find) the scope for an out directory. The parent is the
    /// nearest ancestor scope (the global scope if none).
    pub fn insert(&self, out: &Path, generation: usize) -> Arc<Scope> {
        if let Some(s) = self.find_exact(out) {
            return s;
        }

        let parent = self.find_containing(out).map(|s| s.id);

        let mut by_out = self.by_out.write().unwrap();
        if let Some(&id) = by_out.get(out) {
            return self.get(id);
        }

        let mut arena = self.arena.write().unwrap();
        let id = ScopeId(arena.len() as u32);
        let scope = Arc::new(Scope::new(id, parent, out.to_path_buf(), generation));

        // Inherit the project root from the parent chain.
        if let Some(pid) = parent {
            let p = arena[pid.0 as usize].clone();
            scope.set_root(p.root());
        }

        arena.push(scope.clone());
        by_out.insert(out.to_path_buf(), id);

        tracing::trace!(out = %out.display(), id = id.0, "new scope");
        scope
    }

    pub fn find_exact(&self, out: &Path) -> Option<Arc<Scope>> {
        let id = *self.by_out.read().unwrap().get(out)?;
        Some(self.get(id))
    }

    /// The nearest scope containing this directory, excluding an exact
    /// match's own subtree start; None means only the global scope.
    pub fn find_containing(&self, path: &Path) -> Option<Arc<Scope>> {
        let by_out = self.by_out.read().unwrap();
        let mut cur = path.parent();
        while let Some(p) = cur {
            if let Some(&id) = by_out.get(p) {
                drop(by_out);
                return Some(self.get(id));
            }
            cur = p.parent();
        }
        None
    }

    /// The scope a directory belongs to: the exact scope or the nearest
    /// ancestor, defaulting to global.
    pub fn scope_of(&self, path: &Path) -> Arc<Scope> {
        self.find_exact(path)
            .or_else(|| self.find_containing(path))
            .unwrap_or_else(|| self.global())
    }

    /// The project root scope of a scope, if it is inside a project.
    pub fn root_of(&self, id: ScopeId) -> Option<Arc<Scope>> {
        let scope = self.get(id);
        scope.root().map(|r| self.get(r))
    }

    /// Walk a variable lookup outward from a scope, honoring visibility.
    /// Returns the value and the scope that provided it.
    pub fn lookup(&self, from: ScopeId, var: &Variable) -> Option<(Value, ScopeId)> {
        let mut cur = Some(from);
        while let Some(id) = cur {
            let scope = self.get(id);
            if let Some(v) = scope.vars().read().unwrap().value(&var.name) {
                return Some((v.clone(), id));
            }

            match var.visibility {
                Visibility::Target | Visibility::Scope => return None,
                Visibility::Project => {
                    if scope.is_project_root() {
                        // Amalgamation: a nested project root continues
                        // the lookup at the outer project's root.
                        match scope.parent.map(|p| self.get(p)).and_then(|p| p.root()) {
                            Some(outer) => cur = Some(outer),
                            None => return None,
                        }
                        continue;
                    }
                    cur = scope.parent.or(if id == GLOBAL_SCOPE { None } else { Some(GLOBAL_SCOPE) });
                }
                Visibility::Global => {
                    cur = scope.parent.or(if id == GLOBAL_SCOPE { None } else { Some(GLOBAL_SCOPE) });
                }
            }
        }
        None
    }

    /// Find a registered target type, walking the scope chain outward.
    pub fn find_target_type(&self, from: ScopeId, name: &str) -> Option<Arc<TargetType>> {
        let mut cur = Some(from);
        while let Some(id) = cur {
            let scope = self.get(id);
            if let Some(tt) = scope.find_target_type_here(name) {
                return Some(tt);
            }
            cur = scope.parent.or(if id == GLOBAL_SCOPE { None } else { Some(GLOBAL_SCOPE) });
        }
        None
    }

    pub fn len(&self) -> usize {
        self.arena.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() <= 1
    }

    /// Discard all scopes except the global one (reset between batches).
    pub fn clear_except_global(&self) {
        self.by_out.write().unwrap().clear();
        let mut arena = self.arena.write().unwrap();
        arena.truncate(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::variable::VarPool;

    #[test]
    fn test_nearest_ancestor_lookup() {
        let scopes = ScopeMap::new();
        let proj = scopes.insert(Path::new("/work/proj"), 0);
        proj.set_project_root();
        let sub = scopes.insert(Path::new("/work/proj/sub"), 0);

        assert_eq!(sub.parent, Some(proj.id));
        assert_eq!(sub.root(), Some(proj.id));

        // Deep unregistered directories resolve to the nearest scope.
        let found = scopes.scope_of(Path::new("/work/proj/sub/deep/dir"));
        assert_eq!(found.id, sub.id);

        // Outside everything resolves to the global scope.
        let found = scopes.scope_of(Path::new("/elsewhere"));
        assert_eq!(found.id, GLOBAL_SCOPE);
    }

    #[test]
    fn test_variable_lookup_walks_outward() {
        let scopes = ScopeMap::new();
        let pool = VarPool::new();
        let var = pool.insert_plain("project");

        let proj = scopes.insert(Path::new("/p"), 0);
        proj.set_project_root();
        let sub = scopes.insert(Path::new("/p/s"), 0);

        proj.vars()
            .write()
            .unwrap()
            .assign(&var, Some(Value::from_str_untyped("demo")), 0)
            .unwrap();

        let (v, from) = scopes.lookup(sub.id, &var).unwrap();
        assert_eq!(v.as_str(), Some("demo"));
        assert_eq!(from, proj.id);
    }

    #[test]
    fn test_global_fallback() {
        let scopes = ScopeMap::new();
        let pool = VarPool::new();
        let var = pool.insert_plain("build.verbosity");

        scopes
            .global()
            .vars()
            .write()
            .unwrap()
            .assign(&var, Some(Value::from_str_untyped("2")), 0)
            .unwrap();

        let proj = scopes.insert(Path::new("/p"), 0);
        let (v, from) = scopes.lookup(proj.id, &var).unwrap();
        assert_eq!(v.as_str(), Some("2"));
        assert_eq!(from, GLOBAL_SCOPE);
    }

    #[test]
    fn test_scope_visibility_stops_at_scope() {
        let scopes = ScopeMap::new();
        let pool = VarPool::new();
        let var = pool
            .insert("local", None, Visibility::Scope, false)
            .unwrap();

        let proj = scopes.insert(Path::new("/p"), 0);
        let sub = scopes.insert(Path::new("/p/s"), 0);

        proj.vars()
            .write()
            .unwrap()
            .assign(&var, Some(Value::from_str_untyped("x")), 0)
            .unwrap();

        assert!(scopes.lookup(sub.id, &var).is_none());
        assert!(scopes.lookup(proj.id, &var).is_some());
    }

    #[test]
    fn test_src_path_immutable() {
        let scopes = ScopeMap::new();
        let s = scopes.insert(Path::new("/out"), 0);
        // Defaults to the out path until set (in-source build).
        assert_eq!(s.src_path(), Path::new("/out"));

        let s2 = scopes.insert(Path::new("/out2"), 0);
        s2.set_src_path(PathBuf::from("/src2"));
        assert_eq!(s2.src_path(), Path::new("/src2"));
        s2.set_src_path(PathBuf::from("/other"));
        assert_eq!(s2.src_path(), Path::new("/src2"));
        assert!(!s2.out_eq_src());
    }

    #[test]
    fn test_pattern_matching() {
        assert!(pattern_matches("*", "anything"));
        assert!(pattern_matches("foo*", "foobar"));
        assert!(pattern_matches("*bar", "foobar"));
        assert!(pattern_matches("f*r", "foobar"));
        assert!(!pattern_matches("foo", "foobar"));
        assert!(pattern_matches("foo", "foo"));
        assert!(!pattern_matches("fx*", "foobar"));
    }

    #[test]
    fn test_pattern_vars() {
        let scopes = ScopeMap::new();
        let pool = VarPool::new();
        let var = pool.insert_plain("gen.options");

        let s = scopes.insert(Path::new("/p"), 0);
        s.assign_pattern_var(
            Symbol::new("gen"),
            "*",
            &var,
            Some(Value::from_str_untyped("--fast")),
            0,
        )
        .unwrap();

        let v = s.pattern_var(Symbol::new("gen"), "foo", "gen.options");
        assert_eq!(v.unwrap().as_str(), Some("--fast"));

        assert!(s.pattern_var(Symbol::new("hxx"), "foo", "gen.options").is_none());
    }

    #[test]
    fn test_buildfile_once() {
        let scopes = ScopeMap::new();
        let s = scopes.insert(Path::new("/p"), 0);
        assert!(s.add_buildfile(PathBuf::from("/p/buildfile")));
        assert!(!s.add_buildfile(PathBuf::from("/p/buildfile")));
    }

    #[test]
    fn test_clear_retains_global() {
        let scopes = ScopeMap::new();
        scopes.insert(Path::new("/p"), 0);
        assert_eq!(scopes.len(), 2);

        scopes.clear_except_global();
        assert_eq!(scopes.len(), 1);
        assert!(scopes.find_exact(Path::new("/p")).is_none());
        scopes.global(); // still there
    }
}
