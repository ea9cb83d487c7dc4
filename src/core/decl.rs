//! Buildfile declarations.
//!
//! The buildfile language (lexing, parsing, expansion, `if`/`else`
//! evaluation) lives outside the core; what reaches the model is a stream
//! of declarations, applied under a held `load` phase lock. New nodes are
//! tagged with the current load generation so island appends from a
//! reentered load cannot invalidate earlier references.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};

use crate::core::prerequisite::Prerequisite;
use crate::core::scope::Scope;
use crate::core::target::{TargetKey, TargetType};
use crate::core::variable::{Name, Value, ValueType, Visibility};
use crate::engine::Engine;
use crate::util::diagnostic::Location;
use crate::util::Symbol;

/// A target reference as written: `[project%][dir/]type{name[.ext]}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetRef {
    pub project: Option<Symbol>,
    pub ty: Symbol,
    /// Relative to the declaring scope unless absolute.
    pub dir: PathBuf,
    pub name: Symbol,
    pub ext: Option<Symbol>,
}

impl TargetRef {
    pub fn new(ty: impl Into<Symbol>, name: impl Into<Symbol>) -> Self {
        TargetRef {
            project: None,
            ty: ty.into(),
            dir: PathBuf::new(),
            name: name.into(),
            ext: None,
        }
    }

    pub fn in_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.dir = dir.into();
        self
    }

    pub fn with_ext(mut self, ext: impl Into<Symbol>) -> Self {
        self.ext = Some(ext.into());
        self
    }
}

/// Assignment flavors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssignOp {
    Assign,
    Append,
    Prepend,
}

/// One declaration.
#[derive(Debug, Clone)]
pub enum DeclKind {
    /// `targets... : prerequisites...`
    Target { targets: Vec<TargetRef>, prerequisites: Vec<TargetRef> },

    /// `[dir/ :] var op value`; a typed var declaration when `ty` is set.
    Assign {
        scope_dir: Option<PathBuf>,
        var: String,
        ty: Option<ValueType>,
        op: AssignOp,
        value: Vec<Name>,
    },

    /// `type{pattern}: var = value`
    PatternAssign { ty: Symbol, pattern: String, var: String, value: Vec<Name> },

    /// `include path` (a buildfile; once per scope)
    Include { path: PathBuf },

    /// `source path` (a buildfile; unconditionally)
    Source { path: PathBuf },

    /// `import var = project%type{name}` (resolved at match time)
    Import { var: String, target: TargetRef },

    /// `export value` (what importers of this project get)
    Export { value: Vec<Name> },

    /// `using module` / `using? module`
    Using { module: String, optional: bool },

    /// `define derived : base`
    Define { name: Symbol, base: Symbol },

    /// `assert`; the condition is evaluated by the parser.
    Assert { condition: bool, message: Option<String> },

    /// `print`
    Print { message: String },

    /// A `{}` scope after a target: parsed but reserved.
    TargetScope { target: TargetRef },
}

/// A declaration with its buildfile location.
#[derive(Debug, Clone)]
pub struct Decl {
    pub kind: DeclKind,
    pub loc: Location,
}

impl Decl {
    pub fn new(kind: DeclKind) -> Self {
        Decl { kind, loc: Location::default() }
    }

    pub fn at(kind: DeclKind, loc: Location) -> Self {
        Decl { kind, loc }
    }
}

/// Produces the declarations of a buildfile. The buildfile parser lives
/// behind this seam; tests and embedders install their own.
pub trait Loader: Send + Sync {
    fn load(&self, engine: &Engine, scope: &Arc<Scope>, buildfile: &Path) -> Result<Vec<Decl>>;
}

/// Resolve a target reference against its declaring scope and insert the
/// target.
fn insert_target(
    engine: &Engine,
    scope: &Arc<Scope>,
    r: &TargetRef,
    loc: &Location,
) -> Result<crate::core::target::TargetId> {
    let tt = engine
        .scopes
        .find_target_type(scope.id, &r.ty)
        .ok_or_else(|| anyhow!("{}: unknown target type {}", loc, r.ty))?;

    let out_dir = if r.dir.is_absolute() {
        r.dir.clone()
    } else {
        scope.out_path.join(&r.dir)
    };

    let mut key = TargetKey::new(tt.name, out_dir, r.name);
    if let Some(e) = r.ext {
        key = key.with_ext(e);
    }

    let (t, _) = engine.targets.insert(key, engine.load_generation());
    Ok(t.id)
}

/// Apply a declaration stream to a scope. Must be called while holding a
/// `load` phase lock.
pub fn apply(engine: &Engine, scope: &Arc<Scope>, decls: &[Decl]) -> Result<()> {
    for d in decls {
        apply_one(engine, scope, d)
            .with_context(|| format!("while loading {}", scope.out_path.display()))?;
    }
    Ok(())
}

fn apply_one(engine: &Engine, scope: &Arc<Scope>, d: &Decl) -> Result<()> {
    let generation = engine.load_generation();

    match &d.kind {
        DeclKind::Target { targets, prerequisites } => {
            for r in targets {
                let id = insert_target(engine, scope, r, &d.loc)?;
                let t = engine.targets.get(id);

                for p in prerequisites {
                    // Duplicate edges are allowed; they collapse during
                    // match.
                    t.add_prerequisite(to_prerequisite(p));
                }

                engine.note_first_target(scope, id);
            }
        }

        DeclKind::Assign { scope_dir, var, ty, op, value } => {
            let target_scope = match scope_dir {
                None => scope.clone(),
                Some(dir) => {
                    let out = if dir.is_absolute() {
                        dir.clone()
                    } else {
                        scope.out_path.join(dir)
                    };
                    engine.scopes.insert(&out, generation)
                }
            };

            let variable = engine
                .var_pool
                .insert(var.as_str(), *ty, Visibility::Global, false)
                .map_err(|e| anyhow!("{}: {}", d.loc, e))?;

            let v = Value::Untyped(value.clone());
            let mut vars = target_scope.vars().write().unwrap();
            match op {
                AssignOp::Assign => {
                    vars.assign(&variable, Some(v), generation)
                        .map_err(|e| anyhow!("{}: {}", d.loc, e))?;
                }
                AssignOp::Append => {
                    vars.append(&variable, v, generation)
                        .map_err(|e| anyhow!("{}: {}", d.loc, e))?;
                }
                AssignOp::Prepend => {
                    vars.prepend(&variable, v, generation)
                        .map_err(|e| anyhow!("{}: {}", d.loc, e))?;
                }
            }
        }

        DeclKind::PatternAssign { ty, pattern, var, value } => {
            let variable = engine.var_pool.insert_plain(var.as_str());
            scope
                .assign_pattern_var(
                    *ty,
                    pattern.clone(),
                    &variable,
                    Some(Value::Untyped(value.clone())),
                    generation,
                )
                .map_err(|e| anyhow!("{}: {}", d.loc, e))?;
        }

        DeclKind::Include { path } => {
            let path = resolve_buildfile(scope, path);
            if scope.add_buildfile(path.clone()) {
                engine.load_buildfile(scope, &path)?;
            }
        }

        DeclKind::Source { path } => {
            let path = resolve_buildfile(scope, path);
            engine.load_buildfile(scope, &path)?;
        }

        DeclKind::Import { var, target } => {
            // Record the qualified name; the reference resolves during
            // match via the import search.
            let variable = engine.var_pool.insert_plain(var.as_str());
            let name = Name {
                project: target.project,
                dir: if target.dir.as_os_str().is_empty() {
                    None
                } else {
                    Some(target.dir.clone())
                },
                ty: Some(target.ty),
                value: target.name.to_string(),
                pair: false,
            };
            scope
                .vars()
                .write()
                .unwrap()
                .assign(&variable, Some(Value::Untyped(vec![name])), generation)
                .map_err(|e| anyhow!("{}: {}", d.loc, e))?;
        }

        DeclKind::Export { value } => {
            let variable = engine.var_pool.insert_plain("export");
            scope
                .vars()
                .write()
                .unwrap()
                .assign(&variable, Some(Value::Untyped(value.clone())), generation)
                .map_err(|e| anyhow!("{}: {}", d.loc, e))?;
        }

        DeclKind::Using { module, optional } => {
            let root = engine
                .scopes
                .root_of(scope.id)
                .ok_or_else(|| anyhow!("{}: 'using {}' outside a project", d.loc, module))?;
            engine.modules.load(engine, &root, scope, module, *optional, &Default::default())?;
        }

        DeclKind::Define { name, base } => {
            let base_tt = engine
                .scopes
                .find_target_type(scope.id, base)
                .ok_or_else(|| anyhow!("{}: unknown base target type {}", d.loc, base))?;

            let mut tt = TargetType::new(*name, base_tt.kind).derived(base_tt.name);
            if let Some(e) = base_tt.default_ext {
                tt = tt.with_ext(e);
            }
            scope.register_target_type(tt);
        }

        DeclKind::Assert { condition, message } => {
            if !condition {
                match message {
                    Some(m) => bail!("{}: assertion failed: {}", d.loc, m),
                    None => bail!("{}: assertion failed", d.loc),
                }
            }
        }

        DeclKind::Print { message } => {
            println!("{}", message);
        }

        DeclKind::TargetScope { target } => {
            bail!("{}: target scopes not yet supported ({}{{{}}})", d.loc, target.ty, target.name);
        }
    }

    Ok(())
}

fn to_prerequisite(r: &TargetRef) -> Prerequisite {
    let mut p = Prerequisite::new(r.ty, r.dir.clone(), r.name);
    if let Some(e) = r.ext {
        p = p.with_ext(e);
    }
    if let Some(proj) = r.project {
        p = p.imported(proj);
    }
    p
}

fn resolve_buildfile(scope: &Arc<Scope>, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        scope.src_path().join(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_target_ref_builders() {
        let r = TargetRef::new("gen", "foo").in_dir("sub").with_ext("tpl");
        assert_eq!(r.ty, "gen");
        assert_eq!(r.dir, PathBuf::from("sub"));
        assert_eq!(r.ext.unwrap(), "tpl");
    }

    #[test]
    fn test_to_prerequisite_carries_qualifier() {
        let mut r = TargetRef::new("lib", "core");
        r.project = Some(Symbol::new("extras"));
        let p = to_prerequisite(&r);
        assert_eq!(p.project, Some(Symbol::new("extras")));
        assert_eq!(p.ty, "lib");
    }
}
