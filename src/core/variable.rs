//! Variables and values.
//!
//! A variable is identified by a pooled name and optionally carries a type,
//! a visibility, and an overridable flag. Values are either typed (a tagged
//! union over the enumerated scalar and vector types) or an untyped ordered
//! sequence of names. Assignment to a typed variable from an untyped value
//! goes through lexical conversion.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::{Arc, OnceLock, RwLock};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::util::Symbol;

/// Variable or value errors. These surface as configuration errors.
#[derive(Debug, Error)]
pub enum ValueError {
    #[error("variable {name} type conflict: declared {declared}, requested {requested}")]
    TypeConflict { name: Symbol, declared: ValueType, requested: ValueType },

    #[error("invalid {ty} value '{text}'")]
    Conversion { ty: ValueType, text: String },

    #[error("cannot {op} {ty} value of variable {name}")]
    BadCombine { op: &'static str, ty: &'static str, name: Symbol },

    #[error("variable {name} value is {actual}, expected {expected}")]
    Mismatch { name: Symbol, actual: ValueType, expected: ValueType },

    #[error("both append and prepend applied to command line override of {name}")]
    OverrideMix { name: Symbol },
}

/// A name: the atom of untyped values.
///
/// Carries an optional project qualifier, a directory component, a type
/// component, and the simple value, plus a pair indicator marking the first
/// half of a pair.
#[derive(Clone, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Name {
    pub project: Option<Symbol>,
    pub dir: Option<PathBuf>,
    pub ty: Option<Symbol>,
    pub value: String,
    pub pair: bool,
}

impl Name {
    /// A simple (value-only) name.
    pub fn simple(value: impl Into<String>) -> Self {
        Name { value: value.into(), ..Name::default() }
    }

    /// A directory name.
    pub fn from_dir(dir: impl Into<PathBuf>) -> Self {
        Name { dir: Some(dir.into()), ..Name::default() }
    }

    /// A typed name, `type{value}`.
    pub fn typed(ty: Symbol, value: impl Into<String>) -> Self {
        Name { ty: Some(ty), value: value.into(), ..Name::default() }
    }

    pub fn is_simple(&self) -> bool {
        self.project.is_none() && self.dir.is_none() && self.ty.is_none() && !self.pair
    }

    pub fn is_empty(&self) -> bool {
        self.dir.is_none() && self.value.is_empty()
    }
}

impl fmt::Display for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(p) = self.project {
            write!(f, "{}%", p)?;
        }
        if let Some(ref d) = self.dir {
            let d = d.display().to_string();
            write!(f, "{}", d)?;
            if !d.ends_with('/') {
                write!(f, "/")?;
            }
        }
        if let Some(t) = self.ty {
            write!(f, "{}{{{}}}", t, self.value)
        } else {
            write!(f, "{}", self.value)
        }
    }
}

/// The enumerated value types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueType {
    Bool,
    U64,
    String,
    Path,
    DirPath,
    AbsDirPath,
    Name,
    BoolVec,
    U64Vec,
    StringVec,
    PathVec,
    DirPathVec,
    AbsDirPathVec,
    NameVec,
}

impl ValueType {
    pub fn name(self) -> &'static str {
        match self {
            ValueType::Bool => "bool",
            ValueType::U64 => "uint64",
            ValueType::String => "string",
            ValueType::Path => "path",
            ValueType::DirPath => "dir_path",
            ValueType::AbsDirPath => "abs_dir_path",
            ValueType::Name => "name",
            ValueType::BoolVec => "bools",
            ValueType::U64Vec => "uint64s",
            ValueType::StringVec => "strings",
            ValueType::PathVec => "paths",
            ValueType::DirPathVec => "dir_paths",
            ValueType::AbsDirPathVec => "abs_dir_paths",
            ValueType::NameVec => "names",
        }
    }

    /// The element type of a vector type.
    pub fn element(self) -> Option<ValueType> {
        match self {
            ValueType::BoolVec => Some(ValueType::Bool),
            ValueType::U64Vec => Some(ValueType::U64),
            ValueType::StringVec => Some(ValueType::String),
            ValueType::PathVec => Some(ValueType::Path),
            ValueType::DirPathVec => Some(ValueType::DirPath),
            ValueType::AbsDirPathVec => Some(ValueType::AbsDirPath),
            ValueType::NameVec => Some(ValueType::Name),
            _ => None,
        }
    }

    pub fn is_vector(self) -> bool {
        self.element().is_some()
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ValueType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "bool" => ValueType::Bool,
            "uint64" => ValueType::U64,
            "string" => ValueType::String,
            "path" => ValueType::Path,
            "dir_path" => ValueType::DirPath,
            "abs_dir_path" => ValueType::AbsDirPath,
            "name" => ValueType::Name,
            "bools" => ValueType::BoolVec,
            "uint64s" => ValueType::U64Vec,
            "strings" => ValueType::StringVec,
            "paths" => ValueType::PathVec,
            "dir_paths" => ValueType::DirPathVec,
            "abs_dir_paths" => ValueType::AbsDirPathVec,
            "names" => ValueType::NameVec,
            _ => return Err(format!("unknown value type '{}'", s)),
        })
    }
}

/// A value: typed, or an untyped ordered sequence of names.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Bool(bool),
    U64(u64),
    String(String),
    Path(PathBuf),
    DirPath(PathBuf),
    AbsDirPath(PathBuf),
    Name(Name),
    BoolVec(Vec<bool>),
    U64Vec(Vec<u64>),
    StringVec(Vec<String>),
    PathVec(Vec<PathBuf>),
    DirPathVec(Vec<PathBuf>),
    AbsDirPathVec(Vec<PathBuf>),
    NameVec(Vec<Name>),
    Untyped(Vec<Name>),
}

impl Value {
    /// The value's type; None for untyped.
    pub fn ty(&self) -> Option<ValueType> {
        Some(match self {
            Value::Bool(_) => ValueType::Bool,
            Value::U64(_) => ValueType::U64,
            Value::String(_) => ValueType::String,
            Value::Path(_) => ValueType::Path,
            Value::DirPath(_) => ValueType::DirPath,
            Value::AbsDirPath(_) => ValueType::AbsDirPath,
            Value::Name(_) => ValueType::Name,
            Value::BoolVec(_) => ValueType::BoolVec,
            Value::U64Vec(_) => ValueType::U64Vec,
            Value::StringVec(_) => ValueType::StringVec,
            Value::PathVec(_) => ValueType::PathVec,
            Value::DirPathVec(_) => ValueType::DirPathVec,
            Value::AbsDirPathVec(_) => ValueType::AbsDirPathVec,
            Value::NameVec(_) => ValueType::NameVec,
            Value::Untyped(_) => return None,
        })
    }

    /// An untyped value from a single simple name.
    pub fn from_str_untyped(s: impl Into<String>) -> Self {
        Value::Untyped(vec![Name::simple(s)])
    }

    /// The untyped representation: the value rendered as names. This is
    /// what gets persisted to `config.build`.
    pub fn to_names(&self) -> Vec<Name> {
        match self {
            Value::Bool(b) => vec![Name::simple(if *b { "true" } else { "false" })],
            Value::U64(n) => vec![Name::simple(n.to_string())],
            Value::String(s) => vec![Name::simple(s.clone())],
            Value::Path(p) => vec![Name::simple(p.display().to_string())],
            Value::DirPath(p) | Value::AbsDirPath(p) => vec![Name::from_dir(p.clone())],
            Value::Name(n) => vec![n.clone()],
            Value::BoolVec(v) => {
                v.iter().map(|b| Name::simple(if *b { "true" } else { "false" })).collect()
            }
            Value::U64Vec(v) => v.iter().map(|n| Name::simple(n.to_string())).collect(),
            Value::StringVec(v) => v.iter().map(|s| Name::simple(s.clone())).collect(),
            Value::PathVec(v) => {
                v.iter().map(|p| Name::simple(p.display().to_string())).collect()
            }
            Value::DirPathVec(v) | Value::AbsDirPathVec(v) => {
                v.iter().map(|p| Name::from_dir(p.clone())).collect()
            }
            Value::NameVec(v) | Value::Untyped(v) => v.clone(),
        }
    }

    /// Lexically convert an untyped value to the requested type.
    pub fn convert(names: Vec<Name>, ty: ValueType) -> Result<Value, ValueError> {
        fn simple(n: &Name, ty: ValueType) -> Result<&str, ValueError> {
            if n.is_simple() {
                Ok(&n.value)
            } else {
                Err(ValueError::Conversion { ty, text: n.to_string() })
            }
        }

        fn one(n: &Name, ty: ValueType) -> Result<Value, ValueError> {
            Ok(match ty {
                ValueType::Bool => match simple(n, ty)? {
                    "true" => Value::Bool(true),
                    "false" => Value::Bool(false),
                    other => {
                        return Err(ValueError::Conversion { ty, text: other.to_string() })
                    }
                },
                ValueType::U64 => Value::U64(simple(n, ty)?.parse().map_err(|_| {
                    ValueError::Conversion { ty, text: n.value.clone() }
                })?),
                ValueType::String => Value::String(simple(n, ty)?.to_string()),
                ValueType::Path => {
                    let p = match &n.dir {
                        Some(d) => d.join(&n.value),
                        None => PathBuf::from(&n.value),
                    };
                    Value::Path(p)
                }
                ValueType::DirPath | ValueType::AbsDirPath => {
                    let p = match &n.dir {
                        Some(d) if n.value.is_empty() => d.clone(),
                        Some(d) => d.join(&n.value),
                        None => PathBuf::from(&n.value),
                    };
                    if ty == ValueType::AbsDirPath && !p.is_absolute() {
                        return Err(ValueError::Conversion {
                            ty,
                            text: p.display().to_string(),
                        });
                    }
                    if ty == ValueType::AbsDirPath {
                        Value::AbsDirPath(p)
                    } else {
                        Value::DirPath(p)
                    }
                }
                ValueType::Name => Value::Name(n.clone()),
                _ => unreachable!("vector handled by caller"),
            })
        }

        if let Some(elem) = ty.element() {
            let mut scalars = Vec::with_capacity(names.len());
            for n in &names {
                scalars.push(one(n, elem)?);
            }
            return Ok(match ty {
                ValueType::BoolVec => Value::BoolVec(
                    scalars
                        .into_iter()
                        .map(|v| match v {
                            Value::Bool(b) => b,
                            _ => unreachable!(),
                        })
                        .collect(),
                ),
                ValueType::U64Vec => Value::U64Vec(
                    scalars
                        .into_iter()
                        .map(|v| match v {
                            Value::U64(n) => n,
                            _ => unreachable!(),
                        })
                        .collect(),
                ),
                ValueType::StringVec => Value::StringVec(
                    scalars
                        .into_iter()
                        .map(|v| match v {
                            Value::String(s) => s,
                            _ => unreachable!(),
                        })
                        .collect(),
                ),
                ValueType::PathVec => Value::PathVec(
                    scalars
                        .into_iter()
                        .map(|v| match v {
                            Value::Path(p) => p,
                            _ => unreachable!(),
                        })
                        .collect(),
                ),
                ValueType::DirPathVec => Value::DirPathVec(
                    scalars
                        .into_iter()
                        .map(|v| match v {
                            Value::DirPath(p) => p,
                            _ => unreachable!(),
                        })
                        .collect(),
                ),
                ValueType::AbsDirPathVec => Value::AbsDirPathVec(
                    scalars
                        .into_iter()
                        .map(|v| match v {
                            Value::AbsDirPath(p) => p,
                            _ => unreachable!(),
                        })
                        .collect(),
                ),
                ValueType::NameVec => Value::NameVec(
                    scalars
                        .into_iter()
                        .map(|v| match v {
                            Value::Name(n) => n,
                            _ => unreachable!(),
                        })
                        .collect(),
                ),
                _ => unreachable!(),
            });
        }

        // Scalar: exactly one name.
        match names.len() {
            1 => one(&names[0], ty),
            _ => Err(ValueError::Conversion {
                ty,
                text: names.iter().map(|n| n.to_string()).collect::<Vec<_>>().join(" "),
            }),
        }
    }

    /// Read the value as a bool (typed or lexically).
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            Value::Untyped(names) if names.len() == 1 => match names[0].value.as_str() {
                "true" => Some(true),
                "false" => Some(false),
                _ => None,
            },
            _ => None,
        }
    }

    /// Read the value as a string slice if it is one (typed or a single
    /// simple name).
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            Value::Untyped(names) if names.len() == 1 && names[0].is_simple() => {
                Some(&names[0].value)
            }
            _ => None,
        }
    }

    /// Read the value as a path.
    pub fn as_path(&self) -> Option<PathBuf> {
        match self {
            Value::Path(p) | Value::DirPath(p) | Value::AbsDirPath(p) => Some(p.clone()),
            Value::String(s) => Some(PathBuf::from(s)),
            Value::Untyped(names) if names.len() == 1 => {
                let n = &names[0];
                Some(match &n.dir {
                    Some(d) if n.value.is_empty() => d.clone(),
                    Some(d) => d.join(&n.value),
                    None => PathBuf::from(&n.value),
                })
            }
            _ => None,
        }
    }

    /// The names as a list of strings, for option-list variables.
    pub fn as_strings(&self) -> Vec<String> {
        self.to_names().iter().map(|n| n.to_string()).collect()
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names = self.to_names();
        for (i, n) in names.iter().enumerate() {
            if i > 0 {
                write!(f, " ")?;
            }
            write!(f, "{}", n)?;
        }
        Ok(())
    }
}

/// Where a variable is visible.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Visibility {
    #[default]
    Global,
    Project,
    Scope,
    Target,
}

/// A variable: a pooled name plus typing and lookup semantics. The type,
/// once set, is permanent.
#[derive(Debug)]
pub struct Variable {
    pub name: Symbol,
    ty: OnceLock<ValueType>,
    pub visibility: Visibility,
    pub overridable: bool,
}

impl Variable {
    pub fn ty(&self) -> Option<ValueType> {
        self.ty.get().copied()
    }
}

/// The process-wide variable pool. Insertion is idempotent by name;
/// redeclaration can widen an untyped variable to a typed one but never
/// replace a type.
#[derive(Default)]
pub struct VarPool {
    map: RwLock<HashMap<Symbol, Arc<Variable>>>,
}

impl VarPool {
    pub fn new() -> Self {
        VarPool::default()
    }

    /// Insert or find a variable.
    pub fn insert(
        &self,
        name: impl Into<Symbol>,
        ty: Option<ValueType>,
        visibility: Visibility,
        overridable: bool,
    ) -> Result<Arc<Variable>, ValueError> {
        let name = name.into();

        {
            let map = self.map.read().unwrap();
            if let Some(var) = map.get(&name) {
                if let Some(ty) = ty {
                    match var.ty.get() {
                        None => {
                            // Widening to the declared type.
                            let _ = var.ty.set(ty);
                        }
                        Some(&existing) if existing != ty => {
                            return Err(ValueError::TypeConflict {
                                name,
                                declared: existing,
                                requested: ty,
                            });
                        }
                        _ => {}
                    }
                }
                return Ok(var.clone());
            }
        }

        let mut map = self.map.write().unwrap();
        let var = map.entry(name).or_insert_with(|| {
            Arc::new(Variable {
                name,
                ty: OnceLock::new(),
                visibility,
                overridable,
            })
        });
        if let Some(ty) = ty {
            if let Some(&existing) = var.ty.get() {
                if existing != ty {
                    return Err(ValueError::TypeConflict {
                        name,
                        declared: existing,
                        requested: ty,
                    });
                }
            } else {
                let _ = var.ty.set(ty);
            }
        }
        Ok(var.clone())
    }

    /// Find an existing variable.
    pub fn find(&self, name: &str) -> Option<Arc<Variable>> {
        self.map.read().unwrap().get(name).cloned()
    }

    /// Insert with default (untyped, global, non-overridable) semantics.
    pub fn insert_plain(&self, name: impl Into<Symbol>) -> Arc<Variable> {
        self.insert(name, None, Visibility::Global, false)
            .expect("untyped insertion cannot conflict")
    }

    pub fn clear(&self) {
        self.map.write().unwrap().clear();
    }
}

/// A map entry: the value (None for `name =`, explicitly undefined), the
/// load generation it was created in, and how it got there.
#[derive(Debug, Clone)]
pub struct VarEntry {
    pub value: Option<Value>,
    pub generation: usize,
    /// Set when the entry came from a command-line override.
    pub from_override: bool,
    appended: bool,
    prepended: bool,
}

/// A variable map, attached to a scope or a target.
#[derive(Debug, Default)]
pub struct VariableMap {
    entries: BTreeMap<Symbol, VarEntry>,
}

impl VariableMap {
    pub fn new() -> Self {
        VariableMap::default()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&VarEntry> {
        self.entries.get(name)
    }

    pub fn value(&self, name: &str) -> Option<&Value> {
        self.entries.get(name).and_then(|e| e.value.as_ref())
    }

    /// Iterate entries whose variable name lives in `ns.` (for saving the
    /// `config.*` namespace).
    pub fn namespace<'a>(
        &'a self,
        ns: &'a str,
    ) -> impl Iterator<Item = (Symbol, &'a VarEntry)> + 'a {
        let prefix = format!("{}.", ns);
        self.entries
            .iter()
            .filter(move |(k, _)| k.starts_with(&prefix))
            .map(|(k, e)| (*k, e))
    }

    fn coerce(var: &Variable, value: Value) -> Result<Value, ValueError> {
        match (var.ty(), value.ty()) {
            (Some(want), None) => {
                let Value::Untyped(names) = value else { unreachable!() };
                Value::convert(names, want)
            }
            (Some(want), Some(have)) if want != have => {
                Err(ValueError::Mismatch { name: var.name, actual: have, expected: want })
            }
            _ => Ok(value),
        }
    }

    /// Assign, replacing any existing value.
    pub fn assign(
        &mut self,
        var: &Variable,
        value: Option<Value>,
        generation: usize,
    ) -> Result<&mut VarEntry, ValueError> {
        let value = value.map(|v| Self::coerce(var, v)).transpose()?;
        let entry = self.entries.entry(var.name).or_insert(VarEntry {
            value: None,
            generation,
            from_override: false,
            appended: false,
            prepended: false,
        });
        entry.value = value;
        entry.from_override = false;
        entry.appended = false;
        entry.prepended = false;
        Ok(entry)
    }

    /// Assign marking the entry as a command-line override.
    pub fn assign_override(
        &mut self,
        var: &Variable,
        value: Option<Value>,
        generation: usize,
    ) -> Result<&mut VarEntry, ValueError> {
        let entry = self.assign(var, value, generation)?;
        entry.from_override = true;
        Ok(entry)
    }

    /// Append to the existing value (or assign if absent).
    pub fn append(
        &mut self,
        var: &Variable,
        value: Value,
        generation: usize,
    ) -> Result<(), ValueError> {
        self.combine(var, value, generation, false)
    }

    /// Prepend to the existing value (or assign if absent).
    pub fn prepend(
        &mut self,
        var: &Variable,
        value: Value,
        generation: usize,
    ) -> Result<(), ValueError> {
        self.combine(var, value, generation, true)
    }

    fn combine(
        &mut self,
        var: &Variable,
        value: Value,
        generation: usize,
        front: bool,
    ) -> Result<(), ValueError> {
        let value = Self::coerce(var, value)?;

        let Some(entry) = self.entries.get_mut(&var.name) else {
            let e = self.assign(var, Some(value), generation)?;
            if front {
                e.prepended = true;
            } else {
                e.appended = true;
            }
            return Ok(());
        };

        // A value stomped on from the command line can absorb appends or
        // prepends, but not an inconsistent mix of the two.
        if entry.from_override {
            if (front && entry.appended) || (!front && entry.prepended) {
                return Err(ValueError::OverrideMix { name: var.name });
            }
        }

        let existing = entry.value.take();
        entry.value = Some(match existing {
            None => value,
            Some(old) => combine_values(var, old, value, front)?,
        });
        if front {
            entry.prepended = true;
        } else {
            entry.appended = true;
        }
        Ok(())
    }
}

fn combine_values(
    var: &Variable,
    old: Value,
    new: Value,
    front: bool,
) -> Result<Value, ValueError> {
    fn splice<T>(mut old: Vec<T>, new: Vec<T>, front: bool) -> Vec<T> {
        if front {
            let mut v = new;
            v.extend(old);
            v
        } else {
            old.extend(new);
            old
        }
    }

    let op: &'static str = if front { "prepend" } else { "append" };

    Ok(match (old, new) {
        (Value::Untyped(a), Value::Untyped(b)) => Value::Untyped(splice(a, b, front)),
        (Value::String(a), Value::String(b)) => {
            Value::String(if front { format!("{}{}", b, a) } else { format!("{}{}", a, b) })
        }
        (Value::BoolVec(a), Value::BoolVec(b)) => Value::BoolVec(splice(a, b, front)),
        (Value::U64Vec(a), Value::U64Vec(b)) => Value::U64Vec(splice(a, b, front)),
        (Value::StringVec(a), Value::StringVec(b)) => Value::StringVec(splice(a, b, front)),
        (Value::PathVec(a), Value::PathVec(b)) => Value::PathVec(splice(a, b, front)),
        (Value::DirPathVec(a), Value::DirPathVec(b)) => {
            Value::DirPathVec(splice(a, b, front))
        }
        (Value::AbsDirPathVec(a), Value::AbsDirPathVec(b)) => {
            Value::AbsDirPathVec(splice(a, b, front))
        }
        (Value::NameVec(a), Value::NameVec(b)) => Value::NameVec(splice(a, b, front)),
        (old, _) => {
            return Err(ValueError::BadCombine {
                op,
                ty: old.ty().map(|t| t.name()).unwrap_or("untyped"),
                name: var.name,
            })
        }
    })
}

/// How a command-line override modifies the variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverrideKind {
    Assign,
    Append,
    Prepend,
}

/// A command-line variable override; shadows project values on lookup.
#[derive(Debug, Clone)]
pub struct VariableOverride {
    pub name: Symbol,
    pub kind: OverrideKind,
    pub value: Vec<Name>,
}

impl VariableOverride {
    /// Parse a `name=value`, `name+=value`, or `name=+value` override
    /// (newline entries of `BUILD2_VAR_OVR` and buildspec-adjacent
    /// arguments).
    pub fn parse(s: &str) -> Option<Self> {
        let eq = s.find('=')?;
        let (mut name, mut rest) = (&s[..eq], &s[eq + 1..]);

        let kind = if let Some(stripped) = name.strip_suffix('+') {
            name = stripped;
            OverrideKind::Append
        } else if let Some(stripped) = rest.strip_prefix('+') {
            rest = stripped;
            OverrideKind::Prepend
        } else {
            OverrideKind::Assign
        };

        let name = name.trim();
        if name.is_empty() {
            return None;
        }

        let value = rest
            .split_whitespace()
            .map(Name::simple)
            .collect();

        Some(VariableOverride { name: Symbol::new(name), kind, value })
    }
}
