//! Prerequisites: declared dependency edges, resolved to concrete targets
//! at match time.

use std::fmt;
use std::path::PathBuf;

use crate::util::Symbol;

/// A declared desire, in a scope, for a target of a type in a directory
/// with a name. Qualified references (`project%type{name}`) go through
/// import at resolution time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prerequisite {
    /// Optional project qualifier for imported references.
    pub project: Option<Symbol>,
    /// Target type name.
    pub ty: Symbol,
    /// Directory, relative to the declaring scope unless absolute.
    pub dir: PathBuf,
    /// Simple name.
    pub name: Symbol,
    /// Optional explicit extension.
    pub ext: Option<Symbol>,
}

impl Prerequisite {
    pub fn new(ty: Symbol, dir: impl Into<PathBuf>, name: Symbol) -> Self {
        Prerequisite { project: None, ty, dir: dir.into(), name, ext: None }
    }

    pub fn with_ext(mut self, ext: Symbol) -> Self {
        self.ext = Some(ext);
        self
    }

    pub fn imported(mut self, project: Symbol) -> Self {
        self.project = Some(project);
        self
    }
}

impl fmt::Display for Prerequisite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(p) = self.project {
            write!(f, "{}%", p)?;
        }
        if !self.dir.as_os_str().is_empty() {
            write!(f, "{}/", self.dir.display())?;
        }
        write!(f, "{}{{{}", self.ty, self.name)?;
        if let Some(e) = self.ext {
            write!(f, ".{}", e)?;
        }
        write!(f, "}}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        let p = Prerequisite::new(Symbol::new("gen"), "sub", Symbol::new("foo"));
        assert_eq!(p.to_string(), "sub/gen{foo}");

        let p = Prerequisite::new(Symbol::new("hxx"), "", Symbol::new("foo"))
            .with_ext(Symbol::new("hpp"));
        assert_eq!(p.to_string(), "hxx{foo.hpp}");

        let p = Prerequisite::new(Symbol::new("lib"), "", Symbol::new("core"))
            .imported(Symbol::new("extras"));
        assert_eq!(p.to_string(), "extras%lib{core}");
    }
}
