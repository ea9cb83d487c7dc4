//! Buildspec parsing.
//!
//! ```text
//! buildspec   := (meta-op-spec)*
//! meta-op-spec:= op-spec | NAME'('op-spec+')'
//! op-spec     := targets | NAME'('targets')'
//! targets     := target (' ' target)*
//! target      := [src-base'@']TYPE'{' NAME ('/' NAME)* '}'
//! ```
//!
//! Bare directory paths (`proj/`) and bare names are also accepted as
//! targets: a trailing slash names the directory's default alias, a bare
//! name the `alias{}` of that name.

use std::path::PathBuf;

use anyhow::{bail, Result};

use crate::util::Symbol;

/// One parsed target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetSpec {
    /// `src-base@` qualifier for out-of-source builds.
    pub src_base: Option<PathBuf>,
    /// Explicit target type; None for bare paths.
    pub ty: Option<Symbol>,
    /// Directory part (possibly empty, relative to the cwd).
    pub dir: PathBuf,
    /// Simple name; empty names the directory itself.
    pub name: Symbol,
}

/// One operation with its targets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpSpec {
    pub name: String,
    pub targets: Vec<TargetSpec>,
}

/// One meta-operation batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetaOpSpec {
    pub name: String,
    pub operations: Vec<OpSpec>,
}

/// Parse a buildspec. `is_meta` decides whether a `NAME(...)` opens a
/// meta-operation or an operation.
pub fn parse(spec: &str, is_meta: impl Fn(&str) -> bool) -> Result<Vec<MetaOpSpec>> {
    let mut cur = Cursor::new(spec);
    let mut batches: Vec<MetaOpSpec> = Vec::new();

    cur.skip_ws();
    while !cur.eof() {
        let mark = cur.pos();
        let word = cur.take_word();

        if !word.is_empty() && cur.peek() == Some('(') && is_meta(&word) {
            cur.next(); // '('
            let mut operations = Vec::new();
            loop {
                cur.skip_ws();
                if cur.peek() == Some(')') {
                    cur.next();
                    break;
                }
                if cur.eof() {
                    bail!("unbalanced '(' in buildspec after '{}'", word);
                }
                operations.push(parse_op_spec(&mut cur)?);
            }
            if operations.is_empty() {
                bail!("meta-operation '{}' without operations", word);
            }
            batches.push(MetaOpSpec { name: word, operations });
        } else {
            // Not a meta-operation: re-parse as an op-spec and wrap it in
            // the default meta-operation.
            cur.reset(mark);
            let op = parse_op_spec(&mut cur)?;
            batches.push(MetaOpSpec { name: "perform".to_string(), operations: vec![op] });
        }

        cur.skip_ws();
    }

    if batches.is_empty() {
        // No buildspec: perform the default operation on the current
        // directory.
        batches.push(MetaOpSpec {
            name: "perform".to_string(),
            operations: vec![OpSpec {
                name: "default".to_string(),
                targets: vec![TargetSpec {
                    src_base: None,
                    ty: None,
                    dir: PathBuf::from("."),
                    name: Symbol::empty(),
                }],
            }],
        });
    }

    Ok(batches)
}

fn parse_op_spec(cur: &mut Cursor) -> Result<OpSpec> {
    cur.skip_ws();
    let mark = cur.pos();
    let word = cur.take_word();

    if !word.is_empty() && cur.peek() == Some('(') {
        cur.next(); // '('
        let mut targets = Vec::new();
        loop {
            cur.skip_ws();
            if cur.peek() == Some(')') {
                cur.next();
                break;
            }
            if cur.eof() {
                bail!("unbalanced '(' in buildspec after '{}'", word);
            }
            targets.push(parse_target(cur)?);
        }
        if targets.is_empty() {
            bail!("operation '{}' without targets", word);
        }
        return Ok(OpSpec { name: word, targets });
    }

    // Bare targets: the default operation.
    cur.reset(mark);
    let mut targets = Vec::new();
    loop {
        cur.skip_ws();
        match cur.peek() {
            None | Some(')') => break,
            Some(_) => {
                let before = cur.pos();
                // A following NAME( belongs to the next spec.
                let word = cur.take_word();
                if !word.is_empty() && cur.peek() == Some('(') {
                    cur.reset(before);
                    break;
                }
                cur.reset(before);
                targets.push(parse_target(cur)?);
            }
        }
    }

    if targets.is_empty() {
        bail!("expected target in buildspec");
    }
    Ok(OpSpec { name: "default".to_string(), targets })
}

fn parse_target(cur: &mut Cursor) -> Result<TargetSpec> {
    cur.skip_ws();

    let mut src_base = None;
    let mut token = cur.take_word();
    if token.is_empty() {
        bail!("expected target in buildspec");
    }

    // src-base qualifier.
    if cur.peek() == Some('@') {
        cur.next();
        src_base = Some(PathBuf::from(token));
        token = cur.take_word();
        if token.is_empty() && cur.peek() != Some('{') {
            bail!("expected target after '@' in buildspec");
        }
    }

    if cur.peek() == Some('{') {
        // TYPE{NAME(/NAME)*}
        cur.next();
        let inner = cur.take_until('}')?;
        cur.next(); // '}'

        let (ty_dir, ty) = split_type(&token);
        let path = PathBuf::from(inner.trim());
        let (mut dir, name) = split_dir_name(&path);
        if let Some(td) = ty_dir {
            dir = td.join(dir);
        }

        return Ok(TargetSpec { src_base, ty: Some(Symbol::new(ty)), dir, name });
    }

    // Bare path: trailing slash names the directory.
    if token.ends_with('/') {
        return Ok(TargetSpec {
            src_base,
            ty: None,
            dir: PathBuf::from(token),
            name: Symbol::empty(),
        });
    }

    let path = PathBuf::from(&token);
    let (dir, name) = split_dir_name(&path);
    Ok(TargetSpec { src_base, ty: None, dir, name })
}

/// Split `dir/type` into the optional dir and the type name.
fn split_type(token: &str) -> (Option<PathBuf>, String) {
    match token.rsplit_once('/') {
        Some((dir, ty)) => (Some(PathBuf::from(dir)), ty.to_string()),
        None => (None, token.to_string()),
    }
}

fn split_dir_name(path: &std::path::Path) -> (PathBuf, Symbol) {
    let name = path
        .file_name()
        .map(|n| Symbol::new(n.to_string_lossy()))
        .unwrap_or_default();
    let dir = path.parent().map(|p| p.to_path_buf()).unwrap_or_default();
    (dir, name)
}

struct Cursor {
    chars: Vec<char>,
    i: usize,
}

impl Cursor {
    fn new(s: &str) -> Self {
        Cursor { chars: s.chars().collect(), i: 0 }
    }

    fn eof(&self) -> bool {
        self.i >= self.chars.len()
    }

    fn pos(&self) -> usize {
        self.i
    }

    fn reset(&mut self, i: usize) {
        self.i = i;
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.i).copied()
    }

    fn next(&mut self) -> Option<char> {
        let c = self.peek();
        if c.is_some() {
            self.i += 1;
        }
        c
    }

    fn skip_ws(&mut self) {
        while matches!(self.peek(), Some(c) if c.is_whitespace()) {
            self.i += 1;
        }
    }

    /// A word: everything up to whitespace or one of `( ) { @`.
    fn take_word(&mut self) -> String {
        let mut out = String::new();
        while let Some(c) = self.peek() {
            if c.is_whitespace() || matches!(c, '(' | ')' | '{' | '}' | '@') {
                break;
            }
            out.push(c);
            self.i += 1;
        }
        out
    }

    fn take_until(&mut self, end: char) -> Result<String> {
        let mut out = String::new();
        while let Some(c) = self.peek() {
            if c == end {
                return Ok(out);
            }
            out.push(c);
            self.i += 1;
        }
        bail!("expected '{}' in buildspec", end)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn is_meta(name: &str) -> bool {
        matches!(name, "perform" | "configure" | "disfigure" | "dist" | "info")
    }

    #[test]
    fn test_empty_is_default_everything() {
        let batches = parse("", is_meta).unwrap();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].name, "perform");
        assert_eq!(batches[0].operations[0].name, "default");
        assert_eq!(batches[0].operations[0].targets[0].dir, PathBuf::from("."));
    }

    #[test]
    fn test_bare_dir_target() {
        let batches = parse("proj/", is_meta).unwrap();
        let t = &batches[0].operations[0].targets[0];
        assert_eq!(t.dir, PathBuf::from("proj/"));
        assert!(t.name.is_empty());
        assert!(t.ty.is_none());
    }

    #[test]
    fn test_operation_with_typed_target() {
        let batches = parse("update(exe{hello})", is_meta).unwrap();
        assert_eq!(batches[0].name, "perform");
        let op = &batches[0].operations[0];
        assert_eq!(op.name, "update");
        let t = &op.targets[0];
        assert_eq!(t.ty, Some(Symbol::new("exe")));
        assert_eq!(t.name, "hello");
    }

    #[test]
    fn test_meta_with_nested_operations() {
        let batches = parse("perform(update(foo) clean(bar))", is_meta).unwrap();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].operations.len(), 2);
        assert_eq!(batches[0].operations[0].name, "update");
        assert_eq!(batches[0].operations[1].name, "clean");
    }

    #[test]
    fn test_target_with_dir_components() {
        let batches = parse("update(gen{sub/dir/foo})", is_meta).unwrap();
        let t = &batches[0].operations[0].targets[0];
        assert_eq!(t.dir, PathBuf::from("sub/dir"));
        assert_eq!(t.name, "foo");
    }

    #[test]
    fn test_src_base_qualifier() {
        let batches = parse("configure(/src/proj@/out/proj/)", is_meta).unwrap();
        let t = &batches[0].operations[0].targets[0];
        assert_eq!(t.src_base, Some(PathBuf::from("/src/proj")));
        assert_eq!(t.dir, PathBuf::from("/out/proj/"));
    }

    #[test]
    fn test_multiple_batches() {
        let batches = parse("configure(proj/) perform(update(proj/))", is_meta).unwrap();
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].name, "configure");
        assert_eq!(batches[1].name, "perform");
    }

    #[test]
    fn test_multiple_bare_targets() {
        let batches = parse("update(foo bar baz)", is_meta).unwrap();
        assert_eq!(batches[0].operations[0].targets.len(), 3);
    }

    #[test]
    fn test_unbalanced_paren_is_error() {
        assert!(parse("update(foo", is_meta).is_err());
        assert!(parse("perform(update(foo)", is_meta).is_err());
    }

    #[test]
    fn test_unknown_name_paren_is_operation() {
        // An unknown NAME( is an operation of the default meta-operation.
        let batches = parse("frobnicate(foo)", is_meta).unwrap();
        assert_eq!(batches[0].name, "perform");
        assert_eq!(batches[0].operations[0].name, "frobnicate");
    }
}
