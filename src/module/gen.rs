//! The gen module: a source-generator with a group target.
//!
//! A `gen{foo}` group is realized from a `in{foo}` source by running the
//! configured generator tool (`config.gen`), producing the member targets
//! `hxx{foo}` and `cxx{foo}`, plus `ixx{foo}` unless the
//! `--suppress-inline` option is present in `gen.options`. Matching any
//! member links it up to the group and defers to the group's recipe.

use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};

use crate::build::{executor, matcher};
use crate::core::action::Action;
use crate::core::rule::{MatchOutcome, Recipe, Rule};
use crate::core::scope::Scope;
use crate::core::target::{Target, TargetId, TargetKey, TargetKind, TargetState, TargetType};
use crate::engine::Engine;
use crate::module::{ConfigHints, Module};
use crate::ops::{OP_CLEAN, OP_DEFAULT, OP_UPDATE};
use crate::util::diagnostic::{text, verbosity, Location};
use crate::util::Symbol;

pub struct GenModule;

impl Module for GenModule {
    fn name(&self) -> &'static str {
        "gen"
    }

    fn boot(&self, engine: &Engine, _root: &Arc<Scope>, _loc: &Location) -> Result<()> {
        // config.gen must be declared before buildfiles can read it.
        engine
            .var_pool
            .insert("config.gen", None, crate::core::variable::Visibility::Project, true)?;
        engine
            .var_pool
            .insert("gen.options", None, crate::core::variable::Visibility::Project, false)?;
        Ok(())
    }

    fn init(
        &self,
        engine: &Engine,
        root: &Arc<Scope>,
        _base: &Arc<Scope>,
        _first: bool,
        optional: bool,
        _hints: &ConfigHints,
    ) -> Result<bool> {
        if engine.value_of(root.id, None, "config.gen").is_none() {
            if optional {
                return Ok(false);
            }
            return Err(anyhow!("config.gen is not set; configure the generator tool"));
        }

        let file = Symbol::new("file");
        root.register_target_type(TargetType::new("gen", TargetKind::Group));
        root.register_target_type(
            TargetType::new("hxx", TargetKind::File).derived(file).with_ext("hxx"),
        );
        root.register_target_type(
            TargetType::new("cxx", TargetKind::File).derived(file).with_ext("cxx"),
        );
        root.register_target_type(
            TargetType::new("ixx", TargetKind::File).derived(file).with_ext("ixx"),
        );
        root.register_target_type(
            TargetType::new("in", TargetKind::File).derived(file).with_ext("in"),
        );

        let rule: Arc<dyn Rule> = Arc::new(GenRule);
        let mut rules = root.rules().write().unwrap();
        for ty in ["gen", "hxx", "cxx", "ixx"] {
            rules.insert(OP_DEFAULT, Symbol::new(ty), "gen.compile", rule.clone());
        }

        Ok(true)
    }
}

/// The generator's compile rule, handling both the group and its members.
pub struct GenRule;

impl Rule for GenRule {
    fn name(&self) -> &'static str {
        "gen.compile"
    }

    fn matches(&self, e: &Engine, a: Action, t: &Arc<Target>, _: &str) -> Result<MatchOutcome> {
        if t.is("gen") {
            self.match_group(e, t)
        } else {
            self.match_member(e, a, t)
        }
    }

    fn apply(&self, e: &Engine, a: Action, t: &Arc<Target>, m: &MatchOutcome) -> Result<Recipe> {
        let shared = e.shared();

        if t.is("gen") {
            // Derive file names for the members.
            for member in members(e, t) {
                matcher::derive_path(e, &member, None);
            }

            // Inject a dependency on the output directory.
            matcher::inject_parent_dir(&shared, a, t)?;

            matcher::search_and_match_prerequisites(&shared, a, t)?;

            return Ok(match a.operation {
                OP_UPDATE => Recipe::custom(perform_update),
                OP_CLEAN => Recipe::custom(perform_clean),
                _ => Recipe::Default,
            });
        }

        // A member: make sure the group is matched and defer to it.
        let MatchOutcome::MatchWith(gid) = *m else {
            return Err(anyhow!("member {} matched without a group", t));
        };
        matcher::match_target(&shared, a, gid)?;
        Ok(Recipe::Group)
    }
}

impl GenRule {
    /// The `gen{}` group: match on a `in{}` prerequisite with the same
    /// stem, and fix the member list (no further changes to gen.options
    /// are possible at this point).
    fn match_group(&self, e: &Engine, t: &Arc<Target>) -> Result<MatchOutcome> {
        let mut source: Option<TargetId> = None;

        for p in t.prerequisites() {
            if p.ty != "in" {
                continue;
            }
            if p.name != t.key.name {
                tracing::debug!(".in file stem '{}' doesn't match target {}", p.name, t);
                return Ok(MatchOutcome::None);
            }
            source = Some(matcher::search(e, t, &p)?);
            break;
        }

        let Some(source) = source else {
            tracing::debug!("no .in source file for target {}", t);
            return Ok(MatchOutcome::None);
        };

        if t.first_member().is_none() {
            let h = insert_member(e, t, "hxx");
            let c = insert_member(e, t, "cxx");
            h.set_next_member(c.id);

            if !suppress_inline(e, t) {
                let i = insert_member(e, t, "ixx");
                c.set_next_member(i.id);
            }

            t.set_first_member(h.id);
        }

        Ok(MatchOutcome::MatchWith(source))
    }

    /// One of the `?xx{}` members.
    fn match_member(&self, e: &Engine, a: Action, t: &Arc<Target>) -> Result<MatchOutcome> {
        // Already linked up to a group? Some other group means we are
        // definitely not a match.
        if let Some(gid) = t.group() {
            let g = e.targets.get(gid);
            return Ok(if g.is("gen") { MatchOutcome::MatchWith(gid) } else { MatchOutcome::None });
        }

        // A corresponding gen{} group?
        let mut group = e
            .targets
            .find_unqualified(Symbol::new("gen"), &t.key.out_dir, t.key.name)
            .map(|g| g.id);

        // If not, but this member has a in{} prerequisite with a matching
        // stem, synthesize the group.
        if group.is_none() {
            for p in t.prerequisites() {
                if p.ty != "in" {
                    continue;
                }
                if p.name == t.key.name {
                    let (g, _) = e.targets.insert(
                        TargetKey::new(Symbol::new("gen"), t.key.out_dir.clone(), t.key.name),
                        e.load_generation(),
                    );
                    g.add_prerequisite(p.clone());
                    group = Some(g.id);
                } else {
                    tracing::debug!(".in file stem '{}' doesn't match target {}", p.name, t);
                }
                break;
            }
        }

        let Some(gid) = group else {
            return Ok(MatchOutcome::None);
        };

        // Resolve the group's members; this links us up.
        let shared = e.shared();
        matcher::resolve_group_members(&shared, a, gid)?;

        let g = e.targets.get(gid);
        if g.executed_state() == Some(TargetState::Failed) {
            return Ok(MatchOutcome::None);
        }

        // For ixx{}, verify it is part of the group.
        if t.is("ixx") && !members(e, &g).iter().any(|m| m.id == t.id) {
            tracing::debug!("generation of inline file {} is disabled with --suppress-inline", t);
            return Ok(MatchOutcome::None);
        }

        Ok(if t.group() == Some(gid) {
            MatchOutcome::MatchWith(gid)
        } else {
            MatchOutcome::None
        })
    }
}

fn insert_member(e: &Engine, group: &Arc<Target>, ty: &str) -> Arc<Target> {
    let (m, _) = e.targets.insert(
        TargetKey::new(Symbol::new(ty), group.key.out_dir.clone(), group.key.name),
        e.load_generation(),
    );
    m.set_group(group.id);
    m
}

/// The group's members in declaration order (hxx, cxx[, ixx]).
fn members(e: &Engine, group: &Arc<Target>) -> Vec<Arc<Target>> {
    let mut out = Vec::new();
    let mut cur = group.first_member();
    while let Some(id) = cur {
        let m = e.targets.get(id);
        cur = m.next_member();
        out.push(m);
    }
    out
}

fn suppress_inline(e: &Engine, t: &Arc<Target>) -> bool {
    let scope = e.scopes.scope_of(&t.key.out_dir);
    e.value_of(scope.id, Some(t.as_ref()), "gen.options")
        .map(|v| v.to_names().iter().any(|n| n.value == "--suppress-inline"))
        .unwrap_or(false)
}

/// The group is out of date if any member is missing or older than the
/// newest prerequisite; the group's effective mtime is its oldest
/// member's.
fn group_mtime(e: &Engine, group: &Arc<Target>) -> Result<Option<std::time::SystemTime>> {
    let mut oldest = None;
    for m in members(e, group) {
        match m.mtime()? {
            None => return Ok(None),
            Some(t) => oldest = Some(oldest.map_or(t, |o: std::time::SystemTime| o.min(t))),
        }
    }
    Ok(oldest)
}

/// The generator invocation for one group: member suffix overrides, the
/// user's `gen.options`, the output directory, and the source file, in
/// that order.
struct GenCommand {
    tool: PathBuf,
    args: Vec<String>,
}

impl GenCommand {
    /// Resolve the configured tool: a bare name is looked up in PATH, a
    /// path is taken as given.
    fn resolve(tool: &Path) -> Result<PathBuf> {
        if tool.components().count() > 1 {
            return Ok(tool.to_path_buf());
        }
        which::which(tool)
            .with_context(|| format!("unable to find generator {} in PATH", tool.display()))
    }

    fn new(tool: PathBuf) -> Self {
        GenCommand { tool, args: Vec::new() }
    }

    /// A `--?xx-suffix` override for a member whose extension deviates
    /// from the default. The generator wants the leading dot.
    fn suffix(&mut self, option: &str, ext: &str) {
        self.args.push(option.to_string());
        self.args.push(format!(".{}", ext));
    }

    fn options(&mut self, opts: impl IntoIterator<Item = String>) {
        self.args.extend(opts);
    }

    fn output(&mut self, dir: &Path) {
        self.args.push("-o".to_string());
        self.args.push(dir.display().to_string());
    }

    fn source(&mut self, src: &Path) {
        self.args.push(src.display().to_string());
    }

    /// The full command line, for `-v 2` output and failure diagnostics.
    fn render(&self) -> String {
        let mut parts = vec![self.tool.display().to_string()];
        parts.extend(self.args.iter().cloned());
        parts.join(" ")
    }

    /// Run the generator, failing on a non-zero exit with its stderr
    /// attached. Runs with no engine locks held; the scheduler sees the
    /// child as part of this active task.
    fn run(&self) -> Result<()> {
        let output = Command::new(&self.tool)
            .args(&self.args)
            .stdin(Stdio::null())
            .output()
            .with_context(|| format!("unable to execute {}", self.tool.display()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!(
                "{} exited with code {:?}\n{}",
                self.render(),
                output.status.code(),
                stderr.trim_end()
            );
        }
        Ok(())
    }
}

fn perform_update(e: &Engine, a: Action, id: TargetId) -> Result<TargetState> {
    let shared = e.shared();
    let t = e.targets.get(id);

    // Execute prerequisites and check if we are out of date.
    let mtime = group_mtime(e, &t)?;
    if executor::execute_prerequisites(&shared, a, &t, mtime)?.is_none() {
        return Ok(TargetState::Unchanged);
    }

    let source = t
        .prerequisite_targets()
        .iter()
        .map(|&pid| e.targets.get(pid))
        .find(|p| p.is("in"))
        .ok_or_else(|| anyhow!("no in{{}} source for {}", t))?;
    let source_path = source
        .path()
        .ok_or_else(|| anyhow!("no path for source {}", source))?;

    let scope = e.scopes.scope_of(&t.key.out_dir);
    let root = e
        .scopes
        .root_of(scope.id)
        .ok_or_else(|| anyhow!("out of project target {}", t))?;

    let tool = e
        .value_of(root.id, None, "config.gen")
        .and_then(|v| v.as_path())
        .ok_or_else(|| anyhow!("config.gen is not set"))?;

    let mut cmd = GenCommand::new(GenCommand::resolve(&tool)?);

    for m in members(e, &t) {
        let (option, default) = match m.key.ty.as_str() {
            "hxx" => ("--hxx-suffix", "hxx"),
            "cxx" => ("--cxx-suffix", "cxx"),
            _ => ("--ixx-suffix", "ixx"),
        };
        if let Some(ext) = m.key.ext {
            if ext != default {
                cmd.suffix(option, &ext);
            }
        }
    }

    if let Some(v) = e.value_of(scope.id, Some(t.as_ref()), "gen.options") {
        cmd.options(v.as_strings());
    }

    cmd.output(&t.key.out_dir);
    cmd.source(&source_path);

    if verbosity() >= 2 {
        text(2, cmd.render());
    } else {
        text(
            1,
            format!(
                "gen {}",
                source_path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default()
            ),
        );
    }

    if e.dry_run {
        return Ok(TargetState::Changed);
    }

    cmd.run()?;
    Ok(TargetState::Changed)
}

fn perform_clean(e: &Engine, a: Action, id: TargetId) -> Result<TargetState> {
    let shared = e.shared();
    let t = e.targets.get(id);

    // The reverse order of update: first delete the member files, then
    // clean prerequisites.
    let mut removed = false;
    for m in members(e, &t).iter().rev() {
        if let Some(p) = m.path() {
            if !e.dry_run && crate::util::fs::rmfile(&p)? {
                text(1, format!("rm {}", p.display()));
                removed = true;
            }
        }
    }

    let mut ts =
        if removed { TargetState::Changed } else { TargetState::Unchanged };
    ts |= executor::reverse_execute_prerequisites(&shared, a, &t);
    Ok(ts)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_argument_order() {
        let mut cmd = GenCommand::new(PathBuf::from("/opt/genc"));
        cmd.suffix("--hxx-suffix", "hpp");
        cmd.options(vec!["--fast".to_string(), "--suppress-inline".to_string()]);
        cmd.output(Path::new("/out/proj"));
        cmd.source(Path::new("/src/proj/foo.in"));

        assert_eq!(
            cmd.render(),
            "/opt/genc --hxx-suffix .hpp --fast --suppress-inline -o /out/proj /src/proj/foo.in"
        );
    }

    #[test]
    fn test_resolve_keeps_paths() {
        let p = GenCommand::resolve(Path::new("/opt/tools/genc")).unwrap();
        assert_eq!(p, PathBuf::from("/opt/tools/genc"));

        let p = GenCommand::resolve(Path::new("tools/genc")).unwrap();
        assert_eq!(p, PathBuf::from("tools/genc"));
    }

    #[test]
    fn test_run_reports_failing_tool() {
        let cmd = GenCommand::new(PathBuf::from("false"));
        let err = cmd.run().unwrap_err();
        assert!(err.to_string().contains("false"));
    }
}
