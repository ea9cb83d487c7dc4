//! End-to-end engine scenarios: serial chains, mid-match regeneration,
//! keep-going, group membership, and reentrant waits, driven through the
//! library API with test rules standing in for language modules.

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};

use slipway::build::{executor, matcher};
use slipway::core::action::OperationInfo;
use slipway::core::prerequisite::Prerequisite;
use slipway::core::rule::{MatchOutcome, Recipe, Rule};
use slipway::core::target::{Target, TargetId, TargetKey, TargetKind, TargetState, TargetType};
use slipway::core::Action;
use slipway::engine::{Engine, EngineConfig};
use slipway::ops::{MID_PERFORM, OP_CLEAN, OP_DEFAULT};
use slipway::phase::RunPhase;
use slipway::util::fs;
use slipway::util::interning::Symbol;
use tempfile::TempDir;

fn engine(max_active: usize, keep_going: bool) -> Arc<Engine> {
    Engine::new(EngineConfig {
        max_active,
        keep_going,
        dry_run: false,
        overrides: Vec::new(),
        work_dir: std::env::current_dir().unwrap(),
    })
}

/// Run one perform operation over the given roots, mirroring the
/// driver's load -> match -> execute sequencing. Per-action state from a
/// previous operation is cleared up front so the caller can inspect the
/// resulting states.
fn drive(e: &Arc<Engine>, op: OperationInfo, roots: &[TargetId]) -> TargetState {
    for t in e.targets.all() {
        t.reset_slot();
    }

    e.set_current_meta(MID_PERFORM, "perform");
    e.set_current_operation(op, None);
    let a = Action::new(MID_PERFORM, op.id);

    {
        let _m = e.phase_lock(RunPhase::Match);
        matcher::match_in_parallel(e, a, roots).unwrap();
    }

    {
        let _x = e.phase_lock(RunPhase::Execute);
        executor::execute_roots(e, a, roots).unwrap()
    }
}

fn states(e: &Arc<Engine>, ids: &[TargetId]) -> Vec<Option<TargetState>> {
    ids.iter().map(|&id| e.targets.get(id).executed_state()).collect()
}

/// A file-producing rule for `chain{}` targets: the target's file is
/// rebuilt when a prerequisite is newer, and execution order is recorded.
struct ChainRule {
    order: Arc<Mutex<Vec<String>>>,
    matched: Arc<AtomicUsize>,
}

impl ChainRule {
    fn new() -> Self {
        ChainRule {
            order: Arc::new(Mutex::new(Vec::new())),
            matched: Arc::new(AtomicUsize::new(0)),
        }
    }
}

impl Rule for ChainRule {
    fn name(&self) -> &'static str {
        "chain"
    }

    fn matches(&self, _: &Engine, _: Action, _: &Arc<Target>, _: &str) -> Result<MatchOutcome> {
        self.matched.fetch_add(1, Ordering::SeqCst);
        Ok(MatchOutcome::Match)
    }

    fn apply(&self, e: &Engine, a: Action, t: &Arc<Target>, _: &MatchOutcome) -> Result<Recipe> {
        let shared = e.shared();
        matcher::derive_path(e, t, Some("txt"));
        matcher::search_and_match_prerequisites(&shared, a, t)?;

        let order = self.order.clone();
        if a.operation == OP_CLEAN {
            return Ok(Recipe::custom(move |e, a, id| {
                let shared = e.shared();
                let t = e.targets.get(id);
                order.lock().unwrap().push(t.name().to_string());

                let mut ts = TargetState::Unchanged;
                if let Some(p) = t.path() {
                    if fs::rmfile(&p)? {
                        ts = TargetState::Changed;
                    }
                }
                ts |= executor::reverse_execute_prerequisites(&shared, a, &t);
                Ok(ts)
            }));
        }

        Ok(Recipe::custom(move |e, a, id| {
            let shared = e.shared();
            let t = e.targets.get(id);

            let mtime = t.mtime()?;
            let out_of_date = executor::execute_prerequisites(&shared, a, &t, mtime)?;
            order.lock().unwrap().push(t.name().to_string());

            match out_of_date {
                None => Ok(TargetState::Unchanged),
                Some(_) => {
                    let p = t.path().ok_or_else(|| anyhow!("no path for {}", t))?;
                    fs::write(&p, "built\n")?;
                    Ok(TargetState::Changed)
                }
            }
        }))
    }
}

/// Set up an `A <- B <- C` chain of `chain{}` targets in a fresh project.
fn chain_project(
    e: &Arc<Engine>,
    dir: &Path,
    rule: Arc<ChainRule>,
) -> (TargetId, TargetId, TargetId) {
    let scope = e.scopes.insert(dir, 0);
    scope.set_project_root();
    scope.register_target_type(TargetType::new("chain", TargetKind::File));
    scope.rules().write().unwrap().insert(OP_DEFAULT, Symbol::new("chain"), "test.chain", rule);

    let chain = Symbol::new("chain");
    let (a, _) = e.targets.insert(TargetKey::new(chain, dir, Symbol::new("a")), 0);
    let (b, _) = e.targets.insert(TargetKey::new(chain, dir, Symbol::new("b")), 0);
    let (c, _) = e.targets.insert(TargetKey::new(chain, dir, Symbol::new("c")), 0);

    a.add_prerequisite(Prerequisite::new(chain, "", Symbol::new("b")));
    b.add_prerequisite(Prerequisite::new(chain, "", Symbol::new("c")));

    (a.id, b.id, c.id)
}

#[test]
fn test_serial_update_chain() {
    let tmp = TempDir::new().unwrap();
    let e = engine(1, false);
    assert!(e.sched.serial());

    let rule = Arc::new(ChainRule::new());
    let order = rule.order.clone();
    let rule_matched = rule.matched.clone();
    let (a, b, c) = chain_project(&e, tmp.path(), rule);

    // Sources up to date: c oldest, a newest.
    fs::write(&tmp.path().join("c.txt"), "c\n").unwrap();
    fs::write(&tmp.path().join("b.txt"), "b\n").unwrap();
    fs::write(&tmp.path().join("a.txt"), "a\n").unwrap();

    let state = drive(&e, slipway::ops::UPDATE, &[a]);

    assert_eq!(state, TargetState::Unchanged);
    assert_eq!(states(&e, &[a, b, c]), vec![Some(TargetState::Unchanged); 3]);
    assert_eq!(*order.lock().unwrap(), ["c", "b", "a"]);

    // Each target was match-tested exactly once.
    assert_eq!(rule_matched.load(Ordering::SeqCst), 3);
    assert_eq!(e.dependency_count.load(Ordering::Relaxed), 0);
}

#[test]
fn test_update_rebuilds_when_prerequisite_newer() {
    let tmp = TempDir::new().unwrap();
    let e = engine(2, false);

    let rule = Arc::new(ChainRule::new());
    let (a, b, c) = chain_project(&e, tmp.path(), rule);

    // a.txt is older than c.txt: the whole chain above c rebuilds.
    fs::write(&tmp.path().join("a.txt"), "a\n").unwrap();
    fs::write(&tmp.path().join("b.txt"), "b\n").unwrap();
    std::thread::sleep(std::time::Duration::from_millis(20));
    fs::write(&tmp.path().join("c.txt"), "c\n").unwrap();

    let state = drive(&e, slipway::ops::UPDATE, &[a]);
    assert_eq!(state, TargetState::Changed);
    assert_eq!(
        states(&e, &[a, b]),
        [Some(TargetState::Changed), Some(TargetState::Changed)]
    );
    assert_eq!(e.targets.get(c).executed_state(), Some(TargetState::Unchanged));
}

#[test]
fn test_clean_then_update_full_rebuild() {
    let tmp = TempDir::new().unwrap();
    let e = engine(2, false);

    let rule = Arc::new(ChainRule::new());
    let order = rule.order.clone();
    let (a, _b, _c) = chain_project(&e, tmp.path(), rule);

    fs::write(&tmp.path().join("c.txt"), "c\n").unwrap();
    fs::write(&tmp.path().join("b.txt"), "b\n").unwrap();
    fs::write(&tmp.path().join("a.txt"), "a\n").unwrap();

    // Clean: target before prerequisites, reverse order.
    let state = drive(&e, slipway::ops::CLEAN, &[a]);
    assert_eq!(state, TargetState::Changed);
    assert_eq!(*order.lock().unwrap(), ["a", "b", "c"]);
    assert!(!tmp.path().join("a.txt").exists());
    assert!(!tmp.path().join("b.txt").exists());
    assert!(!tmp.path().join("c.txt").exists());

    // Clean is idempotent.
    order.lock().unwrap().clear();
    let state = drive(&e, slipway::ops::CLEAN, &[a]);
    assert_eq!(state, TargetState::Unchanged);

    // Update after clean: a full rebuild, every target changed.
    order.lock().unwrap().clear();
    let state = drive(&e, slipway::ops::UPDATE, &[a]);
    assert_eq!(state, TargetState::Changed);
    assert_eq!(*order.lock().unwrap(), ["c", "b", "a"]);
    assert!(tmp.path().join("a.txt").exists());

    // And an immediate re-update reports everything unchanged.
    let state = drive(&e, slipway::ops::UPDATE, &[a]);
    assert_eq!(state, TargetState::Unchanged);
}

/// A header-generating rule: `hdr{}` is produced from its `.src` file.
struct HdrRule;

impl Rule for HdrRule {
    fn name(&self) -> &'static str {
        "hdr"
    }

    fn matches(&self, _: &Engine, _: Action, _: &Arc<Target>, _: &str) -> Result<MatchOutcome> {
        Ok(MatchOutcome::Match)
    }

    fn apply(&self, e: &Engine, a: Action, t: &Arc<Target>, _: &MatchOutcome) -> Result<Recipe> {
        let shared = e.shared();
        matcher::derive_path(e, t, Some("h"));
        matcher::search_and_match_prerequisites(&shared, a, t)?;

        Ok(Recipe::custom(|e, a, id| {
            let shared = e.shared();
            let t = e.targets.get(id);

            let mtime = t.mtime()?;
            if executor::execute_prerequisites(&shared, a, &t, mtime)?.is_none() {
                return Ok(TargetState::Unchanged);
            }

            let src = t
                .prerequisite_targets()
                .iter()
                .map(|&p| e.targets.get(p))
                .find(|p| p.is("file"))
                .and_then(|p| p.path())
                .ok_or_else(|| anyhow!("no source for {}", t))?;

            let out = t.path().unwrap();
            fs::write(&out, &fs::read(&src)?)?;
            Ok(TargetState::Changed)
        }))
    }
}

/// An application rule whose match needs the generated header present.
struct AppRule {
    hdr: TargetId,
    saw_match_phase: Arc<AtomicUsize>,
}

impl Rule for AppRule {
    fn name(&self) -> &'static str {
        "app"
    }

    fn matches(&self, e: &Engine, a: Action, t: &Arc<Target>, _: &str) -> Result<MatchOutcome> {
        let shared = e.shared();

        // The header must exist before we can finish matching; build it
        // now, briefly becoming an execute-phase thread.
        let hdr = e.targets.get(self.hdr);
        if matcher::search_existing_file(e, &hdr, Some("h")).is_none() {
            matcher::update_during_match(&shared, a, self.hdr)?;
        }

        if e.phase.phase() == RunPhase::Match {
            self.saw_match_phase.fetch_add(1, Ordering::SeqCst);
        }

        if !hdr.path().map(|p| p.exists()).unwrap_or(false) {
            return Err(anyhow!("header still missing after regeneration"));
        }
        let _ = t;
        Ok(MatchOutcome::Match)
    }

    fn apply(&self, e: &Engine, a: Action, t: &Arc<Target>, _: &MatchOutcome) -> Result<Recipe> {
        let shared = e.shared();
        matcher::derive_path(e, t, Some("out"));
        matcher::search_and_match_prerequisites(&shared, a, t)?;

        Ok(Recipe::custom(|e, a, id| {
            let shared = e.shared();
            let t = e.targets.get(id);

            let mtime = t.mtime()?;
            if executor::execute_prerequisites(&shared, a, &t, mtime)?.is_none() {
                return Ok(TargetState::Unchanged);
            }

            fs::write(&t.path().unwrap(), "app\n")?;
            Ok(TargetState::Changed)
        }))
    }
}

#[test]
fn test_parallel_update_with_mid_match_regeneration() {
    let tmp = TempDir::new().unwrap();
    let e = engine(4, false);
    let dir = tmp.path();

    let scope = e.scopes.insert(dir, 0);
    scope.set_project_root();
    scope.register_target_type(TargetType::new("hdr", TargetKind::File));
    scope.register_target_type(TargetType::new("app", TargetKind::File));

    let hdr_sym = Symbol::new("hdr");
    let (hdr, _) = e.targets.insert(TargetKey::new(hdr_sym, dir, Symbol::new("gen")), 0);
    let (app, _) = e.targets.insert(TargetKey::new(Symbol::new("app"), dir, Symbol::new("main")), 0);

    hdr.add_prerequisite(
        Prerequisite::new(Symbol::new("file"), "", Symbol::new("gen")).with_ext(Symbol::new("src")),
    );
    app.add_prerequisite(Prerequisite::new(hdr_sym, "", Symbol::new("gen")));

    let saw_match_phase = Arc::new(AtomicUsize::new(0));
    {
        let mut rules = scope.rules().write().unwrap();
        rules.insert(OP_DEFAULT, hdr_sym, "test.hdr", Arc::new(HdrRule));
        rules.insert(
            OP_DEFAULT,
            Symbol::new("app"),
            "test.app",
            Arc::new(AppRule { hdr: hdr.id, saw_match_phase: saw_match_phase.clone() }),
        );
    }

    // Touch the header source; the header itself does not exist yet.
    fs::write(&dir.join("gen.src"), "generated contents\n").unwrap();

    let state = drive(&e, slipway::ops::UPDATE, &[app.id]);

    assert_eq!(state, TargetState::Changed);
    assert_eq!(e.targets.get(hdr.id).executed_state(), Some(TargetState::Changed));
    assert_eq!(e.targets.get(app.id).executed_state(), Some(TargetState::Changed));

    // The thread came back to the match phase after the interruption.
    assert_eq!(saw_match_phase.load(Ordering::SeqCst), 1);
    assert_eq!(fs::read(&dir.join("gen.h")).unwrap(), "generated contents\n");
    assert_eq!(e.dependency_count.load(Ordering::Relaxed), 0);
}

/// A rule whose recipe fails for targets named `y`.
struct JobRule;

impl Rule for JobRule {
    fn name(&self) -> &'static str {
        "job"
    }

    fn matches(&self, _: &Engine, _: Action, _: &Arc<Target>, _: &str) -> Result<MatchOutcome> {
        Ok(MatchOutcome::Match)
    }

    fn apply(&self, e: &Engine, _: Action, t: &Arc<Target>, _: &MatchOutcome) -> Result<Recipe> {
        matcher::derive_path(e, t, Some("txt"));
        Ok(Recipe::custom(|e, _a, id| {
            let t = e.targets.get(id);
            if &*t.name() == "y" {
                return Err(anyhow!("job y exited with code 1"));
            }
            fs::write(&t.path().unwrap(), "done\n")?;
            Ok(TargetState::Changed)
        }))
    }
}

fn sibling_project(e: &Arc<Engine>, dir: &Path) -> (TargetId, TargetId, TargetId, TargetId) {
    let scope = e.scopes.insert(dir, 0);
    scope.set_project_root();
    scope.register_target_type(TargetType::new("job", TargetKind::File));
    scope
        .rules()
        .write()
        .unwrap()
        .insert(OP_DEFAULT, Symbol::new("job"), "test.job", Arc::new(JobRule));

    let job = Symbol::new("job");
    let (all, _) = e.targets.insert(TargetKey::new(Symbol::new("alias"), dir, Symbol::new("all")), 0);
    let (x, _) = e.targets.insert(TargetKey::new(job, dir, Symbol::new("x")), 0);
    let (y, _) = e.targets.insert(TargetKey::new(job, dir, Symbol::new("y")), 0);
    let (z, _) = e.targets.insert(TargetKey::new(job, dir, Symbol::new("z")), 0);

    for name in ["x", "y", "z"] {
        all.add_prerequisite(Prerequisite::new(job, "", Symbol::new(name)));
    }

    (all.id, x.id, y.id, z.id)
}

#[test]
fn test_keep_going_on_failure() {
    let tmp = TempDir::new().unwrap();
    let e = engine(4, true);
    let (all, x, y, z) = sibling_project(&e, tmp.path());

    let state = drive(&e, slipway::ops::UPDATE, &[all]);

    assert_eq!(state, TargetState::Failed);
    assert_eq!(e.targets.get(y).executed_state(), Some(TargetState::Failed));
    // The siblings completed despite the failure.
    assert_eq!(e.targets.get(x).executed_state(), Some(TargetState::Changed));
    assert_eq!(e.targets.get(z).executed_state(), Some(TargetState::Changed));
    assert!(tmp.path().join("x.txt").exists());
    assert!(tmp.path().join("z.txt").exists());
    assert_eq!(e.targets.get(all).executed_state(), Some(TargetState::Failed));
}

#[test]
fn test_fail_fast_still_reports_failure() {
    let tmp = TempDir::new().unwrap();
    let e = engine(4, false);
    let (all, _x, y, _z) = sibling_project(&e, tmp.path());

    let state = drive(&e, slipway::ops::UPDATE, &[all]);

    assert_eq!(state, TargetState::Failed);
    assert_eq!(e.targets.get(y).executed_state(), Some(TargetState::Failed));
}

/// A counting rule for match-once/execute-once properties.
struct CountRule {
    matches: Arc<Mutex<Vec<TargetId>>>,
    executions: Arc<Mutex<Vec<TargetId>>>,
}

impl Rule for CountRule {
    fn name(&self) -> &'static str {
        "count"
    }

    fn matches(&self, _: &Engine, _: Action, t: &Arc<Target>, _: &str) -> Result<MatchOutcome> {
        self.matches.lock().unwrap().push(t.id);
        Ok(MatchOutcome::Match)
    }

    fn apply(&self, e: &Engine, a: Action, t: &Arc<Target>, _: &MatchOutcome) -> Result<Recipe> {
        let shared = e.shared();
        matcher::search_and_match_prerequisites(&shared, a, t)?;

        let executions = self.executions.clone();
        Ok(Recipe::custom(move |e, a, id| {
            executions.lock().unwrap().push(id);
            let shared = e.shared();
            let t = e.targets.get(id);
            executor::execute_prerequisites_state(&shared, a, &t)
        }))
    }
}

#[test]
fn test_match_and_execute_at_most_once_under_contention() {
    let tmp = TempDir::new().unwrap();
    let e = engine(4, false);
    let dir = tmp.path();

    let scope = e.scopes.insert(dir, 0);
    scope.set_project_root();
    scope.register_target_type(TargetType::new("node", TargetKind::Alias));

    let matches = Arc::new(Mutex::new(Vec::new()));
    let executions = Arc::new(Mutex::new(Vec::new()));
    scope.rules().write().unwrap().insert(
        OP_DEFAULT,
        Symbol::new("node"),
        "test.count",
        Arc::new(CountRule { matches: matches.clone(), executions: executions.clone() }),
    );

    // A wide diamond: 16 mid nodes all depending on one shared base.
    let node = Symbol::new("node");
    let (base, _) = e.targets.insert(TargetKey::new(node, dir, Symbol::new("base")), 0);
    let mut roots = Vec::new();
    for i in 0..16 {
        let (mid, _) =
            e.targets.insert(TargetKey::new(node, dir, Symbol::new(format!("mid{}", i))), 0);
        mid.add_prerequisite(Prerequisite::new(node, "", Symbol::new("base")));
        roots.push(mid.id);
    }

    let state = drive(&e, slipway::ops::UPDATE, &roots);
    assert_eq!(state, TargetState::Unchanged);

    // The shared base was matched and executed exactly once.
    let m = matches.lock().unwrap();
    assert_eq!(m.iter().filter(|&&id| id == base.id).count(), 1);
    let x = executions.lock().unwrap();
    assert_eq!(x.iter().filter(|&&id| id == base.id).count(), 1);

    assert_eq!(e.dependency_count.load(Ordering::Relaxed), 0);
}

#[test]
fn test_circular_dependency_fails_before_execute() {
    let tmp = TempDir::new().unwrap();
    let e = engine(1, false);
    let dir = tmp.path();

    let scope = e.scopes.insert(dir, 0);
    scope.set_project_root();
    scope.register_target_type(TargetType::new("node", TargetKind::Alias));
    scope.rules().write().unwrap().insert(
        OP_DEFAULT,
        Symbol::new("node"),
        "test.count",
        Arc::new(CountRule {
            matches: Arc::new(Mutex::new(Vec::new())),
            executions: Arc::new(Mutex::new(Vec::new())),
        }),
    );

    let node = Symbol::new("node");
    let (p, _) = e.targets.insert(TargetKey::new(node, dir, Symbol::new("p")), 0);
    let (q, _) = e.targets.insert(TargetKey::new(node, dir, Symbol::new("q")), 0);
    p.add_prerequisite(Prerequisite::new(node, "", Symbol::new("q")));
    q.add_prerequisite(Prerequisite::new(node, "", Symbol::new("p")));

    let state = drive(&e, slipway::ops::UPDATE, &[p.id]);
    assert_eq!(state, TargetState::Failed);
}

#[test]
fn test_empty_prerequisites_with_existing_output_is_unchanged() {
    let tmp = TempDir::new().unwrap();
    let e = engine(1, false);

    let rule = Arc::new(ChainRule::new());
    let (_a, _b, c) = chain_project(&e, tmp.path(), rule);
    fs::write(&tmp.path().join("c.txt"), "c\n").unwrap();

    let state = drive(&e, slipway::ops::UPDATE, &[c]);
    assert_eq!(state, TargetState::Unchanged);
}

// Group membership through the real gen module, driven by a generator
// script.

fn gen_project(tmp: &Path, suppress_inline: bool) -> (Arc<Engine>, TargetId) {
    let dir = tmp.join("proj");
    fs::mkdir(&dir).unwrap();

    // A stand-in generator: emits foo.hxx/.cxx and, unless suppressed,
    // foo.ixx.
    let tool = tmp.join("genc.sh");
    fs::write(
        &tool,
        "#!/bin/sh\n\
         suppress=0\n\
         out=.\n\
         while [ $# -gt 1 ]; do\n\
         \tcase \"$1\" in\n\
         \t--suppress-inline) suppress=1; shift;;\n\
         \t-o) out=\"$2\"; shift 2;;\n\
         \t*) shift;;\n\
         \tesac\n\
         done\n\
         src=\"$1\"\n\
         stem=$(basename \"$src\" .in)\n\
         cp \"$src\" \"$out/$stem.hxx\"\n\
         cp \"$src\" \"$out/$stem.cxx\"\n\
         [ $suppress -eq 1 ] || cp \"$src\" \"$out/$stem.ixx\"\n",
    )
    .unwrap();
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&tool, std::fs::Permissions::from_mode(0o755)).unwrap();
    }

    let e = Engine::new(EngineConfig {
        max_active: 2,
        keep_going: false,
        dry_run: false,
        overrides: vec![slipway::core::VariableOverride::parse(&format!(
            "config.gen={}",
            tool.display()
        ))
        .unwrap()],
        work_dir: std::env::current_dir().unwrap(),
    });

    let scope = e.scopes.insert(&dir, 0);
    scope.set_project_root();

    {
        let _l = e.phase_lock(RunPhase::Load);
        e.modules
            .load(&e, &scope, &scope, "gen", false, &Default::default())
            .unwrap();

        if suppress_inline {
            let var = e.var_pool.find("gen.options").unwrap();
            scope
                .vars()
                .write()
                .unwrap()
                .assign(
                    &var,
                    Some(slipway::core::Value::from_str_untyped("--suppress-inline")),
                    0,
                )
                .unwrap();
        }
    }

    fs::write(&dir.join("foo.in"), "contents v1\n").unwrap();

    let (group, _) = e
        .targets
        .insert(TargetKey::new(Symbol::new("gen"), &dir, Symbol::new("foo")), 0);
    group.add_prerequisite(Prerequisite::new(Symbol::new("in"), "", Symbol::new("foo")));

    (e, group.id)
}

#[test]
#[cfg(unix)]
fn test_group_produces_all_members() {
    let tmp = TempDir::new().unwrap();
    let (e, _group) = gen_project(tmp.path(), false);
    let dir = tmp.path().join("proj");

    // Drive the update through a member: matching it links up the group.
    let (member, _) = e
        .targets
        .insert(TargetKey::new(Symbol::new("hxx"), &dir, Symbol::new("foo")), 0);

    let state = drive(&e, slipway::ops::UPDATE, &[member.id]);
    assert_eq!(state, TargetState::Changed);

    assert!(dir.join("foo.hxx").exists());
    assert!(dir.join("foo.cxx").exists());
    assert!(dir.join("foo.ixx").exists());

    // Member is linked to the group.
    assert!(e.targets.get(member.id).group().is_some());
}

#[test]
#[cfg(unix)]
fn test_group_with_suppressed_inline_member() {
    let tmp = TempDir::new().unwrap();
    let (e, group) = gen_project(tmp.path(), true);
    let dir = tmp.path().join("proj");

    let state = drive(&e, slipway::ops::UPDATE, &[group]);
    assert_eq!(state, TargetState::Changed);

    // Two files, no inline member.
    assert!(dir.join("foo.hxx").exists());
    assert!(dir.join("foo.cxx").exists());
    assert!(!dir.join("foo.ixx").exists());

    // The suppressed member has no rule: generation is disabled.
    let (ixx, _) = e
        .targets
        .insert(TargetKey::new(Symbol::new("ixx"), &dir, Symbol::new("foo")), 0);
    let state = drive(&e, slipway::ops::UPDATE, &[ixx.id]);
    assert_eq!(state, TargetState::Failed);
}

#[test]
#[cfg(unix)]
fn test_group_update_is_idempotent_and_resolution_stable() {
    let tmp = TempDir::new().unwrap();
    let (e, group) = gen_project(tmp.path(), false);
    let dir = tmp.path().join("proj");

    let state = drive(&e, slipway::ops::UPDATE, &[group]);
    assert_eq!(state, TargetState::Changed);

    let g = e.targets.get(group);
    let members_before: Vec<_> = {
        let mut out = Vec::new();
        let mut cur = g.first_member();
        while let Some(id) = cur {
            out.push(id);
            cur = e.targets.get(id).next_member();
        }
        out
    };
    assert_eq!(members_before.len(), 3);

    // Re-running leaves the outputs alone and the member set identical.
    let m1 = fs::mtime(&dir.join("foo.hxx")).unwrap();
    let state = drive(&e, slipway::ops::UPDATE, &[group]);
    assert_eq!(state, TargetState::Unchanged);
    assert_eq!(fs::mtime(&dir.join("foo.hxx")).unwrap(), m1);

    let members_after: Vec<_> = {
        let mut out = Vec::new();
        let mut cur = g.first_member();
        while let Some(id) = cur {
            out.push(id);
            cur = e.targets.get(id).next_member();
        }
        out
    };
    assert_eq!(members_before, members_after);

    // Touch the source: the group regenerates.
    std::thread::sleep(std::time::Duration::from_millis(20));
    fs::write(&dir.join("foo.in"), "contents v2\n").unwrap();
    let state = drive(&e, slipway::ops::UPDATE, &[group]);
    assert_eq!(state, TargetState::Changed);
    assert_eq!(fs::read(&dir.join("foo.hxx")).unwrap(), "contents v2\n");
}

// Reentrant waiting: a task-queueing thread must not execute its own
// queued tasks while waiting on a foreign count.

#[test]
fn test_reentrant_wait_modes() {
    use slipway::sched::{Scheduler, TaskCount, WorkQueue};

    // No helper budget: our queued tasks can only run on this thread.
    let sched = Scheduler::with_tuning(2, 1, 1, 128, None);
    let sched = &sched;

    let ran = Arc::new(AtomicUsize::new(0));
    let own = TaskCount::new();
    for _ in 0..100 {
        let ran = ran.clone();
        sched
            .spawn(0, &own, move || {
                ran.fetch_add(1, Ordering::Relaxed);
            })
            .unwrap();
    }

    // First wait works the own queue dry.
    sched.wait(0, &own, WorkQueue::All).unwrap();
    let after_first = ran.load(Ordering::Relaxed);
    assert_eq!(after_first, 100);

    // Queue some more, then wait on an unrelated count with `None`: none
    // of our own tasks may run during that wait.
    for _ in 0..10 {
        let ran = ran.clone();
        sched
            .spawn(0, &own, move || {
                ran.fetch_add(1, Ordering::Relaxed);
            })
            .unwrap();
    }

    let foreign = TaskCount::with_value(1);
    std::thread::scope(|scope| {
        let f2 = foreign.clone();
        scope.spawn(move || {
            std::thread::sleep(std::time::Duration::from_millis(30));
            f2.store(0, Ordering::Release);
            sched.resume(&f2);
        });

        let before = ran.load(Ordering::Relaxed);
        sched.wait(0, &foreign, WorkQueue::None).unwrap();
        assert_eq!(ran.load(Ordering::Relaxed), before);
    });

    sched.wait(0, &own, WorkQueue::All).unwrap();
    assert_eq!(ran.load(Ordering::Relaxed), 110);
}
