//! Targets: the named things the build can produce or act upon.
//!
//! Target identity is process-unique and targets have stable addresses for
//! their lifetime (until the next reset): the engine owns an arena of
//! `Arc<Target>` and edges are integer [`TargetId`] handles, including the
//! group back-pointer, so member/group cycles are expressible without
//! ownership cycles.
//!
//! Per action, a target moves monotonically along
//! `unknown -> matching -> matched -> executing -> (unchanged | changed |
//! postponed | failed)`; the transitions are CASes on a single atomic and
//! waiters park on the target's task count.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::SystemTime;

use anyhow::Result;

use crate::core::action::Action;
use crate::core::prerequisite::Prerequisite;
use crate::core::rule::Recipe;
use crate::core::variable::VariableMap;
use crate::util::Symbol;

/// Stable handle to a target in the engine's arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TargetId(pub u32);

/// What kind of thing a target type describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetKind {
    /// A filesystem file with a path and mtime.
    File,
    /// A filesystem directory.
    Dir,
    /// A named alias with no filesystem presence (e.g. `all`).
    Alias,
    /// A group whose realization produces multiple member targets.
    Group,
}

/// A registered target type.
#[derive(Debug, Clone)]
pub struct TargetType {
    pub name: Symbol,
    /// Derived-from type for `define`-style declarations.
    pub base: Option<Symbol>,
    pub kind: TargetKind,
    pub default_ext: Option<Symbol>,
}

impl TargetType {
    pub fn new(name: impl Into<Symbol>, kind: TargetKind) -> Self {
        TargetType { name: name.into(), base: None, kind, default_ext: None }
    }

    pub fn with_ext(mut self, ext: impl Into<Symbol>) -> Self {
        self.default_ext = Some(ext.into());
        self
    }

    pub fn derived(mut self, base: Symbol) -> Self {
        self.base = Some(base);
        self
    }
}

/// Target identity: (type, out-dir, src-dir-or-none, name, extension).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TargetKey {
    pub ty: Symbol,
    pub out_dir: PathBuf,
    pub src_dir: Option<PathBuf>,
    pub name: Symbol,
    pub ext: Option<Symbol>,
}

impl TargetKey {
    pub fn new(ty: Symbol, out_dir: impl Into<PathBuf>, name: Symbol) -> Self {
        TargetKey { ty, out_dir: out_dir.into(), src_dir: None, name, ext: None }
    }

    pub fn with_src(mut self, src_dir: impl Into<PathBuf>) -> Self {
        self.src_dir = Some(src_dir.into());
        self
    }

    pub fn with_ext(mut self, ext: Symbol) -> Self {
        self.ext = Some(ext);
        self
    }
}

impl fmt::Display for TargetKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{{{}", self.ty, self.name)?;
        if let Some(e) = self.ext {
            write!(f, ".{}", e)?;
        }
        write!(f, "}}")
    }
}

/// The state a recipe leaves a target in. Combination is the monoid
/// `unchanged < changed < postponed < failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TargetState {
    Unchanged,
    Changed,
    Postponed,
    Failed,
}

impl std::ops::BitOr for TargetState {
    type Output = TargetState;

    fn bitor(self, rhs: TargetState) -> TargetState {
        self.max(rhs)
    }
}

impl std::ops::BitOrAssign for TargetState {
    fn bitor_assign(&mut self, rhs: TargetState) {
        *self = (*self).max(rhs);
    }
}

impl fmt::Display for TargetState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TargetState::Unchanged => "unchanged",
            TargetState::Changed => "changed",
            TargetState::Postponed => "postponed",
            TargetState::Failed => "failed",
        })
    }
}

// Raw per-action state machine values. Monotone within a batch.
const ST_UNKNOWN: u8 = 0;
const ST_MATCHING: u8 = 1;
const ST_MATCHED: u8 = 2;
const ST_EXECUTING: u8 = 3;
const ST_UNCHANGED: u8 = 4;
const ST_CHANGED: u8 = 5;
const ST_POSTPONED: u8 = 6;
const ST_FAILED: u8 = 7;

fn to_raw(ts: TargetState) -> u8 {
    match ts {
        TargetState::Unchanged => ST_UNCHANGED,
        TargetState::Changed => ST_CHANGED,
        TargetState::Postponed => ST_POSTPONED,
        TargetState::Failed => ST_FAILED,
    }
}

fn from_raw(raw: u8) -> Option<TargetState> {
    match raw {
        ST_UNCHANGED => Some(TargetState::Unchanged),
        ST_CHANGED => Some(TargetState::Changed),
        ST_POSTPONED => Some(TargetState::Postponed),
        ST_FAILED => Some(TargetState::Failed),
        _ => None,
    }
}

/// Observable position of a target in the per-action state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Unknown,
    Matching,
    Matched,
    Executing,
    Done(TargetState),
}

/// What a would-be matcher found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchClaim {
    /// This thread won the `unknown -> matching` transition.
    Won,
    /// Another thread is matching; wait on the target's task count.
    Wait,
    /// Already matched (or terminally failed).
    Done,
}

/// What a would-be executor found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecClaim {
    /// This thread won the `matched -> executing` transition.
    Won,
    /// Another thread is executing; wait on the target's task count.
    Wait,
    /// Already executed; the cached state.
    Done(TargetState),
    /// Not matched for this action (matching, or never matched).
    NotMatched,
}

/// Per-action data fixed by matching: the chosen recipe and the resolved
/// prerequisite targets. Valid only between match and execute for the
/// recorded action, cleared between operation batches.
#[derive(Default)]
pub struct ActionSlot {
    pub action: Option<Action>,
    pub recipe: Option<Recipe>,
    pub prerequisite_targets: Vec<TargetId>,
}

/// A target.
pub struct Target {
    pub id: TargetId,
    pub key: TargetKey,
    /// Load generation this target was created in (island tracking).
    pub generation: usize,

    prerequisites: Mutex<Vec<Prerequisite>>,
    vars: RwLock<VariableMap>,

    // Group linkage: TargetId + 1, 0 for none. Handles, not owners.
    group: AtomicU32,
    first_member: AtomicU32,
    next_member: AtomicU32,

    state: AtomicU8,
    slot: Mutex<ActionSlot>,

    /// Waiters on in-progress match/execute park here.
    pub task_count: crate::sched::TaskCount,

    /// Dependents for the current action; decremented on execute.
    pub dependents: AtomicUsize,

    path: Mutex<Option<PathBuf>>,
}

impl Target {
    fn new(id: TargetId, key: TargetKey, generation: usize) -> Self {
        Target {
            id,
            key,
            generation,
            prerequisites: Mutex::new(Vec::new()),
            vars: RwLock::new(VariableMap::new()),
            group: AtomicU32::new(0),
            first_member: AtomicU32::new(0),
            next_member: AtomicU32::new(0),
            state: AtomicU8::new(ST_UNKNOWN),
            slot: Mutex::new(ActionSlot::default()),
            task_count: crate::sched::TaskCount::new(),
            dependents: AtomicUsize::new(0),
            path: Mutex::new(None),
        }
    }

    pub fn is(&self, ty: &str) -> bool {
        self.key.ty == *ty
    }

    pub fn name(&self) -> Symbol {
        self.key.name
    }

    pub fn out_dir(&self) -> &Path {
        &self.key.out_dir
    }

    // Declared prerequisites (declaration-ordered).

    pub fn add_prerequisite(&self, p: Prerequisite) {
        self.prerequisites.lock().unwrap().push(p);
    }

    pub fn prerequisites(&self) -> Vec<Prerequisite> {
        self.prerequisites.lock().unwrap().clone()
    }

    pub fn has_prerequisites(&self) -> bool {
        !self.prerequisites.lock().unwrap().is_empty()
    }

    // Target variables.

    pub fn vars(&self) -> &RwLock<VariableMap> {
        &self.vars
    }

    // Group linkage.

    pub fn group(&self) -> Option<TargetId> {
        match self.group.load(Ordering::Acquire) {
            0 => None,
            n => Some(TargetId(n - 1)),
        }
    }

    pub fn set_group(&self, g: TargetId) {
        self.group.store(g.0 + 1, Ordering::Release);
    }

    pub fn first_member(&self) -> Option<TargetId> {
        match self.first_member.load(Ordering::Acquire) {
            0 => None,
            n => Some(TargetId(n - 1)),
        }
    }

    pub fn set_first_member(&self, m: TargetId) {
        self.first_member.store(m.0 + 1, Ordering::Release);
    }

    pub fn next_member(&self) -> Option<TargetId> {
        match self.next_member.load(Ordering::Acquire) {
            0 => None,
            n => Some(TargetId(n - 1)),
        }
    }

    pub fn set_next_member(&self, m: TargetId) {
        self.next_member.store(m.0 + 1, Ordering::Release);
    }

    // Derived path (file targets).

    pub fn path(&self) -> Option<PathBuf> {
        self.path.lock().unwrap().clone()
    }

    pub fn set_path(&self, p: PathBuf) {
        *self.path.lock().unwrap() = Some(p);
    }

    /// The target's file mtime, or None if pathless or absent on disk.
    pub fn mtime(&self) -> Result<Option<SystemTime>> {
        match self.path() {
            Some(p) => crate::util::fs::mtime(&p),
            None => Ok(None),
        }
    }

    // State machine.

    pub fn slot_state(&self) -> SlotState {
        match self.state.load(Ordering::Acquire) {
            ST_UNKNOWN => SlotState::Unknown,
            ST_MATCHING => SlotState::Matching,
            ST_MATCHED => SlotState::Matched,
            ST_EXECUTING => SlotState::Executing,
            raw => SlotState::Done(from_raw(raw).expect("terminal state")),
        }
    }

    /// The terminal state, if executed (or failed) in this batch.
    pub fn executed_state(&self) -> Option<TargetState> {
        from_raw(self.state.load(Ordering::Acquire))
    }

    /// Attempt the `unknown -> matching` transition for this action.
    pub fn try_claim_match(&self, action: Action) -> MatchClaim {
        loop {
            match self.state.load(Ordering::Acquire) {
                ST_UNKNOWN => {
                    if self
                        .state
                        .compare_exchange(
                            ST_UNKNOWN,
                            ST_MATCHING,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        )
                        .is_ok()
                    {
                        {
                            let mut slot = self.slot.lock().unwrap();
                            slot.action = Some(action);
                        }
                        self.task_count.store(1, Ordering::Release);
                        return MatchClaim::Won;
                    }
                }
                ST_MATCHING => return MatchClaim::Wait,
                _ => return MatchClaim::Done,
            }
        }
    }

    /// Record the recipe and complete the match. Call `resume` on the
    /// task count afterwards.
    pub fn finish_match(&self, recipe: Recipe) {
        {
            let mut slot = self.slot.lock().unwrap();
            slot.recipe = Some(recipe);
        }
        self.state.store(ST_MATCHED, Ordering::Release);
        self.task_count.store(0, Ordering::Release);
    }

    /// Fail the target terminally (no rule, rule error, prerequisite
    /// failure during match).
    pub fn fail(&self) {
        self.state.store(ST_FAILED, Ordering::Release);
        self.task_count.store(0, Ordering::Release);
    }

    /// Attempt the `matched -> executing` transition.
    pub fn try_claim_execute(&self) -> ExecClaim {
        loop {
            match self.state.load(Ordering::Acquire) {
                ST_MATCHED => {
                    if self
                        .state
                        .compare_exchange(
                            ST_MATCHED,
                            ST_EXECUTING,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        )
                        .is_ok()
                    {
                        self.task_count.store(1, Ordering::Release);
                        return ExecClaim::Won;
                    }
                }
                ST_EXECUTING => return ExecClaim::Wait,
                ST_UNKNOWN | ST_MATCHING => return ExecClaim::NotMatched,
                raw => return ExecClaim::Done(from_raw(raw).expect("terminal state")),
            }
        }
    }

    /// Record the executed state. Call `resume` on the task count
    /// afterwards.
    pub fn finish_execute(&self, ts: TargetState) {
        self.state.store(to_raw(ts), Ordering::Release);
        self.task_count.store(0, Ordering::Release);
    }

    /// The matched recipe (between match and execute).
    pub fn recipe(&self) -> Option<Recipe> {
        self.slot.lock().unwrap().recipe.clone()
    }

    /// The action this target was matched for.
    pub fn matched_action(&self) -> Option<Action> {
        self.slot.lock().unwrap().action
    }

    /// Resolved prerequisite targets for the current action.
    pub fn prerequisite_targets(&self) -> Vec<TargetId> {
        self.slot.lock().unwrap().prerequisite_targets.clone()
    }

    pub fn set_prerequisite_targets(&self, ids: Vec<TargetId>) {
        self.slot.lock().unwrap().prerequisite_targets = ids;
    }

    pub fn push_prerequisite_target(&self, id: TargetId) {
        self.slot.lock().unwrap().prerequisite_targets.push(id);
    }

    /// Clear per-action state between operation batches.
    pub fn reset_slot(&self) {
        {
            let mut slot = self.slot.lock().unwrap();
            slot.action = None;
            slot.recipe = None;
            slot.prerequisite_targets.clear();
        }
        self.state.store(ST_UNKNOWN, Ordering::Release);
        self.task_count.store(0, Ordering::Release);
        self.dependents.store(0, Ordering::Relaxed);
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.key)
    }
}

/// The engine-owned target arena plus identity index.
#[derive(Default)]
pub struct TargetSet {
    index: RwLock<HashMap<TargetKey, TargetId>>,
    arena: RwLock<Vec<Arc<Target>>>,
}

impl TargetSet {
    pub fn new() -> Self {
        TargetSet::default()
    }

    /// Insert a target, returning the existing one if keyed identically.
    /// The bool is true exactly once per identity.
    pub fn insert(&self, key: TargetKey, generation: usize) -> (Arc<Target>, bool) {
        {
            let index = self.index.read().unwrap();
            if let Some(&id) = index.get(&key) {
                return (self.get(id), false);
            }
        }

        let mut index = self.index.write().unwrap();
        if let Some(&id) = index.get(&key) {
            return (self.get(id), false);
        }

        let mut arena = self.arena.write().unwrap();
        let id = TargetId(arena.len() as u32);
        let t = Arc::new(Target::new(id, key.clone(), generation));
        arena.push(t.clone());
        index.insert(key, id);

        tracing::trace!(id = id.0, "new target {}", t);
        (t, true)
    }

    pub fn get(&self, id: TargetId) -> Arc<Target> {
        self.arena.read().unwrap()[id.0 as usize].clone()
    }

    pub fn find(&self, key: &TargetKey) -> Option<Arc<Target>> {
        let id = *self.index.read().unwrap().get(key)?;
        Some(self.get(id))
    }

    /// Find by the common (type, out-dir, name) triple with no src or
    /// extension qualification.
    pub fn find_unqualified(
        &self,
        ty: Symbol,
        out_dir: &Path,
        name: Symbol,
    ) -> Option<Arc<Target>> {
        self.find(&TargetKey::new(ty, out_dir, name))
    }

    pub fn len(&self) -> usize {
        self.arena.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn all(&self) -> Vec<Arc<Target>> {
        self.arena.read().unwrap().clone()
    }

    /// Discard everything (reset between meta-operation batches).
    pub fn clear(&self) {
        self.index.write().unwrap().clear();
        self.arena.write().unwrap().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::action::{MetaOperationId, OperationId};

    fn key(name: &str) -> TargetKey {
        TargetKey::new(Symbol::new("file"), "/proj", Symbol::new(name))
    }

    fn action() -> Action {
        Action::new(MetaOperationId(1), OperationId(1))
    }

    #[test]
    fn test_insert_is_idempotent() {
        let set = TargetSet::new();

        let (a, inserted) = set.insert(key("foo"), 0);
        assert!(inserted);

        let (b, inserted) = set.insert(key("foo"), 0);
        assert!(!inserted);
        assert_eq!(a.id, b.id);

        let (_, inserted) = set.insert(key("bar"), 0);
        assert!(inserted);
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn test_identity_includes_ext() {
        let set = TargetSet::new();

        let (_, first) = set.insert(key("foo"), 0);
        let (_, second) = set.insert(key("foo").with_ext(Symbol::new("hxx")), 0);
        assert!(first && second);
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn test_state_machine_monotone() {
        let set = TargetSet::new();
        let (t, _) = set.insert(key("foo"), 0);

        assert_eq!(t.slot_state(), SlotState::Unknown);

        assert_eq!(t.try_claim_match(action()), MatchClaim::Won);
        assert_eq!(t.slot_state(), SlotState::Matching);
        // A second matcher loses.
        assert_eq!(t.try_claim_match(action()), MatchClaim::Wait);

        t.finish_match(Recipe::Noop);
        assert_eq!(t.slot_state(), SlotState::Matched);
        assert_eq!(t.try_claim_match(action()), MatchClaim::Done);

        assert_eq!(t.try_claim_execute(), ExecClaim::Won);
        assert_eq!(t.try_claim_execute(), ExecClaim::Wait);

        t.finish_execute(TargetState::Changed);
        assert_eq!(t.slot_state(), SlotState::Done(TargetState::Changed));
        assert_eq!(t.try_claim_execute(), ExecClaim::Done(TargetState::Changed));
        assert_eq!(t.executed_state(), Some(TargetState::Changed));
    }

    #[test]
    fn test_execute_before_match_is_rejected() {
        let set = TargetSet::new();
        let (t, _) = set.insert(key("foo"), 0);
        assert_eq!(t.try_claim_execute(), ExecClaim::NotMatched);
    }

    #[test]
    fn test_reset_slot() {
        let set = TargetSet::new();
        let (t, _) = set.insert(key("foo"), 0);

        t.try_claim_match(action());
        t.finish_match(Recipe::Noop);
        t.try_claim_execute();
        t.finish_execute(TargetState::Unchanged);

        t.reset_slot();
        assert_eq!(t.slot_state(), SlotState::Unknown);
        assert!(t.recipe().is_none());
        assert!(t.prerequisite_targets().is_empty());
    }

    #[test]
    fn test_state_monoid() {
        let mut ts = TargetState::Unchanged;
        ts |= TargetState::Changed;
        assert_eq!(ts, TargetState::Changed);
        ts |= TargetState::Unchanged;
        assert_eq!(ts, TargetState::Changed);
        ts |= TargetState::Failed;
        assert_eq!(ts, TargetState::Failed);
        assert_eq!(TargetState::Postponed | TargetState::Changed, TargetState::Postponed);
    }

    #[test]
    fn test_group_links_are_handles() {
        let set = TargetSet::new();
        let (g, _) = set.insert(TargetKey::new(Symbol::new("gen"), "/p", Symbol::new("foo")), 0);
        let (m, _) = set.insert(TargetKey::new(Symbol::new("hxx"), "/p", Symbol::new("foo")), 0);

        assert_eq!(m.group(), None);
        m.set_group(g.id);
        g.set_first_member(m.id);

        assert_eq!(m.group(), Some(g.id));
        assert_eq!(g.first_member(), Some(m.id));
        assert_eq!(m.next_member(), None);
    }

    #[test]
    fn test_concurrent_insert_single_winner() {
        let set = Arc::new(TargetSet::new());
        let wins = Arc::new(AtomicUsize::new(0));

        std::thread::scope(|scope| {
            for _ in 0..8 {
                let set = set.clone();
                let wins = wins.clone();
                scope.spawn(move || {
                    let (_, inserted) = set.insert(key("contended"), 0);
                    if inserted {
                        wins.fetch_add(1, Ordering::Relaxed);
                    }
                });
            }
        });

        assert_eq!(wins.load(Ordering::Relaxed), 1);
        assert_eq!(set.len(), 1);
    }
}
