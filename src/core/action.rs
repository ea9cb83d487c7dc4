//! Actions: the (meta-operation, operation) pair driving one traversal of
//! the dependency graph.

use std::fmt;

use crate::util::diagnostic::ActionVerbs;

/// Identifies a meta-operation (`perform`, `configure`, ...).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MetaOperationId(pub u8);

/// Identifies an operation (`update`, `clean`, ...).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OperationId(pub u8);

/// The noop meta/operation id slot.
pub const DEFAULT_ID: u8 = 0;

/// Whether the target's own recipe runs before or after its
/// prerequisites.
///
/// `First` (e.g. `update`): prerequisites are brought up to date first
/// because the recipe's out-of-date check depends on them. `Last` (e.g.
/// `clean`): the target goes first and prerequisites follow in reverse
/// declaration order, deleting the parent before its children.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExecutionMode {
    #[default]
    First,
    Last,
}

/// An action: meta-operation plus inner operation, with an optional outer
/// operation for inner/outer pairs such as `update` inside `install`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Action {
    pub meta: MetaOperationId,
    pub operation: OperationId,
    pub outer: Option<OperationId>,
}

impl Action {
    pub fn new(meta: MetaOperationId, operation: OperationId) -> Self {
        Action { meta, operation, outer: None }
    }

    pub fn with_outer(meta: MetaOperationId, inner: OperationId, outer: OperationId) -> Self {
        Action { meta, operation: inner, outer: Some(outer) }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.meta.0, self.operation.0)
    }
}

/// Static description of an operation: its rule-set selector, diagnostic
/// verbs, and execution mode.
#[derive(Debug, Clone, Copy)]
pub struct OperationInfo {
    pub id: OperationId,
    pub name: &'static str,
    pub verbs: ActionVerbs,
    pub mode: ExecutionMode,
}

impl OperationInfo {
    pub const fn new(
        id: OperationId,
        name: &'static str,
        verbs: ActionVerbs,
        mode: ExecutionMode,
    ) -> Self {
        OperationInfo { id, name, verbs, mode }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_action_identity() {
        let a = Action::new(MetaOperationId(1), OperationId(1));
        let b = Action::new(MetaOperationId(1), OperationId(1));
        let c = Action::new(MetaOperationId(1), OperationId(2));

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.outer.is_none());
    }

    #[test]
    fn test_outer_pair() {
        let a = Action::with_outer(MetaOperationId(1), OperationId(1), OperationId(3));
        assert_eq!(a.outer, Some(OperationId(3)));
    }
}
