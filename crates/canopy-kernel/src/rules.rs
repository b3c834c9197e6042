//! Scheduling rules.
//!
//! A [`SchedulingRule`] is a set of path scopes. Holding it grants exclusive
//! use of every resource at or below those scopes. Two rules conflict when
//! any scope of one is an ancestor of, equal to, or a descendant of a scope
//! of the other.
//!
//! [`RuleFactory`] maps each structural operation to the rule it needs.

use std::fmt;

use canopy_types::ResourcePath;

use crate::tree::ResourceTree;

/// True when `a` and `b` overlap: one is an ancestor of, or equal to, the other.
pub fn conflicts(a: &ResourcePath, b: &ResourcePath) -> bool {
    a.is_prefix_of(b) || b.is_prefix_of(a)
}

/// A normalized set of path scopes. No scope is contained in another.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct SchedulingRule {
    scopes: Vec<ResourcePath>,
}

impl SchedulingRule {
    /// Rule covering `path` and everything below it.
    pub fn new(path: ResourcePath) -> Self {
        Self { scopes: vec![path] }
    }

    /// Rule covering the whole workspace.
    pub fn root() -> Self {
        Self::new(ResourcePath::root())
    }

    /// Union of several rules.
    pub fn combine(rules: impl IntoIterator<Item = SchedulingRule>) -> Self {
        let mut scopes: Vec<ResourcePath> = rules.into_iter().flat_map(|r| r.scopes).collect();
        scopes.sort();
        scopes.dedup();
        // Sorted order puts an ancestor before its descendants.
        let mut normalized: Vec<ResourcePath> = Vec::with_capacity(scopes.len());
        for scope in scopes {
            if !normalized.iter().any(|kept| kept.is_prefix_of(&scope)) {
                normalized.push(scope);
            }
        }
        Self { scopes: normalized }
    }

    pub fn scopes(&self) -> &[ResourcePath] {
        &self.scopes
    }

    pub fn conflicts_with(&self, other: &SchedulingRule) -> bool {
        self.scopes
            .iter()
            .any(|a| other.scopes.iter().any(|b| conflicts(a, b)))
    }

    /// True when every scope of `other` lies at or below a scope of `self`.
    pub fn contains(&self, other: &SchedulingRule) -> bool {
        other
            .scopes
            .iter()
            .all(|b| self.scopes.iter().any(|a| a.is_prefix_of(b)))
    }

    pub fn covers(&self, path: &ResourcePath) -> bool {
        self.scopes.iter().any(|scope| scope.is_prefix_of(path))
    }
}

impl From<ResourcePath> for SchedulingRule {
    fn from(path: ResourcePath) -> Self {
        Self::new(path)
    }
}

impl fmt::Display for SchedulingRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.scopes.as_slice() {
            [single] => write!(f, "{single}"),
            scopes => {
                f.write_str("[")?;
                for (i, scope) in scopes.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{scope}")?;
                }
                f.write_str("]")
            }
        }
    }
}

impl fmt::Debug for SchedulingRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SchedulingRule({self})")
    }
}

/// Rules required by each operation.
///
/// Creating, deleting or copying a member locks its parent, since the
/// parent's member list changes. Projects and the root lock themselves.
#[derive(Debug, Clone, Copy, Default)]
pub struct RuleFactory;

impl RuleFactory {
    fn parent_scope(path: &ResourcePath) -> ResourcePath {
        if path.segment_count() <= 1 {
            path.clone()
        } else {
            path.remove_last_segments(1)
        }
    }

    /// Parent of the target. A forced create is widened to the nearest
    /// existing ancestor so it covers the folders it makes.
    pub fn create_rule(tree: &ResourceTree, path: &ResourcePath, force: bool) -> SchedulingRule {
        let mut scope = Self::parent_scope(path);
        while force && scope.segment_count() > 1 && !tree.exists(&scope) {
            scope = scope.remove_last_segments(1);
        }
        SchedulingRule::new(scope)
    }

    pub fn delete_rule(path: &ResourcePath) -> SchedulingRule {
        SchedulingRule::new(Self::parent_scope(path))
    }

    pub fn copy_rule(destination: &ResourcePath) -> SchedulingRule {
        SchedulingRule::new(Self::parent_scope(destination))
    }

    pub fn move_rule(source: &ResourcePath, destination: &ResourcePath) -> SchedulingRule {
        SchedulingRule::combine([
            SchedulingRule::new(Self::parent_scope(source)),
            SchedulingRule::new(Self::parent_scope(destination)),
        ])
    }

    pub fn modify_rule(path: &ResourcePath) -> SchedulingRule {
        SchedulingRule::new(path.clone())
    }

    pub fn marker_rule(path: &ResourcePath) -> SchedulingRule {
        Self::modify_rule(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p(s: &str) -> ResourcePath {
        ResourcePath::parse(s).unwrap()
    }

    fn rule(s: &str) -> SchedulingRule {
        SchedulingRule::new(p(s))
    }

    #[test]
    fn test_conflict_predicate() {
        assert!(conflicts(&p("/P"), &p("/P/a")));
        assert!(conflicts(&p("/P/a"), &p("/P")));
        assert!(conflicts(&p("/P/a"), &p("/P/a")));
        assert!(conflicts(&ResourcePath::root(), &p("/Q/z")));
        assert!(!conflicts(&p("/P/a"), &p("/P/b")));
        assert!(!conflicts(&p("/P/a"), &p("/P/ab")));
    }

    #[test]
    fn test_combine_normalizes() {
        let combined = SchedulingRule::combine([rule("/P/a/x"), rule("/Q"), rule("/P/a")]);
        assert_eq!(combined.scopes(), [p("/P/a"), p("/Q")]);
        assert_eq!(combined.to_string(), "[/P/a, /Q]");
    }

    #[test]
    fn test_contains_and_conflicts() {
        let outer = SchedulingRule::combine([rule("/P/a"), rule("/P/b")]);
        assert!(outer.contains(&rule("/P/a/x")));
        assert!(outer.contains(&SchedulingRule::combine([rule("/P/a"), rule("/P/b/y")])));
        assert!(!outer.contains(&rule("/P")));
        assert!(outer.conflicts_with(&rule("/P")));
        assert!(!outer.conflicts_with(&rule("/P/c")));
        assert!(SchedulingRule::root().contains(&outer));
    }

    #[test]
    fn test_factory_scopes() {
        let tree = ResourceTree::new(canopy_types::ResourceId::from_raw(0));
        assert_eq!(RuleFactory::delete_rule(&p("/P/a/x")), rule("/P/a"));
        assert_eq!(RuleFactory::delete_rule(&p("/P")), rule("/P"));
        assert_eq!(RuleFactory::modify_rule(&p("/P/a")), rule("/P/a"));
        assert_eq!(RuleFactory::create_rule(&tree, &p("/P/a/b/c"), false), rule("/P/a/b"));
        // nothing exists, so a forced create widens to the project
        assert_eq!(RuleFactory::create_rule(&tree, &p("/P/a/b/c"), true), rule("/P"));
        assert_eq!(RuleFactory::copy_rule(&p("/Q/y")), rule("/Q"));
        assert_eq!(
            RuleFactory::move_rule(&p("/P/a/x"), &p("/Q/y")),
            SchedulingRule::combine([rule("/P/a"), rule("/Q")])
        );
    }
}
