//! Activity tree: nodes, paths and persisted work state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::bucket::BucketingState;
use super::work_definition::WorkDefinition;
use crate::constants::system::PATH_SEPARATOR;
use crate::state_machine::ActivityState;
use crate::statistics::OperationStatistics;

/// Identifiers from the root down to one node
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ActivityPath(Vec<String>);

impl ActivityPath {
    pub fn root(identifier: impl Into<String>) -> Self {
        Self(vec![identifier.into()])
    }

    pub fn child(&self, identifier: impl Into<String>) -> Self {
        let mut segments = self.0.clone();
        segments.push(identifier.into());
        Self(segments)
    }

    /// Parse `"root/child/grandchild"`
    pub fn parse(path: &str) -> Self {
        Self(
            path.split(PATH_SEPARATOR)
                .filter(|segment| !segment.is_empty())
                .map(str::to_string)
                .collect(),
        )
    }

    pub fn segments(&self) -> &[String] {
        &self.0
    }

    pub fn depth(&self) -> usize {
        self.0.len()
    }

    pub fn is_root(&self) -> bool {
        self.0.len() == 1
    }

    pub fn leaf(&self) -> Option<&str> {
        self.0.last().map(String::as_str)
    }
}

impl fmt::Display for ActivityPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.join(&PATH_SEPARATOR.to_string()))
    }
}

/// How children of a node are executed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompositionPolicy {
    /// One after another; the first failed child aborts the rest
    #[default]
    Sequential,
    /// All at once; siblings finish before the parent reports failures
    Parallel,
}

/// Everything about a node that changes while it runs
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ActivityWorkState {
    pub realization_state: ActivityState,
    pub bucketing: BucketingState,
    pub statistics: OperationStatistics,
    pub failure_reason: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityNode {
    pub identifier: String,
    #[serde(default)]
    pub work: Option<WorkDefinition>,
    #[serde(default)]
    pub composition: CompositionPolicy,
    #[serde(default)]
    pub children: Vec<ActivityNode>,
    #[serde(default)]
    pub work_state: ActivityWorkState,
}

impl ActivityNode {
    /// A node that processes objects and has no children
    pub fn leaf(identifier: impl Into<String>, work: WorkDefinition) -> Self {
        Self {
            identifier: identifier.into(),
            work: Some(work),
            composition: CompositionPolicy::Sequential,
            children: Vec::new(),
            work_state: ActivityWorkState::default(),
        }
    }

    /// A node that only coordinates children
    pub fn composite(
        identifier: impl Into<String>,
        composition: CompositionPolicy,
        children: Vec<ActivityNode>,
    ) -> Self {
        Self {
            identifier: identifier.into(),
            work: None,
            composition,
            children,
            work_state: ActivityWorkState::default(),
        }
    }

    pub fn with_children(mut self, composition: CompositionPolicy, children: Vec<ActivityNode>) -> Self {
        self.composition = composition;
        self.children = children;
        self
    }

    pub fn find(&self, path: &ActivityPath) -> Option<&ActivityNode> {
        let (first, rest) = path.segments().split_first()?;
        if *first != self.identifier {
            return None;
        }
        rest.iter().try_fold(self, |node, segment| {
            node.children.iter().find(|child| child.identifier == *segment)
        })
    }

    pub fn find_mut(&mut self, path: &ActivityPath) -> Option<&mut ActivityNode> {
        let (first, rest) = path.segments().split_first()?;
        if *first != self.identifier {
            return None;
        }
        let mut node = self;
        for segment in rest {
            node = node
                .children
                .iter_mut()
                .find(|child| child.identifier == *segment)?;
        }
        Some(node)
    }

    /// Child positions leading from this node to `path`, used for partial document updates
    pub fn child_indices(&self, path: &ActivityPath) -> Option<Vec<usize>> {
        let (first, rest) = path.segments().split_first()?;
        if *first != self.identifier {
            return None;
        }
        let mut node = self;
        let mut indices = Vec::with_capacity(rest.len());
        for segment in rest {
            let index = node
                .children
                .iter()
                .position(|child| child.identifier == *segment)?;
            indices.push(index);
            node = &node.children[index];
        }
        Some(indices)
    }

    /// Every node of the subtree in pre-order, with its path
    pub fn nodes(&self) -> Vec<(ActivityPath, &ActivityNode)> {
        let mut out = Vec::new();
        self.collect_nodes(ActivityPath::root(self.identifier.clone()), &mut out);
        out
    }

    fn collect_nodes<'a>(&'a self, path: ActivityPath, out: &mut Vec<(ActivityPath, &'a ActivityNode)>) {
        out.push((path.clone(), self));
        for child in &self.children {
            child.collect_nodes(path.child(child.identifier.clone()), out);
        }
    }

    /// Paths of the direct children of the node at `path`
    pub fn child_paths(&self, path: &ActivityPath) -> Vec<ActivityPath> {
        self.children
            .iter()
            .map(|child| path.child(child.identifier.clone()))
            .collect()
    }

    /// Committed statistics of the whole subtree
    pub fn rolled_up_statistics(&self, failure_limit: usize) -> OperationStatistics {
        let mut totals = self.work_state.statistics.clone();
        for child in &self.children {
            totals.merge(&child.rolled_up_statistics(failure_limit), failure_limit);
        }
        totals
    }

    /// Visit every node mutably
    pub fn for_each_mut(&mut self, visit: &mut impl FnMut(&mut ActivityNode)) {
        visit(self);
        for child in &mut self.children {
            child.for_each_mut(visit);
        }
    }

    /// Forget all progress in the subtree
    pub fn reset_tree(&mut self) {
        self.for_each_mut(&mut |node| node.work_state = ActivityWorkState::default());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ObjectFilter, WorkDefinition};

    fn tree() -> ActivityNode {
        let work = WorkDefinition::query("user", ObjectFilter::All, "noop");
        ActivityNode::composite(
            "root",
            CompositionPolicy::Sequential,
            vec![
                ActivityNode::leaf("import", work.clone()),
                ActivityNode::composite(
                    "post",
                    CompositionPolicy::Parallel,
                    vec![
                        ActivityNode::leaf("a", work.clone()),
                        ActivityNode::leaf("b", work),
                    ],
                ),
            ],
        )
    }

    #[test]
    fn test_path_display_and_parse() {
        let path = ActivityPath::root("root").child("post").child("b");
        assert_eq!(path.to_string(), "root/post/b");
        assert_eq!(ActivityPath::parse("root/post/b"), path);
        assert_eq!(path.depth(), 3);
        assert_eq!(path.leaf(), Some("b"));
        assert!(ActivityPath::root("root").is_root());
    }

    #[test]
    fn test_find_and_indices() {
        let mut root = tree();
        let path = ActivityPath::parse("root/post/b");
        assert_eq!(root.find(&path).map(|n| n.identifier.as_str()), Some("b"));
        assert_eq!(root.child_indices(&path), Some(vec![1, 1]));
        assert_eq!(root.child_indices(&ActivityPath::root("root")), Some(vec![]));
        assert!(root.find(&ActivityPath::parse("root/missing")).is_none());
        assert!(root.find(&ActivityPath::parse("other/post")).is_none());

        root.find_mut(&path).unwrap().work_state.realization_state = ActivityState::Complete;
        assert_eq!(
            root.find(&path).unwrap().work_state.realization_state,
            ActivityState::Complete
        );
    }

    #[test]
    fn test_nodes_pre_order() {
        let root = tree();
        let paths: Vec<String> = root.nodes().iter().map(|(p, _)| p.to_string()).collect();
        assert_eq!(
            paths,
            vec!["root", "root/import", "root/post", "root/post/a", "root/post/b"]
        );
    }

    #[test]
    fn test_roll_up_and_reset() {
        let mut root = tree();
        root.find_mut(&ActivityPath::parse("root/import"))
            .unwrap()
            .work_state
            .statistics
            .succeeded = 4;
        root.find_mut(&ActivityPath::parse("root/post/a"))
            .unwrap()
            .work_state
            .statistics
            .failed = 1;

        let totals = root.rolled_up_statistics(10);
        assert_eq!(totals.succeeded, 4);
        assert_eq!(totals.failed, 1);

        root.reset_tree();
        assert!(root.rolled_up_statistics(10).is_empty());
        assert_eq!(root.rolled_up_statistics(10).failed, 0);
    }
}
