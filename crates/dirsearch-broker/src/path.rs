//! Search paths: ordered node lists with reachability state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Number of fixed local nodes at the head of every path.
pub const FIXED_NODE_COUNT: usize = 2;

/// One node of a search path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeDescriptor {
    /// Node name, e.g. `/LDAPv3/ldap1`.
    pub name: String,
    /// Whether the node currently accepts opens.
    pub reachable: bool,
    /// True until the node has been opened successfully once.
    pub has_never_opened: bool,
    /// Time of the last reachability transition.
    pub last_transition: Option<DateTime<Utc>>,
}

impl NodeDescriptor {
    /// A reachable node that has never been opened.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            reachable: true,
            has_never_opened: true,
            last_transition: None,
        }
    }
}

/// Ordered node list of one search configuration.
///
/// The first two entries are always the local and flat-file nodes, which are treated as
/// reachable regardless of their flags.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SearchPath {
    nodes: Vec<NodeDescriptor>,
}

impl SearchPath {
    /// Builds `[local, flat_file, extras...]`, dropping duplicates and repeats of the fixed
    /// nodes from `extras`.
    #[must_use]
    pub fn assemble<I, S>(local: &str, flat_file: &str, extras: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut nodes = vec![NodeDescriptor::new(local), NodeDescriptor::new(flat_file)];
        for extra in extras {
            let name = extra.as_ref().trim();
            if name.is_empty() || nodes.iter().any(|node| node.name == name) {
                continue;
            }
            nodes.push(NodeDescriptor::new(name));
        }
        Self { nodes }
    }

    /// Node descriptors in path order.
    #[must_use]
    pub fn nodes(&self) -> &[NodeDescriptor] {
        &self.nodes
    }

    /// Node names in path order.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.nodes.iter().map(|node| node.name.clone()).collect()
    }

    /// Number of nodes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Returns true if the path has no nodes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Looks up a node by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&NodeDescriptor> {
        self.nodes.iter().find(|node| node.name == name)
    }

    /// Returns true if the named node is the local or flat-file node.
    #[must_use]
    pub fn is_fixed(&self, name: &str) -> bool {
        self.position(name)
            .is_some_and(|index| index < FIXED_NODE_COUNT)
    }

    /// Whether a node may be tried. Fixed and unknown nodes are always reachable.
    #[must_use]
    pub fn is_reachable(&self, name: &str) -> bool {
        match self.position(name) {
            Some(index) if index >= FIXED_NODE_COUNT => self.nodes[index].reachable,
            _ => true,
        }
    }

    /// Copies reachability state from `old` for nodes present in both paths.
    pub fn carry_forward(&mut self, old: &SearchPath) {
        for node in self.nodes.iter_mut().skip(FIXED_NODE_COUNT) {
            if let Some(previous) = old.get(&node.name) {
                node.reachable = previous.reachable;
                node.has_never_opened = previous.has_never_opened;
                node.last_transition = previous.last_transition;
            }
        }
    }

    /// Marks a non-fixed node unreachable. Returns true on a transition.
    pub fn mark_unreachable(&mut self, name: &str) -> bool {
        let Some(node) = self.non_fixed_mut(name) else {
            return false;
        };
        if !node.reachable {
            return false;
        }
        node.reachable = false;
        node.last_transition = Some(Utc::now());
        true
    }

    /// Records a successful open.
    ///
    /// Returns `(transitioned, first_open)`: whether the node went from unreachable to
    /// reachable and whether this was its first successful open.
    pub fn mark_reachable(&mut self, name: &str) -> (bool, bool) {
        let Some(index) = self.position(name) else {
            return (false, false);
        };
        let fixed = index < FIXED_NODE_COUNT;
        let node = &mut self.nodes[index];
        let first_open = std::mem::replace(&mut node.has_never_opened, false);
        if fixed || node.reachable {
            return (false, first_open);
        }
        node.reachable = true;
        node.last_transition = Some(Utc::now());
        (true, first_open)
    }

    /// Names of non-fixed nodes currently flagged unreachable, in path order.
    #[must_use]
    pub fn unreachable_names(&self) -> Vec<String> {
        self.nodes
            .iter()
            .skip(FIXED_NODE_COUNT)
            .filter(|node| !node.reachable)
            .map(|node| node.name.clone())
            .collect()
    }

    /// Returns true if both paths hold the same names in the same order.
    #[must_use]
    pub fn same_names(&self, other: &SearchPath) -> bool {
        self.nodes.len() == other.nodes.len()
            && self
                .nodes
                .iter()
                .zip(&other.nodes)
                .all(|(a, b)| a.name == b.name)
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.nodes.iter().position(|node| node.name == name)
    }

    fn non_fixed_mut(&mut self, name: &str) -> Option<&mut NodeDescriptor> {
        let index = self.position(name)?;
        if index < FIXED_NODE_COUNT {
            return None;
        }
        self.nodes.get_mut(index)
    }
}
