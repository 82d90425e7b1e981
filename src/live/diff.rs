//! LiveView diff engine.
//!
//! Walks two render trees in lock-step and emits an ordered list of patch
//! operations. Operations are meant to be applied one after another by the
//! client: every path refers to the tree as it is after all preceding
//! operations have been applied. For each element the engine emits its
//! attribute changes, then the structural changes to its child list, then
//! recurses into the matched children in their final order.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::error::LiveError;
use crate::live::tree::{Element, Node};

/// A single tree mutation addressed by a path of child indices from the root.
///
/// For child-list operations `path` addresses the parent element.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "kebab-case")]
pub enum PatchOp {
    SetAttribute {
        path: Vec<usize>,
        name: String,
        value: String,
    },
    RemoveAttribute {
        path: Vec<usize>,
        name: String,
    },
    ReplaceText {
        path: Vec<usize>,
        text: String,
    },
    InsertChild {
        path: Vec<usize>,
        index: usize,
        node: Node,
    },
    RemoveChild {
        path: Vec<usize>,
        index: usize,
    },
    /// Remove the child at `from`, then insert it at `to`.
    MoveChild {
        path: Vec<usize>,
        from: usize,
        to: usize,
    },
    ReplaceSubtree {
        path: Vec<usize>,
        node: Node,
    },
}

/// Result of diffing a render against the previous snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Diff {
    /// No previous snapshot: the whole tree, serialized.
    Full(String),
    Patch(Vec<PatchOp>),
}

impl Diff {
    /// True for a patch with no operations.
    pub fn is_empty(&self) -> bool {
        matches!(self, Diff::Patch(ops) if ops.is_empty())
    }
}

/// Diff `current` against `previous`.
pub fn diff(previous: Option<&Node>, current: &Node) -> Diff {
    match previous {
        None => Diff::Full(current.to_html()),
        Some(previous) => {
            let mut ops = Vec::new();
            let mut path = Vec::new();
            diff_node(&mut path, previous, current, &mut ops);
            Diff::Patch(ops)
        }
    }
}

fn diff_node(path: &mut Vec<usize>, old: &Node, new: &Node, ops: &mut Vec<PatchOp>) {
    match (old, new) {
        (Node::Text(a), Node::Text(b)) => {
            if a != b {
                ops.push(PatchOp::ReplaceText {
                    path: path.clone(),
                    text: b.clone(),
                });
            }
        }
        (Node::Element(a), Node::Element(b)) if a.tag == b.tag => {
            diff_attrs(path, a, b, ops);
            diff_children(path, &a.children, &b.children, ops);
        }
        _ => ops.push(PatchOp::ReplaceSubtree {
            path: path.clone(),
            node: new.clone(),
        }),
    }
}

fn diff_attrs(path: &[usize], old: &Element, new: &Element, ops: &mut Vec<PatchOp>) {
    for name in old.attrs.keys() {
        if !new.attrs.contains_key(name) {
            ops.push(PatchOp::RemoveAttribute {
                path: path.to_vec(),
                name: name.clone(),
            });
        }
    }
    for (name, value) in &new.attrs {
        if old.attrs.get(name) != Some(value) {
            ops.push(PatchOp::SetAttribute {
                path: path.to_vec(),
                name: name.clone(),
                value: value.clone(),
            });
        }
    }
}

fn diff_children(path: &mut Vec<usize>, old: &[Node], new: &[Node], ops: &mut Vec<PatchOp>) {
    if old.is_empty() && new.is_empty() {
        return;
    }
    match (child_keys(old), child_keys(new)) {
        (Some(old_keys), Some(new_keys)) => {
            diff_keyed(path, old, new, &old_keys, &new_keys, ops)
        }
        _ => diff_unkeyed(path, old, new, ops),
    }
}

/// Keys of a child list, if every child is an element with a unique key.
fn child_keys(children: &[Node]) -> Option<Vec<&str>> {
    let mut seen = HashSet::with_capacity(children.len());
    let mut keys = Vec::with_capacity(children.len());
    for child in children {
        let key = child.as_element()?.key()?;
        if !seen.insert(key) {
            return None;
        }
        keys.push(key);
    }
    Some(keys)
}

/// Reconcile keyed children.
///
/// Dropped keys are removed first, highest index first. The remaining list is
/// then arranged right to left: children on the longest increasing run of old
/// positions stay put, every other retained child is moved in front of its
/// right-hand neighbour and new keys are inserted the same way.
fn diff_keyed(
    path: &mut Vec<usize>,
    old: &[Node],
    new: &[Node],
    old_keys: &[&str],
    new_keys: &[&str],
    ops: &mut Vec<PatchOp>,
) {
    let new_set: HashSet<&str> = new_keys.iter().copied().collect();
    let mut working: Vec<&str> = old_keys.to_vec();

    for index in (0..old_keys.len()).rev() {
        if !new_set.contains(old_keys[index]) {
            ops.push(PatchOp::RemoveChild {
                path: path.clone(),
                index,
            });
            working.remove(index);
        }
    }

    let retained: HashMap<&str, usize> = working
        .iter()
        .enumerate()
        .map(|(position, key)| (*key, position))
        .collect();
    let sequence: Vec<usize> = new_keys
        .iter()
        .filter_map(|key| retained.get(key).copied())
        .collect();
    let stable: HashSet<usize> = longest_increasing_subsequence(&sequence)
        .into_iter()
        .collect();

    for i in (0..new_keys.len()).rev() {
        let key = new_keys[i];
        let anchor = match new_keys.get(i + 1) {
            Some(next) => position_of(&working, next),
            None => working.len(),
        };
        match retained.get(key) {
            Some(position) if stable.contains(position) => {}
            Some(_) => {
                let from = position_of(&working, key);
                let to = if from < anchor { anchor - 1 } else { anchor };
                if from != to {
                    working.remove(from);
                    working.insert(to, key);
                    ops.push(PatchOp::MoveChild {
                        path: path.clone(),
                        from,
                        to,
                    });
                }
            }
            None => {
                working.insert(anchor, key);
                ops.push(PatchOp::InsertChild {
                    path: path.clone(),
                    index: anchor,
                    node: new[i].clone(),
                });
            }
        }
    }

    let old_by_key: HashMap<&str, &Node> = old_keys.iter().copied().zip(old.iter()).collect();
    for (index, (key, node)) in new_keys.iter().zip(new.iter()).enumerate() {
        if let Some(previous) = old_by_key.get(key) {
            path.push(index);
            diff_node(path, previous, node, ops);
            path.pop();
        }
    }
}

fn position_of(keys: &[&str], key: &str) -> usize {
    keys.iter().position(|k| *k == key).unwrap_or(keys.len())
}

/// Values of one longest strictly increasing subsequence.
fn longest_increasing_subsequence(sequence: &[usize]) -> Vec<usize> {
    let mut tails: Vec<usize> = Vec::new();
    let mut previous: Vec<Option<usize>> = vec![None; sequence.len()];

    for (i, &value) in sequence.iter().enumerate() {
        let slot = tails.partition_point(|&t| sequence[t] < value);
        if slot > 0 {
            previous[i] = Some(tails[slot - 1]);
        }
        if slot == tails.len() {
            tails.push(i);
        } else {
            tails[slot] = i;
        }
    }

    let mut result = Vec::with_capacity(tails.len());
    let mut cursor = tails.last().copied();
    while let Some(i) = cursor {
        result.push(sequence[i]);
        cursor = previous[i];
    }
    result.reverse();
    result
}

/// Reconcile unkeyed children on their longest common subsequence. Each run
/// of unmatched children is paired up positionally and diffed in place; the
/// surplus is removed or inserted.
fn diff_unkeyed(path: &mut Vec<usize>, old: &[Node], new: &[Node], ops: &mut Vec<PatchOp>) {
    let mut hunk = Hunk::default();
    let mut index = 0;
    let mut pairs: Vec<(usize, &Node, &Node)> = Vec::new();

    for result in diff::slice(old, new) {
        match result {
            diff::Result::Left(node) => hunk.removed.push(node),
            diff::Result::Right(node) => hunk.added.push(node),
            diff::Result::Both(..) => {
                hunk.flush(path, &mut index, &mut pairs, ops);
                index += 1;
            }
        }
    }
    hunk.flush(path, &mut index, &mut pairs, ops);

    for (index, previous, node) in pairs {
        path.push(index);
        diff_node(path, previous, node, ops);
        path.pop();
    }
}

#[derive(Default)]
struct Hunk<'a> {
    removed: Vec<&'a Node>,
    added: Vec<&'a Node>,
}

impl<'a> Hunk<'a> {
    fn flush(
        &mut self,
        path: &[usize],
        index: &mut usize,
        pairs: &mut Vec<(usize, &'a Node, &'a Node)>,
        ops: &mut Vec<PatchOp>,
    ) {
        let paired = self.removed.len().min(self.added.len());
        for k in 0..paired {
            pairs.push((*index + k, self.removed[k], self.added[k]));
        }
        for _ in paired..self.removed.len() {
            ops.push(PatchOp::RemoveChild {
                path: path.to_vec(),
                index: *index + paired,
            });
        }
        for (k, node) in self.added[paired..].iter().enumerate() {
            ops.push(PatchOp::InsertChild {
                path: path.to_vec(),
                index: *index + paired + k,
                node: (*node).clone(),
            });
        }
        *index += self.added.len();
        self.removed.clear();
        self.added.clear();
    }
}

/// Apply patch operations in order, the way a client does.
///
/// The server never patches its own snapshots; this exists for clients
/// written in Rust and to check emitted patches.
pub fn apply_patch(root: &mut Node, ops: &[PatchOp]) -> Result<(), LiveError> {
    for op in ops {
        apply_op(root, op)?;
    }
    Ok(())
}

fn apply_op(root: &mut Node, op: &PatchOp) -> Result<(), LiveError> {
    match op {
        PatchOp::SetAttribute { path, name, value } => {
            element_at(root, path)?
                .attrs
                .insert(name.clone(), value.clone());
        }
        PatchOp::RemoveAttribute { path, name } => {
            element_at(root, path)?.attrs.shift_remove(name);
        }
        PatchOp::ReplaceText { path, text } => match node_at(root, path)? {
            Node::Text(content) => *content = text.clone(),
            Node::Element(_) => {
                return Err(LiveError::patch(format!("{:?} is not a text node", path)))
            }
        },
        PatchOp::InsertChild { path, index, node } => {
            let el = element_at(root, path)?;
            if *index > el.children.len() {
                return Err(out_of_bounds(path, *index));
            }
            el.children.insert(*index, node.clone());
        }
        PatchOp::RemoveChild { path, index } => {
            let el = element_at(root, path)?;
            if *index >= el.children.len() {
                return Err(out_of_bounds(path, *index));
            }
            el.children.remove(*index);
        }
        PatchOp::MoveChild { path, from, to } => {
            let el = element_at(root, path)?;
            if *from >= el.children.len() || *to >= el.children.len() {
                return Err(out_of_bounds(path, (*from).max(*to)));
            }
            let child = el.children.remove(*from);
            el.children.insert(*to, child);
        }
        PatchOp::ReplaceSubtree { path, node } => {
            *node_at(root, path)? = node.clone();
        }
    }
    Ok(())
}

fn node_at<'a>(root: &'a mut Node, path: &[usize]) -> Result<&'a mut Node, LiveError> {
    root.at_mut(path)
        .ok_or_else(|| LiveError::patch(format!("no node at {:?}", path)))
}

fn element_at<'a>(root: &'a mut Node, path: &[usize]) -> Result<&'a mut Element, LiveError> {
    match node_at(root, path)? {
        Node::Element(el) => Ok(el),
        Node::Text(_) => Err(LiveError::patch(format!("{:?} is not an element", path))),
    }
}

fn out_of_bounds(path: &[usize], index: usize) -> LiveError {
    LiveError::patch(format!("child index {} out of bounds at {:?}", index, path))
}
