//! In-order traversal.
//!
//! A [`Position`] is a root-to-node path plus a slot in the last node. The
//! in-order successor of an internal item is the least item of its right
//! subtree; the successor of the last item of a leaf is found by climbing
//! until a parent has an item right of the step taken. Predecessors mirror
//! this.

use std::cmp::Ordering;
use std::mem;

use super::entry::Entry;
use super::node::{Node, NodeLayout};
use super::ops::{self, Location, Step, MAX_HEIGHT};
use super::{BTree, TreeMeta};
use crate::block::BlockStorage;
use crate::store::Space;
use crate::{BlockId, Result, StorageError};

#[derive(Clone)]
pub(crate) struct Position {
    path: Vec<Step>,
    slot: u16,
}

impl Position {
    fn node(&self) -> &Node {
        &self.path[self.path.len() - 1].node
    }

    pub fn key(&self) -> &[u8] {
        self.node().key(self.slot)
    }

    pub fn location(&self) -> Location {
        Location {
            node: self.node().id,
            slot: self.slot,
        }
    }
}

/// Pushes nodes from `id` down to a leaf, following leftmost children (or,
/// with `last`, the child of the last item). Returns the edge slot of the
/// leaf.
fn descend_edge<S: BlockStorage>(
    space: &mut Space<S>,
    layout: NodeLayout,
    path: &mut Vec<Step>,
    mut id: BlockId,
    mut via: Option<u16>,
    last: bool,
) -> Result<Option<u16>> {
    loop {
        if path.len() >= MAX_HEIGHT {
            return Err(StorageError::corrupted(id, "tree deeper than any valid tree"));
        }
        let node = Node::load(space, id, layout)?;
        let edge = if last { node.last()? } else { node.first() };
        if node.is_leaf() {
            path.push(Step { node, via });
            return Ok(edge);
        }
        let (child, child_via) = match (last, edge) {
            (true, Some(slot)) => (node.child(slot), Some(slot)),
            _ => (node.leftmost(), None),
        };
        path.push(Step { node, via });
        id = child;
        via = child_via;
    }
}

fn edge<S: BlockStorage>(space: &mut Space<S>, meta: &TreeMeta, last: bool) -> Result<Option<Position>> {
    let mut path = Vec::new();
    let slot = descend_edge(space, meta.layout, &mut path, meta.root, None, last)?;
    Ok(slot.map(|slot| Position { path, slot }))
}

pub(crate) fn successor<S: BlockStorage>(
    space: &mut Space<S>,
    layout: NodeLayout,
    pos: Position,
) -> Result<Option<Position>> {
    let Position { mut path, slot } = pos;
    let (leaf, child, next) = {
        let node = &path[path.len() - 1].node;
        (node.is_leaf(), node.child(slot), node.next(slot))
    };

    if !leaf {
        let first = descend_edge(space, layout, &mut path, child, Some(slot), false)?;
        let slot = first.ok_or_else(|| StorageError::corrupted(child, "empty subtree"))?;
        return Ok(Some(Position { path, slot }));
    }
    if let Some(slot) = next {
        return Ok(Some(Position { path, slot }));
    }
    while let Some(step) = path.pop() {
        let Some(parent) = path.last() else {
            break;
        };
        let candidate = match step.via {
            Some(s) => parent.node.next(s),
            None => parent.node.first(),
        };
        if let Some(slot) = candidate {
            return Ok(Some(Position { path, slot }));
        }
    }
    Ok(None)
}

pub(crate) fn predecessor<S: BlockStorage>(
    space: &mut Space<S>,
    layout: NodeLayout,
    pos: Position,
) -> Result<Option<Position>> {
    let Position { mut path, slot } = pos;
    let (leaf, prev, left_child) = {
        let node = &path[path.len() - 1].node;
        let prev = node.prev_of(slot)?;
        let left_child = match prev {
            Some(p) => node.child(p),
            None => node.leftmost(),
        };
        (node.is_leaf(), prev, left_child)
    };

    if !leaf {
        let last = descend_edge(space, layout, &mut path, left_child, prev, true)?;
        let slot = last.ok_or_else(|| StorageError::corrupted(left_child, "empty subtree"))?;
        return Ok(Some(Position { path, slot }));
    }
    if let Some(slot) = prev {
        return Ok(Some(Position { path, slot }));
    }
    while let Some(step) = path.pop() {
        if path.is_empty() {
            break;
        }
        if let Some(slot) = step.via {
            return Ok(Some(Position { path, slot }));
        }
    }
    Ok(None)
}

/// First item not less than `key`.
fn seek_ge<S: BlockStorage>(space: &mut Space<S>, meta: &TreeMeta, key: &[u8]) -> Result<Option<Position>> {
    let (path, search) = ops::descend(space, meta, key)?;
    match (search.next, search.prev) {
        (Some(slot), _) => Ok(Some(Position { path, slot })),
        (None, Some(slot)) => successor(space, meta.layout, Position { path, slot }),
        (None, None) => Ok(None),
    }
}

/// Last item not greater than `key`.
fn seek_le<S: BlockStorage>(space: &mut Space<S>, meta: &TreeMeta, key: &[u8]) -> Result<Option<Position>> {
    let (path, search) = ops::descend(space, meta, key)?;
    if search.exact {
        if let Some(slot) = search.next {
            return Ok(Some(Position { path, slot }));
        }
    }
    match (search.prev, search.next) {
        (Some(slot), _) => Ok(Some(Position { path, slot })),
        (None, Some(slot)) => predecessor(space, meta.layout, Position { path, slot }),
        (None, None) => Ok(None),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Direction {
    Ascending,
    Descending,
}

impl Direction {
    fn step<S: BlockStorage>(
        self,
        space: &mut Space<S>,
        layout: NodeLayout,
        pos: Position,
    ) -> Result<Option<Position>> {
        match self {
            Direction::Ascending => successor(space, layout, pos),
            Direction::Descending => predecessor(space, layout, pos),
        }
    }

    fn start<S: BlockStorage>(
        self,
        space: &mut Space<S>,
        meta: &TreeMeta,
        key: Option<&[u8]>,
    ) -> Result<Option<Position>> {
        match (self, key) {
            (Direction::Ascending, None) => edge(space, meta, false),
            (Direction::Descending, None) => edge(space, meta, true),
            (Direction::Ascending, Some(key)) => seek_ge(space, meta, key),
            (Direction::Descending, Some(key)) => seek_le(space, meta, key),
        }
    }

    /// First item strictly past `key` in this direction.
    fn resume<S: BlockStorage>(
        self,
        space: &mut Space<S>,
        meta: &TreeMeta,
        key: &[u8],
    ) -> Result<Option<Position>> {
        match self.start(space, meta, Some(key))? {
            Some(pos) if (meta.cmp)(pos.key(), key) == Ordering::Equal => {
                self.step(space, meta.layout, pos)
            }
            other => Ok(other),
        }
    }
}

enum State {
    Start,
    At { pos: Position, version: u64 },
    Done,
}

/// Ordered iterator over the entries of a tree.
///
/// The iterator remembers its last position. If the tree changed shape in
/// between two calls to `next`, it re-seeks from the last key it returned,
/// so inserts and deletes during iteration are tolerated.
pub struct Entries<S: BlockStorage> {
    tree: BTree<S>,
    direction: Direction,
    start: Option<Vec<u8>>,
    state: State,
}

impl<S: BlockStorage> Entries<S> {
    pub(crate) fn new(tree: BTree<S>, direction: Direction, start: Option<Vec<u8>>) -> Self {
        Self {
            tree,
            direction,
            start,
            state: State::Start,
        }
    }

    /// Restarts the iteration from its initial bound.
    pub fn rewind(&mut self) {
        self.state = State::Start;
    }

    fn advance(&mut self) -> Result<Option<Entry<S>>> {
        let direction = self.direction;
        let start = self.start.as_deref();
        let state = mem::replace(&mut self.state, State::Done);

        let found = self.tree.with_meta(|space, meta, _| {
            let pos = match state {
                State::Done => return Ok(None),
                State::Start => direction.start(space, meta, start)?,
                State::At { pos, version } if version == meta.version => {
                    direction.step(space, meta.layout, pos)?
                }
                State::At { pos, .. } => direction.resume(space, meta, pos.key())?,
            };
            Ok(pos.map(|pos| (pos, meta.version, meta.next_lease())))
        })?;

        let Some((pos, version, lease)) = found else {
            return Ok(None);
        };
        let entry = Entry::new(
            self.tree.clone(),
            pos.key().to_vec(),
            pos.location(),
            version,
            lease,
        );
        self.state = State::At { pos, version };
        Ok(Some(entry))
    }
}

impl<S: BlockStorage> Iterator for Entries<S> {
    type Item = Result<Entry<S>>;

    fn next(&mut self) -> Option<Self::Item> {
        self.advance().transpose()
    }
}
