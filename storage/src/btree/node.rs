//! On-disk B-tree node.
//!
//! ```text
//! 0   magic          0x81 0xab
//! 2   flags          u16 (bit 0 = leaf)
//! 4   first slot     u16 (0xffff = empty)
//! 6   leftmost child u64 (0 = leaf)
//! 14  slot bitmap    ceil(slots / 8) bytes, 1 = occupied
//! ..  slots          slots * slot_size
//!
//! slot: next slot u16 | child i64 | item
//! item: key len | key | value len | value bytes, or (value len 0) overflow head u64
//! ```
//!
//! Slots never move. Key order is the singly linked list starting at
//! `first slot`; inserting or removing an item only relinks it.

use std::cmp::Ordering;

use crate::block::BlockStorage;
use crate::bytes_le::{put_u16, put_u64, u16_at, u64_at};
use crate::config::KeyComparator;
use crate::store::Space;
use crate::superblock::SUPERBLOCK_ID;
use crate::{BlockId, Result, StorageError};

pub(crate) const NODE_MAGIC: [u8; 2] = [0x81, 0xab];
pub(crate) const NO_SLOT: u16 = 0xffff;

const FLAG_LEAF: u16 = 1;
const OFF_FLAGS: usize = 2;
const OFF_FIRST: usize = 4;
const OFF_LEFTMOST: usize = 6;
const OFF_BITMAP: usize = 14;
/// Next-slot index plus child pointer.
const SLOT_LINKS: usize = 2 + 8;

/// Geometry shared by every node of one tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct NodeLayout {
    pub block_size: usize,
    pub max_key: usize,
    /// Width of the key and value length prefixes.
    pub len_size: usize,
    pub item_size: usize,
    pub slot_size: usize,
    /// `order - 1`
    pub slots: usize,
    pub header_size: usize,
}

impl NodeLayout {
    pub fn new(block_size: usize, max_key: u16) -> Result<Self> {
        let max_key = max_key as usize;
        let bits = usize::BITS - max_key.leading_zeros();
        let len_size = (bits as usize).div_ceil(8).max(1);
        let item_size = max_key + len_size * 2 + 8;
        let slot_size = item_size + SLOT_LINKS;

        let mut slots = block_size.saturating_sub(OFF_BITMAP) / slot_size;
        while slots > 0 && OFF_BITMAP + slots.div_ceil(8) + slots * slot_size > block_size {
            slots -= 1;
        }
        let order = slots + 1;
        if order < 3 {
            return Err(StorageError::InvalidConfig(format!(
                "keys of {} bytes give a fan-out of {} in {}-byte blocks (minimum 3)",
                max_key, order, block_size
            )));
        }

        Ok(Self {
            block_size,
            max_key,
            len_size,
            item_size,
            slot_size,
            slots,
            header_size: OFF_BITMAP + slots.div_ceil(8),
        })
    }

    pub fn order(&self) -> usize {
        self.slots + 1
    }

    pub fn min_items(&self) -> usize {
        (self.order() - 1) / 2
    }

    /// Largest value length a length prefix can express.
    fn max_len_value(&self) -> usize {
        if self.len_size >= 8 {
            usize::MAX
        } else {
            (1usize << (self.len_size * 8)) - 1
        }
    }

    /// Bytes of value that fit inline next to a key of `key_len` bytes.
    pub fn inline_capacity(&self, key_len: usize) -> usize {
        (self.item_size - self.len_size * 2 - key_len).min(self.max_len_value())
    }

    fn read_len(&self, buf: &[u8], off: usize) -> usize {
        buf[off..off + self.len_size]
            .iter()
            .rev()
            .fold(0usize, |acc, &b| (acc << 8) | b as usize)
    }

    fn write_len(&self, buf: &mut [u8], off: usize, len: usize) {
        for (i, b) in buf[off..off + self.len_size].iter_mut().enumerate() {
            *b = (len >> (8 * i)) as u8;
        }
    }

    /// Encodes a fresh item holding `key` and `value`.
    pub fn encode_item(&self, key: &[u8], value: ItemValue<'_>) -> Vec<u8> {
        let mut item = vec![0u8; self.item_size];
        self.write_len(&mut item, 0, key.len());
        item[self.len_size..self.len_size + key.len()].copy_from_slice(key);
        self.write_value(&mut item, value);
        item
    }

    pub fn item_key<'a>(&self, item: &'a [u8]) -> &'a [u8] {
        let len = self.read_len(item, 0);
        &item[self.len_size..self.len_size + len]
    }

    pub fn item_value<'a>(&self, item: &'a [u8]) -> ItemValue<'a> {
        let at = self.len_size + self.read_len(item, 0);
        let len = self.read_len(item, at);
        let data = at + self.len_size;
        if len == 0 {
            match u64_at(item, data) {
                0 => ItemValue::Inline(&[]),
                head => ItemValue::Overflow(head),
            }
        } else {
            ItemValue::Inline(&item[data..data + len])
        }
    }

    /// Rewrites the value part of `item`, leaving the key alone.
    pub fn write_value(&self, item: &mut [u8], value: ItemValue<'_>) {
        let at = self.len_size + self.read_len(item, 0);
        let data = at + self.len_size;
        item[at..].fill(0);
        match value {
            ItemValue::Inline(bytes) => {
                self.write_len(item, at, bytes.len());
                item[data..data + bytes.len()].copy_from_slice(bytes);
            }
            ItemValue::Overflow(head) => {
                self.write_len(item, at, 0);
                put_u64(item, data, head);
            }
        }
    }
}

/// Value stored in an item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ItemValue<'a> {
    Inline(&'a [u8]),
    Overflow(BlockId),
}

/// Outcome of searching one node for a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Search {
    /// Last slot whose key is smaller than the search key.
    pub prev: Option<u16>,
    /// First slot whose key is not smaller than the search key.
    pub next: Option<u16>,
    /// Whether `next` holds exactly the search key.
    pub exact: bool,
}

/// In-memory copy of one node block.
#[derive(Clone)]
pub(crate) struct Node {
    pub id: BlockId,
    pub layout: NodeLayout,
    pub dirty: bool,
    buf: Box<[u8]>,
}

impl Node {
    pub fn new_empty(id: BlockId, layout: NodeLayout, leftmost: BlockId) -> Self {
        let mut node = Self {
            id,
            layout,
            dirty: true,
            buf: vec![0u8; layout.block_size].into_boxed_slice(),
        };
        node.buf[0..2].copy_from_slice(&NODE_MAGIC);
        node.set_first(None);
        node.set_leftmost(leftmost);
        node
    }

    pub fn decode(id: BlockId, layout: NodeLayout, buf: Box<[u8]>) -> Result<Self> {
        if buf[0..2] != NODE_MAGIC {
            return Err(StorageError::BadMagic {
                block: id,
                expected: u16::from_le_bytes(NODE_MAGIC) as u32,
                found: u16_at(&buf, 0) as u32,
            });
        }
        let node = Self {
            id,
            layout,
            dirty: false,
            buf,
        };
        let first = u16_at(&node.buf, OFF_FIRST);
        if first != NO_SLOT && (first as usize >= layout.slots || !node.is_used(first)) {
            return Err(StorageError::corrupted(id, format!("bad first slot {}", first)));
        }
        let leaf_flag = u16_at(&node.buf, OFF_FLAGS) & FLAG_LEAF != 0;
        if leaf_flag != (node.leftmost() == 0) {
            return Err(StorageError::corrupted(id, "leaf flag disagrees with leftmost child"));
        }
        for slot in 0..layout.slots as u16 {
            if node.is_used(slot) {
                node.check_item(slot)?;
            }
        }
        // Walks the list once, rejecting cycles and links into free slots
        node.ordered_slots()?;
        Ok(node)
    }

    /// Rejects an occupied slot whose link or length prefixes point outside
    /// the slot.
    fn check_item(&self, slot: u16) -> Result<()> {
        let layout = self.layout;
        let next = u16_at(&self.buf, self.slot_offset(slot));
        if next != NO_SLOT && next as usize >= layout.slots {
            return Err(StorageError::corrupted(
                self.id,
                format!("slot {} links to slot {} past the end", slot, next),
            ));
        }
        let item = self.item(slot);
        let key_len = layout.read_len(item, 0);
        if key_len > layout.max_key {
            return Err(StorageError::corrupted(
                self.id,
                format!("slot {} key length {} exceeds {}", slot, key_len, layout.max_key),
            ));
        }
        let value_len = layout.read_len(item, layout.len_size + key_len);
        let used = layout.len_size * 2 + key_len + value_len;
        if used > layout.item_size {
            return Err(StorageError::corrupted(
                self.id,
                format!(
                    "slot {} value length {} overruns the {}-byte item",
                    slot, value_len, layout.item_size
                ),
            ));
        }
        Ok(())
    }

    pub fn bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn is_leaf(&self) -> bool {
        self.leftmost() == 0
    }

    pub fn leftmost(&self) -> BlockId {
        u64_at(&self.buf, OFF_LEFTMOST)
    }

    pub fn set_leftmost(&mut self, child: BlockId) {
        put_u64(&mut self.buf, OFF_LEFTMOST, child);
        let flags = if child == 0 { FLAG_LEAF } else { 0 };
        put_u16(&mut self.buf, OFF_FLAGS, flags);
        self.dirty = true;
    }

    pub fn first(&self) -> Option<u16> {
        to_slot(u16_at(&self.buf, OFF_FIRST))
    }

    fn set_first(&mut self, slot: Option<u16>) {
        put_u16(&mut self.buf, OFF_FIRST, slot.unwrap_or(NO_SLOT));
        self.dirty = true;
    }

    fn slot_offset(&self, slot: u16) -> usize {
        self.layout.header_size + slot as usize * self.layout.slot_size
    }

    pub fn next(&self, slot: u16) -> Option<u16> {
        to_slot(u16_at(&self.buf, self.slot_offset(slot)))
    }

    fn set_next(&mut self, slot: u16, next: Option<u16>) {
        let off = self.slot_offset(slot);
        put_u16(&mut self.buf, off, next.unwrap_or(NO_SLOT));
        self.dirty = true;
    }

    pub fn child(&self, slot: u16) -> BlockId {
        u64_at(&self.buf, self.slot_offset(slot) + 2)
    }

    pub fn set_child(&mut self, slot: u16, child: BlockId) {
        let off = self.slot_offset(slot) + 2;
        put_u64(&mut self.buf, off, child);
        self.dirty = true;
    }

    pub fn item(&self, slot: u16) -> &[u8] {
        let off = self.slot_offset(slot) + SLOT_LINKS;
        &self.buf[off..off + self.layout.item_size]
    }

    pub fn item_mut(&mut self, slot: u16) -> &mut [u8] {
        self.dirty = true;
        let off = self.slot_offset(slot) + SLOT_LINKS;
        &mut self.buf[off..off + self.layout.item_size]
    }

    pub fn key(&self, slot: u16) -> &[u8] {
        self.layout.item_key(self.item(slot))
    }

    pub fn value(&self, slot: u16) -> ItemValue<'_> {
        self.layout.item_value(self.item(slot))
    }

    pub fn set_value(&mut self, slot: u16, value: ItemValue<'_>) {
        let layout = self.layout;
        layout.write_value(self.item_mut(slot), value);
    }

    pub fn is_used(&self, slot: u16) -> bool {
        let byte = self.buf[OFF_BITMAP + slot as usize / 8];
        byte & (1 << (slot % 8)) != 0
    }

    fn set_used(&mut self, slot: u16, used: bool) {
        let byte = &mut self.buf[OFF_BITMAP + slot as usize / 8];
        if used {
            *byte |= 1 << (slot % 8);
        } else {
            *byte &= !(1 << (slot % 8));
        }
        self.dirty = true;
    }

    pub fn count(&self) -> usize {
        self.buf[OFF_BITMAP..self.layout.header_size]
            .iter()
            .map(|b| b.count_ones() as usize)
            .sum()
    }

    pub fn is_full(&self) -> bool {
        self.count() >= self.layout.slots
    }

    fn free_slot(&self) -> Option<u16> {
        (0..self.layout.slots as u16).find(|&s| !self.is_used(s))
    }

    /// Slots in key order.
    pub fn ordered_slots(&self) -> Result<Vec<u16>> {
        let mut order = Vec::with_capacity(self.count());
        let mut cur = self.first();
        while let Some(slot) = cur {
            if slot as usize >= self.layout.slots || !self.is_used(slot) {
                return Err(StorageError::corrupted(
                    self.id,
                    format!("item list reaches free slot {}", slot),
                ));
            }
            if order.len() >= self.layout.slots {
                return Err(StorageError::corrupted(self.id, "item list has a cycle"));
            }
            order.push(slot);
            cur = self.next(slot);
        }
        if order.len() != self.count() {
            return Err(StorageError::corrupted(
                self.id,
                format!("{} linked items but {} occupied slots", order.len(), self.count()),
            ));
        }
        Ok(order)
    }

    pub fn last(&self) -> Result<Option<u16>> {
        Ok(self.ordered_slots()?.last().copied())
    }

    /// Slot linked right before `slot`.
    pub fn prev_of(&self, slot: u16) -> Result<Option<u16>> {
        let mut prev = None;
        let mut cur = self.first();
        while let Some(s) = cur {
            if s == slot {
                return Ok(prev);
            }
            prev = Some(s);
            cur = self.next(s);
        }
        Err(StorageError::corrupted(
            self.id,
            format!("slot {} is not linked", slot),
        ))
    }

    /// Binary search over the linked items.
    pub fn search(&self, key: &[u8], cmp: &KeyComparator) -> Result<Search> {
        let order = self.ordered_slots()?;
        let idx = order.partition_point(|&s| cmp(self.key(s), key) == Ordering::Less);
        let next = order.get(idx).copied();
        Ok(Search {
            prev: idx.checked_sub(1).map(|i| order[i]),
            next,
            exact: next.is_some_and(|s| cmp(self.key(s), key) == Ordering::Equal),
        })
    }

    /// Stores `item` in a free slot linked right after `prev` (at the front
    /// when `None`).
    pub fn insert_after(&mut self, prev: Option<u16>, item: &[u8], child: BlockId) -> Result<u16> {
        let slot = self
            .free_slot()
            .ok_or_else(|| StorageError::corrupted(self.id, "insert into a full node"))?;
        self.set_used(slot, true);
        self.item_mut(slot).copy_from_slice(item);
        self.set_child(slot, child);
        match prev {
            None => {
                let first = self.first();
                self.set_next(slot, first);
                self.set_first(Some(slot));
            }
            Some(p) => {
                let next = self.next(p);
                self.set_next(slot, next);
                self.set_next(p, Some(slot));
            }
        }
        Ok(slot)
    }

    /// Removes `slot`, whose predecessor in the list is `prev`.
    pub fn unlink(&mut self, slot: u16, prev: Option<u16>) {
        let next = self.next(slot);
        match prev {
            None => self.set_first(next),
            Some(p) => self.set_next(p, next),
        }
        self.set_used(slot, false);
    }

    /// Drops every item, keeping the leftmost child.
    pub fn clear(&mut self) {
        let header = self.layout.header_size;
        self.buf[OFF_BITMAP..header].fill(0);
        self.set_first(None);
    }

    /// `(item, child)` pairs in key order.
    pub fn entries(&self) -> Result<Vec<(Vec<u8>, BlockId)>> {
        Ok(self
            .ordered_slots()?
            .into_iter()
            .map(|s| (self.item(s).to_vec(), self.child(s)))
            .collect())
    }

    /// Appends `(item, child)` pairs after `last`, returning the new slots.
    pub fn extend_after(
        &mut self,
        mut last: Option<u16>,
        entries: &[(Vec<u8>, BlockId)],
    ) -> Result<Vec<u16>> {
        let mut slots = Vec::with_capacity(entries.len());
        for (item, child) in entries {
            let slot = self.insert_after(last, item, *child)?;
            slots.push(slot);
            last = Some(slot);
        }
        Ok(slots)
    }
}

impl Node {
    /// Copies node block `id` out of the cache.
    pub fn load<S: BlockStorage>(space: &mut Space<S>, id: BlockId, layout: NodeLayout) -> Result<Self> {
        if id == SUPERBLOCK_ID || id >= space.superblock.database_size {
            return Err(StorageError::corrupted(
                id,
                format!("node pointer outside 1..{}", space.superblock.database_size),
            ));
        }
        let mut buf = vec![0u8; layout.block_size].into_boxed_slice();
        space.pager.read_block(id, &mut buf)?;
        Self::decode(id, layout, buf)
    }

    /// Writes the node back into the cache if it changed.
    pub fn save<S: BlockStorage>(&mut self, space: &mut Space<S>) -> Result<()> {
        if self.dirty {
            space.pager.write_block(self.id, &self.buf)?;
            self.dirty = false;
        }
        Ok(())
    }
}

fn to_slot(raw: u16) -> Option<u16> {
    (raw != NO_SLOT).then_some(raw)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn cmp() -> KeyComparator {
        Arc::new(|a: &[u8], b: &[u8]| a.cmp(b))
    }

    fn leaf(layout: NodeLayout, keys: &[&[u8]]) -> Node {
        let mut node = Node::new_empty(9, layout, 0);
        let mut last = None;
        for key in keys {
            let item = layout.encode_item(key, ItemValue::Inline(b"v"));
            last = Some(node.insert_after(last, &item, 0).unwrap());
        }
        node
    }

    #[test]
    fn test_layout_sizing() {
        let layout = NodeLayout::new(2048, 16).unwrap();
        assert_eq!(layout.len_size, 1);
        assert_eq!(layout.item_size, 16 + 2 + 8);
        assert!(layout.header_size + layout.slots * layout.slot_size <= 2048);
        assert_eq!(layout.min_items(), (layout.order() - 1) / 2);

        let wide = NodeLayout::new(4096, 300).unwrap();
        assert_eq!(wide.len_size, 2);
    }

    #[test]
    fn test_layout_rejects_tiny_fanout() {
        assert!(NodeLayout::new(64, 40).is_err());
        assert!(NodeLayout::new(4096, 64).is_ok());
    }

    #[test]
    fn test_item_encoding() {
        let layout = NodeLayout::new(1024, 32).unwrap();
        let item = layout.encode_item(b"key", ItemValue::Inline(b"value"));
        assert_eq!(layout.item_key(&item), b"key");
        assert_eq!(layout.item_value(&item), ItemValue::Inline(b"value"));

        let item = layout.encode_item(b"key", ItemValue::Overflow(77));
        assert_eq!(layout.item_value(&item), ItemValue::Overflow(77));

        let item = layout.encode_item(b"", ItemValue::Inline(&[]));
        assert_eq!(layout.item_value(&item), ItemValue::Inline(&[]));
    }

    #[test]
    fn test_inline_capacity_respects_prefix_width() {
        let layout = NodeLayout::new(4096, 255).unwrap();
        assert_eq!(layout.len_size, 1);
        assert_eq!(layout.inline_capacity(0), 255);
        assert_eq!(layout.inline_capacity(200), 263 - 200);
    }

    #[test]
    fn test_search_and_order() {
        let layout = NodeLayout::new(512, 8).unwrap();
        let node = leaf(layout, &[b"b", b"d", b"f"]);

        let s = node.search(b"d", &cmp()).unwrap();
        assert!(s.exact);
        assert_eq!(node.key(s.next.unwrap()), b"d");
        assert_eq!(node.key(s.prev.unwrap()), b"b");

        let s = node.search(b"a", &cmp()).unwrap();
        assert_eq!((s.prev, s.exact), (None, false));
        assert_eq!(node.key(s.next.unwrap()), b"b");

        let s = node.search(b"z", &cmp()).unwrap();
        assert_eq!(s.next, None);
        assert_eq!(node.key(s.prev.unwrap()), b"f");
    }

    #[test]
    fn test_unlink_reuses_slot_without_moving_others() {
        let layout = NodeLayout::new(512, 8).unwrap();
        let mut node = leaf(layout, &[b"a", b"b", b"c"]);
        let order = node.ordered_slots().unwrap();

        node.unlink(order[1], Some(order[0]));
        assert_eq!(node.count(), 2);
        assert_eq!(node.ordered_slots().unwrap(), vec![order[0], order[2]]);

        let item = layout.encode_item(b"bb", ItemValue::Inline(&[]));
        let slot = node.insert_after(Some(order[0]), &item, 0).unwrap();
        assert_eq!(slot, order[1]);
        let keys: Vec<&[u8]> = node
            .ordered_slots()
            .unwrap()
            .into_iter()
            .map(|s| node.key(s))
            .collect();
        assert_eq!(keys, vec![&b"a"[..], b"bb", b"c"]);
    }

    #[test]
    fn test_decode_checks_magic_and_links() {
        let layout = NodeLayout::new(512, 8).unwrap();
        let node = leaf(layout, &[b"x"]);
        let copy = Node::decode(9, layout, node.bytes().to_vec().into_boxed_slice()).unwrap();
        assert_eq!(copy.key(copy.first().unwrap()), b"x");

        let mut raw = node.bytes().to_vec();
        raw[0] = 0;
        let err = Node::decode(9, layout, raw.into_boxed_slice()).err().unwrap();
        assert_eq!(err.kind(), crate::ErrorKind::Format);
    }

    #[test]
    fn test_decode_rejects_bad_length_prefixes() {
        let layout = NodeLayout::new(512, 8).unwrap();
        let node = leaf(layout, &[b"a", b"b"]);
        let slot = node.first().unwrap();
        let item_at = node.slot_offset(slot) + SLOT_LINKS;

        let mut raw = node.bytes().to_vec();
        raw[item_at] = 200;
        let err = Node::decode(9, layout, raw.into_boxed_slice()).err().unwrap();
        assert_eq!(err.kind(), crate::ErrorKind::Corruption);

        // Value length prefix sits after the one-byte key
        let mut raw = node.bytes().to_vec();
        raw[item_at + layout.len_size + 1] = 250;
        let err = Node::decode(9, layout, raw.into_boxed_slice()).err().unwrap();
        assert_eq!(err.kind(), crate::ErrorKind::Corruption);

        let mut raw = node.bytes().to_vec();
        raw[node.slot_offset(slot)] = 0xf0;
        raw[node.slot_offset(slot) + 1] = 0x00;
        let err = Node::decode(9, layout, raw.into_boxed_slice()).err().unwrap();
        assert_eq!(err.kind(), crate::ErrorKind::Corruption);
    }

    #[test]
    fn test_leftmost_sets_leaf_flag() {
        let layout = NodeLayout::new(512, 8).unwrap();
        let mut node = Node::new_empty(3, layout, 0);
        assert!(node.is_leaf());
        node.set_leftmost(42);
        assert!(!node.is_leaf());
        let copy = Node::decode(3, layout, node.bytes().to_vec().into_boxed_slice()).unwrap();
        assert_eq!(copy.leftmost(), 42);
    }
}
