// Copyright 2026-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::memory::NodeMemory;
use crate::node::{Node, MAX_LEVEL, SPAN};
use crate::tree::RadixTree;
use crate::value::TreeValue;
use crate::RadixTreeError;

#[derive(Clone, Copy)]
struct LevelIter {
    node: Option<Node>,
    idx: usize,
}

/// Ascending walk over a tree. Yields an error, then stops, if a node
/// cannot be resolved.
///
/// The tree must not change while the iterator is alive; for a shared tree
/// the iterator borrows the lock guard it came from.
pub struct Iter<'t, V: TreeValue, M: NodeMemory> {
    tree: &'t RadixTree<V, M>,
    levels: [LevelIter; MAX_LEVEL],
    top_level: usize,
    cur_level: usize,
    key: u64,
    started: bool,
    done: bool,
}

impl<'t, V: TreeValue, M: NodeMemory> Iter<'t, V, M> {
    pub(crate) fn new(tree: &'t RadixTree<V, M>) -> Self {
        Iter {
            tree,
            levels: [LevelIter { node: None, idx: 0 }; MAX_LEVEL],
            top_level: 0,
            cur_level: 0,
            key: 0,
            started: false,
            done: false,
        }
    }

    fn start(&mut self) -> Result<(), RadixTreeError> {
        let ctl = self.tree.ctl();
        // SAFETY: the caller holds at least shared access for 't.
        let (root, start_shift) = unsafe { ((*ctl).root, (*ctl).start_shift) };
        self.top_level = (start_shift / SPAN) as usize;
        self.cur_level = self.top_level;
        self.levels[self.top_level] = LevelIter {
            node: Some(self.tree.node(root)?),
            idx: 0,
        };
        Ok(())
    }

    fn advance(&mut self) -> Result<Option<(u64, &'t V)>, RadixTreeError> {
        if !self.started {
            self.started = true;
            self.start()?;
        }
        loop {
            let level = &mut self.levels[self.cur_level];
            let Some(node) = level.node else {
                return Ok(None);
            };
            // SAFETY: nodes on the stack stay live while the tree is
            // borrowed without modification.
            let next = unsafe { node.next_child(&mut level.idx)? };
            let Some((chunk, slot)) = next else {
                if self.cur_level == self.top_level {
                    return Ok(None);
                }
                self.cur_level += 1;
                continue;
            };

            let shift = self.cur_level as u32 * SPAN;
            self.key = (self.key & !(0xFF << shift)) | (u64::from(chunk) << shift);
            if self.cur_level == 0 {
                // SAFETY: as above; values live as long as their slots.
                let value = unsafe { &*self.tree.value_at(slot)?.as_ptr() };
                return Ok(Some((self.key, value)));
            }
            // SAFETY: inner slots hold node pointers.
            let child = self.tree.node(unsafe { *slot })?;
            self.cur_level -= 1;
            self.levels[self.cur_level] = LevelIter {
                node: Some(child),
                idx: 0,
            };
        }
    }
}

impl<'t, V: TreeValue, M: NodeMemory> Iterator for Iter<'t, V, M> {
    type Item = Result<(u64, &'t V), RadixTreeError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.advance() {
            Ok(Some(entry)) => Some(Ok(entry)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(err) => {
                self.done = true;
                Some(Err(err))
            }
        }
    }
}

impl<V: TreeValue, M: NodeMemory> core::iter::FusedIterator for Iter<'_, V, M> {}

#[cfg(test)]
mod tests {
    use crate::RadixTree;

    #[test]
    fn empty_tree_yields_nothing() {
        let tree = RadixTree::<u64>::new().unwrap();
        assert_eq!(tree.iter().count(), 0);
    }

    #[test]
    fn keys_come_back_sorted_across_levels() {
        let mut tree = RadixTree::<u64>::new().unwrap();
        let mut keys: Vec<u64> = (0..2000u64)
            .map(|i| i.wrapping_mul(0x9E37_79B9_7F4A_7C15) >> (i % 50))
            .collect();
        for &key in &keys {
            tree.set(key, &!key).unwrap();
        }
        keys.sort_unstable();
        keys.dedup();
        let entries: Vec<(u64, u64)> = tree.iter().map(|e| e.map(|(k, v)| (k, *v)).unwrap()).collect();
        assert_eq!(entries.len(), keys.len());
        for ((key, value), expected) in entries.into_iter().zip(keys) {
            assert_eq!(key, expected);
            assert_eq!(value, !expected);
        }
    }

    #[test]
    fn iteration_after_deletes_skips_holes() {
        let mut tree = RadixTree::<u8>::new().unwrap();
        for key in 0..600u64 {
            tree.set(key, &(key as u8)).unwrap();
        }
        for key in (0..600u64).filter(|k| k % 3 != 0) {
            tree.delete(key).unwrap();
        }
        let keys: Vec<u64> = tree.iter().map(|e| e.unwrap().0).collect();
        assert_eq!(keys, (0..600u64).step_by(3).collect::<Vec<_>>());
    }
}
