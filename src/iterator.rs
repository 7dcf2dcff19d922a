//! The engine's iterator abstraction and the multi-way merge over it.
//!
//! Iterators are stateful cursors: positioned or invalid, moved with
//! next/prev/seek. Every sorted structure in the engine (skip list, block,
//! table, level file list) exposes one, which is what lets compactions and
//! scans treat all of them uniformly.

use std::cmp::Ordering;
use std::sync::Arc;

use crate::keys::Comparator;

/// A stateful cursor over a sorted key space.
///
/// `key` and `value` may only be called while `valid` returns true; the
/// returned slices live until the next repositioning call.
pub trait Iter {
    fn valid(&self) -> bool;

    fn key(&self) -> &[u8];

    fn value(&self) -> &[u8];

    /// Advances to the next entry; positioned at the first entry after a
    /// `seek_to_first` on an empty source becomes invalid.
    fn next(&mut self);

    /// Steps back to the previous entry; becomes invalid before the first.
    fn prev(&mut self);

    /// Positions at the first entry with key >= target.
    fn seek(&mut self, target: &[u8]);

    fn seek_to_first(&mut self);

    fn seek_to_last(&mut self);
}

/// An always-invalid iterator, used for missing or unreadable sources.
pub struct EmptyIter;

impl Iter for EmptyIter {
    fn valid(&self) -> bool {
        false
    }
    fn key(&self) -> &[u8] {
        unreachable!("key on invalid iterator")
    }
    fn value(&self) -> &[u8] {
        unreachable!("value on invalid iterator")
    }
    fn next(&mut self) {}
    fn prev(&mut self) {}
    fn seek(&mut self, _target: &[u8]) {}
    fn seek_to_first(&mut self) {}
    fn seek_to_last(&mut self) {}
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Direction {
    Forward,
    Backward,
}

/// Merges N child iterators into one ordered stream. Duplicate keys are
/// preserved: a key present in K children is yielded K times, newest child
/// first when the comparator ties.
pub struct MergeIterator {
    cmp: Arc<dyn Comparator>,
    children: Vec<Box<dyn Iter>>,
    current: Option<usize>,
    direction: Direction,
}

impl MergeIterator {
    pub fn new(cmp: Arc<dyn Comparator>, children: Vec<Box<dyn Iter>>) -> MergeIterator {
        MergeIterator {
            cmp,
            children,
            current: None,
            direction: Direction::Forward,
        }
    }

    fn find_smallest(&mut self) {
        let mut smallest: Option<usize> = None;
        for (i, child) in self.children.iter().enumerate() {
            if !child.valid() {
                continue;
            }
            match smallest {
                None => smallest = Some(i),
                Some(s) => {
                    if self.cmp.compare(child.key(), self.children[s].key()) == Ordering::Less {
                        smallest = Some(i);
                    }
                }
            }
        }
        self.current = smallest;
    }

    fn find_largest(&mut self) {
        let mut largest: Option<usize> = None;
        for (i, child) in self.children.iter().enumerate() {
            if !child.valid() {
                continue;
            }
            match largest {
                None => largest = Some(i),
                Some(l) => {
                    if self.cmp.compare(child.key(), self.children[l].key())
                        != Ordering::Less
                    {
                        largest = Some(i);
                    }
                }
            }
        }
        self.current = largest;
    }
}

impl Iter for MergeIterator {
    fn valid(&self) -> bool {
        self.current.is_some()
    }

    fn key(&self) -> &[u8] {
        self.children[self.current.expect("valid")].key()
    }

    fn value(&self) -> &[u8] {
        self.children[self.current.expect("valid")].value()
    }

    fn next(&mut self) {
        let current = self.current.expect("valid");

        // After backward motion the non-current children sit before the
        // current key; realign them to just after it.
        if self.direction == Direction::Backward {
            let key = self.children[current].key().to_vec();
            for i in 0..self.children.len() {
                if i == current {
                    continue;
                }
                let child = &mut self.children[i];
                child.seek(&key);
                if child.valid() && self.cmp.compare(child.key(), &key) == Ordering::Equal
                {
                    child.next();
                }
            }
            self.direction = Direction::Forward;
        }

        self.children[current].next();
        self.find_smallest();
    }

    fn prev(&mut self) {
        let current = self.current.expect("valid");

        if self.direction == Direction::Forward {
            let key = self.children[current].key().to_vec();
            for i in 0..self.children.len() {
                if i == current {
                    continue;
                }
                let child = &mut self.children[i];
                child.seek(&key);
                if child.valid() {
                    // Positioned at the first entry >= key; the entry before
                    // it is the child's predecessor of the current key.
                    child.prev();
                } else {
                    // Every entry in this child is smaller than key.
                    child.seek_to_last();
                }
            }
            self.direction = Direction::Backward;
        }

        self.children[current].prev();
        self.find_largest();
    }

    fn seek(&mut self, target: &[u8]) {
        for child in &mut self.children {
            child.seek(target);
        }
        self.direction = Direction::Forward;
        self.find_smallest();
    }

    fn seek_to_first(&mut self) {
        for child in &mut self.children {
            child.seek_to_first();
        }
        self.direction = Direction::Forward;
        self.find_smallest();
    }

    fn seek_to_last(&mut self) {
        for child in &mut self.children {
            child.seek_to_last();
        }
        self.direction = Direction::Backward;
        self.find_largest();
    }
}
