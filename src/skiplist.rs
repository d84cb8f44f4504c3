//! Order-statistics skip list
//!
//! Nodes live in an arena (`Vec<Node<K>>`) and link to each other by index, so the
//! structure needs no `unsafe` and freed slots are recycled through a free list.
//! Every forward link records its *span*: the number of level-0 steps it skips.
//! Summing spans along a search path yields a key's 1-based rank, and walking spans
//! down from the head finds the key at a given rank, both in O(log N) expected time.
//!
//! A link pointing past the last node keeps a span equal to the number of nodes
//! after its origin. Those spans are never followed, only updated, which keeps
//! insert/remove arithmetic uniform.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

const MAX_LEVEL: usize = 32;
const BRANCH_PROBABILITY: f64 = 0.25;
const HEAD: usize = 0;

#[derive(Debug, Clone, Copy, Default)]
struct Link {
    next: Option<usize>,
    span: usize,
}

#[derive(Debug)]
struct Node<K> {
    /// `None` for the head sentinel and for freed slots.
    key: Option<K>,
    links: Vec<Link>,
}

/// Skip list supporting rank and select in O(log N) expected time.
///
/// Keys are unique; ordering is whatever `K: Ord` says, smallest key at rank 1.
#[derive(Debug)]
pub struct RankedSkipList<K> {
    nodes: Vec<Node<K>>,
    free: Vec<usize>,
    level: usize,
    len: usize,
    rng: StdRng,
}

impl<K: Ord> RankedSkipList<K> {
    pub fn new() -> Self {
        Self::with_rng(StdRng::from_entropy())
    }

    /// Deterministic level generation, for reproducible tests.
    pub fn with_seed(seed: u64) -> Self {
        Self::with_rng(StdRng::seed_from_u64(seed))
    }

    fn with_rng(rng: StdRng) -> Self {
        let head = Node {
            key: None,
            links: vec![Link::default(); MAX_LEVEL],
        };
        Self {
            nodes: vec![head],
            free: Vec::new(),
            level: 1,
            len: 0,
            rng,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn random_level(&mut self) -> usize {
        let mut level = 1;
        while level < MAX_LEVEL && self.rng.gen::<f64>() < BRANCH_PROBABILITY {
            level += 1;
        }
        level
    }

    fn key_at(&self, node: usize) -> Option<&K> {
        self.nodes[node].key.as_ref()
    }

    fn alloc(&mut self, key: K, level: usize) -> usize {
        let links = vec![Link::default(); level];
        match self.free.pop() {
            Some(slot) => {
                self.nodes[slot] = Node {
                    key: Some(key),
                    links,
                };
                slot
            }
            None => {
                self.nodes.push(Node {
                    key: Some(key),
                    links,
                });
                self.nodes.len() - 1
            }
        }
    }

    fn release(&mut self, node: usize) -> Option<K> {
        let key = self.nodes[node].key.take();
        self.nodes[node].links.clear();
        self.free.push(node);
        key
    }

    /// Insert a key. Returns `false` (and leaves the list untouched) if it is already present.
    pub fn insert(&mut self, key: K) -> bool {
        let mut update = [HEAD; MAX_LEVEL];
        let mut rank = [0usize; MAX_LEVEL];
        let mut x = HEAD;

        for i in (0..self.level).rev() {
            rank[i] = if i + 1 == self.level { 0 } else { rank[i + 1] };
            while let Some(next) = self.nodes[x].links[i].next {
                match self.key_at(next) {
                    Some(k) if *k < key => {
                        rank[i] += self.nodes[x].links[i].span;
                        x = next;
                    }
                    _ => break,
                }
            }
            update[i] = x;
        }

        if let Some(next) = self.nodes[x].links[0].next {
            if self.key_at(next) == Some(&key) {
                return false;
            }
        }

        let level = self.random_level();
        if level > self.level {
            for i in self.level..level {
                rank[i] = 0;
                update[i] = HEAD;
                self.nodes[HEAD].links[i] = Link {
                    next: None,
                    span: self.len,
                };
            }
            self.level = level;
        }

        let node = self.alloc(key, level);
        for i in 0..level {
            let prev = update[i];
            let prev_link = self.nodes[prev].links[i];
            let skipped = rank[0] - rank[i];
            self.nodes[node].links[i] = Link {
                next: prev_link.next,
                span: prev_link.span - skipped,
            };
            self.nodes[prev].links[i] = Link {
                next: Some(node),
                span: skipped + 1,
            };
        }
        for i in level..self.level {
            self.nodes[update[i]].links[i].span += 1;
        }

        self.len += 1;
        true
    }

    /// Remove a key, returning it if it was present.
    pub fn remove(&mut self, key: &K) -> Option<K> {
        let mut update = [HEAD; MAX_LEVEL];
        let mut x = HEAD;

        for i in (0..self.level).rev() {
            while let Some(next) = self.nodes[x].links[i].next {
                match self.key_at(next) {
                    Some(k) if k < key => x = next,
                    _ => break,
                }
            }
            update[i] = x;
        }

        let target = self.nodes[x].links[0].next?;
        if self.key_at(target) != Some(key) {
            return None;
        }

        for i in 0..self.level {
            let prev = update[i];
            if self.nodes[prev].links[i].next == Some(target) {
                let removed = self.nodes[target].links[i];
                let link = &mut self.nodes[prev].links[i];
                link.span = link.span + removed.span - 1;
                link.next = removed.next;
            } else {
                self.nodes[prev].links[i].span -= 1;
            }
        }

        while self.level > 1 && self.nodes[HEAD].links[self.level - 1].next.is_none() {
            self.level -= 1;
        }

        self.len -= 1;
        self.release(target)
    }

    /// 1-based rank of `key`, or `None` if absent.
    pub fn rank(&self, key: &K) -> Option<usize> {
        let mut rank = 0;
        let mut x = HEAD;

        for i in (0..self.level).rev() {
            while let Some(next) = self.nodes[x].links[i].next {
                match self.key_at(next) {
                    Some(k) if k <= key => {
                        rank += self.nodes[x].links[i].span;
                        x = next;
                    }
                    _ => break,
                }
            }
            if x != HEAD && self.key_at(x) == Some(key) {
                return Some(rank);
            }
        }

        None
    }

    fn node_at_rank(&self, rank: usize) -> Option<usize> {
        if rank == 0 || rank > self.len {
            return None;
        }

        let mut traversed = 0;
        let mut x = HEAD;
        for i in (0..self.level).rev() {
            while let Some(next) = self.nodes[x].links[i].next {
                let span = self.nodes[x].links[i].span;
                if traversed + span > rank {
                    break;
                }
                traversed += span;
                x = next;
            }
            if traversed == rank {
                return Some(x);
            }
        }

        None
    }

    /// Key stored at 1-based `rank`.
    pub fn get_by_rank(&self, rank: usize) -> Option<&K> {
        self.node_at_rank(rank).and_then(|node| self.key_at(node))
    }

    /// Keys from rank `start` onwards (1-based), in order.
    pub fn iter_from(&self, start: usize) -> Iter<'_, K> {
        Iter {
            list: self,
            node: self.node_at_rank(start),
        }
    }

    pub fn iter(&self) -> Iter<'_, K> {
        Iter {
            list: self,
            node: self.nodes[HEAD].links[0].next,
        }
    }
}

impl<K: Ord> Default for RankedSkipList<K> {
    fn default() -> Self {
        Self::new()
    }
}

/// In-order walk along level 0.
pub struct Iter<'a, K> {
    list: &'a RankedSkipList<K>,
    node: Option<usize>,
}

impl<'a, K> Iterator for Iter<'a, K> {
    type Item = &'a K;

    fn next(&mut self) -> Option<Self::Item> {
        let node = self.node?;
        let entry = &self.list.nodes[node];
        self.node = entry.links.first().and_then(|link| link.next);
        entry.key.as_ref()
    }
}
