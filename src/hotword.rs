//! Time-windowed phrase trie
//!
//! Every chat line is recorded as one phrase. Each node keeps the
//! timestamps at which the phrase ending there was recorded; a node with
//! at least one timestamp is a live phrase, the rest are structural.
//!
//! Nodes live in an arena and refer to their parent by index, which keeps
//! phrase reconstruction a walk up the parent chain without any shared
//! ownership. Freed slots are reused.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};

/// Arena index of a node
type NodeId = usize;

const ROOT: NodeId = 0;

#[derive(Debug, Default)]
struct Node {
    key: char,
    parent: Option<NodeId>,
    children: HashMap<char, NodeId>,
    /// Record times, oldest first
    stamps: Vec<i64>,
}

impl Node {
    fn is_live(&self) -> bool {
        !self.stamps.is_empty()
    }
}

/// Phrase trie with per-record timestamps
#[derive(Debug)]
pub struct HotWords {
    nodes: Vec<Node>,
    free: Vec<NodeId>,
}

impl Default for HotWords {
    fn default() -> Self {
        Self::new()
    }
}

impl HotWords {
    pub fn new() -> Self {
        Self {
            nodes: vec![Node::default()],
            free: Vec::new(),
        }
    }

    /// Record `text` once at `timestamp` (unix seconds)
    pub fn insert(&mut self, text: &str, timestamp: i64) {
        let mut current = ROOT;
        for c in text.chars() {
            current = match self.nodes[current].children.get(&c) {
                Some(&child) => child,
                None => self.alloc(current, c),
            };
        }

        if current == ROOT {
            return;
        }

        let stamps = &mut self.nodes[current].stamps;
        let at = stamps.partition_point(|&t| t <= timestamp);
        stamps.insert(at, timestamp);
    }

    /// Drop every record older than `cutoff` and prune dead branches
    pub fn evict_older_than(&mut self, cutoff: i64) {
        let children: Vec<NodeId> = self.nodes[ROOT].children.values().copied().collect();
        for child in children {
            self.evict_node(child, cutoff);
        }
    }

    /// The `k` phrases with the most live records, most frequent first.
    ///
    /// Order among phrases with equal counts is unspecified.
    pub fn top_k(&self, k: usize) -> Vec<String> {
        if k == 0 {
            return Vec::new();
        }

        let mut heap: BinaryHeap<Reverse<(usize, NodeId)>> = BinaryHeap::with_capacity(k + 1);
        let mut stack: Vec<NodeId> = self.nodes[ROOT].children.values().copied().collect();
        while let Some(id) = stack.pop() {
            let node = &self.nodes[id];
            if node.is_live() {
                heap.push(Reverse((node.stamps.len(), id)));
                if heap.len() > k {
                    heap.pop();
                }
            }
            stack.extend(node.children.values().copied());
        }

        let mut hottest = Vec::with_capacity(heap.len());
        while let Some(Reverse((_, id))) = heap.pop() {
            hottest.push(self.phrase(id));
        }
        hottest.reverse();
        hottest
    }

    /// Live record count of one phrase
    pub fn points(&self, text: &str) -> usize {
        self.find(text)
            .map(|id| self.nodes[id].stamps.len())
            .unwrap_or(0)
    }

    /// Every live phrase starting with `prefix`
    pub fn starts_with(&self, prefix: &str) -> Vec<String> {
        let Some(start) = self.find(prefix) else {
            return Vec::new();
        };

        let mut found = Vec::new();
        let mut stack = vec![start];
        while let Some(id) = stack.pop() {
            let node = &self.nodes[id];
            if id != ROOT && node.is_live() {
                found.push(self.phrase(id));
            }
            stack.extend(node.children.values().copied());
        }
        found
    }

    /// Whether no phrase has a live record
    pub fn is_empty(&self) -> bool {
        self.nodes[ROOT].children.is_empty()
    }

    fn find(&self, text: &str) -> Option<NodeId> {
        text.chars()
            .try_fold(ROOT, |id, c| self.nodes[id].children.get(&c).copied())
    }

    fn alloc(&mut self, parent: NodeId, key: char) -> NodeId {
        let node = Node {
            key,
            parent: Some(parent),
            ..Node::default()
        };
        let id = match self.free.pop() {
            Some(id) => {
                self.nodes[id] = node;
                id
            }
            None => {
                self.nodes.push(node);
                self.nodes.len() - 1
            }
        };
        self.nodes[parent].children.insert(key, id);
        id
    }

    fn evict_node(&mut self, id: NodeId, cutoff: i64) {
        let stamps = &mut self.nodes[id].stamps;
        let expired = stamps.partition_point(|&t| t < cutoff);
        stamps.drain(..expired);

        let children: Vec<NodeId> = self.nodes[id].children.values().copied().collect();
        for child in children {
            self.evict_node(child, cutoff);
        }

        self.prune(id);
    }

    /// Unlink `id` and its ancestors while they are dead and childless
    fn prune(&mut self, mut id: NodeId) {
        while let Some(parent) = self.nodes[id].parent {
            let node = &self.nodes[id];
            if node.is_live() || !node.children.is_empty() {
                return;
            }
            let key = node.key;
            self.nodes[parent].children.remove(&key);
            self.nodes[id] = Node::default();
            self.free.push(id);
            id = parent;
        }
    }

    fn phrase(&self, mut id: NodeId) -> String {
        let mut reversed = Vec::new();
        while let Some(parent) = self.nodes[id].parent {
            reversed.push(self.nodes[id].key);
            id = parent;
        }
        reversed.into_iter().rev().collect()
    }
}
