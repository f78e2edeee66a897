//! Online distinct-substring counting with a suffix automaton
//!
//! Every appended character extends the automaton in amortized O(1) and bumps
//! the distinct-substring total by `max_len(cur) - max_len(link(cur))`, so the
//! count is never recomputed from scratch.
//!
//! Nodes live in an arena addressed by `u32` indices. [`SuffixAutomaton::clear`]
//! keeps the arena (and each node's transition map) allocated so a recycled
//! automaton does not reallocate on its next use.

use std::collections::HashMap;

use crate::pool::Recycle;

const ROOT: u32 = 0;

#[derive(Debug, Default)]
struct Node {
    next: HashMap<char, u32>,
    link: u32,
    max_len: u32,
}

/// Suffix automaton over `char`s that tracks the number of distinct substrings
#[derive(Debug)]
pub struct SuffixAutomaton {
    nodes: Vec<Node>,
    /// Nodes `[0, live)` are in use; the rest are spare slots
    live: usize,
    last: u32,
    len: u32,
    unique: u64,
}

impl Default for SuffixAutomaton {
    fn default() -> Self {
        Self::new()
    }
}

impl SuffixAutomaton {
    pub fn new() -> Self {
        Self {
            nodes: vec![Node::default()],
            live: 1,
            last: ROOT,
            len: 0,
            unique: 0,
        }
    }

    /// Append every character of `s`
    pub fn add_str(&mut self, s: &str) {
        for c in s.chars() {
            self.add_char(c);
        }
    }

    /// Append one character
    pub fn add_char(&mut self, c: char) {
        let cur = self.alloc(self.node(self.last).max_len + 1, ROOT);

        let mut p = self.last;
        let mut found = None;
        loop {
            if self.node(p).next.contains_key(&c) {
                found = Some(p);
                break;
            }
            self.node_mut(p).next.insert(c, cur);
            if p == ROOT {
                break;
            }
            p = self.node(p).link;
        }

        match found {
            None => self.node_mut(cur).link = ROOT,
            Some(q) => {
                let r = self.node(q).next[&c];
                if self.node(r).max_len == self.node(q).max_len + 1 {
                    self.node_mut(cur).link = r;
                } else {
                    let clone = self.alloc(self.node(q).max_len + 1, self.node(r).link);

                    // Copy r's transitions into the (possibly recycled) clone map
                    let src = std::mem::take(&mut self.node_mut(r).next);
                    self.node_mut(clone).next.clone_from(&src);
                    self.node_mut(r).next = src;

                    self.node_mut(r).link = clone;
                    self.node_mut(cur).link = clone;

                    let mut p = q;
                    while self.node(p).next.get(&c) == Some(&r) {
                        self.node_mut(p).next.insert(c, clone);
                        if p == ROOT {
                            break;
                        }
                        p = self.node(p).link;
                    }
                }
            }
        }

        let link = self.node(cur).link;
        self.unique += u64::from(self.node(cur).max_len - self.node(link).max_len);
        self.last = cur;
        self.len += 1;
    }

    /// Number of characters appended so far
    pub fn len(&self) -> u32 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Number of distinct substrings of everything appended so far
    #[cfg(test)]
    pub fn unique_substrings(&self) -> u64 {
        self.unique
    }

    /// Fraction of all substrings that are distinct
    ///
    /// 1.0 means no repetition; values near 0 mean the text is dominated by
    /// repeats. An empty automaton reports 1.0.
    pub fn repeatness(&self) -> f64 {
        if self.is_empty() {
            return 1.0;
        }
        let n = u64::from(self.len);
        self.unique as f64 / (n * (n + 1) / 2) as f64
    }

    /// Reset to empty while keeping node storage for reuse
    pub fn clear(&mut self) {
        let root = &mut self.nodes[ROOT as usize];
        root.next.clear();
        root.link = ROOT;
        root.max_len = 0;
        self.live = 1;
        self.last = ROOT;
        self.len = 0;
        self.unique = 0;
    }

    fn alloc(&mut self, max_len: u32, link: u32) -> u32 {
        let idx = self.live;
        if idx < self.nodes.len() {
            let node = &mut self.nodes[idx];
            node.next.clear();
            node.link = link;
            node.max_len = max_len;
        } else {
            self.nodes.push(Node {
                next: HashMap::new(),
                link,
                max_len,
            });
        }
        self.live += 1;
        idx as u32
    }

    fn node(&self, idx: u32) -> &Node {
        &self.nodes[idx as usize]
    }

    fn node_mut(&mut self, idx: u32) -> &mut Node {
        &mut self.nodes[idx as usize]
    }
}

impl Recycle for SuffixAutomaton {
    fn recycle(&mut self) {
        self.clear();
    }
}
