//! Sublist: token trie for subject matching
//!
//! Patterns are split on `.` and stored one token per level. Each node keeps
//! literal children, an optional `*` child and the subscriptions of a trailing
//! `>`. Matching cost depends on subject depth and the wildcard branches
//! actually present, never on the total number of subscriptions.
//!
//! Performance notes:
//! - compact_str keys keep short tokens inline
//! - SmallVec token buffers avoid allocation for typical subject depths
//! - empty nodes are pruned on removal so the trie never grows unbounded

use std::sync::Arc;

use ahash::AHashMap;
use compact_str::CompactString;
use smallvec::SmallVec;

use super::validation::{validate_pattern, FULL_WILDCARD, SEPARATOR, SINGLE_WILDCARD};
use super::{SubjectError, Subscription};

/// Subscriptions registered under one pattern
#[derive(Debug, Default)]
struct Entry {
    psubs: Vec<Arc<Subscription>>,
    qsubs: AHashMap<Arc<str>, Vec<Arc<Subscription>>>,
}

impl Entry {
    fn is_empty(&self) -> bool {
        self.psubs.is_empty() && self.qsubs.is_empty()
    }

    fn insert(&mut self, sub: Arc<Subscription>) {
        match sub.queue {
            Some(ref queue) => self.qsubs.entry(queue.clone()).or_default().push(sub),
            None => self.psubs.push(sub),
        }
    }

    fn remove(&mut self, sub: &Subscription) -> bool {
        let same = |s: &Arc<Subscription>| s.owner == sub.owner && s.sid == sub.sid;
        match sub.queue {
            Some(ref queue) => {
                let Some(members) = self.qsubs.get_mut(queue) else {
                    return false;
                };
                let Some(pos) = members.iter().position(same) else {
                    return false;
                };
                members.swap_remove(pos);
                if members.is_empty() {
                    self.qsubs.remove(queue);
                }
                true
            }
            None => match self.psubs.iter().position(same) {
                Some(pos) => {
                    self.psubs.swap_remove(pos);
                    true
                }
                None => false,
            },
        }
    }

    fn collect(&self, result: &mut SublistResult) {
        result.psubs.extend(self.psubs.iter().cloned());
        for (queue, members) in &self.qsubs {
            result
                .qsubs
                .entry(queue.clone())
                .or_default()
                .extend(members.iter().cloned());
        }
    }

    fn for_each<F>(&self, f: &mut F)
    where
        F: FnMut(&Arc<Subscription>),
    {
        for sub in &self.psubs {
            f(sub);
        }
        for sub in self.qsubs.values().flatten() {
            f(sub);
        }
    }
}

/// Node in the subject trie
#[derive(Debug, Default)]
struct TrieNode {
    /// Subscriptions whose pattern ends at this node
    entry: Entry,
    /// Literal children indexed by token
    children: AHashMap<CompactString, TrieNode>,
    /// Single-token wildcard (*) child
    single_wildcard: Option<Box<TrieNode>>,
    /// Subscriptions whose pattern ends with `>` at this level
    full_wildcard: Entry,
}

impl TrieNode {
    fn is_empty(&self) -> bool {
        self.entry.is_empty()
            && self.full_wildcard.is_empty()
            && self.children.is_empty()
            && self.single_wildcard.is_none()
    }
}

/// Result of matching a subject
#[derive(Debug, Default)]
pub struct SublistResult {
    /// Plain subscriptions
    pub psubs: Vec<Arc<Subscription>>,
    /// Queue subscriptions grouped by queue name
    pub qsubs: AHashMap<Arc<str>, Vec<Arc<Subscription>>>,
}

impl SublistResult {
    pub fn is_empty(&self) -> bool {
        self.psubs.is_empty() && self.qsubs.is_empty()
    }

    /// Total number of matched subscriptions
    pub fn len(&self) -> usize {
        self.psubs.len() + self.qsubs.values().map(Vec::len).sum::<usize>()
    }
}

/// Subject trie holding subscriptions
#[derive(Debug, Default)]
pub struct Sublist {
    root: TrieNode,
    count: usize,
}

impl Sublist {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a subscription under its pattern
    pub fn insert(&mut self, sub: Arc<Subscription>) -> Result<(), SubjectError> {
        validate_pattern(&sub.subject)?;

        let mut node = &mut self.root;

        for token in sub.subject.split(SEPARATOR) {
            if token == FULL_WILDCARD {
                // Validation guarantees `>` is the last token
                node.full_wildcard.insert(sub);
                self.count += 1;
                return Ok(());
            }

            node = if token == SINGLE_WILDCARD {
                node.single_wildcard.get_or_insert_with(Box::default).as_mut()
            } else {
                node.children.entry(CompactString::new(token)).or_default()
            };
        }

        node.entry.insert(sub);
        self.count += 1;
        Ok(())
    }

    /// Remove the exact (pattern, owner, sid) entry, pruning empty nodes.
    ///
    /// Returns false if the subscription was not present.
    pub fn remove(&mut self, sub: &Subscription) -> bool {
        let tokens: SmallVec<[&str; 8]> = sub.subject.split(SEPARATOR).collect();
        let removed = Self::remove_recursive(&mut self.root, &tokens, sub);
        if removed {
            self.count -= 1;
        }
        removed
    }

    fn remove_recursive(node: &mut TrieNode, tokens: &[&str], sub: &Subscription) -> bool {
        let Some((&token, rest)) = tokens.split_first() else {
            return node.entry.remove(sub);
        };

        if token == FULL_WILDCARD {
            return rest.is_empty() && node.full_wildcard.remove(sub);
        }

        if token == SINGLE_WILDCARD {
            let Some(child) = node.single_wildcard.as_mut() else {
                return false;
            };
            let removed = Self::remove_recursive(child, rest, sub);
            if removed && child.is_empty() {
                node.single_wildcard = None;
            }
            return removed;
        }

        let Some(child) = node.children.get_mut(token) else {
            return false;
        };
        let removed = Self::remove_recursive(child, rest, sub);
        if removed && child.is_empty() {
            node.children.remove(token);
        }
        removed
    }

    /// Find all subscriptions whose pattern matches `subject`
    pub fn match_subject(&self, subject: &str) -> SublistResult {
        let tokens: SmallVec<[&str; 8]> = subject.split(SEPARATOR).collect();
        let mut result = SublistResult::default();
        Self::match_recursive(&self.root, &tokens, &mut result);
        result
    }

    fn match_recursive(node: &TrieNode, tokens: &[&str], result: &mut SublistResult) {
        let Some((token, rest)) = tokens.split_first() else {
            node.entry.collect(result);
            return;
        };

        // `>` needs at least one remaining token
        node.full_wildcard.collect(result);

        if let Some(ref child) = node.single_wildcard {
            Self::match_recursive(child, rest, result);
        }

        if let Some(child) = node.children.get(*token) {
            Self::match_recursive(child, rest, result);
        }
    }

    /// Total number of live subscriptions
    pub fn count(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Visit every subscription
    pub fn for_each<F>(&self, mut f: F)
    where
        F: FnMut(&Arc<Subscription>),
    {
        Self::for_each_recursive(&self.root, &mut f);
    }

    fn for_each_recursive<F>(node: &TrieNode, f: &mut F)
    where
        F: FnMut(&Arc<Subscription>),
    {
        node.entry.for_each(f);
        node.full_wildcard.for_each(f);
        if let Some(ref child) = node.single_wildcard {
            Self::for_each_recursive(child, f);
        }
        for child in node.children.values() {
            Self::for_each_recursive(child, f);
        }
    }
}
