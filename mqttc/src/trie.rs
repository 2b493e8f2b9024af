//! Trie data structure for MQTT topic pattern matching.
//!
//! Supports MQTT wildcards:
//! - `+` matches exactly one topic level
//! - `#` matches any number of remaining topic levels (must be last),
//!   including none, so `sport/#` also matches `sport`
//!
//! Each filter holds at most one value. Topics whose first level starts
//! with `$` are not matched by wildcards at the root.

use std::collections::HashMap;
use std::fmt;

use crate::error::{Error, Result};

/// Trie node for MQTT topic pattern matching.
pub struct TopicTrie<T> {
    children: HashMap<String, TopicTrie<T>>,
    match_any: Option<Box<TopicTrie<T>>>, // + wildcard
    match_all: Option<T>,                 // # wildcard
    value: Option<T>,
}

impl<T> Default for TopicTrie<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> TopicTrie<T> {
    /// Create a new empty trie.
    pub fn new() -> Self {
        Self {
            children: HashMap::new(),
            match_any: None,
            match_all: None,
            value: None,
        }
    }

    /// Insert a value at the given filter, returning the value it replaced.
    pub fn insert(&mut self, filter: &str, value: T) -> Result<Option<T>> {
        let (first, rest) = split_level(filter);

        match first {
            "+" => {
                let node = self.match_any.get_or_insert_with(|| Box::new(TopicTrie::new()));
                node.descend_insert(rest, value)
            }
            "#" => {
                if rest.is_some() {
                    return Err(Error::InvalidTopic("# must be the last segment".to_string()));
                }
                Ok(self.match_all.replace(value))
            }
            _ => self
                .children
                .entry(first.to_string())
                .or_default()
                .descend_insert(rest, value),
        }
    }

    fn descend_insert(&mut self, rest: Option<&str>, value: T) -> Result<Option<T>> {
        match rest {
            Some(rest) => self.insert(rest, value),
            None => Ok(self.value.replace(value)),
        }
    }

    /// Remove the value stored at exactly `filter`, pruning empty nodes.
    pub fn remove(&mut self, filter: &str) -> Option<T> {
        let (first, rest) = split_level(filter);

        match first {
            "+" => {
                let node = self.match_any.as_mut()?;
                let removed = node.descend_remove(rest);
                if node.is_empty() {
                    self.match_any = None;
                }
                removed
            }
            "#" if rest.is_none() => self.match_all.take(),
            _ => {
                let node = self.children.get_mut(first)?;
                let removed = node.descend_remove(rest);
                if node.is_empty() {
                    self.children.remove(first);
                }
                removed
            }
        }
    }

    fn descend_remove(&mut self, rest: Option<&str>) -> Option<T> {
        match rest {
            Some(rest) => self.remove(rest),
            None => self.value.take(),
        }
    }

    /// Get the value stored at exactly `filter` (no wildcard expansion).
    pub fn get(&self, filter: &str) -> Option<&T> {
        let (first, rest) = split_level(filter);
        let node = match first {
            "+" => self.match_any.as_deref()?,
            "#" if rest.is_none() => return self.match_all.as_ref(),
            _ => self.children.get(first)?,
        };
        match rest {
            Some(rest) => node.get(rest),
            None => node.value.as_ref(),
        }
    }

    /// Collect every value whose filter matches `topic`.
    pub fn matches(&self, topic: &str) -> Vec<&T> {
        let mut out = Vec::new();
        let dollar = topic.starts_with('$');
        self.collect(Some(topic), !dollar, &mut out);
        out
    }

    /// `topic` is `None` once every level has been consumed.
    fn collect<'a>(&'a self, topic: Option<&str>, wildcards: bool, out: &mut Vec<&'a T>) {
        // `#` also matches the parent level.
        if wildcards {
            if let Some(ref value) = self.match_all {
                out.push(value);
            }
        }

        let Some(topic) = topic else {
            if let Some(ref value) = self.value {
                out.push(value);
            }
            return;
        };

        let (first, rest) = split_level(topic);

        if let Some(child) = self.children.get(first) {
            child.collect(rest, true, out);
        }
        if wildcards {
            if let Some(ref match_any) = self.match_any {
                match_any.collect(rest, true, out);
            }
        }
    }

    /// Number of stored values.
    pub fn len(&self) -> usize {
        self.value.is_some() as usize
            + self.match_all.is_some() as usize
            + self.match_any.as_ref().map_or(0, |n| n.len())
            + self.children.values().map(TopicTrie::len).sum::<usize>()
    }

    /// Returns true if no values are stored.
    pub fn is_empty(&self) -> bool {
        self.value.is_none()
            && self.match_all.is_none()
            && self.match_any.is_none()
            && self.children.is_empty()
    }

    /// Remove everything.
    pub fn clear(&mut self) {
        *self = TopicTrie::new();
    }
}

fn split_level(s: &str) -> (&str, Option<&str>) {
    match s.split_once('/') {
        Some((first, rest)) => (first, Some(rest)),
        None => (s, None),
    }
}

impl<T: fmt::Debug> fmt::Debug for TopicTrie<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TopicTrie")
            .field("children", &self.children.keys().collect::<Vec<_>>())
            .field("match_any", &self.match_any.is_some())
            .field("match_all", &self.match_all)
            .field("value", &self.value)
            .finish()
    }
}
