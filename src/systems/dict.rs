//! Shared dictionary with last-write-wins conflict resolution
//!
//! Each diff replaces the value of one key, recording the value it expected
//! to replace. Concurrent writes to the same key are resolved
//! deterministically in favour of the lexicographically greater value (a
//! removal, `None`, loses against any value).

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::ot::{OtError, OtState, OtSystem, StateError, TransformResult};

/// Replace `prev` with `next` under `key`. `None` means absent.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DictDiff {
    pub key: String,
    pub prev: Option<String>,
    pub next: Option<String>,
}

impl DictDiff {
    pub fn set(key: impl Into<String>, prev: Option<&str>, next: Option<&str>) -> Self {
        Self {
            key: key.into(),
            prev: prev.map(str::to_string),
            next: next.map(str::to_string),
        }
    }

    pub fn insert(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            prev: None,
            next: Some(value.into()),
        }
    }

    pub fn remove(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            prev: Some(value.into()),
            next: None,
        }
    }
}

/// Last-write-wins dictionary algebra.
#[derive(Clone, Copy, Debug, Default)]
pub struct DictSystem;

impl OtSystem for DictSystem {
    type Diff = DictDiff;

    fn transform(
        &self,
        left: &DictDiff,
        right: &DictDiff,
    ) -> Result<TransformResult<DictDiff>, OtError> {
        if left.key != right.key {
            return Ok(TransformResult::new(vec![left.clone()], vec![right.clone()]));
        }
        if left.next == right.next {
            return Ok(TransformResult::empty());
        }
        let key = left.key.clone();
        if left.next > right.next {
            Ok(TransformResult::left(vec![DictDiff {
                key,
                prev: right.next.clone(),
                next: left.next.clone(),
            }]))
        } else {
            Ok(TransformResult::right(vec![DictDiff {
                key,
                prev: left.next.clone(),
                next: right.next.clone(),
            }]))
        }
    }

    fn invert(&self, diff: &DictDiff) -> Vec<DictDiff> {
        vec![DictDiff {
            key: diff.key.clone(),
            prev: diff.next.clone(),
            next: diff.prev.clone(),
        }]
    }

    fn squash(&self, first: &DictDiff, second: &DictDiff) -> Option<DictDiff> {
        if first.key != second.key || first.next != second.prev {
            return None;
        }
        Some(DictDiff {
            key: first.key.clone(),
            prev: first.prev.clone(),
            next: second.next.clone(),
        })
    }

    fn is_empty(&self, diff: &DictDiff) -> bool {
        diff.prev == diff.next
    }
}

/// Materialized dictionary.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DictState {
    entries: BTreeMap<String, String>,
}

impl DictState {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    pub fn entries(&self) -> &BTreeMap<String, String> {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl OtState<DictDiff> for DictState {
    fn init(&mut self) {
        self.entries.clear();
    }

    fn apply(&mut self, diff: &DictDiff) -> Result<(), StateError> {
        let current = self.entries.get(&diff.key);
        if current != diff.prev.as_ref() {
            return Err(StateError::new(format!(
                "key {:?} holds {:?}, diff expected {:?}",
                diff.key, current, diff.prev
            )));
        }
        match &diff.next {
            Some(value) => {
                self.entries.insert(diff.key.clone(), value.clone());
            }
            None => {
                self.entries.remove(&diff.key);
            }
        }
        Ok(())
    }
}
