//! Integer register with commutative increments and absolute sets
//!
//! Arithmetic wraps on overflow, so every diff stays applicable and the
//! algebra keeps converging at the edges of `i64`.

use serde::{Deserialize, Serialize};

use crate::ot::{OtError, OtState, OtSystem, StateError, TransformResult};

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CounterDiff {
    /// Increment by the given amount.
    Add(i64),
    /// Replace `prev` with `next`.
    Set { prev: i64, next: i64 },
}

/// Adds commute with each other; a set overrides concurrent adds; concurrent
/// sets resolve to the larger target.
#[derive(Clone, Copy, Debug, Default)]
pub struct CounterSystem;

impl OtSystem for CounterSystem {
    type Diff = CounterDiff;

    fn transform(
        &self,
        left: &CounterDiff,
        right: &CounterDiff,
    ) -> Result<TransformResult<CounterDiff>, OtError> {
        use CounterDiff::*;
        let result = match (left, right) {
            (Add(_), Add(_)) => TransformResult::new(vec![left.clone()], vec![right.clone()]),
            (Add(delta), Set { prev, next }) => TransformResult::right(vec![Set {
                prev: prev.wrapping_add(*delta),
                next: *next,
            }]),
            (Set { prev, next }, Add(delta)) => TransformResult::left(vec![Set {
                prev: prev.wrapping_add(*delta),
                next: *next,
            }]),
            (Set { next: l, .. }, Set { next: r, .. }) => {
                if l == r {
                    TransformResult::empty()
                } else if l > r {
                    TransformResult::left(vec![Set { prev: *r, next: *l }])
                } else {
                    TransformResult::right(vec![Set { prev: *l, next: *r }])
                }
            }
        };
        Ok(result)
    }

    fn invert(&self, diff: &CounterDiff) -> Vec<CounterDiff> {
        match diff {
            CounterDiff::Add(delta) => vec![CounterDiff::Add(delta.wrapping_neg())],
            CounterDiff::Set { prev, next } => vec![CounterDiff::Set {
                prev: *next,
                next: *prev,
            }],
        }
    }

    fn squash(&self, first: &CounterDiff, second: &CounterDiff) -> Option<CounterDiff> {
        use CounterDiff::*;
        Some(match (first, second) {
            (Add(a), Add(b)) => Add(a.wrapping_add(*b)),
            (Set { prev, next }, Add(b)) => Set {
                prev: *prev,
                next: next.wrapping_add(*b),
            },
            (Add(a), Set { prev, next }) => Set {
                prev: prev.wrapping_sub(*a),
                next: *next,
            },
            (Set { prev, .. }, Set { next, .. }) => Set {
                prev: *prev,
                next: *next,
            },
        })
    }

    fn is_empty(&self, diff: &CounterDiff) -> bool {
        match diff {
            CounterDiff::Add(delta) => *delta == 0,
            CounterDiff::Set { prev, next } => prev == next,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CounterState {
    value: i64,
}

impl CounterState {
    pub fn value(&self) -> i64 {
        self.value
    }
}

impl OtState<CounterDiff> for CounterState {
    fn init(&mut self) {
        self.value = 0;
    }

    fn apply(&mut self, diff: &CounterDiff) -> Result<(), StateError> {
        match diff {
            CounterDiff::Add(delta) => self.value = self.value.wrapping_add(*delta),
            CounterDiff::Set { prev, next } => {
                if *prev != self.value {
                    return Err(StateError::new(format!(
                        "counter holds {}, set expected {}",
                        self.value, prev
                    )));
                }
                self.value = *next;
            }
        }
        Ok(())
    }
}
