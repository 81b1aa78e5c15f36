//! Diff algebra for operational transformation
//!
//! Every document type plugs into the sync core by implementing [`OtSystem`]
//! for its diff type and [`OtState`] for its materialized projection. The
//! core never looks inside a diff; it only transforms, inverts, squashes and
//! prunes them through this trait.

pub mod merged;
mod state;

pub use state::{OtState, StateError};

use std::fmt::Debug;
use thiserror::Error;

/// Errors raised by a diff algebra.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OtError {
    /// The algebra cannot reconcile this pair of diffs. Always fatal: it
    /// indicates a bug in the algebra, not a runtime condition.
    #[error("Transform undefined for {left} against {right}")]
    TransformUndefined { left: String, right: String },
}

impl OtError {
    pub fn undefined<D: Debug>(left: &D, right: &D) -> Self {
        OtError::TransformUndefined {
            left: format!("{:?}", left),
            right: format!("{:?}", right),
        }
    }
}

/// Result of transforming two diffs (or diff lists) applicable to the same
/// state.
///
/// `left` is applied *after* the original right side and `right` after the
/// original left side, so that `[right.., left'..]` and `[left.., right'..]`
/// lead to the same state.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransformResult<D> {
    pub left: Vec<D>,
    pub right: Vec<D>,
}

impl<D> TransformResult<D> {
    pub fn new(left: Vec<D>, right: Vec<D>) -> Self {
        Self { left, right }
    }

    /// Both sides are no-ops.
    pub fn empty() -> Self {
        Self {
            left: Vec::new(),
            right: Vec::new(),
        }
    }

    /// Only the left side survives; it is re-applied on top of the right.
    pub fn left(left: Vec<D>) -> Self {
        Self {
            left,
            right: Vec::new(),
        }
    }

    /// Only the right side survives; it is re-applied on top of the left.
    pub fn right(right: Vec<D>) -> Self {
        Self {
            left: Vec::new(),
            right,
        }
    }
}

/// Pure operations over one document type's diffs.
///
/// Implementations must make `transform` satisfy TP1 for every pair of
/// diffs the document type can produce:
/// `apply(apply(s, a), transform(a, b).right) == apply(apply(s, b), transform(a, b).left)`.
pub trait OtSystem: Send + Sync + 'static {
    type Diff: Clone + Debug + Send + Sync + 'static;

    /// Transform two diffs applicable to the same base state.
    fn transform(
        &self,
        left: &Self::Diff,
        right: &Self::Diff,
    ) -> Result<TransformResult<Self::Diff>, OtError>;

    /// Diffs undoing `diff` when applied right after it.
    fn invert(&self, diff: &Self::Diff) -> Vec<Self::Diff>;

    /// Combine two sequential diffs into one. `None` keeps both.
    fn squash(&self, first: &Self::Diff, second: &Self::Diff) -> Option<Self::Diff>;

    /// Whether `diff` is a no-op.
    fn is_empty(&self, diff: &Self::Diff) -> bool;

    /// Invert a whole diff list: reversed order, each diff inverted.
    fn invert_all(&self, diffs: &[Self::Diff]) -> Vec<Self::Diff> {
        diffs.iter().rev().flat_map(|d| self.invert(d)).collect()
    }

    /// Squash a diff list as far as adjacent pairs allow, pruning no-ops.
    ///
    /// Adjacent inverse pairs squash into an empty diff and disappear, so
    /// `invert(path) ++ path` collapses.
    fn squash_all(&self, diffs: &[Self::Diff]) -> Vec<Self::Diff> {
        let mut result: Vec<Self::Diff> = Vec::with_capacity(diffs.len());
        for diff in diffs {
            if self.is_empty(diff) {
                continue;
            }
            let squashed = result.last().and_then(|last| self.squash(last, diff));
            match squashed {
                Some(combined) => {
                    result.pop();
                    if !self.is_empty(&combined) {
                        result.push(combined);
                    }
                }
                None => result.push(diff.clone()),
            }
        }
        result
    }

    /// Transform two diff lists applicable to the same base state.
    ///
    /// Each left diff is carried across the whole right list, which is
    /// rebased past it before the next left diff. The returned `left`
    /// applies after all of `right`, and vice versa.
    ///
    /// Stack depth does not grow with the list lengths; it only nests when
    /// a single transform expands one diff into several.
    fn transform_all(
        &self,
        left: &[Self::Diff],
        right: &[Self::Diff],
    ) -> Result<TransformResult<Self::Diff>, OtError> {
        let mut right = right.to_vec();
        let mut transformed_left = Vec::with_capacity(left.len());
        for diff in left {
            let mut carried = vec![diff.clone()];
            let mut rebased_right = Vec::with_capacity(right.len());
            for other in &right {
                let step = match carried.as_slice() {
                    [] => TransformResult::right(vec![other.clone()]),
                    [single] => self.transform(single, other)?,
                    many => self.transform_all(many, std::slice::from_ref(other))?,
                };
                carried = step.left;
                rebased_right.extend(step.right);
            }
            transformed_left.extend(carried);
            right = rebased_right;
        }
        Ok(TransformResult::new(transformed_left, right))
    }
}
