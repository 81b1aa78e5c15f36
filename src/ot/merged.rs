//! Product of two diff algebras
//!
//! Lets a document made of two independently edited parts (for example a
//! title dictionary and a vote counter) sync as one commit graph. A merged
//! diff carries a diff list for each part; every operation works
//! componentwise.

use super::{OtError, OtState, OtSystem, StateError, TransformResult};

/// Diff of a merged document: one list per component.
pub type MergedDiff<A, B> = (Vec<A>, Vec<B>);

/// Algebra combining two algebras componentwise.
#[derive(Clone, Debug, Default)]
pub struct MergedSystem<A, B> {
    first: A,
    second: B,
}

impl<A: OtSystem, B: OtSystem> MergedSystem<A, B> {
    pub fn new(first: A, second: B) -> Self {
        Self { first, second }
    }

    fn wrap(
        &self,
        first: Vec<A::Diff>,
        second: Vec<B::Diff>,
    ) -> Vec<MergedDiff<A::Diff, B::Diff>> {
        let diff = (first, second);
        if self.is_empty(&diff) {
            Vec::new()
        } else {
            vec![diff]
        }
    }
}

impl<A: OtSystem, B: OtSystem> OtSystem for MergedSystem<A, B> {
    type Diff = MergedDiff<A::Diff, B::Diff>;

    fn transform(
        &self,
        left: &Self::Diff,
        right: &Self::Diff,
    ) -> Result<TransformResult<Self::Diff>, OtError> {
        let first = self.first.transform_all(&left.0, &right.0)?;
        let second = self.second.transform_all(&left.1, &right.1)?;
        Ok(TransformResult::new(
            self.wrap(first.left, second.left),
            self.wrap(first.right, second.right),
        ))
    }

    fn invert(&self, diff: &Self::Diff) -> Vec<Self::Diff> {
        self.wrap(self.first.invert_all(&diff.0), self.second.invert_all(&diff.1))
    }

    fn squash(&self, first: &Self::Diff, second: &Self::Diff) -> Option<Self::Diff> {
        let a: Vec<A::Diff> = first.0.iter().chain(second.0.iter()).cloned().collect();
        let b: Vec<B::Diff> = first.1.iter().chain(second.1.iter()).cloned().collect();
        Some((self.first.squash_all(&a), self.second.squash_all(&b)))
    }

    fn is_empty(&self, diff: &Self::Diff) -> bool {
        self.first.squash_all(&diff.0).is_empty() && self.second.squash_all(&diff.1).is_empty()
    }
}

/// Projection of a merged document.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MergedState<SA, SB> {
    pub first: SA,
    pub second: SB,
}

impl<SA, SB> MergedState<SA, SB> {
    pub fn new(first: SA, second: SB) -> Self {
        Self { first, second }
    }
}

impl<A, B, SA, SB> OtState<MergedDiff<A, B>> for MergedState<SA, SB>
where
    SA: OtState<A>,
    SB: OtState<B>,
{
    fn init(&mut self) {
        self.first.init();
        self.second.init();
    }

    fn apply(&mut self, diff: &MergedDiff<A, B>) -> Result<(), StateError> {
        self.first.apply_all(&diff.0)?;
        self.second.apply_all(&diff.1)
    }
}
