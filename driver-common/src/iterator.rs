//! The case iterator interface: a lazy, finite, single-pass source of cases.
//! Exhaustion is communicated with a plain `Option`, not an exception.

use async_trait::async_trait;

use crate::case::Case;

/// Produces cases one at a time until exhausted. Implementations are not
/// required to be `Clone` or rewindable: the driver consumes each iterator
/// exactly once, front to back.
#[async_trait]
pub trait CaseIterator: Send {
    /// The next case to run, or `None` if the sequence is exhausted.
    /// Exhaustion is terminal: a well-behaved iterator keeps returning
    /// `None` on every subsequent call.
    async fn next_case(&mut self) -> Option<Case>;
}

/// A `CaseIterator` backed by a pre-built, in-memory sequence. Useful for
/// tests and for callers who already have their cases materialized.
pub struct VecCaseIterator {
    cases: std::vec::IntoIter<Case>,
}

impl VecCaseIterator {
    pub fn new(cases: Vec<Case>) -> Self {
        Self {
            cases: cases.into_iter(),
        }
    }
}

#[async_trait]
impl CaseIterator for VecCaseIterator {
    async fn next_case(&mut self) -> Option<Case> {
        self.cases.next()
    }
}
