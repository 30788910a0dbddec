use std::fmt;

/// Errors surfaced by a [`crate::BPlusTree`](crate::collections::b_plus_tree_map::BPlusTree).
///
/// `NotFound` is intentionally absent from this enum: a missing key is not an
/// error condition and is represented by `None` from the relevant query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BPlusTreeError {
    /// `max_node_size` passed to `BPlusTree::new` was odd or smaller than 4.
    ConfigError { max_node_size: usize },

    /// The tree's internal bookkeeping found itself in a state the
    /// rebalancing algorithm does not know how to handle. This always
    /// indicates either a bug in the core or a comparator that does not
    /// implement a stable total order.
    InvariantViolation { reason: String },
}

impl fmt::Display for BPlusTreeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BPlusTreeError::ConfigError { max_node_size } => write!(
                f,
                "invalid max_node_size {max_node_size}: must be even and >= 4"
            ),
            BPlusTreeError::InvariantViolation { reason } => {
                write!(f, "b+ tree invariant violated: {reason}")
            }
        }
    }
}

impl std::error::Error for BPlusTreeError {}

pub type BPlusTreeResult<T> = Result<T, BPlusTreeError>;

/// Panics with a formatted [`BPlusTreeError::InvariantViolation`].
///
/// Per the core's error model, invariant violations are not recoverable:
/// they mean the sibling/parent graph is corrupted or the comparator is not
/// a stable total order, so the only sound move is to stop before returning
/// a tree that looks valid but isn't.
pub(crate) fn invariant_violation(reason: impl Into<String>) -> ! {
    let err = BPlusTreeError::InvariantViolation {
        reason: reason.into(),
    };
    panic!("{err}");
}
