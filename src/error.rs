use thiserror::Error;

/// Returned by [`TapeTerm::pow`](crate::TapeTerm::pow) when the exponent is a term
/// instead of a numeric constant. No node is added to the tape in that case.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("Exponent must be a numeric constant, not a term in the graph.")]
pub struct ConstantExponentError;
