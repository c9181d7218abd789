//! Path expressions.
//!
//! A path expression routes a changed node to a sequencer and names the node
//! that receives the sequencer's output. See [`PathExpression`] for the
//! grammar.

pub mod expression;
pub(crate) mod parser;

pub use expression::PathExpression;
