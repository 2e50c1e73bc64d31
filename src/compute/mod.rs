//! Compute function boundary.
//!
//! The pipeline treats evaluation as an opaque capability: a pure mapping
//! from an expression string to a number. [`Arithmetic`] is the default.

mod expr;

pub use expr::Arithmetic;

use crate::error::Result;

pub trait Evaluate: Send + Sync {
    /// Evaluate `expression`, or fail with `Error::Evaluation`.
    fn evaluate(&self, expression: &str) -> Result<f64>;
}

impl<F> Evaluate for F
where
    F: Fn(&str) -> Result<f64> + Send + Sync,
{
    fn evaluate(&self, expression: &str) -> Result<f64> {
        self(expression)
    }
}
