//! Testing utilities shared by the workspace crates.

mod approx_eq;

pub use approx_eq::ApproxEqIter;
#[doc(hidden)]
pub use approx_eq::check_approx_eq;
