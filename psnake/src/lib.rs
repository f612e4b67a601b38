//! The Parametric Snake (PSnake) activation layer.
//!
//! The layer owns a learnable `alpha` and transforms each input `x` into
//! `x + (1 - cos(2 * alpha * x)) / (2 * alpha)`. Build an unbuilt [`PSnake`]
//! for an input shape to get a [`BuiltPSnake`], or use a [`LazyPSnake`]
//! which is built from the shape of its first input.
#![forbid(unsafe_op_in_unsafe_fn)]

pub mod activation;
pub mod constraint;
pub mod initializer;
pub mod input_spec;
pub mod io;
mod layer;
pub mod optimizer;
pub mod param;
pub mod registry;
pub mod regularizer;
pub mod utils;

pub use crate::layer::{
    BuildError,
    BuiltPSnake,
    CallError,
    LayerConfig,
    LazyPSnake,
    LoadingParamsFailed,
    PSnake,
    PSnakeConfig,
    PSnakeGradientSet,
    SharedAxes,
};
