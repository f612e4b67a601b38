//! Projections applied to parameters after each optimizer update.

use std::{str::FromStr, sync::Arc};

use lazy_static::lazy_static;
use log::trace;
use ndarray::{ArrayD, ArrayView, Axis, Dimension};
use serde::{Deserialize, Serialize};

use crate::registry::{Custom, Registered, Registry, UnknownIdentifier};

/// Fuzz factor of the norm based constraints.
const EPSILON: f32 = 1e-7;

/// A user supplied constraint.
///
/// Implemented for all `Fn(ArrayD<f32>) -> ArrayD<f32>` closures.
pub trait ConstraintFn: Send + Sync {
    /// Projects the weights, the shape must not change.
    fn project(&self, weights: ArrayD<f32>) -> ArrayD<f32>;
}

impl<F> ConstraintFn for F
where
    F: Fn(ArrayD<f32>) -> ArrayD<f32> + Send + Sync,
{
    fn project(&self, weights: ArrayD<f32>) -> ArrayD<f32> {
        self(weights)
    }
}

lazy_static! {
    static ref CONSTRAINTS: Registry<dyn ConstraintFn> = Registry::new();
}

impl Registered for dyn ConstraintFn {
    const KIND: &'static str = "constraint";

    fn registry() -> &'static Registry<Self> {
        &CONSTRAINTS
    }
}

/// Registers a custom constraint under given name.
pub fn register_constraint(
    name: impl Into<String>,
    function: impl ConstraintFn + 'static,
) -> Constraint {
    Constraint::Custom(Custom::register(name, Arc::new(function)))
}

/// Constraint on parameter arrays.
///
/// The norm based constraints use the L2 norm of each lane along `axis`.
/// If the parameter has no such axis the whole parameter is treated as
/// a single vector.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "class_name", content = "config")]
pub enum Constraint {
    /// Sets negative weights to zero.
    NonNeg,
    /// Rescales lanes with a norm above `max_value` to that norm.
    MaxNorm { max_value: f32, axis: usize },
    /// Rescales lanes to have a norm between `min_value` and `max_value`.
    ///
    /// With `rate < 1` the norm is only moved part of the way:
    /// `rate * clip(norm) + (1 - rate) * norm`.
    MinMaxNorm {
        min_value: f32,
        max_value: f32,
        rate: f32,
        axis: usize,
    },
    /// Rescales lanes to a norm of one.
    UnitNorm { axis: usize },
    /// Clamps each weight into `[min_value, max_value]`.
    Clip { min_value: f32, max_value: f32 },
    Custom(Custom<dyn ConstraintFn>),
}

impl Constraint {
    /// Projects the weights.
    ///
    /// # Panics
    ///
    /// Custom constraints changing the shape of the weights are a bug
    /// and will panic.
    pub fn project(&self, mut weights: ArrayD<f32>) -> ArrayD<f32> {
        trace!("applying constraint {:?}", self);
        match self {
            Constraint::NonNeg => weights.mapv_inplace(|w| w.max(0.)),
            Constraint::MaxNorm { max_value, axis } => {
                let max_value = *max_value;
                rescale_lanes(&mut weights, *axis, |norm| norm.min(max_value).max(0.));
            }
            Constraint::MinMaxNorm {
                min_value,
                max_value,
                rate,
                axis,
            } => {
                let (min_value, max_value, rate) = (*min_value, *max_value, *rate);
                rescale_lanes(&mut weights, *axis, |norm| {
                    rate * norm.max(min_value).min(max_value) + (1. - rate) * norm
                });
            }
            Constraint::UnitNorm { axis } => rescale_lanes(&mut weights, *axis, |_| 1.),
            Constraint::Clip {
                min_value,
                max_value,
            } => {
                let (min_value, max_value) = (*min_value, *max_value);
                weights.mapv_inplace(|w| w.max(min_value).min(max_value));
            }
            Constraint::Custom(custom) => {
                let shape = weights.raw_dim();
                let projected = custom.function().project(weights);
                assert_eq!(
                    projected.raw_dim(),
                    shape,
                    "constraint {} changed the shape of the weights",
                    custom.name()
                );
                return projected;
            }
        }
        weights
    }
}

/// Rescales each lane along `axis` so that its norm becomes `desired(norm)`.
fn rescale_lanes(weights: &mut ArrayD<f32>, axis: usize, desired: impl Fn(f32) -> f32) {
    let factor = |norm: f32| desired(norm) / (EPSILON + norm);
    if axis < weights.ndim() {
        for mut lane in weights.lanes_mut(Axis(axis)) {
            let scale = factor(l2_norm(lane.view()));
            lane.mapv_inplace(|w| w * scale);
        }
    } else {
        let scale = factor(l2_norm(weights.view()));
        weights.mapv_inplace(|w| w * scale);
    }
}

fn l2_norm<D>(weights: ArrayView<f32, D>) -> f32
where
    D: Dimension,
{
    weights.fold(0., |acc, w| acc + w * w).sqrt()
}

impl FromStr for Constraint {
    type Err = UnknownIdentifier;

    fn from_str(name: &str) -> Result<Self, Self::Err> {
        let constraint = match name {
            "non_neg" => Constraint::NonNeg,
            "max_norm" => Constraint::MaxNorm {
                max_value: 2.,
                axis: 0,
            },
            "min_max_norm" => Constraint::MinMaxNorm {
                min_value: 0.,
                max_value: 1.,
                rate: 1.,
                axis: 0,
            },
            "unit_norm" => Constraint::UnitNorm { axis: 0 },
            custom => Constraint::Custom(Custom::lookup(custom)?),
        };
        Ok(constraint)
    }
}

#[cfg(test)]
mod tests {
    use ndarray::{arr1, arr2, Array0};
    use test_utils::assert_approx_eq;

    use super::*;

    #[test]
    fn test_non_neg() {
        let weights = arr1(&[-1.0f32, 0., 2.5]).into_dyn();
        assert_approx_eq!(
            f32,
            Constraint::NonNeg.project(weights),
            arr1(&[0., 0., 2.5])
        );
    }

    #[test]
    fn test_clip() {
        let weights = arr1(&[-1.0f32, 0., 0.05, 2.5]).into_dyn();
        let clip = Constraint::Clip {
            min_value: 0.1,
            max_value: 2.,
        };
        assert_approx_eq!(f32, clip.project(weights), arr1(&[0.1, 0.1, 0.1, 2.]));
    }

    #[test]
    fn test_max_norm_along_axis() {
        // columns have norms 5 and 0.5
        let weights = arr2(&[[3.0f32, 0.3], [4., 0.4]]).into_dyn();
        let projected = Constraint::MaxNorm {
            max_value: 2.,
            axis: 0,
        }
        .project(weights);
        assert_approx_eq!(
            f32,
            projected,
            arr2(&[[1.2, 0.3], [1.6, 0.4]]),
            epsilon = 1e-5
        );
    }

    #[test]
    fn test_unit_norm_along_last_axis() {
        let weights = arr2(&[[3.0f32, 4.], [0., 2.]]).into_dyn();
        let projected = Constraint::UnitNorm { axis: 1 }.project(weights);
        assert_approx_eq!(
            f32,
            projected,
            arr2(&[[0.6, 0.8], [0., 1.]]),
            epsilon = 1e-5
        );
    }

    #[test]
    fn test_min_max_norm_with_rate() {
        let weights = arr1(&[0.3f32, 0.4]).into_dyn();
        let projected = Constraint::MinMaxNorm {
            min_value: 1.,
            max_value: 2.,
            rate: 0.5,
            axis: 0,
        }
        .project(weights);
        // norm 0.5 is moved half way to 1.0
        assert_approx_eq!(f32, projected, arr1(&[0.45, 0.6]), epsilon = 1e-5);
    }

    #[test]
    fn test_norm_of_scalar_parameter() {
        let weights = Array0::from_elem((), -3.0f32).into_dyn();
        let projected = Constraint::MaxNorm {
            max_value: 2.,
            axis: 0,
        }
        .project(weights);
        assert_approx_eq!(f32, projected.sum(), -2., epsilon = 1e-5);
    }

    #[test]
    fn test_custom_constraint() {
        let doubled = register_constraint("test_double", |w: ArrayD<f32>| w * 2f32);
        let weights = arr1(&[1.0f32, -1.]).into_dyn();
        assert_approx_eq!(f32, doubled.project(weights), arr1(&[2., -2.]));
        assert_eq!("test_double".parse::<Constraint>().unwrap(), doubled);
    }

    #[test]
    #[should_panic(expected = "changed the shape")]
    fn test_custom_constraint_must_keep_shape() {
        let truncate = register_constraint("test_truncate", |w: ArrayD<f32>| {
            w.slice_move(ndarray::s![..1]).into_dyn()
        });
        truncate.project(arr1(&[1.0f32, -1.]).into_dyn());
    }

    #[test]
    fn test_resolves_identifiers() {
        assert_eq!(
            "max_norm".parse::<Constraint>().unwrap(),
            Constraint::MaxNorm {
                max_value: 2.,
                axis: 0
            }
        );
        assert!("clamp_everything".parse::<Constraint>().is_err());
    }
}
