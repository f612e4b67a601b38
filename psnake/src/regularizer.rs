//! Penalty terms on parameter values.

use std::{str::FromStr, sync::Arc};

use lazy_static::lazy_static;
use ndarray::{ArrayD, ArrayViewD};
use serde::{Deserialize, Serialize};

use crate::registry::{Custom, Registered, Registry, UnknownIdentifier};

/// A user supplied regularizer.
pub trait RegularizerFn: Send + Sync {
    /// The penalty added to the training objective.
    fn penalty(&self, weights: ArrayViewD<f32>) -> f32;

    /// The derivative of the penalty wrt. each weight.
    fn gradient(&self, weights: ArrayViewD<f32>) -> ArrayD<f32>;
}

lazy_static! {
    static ref REGULARIZERS: Registry<dyn RegularizerFn> = Registry::new();
}

impl Registered for dyn RegularizerFn {
    const KIND: &'static str = "regularizer";

    fn registry() -> &'static Registry<Self> {
        &REGULARIZERS
    }
}

/// Registers a custom regularizer under given name.
pub fn register_regularizer(
    name: impl Into<String>,
    function: impl RegularizerFn + 'static,
) -> Regularizer {
    Regularizer::Custom(Custom::register(name, Arc::new(function)))
}

/// Default factor used when resolving regularizers by name.
const DEFAULT_FACTOR: f32 = 0.01;

/// Regularizer of parameter arrays.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "class_name", content = "config")]
pub enum Regularizer {
    /// `l1 * Σ|w|`
    L1 { l1: f32 },
    /// `l2 * Σw²`
    L2 { l2: f32 },
    /// `l1 * Σ|w| + l2 * Σw²`
    L1L2 { l1: f32, l2: f32 },
    Custom(Custom<dyn RegularizerFn>),
}

impl Regularizer {
    pub fn penalty(&self, weights: ArrayViewD<f32>) -> f32 {
        let (l1, l2) = match self {
            Regularizer::L1 { l1 } => (*l1, 0.),
            Regularizer::L2 { l2 } => (0., *l2),
            Regularizer::L1L2 { l1, l2 } => (*l1, *l2),
            Regularizer::Custom(custom) => return custom.function().penalty(weights),
        };

        let mut penalty = 0.;
        if l1 != 0. {
            penalty += l1 * weights.fold(0., |acc, w| acc + w.abs());
        }
        if l2 != 0. {
            penalty += l2 * weights.fold(0., |acc, w| acc + w * w);
        }
        penalty
    }

    pub fn gradient(&self, weights: ArrayViewD<f32>) -> ArrayD<f32> {
        let (l1, l2) = match self {
            Regularizer::L1 { l1 } => (*l1, 0.),
            Regularizer::L2 { l2 } => (0., *l2),
            Regularizer::L1L2 { l1, l2 } => (*l1, *l2),
            Regularizer::Custom(custom) => return custom.function().gradient(weights),
        };

        // the sub-gradient of |w| at 0 is taken to be 0
        weights.mapv(|w| {
            let sign = if w == 0. { 0. } else { w.signum() };
            l1 * sign + 2. * l2 * w
        })
    }
}

impl FromStr for Regularizer {
    type Err = UnknownIdentifier;

    fn from_str(name: &str) -> Result<Self, Self::Err> {
        let regularizer = match name {
            "l1" => Regularizer::L1 { l1: DEFAULT_FACTOR },
            "l2" => Regularizer::L2 { l2: DEFAULT_FACTOR },
            "l1_l2" => Regularizer::L1L2 {
                l1: DEFAULT_FACTOR,
                l2: DEFAULT_FACTOR,
            },
            custom => Regularizer::Custom(Custom::lookup(custom)?),
        };
        Ok(regularizer)
    }
}

#[cfg(test)]
mod tests {
    use ndarray::{arr1, arr2};
    use test_utils::assert_approx_eq;

    use super::*;

    struct SumOfWeights;

    impl RegularizerFn for SumOfWeights {
        fn penalty(&self, weights: ArrayViewD<f32>) -> f32 {
            weights.sum()
        }

        fn gradient(&self, weights: ArrayViewD<f32>) -> ArrayD<f32> {
            ArrayD::ones(weights.raw_dim())
        }
    }

    #[test]
    fn test_l1_l2_penalty() {
        let weights = arr2(&[[1.0f32, -2.], [0.5, 0.]]).into_dyn();
        assert_approx_eq!(
            f32,
            Regularizer::L1 { l1: 0.1 }.penalty(weights.view()),
            0.35,
            epsilon = 1e-6
        );
        assert_approx_eq!(
            f32,
            Regularizer::L2 { l2: 0.1 }.penalty(weights.view()),
            0.525,
            epsilon = 1e-6
        );
        assert_approx_eq!(
            f32,
            Regularizer::L1L2 { l1: 0.1, l2: 0.1 }.penalty(weights.view()),
            0.875,
            epsilon = 1e-6
        );
    }

    #[test]
    fn test_l1_l2_gradient() {
        let weights = arr1(&[1.0f32, -2., 0.]).into_dyn();
        let gradient = Regularizer::L1L2 { l1: 0.5, l2: 0.25 }.gradient(weights.view());
        assert_approx_eq!(f32, gradient, arr1(&[1.0, -1.5, 0.]));
    }

    #[test]
    fn test_resolves_identifiers() {
        assert_eq!(
            "l2".parse::<Regularizer>().unwrap(),
            Regularizer::L2 { l2: 0.01 }
        );
        assert_eq!(
            "l1_l2".parse::<Regularizer>().unwrap(),
            Regularizer::L1L2 { l1: 0.01, l2: 0.01 }
        );
        assert!("l3".parse::<Regularizer>().is_err());
    }

    #[test]
    fn test_custom_regularizer() {
        let custom = register_regularizer("test_sum", SumOfWeights);
        let weights = arr1(&[1.0f32, 2., 3.]).into_dyn();
        assert_approx_eq!(f32, custom.penalty(weights.view()), 6.);
        assert_approx_eq!(f32, custom.gradient(weights.view()), arr1(&[1., 1., 1.]));

        let json = serde_json::to_string(&custom).unwrap();
        assert_eq!(serde_json::from_str::<Regularizer>(&json).unwrap(), custom);
    }

    #[test]
    fn test_serialized_form() {
        let json = serde_json::to_value(&Regularizer::L2 { l2: 0.5 }).unwrap();
        assert_eq!(
            json,
            serde_json::json!({ "class_name": "L2", "config": { "l2": 0.5 } })
        );
    }
}
