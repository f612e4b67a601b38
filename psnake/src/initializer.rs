//! Initial value policies for parameters.

use std::{str::FromStr, sync::Arc};

use displaydoc::Display;
use lazy_static::lazy_static;
use ndarray::{ArrayD, Dimension, IxDyn};
use rand::{rngs::StdRng, Rng, SeedableRng};
use rand_distr::{Distribution, Normal, Uniform};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::registry::{Custom, Registered, Registry, UnknownIdentifier};

/// A user supplied initializer.
///
/// Implemented for all `Fn(&IxDyn) -> ArrayD<f32>` closures.
pub trait InitializerFn: Send + Sync {
    /// Creates a array of given shape.
    fn initialize(&self, shape: &IxDyn) -> ArrayD<f32>;
}

impl<F> InitializerFn for F
where
    F: Fn(&IxDyn) -> ArrayD<f32> + Send + Sync,
{
    fn initialize(&self, shape: &IxDyn) -> ArrayD<f32> {
        self(shape)
    }
}

lazy_static! {
    static ref INITIALIZERS: Registry<dyn InitializerFn> = Registry::new();
}

impl Registered for dyn InitializerFn {
    const KIND: &'static str = "initializer";

    fn registry() -> &'static Registry<Self> {
        &INITIALIZERS
    }
}

/// Registers a custom initializer under given name.
///
/// The returned initializer serializes as the name and
/// deserializes as long as the name stays registered.
pub fn register_initializer(
    name: impl Into<String>,
    function: impl InitializerFn + 'static,
) -> Initializer {
    Initializer::Custom(Custom::register(name, Arc::new(function)))
}

/// Initializer of parameter arrays.
///
/// The random initializers use their `seed` if one is given, the thread rng otherwise.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "class_name", content = "config")]
pub enum Initializer {
    Zeros,
    Ones,
    Constant {
        value: f32,
    },
    RandomUniform {
        minval: f32,
        maxval: f32,
        #[serde(default)]
        seed: Option<u64>,
    },
    RandomNormal {
        mean: f32,
        stddev: f32,
        #[serde(default)]
        seed: Option<u64>,
    },
    /// Normal distribution resampled outside of `mean ± 2 * stddev`.
    TruncatedNormal {
        mean: f32,
        stddev: f32,
        #[serde(default)]
        seed: Option<u64>,
    },
    /// Uniform over `[-√(6/(n+o)); √(6/(n+o))]` with `n`/`o` the fan in/out.
    GlorotUniform {
        #[serde(default)]
        seed: Option<u64>,
    },
    /// `N(μ=0, σ²=2/(n+o))` truncated at 2σ with `n`/`o` the fan in/out.
    GlorotNormal {
        #[serde(default)]
        seed: Option<u64>,
    },
    /// Uniform over `[-√(6/n); √(6/n)]` with `n` the fan in.
    HeUniform {
        #[serde(default)]
        seed: Option<u64>,
    },
    /// `N(μ=0, σ²=2/n)` truncated at 2σ with `n` the fan in.
    HeNormal {
        #[serde(default)]
        seed: Option<u64>,
    },
    Custom(Custom<dyn InitializerFn>),
}

impl Default for Initializer {
    fn default() -> Self {
        Initializer::Ones
    }
}

/// Invalid arguments of the {initializer} initializer: {reason}
#[derive(Debug, Display, Error, PartialEq)]
pub struct InvalidArguments {
    initializer: &'static str,
    reason: &'static str,
}

impl Initializer {
    /// Checks that the arguments can be sampled from.
    ///
    /// Arguments which are deserialized or set by hand can be invalid, e.g.
    /// a `minval` above the `maxval`.
    pub fn validate(&self) -> Result<(), InvalidArguments> {
        fn invalid(initializer: &'static str, reason: &'static str) -> Result<(), InvalidArguments> {
            Err(InvalidArguments {
                initializer,
                reason,
            })
        }

        match self {
            Initializer::RandomUniform { minval, maxval, .. } => {
                if !(maxval - minval).is_finite() {
                    invalid("RandomUniform", "minval and maxval must be finite")
                } else if minval > maxval {
                    invalid("RandomUniform", "minval must not exceed maxval")
                } else {
                    Ok(())
                }
            }
            Initializer::RandomNormal { mean, stddev, .. }
            | Initializer::TruncatedNormal { mean, stddev, .. } => {
                let initializer = if let Initializer::RandomNormal { .. } = self {
                    "RandomNormal"
                } else {
                    "TruncatedNormal"
                };
                if !mean.is_finite() || !stddev.is_finite() {
                    invalid(initializer, "mean and stddev must be finite")
                } else if *stddev < 0. {
                    invalid(initializer, "stddev must not be negative")
                } else {
                    Ok(())
                }
            }
            _ => Ok(()),
        }
    }

    /// Creates a array of given shape.
    ///
    /// # Panics
    ///
    /// If the arguments are invalid, see [`Initializer::validate()`].
    pub fn initialize(&self, shape: &IxDyn) -> ArrayD<f32> {
        match self.seed() {
            Some(seed) => self.initialize_with(&mut StdRng::seed_from_u64(seed), shape),
            None => self.initialize_with(&mut rand::thread_rng(), shape),
        }
    }

    /// Creates a array of given shape, drawing random values from given rng.
    ///
    /// The `seed` of the initializer is ignored.
    ///
    /// # Panics
    ///
    /// If the arguments are invalid, see [`Initializer::validate()`].
    pub fn initialize_with<R>(&self, rng: &mut R, shape: &IxDyn) -> ArrayD<f32>
    where
        R: Rng + ?Sized,
    {
        let shape = shape.clone();
        match self {
            Initializer::Zeros => ArrayD::zeros(shape),
            Initializer::Ones => ArrayD::ones(shape),
            Initializer::Constant { value } => ArrayD::from_elem(shape, *value),
            Initializer::RandomUniform { minval, maxval, .. } => {
                uniform(rng, shape, *minval, *maxval)
            }
            Initializer::RandomNormal { mean, stddev, .. } => {
                let dist = normal(*mean, *stddev);
                ArrayD::from_shape_simple_fn(shape, || dist.sample(rng))
            }
            Initializer::TruncatedNormal { mean, stddev, .. } => {
                truncated_normal(rng, shape, *mean, *stddev)
            }
            Initializer::GlorotUniform { .. } => {
                let (fan_in, fan_out) = fans(&shape);
                scaled_uniform(rng, shape, fan_in + fan_out)
            }
            Initializer::GlorotNormal { .. } => {
                let (fan_in, fan_out) = fans(&shape);
                scaled_truncated_normal(rng, shape, fan_in + fan_out)
            }
            Initializer::HeUniform { .. } => {
                let (fan_in, _) = fans(&shape);
                scaled_uniform(rng, shape, fan_in)
            }
            Initializer::HeNormal { .. } => {
                let (fan_in, _) = fans(&shape);
                scaled_truncated_normal(rng, shape, fan_in)
            }
            Initializer::Custom(custom) => custom.function().initialize(&shape),
        }
    }

    fn seed(&self) -> Option<u64> {
        match self {
            Initializer::RandomUniform { seed, .. }
            | Initializer::RandomNormal { seed, .. }
            | Initializer::TruncatedNormal { seed, .. }
            | Initializer::GlorotUniform { seed }
            | Initializer::GlorotNormal { seed }
            | Initializer::HeUniform { seed }
            | Initializer::HeNormal { seed } => *seed,
            Initializer::Zeros
            | Initializer::Ones
            | Initializer::Constant { .. }
            | Initializer::Custom(_) => None,
        }
    }
}

impl FromStr for Initializer {
    type Err = UnknownIdentifier;

    /// Resolves a snake case identifier to a initializer with default arguments.
    ///
    /// Names which are not built-in are looked up in the registry of custom initializers.
    fn from_str(name: &str) -> Result<Self, Self::Err> {
        let initializer = match name {
            "zeros" => Initializer::Zeros,
            "ones" => Initializer::Ones,
            "constant" => Initializer::Constant { value: 0. },
            "random_uniform" => Initializer::RandomUniform {
                minval: -0.05,
                maxval: 0.05,
                seed: None,
            },
            "random_normal" => Initializer::RandomNormal {
                mean: 0.,
                stddev: 0.05,
                seed: None,
            },
            "truncated_normal" => Initializer::TruncatedNormal {
                mean: 0.,
                stddev: 0.05,
                seed: None,
            },
            "glorot_uniform" => Initializer::GlorotUniform { seed: None },
            "glorot_normal" => Initializer::GlorotNormal { seed: None },
            "he_uniform" => Initializer::HeUniform { seed: None },
            "he_normal" => Initializer::HeNormal { seed: None },
            custom => Initializer::Custom(Custom::lookup(custom)?),
        };
        Ok(initializer)
    }
}

/// Computes the fan in and fan out of a parameter with given shape.
///
/// For rank 2 this is `(rows, columns)`. For higher ranks the last two axes are
/// the in/out features and all leading axes form the receptive field.
fn fans(shape: &IxDyn) -> (usize, usize) {
    match shape.slice() {
        [] => (1, 1),
        [size] => (*size, *size),
        [receptive_field @ .., fan_in, fan_out] => {
            let receptive_field = receptive_field.iter().product::<usize>();
            (fan_in * receptive_field, fan_out * receptive_field)
        }
    }
}

fn normal(mean: f32, stddev: f32) -> Normal<f32> {
    Normal::new(mean, stddev).unwrap_or_else(|_| {
        panic!(
            "standard deviation must be finite and non-negative, got {}",
            stddev
        )
    })
}

fn uniform<R>(rng: &mut R, shape: IxDyn, low: f32, high: f32) -> ArrayD<f32>
where
    R: Rng + ?Sized,
{
    let dist = Uniform::new_inclusive(low, high);
    ArrayD::from_shape_simple_fn(shape, || dist.sample(rng))
}

fn truncated_normal<R>(rng: &mut R, shape: IxDyn, mean: f32, stddev: f32) -> ArrayD<f32>
where
    R: Rng + ?Sized,
{
    let dist = normal(mean, stddev);
    let limit = 2. * stddev;

    ArrayD::from_shape_simple_fn(shape, || loop {
        let res = dist.sample(rng);
        if mean - limit <= res && res <= mean + limit {
            break res;
        }
    })
}

fn scaled_uniform<R>(rng: &mut R, shape: IxDyn, fan: usize) -> ArrayD<f32>
where
    R: Rng + ?Sized,
{
    // Avoids problems with by-0 division.
    if fan == 0 {
        return ArrayD::zeros(shape);
    }

    let limit = (6.0 / fan as f32).sqrt();
    uniform(rng, shape, -limit, limit)
}

fn scaled_truncated_normal<R>(rng: &mut R, shape: IxDyn, fan: usize) -> ArrayD<f32>
where
    R: Rng + ?Sized,
{
    // Avoids problems with by-0 division.
    if fan == 0 {
        return ArrayD::zeros(shape);
    }

    let std_dev = (2.0 / fan as f32).sqrt();
    truncated_normal(rng, shape, 0., std_dev)
}
