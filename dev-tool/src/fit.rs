use std::{path::PathBuf, time::Instant};

use anyhow::{bail, Context, Error};
use indicatif::{HumanDuration, ProgressBar, ProgressStyle};
use log::{debug, info};
use ndarray::{Array2, Axis};
use psnake::{
    constraint::Constraint,
    initializer::Initializer,
    io::BinParams,
    optimizer::{MiniBatchSgd, Optimizer},
    regularizer::Regularizer,
    utils::{mean_squared_error, mean_squared_error_gradient},
    BuiltPSnake,
    PSnake,
    PSnakeConfig,
};
use rand::{rngs::StdRng, seq::SliceRandom, Rng, SeedableRng};
use structopt::StructOpt;

use crate::exit_code::{NON_FATAL_ERROR, NO_ERROR};

/// Fits alpha of a single feature layer to samples of a reference layer.
#[derive(StructOpt, Debug)]
pub struct FitCmd {
    /// The alpha of the reference layer producing the targets.
    #[structopt(long, default_value = "1.5")]
    target_alpha: f32,

    /// The alpha the fitted layer starts with.
    #[structopt(long, default_value = "1.0")]
    initial_alpha: f32,

    /// The inputs are sampled uniformly from "-range..=range".
    #[structopt(long, default_value = "1.0")]
    range: f32,

    /// The number of samples.
    #[structopt(long, default_value = "1024")]
    samples: usize,

    /// The number of epochs to run.
    #[structopt(long, default_value = "50")]
    epochs: usize,

    /// The batch size to use.
    #[structopt(long, default_value = "32")]
    batch_size: usize,

    /// The learning rate to use.
    #[structopt(long, default_value = "0.5")]
    learning_rate: f32,

    /// The seed for sampling and shuffling, a random seed is used if not set.
    #[structopt(long)]
    seed: Option<u64>,

    /// The regularizer of alpha, e.g. "l2".
    #[structopt(long)]
    regularizer: Option<Regularizer>,

    /// The constraint of alpha, e.g. "non_neg".
    #[structopt(long)]
    constraint: Option<Constraint>,

    /// Stores the fitted alpha in this ".binparams" file.
    #[structopt(short, long)]
    out: Option<PathBuf>,
}

/// Samples of a reference layer.
struct Samples {
    inputs: Array2<f32>,
    targets: Array2<f32>,
}

struct Fitted {
    layer: BuiltPSnake,
    initial_loss: f32,
    loss: f32,
}

impl FitCmd {
    pub fn run(self) -> Result<i32, Error> {
        let start_time = Instant::now();
        let Fitted {
            layer,
            initial_loss,
            loss,
        } = self.fit(&ProgressBar::new(self.epochs as u64))?;
        info!("End of fitting. Duration: {}", HumanDuration(start_time.elapsed()));

        println!("Initial loss: {}", initial_loss);
        println!("Loss: {}", loss);
        println!("Alpha: {}", layer.alpha());

        if let Some(out) = &self.out {
            let mut params = BinParams::default();
            layer.store_params(params.with_scope(layer.name()));
            params
                .serialize_into_file(out)
                .with_context(|| format!("Storing parameters in {} failed.", out.display()))?;
        }

        if loss.is_finite() {
            Ok(NO_ERROR)
        } else {
            eprintln!("Fitting diverged, check that alpha can't become zero.");
            Ok(NON_FATAL_ERROR)
        }
    }

    fn fit(&self, progress_bar: &ProgressBar) -> Result<Fitted, Error> {
        if self.samples == 0 || self.batch_size == 0 {
            bail!("Fitting needs at least one sample and a batch size of at least one.");
        }

        let mut rng = match self.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let samples = self.sample(&mut rng)?;

        let mut layer = PSnake::new(
            PSnakeConfig::default()
                .with_name("psnake")
                .with_alpha_initializer(Initializer::Constant {
                    value: self.initial_alpha,
                })
                .with_alpha_regularizer(self.regularizer.clone())
                .with_alpha_constraint(self.constraint.clone()),
        )
        .build(&[None, Some(1)])?;
        let mut optimizer = MiniBatchSgd {
            learning_rate: self.learning_rate,
        };

        let initial_loss = evaluate(&layer, &samples)?;
        info!(
            "Beginning of fitting for {} epochs, initial loss={}",
            self.epochs, initial_loss
        );
        progress_bar.set_style(
            ProgressStyle::default_bar().template("{msg} {wide_bar} {pos:>4}/{len:4} epochs"),
        );

        let mut indices = (0..self.samples).collect::<Vec<_>>();
        let mut loss = initial_loss;
        for epoch in 0..self.epochs {
            indices.shuffle(&mut rng);
            for batch in indices.chunks(self.batch_size) {
                let inputs = samples.inputs.select(Axis(0), batch);
                let targets = samples.targets.select(Axis(0), batch);
                let outputs = layer.run(inputs.view())?;
                let partials = mean_squared_error_gradient(&outputs, &targets);
                let (_, gradients) = layer.gradients(inputs, partials)?;
                optimizer.apply_gradients(&mut layer, vec![gradients]);
            }

            loss = evaluate(&layer, &samples)?;
            debug!(
                "End of epoch #{:0>4}: loss={} alpha={}",
                epoch,
                loss,
                layer.alpha()
            );
            progress_bar.set_message(format!("loss {:.6}", loss));
            progress_bar.inc(1);
        }
        progress_bar.finish();

        Ok(Fitted {
            layer,
            initial_loss,
            loss,
        })
    }

    fn sample(&self, rng: &mut impl Rng) -> Result<Samples, Error> {
        let range = self.range.abs();
        let inputs = Array2::from_shape_simple_fn((self.samples, 1), || {
            rng.gen_range(-range..=range)
        });
        let reference = PSnake::new(
            PSnakeConfig::default()
                .with_name("reference")
                .with_alpha_initializer(Initializer::Constant {
                    value: self.target_alpha,
                }),
        )
        .build(&[None, Some(1)])?;
        let targets = reference.run(inputs.view())?;
        Ok(Samples { inputs, targets })
    }
}

/// The mean squared error on all samples plus the regularization loss.
fn evaluate(layer: &BuiltPSnake, samples: &Samples) -> Result<f32, Error> {
    let outputs = layer.run(samples.inputs.view())?;
    Ok(mean_squared_error(&outputs, &samples.targets) + layer.regularization_loss())
}

#[cfg(test)]
mod tests {
    use test_utils::assert_approx_eq;

    use super::*;

    fn cmd() -> FitCmd {
        FitCmd {
            target_alpha: 1.5,
            initial_alpha: 1.,
            range: 1.,
            samples: 256,
            epochs: 20,
            batch_size: 16,
            learning_rate: 0.5,
            seed: Some(42),
            regularizer: None,
            constraint: None,
            out: None,
        }
    }

    #[test]
    fn test_fitting_reduces_loss() {
        let Fitted {
            layer,
            initial_loss,
            loss,
        } = cmd().fit(&ProgressBar::hidden()).unwrap();
        assert!(loss < initial_loss, "{} >= {}", loss, initial_loss);
        assert_approx_eq!(f32, layer.alpha(), [1.5], epsilon = 0.1);
    }

    #[test]
    fn test_fitting_is_reproducible() {
        let first = cmd().fit(&ProgressBar::hidden()).unwrap();
        let second = cmd().fit(&ProgressBar::hidden()).unwrap();
        assert_approx_eq!(f32, first.layer.alpha(), second.layer.alpha(), ulps = 0);
        assert_approx_eq!(f32, first.loss, second.loss, ulps = 0);
    }

    #[test]
    fn test_fitting_respects_constraint() {
        let cmd = FitCmd {
            constraint: Some(Constraint::Clip {
                min_value: 0.5,
                max_value: 1.2,
            }),
            ..cmd()
        };
        let Fitted { layer, .. } = cmd.fit(&ProgressBar::hidden()).unwrap();
        assert_approx_eq!(f32, layer.alpha(), [1.2]);
    }

    #[test]
    fn test_fitting_without_samples_fails() {
        let cmd = FitCmd {
            samples: 0,
            ..cmd()
        };
        assert!(cmd.fit(&ProgressBar::hidden()).is_err());
    }

    #[test]
    fn test_run_stores_params() {
        let dir = std::env::temp_dir().join(format!("psnake-fit-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let file = dir.join("fitted.binparams");
        let cmd = FitCmd {
            epochs: 2,
            out: Some(file.clone()),
            ..cmd()
        };
        assert_eq!(cmd.run().unwrap(), NO_ERROR);

        let mut params = BinParams::deserialize_from_file(&file).unwrap();
        let alpha = params.take::<ndarray::ArrayD<f32>>("psnake/alpha").unwrap();
        assert_eq!(alpha.shape(), &[1]);
        assert!(params.is_empty());
        std::fs::remove_dir_all(dir).unwrap();
    }
}
