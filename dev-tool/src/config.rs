use std::{num::ParseIntError, str::FromStr};

use anyhow::Error;
use log::debug;
use psnake::{
    constraint::Constraint,
    initializer::Initializer,
    regularizer::Regularizer,
    PSnake,
    PSnakeConfig,
};
use structopt::StructOpt;

use crate::exit_code::NO_ERROR;

/// Prints the config of a PSnake layer as json.
#[derive(StructOpt, Debug)]
pub struct ConfigCmd {
    /// The name of the layer, a unique default name is used if not set.
    #[structopt(long)]
    name: Option<String>,

    /// Excludes alpha from training.
    #[structopt(long)]
    frozen: bool,

    /// The initializer of alpha, e.g. "ones" or "glorot_uniform".
    #[structopt(long, default_value = "ones")]
    initializer: Initializer,

    /// The regularizer of alpha, e.g. "l2".
    #[structopt(long)]
    regularizer: Option<Regularizer>,

    /// The constraint of alpha, e.g. "non_neg".
    #[structopt(long)]
    constraint: Option<Constraint>,

    /// The axes along which alpha is shared.
    ///
    /// This accepts comma separated lists. Additionally
    /// to including the option multiple times.
    #[structopt(long, use_delimiter = true)]
    shared_axes: Vec<usize>,

    /// Builds the layer for inputs of given shape and prints the alpha shape.
    ///
    /// Format: comma separated sizes with "?" for unknown sizes.
    ///
    /// E.g.: --input-shape="?,3,3,2"
    #[structopt(long)]
    input_shape: Option<InputShape>,
}

impl ConfigCmd {
    pub fn run(self) -> Result<i32, Error> {
        let input_shape = self.input_shape.clone();
        let layer = PSnake::new(self.into_config());
        println!("{}", serde_json::to_string_pretty(&layer.get_config()?)?);

        if let Some(InputShape(input_shape)) = input_shape {
            debug!("Building {} for {:?}", layer.name(), input_shape);
            let layer = layer.build(&input_shape)?;
            println!("Alpha shape: {:?}", layer.alpha().shape());
            println!("Constrained axes: {:?}", layer.input_spec().axes());
        }

        Ok(NO_ERROR)
    }

    fn into_config(self) -> PSnakeConfig {
        let Self {
            name,
            frozen,
            initializer,
            regularizer,
            constraint,
            shared_axes,
            ..
        } = self;

        let mut config = PSnakeConfig::default()
            .with_trainable(!frozen)
            .with_alpha_initializer(initializer)
            .with_alpha_regularizer(regularizer)
            .with_alpha_constraint(constraint);
        if let Some(name) = name {
            config = config.with_name(name);
        }
        if !shared_axes.is_empty() {
            config = config.with_shared_axes(shared_axes);
        }
        config
    }
}

/// An input shape in which the sizes may be unknown.
#[derive(Clone, Debug, PartialEq)]
struct InputShape(Vec<Option<usize>>);

impl FromStr for InputShape {
    type Err = ParseIntError;

    fn from_str(shape: &str) -> Result<Self, Self::Err> {
        shape
            .split(',')
            .map(str::trim)
            .filter(|size| !size.is_empty())
            .map(|size| match size {
                "?" => Ok(None),
                size => size.parse().map(Some),
            })
            .collect::<Result<_, _>>()
            .map(InputShape)
    }
}

#[cfg(test)]
mod tests {
    use psnake::SharedAxes;

    use super::*;

    fn cmd(args: &[&str]) -> ConfigCmd {
        ConfigCmd::from_iter_safe(std::iter::once("config").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn test_parse_input_shape() {
        assert_eq!(
            "?,3, 3,2".parse::<InputShape>().unwrap(),
            InputShape(vec![None, Some(3), Some(3), Some(2)])
        );
        assert_eq!("".parse::<InputShape>().unwrap(), InputShape(vec![]));
        assert!("?,x".parse::<InputShape>().is_err());
    }

    #[test]
    fn test_defaults() {
        let config = cmd(&[]).into_config();
        assert!(config.base.trainable);
        assert_eq!(config.alpha_initializer, Initializer::Ones);
        assert!(config.alpha_regularizer.is_none());
        assert!(config.alpha_constraint.is_none());
        assert!(config.shared_axes.is_none());
    }

    #[test]
    fn test_strategies_and_axes_from_args() {
        let config = cmd(&[
            "--name",
            "snake",
            "--frozen",
            "--initializer",
            "he_normal",
            "--regularizer",
            "l2",
            "--constraint",
            "non_neg",
            "--shared-axes",
            "1,2",
        ])
        .into_config();

        assert_eq!(config.base.name, "snake");
        assert!(!config.base.trainable);
        assert_eq!(
            config.alpha_initializer,
            Initializer::HeNormal { seed: None }
        );
        assert_eq!(config.alpha_regularizer, Some(Regularizer::L2 { l2: 0.01 }));
        assert_eq!(config.alpha_constraint, Some(Constraint::NonNeg));
        assert_eq!(config.shared_axes, Some(SharedAxes::from(vec![1, 2])));
    }

    #[test]
    fn test_unknown_identifier_is_rejected() {
        let result = ConfigCmd::from_iter_safe(vec!["config", "--initializer", "not_a_initializer"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_run_with_input_shape() {
        let exit_code = cmd(&["--shared-axes", "1", "--input-shape", "?,3,2"])
            .run()
            .unwrap();
        assert_eq!(exit_code, NO_ERROR);

        assert!(cmd(&["--shared-axes", "3", "--input-shape", "?,3,2"])
            .run()
            .is_err());
    }
}
