use std::{
    convert::TryInto,
    fmt::{self, Display},
    path::PathBuf,
};

use anyhow::Error;
use log::debug;
use ndarray::{ArrayBase, ArrayD, Data, Dimension};
use psnake::io::{BinParams, LoadingBinParamsFailed};
use structopt::StructOpt;

use crate::exit_code::{NON_FATAL_ERROR, NO_ERROR};

/// Inspects the parameters stored in a ".binparams" file.
#[derive(StructOpt, Debug)]
pub struct InspectCmd {
    /// Prints all the values of each array.
    #[structopt(short, long)]
    print_data: bool,

    /// Only inspects the arrays of the layer with this name.
    #[structopt(long)]
    scope: Option<String>,

    /// Checks that no alpha contains zero or non finite values.
    ///
    /// The transform divides by alpha, such values produce
    /// non finite outputs.
    #[structopt(short = "c", long)]
    check_alpha: bool,

    /// Path to a ".binparams" file.
    file: PathBuf,
}

impl InspectCmd {
    pub fn run(self) -> Result<i32, Error> {
        self.run_(BinParams::deserialize_from_file)
    }

    fn run_(
        self,
        load_bin_params: impl FnOnce(PathBuf) -> Result<BinParams, LoadingBinParamsFailed>,
    ) -> Result<i32, Error> {
        let Self {
            print_data,
            scope,
            check_alpha,
            file,
        } = self;

        debug!("Loading BinParams from {}.", file.display());
        let mut params = load_bin_params(file)?.into_iter().collect::<Vec<_>>();
        params.sort_by(|(left, _), (right, _)| left.cmp(right));

        let prefix = scope.map(|scope| format!("{}/", scope));
        let mut failed_checks = Vec::new();
        for (name, flat_array) in params {
            if let Some(prefix) = &prefix {
                if !name.starts_with(prefix.as_str()) {
                    debug!("Skipping Array: {}", name);
                    continue;
                }
            }

            let array: ArrayD<f32> = flat_array.try_into()?;
            let stats = Stats::calculate(array.view());
            println!("----------------------------------------");
            println!("Name: {}", name);
            println!("Shape: {:?}", array.shape());
            println!("Stats: {}", stats);
            if print_data {
                println!("Array: {:?}", array);
            }

            if check_alpha && is_alpha(&name) && (stats.zeros > 0 || stats.non_finite > 0) {
                failed_checks.push(name);
            }
        }

        if failed_checks.is_empty() {
            Ok(NO_ERROR)
        } else {
            eprintln!("Alpha checks failed:");
            for name in failed_checks {
                eprintln!(" - {}", name);
            }
            Ok(NON_FATAL_ERROR)
        }
    }
}

fn is_alpha(name: &str) -> bool {
    name == "alpha" || name.ends_with("/alpha")
}

struct Stats {
    /// The min value in the array, or 0 if the array is empty.
    min: f32,
    /// The max value in the array, or 0 if the array is empty.
    max: f32,
    /// The arithmetic mean of the values in the array, or 0 if the array is empty.
    mean: f32,
    /// The number of values which are exactly zero.
    zeros: usize,
    /// The number of `NaN` and `Inf` values.
    non_finite: usize,
}

impl Stats {
    fn calculate<S, D>(array: ArrayBase<S, D>) -> Self
    where
        S: Data<Elem = f32>,
        D: Dimension,
    {
        let initial = Self {
            min: f32::INFINITY,
            max: f32::NEG_INFINITY,
            mean: array.mean().unwrap_or_default(),
            zeros: 0,
            non_finite: 0,
        };
        let mut stats = array.iter().copied().fold(initial, |mut stats, val| {
            stats.min = stats.min.min(val);
            stats.max = stats.max.max(val);
            stats.zeros += (val == 0.) as usize;
            stats.non_finite += (!val.is_finite()) as usize;
            stats
        });
        if array.is_empty() {
            stats.min = 0.;
            stats.max = 0.;
        }
        stats
    }
}

impl Display for Stats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "min = {}\n  mean = {}\n  max  = {}\n  zeros = {}\n  non finite = {}",
            self.min, self.mean, self.max, self.zeros, self.non_finite,
        )
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use ndarray::{arr1, arr2};
    use test_utils::assert_approx_eq;

    use super::*;

    fn cmd(scope: Option<&str>) -> InspectCmd {
        InspectCmd {
            print_data: false,
            scope: scope.map(Into::into),
            check_alpha: true,
            file: PathBuf::from("/my/path"),
        }
    }

    #[test]
    fn test_calculate_stats() {
        let stats = Stats::calculate(arr2(&[[0.25f32, 0., -10., 1.]]));
        assert_approx_eq!(f32, stats.min, -10., ulps = 0);
        assert_approx_eq!(f32, stats.max, 1., ulps = 0);
        assert_approx_eq!(f32, stats.mean, -2.1875, ulps = 0);
        assert_eq!(stats.zeros, 1);
        assert_eq!(stats.non_finite, 0);

        let stats = Stats::calculate(arr1(&[f32::NAN, f32::INFINITY, 1.]));
        assert_eq!(stats.zeros, 0);
        assert_eq!(stats.non_finite, 2);

        let stats = Stats::calculate(arr1::<f32>(&[]));
        assert_approx_eq!(f32, stats.min, 0.);
        assert_approx_eq!(f32, stats.max, 0.);
    }

    #[test]
    fn test_zero_alpha_fails_check() {
        let mut bin_params = BinParams::default();
        bin_params.insert("psnake/alpha", &arr1(&[1.0f32, 0.]));
        bin_params.insert("other/weights", &arr1(&[0.0f32, 0.]));

        let exit_code = cmd(None)
            .run_(move |path| {
                assert_eq!(path, Path::new("/my/path"));
                Ok(bin_params)
            })
            .unwrap();
        assert_eq!(exit_code, NON_FATAL_ERROR);
    }

    #[test]
    fn test_scope_skips_other_layers() {
        let mut bin_params = BinParams::default();
        bin_params.insert("psnake/alpha", &arr2(&[[1.0f32, 2.]]));
        bin_params.insert("psnake_1/alpha", &arr1(&[f32::NAN]));

        let exit_code = cmd(Some("psnake")).run_(move |_| Ok(bin_params)).unwrap();
        assert_eq!(exit_code, NO_ERROR);
    }

    #[test]
    fn test_is_alpha() {
        assert!(is_alpha("alpha"));
        assert!(is_alpha("psnake_2/alpha"));
        assert!(!is_alpha("psnake/alphas"));
    }
}
