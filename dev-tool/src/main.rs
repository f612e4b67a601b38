use std::process::exit;

use anyhow::Error;
use structopt::StructOpt;

use crate::exit_code::FATAL_ERROR;

mod config;
mod exit_code;
mod fit;
mod inspect;

/// Tooling for the developers of the PSnake layer.
#[derive(StructOpt, Debug)]
enum CommandArgs {
    /// Prints the config of a layer and optionally builds it.
    Config(config::ConfigCmd),
    /// Fits alpha to samples of a reference layer.
    Fit(fit::FitCmd),
    /// Inspects a ".binparams" file.
    Inspect(inspect::InspectCmd),
}

impl CommandArgs {
    fn run(self) -> Result<i32, Error> {
        match self {
            CommandArgs::Config(cmd) => cmd.run(),
            CommandArgs::Fit(cmd) => cmd.run(),
            CommandArgs::Inspect(cmd) => cmd.run(),
        }
    }
}

fn main() {
    env_logger::init();

    let exit_code = match CommandArgs::from_args().run() {
        Ok(exit_code) => exit_code,
        Err(error) => {
            eprintln!("{:?}", error);
            FATAL_ERROR
        }
    };

    exit(exit_code);
}
