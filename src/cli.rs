//! Command line arguments and config file handling.
//!
//! Every binary gets two options for free: `--config <file>` to load settings, and
//! `--generate <file>` to write a documented sample of them. Binary specific arguments are
//! merged in from a [`clap::Args`] type.

use std::ffi::OsString;
use std::path::PathBuf;

use clap::{Arg, ArgAction, Command};
use serde::de::DeserializeOwned;
use snafu::{ResultExt as _, Snafu};

use crate::ServiceInfo;

const GENERATE_CONFIG_OPT_ID: &str = "generate";
const USE_CONFIG_OPT_ID: &str = "config";

/// Command line errors
#[derive(Debug, Snafu)]
pub enum Error {
    /// The arguments did not parse, or `--help`/`--version` was asked for
    #[snafu(display("{source}"))]
    ArgParse {
        /// The clap error, ready to be printed with [`clap::Error::exit`]
        source: clap::Error,
    },

    /// The config could not be generated or loaded
    #[snafu(display("{source}"))]
    Config {
        /// The config error
        source: crate::Error,
    },
}

/// Default generic argument for `Cli` when a binary has no arguments of its own.
#[derive(clap::Args, Debug, Default)]
pub struct NoArguments {}

/// Parsed arguments plus the settings loaded from the config file and environment.
#[derive(Debug)]
pub struct Cli<C, A = NoArguments> {
    /// Binary specific arguments
    pub args: A,
    /// Settings from the config file, environment and defaults
    pub config: C,
}

/// Outcome of parsing the command line.
#[derive(Debug)]
pub enum Action<C, A = NoArguments> {
    /// A sample config was written to this path; there is nothing to run.
    Generated(PathBuf),
    /// Settings were loaded; run with them.
    Run(Cli<C, A>),
}

impl<C, A> Cli<C, A>
where
    C: DeserializeOwned + doku::Document,
    A: clap::Args,
{
    fn command(service_info: &ServiceInfo) -> Command {
        let cmd = Command::new(service_info.name)
            .version(service_info.version)
            .author(service_info.author)
            .about(service_info.description)
            .arg(
                Arg::new(USE_CONFIG_OPT_ID)
                    .action(ArgAction::Set)
                    .long("config")
                    .short('c')
                    .value_parser(clap::value_parser!(PathBuf))
                    .help("TOML config file to run the service with. Built-in defaults apply without one"),
            )
            .arg(
                Arg::new(GENERATE_CONFIG_OPT_ID)
                    .action(ArgAction::Set)
                    .long("generate")
                    .short('g')
                    .value_parser(clap::value_parser!(PathBuf))
                    .conflicts_with(USE_CONFIG_OPT_ID)
                    .help("Write a documented sample config file and exit"),
            );
        A::augment_args(cmd)
    }

    /// Parse `args`, then either write a sample config or load the settings, applying
    /// environment overrides that start with `env_prefix`.
    ///
    /// # Errors
    /// - `ArgParse` for unknown or malformed arguments, and for `--help` and `--version`.
    /// - `Config` if the sample cannot be written or the settings cannot be loaded.
    pub fn try_parse_from<I, T>(
        service_info: &ServiceInfo,
        env_prefix: &str,
        args: I,
    ) -> Result<Action<C, A>, Error>
    where
        I: IntoIterator<Item = T>,
        T: Into<OsString> + Clone,
    {
        let mut matches = Self::command(service_info)
            .try_get_matches_from(args)
            .context(ArgParseSnafu)?;

        if let Some(path) = matches.remove_one::<PathBuf>(GENERATE_CONFIG_OPT_ID) {
            crate::config::write_sample::<C>(&path).context(ConfigSnafu)?;
            return Ok(Action::Generated(path));
        }

        let config_path = matches.remove_one::<PathBuf>(USE_CONFIG_OPT_ID);
        let args = A::from_arg_matches_mut(&mut matches).context(ArgParseSnafu)?;
        let config = crate::config::load(config_path, Some(env_prefix)).context(ConfigSnafu)?;

        Ok(Action::Run(Self { args, config }))
    }

    /// Parse the process arguments.
    ///
    /// Exits the process after writing a sample config, and on any error.
    pub fn new(service_info: &ServiceInfo, env_prefix: &str) -> Self {
        match Self::try_parse_from(service_info, env_prefix, std::env::args_os()) {
            Ok(Action::Run(cli)) => cli,
            Ok(Action::Generated(path)) => {
                println!("Wrote a sample config to {}", path.display());
                std::process::exit(0);
            }
            Err(Error::ArgParse { source }) => source.exit(),
            Err(err) => {
                eprintln!("{err}");
                std::process::exit(1);
            }
        }
    }
}
