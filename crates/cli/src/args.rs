use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};
use polystore_model::BackendKind;
use polystore_provision::{BackendScope, RunOptions};

/// Provisions the tabular, document and graph stores with one dataset.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Acquire, bring up, load and verify every targeted backend.
    Run(RunArgs),
}

#[derive(Args, Debug)]
pub struct RunArgs {
    #[arg(short, long, env = "POLYSTORE_CONFIG", default_value = "polystore.toml")]
    pub config: PathBuf,

    /// Reuse already staged data, fail if any artifact is missing.
    #[arg(long)]
    pub skip_acquire: bool,

    #[arg(long, value_enum, default_value_t = BackendArg::All)]
    pub backend: BackendArg,

    /// Overrides `logging.level` of the configuration.
    #[arg(long)]
    pub log_level: Option<String>,
}

impl RunArgs {
    pub fn options(&self) -> RunOptions {
        RunOptions {
            skip_acquire: self.skip_acquire,
            scope: self.backend.scope(),
        }
    }
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendArg {
    Tabular,
    Document,
    Graph,
    All,
}

impl BackendArg {
    pub fn scope(self) -> BackendScope {
        match self {
            BackendArg::Tabular => BackendScope::Only(BackendKind::Tabular),
            BackendArg::Document => BackendScope::Only(BackendKind::Document),
            BackendArg::Graph => BackendScope::Only(BackendKind::Graph),
            BackendArg::All => BackendScope::All,
        }
    }
}
