mod args;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use polystore_config::Config;
use polystore_model::{BackendKind, StagingLayout};
use polystore_provision::{
    Acquirer, BackendScope, BulkLoader, DockerContainer, DockerTarget, FinalOutcome, Orchestrator,
    ReadinessPolicy, RunOptions,
};
use tokio_util::sync::CancellationToken;

use args::{Cli, Command};

const CONFIG_ERROR: i32 = 2;

fn setup_tracing(level: &str) -> Result<()> {
    let filter = EnvFilter::builder()
        .with_default_directive(level.parse()?)
        .from_env_lossy();

    FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();

    Ok(())
}

fn main() {
    let Cli {
        command: Command::Run(args),
    } = Cli::parse();

    let config = match Config::from_file(&args.config) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("cannot load {}: {err}", args.config.display());
            std::process::exit(CONFIG_ERROR);
        }
    };
    let level = args.log_level.as_deref().unwrap_or(&config.logging.level);
    if let Err(err) = setup_tracing(level) {
        eprintln!("invalid log level `{level}`: {err}");
        std::process::exit(CONFIG_ERROR);
    }
    tracing::info!(config = %args.config.display(), "configuration loaded");

    let options = args.options();
    if let BackendScope::Only(kind) = options.scope {
        if config.backends.get(kind).is_none() {
            tracing::error!(backend = %kind, "backend is not configured or disabled");
            std::process::exit(CONFIG_ERROR);
        }
    }

    match run(config, &options) {
        Ok(outcome) => {
            println!("{outcome}");
            std::process::exit(outcome.exit_code());
        }
        Err(err) => {
            tracing::error!("run aborted: {err:#}");
            std::process::exit(1);
        }
    }
}

fn run(config: Config, options: &RunOptions) -> Result<FinalOutcome> {
    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(async {
        let docker = bollard::Docker::connect_with_local_defaults()?;
        let targets: Vec<_> = BackendKind::ALL
            .into_iter()
            .filter_map(|kind| {
                let descriptor = config.backends.get(kind)?;
                let container = DockerContainer::new(docker.clone(), descriptor);
                Some(DockerTarget::new(container, BulkLoader::new(kind, descriptor)))
            })
            .collect();

        let cancel = CancellationToken::new();
        tokio::spawn({
            let cancel = cancel.clone();
            async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    tracing::warn!("interrupted, letting in-flight commands finish");
                    cancel.cancel();
                }
            }
        });

        let acquirer = Acquirer::new(StagingLayout::new(&config.staging.dir));
        let policy = ReadinessPolicy::from(&config.readiness);
        let orchestrator = Orchestrator::new(config.entities, acquirer, policy, targets);
        Ok(orchestrator.run(options, cancel).await?)
    })
}
