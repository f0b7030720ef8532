use std::sync::Arc;

use clap::Parser;
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::EnvFilter;

use kanbridge::board::kanboard::KanboardClient;
use kanbridge::cli::{Cli, CliCommand};
use kanbridge::config::Config;
use kanbridge::engine::Reconciler;
use kanbridge::error::{Error, Result};
use kanbridge::scheduler::Scheduler;
use kanbridge::sources::{AnySource, FindingSource, build_sources};

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging();

    info!("kanbridge starting");

    let config = match Config::load(&cli) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("error: {e}");
            std::process::exit(1);
        }
    };

    info!(?config, "config loaded");

    if let Err(e) = run(&cli, config).await {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}

async fn run(cli: &Cli, config: Config) -> Result<()> {
    let sources = build_sources(&config)?;

    if matches!(cli.command, Some(CliCommand::Count)) {
        return count(&sources);
    }

    let status = matches!(cli.command, Some(CliCommand::Status));
    if !status
        && !config.once
        && !config.continuous
        && !config.dry_run
        && config.max_passes.is_none()
    {
        return Err(Error::ConfigValidation(
            "specify --once, --continuous, --max-passes or --dry-run".to_string(),
        ));
    }

    let token = config.kanboard_token()?;
    let board = Arc::new(KanboardClient::new(&config.kanboard.url, &token));
    let reconciler = Reconciler::initialize(sources, board, config.engine_options())?;

    if status {
        println!("{}", reconciler.status()?);
        return Ok(());
    }
    if config.dry_run {
        println!("{}", reconciler.plan()?);
        return Ok(());
    }

    let scheduler = Scheduler::new(reconciler, config.interval()).max_passes(config.max_passes);
    if config.continuous || config.max_passes.is_some() {
        let (tx, rx) = watch::channel(false);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("interrupt received, stopping after the current pass");
                let _ = tx.send(true);
            }
        });
        let passes = scheduler.run_continuous(Some(rx)).await?;
        info!(passes, "continuous sync stopped");
    } else {
        let report = scheduler.run_once().await?;
        println!("{report}");
    }
    Ok(())
}

/// Print per-source finding counts. Needs no board access.
fn count(sources: &[AnySource]) -> Result<()> {
    let mut total = 0;
    for source in sources {
        let batch = source.fetch()?;
        let open = batch.findings.iter().filter(|f| !f.resolved).count();
        println!(
            "{}: {} findings ({} open, {} malformed)",
            source.origin(),
            batch.findings.len(),
            open,
            batch.malformed
        );
        total += batch.findings.len();
    }
    println!("Total: {total}");
    Ok(())
}
