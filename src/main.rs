use std::{fs::File, process::ExitCode};

use anyhow::{Context, Result, anyhow};
use arm_ecd::{
    application::Application,
    cli::{Cli, Command},
    commands,
    config::ConfigManager,
    error::exit_code,
};
use clap::Parser;
use daemonize::Daemonize;
use log::{LevelFilter, error, info};
use syslog::{BasicLogger, Facility, Formatter3164};

const DAEMON_LOG: &str = "/var/tmp/arm-ecd.log";

fn init_log(verbose: bool) -> Result<()> {
    let level = if verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };

    syslog::unix(Formatter3164 {
        facility: Facility::LOG_DAEMON,
        hostname: None,
        process: "arm-ecd".into(),
        pid: std::process::id(),
    })
    .map_err(|e| anyhow!("{e}"))
    .and_then(|logger| {
        log::set_boxed_logger(Box::new(BasicLogger::new(logger)))
            .map(|_| log::set_max_level(level))
            .map_err(|e| anyhow!("{e}"))
    })
}

fn into_daemon() -> Result<()> {
    File::create(DAEMON_LOG)
        .and_then(|out| Ok((out.try_clone()?, out)))
        .with_context(|| format!("Failed to create {DAEMON_LOG}"))
        .and_then(|(stderr, stdout)| {
            Daemonize::new()
                .stdout(stdout)
                .stderr(stderr)
                .start()
                .map_err(|e| anyhow!("Failed to daemonize: {e}"))
        })
}

async fn dispatch(cli: Cli) -> Result<()> {
    let config_path = cli.config;

    match cli.command {
        Command::Models { json } => commands::models(json),
        Command::Run { .. } => {
            let config_manager = ConfigManager::load(config_path).await?;
            info!("arm-ecd {} starting", env!("CARGO_PKG_VERSION"));
            let result = Application::builder()
                .with_config_manager(config_manager)
                .build()?
                .run()
                .await;
            info!("arm-ecd stopped");
            result
        }
        Command::Status => {
            let config = ConfigManager::load(config_path).await?.clone_config().await;
            commands::status(&config).await
        }
        Command::Effect { effect } => {
            let config = ConfigManager::load(config_path).await?.clone_config().await;
            commands::effect(&config, effect).await
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = init_log(cli.verbose) {
        eprintln!("arm-ecd: syslog unavailable, logging disabled: {e:#}");
    }

    if let Command::Run { daemonize: true } = cli.command {
        if let Err(e) = into_daemon() {
            error!("{e:#}");
            eprintln!("arm-ecd: {e:#}");
            return ExitCode::FAILURE;
        }
    }

    let result = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to start the async runtime")
        .and_then(|runtime| runtime.block_on(dispatch(cli)));

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e:#}");
            eprintln!("arm-ecd: {e:#}");
            ExitCode::from(exit_code(&e))
        }
    }
}
