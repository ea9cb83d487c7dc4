//! Slipway driver.
//!
//! Exit codes: 0 success, 1 build failure, 2 usage or configuration
//! error.

use std::process::ExitCode;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use slipway::core::{TargetState, VariableOverride};
use slipway::engine::{Engine, EngineConfig};
use slipway::util::config::UserConfig;
use slipway::util::diagnostic;

mod cli;

use cli::Cli;

fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = if cli.verbose >= 3 {
        EnvFilter::new("slipway=debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("slipway=warn"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .without_time()
        .with_writer(std::io::stderr)
        .init();

    match run(cli) {
        Ok(TargetState::Failed) => ExitCode::from(1),
        Ok(_) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {:#}", e);
            ExitCode::from(2)
        }
    }
}

fn run(cli: Cli) -> Result<TargetState> {
    let user = UserConfig::load().unwrap_or_else(|e| {
        diagnostic::warn(format!("{:#}", e));
        UserConfig::default()
    });

    diagnostic::set_verbosity(user.verbosity.map_or(cli.verbose, |v| {
        if cli.verbose != 1 {
            cli.verbose
        } else {
            v
        }
    }));

    let max_active = if cli.serial {
        1
    } else {
        cli.jobs
            .or(user.jobs)
            .filter(|&j| j > 0)
            .unwrap_or_else(slipway::Scheduler::hardware_concurrency)
    };

    // Variable overrides come in through the environment.
    let mut overrides = Vec::new();
    if let Ok(raw) = std::env::var("BUILD2_VAR_OVR") {
        for line in raw.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match VariableOverride::parse(line) {
                Some(o) => overrides.push(o),
                None => anyhow::bail!("invalid variable override '{}'", line),
            }
        }
    }

    let engine = Engine::new(EngineConfig {
        max_active,
        keep_going: cli.keep_going || user.keep_going.unwrap_or(false),
        dry_run: cli.dry_run,
        overrides,
        work_dir: std::env::current_dir()?,
    });

    let spec = cli.buildspec.join(" ");
    let result = slipway::ops::run(&engine, &spec);

    let stats = engine.shutdown();
    tracing::debug!(
        helpers = stats.thread_helpers,
        max_waiting = stats.thread_max_waiting,
        queue_full = stats.task_queue_full,
        wait_collisions = stats.wait_queue_collisions,
        "scheduler statistics"
    );

    result
}
