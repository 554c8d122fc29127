mod config;
mod report;

use crate::config::cli::{Backend, CheckOpt, CliOpt, Command, RunOpt};
use clap::Parser;
use emulated_network::run::{RunController, RunOutcome};
use emulated_network::sim::{SimConfig, SimulatedNetwork};
use emulated_network::substrate::Substrate;
use emulated_network::substrate::netns::NetnsSubstrate;
use std::process::ExitCode;
use tokio::io::BufReader;
use tracing_subscriber::EnvFilter;

fn main() -> anyhow::Result<ExitCode> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let options = CliOpt::parse();
    match options.command {
        Command::Check(options) => {
            check(&options)?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Run(options) => {
            let mut builder = tokio::runtime::Builder::new_current_thread();
            builder.enable_all();
            if options.backend == Backend::Simulated {
                // Simulated labs wait through spanning tree timers and probe timeouts instantly
                builder.start_paused(true);
            }
            let rt = builder.build().expect("failed to initialize tokio");

            let code = rt.block_on(run(options));
            // An interrupted shell may leave a blocking read of stdin behind
            rt.shutdown_background();
            Ok(ExitCode::from(code?))
        }
    }
}

fn check(options: &CheckOpt) -> anyhow::Result<()> {
    let lab = config::lab::load(&options.lab)?;
    println!("--- Lab ---");
    println!("* {} ({})", lab.name, options.lab.display());
    let plan = lab.into_plan(&options.tunables)?;
    report::print_plan(&plan);
    Ok(())
}

async fn run(options: RunOpt) -> anyhow::Result<u8> {
    let lab = config::lab::load(&options.lab)?;
    let name = lab.name.clone();
    let plan = lab.into_plan(&options.tunables)?;

    report::print_params(&name, &options, &plan.tunables);
    report::print_plan(&plan);

    let outcome = match options.backend {
        Backend::Netns => {
            let substrate = NetnsSubstrate::new(options.namespace_prefix.as_str());
            execute(RunController::new(substrate, plan), options.interactive).await
        }
        Backend::Simulated => {
            let substrate = SimulatedNetwork::new(SimConfig {
                rng_seed: options.network_rng_seed,
                ..SimConfig::default()
            });
            execute(RunController::new(substrate, plan), options.interactive).await
        }
    };

    report::print_outcome(&outcome);
    if let Some(path) = &options.command_log {
        report::save_command_log(&outcome, path)?;
    }

    Ok(outcome.exit_code() as u8)
}

async fn execute<S: Substrate>(controller: RunController<S>, interactive: bool) -> RunOutcome {
    if interactive {
        let input = BufReader::new(tokio::io::stdin());
        controller
            .run_with_inspection(input, tokio::io::stdout(), ctrl_c())
            .await
    } else {
        controller.run(ctrl_c()).await
    }
}

/// Resolves on Ctrl-C, or never if the signal handler cannot be installed
async fn ctrl_c() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!("unable to listen for Ctrl-C: {e}");
        std::future::pending::<()>().await;
    }
}
