//! Weaver CLI entry point.
//!
//! Binary name: `weaver`
//!
//! Parses CLI arguments, sets up tracing, opens the configured state store,
//! then dispatches to the command handler.

mod cli;
mod state;

use clap::Parser;

use cli::{Cli, Commands};
use state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Set up tracing based on verbosity
    let filter = match cli.verbose {
        0 if cli.quiet => "error",
        0 => "warn",
        1 => "info,weaver_core=debug,weaver_infra=debug",
        _ => "trace",
    };
    if let Err(e) = weaver_observe::init_tracing_with(cli.log_format, filter, cli.otel) {
        eprintln!("Warning: failed to initialize tracing: {e}");
    }

    let result = dispatch(cli).await;
    weaver_observe::shutdown_tracing();
    result
}

async fn dispatch(cli: Cli) -> anyhow::Result<()> {
    // Validation needs no state store
    if let Commands::Validate { file } = &cli.command {
        return cli::workflow::validate(file, cli.json);
    }

    let state = AppState::init(cli.data_dir.as_deref()).await?;

    match cli.command {
        Commands::Validate { .. } => Ok(()),
        Commands::Run {
            file,
            input,
            stream,
            workflows,
        } => {
            cli::workflow::run(
                &state,
                &file,
                input.as_deref(),
                stream,
                workflows.as_deref(),
                cli.json,
            )
            .await
        }
        Commands::Resume {
            suspension_id,
            data,
            stream,
            workflows,
        } => {
            state.load_workflows(workflows.as_deref())?;
            cli::suspension::resume(&state, &suspension_id, data.as_deref(), stream, cli.json)
                .await
        }
        Commands::Signal {
            suspension_id,
            event,
            payload,
            stream,
            workflows,
        } => {
            state.load_workflows(workflows.as_deref())?;
            cli::suspension::signal(
                &state,
                &suspension_id,
                &event,
                payload.as_deref(),
                stream,
                cli.json,
            )
            .await
        }
        Commands::Suspended => cli::suspension::list(&state, cli.json).await,
        Commands::Abandon { suspension_id } => {
            cli::suspension::abandon(&state, &suspension_id, cli.json).await
        }
        Commands::Runs { workflow, limit } => {
            cli::workflow::runs(&state, &workflow, limit, cli.json).await
        }
        Commands::State { workflow, run_id } => {
            cli::workflow::state(&state, &workflow, &run_id, cli.json).await
        }
    }
}
