//! CLI command definitions for the `weaver` binary.
//!
//! Uses clap derive macros for argument parsing.

pub mod output;
pub mod suspension;
pub mod workflow;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use weaver_observe::LogFormat;

/// Run and resume durable workflows.
#[derive(Parser)]
#[command(name = "weaver", version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Output machine-readable JSON instead of styled text.
    #[arg(long, global = true)]
    pub json: bool,

    /// Suppress all output except errors.
    #[arg(long, short, global = true)]
    pub quiet: bool,

    /// Detailed logs (-v for debug, -vv for trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Data directory (config.toml, state store, workflows/).
    #[arg(long, global = true, env = "WEAVER_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    /// Log line format: pretty or json.
    #[arg(long, global = true, default_value = "pretty", env = "WEAVER_LOG_FORMAT")]
    pub log_format: LogFormat,

    /// Also export spans through OpenTelemetry (stdout exporter).
    #[arg(long, global = true, hide = true)]
    pub otel: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Parse and validate a workflow file without running it.
    Validate {
        /// Path to a .yaml, .yml or .json workflow file.
        file: PathBuf,
    },

    /// Run a workflow file.
    Run {
        /// Path to the workflow file.
        file: PathBuf,

        /// Run input as a JSON object.
        #[arg(long)]
        input: Option<String>,

        /// Print lifecycle events as they happen.
        #[arg(long)]
        stream: bool,

        /// Directory of sub-workflow definitions (default: the file's directory).
        #[arg(long)]
        workflows: Option<PathBuf>,
    },

    /// Resume a suspended run with data.
    Resume {
        /// Suspension UUID.
        suspension_id: String,

        /// Resume data as JSON (default: null).
        #[arg(long)]
        data: Option<String>,

        /// Print lifecycle events as they happen.
        #[arg(long)]
        stream: bool,

        /// Directory of workflow definitions (default: <data-dir>/workflows).
        #[arg(long)]
        workflows: Option<PathBuf>,
    },

    /// Deliver an event to a run waiting for one.
    Signal {
        /// Suspension UUID.
        suspension_id: String,

        /// Event name.
        event: String,

        /// Event payload as JSON (default: null).
        #[arg(long)]
        payload: Option<String>,

        /// Print lifecycle events as they happen.
        #[arg(long)]
        stream: bool,

        /// Directory of workflow definitions (default: <data-dir>/workflows).
        #[arg(long)]
        workflows: Option<PathBuf>,
    },

    /// List active suspensions.
    #[command(alias = "ls")]
    Suspended,

    /// Show recent runs of a workflow.
    Runs {
        /// Workflow id.
        workflow: String,

        /// Maximum number of runs to display.
        #[arg(long, default_value = "10")]
        limit: u32,
    },

    /// Show the persisted state of a run.
    State {
        /// Workflow id.
        workflow: String,

        /// Run UUID.
        run_id: String,
    },

    /// Abandon a suspended run so it can never be resumed.
    Abandon {
        /// Suspension UUID.
        suspension_id: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_definition_is_consistent() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_run_with_global_flags() {
        let cli = Cli::try_parse_from([
            "weaver",
            "--json",
            "-vv",
            "run",
            "flow.yaml",
            "--input",
            r#"{"topic":"rust"}"#,
            "--stream",
        ])
        .unwrap();
        assert!(cli.json);
        assert_eq!(cli.verbose, 2);
        match cli.command {
            Commands::Run {
                file,
                input,
                stream,
                workflows,
            } => {
                assert_eq!(file, PathBuf::from("flow.yaml"));
                assert_eq!(input.as_deref(), Some(r#"{"topic":"rust"}"#));
                assert!(stream);
                assert!(workflows.is_none());
            }
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn test_parse_signal() {
        let cli = Cli::try_parse_from([
            "weaver",
            "signal",
            "0190a3b2-0000-7000-8000-000000000000",
            "approved",
            "--payload",
            "{}",
        ])
        .unwrap();
        match cli.command {
            Commands::Signal { event, payload, .. } => {
                assert_eq!(event, "approved");
                assert_eq!(payload.as_deref(), Some("{}"));
            }
            _ => panic!("expected signal"),
        }
    }
}
