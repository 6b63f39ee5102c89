//! CLI argument definitions for extbridge.
//!
//! All `clap` structures live here so that `main.rs` stays focused on
//! dispatching subcommands.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// extbridge -- container runtime extension bridge.
#[derive(Parser)]
#[command(
    name = "extbridge",
    version,
    about = "extbridge -- plugin bridge and sandbox controller for container runtimes",
    long_about = "Serves NRI-style lifecycle plugins over a Unix socket and drives \
                  external sandboxers through their controller API."
)]
pub struct Cli {
    /// Settings file.  Defaults to config/default.toml when present.
    #[arg(long, short, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the plugin bridge and accept external plugins until Ctrl-C.
    Serve {
        /// Plugin socket path; overrides `nri.socket_path`.
        #[arg(long)]
        socket: Option<PathBuf>,
    },

    /// Issue one call to a sandboxer and print the response.
    Sandbox {
        /// Sandboxer name sent with every request.
        #[arg(long)]
        sandboxer: String,

        /// Sandboxer address: unix:///path, /path, tcp://host:port or host:port.
        #[arg(long)]
        address: String,

        #[command(subcommand)]
        action: SandboxAction,
    },

    /// Print the effective plugin bridge settings.
    Plugins,
}

/// Sandbox controller calls.
#[derive(Subcommand)]
pub enum SandboxAction {
    /// Create a sandbox.
    Create {
        id: String,
        /// Network namespace path handed to the sandboxer.
        #[arg(long, default_value = "")]
        netns: String,
    },
    /// Start a created sandbox.
    Start { id: String },
    /// Show the sandbox's platform.
    Platform { id: String },
    /// Show the sandbox's status.
    Status {
        id: String,
        #[arg(long, short)]
        verbose: bool,
    },
    /// Stop a sandbox.
    Stop {
        id: String,
        /// Grace period before the sandboxer kills the sandbox.
        #[arg(long, default_value_t = 0)]
        timeout_secs: u32,
    },
    /// Observe the sandbox's next transition (ready, pending or exited).
    Wait { id: String },
    /// Release every resource of a stopped sandbox.
    Shutdown { id: String },
    /// Show the sandbox's metrics.
    Metrics { id: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_sandbox_stop() {
        let cli = Cli::try_parse_from([
            "extbridge",
            "sandbox",
            "--sandboxer",
            "kuasar",
            "--address",
            "unix:///run/kuasar.sock",
            "stop",
            "sb1",
            "--timeout-secs",
            "5",
        ])
        .unwrap();

        match cli.command {
            Commands::Sandbox {
                sandboxer,
                action: SandboxAction::Stop { id, timeout_secs },
                ..
            } => {
                assert_eq!(sandboxer, "kuasar");
                assert_eq!(id, "sb1");
                assert_eq!(timeout_secs, 5);
            }
            _ => panic!("wrong command"),
        }
    }

    #[test]
    fn config_flag_is_global() {
        let cli = Cli::try_parse_from(["extbridge", "serve", "--config", "alt.toml"]).unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("alt.toml")));
        assert!(matches!(cli.command, Commands::Serve { socket: None }));
    }

    #[test]
    fn sandbox_requires_address() {
        assert!(Cli::try_parse_from(["extbridge", "sandbox", "--sandboxer", "x", "wait", "sb1"]).is_err());
    }
}
