//! CLI entry point for extbridge.
//!
//! `serve` runs the plugin bridge as a service; `sandbox` issues a single
//! sandbox controller call; `plugins` prints the bridge settings.

mod cli;
mod helpers;
mod policy;
mod settings;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use extbridge_kernel::EventBus;
use extbridge_nri::PluginBridge;
use extbridge_sandbox::types::{
    CreateRequest, MetricsRequest, PlatformRequest, ShutdownRequest, StartRequest, StatusRequest,
    StopRequest, WaitRequest,
};
use extbridge_sandbox::{SandboxController, WaitCallbacks};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

use crate::cli::{Cli, Commands, SandboxAction};
use crate::helpers::{init_tracing, log_event, print_json};
use crate::policy::{ExternalIntake, PolicyHandler};
use crate::settings::Settings;

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    // A missing .env file is fine.
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();
    let settings = Settings::load(cli.config.as_deref())?;
    init_tracing(&settings.log);

    match cli.command {
        Commands::Serve { socket } => cmd_serve(settings, socket).await,
        Commands::Sandbox {
            sandboxer,
            address,
            action,
        } => cmd_sandbox(&settings, sandboxer, address, action).await,
        Commands::Plugins => cmd_plugins(&settings),
    }
}

// ---------------------------------------------------------------------------
// Subcommand: serve
// ---------------------------------------------------------------------------

async fn cmd_serve(settings: Settings, socket: Option<PathBuf>) -> Result<()> {
    let bus = EventBus::default();
    let mut events = bus.subscribe();

    let policy = Arc::new(PolicyHandler::new(settings.nri.allowed_plugins.clone()));
    let bridge = PluginBridge::with_events(policy, settings.nri.bridge_config(), bus);

    let socket = socket.unwrap_or_else(|| settings.nri.socket_path.clone());
    let intake = ExternalIntake::new(bridge.clone(), settings.nri.registration_timeout());
    bridge
        .start_external(&socket, intake)
        .await
        .with_context(|| format!("failed to listen on {}", socket.display()))?;
    info!(socket = %socket.display(), "plugin bridge listening");

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            signal = &mut shutdown => {
                signal.context("failed to wait for Ctrl-C")?;
                info!("shutdown requested");
                break;
            }
            event = events.recv() => match event {
                Ok(event) => log_event(&event),
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "event log fell behind"),
                Err(RecvError::Closed) => break,
            },
        }
    }

    bridge.shutdown_external().await;
    let plugins = bridge.destroy().await;
    info!(plugins, "plugin bridge stopped");
    Ok(())
}

// ---------------------------------------------------------------------------
// Subcommand: sandbox
// ---------------------------------------------------------------------------

async fn cmd_sandbox(
    settings: &Settings,
    sandboxer: String,
    address: String,
    action: SandboxAction,
) -> Result<()> {
    let controller = SandboxController::builder(sandboxer, address)
        .config(settings.sandbox.controller_config())
        .build();

    match action {
        SandboxAction::Create { id, netns } => {
            let resp = controller
                .create(CreateRequest {
                    sandbox_id: id,
                    netns_path: netns,
                    ..Default::default()
                })
                .await
                .context("create failed")?;
            print_json(&resp)
        }
        SandboxAction::Start { id } => {
            let resp = controller
                .start(StartRequest {
                    sandbox_id: id,
                    ..Default::default()
                })
                .await
                .context("start failed")?;
            print_json(&resp)
        }
        SandboxAction::Platform { id } => {
            let resp = controller
                .platform(PlatformRequest {
                    sandbox_id: id,
                    ..Default::default()
                })
                .await
                .context("platform failed")?;
            print_json(&resp)
        }
        SandboxAction::Status { id, verbose } => {
            let resp = controller
                .status(StatusRequest {
                    sandbox_id: id,
                    verbose,
                    ..Default::default()
                })
                .await
                .context("status failed")?;
            print_json(&resp)
        }
        SandboxAction::Stop { id, timeout_secs } => {
            let resp = controller
                .stop(StopRequest {
                    sandbox_id: id,
                    timeout_secs,
                    ..Default::default()
                })
                .await
                .context("stop failed")?;
            print_json(&resp)
        }
        SandboxAction::Wait { id } => {
            let request = WaitRequest {
                sandbox_id: id,
                ..Default::default()
            };
            let outcome = controller.wait(request, WaitCallbacks::noop(), ()).await;
            print_json(&outcome)
        }
        SandboxAction::Shutdown { id } => {
            let resp = controller
                .shutdown(ShutdownRequest {
                    sandbox_id: id,
                    ..Default::default()
                })
                .await
                .context("shutdown failed")?;
            print_json(&resp)
        }
        SandboxAction::Metrics { id } => {
            let resp = controller
                .metrics(MetricsRequest {
                    sandbox_id: id,
                    ..Default::default()
                })
                .await
                .context("metrics failed")?;
            print_json(&resp)
        }
    }
}

// ---------------------------------------------------------------------------
// Subcommand: plugins
// ---------------------------------------------------------------------------

fn cmd_plugins(settings: &Settings) -> Result<()> {
    let rendered = toml::to_string_pretty(&settings.nri).context("failed to render settings")?;
    println!("[nri]");
    print!("{rendered}");
    Ok(())
}
