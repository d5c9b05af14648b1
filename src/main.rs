//! printhostd — daemon entry point.
//!
//! Wires the shared context, spawns the three long-running tasks (transport
//! pump, IPC acceptor, host updater) and waits for Ctrl-C to unwind them
//! through the process-wide shutdown signal.

use std::sync::Arc;

use anyhow::Context as _;
use clap::Parser;
use tokio::sync::watch;
use tracing::{error, info};

use printhost::context::Context;
use printhost::host::Updater;
use printhost::ipc::{Interceptors, Server};
use printhost::model::ModelStore;
use printhost::protocol::Connection;
use printhost::scheduler::{DirectoryResolver, Scheduler};
use printhost::settings::{Args, Settings};
use printhost::spi::{NullDevice, Transport};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let filter = args
        .log_level
        .clone()
        .map(tracing_subscriber::EnvFilter::new)
        .unwrap_or_else(|| {
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,printhost=debug".into())
        });
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let settings = Arc::new(Settings::load(&args).context("loading settings")?);
    info!("printhostd starting (socket: {})", settings.socket_path.display());

    let model = ModelStore::new();
    let interceptors = Arc::new(Interceptors::new());
    let resolver = Arc::new(DirectoryResolver::new(&settings));
    let scheduler = Scheduler::new(
        model.clone(),
        resolver,
        interceptors.clone(),
        settings.max_macro_depth,
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let context = Context {
        settings: settings.clone(),
        model,
        scheduler: scheduler.clone(),
        interceptors,
        shutdown: shutdown_rx.clone(),
    };

    let mut tasks = Vec::new();
    if settings.update_only {
        info!("update-only mode: skipping SPI and IPC bring-up");
    } else {
        // T1: transport pump. The SPI driver itself is an external
        // collaborator; without one the null device keeps the link idle.
        let transport = Transport::new(
            Box::new(NullDevice),
            settings.buffer_size,
            settings.max_resends,
        );
        let connection = Connection::new(transport);
        let pump_settings = (*settings).clone();
        tasks.push(tokio::spawn(scheduler.clone().run(
            connection,
            pump_settings,
            shutdown_rx.clone(),
        )));

        // T2: IPC acceptor.
        let server = Server::new(context.clone());
        tasks.push(tokio::spawn(async move {
            if let Err(e) = server.run().await {
                error!("IPC server failed: {e}");
            }
        }));
    }

    // T3: periodic host updater.
    tasks.push(tokio::spawn(Updater::new(context.clone()).run()));

    tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
    info!("shutting down");
    shutdown_tx.send(true).ok();
    for task in tasks {
        let _ = task.await;
    }
    Ok(())
}
