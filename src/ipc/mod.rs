//! IPC server and per-connection processors.
//!
//! Local clients connect over a Unix stream socket. Every connection starts
//! with a line-delimited init exchange (`ServerInitMessage`, then the
//! client's `ClientInitMessage`), a protocol-version gate, and a dispatch on
//! the declared mode. The processor kinds are a plain dispatch, one async
//! function per mode.

mod codestream;
mod command;
mod init;
mod intercept;
mod subscribe;
mod wire;

pub use init::{
    ClientInitMessage, ConnectionMode, InterceptPhase, Reply, ServerInitMessage,
    SubscriptionMode, CURRENT_PROTOCOL_VERSION, MINIMUM_PROTOCOL_VERSION,
};
pub use intercept::{InterceptAction, InterceptJob, Interceptors};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, info, warn};

use crate::context::Context;
use crate::error::{Error, Result};

pub struct Server {
    context: Context,
}

impl Server {
    pub fn new(context: Context) -> Self {
        Self { context }
    }

    /// Accept connections until shutdown, one task per client.
    pub async fn run(self) -> Result<()> {
        let path = &self.context.settings.socket_path;
        if path.exists() {
            std::fs::remove_file(path)?;
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let listener = UnixListener::bind(path)?;
        info!("IPC endpoint listening at {}", path.display());

        let mut shutdown = self.context.shutdown.clone();
        let mut next_id: u64 = 1;
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                accepted = listener.accept() => {
                    let (stream, _addr) = accepted?;
                    let id = next_id;
                    next_id += 1;
                    let context = self.context.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, id, context).await {
                            warn!(id, "connection error: {e}");
                        }
                    });
                }
            }
        }
        let _ = std::fs::remove_file(path);
        Ok(())
    }
}

async fn handle_connection(mut stream: UnixStream, id: u64, context: Context) -> Result<()> {
    let server_init = ServerInitMessage {
        id,
        version: CURRENT_PROTOCOL_VERSION,
    };
    let mut raw = serde_json::to_vec(&server_init)?;
    raw.push(b'\n');
    stream.write_all(&raw).await?;

    let Some(line) = read_init_line(&mut stream).await? else {
        debug!(id, "client left before init");
        return Ok(());
    };
    let init: ClientInitMessage = match serde_json::from_str(&line) {
        Ok(init) => init,
        Err(e) => {
            let reply = Reply::error("InvalidInit", e.to_string());
            write_line_raw(&mut stream, &reply).await?;
            return Ok(());
        }
    };

    if init.version < MINIMUM_PROTOCOL_VERSION || init.version > CURRENT_PROTOCOL_VERSION {
        let reply = Reply::error(
            "IncompatibleVersion",
            format!(
                "client version {} outside supported range {}..={}",
                init.version, MINIMUM_PROTOCOL_VERSION, CURRENT_PROTOCOL_VERSION
            ),
        );
        write_line_raw(&mut stream, &reply).await?;
        return Ok(());
    }

    debug!(id, ?init.mode, version = init.version, "connection established");
    match init.mode {
        ConnectionMode::Subscribe => {
            subscribe::process(
                stream,
                &init,
                context.model.clone(),
                context.settings.socket_poll_interval(),
                context.shutdown.clone(),
            )
            .await
        }
        mode => {
            // The remaining modes confirm the init before switching to
            // length-prefixed framing.
            write_line_raw(&mut stream, &Reply::empty()).await?;
            match mode {
                ConnectionMode::Command => {
                    command::process(stream, context.scheduler.clone(), context.model.clone())
                        .await
                }
                ConnectionMode::Intercept => {
                    intercept::process(stream, &init, &context.interceptors).await
                }
                ConnectionMode::CodeStream => {
                    codestream::process(stream, &init, context.scheduler.clone()).await
                }
                ConnectionMode::PluginService => command::process_plugin_service(stream).await,
                ConnectionMode::Subscribe => unreachable!("handled above"),
            }
        }
    }
}

async fn write_line_raw<T: serde::Serialize>(stream: &mut UnixStream, message: &T) -> Result<()> {
    let mut raw = serde_json::to_vec(message)?;
    raw.push(b'\n');
    stream.write_all(&raw).await?;
    Ok(())
}

/// Read the single init line without buffering past it, so the stream can
/// be handed to the mode processor with nothing lost.
async fn read_init_line(stream: &mut UnixStream) -> Result<Option<String>> {
    let mut line = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        let n = stream.read(&mut byte).await?;
        if n == 0 {
            return Ok(None);
        }
        if byte[0] == b'\n' {
            break;
        }
        line.push(byte[0]);
        if line.len() > 64 * 1024 {
            return Err(Error::Ipc("oversized init message".to_string()));
        }
    }
    Ok(Some(String::from_utf8_lossy(&line).into_owned()))
}
