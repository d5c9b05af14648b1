//! CodeStream-mode processor: a newline-delimited stream of code lines,
//! executed in order on one channel, replies streamed back line per code.

use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tracing::debug;

use crate::codes::{parse_line, Channel};
use crate::error::Result;
use crate::scheduler::Scheduler;

use super::init::ClientInitMessage;

pub async fn process(
    stream: UnixStream,
    init: &ClientInitMessage,
    scheduler: Arc<Scheduler>,
) -> Result<()> {
    let channel = init.channel.unwrap_or(Channel::Sbc);
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    while let Some(line) = lines.next_line().await? {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let reply = match parse_line(trimmed) {
            Ok(mut code) => {
                code.channel = channel;
                match scheduler.submit(code).await_reply().await {
                    Ok(message) => message.content,
                    Err(e) => format!("Error: {e}"),
                }
            }
            Err(message) => format!("Error: {message}"),
        };
        writer.write_all(reply.as_bytes()).await?;
        writer.write_all(b"\n").await?;
        writer.flush().await?;
    }
    debug!(%channel, "code stream closed");
    Ok(())
}
