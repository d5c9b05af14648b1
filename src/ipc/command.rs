//! Command-mode processor (and the PluginService stub).

use std::sync::Arc;

use serde::Deserialize;
use serde_json::{json, Value};
use tokio::io::BufReader;
use tokio::net::UnixStream;
use tracing::debug;

use crate::codes::{parse_line, Channel};
use crate::error::Result;
use crate::model::{Message, MessageSeverity, ModelStore};
use crate::scheduler::Scheduler;

use super::init::Reply;
use super::wire;

#[derive(Debug, Deserialize)]
#[serde(tag = "Command")]
enum Command {
    /// Parse and execute one code line, returning its reply text.
    SimpleCode {
        #[serde(rename = "Code")]
        code: String,
        #[serde(rename = "Channel", default)]
        channel: Option<Channel>,
    },
    /// Serialize the current object model.
    GetObjectModel,
    /// Wait until a channel has no codes in flight.
    Flush {
        #[serde(rename = "Channel", default)]
        channel: Option<Channel>,
    },
    /// Forward an expression to the firmware and return the result.
    EvaluateExpression {
        #[serde(rename = "Expression")]
        expression: String,
        #[serde(rename = "Channel", default)]
        channel: Option<Channel>,
    },
    /// Append a message to the machine log.
    WriteMessage {
        #[serde(rename = "Content")]
        content: String,
        #[serde(rename = "Type", default)]
        severity: Option<MessageSeverity>,
    },
}

pub async fn process(
    stream: UnixStream,
    scheduler: Arc<Scheduler>,
    model: ModelStore,
) -> Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);

    while let Some(raw) = wire::read_envelope::<_, Value>(&mut reader).await? {
        let reply = match serde_json::from_value::<Command>(raw.clone()) {
            Ok(command) => execute(command, &scheduler, &model).await,
            Err(_) => {
                let name = raw
                    .get("Command")
                    .and_then(Value::as_str)
                    .unwrap_or("<missing>");
                Reply::error(
                    "InvalidCommand",
                    format!("unsupported or malformed command '{name}'"),
                )
            }
        };
        wire::write_envelope(&mut writer, &reply).await?;
    }
    debug!("command connection closed");
    Ok(())
}

async fn execute(command: Command, scheduler: &Scheduler, model: &ModelStore) -> Reply {
    match command {
        Command::SimpleCode { code, channel } => {
            let mut parsed = match parse_line(&code) {
                Ok(parsed) => parsed,
                Err(message) => return Reply::error("CodeParserException", message),
            };
            parsed.channel = channel.unwrap_or(Channel::Sbc);
            match scheduler.submit(parsed).await_reply().await {
                Ok(message) => Reply::ok(json!(message.content)),
                Err(e) => Reply::error("CodeError", e.to_string()),
            }
        }
        Command::GetObjectModel => Reply::ok(model.get().await),
        Command::Flush { channel } => {
            scheduler.flush(channel.unwrap_or(Channel::Sbc)).await;
            Reply::empty()
        }
        Command::EvaluateExpression {
            expression,
            channel,
        } => match scheduler
            .evaluate(channel.unwrap_or(Channel::Sbc), &expression)
            .await
        {
            Ok(result) => Reply::ok(json!(result)),
            Err(e) => Reply::error("EvaluationFailed", e.to_string()),
        },
        Command::WriteMessage { content, severity } => {
            let mut access = model.access_read_write().await;
            access.add_message(Message::new(
                severity.unwrap_or(MessageSeverity::Info),
                content,
            ));
            Reply::empty()
        }
    }
}

/// PluginService connections are accepted but every command is refused;
/// plugin lifecycle belongs to an external manager.
pub async fn process_plugin_service(stream: UnixStream) -> Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    while let Some(_raw) = wire::read_envelope::<_, Value>(&mut reader).await? {
        wire::write_envelope(
            &mut writer,
            &Reply::error("Unsupported", "plugin services are not managed by this daemon"),
        )
        .await?;
    }
    Ok(())
}
