//! Subscribe-mode processor: Full and Patch object-model streams.

use serde_json::Value;
use tokio::io::BufReader;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tokio::sync::{broadcast, watch};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::model::{
    filtered_snapshot, Change, Filter, ModelStore, PatchBuilder, PathSegment,
};

use super::init::{ClientInitMessage, Reply, SubscriptionMode, JOB_LAYERS_VERSION};
use super::wire;

pub async fn process(
    stream: UnixStream,
    init: &ClientInitMessage,
    model: ModelStore,
    poll: std::time::Duration,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);

    let mut filters = Vec::with_capacity(init.filter.len());
    for raw in &init.filter {
        match Filter::parse(raw) {
            Ok(filter) => filters.push(filter),
            Err(message) => {
                wire::write_line(
                    &mut writer,
                    &Reply::error("InvalidFilter", format!("'{raw}': {message}")),
                )
                .await?;
                return Ok(());
            }
        }
    }
    let mode = init.subscription_mode.unwrap_or(SubscriptionMode::Full);
    let suppress_layers = init.version < JOB_LAYERS_VERSION;

    // Subscribe to changes before the first snapshot so nothing slips
    // between the two.
    let mut changes = model.subscribe_changes();
    let mut version = model.version();

    send_snapshot(&mut writer, &model, &filters).await?;
    if !await_acknowledge(&mut reader).await? {
        return Ok(());
    }

    let mut builder = PatchBuilder::new();
    let mut pending_full = false;
    loop {
        // Collect whatever arrived while we were waiting or sending.
        let mut resync = false;
        loop {
            match changes.try_recv() {
                Ok(change) => {
                    if relevant(&change, &filters, suppress_layers) {
                        builder.record(&change);
                    }
                }
                Err(broadcast::error::TryRecvError::Empty) => break,
                Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                    debug!(skipped, "subscriber lagged, forcing full resync");
                    resync = true;
                }
                Err(broadcast::error::TryRecvError::Closed) => return Ok(()),
            }
        }

        match mode {
            SubscriptionMode::Patch if resync => {
                // Drop the partial diff; the full document supersedes it.
                builder = PatchBuilder::new();
                send_snapshot(&mut writer, &model, &filters).await?;
                if !await_acknowledge(&mut reader).await? {
                    return Ok(());
                }
            }
            SubscriptionMode::Patch if !builder.is_empty() => {
                wire::write_line(&mut writer, &builder.take()).await?;
                if !await_acknowledge(&mut reader).await? {
                    return Ok(());
                }
            }
            SubscriptionMode::Full if resync || pending_full => {
                pending_full = false;
                builder = PatchBuilder::new();
                send_snapshot(&mut writer, &model, &filters).await?;
                if !await_acknowledge(&mut reader).await? {
                    return Ok(());
                }
            }
            _ => {}
        }

        tokio::select! {
            _ = shutdown.changed() => return Ok(()),
            new_version = tokio::time::timeout(poll, model.wait_for_update(version)) => {
                match new_version {
                    Ok(new_version) => {
                        version = new_version;
                        if mode == SubscriptionMode::Full {
                            pending_full = true;
                        }
                    }
                    // Idle tick: make sure the peer is still there.
                    Err(_) => {
                        if peer_gone(reader.get_ref()) {
                            debug!("subscriber disconnected");
                            return Ok(());
                        }
                    }
                }
            }
        }
    }
}

async fn send_snapshot(
    writer: &mut OwnedWriteHalf,
    model: &ModelStore,
    filters: &[Filter],
) -> Result<()> {
    let tree = model.get().await;
    let document = if filters.is_empty() {
        tree
    } else {
        filtered_snapshot(&tree, filters)
    };
    wire::write_line(writer, &document).await
}

/// Wait for the client's `Acknowledge`; `false` means the peer went away.
async fn await_acknowledge(reader: &mut BufReader<OwnedReadHalf>) -> Result<bool> {
    match wire::read_line::<_, Value>(reader).await {
        Ok(Some(message)) => {
            let command = message.get("Command").and_then(Value::as_str);
            if command != Some("Acknowledge") {
                return Err(Error::Ipc(format!(
                    "expected Acknowledge, got {message}"
                )));
            }
            Ok(true)
        }
        Ok(None) => Ok(false),
        Err(Error::Io(e)) if e.kind() == std::io::ErrorKind::ConnectionReset => Ok(false),
        Err(e) => {
            warn!("subscriber protocol error: {e}");
            Err(e)
        }
    }
}

fn relevant(change: &Change, filters: &[Filter], suppress_layers: bool) -> bool {
    if suppress_layers && is_job_layers(&change.path) {
        return false;
    }
    filters.is_empty() || filters.iter().any(|filter| filter.matches(&change.path))
}

/// The job layers array changed shape in protocol version 11; older
/// clients never see it move.
fn is_job_layers(path: &[PathSegment]) -> bool {
    matches!(path.first(), Some(PathSegment::Key(key)) if key == "job")
        && matches!(
            path.get(1),
            Some(PathSegment::Key(key)) if key == "layers"
        )
        || matches!(
            (path.first(), path.get(1)),
            (
                Some(PathSegment::Key(key)),
                Some(PathSegment::Item { array, .. })
            ) if key == "job" && array == "layers"
        )
}

/// Between sends the client must stay quiet; any readable bytes or EOF on
/// the socket mean it is gone or misbehaving.
fn peer_gone(reader: &OwnedReadHalf) -> bool {
    let mut probe = [0u8; 1];
    match reader.try_read(&mut probe) {
        Ok(0) => true,
        Ok(_) => true,
        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => false,
        Err(_) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ChangeKind;
    use serde_json::json;

    fn change(path: Vec<PathSegment>) -> Change {
        Change {
            kind: ChangeKind::Property,
            path,
            value: json!(1),
        }
    }

    #[test]
    fn layers_suppression_for_old_clients() {
        let layers = change(vec![
            PathSegment::key("job"),
            PathSegment::item("layers", 3, 4),
        ]);
        assert!(!relevant(&layers, &[], true));
        assert!(relevant(&layers, &[], false));

        let other = change(vec![PathSegment::key("job"), PathSegment::key("file")]);
        assert!(relevant(&other, &[], true));
    }

    #[test]
    fn filters_gate_changes() {
        let filters = [Filter::parse("state.status").unwrap()];
        let matching = change(vec![PathSegment::key("state"), PathSegment::key("status")]);
        let other = change(vec![PathSegment::key("network")]);
        assert!(relevant(&matching, &filters, false));
        assert!(!relevant(&other, &filters, false));
    }
}
