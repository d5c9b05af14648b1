//! Periodic host updater (T3).
//!
//! Reconciles host facts (network interfaces, mounted volumes, hostname,
//! clock) into the object model, prunes old messages, and turns detected
//! drift into trigger-channel codes for the firmware.

mod network;
mod volumes;

pub use network::{Interface, InterfaceKind};
pub use volumes::Volume;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::codes::{parse_line, Channel, CodeFlags};
use crate::context::Context;
use crate::model::PathSegment;

/// Clock drift between host and model that triggers an `M905` resync.
const TIME_DRIFT_SECS: i64 = 5;

pub struct Updater {
    context: Context,
}

impl Updater {
    pub fn new(context: Context) -> Self {
        Self { context }
    }

    /// Run the reconciliation loop until shutdown.
    pub async fn run(self) {
        let interval = self.context.settings.host_update_interval();
        let mut shutdown = self.context.shutdown.clone();
        info!("host updater running every {interval:?}");
        loop {
            tokio::select! {
                _ = shutdown.changed() => return,
                _ = tokio::time::sleep(interval) => {}
            }
            self.update_once().await;
        }
    }

    async fn update_once(&self) {
        let interfaces = tokio::task::spawn_blocking(network::enumerate)
            .await
            .unwrap_or_default();
        let volumes = tokio::task::spawn_blocking(volumes::enumerate)
            .await
            .unwrap_or_default();

        let snapshot = self.context.model.get().await;
        let interfaces: Vec<Value> = interfaces
            .iter()
            .filter_map(|interface| serde_json::to_value(interface).ok())
            .collect();
        let volumes: Vec<Value> = volumes
            .iter()
            .filter_map(|volume| serde_json::to_value(volume).ok())
            .collect();

        {
            let mut access = self.context.model.access_read_write().await;
            reconcile_list(
                &mut access,
                &snapshot["network"]["interfaces"],
                vec![PathSegment::key("network")],
                "interfaces",
                interfaces,
            );
            reconcile_list(&mut access, &snapshot["volumes"], vec![], "volumes", volumes);
        }

        self.prune_messages(&snapshot).await;
        self.check_hostname(&snapshot).await;
        self.check_time(&snapshot).await;
    }

    async fn prune_messages(&self, snapshot: &Value) {
        let Some(messages) = snapshot["messages"].as_array() else {
            return;
        };
        let max_age =
            ChronoDuration::from_std(self.context.settings.max_message_age()).unwrap_or_default();
        let now = Utc::now();
        let retained: Vec<Value> = messages
            .iter()
            .filter(|message| match message_time(message) {
                // Older than the limit means now - time exceeds it.
                Some(time) => now.signed_duration_since(time) <= max_age,
                None => false,
            })
            .cloned()
            .collect();
        if retained.len() == messages.len() {
            return;
        }
        debug!(
            dropped = messages.len() - retained.len(),
            "pruning stale messages"
        );
        let mut access = self.context.model.access_read_write().await;
        access.append(vec![PathSegment::key("messages")], Value::Null);
        if !retained.is_empty() {
            access.append(vec![PathSegment::key("messages")], Value::Array(retained));
        }
    }

    async fn check_hostname(&self, snapshot: &Value) {
        let Ok(hostname) = nix::unistd::gethostname() else {
            return;
        };
        let hostname = hostname.to_string_lossy().into_owned();
        if hostname.is_empty() {
            return;
        }
        let known = snapshot["network"]["hostname"].as_str();
        if known == Some(hostname.as_str()) {
            return;
        }
        info!(%hostname, "hostname drift detected");
        self.submit_trigger_code(&format!("M550 P\"{hostname}\""));
        let mut access = self.context.model.access_read_write().await;
        access.set(
            vec![PathSegment::key("network"), PathSegment::key("hostname")],
            json!(hostname),
        );
    }

    async fn check_time(&self, snapshot: &Value) {
        let now = Utc::now();
        let known = snapshot["state"]["time"]
            .as_str()
            .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
            .map(|time| time.with_timezone(&Utc));
        let drifted = match known {
            Some(time) => (now.signed_duration_since(time)).num_seconds().abs() > TIME_DRIFT_SECS,
            None => true,
        };
        if !drifted {
            return;
        }
        self.submit_trigger_code(&format!(
            "M905 P\"{}\" S\"{}\"",
            now.format("%Y-%m-%d"),
            now.format("%H:%M:%S")
        ));
        let mut access = self.context.model.access_read_write().await;
        access.set(
            vec![PathSegment::key("state"), PathSegment::key("time")],
            json!(now.to_rfc3339()),
        );
    }

    /// Fire-and-forget a synthesized code on the trigger channel.
    fn submit_trigger_code(&self, text: &str) {
        match parse_line(text) {
            Ok(mut code) => {
                code.channel = Channel::Trigger;
                code.flags |= CodeFlags::ASYNCHRONOUS;
                debug!("submitting host code: {text}");
                let _handle = self.context.scheduler.submit(code);
            }
            Err(e) => warn!("bad synthesized code '{text}': {e}"),
        }
    }
}

fn message_time(message: &Value) -> Option<DateTime<Utc>> {
    message["time"]
        .as_str()
        .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
        .map(|time| time.with_timezone(&Utc))
}

/// Position-wise reconciliation: replace the whole collection when the
/// length changed, otherwise patch only the indices that differ.
fn reconcile_list(
    access: &mut crate::model::WriteAccess<'_>,
    old: &Value,
    base: Vec<PathSegment>,
    key: &str,
    new: Vec<Value>,
) {
    let old_list = old.as_array().map(Vec::as_slice).unwrap_or_default();
    if old_list.len() != new.len() {
        let mut path = base;
        path.push(PathSegment::key(key));
        access.set_collection(path, Value::Array(new));
        return;
    }
    let size = new.len();
    for (index, value) in new.into_iter().enumerate() {
        if old_list.get(index) == Some(&value) {
            continue;
        }
        let mut path = base.clone();
        path.push(PathSegment::item(key, index, size));
        access.set(path, value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_time_parses_rfc3339() {
        let message = json!({ "time": "2026-08-01T10:00:00+00:00", "content": "x" });
        assert!(message_time(&message).is_some());
        assert!(message_time(&json!({ "content": "x" })).is_none());
    }
}
