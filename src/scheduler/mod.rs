//! Channel scheduler and transport pump.
//!
//! Runs the operation cycle that couples the code queues to the SPI link:
//! drain incoming firmware requests, feed idle channels from their queues,
//! stage the standing state polls, then wait for the data-ready edge or the
//! poll interval. File execution lives in per-channel [`files::FileRunner`]
//! tasks that submit through the same queues, so the pump itself never
//! blocks on file I/O or expression evaluation.

mod files;
mod queues;

pub use files::FileCommand;
pub use queues::{CodeHandle, CodeId, CodeState, HostAction, Queues, RouteOutcome};

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};

use crate::codes::{Channel, Code};
use crate::error::{Error, Result};
use crate::interpreter::{EvalContext, ExpressionEvaluator};
use crate::ipc::{InterceptAction, InterceptPhase, Interceptors};
use crate::model::{Message, MessageSeverity, ModelStore, PathSegment};
use crate::protocol::{Connection, FirmwareRequest, ProtocolState, ReplyFlags};
use crate::settings::Settings;

use files::FileRunner;

/// Resolves firmware-requested macro filenames to local paths.
pub trait MacroPathResolver: Send + Sync {
    fn resolve(&self, filename: &str) -> Option<PathBuf>;
}

/// Looks in the macros directory first, then the gcodes directory.
pub struct DirectoryResolver {
    macros_dir: PathBuf,
    gcodes_dir: PathBuf,
}

impl DirectoryResolver {
    pub fn new(settings: &Settings) -> Self {
        Self {
            macros_dir: settings.macros_dir.clone(),
            gcodes_dir: settings.gcodes_dir.clone(),
        }
    }
}

impl MacroPathResolver for DirectoryResolver {
    fn resolve(&self, filename: &str) -> Option<PathBuf> {
        let raw = PathBuf::from(filename);
        if raw.is_absolute() {
            return raw.is_file().then_some(raw);
        }
        for base in [&self.macros_dir, &self.gcodes_dir] {
            let candidate = base.join(filename);
            if candidate.is_file() {
                return Some(candidate);
            }
        }
        None
    }
}

/// Expression evaluator backed by the firmware, with the loop counter
/// substituted host-side.
pub struct FirmwareEvaluator {
    queues: Arc<Queues>,
}

impl FirmwareEvaluator {
    pub fn new(queues: Arc<Queues>) -> Self {
        Self { queues }
    }
}

#[async_trait]
impl ExpressionEvaluator for FirmwareEvaluator {
    async fn evaluate(
        &self,
        context: EvalContext<'_>,
        expression: &str,
        _expect_bool: bool,
    ) -> Result<String> {
        let expression = match context.iterations {
            Some(iterations) => substitute_iterations(expression, iterations),
            None => expression.to_string(),
        };
        let (tx, rx) = oneshot::channel();
        self.queues.push_action(HostAction::Evaluate {
            channel: context.code.channel,
            expression,
            tx,
        });
        rx.await.map_err(|_| Error::Shutdown)?
    }
}

/// Replace the `iterations` pseudo-variable with the current loop count.
fn substitute_iterations(expression: &str, iterations: u64) -> String {
    let needle = "iterations";
    let mut out = String::with_capacity(expression.len());
    let mut rest = expression;
    while let Some(index) = rest.find(needle) {
        let before_ok = index == 0
            || !rest[..index]
                .chars()
                .next_back()
                .is_some_and(|c| c.is_alphanumeric() || c == '_' || c == '.');
        let after = &rest[index + needle.len()..];
        let after_ok = !after
            .chars()
            .next()
            .is_some_and(|c| c.is_alphanumeric() || c == '_');
        out.push_str(&rest[..index]);
        if before_ok && after_ok {
            out.push_str(&iterations.to_string());
        } else {
            out.push_str(needle);
        }
        rest = after;
    }
    out.push_str(rest);
    out
}

struct PendingMacro {
    filename: String,
    report_missing: bool,
}

/// Macros waiting for their machine-lock grant, per channel.
#[derive(Default)]
struct PendingMacros {
    queue: VecDeque<PendingMacro>,
    lock_requested: bool,
}

pub struct Scheduler {
    queues: Arc<Queues>,
    model: ModelStore,
    resolver: Arc<dyn MacroPathResolver>,
    evaluator: Arc<dyn ExpressionEvaluator>,
    interceptors: Arc<Interceptors>,
    max_macro_depth: usize,
    pending: Mutex<[PendingMacros; Channel::COUNT]>,
    runners: Mutex<[Option<mpsc::UnboundedSender<FileCommand>>; Channel::COUNT]>,
}

impl Scheduler {
    pub fn new(
        model: ModelStore,
        resolver: Arc<dyn MacroPathResolver>,
        interceptors: Arc<Interceptors>,
        max_macro_depth: usize,
    ) -> Arc<Self> {
        let queues = Arc::new(Queues::new());
        let evaluator: Arc<dyn ExpressionEvaluator> =
            Arc::new(FirmwareEvaluator::new(queues.clone()));
        Arc::new(Self {
            queues,
            model,
            resolver,
            evaluator,
            interceptors,
            max_macro_depth,
            pending: Mutex::new(Default::default()),
            runners: Mutex::new(Default::default()),
        })
    }

    pub fn queues(&self) -> Arc<Queues> {
        self.queues.clone()
    }

    /// Queue an externally submitted code.
    pub fn submit(&self, code: Code) -> CodeHandle {
        self.queues.submit(code)
    }

    /// Wait until every code on `channel` has completed.
    pub async fn flush(&self, channel: Channel) {
        self.queues.flush(channel).await;
    }

    /// Forward an expression to the firmware and await its result.
    pub async fn evaluate(&self, channel: Channel, expression: &str) -> Result<String> {
        let (tx, rx) = oneshot::channel();
        self.queues.push_action(HostAction::Evaluate {
            channel,
            expression: expression.to_string(),
            tx,
        });
        rx.await.map_err(|_| Error::Shutdown)?
    }

    /// The channel's file runner, spawned on first use.
    fn runner(&self, channel: Channel) -> mpsc::UnboundedSender<FileCommand> {
        let mut runners = self.runners.lock().unwrap_or_else(|p| p.into_inner());
        runners[channel.index()]
            .get_or_insert_with(|| {
                FileRunner::spawn(
                    channel,
                    self.queues.clone(),
                    self.model.clone(),
                    self.resolver.clone(),
                    self.evaluator.clone(),
                    self.max_macro_depth,
                )
            })
            .clone()
    }

    fn send_file_command(&self, channel: Channel, command: FileCommand) {
        if self.runner(channel).send(command).is_err() {
            error!(%channel, "file runner is gone");
        }
    }

    // ------------------------------------------------------------------
    // Firmware request dispatch
    // ------------------------------------------------------------------

    pub async fn handle_request(&self, request: FirmwareRequest) {
        match request {
            FirmwareRequest::ReportState { busy_channels } => {
                self.queues.set_busy_mask(busy_channels);
            }
            FirmwareRequest::ObjectModel { module, json } => {
                match serde_json::from_slice(&json) {
                    Ok(value) => {
                        let mut access = self.model.access_read_write().await;
                        access.merge_module(module, value);
                    }
                    Err(e) => warn!(module, "discarding unparsable object model push: {e}"),
                }
            }
            FirmwareRequest::CodeReply { flags, text } => {
                let outcome = self.queues.route_reply(flags, &text);
                for code in &outcome.completed {
                    self.interceptors.notify_executed(code);
                }
                if !outcome.routed && !text.trim().is_empty() {
                    let severity = if flags.contains(ReplyFlags::ERROR) {
                        MessageSeverity::Error
                    } else if flags.contains(ReplyFlags::WARNING) {
                        MessageSeverity::Warning
                    } else {
                        MessageSeverity::Info
                    };
                    let mut access = self.model.access_read_write().await;
                    access.add_message(Message::new(severity, text.trim_end()));
                }
            }
            FirmwareRequest::ExecuteMacro {
                channel,
                report_missing,
                filename,
            } => {
                // Pushing a macro needs the machine lock first.
                let mut pending = self.pending.lock().unwrap_or_else(|p| p.into_inner());
                let entry = &mut pending[channel.index()];
                entry.queue.push_back(PendingMacro {
                    filename,
                    report_missing,
                });
                if !entry.lock_requested {
                    entry.lock_requested = true;
                    self.queues.push_action(HostAction::LockMovement { channel });
                }
            }
            FirmwareRequest::Locked { channel } => {
                let next = {
                    let mut pending = self.pending.lock().unwrap_or_else(|p| p.into_inner());
                    let entry = &mut pending[channel.index()];
                    let next = entry.queue.pop_front();
                    entry.lock_requested = !entry.queue.is_empty();
                    if entry.lock_requested {
                        self.queues.push_action(HostAction::LockMovement { channel });
                    }
                    next
                };
                match next {
                    Some(pending) => self.send_file_command(
                        channel,
                        FileCommand::Push {
                            filename: pending.filename,
                            report_missing: pending.report_missing,
                        },
                    ),
                    None => debug!(%channel, "lock grant with no pending macro"),
                }
            }
            FirmwareRequest::AbortFile { channel, abort_all } => {
                self.send_file_command(
                    channel,
                    FileCommand::Abort {
                        all: abort_all,
                        notify_firmware: false,
                    },
                );
                self.queues.drain_channel(channel, "File has been aborted");
                if channel == Channel::File {
                    let mut access = self.model.access_read_write().await;
                    access.set(
                        vec![PathSegment::key("state"), PathSegment::key("status")],
                        json!("cancelling"),
                    );
                }
            }
            FirmwareRequest::StackEvent {
                channel,
                depth,
                flags,
                feedrate,
            } => {
                let mut access = self.model.access_read_write().await;
                access.set(
                    vec![PathSegment::item("inputs", channel.index(), Channel::COUNT)],
                    json!({
                        "name": channel.to_string(),
                        "stackDepth": depth,
                        "flags": flags,
                        "feedRate": feedrate,
                    }),
                );
            }
            FirmwareRequest::PrintPaused {
                file_position,
                reason,
            } => {
                info!(file_position, ?reason, "print paused by firmware");
                {
                    let mut access = self.model.access_read_write().await;
                    access.set(
                        vec![PathSegment::key("state"), PathSegment::key("status")],
                        json!("paused"),
                    );
                    access.set(
                        vec![PathSegment::key("job"), PathSegment::key("filePosition")],
                        json!(file_position),
                    );
                }
                self.send_file_command(Channel::File, FileCommand::SetPosition(file_position));
                self.queues.drain_channel(
                    Channel::File,
                    &format!("Printing paused at byte {file_position}"),
                );
            }
            FirmwareRequest::HeightMap {
                x_points,
                y_points,
                z_values,
            } => {
                let mut access = self.model.access_read_write().await;
                access.set(
                    vec![PathSegment::key("move"), PathSegment::key("compensation")],
                    json!({
                        "probeGrid": { "xPoints": x_points, "yPoints": y_points },
                        "heights": z_values,
                    }),
                );
            }
            FirmwareRequest::FileChunk { filename, .. } => {
                // Segmented file streaming belongs to the firmware updater,
                // which is not part of this daemon.
                debug!(%filename, "ignoring file chunk request");
            }
            FirmwareRequest::EvaluationResult { success, result } => {
                let result = if success {
                    Ok(result)
                } else {
                    Err(Error::Evaluation(result))
                };
                self.queues.resolve_evaluation(result);
            }
            FirmwareRequest::VariableResult { success, result } => {
                if success {
                    debug!("variable updated: {result}");
                } else {
                    error!("variable update failed: {result}");
                    let mut access = self.model.access_read_write().await;
                    access.add_message(Message::new(MessageSeverity::Error, result));
                }
            }
            FirmwareRequest::ResendPacket { .. } => {
                // Already satisfied by the protocol layer.
            }
        }
    }

    // ------------------------------------------------------------------
    // Tick
    // ------------------------------------------------------------------

    /// One scheduling pass over all channels.
    pub async fn tick(&self, conn: &mut Connection) {
        self.drain_outbox(conn);
        for channel in Channel::ALL {
            if let Some((id, code, priority)) = self.queues.next_to_send(channel) {
                self.dispatch_code(channel, id, code, priority, conn).await;
            }
        }
        conn.stage_standing_requests();
    }

    fn drain_outbox(&self, conn: &mut Connection) {
        while let Some(action) = self.queues.pop_action() {
            let result = match &action {
                HostAction::SetVariable {
                    channel,
                    create_new,
                    name,
                    expression,
                } => conn.send_set_variable(*channel, *create_new, name, expression),
                HostAction::DeleteLocal { channel, name } => {
                    conn.send_set_variable(*channel, false, name, "")
                }
                HostAction::Evaluate {
                    channel, expression, ..
                } => conn.send_evaluate_expression(*channel, expression),
                HostAction::MacroCompleted { channel, error } => {
                    conn.send_macro_completed(*channel, *error)
                }
                HostAction::LockMovement { channel } => conn.send_lock_movement(*channel),
            };
            match result {
                Ok(_) => {
                    if let HostAction::Evaluate { tx, .. } = action {
                        self.queues.push_pending_evaluation(tx);
                    }
                }
                Err(Error::BufferFull) => {
                    self.queues.push_action_front(action);
                    return;
                }
                Err(e) => warn!("dropping host request: {e}"),
            }
        }
    }

    /// Offer the code to the interceptors (once), then put it on the wire.
    async fn dispatch_code(
        &self,
        channel: Channel,
        id: CodeId,
        code: Code,
        priority: bool,
        conn: &mut Connection,
    ) {
        if !priority && self.queues.mark_intercepted(channel, id) {
            for phase in [InterceptPhase::Pre, InterceptPhase::Post] {
                match self.interceptors.intercept(phase, &code).await {
                    InterceptAction::Ignore => {}
                    InterceptAction::Cancel => {
                        debug!(%channel, id, "code cancelled by interceptor");
                        self.queues.fail_head(channel, id, Error::Aborted);
                        return;
                    }
                    InterceptAction::Resolve { content } => {
                        self.queues.finish_head(channel, id, &content);
                        return;
                    }
                }
            }
        }
        self.send_code(channel, id, &code.to_string(), priority, conn);
    }

    fn send_code(
        &self,
        channel: Channel,
        id: CodeId,
        text: &str,
        priority: bool,
        conn: &mut Connection,
    ) {
        let written = if priority {
            let result = if text.starts_with("M112") {
                conn.send_emergency_stop()
            } else {
                conn.send_reset()
            };
            // Priority codes have no reply path; complete on staging.
            result.map(|_| self.queues.finish_head(channel, id, "ok"))
        } else {
            conn.send_code(channel, text)
                .map(|_| self.queues.mark_sent(channel, id))
        };
        match written {
            Ok(()) => debug!(%channel, id, "code sent: {text}"),
            Err(Error::BufferFull) => {}
            Err(e) => {
                warn!(%channel, "cannot send code: {e}");
                self.queues.fail_head(channel, id, e);
            }
        }
    }

    // ------------------------------------------------------------------
    // Transport pump (T1)
    // ------------------------------------------------------------------

    /// Drive the SPI link until shutdown. Fatal transport errors re-run the
    /// handshake; only the shutdown signal ends the loop.
    pub async fn run(
        self: Arc<Self>,
        mut conn: Connection,
        settings: Settings,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let poll = settings.spi_poll_delay();
        loop {
            if *shutdown.borrow() {
                return;
            }
            if conn.state() != ProtocolState::Ready {
                match conn.handshake(poll, 200).await {
                    Ok(()) => {
                        let mut access = self.model.access_read_write().await;
                        access.set(
                            vec![PathSegment::key("state"), PathSegment::key("status")],
                            json!("idle"),
                        );
                    }
                    Err(e) => {
                        error!("handshake failed: {e}");
                        tokio::select! {
                            _ = shutdown.changed() => return,
                            _ = tokio::time::sleep(poll * 10) => continue,
                        }
                    }
                }
            }

            match conn.exchange().await {
                Ok(requests) => {
                    for request in requests {
                        self.handle_request(request).await;
                    }
                }
                Err(e) if e.is_transient() => debug!("transfer hiccup: {e}"),
                Err(e) => {
                    error!("firmware link failed: {e}");
                    let mut access = self.model.access_read_write().await;
                    access.set(
                        vec![PathSegment::key("state"), PathSegment::key("status")],
                        json!("off"),
                    );
                    drop(access);
                    continue;
                }
            }

            self.tick(&mut conn).await;

            if conn.has_staged_data() || self.queues.has_pending_codes() {
                continue;
            }
            tokio::select! {
                _ = shutdown.changed() => return,
                result = conn.wait_for_activity(poll) => {
                    if let Err(e) = result {
                        warn!("data-ready wait failed: {e}");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn iterations_substitution_respects_word_boundaries() {
        assert_eq!(substitute_iterations("iterations < 3", 2), "2 < 3");
        assert_eq!(
            substitute_iterations("var.iterations + iterations", 7),
            "var.iterations + 7"
        );
        assert_eq!(substitute_iterations("myiterations", 1), "myiterations");
        assert_eq!(
            substitute_iterations("iterations*iterations", 3),
            "3*3"
        );
    }
}
