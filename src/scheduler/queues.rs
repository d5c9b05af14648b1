//! Per-channel code queues and flow control.
//!
//! This is the shared heart of the scheduler: submitters (IPC, files, the
//! host updater) push codes in, the transport pump pulls them out, firmware
//! replies route back to the head of the addressed queue. All state lives
//! behind one mutex held only for O(1) updates; file I/O never happens under
//! it.

use std::collections::VecDeque;
use std::sync::Mutex;

use tokio::sync::{oneshot, Notify};
use tracing::debug;

use crate::codes::{Channel, Code};
use crate::error::{Error, Result};
use crate::model::{Message, MessageSeverity};
use crate::protocol::ReplyFlags;

pub type CodeId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodeState {
    Queued,
    Sent,
    AwaitingReply,
    Finished,
    Failed,
}

/// A code waiting in, or moving through, a channel queue.
struct QueuedCode {
    id: CodeId,
    code: Code,
    state: CodeState,
    /// Originates from a firmware-requested macro; not externally awaited.
    system: bool,
    /// Already offered to the interceptors; a send retry must not offer it
    /// again.
    intercepted: bool,
    reply: String,
    severity: MessageSeverity,
    completion: Option<oneshot::Sender<Result<Message>>>,
}

/// Result of routing one `CodeReply` packet.
#[derive(Default)]
pub struct RouteOutcome {
    pub routed: bool,
    /// Codes completed by this reply's terminator, for executed-phase
    /// interception notifications.
    pub completed: Vec<Code>,
}

/// Completion future handed to external submitters.
pub struct CodeHandle {
    pub id: CodeId,
    rx: oneshot::Receiver<Result<Message>>,
}

impl CodeHandle {
    /// Resolve once the code reaches `Finished` or `Failed`.
    pub async fn await_reply(self) -> Result<Message> {
        self.rx.await.map_err(|_| Error::Aborted)?
    }
}

/// Host requests queued for the next outgoing transfer.
#[derive(Debug)]
pub enum HostAction {
    SetVariable {
        channel: Channel,
        create_new: bool,
        name: String,
        expression: String,
    },
    /// Drop a local variable after its block closed (empty expression on
    /// the wire).
    DeleteLocal { channel: Channel, name: String },
    Evaluate {
        channel: Channel,
        expression: String,
        tx: oneshot::Sender<Result<String>>,
    },
    MacroCompleted { channel: Channel, error: bool },
    LockMovement { channel: Channel },
}

#[derive(Default)]
struct ChannelQueue {
    queue: VecDeque<QueuedCode>,
}

struct QueueState {
    next_id: CodeId,
    channels: [ChannelQueue; Channel::COUNT],
    busy_mask: u16,
    outbox: VecDeque<HostAction>,
    pending_evaluations: VecDeque<oneshot::Sender<Result<String>>>,
}

/// Shared queue core. Cheap to clone via `Arc`; the scheduler, the file
/// interpreters and the firmware evaluator all hold one.
pub struct Queues {
    state: Mutex<QueueState>,
    /// Woken whenever a code reaches a terminal state.
    drained: Notify,
}

impl Queues {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState {
                next_id: 1,
                channels: Default::default(),
                busy_mask: 0,
                outbox: VecDeque::new(),
                pending_evaluations: VecDeque::new(),
            }),
            drained: Notify::new(),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    // ------------------------------------------------------------------
    // Submission
    // ------------------------------------------------------------------

    /// Queue a code and hand back its completion future.
    pub fn submit(&self, code: Code) -> CodeHandle {
        let (tx, rx) = oneshot::channel();
        let id = self.enqueue(code, false, Some(tx));
        CodeHandle { id, rx }
    }

    /// Queue a system code (one read from a firmware-requested macro).
    pub fn submit_system(&self, code: Code) -> CodeHandle {
        let (tx, rx) = oneshot::channel();
        let id = self.enqueue(code, true, Some(tx));
        CodeHandle { id, rx }
    }

    fn enqueue(&self, code: Code, system: bool, completion: Option<oneshot::Sender<Result<Message>>>) -> CodeId {
        let mut state = self.lock();
        let id = state.next_id;
        state.next_id += 1;
        let channel = code.channel;
        state.channels[channel.index()].queue.push_back(QueuedCode {
            id,
            code,
            state: CodeState::Queued,
            system,
            intercepted: false,
            reply: String::new(),
            severity: MessageSeverity::Info,
            completion,
        });
        debug!(%channel, id, system, "code queued");
        id
    }

    // ------------------------------------------------------------------
    // Pump side
    // ------------------------------------------------------------------

    pub fn busy_mask(&self) -> u16 {
        self.lock().busy_mask
    }

    pub fn set_busy_mask(&self, mask: u16) {
        self.lock().busy_mask = mask;
    }

    /// Head code of `channel` if it is ready to go out and the channel is
    /// not busy firmware-side.
    pub fn next_to_send(&self, channel: Channel) -> Option<(CodeId, Code, bool)> {
        let mut state = self.lock();
        let busy = state.busy_mask & channel.bit() != 0;
        let head = state.channels[channel.index()].queue.front_mut()?;
        if head.state != CodeState::Queued {
            return None;
        }
        let priority = head.code.is_priority();
        if busy && !priority {
            return None;
        }
        Some((head.id, head.code.clone(), priority))
    }

    /// Flag the head of `channel` as offered to the interceptors. Returns
    /// `true` the first time, `false` on send retries.
    pub fn mark_intercepted(&self, channel: Channel, id: CodeId) -> bool {
        let mut state = self.lock();
        match state.channels[channel.index()].queue.front_mut() {
            Some(head) if head.id == id && !head.intercepted => {
                head.intercepted = true;
                true
            }
            _ => false,
        }
    }

    /// Mark the head of `channel` as sent and set its busy bit.
    pub fn mark_sent(&self, channel: Channel, id: CodeId) {
        let mut state = self.lock();
        state.busy_mask |= channel.bit();
        if let Some(head) = state.channels[channel.index()].queue.front_mut() {
            if head.id == id {
                head.state = CodeState::Sent;
            }
        }
    }

    /// Whether any channel has a code waiting to be sent.
    pub fn has_pending_codes(&self) -> bool {
        let state = self.lock();
        state
            .channels
            .iter()
            .any(|c| c.queue.front().map_or(false, |q| q.state == CodeState::Queued))
            || !state.outbox.is_empty()
    }

    pub fn push_action(&self, action: HostAction) {
        self.lock().outbox.push_back(action);
    }

    pub fn pop_action(&self) -> Option<HostAction> {
        self.lock().outbox.pop_front()
    }

    /// Put an action back after a soft write failure.
    pub fn push_action_front(&self, action: HostAction) {
        self.lock().outbox.push_front(action);
    }

    pub fn push_pending_evaluation(&self, tx: oneshot::Sender<Result<String>>) {
        self.lock().pending_evaluations.push_back(tx);
    }

    pub fn resolve_evaluation(&self, result: Result<String>) {
        let tx = self.lock().pending_evaluations.pop_front();
        match tx {
            Some(tx) => {
                let _ = tx.send(result);
            }
            None => debug!("evaluation result with no waiter"),
        }
    }

    // ------------------------------------------------------------------
    // Reply routing
    // ------------------------------------------------------------------

    /// Route a firmware code reply to the head of every addressed channel.
    ///
    /// When `routed` comes back `false` no channel had a code in flight and
    /// the caller logs the text to the object model instead. `completed`
    /// lists the codes a terminator reply just finished.
    pub fn route_reply(&self, flags: ReplyFlags, text: &str) -> RouteOutcome {
        let severity = severity_of(flags);
        let terminator = !flags.contains(ReplyFlags::PUSH);
        let mut outcome = RouteOutcome::default();

        let mut state = self.lock();
        for channel in flags.channels() {
            let entry = &mut state.channels[channel.index()];
            let Some(head) = entry.queue.front_mut() else {
                continue;
            };
            if !matches!(head.state, CodeState::Sent | CodeState::AwaitingReply) {
                continue;
            }
            outcome.routed = true;
            head.reply.push_str(text);
            if severity_rank(severity) > severity_rank(head.severity) {
                head.severity = severity;
            }
            if terminator {
                let mut finished = entry.queue.pop_front().expect("head exists");
                finished.state = CodeState::Finished;
                state.busy_mask &= !channel.bit();
                outcome.completed.push(finished.code.clone());
                deliver(finished, None);
            } else {
                head.state = CodeState::AwaitingReply;
            }
        }
        if outcome.routed {
            drop(state);
            self.drained.notify_waiters();
        }
        outcome
    }

    /// Fail or finish every in-flight code on `channel`.
    ///
    /// Codes already sent to the firmware complete with the synthesized
    /// `reply`; still-queued codes fail with [`Error::Aborted`].
    pub fn drain_channel(&self, channel: Channel, reply: &str) {
        let mut state = self.lock();
        let entry = &mut state.channels[channel.index()];
        let drained: Vec<QueuedCode> = entry.queue.drain(..).collect();
        state.busy_mask &= !channel.bit();
        drop(state);

        for mut queued in drained {
            match queued.state {
                CodeState::Sent | CodeState::AwaitingReply => {
                    queued.state = CodeState::Finished;
                    queued.reply.push_str(reply);
                    deliver(queued, None);
                }
                _ => {
                    queued.state = CodeState::Failed;
                    deliver(queued, Some(Error::Aborted));
                }
            }
        }
        self.drained.notify_waiters();
    }

    /// Complete the head of `channel` out-of-band (internally processed and
    /// priority codes).
    pub fn finish_head(&self, channel: Channel, id: CodeId, reply: &str) {
        let mut state = self.lock();
        let entry = &mut state.channels[channel.index()];
        if entry.queue.front().map_or(false, |head| head.id == id) {
            let mut finished = entry.queue.pop_front().expect("head exists");
            finished.state = CodeState::Finished;
            finished.reply.push_str(reply);
            state.busy_mask &= !channel.bit();
            drop(state);
            deliver(finished, None);
            self.drained.notify_waiters();
        }
    }

    /// Fail the head of `channel` with `error`.
    pub fn fail_head(&self, channel: Channel, id: CodeId, error: Error) {
        let mut state = self.lock();
        let entry = &mut state.channels[channel.index()];
        if entry.queue.front().map_or(false, |head| head.id == id) {
            let mut failed = entry.queue.pop_front().expect("head exists");
            failed.state = CodeState::Failed;
            state.busy_mask &= !channel.bit();
            drop(state);
            deliver(failed, Some(error));
            self.drained.notify_waiters();
        }
    }

    /// No codes live on `channel` right now.
    pub fn channel_idle(&self, channel: Channel) -> bool {
        self.lock().channels[channel.index()].queue.is_empty()
    }

    /// Wait until `channel` has no live codes left.
    pub async fn flush(&self, channel: Channel) {
        loop {
            let notified = self.drained.notified();
            if self.lock().channels[channel.index()].queue.is_empty() {
                return;
            }
            notified.await;
        }
    }
}

impl Default for Queues {
    fn default() -> Self {
        Self::new()
    }
}

fn deliver(mut queued: QueuedCode, error: Option<Error>) {
    debug!(
        id = queued.id,
        system = queued.system,
        failed = error.is_some(),
        "code completed"
    );
    let Some(tx) = queued.completion.take() else {
        return;
    };
    let result = match error {
        Some(e) => Err(e),
        None => Ok(Message {
            time: chrono::Utc::now(),
            severity: queued.severity,
            content: std::mem::take(&mut queued.reply),
        }),
    };
    // The submitter may have gone away; that is not an error.
    let _ = tx.send(result);
}

fn severity_of(flags: ReplyFlags) -> MessageSeverity {
    if flags.contains(ReplyFlags::ERROR) {
        MessageSeverity::Error
    } else if flags.contains(ReplyFlags::WARNING) {
        MessageSeverity::Warning
    } else {
        MessageSeverity::Info
    }
}

fn severity_rank(severity: MessageSeverity) -> u8 {
    match severity {
        MessageSeverity::Info => 0,
        MessageSeverity::Warning => 1,
        MessageSeverity::Error => 2,
    }
}
