//! Code interception registry and processor.
//!
//! Intercept-mode connections register for a phase (`Pre`, `Post`,
//! `Executed`) and an optional channel filter. Matching codes block in the
//! scheduler until the interceptor answers `Ignore`, `Cancel` or
//! `Resolve`; `Executed` notifications are fire-and-forget.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::io::BufReader;
use tokio::net::UnixStream;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::codes::{Channel, Code};
use crate::error::Result;

use super::init::{ClientInitMessage, InterceptPhase, Reply};
use super::wire;

/// Pending notifications per interceptor before it counts as stalled.
const JOB_BUFFER: usize = 8;

/// Interceptor's verdict on a code.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "Command")]
pub enum InterceptAction {
    Ignore,
    Cancel,
    Resolve {
        #[serde(rename = "Content")]
        content: String,
    },
}

/// One code offered to an interceptor. `reply` is `None` for fire-and-forget
/// `Executed` notifications.
pub struct InterceptJob {
    pub code: Code,
    pub reply: Option<oneshot::Sender<InterceptAction>>,
}

struct Registration {
    id: u64,
    phase: InterceptPhase,
    channels: Vec<Channel>,
    tx: mpsc::Sender<InterceptJob>,
}

impl Registration {
    fn matches(&self, phase: InterceptPhase, channel: Channel) -> bool {
        self.phase == phase && (self.channels.is_empty() || self.channels.contains(&channel))
    }
}

/// Shared registry of intercepting connections.
#[derive(Default)]
pub struct Interceptors {
    inner: Mutex<Vec<Registration>>,
    next_id: AtomicU64,
}

impl Interceptors {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &self,
        phase: InterceptPhase,
        channels: Vec<Channel>,
    ) -> (u64, mpsc::Receiver<InterceptJob>) {
        let (tx, rx) = mpsc::channel(JOB_BUFFER);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.lock().push(Registration {
            id,
            phase,
            channels,
            tx,
        });
        (id, rx)
    }

    pub fn deregister(&self, id: u64) {
        self.lock().retain(|r| r.id != id);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Registration>> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Offer `code` to every matching interceptor in turn; the first
    /// non-`Ignore` answer wins. Dead interceptors are skipped.
    pub async fn intercept(&self, phase: InterceptPhase, code: &Code) -> InterceptAction {
        // Snapshot the senders; the registry lock is never held across I/O.
        let targets: Vec<(u64, mpsc::Sender<InterceptJob>)> = self
            .lock()
            .iter()
            .filter(|r| r.matches(phase, code.channel))
            .map(|r| (r.id, r.tx.clone()))
            .collect();

        for (id, tx) in targets {
            let (reply_tx, reply_rx) = oneshot::channel();
            let job = InterceptJob {
                code: code.clone(),
                reply: Some(reply_tx),
            };
            if tx.send(job).await.is_err() {
                self.deregister(id);
                continue;
            }
            match reply_rx.await {
                Ok(InterceptAction::Ignore) => {}
                Ok(action) => return action,
                Err(_) => self.deregister(id),
            }
        }
        InterceptAction::Ignore
    }

    /// Tell `Executed`-phase interceptors about a completed code without
    /// waiting for them.
    pub fn notify_executed(&self, code: &Code) {
        for registration in self.lock().iter() {
            if !registration.matches(InterceptPhase::Executed, code.channel) {
                continue;
            }
            let job = InterceptJob {
                code: code.clone(),
                reply: None,
            };
            if registration.tx.try_send(job).is_err() {
                debug!("interceptor too slow for executed notification");
            }
        }
    }
}

/// Connection loop for an intercept-mode client.
pub async fn process(
    stream: UnixStream,
    init: &ClientInitMessage,
    interceptors: &Interceptors,
) -> Result<()> {
    let (reader, mut writer) = stream.into_split();
    let Some(phase) = init.interception_mode else {
        wire::write_envelope(
            &mut writer,
            &Reply::error("InvalidInit", "interceptionMode is required"),
        )
        .await?;
        return Ok(());
    };

    let (id, mut jobs) = interceptors.register(phase, init.channels.clone());
    let mut reader = BufReader::new(reader);

    let result = async {
        while let Some(job) = jobs.recv().await {
            let envelope = json!({ "Code": job.code });
            wire::write_envelope(&mut writer, &envelope).await?;
            let Some(reply) = job.reply else {
                continue;
            };
            match wire::read_envelope::<_, InterceptAction>(&mut reader).await? {
                Some(action) => {
                    // A dropped receiver means the code finished elsewhere.
                    let _ = reply.send(action);
                }
                None => break,
            }
        }
        Ok(())
    }
    .await;

    interceptors.deregister(id);
    if let Err(ref e) = result {
        warn!("interceptor connection failed: {e}");
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codes::parse_line;

    fn code_on(channel: Channel) -> Code {
        let mut code = parse_line("M104 S200").unwrap();
        code.channel = channel;
        code
    }

    #[tokio::test]
    async fn no_interceptors_means_ignore() {
        let interceptors = Interceptors::new();
        let action = interceptors
            .intercept(InterceptPhase::Pre, &code_on(Channel::Http))
            .await;
        assert!(matches!(action, InterceptAction::Ignore));
    }

    #[tokio::test]
    async fn first_non_ignore_answer_wins() {
        let interceptors = Interceptors::new();
        let (_id, mut jobs) = interceptors.register(InterceptPhase::Pre, vec![]);

        let responder = tokio::spawn(async move {
            let job = jobs.recv().await.unwrap();
            job.reply
                .unwrap()
                .send(InterceptAction::Resolve {
                    content: "handled".to_string(),
                })
                .unwrap();
        });

        let action = interceptors
            .intercept(InterceptPhase::Pre, &code_on(Channel::Http))
            .await;
        responder.await.unwrap();
        match action {
            InterceptAction::Resolve { content } => assert_eq!(content, "handled"),
            other => panic!("unexpected action {other:?}"),
        }
    }

    #[tokio::test]
    async fn channel_filter_is_honored() {
        let interceptors = Interceptors::new();
        let (_id, mut jobs) = interceptors.register(InterceptPhase::Pre, vec![Channel::Usb]);

        // HTTP code does not match the USB-only interceptor.
        let action = interceptors
            .intercept(InterceptPhase::Pre, &code_on(Channel::Http))
            .await;
        assert!(matches!(action, InterceptAction::Ignore));
        assert!(jobs.try_recv().is_err());
    }

    #[tokio::test]
    async fn dead_interceptor_is_skipped_and_removed() {
        let interceptors = Interceptors::new();
        let (_id, jobs) = interceptors.register(InterceptPhase::Pre, vec![]);
        drop(jobs);

        let action = interceptors
            .intercept(InterceptPhase::Pre, &code_on(Channel::Http))
            .await;
        assert!(matches!(action, InterceptAction::Ignore));
        assert!(interceptors.lock().is_empty());
    }
}
