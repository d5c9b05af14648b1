//! Per-channel file runner tasks.
//!
//! Each channel that executes files gets one long-lived task owning its
//! macro stack. The runner reads codes out of the topmost interpreter,
//! submits them through the shared queues, and awaits each completion, so
//! per-channel FIFO order holds and the transport pump never blocks on
//! file I/O or expression evaluation.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::codes::{Channel, Keyword};
use crate::error::Error;
use crate::interpreter::{ExpressionEvaluator, FileInterpreter, Read};
use crate::model::{Message, MessageSeverity, ModelStore};

use super::queues::{HostAction, Queues};
use super::MacroPathResolver;

/// Commands the scheduler sends to a channel's file runner.
#[derive(Debug)]
pub enum FileCommand {
    /// Open a macro file and push it on the stack (the machine lock has
    /// already been granted).
    Push {
        filename: String,
        report_missing: bool,
    },
    /// Tear down the topmost file, or the whole stack.
    Abort { all: bool, notify_firmware: bool },
    /// Rewind the active file (print pause).
    SetPosition(u64),
}

pub struct FileRunner {
    channel: Channel,
    queues: Arc<Queues>,
    model: ModelStore,
    resolver: Arc<dyn MacroPathResolver>,
    evaluator: Arc<dyn ExpressionEvaluator>,
    max_depth: usize,
    stack: Vec<FileInterpreter>,
}

impl FileRunner {
    #[allow(clippy::too_many_arguments)]
    pub fn spawn(
        channel: Channel,
        queues: Arc<Queues>,
        model: ModelStore,
        resolver: Arc<dyn MacroPathResolver>,
        evaluator: Arc<dyn ExpressionEvaluator>,
        max_depth: usize,
    ) -> mpsc::UnboundedSender<FileCommand> {
        let (tx, rx) = mpsc::unbounded_channel();
        let runner = Self {
            channel,
            queues,
            model,
            resolver,
            evaluator,
            max_depth,
            stack: Vec::new(),
        };
        tokio::spawn(runner.run(rx));
        tx
    }

    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<FileCommand>) {
        loop {
            // Commands first: aborts must win over the next code read.
            while let Ok(command) = rx.try_recv() {
                self.apply(command).await;
            }

            if self.stack.is_empty() {
                match rx.recv().await {
                    Some(command) => {
                        self.apply(command).await;
                        continue;
                    }
                    None => return,
                }
            }

            self.step().await;
        }
    }

    async fn apply(&mut self, command: FileCommand) {
        match command {
            FileCommand::Push {
                filename,
                report_missing,
            } => self.open(filename, report_missing).await,
            FileCommand::Abort {
                all,
                notify_firmware,
            } => self.teardown(all, notify_firmware).await,
            FileCommand::SetPosition(position) => {
                if let Some(top) = self.stack.last_mut() {
                    if let Err(e) = top.set_position(position).await {
                        warn!(channel = %self.channel, "cannot rewind file: {e}");
                    }
                }
            }
        }
    }

    async fn open(&mut self, filename: String, report_missing: bool) {
        if self.stack.len() >= self.max_depth {
            error!(channel = %self.channel, "macro depth limit reached, refusing {filename}");
            self.queues.push_action(HostAction::MacroCompleted {
                channel: self.channel,
                error: true,
            });
            return;
        }
        let Some(path) = self.resolver.resolve(&filename) else {
            if report_missing {
                error!(channel = %self.channel, "macro file not found: {filename}");
                let mut access = self.model.access_read_write().await;
                access.add_message(Message::new(
                    MessageSeverity::Error,
                    format!("Macro file {filename} not found"),
                ));
            }
            self.queues.push_action(HostAction::MacroCompleted {
                channel: self.channel,
                error: true,
            });
            return;
        };
        match self.open_interpreter(&path).await {
            Ok(interpreter) => {
                info!(channel = %self.channel, "starting macro {}", interpreter.name());
                self.stack.push(interpreter);
            }
            Err(e) => {
                error!(channel = %self.channel, "cannot open {}: {e}", path.display());
                self.queues.push_action(HostAction::MacroCompleted {
                    channel: self.channel,
                    error: true,
                });
            }
        }
    }

    async fn open_interpreter(&self, path: &PathBuf) -> crate::error::Result<FileInterpreter> {
        FileInterpreter::open(
            path,
            self.channel,
            true,
            self.queues.clone(),
            self.evaluator.clone(),
        )
        .await
    }

    /// Read and execute one code (or react to end of file).
    async fn step(&mut self) {
        let Some(top) = self.stack.last_mut() else {
            return;
        };
        match top.read_code().await {
            Ok(Read::Code(code)) => match code.keyword {
                Some(Keyword::Echo) => {
                    let text = code.keyword_argument.unwrap_or_default();
                    let mut access = self.model.access_read_write().await;
                    access.add_message(Message::new(MessageSeverity::Info, text));
                }
                Some(Keyword::Abort) => {
                    let message = code.keyword_argument;
                    self.teardown(true, true).await;
                    if let Some(message) = message {
                        let mut access = self.model.access_read_write().await;
                        access.add_message(Message::new(MessageSeverity::Error, message));
                    }
                }
                Some(Keyword::Return) => self.pop_finished(false),
                _ => {
                    let handle = self.queues.submit_system(code);
                    match handle.await_reply().await {
                        Ok(_) => {}
                        Err(Error::Aborted) if self.stack.is_empty() => {
                            // An abort command already tore us down.
                        }
                        Err(e) => {
                            error!(channel = %self.channel, "macro code failed: {e}");
                            self.teardown(true, true).await;
                        }
                    }
                }
            },
            Ok(Read::NotReady) => {
                // Foreign codes occupy the channel; let them drain.
                self.queues.flush(self.channel).await;
            }
            Ok(Read::Eof) => {
                debug!(channel = %self.channel, "macro finished");
                self.pop_finished(false);
            }
            Err(e) => {
                error!(channel = %self.channel, "file error: {e}");
                self.teardown(true, true).await;
                let mut access = self.model.access_read_write().await;
                access.add_message(Message::new(MessageSeverity::Error, e.to_string()));
            }
        }
    }

    fn pop_finished(&mut self, error: bool) {
        if let Some(mut interpreter) = self.stack.pop() {
            let system = interpreter.is_system();
            interpreter.close();
            if system {
                self.queues.push_action(HostAction::MacroCompleted {
                    channel: self.channel,
                    error,
                });
            }
        }
    }

    async fn teardown(&mut self, all: bool, notify_firmware: bool) {
        let mut popped_system = false;
        if all {
            for mut interpreter in self.stack.drain(..) {
                popped_system |= interpreter.is_system();
                interpreter.close();
            }
        } else if let Some(mut interpreter) = self.stack.pop() {
            popped_system = interpreter.is_system();
            interpreter.close();
        }
        self.queues
            .drain_channel(self.channel, "File has been aborted");
        if notify_firmware && popped_system {
            self.queues.push_action(HostAction::MacroCompleted {
                channel: self.channel,
                error: true,
            });
        }
    }
}
