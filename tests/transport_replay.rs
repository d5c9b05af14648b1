//! Duplicate-frame suppression: replaying the same firmware frame twice
//! must not act twice.

mod common;

use std::collections::VecDeque;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use printhost::codes::{parse_line, Channel};
use printhost::ipc::Interceptors;
use printhost::model::ModelStore;
use printhost::protocol::{firmware, Connection};
use printhost::scheduler::{MacroPathResolver, Scheduler};
use printhost::spi::{SpiDevice, Transport, FORMAT_INVALID};

use common::build_firmware_frame;

struct Replay {
    frames: VecDeque<Vec<u8>>,
}

#[async_trait]
impl SpiDevice for Replay {
    async fn exchange(&mut self, _tx: &[u8], rx: &mut [u8]) -> io::Result<()> {
        match self.frames.pop_front() {
            Some(frame) => {
                rx[..frame.len()].copy_from_slice(&frame);
                rx[frame.len()..].fill(0);
            }
            None => {
                rx.fill(0);
                rx[0] = FORMAT_INVALID;
            }
        }
        Ok(())
    }

    async fn wait_data_ready(&mut self, _timeout: Duration) -> io::Result<bool> {
        Ok(false)
    }
}

struct NoMacros;

impl MacroPathResolver for NoMacros {
    fn resolve(&self, _filename: &str) -> Option<std::path::PathBuf> {
        None
    }
}

#[tokio::test]
async fn replayed_code_reply_completes_only_one_code() {
    let flags = Channel::Http.bit() as u32;
    let mut reply_body = flags.to_le_bytes().to_vec();
    reply_body.extend_from_slice(b"ok");
    let reply_frame = build_firmware_frame(7, &[(firmware::CODE_REPLY, reply_body)]);

    let device = Replay {
        frames: VecDeque::from(vec![
            build_firmware_frame(1, &[]),
            reply_frame.clone(),
            reply_frame,
        ]),
    };
    let mut conn = Connection::new(Transport::new(Box::new(device), 8192, 3));
    conn.handshake(Duration::from_millis(1), 4).await.unwrap();

    let model = ModelStore::new();
    let scheduler = Scheduler::new(
        model.clone(),
        Arc::new(NoMacros),
        Arc::new(Interceptors::new()),
        8,
    );

    let mut first = parse_line("M115").unwrap();
    first.channel = Channel::Http;
    let first = scheduler.submit(first);
    let mut second = parse_line("M408").unwrap();
    second.channel = Channel::Http;
    let second = scheduler.submit(second);
    scheduler.queues().mark_sent(
        Channel::Http,
        scheduler.queues().next_to_send(Channel::Http).unwrap().0,
    );

    // First copy of the reply completes the in-flight code.
    for request in conn.exchange().await.unwrap() {
        scheduler.handle_request(request).await;
    }
    let message = first.await_reply().await.unwrap();
    assert_eq!(message.content, "ok");

    // The replay (same sequence id) is suppressed entirely.
    let requests = conn.exchange().await.unwrap();
    assert!(requests.is_empty());
    drop(second);

    // And the model saw no stray log message either.
    let tree = model.get().await;
    assert!(tree["messages"].as_array().unwrap().is_empty());
}
