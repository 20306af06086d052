//! Per-connection command worker
//!
//! Reads protocol lines from one accepted socket, applies them to the
//! registry and writes the replies. For a source connection it also
//! forwards sample lines into the source queue.
//!
//! # Reply framing
//!
//! Replies for a read burst are collected and written with a single
//! socket write. Sample lines are acknowledged with one `200 OK` per burst,
//! after the replies of any other commands in the same burst.
//!
//! # Termination
//!
//! - EOF or a socket error: the worker exits, the registry reaps it
//! - channel count change on a source: `400 BAD REQUEST`, then exit
//! - malformed lines never stop the worker

use super::peer::PeerSocket;
use super::registry::ClientRegistry;
use crate::core::types::{ClientId, Continuity, Role, SampleBatch, SequenceTracker};
use crate::error::{Error, Result};
use crate::streaming::wire::{self, BAD_REQUEST, Command, OK};
use crate::streaming::{BoundedQueue, Burst, DropMonitor, LineBuffer, Put, read_burst};
use std::net::TcpStream;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Replies produced by one read burst
#[derive(Debug, Default, PartialEq)]
pub struct BurstReply {
    /// Everything to write back, CRLF-terminated
    pub text: String,
    /// The connection must be closed after writing `text`
    pub terminate: bool,
}

/// Protocol state machine of one connection, independent of the socket
pub struct CommandHandler {
    id: ClientId,
    registry: Arc<ClientRegistry>,
    tracker: SequenceTracker,
    queue: Option<BoundedQueue<SampleBatch>>,
    drops: DropMonitor,
}

enum Outcome {
    Reply(String),
    SampleAccepted,
    Fatal(String),
}

impl CommandHandler {
    pub fn new(id: ClientId, registry: Arc<ClientRegistry>) -> Self {
        Self {
            id,
            registry,
            tracker: SequenceTracker::new(),
            queue: None,
            drops: DropMonitor::default(),
        }
    }

    /// Apply every line of a read burst and build the combined reply
    pub fn handle_burst(&mut self, lines: &[String]) -> BurstReply {
        let mut reply = BurstReply::default();
        let mut samples = 0usize;

        for line in lines {
            match self.handle_line(line) {
                Outcome::Reply(text) => reply.text.push_str(&text),
                Outcome::SampleAccepted => samples += 1,
                Outcome::Fatal(text) => {
                    reply.text.push_str(&text);
                    reply.terminate = true;
                    return reply;
                }
            }
        }

        if samples > 0 {
            reply.text.push_str(&wire::reply([OK]));
        }
        reply
    }

    fn handle_line(&mut self, line: &str) -> Outcome {
        let command = match Command::parse(line) {
            Ok(command) => command,
            Err(e) => {
                log::warn!("Client #{} issued unrecognized command: {}", self.id, e);
                return Outcome::Reply(wire::reply([BAD_REQUEST]));
            }
        };

        if let Command::Sample(batch) = command {
            return self.handle_sample(batch);
        }

        match self.execute(&command) {
            Ok(text) => Outcome::Reply(text),
            Err(e) => {
                log::warn!("Client #{} issued {:?} but it failed: {}", self.id, command, e);
                Outcome::Reply(wire::reply([BAD_REQUEST]))
            }
        }
    }

    fn execute(&mut self, command: &Command) -> Result<String> {
        let id = self.id;
        match command {
            Command::Eeg => {
                log::info!("Client #{} issued 'eeg' command", id);
                self.registry.set_role(id, Role::Source)?;
                Ok(wire::reply([OK]))
            }
            Command::Display => {
                log::info!("Client #{} issued 'display' command", id);
                self.registry.set_role(id, Role::Subscriber)?;
                Ok(wire::reply([OK]))
            }
            Command::Role => {
                log::debug!("Client #{} issued 'role' command", id);
                Ok(wire::reply([self.registry.role(id)?.as_str()]))
            }
            Command::Status => {
                log::debug!("Client #{} issued 'status' command", id);
                Ok(wire::format_status(&self.registry.status_report()))
            }
            Command::GetHeader(target) => {
                self.require_subscriber()?;
                self.require_source(*target)?;
                log::info!("Client #{} issued 'getheader {}' command", id, target);
                let header = self.registry.header(*target)?;
                Ok(wire::reply([OK, header.as_str()]))
            }
            Command::SetHeader(text) => {
                self.registry.set_header(id, text.as_str())?;
                log::info!("Client #{} issued 'setheader' command, header is now <{}>", id, text);
                Ok(wire::reply([OK]))
            }
            Command::Watch(target) => {
                self.registry.watch(id, *target)?;
                log::info!("Client #{} issued 'watch {}' command", id, target);
                Ok(wire::reply([OK]))
            }
            Command::Unwatch(target) => {
                self.registry.unwatch(id, *target)?;
                log::info!("Client #{} issued 'unwatch {}' command", id, target);
                Ok(wire::reply([OK]))
            }
            Command::Sample(_) => Err(Error::Protocol("sample line routed as command".to_string())),
        }
    }

    fn require_subscriber(&self) -> Result<()> {
        match self.registry.role(self.id)? {
            Role::Subscriber => Ok(()),
            other => Err(Error::Protocol(format!("client #{} is {}", self.id, other))),
        }
    }

    fn require_source(&self, target: ClientId) -> Result<()> {
        match self.registry.role(target)? {
            Role::Source => Ok(()),
            other => Err(Error::Protocol(format!("client #{} is {}", target, other))),
        }
    }

    fn handle_sample(&mut self, mut batch: SampleBatch) -> Outcome {
        let queue = match self.source_queue() {
            Ok(queue) => queue,
            Err(e) => {
                log::warn!("Client #{} sent a sample line: {}", self.id, e);
                return Outcome::Reply(wire::reply([BAD_REQUEST]));
            }
        };

        match self.tracker.observe(batch.sequence, batch.channel_count()) {
            Ok(Continuity::InOrder) => {}
            Ok(Continuity::Gap { expected, actual }) => log::warn!(
                "Source #{}: sequence number not consistent (expected {}, got {})",
                self.id,
                expected,
                actual
            ),
            Err(e) => {
                log::error!("Source #{} is malfunctioning: {}", self.id, e);
                return Outcome::Fatal(wire::reply([BAD_REQUEST]));
            }
        }

        if self.registry.has_watchers(self.id) {
            batch.source_id = self.id;
            if queue.put(batch) == Put::Dropped
                && let Some(count) = self.drops.due(queue.dropped())
            {
                log::warn!("Source #{}: queue full, dropped {} batch(es)", self.id, count);
            }
        }
        Outcome::SampleAccepted
    }

    fn source_queue(&mut self) -> Result<BoundedQueue<SampleBatch>> {
        if let Some(queue) = &self.queue {
            return Ok(queue.clone());
        }
        let queue = self
            .registry
            .queue(self.id)?
            .ok_or_else(|| Error::Protocol(format!("client #{} is not a source", self.id)))?;
        self.queue = Some(queue.clone());
        Ok(queue)
    }
}

/// Worker owning the read side of one connection
pub struct Commander {
    handler: CommandHandler,
    registry: Arc<ClientRegistry>,
    reader: TcpStream,
    socket: Arc<PeerSocket>,
    running: Arc<AtomicBool>,
}

impl Commander {
    pub fn new(
        id: ClientId,
        registry: Arc<ClientRegistry>,
        reader: TcpStream,
        socket: Arc<PeerSocket>,
        running: Arc<AtomicBool>,
    ) -> Self {
        Self {
            handler: CommandHandler::new(id, Arc::clone(&registry)),
            registry,
            reader,
            socket,
            running,
        }
    }

    /// Worker entry point
    pub fn run(mut self) {
        let id = self.handler.id;
        log::debug!("Commander for client #{} started", id);
        match self.serve() {
            Ok(()) => log::debug!("Commander for client #{} stopped", id),
            Err(e) if e.is_disconnect() => log::info!("Client #{} disconnected", id),
            Err(e) => log::warn!("Client #{} dropped: {}", id, e),
        }
        self.socket.shutdown();
    }

    fn serve(&mut self) -> Result<()> {
        let mut buffer = LineBuffer::new();

        while self.running.load(Ordering::Relaxed) {
            let reply = match read_burst(&mut self.reader, &mut buffer)? {
                Burst::Idle => None,
                Burst::Lines(lines) if lines.is_empty() => None,
                Burst::Lines(lines) => Some(self.handler.handle_burst(&lines)),
                Burst::Overflow(lines) => {
                    log::warn!("Client #{} sent an over-long line, discarded", self.handler.id);
                    let mut reply = self.handler.handle_burst(&lines);
                    if !reply.terminate {
                        reply.text.push_str(&wire::reply([BAD_REQUEST]));
                    }
                    Some(reply)
                }
            };

            if let Some(reply) = reply {
                if !reply.text.is_empty() {
                    self.socket.send(&reply.text)?;
                }
                if reply.terminate {
                    return Err(Error::Protocol("source terminated by broker".to_string()));
                }
            }

            self.registry.reap_dead();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::peer::Transport;
    use std::io;
    use std::thread::{self, JoinHandle};
    use std::time::Duration;

    struct Fixture {
        registry: Arc<ClientRegistry>,
        stop: Arc<AtomicBool>,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                registry: Arc::new(ClientRegistry::new(8)),
                stop: Arc::new(AtomicBool::new(false)),
            }
        }

        fn worker(&self) -> impl FnOnce(ClientId) -> io::Result<JoinHandle<()>> {
            let stop = Arc::clone(&self.stop);
            move |_| {
                Ok(thread::spawn(move || {
                    while !stop.load(Ordering::Relaxed) {
                        thread::sleep(Duration::from_millis(2));
                    }
                }))
            }
        }

        fn client(&self) -> CommandHandler {
            let id = self
                .registry
                .register(Role::Unassigned, "", Transport::Local, self.worker())
                .unwrap();
            CommandHandler::new(id, Arc::clone(&self.registry))
        }
    }

    impl Drop for Fixture {
        fn drop(&mut self) {
            self.stop.store(true, Ordering::Relaxed);
        }
    }

    fn send(handler: &mut CommandHandler, lines: &[&str]) -> String {
        let lines: Vec<String> = lines.iter().map(|l| l.to_string()).collect();
        handler.handle_burst(&lines).text
    }

    #[test]
    fn test_role_and_status() {
        let fx = Fixture::new();
        let mut source = fx.client();
        let mut sub = fx.client();

        assert_eq!(send(&mut source, &["role"]), "Unassigned\r\n");
        assert_eq!(send(&mut source, &["eeg"]), "200 OK\r\n");
        assert_eq!(send(&mut source, &["eeg"]), "200 OK\r\n");
        assert_eq!(send(&mut source, &["display"]), "400 BAD REQUEST\r\n");
        assert_eq!(send(&mut sub, &["display"]), "200 OK\r\n");
        assert_eq!(send(&mut sub, &["role"]), "Subscriber\r\n");

        assert_eq!(
            send(&mut sub, &["status"]),
            "200 OK\r\n2 clients connected\r\n0:Source\r\n1:Subscriber\r\n"
        );
    }

    #[test]
    fn test_header_exchange() {
        let fx = Fixture::new();
        let mut source = fx.client();
        let mut sub = fx.client();
        send(&mut source, &["eeg"]);

        assert_eq!(send(&mut source, &["setheader 0  PATIENT X"]), "200 OK\r\n");
        // Not a subscriber yet
        assert_eq!(send(&mut sub, &["getheader 0"]), "400 BAD REQUEST\r\n");
        send(&mut sub, &["display"]);
        assert_eq!(send(&mut sub, &["getheader 0"]), "200 OK\r\n0  PATIENT X\r\n");
        // Target is not a source
        assert_eq!(send(&mut sub, &["getheader 1"]), "400 BAD REQUEST\r\n");
        assert_eq!(send(&mut sub, &["getheader 7"]), "400 BAD REQUEST\r\n");
    }

    #[test]
    fn test_watch_unwatch() {
        let fx = Fixture::new();
        let mut source = fx.client();
        let mut sub = fx.client();
        send(&mut source, &["eeg"]);
        send(&mut sub, &["display"]);

        assert_eq!(send(&mut source, &["watch 0"]), "400 BAD REQUEST\r\n");
        assert_eq!(send(&mut sub, &["unwatch 0"]), "400 BAD REQUEST\r\n");
        assert_eq!(send(&mut sub, &["watch 0"]), "200 OK\r\n");
        assert!(fx.registry.has_watchers(0));
        assert_eq!(send(&mut sub, &["unwatch 0"]), "200 OK\r\n");
        assert!(!fx.registry.has_watchers(0));
    }

    #[test]
    fn test_garbage_keeps_connection() {
        let fx = Fixture::new();
        let mut client = fx.client();
        let reply = client.handle_burst(&["hello".to_string(), "role".to_string()]);
        assert_eq!(reply.text, "400 BAD REQUEST\r\nUnassigned\r\n");
        assert!(!reply.terminate);
    }

    #[test]
    fn test_samples_acked_once_per_burst() {
        let fx = Fixture::new();
        let mut source = fx.client();
        let mut sub = fx.client();
        send(&mut source, &["eeg"]);
        send(&mut sub, &["display"]);

        // Not a source
        assert_eq!(send(&mut sub, &["! 0 1 1.0"]), "400 BAD REQUEST\r\n");

        // No watcher: acknowledged but not queued
        assert_eq!(send(&mut source, &["! 0 1 1.0"]), "200 OK\r\n");
        let queue = fx.registry.queue(0).unwrap().unwrap();
        assert!(queue.is_empty());

        send(&mut sub, &["watch 0"]);
        assert_eq!(
            send(&mut source, &["! 1 1 10.5", "! 2 1 11", "role"]),
            "Source\r\n200 OK\r\n"
        );
        let first = queue.try_get().unwrap();
        assert_eq!((first.source_id, first.sequence), (0, 1));
        assert_eq!(first.values, vec![10.5]);
        assert_eq!(queue.try_get().unwrap().sequence, 2);
    }

    #[test]
    fn test_channel_mismatch_terminates() {
        let fx = Fixture::new();
        let mut source = fx.client();
        send(&mut source, &["eeg"]);

        let reply = source.handle_burst(&[
            "! 0 2 1 2".to_string(),
            "! 1 3 1 2 3".to_string(),
            "role".to_string(),
        ]);
        assert_eq!(reply.text, "400 BAD REQUEST\r\n");
        assert!(reply.terminate);
    }
}
