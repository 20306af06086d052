//! Subscriber client
//!
//! Connects as `display`, discovers the sources on the broker and pulls
//! their data through per-source queues filled by the receiver worker.
//!
//! # Example
//!
//! ```no_run
//! use neuro_relay::client::SubscriberClient;
//! use neuro_relay::config::RelayConfig;
//!
//! let client = SubscriberClient::connect("localhost:8336", &RelayConfig::default())?;
//! let source = client.sources()[0];
//! client.watch(source)?;
//! let block = client.get_data(source, 250)?;
//! println!("{} samples on {} channel(s)", block.len(), block.channel_count());
//! # Ok::<(), neuro_relay::Error>(())
//! ```

use super::receiver::{ClientQueues, InboundStream, spawn_receiver};
use crate::config::{ClientConfig, RelayConfig};
use crate::core::types::{ClientId, Role, SampleBlock};
use crate::error::{Error, Result};
use crate::streaming::WatchGate;
use crate::streaming::wire::{self, Command};
use crossbeam_channel::{Receiver, RecvTimeoutError};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::io::Write;
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Poll interval while another thread owns the read side
const REPLY_POLL: Duration = Duration::from_millis(10);

/// Slice of the fetch timeout spent in one queue wait
const FETCH_POLL: Duration = Duration::from_millis(100);

/// What the client knows about one source
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SourceInfo {
    pub header: String,
    pub watched: bool,
}

pub struct SubscriberClient {
    /// Write side; holding it serializes request/reply exchanges
    writer: Mutex<TcpStream>,
    inbound: Arc<Mutex<InboundStream<TcpStream>>>,
    replies: Receiver<String>,
    queues: Arc<ClientQueues>,
    sources: Mutex<BTreeMap<ClientId, SourceInfo>>,
    gate: Arc<WatchGate>,
    running: Arc<AtomicBool>,
    alive: Arc<AtomicBool>,
    receiver: Option<JoinHandle<()>>,
    config: ClientConfig,
}

impl SubscriberClient {
    /// Connect, declare the subscriber role and load the source list
    pub fn connect<A: ToSocketAddrs>(addr: A, config: &RelayConfig) -> Result<Self> {
        let stream = TcpStream::connect(addr)?;
        stream.set_read_timeout(Some(config.network.read_timeout()))?;
        stream.set_write_timeout(Some(config.network.write_timeout()))?;
        if let Err(e) = stream.set_nodelay(true) {
            log::warn!("Failed to set TCP_NODELAY: {}", e);
        }

        let (reply_tx, replies) = crossbeam_channel::unbounded();
        let queues = Arc::new(ClientQueues::new(config.client.queue_capacity));
        let inbound = Arc::new(Mutex::new(InboundStream::new(
            stream.try_clone()?,
            reply_tx,
            Arc::clone(&queues),
        )));
        let gate = Arc::new(WatchGate::new());
        let running = Arc::new(AtomicBool::new(true));
        let alive = Arc::new(AtomicBool::new(false));
        let receiver = spawn_receiver(
            Arc::clone(&inbound),
            Arc::clone(&gate),
            Arc::clone(&running),
            Arc::clone(&alive),
        )?;

        let client = Self {
            writer: Mutex::new(stream),
            inbound,
            replies,
            queues,
            sources: Mutex::new(BTreeMap::new()),
            gate,
            running,
            alive,
            receiver: Some(receiver),
            config: config.client.clone(),
        };

        client.simple_request(&Command::Display)?;
        client.refresh_status()?;
        Ok(client)
    }

    /// Ask the broker for the client list and refresh the source table
    ///
    /// Headers of newly seen sources are fetched; sources that vanished
    /// are forgotten along with their queues.
    pub fn refresh_status(&self) -> Result<Vec<(ClientId, Role)>> {
        let mut writer = self.writer.lock();
        let deadline = self.deadline();
        self.send(&mut writer, &Command::Status)?;

        wire::expect_ok(&self.next_reply(deadline)?)?;
        let count = wire::parse_status_count(&self.next_reply(deadline)?)?;
        let mut entries = Vec::with_capacity(count);
        for _ in 0..count {
            entries.push(wire::parse_status_entry(&self.next_reply(deadline)?)?);
        }

        let mut source_ids: Vec<ClientId> = entries
            .iter()
            .filter(|(_, role)| *role == Role::Source)
            .map(|(id, _)| *id)
            .collect();

        let known: Vec<ClientId> = self.sources.lock().keys().copied().collect();
        let mut fresh = BTreeMap::new();
        for id in source_ids.clone() {
            if known.contains(&id) {
                continue;
            }
            match self.header_locked(&mut writer, id) {
                Ok(header) => {
                    fresh.insert(id, header);
                }
                // Source disconnected between status and getheader
                Err(Error::BadResponse(reply)) if reply == wire::BAD_REQUEST => {
                    log::debug!("Source #{} vanished during refresh", id);
                    source_ids.retain(|&s| s != id);
                }
                Err(e) => return Err(e),
            }
        }

        {
            let mut sources = self.sources.lock();
            sources.retain(|id, _| source_ids.contains(id));
            for (id, header) in fresh {
                sources.insert(
                    id,
                    SourceInfo {
                        header,
                        watched: false,
                    },
                );
            }
            self.gate.set(sources.values().any(|info| info.watched));
        }
        for &id in &source_ids {
            self.queues.ensure(id);
        }
        self.queues.retain(&source_ids);

        Ok(entries)
    }

    /// Ids of the known sources, ascending
    pub fn sources(&self) -> Vec<ClientId> {
        self.sources.lock().keys().copied().collect()
    }

    pub fn source_info(&self, id: ClientId) -> Option<SourceInfo> {
        self.sources.lock().get(&id).cloned()
    }

    /// Fetch the current header of source `id` from the broker
    pub fn header(&self, id: ClientId) -> Result<String> {
        self.require_source(id)?;
        let mut writer = self.writer.lock();
        let header = self.header_locked(&mut writer, id)?;
        if let Some(info) = self.sources.lock().get_mut(&id) {
            info.header = header.clone();
        }
        Ok(header)
    }

    /// Role the broker has recorded for this connection
    pub fn role(&self) -> Result<Role> {
        let mut writer = self.writer.lock();
        let deadline = self.deadline();
        self.send(&mut writer, &Command::Role)?;
        let line = self.next_reply(deadline)?;
        Role::parse(&line).ok_or_else(|| Error::BadResponse(line))
    }

    /// Start receiving batches of source `id`
    pub fn watch(&self, id: ClientId) -> Result<()> {
        self.check_receiver()?;
        self.require_source(id)?;
        if self.source_info(id).is_some_and(|info| info.watched) {
            return Ok(());
        }
        self.simple_request(&Command::Watch(id))?;
        if let Some(info) = self.sources.lock().get_mut(&id) {
            info.watched = true;
        }
        self.gate.set(true);
        Ok(())
    }

    /// Stop receiving batches of source `id`
    pub fn unwatch(&self, id: ClientId) -> Result<()> {
        self.check_receiver()?;
        self.require_source(id)?;
        if !self.source_info(id).is_some_and(|info| info.watched) {
            return Ok(());
        }
        self.simple_request(&Command::Unwatch(id))?;
        let mut sources = self.sources.lock();
        if let Some(info) = sources.get_mut(&id) {
            info.watched = false;
        }
        self.gate.set(sources.values().any(|info| info.watched));
        Ok(())
    }

    /// Collect at least `min_length` samples of source `id`
    ///
    /// Blocks are concatenated channel-wise until `min_length` samples have
    /// accumulated or the fetch timeout elapses; whatever was collected is
    /// returned, possibly fewer samples or none. With `min_length == 0` the
    /// first available block is returned. If the receiver stops mid-call the
    /// samples already collected are returned; with none, `ReceiverStopped`.
    pub fn get_data(&self, id: ClientId, min_length: usize) -> Result<SampleBlock> {
        self.check_receiver()?;
        let queue = self.queues.get(id).ok_or(Error::UnknownClient(id))?;

        let deadline = Instant::now() + self.config.fetch_timeout();
        let mut data = SampleBlock {
            source_id: id,
            ..SampleBlock::default()
        };
        while data.is_empty() || data.len() < min_length {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            match queue.get(remaining.min(FETCH_POLL)) {
                Some(block) => data.extend(block)?,
                None if !self.is_receiving() => {
                    // Nothing more will arrive; keep what was already queued
                    while let Some(block) = queue.try_get() {
                        data.extend(block)?;
                    }
                    if data.is_empty() {
                        return Err(Error::ReceiverStopped);
                    }
                    break;
                }
                None => {}
            }
        }
        Ok(data)
    }

    /// Whether the receiver worker is still running
    pub fn is_receiving(&self) -> bool {
        self.alive.load(Ordering::Relaxed)
    }

    /// Stop the receiver and close the connection
    pub fn close(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        self.running.store(false, Ordering::Relaxed);
        if let Err(e) = self.writer.lock().shutdown(Shutdown::Both)
            && e.kind() != std::io::ErrorKind::NotConnected
        {
            log::debug!("Socket shutdown failed: {}", e);
        }
        // Wake a parked receiver so it sees the cleared flag
        self.gate.set(true);
        if let Some(receiver) = self.receiver.take()
            && receiver.join().is_err()
        {
            log::error!("Receiver worker panicked");
        }
    }

    fn deadline(&self) -> Instant {
        Instant::now() + self.config.reply_timeout()
    }

    fn check_receiver(&self) -> Result<()> {
        if self.alive.load(Ordering::Relaxed) {
            Ok(())
        } else {
            Err(Error::ReceiverStopped)
        }
    }

    fn require_source(&self, id: ClientId) -> Result<()> {
        if self.sources.lock().contains_key(&id) {
            return Ok(());
        }
        self.refresh_status()?;
        if self.sources.lock().contains_key(&id) {
            Ok(())
        } else {
            Err(Error::UnknownClient(id))
        }
    }

    /// Send a command whose whole reply is `200 OK`
    fn simple_request(&self, command: &Command) -> Result<()> {
        let mut writer = self.writer.lock();
        let deadline = self.deadline();
        self.send(&mut writer, command)?;
        wire::expect_ok(&self.next_reply(deadline)?)
    }

    fn header_locked(&self, writer: &mut TcpStream, id: ClientId) -> Result<String> {
        let deadline = self.deadline();
        self.send(writer, &Command::GetHeader(id))?;
        wire::expect_ok(&self.next_reply(deadline)?)?;
        self.next_reply(deadline)
    }

    fn send(&self, writer: &mut TcpStream, command: &Command) -> Result<()> {
        // Replies nobody waited for belong to an earlier, abandoned request
        for stale in self.replies.try_iter() {
            log::debug!("Discarding stale reply: {:?}", stale);
        }
        writer.write_all(command.to_line().as_bytes())?;
        writer.flush()?;
        Ok(())
    }

    /// Next non-sample line from the broker
    ///
    /// Reads the socket directly when the receiver worker is parked,
    /// otherwise waits for the worker to forward the line.
    fn next_reply(&self, deadline: Instant) -> Result<String> {
        loop {
            if let Ok(line) = self.replies.try_recv() {
                return Ok(line);
            }
            if Instant::now() >= deadline {
                return Err(Error::BadResponse("timed out waiting for reply".to_string()));
            }

            if !self.gate.is_open()
                && let Some(mut inbound) = self.inbound.try_lock()
            {
                inbound.read_once()?;
                continue;
            }
            if !self.alive.load(Ordering::Relaxed) && self.gate.is_open() {
                return Err(Error::ReceiverStopped);
            }
            match self.replies.recv_timeout(REPLY_POLL) {
                Ok(line) => return Ok(line),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => return Err(Error::ReceiverStopped),
            }
        }
    }
}

impl Drop for SubscriberClient {
    fn drop(&mut self) {
        self.stop();
    }
}
