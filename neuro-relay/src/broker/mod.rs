//! Broker server
//!
//! Owns the listener, the client registry and every worker thread.
//!
//! # Threads
//!
//! | Thread | Count | Role |
//! |--------|-------|------|
//! | caller of [`BrokerServer::run`] | 1 | accept loop |
//! | `fanout-consumer` | 1 | drains source queues to watchers |
//! | `producer-<id>` | per local device | device → source queue |
//! | `commander-<id>` | per connection | protocol, socket source → queue |
//!
//! # Shutdown
//!
//! Clearing the running flag stops the accept loop. The consumer is joined
//! first, then every registered worker, then all peer sockets are shut
//! down and the listener is dropped.

pub mod commander;
pub mod consumer;
pub mod peer;
pub mod producer;
pub mod registry;

pub use commander::{CommandHandler, Commander};
pub use consumer::FanoutConsumer;
pub use peer::{PeerSocket, Transport};
pub use producer::DeviceProducer;
pub use registry::ClientRegistry;

use crate::config::RelayConfig;
use crate::core::device::SourceDevice;
use crate::core::types::{ClientId, Role};
use crate::error::{Error, Result};
use std::io::ErrorKind;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

/// Pause between accept attempts when no connection is pending
const ACCEPT_POLL: Duration = Duration::from_millis(10);

pub struct BrokerServer {
    config: RelayConfig,
    listener: TcpListener,
    registry: Arc<ClientRegistry>,
    running: Arc<AtomicBool>,
    device: Option<Box<dyn SourceDevice>>,
}

impl BrokerServer {
    /// Bind the listener; `device`, if any, becomes the first source at [`run`](Self::run)
    pub fn bind(
        config: &RelayConfig,
        device: Option<Box<dyn SourceDevice>>,
        running: Arc<AtomicBool>,
    ) -> Result<Self> {
        let address = config.network.address();
        let listener = TcpListener::bind(&address)
            .map_err(|e| Error::Other(format!("Failed to bind to {}: {}", address, e)))?;
        listener.set_nonblocking(true)?;

        Ok(Self {
            config: config.clone(),
            listener,
            registry: Arc::new(ClientRegistry::new(config.broker.queue_capacity)),
            running,
            device,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn registry(&self) -> Arc<ClientRegistry> {
        Arc::clone(&self.registry)
    }

    /// Accept connections until the running flag is cleared
    pub fn run(mut self) -> Result<()> {
        if let Some(device) = self.device.take() {
            let id = self.register_local(device)?;
            log::info!("Local device registered as source #{}", id);
        }

        let consumer = {
            let consumer = FanoutConsumer::new(self.registry(), Arc::clone(&self.running));
            thread::Builder::new()
                .name("fanout-consumer".to_string())
                .spawn(move || consumer.run())?
        };

        log::info!("Accepting connections on {}", self.local_addr()?);

        while self.running.load(Ordering::Relaxed) {
            match self.listener.accept() {
                Ok((stream, addr)) => match self.register_connection(stream) {
                    Ok(id) => log::info!("Connected client #{} from {}", id, addr),
                    Err(e) => log::error!("Failed to register connection from {}: {}", addr, e),
                },
                Err(ref e) if e.kind() == ErrorKind::WouldBlock => {
                    thread::sleep(ACCEPT_POLL);
                }
                Err(e) => {
                    log::error!("Accept error: {}", e);
                }
            }
        }

        self.shutdown(consumer);
        Ok(())
    }

    fn register_local(&self, device: Box<dyn SourceDevice>) -> Result<ClientId> {
        let header = device.header().to_string();
        let registry = self.registry();
        let running = Arc::clone(&self.running);
        self.registry
            .register(Role::Source, header, Transport::Local, move |id| {
                thread::Builder::new()
                    .name(format!("producer-{id}"))
                    .spawn(move || DeviceProducer::new(id, registry, device, running).run())
            })
    }

    fn register_connection(&self, stream: TcpStream) -> Result<ClientId> {
        stream.set_nonblocking(false)?;
        stream.set_read_timeout(Some(self.config.network.read_timeout()))?;
        stream.set_write_timeout(Some(self.config.network.write_timeout()))?;
        if let Err(e) = stream.set_nodelay(true) {
            log::warn!("Failed to set TCP_NODELAY: {}", e);
        }

        let socket = Arc::new(PeerSocket::new(stream.try_clone()?)?);
        let registry = self.registry();
        let running = Arc::clone(&self.running);
        let writer = Arc::clone(&socket);

        let result = self.registry.register(
            Role::Unassigned,
            "",
            Transport::Socket(Arc::clone(&socket)),
            move |id| {
                thread::Builder::new()
                    .name(format!("commander-{id}"))
                    .spawn(move || Commander::new(id, registry, stream, writer, running).run())
            },
        );
        if result.is_err() {
            socket.shutdown();
        }
        result
    }

    fn shutdown(self, consumer: thread::JoinHandle<()>) {
        log::info!("Shutting down broker");
        if consumer.join().is_err() {
            log::error!("Fan-out consumer panicked");
        }

        let detached = self.registry.drain_for_shutdown();
        let mut transports = Vec::with_capacity(detached.len());
        for entry in detached {
            if let Some(worker) = entry.worker
                && worker.join().is_err()
            {
                log::error!("Worker of client #{} panicked", entry.id);
            }
            transports.extend(entry.transport);
        }
        for transport in &transports {
            transport.shutdown();
        }
        drop(self.listener);
        log::info!("Broker stopped");
    }
}
