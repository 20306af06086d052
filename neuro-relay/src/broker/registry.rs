//! Client registry
//!
//! Single table of every peer the broker knows about: role, header,
//! subscriptions, transport, worker handle and (for sources) the bounded
//! queue. Every operation runs under one lock, so callers never observe a
//! half-updated record.
//!
//! # Lifecycle
//!
//! ```text
//! accept ──► register (Unassigned) ──► set_role ──► ... ──► worker exits
//!                                                              │
//!                       reap_dead (commander / consumer tail) ◄┘
//!                              │
//!                              ▼
//!                 voided: fields cleared, edges stripped,
//!                 id kept so it is never handed out again
//! ```

use super::peer::{PeerSocket, Transport};
use crate::core::types::{ClientId, Role, SampleBatch};
use crate::error::{Error, Result};
use crate::streaming::BoundedQueue;
use parking_lot::{Condvar, Mutex};
use std::collections::{BTreeMap, BTreeSet};
use std::io;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

#[derive(Default)]
struct ClientRecord {
    role: Role,
    header: String,
    watching: BTreeSet<ClientId>,
    transport: Option<Transport>,
    /// `None` once the record has been voided
    worker: Option<JoinHandle<()>>,
    queue: Option<BoundedQueue<SampleBatch>>,
}

impl ClientRecord {
    fn is_live(&self) -> bool {
        self.worker.is_some()
    }

    fn is_live_source(&self) -> bool {
        self.is_live() && self.role == Role::Source
    }

    fn is_live_subscriber(&self) -> bool {
        self.is_live() && self.role == Role::Subscriber
    }
}

/// Worker and transport handed back by [`ClientRegistry::drain_for_shutdown`]
pub struct Detached {
    pub id: ClientId,
    pub worker: Option<JoinHandle<()>>,
    pub transport: Option<Transport>,
}

/// Thread-safe table of connected clients
pub struct ClientRegistry {
    clients: Mutex<BTreeMap<ClientId, ClientRecord>>,
    /// Signalled whenever a subscription edge appears or disappears
    watchers_changed: Condvar,
    queue_capacity: usize,
}

type Clients = BTreeMap<ClientId, ClientRecord>;

fn live(clients: &Clients, id: ClientId) -> Result<&ClientRecord> {
    clients
        .get(&id)
        .filter(|record| record.is_live())
        .ok_or(Error::UnknownClient(id))
}

fn live_mut(clients: &mut Clients, id: ClientId) -> Result<&mut ClientRecord> {
    clients
        .get_mut(&id)
        .filter(|record| record.is_live())
        .ok_or(Error::UnknownClient(id))
}

fn has_watchers(clients: &Clients, source: ClientId) -> bool {
    clients
        .values()
        .any(|record| record.is_live_subscriber() && record.watching.contains(&source))
}

impl ClientRegistry {
    /// Create an empty registry; each source gets a queue of `queue_capacity`
    pub fn new(queue_capacity: usize) -> Self {
        Self {
            clients: Mutex::new(BTreeMap::new()),
            watchers_changed: Condvar::new(),
            queue_capacity: queue_capacity.max(1),
        }
    }

    /// Allocate an id, start the client's worker and store the record
    ///
    /// `spawn` receives the new id and must start the worker. It runs with
    /// the registry locked, so the worker's first registry call waits until
    /// the record is in place. Ids are `max + 1` over every record ever
    /// created (0 for the first).
    pub fn register<F>(
        &self,
        role: Role,
        header: impl Into<String>,
        transport: Transport,
        spawn: F,
    ) -> Result<ClientId>
    where
        F: FnOnce(ClientId) -> io::Result<JoinHandle<()>>,
    {
        let mut clients = self.clients.lock();
        let id = clients.keys().next_back().map_or(0, |last| last + 1);

        let worker = spawn(id)?;
        let queue = (role == Role::Source).then(|| BoundedQueue::new(self.queue_capacity));
        clients.insert(
            id,
            ClientRecord {
                role,
                header: header.into(),
                watching: BTreeSet::new(),
                transport: Some(transport),
                worker: Some(worker),
                queue,
            },
        );
        Ok(id)
    }

    pub fn role(&self, id: ClientId) -> Result<Role> {
        Ok(live(&self.clients.lock(), id)?.role)
    }

    pub fn header(&self, id: ClientId) -> Result<String> {
        Ok(live(&self.clients.lock(), id)?.header.clone())
    }

    pub fn watching(&self, id: ClientId) -> Result<BTreeSet<ClientId>> {
        Ok(live(&self.clients.lock(), id)?.watching.clone())
    }

    pub fn transport(&self, id: ClientId) -> Result<Transport> {
        live(&self.clients.lock(), id)?
            .transport
            .clone()
            .ok_or(Error::UnknownClient(id))
    }

    /// Queue of a source; `None` for other roles
    pub fn queue(&self, id: ClientId) -> Result<Option<BoundedQueue<SampleBatch>>> {
        Ok(live(&self.clients.lock(), id)?.queue.clone())
    }

    /// Whether the client's worker thread is still running
    pub fn worker_running(&self, id: ClientId) -> Result<bool> {
        let clients = self.clients.lock();
        let record = live(&clients, id)?;
        Ok(record
            .worker
            .as_ref()
            .is_some_and(|worker| !worker.is_finished()))
    }

    /// Declare the client's role
    ///
    /// Re-declaring the current role is accepted. An Unassigned client may
    /// become Source or Subscriber once; any other change is rejected.
    /// Becoming a Source allocates the source queue.
    pub fn set_role(&self, id: ClientId, role: Role) -> Result<()> {
        let mut clients = self.clients.lock();
        let record = live_mut(&mut clients, id)?;
        if record.role == role {
            return Ok(());
        }
        if record.role != Role::Unassigned || role == Role::Unassigned {
            return Err(Error::Protocol(format!(
                "client #{} cannot switch role from {} to {}",
                id, record.role, role
            )));
        }
        record.role = role;
        if role == Role::Source {
            record.queue = Some(BoundedQueue::new(self.queue_capacity));
        }
        Ok(())
    }

    pub fn set_header(&self, id: ClientId, header: impl Into<String>) -> Result<()> {
        let mut clients = self.clients.lock();
        live_mut(&mut clients, id)?.header = header.into();
        Ok(())
    }

    /// Replace a subscriber's whole watch set
    ///
    /// Every target must be a live source.
    pub fn set_watching(&self, id: ClientId, value: BTreeSet<ClientId>) -> Result<()> {
        let mut clients = self.clients.lock();
        if let Some(bad) = value
            .iter()
            .find(|target| !clients.get(*target).is_some_and(ClientRecord::is_live_source))
        {
            return Err(Error::Protocol(format!("client #{} is not a source", bad)));
        }
        let record = live_mut(&mut clients, id)?;
        if record.role != Role::Subscriber && !value.is_empty() {
            return Err(Error::Protocol(format!("client #{} is not a subscriber", id)));
        }
        record.watching = value;
        self.watchers_changed.notify_all();
        Ok(())
    }

    /// Add the edge `subscriber -> source`
    pub fn watch(&self, subscriber: ClientId, source: ClientId) -> Result<()> {
        let mut clients = self.clients.lock();
        if !clients.get(&source).is_some_and(ClientRecord::is_live_source) {
            return Err(Error::Protocol(format!("client #{} is not a source", source)));
        }
        let record = live_mut(&mut clients, subscriber)?;
        if record.role != Role::Subscriber {
            return Err(Error::Protocol(format!(
                "client #{} is {}, only subscribers may watch",
                subscriber, record.role
            )));
        }
        record.watching.insert(source);
        self.watchers_changed.notify_all();
        Ok(())
    }

    /// Remove the edge `subscriber -> source`, which must exist
    pub fn unwatch(&self, subscriber: ClientId, source: ClientId) -> Result<()> {
        let mut clients = self.clients.lock();
        let record = live_mut(&mut clients, subscriber)?;
        if record.role != Role::Subscriber {
            return Err(Error::Protocol(format!(
                "client #{} is {}, only subscribers may unwatch",
                subscriber, record.role
            )));
        }
        if !record.watching.remove(&source) {
            return Err(Error::Protocol(format!(
                "client #{} is not watching #{}",
                subscriber, source
            )));
        }
        self.watchers_changed.notify_all();
        Ok(())
    }

    /// Live subscribers currently watching `source`
    pub fn watchers_of(&self, source: ClientId) -> BTreeSet<ClientId> {
        self.clients
            .lock()
            .iter()
            .filter(|(_, record)| record.is_live_subscriber() && record.watching.contains(&source))
            .map(|(&id, _)| id)
            .collect()
    }

    pub fn has_watchers(&self, source: ClientId) -> bool {
        has_watchers(&self.clients.lock(), source)
    }

    /// Block until `source` has a watcher or `timeout` elapses
    pub fn wait_for_watchers(&self, source: ClientId, timeout: Duration) -> bool {
        let mut clients = self.clients.lock();
        if !has_watchers(&clients, source) {
            self.watchers_changed
                .wait_while_for(&mut clients, |c| !has_watchers(c, source), timeout);
        }
        has_watchers(&clients, source)
    }

    /// Sockets of every live watcher of `source`
    pub fn delivery_targets(&self, source: ClientId) -> Vec<(ClientId, Arc<PeerSocket>)> {
        self.clients
            .lock()
            .iter()
            .filter(|(_, record)| record.is_live_subscriber() && record.watching.contains(&source))
            .filter_map(|(&id, record)| {
                record
                    .transport
                    .as_ref()
                    .and_then(Transport::socket)
                    .map(|socket| (id, Arc::clone(socket)))
            })
            .collect()
    }

    /// Queues of every live source, ordered by id
    pub fn source_queues(&self) -> Vec<(ClientId, BoundedQueue<SampleBatch>)> {
        self.clients
            .lock()
            .iter()
            .filter(|(_, record)| record.is_live_source())
            .filter_map(|(&id, record)| record.queue.clone().map(|queue| (id, queue)))
            .collect()
    }

    /// Void every record whose worker has finished
    ///
    /// Returns the ids voided by this call. Their edges are stripped from
    /// every other record and their sockets are shut down.
    pub fn reap_dead(&self) -> BTreeSet<ClientId> {
        let mut clients = self.clients.lock();
        let dead: BTreeSet<ClientId> = clients
            .iter()
            .filter(|(_, record)| {
                record
                    .worker
                    .as_ref()
                    .is_some_and(|worker| worker.is_finished())
            })
            .map(|(&id, _)| id)
            .collect();
        if dead.is_empty() {
            return dead;
        }

        for &id in &dead {
            log::info!("Client #{} found dead, cleaning up", id);
            if let Some(record) = clients.get_mut(&id) {
                let record = std::mem::take(record);
                if let Some(transport) = &record.transport {
                    transport.shutdown();
                }
                if let Some(worker) = record.worker
                    && worker.join().is_err()
                {
                    log::error!("Worker of client #{} panicked", id);
                }
            }
        }
        for record in clients.values_mut() {
            record.watching.retain(|id| !dead.contains(id));
        }
        self.watchers_changed.notify_all();
        dead
    }

    /// `(id, role)` of every live client, after reaping
    pub fn status_report(&self) -> Vec<(ClientId, Role)> {
        self.reap_dead();
        self.clients
            .lock()
            .iter()
            .filter(|(_, record)| record.is_live())
            .map(|(&id, record)| (id, record.role))
            .collect()
    }

    /// Take every worker and transport for the shutdown sequence
    ///
    /// Leaves all records voided.
    pub fn drain_for_shutdown(&self) -> Vec<Detached> {
        let mut clients = self.clients.lock();
        let detached: Vec<Detached> = clients
            .iter_mut()
            .filter(|(_, record)| record.is_live())
            .map(|(&id, record)| {
                let record = std::mem::take(record);
                Detached {
                    id,
                    worker: record.worker,
                    transport: record.transport,
                }
            })
            .collect();
        self.watchers_changed.notify_all();
        detached
    }

    /// Number of records ever created, live or voided
    pub fn len(&self) -> usize {
        self.clients.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.lock().is_empty()
    }
}
