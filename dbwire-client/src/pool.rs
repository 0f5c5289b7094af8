//! Connection pools.
//!
//! [`HostPool`] keeps the connections to one host and hands out leases on
//! them, picking the least-loaded connection. [`ClusterPool`] maps every
//! known host to its pool, selects a host per request and applies topology
//! changes: pools of removed hosts stop serving new acquisitions and are torn
//! down once their last request has finished.

use crate::balancer::HostSelector;
use crate::config::CommunicationConfig;
use crate::connection::Connection;
use crate::error::CommError;
use dbwire_protocol::{HostDescription, Request, Response};
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

#[derive(Default)]
struct PoolState {
    connections: Vec<Arc<Connection>>,
    /// Shared connections being opened, counted against the per-host cap.
    opening: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Purpose {
    Lease,
    Reserve,
}

enum Slot {
    Ready(Arc<Connection>),
    Open,
    Wait,
}

/// Connections to one host.
pub struct HostPool {
    host: HostDescription,
    config: Arc<CommunicationConfig>,
    state: Mutex<PoolState>,
    /// Signalled whenever capacity may have been freed.
    released: Notify,
    draining: AtomicBool,
    closed: AtomicBool,
}

impl HostPool {
    pub fn new(host: HostDescription, config: Arc<CommunicationConfig>) -> Self {
        Self {
            host,
            config,
            state: Mutex::new(PoolState::default()),
            released: Notify::new(),
            draining: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    pub fn host(&self) -> &HostDescription {
        &self.host
    }

    /// Leases the least-loaded connection, opening one if all are busy and
    /// the per-host cap allows. Waits for a release up to the acquire
    /// timeout, then fails with `PoolExhausted`.
    pub async fn acquire(self: &Arc<Self>) -> Result<Lease, CommError> {
        let conn = self.obtain(Purpose::Lease).await?;
        Ok(Lease {
            conn,
            pool: Arc::clone(self),
        })
    }

    /// Takes a connection out of normal selection for a conversation.
    ///
    /// An idle connection is reused; otherwise a dedicated one is opened.
    /// Reserved connections do not count against the per-host cap, so
    /// conversations never starve pooled requests.
    pub async fn reserve(&self) -> Result<Arc<Connection>, CommError> {
        self.obtain(Purpose::Reserve).await
    }

    /// Returns a reserved connection to general use, or discards it if it
    /// failed in the meantime.
    pub fn release_reserved(&self, conn: &Arc<Connection>) {
        {
            let mut state = self.state.lock();
            if conn.is_usable() && !self.closed.load(Ordering::Acquire) {
                conn.set_reserved(false);
            } else {
                tracing::debug!(
                    "Discarding connection #{} to {} after conversation",
                    conn.id(),
                    self.host
                );
                state.connections.retain(|c| !Arc::ptr_eq(c, conn));
                conn.close();
            }
        }
        self.released.notify_waiters();
    }

    /// Closes idle connections unused for at least `ttl`, plus any failed
    /// ones. Returns how many were closed.
    pub fn close_idle(&self, ttl: Duration) -> usize {
        let mut state = self.state.lock();
        let before = state.connections.len();
        state.connections.retain(|conn| {
            let expired = !conn.is_usable() || (conn.is_idle() && conn.idle_for() >= ttl);
            if expired {
                conn.close();
            }
            !expired
        });
        let closed = before - state.connections.len();
        if closed > 0 {
            tracing::debug!("Closed {} idle connections to {}", closed, self.host);
        }
        closed
    }

    /// Stops new acquisitions; requests already in flight finish normally.
    pub fn drain(&self) {
        if !self.draining.swap(true, Ordering::AcqRel) {
            tracing::info!("Draining connection pool for {}", self.host);
        }
        self.released.notify_waiters();
    }

    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::Acquire)
    }

    /// Returns whether no connection carries a lease, request or conversation.
    pub fn is_drained(&self) -> bool {
        self.state.lock().connections.iter().all(|c| c.is_idle())
    }

    /// Closes every connection. Outstanding requests fail with
    /// `ConnectionClosed`.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        let connections = std::mem::take(&mut self.state.lock().connections);
        for conn in &connections {
            conn.close();
        }
        if !connections.is_empty() {
            tracing::debug!(
                "Closed {} connections to {}",
                connections.len(),
                self.host
            );
        }
        self.released.notify_waiters();
    }

    pub fn connection_count(&self) -> usize {
        self.state.lock().connections.len()
    }

    /// Leases held across all connections.
    pub fn leases(&self) -> usize {
        self.state.lock().connections.iter().map(|c| c.leases()).sum()
    }

    async fn obtain(&self, purpose: Purpose) -> Result<Arc<Connection>, CommError> {
        let timeout = self.config.acquire_timeout();
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            self.check_accepting()?;

            // Registered before inspecting the pool so no release is missed
            let notified = self.released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.take_slot(purpose) {
                Slot::Ready(conn) => return Ok(conn),
                Slot::Open => {
                    // The acquire timeout bounds the whole acquisition,
                    // including connection setup
                    return match tokio::time::timeout_at(deadline, self.open_connection(purpose))
                        .await
                    {
                        Ok(result) => result,
                        Err(_) => {
                            tracing::debug!(
                                "Opening a connection to {} exceeded {:?}",
                                self.host,
                                timeout
                            );
                            Err(CommError::PoolExhausted {
                                host: self.host.clone(),
                                timeout,
                            })
                        }
                    };
                }
                Slot::Wait => {}
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                tracing::debug!("No connection to {} freed within {:?}", self.host, timeout);
                return Err(CommError::PoolExhausted {
                    host: self.host.clone(),
                    timeout,
                });
            }
        }
    }

    fn check_accepting(&self) -> Result<(), CommError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(CommError::Closed);
        }
        if self.draining.load(Ordering::Acquire) {
            return Err(CommError::HostDraining(self.host.clone()));
        }
        Ok(())
    }

    fn take_slot(&self, purpose: Purpose) -> Slot {
        let mut state = self.state.lock();
        state.connections.retain(|conn| {
            let usable = conn.is_usable();
            if !usable {
                tracing::debug!(
                    "Discarding failed connection #{} to {}",
                    conn.id(),
                    self.host
                );
                conn.close();
            }
            usable
        });

        let max_in_flight = self.config.max_in_flight();
        let candidate = match purpose {
            Purpose::Lease => state
                .connections
                .iter()
                .filter(|c| !c.is_reserved() && c.leases() < max_in_flight)
                .min_by_key(|c| c.leases()),
            Purpose::Reserve => state.connections.iter().find(|c| c.is_idle()),
        };

        if let Some(conn) = candidate {
            let conn = Arc::clone(conn);
            mark(&conn, purpose);
            return Slot::Ready(conn);
        }

        if purpose == Purpose::Reserve {
            return Slot::Open;
        }

        let shared = state.connections.iter().filter(|c| !c.is_reserved()).count();
        if shared + state.opening < self.config.max_connections_per_host() {
            state.opening += 1;
            return Slot::Open;
        }
        Slot::Wait
    }

    async fn open_connection(&self, purpose: Purpose) -> Result<Arc<Connection>, CommError> {
        let mut slot = OpeningSlot {
            pool: self,
            armed: purpose == Purpose::Lease,
        };
        let conn = Arc::new(Connection::open(self.host.clone(), &self.config).await?);
        mark(&conn, purpose);

        let total = {
            let mut state = self.state.lock();
            if slot.armed {
                state.opening -= 1;
                slot.armed = false;
            }
            if self.closed.load(Ordering::Acquire) {
                conn.close();
                return Err(CommError::Closed);
            }
            state.connections.push(Arc::clone(&conn));
            state.connections.len()
        };
        tracing::debug!(
            "Opened connection #{} to {} ({} in pool)",
            conn.id(),
            self.host,
            total
        );
        Ok(conn)
    }
}

impl std::fmt::Debug for HostPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostPool")
            .field("host", &self.host)
            .field("connections", &self.connection_count())
            .field("draining", &self.is_draining())
            .finish()
    }
}

fn mark(conn: &Connection, purpose: Purpose) {
    match purpose {
        Purpose::Lease => conn.add_lease(),
        Purpose::Reserve => conn.set_reserved(true),
    }
}

/// Releases the cap slot of a shared connection whose opening failed or was
/// cancelled.
struct OpeningSlot<'a> {
    pool: &'a HostPool,
    armed: bool,
}

impl Drop for OpeningSlot<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.pool.state.lock().opening -= 1;
            self.pool.released.notify_waiters();
        }
    }
}

/// Use of one pooled connection for the duration of a request.
pub struct Lease {
    conn: Arc<Connection>,
    pool: Arc<HostPool>,
}

impl Lease {
    pub fn connection(&self) -> &Arc<Connection> {
        &self.conn
    }

    pub fn host(&self) -> &HostDescription {
        self.pool.host()
    }

    pub async fn send(&self, request: &Request) -> Result<Response, CommError> {
        self.conn.send(request).await
    }
}

impl std::fmt::Debug for Lease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lease")
            .field("connection", &self.conn.id())
            .field("host", self.pool.host())
            .finish()
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.conn.remove_lease();
        self.pool.released.notify_waiters();
    }
}

/// Hosts added and removed by a topology update.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TopologyChange {
    pub added: Vec<HostDescription>,
    pub removed: Vec<HostDescription>,
}

impl TopologyChange {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// Pools of every known host.
pub struct ClusterPool {
    config: Arc<CommunicationConfig>,
    selector: HostSelector,
    /// In topology order, one pool per host.
    pools: RwLock<Vec<Arc<HostPool>>>,
    draining: Mutex<Vec<Arc<HostPool>>>,
}

impl ClusterPool {
    pub fn new(config: Arc<CommunicationConfig>) -> Self {
        let pools = config
            .hosts()
            .iter()
            .map(|host| Arc::new(HostPool::new(host.clone(), Arc::clone(&config))))
            .collect();
        Self {
            selector: HostSelector::new(config.load_balancing()),
            config,
            pools: RwLock::new(pools),
            draining: Mutex::new(Vec::new()),
        }
    }

    /// Hosts currently in the topology.
    pub fn hosts(&self) -> Vec<HostDescription> {
        self.pools.read().iter().map(|p| p.host().clone()).collect()
    }

    /// Hosts removed from the topology whose pools still have work.
    pub fn draining_hosts(&self) -> Vec<HostDescription> {
        self.draining.lock().iter().map(|p| p.host().clone()).collect()
    }

    pub fn pool(&self, host: &HostDescription) -> Option<Arc<HostPool>> {
        self.pools.read().iter().find(|p| p.host() == host).cloned()
    }

    /// Picks the pool for the next request per the load balancing strategy.
    pub fn select(&self) -> Result<Arc<HostPool>, CommError> {
        let pools = self.pools.read();
        let hosts: Vec<HostDescription> = pools.iter().map(|p| p.host().clone()).collect();
        let host = self.selector.select(&hosts).ok_or(CommError::NoHosts)?;
        pools
            .iter()
            .find(|p| p.host() == &host)
            .cloned()
            .ok_or(CommError::NoHosts)
    }

    pub async fn acquire(&self) -> Result<Lease, CommError> {
        self.select()?.acquire().await
    }

    /// Reserves a connection on the selected host for a conversation.
    pub async fn reserve(&self) -> Result<(Arc<HostPool>, Arc<Connection>), CommError> {
        let pool = self.select()?;
        let conn = pool.reserve().await?;
        Ok((pool, conn))
    }

    /// Replaces the known hosts with `hosts`. An empty list leaves the
    /// topology untouched.
    pub fn apply_topology(&self, hosts: &[HostDescription]) -> TopologyChange {
        let mut unique: Vec<&HostDescription> = Vec::with_capacity(hosts.len());
        for host in hosts {
            if !unique.contains(&host) {
                unique.push(host);
            }
        }
        if unique.is_empty() {
            return TopologyChange::default();
        }

        let mut change = TopologyChange::default();
        let removed: Vec<Arc<HostPool>> = {
            let mut pools = self.pools.write();
            let next: Vec<Arc<HostPool>> = unique
                .into_iter()
                .map(|host| match pools.iter().find(|p| p.host() == host) {
                    Some(pool) => Arc::clone(pool),
                    None => {
                        change.added.push(host.clone());
                        Arc::new(HostPool::new(host.clone(), Arc::clone(&self.config)))
                    }
                })
                .collect();
            let removed = pools
                .iter()
                .filter(|p| !next.iter().any(|n| Arc::ptr_eq(n, p)))
                .cloned()
                .collect();
            *pools = next;
            removed
        };

        for pool in removed {
            pool.drain();
            change.removed.push(pool.host().clone());
            self.draining.lock().push(pool);
        }

        if !change.is_empty() {
            tracing::info!(
                "Topology updated: {} added, {} removed",
                change.added.len(),
                change.removed.len()
            );
        }
        change
    }

    /// Closes idle connections and tears down draining pools that finished
    /// their work. Returns how many connections were closed.
    pub fn sweep(&self, idle_ttl: Duration) -> usize {
        let pools: Vec<Arc<HostPool>> = self.pools.read().clone();
        let mut closed: usize = pools.iter().map(|p| p.close_idle(idle_ttl)).sum();

        self.draining.lock().retain(|pool| {
            closed += pool.close_idle(Duration::ZERO);
            if pool.is_drained() {
                pool.close();
                tracing::info!("Closed drained pool for {}", pool.host());
                false
            } else {
                true
            }
        });
        closed
    }

    /// Closes every pool, active or draining.
    pub fn close(&self) {
        let pools = std::mem::take(&mut *self.pools.write());
        let draining = std::mem::take(&mut *self.draining.lock());
        for pool in pools.iter().chain(draining.iter()) {
            pool.close();
        }
    }
}
