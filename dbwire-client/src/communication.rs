//! The communication façade.
//!
//! [`Communication`] is the single entry point used by higher level APIs. It
//! owns the cluster pools, the conversation manager and a background
//! maintenance task that sweeps idle connections and, when enabled, refreshes
//! the cluster topology.

use crate::config::CommunicationConfig;
use crate::conversation::{Conversation, ConversationManager, ExecutionContext};
use crate::error::CommError;
use crate::pool::{ClusterPool, TopologyChange};
use crate::topology;
use dbwire_protocol::{
    ContentCodec, ContentSerde, HostDescription, Request, Response, ACCEPT_HEADER,
    CONTENT_TYPE_HEADER,
};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, Notify};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};

/// Lower bound for the idle sweep period.
const MIN_SWEEP_PERIOD: Duration = Duration::from_secs(1);

struct Inner {
    config: Arc<CommunicationConfig>,
    codec: ContentSerde,
    cluster: Arc<ClusterPool>,
    conversations: ConversationManager,
    in_flight: AtomicUsize,
    idle: Notify,
    closed: AtomicBool,
    shutdown: broadcast::Sender<()>,
    maintenance: Mutex<Option<JoinHandle<()>>>,
}

impl Inner {
    /// Registers a request against the façade, failing once closed.
    fn begin(&self) -> Result<InFlight<'_>, CommError> {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        let guard = InFlight { inner: self };
        if self.closed.load(Ordering::SeqCst) {
            return Err(CommError::Closed);
        }
        Ok(guard)
    }

    async fn refresh_topology(&self) -> Result<TopologyChange, CommError> {
        let hosts = topology::fetch_endpoints(&self.cluster, &self.config, &self.codec).await?;
        Ok(self.cluster.apply_topology(&hosts))
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(handle) = self.maintenance.lock().take() {
            handle.abort();
        }
    }
}

struct InFlight<'a> {
    inner: &'a Inner,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if self.inner.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.inner.idle.notify_waiters();
        }
    }
}

/// Handle to a multi-host database cluster. Cheap to clone.
#[derive(Clone)]
pub struct Communication {
    inner: Arc<Inner>,
}

impl Communication {
    /// Builds the pools for the configured hosts and starts maintenance.
    ///
    /// With host list refresh enabled, the topology is fetched once before
    /// returning. A failed initial fetch is logged and the configured hosts
    /// stay in use.
    pub async fn connect(config: CommunicationConfig) -> Result<Self, CommError> {
        let config = Arc::new(config);
        let cluster = Arc::new(ClusterPool::new(Arc::clone(&config)));
        let (shutdown, _) = broadcast::channel(1);

        let inner = Arc::new(Inner {
            codec: ContentSerde::new(config.content_type()),
            conversations: ConversationManager::new(Arc::clone(&cluster)),
            cluster,
            config: Arc::clone(&config),
            in_flight: AtomicUsize::new(0),
            idle: Notify::new(),
            closed: AtomicBool::new(false),
            shutdown,
            maintenance: Mutex::new(None),
        });

        if config.refresh_host_list() {
            if let Err(e) = inner.refresh_topology().await {
                tracing::warn!("Initial topology refresh failed: {}", e);
            }
        }

        let sweep_period = (config.idle_ttl() / 2).max(MIN_SWEEP_PERIOD);
        let refresh_period = config
            .refresh_host_list()
            .then(|| config.host_list_refresh_interval());
        let handle = tokio::spawn(maintenance(
            Arc::downgrade(&inner),
            inner.shutdown.subscribe(),
            sweep_period,
            refresh_period,
        ));
        *inner.maintenance.lock() = Some(handle);

        tracing::info!(
            "Communication started with {} host(s), load balancing {}",
            inner.cluster.hosts().len(),
            config.load_balancing()
        );
        Ok(Self { inner })
    }

    /// Sends a request through the pool and waits for its response.
    pub async fn execute(&self, request: Request) -> Result<Response, CommError> {
        let _guard = self.inner.begin()?;
        let request = self.prepare(request);
        let lease = self.inner.cluster.acquire().await?;
        tracing::debug!(
            "Dispatching {} {} to {}",
            request.method,
            request.path,
            lease.host()
        );
        lease.send(&request).await
    }

    /// Executes a request and decodes a successful body as `T`.
    pub async fn execute_as<T: DeserializeOwned>(&self, request: Request) -> Result<T, CommError> {
        let response = self.execute(request).await?;
        if !response.is_success() {
            return Err(CommError::UnexpectedStatus(response.status));
        }
        Ok(self.inner.codec.deserialize(&response.body)?)
    }

    /// Sends a request on the connection bound to `conversation`.
    pub async fn execute_in(
        &self,
        conversation: &Conversation,
        request: Request,
    ) -> Result<Response, CommError> {
        let _guard = self.inner.begin()?;
        conversation.execute(&self.prepare(request)).await
    }

    /// Uses the conversation held by `ctx` if there is one, the pool otherwise.
    pub async fn execute_in_context(
        &self,
        ctx: &ExecutionContext,
        request: Request,
    ) -> Result<Response, CommError> {
        match self.inner.conversations.connection_for(ctx) {
            Some(connection) => {
                let _guard = self.inner.begin()?;
                connection.send(&self.prepare(request)).await
            }
            None => self.execute(request).await,
        }
    }

    /// Fetches cluster members now and applies the difference.
    ///
    /// On failure the previous hosts stay in place.
    pub async fn refresh_topology(&self) -> Result<TopologyChange, CommError> {
        let _guard = self.inner.begin()?;
        self.inner.refresh_topology().await
    }

    pub fn host_descriptions(&self) -> Vec<HostDescription> {
        self.inner.cluster.hosts()
    }

    pub fn conversation_manager(&self) -> &ConversationManager {
        &self.inner.conversations
    }

    pub fn codec(&self) -> &ContentSerde {
        &self.inner.codec
    }

    pub fn config(&self) -> &CommunicationConfig {
        &self.inner.config
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Shuts down.
    ///
    /// Stops maintenance, releases open conversations, waits up to the
    /// acquire timeout for in-flight requests and closes every pool. Calling
    /// it again does nothing.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        let _ = self.inner.shutdown.send(());
        if let Some(handle) = self.inner.maintenance.lock().take() {
            handle.abort();
        }

        let released = self.inner.conversations.close_all();
        if released > 0 {
            tracing::debug!("Released {} open conversation(s)", released);
        }

        let deadline = Instant::now() + self.inner.config.acquire_timeout();
        loop {
            let notified = self.inner.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let pending = self.inner.in_flight.load(Ordering::SeqCst);
            if pending == 0 {
                break;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                tracing::warn!("Closing with {} request(s) still in flight", pending);
                break;
            }
        }

        self.inner.cluster.close();
        tracing::info!("Communication closed");
    }

    /// Fills in content negotiation headers the caller left unset.
    fn prepare(&self, mut request: Request) -> Request {
        let identifier = self.inner.codec.content_type().identifier();
        request
            .headers
            .entry(CONTENT_TYPE_HEADER.to_string())
            .or_insert_with(|| identifier.to_string());
        request
            .headers
            .entry(ACCEPT_HEADER.to_string())
            .or_insert_with(|| identifier.to_string());
        request
    }
}

impl std::fmt::Debug for Communication {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Communication")
            .field("hosts", &self.inner.cluster.hosts())
            .field("in_flight", &self.inner.in_flight.load(Ordering::Relaxed))
            .field("closed", &self.is_closed())
            .finish()
    }
}

fn ticker(period: Duration) -> Interval {
    let mut interval = interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

/// Background loop: idle sweeps and periodic topology refresh.
///
/// Holds only a weak reference, so it ends once the façade is dropped.
async fn maintenance(
    inner: Weak<Inner>,
    mut shutdown: broadcast::Receiver<()>,
    sweep_period: Duration,
    refresh_period: Option<Duration>,
) {
    let mut sweep = ticker(sweep_period);
    let mut refresh = refresh_period.map(ticker);

    loop {
        tokio::select! {
            _ = shutdown.recv() => break,
            _ = sweep.tick() => {
                let Some(inner) = inner.upgrade() else { break };
                let closed = inner.cluster.sweep(inner.config.idle_ttl());
                if closed > 0 {
                    tracing::debug!("Closed {} idle connection(s)", closed);
                }
            }
            _ = async {
                match refresh.as_mut() {
                    Some(interval) => {
                        interval.tick().await;
                    }
                    None => std::future::pending::<()>().await,
                }
            } => {
                let Some(inner) = inner.upgrade() else { break };
                if let Err(e) = inner.refresh_topology().await {
                    tracing::warn!("Topology refresh failed, keeping known hosts: {}", e);
                }
            }
        }
    }

    tracing::debug!("Maintenance task stopped");
}
