//! Conversations: session affinity between an execution context and one
//! connection.
//!
//! An [`ExecutionContext`] is an opaque token identifying a logical caller.
//! While a context holds a [`Conversation`], its connection is reserved and
//! excluded from normal pool selection. Only the creating context may close
//! the conversation; dropping it releases the connection as well.

use crate::connection::Connection;
use crate::error::CommError;
use crate::pool::{ClusterPool, HostPool};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use dbwire_protocol::{HostDescription, Request, Response};
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use uuid::Uuid;

tokio::task_local! {
    static CURRENT_CONTEXT: ExecutionContext;
}

/// Identity of a logical caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ExecutionContext(Uuid);

impl ExecutionContext {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn id(&self) -> Uuid {
        self.0
    }

    /// Runs `future` with this context as the task-local current context.
    pub async fn scope<F: Future>(self, future: F) -> F::Output {
        CURRENT_CONTEXT.scope(self, future).await
    }

    /// The context installed by an enclosing [`ExecutionContext::scope`].
    pub fn current() -> Option<Self> {
        CURRENT_CONTEXT.try_with(|ctx| *ctx).ok()
    }
}

impl Default for ExecutionContext {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ExecutionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

enum Binding {
    /// A connection is being reserved.
    Pending,
    Active(Arc<ConversationState>),
}

type Registry = DashMap<ExecutionContext, Binding>;

struct ConversationState {
    owner: ExecutionContext,
    pool: Arc<HostPool>,
    connection: Arc<Connection>,
    open: AtomicBool,
}

impl ConversationState {
    /// Releases the connection exactly once. Returns whether this call did it.
    fn release(&self, registry: &Registry) -> bool {
        if !self.open.swap(false, Ordering::AcqRel) {
            return false;
        }
        registry.remove_if(&self.owner, |_, binding| {
            matches!(binding, Binding::Active(state) if std::ptr::eq(Arc::as_ptr(state), self))
        });
        self.pool.release_reserved(&self.connection);
        tracing::debug!(
            "Conversation for context {} released connection #{}",
            self.owner,
            self.connection.id()
        );
        true
    }
}

/// Removes a pending binding if reservation fails or is cancelled.
struct PendingBinding<'a> {
    registry: &'a Registry,
    context: ExecutionContext,
    armed: bool,
}

impl Drop for PendingBinding<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.registry
                .remove_if(&self.context, |_, binding| matches!(binding, Binding::Pending));
        }
    }
}

/// Tracks which execution contexts hold a conversation.
pub struct ConversationManager {
    cluster: Arc<ClusterPool>,
    registry: Arc<Registry>,
}

impl ConversationManager {
    pub fn new(cluster: Arc<ClusterPool>) -> Self {
        Self {
            cluster,
            registry: Arc::new(DashMap::new()),
        }
    }

    /// Binds `ctx` to a connection on the host picked by the load balancer.
    ///
    /// Fails with `ConversationAlreadyActive` if `ctx` already holds one.
    pub async fn require_conversation(
        &self,
        ctx: &ExecutionContext,
    ) -> Result<Conversation, CommError> {
        match self.registry.entry(*ctx) {
            Entry::Occupied(_) => return Err(CommError::ConversationAlreadyActive(ctx.id())),
            Entry::Vacant(slot) => {
                slot.insert(Binding::Pending);
            }
        }
        let mut pending = PendingBinding {
            registry: &self.registry,
            context: *ctx,
            armed: true,
        };

        let (pool, connection) = self.cluster.reserve().await?;
        tracing::debug!(
            "Conversation for context {} bound to connection #{} on {}",
            ctx,
            connection.id(),
            pool.host()
        );

        let state = Arc::new(ConversationState {
            owner: *ctx,
            pool,
            connection,
            open: AtomicBool::new(true),
        });
        self.registry
            .insert(*ctx, Binding::Active(Arc::clone(&state)));
        pending.armed = false;

        Ok(Conversation {
            state,
            registry: Arc::clone(&self.registry),
        })
    }

    /// Returns whether `ctx` holds (or is acquiring) a conversation.
    pub fn is_active(&self, ctx: &ExecutionContext) -> bool {
        self.registry.contains_key(ctx)
    }

    pub fn active_count(&self) -> usize {
        self.registry
            .iter()
            .filter(|entry| matches!(entry.value(), Binding::Active(_)))
            .count()
    }

    /// Connection bound to `ctx`, if it holds an open conversation.
    pub(crate) fn connection_for(&self, ctx: &ExecutionContext) -> Option<Arc<Connection>> {
        match self.registry.get(ctx)?.value() {
            Binding::Active(state) => Some(Arc::clone(&state.connection)),
            Binding::Pending => None,
        }
    }

    /// Releases every open conversation. Returns how many were released.
    pub fn close_all(&self) -> usize {
        let states: Vec<Arc<ConversationState>> = self
            .registry
            .iter()
            .filter_map(|entry| match entry.value() {
                Binding::Active(state) => Some(Arc::clone(state)),
                Binding::Pending => None,
            })
            .collect();
        states
            .iter()
            .filter(|state| state.release(&self.registry))
            .count()
    }
}

/// An exclusive binding of one execution context to one connection.
pub struct Conversation {
    state: Arc<ConversationState>,
    registry: Arc<Registry>,
}

impl Conversation {
    pub fn context(&self) -> ExecutionContext {
        self.state.owner
    }

    pub fn host(&self) -> &HostDescription {
        self.state.pool.host()
    }

    pub fn is_open(&self) -> bool {
        self.state.open.load(Ordering::Acquire)
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.state.connection
    }

    /// Sends a request on the bound connection.
    pub async fn execute(&self, request: &Request) -> Result<Response, CommError> {
        if !self.is_open() {
            return Err(CommError::ConversationClosed);
        }
        self.state.connection.send(request).await
    }

    /// Closes the conversation on behalf of `ctx`.
    ///
    /// A context other than the creator gets `ConcurrentModification` and the
    /// conversation stays open. Closing twice is a no-op.
    pub fn close(&self, ctx: &ExecutionContext) -> Result<(), CommError> {
        if *ctx != self.state.owner {
            return Err(CommError::ConcurrentModification);
        }
        self.state.release(&self.registry);
        Ok(())
    }

    /// Closes on behalf of the task-local current context.
    pub fn close_current(&self) -> Result<(), CommError> {
        let ctx = ExecutionContext::current().ok_or(CommError::ConcurrentModification)?;
        self.close(&ctx)
    }
}

impl Drop for Conversation {
    fn drop(&mut self) {
        self.state.release(&self.registry);
    }
}

impl fmt::Debug for Conversation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Conversation")
            .field("context", &self.state.owner)
            .field("connection", &self.state.connection.id())
            .field("open", &self.is_open())
            .finish()
    }
}
