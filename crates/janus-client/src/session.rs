//! Session controller.
//!
//! A [`Session`] owns the gateway-assigned session id, the active transport and
//! the handles attached through it. One dispatch task per transport drains the
//! [`TransportEvent`] stream: replies resolve pending transactions, everything
//! else is routed to the handle named by its `sender`. Transports are tagged
//! with an epoch so events from a transport that was replaced (failover,
//! reconnect, destroy) are ignored.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::callbacks::{HandleCallbacks, SessionHandlers};
use crate::config::SessionConfig;
use crate::error::{ErrorCategory, JanusError, JanusResult};
use crate::handle::{Handle, HandleInner};
use crate::protocol::{HandleId, Request, RequestKind, ServerMessage, SessionId};
use crate::registry::SessionRegistry;
use crate::transaction::{transaction_id, PendingTransaction, TransactionRegistry};
use crate::transport::{
    CloseReason, Connector, DefaultConnector, Transport, TransportEvent, TransportEvents,
    TransportKind,
};
use crate::webrtc::{MediaCapture, WebRtcEngine};

/// How [`Session::destroy`] tears the session down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DestroyOptions {
    /// Release every local handle first, without sending `detach` for any of them.
    /// When false the handles stay registered with their peer connections open,
    /// and every call on them fails until a later `reconnect`.
    pub cleanup_handles: bool,
    /// Invoke `on_destroyed` once local teardown is done, whatever the request outcome.
    pub notify_destroyed: bool,
    /// Wait for the gateway's reply. When false the request is sent and not awaited.
    pub async_request: bool,
}

impl Default for DestroyOptions {
    fn default() -> Self {
        Self {
            cleanup_handles: false,
            notify_destroyed: true,
            async_request: true,
        }
    }
}

/// Parameters for [`Session::attach`].
#[derive(Debug, Clone)]
pub struct AttachOptions {
    pub plugin: String,
    pub opaque_id: Option<String>,
    /// Token for handle-scoped requests; falls back to the session token.
    pub token: Option<String>,
    pub callbacks: HandleCallbacks,
}

impl AttachOptions {
    pub fn new(plugin: impl Into<String>) -> Self {
        Self {
            plugin: plugin.into(),
            opaque_id: None,
            token: None,
            callbacks: HandleCallbacks::default(),
        }
    }

    pub fn opaque_id(mut self, opaque_id: impl Into<String>) -> Self {
        self.opaque_id = Some(opaque_id.into());
        self
    }

    pub fn token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn callbacks(mut self, callbacks: HandleCallbacks) -> Self {
        self.callbacks = callbacks;
        self
    }
}

pub struct SessionBuilder {
    config: SessionConfig,
    connector: Arc<dyn Connector>,
    engine: Option<Arc<dyn WebRtcEngine>>,
    capture: Option<Arc<dyn MediaCapture>>,
    handlers: SessionHandlers,
    registry: Option<Arc<SessionRegistry>>,
}

impl SessionBuilder {
    pub fn connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = connector;
        self
    }

    pub fn engine(mut self, engine: Arc<dyn WebRtcEngine>) -> Self {
        self.engine = Some(engine);
        self
    }

    pub fn capture(mut self, capture: Arc<dyn MediaCapture>) -> Self {
        self.capture = Some(capture);
        self
    }

    pub fn handlers(mut self, handlers: SessionHandlers) -> Self {
        self.handlers = handlers;
        self
    }

    pub fn registry(mut self, registry: Arc<SessionRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Creates the session, trying each configured server in order.
    pub async fn connect(self) -> JanusResult<Session> {
        self.config.validate()?;
        let inner = Arc::new(SessionInner {
            config: self.config,
            connector: self.connector,
            engine: self.engine,
            capture: self.capture,
            handlers: self.handlers,
            registry: self.registry,
            transactions: TransactionRegistry::new(),
            state: Mutex::new(SessionState::default()),
            handles: Mutex::new(HashMap::new()),
        });
        inner.establish().await?;
        Ok(Session { inner })
    }
}

/// A client session with one gateway.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.inner.fmt(f)
    }
}

impl Session {
    pub fn builder(config: SessionConfig) -> SessionBuilder {
        SessionBuilder {
            config,
            connector: Arc::new(DefaultConnector),
            engine: None,
            capture: None,
            handlers: SessionHandlers::default(),
            registry: None,
        }
    }

    /// Connects with the default transports and no media collaborators.
    pub async fn connect(config: SessionConfig) -> JanusResult<Session> {
        Session::builder(config).connect().await
    }

    pub(crate) fn from_inner(inner: Arc<SessionInner>) -> Self {
        Self { inner }
    }

    pub fn session_id(&self) -> Option<SessionId> {
        self.inner.state.lock().session_id
    }

    /// Server the session is (or was last) connected to.
    pub fn server(&self) -> Option<String> {
        self.inner.state.lock().server.clone()
    }

    pub fn is_connected(&self) -> bool {
        self.inner.is_connected()
    }

    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    pub fn handle(&self, handle_id: HandleId) -> Option<Handle> {
        self.inner
            .handles
            .lock()
            .get(&handle_id)
            .cloned()
            .map(Handle::from_inner)
    }

    pub fn handle_ids(&self) -> Vec<HandleId> {
        let mut ids: Vec<HandleId> = self.inner.handles.lock().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Re-establishes the session on the current server with a `claim`,
    /// keeping the session id and the plugin state the gateway holds for it.
    pub async fn reconnect(&self) -> JanusResult<()> {
        let inner = &self.inner;
        let (session_id, index, server, previous) = {
            let mut state = inner.state.lock();
            let session_id = state
                .session_id
                .ok_or_else(|| JanusError::State("no session to reclaim".into()))?;
            let server = state
                .server
                .clone()
                .ok_or_else(|| JanusError::State("no server to reclaim the session on".into()))?;
            state.connected = false;
            state.stop_tasks();
            (session_id, state.server_index, server, state.transport.take())
        };
        inner.transactions.clear();
        if let Some(previous) = previous {
            previous.close(None).await;
        }
        info!(session_id, server = %server, "reclaiming session");
        inner.attempt(index, &server, Some(session_id)).await
    }

    /// Destroys the session on the gateway and tears it down locally.
    ///
    /// Local state is reset even when the request fails. Calling this on a
    /// session that was already destroyed is a no-op and does not invoke
    /// `on_destroyed` a second time.
    pub async fn destroy(&self, options: DestroyOptions) -> JanusResult<()> {
        let inner = &self.inner;
        let Some(session_id) = inner.state.lock().session_id else {
            debug!("no active session to destroy");
            return Ok(());
        };

        if options.cleanup_handles {
            let handles: Vec<Arc<HandleInner>> = inner.handles.lock().values().cloned().collect();
            for handle in handles {
                handle.cleanup_webrtc(false).await;
                handle.release();
            }
        }

        if inner.is_connected() {
            let token = inner.config.token.clone();
            let result = if options.async_request {
                inner
                    .request(RequestKind::Destroy, None, token.as_deref(), |request| request)
                    .await
                    .map(|_| ())
            } else {
                inner
                    .post(RequestKind::Destroy, token.as_deref(), |request| request)
                    .await
            };
            if let Err(err) = result {
                warn!(session_id, error = %err, "destroy request failed, tearing down locally");
            }
        } else {
            warn!(session_id, "session is not connected, tearing down locally");
        }

        inner.teardown(session_id).await;
        info!(session_id, "session destroyed");
        if options.notify_destroyed {
            (inner.handlers.on_destroyed)(());
        }
        Ok(())
    }

    /// Attaches a handle to `options.plugin`.
    pub async fn attach(&self, options: AttachOptions) -> JanusResult<Handle> {
        let inner = &self.inner;
        if !inner.is_connected() {
            return Err(JanusError::not_connected());
        }
        if options.plugin.trim().is_empty() {
            return Err(JanusError::Config("invalid plugin".into()));
        }

        let token = options.token.clone().or_else(|| inner.config.token.clone());
        let reply = inner
            .request(RequestKind::Attach, None, token.as_deref(), |request| {
                request.plugin(options.plugin.clone(), options.opaque_id.clone())
            })
            .await?;
        let handle_id = reply
            .data_id()
            .ok_or_else(|| JanusError::Transport("attach reply carried no handle id".into()))?;

        let handle = HandleInner::spawn(handle_id, options, token, Arc::downgrade(inner));
        inner.handles.lock().insert(handle_id, handle.clone());
        info!(
            session_id = ?self.session_id(),
            handle_id,
            plugin = handle.plugin(),
            "plugin attached"
        );
        Ok(Handle::from_inner(handle))
    }
}

#[derive(Default)]
struct SessionState {
    session_id: Option<SessionId>,
    connected: bool,
    server_index: usize,
    server: Option<String>,
    transport: Option<Arc<dyn Transport>>,
    epoch: u64,
    dispatch: Option<JoinHandle<()>>,
    keepalive: Option<JoinHandle<()>>,
}

impl SessionState {
    fn stop_tasks(&mut self) {
        if let Some(task) = self.keepalive.take() {
            task.abort();
        }
        if let Some(task) = self.dispatch.take() {
            task.abort();
        }
    }
}

pub(crate) struct SessionInner {
    config: SessionConfig,
    connector: Arc<dyn Connector>,
    pub(crate) engine: Option<Arc<dyn WebRtcEngine>>,
    pub(crate) capture: Option<Arc<dyn MediaCapture>>,
    handlers: SessionHandlers,
    registry: Option<Arc<SessionRegistry>>,
    pub(crate) transactions: TransactionRegistry,
    state: Mutex<SessionState>,
    handles: Mutex<HashMap<HandleId, Arc<HandleInner>>>,
}

impl fmt::Debug for SessionInner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Session")
            .field("session_id", &state.session_id)
            .field("server", &state.server)
            .field("connected", &state.connected)
            .field("handles", &self.handles.lock().len())
            .finish()
    }
}

impl Drop for SessionInner {
    fn drop(&mut self) {
        self.state.get_mut().stop_tasks();
    }
}

impl SessionInner {
    pub(crate) fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub(crate) fn is_connected(&self) -> bool {
        self.state.lock().connected
    }

    pub(crate) fn remove_handle(&self, handle_id: HandleId) -> Option<Arc<HandleInner>> {
        self.handles.lock().remove(&handle_id)
    }

    async fn establish(self: &Arc<Self>) -> JanusResult<()> {
        let servers = self.config.servers.as_slice().to_vec();
        let multiple = self.config.servers.is_multiple();
        let mut last_error = None;

        for (index, server) in servers.iter().enumerate() {
            if index > 0 {
                tokio::time::sleep(self.config.retry_delay).await;
            }
            match self.attempt(index, server, None).await {
                Ok(()) => return Ok(()),
                Err(err)
                    if matches!(
                        err.category(),
                        ErrorCategory::Transport | ErrorCategory::Timeout
                    ) =>
                {
                    warn!(server = %server, error = %err, "server unreachable");
                    last_error = Some(err);
                }
                Err(err) => return Err(err),
            }
        }

        if multiple {
            Err(JanusError::AllServersFailed {
                attempted: servers.len(),
            })
        } else {
            Err(last_error
                .unwrap_or_else(|| JanusError::Config("invalid server url: empty list".into())))
        }
    }

    /// One `create` (or `claim`, when `claim` is set) against one server.
    async fn attempt(
        self: &Arc<Self>,
        index: usize,
        server: &str,
        claim: Option<SessionId>,
    ) -> JanusResult<()> {
        let (transport, events) = self.connector.connect(server, &self.config).await?;
        let epoch = {
            let mut state = self.state.lock();
            state.epoch += 1;
            state.stop_tasks();
            state.transport = Some(transport.clone());
            state.server_index = index;
            state.server = Some(server.to_string());
            let epoch = state.epoch;
            state.dispatch = Some(tokio::spawn(run_dispatch(
                Arc::downgrade(self),
                epoch,
                events,
            )));
            epoch
        };

        match self.open_session(&transport, claim).await {
            Ok(session_id) => {
                {
                    let mut state = self.state.lock();
                    state.session_id = Some(session_id);
                    state.connected = true;
                }
                if let Some(registry) = &self.registry {
                    registry.register(session_id, self);
                }
                match transport.kind() {
                    TransportKind::WebSocket => self.start_keepalive(epoch),
                    TransportKind::LongPoll => transport.start_receiving(session_id),
                }
                info!(
                    session_id,
                    server,
                    transport = %transport.kind(),
                    "session established"
                );
                Ok(())
            }
            Err(err) => {
                {
                    let mut state = self.state.lock();
                    if state.epoch == epoch {
                        state.stop_tasks();
                        state.transport = None;
                    }
                }
                transport.close(None).await;
                Err(err)
            }
        }
    }

    async fn open_session(
        &self,
        transport: &Arc<dyn Transport>,
        claim: Option<SessionId>,
    ) -> JanusResult<SessionId> {
        let kind = if claim.is_some() {
            RequestKind::Claim
        } else {
            RequestKind::Create
        };
        let pending = self.transactions.begin();
        let id = pending.id.clone();
        let mut request = Request::new(kind, id.clone())
            .credentials(self.config.token.as_deref(), self.config.apisecret.as_deref());
        if let Some(session_id) = claim {
            request = request.session(session_id);
        }

        if let Err(err) = transport.send(&request).await {
            self.transactions.cancel(&id);
            return Err(err);
        }
        let reply = self.await_reply(pending).await.map_err(|err| match err {
            JanusError::Cancelled => {
                JanusError::Transport(format!("connection lost before {} completed", kind.as_str()))
            }
            other => other,
        })?;

        match reply {
            ServerMessage::Success { .. } => reply.created_id().or(claim).ok_or_else(|| {
                JanusError::Transport(format!("{} reply carried no session id", kind.as_str()))
            }),
            ServerMessage::Error { error, .. } => Err(JanusError::Protocol {
                code: error.code,
                reason: error.reason,
            }),
            other => Err(JanusError::Transport(format!(
                "unexpected {} reply to {}",
                other.kind(),
                kind.as_str()
            ))),
        }
    }

    async fn await_reply(&self, pending: PendingTransaction) -> JanusResult<ServerMessage> {
        match self.config.request_timeout {
            Some(timeout) => pending.wait_timeout(&self.transactions, timeout).await,
            None => pending.wait().await,
        }
    }

    fn connected_transport(&self) -> JanusResult<(Arc<dyn Transport>, SessionId)> {
        let state = self.state.lock();
        match (state.connected, &state.transport, state.session_id) {
            (true, Some(transport), Some(session_id)) => Ok((transport.clone(), session_id)),
            _ => Err(JanusError::not_connected()),
        }
    }

    /// Sends a session-scoped request and waits for its `ack`/`success`.
    /// An `error` reply becomes [`JanusError::Protocol`].
    pub(crate) async fn request(
        &self,
        kind: RequestKind,
        owner: Option<HandleId>,
        token: Option<&str>,
        build: impl FnOnce(Request) -> Request,
    ) -> JanusResult<ServerMessage> {
        let (transport, session_id) = self.connected_transport()?;
        let pending = self.transactions.begin_owned(owner);
        let id = pending.id.clone();
        let request = build(
            Request::new(kind, id.clone())
                .session(session_id)
                .credentials(token, self.config.apisecret.as_deref()),
        );
        trace!(session_id, transaction = %id, kind = kind.as_str(), "sending request");
        if let Err(err) = transport.send(&request).await {
            self.transactions.cancel(&id);
            return Err(err);
        }
        match self.await_reply(pending).await? {
            ServerMessage::Error { error, .. } => Err(JanusError::Protocol {
                code: error.code,
                reason: error.reason,
            }),
            reply => Ok(reply),
        }
    }

    /// Sends a session-scoped request without registering for its reply.
    pub(crate) async fn post(
        &self,
        kind: RequestKind,
        token: Option<&str>,
        build: impl FnOnce(Request) -> Request,
    ) -> JanusResult<()> {
        let (transport, session_id) = self.connected_transport()?;
        let request = build(
            Request::new(kind, transaction_id())
                .session(session_id)
                .credentials(token, self.config.apisecret.as_deref()),
        );
        transport.send(&request).await
    }

    fn start_keepalive(self: &Arc<Self>, epoch: u64) {
        let session = Arc::downgrade(self);
        let period = self.config.keepalive_period;
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(inner) = session.upgrade() else {
                    break;
                };
                if !inner.is_current(epoch) {
                    break;
                }
                let token = inner.config.token.clone();
                if let Err(err) = inner
                    .post(RequestKind::Keepalive, token.as_deref(), |request| request)
                    .await
                {
                    debug!(error = %err, "keepalive not sent");
                }
            }
        });
        let mut state = self.state.lock();
        if let Some(previous) = state.keepalive.replace(task) {
            previous.abort();
        }
    }

    fn is_current(&self, epoch: u64) -> bool {
        let state = self.state.lock();
        state.epoch == epoch && state.connected
    }

    fn dispatch(&self, epoch: u64, message: ServerMessage) {
        match &message {
            ServerMessage::Ack { transaction, .. }
            | ServerMessage::Success { transaction, .. }
            | ServerMessage::Error { transaction, .. } => {
                let Some(id) = transaction.clone() else {
                    if let ServerMessage::Error { error, .. } = &message {
                        warn!(code = error.code, reason = %error.reason, "gateway error without transaction");
                    } else {
                        debug!(kind = message.kind(), "reply without transaction dropped");
                    }
                    return;
                };
                let is_error = matches!(message, ServerMessage::Error { .. });
                if !self.transactions.resolve(&id, message) && is_error {
                    warn!(transaction = %id, "error reply for unknown transaction");
                }
            }
            ServerMessage::Keepalive { .. } => trace!("gateway keepalive"),
            ServerMessage::Timeout { session_id } => self.gateway_timeout(epoch, *session_id),
            ServerMessage::Unknown(raw) => {
                debug!(message = %raw, "unknown gateway message dropped");
            }
            _ => self.route(message),
        }
    }

    fn route(&self, message: ServerMessage) {
        let Some(sender) = message.sender() else {
            debug!(kind = message.kind(), "event without sender dropped");
            return;
        };
        let handle = self.handles.lock().get(&sender).cloned();
        match handle {
            Some(handle) => handle.deliver(message),
            None => debug!(
                handle_id = sender,
                kind = message.kind(),
                "event for unknown handle dropped"
            ),
        }
    }

    fn gateway_timeout(&self, epoch: u64, session_id: Option<SessionId>) {
        let transport = {
            let state = self.state.lock();
            if state.epoch != epoch {
                return;
            }
            state.transport.clone()
        };
        let Some(transport) = transport else {
            return;
        };
        if transport.kind() != TransportKind::WebSocket {
            warn!(?session_id, "gateway reported a session timeout");
            return;
        }
        tokio::spawn(async move {
            transport.close(Some(CloseReason::gateway_timeout())).await;
        });
        self.connection_lost(
            epoch,
            JanusError::Timeout(format!("session {session_id:?} timed out on the gateway")),
        );
    }

    /// Marks the session disconnected. `on_error` fires only if the session had
    /// been established, so a failed `create` is reported by `connect` alone.
    fn connection_lost(&self, epoch: u64, err: JanusError) {
        let was_connected = {
            let mut state = self.state.lock();
            if state.epoch != epoch {
                return;
            }
            if let Some(task) = state.keepalive.take() {
                task.abort();
            }
            std::mem::replace(&mut state.connected, false)
        };
        let dropped = self.transactions.clear();
        if was_connected {
            warn!(error = %err, dropped, "lost connection to the gateway");
            (self.handlers.on_error)(err);
        } else {
            debug!(error = %err, dropped, "transport ended before the session was up");
        }
    }

    async fn teardown(&self, session_id: SessionId) {
        let transport = {
            let mut state = self.state.lock();
            state.connected = false;
            state.session_id = None;
            state.epoch += 1;
            state.stop_tasks();
            state.transport.take()
        };
        self.transactions.clear();
        if let Some(registry) = &self.registry {
            registry.remove(session_id);
        }
        if let Some(transport) = transport {
            transport.close(None).await;
        }
    }
}

async fn run_dispatch(session: Weak<SessionInner>, epoch: u64, mut events: TransportEvents) {
    while let Some(event) = events.recv().await {
        let Some(inner) = session.upgrade() else {
            break;
        };
        match event {
            TransportEvent::Message(Value::Array(batch)) => {
                for value in batch {
                    inner.dispatch(epoch, ServerMessage::parse(value));
                }
            }
            TransportEvent::Message(value) => inner.dispatch(epoch, ServerMessage::parse(value)),
            TransportEvent::Closed { code, reason } => {
                let detail = match code {
                    Some(code) => format!("connection closed ({code}): {reason}"),
                    None => format!("connection closed: {reason}"),
                };
                inner.connection_lost(epoch, JanusError::Transport(detail));
                break;
            }
            TransportEvent::Failed(reason) => {
                inner.connection_lost(epoch, JanusError::Transport(reason));
                break;
            }
        }
    }
}
