use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use super::{CloseReason, Transport, TransportEvent, TransportEvents, TransportKind};
use crate::config::SessionConfig;
use crate::error::{JanusError, JanusResult};
use crate::protocol::{Request, RequestKind, SessionId};

/// Consecutive long-poll failures tolerated before the session is declared lost.
pub const MAX_POLL_RETRIES: u32 = 3;

pub const LOST_CONNECTION: &str = "Lost connection to the server (is it down?)";

/// The two HTTP verbs the polling transport needs.
#[async_trait]
pub trait HttpBackend: Send + Sync {
    async fn post(&self, url: &str, body: &Value) -> JanusResult<Value>;
    async fn get(&self, url: &str, timeout: Duration) -> JanusResult<Value>;
}

#[derive(Debug, Clone)]
pub struct ReqwestBackend {
    client: reqwest::Client,
    with_credentials: bool,
}

impl ReqwestBackend {
    /// With `with_credentials` set, cookies the gateway hands out are kept and
    /// replayed on every later request and long poll.
    pub fn new(config: &SessionConfig) -> JanusResult<Self> {
        let client = reqwest::Client::builder()
            .cookie_store(config.with_credentials)
            .build()?;
        Ok(Self {
            client,
            with_credentials: config.with_credentials,
        })
    }

    pub fn with_credentials(&self) -> bool {
        self.with_credentials
    }
}

#[async_trait]
impl HttpBackend for ReqwestBackend {
    async fn post(&self, url: &str, body: &Value) -> JanusResult<Value> {
        let reply = self
            .client
            .post(url)
            .json(body)
            .send()
            .await?
            .error_for_status()?
            .json::<Value>()
            .await?;
        Ok(reply)
    }

    async fn get(&self, url: &str, timeout: Duration) -> JanusResult<Value> {
        let reply = self
            .client
            .get(url)
            .timeout(timeout)
            .send()
            .await?
            .error_for_status()?
            .json::<Value>()
            .await?;
        Ok(reply)
    }
}

#[derive(Debug, Clone)]
struct PollSettings {
    long_poll_timeout: Duration,
    max_poll_events: u32,
    token: Option<String>,
    apisecret: Option<String>,
}

/// REST transport: requests are POSTed, events arrive through a long-poll loop.
pub struct PollingTransport {
    server: String,
    backend: Arc<dyn HttpBackend>,
    events: mpsc::UnboundedSender<TransportEvent>,
    settings: PollSettings,
    poller: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl PollingTransport {
    pub fn new(
        server: &str,
        config: &SessionConfig,
        backend: Arc<dyn HttpBackend>,
    ) -> (Self, TransportEvents) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let transport = Self {
            server: server.trim_end_matches('/').to_string(),
            backend,
            events: events_tx,
            settings: PollSettings {
                long_poll_timeout: config.long_poll_timeout,
                max_poll_events: config.max_poll_events.max(1),
                token: config.token.clone(),
                apisecret: config.apisecret.clone(),
            },
            poller: Mutex::new(None),
            closed: AtomicBool::new(false),
        };
        (transport, events_rx)
    }

    /// POST target for a request. `create` and `claim` go to the root endpoint.
    fn request_url(&self, request: &Request) -> String {
        match (request.janus, request.session_id, request.handle_id) {
            (RequestKind::Create | RequestKind::Claim, _, _) => self.server.clone(),
            (_, Some(session), Some(handle)) => format!("{}/{session}/{handle}", self.server),
            (_, Some(session), None) => format!("{}/{session}", self.server),
            (_, None, _) => self.server.clone(),
        }
    }

    /// Request body: ids already encoded in the path are dropped, except for
    /// `claim`, which names the session it wants back.
    fn request_body(request: &Request) -> JanusResult<Value> {
        let mut body = serde_json::to_value(request)?;
        if let Value::Object(map) = &mut body {
            if request.janus != RequestKind::Claim {
                map.remove("session_id");
            }
            map.remove("handle_id");
        }
        Ok(body)
    }
}

#[async_trait]
impl Transport for PollingTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::LongPoll
    }

    async fn send(&self, request: &Request) -> JanusResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(JanusError::Transport("polling transport is closed".into()));
        }
        let url = self.request_url(request);
        let body = Self::request_body(request)?;
        trace!(
            target: "janus::http",
            url = %url,
            kind = request.janus.as_str(),
            "posting request"
        );
        let reply = self.backend.post(&url, &body).await?;
        if self.events.send(TransportEvent::Message(reply)).is_err() {
            debug!(target: "janus::http", "reply arrived after the session stopped listening");
        }
        Ok(())
    }

    fn start_receiving(&self, session_id: SessionId) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        let poll = LongPoll {
            server: self.server.clone(),
            session_id,
            backend: self.backend.clone(),
            events: self.events.clone(),
            settings: self.settings.clone(),
        };
        let task = tokio::spawn(poll.run());
        if let Some(previous) = self.poller.lock().replace(task) {
            previous.abort();
        }
    }

    async fn close(&self, _reason: Option<CloseReason>) {
        self.closed.store(true, Ordering::Release);
        if let Some(poller) = self.poller.lock().take() {
            poller.abort();
        }
    }
}

impl Drop for PollingTransport {
    fn drop(&mut self) {
        if let Some(poller) = self.poller.lock().take() {
            poller.abort();
        }
    }
}

struct LongPoll {
    server: String,
    session_id: SessionId,
    backend: Arc<dyn HttpBackend>,
    events: mpsc::UnboundedSender<TransportEvent>,
    settings: PollSettings,
}

impl LongPoll {
    async fn run(self) {
        let mut failures: u32 = 0;
        loop {
            let url = long_poll_url(&self.server, self.session_id, &self.settings, next_rid());
            match self.backend.get(&url, self.settings.long_poll_timeout).await {
                Ok(reply) => {
                    failures = 0;
                    // A batch is forwarded whole, so it costs exactly one follow-up poll.
                    if self.events.send(TransportEvent::Message(reply)).is_err() {
                        return;
                    }
                }
                Err(err) => {
                    failures += 1;
                    warn!(
                        target: "janus::poll",
                        session_id = self.session_id,
                        failures,
                        error = %err,
                        "long poll failed"
                    );
                    if failures > MAX_POLL_RETRIES {
                        let _ = self.events.send(TransportEvent::Failed(LOST_CONNECTION.into()));
                        return;
                    }
                }
            }
        }
    }
}

static LAST_RID: AtomicU64 = AtomicU64::new(0);

/// Millisecond timestamp, bumped when needed so successive polls never repeat a value.
fn next_rid() -> u64 {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or_default();
    let mut last = LAST_RID.load(Ordering::Relaxed);
    loop {
        let next = now.max(last + 1);
        match LAST_RID.compare_exchange_weak(last, next, Ordering::Relaxed, Ordering::Relaxed) {
            Ok(_) => return next,
            Err(current) => last = current,
        }
    }
}

fn long_poll_url(server: &str, session_id: SessionId, settings: &PollSettings, rid: u64) -> String {
    let mut query = url::form_urlencoded::Serializer::new(String::new());
    query.append_pair("rid", &rid.to_string());
    query.append_pair("maxev", &settings.max_poll_events.to_string());
    if let Some(token) = &settings.token {
        query.append_pair("token", token);
    }
    if let Some(apisecret) = &settings.apisecret {
        query.append_pair("apisecret", apisecret);
    }
    format!("{server}/{session_id}?{}", query.finish())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::VecDeque;

    #[derive(Default)]
    struct ScriptedBackend {
        gets: Mutex<VecDeque<JanusResult<Value>>>,
        get_urls: Mutex<Vec<String>>,
        posts: Mutex<Vec<(String, Value)>>,
    }

    impl ScriptedBackend {
        fn with_gets(gets: Vec<JanusResult<Value>>) -> Arc<Self> {
            Arc::new(Self {
                gets: Mutex::new(gets.into()),
                ..Default::default()
            })
        }
    }

    #[async_trait]
    impl HttpBackend for ScriptedBackend {
        async fn post(&self, url: &str, body: &Value) -> JanusResult<Value> {
            self.posts.lock().push((url.to_string(), body.clone()));
            Ok(json!({ "janus": "ack", "transaction": body["transaction"] }))
        }

        async fn get(&self, url: &str, _timeout: Duration) -> JanusResult<Value> {
            self.get_urls.lock().push(url.to_string());
            let next = self.gets.lock().pop_front();
            match next {
                Some(reply) => reply,
                None => std::future::pending().await,
            }
        }
    }

    fn refused() -> JanusResult<Value> {
        Err(JanusError::Transport("connection refused".into()))
    }

    fn config() -> SessionConfig {
        SessionConfig::builder("http://gw.local/janus")
            .token("t o")
            .max_poll_events(5)
            .build()
            .unwrap()
    }

    #[test]
    fn credentials_follow_the_session_config() {
        let plain = ReqwestBackend::new(&config()).unwrap();
        assert!(!plain.with_credentials());

        let with_cookies = SessionConfig::builder("http://gw.local/janus")
            .with_credentials(true)
            .build()
            .unwrap();
        assert!(ReqwestBackend::new(&with_cookies).unwrap().with_credentials());
    }

    #[test]
    fn long_poll_url_carries_rid_maxev_and_credentials() {
        let settings = PollSettings {
            long_poll_timeout: Duration::from_secs(60),
            max_poll_events: 5,
            token: Some("t o".into()),
            apisecret: Some("s&c".into()),
        };
        let url = long_poll_url("http://gw.local/janus", 99, &settings, 1234);
        assert_eq!(
            url,
            "http://gw.local/janus/99?rid=1234&maxev=5&token=t+o&apisecret=s%26c"
        );
    }

    #[test]
    fn rids_are_strictly_increasing() {
        let first = next_rid();
        let second = next_rid();
        assert!(second > first);
    }

    #[tokio::test]
    async fn posts_strip_ids_that_live_in_the_path() {
        let backend = ScriptedBackend::with_gets(vec![]);
        let (transport, mut events) =
            PollingTransport::new("http://gw.local/janus/", &config(), backend.clone());
        let request = Request::new(RequestKind::Message, "tx-1")
            .session(10)
            .handle(20)
            .body(json!({ "request": "list" }), None);
        transport.send(&request).await.unwrap();

        let posts = backend.posts.lock().clone();
        assert_eq!(posts[0].0, "http://gw.local/janus/10/20");
        assert!(posts[0].1.get("session_id").is_none());
        assert!(posts[0].1.get("handle_id").is_none());
        assert_eq!(posts[0].1["body"]["request"], "list");

        match events.recv().await {
            Some(TransportEvent::Message(reply)) => assert_eq!(reply["transaction"], "tx-1"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn claim_keeps_session_id_and_targets_root() {
        let backend = ScriptedBackend::with_gets(vec![]);
        let (transport, _events) =
            PollingTransport::new("http://gw.local/janus", &config(), backend.clone());
        let request = Request::new(RequestKind::Claim, "tx-2").session(10);
        transport.send(&request).await.unwrap();
        let posts = backend.posts.lock().clone();
        assert_eq!(posts[0].0, "http://gw.local/janus");
        assert_eq!(posts[0].1["session_id"], 10);
    }

    #[tokio::test]
    async fn three_failures_then_success_keeps_polling() {
        let backend = ScriptedBackend::with_gets(vec![
            refused(),
            refused(),
            refused(),
            Ok(json!({ "janus": "keepalive" })),
            refused(),
            refused(),
            refused(),
            Ok(json!([{ "janus": "keepalive" }, { "janus": "keepalive" }])),
        ]);
        let (transport, mut events) =
            PollingTransport::new("http://gw.local/janus", &config(), backend.clone());
        transport.start_receiving(7);

        assert!(matches!(events.recv().await, Some(TransportEvent::Message(_))));
        match events.recv().await {
            Some(TransportEvent::Message(Value::Array(batch))) => assert_eq!(batch.len(), 2),
            other => panic!("unexpected {other:?}"),
        }
        // The loop is now parked on its ninth poll: one per batch, never per element.
        while backend.get_urls.lock().len() < 9 {
            tokio::task::yield_now().await;
        }
        assert_eq!(backend.get_urls.lock().len(), 9);
        assert!(events.try_recv().is_err());
        transport.close(None).await;
    }

    #[tokio::test]
    async fn fourth_consecutive_failure_is_fatal_once() {
        let backend =
            ScriptedBackend::with_gets(vec![refused(), refused(), refused(), refused(), refused()]);
        let (transport, mut events) =
            PollingTransport::new("http://gw.local/janus", &config(), backend.clone());
        transport.start_receiving(7);

        match events.recv().await {
            Some(TransportEvent::Failed(reason)) => assert_eq!(reason, LOST_CONNECTION),
            other => panic!("unexpected {other:?}"),
        }
        drop(transport);
        assert!(events.recv().await.is_none());
        assert_eq!(backend.get_urls.lock().len(), 4);
    }

    #[tokio::test]
    async fn send_after_close_fails() {
        let backend = ScriptedBackend::with_gets(vec![]);
        let (transport, _events) =
            PollingTransport::new("http://gw.local/janus", &config(), backend);
        transport.close(None).await;
        let err = transport
            .send(&Request::new(RequestKind::Create, "tx"))
            .await
            .unwrap_err();
        assert!(matches!(err, JanusError::Transport(_)));
    }
}
