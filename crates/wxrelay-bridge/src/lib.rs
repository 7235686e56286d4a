//! Session bridge adapter.
//!
//! Speaks JSON over HTTP to a sidecar that owns the actual chat protocol:
//! - `POST /session/start`, then poll `GET /session/login` until confirmed
//! - long-poll `GET /session/events` and push each event into the sink
//! - `GET /session/alive`, `GET /session/groups`, `POST /session/logout`

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use tokio::{sync::Mutex, task::JoinHandle, time::sleep};

use wxrelay_core::{
    domain::{GroupInfo, InboundEvent},
    errors::Error,
    lifecycle::ProviderSink,
    ports::{GroupSource, ProviderFactory, SessionProvider},
    Result,
};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const LONG_POLL_TIMEOUT: Duration = Duration::from_secs(90);
/// Consecutive event stream failures tolerated before the session is ended.
const MAX_STREAM_ERRORS: u32 = 3;
const STREAM_RETRY_DELAY: Duration = Duration::from_secs(2);

/// Login progress as reported by `GET /session/login`.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
enum LoginPoll {
    Pending,
    Challenge {
        uuid: String,
        #[serde(default)]
        url: Option<String>,
    },
    Scanned,
    Confirmed {
        #[serde(default)]
        account: String,
    },
    Failed {
        #[serde(default)]
        reason: String,
    },
}

#[derive(Deserialize)]
struct AliveReply {
    alive: bool,
}

/// Shared settings for every provider the factory builds.
#[derive(Clone, Debug)]
struct BridgeSettings {
    base_url: String,
    qr_url_prefix: String,
    poll_interval: Duration,
    long_poll_timeout: Duration,
    stream_retry_delay: Duration,
}

impl BridgeSettings {
    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    /// Challenge URL: the bridge's own if given, otherwise prefix + token.
    fn challenge_url(&self, uuid: &str, url: Option<&str>) -> String {
        match url {
            Some(u) if !u.trim().is_empty() => u.to_string(),
            _ => format!("{}{uuid}", self.qr_url_prefix),
        }
    }
}

pub struct BridgeProviderFactory {
    settings: BridgeSettings,
    http: reqwest::Client,
}

impl BridgeProviderFactory {
    pub fn new(base_url: impl Into<String>, qr_url_prefix: impl Into<String>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| Error::External(format!("bridge client build error: {e}")))?;

        Ok(Self {
            settings: BridgeSettings {
                base_url: base_url.into().trim_end_matches('/').to_string(),
                qr_url_prefix: qr_url_prefix.into(),
                poll_interval: Duration::from_secs(1),
                long_poll_timeout: LONG_POLL_TIMEOUT,
                stream_retry_delay: STREAM_RETRY_DELAY,
            },
            http,
        })
    }

    /// Override how often `/session/login` is polled.
    pub fn with_poll_interval(mut self, every: Duration) -> Self {
        self.settings.poll_interval = every;
        self
    }

    /// Override the event long-poll timeout and the wait after a stream error.
    pub fn with_event_stream_timing(mut self, long_poll: Duration, retry_delay: Duration) -> Self {
        self.settings.long_poll_timeout = long_poll;
        self.settings.stream_retry_delay = retry_delay;
        self
    }
}

impl ProviderFactory for BridgeProviderFactory {
    fn create(&self) -> Arc<dyn SessionProvider> {
        Arc::new(BridgeProvider {
            settings: self.settings.clone(),
            http: self.http.clone(),
            pump: Mutex::new(None),
        })
    }
}

/// One login attempt against the bridge.
pub struct BridgeProvider {
    settings: BridgeSettings,
    http: reqwest::Client,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl BridgeProvider {
    async fn poll_login(&self) -> Result<LoginPoll> {
        let resp = self
            .http
            .get(self.settings.url("/session/login"))
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await
            .map_err(|e| Error::External(format!("bridge login poll error: {e}")))?;
        read_json(resp, "login poll").await
    }

    async fn start_pump(&self, sink: ProviderSink) {
        let settings = self.settings.clone();
        let http = self.http.clone();
        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = sink.ended() => {}
                _ = pump_events(&settings, &http, &sink) => {}
            }
        });

        if let Some(old) = self.pump.lock().await.replace(handle) {
            old.abort();
        }
    }
}

#[async_trait]
impl GroupSource for BridgeProvider {
    async fn list_groups(&self) -> Result<Vec<GroupInfo>> {
        let resp = self
            .http
            .get(self.settings.url("/session/groups"))
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await
            .map_err(|e| Error::External(format!("bridge group list error: {e}")))?;
        read_json(resp, "group list").await
    }
}

#[async_trait]
impl SessionProvider for BridgeProvider {
    async fn login(&self, sink: ProviderSink) -> Result<String> {
        let resp = self
            .http
            .post(self.settings.url("/session/start"))
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await
            .map_err(|e| Error::External(format!("bridge start error: {e}")))?;
        if !resp.status().is_success() {
            return Err(Error::External(format!(
                "bridge start failed: {}",
                resp.status()
            )));
        }

        let mut published: Option<String> = None;
        let mut scanned = false;

        loop {
            if sink.is_ended() {
                return Err(Error::External("login abandoned".to_string()));
            }

            match self.poll_login().await? {
                LoginPoll::Pending => {}
                LoginPoll::Challenge { uuid, url } => {
                    // A challenge after a scan means the scan was abandoned.
                    if scanned || published.as_deref() != Some(uuid.as_str()) {
                        let url = self.settings.challenge_url(&uuid, url.as_deref());
                        sink.challenge(uuid.clone(), url).await;
                        published = Some(uuid);
                        scanned = false;
                    }
                }
                LoginPoll::Scanned => {
                    if !scanned {
                        sink.scanned().await;
                        scanned = true;
                    }
                }
                LoginPoll::Confirmed { account } => {
                    self.start_pump(sink).await;
                    return Ok(account);
                }
                LoginPoll::Failed { reason } => {
                    return Err(Error::External(format!("login failed: {reason}")));
                }
            }

            tokio::select! {
                _ = sink.ended() => {}
                _ = sleep(self.settings.poll_interval) => {}
            }
        }
    }

    async fn alive(&self) -> bool {
        let resp = match self
            .http
            .get(self.settings.url("/session/alive"))
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await
        {
            Ok(resp) => resp,
            Err(e) => {
                tracing::debug!("bridge alive probe failed: {e}");
                return false;
            }
        };

        match read_json::<AliveReply>(resp, "alive probe").await {
            Ok(reply) => reply.alive,
            Err(e) => {
                tracing::debug!("{e}");
                false
            }
        }
    }

    async fn shutdown(&self) {
        if let Some(pump) = self.pump.lock().await.take() {
            pump.abort();
        }

        let res = self
            .http
            .post(self.settings.url("/session/logout"))
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await;
        if let Err(e) = res {
            tracing::debug!("bridge logout failed (ignored): {e}");
        }
    }
}

/// Long-poll events until the bridge reports the session gone.
///
/// An idle poll that hits the client timeout is an empty batch. Other
/// failures end the session only after `MAX_STREAM_ERRORS` in a row.
async fn pump_events(settings: &BridgeSettings, http: &reqwest::Client, sink: &ProviderSink) {
    let mut failures = 0u32;

    loop {
        let batch = match http
            .get(settings.url("/session/events"))
            .timeout(settings.long_poll_timeout)
            .send()
            .await
        {
            Ok(resp) if resp.status() == StatusCode::GONE => {
                sink.terminated("logged out").await;
                return;
            }
            Ok(resp) => read_json::<Vec<InboundEvent>>(resp, "event batch").await,
            Err(e) if e.is_timeout() => {
                tracing::debug!("event long-poll idle, polling again");
                failures = 0;
                continue;
            }
            Err(e) => Err(Error::External(format!("event stream error: {e}"))),
        };

        let events = match batch {
            Ok(events) => {
                failures = 0;
                events
            }
            Err(e) => {
                failures += 1;
                if failures >= MAX_STREAM_ERRORS {
                    sink.terminated(&e.to_string()).await;
                    return;
                }
                tracing::warn!("{e} ({failures}/{MAX_STREAM_ERRORS}), retrying");
                sleep(settings.stream_retry_delay).await;
                continue;
            }
        };

        for event in events {
            if !sink.deliver(event).await {
                return;
            }
        }
    }
}

async fn read_json<T: serde::de::DeserializeOwned>(
    resp: reqwest::Response,
    what: &str,
) -> Result<T> {
    let status = resp.status();
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        return Err(Error::External(format!(
            "bridge {what} failed: {status} {}",
            body.chars().take(200).collect::<String>()
        )));
    }

    resp.json::<T>()
        .await
        .map_err(|e| Error::External(format!("bridge {what} json error: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        http::StatusCode as AxumStatus,
        response::{IntoResponse, Response},
        routing::{get, post},
        Json, Router,
    };
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::sync::mpsc;
    use wxrelay_core::{
        directory::GroupDirectory,
        dispatcher::{NotificationDispatcher, RetryPolicy},
        lifecycle::{LifecycleTimings, Phase, SessionLifecycle, StatusSnapshot},
        ports::Notifier,
    };

    #[test]
    fn parses_login_states() {
        let polls: Vec<LoginPoll> = serde_json::from_str(
            r#"[
                {"state": "pending"},
                {"state": "challenge", "uuid": "abc"},
                {"state": "challenge", "uuid": "abc", "url": "https://qr/abc"},
                {"state": "scanned"},
                {"state": "confirmed", "account": "me"},
                {"state": "failed", "reason": "expired"}
            ]"#,
        )
        .unwrap();

        assert_eq!(polls[0], LoginPoll::Pending);
        assert_eq!(
            polls[1],
            LoginPoll::Challenge {
                uuid: "abc".to_string(),
                url: None
            }
        );
        assert_eq!(
            polls[4],
            LoginPoll::Confirmed {
                account: "me".to_string()
            }
        );
        assert_eq!(
            polls[5],
            LoginPoll::Failed {
                reason: "expired".to_string()
            }
        );
    }

    #[test]
    fn challenge_url_falls_back_to_prefix() {
        let s = BridgeSettings {
            base_url: "http://bridge".to_string(),
            qr_url_prefix: "https://login.weixin.qq.com/qrcode/".to_string(),
            poll_interval: Duration::from_secs(1),
            long_poll_timeout: LONG_POLL_TIMEOUT,
            stream_retry_delay: STREAM_RETRY_DELAY,
        };
        assert_eq!(
            s.challenge_url("abc", None),
            "https://login.weixin.qq.com/qrcode/abc"
        );
        assert_eq!(
            s.challenge_url("abc", Some(" ")),
            "https://login.weixin.qq.com/qrcode/abc"
        );
        assert_eq!(s.challenge_url("abc", Some("https://qr/abc")), "https://qr/abc");
    }

    #[derive(Clone, Copy, Default)]
    enum LoginScript {
        /// pending, challenge, scanned, then confirmed.
        #[default]
        Direct,
        /// challenge, scanned, then a fresh challenge that is never scanned.
        Rescan,
    }

    #[derive(Clone, Copy, Default)]
    enum EventScript {
        /// One event, then `410 Gone`.
        #[default]
        OneBatchThenGone,
        /// Every long-poll is held open for a second, then answers `[]`.
        Idle,
        /// Every long-poll answers 500.
        Failing,
    }

    #[derive(Default)]
    struct MockBridge {
        login: LoginScript,
        events: EventScript,
        login_polls: AtomicU32,
        event_polls: AtomicU32,
        logouts: AtomicU32,
    }

    impl MockBridge {
        fn with(login: LoginScript, events: EventScript) -> Arc<Self> {
            Arc::new(Self {
                login,
                events,
                ..Self::default()
            })
        }
    }

    async fn serve_mock(mock: Arc<MockBridge>) -> String {
        let login = {
            let mock = mock.clone();
            move || {
                let mock = mock.clone();
                async move {
                    let n = mock.login_polls.fetch_add(1, Ordering::SeqCst);
                    Json(match (mock.login, n) {
                        (LoginScript::Direct, 0) => json!({"state": "pending"}),
                        (LoginScript::Direct, 1 | 2) => {
                            json!({"state": "challenge", "uuid": "abc"})
                        }
                        (LoginScript::Direct, 3) => json!({"state": "scanned"}),
                        (LoginScript::Direct, _) => {
                            json!({"state": "confirmed", "account": "me"})
                        }
                        (LoginScript::Rescan, 0) => json!({"state": "challenge", "uuid": "abc"}),
                        (LoginScript::Rescan, 1) => json!({"state": "scanned"}),
                        (LoginScript::Rescan, _) => json!({"state": "challenge", "uuid": "def"}),
                    })
                }
            }
        };
        let events = {
            let mock = mock.clone();
            move || {
                let mock = mock.clone();
                async move {
                    let n = mock.event_polls.fetch_add(1, Ordering::SeqCst);
                    let resp: Response = match mock.events {
                        EventScript::OneBatchThenGone if n == 0 => Json(json!([{
                            "origin": {"kind": "direct"},
                            "sender": {"displayName": "Alice"},
                            "content": {"kind": "text", "body": "hi"}
                        }]))
                        .into_response(),
                        EventScript::OneBatchThenGone => AxumStatus::GONE.into_response(),
                        EventScript::Idle => {
                            sleep(Duration::from_secs(1)).await;
                            Json(json!([])).into_response()
                        }
                        EventScript::Failing => AxumStatus::INTERNAL_SERVER_ERROR.into_response(),
                    };
                    resp
                }
            }
        };
        let logout = {
            let mock = mock.clone();
            move || {
                let mock = mock.clone();
                async move {
                    mock.logouts.fetch_add(1, Ordering::SeqCst);
                    AxumStatus::OK
                }
            }
        };

        let app = Router::new()
            .route("/session/start", post(|| async { AxumStatus::OK }))
            .route("/session/login", get(login))
            .route("/session/events", get(events))
            .route("/session/logout", post(logout))
            .route(
                "/session/alive",
                get(|| async { Json(json!({"alive": true})) }),
            )
            .route(
                "/session/groups",
                get(|| async { Json(json!([{"id": "G1", "name": "Family"}])) }),
            );

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    struct SilentNotifier;

    #[async_trait]
    impl Notifier for SilentNotifier {
        async fn send(&self, _subject: &str, _body: &str) -> Result<()> {
            Ok(())
        }
    }

    fn relay_lifecycle(
        factory: BridgeProviderFactory,
    ) -> (SessionLifecycle, mpsc::Receiver<InboundEvent>) {
        let (tx, rx) = mpsc::channel(8);
        let lifecycle = SessionLifecycle::new(
            Arc::new(factory),
            Arc::new(GroupDirectory::new(Duration::ZERO)),
            Arc::new(NotificationDispatcher::new(
                Arc::new(SilentNotifier),
                RetryPolicy::default(),
            )),
            tx,
            LifecycleTimings::default(),
        );
        (lifecycle, rx)
    }

    async fn wait_for_phase(lc: &SessionLifecycle, want: Phase) -> StatusSnapshot {
        for _ in 0..250 {
            let snap = lc.snapshot().await;
            if snap.phase == want {
                return snap;
            }
            sleep(Duration::from_millis(20)).await;
        }
        panic!("never reached {want:?}: {:?}", lc.snapshot().await);
    }

    #[tokio::test]
    async fn groups_and_alive_round_trip_the_bridge() {
        let base = serve_mock(Arc::new(MockBridge::default())).await;
        let factory = BridgeProviderFactory::new(base, "https://qr/").unwrap();
        let provider = factory.create();

        let groups = provider.list_groups().await.unwrap();
        assert_eq!(
            groups,
            vec![GroupInfo {
                id: "G1".to_string(),
                name: "Family".to_string()
            }]
        );
        assert!(provider.alive().await);
    }

    #[tokio::test]
    async fn unreachable_bridge_is_not_alive() {
        let factory = BridgeProviderFactory::new("http://127.0.0.1:1", "https://qr/").unwrap();
        let provider = factory.create();
        assert!(!provider.alive().await);
        assert!(matches!(
            provider.list_groups().await,
            Err(Error::External(_))
        ));
    }

    #[tokio::test]
    async fn full_session_through_the_lifecycle() {
        let mock = Arc::new(MockBridge::default());
        let base = serve_mock(mock.clone()).await;
        let factory = BridgeProviderFactory::new(base, "https://qr/")
            .unwrap()
            .with_poll_interval(Duration::from_millis(20));
        let (lifecycle, mut rx) = relay_lifecycle(factory);
        lifecycle.start();

        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.sender.resolved_name(), "Alice");

        // The second event poll answers 410, which ends the session.
        let snap = wait_for_phase(&lifecycle, Phase::CoolingDown).await;
        assert_eq!(snap.failure_count, 1);
        assert!(mock.login_polls.load(Ordering::SeqCst) >= 5);

        lifecycle.shutdown().await;
        assert_eq!(mock.logouts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn idle_long_poll_keeps_the_session() {
        let mock = MockBridge::with(LoginScript::Direct, EventScript::Idle);
        let base = serve_mock(mock.clone()).await;
        let factory = BridgeProviderFactory::new(base, "https://qr/")
            .unwrap()
            .with_poll_interval(Duration::from_millis(20))
            .with_event_stream_timing(Duration::from_millis(100), Duration::from_millis(20));
        let (lifecycle, _rx) = relay_lifecycle(factory);
        lifecycle.start();

        wait_for_phase(&lifecycle, Phase::Active).await;
        // Several long-polls time out on the client side in this window.
        sleep(Duration::from_millis(600)).await;

        let snap = lifecycle.snapshot().await;
        assert_eq!(snap.phase, Phase::Active);
        assert_eq!(snap.failure_count, 0);
        assert!(mock.event_polls.load(Ordering::SeqCst) >= 3);
    }

    #[tokio::test]
    async fn persistent_stream_errors_end_the_session() {
        let mock = MockBridge::with(LoginScript::Direct, EventScript::Failing);
        let base = serve_mock(mock.clone()).await;
        let factory = BridgeProviderFactory::new(base, "https://qr/")
            .unwrap()
            .with_poll_interval(Duration::from_millis(20))
            .with_event_stream_timing(Duration::from_secs(5), Duration::from_millis(20));
        let (lifecycle, _rx) = relay_lifecycle(factory);
        lifecycle.start();

        let snap = wait_for_phase(&lifecycle, Phase::CoolingDown).await;
        assert_eq!(snap.failure_count, 1);
        assert_eq!(
            mock.event_polls.load(Ordering::SeqCst),
            MAX_STREAM_ERRORS
        );
    }

    #[tokio::test]
    async fn fresh_challenge_after_abandoned_scan_is_published() {
        let mock = MockBridge::with(LoginScript::Rescan, EventScript::Idle);
        let base = serve_mock(mock).await;
        let factory = BridgeProviderFactory::new(base, "https://qr/")
            .unwrap()
            .with_poll_interval(Duration::from_millis(20));
        let (lifecycle, _rx) = relay_lifecycle(factory);
        lifecycle.start();

        let mut url = None;
        for _ in 0..250 {
            url = lifecycle.snapshot().await.challenge_url;
            if url.as_deref() == Some("https://qr/def") {
                break;
            }
            sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(url.as_deref(), Some("https://qr/def"));
        assert_eq!(lifecycle.snapshot().await.phase, Phase::AwaitingChallenge);
    }
}
