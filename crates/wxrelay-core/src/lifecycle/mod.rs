//! Session lifecycle: login attempts, heartbeat, directory refresh, backoff.
//!
//! One driver task owns the attempt loop:
//! - tear down the previous provider, build a new one, start login
//! - on success refresh the directory and start the heartbeat + refresh loops
//! - on termination cool down (linear backoff with a cap), alert, retry
//!
//! Every mutation goes through [`SessionState::apply`] under one lock. Each
//! attempt gets a generation number and a cancellation token; signals and
//! loops from an older generation are ignored or stopped.

pub mod state;

use std::{
    sync::{Arc, Weak},
    time::Duration,
};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::{
    directory::GroupDirectory,
    dispatcher::NotificationDispatcher,
    domain::{GroupInfo, InboundEvent},
    errors::Error,
    ports::{ProviderFactory, SessionProvider},
    Result,
};

pub use state::{Challenge, CooldownPolicy, Phase, SessionState, Transition};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LifecycleTimings {
    pub heartbeat_interval: Duration,
    pub refresh_interval: Duration,
    pub cooldown: CooldownPolicy,
}

impl Default for LifecycleTimings {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(30),
            refresh_interval: Duration::from_secs(300),
            cooldown: CooldownPolicy::default(),
        }
    }
}

/// Consistent read-only view of the session for the status surface.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusSnapshot {
    pub phase: Phase,
    pub challenge_url: Option<String>,
    pub is_active: bool,
    /// False until the first provider instance has been constructed.
    pub provider_started: bool,
    pub failure_count: u32,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub cooldown_until: Option<DateTime<Utc>>,
    pub account: Option<String>,
}

struct CurrentProvider {
    generation: u64,
    provider: Arc<dyn SessionProvider>,
    session: CancellationToken,
}

struct LifecycleInner {
    factory: Arc<dyn ProviderFactory>,
    directory: Arc<GroupDirectory>,
    dispatcher: Arc<NotificationDispatcher>,
    events: mpsc::Sender<InboundEvent>,
    timings: LifecycleTimings,
    state: Mutex<SessionState>,
    /// Serializes provider teardown/construction; holds the live instance.
    gate: Mutex<Option<CurrentProvider>>,
}

impl LifecycleInner {
    async fn apply(&self, generation: u64, t: Transition) -> bool {
        let mut st = self.state.lock().await;
        if st.generation != generation {
            tracing::debug!(
                generation,
                current = st.generation,
                "ignoring signal from stale provider"
            );
            return false;
        }
        let label = format!("{t:?}");
        let applied = st.apply(t);
        if !applied {
            tracing::debug!(phase = ?st.phase, "transition rejected: {label}");
        }
        applied
    }
}

/// Handle given to a provider instance for reporting progress and events.
#[derive(Clone)]
pub struct ProviderSink {
    lifecycle: Weak<LifecycleInner>,
    generation: u64,
    session: CancellationToken,
    events: mpsc::Sender<InboundEvent>,
}

impl ProviderSink {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Publish (or replace) the login challenge.
    pub async fn challenge(&self, token: impl Into<String>, url: impl Into<String>) -> bool {
        let challenge = Challenge {
            token: token.into(),
            url: url.into(),
        };
        tracing::info!("scan to log in: {}", challenge.url);
        self.apply(Transition::Challenge(challenge)).await
    }

    /// The challenge was scanned; confirmation pending.
    pub async fn scanned(&self) -> bool {
        self.apply(Transition::Scanned).await
    }

    /// The session ended (logout, transport error, failed login).
    ///
    /// Safe to call more than once; only the first call for a live session
    /// counts as a failure.
    pub async fn terminated(&self, reason: &str) {
        if self.apply(Transition::Terminated).await {
            tracing::warn!(generation = self.generation, "session ended: {reason}");
        }
        self.session.cancel();
    }

    /// Queue an inbound event for routing. Returns `false` once the session
    /// has ended or the router is gone.
    pub async fn deliver(&self, event: InboundEvent) -> bool {
        if self.session.is_cancelled() {
            return false;
        }
        self.events.send(event).await.is_ok()
    }

    pub fn is_ended(&self) -> bool {
        self.session.is_cancelled()
    }

    /// Resolves when this session has ended or been superseded.
    pub async fn ended(&self) {
        self.session.cancelled().await
    }

    async fn apply(&self, t: Transition) -> bool {
        let Some(inner) = self.lifecycle.upgrade() else {
            return false;
        };
        inner.apply(self.generation, t).await
    }
}

struct Attempt {
    generation: u64,
    provider: Arc<dyn SessionProvider>,
    session: CancellationToken,
}

#[derive(Clone)]
pub struct SessionLifecycle {
    inner: Arc<LifecycleInner>,
}

impl SessionLifecycle {
    pub fn new(
        factory: Arc<dyn ProviderFactory>,
        directory: Arc<GroupDirectory>,
        dispatcher: Arc<NotificationDispatcher>,
        events: mpsc::Sender<InboundEvent>,
        timings: LifecycleTimings,
    ) -> Self {
        Self {
            inner: Arc::new(LifecycleInner {
                factory,
                directory,
                dispatcher,
                events,
                timings,
                state: Mutex::new(SessionState::default()),
                gate: Mutex::new(None),
            }),
        }
    }

    /// Spawn the driver task. Call once.
    pub fn start(&self) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move { this.run().await })
    }

    pub fn directory(&self) -> &Arc<GroupDirectory> {
        &self.inner.directory
    }

    pub async fn snapshot(&self) -> StatusSnapshot {
        let st = self.inner.state.lock().await;
        StatusSnapshot {
            phase: st.phase,
            challenge_url: st.challenge_url().map(str::to_string),
            is_active: st.phase == Phase::Active,
            provider_started: st.generation > 0,
            failure_count: st.failure_count,
            last_attempt_at: st.last_attempt_at,
            cooldown_until: st.cooldown_until,
            account: st.account.clone(),
        }
    }

    /// Force a directory refresh through the live provider.
    ///
    /// Fails with [`Error::NotActive`] when no session is logged in.
    pub async fn refresh_directory(&self) -> Result<Vec<GroupInfo>> {
        let generation = {
            let st = self.inner.state.lock().await;
            if st.phase != Phase::Active {
                return Err(Error::NotActive);
            }
            st.generation
        };

        let (provider, session) = {
            let gate = self.inner.gate.lock().await;
            match gate.as_ref() {
                Some(cur) if cur.generation == generation => {
                    (cur.provider.clone(), cur.session.clone())
                }
                _ => return Err(Error::NotActive),
            }
        };

        refresh_until_ended(&self.inner.directory, provider.as_ref(), &session).await
    }

    /// Tear down the live provider, if any. Used on process shutdown.
    pub async fn shutdown(&self) {
        let mut gate = self.inner.gate.lock().await;
        if let Some(cur) = gate.take() {
            cur.session.cancel();
            cur.provider.shutdown().await;
        }
    }

    async fn run(self) {
        loop {
            let attempt = self.begin_attempt().await;
            self.drive(&attempt).await;
            self.cool_down().await;
        }
    }

    async fn begin_attempt(&self) -> Attempt {
        let mut gate = self.inner.gate.lock().await;

        if let Some(old) = gate.take() {
            old.session.cancel();
            old.provider.shutdown().await;
            tracing::debug!(generation = old.generation, "previous provider torn down");
        }

        let provider = self.inner.factory.create();
        let generation = {
            let mut st = self.inner.state.lock().await;
            if !st.apply(Transition::Begin { at: Utc::now() }) {
                tracing::warn!(phase = ?st.phase, "login attempt started from unexpected phase");
            }
            st.generation
        };
        let session = CancellationToken::new();

        *gate = Some(CurrentProvider {
            generation,
            provider: provider.clone(),
            session: session.clone(),
        });
        tracing::info!(generation, "starting login attempt");

        Attempt {
            generation,
            provider,
            session,
        }
    }

    async fn drive(&self, attempt: &Attempt) {
        let sink = ProviderSink {
            lifecycle: Arc::downgrade(&self.inner),
            generation: attempt.generation,
            session: attempt.session.clone(),
            events: self.inner.events.clone(),
        };

        match attempt.provider.login(sink.clone()).await {
            Ok(account) => {
                let authenticated = self
                    .inner
                    .apply(
                        attempt.generation,
                        Transition::Authenticated {
                            account: account.clone(),
                        },
                    )
                    .await;
                if authenticated {
                    tracing::info!(account = %account, "login succeeded");
                    self.on_active(attempt).await;
                } else {
                    sink.terminated("login confirmed after the session had ended")
                        .await;
                }
            }
            Err(e) => sink.terminated(&format!("login failed: {e}")).await,
        }

        attempt.session.cancelled().await;
    }

    async fn on_active(&self, attempt: &Attempt) {
        match refresh_until_ended(&self.inner.directory, attempt.provider.as_ref(), &attempt.session)
            .await
        {
            Ok(_) => {}
            // Session ended mid-refresh; the disconnect alert covers it.
            Err(Error::NotActive) => return,
            Err(e) => {
                tracing::warn!("initial group refresh failed: {e}");
                self.alert(
                    "Group list refresh failed",
                    format!("Could not load the group list after login: {e}"),
                );
            }
        }

        tokio::spawn(heartbeat(
            attempt.provider.clone(),
            attempt.session.clone(),
            self.inner.timings.heartbeat_interval,
        ));

        let this = self.clone();
        let provider = attempt.provider.clone();
        let session = attempt.session.clone();
        tokio::spawn(async move { this.refresh_loop(provider, session).await });
    }

    async fn refresh_loop(self, provider: Arc<dyn SessionProvider>, session: CancellationToken) {
        let mut ticker = interval(self.inner.timings.refresh_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = session.cancelled() => return,
                _ = ticker.tick() => {}
            }

            match refresh_until_ended(&self.inner.directory, provider.as_ref(), &session).await {
                Ok(_) => {}
                Err(Error::NotActive) => return,
                Err(e) => {
                    tracing::warn!("periodic group refresh failed: {e}");
                    self.alert(
                        "Group list refresh failed",
                        format!("Periodic group list refresh failed: {e}"),
                    );
                }
            }
        }
    }

    async fn cool_down(&self) {
        let cooldown = self.inner.timings.cooldown;
        let (failures, delay) = {
            let mut st = self.inner.state.lock().await;
            let failures = st.failure_count;
            let delay = cooldown.delay_for(failures);
            let until = Utc::now()
                + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
            st.apply(Transition::CoolDown { until });
            (failures, delay)
        };

        tracing::warn!(
            failures,
            cooldown_secs = delay.as_secs(),
            "session logged out; cooling down before next login"
        );
        self.alert(
            "Chat session disconnected",
            format!(
                "The chat session was logged out (consecutive failures: {failures}). \
                 Next login attempt in {} seconds; scan the new QR code on the console page.",
                delay.as_secs()
            ),
        );

        sleep(delay).await;
        self.inner.state.lock().await.apply(Transition::Expire);
    }

    /// Best-effort lifecycle alert; never blocks the caller.
    fn alert(&self, subject: &str, body: String) {
        let dispatcher = self.inner.dispatcher.clone();
        let subject = subject.to_string();
        tokio::spawn(async move {
            if let Err(e) = dispatcher.dispatch(&subject, &body).await {
                tracing::error!("lifecycle alert dropped: {e}");
            }
        });
    }
}

/// Refresh the directory unless the session ends first, in which case the
/// in-flight listing is dropped before it can swap anything in.
async fn refresh_until_ended(
    directory: &GroupDirectory,
    provider: &dyn SessionProvider,
    session: &CancellationToken,
) -> Result<Vec<GroupInfo>> {
    tokio::select! {
        _ = session.cancelled() => Err(Error::NotActive),
        res = directory.refresh(provider) => res,
    }
}

async fn heartbeat(provider: Arc<dyn SessionProvider>, session: CancellationToken, every: Duration) {
    let mut ticker = interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = session.cancelled() => return,
            _ = ticker.tick() => {}
        }

        let alive = tokio::select! {
            _ = session.cancelled() => return,
            alive = provider.alive() => alive,
        };
        if !alive {
            // Diagnostic only: the provider's own termination signal drives the phase.
            tracing::warn!("heartbeat: session provider is not alive; stopping heartbeat");
            return;
        }
        tracing::debug!("heartbeat ok");
    }
}
