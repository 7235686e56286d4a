//! Pure session state machine. All time values are passed in; no clock access.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Uninitialized,
    AwaitingChallenge,
    Authenticating,
    Active,
    LoggedOut,
    CoolingDown,
}

impl Phase {
    /// Phases in which a provider instance is (or may become) logged in.
    pub fn is_live(self) -> bool {
        matches!(
            self,
            Self::AwaitingChallenge | Self::Authenticating | Self::Active
        )
    }
}

/// Scannable login credential issued by the provider.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Challenge {
    pub token: String,
    pub url: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Transition {
    /// Start a new attempt (new provider generation).
    Begin { at: DateTime<Utc> },
    /// Provider issued or re-issued a challenge.
    Challenge(Challenge),
    /// Challenge was scanned; waiting for confirmation.
    Scanned,
    Authenticated { account: String },
    /// Logout, transport error, or failed login.
    Terminated,
    CoolDown { until: DateTime<Utc> },
    /// Cooldown elapsed; ready for the next attempt.
    Expire,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionState {
    pub phase: Phase,
    challenge: Option<Challenge>,
    pub failure_count: u32,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub cooldown_until: Option<DateTime<Utc>>,
    pub generation: u64,
    pub account: Option<String>,
}

impl Default for SessionState {
    fn default() -> Self {
        Self {
            phase: Phase::Uninitialized,
            challenge: None,
            failure_count: 0,
            last_attempt_at: None,
            cooldown_until: None,
            generation: 0,
            account: None,
        }
    }
}

impl SessionState {
    pub fn challenge(&self) -> Option<&Challenge> {
        self.challenge.as_ref()
    }

    pub fn challenge_url(&self) -> Option<&str> {
        self.challenge
            .as_ref()
            .map(|c| c.url.as_str())
            .filter(|u| !u.is_empty())
    }

    /// Apply `t` if it is valid from the current phase.
    ///
    /// Returns `false` (and leaves the state untouched) otherwise. The
    /// challenge is dropped on every phase change, so it only ever exists in
    /// `AwaitingChallenge`.
    pub fn apply(&mut self, t: Transition) -> bool {
        let next = match (&t, self.phase) {
            (Transition::Begin { .. }, Phase::Uninitialized) => Phase::AwaitingChallenge,
            // A fresh challenge after a scan means the scan was abandoned.
            (Transition::Challenge(_), Phase::AwaitingChallenge | Phase::Authenticating) => {
                Phase::AwaitingChallenge
            }
            (Transition::Scanned, Phase::AwaitingChallenge) => Phase::Authenticating,
            (
                Transition::Authenticated { .. },
                Phase::AwaitingChallenge | Phase::Authenticating,
            ) => Phase::Active,
            (Transition::Terminated, p) if p.is_live() => Phase::LoggedOut,
            (Transition::CoolDown { .. }, Phase::LoggedOut) => Phase::CoolingDown,
            (Transition::Expire, Phase::CoolingDown) => Phase::Uninitialized,
            _ => return false,
        };

        if next != self.phase {
            self.challenge = None;
        }

        match t {
            Transition::Begin { at } => {
                self.generation += 1;
                self.last_attempt_at = Some(at);
                self.cooldown_until = None;
                self.account = None;
            }
            Transition::Challenge(c) => self.challenge = Some(c),
            Transition::Scanned => {}
            Transition::Authenticated { account } => {
                self.failure_count = 0;
                self.account = Some(account);
            }
            Transition::Terminated => {
                self.failure_count = self.failure_count.saturating_add(1);
            }
            Transition::CoolDown { until } => self.cooldown_until = Some(until),
            Transition::Expire => self.cooldown_until = None,
        }

        self.phase = next;
        true
    }
}

/// Reconnect backoff: linear in the failure count, then a fixed cap.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CooldownPolicy {
    pub base: Duration,
    pub cap: Duration,
    /// Failure count above which `cap` applies.
    pub escalate_after: u32,
}

impl Default for CooldownPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(60),
            cap: Duration::from_secs(300),
            escalate_after: 2,
        }
    }
}

impl CooldownPolicy {
    pub fn delay_for(&self, failure_count: u32) -> Duration {
        if failure_count > self.escalate_after {
            return self.cap;
        }
        self.base
            .saturating_mul(failure_count.min(self.escalate_after + 1))
            .min(self.cap)
    }
}
