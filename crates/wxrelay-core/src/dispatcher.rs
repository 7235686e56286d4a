use std::{sync::Arc, time::Duration};

use tokio::time::sleep;

use crate::{domain::NotificationJob, errors::Error, ports::Notifier, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts per notification, including the first.
    pub max_attempts: u32,
    /// Fixed wait between attempts.
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delay: Duration::from_secs(2),
        }
    }
}

/// Delivers notifications through a [`Notifier`] with bounded retry.
///
/// Delivery is best-effort: callers log the returned error and move on.
pub struct NotificationDispatcher {
    notifier: Arc<dyn Notifier>,
    retry: RetryPolicy,
}

impl NotificationDispatcher {
    pub fn new(notifier: Arc<dyn Notifier>, retry: RetryPolicy) -> Self {
        Self { notifier, retry }
    }

    pub fn job(&self, subject: impl Into<String>, body: impl Into<String>) -> NotificationJob {
        NotificationJob::new(subject, body, self.retry.max_attempts.max(1))
    }

    pub async fn dispatch(&self, subject: &str, body: &str) -> Result<()> {
        self.run(self.job(subject, body)).await
    }

    /// Attempt delivery until success or until the job's attempts run out.
    pub async fn run(&self, mut job: NotificationJob) -> Result<()> {
        let total = job.attempts_remaining;
        let mut last = String::from("no attempts made");

        while job.attempts_remaining > 0 {
            job.attempts_remaining -= 1;
            let attempt = total - job.attempts_remaining;

            match self.notifier.send(&job.subject, &job.body).await {
                Ok(()) => {
                    tracing::info!(subject = %job.subject, attempt, "notification delivered");
                    return Ok(());
                }
                Err(e) => {
                    tracing::warn!(
                        subject = %job.subject,
                        "notification failed (attempt {attempt}/{total}): {e}"
                    );
                    last = e.to_string();
                }
            }

            if job.attempts_remaining > 0 {
                sleep(self.retry.delay).await;
            }
        }

        Err(Error::Delivery {
            attempts: total,
            last,
        })
    }
}
