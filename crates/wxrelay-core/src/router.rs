use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinSet;

use crate::{
    directory::GroupDirectory,
    dispatcher::NotificationDispatcher,
    domain::{InboundEvent, NotificationJob, Origin},
    policy::ForwardingPolicy,
    settings::SettingsStore,
};

/// Consumes inbound events and turns positive forwarding decisions into
/// notification jobs.
pub struct EventRouter {
    policy: ForwardingPolicy,
    directory: Arc<GroupDirectory>,
    dispatcher: Arc<NotificationDispatcher>,
    settings: Arc<SettingsStore>,
}

impl EventRouter {
    pub fn new(
        policy: ForwardingPolicy,
        directory: Arc<GroupDirectory>,
        dispatcher: Arc<NotificationDispatcher>,
        settings: Arc<SettingsStore>,
    ) -> Self {
        Self {
            policy,
            directory,
            dispatcher,
            settings,
        }
    }

    /// Decide what (if anything) to send for one event.
    pub async fn route(&self, event: &InboundEvent) -> Option<NotificationJob> {
        if event.from_self {
            tracing::debug!("dropping message sent by this account");
            return None;
        }

        let sender = event.sender.resolved_name();
        match &event.origin {
            Origin::Unknown => {
                tracing::debug!(sender, "dropping message from unrecognised sender type");
                return None;
            }
            Origin::Group { group_id } => {
                let blocked = self.settings.current().await.blocked_groups;
                if blocked.iter().any(|g| g == group_id) {
                    // blockedGroups is exposed for editing but not applied to forwarding.
                    tracing::debug!(group_id, "group is listed in blockedGroups (not enforced)");
                }
            }
            Origin::Direct => {}
        }

        let snapshot = self.directory.snapshot().await;
        let forward = self.policy.decide(event, &snapshot);

        match &forward {
            Some(f) => tracing::info!("{}: {}", f.subject, f.body),
            None => tracing::debug!(sender, "message not forwarded"),
        }

        forward.map(|f| self.dispatcher.job(f.subject, f.body))
    }

    /// Route events until the channel closes, then wait for in-flight
    /// deliveries to finish.
    pub async fn run(self, mut events: mpsc::Receiver<InboundEvent>) {
        let mut inflight = JoinSet::new();

        loop {
            tokio::select! {
                next = events.recv() => {
                    let Some(event) = next else {
                        break;
                    };
                    if let Some(job) = self.route(&event).await {
                        let dispatcher = self.dispatcher.clone();
                        inflight.spawn(async move {
                            if let Err(e) = dispatcher.run(job).await {
                                tracing::error!("notification dropped: {e}");
                            }
                        });
                    }
                }
                Some(done) = inflight.join_next(), if !inflight.is_empty() => {
                    if let Err(e) = done {
                        tracing::error!("notification task failed: {e}");
                    }
                }
            }
        }

        while let Some(done) = inflight.join_next().await {
            if let Err(e) = done {
                tracing::error!("notification task failed: {e}");
            }
        }
        tracing::info!("event router stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        dispatcher::RetryPolicy,
        domain::{Content, GroupInfo, Sender},
        ports::{GroupSource, Notifier},
        Error, Result,
    };
    use async_trait::async_trait;
    use std::time::Duration;

    #[derive(Default)]
    struct RecordingNotifier {
        sent: std::sync::Mutex<Vec<(String, String)>>,
        fail: bool,
    }

    #[async_trait]
    impl Notifier for RecordingNotifier {
        async fn send(&self, subject: &str, body: &str) -> Result<()> {
            self.sent
                .lock()
                .unwrap()
                .push((subject.to_string(), body.to_string()));
            if self.fail {
                return Err(Error::External("relay down".to_string()));
            }
            Ok(())
        }
    }

    struct StaticGroups(Vec<&'static str>);

    #[async_trait]
    impl GroupSource for StaticGroups {
        async fn list_groups(&self) -> Result<Vec<GroupInfo>> {
            Ok(self
                .0
                .iter()
                .map(|id| GroupInfo {
                    id: id.to_string(),
                    name: id.to_string(),
                })
                .collect())
        }
    }

    async fn router(notifier: Arc<RecordingNotifier>, member_of: Vec<&'static str>) -> EventRouter {
        let directory = Arc::new(GroupDirectory::new(Duration::ZERO));
        directory.refresh(&StaticGroups(member_of)).await.unwrap();
        EventRouter::new(
            ForwardingPolicy::default(),
            directory,
            Arc::new(NotificationDispatcher::new(
                notifier,
                RetryPolicy {
                    max_attempts: 3,
                    delay: Duration::from_secs(2),
                },
            )),
            Arc::new(SettingsStore::new(vec!["G1".to_string()], None)),
        )
    }

    fn event(origin: Origin, content: Content) -> InboundEvent {
        InboundEvent {
            origin,
            sender: Sender {
                display_name: "Alice W.".to_string(),
                alias: Some("Alice".to_string()),
            },
            content,
            from_self: false,
        }
    }

    fn group(id: &str) -> Origin {
        Origin::Group {
            group_id: id.to_string(),
        }
    }

    #[tokio::test]
    async fn self_sent_messages_are_discarded() {
        let r = router(Arc::new(RecordingNotifier::default()), vec![]).await;
        let mut ev = event(Origin::Direct, Content::text("note to self"));
        ev.from_self = true;
        assert_eq!(r.route(&ev).await, None);
    }

    #[tokio::test]
    async fn job_uses_alias_and_full_retry_budget() {
        let r = router(Arc::new(RecordingNotifier::default()), vec![]).await;
        let job = r
            .route(&event(Origin::Direct, Content::Voice))
            .await
            .unwrap();
        assert_eq!(job.subject, "Alice");
        assert_eq!(job.body, "[voice]");
        assert_eq!(job.attempts_remaining, 3);
    }

    #[tokio::test]
    async fn blocked_groups_do_not_change_forwarding() {
        // G1 is both a member group and listed in blockedGroups.
        let r = router(Arc::new(RecordingNotifier::default()), vec!["G1"]).await;
        assert!(r
            .route(&event(group("G1"), Content::text("hello")))
            .await
            .is_some());
    }

    #[tokio::test]
    async fn run_dispatches_forwarded_events_and_drains() {
        let notifier = Arc::new(RecordingNotifier::default());
        let r = router(notifier.clone(), vec!["G2"]).await;
        let (tx, rx) = mpsc::channel(8);

        for ev in [
            event(group("G1"), Content::text("@all meeting now")),
            event(group("G1"), Content::text("hello")),
            event(group("G2"), Content::text("hello")),
            event(Origin::Unknown, Content::text("promo")),
            event(Origin::Direct, Content::Unknown),
        ] {
            tx.send(ev).await.unwrap();
        }
        drop(tx);
        r.run(rx).await;

        let mut sent = notifier.sent.lock().unwrap().clone();
        sent.sort();
        assert_eq!(
            sent,
            vec![
                ("Alice".to_string(), "@all meeting now".to_string()),
                ("Alice".to_string(), "hello".to_string()),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn delivery_failure_does_not_stop_routing() {
        let notifier = Arc::new(RecordingNotifier {
            fail: true,
            ..RecordingNotifier::default()
        });
        let r = router(notifier.clone(), vec![]).await;
        let (tx, rx) = mpsc::channel(8);
        tx.send(event(Origin::Direct, Content::text("one"))).await.unwrap();
        tx.send(event(Origin::Direct, Content::text("two"))).await.unwrap();
        drop(tx);

        r.run(rx).await;

        // Three attempts each, both events processed.
        assert_eq!(notifier.sent.lock().unwrap().len(), 6);
    }
}
