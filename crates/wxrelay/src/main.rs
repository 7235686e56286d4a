use std::{sync::Arc, time::Duration};

use tokio::sync::mpsc;

use wxrelay_bridge::BridgeProviderFactory;
use wxrelay_core::{
    config::Config,
    directory::GroupDirectory,
    dispatcher::NotificationDispatcher,
    lifecycle::SessionLifecycle,
    policy::ForwardingPolicy,
    router::EventRouter,
    settings::SettingsStore,
};
use wxrelay_smtp::SmtpNotifier;

const EVENT_QUEUE: usize = 256;
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> Result<(), wxrelay_core::Error> {
    wxrelay_core::logging::init("wxrelay")?;

    let cfg = Config::load()?;

    let console = std::fs::read_to_string(&cfg.static_index).map_err(|e| {
        wxrelay_core::Error::Config(format!(
            "console page {} unavailable: {e}",
            cfg.static_index.display()
        ))
    })?;

    let notifier = Arc::new(SmtpNotifier::new(&cfg.mail)?);
    let dispatcher = Arc::new(NotificationDispatcher::new(notifier, cfg.notify_retry));
    let directory = Arc::new(GroupDirectory::new(cfg.group_settle));
    let settings = Arc::new(SettingsStore::new(
        cfg.blocked_groups.clone(),
        cfg.page_password.clone(),
    ));

    let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE);

    let router = EventRouter::new(
        ForwardingPolicy::new(cfg.mention_all_markers.clone()),
        directory.clone(),
        dispatcher.clone(),
        settings.clone(),
    );
    let router_task = tokio::spawn(router.run(events_rx));

    let factory = Arc::new(BridgeProviderFactory::new(
        cfg.session_bridge_url.clone(),
        cfg.qr_url_prefix.clone(),
    )?);
    let lifecycle = SessionLifecycle::new(
        factory,
        directory,
        dispatcher,
        events_tx,
        cfg.lifecycle,
    );
    let driver = lifecycle.start();

    let server = wxrelay_http::start(
        cfg.http_port,
        wxrelay_http::AppState::new(lifecycle.clone(), settings, console),
    )
    .await
    .map_err(|e| wxrelay_core::Error::External(format!("status surface failed: {e:#}")))?;

    tracing::info!(
        port = server.port,
        bridge = %cfg.session_bridge_url,
        "wxrelay started"
    );

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");

    server.stop();
    driver.abort();
    lifecycle.shutdown().await;
    // The router drains once the last event sender is gone.
    drop(lifecycle);
    match tokio::time::timeout(DRAIN_TIMEOUT, router_task).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::warn!("event router task failed: {e}"),
        Err(_) => tracing::warn!("gave up waiting for in-flight notifications"),
    }

    Ok(())
}
