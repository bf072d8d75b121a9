use anyhow::Result;
use courier_api::ApiState;
use courier_core::{Config, CourierContext, DispatchQueue, SharedClock, SystemClock};
use courier_delivery::{DispatchWorker, ResendEmailTransport, TransportRegistry};
use courier_outbox::{OutboxRelay, ScheduledReleasePoller};
use courier_webhook::WebhookFanout;
use std::sync::Arc;
use std::time::Duration;
use tokio;
use tokio_util::sync::CancellationToken;
use tracing;
use tracing_subscriber;

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    if std::env::var("LOG_FORMAT").as_deref() == Ok("json") {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(terminate) => terminate,
        Err(e) => {
            tracing::warn!("Failed to install SIGTERM handler: {}", e);
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = terminate.recv() => {}
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    tracing::info!("Starting Courier notification pipeline");

    let config = Config::from_env();
    let ctx = CourierContext::new(config).await?;

    tracing::info!("Courier context initialized");

    let clock: SharedClock = Arc::new(SystemClock);
    let queue = Arc::new(DispatchQueue::new());
    let webhooks = Arc::new(WebhookFanout::new(
        ctx.stores.webhooks.clone(),
        clock.clone(),
        &ctx.config.webhook,
    )?);

    let mut transports = TransportRegistry::new();
    if let Some(email) = ResendEmailTransport::from_config(&ctx.config.delivery)? {
        transports.register(Arc::new(email));
    }
    let transports = Arc::new(transports);

    let cancel = CancellationToken::new();
    let mut handles = Vec::new();

    let relay = OutboxRelay::new(
        ctx.stores.outbox.clone(),
        ctx.stores.notifications.clone(),
        queue.clone(),
        clock.clone(),
        ctx.config.outbox.clone(),
    );
    let token = cancel.clone();
    handles.push(tokio::spawn(async move {
        if let Err(e) = relay.run(token).await {
            tracing::error!("Outbox relay error: {}", e);
        }
    }));

    let scheduler = ScheduledReleasePoller::new(
        ctx.stores.notifications.clone(),
        queue.clone(),
        clock.clone(),
        ctx.config.scheduler.clone(),
    );
    let token = cancel.clone();
    handles.push(tokio::spawn(async move {
        if let Err(e) = scheduler.run(token).await {
            tracing::error!("Scheduled release poller error: {}", e);
        }
    }));

    let send_timeout = Duration::from_secs(ctx.config.delivery.send_timeout_secs);
    for worker_id in 0..ctx.config.delivery.worker_count {
        let worker = DispatchWorker::new(
            ctx.stores.notifications.clone(),
            queue.clone(),
            transports.clone(),
            webhooks.clone(),
            clock.clone(),
            send_timeout,
        );
        let token = cancel.clone();
        handles.push(tokio::spawn(async move {
            if let Err(e) = worker.run(worker_id, token).await {
                tracing::error!("Dispatch worker {} error: {}", worker_id, e);
            }
        }));
    }

    let state = ApiState {
        queue: queue.clone(),
        transports: transports.clone(),
    };
    let server_config = ctx.config.server.clone();
    let token = cancel.clone();
    handles.push(tokio::spawn(async move {
        if let Err(e) = courier_api::run(state, &server_config, token).await {
            tracing::error!("API server error: {}", e);
        }
    }));

    shutdown_signal().await;
    tracing::info!("Shutdown requested, stopping workers");
    cancel.cancel();

    futures::future::join_all(handles).await;
    webhooks.wait_idle().await;

    tracing::info!("Courier stopped");
    Ok(())
}
