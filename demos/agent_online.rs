//! Brings a delivery agent online: listens for assignments, accepts every
//! request, and streams a (fake) location until Ctrl+C.
//!
//! Needs `DELIVERY_AGENT_ID`, `DELIVERY_ACCESS_TOKEN` and
//! `DELIVERY_REFRESH_TOKEN`, plus the usual `DELIVERY_*` connection settings.
use anyhow::Context;
use chrono::{Duration as ChronoDuration, Utc};
use delivery_realtime_rs::assignment::{LocationFix, OrderAssignmentClient, PingOutcome};
use delivery_realtime_rs::auth::{MemoryTokenStore, TokenCoordinator, TokenData};
use delivery_realtime_rs::rest::HttpTokenRefresher;
use delivery_realtime_rs::types::{AssignmentType, SessionIdentity};
use delivery_realtime_rs::websocket::ConnectionManager;
use delivery_realtime_rs::RealtimeConfig;
use std::env;
use std::sync::Arc;
use std::sync::Mutex;
use tokio::time::{interval, Duration};
use tracing::{error, info, warn};

fn setup_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .with_level(true)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    setup_logging();

    let config = RealtimeConfig::from_env()?;
    let agent_id: u64 = env::var("DELIVERY_AGENT_ID")
        .context("DELIVERY_AGENT_ID not set")?
        .parse()
        .context("DELIVERY_AGENT_ID must be numeric")?;
    // Stored expiry is unknown at startup; treat the token as nearly expired
    // so the first connect refreshes it.
    let login = TokenData {
        access_token: env::var("DELIVERY_ACCESS_TOKEN").context("DELIVERY_ACCESS_TOKEN not set")?,
        refresh_token: env::var("DELIVERY_REFRESH_TOKEN").ok(),
        expires_at: Utc::now() + ChronoDuration::minutes(1),
    };

    let tokens = Arc::new(TokenCoordinator::new(
        Arc::new(MemoryTokenStore::new(Some(login))),
        Arc::new(HttpTokenRefresher::new(&config)?),
        config.token_refresh_margin(),
    ));
    let manager = ConnectionManager::new(config, tokens);
    let client = OrderAssignmentClient::new(manager.clone(), agent_id);

    let active_order: Arc<Mutex<Option<u64>>> = Arc::new(Mutex::new(None));
    let responder = client.clone();
    let current = active_order.clone();
    let _assignments = client
        .subscribe_assignments(move |msg| match msg.kind {
            AssignmentType::Request => {
                info!("Order {} offered, accepting", msg.order_id);
                let responder = responder.clone();
                tokio::spawn(async move {
                    if let Err(e) = responder.accept(msg.order_id).await {
                        error!("Could not accept order {}: {}", msg.order_id, e);
                    }
                });
            }
            AssignmentType::Assigned => {
                info!("Order {} is ours", msg.order_id);
                if let Ok(mut current) = current.lock() {
                    *current = Some(msg.order_id);
                }
            }
            other => warn!("Order {}: {:?}", msg.order_id, other),
        })
        .await;
    let _status = client
        .subscribe_order_status(|update| info!("Order {} is now {}", update.order_id, update.status))
        .await;

    let mut status = manager.status();
    tokio::spawn(async move {
        while let Some(connected) = status.recv().await {
            info!("Message bus {}", if connected { "online" } else { "offline" });
        }
    });

    manager.connect(SessionIdentity::delivery_agent(agent_id.to_string())).await?;

    let pinger = client.location_pinger();
    let mut sensor = interval(Duration::from_secs(1));
    let mut fix = LocationFix::new(12.9716, 77.5946);
    loop {
        tokio::select! {
            _ = sensor.tick() => {
                let order_id = active_order.lock().ok().and_then(|o| *o);
                let Some(order_id) = order_id else { continue };
                fix.latitude += 0.0001;
                match pinger.ping(order_id, "OUT_FOR_DELIVERY", fix).await {
                    Ok(PingOutcome::Sent) => info!("Location sent for order {}", order_id),
                    Ok(PingOutcome::Throttled) => {}
                    Err(e) => warn!("Location not sent: {}", e),
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    manager.shutdown().await;
    Ok(())
}
