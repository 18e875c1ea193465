//! STOMP-over-WebSocket session management for the delivery message bus.
//!
//! One [`ConnectionManager`] owns the process-wide session. It is made of a
//! few small parts that can also be used on their own:
//!
//! - [`stomp`]: STOMP 1.2 frame codec and heart-beat negotiation
//! - [`transport`]: SockJS-style session URLs, the authenticated WebSocket
//!   open, and optional SockJS envelopes
//! - [`SubscriptionRegistry`]: topic subscriptions that survive reconnects
//! - [`ReconnectScheduler`]: the single reconnect timer
//! - [`StatusBroadcaster`]: connected/disconnected notifications
//!
//! # Usage
//!
//! ```no_run
//! use delivery_realtime_rs::auth::{MemoryTokenStore, TokenCoordinator};
//! use delivery_realtime_rs::rest::HttpTokenRefresher;
//! use delivery_realtime_rs::types::SessionIdentity;
//! use delivery_realtime_rs::websocket::ConnectionManager;
//! use delivery_realtime_rs::RealtimeConfig;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> delivery_realtime_rs::Result<()> {
//!     let config = RealtimeConfig::from_env()?;
//!     let tokens = Arc::new(TokenCoordinator::new(
//!         Arc::new(MemoryTokenStore::default()),
//!         Arc::new(HttpTokenRefresher::new(&config)?),
//!         config.token_refresh_margin(),
//!     ));
//!     let manager = ConnectionManager::new(config, tokens);
//!
//!     let _orders = manager
//!         .subscribe(
//!             "/topic/delivery-agent/42/assignments",
//!             Arc::new(|msg| println!("{}: {}", msg.topic, msg.body)),
//!         )
//!         .await;
//!     manager.connect(SessionIdentity::delivery_agent("42")).await?;
//!
//!     tokio::signal::ctrl_c().await?;
//!     manager.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! # Reconnection Behavior
//!
//! - Any transport or protocol failure moves the session to `Disconnected`,
//!   publishes `false` and arms one retry after `reconnect_delay_ms`
//! - Further failures while a retry is pending do not arm another
//! - Subscriptions active before the drop are re-sent after the reconnect
//! - [`ConnectionManager::disconnect`] cancels any pending retry
//!
//! Handlers run on the session task and should return quickly. A handler that
//! panics loses that one message; the session keeps running.

pub mod client;
pub mod reconnect;
pub mod status;
pub mod stomp;
pub mod subscriptions;
pub mod transport;

pub use client::{ConnectionManager, ConnectionState, SubscriptionHandle};
pub use reconnect::{BackoffPolicy, ExponentialBackoff, FixedDelay, NeverReconnect, ReconnectScheduler};
pub use status::{StatusBroadcaster, StatusListener};
pub use stomp::{Command, StompFrame};
pub use subscriptions::{
    FrameSink, InboundMessage, MessageHandler, SubscribeOutcome, SubscriptionRegistry,
    SubscriptionState,
};
