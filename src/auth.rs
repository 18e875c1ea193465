//! Credential storage and refresh coordination.
//!
//! [`TokenCoordinator`] hands out access tokens to any number of concurrent
//! callers. When the stored token is inside the safety margin it starts a
//! refresh, and every caller that arrives while that refresh is running
//! awaits the same shared future instead of issuing its own HTTP call.

use crate::error::{AuthError, Result};
use crate::types::RefreshTokenResponse;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use futures_util::future::{BoxFuture, FutureExt, Shared};
use log::*;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;

/// Gets the current UTC timestamp in milliseconds since the Unix epoch.
pub fn get_timestamp_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Credential bundle. The expiry always travels with the access token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenData {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: DateTime<Utc>,
}

/// Durable key-value storage for [`TokenData`], provided by the application.
#[async_trait]
pub trait TokenStore: Send + Sync + 'static {
    async fn load(&self) -> Option<TokenData>;
    async fn save(&self, data: TokenData);
    async fn clear(&self);
}

/// The network call that exchanges a refresh token for a new access token.
#[async_trait]
pub trait TokenRefresher: Send + Sync + 'static {
    async fn refresh(&self, refresh_token: &str) -> Result<RefreshTokenResponse>;
}

/// Process-local [`TokenStore`], handy for tests and short-lived tools.
#[derive(Default)]
pub struct MemoryTokenStore {
    data: Mutex<Option<TokenData>>,
}

impl MemoryTokenStore {
    pub fn new(initial: Option<TokenData>) -> Self {
        Self {
            data: Mutex::new(initial),
        }
    }
}

#[async_trait]
impl TokenStore for MemoryTokenStore {
    async fn load(&self) -> Option<TokenData> {
        self.data.lock().await.clone()
    }

    async fn save(&self, data: TokenData) {
        *self.data.lock().await = Some(data);
    }

    async fn clear(&self) {
        *self.data.lock().await = None;
    }
}

type RefreshFuture = Shared<BoxFuture<'static, Result<String, AuthError>>>;

struct InFlight {
    id: u64,
    future: RefreshFuture,
}

// Type alias for the shared in-flight slot
type InFlightSlot = Arc<Mutex<Option<InFlight>>>;

pub struct TokenCoordinator {
    store: Arc<dyn TokenStore>,
    refresher: Arc<dyn TokenRefresher>,
    margin: Duration,
    in_flight: InFlightSlot,
    next_flight_id: AtomicU64,
}

impl TokenCoordinator {
    pub fn new(
        store: Arc<dyn TokenStore>,
        refresher: Arc<dyn TokenRefresher>,
        margin: Duration,
    ) -> Self {
        Self {
            store,
            refresher,
            margin,
            in_flight: Arc::new(Mutex::new(None)),
            next_flight_id: AtomicU64::new(1),
        }
    }

    /// Returns an access token that stays valid for longer than the margin,
    /// refreshing it first if needed.
    ///
    /// Concurrent callers share one refresh: exactly one call reaches the
    /// [`TokenRefresher`] and all of them observe its outcome.
    pub async fn get_valid_token(&self) -> Result<String, AuthError> {
        let flight = {
            let mut slot = self.in_flight.lock().await;
            match slot.as_ref() {
                Some(in_flight) => {
                    debug!("Joining in-flight token refresh #{}", in_flight.id);
                    in_flight.future.clone()
                }
                None => {
                    if let Some(token) = self.store.load().await {
                        if self.is_usable(&token) {
                            return Ok(token.access_token);
                        }
                    }
                    let id = self.next_flight_id.fetch_add(1, Ordering::Relaxed);
                    debug!("Starting token refresh #{}", id);
                    let future = run_refresh(
                        id,
                        Arc::clone(&self.store),
                        Arc::clone(&self.refresher),
                        Arc::clone(&self.in_flight),
                    )
                    .boxed()
                    .shared();
                    *slot = Some(InFlight {
                        id,
                        future: future.clone(),
                    });
                    future
                }
            }
        };
        flight.await
    }

    /// Marks `stale_access_token` as expired so the next
    /// [`get_valid_token`](Self::get_valid_token) refreshes it.
    ///
    /// Does nothing if the store already holds a different token or a refresh
    /// is running, so a burst of 401s costs a single refresh.
    pub async fn invalidate(&self, stale_access_token: &str) {
        let slot = self.in_flight.lock().await;
        if slot.is_some() {
            return;
        }
        if let Some(mut token) = self.store.load().await {
            if token.access_token == stale_access_token {
                debug!("Invalidating rejected access token");
                token.expires_at = Utc::now();
                self.store.save(token).await;
            }
        }
        drop(slot);
    }

    /// Stores the credentials obtained at login.
    pub async fn store_login(&self, data: TokenData) {
        self.store.save(data).await;
    }

    pub async fn logout(&self) {
        info!("Clearing stored credentials");
        self.store.clear().await;
    }

    pub async fn current(&self) -> Option<TokenData> {
        self.store.load().await
    }

    pub async fn is_refreshing(&self) -> bool {
        self.in_flight.lock().await.is_some()
    }

    fn is_usable(&self, token: &TokenData) -> bool {
        token.expires_at - Utc::now() > self.margin
    }
}

/// Body of a shared refresh. Clears its own in-flight marker on completion.
async fn run_refresh(
    id: u64,
    store: Arc<dyn TokenStore>,
    refresher: Arc<dyn TokenRefresher>,
    slot: InFlightSlot,
) -> Result<String, AuthError> {
    let outcome = perform_refresh(store.as_ref(), refresher.as_ref()).await;

    let mut guard = slot.lock().await;
    if guard.as_ref().map(|f| f.id) == Some(id) {
        *guard = None;
    }
    drop(guard);

    match &outcome {
        Ok(_) => info!("Token refresh #{} succeeded", id),
        Err(e) => error!("Token refresh #{} failed: {}", id, e),
    }
    outcome
}

async fn perform_refresh(
    store: &dyn TokenStore,
    refresher: &dyn TokenRefresher,
) -> Result<String, AuthError> {
    let refresh_token = match store.load().await.and_then(|t| t.refresh_token) {
        Some(token) => token,
        None => {
            warn!("No refresh token stored, cannot refresh access token");
            return Err(AuthError::TokenUnavailable);
        }
    };

    match refresher.refresh(&refresh_token).await {
        Ok(response) => {
            let data = TokenData {
                access_token: response.access_token,
                refresh_token: response.refresh_token.or(Some(refresh_token)),
                expires_at: response.token_expiry,
            };
            let access_token = data.access_token.clone();
            store.save(data).await;
            Ok(access_token)
        }
        Err(e) => {
            store.clear().await;
            Err(AuthError::RefreshFailed(e.to_string()))
        }
    }
}
