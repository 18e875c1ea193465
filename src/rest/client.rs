use crate::auth::{TokenCoordinator, TokenRefresher};
use crate::config::RealtimeConfig;
use crate::error::{RealtimeError, Result};
use crate::types::{RefreshTokenRequest, RefreshTokenResponse};
use async_trait::async_trait;
use log::*;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Client as HttpClient, Method, Request, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use url::Url;

const DEFAULT_TIMEOUT_SECONDS: u64 = 10;

fn build_http_client(timeout_sec: Option<u64>) -> Result<HttpClient> {
    let timeout_duration = Duration::from_secs(timeout_sec.unwrap_or(DEFAULT_TIMEOUT_SECONDS));
    Ok(HttpClient::builder().timeout(timeout_duration).build()?)
}

/// Exchanges a refresh token for new credentials over HTTP.
///
/// `POST {api_base_url}{refresh_path}` with `{"refreshToken": ...}`.
#[derive(Clone)]
pub struct HttpTokenRefresher {
    http_client: HttpClient,
    refresh_url: Url,
}

impl HttpTokenRefresher {
    pub fn new(config: &RealtimeConfig) -> Result<Self> {
        Self::with_client(build_http_client(None)?, config)
    }

    pub fn with_client(http_client: HttpClient, config: &RealtimeConfig) -> Result<Self> {
        let refresh_url = Url::parse(&config.api_base_url)?.join(&config.refresh_path)?;
        Ok(Self {
            http_client,
            refresh_url,
        })
    }
}

#[async_trait]
impl TokenRefresher for HttpTokenRefresher {
    async fn refresh(&self, refresh_token: &str) -> Result<RefreshTokenResponse> {
        debug!("POST {}", self.refresh_url);
        let response = self
            .http_client
            .post(self.refresh_url.clone())
            .json(&RefreshTokenRequest { refresh_token })
            .send()
            .await?;
        handle_response(response).await
    }
}

/// REST client for authenticated calls against the delivery API.
///
/// Every request carries `Authorization: Bearer <token>` from the shared
/// [`TokenCoordinator`]. A 401 invalidates that token, fetches a valid one
/// and retries the request once.
#[derive(Clone)]
pub struct Client {
    http_client: HttpClient,
    base_url: Url,
    tokens: Arc<TokenCoordinator>,
}

impl Client {
    pub fn new(
        config: &RealtimeConfig,
        tokens: Arc<TokenCoordinator>,
        timeout_sec: Option<u64>,
    ) -> Result<Self> {
        Ok(Self {
            http_client: build_http_client(timeout_sec)?,
            base_url: Url::parse(&config.api_base_url)?,
            tokens,
        })
    }

    fn build_authenticated_request<B: Serialize + ?Sized>(
        &self,
        method: Method,
        path: &str,
        body: Option<&B>,
        access_token: &str,
    ) -> Result<Request> {
        let full_url = self.base_url.join(path)?;

        let mut headers = HeaderMap::new();
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {}", access_token))?,
        );
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let mut request_builder = self.http_client.request(method, full_url).headers(headers);
        if let Some(b) = body {
            request_builder = request_builder.json(b);
        }
        Ok(request_builder.build()?)
    }

    /// Sends an authenticated request, retrying once after a 401.
    pub async fn send_authenticated<T, B>(
        &self,
        method: Method,
        path: &str,
        body: Option<&B>,
    ) -> Result<T>
    where
        T: DeserializeOwned,
        B: Serialize + ?Sized,
    {
        let token = self.tokens.get_valid_token().await?;
        let request = self.build_authenticated_request(method.clone(), path, body, &token)?;
        let response = self.http_client.execute(request).await?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return handle_response(response).await;
        }

        warn!("{} {} returned 401, refreshing credentials and retrying once", method, path);
        self.tokens.invalidate(&token).await;
        let token = self.tokens.get_valid_token().await?;
        let request = self.build_authenticated_request(method, path, body, &token)?;
        let response = self.http_client.execute(request).await?;
        handle_response(response).await
    }

    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        self.send_authenticated::<T, ()>(Method::GET, path, None)
            .await
    }

    pub async fn post<T, B>(&self, path: &str, body: &B) -> Result<T>
    where
        T: DeserializeOwned,
        B: Serialize + ?Sized,
    {
        self.send_authenticated(Method::POST, path, Some(body)).await
    }
}

/// Maps a response to `T`, or to [`RealtimeError::ClientError`] /
/// [`RealtimeError::ServerError`] using the `code`/`message`/`data` fields of
/// the error body when present.
pub(crate) async fn handle_response<T: DeserializeOwned>(response: Response) -> Result<T> {
    let status = response.status();
    let headers = response.headers().clone();

    if status.is_success() {
        let parsed_body = response.json::<T>().await?;
        return Ok(parsed_body);
    }

    let error_body: Value = match response.json::<Value>().await {
        Ok(val) => val,
        Err(_) => {
            let message = format!(
                "Request failed with status {} (could not parse error body)",
                status
            );
            let error_kind = if status.is_client_error() {
                RealtimeError::ClientError {
                    status,
                    code: 0,
                    message,
                    data: None,
                    header: headers,
                }
            } else {
                RealtimeError::ServerError {
                    status,
                    code: 0,
                    message,
                    header: headers,
                }
            };
            return Err(error_kind);
        }
    };

    let code = error_body["code"].as_i64().unwrap_or(0);
    let message = error_body["message"]
        .as_str()
        .unwrap_or("Unknown error message")
        .to_string();
    let data = error_body.get("data").cloned();

    let error = if status.is_client_error() {
        RealtimeError::ClientError {
            status,
            code,
            message,
            data,
            header: headers,
        }
    } else {
        RealtimeError::ServerError {
            status,
            code,
            message,
            header: headers,
        }
    };
    Err(error)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_refresh_url_joins_path() {
        let config = RealtimeConfig {
            api_base_url: "http://localhost:8080".to_string(),
            ..RealtimeConfig::default()
        };
        let refresher = HttpTokenRefresher::new(&config).unwrap();
        assert_eq!(
            refresher.refresh_url.as_str(),
            "http://localhost:8080/api/auth/refresh-token"
        );
    }

    #[test]
    fn test_rejects_invalid_base_url() {
        let config = RealtimeConfig {
            api_base_url: "not a url".to_string(),
            ..RealtimeConfig::default()
        };
        assert!(matches!(
            HttpTokenRefresher::new(&config),
            Err(RealtimeError::UrlParseError(_))
        ));
    }
}
