// Access token refresh
//
// One refresh runs at a time. Requests that hit 401 while a refresh is in
// flight await the same shared future instead of starting their own.

use futures::future::{BoxFuture, FutureExt, Shared};
use reqwest::Client;
use std::sync::{Arc, Mutex, PoisonError};

use super::credentials::CredentialStore;
use super::session::SessionStore;
use super::types::{ApiResponse, RefreshPayload};
use crate::error::{extract_message, ClientError};

/// Message reported when the refresh endpoint gives no reason
const REFRESH_FAILED: &str = "Session expired, please sign in again";

/// Why a refresh attempt failed
///
/// Cloneable so every waiter on the shared future gets its own copy.
#[derive(Debug, Clone)]
pub struct RefreshFailure {
    pub status: Option<u16>,
    pub message: String,
}

impl RefreshFailure {
    fn new(status: Option<u16>, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

type RefreshOutcome = Result<String, RefreshFailure>;
type SharedRefresh = Shared<BoxFuture<'static, RefreshOutcome>>;

/// Coordinates access token refreshes for the request pipeline
pub struct RefreshCoordinator {
    /// Same client as the pipeline so the refresh cookie is shared
    client: Client,

    /// Full URL of the refresh endpoint
    refresh_url: String,

    credentials: Arc<dyn CredentialStore>,

    session: Arc<SessionStore>,

    /// Refresh currently in flight, if any
    in_flight: Mutex<Option<SharedRefresh>>,
}

impl RefreshCoordinator {
    pub fn new(
        client: Client,
        refresh_url: String,
        credentials: Arc<dyn CredentialStore>,
        session: Arc<SessionStore>,
    ) -> Self {
        Self {
            client,
            refresh_url,
            credentials,
            session,
            in_flight: Mutex::new(None),
        }
    }

    /// Obtain a fresh access token after a request sent with `stale` got 401
    ///
    /// If the stored token already differs from `stale`, another request has
    /// refreshed in the meantime and the stored token is returned without a
    /// network call. If it was cleared instead, the session already ended
    /// (failed refresh or sign-out) and no new refresh is started. On failure
    /// the session has already been ended.
    pub async fn refresh(&self, stale: Option<&str>) -> Result<String, ClientError> {
        match self.credentials.get() {
            Ok(Some(current)) if Some(current.as_str()) != stale => {
                tracing::debug!("Access token already refreshed by another request");
                return Ok(current);
            }
            Ok(None) if stale.is_some() => {
                tracing::debug!("Access token cleared while the request was in flight");
                return Err(ClientError::SessionExpired(REFRESH_FAILED.to_string()));
            }
            Ok(_) => {}
            Err(e) => tracing::warn!("Could not read stored access token: {:#}", e),
        }

        let refresh = self.join_or_start();
        let outcome = refresh.clone().await;
        self.finish(&refresh);

        outcome.map_err(|failure| ClientError::SessionExpired(failure.message))
    }

    /// Drop the local session after an unrecoverable 401
    pub fn end_session(&self) {
        end_session(self.credentials.as_ref(), &self.session);
    }

    fn join_or_start(&self) -> SharedRefresh {
        let mut slot = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);

        if let Some(existing) = slot.as_ref() {
            tracing::debug!("Joining in-flight token refresh");
            return existing.clone();
        }

        let refresh = self.start().boxed().shared();
        *slot = Some(refresh.clone());
        refresh
    }

    /// Forget the completed refresh unless a newer one replaced it
    fn finish(&self, refresh: &SharedRefresh) {
        let mut slot = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.as_ref().is_some_and(|current| current.ptr_eq(refresh)) {
            *slot = None;
        }
    }

    /// Build the refresh task; it owns everything it touches
    fn start(&self) -> impl std::future::Future<Output = RefreshOutcome> + Send + 'static {
        let client = self.client.clone();
        let url = self.refresh_url.clone();
        let credentials = Arc::clone(&self.credentials);
        let session = Arc::clone(&self.session);

        async move {
            tracing::info!("Refreshing access token...");

            let result = match request_access_token(&client, &url).await {
                Ok(token) => credentials.set(&token).map(|_| token).map_err(|e| {
                    RefreshFailure::new(None, format!("Failed to store refreshed token: {:#}", e))
                }),
                Err(failure) => Err(failure),
            };

            match result {
                Ok(token) => {
                    tracing::info!("Access token refreshed");
                    Ok(token)
                }
                Err(failure) => {
                    tracing::error!(
                        status = ?failure.status,
                        "Token refresh failed: {}",
                        failure.message
                    );
                    end_session(credentials.as_ref(), &session);
                    Err(failure)
                }
            }
        }
    }
}

/// Clear the stored token and tell the session store to drop the user
fn end_session(credentials: &dyn CredentialStore, session: &SessionStore) {
    if let Err(e) = credentials.clear() {
        tracing::error!("Failed to clear access token: {:#}", e);
    }
    session.expire();
}

/// Call the refresh endpoint
///
/// No access token is attached; the refresh cookie travels with the client's
/// cookie jar.
async fn request_access_token(client: &Client, url: &str) -> RefreshOutcome {
    let response = client
        .post(url)
        .send()
        .await
        .map_err(|e| RefreshFailure::new(None, format!("Failed to send refresh request: {}", e)))?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        let message = extract_message(&body).unwrap_or_else(|| REFRESH_FAILED.to_string());
        return Err(RefreshFailure::new(Some(status.as_u16()), message));
    }

    let envelope: ApiResponse<RefreshPayload> = response.json().await.map_err(|e| {
        RefreshFailure::new(
            Some(status.as_u16()),
            format!("Failed to parse refresh response: {}", e),
        )
    })?;

    match envelope.data.access_token {
        Some(token) if !token.is_empty() => Ok(token),
        _ => Err(RefreshFailure::new(
            Some(status.as_u16()),
            "Refresh response does not contain accessToken",
        )),
    }
}
