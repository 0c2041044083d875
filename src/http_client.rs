use anyhow::Context;
use reqwest::multipart::{Form, Part};
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::auth::{
    Attachment, CredentialStore, PersistentCookieJar, RefreshCoordinator, SessionStore,
};
use crate::error::{extract_message, ClientError};

/// Path of the token refresh endpoint, relative to the API base URL
const REFRESH_PATH: &str = "/users/refresh-token";

/// Message used when a replayed request is rejected again
const SESSION_REJECTED: &str = "Session expired, please sign in again";

/// Request body that can be rebuilt for a replay
#[derive(Debug, Clone)]
pub enum RequestBody {
    Empty,
    Json(serde_json::Value),
    Multipart(Vec<FormField>),
}

/// One multipart field
#[derive(Debug, Clone)]
pub enum FormField {
    Text { name: String, value: String },
    File { name: String, file: Attachment },
}

impl FormField {
    pub fn text(name: &str, value: impl Into<String>) -> Self {
        FormField::Text {
            name: name.to_string(),
            value: value.into(),
        }
    }

    pub fn file(name: &str, file: Attachment) -> Self {
        FormField::File {
            name: name.to_string(),
            file,
        }
    }
}

/// An outbound API call, replayable at most once after a token refresh
#[derive(Debug, Clone)]
pub struct PendingRequest {
    pub id: Uuid,
    pub method: Method,
    pub path: String,
    pub body: RequestBody,

    /// Whether a 401 may trigger refresh-and-retry
    pub refreshable: bool,

    /// Set once the request has been replayed after a refresh
    retried: bool,

    /// Token attached to the most recent attempt
    sent_with: Option<String>,
}

impl PendingRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            method,
            path: path.into(),
            body: RequestBody::Empty,
            refreshable: true,
            retried: false,
            sent_with: None,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn post(path: impl Into<String>) -> Self {
        Self::new(Method::POST, path)
    }

    pub fn patch(path: impl Into<String>) -> Self {
        Self::new(Method::PATCH, path)
    }

    /// Attach a JSON body
    pub fn json<T: serde::Serialize>(mut self, body: &T) -> Result<Self, ClientError> {
        let value = serde_json::to_value(body).context("Failed to serialize request body")?;
        self.body = RequestBody::Json(value);
        Ok(self)
    }

    pub fn multipart(mut self, fields: Vec<FormField>) -> Self {
        self.body = RequestBody::Multipart(fields);
        self
    }

    /// Treat a 401 as an ordinary failure (credential-issuing endpoints)
    pub fn without_refresh(mut self) -> Self {
        self.refreshable = false;
        self
    }

    pub fn is_retried(&self) -> bool {
        self.retried
    }
}

/// Connection settings for the API client
#[derive(Debug, Clone)]
pub struct HttpSettings {
    pub base_url: String,
    pub connect_timeout: u64,
    pub request_timeout: u64,
}

/// HTTP client for the content API with credential injection and
/// refresh-and-retry on 401
pub struct ApiClient {
    /// Shared HTTP client; its cookie jar carries the refresh credential and
    /// is saved to the credential store
    client: Client,

    /// API base URL without trailing slash
    base_url: String,

    credentials: Arc<dyn CredentialStore>,

    refresher: RefreshCoordinator,
}

impl ApiClient {
    /// Create a new API client
    pub fn new(
        settings: &HttpSettings,
        credentials: Arc<dyn CredentialStore>,
        session: Arc<SessionStore>,
    ) -> anyhow::Result<Self> {
        let cookies = PersistentCookieJar::load(Arc::clone(&credentials));

        let client = Client::builder()
            .cookie_provider(Arc::new(cookies))
            .connect_timeout(Duration::from_secs(settings.connect_timeout))
            .timeout(Duration::from_secs(settings.request_timeout))
            .build()
            .context("Failed to create HTTP client")?;

        let base_url = settings.base_url.trim_end_matches('/').to_string();

        let refresher = RefreshCoordinator::new(
            client.clone(),
            format!("{}{}", base_url, REFRESH_PATH),
            Arc::clone(&credentials),
            session,
        );

        Ok(Self {
            client,
            base_url,
            credentials,
            refresher,
        })
    }

    /// Absolute URL for an API path
    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Send a request, refreshing the access token once on 401
    ///
    /// Outcomes:
    /// - 2xx: the response
    /// - 401 on a refreshable request: refresh, replay once with the new
    ///   token, return the replay's outcome
    /// - 401 on the replay, or a failed refresh: `SessionExpired`, with the
    ///   local session already ended
    /// - anything else: `Http` or `Transport`, unchanged
    pub async fn send(&self, mut pending: PendingRequest) -> Result<Response, ClientError> {
        let token = self.current_token();
        let response = self.dispatch(&mut pending, token).await?;

        if response.status() != StatusCode::UNAUTHORIZED || !pending.refreshable || pending.retried
        {
            return check_status(response).await;
        }

        tracing::warn!(
            request_id = %pending.id,
            path = %pending.path,
            "Received 401, refreshing access token and retrying..."
        );
        pending.retried = true;

        let token = self.refresher.refresh(pending.sent_with.as_deref()).await?;
        let response = self.dispatch(&mut pending, Some(token)).await?;

        if response.status() == StatusCode::UNAUTHORIZED {
            let body = response.text().await.unwrap_or_default();
            tracing::error!(
                request_id = %pending.id,
                path = %pending.path,
                "Request rejected again after token refresh"
            );
            self.refresher.end_session();
            return Err(ClientError::SessionExpired(
                extract_message(&body).unwrap_or_else(|| SESSION_REJECTED.to_string()),
            ));
        }

        check_status(response).await
    }

    /// Send a request and decode the `data` field of the API envelope
    pub async fn send_json<T: DeserializeOwned>(
        &self,
        pending: PendingRequest,
    ) -> Result<T, ClientError> {
        let response = self.send(pending).await?;
        decode_data(response).await
    }

    /// Pre-send hook: the stored access token, if readable
    fn current_token(&self) -> Option<String> {
        match self.credentials.get() {
            Ok(token) => token,
            Err(e) => {
                tracing::warn!("Could not read stored access token, sending unauthenticated: {:#}", e);
                None
            }
        }
    }

    /// Build and execute one attempt of `pending` with `token` attached
    async fn dispatch(
        &self,
        pending: &mut PendingRequest,
        token: Option<String>,
    ) -> Result<Response, ClientError> {
        let attempt = if pending.retried { 2 } else { 1 };
        let url = self.url(&pending.path);

        tracing::debug!(
            request_id = %pending.id,
            method = %pending.method,
            url = %url,
            attempt,
            authenticated = token.is_some(),
            "Sending HTTP request"
        );

        let request = authorize(self.build(pending, &url)?, token.as_deref());
        pending.sent_with = token;

        match request.send().await {
            Ok(response) => {
                tracing::debug!(
                    request_id = %pending.id,
                    status = %response.status(),
                    "Received HTTP response"
                );
                Ok(response)
            }
            Err(e) => {
                tracing::warn!(
                    request_id = %pending.id,
                    error_kind = error_kind(&e),
                    error = %e,
                    url = %url,
                    attempt,
                    "HTTP request error"
                );
                Err(e.into())
            }
        }
    }

    fn build(&self, pending: &PendingRequest, url: &str) -> Result<RequestBuilder, ClientError> {
        let builder = self.client.request(pending.method.clone(), url);

        Ok(match &pending.body {
            RequestBody::Empty => builder,
            RequestBody::Json(value) => builder.json(value),
            RequestBody::Multipart(fields) => builder.multipart(build_form(fields)?),
        })
    }
}

/// Attach the bearer credential, if any
fn authorize(builder: RequestBuilder, token: Option<&str>) -> RequestBuilder {
    match token {
        Some(token) => builder.bearer_auth(token),
        None => builder,
    }
}

fn build_form(fields: &[FormField]) -> Result<Form, ClientError> {
    let mut form = Form::new();

    for field in fields {
        form = match field {
            FormField::Text { name, value } => form.text(name.clone(), value.clone()),
            FormField::File { name, file } => {
                let part = Part::stream_with_length(file.data.clone(), file.data.len() as u64)
                    .file_name(file.file_name.clone())
                    .mime_str(&file.content_type)
                    .with_context(|| format!("Invalid content type: {}", file.content_type))?;
                form.part(name.clone(), part)
            }
        };
    }

    Ok(form)
}

/// Turn a non-2xx response into an error carrying the server message
async fn check_status(response: Response) -> Result<Response, ClientError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let url = response.url().clone();
    let body = response.text().await.unwrap_or_default();

    tracing::warn!(
        status = status.as_u16(),
        url = %url,
        response_body = %body,
        "HTTP request failed with error response"
    );

    Err(ClientError::Http {
        status: status.as_u16(),
        message: extract_message(&body),
    })
}

async fn decode_data<T: DeserializeOwned>(response: Response) -> Result<T, ClientError> {
    let body = response.text().await?;
    let envelope: crate::auth::ApiResponse<T> = serde_json::from_str(&body)
        .map_err(|e| ClientError::InvalidResponse(e.to_string()))?;
    Ok(envelope.data)
}

/// Categorize a transport error for logging
fn error_kind(e: &reqwest::Error) -> &'static str {
    if e.is_timeout() {
        "timeout"
    } else if e.is_connect() {
        "connection_failed"
    } else if e.is_request() {
        "request_error"
    } else if e.is_body() {
        "body_error"
    } else if e.is_decode() {
        "decode_error"
    } else {
        "unknown"
    }
}
