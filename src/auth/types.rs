// Authentication types

use anyhow::{Context, Result};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Identity record returned by the API
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    #[serde(rename = "_id")]
    pub id: String,
    pub username: String,
    pub email: String,
    pub full_name: String,
    #[serde(rename = "avatar")]
    pub avatar_url: String,
    #[serde(rename = "coverImage", default, skip_serializing_if = "Option::is_none")]
    pub cover_image_url: Option<String>,
    #[serde(default)]
    pub watch_history: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// UI-visible session state
///
/// `is_authenticated` is derived from `user` and never stored.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionState {
    pub user: Option<User>,
    pub is_loading: bool,
}

impl SessionState {
    /// State at application start, before the current user is probed
    pub fn initial() -> Self {
        Self {
            user: None,
            is_loading: true,
        }
    }

    pub fn is_authenticated(&self) -> bool {
        self.user.is_some()
    }
}

impl Default for SessionState {
    fn default() -> Self {
        Self::initial()
    }
}

/// Notifications published alongside state changes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// A user signed in or registered
    SignedIn { user_id: String },
    /// The user asked to sign out
    SignedOut,
    /// The session could not be recovered; the view should route to sign-in
    Expired,
}

/// Standard API envelope: `{statusCode, success, message, data}`
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiResponse<T> {
    #[serde(default)]
    pub status_code: u16,
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub message: String,
    pub data: T,
}

/// Login/register payload
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthPayload {
    pub user: User,
    pub access_token: Option<String>,
    /// Also set as a cookie; the client ignores the body copy
    pub refresh_token: Option<String>,
}

/// Refresh payload
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshPayload {
    pub access_token: Option<String>,
}

/// Current-user payload, either `{user}` or the bare record
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum CurrentUserPayload {
    Wrapped { user: User },
    Bare(User),
}

impl CurrentUserPayload {
    pub fn into_user(self) -> User {
        match self {
            CurrentUserPayload::Wrapped { user } | CurrentUserPayload::Bare(user) => user,
        }
    }
}

/// Login request body
#[derive(Debug, Clone, Serialize)]
pub struct SignInRequest {
    pub email: String,
    pub password: String,
}

/// Public profile fields submitted on registration
#[derive(Debug, Clone)]
pub struct SignUpProfile {
    pub full_name: String,
    pub username: String,
    pub email: String,
}

/// Registration submission
#[derive(Debug, Clone)]
pub struct SignUpRequest {
    pub profile: SignUpProfile,
    pub password: String,
    /// Required; checked before any network call
    pub avatar: Option<Attachment>,
    pub cover_image: Option<Attachment>,
}

/// Account update body; absent fields are left unchanged server-side
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub full_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
}

impl AccountUpdate {
    pub fn is_empty(&self) -> bool {
        self.full_name.is_none() && self.email.is_none()
    }
}

/// Password change body
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PasswordChange {
    pub old_password: String,
    pub new_password: String,
}

/// Binary file attached to a multipart submission
#[derive(Debug, Clone, PartialEq)]
pub struct Attachment {
    pub file_name: String,
    pub content_type: String,
    pub data: Bytes,
}

impl Attachment {
    pub fn new(
        file_name: impl Into<String>,
        content_type: impl Into<String>,
        data: impl Into<Bytes>,
    ) -> Self {
        Self {
            file_name: file_name.into(),
            content_type: content_type.into(),
            data: data.into(),
        }
    }

    /// Read an image from disk, guessing its content type from the extension
    pub async fn from_path(path: &Path) -> Result<Self> {
        let data = tokio::fs::read(path)
            .await
            .with_context(|| format!("Failed to read file: {}", path.display()))?;

        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .context("File path has no usable file name")?
            .to_string();

        Ok(Self::new(file_name, content_type_for(path), data))
    }
}

/// Guess an image content type from a file extension
fn content_type_for(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase());

    match ext.as_deref() {
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("webp") => "image/webp",
        Some("svg") => "image/svg+xml",
        _ => "application/octet-stream",
    }
}
