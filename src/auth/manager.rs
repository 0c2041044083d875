use anyhow::Result;
use std::sync::Arc;

use super::credentials::CredentialStore;
use super::session::SessionStore;
use super::types::{
    AccountUpdate, Attachment, AuthPayload, CurrentUserPayload, PasswordChange, SignInRequest,
    SignUpRequest, User,
};
use crate::error::ClientError;
use crate::http_client::{ApiClient, FormField, HttpSettings, PendingRequest};

/// Session manager
/// The only writer of the session store and credential store, apart from the
/// refresh coordinator's terminal-failure path
pub struct SessionManager {
    api: ApiClient,

    credentials: Arc<dyn CredentialStore>,

    session: Arc<SessionStore>,
}

impl SessionManager {
    /// Create a session manager in the initial loading state
    pub fn new(settings: &HttpSettings, credentials: Arc<dyn CredentialStore>) -> Result<Self> {
        let session = Arc::new(SessionStore::new());
        let api = ApiClient::new(settings, Arc::clone(&credentials), Arc::clone(&session))?;

        Ok(Self {
            api,
            credentials,
            session,
        })
    }

    /// Read-only view of the session for the UI
    pub fn session(&self) -> Arc<SessionStore> {
        Arc::clone(&self.session)
    }

    /// Underlying API client, for calls outside the session operations
    pub fn api(&self) -> &ApiClient {
        &self.api
    }

    /// Sign in with email and password
    pub async fn sign_in(&self, email: &str, password: &str) -> Result<User, ClientError> {
        let body = SignInRequest {
            email: email.to_string(),
            password: password.to_string(),
        };
        let request = PendingRequest::post("/users/login")
            .json(&body)?
            .without_refresh();

        let payload: AuthPayload = self
            .api
            .send_json(request)
            .await
            .map_err(|e| e.or_fallback("Login failed"))?;

        self.establish(payload)
    }

    /// Register a new account and sign in as it
    ///
    /// The avatar is required and checked before anything is sent.
    pub async fn sign_up(&self, request: SignUpRequest) -> Result<User, ClientError> {
        let SignUpRequest {
            profile,
            password,
            avatar,
            cover_image,
        } = request;

        let avatar =
            avatar.ok_or_else(|| ClientError::Validation("Avatar is required".to_string()))?;

        let mut fields = vec![
            FormField::text("fullName", profile.full_name),
            FormField::text("username", profile.username),
            FormField::text("email", profile.email),
            FormField::text("password", password),
            FormField::file("avatar", avatar),
        ];
        if let Some(cover_image) = cover_image {
            fields.push(FormField::file("coverImage", cover_image));
        }

        let request = PendingRequest::post("/users/register")
            .multipart(fields)
            .without_refresh();

        let payload: AuthPayload = self
            .api
            .send_json(request)
            .await
            .map_err(|e| e.or_fallback("Registration failed"))?;

        self.establish(payload)
    }

    /// Sign out locally, telling the server on a best-effort basis
    pub async fn sign_out(&self) {
        if let Err(e) = self.api.send(PendingRequest::post("/users/logout")).await {
            tracing::warn!("Logout request failed, signing out locally: {}", e);
        }

        if let Err(e) = self.credentials.clear() {
            tracing::error!("Failed to clear access token: {:#}", e);
        }
        self.session.signed_out();
    }

    /// Probe the current user; any failure leaves the session anonymous
    ///
    /// Makes no network call when no access token is stored. A 401 here has
    /// already been through refresh-and-retry in the pipeline.
    pub async fn refresh_current_user(&self) -> Option<User> {
        let has_token = match self.credentials.get() {
            Ok(token) => token.is_some(),
            Err(e) => {
                tracing::warn!("Could not read stored access token: {:#}", e);
                false
            }
        };

        if !has_token {
            tracing::debug!("No stored access token, session is anonymous");
            self.session.settle(None);
            return None;
        }

        self.session.begin_loading();

        let user = match self
            .api
            .send_json::<CurrentUserPayload>(PendingRequest::get("/users/current-user"))
            .await
        {
            Ok(payload) => Some(payload.into_user()),
            Err(e) => {
                tracing::info!("Current user unavailable, continuing anonymously: {}", e);
                None
            }
        };

        self.session.settle(user.clone());
        user
    }

    /// Change the signed-in user's password
    pub async fn change_password(
        &self,
        old_password: &str,
        new_password: &str,
    ) -> Result<(), ClientError> {
        let body = PasswordChange {
            old_password: old_password.to_string(),
            new_password: new_password.to_string(),
        };

        self.api
            .send(PendingRequest::post("/users/change-password").json(&body)?)
            .await
            .map_err(|e| e.or_fallback("Failed to change password"))?;

        tracing::info!("Password changed");
        Ok(())
    }

    /// Update profile fields; the session user is replaced with the result
    pub async fn update_account(&self, update: AccountUpdate) -> Result<User, ClientError> {
        if update.is_empty() {
            return Err(ClientError::Validation(
                "Nothing to update: provide a full name or email".to_string(),
            ));
        }

        let user: User = self
            .api
            .send_json(PendingRequest::patch("/users/update-account").json(&update)?)
            .await
            .map_err(|e| e.or_fallback("Failed to update account"))?;

        self.session.update_user(user.clone());
        Ok(user)
    }

    /// Replace the avatar image
    pub async fn update_avatar(&self, avatar: Attachment) -> Result<User, ClientError> {
        self.upload_image("/users/avatar", "avatar", avatar)
            .await
            .map_err(|e| e.or_fallback("Failed to update avatar"))
    }

    /// Replace the cover image
    pub async fn update_cover_image(&self, cover_image: Attachment) -> Result<User, ClientError> {
        self.upload_image("/users/cover-image", "coverImage", cover_image)
            .await
            .map_err(|e| e.or_fallback("Failed to update cover image"))
    }

    async fn upload_image(
        &self,
        path: &str,
        field: &str,
        image: Attachment,
    ) -> Result<User, ClientError> {
        let request = PendingRequest::patch(path).multipart(vec![FormField::file(field, image)]);
        let user: User = self.api.send_json(request).await?;

        self.session.update_user(user.clone());
        Ok(user)
    }

    /// Store the issued token and publish the user
    fn establish(&self, payload: AuthPayload) -> Result<User, ClientError> {
        match payload.access_token.as_deref() {
            Some(token) if !token.is_empty() => self.credentials.set(token)?,
            _ => tracing::warn!("Authentication response did not include an access token"),
        }

        self.session.signed_in(payload.user.clone());
        Ok(payload.user)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::credentials::MemoryCredentialStore;
    use crate::auth::types::SignUpProfile;

    fn manager(base_url: &str, store: Arc<MemoryCredentialStore>) -> SessionManager {
        let settings = HttpSettings {
            base_url: base_url.to_string(),
            connect_timeout: 5,
            request_timeout: 10,
        };
        SessionManager::new(&settings, store).unwrap()
    }

    fn sign_up_request(avatar: Option<Attachment>) -> SignUpRequest {
        SignUpRequest {
            profile: SignUpProfile {
                full_name: "Ada Lovelace".to_string(),
                username: "ada".to_string(),
                email: "ada@example.com".to_string(),
            },
            password: "analytical-engine".to_string(),
            avatar,
            cover_image: None,
        }
    }

    #[tokio::test]
    async fn test_sign_up_without_avatar_is_rejected_locally() {
        let mut server = mockito::Server::new_async().await;
        let register = server
            .mock("POST", "/users/register")
            .expect(0)
            .create_async()
            .await;

        let manager = manager(&server.url(), Arc::new(MemoryCredentialStore::new()));
        let before = manager.session().snapshot();

        let err = manager.sign_up(sign_up_request(None)).await.unwrap_err();
        assert!(matches!(err, ClientError::Validation(_)));
        assert_eq!(err.to_string(), "Avatar is required");
        assert_eq!(manager.session().snapshot(), before);
        register.assert_async().await;
    }

    #[tokio::test]
    async fn test_refresh_current_user_without_token_makes_no_call() {
        let mut server = mockito::Server::new_async().await;
        let current = server
            .mock("GET", "/users/current-user")
            .expect(0)
            .create_async()
            .await;

        let manager = manager(&server.url(), Arc::new(MemoryCredentialStore::new()));
        assert!(manager.session().is_loading());

        assert!(manager.refresh_current_user().await.is_none());
        let state = manager.session().snapshot();
        assert!(!state.is_loading);
        assert!(state.user.is_none());
        current.assert_async().await;
    }

    #[tokio::test]
    async fn test_empty_account_update_is_rejected() {
        let manager = manager("http://127.0.0.1:9", Arc::new(MemoryCredentialStore::new()));
        let err = manager
            .update_account(AccountUpdate::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::Validation(_)));
    }

    #[tokio::test]
    async fn test_sign_in_failure_leaves_state_untouched() {
        let mut server = mockito::Server::new_async().await;
        let _login = server
            .mock("POST", "/users/login")
            .with_status(500)
            .with_body("Internal Server Error")
            .create_async()
            .await;

        let store = Arc::new(MemoryCredentialStore::new());
        let manager = manager(&server.url(), store.clone());
        let before = manager.session().snapshot();

        let err = manager.sign_in("ada@example.com", "pw").await.unwrap_err();
        assert_eq!(err.to_string(), "Login failed");
        assert_eq!(err.status(), Some(500));
        assert_eq!(manager.session().snapshot(), before);
        assert_eq!(store.get().unwrap(), None);
    }
}
