// Authentication module
// Credential storage, token refresh, session state and session operations

mod cookies;
mod credentials;
mod manager;
mod refresh;
mod session;
mod types;

pub use cookies::PersistentCookieJar;
pub use credentials::{
    CredentialStore, MemoryCredentialStore, SqliteCredentialStore, StoredCookie,
};
pub use manager::SessionManager;
pub use refresh::{RefreshCoordinator, RefreshFailure};
pub use session::SessionStore;
pub use types::{
    AccountUpdate, ApiResponse, Attachment, PasswordChange, SessionEvent, SessionState,
    SignInRequest, SignUpProfile, SignUpRequest, User,
};
