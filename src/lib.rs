// VidTube session client - Library root

pub mod auth;
pub mod config;
pub mod error;
pub mod http_client;

pub use auth::{SessionManager, SessionState, SessionStore, User};
pub use error::ClientError;
