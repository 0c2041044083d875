// Cookie jar that outlives the process
//
// The refresh credential is an HttpOnly cookie. Every `Set-Cookie` the API
// sends is kept in the credential store and replayed into a fresh jar on
// startup, so a new process can still refresh an expired access token.

use reqwest::cookie::{CookieStore, Jar};
use reqwest::header::HeaderValue;
use reqwest::Url;
use std::sync::{Arc, Mutex, PoisonError};

use super::credentials::{CredentialStore, StoredCookie};

pub struct PersistentCookieJar {
    jar: Jar,

    /// Latest `Set-Cookie` per cookie name
    saved: Mutex<Vec<StoredCookie>>,

    credentials: Arc<dyn CredentialStore>,
}

impl PersistentCookieJar {
    /// Build a jar holding whatever cookies `credentials` has saved
    pub fn load(credentials: Arc<dyn CredentialStore>) -> Self {
        let saved = credentials.cookies().unwrap_or_else(|e| {
            tracing::warn!("Could not load saved cookies, starting with none: {:#}", e);
            Vec::new()
        });

        let jar = Jar::default();
        for cookie in &saved {
            match Url::parse(&cookie.url) {
                Ok(url) => jar.add_cookie_str(&cookie.header, &url),
                Err(e) => tracing::warn!(cookie = %cookie.name, "Skipping saved cookie: {}", e),
            }
        }

        tracing::debug!(count = saved.len(), "Loaded saved cookies");

        Self {
            jar,
            saved: Mutex::new(saved),
            credentials,
        }
    }

    fn remember(&self, headers: &[&HeaderValue], url: &Url) {
        let mut saved = self.saved.lock().unwrap_or_else(PoisonError::into_inner);

        for value in headers {
            let Ok(header) = value.to_str() else {
                continue;
            };
            let Some(name) = cookie_name(header) else {
                continue;
            };

            let cookie = StoredCookie {
                name: name.to_string(),
                url: url.to_string(),
                header: header.to_string(),
            };
            match saved.iter_mut().find(|c| c.name == cookie.name) {
                Some(existing) => *existing = cookie,
                None => saved.push(cookie),
            }
        }

        if let Err(e) = self.credentials.set_cookies(&saved) {
            tracing::warn!("Failed to save cookies: {:#}", e);
        }
    }
}

impl CookieStore for PersistentCookieJar {
    fn set_cookies(&self, cookie_headers: &mut dyn Iterator<Item = &HeaderValue>, url: &Url) {
        let headers: Vec<&HeaderValue> = cookie_headers.collect();
        if headers.is_empty() {
            return;
        }

        self.jar.set_cookies(&mut headers.iter().copied(), url);
        self.remember(&headers, url);
    }

    fn cookies(&self, url: &Url) -> Option<HeaderValue> {
        self.jar.cookies(url)
    }
}

/// Name of the cookie a `Set-Cookie` value sets
fn cookie_name(header: &str) -> Option<&str> {
    let pair = header.split(';').next()?;
    let (name, _) = pair.split_once('=')?;
    let name = name.trim();
    (!name.is_empty()).then_some(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::credentials::MemoryCredentialStore;

    fn receive(jar: &PersistentCookieJar, headers: &[&str], url: &Url) {
        let values: Vec<HeaderValue> = headers
            .iter()
            .map(|h| HeaderValue::from_str(h).unwrap())
            .collect();
        jar.set_cookies(&mut values.iter(), url);
    }

    #[test]
    fn test_cookie_name() {
        assert_eq!(cookie_name("refreshToken=abc; Path=/; HttpOnly"), Some("refreshToken"));
        assert_eq!(cookie_name(" accessToken = x"), Some("accessToken"));
        assert_eq!(cookie_name("=x"), None);
        assert_eq!(cookie_name("novalue"), None);
    }

    #[test]
    fn test_received_cookies_are_saved() {
        let store = Arc::new(MemoryCredentialStore::new());
        let jar = PersistentCookieJar::load(store.clone());
        let url = Url::parse("http://127.0.0.1:8000/api/v1/users/login").unwrap();

        receive(&jar, &["refreshToken=first; Path=/; HttpOnly"], &url);
        receive(&jar, &["refreshToken=second; Path=/; HttpOnly"], &url);

        let saved = store.cookies().unwrap();
        assert_eq!(saved.len(), 1);
        assert_eq!(saved[0].name, "refreshToken");
        assert_eq!(saved[0].header, "refreshToken=second; Path=/; HttpOnly");

        let sent = jar.cookies(&url).unwrap();
        assert_eq!(sent.to_str().unwrap(), "refreshToken=second");
    }

    #[test]
    fn test_saved_cookies_are_sent_after_reload() {
        let store = Arc::new(MemoryCredentialStore::new());
        let url = Url::parse("http://127.0.0.1:8000/api/v1/users/login").unwrap();

        {
            let jar = PersistentCookieJar::load(store.clone());
            receive(&jar, &["refreshToken=kept; Path=/; HttpOnly"], &url);
        }

        let reloaded = PersistentCookieJar::load(store);
        let refresh_url = Url::parse("http://127.0.0.1:8000/api/v1/users/refresh-token").unwrap();
        let sent = reloaded.cookies(&refresh_url).unwrap();
        assert_eq!(sent.to_str().unwrap(), "refreshToken=kept");
    }

    #[test]
    fn test_cleared_cookie_stays_cleared_after_reload() {
        let store = Arc::new(MemoryCredentialStore::new());
        let url = Url::parse("http://127.0.0.1:8000/api/v1/users/logout").unwrap();

        {
            let jar = PersistentCookieJar::load(store.clone());
            receive(&jar, &["refreshToken=kept; Path=/"], &url);
            receive(&jar, &["refreshToken=; Path=/; Max-Age=0"], &url);
        }

        let reloaded = PersistentCookieJar::load(store);
        assert!(reloaded.cookies(&url).is_none());
    }
}
