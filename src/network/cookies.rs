//! Cookie storage shared by every HTTP client and challenge solver

use reqwest::cookie::{CookieStore, Jar};
use std::sync::Arc;
use url::Url;

/// Process-wide cookie jar
///
/// Clones share the same storage, so a session cookie obtained while solving
/// a challenge is sent by the default client as well.
#[derive(Clone, Default)]
pub struct SharedCookieJar {
    jar: Arc<Jar>,
}

impl SharedCookieJar {
    pub fn new() -> Self {
        Self::default()
    }

    /// Handle to plug into `reqwest::ClientBuilder::cookie_provider`
    pub fn provider(&self) -> Arc<Jar> {
        self.jar.clone()
    }

    /// Store a `Set-Cookie` style string for the given URL
    pub fn add(&self, cookie: &str, url: &Url) {
        self.jar.add_cookie_str(cookie, url);
    }

    /// `Cookie` header value that would be sent to `url`
    pub fn header_for(&self, url: &Url) -> Option<String> {
        self.jar
            .cookies(url)
            .and_then(|value| value.to_str().ok().map(str::to_string))
    }
}

impl std::fmt::Debug for SharedCookieJar {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedCookieJar").finish_non_exhaustive()
    }
}
