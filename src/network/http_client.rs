//! Shared HTTP clients for sources
//!
//! The factory builds exactly two long-lived clients per process:
//! - the default client: cookie jar, response cache, timeouts and a
//!   user agent added only when the caller did not pick one
//! - the bypass client: the same, plus detection and resolution of
//!   anti-bot interstitial pages
//!
//! Both share one cookie jar, and the jar is handed to the challenge solver,
//! so a clearance obtained by the bypass client is visible to the default one.

use crate::core::config::HttpConfig;
use crate::core::error::{Result, TingError};
use crate::network::challenge::{is_challenge, ChallengeSolver, FlareSolverrSolver};
use crate::network::cookies::SharedCookieJar;
use crate::network::response_cache::ResponseCache;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, USER_AGENT};
use reqwest::Method;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;

const SOLVER_TIMEOUT: Duration = Duration::from_secs(60);

/// Outgoing request as described by a source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpRequest {
    pub method: String,
    pub url: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub body: Option<String>,
}

impl HttpRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: "GET".to_string(),
            url: url.into(),
            headers: HashMap::new(),
            body: None,
        }
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.insert(name.to_string(), value.to_string());
        self
    }

    pub fn is_get(&self) -> bool {
        self.method.eq_ignore_ascii_case("GET")
    }

    fn has_header(&self, name: &str) -> bool {
        self.headers.keys().any(|k| k.eq_ignore_ascii_case(name))
    }
}

/// Fully read response; header names are lowercase
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpResponse {
    pub url: String,
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: String,
}

impl HttpResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(String::as_str)
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// One configured client
pub struct HttpClient {
    client: reqwest::Client,
    user_agent: String,
    /// User agent a solved challenge is bound to
    solved_user_agent: RwLock<Option<String>>,
    read_timeout: Duration,
    call_timeout: Duration,
    cache: Option<Arc<ResponseCache>>,
    jar: SharedCookieJar,
    solver: Option<Arc<dyn ChallengeSolver>>,
    bypass: bool,
}

impl HttpClient {
    fn build(
        config: &HttpConfig,
        jar: SharedCookieJar,
        cache: Option<Arc<ResponseCache>>,
        solver: Option<Arc<dyn ChallengeSolver>>,
        bypass: bool,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .cookie_provider(jar.provider())
            .connect_timeout(config.connect_timeout())
            .gzip(true)
            .pool_idle_timeout(Some(Duration::from_secs(90)))
            .build()?;

        Ok(Self {
            client,
            user_agent: config.user_agent.clone(),
            solved_user_agent: RwLock::new(None),
            read_timeout: config.read_timeout(),
            call_timeout: config.call_timeout(),
            cache,
            jar,
            solver,
            bypass,
        })
    }

    pub fn is_bypass(&self) -> bool {
        self.bypass
    }

    /// Perform the request, bounded by the total call timeout
    ///
    /// Non-2xx statuses are returned as responses; deciding whether they are
    /// failures is up to the caller.
    pub async fn execute(&self, request: &HttpRequest) -> Result<HttpResponse> {
        match tokio::time::timeout(self.call_timeout, self.execute_inner(request)).await {
            Ok(result) => result,
            Err(_) => Err(TingError::network_timeout(format!(
                "Request to {} exceeded {}s",
                request.url,
                self.call_timeout.as_secs()
            ))),
        }
    }

    /// Convenience GET
    pub async fn get(&self, url: &str) -> Result<HttpResponse> {
        self.execute(&HttpRequest::get(url)).await
    }

    async fn execute_inner(&self, request: &HttpRequest) -> Result<HttpResponse> {
        let cacheable = request.is_get() && self.cache.is_some();
        if cacheable {
            if let Some(cache) = &self.cache {
                if let Some(hit) = cache.get(&request.url).await {
                    debug!(url = %request.url, "Serving response from cache");
                    return Ok(hit);
                }
            }
        }

        let mut response = self.send_once(request).await?;

        if self.bypass && is_challenge(response.status, &response.headers, &response.body) {
            response = self.resolve_challenge(request).await?;
        }

        if cacheable {
            if let Some(cache) = &self.cache {
                if let Err(e) = cache.put(&request.url, &response).await {
                    warn!(url = %request.url, error = %e, "Failed to cache response");
                }
            }
        }

        Ok(response)
    }

    async fn resolve_challenge(&self, request: &HttpRequest) -> Result<HttpResponse> {
        let url = Url::parse(&request.url)
            .map_err(|e| TingError::network(format!("Invalid URL {}: {}", request.url, e)))?;

        let Some(solver) = &self.solver else {
            return Err(TingError::network(format!(
                "Challenge not resolved for {}: no solver configured",
                request.url
            )));
        };

        info!(url = %request.url, "Anti-bot challenge detected");
        let solved = solver.solve(&url, &self.jar).await?;
        for cookie in &solved.cookies {
            self.jar.add(cookie, &url);
        }
        if let Some(ua) = solved.user_agent {
            if let Ok(mut slot) = self.solved_user_agent.write() {
                *slot = Some(ua);
            }
        }

        let retried = self.send_once(request).await?;
        if is_challenge(retried.status, &retried.headers, &retried.body) {
            return Err(TingError::NetworkError {
                message: format!("Challenge not resolved for {}", request.url),
                status: Some(retried.status),
                timed_out: false,
            });
        }
        Ok(retried)
    }

    /// Header set actually sent for `request`
    pub fn prepare_headers(&self, request: &HttpRequest) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        for (name, value) in &request.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| TingError::network(format!("Invalid header name {}: {}", name, e)))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| TingError::network(format!("Invalid header value: {}", e)))?;
            headers.insert(name, value);
        }

        if !request.has_header("user-agent") {
            let solved = self
                .solved_user_agent
                .read()
                .ok()
                .and_then(|slot| slot.clone());
            let ua = solved.unwrap_or_else(|| self.user_agent.clone());
            let value = HeaderValue::from_str(&ua)
                .map_err(|e| TingError::network(format!("Invalid user agent: {}", e)))?;
            headers.insert(USER_AGENT, value);
        }

        Ok(headers)
    }

    async fn send_once(&self, request: &HttpRequest) -> Result<HttpResponse> {
        let method = Method::from_bytes(request.method.to_ascii_uppercase().as_bytes())
            .map_err(|_| TingError::network(format!("Invalid HTTP method {}", request.method)))?;

        let mut builder = self
            .client
            .request(method, &request.url)
            .headers(self.prepare_headers(request)?);
        if let Some(body) = &request.body {
            builder = builder.body(body.clone());
        }

        let response = builder.send().await?;
        let status = response.status().as_u16();
        let final_url = response.url().to_string();

        let mut headers: HashMap<String, String> = HashMap::new();
        for (name, value) in response.headers() {
            let Ok(value) = value.to_str() else { continue };
            headers
                .entry(name.as_str().to_string())
                .and_modify(|existing| {
                    existing.push_str(", ");
                    existing.push_str(value);
                })
                .or_insert_with(|| value.to_string());
        }

        let body = match tokio::time::timeout(self.read_timeout, response.text()).await {
            Ok(body) => body?,
            Err(_) => {
                return Err(TingError::network_timeout(format!(
                    "Reading body of {} exceeded {}s",
                    request.url,
                    self.read_timeout.as_secs()
                )))
            }
        };

        debug!(url = %request.url, status, bytes = body.len(), "HTTP request completed");

        Ok(HttpResponse {
            url: final_url,
            status,
            headers,
            body,
        })
    }
}

/// Owner of the process-wide clients
pub struct HttpClientFactory {
    default_client: Arc<HttpClient>,
    bypass_client: Arc<HttpClient>,
    jar: SharedCookieJar,
}

impl HttpClientFactory {
    /// Build both clients; a FlareSolverr solver is wired in when configured
    pub fn from_config(config: &HttpConfig) -> Result<Self> {
        let solver: Option<Arc<dyn ChallengeSolver>> = match &config.flaresolverr_url {
            Some(endpoint) => Some(Arc::new(FlareSolverrSolver::new(endpoint, SOLVER_TIMEOUT)?)),
            None => None,
        };
        Self::new(config, solver)
    }

    pub fn new(config: &HttpConfig, solver: Option<Arc<dyn ChallengeSolver>>) -> Result<Self> {
        let jar = SharedCookieJar::new();
        let cache = Arc::new(ResponseCache::new(
            config.cache_dir.clone(),
            config.cache_max_bytes,
        )?);

        let default_client = Arc::new(HttpClient::build(
            config,
            jar.clone(),
            Some(cache.clone()),
            None,
            false,
        )?);
        let bypass_client = Arc::new(HttpClient::build(
            config,
            jar.clone(),
            Some(cache),
            solver,
            true,
        )?);

        Ok(Self {
            default_client,
            bypass_client,
            jar,
        })
    }

    pub fn default_client(&self) -> Arc<HttpClient> {
        self.default_client.clone()
    }

    pub fn bypass_client(&self) -> Arc<HttpClient> {
        self.bypass_client.clone()
    }

    pub fn client_for(&self, requires_bypass: bool) -> Arc<HttpClient> {
        if requires_bypass {
            self.bypass_client()
        } else {
            self.default_client()
        }
    }

    pub fn cookie_jar(&self) -> SharedCookieJar {
        self.jar.clone()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::network::challenge::SolvedChallenge;
    use crate::test_support::{Reply, TestServer};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    pub(crate) fn test_config(cache_dir: &std::path::Path) -> HttpConfig {
        HttpConfig {
            connect_timeout: 2,
            read_timeout: 2,
            call_timeout: 3,
            user_agent: "TingTest/1.0".to_string(),
            cache_dir: cache_dir.to_path_buf(),
            cache_max_bytes: 1024 * 1024,
            flaresolverr_url: None,
        }
    }

    struct CookieSolver {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ChallengeSolver for CookieSolver {
        async fn solve(&self, _url: &Url, _jar: &SharedCookieJar) -> Result<SolvedChallenge> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(SolvedChallenge {
                cookies: vec!["cf_clearance=ok; Path=/".to_string()],
                user_agent: None,
            })
        }
    }

    #[tokio::test]
    async fn test_user_agent_injected_only_when_missing() {
        let dir = TempDir::new().unwrap();
        let factory = HttpClientFactory::new(&test_config(dir.path()), None).unwrap();
        let client = factory.default_client();

        let headers = client.prepare_headers(&HttpRequest::get("https://a.test")).unwrap();
        assert_eq!(headers.get(USER_AGENT).unwrap(), "TingTest/1.0");

        let custom = HttpRequest::get("https://a.test").with_header("User-Agent", "Custom/2");
        let headers = client.prepare_headers(&custom).unwrap();
        assert_eq!(headers.get(USER_AGENT).unwrap(), "Custom/2");
        assert_eq!(headers.get_all(USER_AGENT).iter().count(), 1);
    }

    #[tokio::test]
    async fn test_cacheable_get_served_once() {
        let server = TestServer::spawn(|_| {
            Reply::ok("listing").header("Cache-Control", "public, max-age=120")
        })
        .await;
        let dir = TempDir::new().unwrap();
        let factory = HttpClientFactory::new(&test_config(dir.path()), None).unwrap();
        let client = factory.default_client();

        let first = client.get(&server.url("/list")).await.unwrap();
        let second = client.get(&server.url("/list")).await.unwrap();
        assert_eq!(first.body, "listing");
        assert_eq!(second.body, "listing");
        assert_eq!(server.hits(), 1);
    }

    #[tokio::test]
    async fn test_redirected_get_served_from_cache() {
        let server = TestServer::spawn(|req| match req.path.as_str() {
            "/latest" => Reply::status(302, "").header("Location", "/chapter/9"),
            _ => Reply::ok("chapter nine").header("Cache-Control", "max-age=120"),
        })
        .await;
        let dir = TempDir::new().unwrap();
        let factory = HttpClientFactory::new(&test_config(dir.path()), None).unwrap();
        let client = factory.default_client();

        let first = client.get(&server.url("/latest")).await.unwrap();
        assert_eq!(server.hits(), 2);
        let second = client.get(&server.url("/latest")).await.unwrap();
        assert_eq!(server.hits(), 2);
        assert_eq!(second.body, "chapter nine");
        assert_eq!(second.url, first.url);
        assert!(second.url.ends_with("/chapter/9"));
    }

    #[tokio::test]
    async fn test_error_status_returned_as_response() {
        let server = TestServer::spawn(|_| Reply::status(404, "missing")).await;
        let dir = TempDir::new().unwrap();
        let factory = HttpClientFactory::new(&test_config(dir.path()), None).unwrap();

        let response = factory.default_client().get(&server.url("/x")).await.unwrap();
        assert_eq!(response.status, 404);
        assert!(!response.is_success());
    }

    #[tokio::test]
    async fn test_call_timeout() {
        let server = TestServer::spawn(|_| Reply::ok("late").delayed(Duration::from_secs(10))).await;
        let dir = TempDir::new().unwrap();
        let factory = HttpClientFactory::new(&test_config(dir.path()), None).unwrap();

        let err = factory.default_client().get(&server.url("/slow")).await.unwrap_err();
        assert!(err.is_timeout());
    }

    #[tokio::test]
    async fn test_bypass_solves_and_retries() {
        let server = TestServer::spawn(|req| {
            let cleared = req
                .headers
                .get("cookie")
                .map(|c| c.contains("cf_clearance=ok"))
                .unwrap_or(false);
            if cleared {
                Reply::ok("content")
            } else {
                Reply::status(503, "<title>Just a moment...</title>").header("Server", "cloudflare")
            }
        })
        .await;

        let dir = TempDir::new().unwrap();
        let solver = Arc::new(CookieSolver {
            calls: AtomicUsize::new(0),
        });
        let shared: Arc<dyn ChallengeSolver> = solver.clone();
        let factory = HttpClientFactory::new(&test_config(dir.path()), Some(shared)).unwrap();

        let response = factory.bypass_client().get(&server.url("/protected")).await.unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(response.body, "content");
        assert_eq!(solver.calls.load(Ordering::SeqCst), 1);

        // the clearance cookie is shared with the default client
        let response = factory.default_client().get(&server.url("/protected")).await.unwrap();
        assert_eq!(response.body, "content");
    }

    #[tokio::test]
    async fn test_bypass_without_solver_fails() {
        let server = TestServer::spawn(|_| {
            Reply::status(403, "<div id=\"cf-browser-verification\"></div>")
        })
        .await;
        let dir = TempDir::new().unwrap();
        let factory = HttpClientFactory::new(&test_config(dir.path()), None).unwrap();

        let err = factory.bypass_client().get(&server.url("/")).await.unwrap_err();
        assert_eq!(err.error_type(), "NetworkError");

        // the default client does not intercept
        let response = factory.default_client().get(&server.url("/")).await.unwrap();
        assert_eq!(response.status, 403);
    }
}
