//! Anti-bot interstitial detection and resolution
//!
//! Sites fronted by Cloudflare answer scraping clients with a 403/503 page
//! that runs a browser check before handing out a clearance cookie. The bypass
//! client recognizes those pages here and asks a [`ChallengeSolver`] (a real
//! browser engine) to pass the check.

use crate::core::error::{Result, TingError};
use crate::network::cookies::SharedCookieJar;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;

const BODY_MARKERS: &[&str] = &[
    "cf-browser-verification",
    "challenge-platform",
    "cf_chl_opt",
    "Just a moment...",
    "Checking your browser",
];

/// Whether a response is an interstitial challenge rather than content
pub fn is_challenge(status: u16, headers: &HashMap<String, String>, body: &str) -> bool {
    if !matches!(status, 403 | 429 | 503) {
        return false;
    }

    let served_by_cloudflare = headers
        .get("server")
        .map(|s| s.to_ascii_lowercase().starts_with("cloudflare"))
        .unwrap_or(false);

    served_by_cloudflare || BODY_MARKERS.iter().any(|marker| body.contains(marker))
}

/// Result of passing a challenge
#[derive(Debug, Clone, Default)]
pub struct SolvedChallenge {
    /// `Set-Cookie` style strings for the challenged URL
    pub cookies: Vec<String>,
    /// User agent the clearance is bound to, if the solver used its own
    pub user_agent: Option<String>,
}

/// Browser engine able to pass an interstitial challenge
#[async_trait]
pub trait ChallengeSolver: Send + Sync {
    async fn solve(&self, url: &Url, jar: &SharedCookieJar) -> Result<SolvedChallenge>;
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SolverRequest<'a> {
    cmd: &'a str,
    url: &'a str,
    max_timeout: u64,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    cookies: Vec<SolverCookie>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SolverCookie {
    name: String,
    value: String,
    #[serde(default)]
    domain: Option<String>,
    #[serde(default)]
    path: Option<String>,
    #[serde(default)]
    secure: Option<bool>,
    #[serde(default)]
    http_only: Option<bool>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SolverResponse {
    status: String,
    #[serde(default)]
    message: String,
    solution: Option<Solution>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Solution {
    #[serde(default)]
    cookies: Vec<SolverCookie>,
    user_agent: Option<String>,
}

impl SolverCookie {
    fn to_set_cookie(&self) -> String {
        let mut cookie = format!("{}={}", self.name, self.value);
        if let Some(domain) = &self.domain {
            cookie.push_str(&format!("; Domain={}", domain));
        }
        cookie.push_str(&format!("; Path={}", self.path.as_deref().unwrap_or("/")));
        if self.secure.unwrap_or(false) {
            cookie.push_str("; Secure");
        }
        if self.http_only.unwrap_or(false) {
            cookie.push_str("; HttpOnly");
        }
        cookie
    }
}

/// Solver backed by a FlareSolverr-compatible proxy
pub struct FlareSolverrSolver {
    client: reqwest::Client,
    endpoint: String,
    max_timeout: Duration,
}

impl FlareSolverrSolver {
    /// `endpoint` is the server root, with or without the `/v1` suffix
    pub fn new(endpoint: &str, max_timeout: Duration) -> Result<Self> {
        let mut endpoint = endpoint.trim_end_matches('/').to_string();
        if !endpoint.ends_with("/v1") {
            endpoint.push_str("/v1");
        }

        let client = reqwest::Client::builder()
            .timeout(max_timeout + Duration::from_secs(10))
            .build()?;

        Ok(Self {
            client,
            endpoint,
            max_timeout,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl ChallengeSolver for FlareSolverrSolver {
    async fn solve(&self, url: &Url, jar: &SharedCookieJar) -> Result<SolvedChallenge> {
        info!(url = %url, endpoint = %self.endpoint, "Requesting challenge solution");

        // Hand over the cookies we already hold so an existing session is reused
        let cookies = jar
            .header_for(url)
            .map(|header| {
                header
                    .split(';')
                    .filter_map(|pair| pair.trim().split_once('='))
                    .map(|(name, value)| SolverCookie {
                        name: name.to_string(),
                        value: value.to_string(),
                        domain: None,
                        path: None,
                        secure: None,
                        http_only: None,
                    })
                    .collect()
            })
            .unwrap_or_default();

        let request = SolverRequest {
            cmd: "request.get",
            url: url.as_str(),
            max_timeout: self.max_timeout.as_millis() as u64,
            cookies,
        };

        let response = self.client.post(&self.endpoint).json(&request).send().await?;
        if !response.status().is_success() {
            return Err(TingError::http_status(response.status().as_u16(), &self.endpoint));
        }

        let body: SolverResponse = response.json().await?;
        match body.solution {
            Some(solution) if body.status == "ok" => {
                debug!(url = %url, cookies = solution.cookies.len(), "Challenge solved");
                Ok(SolvedChallenge {
                    cookies: solution.cookies.iter().map(SolverCookie::to_set_cookie).collect(),
                    user_agent: solution.user_agent,
                })
            }
            _ => {
                warn!(url = %url, status = %body.status, message = %body.message, "Challenge solver failed");
                let reason = if body.message.is_empty() {
                    format!("solver returned status '{}' without solution", body.status)
                } else {
                    body.message
                };
                Err(TingError::network(format!("Challenge not resolved for {}: {}", url, reason)))
            }
        }
    }
}
