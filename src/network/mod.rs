//! Network layer shared by all sources
//!
//! Rate limiting, HTTP clients, cookies, response caching and anti-bot
//! challenge handling.

pub mod challenge;
pub mod cookies;
pub mod http_client;
pub mod rate_bucket;
pub mod rate_limiter;
pub mod response_cache;

pub use challenge::{ChallengeSolver, FlareSolverrSolver, SolvedChallenge};
pub use cookies::SharedCookieJar;
pub use http_client::{HttpClient, HttpClientFactory, HttpRequest, HttpResponse};
pub use rate_bucket::RateBucket;
pub use rate_limiter::{EndpointClass, RateLimiterRegistry};
pub use response_cache::ResponseCache;
