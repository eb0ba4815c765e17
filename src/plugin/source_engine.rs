//! Script source engine
//!
//! Adapts one [`UserSource`] to the [`Source`] trait. Scripts never touch the
//! network; for each operation the engine asks the script to describe the
//! request, performs it under the source's rate limit and permissions, and
//! hands the response back to the script to parse:
//!
//! ```text
//! mangaListRequest(ctx)    -> {url, method?, headers?, body?}
//! parseMangaList(res, ctx) -> {mangas: [...], hasNextPage}
//! ```
//!
//! The same pairs exist for details (`mangaDetailsRequest`/`parseMangaDetails`),
//! chapters (`chapterListRequest`/`parseChapterList`) and pages
//! (`pageListRequest`/`parsePageList`). When a details, chapter or page
//! request function is absent the engine GETs the item key resolved against
//! the base URL. `getListings`, `getFilters` and `getCommands` are optional and
//! called once per engine.

use super::js_bindings::ScriptBindings;
use super::js_runtime::{JsRuntimeWrapper, ScriptSandbox};
use super::js_wrapper::SandboxHandle;
use super::marshal;
use super::sandbox::Sandbox;
use super::source::{MangaListQuery, Source};
use super::types::{
    Chapter, Command, CommandKind, FilterDefinition, Listing, Manga, Page, PageResult, SourceId,
    UserSource,
};
use super::value::ScriptValue;
use crate::core::config::SandboxConfig;
use crate::core::error::{Result, TingError};
use crate::network::{EndpointClass, HttpClient, HttpClientFactory, HttpRequest, RateLimiterRegistry};
use async_trait::async_trait;
use serde_json::{json, Value as JsonValue};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

/// Shared collaborators every engine is wired to
#[derive(Clone)]
pub struct SourceServices {
    pub clients: Arc<HttpClientFactory>,
    pub rate_limiter: Arc<RateLimiterRegistry>,
    pub sandbox: SandboxConfig,
}

/// Script function pair for one network operation
struct Operation {
    class: EndpointClass,
    request_fn: &'static str,
    parse_fn: &'static str,
}

const MANGA_LIST: Operation = Operation {
    class: EndpointClass::Browse,
    request_fn: "mangaListRequest",
    parse_fn: "parseMangaList",
};

const MANGA_DETAILS: Operation = Operation {
    class: EndpointClass::Details,
    request_fn: "mangaDetailsRequest",
    parse_fn: "parseMangaDetails",
};

const CHAPTER_LIST: Operation = Operation {
    class: EndpointClass::Chapters,
    request_fn: "chapterListRequest",
    parse_fn: "parseChapterList",
};

const PAGE_LIST: Operation = Operation {
    class: EndpointClass::Pages,
    request_fn: "pageListRequest",
    parse_fn: "parsePageList",
};

pub struct UserSourceEngine {
    source: UserSource,
    sandbox: SandboxHandle,
    permissions: Sandbox,
    client: Arc<HttpClient>,
    rate_limiter: Arc<RateLimiterRegistry>,
    listings: OnceCell<Vec<Listing>>,
    filters: OnceCell<Vec<FilterDefinition>>,
    commands: OnceCell<Vec<Command>>,
}

impl UserSourceEngine {
    /// Start a sandbox for `source` and evaluate its script
    pub async fn load(source: UserSource, services: &SourceServices) -> Result<Self> {
        let permissions = Sandbox::for_source(&source.base_url, &source.metadata.allowed_domains)?;

        if let Some(limit) = source.metadata.rate_limit {
            services
                .rate_limiter
                .set_source_limit(source.id, limit.capacity, limit.refill_interval_ms)
                .await;
        }

        let bindings = ScriptBindings {
            source_name: source.name.clone(),
            base_url: source.base_url.clone(),
        };
        let max_heap = services.sandbox.max_memory_bytes;
        let sandbox = SandboxHandle::spawn(
            &source.name,
            Duration::from_secs(services.sandbox.max_execution_time),
            move || Box::new(JsRuntimeWrapper::new(bindings, max_heap)) as Box<dyn ScriptSandbox>,
        )
        .await?;
        sandbox.evaluate_script(&source.script).await?;

        info!(
            source_id = source.id,
            name = %source.name,
            bypass = source.metadata.requires_bypass,
            "Loaded script source"
        );

        Ok(Self {
            client: services.clients.client_for(source.metadata.requires_bypass),
            rate_limiter: services.rate_limiter.clone(),
            source,
            sandbox,
            permissions,
            listings: OnceCell::new(),
            filters: OnceCell::new(),
            commands: OnceCell::new(),
        })
    }

    pub fn source(&self) -> &UserSource {
        &self.source
    }

    async fn has_function(&self, name: &str) -> Result<bool> {
        Ok(matches!(self.sandbox.get_global(name).await?, ScriptValue::Opaque(kind) if kind == "function"))
    }

    /// Call an optional no-argument declaration function
    async fn declared(&self, name: &str) -> Result<ScriptValue> {
        if !self.has_function(name).await? {
            return Ok(ScriptValue::Null);
        }
        self.sandbox.call_function(name, Vec::new()).await
    }

    /// Build the request for `op`, falling back to a GET of `default_key`
    async fn build_request(
        &self,
        op: &Operation,
        ctx: &ScriptValue,
        default_key: Option<&str>,
    ) -> Result<HttpRequest> {
        if self.has_function(op.request_fn).await? {
            let described = self.sandbox.call_function(op.request_fn, vec![ctx.clone()]).await?;
            return marshal::request(&described, &self.source.base_url);
        }

        match default_key {
            Some(key) => Ok(HttpRequest::get(marshal::resolve_url(&self.source.base_url, key)?)),
            None => Err(TingError::ScriptError(format!(
                "{} does not define {}",
                self.source.name, op.request_fn
            ))),
        }
    }

    async fn fetch(&self, class: EndpointClass, request: &HttpRequest) -> Result<ScriptValue> {
        self.permissions.check_network_access(&request.url)?;
        self.rate_limiter.acquire(self.source.id, class).await?;

        debug!(source_id = self.source.id, method = %request.method, url = %request.url, "Fetching");
        let response = self.client.execute(request).await?;
        if response.status >= 400 {
            return Err(TingError::http_status(response.status, &response.url));
        }

        Ok(ScriptValue::from(json!({
            "url": response.url,
            "status": response.status,
            "headers": response.headers,
            "body": response.body,
        })))
    }

    /// Request, fetch and parse one operation
    ///
    /// A `Fetchers` command overrides the network step: its HTML is parsed
    /// directly, or its URL is fetched instead of the script's request.
    async fn run(
        &self,
        op: &Operation,
        ctx: ScriptValue,
        default_key: Option<&str>,
        commands: &[Command],
    ) -> Result<ScriptValue> {
        let fetcher = commands.iter().find_map(|c| match &c.kind {
            CommandKind::Fetchers { url, html } if !url.is_empty() || !html.is_empty() => {
                Some((url.as_str(), html.as_str()))
            }
            _ => None,
        });

        let response = match fetcher {
            Some((url, html)) if !html.is_empty() => {
                let url = if url.is_empty() { self.source.base_url.as_str() } else { url };
                ScriptValue::from(json!({
                    "url": url,
                    "status": 200,
                    "headers": {},
                    "body": html,
                }))
            }
            Some((url, _)) => {
                let request = HttpRequest::get(marshal::resolve_url(&self.source.base_url, url)?);
                self.fetch(op.class, &request).await?
            }
            None => {
                let request = self.build_request(op, &ctx, default_key).await?;
                self.fetch(op.class, &request).await?
            }
        };

        self.sandbox.call_function(op.parse_fn, vec![response, ctx]).await
    }

    fn log_failure<T>(&self, operation: &str, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            warn!(
                source_id = self.source.id,
                operation,
                error_type = e.error_type(),
                "Source operation failed: {}",
                e
            );
        }
        result
    }
}

fn with_commands(mut ctx: JsonValue, commands: &[Command]) -> Result<ScriptValue> {
    ctx["commands"] = serde_json::to_value(commands)?;
    Ok(ScriptValue::from(ctx))
}

#[async_trait]
impl Source for UserSourceEngine {
    fn id(&self) -> SourceId {
        self.source.id
    }

    fn name(&self) -> &str {
        &self.source.name
    }

    fn lang(&self) -> &str {
        &self.source.lang
    }

    async fn get_manga_list(&self, query: &MangaListQuery, page: u32) -> Result<PageResult> {
        let ctx = match query {
            MangaListQuery::Listing(listing) => json!({
                "page": page,
                "listing": listing.name,
                "filters": {},
            }),
            MangaListQuery::Filters(filters) => json!({
                "page": page,
                "listing": null,
                "filters": filters,
            }),
        };

        let result = async {
            let parsed = self.run(&MANGA_LIST, ScriptValue::from(ctx), None, &[]).await?;
            marshal::page_result(&parsed)
        }
        .await;
        self.log_failure("get_manga_list", result)
    }

    async fn get_manga_details(&self, manga: &Manga, commands: &[Command]) -> Result<Manga> {
        let result = async {
            let ctx = with_commands(json!({ "manga": serde_json::to_value(manga)? }), commands)?;
            let parsed = self.run(&MANGA_DETAILS, ctx, Some(&manga.key), commands).await?;
            marshal::manga_details(&parsed, manga)
        }
        .await;
        self.log_failure("get_manga_details", result)
    }

    async fn get_chapter_list(&self, manga: &Manga, commands: &[Command]) -> Result<Vec<Chapter>> {
        let result = async {
            let ctx = with_commands(json!({ "manga": serde_json::to_value(manga)? }), commands)?;
            let parsed = self.run(&CHAPTER_LIST, ctx, Some(&manga.key), commands).await?;
            marshal::chapters(&parsed)
        }
        .await;
        self.log_failure("get_chapter_list", result)
    }

    async fn get_page_list(&self, chapter: &Chapter, commands: &[Command]) -> Result<Vec<Page>> {
        let result = async {
            let ctx = with_commands(json!({ "chapter": serde_json::to_value(chapter)? }), commands)?;
            let parsed = self.run(&PAGE_LIST, ctx, Some(&chapter.key), commands).await?;
            marshal::pages(&parsed)
        }
        .await;
        self.log_failure("get_page_list", result)
    }

    async fn get_listings(&self) -> Result<Vec<Listing>> {
        self.listings
            .get_or_try_init(|| async { marshal::listings(&self.declared("getListings").await?) })
            .await
            .cloned()
    }

    async fn get_filters(&self) -> Result<Vec<FilterDefinition>> {
        self.filters
            .get_or_try_init(|| async { marshal::filters(&self.declared("getFilters").await?) })
            .await
            .cloned()
    }

    async fn get_commands(&self) -> Result<Vec<Command>> {
        self.commands
            .get_or_try_init(|| async { marshal::commands(&self.declared("getCommands").await?) })
            .await
            .cloned()
    }

    /// GET the base URL; the script is not involved
    async fn probe(&self) -> Result<()> {
        let response = self.client.get(&self.source.base_url).await?;
        if response.status >= 400 {
            return Err(TingError::http_status(response.status, &response.url));
        }
        Ok(())
    }
}
