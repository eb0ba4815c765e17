//! Uniform source contract
//!
//! Native sources supplied by the host and script sources built by
//! [`UserSourceEngine`](super::source_engine::UserSourceEngine) implement the
//! same trait, so callers never need to know which kind they are talking to.

use super::types::{
    Chapter, Command, FilterDefinition, FilterMap, Listing, Manga, Page, PageResult, SourceId,
};
use crate::core::error::Result;
use async_trait::async_trait;

/// What to list: a named listing or a filtered search
#[derive(Debug, Clone, PartialEq)]
pub enum MangaListQuery {
    Listing(Listing),
    Filters(FilterMap),
}

impl Default for MangaListQuery {
    fn default() -> Self {
        MangaListQuery::Filters(FilterMap::new())
    }
}

#[async_trait]
pub trait Source: Send + Sync {
    fn id(&self) -> SourceId;

    fn name(&self) -> &str;

    fn lang(&self) -> &str;

    async fn get_manga_list(&self, query: &MangaListQuery, page: u32) -> Result<PageResult>;

    async fn get_manga_details(&self, manga: &Manga, commands: &[Command]) -> Result<Manga>;

    async fn get_chapter_list(&self, manga: &Manga, commands: &[Command]) -> Result<Vec<Chapter>>;

    async fn get_page_list(&self, chapter: &Chapter, commands: &[Command]) -> Result<Vec<Page>>;

    async fn get_listings(&self) -> Result<Vec<Listing>>;

    async fn get_filters(&self) -> Result<Vec<FilterDefinition>>;

    async fn get_commands(&self) -> Result<Vec<Command>>;

    /// Liveness probe used by the health checker
    ///
    /// The default lists the first page with no filters.
    async fn probe(&self) -> Result<()> {
        self.get_manga_list(&MangaListQuery::default(), 1).await.map(|_| ())
    }
}
