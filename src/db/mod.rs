mod memory;

pub use memory::MemoryLocalSource;

use async_trait::async_trait;
use std::collections::HashSet;

use crate::error::Result;
use crate::models::{ArchiveId, CatalogDescriptor, ChanPost, PostDescriptor, ThreadDescriptor};

/// Which catalog OPs to load
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OriginalPostsQuery {
    /// The `n` most recently stored threads of the board
    Latest(usize),
    /// Specific threads by number
    ThreadNos(Vec<i64>),
}

/// Durable post storage.
///
/// Implementations are expected to be backed by a relational store. Every
/// `archive_ids` argument filters posts by the archive they came from; an
/// empty set matches every archive.
#[async_trait]
pub trait LocalSource: Send + Sync {
    async fn begin_transaction(&self) -> Result<()>;
    async fn commit_transaction(&self) -> Result<()>;
    async fn rollback_transaction(&self) -> Result<()>;

    async fn insert_many_original_posts(&self, posts: &[ChanPost]) -> Result<()>;

    /// Upsert a thread's original post, returning the thread's store id
    async fn insert_original_post(&self, post: &ChanPost) -> Result<i64>;

    async fn insert_posts(&self, thread_id: i64, posts: &[ChanPost]) -> Result<()>;

    async fn get_catalog_original_posts(
        &self,
        catalog: &CatalogDescriptor,
        archive_ids: &HashSet<ArchiveId>,
        query: &OriginalPostsQuery,
    ) -> Result<Vec<ChanPost>>;

    /// The original post plus the latest replies, at most `max_count` posts
    /// in thread order, skipping post numbers in `exclude_post_nos`
    async fn get_thread_posts(
        &self,
        thread: &ThreadDescriptor,
        archive_ids: &HashSet<ArchiveId>,
        exclude_post_nos: &HashSet<i64>,
        max_count: usize,
    ) -> Result<Vec<ChanPost>>;

    async fn get_thread_post_nos(
        &self,
        thread: &ThreadDescriptor,
        archive_ids: &HashSet<ArchiveId>,
        max_count: usize,
    ) -> Result<HashSet<i64>>;

    /// Delete up to `count` of the oldest replies, returning how many went
    async fn delete_old_posts(&self, count: usize) -> Result<usize>;

    /// Delete up to `count` of the least recently updated threads with all
    /// their posts, returning how many threads went
    async fn delete_old_threads(&self, count: usize) -> Result<usize>;

    async fn delete_thread(&self, thread: &ThreadDescriptor) -> Result<bool>;
    async fn delete_post(&self, post: &PostDescriptor) -> Result<bool>;

    async fn count_total_amount_of_posts(&self) -> Result<usize>;
    async fn count_total_amount_of_threads(&self) -> Result<usize>;

    async fn get_thread_id_by_post_descriptor(&self, post: &PostDescriptor) -> Result<Option<i64>>;
}
