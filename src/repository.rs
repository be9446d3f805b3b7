//! Cache-first post repository.
//!
//! Reads go to the [`PostsCache`] first and fall back to the [`LocalSource`]
//! for whatever the cache lacks. Writes persist to the local source inside a
//! transaction and only then update the cache.
//!
//! Every public operation waits until the startup prune has finished and then
//! runs under a single async lock, so the cache and the local source change
//! together.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tracing::{debug, error, info, warn};

use crate::cache::PostsCache;
use crate::cleanup::{prune_database, CleanupReport};
use crate::config::Config;
use crate::db::{LocalSource, OriginalPostsQuery};
use crate::error::{ChanError, Result};
use crate::models::{ArchiveId, CatalogDescriptor, ChanPost, PostDescriptor, ThreadDescriptor};

struct RepositoryInner {
    config: Arc<Config>,
    posts_cache: Arc<PostsCache>,
    local_source: Arc<dyn LocalSource>,
    lock: Mutex<()>,
    initialized: watch::Receiver<bool>,
}

#[derive(Clone)]
pub struct ChanPostRepository {
    inner: Arc<RepositoryInner>,
}

impl ChanPostRepository {
    /// Create the repository and start the startup prune in the background.
    /// Must be called from within a tokio runtime.
    pub fn new(
        config: Arc<Config>,
        posts_cache: Arc<PostsCache>,
        local_source: Arc<dyn LocalSource>,
    ) -> Self {
        let (initialized_tx, initialized) = watch::channel(false);

        let source = Arc::clone(&local_source);
        let prune_config = Arc::clone(&config);
        tokio::spawn(async move {
            match prune_database(source.as_ref(), &prune_config.database, false).await {
                Ok(report) => info!(
                    "Startup prune done: {} posts, {} threads deleted",
                    report.posts_deleted, report.threads_deleted
                ),
                // Still counts as initialized
                Err(e) => error!("Startup prune failed: {}", e),
            }
            initialized_tx.send_replace(true);
        });

        Self {
            inner: Arc::new(RepositoryInner {
                config,
                posts_cache,
                local_source,
                lock: Mutex::new(()),
                initialized,
            }),
        }
    }

    pub fn posts_cache(&self) -> &Arc<PostsCache> {
        &self.inner.posts_cache
    }

    pub fn is_initialized(&self) -> bool {
        *self.inner.initialized.borrow()
    }

    async fn await_until_initialized(&self) {
        let mut initialized = self.inner.initialized.clone();
        if initialized.wait_for(|done| *done).await.is_err() {
            warn!("Startup prune task ended without signalling, continuing uninitialized");
        }
    }

    /// Run `operation` inside a local source transaction, rolling back when
    /// it fails
    async fn in_transaction<T, F, Fut>(&self, operation: F) -> Result<T>
    where
        F: FnOnce(Arc<dyn LocalSource>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let source = &self.inner.local_source;
        source.begin_transaction().await?;

        match operation(Arc::clone(source)).await {
            Ok(value) => {
                source.commit_transaction().await?;
                Ok(value)
            }
            Err(e) => {
                if let Err(rollback_err) = source.rollback_transaction().await {
                    error!("Failed to roll back transaction: {}", rollback_err);
                }
                Err(e)
            }
        }
    }

    /// Persist and cache a batch of posts, returning how many were written.
    ///
    /// A catalog batch holds original posts of any threads of one board. A
    /// thread batch holds posts of a single thread starting with its original
    /// post; replies equal to their cached copy are not written again.
    pub async fn insert_or_update_many(&self, posts: Vec<ChanPost>, is_catalog: bool) -> Result<usize> {
        if posts.is_empty() {
            return Err(ChanError::ContractViolation("empty post batch".to_string()));
        }

        self.await_until_initialized().await;
        let _guard = self.inner.lock.lock().await;

        if is_catalog {
            self.insert_catalog_posts(posts).await
        } else {
            self.insert_thread_posts(posts).await
        }
    }

    async fn insert_catalog_posts(&self, posts: Vec<ChanPost>) -> Result<usize> {
        if let Some(post) = posts.iter().find(|post| !post.is_op()) {
            return Err(ChanError::ContractViolation(format!(
                "{} in a catalog batch is not an original post",
                post.post_descriptor
            )));
        }

        let to_store = posts.clone();
        self.in_transaction(move |source| async move {
            source.insert_many_original_posts(&to_store).await
        })
        .await?;

        let count = posts.len();
        for post in posts {
            self.inner.posts_cache.put_original_post(post);
        }

        debug!("Stored {} catalog original posts", count);
        Ok(count)
    }

    async fn insert_thread_posts(&self, posts: Vec<ChanPost>) -> Result<usize> {
        let first = &posts[0];
        if !first.is_op() {
            return Err(ChanError::ContractViolation(format!(
                "thread batch starts with {} which is not an original post",
                first.post_descriptor
            )));
        }

        let thread = first.post_descriptor.thread_descriptor();
        if let Some(post) = posts
            .iter()
            .find(|post| post.post_descriptor.thread_descriptor() != thread)
        {
            return Err(ChanError::ContractViolation(format!(
                "{} does not belong to thread {}",
                post.post_descriptor, thread
            )));
        }
        if posts.iter().skip(1).any(ChanPost::is_op) {
            return Err(ChanError::ContractViolation(format!(
                "thread batch for {} holds more than one original post",
                thread
            )));
        }

        let mut changed = posts
            .iter()
            .filter(|post| self.differs_from_cached(post))
            .cloned();
        // The original post always differs, so it leads `changed`
        let Some(original_post) = changed.next() else {
            return Ok(0);
        };
        let replies: Vec<ChanPost> = changed.collect();
        let written = replies.len() + 1;

        self.in_transaction(move |source| async move {
            let thread_id = source.insert_original_post(&original_post).await?;
            if !replies.is_empty() {
                source.insert_posts(thread_id, &replies).await?;
            }
            Ok::<_, ChanError>(())
        })
        .await?;

        self.inner.posts_cache.put_many(&thread, posts);

        debug!("Stored {} posts of thread {}", written, thread);
        Ok(written)
    }

    fn differs_from_cached(&self, post: &ChanPost) -> bool {
        if post.is_op() {
            return true;
        }
        match self.inner.posts_cache.get(&post.post_descriptor) {
            Some(cached) => cached != *post,
            None => true,
        }
    }

    /// All posts of a thread: whatever is cached plus what the local source
    /// has beyond it. `max_count` bounds the local source read.
    pub async fn get_thread_posts(
        &self,
        thread: &ThreadDescriptor,
        archive_ids: &HashSet<ArchiveId>,
        max_count: usize,
    ) -> Result<Vec<ChanPost>> {
        self.await_until_initialized().await;
        let _guard = self.inner.lock.lock().await;

        let cache = &self.inner.posts_cache;
        let cached_post_nos = cache.get_post_nos(thread);
        let from_source = self
            .inner
            .local_source
            .get_thread_posts(thread, archive_ids, &cached_post_nos, max_count)
            .await?;

        if !from_source.is_empty() {
            let has_original_post = cache.get_original_post(thread).is_some()
                || from_source.first().map(ChanPost::is_op).unwrap_or(false);

            if !has_original_post {
                warn!(
                    "Thread {} has no original post in cache or local source, returning {} posts uncached",
                    thread,
                    from_source.len()
                );
                return Ok(from_source);
            }

            cache.put_many(thread, from_source);
        }

        Ok(cache.get_thread_posts(thread))
    }

    /// Original posts for a catalog. Cached copies win over stored ones.
    pub async fn get_catalog_original_posts(
        &self,
        catalog: &CatalogDescriptor,
        archive_ids: &HashSet<ArchiveId>,
        query: &OriginalPostsQuery,
    ) -> Result<Vec<ChanPost>> {
        self.await_until_initialized().await;
        let _guard = self.inner.lock.lock().await;

        let cache = &self.inner.posts_cache;
        let source = &self.inner.local_source;

        match query {
            OriginalPostsQuery::ThreadNos(thread_nos) => {
                let mut found: HashMap<i64, ChanPost> = thread_nos
                    .iter()
                    .filter_map(|no| {
                        let thread = ThreadDescriptor::new(catalog.board.clone(), *no);
                        cache
                            .get_original_post(&thread)
                            .filter(|post| post.matches_archive(archive_ids))
                            .map(|post| (*no, post))
                    })
                    .collect();

                let missing: Vec<i64> = thread_nos
                    .iter()
                    .copied()
                    .filter(|no| !found.contains_key(no))
                    .collect();

                if !missing.is_empty() {
                    let stored = source
                        .get_catalog_original_posts(
                            catalog,
                            archive_ids,
                            &OriginalPostsQuery::ThreadNos(missing),
                        )
                        .await?;
                    for post in stored {
                        found.insert(post.post_descriptor.thread_no(), self.cache_original_post(post));
                    }
                }

                Ok(thread_nos.iter().filter_map(|no| found.remove(no)).collect())
            }
            OriginalPostsQuery::Latest(_) => {
                let stored = source
                    .get_catalog_original_posts(catalog, archive_ids, query)
                    .await?;

                Ok(stored
                    .into_iter()
                    .map(|post| {
                        let thread = post.post_descriptor.thread_descriptor();
                        match cache.get_original_post(&thread) {
                            Some(cached) => cached,
                            None => self.cache_original_post(post),
                        }
                    })
                    .collect())
            }
        }
    }

    fn cache_original_post(&self, post: ChanPost) -> ChanPost {
        let thread = post.post_descriptor.thread_descriptor();
        self.inner.posts_cache.put_original_post(post.clone());
        self.inner
            .posts_cache
            .get_original_post(&thread)
            .unwrap_or(post)
    }

    /// Post numbers known for a thread in the cache or the local source
    pub async fn get_thread_post_ids(
        &self,
        thread: &ThreadDescriptor,
        archive_ids: &HashSet<ArchiveId>,
        max_count: usize,
    ) -> Result<HashSet<i64>> {
        self.await_until_initialized().await;
        let _guard = self.inner.lock.lock().await;

        let mut post_nos = self.inner.posts_cache.get_post_nos(thread);
        let stored = self
            .inner
            .local_source
            .get_thread_post_nos(thread, archive_ids, max_count)
            .await?;
        post_nos.extend(stored);
        Ok(post_nos)
    }

    pub async fn get_thread_original_post(&self, thread: &ThreadDescriptor) -> Result<Option<ChanPost>> {
        self.await_until_initialized().await;
        let _guard = self.inner.lock.lock().await;

        if let Some(post) = self.inner.posts_cache.get_original_post(thread) {
            return Ok(Some(post));
        }

        let catalog = CatalogDescriptor::new(thread.board.clone());
        let stored = self
            .inner
            .local_source
            .get_catalog_original_posts(
                &catalog,
                &HashSet::new(),
                &OriginalPostsQuery::ThreadNos(vec![thread.thread_no]),
            )
            .await?;

        Ok(stored
            .into_iter()
            .next()
            .map(|post| self.cache_original_post(post)))
    }

    /// Cache-only lookup
    pub async fn get_cached_post(&self, descriptor: &PostDescriptor) -> Option<ChanPost> {
        self.await_until_initialized().await;
        let _guard = self.inner.lock.lock().await;

        self.inner.posts_cache.get(descriptor)
    }

    /// Remove a post from the local source and the cache. Removing the
    /// original post removes the thread.
    pub async fn delete_post(&self, descriptor: &PostDescriptor) -> Result<bool> {
        self.await_until_initialized().await;
        let _guard = self.inner.lock.lock().await;

        let stored = self.inner.local_source.delete_post(descriptor).await?;
        let cached = self.inner.posts_cache.delete(descriptor);
        Ok(stored || cached)
    }

    pub async fn delete_thread(&self, thread: &ThreadDescriptor) -> Result<bool> {
        self.await_until_initialized().await;
        let _guard = self.inner.lock.lock().await;

        let stored = self.inner.local_source.delete_thread(thread).await?;
        let cached = self.inner.posts_cache.delete_thread(thread);
        Ok(stored || cached)
    }

    /// Set the soft-delete marker on a cached post and persist the change.
    /// Returns `false` when the post is not cached.
    pub async fn set_post_deleted(&self, descriptor: &PostDescriptor, deleted: bool) -> Result<bool> {
        self.await_until_initialized().await;
        let _guard = self.inner.lock.lock().await;

        let Some(thread) = self
            .inner
            .posts_cache
            .get_thread(&descriptor.thread_descriptor())
        else {
            return Ok(false);
        };
        if !thread.set_post_deleted(descriptor, deleted) {
            return Ok(false);
        }
        let Some(post) = thread.get_post(descriptor) else {
            return Ok(false);
        };

        let source = &self.inner.local_source;
        let Some(thread_id) = source.get_thread_id_by_post_descriptor(descriptor).await? else {
            debug!("{} is cached but not stored, soft deletion kept in memory", descriptor);
            return Ok(true);
        };

        if post.is_op() {
            source.insert_original_post(&post).await?;
        } else {
            source.insert_posts(thread_id, &[post]).await?;
        }
        Ok(true)
    }

    /// Prune the local source now. `force` prunes even under the limits.
    pub async fn cleanup(&self, force: bool) -> Result<CleanupReport> {
        self.await_until_initialized().await;
        let _guard = self.inner.lock.lock().await;

        prune_database(
            self.inner.local_source.as_ref(),
            &self.inner.config.database,
            force,
        )
        .await
    }

    pub async fn total_posts_count(&self) -> Result<usize> {
        self.await_until_initialized().await;
        let _guard = self.inner.lock.lock().await;

        self.inner.local_source.count_total_amount_of_posts().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DatabaseConfig, SiteConfig};
    use crate::db::MemoryLocalSource;
    use crate::models::{BoardDescriptor, OriginalPostData};
    use async_trait::async_trait;
    use std::collections::BTreeSet;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::Notify;
    use tokio_test::{assert_err, assert_ok};

    fn board() -> BoardDescriptor {
        BoardDescriptor::new("4chan.org", "g")
    }

    fn thread(no: i64) -> ThreadDescriptor {
        ThreadDescriptor::new(board(), no)
    }

    fn op(no: i64) -> ChanPost {
        ChanPost::original(PostDescriptor::new(&thread(no), no), OriginalPostData::default())
    }

    fn reply(thread_no: i64, post_no: i64, replies_to: &[i64]) -> ChanPost {
        ChanPost::reply(PostDescriptor::new(&thread(thread_no), post_no))
            .with_replies_to(replies_to.iter().copied())
    }

    fn post_nos(posts: &[ChanPost]) -> Vec<i64> {
        posts.iter().map(ChanPost::post_no).collect()
    }

    /// Memory source that counts written replies, can fail reply writes and
    /// can hold the startup prune until released
    #[derive(Default)]
    struct TestLocalSource {
        inner: MemoryLocalSource,
        fail_insert_posts: AtomicBool,
        inserted_replies: AtomicUsize,
        gate: Option<Arc<Notify>>,
    }

    #[async_trait]
    impl LocalSource for TestLocalSource {
        async fn begin_transaction(&self) -> Result<()> {
            self.inner.begin_transaction().await
        }

        async fn commit_transaction(&self) -> Result<()> {
            self.inner.commit_transaction().await
        }

        async fn rollback_transaction(&self) -> Result<()> {
            self.inner.rollback_transaction().await
        }

        async fn insert_many_original_posts(&self, posts: &[ChanPost]) -> Result<()> {
            self.inner.insert_many_original_posts(posts).await
        }

        async fn insert_original_post(&self, post: &ChanPost) -> Result<i64> {
            self.inner.insert_original_post(post).await
        }

        async fn insert_posts(&self, thread_id: i64, posts: &[ChanPost]) -> Result<()> {
            if self.fail_insert_posts.load(Ordering::SeqCst) {
                return Err(ChanError::Storage("disk full".to_string()));
            }
            self.inserted_replies.fetch_add(posts.len(), Ordering::SeqCst);
            self.inner.insert_posts(thread_id, posts).await
        }

        async fn get_catalog_original_posts(
            &self,
            catalog: &CatalogDescriptor,
            archive_ids: &HashSet<ArchiveId>,
            query: &OriginalPostsQuery,
        ) -> Result<Vec<ChanPost>> {
            self.inner
                .get_catalog_original_posts(catalog, archive_ids, query)
                .await
        }

        async fn get_thread_posts(
            &self,
            thread: &ThreadDescriptor,
            archive_ids: &HashSet<ArchiveId>,
            exclude_post_nos: &HashSet<i64>,
            max_count: usize,
        ) -> Result<Vec<ChanPost>> {
            self.inner
                .get_thread_posts(thread, archive_ids, exclude_post_nos, max_count)
                .await
        }

        async fn get_thread_post_nos(
            &self,
            thread: &ThreadDescriptor,
            archive_ids: &HashSet<ArchiveId>,
            max_count: usize,
        ) -> Result<HashSet<i64>> {
            self.inner
                .get_thread_post_nos(thread, archive_ids, max_count)
                .await
        }

        async fn delete_old_posts(&self, count: usize) -> Result<usize> {
            self.inner.delete_old_posts(count).await
        }

        async fn delete_old_threads(&self, count: usize) -> Result<usize> {
            self.inner.delete_old_threads(count).await
        }

        async fn delete_thread(&self, thread: &ThreadDescriptor) -> Result<bool> {
            self.inner.delete_thread(thread).await
        }

        async fn delete_post(&self, post: &PostDescriptor) -> Result<bool> {
            self.inner.delete_post(post).await
        }

        async fn count_total_amount_of_posts(&self) -> Result<usize> {
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            self.inner.count_total_amount_of_posts().await
        }

        async fn count_total_amount_of_threads(&self) -> Result<usize> {
            self.inner.count_total_amount_of_threads().await
        }

        async fn get_thread_id_by_post_descriptor(&self, post: &PostDescriptor) -> Result<Option<i64>> {
            self.inner.get_thread_id_by_post_descriptor(post).await
        }
    }

    fn repository_with(config: Config, source: Arc<dyn LocalSource>) -> ChanPostRepository {
        crate::init_tracing();
        let config = Arc::new(config);
        let cache = Arc::new(PostsCache::new(
            config.cache.max_posts_count_in_posts_cache,
            SiteConfig::default(),
        ));
        ChanPostRepository::new(config, cache, source)
    }

    fn repository() -> (ChanPostRepository, Arc<TestLocalSource>) {
        let source = Arc::new(TestLocalSource::default());
        (repository_with(Config::default(), source.clone()), source)
    }

    #[tokio::test]
    async fn test_thread_round_trip_and_delete() {
        let (repository, source) = repository();

        let written = repository
            .insert_or_update_many(vec![op(1), reply(1, 2, &[1]), reply(1, 3, &[1])], false)
            .await
            .unwrap();
        assert_eq!(written, 3);
        assert_eq!(source.inner.count_total_amount_of_posts().await.unwrap(), 3);

        let posts = repository
            .get_thread_posts(&thread(1), &HashSet::new(), 100)
            .await
            .unwrap();
        assert_eq!(post_nos(&posts), vec![1, 2, 3]);
        assert_eq!(posts[0].replies_from, BTreeSet::from([2, 3]));

        assert!(assert_ok!(repository.delete_post(&PostDescriptor::new(&thread(1), 2)).await));

        let posts = repository
            .get_thread_posts(&thread(1), &HashSet::new(), 100)
            .await
            .unwrap();
        assert_eq!(post_nos(&posts), vec![1, 3]);
        assert_eq!(posts[0].replies_from, BTreeSet::from([3]));
        assert_eq!(repository.total_posts_count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_unchanged_replies_are_not_written_again() {
        let (repository, source) = repository();
        let batch = vec![op(1), reply(1, 2, &[1]), reply(1, 3, &[])];

        assert_eq!(repository.insert_or_update_many(batch.clone(), false).await.unwrap(), 3);
        assert_eq!(source.inserted_replies.load(Ordering::SeqCst), 2);

        assert_eq!(repository.insert_or_update_many(batch, false).await.unwrap(), 1);
        assert_eq!(source.inserted_replies.load(Ordering::SeqCst), 2);

        let edited = vec![op(1), reply(1, 2, &[1]).with_comment("edited"), reply(1, 3, &[])];
        assert_eq!(repository.insert_or_update_many(edited, false).await.unwrap(), 2);
        assert_eq!(source.inserted_replies.load(Ordering::SeqCst), 3);

        let cached = repository
            .get_cached_post(&PostDescriptor::new(&thread(1), 2))
            .await
            .unwrap();
        assert_eq!(cached.comment, "edited");
    }

    #[tokio::test]
    async fn test_invalid_batches_are_rejected() {
        let (repository, _) = repository();

        let err = assert_err!(repository.insert_or_update_many(Vec::new(), false).await);
        assert!(matches!(err, ChanError::ContractViolation(_)));

        let err = assert_err!(
            repository
                .insert_or_update_many(vec![op(1), reply(1, 2, &[])], true)
                .await
        );
        assert!(matches!(err, ChanError::ContractViolation(_)));

        let err = assert_err!(
            repository
                .insert_or_update_many(vec![reply(1, 2, &[])], false)
                .await
        );
        assert!(matches!(err, ChanError::ContractViolation(_)));

        let err = assert_err!(
            repository
                .insert_or_update_many(vec![op(1), reply(2, 3, &[])], false)
                .await
        );
        assert!(matches!(err, ChanError::ContractViolation(_)));

        assert_eq!(repository.total_posts_count().await.unwrap(), 0);
        assert_eq!(repository.posts_cache().post_count(), 0);
    }

    #[tokio::test]
    async fn test_failed_write_rolls_back_and_skips_cache() {
        let (repository, source) = repository();
        source.fail_insert_posts.store(true, Ordering::SeqCst);

        let err = assert_err!(
            repository
                .insert_or_update_many(vec![op(1), reply(1, 2, &[1])], false)
                .await
        );
        assert!(err.is_storage());

        assert_eq!(source.inner.count_total_amount_of_posts().await.unwrap(), 0);
        assert!(!repository.posts_cache().contains_thread(&thread(1)));

        source.fail_insert_posts.store(false, Ordering::SeqCst);
        assert_ok!(
            repository
                .insert_or_update_many(vec![op(1), reply(1, 2, &[1])], false)
                .await
        );
        assert_eq!(repository.total_posts_count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_thread_posts_are_loaded_from_local_source() {
        let source = Arc::new(TestLocalSource::default());
        let thread_id = source.inner.insert_original_post(&op(1)).await.unwrap();
        source
            .inner
            .insert_posts(thread_id, &[reply(1, 2, &[1]), reply(1, 3, &[2])])
            .await
            .unwrap();

        let repository = repository_with(Config::default(), source);
        let posts = repository
            .get_thread_posts(&thread(1), &HashSet::new(), 100)
            .await
            .unwrap();

        assert_eq!(post_nos(&posts), vec![1, 2, 3]);
        assert_eq!(posts[1].replies_from, BTreeSet::from([3]));
        assert!(repository.posts_cache().contains_thread(&thread(1)));

        let ids = repository
            .get_thread_post_ids(&thread(1), &HashSet::new(), 100)
            .await
            .unwrap();
        assert_eq!(ids, HashSet::from([1, 2, 3]));
    }

    #[tokio::test]
    async fn test_catalog_posts_prefer_cache_and_keep_order() {
        let (repository, _) = repository();
        let catalog = CatalogDescriptor::new(board());
        let catalog_ops: Vec<_> = [10, 20, 30]
            .iter()
            .map(|no| {
                ChanPost::original(
                    PostDescriptor::for_catalog(&catalog, *no),
                    OriginalPostData::default(),
                )
            })
            .collect();

        assert_eq!(repository.insert_or_update_many(catalog_ops, true).await.unwrap(), 3);

        repository.posts_cache().delete_thread(&thread(20));
        repository
            .insert_or_update_many(vec![op(30).with_comment("fresh")], false)
            .await
            .unwrap();

        let posts = repository
            .get_catalog_original_posts(
                &catalog,
                &HashSet::new(),
                &OriginalPostsQuery::ThreadNos(vec![30, 20, 10, 99]),
            )
            .await
            .unwrap();
        let thread_nos: Vec<_> = posts.iter().map(|p| p.post_descriptor.thread_no()).collect();
        assert_eq!(thread_nos, vec![30, 20, 10]);
        assert_eq!(posts[0].comment, "fresh");
        assert!(repository.posts_cache().contains_thread(&thread(20)));

        let latest = repository
            .get_catalog_original_posts(&catalog, &HashSet::new(), &OriginalPostsQuery::Latest(2))
            .await
            .unwrap();
        assert_eq!(latest.len(), 2);
    }

    #[tokio::test]
    async fn test_original_post_falls_back_to_local_source() {
        let source = Arc::new(TestLocalSource::default());
        source.inner.insert_original_post(&op(5)).await.unwrap();
        let repository = repository_with(Config::default(), source);

        let post = repository.get_thread_original_post(&thread(5)).await.unwrap();
        assert_eq!(post.map(|p| p.post_no()), Some(5));
        assert!(repository.posts_cache().contains_thread(&thread(5)));
        assert!(repository.get_thread_original_post(&thread(6)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_set_post_deleted_persists() {
        let (repository, source) = repository();
        repository
            .insert_or_update_many(vec![op(1), reply(1, 2, &[1])], false)
            .await
            .unwrap();

        let descriptor = PostDescriptor::new(&thread(1), 2);
        assert!(repository.set_post_deleted(&descriptor, true).await.unwrap());
        assert!(repository.get_cached_post(&descriptor).await.unwrap().deleted);

        let stored = source
            .inner
            .get_thread_posts(&thread(1), &HashSet::new(), &HashSet::new(), 10)
            .await
            .unwrap();
        assert!(stored[1].deleted);

        let missing = PostDescriptor::new(&thread(1), 9);
        assert!(!repository.set_post_deleted(&missing, true).await.unwrap());
    }

    #[tokio::test]
    async fn test_set_post_deleted_skips_unstored_thread() {
        let (repository, source) = repository();
        repository.posts_cache().put_many(&thread(7), vec![op(7)]);

        let descriptor = PostDescriptor::new(&thread(7), 7);
        assert!(repository.set_post_deleted(&descriptor, true).await.unwrap());
        assert!(repository.get_cached_post(&descriptor).await.unwrap().deleted);
        assert_eq!(source.inner.count_total_amount_of_threads().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_delete_thread() {
        let (repository, _) = repository();
        repository
            .insert_or_update_many(vec![op(1), reply(1, 2, &[])], false)
            .await
            .unwrap();

        assert!(repository.delete_thread(&thread(1)).await.unwrap());
        assert!(!repository.delete_thread(&thread(1)).await.unwrap());
        assert_eq!(repository.total_posts_count().await.unwrap(), 0);
        assert!(!repository.posts_cache().contains_thread(&thread(1)));
    }

    #[tokio::test]
    async fn test_operations_wait_for_startup_prune() {
        let gate = Arc::new(Notify::new());
        let source = Arc::new(TestLocalSource {
            gate: Some(gate.clone()),
            ..Default::default()
        });
        let thread_id = source.inner.insert_original_post(&op(1)).await.unwrap();
        let replies: Vec<_> = (2..=10).map(|no| reply(1, no, &[])).collect();
        source.inner.insert_posts(thread_id, &replies).await.unwrap();

        let config = Config {
            database: DatabaseConfig {
                max_amount_of_posts_in_database: 4,
                max_amount_of_threads_in_database: 10,
            },
            ..Default::default()
        };
        let repository = repository_with(config, source.clone());
        assert!(!repository.is_initialized());

        let pending = tokio::spawn({
            let repository = repository.clone();
            async move {
                repository
                    .get_thread_posts(&thread(1), &HashSet::new(), 100)
                    .await
            }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!pending.is_finished());

        // Startup prune counts posts once, the read afterwards does not
        gate.notify_one();
        let posts = pending.await.unwrap().unwrap();

        assert!(repository.is_initialized());
        assert_eq!(posts.len(), 5);
        assert_eq!(source.inner.count_total_amount_of_posts().await.unwrap(), 5);
    }
}
