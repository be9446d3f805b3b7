//! In-memory local source.
//!
//! Keeps the same contract as a relational backend: store ids are assigned
//! on first insert, deleting a thread cascades to its posts, and transactions
//! are all-or-nothing (a snapshot is taken on begin and restored on
//! rollback). Used by tests and by embedders that do not need durability.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, HashSet};
use tokio::sync::{Mutex, RwLock};

use super::{LocalSource, OriginalPostsQuery};
use crate::error::{ChanError, Result};
use crate::models::{ArchiveId, CatalogDescriptor, ChanPost, PostDescriptor, ThreadDescriptor};

#[derive(Debug, Clone)]
struct StoredThread {
    thread_id: i64,
    /// Bumped on every write touching the thread
    updated_seq: u64,
    /// Keyed by (post_no, post_sub_no)
    posts: BTreeMap<(i64, i64), ChanPost>,
}

impl StoredThread {
    fn original_post(&self) -> Option<&ChanPost> {
        self.posts.values().find(|post| post.is_op())
    }
}

#[derive(Debug, Clone, Default)]
struct MemoryState {
    threads: HashMap<ThreadDescriptor, StoredThread>,
    thread_ids: HashMap<i64, ThreadDescriptor>,
    next_thread_id: i64,
    next_post_id: i64,
    seq: u64,
}

impl MemoryState {
    fn next_seq(&mut self) -> u64 {
        self.seq += 1;
        self.seq
    }

    fn get_or_create_thread(&mut self, descriptor: &ThreadDescriptor) -> i64 {
        if let Some(thread) = self.threads.get(descriptor) {
            return thread.thread_id;
        }

        self.next_thread_id += 1;
        let thread_id = self.next_thread_id;
        self.threads.insert(
            descriptor.clone(),
            StoredThread {
                thread_id,
                updated_seq: 0,
                posts: BTreeMap::new(),
            },
        );
        self.thread_ids.insert(thread_id, descriptor.clone());
        thread_id
    }

    fn upsert_post(&mut self, descriptor: &ThreadDescriptor, post: &ChanPost) {
        let seq = self.next_seq();
        let key = (post.post_descriptor.post_no(), post.post_descriptor.post_sub_no());

        let existing_id = self
            .threads
            .get(descriptor)
            .and_then(|thread| thread.posts.get(&key))
            .map(|stored| stored.chan_post_id);
        let chan_post_id = match existing_id {
            Some(id) => id,
            None => {
                self.next_post_id += 1;
                self.next_post_id
            }
        };

        if let Some(thread) = self.threads.get_mut(descriptor) {
            let mut stored = post.clone();
            stored.chan_post_id = chan_post_id;
            stored.replies_from.clear();
            stored.on_demand_content_loaded.clear();
            thread.posts.insert(key, stored);
            thread.updated_seq = seq;
        }
    }

    fn remove_thread(&mut self, descriptor: &ThreadDescriptor) -> bool {
        match self.threads.remove(descriptor) {
            Some(thread) => {
                self.thread_ids.remove(&thread.thread_id);
                true
            }
            None => false,
        }
    }
}

#[derive(Default)]
pub struct MemoryLocalSource {
    state: RwLock<MemoryState>,
    snapshot: Mutex<Option<MemoryState>>,
}

impl MemoryLocalSource {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LocalSource for MemoryLocalSource {
    async fn begin_transaction(&self) -> Result<()> {
        let mut snapshot = self.snapshot.lock().await;
        if snapshot.is_some() {
            return Err(ChanError::Storage("transaction already in progress".to_string()));
        }
        *snapshot = Some(self.state.read().await.clone());
        Ok(())
    }

    async fn commit_transaction(&self) -> Result<()> {
        match self.snapshot.lock().await.take() {
            Some(_) => Ok(()),
            None => Err(ChanError::Storage("no transaction to commit".to_string())),
        }
    }

    async fn rollback_transaction(&self) -> Result<()> {
        match self.snapshot.lock().await.take() {
            Some(previous) => {
                *self.state.write().await = previous;
                Ok(())
            }
            None => Err(ChanError::Storage("no transaction to roll back".to_string())),
        }
    }

    async fn insert_many_original_posts(&self, posts: &[ChanPost]) -> Result<()> {
        let mut state = self.state.write().await;
        for post in posts {
            let thread = post.post_descriptor.thread_descriptor();
            state.get_or_create_thread(&thread);
            state.upsert_post(&thread, post);
        }
        Ok(())
    }

    async fn insert_original_post(&self, post: &ChanPost) -> Result<i64> {
        if !post.is_op() {
            return Err(ChanError::Storage(format!(
                "{} is not an original post",
                post.post_descriptor
            )));
        }

        let mut state = self.state.write().await;
        let thread = post.post_descriptor.thread_descriptor();
        let thread_id = state.get_or_create_thread(&thread);
        state.upsert_post(&thread, post);
        Ok(thread_id)
    }

    async fn insert_posts(&self, thread_id: i64, posts: &[ChanPost]) -> Result<()> {
        let mut state = self.state.write().await;
        let thread = state
            .thread_ids
            .get(&thread_id)
            .cloned()
            .ok_or_else(|| ChanError::NotFound(format!("thread id {}", thread_id)))?;

        for post in posts {
            if post.post_descriptor.thread_descriptor() != thread {
                return Err(ChanError::Storage(format!(
                    "{} does not belong to thread id {}",
                    post.post_descriptor, thread_id
                )));
            }
            state.upsert_post(&thread, post);
        }
        Ok(())
    }

    async fn get_catalog_original_posts(
        &self,
        catalog: &CatalogDescriptor,
        archive_ids: &HashSet<ArchiveId>,
        query: &OriginalPostsQuery,
    ) -> Result<Vec<ChanPost>> {
        let state = self.state.read().await;

        let posts = match query {
            OriginalPostsQuery::Latest(count) => {
                let mut threads: Vec<_> = state
                    .threads
                    .iter()
                    .filter(|(descriptor, _)| descriptor.board == catalog.board)
                    .map(|(_, thread)| thread)
                    .collect();
                threads.sort_by(|a, b| b.updated_seq.cmp(&a.updated_seq));

                threads
                    .into_iter()
                    .filter_map(StoredThread::original_post)
                    .filter(|post| post.matches_archive(archive_ids))
                    .take(*count)
                    .cloned()
                    .collect()
            }
            OriginalPostsQuery::ThreadNos(thread_nos) => thread_nos
                .iter()
                .filter_map(|no| {
                    let descriptor = ThreadDescriptor::new(catalog.board.clone(), *no);
                    state.threads.get(&descriptor)?.original_post()
                })
                .filter(|post| post.matches_archive(archive_ids))
                .cloned()
                .collect(),
        };

        Ok(posts)
    }

    async fn get_thread_posts(
        &self,
        thread: &ThreadDescriptor,
        archive_ids: &HashSet<ArchiveId>,
        exclude_post_nos: &HashSet<i64>,
        max_count: usize,
    ) -> Result<Vec<ChanPost>> {
        let state = self.state.read().await;
        let Some(stored) = state.threads.get(thread) else {
            return Ok(Vec::new());
        };

        let mut selected: Vec<ChanPost> = stored
            .posts
            .values()
            .filter(|post| !exclude_post_nos.contains(&post.post_no()))
            .filter(|post| post.matches_archive(archive_ids))
            .cloned()
            .collect();
        selected.sort_by(ChanPost::thread_order);

        if selected.len() > max_count {
            let has_op = selected.first().map(ChanPost::is_op).unwrap_or(false);
            if has_op && max_count > 0 {
                let replies_to_keep = max_count - 1;
                let skip = selected.len() - 1 - replies_to_keep;
                selected.drain(1..1 + skip);
            } else {
                let skip = selected.len() - max_count;
                selected.drain(..skip);
            }
        }

        Ok(selected)
    }

    async fn get_thread_post_nos(
        &self,
        thread: &ThreadDescriptor,
        archive_ids: &HashSet<ArchiveId>,
        max_count: usize,
    ) -> Result<HashSet<i64>> {
        let posts = self
            .get_thread_posts(thread, archive_ids, &HashSet::new(), max_count)
            .await?;
        Ok(posts.iter().map(ChanPost::post_no).collect())
    }

    async fn delete_old_posts(&self, count: usize) -> Result<usize> {
        let mut state = self.state.write().await;

        let mut replies: Vec<(i64, ThreadDescriptor, (i64, i64))> = state
            .threads
            .iter()
            .flat_map(|(descriptor, thread)| {
                thread
                    .posts
                    .iter()
                    .filter(|(_, post)| !post.is_op())
                    .map(move |(key, post)| (post.chan_post_id, descriptor.clone(), *key))
            })
            .collect();
        replies.sort_by_key(|(id, _, _)| *id);

        let mut deleted = 0;
        for (_, descriptor, key) in replies.into_iter().take(count) {
            if let Some(thread) = state.threads.get_mut(&descriptor) {
                if thread.posts.remove(&key).is_some() {
                    deleted += 1;
                }
            }
        }
        Ok(deleted)
    }

    async fn delete_old_threads(&self, count: usize) -> Result<usize> {
        let mut state = self.state.write().await;

        let mut threads: Vec<(u64, i64, ThreadDescriptor)> = state
            .threads
            .iter()
            .map(|(descriptor, thread)| (thread.updated_seq, thread.thread_id, descriptor.clone()))
            .collect();
        threads.sort();

        let mut deleted = 0;
        for (_, _, descriptor) in threads.into_iter().take(count) {
            if state.remove_thread(&descriptor) {
                deleted += 1;
            }
        }
        Ok(deleted)
    }

    async fn delete_thread(&self, thread: &ThreadDescriptor) -> Result<bool> {
        Ok(self.state.write().await.remove_thread(thread))
    }

    async fn delete_post(&self, post: &PostDescriptor) -> Result<bool> {
        let thread = post.thread_descriptor();
        if post.is_op() {
            return self.delete_thread(&thread).await;
        }

        let mut state = self.state.write().await;
        let removed = state
            .threads
            .get_mut(&thread)
            .map(|stored| stored.posts.remove(&(post.post_no(), post.post_sub_no())).is_some())
            .unwrap_or(false);
        Ok(removed)
    }

    async fn count_total_amount_of_posts(&self) -> Result<usize> {
        let state = self.state.read().await;
        Ok(state.threads.values().map(|thread| thread.posts.len()).sum())
    }

    async fn count_total_amount_of_threads(&self) -> Result<usize> {
        Ok(self.state.read().await.threads.len())
    }

    async fn get_thread_id_by_post_descriptor(&self, post: &PostDescriptor) -> Result<Option<i64>> {
        let state = self.state.read().await;
        Ok(state
            .threads
            .get(&post.thread_descriptor())
            .map(|thread| thread.thread_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{BoardDescriptor, OriginalPostData};
    use tokio_test::assert_ok;

    fn board() -> BoardDescriptor {
        BoardDescriptor::new("4chan.org", "g")
    }

    fn thread(no: i64) -> ThreadDescriptor {
        ThreadDescriptor::new(board(), no)
    }

    fn op(no: i64) -> ChanPost {
        ChanPost::original(PostDescriptor::new(&thread(no), no), OriginalPostData::default())
    }

    fn reply(thread_no: i64, post_no: i64) -> ChanPost {
        ChanPost::reply(PostDescriptor::new(&thread(thread_no), post_no))
    }

    async fn source_with_thread(thread_no: i64, replies: std::ops::Range<i64>) -> MemoryLocalSource {
        let source = MemoryLocalSource::new();
        let thread_id = source.insert_original_post(&op(thread_no)).await.unwrap();
        let posts: Vec<_> = replies.map(|no| reply(thread_no, no)).collect();
        source.insert_posts(thread_id, &posts).await.unwrap();
        source
    }

    #[tokio::test]
    async fn test_insert_assigns_ids_and_upserts() {
        let source = MemoryLocalSource::new();
        let first = source.insert_original_post(&op(1)).await.unwrap();
        let again = source.insert_original_post(&op(1).with_comment("edited")).await.unwrap();
        assert_eq!(first, again);

        let posts = assert_ok!(
            source
                .get_thread_posts(&thread(1), &HashSet::new(), &HashSet::new(), 10)
                .await
        );
        assert_eq!(posts.len(), 1);
        assert_eq!(posts[0].comment, "edited");
        assert_ne!(posts[0].chan_post_id, 0);
    }

    #[tokio::test]
    async fn test_get_thread_posts_keeps_op_and_latest_replies() {
        let source = source_with_thread(1, 2..10).await;

        let posts = source
            .get_thread_posts(&thread(1), &HashSet::new(), &HashSet::new(), 3)
            .await
            .unwrap();
        let nos: Vec<_> = posts.iter().map(|p| p.post_no()).collect();
        assert_eq!(nos, vec![1, 8, 9]);

        let excluded = HashSet::from([1, 9]);
        let posts = source
            .get_thread_posts(&thread(1), &HashSet::new(), &excluded, 2)
            .await
            .unwrap();
        let nos: Vec<_> = posts.iter().map(|p| p.post_no()).collect();
        assert_eq!(nos, vec![7, 8]);
    }

    #[tokio::test]
    async fn test_archive_filter() {
        let source = MemoryLocalSource::new();
        let mut archived = op(1);
        archived.archive_id = 3;
        source.insert_original_post(&archived).await.unwrap();

        let live_only = HashSet::from([crate::models::NO_ARCHIVE_ID]);
        let posts = source
            .get_thread_posts(&thread(1), &live_only, &HashSet::new(), 10)
            .await
            .unwrap();
        assert!(posts.is_empty());

        let posts = source
            .get_thread_posts(&thread(1), &HashSet::from([3]), &HashSet::new(), 10)
            .await
            .unwrap();
        assert_eq!(posts.len(), 1);
    }

    #[tokio::test]
    async fn test_rollback_restores_state() {
        let source = source_with_thread(1, 2..4).await;

        source.begin_transaction().await.unwrap();
        source.delete_thread(&thread(1)).await.unwrap();
        assert_eq!(source.count_total_amount_of_threads().await.unwrap(), 0);
        source.rollback_transaction().await.unwrap();

        assert_eq!(source.count_total_amount_of_threads().await.unwrap(), 1);
        assert_eq!(source.count_total_amount_of_posts().await.unwrap(), 3);
        assert!(source.commit_transaction().await.is_err());
    }

    #[tokio::test]
    async fn test_delete_old_posts_keeps_original_posts() {
        let source = source_with_thread(1, 2..6).await;

        assert_eq!(source.delete_old_posts(2).await.unwrap(), 2);
        let nos = source
            .get_thread_post_nos(&thread(1), &HashSet::new(), 100)
            .await
            .unwrap();
        assert_eq!(nos, HashSet::from([1, 4, 5]));

        assert_eq!(source.delete_old_posts(100).await.unwrap(), 2);
        assert_eq!(source.count_total_amount_of_posts().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_delete_old_threads_removes_least_recently_updated() {
        let source = MemoryLocalSource::new();
        source.insert_original_post(&op(1)).await.unwrap();
        source.insert_original_post(&op(2)).await.unwrap();
        source.insert_original_post(&op(1).with_comment("bumped")).await.unwrap();

        assert_eq!(source.delete_old_threads(1).await.unwrap(), 1);
        let remaining = source
            .get_catalog_original_posts(
                &CatalogDescriptor::new(board()),
                &HashSet::new(),
                &OriginalPostsQuery::Latest(10),
            )
            .await
            .unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].post_no(), 1);
    }

    #[tokio::test]
    async fn test_delete_post_of_op_deletes_thread() {
        let source = source_with_thread(1, 2..4).await;

        assert!(source.delete_post(&PostDescriptor::new(&thread(1), 2)).await.unwrap());
        assert_eq!(source.count_total_amount_of_posts().await.unwrap(), 2);

        assert!(source.delete_post(&PostDescriptor::new(&thread(1), 1)).await.unwrap());
        assert_eq!(
            source
                .get_thread_id_by_post_descriptor(&PostDescriptor::new(&thread(1), 3))
                .await
                .unwrap(),
            None
        );
    }

    #[tokio::test]
    async fn test_insert_posts_into_unknown_thread_fails() {
        let source = MemoryLocalSource::new();
        let result = source.insert_posts(42, &[reply(1, 2)]).await;
        assert!(matches!(result, Err(ChanError::NotFound(_))));
    }
}
