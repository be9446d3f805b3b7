//! Bounded cross-thread post cache.
//!
//! Posts are stored per thread in a [`ChanThread`]. When the total number of
//! cached posts goes over `max_posts`, whole threads are evicted:
//! - only threads holding at most one post (catalog OPs) are candidates,
//!   least recently accessed first;
//! - threads with more than one post are immune and never evicted, so the
//!   cache may stay over budget;
//! - the thread touched by the current call is never evicted by it.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, error, warn};

use super::{ChanThread, PostOrdering};
use crate::config::SiteConfig;
use crate::models::{ChanPost, PostDescriptor, ThreadDescriptor};

struct CachedThread {
    thread: Arc<ChanThread>,
    /// Value of the cache access counter when the thread was last touched
    last_access: u64,
}

#[derive(Default)]
struct CacheState {
    threads: HashMap<ThreadDescriptor, CachedThread>,
    access_counter: u64,
}

impl CacheState {
    fn touch(&mut self, descriptor: &ThreadDescriptor) -> Option<Arc<ChanThread>> {
        self.access_counter += 1;
        let counter = self.access_counter;
        self.threads.get_mut(descriptor).map(|cached| {
            cached.last_access = counter;
            Arc::clone(&cached.thread)
        })
    }

    fn total_posts(&self) -> usize {
        self.threads
            .values()
            .map(|cached| cached.thread.posts_count())
            .sum()
    }
}

pub struct PostsCache {
    max_posts: usize,
    sites: SiteConfig,
    state: Mutex<CacheState>,
}

impl PostsCache {
    pub fn new(max_posts: usize, sites: SiteConfig) -> Self {
        Self {
            max_posts,
            sites,
            state: Mutex::new(CacheState::default()),
        }
    }

    pub fn max_posts(&self) -> usize {
        self.max_posts
    }

    fn lock(&self) -> MutexGuard<'_, CacheState> {
        self.state.lock().unwrap_or_else(|poisoned| {
            error!("Posts cache lock was poisoned, recovering");
            poisoned.into_inner()
        })
    }

    fn get_or_create_thread(
        &self,
        state: &mut CacheState,
        descriptor: &ThreadDescriptor,
    ) -> Arc<ChanThread> {
        if let Some(thread) = state.touch(descriptor) {
            return thread;
        }

        let ordering = if self.sites.allows_unordered_post_numbers(descriptor.site_name()) {
            PostOrdering::Relaxed
        } else {
            PostOrdering::Strict
        };
        let thread = Arc::new(ChanThread::new(descriptor.clone(), ordering));
        state.threads.insert(
            descriptor.clone(),
            CachedThread {
                thread: Arc::clone(&thread),
                last_access: state.access_counter,
            },
        );
        thread
    }

    /// Upsert a single post. Catalog OPs only update the original post slot.
    pub fn put(&self, post: ChanPost) -> bool {
        let thread = post.post_descriptor.thread_descriptor();
        if post.is_op() && !post.post_descriptor.descriptor().is_thread() {
            return self.put_original_post(post);
        }
        self.put_many(&thread, vec![post])
    }

    /// Merge a batch of posts of one thread. A batch for an uncached thread
    /// that does not start with its original post is dropped.
    pub fn put_many(&self, thread: &ThreadDescriptor, posts: Vec<ChanPost>) -> bool {
        if posts.is_empty() {
            return false;
        }

        let posts: Vec<ChanPost> = posts.into_iter().map(bind_to_thread).collect();

        if let Some(post) = posts
            .iter()
            .find(|post| post.post_descriptor.thread_descriptor() != *thread)
        {
            warn!("Dropping batch for thread {}, {} belongs to another thread", thread, post.post_descriptor);
            return false;
        }

        let mut state = self.lock();
        if !state.threads.contains_key(thread) && !posts[0].is_op() {
            warn!(
                "Dropping {} posts for uncached thread {}, batch does not start with its original post",
                posts.len(),
                thread
            );
            return false;
        }

        let chan_thread = self.get_or_create_thread(&mut state, thread);
        let changed = chan_thread.add_or_update_posts(posts);
        self.evict_if_needed(&mut state, thread);
        changed
    }

    /// Insert or merge only the original post of a thread
    pub fn put_original_post(&self, post: ChanPost) -> bool {
        let post = bind_to_thread(post);
        let thread = post.post_descriptor.thread_descriptor();

        let mut state = self.lock();
        let chan_thread = self.get_or_create_thread(&mut state, &thread);
        let changed = chan_thread.set_or_update_original_post(post);
        self.evict_if_needed(&mut state, &thread);
        changed
    }

    pub fn get(&self, descriptor: &PostDescriptor) -> Option<ChanPost> {
        self.get_thread(&descriptor.thread_descriptor())?
            .get_post(descriptor)
    }

    pub fn contains_post(&self, descriptor: &PostDescriptor) -> bool {
        self.get_thread(&descriptor.thread_descriptor())
            .map(|thread| thread.contains_post(descriptor))
            .unwrap_or(false)
    }

    /// The last `count` posts of a thread, in thread order
    pub fn get_latest(&self, thread: &ThreadDescriptor, count: usize) -> Vec<ChanPost> {
        self.get_thread(thread)
            .map(|thread| thread.get_last_posts(count))
            .unwrap_or_default()
    }

    pub fn get_original_post(&self, thread: &ThreadDescriptor) -> Option<ChanPost> {
        self.get_thread(thread)?.get_original_post()
    }

    pub fn get_thread_posts(&self, thread: &ThreadDescriptor) -> Vec<ChanPost> {
        self.get_thread(thread)
            .map(|thread| thread.get_posts())
            .unwrap_or_default()
    }

    pub fn get_post_nos(&self, thread: &ThreadDescriptor) -> HashSet<i64> {
        self.get_thread(thread)
            .map(|thread| thread.get_post_nos())
            .unwrap_or_default()
    }

    /// Shared handle to a cached thread; marks it as recently used
    pub fn get_thread(&self, thread: &ThreadDescriptor) -> Option<Arc<ChanThread>> {
        self.lock().touch(thread)
    }

    pub fn contains_thread(&self, thread: &ThreadDescriptor) -> bool {
        self.lock().threads.contains_key(thread)
    }

    /// Remove one post. Removing the original post drops the whole thread.
    pub fn delete(&self, descriptor: &PostDescriptor) -> bool {
        let thread = descriptor.thread_descriptor();
        let mut state = self.lock();
        let Some(cached) = state.threads.get(&thread) else {
            return false;
        };

        let deleted = cached.thread.delete_post(descriptor);
        if cached.thread.is_empty() {
            state.threads.remove(&thread);
        }
        deleted
    }

    pub fn delete_thread(&self, thread: &ThreadDescriptor) -> bool {
        self.lock().threads.remove(thread).is_some()
    }

    pub fn post_count(&self) -> usize {
        self.lock().total_posts()
    }

    pub fn thread_count(&self) -> usize {
        self.lock().threads.len()
    }

    fn evict_if_needed(&self, state: &mut CacheState, current: &ThreadDescriptor) {
        let mut total = state.total_posts();
        if total <= self.max_posts {
            return;
        }

        // Immune threads (more than one post) are never candidates
        let mut candidates: Vec<(u64, ThreadDescriptor, usize)> = state
            .threads
            .iter()
            .filter(|(descriptor, _)| *descriptor != current)
            .map(|(descriptor, cached)| {
                (cached.last_access, descriptor.clone(), cached.thread.posts_count())
            })
            .filter(|(_, _, count)| *count <= 1)
            .collect();
        candidates.sort_by_key(|(last_access, _, _)| *last_access);

        let mut evicted_threads = 0usize;
        let mut evicted_posts = 0usize;
        for (_, descriptor, count) in candidates {
            if total <= self.max_posts {
                break;
            }
            state.threads.remove(&descriptor);
            total -= count;
            evicted_threads += 1;
            evicted_posts += count;
        }

        debug!(
            "Evicted {} threads ({} posts) from posts cache, {} posts left",
            evicted_threads, evicted_posts, total
        );

        if total > self.max_posts {
            warn!(
                "Posts cache still holds {} posts (max {}) after eviction, only immune threads left",
                total, self.max_posts
            );
        }
    }
}

fn bind_to_thread(mut post: ChanPost) -> ChanPost {
    if !post.post_descriptor.descriptor().is_thread() {
        post.post_descriptor = post.post_descriptor.bound_to_thread();
    }
    post
}
