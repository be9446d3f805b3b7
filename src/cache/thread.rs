//! Merge and consistency engine for a single thread.
//!
//! A `ChanThread` keeps one thread's posts as a sorted, de-duplicated list
//! with a descriptor index next to it. Fetched snapshots are merged in
//! batches; after every batch that changed something the list is re-sorted
//! and the reply graph (`replies_from`) is rebuilt from scratch.
//!
//! All state sits behind one read/write lock. Callbacks passed to read
//! methods (`iterate_posts_ordered`, `map_posts_with_images_around`) run
//! while the read lock is held and must not call mutating methods on the
//! same thread.

use chrono::{DateTime, Utc};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, error};

use crate::models::{merge_posts, ChanPost, LoaderType, PostDescriptor, ThreadDescriptor};

/// How strictly post numbers must increase along the thread
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PostOrdering {
    /// Post numbers strictly increase after sorting
    Strict,
    /// The site is known to serve out-of-order post numbers
    Relaxed,
}

struct ThreadState {
    posts: Vec<ChanPost>,
    /// Position of every post in `posts`
    index: HashMap<PostDescriptor, usize>,
    /// Raw server payload hashes, used by loaders to skip unchanged posts
    hashes: HashMap<PostDescriptor, u64>,
    last_access: DateTime<Utc>,
}

impl ThreadState {
    fn push(&mut self, post: ChanPost) {
        self.index
            .insert(post.post_descriptor.clone(), self.posts.len());
        self.posts.push(post);
    }

    fn sort_and_reindex(&mut self) {
        self.posts.sort_by(ChanPost::thread_order);
        self.reindex();
    }

    fn reindex(&mut self) {
        self.index.clear();
        for (position, post) in self.posts.iter().enumerate() {
            self.index.insert(post.post_descriptor.clone(), position);
        }
    }

    fn recompute_replies_from(&mut self) {
        let mut replies_from: HashMap<i64, BTreeSet<i64>> = HashMap::new();
        for post in &self.posts {
            for target in &post.replies_to {
                replies_from
                    .entry(*target)
                    .or_default()
                    .insert(post.post_no());
            }
        }

        for post in &mut self.posts {
            post.replies_from = replies_from
                .get(&post.post_no())
                .cloned()
                .unwrap_or_default();
        }
    }
}

pub struct ChanThread {
    descriptor: ThreadDescriptor,
    ordering: PostOrdering,
    state: RwLock<ThreadState>,
}

impl ChanThread {
    pub fn new(descriptor: ThreadDescriptor, ordering: PostOrdering) -> Self {
        Self {
            descriptor,
            ordering,
            state: RwLock::new(ThreadState {
                posts: Vec::new(),
                index: HashMap::new(),
                hashes: HashMap::new(),
                last_access: Utc::now(),
            }),
        }
    }

    pub fn descriptor(&self) -> &ThreadDescriptor {
        &self.descriptor
    }

    pub fn ordering(&self) -> PostOrdering {
        self.ordering
    }

    fn read(&self) -> RwLockReadGuard<'_, ThreadState> {
        self.state.read().unwrap_or_else(|poisoned| {
            error!("Thread {} lock was poisoned on read, recovering", self.descriptor);
            poisoned.into_inner()
        })
    }

    fn write(&self) -> RwLockWriteGuard<'_, ThreadState> {
        self.state.write().unwrap_or_else(|poisoned| {
            error!("Thread {} lock was poisoned on write, recovering", self.descriptor);
            poisoned.into_inner()
        })
    }

    /// Merge a batch of fetched posts into the thread.
    ///
    /// Unseen posts are appended, known posts that differ by value are merged
    /// with [`merge_posts`]. Returns whether anything was added or updated.
    ///
    /// # Panics
    /// If `posts` is empty, if the batch establishes the thread without an
    /// original post first, or if a post belongs to another thread or to a
    /// catalog descriptor.
    pub fn add_or_update_posts(&self, posts: Vec<ChanPost>) -> bool {
        assert!(
            !posts.is_empty(),
            "add_or_update_posts called with an empty batch for {}",
            self.descriptor
        );
        for post in &posts {
            self.check_post_belongs_to_thread(post);
        }

        let mut state = self.write();
        if state.posts.is_empty() {
            assert!(
                posts[0].is_op(),
                "first post of a batch establishing {} must be the original post, got {}",
                self.descriptor,
                posts[0].post_descriptor
            );
        }

        let mut added = 0usize;
        let mut updated = 0usize;

        for post in posts {
            match state.index.get(&post.post_descriptor).copied() {
                None => {
                    state.push(post);
                    added += 1;
                }
                Some(position) => {
                    let old = &state.posts[position];
                    if *old != post {
                        let merged = merge_posts(old, &post);
                        state.posts[position] = merged;
                        updated += 1;
                    }
                }
            }
        }

        let changed = added > 0 || updated > 0;
        if changed {
            state.sort_and_reindex();
            state.recompute_replies_from();
            debug!(
                "Thread {}: added {}, updated {}, total {}",
                self.descriptor,
                added,
                updated,
                state.posts.len()
            );
        }

        state.last_access = Utc::now();
        self.check_consistency(&state);
        changed
    }

    /// Insert or merge only the original post, e.g. from catalog metadata.
    ///
    /// # Panics
    /// If `post` is not an original post of this thread.
    pub fn set_or_update_original_post(&self, post: ChanPost) -> bool {
        assert!(
            post.is_op(),
            "{} is not an original post",
            post.post_descriptor
        );
        self.check_post_belongs_to_thread(&post);

        let mut state = self.write();
        let changed = match state.posts.first() {
            None => {
                state.push(post);
                true
            }
            Some(current) => {
                assert!(
                    current.post_descriptor == post.post_descriptor,
                    "original post of {} is {}, got {}",
                    self.descriptor,
                    current.post_descriptor,
                    post.post_descriptor
                );

                if *current != post {
                    let merged = merge_posts(current, &post);
                    state.posts[0] = merged;
                    true
                } else {
                    false
                }
            }
        };

        if changed {
            state.recompute_replies_from();
        }

        state.last_access = Utc::now();
        self.check_consistency(&state);
        changed
    }

    /// Remove a post. Removing the original post empties the thread, since a
    /// thread cannot exist without it.
    pub fn delete_post(&self, descriptor: &PostDescriptor) -> bool {
        let mut state = self.write();
        let Some(position) = state.index.get(descriptor).copied() else {
            return false;
        };

        if position == 0 && state.posts[0].is_op() {
            state.posts.clear();
            state.index.clear();
            state.hashes.clear();
        } else {
            state.posts.remove(position);
            state.hashes.remove(descriptor);
            state.reindex();
            state.recompute_replies_from();
        }

        self.check_consistency(&state);
        true
    }

    /// Mark a post as (un)deleted without removing it
    pub fn set_post_deleted(&self, descriptor: &PostDescriptor, deleted: bool) -> bool {
        let mut state = self.write();
        let Some(position) = state.index.get(descriptor).copied() else {
            return false;
        };

        state.posts[position].deleted = deleted;
        true
    }

    pub fn set_post_content_loaded(
        &self,
        descriptor: &PostDescriptor,
        loader: LoaderType,
        loaded: bool,
    ) -> bool {
        let mut state = self.write();
        let Some(position) = state.index.get(descriptor).copied() else {
            return false;
        };

        state.posts[position]
            .on_demand_content_loaded
            .insert(loader, loaded);
        true
    }

    /// Update the thread flags carried by the original post.
    /// `None` leaves a flag untouched.
    pub fn update_thread_state(
        &self,
        closed: Option<bool>,
        archived: Option<bool>,
        deleted: Option<bool>,
    ) -> bool {
        let mut state = self.write();
        let Some(op) = state.posts.first_mut() else {
            return false;
        };
        if let Some(deleted) = deleted {
            op.deleted = deleted;
        }
        let Some(data) = op.op_data_mut() else {
            return false;
        };
        if let Some(closed) = closed {
            data.closed = closed;
        }
        if let Some(archived) = archived {
            data.archived = archived;
        }
        true
    }

    pub fn put_post_hash(&self, descriptor: PostDescriptor, hash: u64) {
        self.write().hashes.insert(descriptor, hash);
    }

    pub fn get_post_hash(&self, descriptor: &PostDescriptor) -> Option<u64> {
        self.read().hashes.get(descriptor).copied()
    }

    pub fn update_last_access_time(&self) {
        self.write().last_access = Utc::now();
    }

    pub fn last_access_time(&self) -> DateTime<Utc> {
        self.read().last_access
    }

    pub fn get_post(&self, descriptor: &PostDescriptor) -> Option<ChanPost> {
        let state = self.read();
        state
            .index
            .get(descriptor)
            .map(|&position| state.posts[position].clone())
    }

    pub fn contains_post(&self, descriptor: &PostDescriptor) -> bool {
        self.read().index.contains_key(descriptor)
    }

    pub fn get_original_post(&self) -> Option<ChanPost> {
        self.read().posts.first().filter(|post| post.is_op()).cloned()
    }

    pub fn last_post(&self) -> Option<ChanPost> {
        self.read().posts.last().cloned()
    }

    pub fn posts_count(&self) -> usize {
        self.read().posts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().posts.is_empty()
    }

    pub fn get_post_descriptors(&self) -> Vec<PostDescriptor> {
        self.read()
            .posts
            .iter()
            .map(|post| post.post_descriptor.clone())
            .collect()
    }

    pub fn get_post_nos(&self) -> HashSet<i64> {
        self.read().posts.iter().map(|post| post.post_no()).collect()
    }

    /// All posts in thread order
    pub fn get_posts(&self) -> Vec<ChanPost> {
        self.read().posts.clone()
    }

    /// The last `count` posts in thread order
    pub fn get_last_posts(&self, count: usize) -> Vec<ChanPost> {
        let state = self.read();
        let start = state.posts.len().saturating_sub(count);
        state.posts[start..].to_vec()
    }

    pub fn iterate_posts_ordered<F>(&self, mut iterator: F)
    where
        F: FnMut(&ChanPost),
    {
        let state = self.read();
        for post in &state.posts {
            iterator(post);
        }
    }

    /// Replies count (without the original post) and total attached files
    pub fn replies_and_images_count(&self) -> (usize, usize) {
        let state = self.read();
        let replies = state
            .posts
            .iter()
            .filter(|post| !post.is_op())
            .count();
        let images = state.posts.iter().map(|post| post.images.len()).sum();
        (replies, images)
    }

    /// False once the original post is closed, archived or deleted.
    /// A thread without a loaded original post may still be polled.
    pub fn can_update_thread(&self) -> bool {
        let state = self.read();
        let Some(op) = state.posts.first() else {
            return true;
        };
        match op.op_data() {
            Some(data) => !data.closed && !data.archived && !op.deleted,
            None => true,
        }
    }

    /// The post and every post that replies to it, directly or transitively,
    /// in thread order.
    pub fn find_post_with_replies_recursive(&self, descriptor: &PostDescriptor) -> Vec<ChanPost> {
        let state = self.read();
        let Some(&start) = state.index.get(descriptor) else {
            return Vec::new();
        };

        let mut visited = HashSet::new();
        let mut stack = vec![start];

        while let Some(position) = stack.pop() {
            if !visited.insert(position) {
                continue;
            }

            for reply_no in &state.posts[position].replies_from {
                let reply = PostDescriptor::new(&self.descriptor, *reply_no);
                if let Some(&reply_position) = state.index.get(&reply) {
                    stack.push(reply_position);
                }
            }
        }

        let mut positions: Vec<_> = visited.into_iter().collect();
        positions.sort_unstable();
        positions
            .into_iter()
            .map(|position| state.posts[position].clone())
            .collect()
    }

    /// Scan outwards from `descriptor`, mapping up to `left_count` image posts
    /// before it and `right_count` after it (plus the anchor itself when it
    /// has images). Posts for which `mapper` returns `None` are skipped and
    /// not counted. Results are in thread order.
    pub fn map_posts_with_images_around<T, F>(
        &self,
        descriptor: &PostDescriptor,
        left_count: usize,
        right_count: usize,
        mut mapper: F,
    ) -> Vec<T>
    where
        F: FnMut(&ChanPost) -> Option<T>,
    {
        if left_count == 0 && right_count == 0 {
            return Vec::new();
        }

        let state = self.read();
        let Some(&anchor) = state.index.get(descriptor) else {
            return Vec::new();
        };

        let mut result = Vec::with_capacity(left_count + right_count + 1);

        let mut taken = 0;
        for post in state.posts[..anchor].iter().rev() {
            if taken >= left_count {
                break;
            }
            if !post.has_images() {
                continue;
            }
            if let Some(mapped) = mapper(post) {
                result.push(mapped);
                taken += 1;
            }
        }
        result.reverse();

        let anchor_post = &state.posts[anchor];
        if anchor_post.has_images() {
            if let Some(mapped) = mapper(anchor_post) {
                result.push(mapped);
            }
        }

        let mut taken = 0;
        for post in &state.posts[anchor + 1..] {
            if taken >= right_count {
                break;
            }
            if !post.has_images() {
                continue;
            }
            if let Some(mapped) = mapper(post) {
                result.push(mapped);
                taken += 1;
            }
        }

        result
    }

    /// Descriptor of the post `offset` positions away, clamped to the thread.
    ///
    /// # Panics
    /// If `descriptor` belongs to another thread.
    pub fn get_post_descriptor_relative_to(
        &self,
        descriptor: &PostDescriptor,
        offset: isize,
    ) -> Option<PostDescriptor> {
        assert!(
            descriptor.thread_descriptor() == self.descriptor,
            "{} does not belong to {}",
            descriptor,
            self.descriptor
        );

        let state = self.read();
        let position = *state.index.get(descriptor)? as isize;
        let last = state.posts.len() as isize - 1;
        let target = (position + offset).clamp(0, last) as usize;
        Some(state.posts[target].post_descriptor.clone())
    }

    fn check_post_belongs_to_thread(&self, post: &ChanPost) {
        let descriptor = &post.post_descriptor;
        assert!(
            descriptor.descriptor().is_thread(),
            "{} is bound to a catalog descriptor",
            descriptor
        );
        assert!(
            descriptor.thread_descriptor() == self.descriptor,
            "{} does not belong to {}",
            descriptor,
            self.descriptor
        );
    }

    fn check_consistency(&self, state: &ThreadState) {
        if !cfg!(debug_assertions) {
            return;
        }

        assert_eq!(
            state.posts.len(),
            state.index.len(),
            "{}: posts and index sizes differ",
            self.descriptor
        );

        for (position, post) in state.posts.iter().enumerate() {
            assert_eq!(
                state.index.get(&post.post_descriptor),
                Some(&position),
                "{}: index entry for {} is wrong",
                self.descriptor,
                post.post_descriptor
            );
            self.check_post_belongs_to_thread(post);
        }

        if let Some(first) = state.posts.first() {
            assert!(
                first.is_op(),
                "{}: first post {} is not the original post",
                self.descriptor,
                first.post_descriptor
            );
        }
        assert!(
            state.posts.iter().skip(1).all(|post| !post.is_op()),
            "{}: more than one original post",
            self.descriptor
        );

        if self.ordering == PostOrdering::Strict {
            for pair in state.posts.windows(2) {
                let prev = &pair[0].post_descriptor;
                let next = &pair[1].post_descriptor;
                assert!(
                    (prev.post_no(), prev.post_sub_no()) < (next.post_no(), next.post_sub_no()),
                    "{}: post numbers are not increasing ({} then {})",
                    self.descriptor,
                    prev,
                    next
                );
            }
        }
    }
}
