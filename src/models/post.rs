use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap, HashSet};

use super::{ArchiveId, PostDescriptor, NO_ARCHIVE_ID};

/// Loaders that fetch extra per-post content after the thread is parsed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LoaderType {
    /// Embeds and link titles extracted from the comment
    ExtraContent,
    /// Image prefetching
    Prefetch,
    /// File size/dimensions for files linked inline in the comment
    InlinedFileInfo,
}

/// An attached file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostImage {
    pub url: String,
    pub thumbnail_url: Option<String>,
    /// Original filename
    pub filename: Option<String>,
    pub extension: Option<String>,
    pub width: u32,
    pub height: u32,
    /// File size in bytes
    pub size: u64,
    pub file_hash: Option<String>,
    pub spoiler: bool,
}

impl PostImage {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            thumbnail_url: None,
            filename: None,
            extension: None,
            width: 0,
            height: 0,
            size: 0,
            file_hash: None,
            spoiler: false,
        }
    }
}

/// Flag/country/board icon shown next to the poster name
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostIcon {
    pub name: String,
    pub url: String,
}

/// Thread-level fields only the original post carries
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OriginalPostData {
    pub sticky: bool,
    pub closed: bool,
    pub archived: bool,
    /// Endless threads drop their oldest replies instead of hitting the bump limit
    pub endless: bool,
    /// Unix seconds of the last modification the server reported
    pub last_modified: i64,
    /// Replies count as reported by the catalog (-1 when unknown)
    pub catalog_replies_count: i32,
    /// Images count as reported by the catalog (-1 when unknown)
    pub catalog_images_count: i32,
    pub unique_ips: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PostKind {
    Reply,
    Original(OriginalPostData),
}

/// A single post in a thread
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChanPost {
    /// Durable store id (0 until persisted)
    pub chan_post_id: i64,
    pub post_descriptor: PostDescriptor,
    pub archive_id: ArchiveId,
    /// Post message body
    pub comment: String,
    /// Post numbers this post quotes
    pub replies_to: BTreeSet<i64>,
    pub subject: Option<String>,
    pub name: Option<String>,
    pub tripcode: Option<String>,
    pub poster_id: Option<String>,
    pub moderator_capcode: Option<String>,
    /// Unix seconds
    pub timestamp: i64,
    pub images: Vec<PostImage>,
    pub icons: Vec<PostIcon>,
    /// Whether the user made this post
    pub is_saved_reply: bool,
    /// Soft-delete marker
    pub deleted: bool,
    /// Per-loader "already loaded" flags
    pub on_demand_content_loaded: HashMap<LoaderType, bool>,
    /// Post numbers of posts in the same thread that quote this one.
    /// Recomputed by `ChanThread`, never taken from input.
    pub replies_from: BTreeSet<i64>,
    pub kind: PostKind,
}

impl ChanPost {
    pub fn new(post_descriptor: PostDescriptor, kind: PostKind) -> Self {
        Self {
            chan_post_id: 0,
            post_descriptor,
            archive_id: NO_ARCHIVE_ID,
            comment: String::new(),
            replies_to: BTreeSet::new(),
            subject: None,
            name: None,
            tripcode: None,
            poster_id: None,
            moderator_capcode: None,
            timestamp: 0,
            images: Vec::new(),
            icons: Vec::new(),
            is_saved_reply: false,
            deleted: false,
            on_demand_content_loaded: HashMap::new(),
            replies_from: BTreeSet::new(),
            kind,
        }
    }

    pub fn reply(post_descriptor: PostDescriptor) -> Self {
        Self::new(post_descriptor, PostKind::Reply)
    }

    pub fn original(post_descriptor: PostDescriptor, data: OriginalPostData) -> Self {
        Self::new(post_descriptor, PostKind::Original(data))
    }

    pub fn with_comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = comment.into();
        self
    }

    pub fn with_replies_to(mut self, post_nos: impl IntoIterator<Item = i64>) -> Self {
        self.replies_to = post_nos.into_iter().collect();
        self
    }

    pub fn with_images(mut self, images: Vec<PostImage>) -> Self {
        self.images = images;
        self
    }

    pub fn with_timestamp(mut self, timestamp: i64) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn is_op(&self) -> bool {
        matches!(self.kind, PostKind::Original(_))
    }

    pub fn op_data(&self) -> Option<&OriginalPostData> {
        match &self.kind {
            PostKind::Original(data) => Some(data),
            PostKind::Reply => None,
        }
    }

    pub fn op_data_mut(&mut self) -> Option<&mut OriginalPostData> {
        match &mut self.kind {
            PostKind::Original(data) => Some(data),
            PostKind::Reply => None,
        }
    }

    pub fn post_no(&self) -> i64 {
        self.post_descriptor.post_no()
    }

    pub fn has_images(&self) -> bool {
        !self.images.is_empty()
    }

    /// An empty set matches every archive
    pub fn matches_archive(&self, archive_ids: &HashSet<ArchiveId>) -> bool {
        archive_ids.is_empty() || archive_ids.contains(&self.archive_id)
    }

    pub fn is_content_loaded(&self, loader: LoaderType) -> bool {
        self.on_demand_content_loaded
            .get(&loader)
            .copied()
            .unwrap_or(false)
    }

    /// Thread order: original post first, then by post number and sub number
    pub fn thread_order(a: &ChanPost, b: &ChanPost) -> Ordering {
        b.is_op()
            .cmp(&a.is_op())
            .then(a.post_descriptor.post_no().cmp(&b.post_descriptor.post_no()))
            .then(a.post_descriptor.post_sub_no().cmp(&b.post_descriptor.post_sub_no()))
    }
}

/// Value equality over identity and content.
///
/// Store ids, derived back-references, the soft-delete marker and loader
/// flags are state owned by the cached instance and are ignored.
impl PartialEq for ChanPost {
    fn eq(&self, other: &Self) -> bool {
        self.post_descriptor == other.post_descriptor
            && self.archive_id == other.archive_id
            && self.comment == other.comment
            && self.replies_to == other.replies_to
            && self.subject == other.subject
            && self.name == other.name
            && self.tripcode == other.tripcode
            && self.poster_id == other.poster_id
            && self.moderator_capcode == other.moderator_capcode
            && self.timestamp == other.timestamp
            && self.images == other.images
            && self.icons == other.icons
            && self.is_saved_reply == other.is_saved_reply
            && self.kind == other.kind
    }
}

impl Eq for ChanPost {}

/// Merge a freshly fetched post into the cached one.
///
/// Content comes from `new`. Identity, back-references, loader flags and the
/// soft-delete marker stay with `old`. OP timestamps only move forward.
pub fn merge_posts(old: &ChanPost, new: &ChanPost) -> ChanPost {
    let mut merged = new.clone();

    if old.chan_post_id != 0 {
        merged.chan_post_id = old.chan_post_id;
    }
    merged.replies_from = old.replies_from.clone();
    // Only set_post_deleted/update_thread_state change the marker
    merged.deleted = old.deleted;

    // The comment may have changed, so extra content has to be reloaded
    merged.on_demand_content_loaded = old.on_demand_content_loaded.clone();
    merged
        .on_demand_content_loaded
        .remove(&LoaderType::ExtraContent);

    if let (PostKind::Original(old_data), PostKind::Original(merged_data)) =
        (&old.kind, &mut merged.kind)
    {
        merged_data.last_modified = merged_data.last_modified.max(old_data.last_modified);
        merged.timestamp = merged.timestamp.max(old.timestamp);
    }

    merged
}
