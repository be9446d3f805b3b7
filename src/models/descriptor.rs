use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};

/// Identifier of the archive a post was fetched from
pub type ArchiveId = i64;

/// Posts fetched from the live site rather than a third-party archive
pub const NO_ARCHIVE_ID: ArchiveId = 0;

/// A board on a site (e.g. "4chan.org" + "g")
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BoardDescriptor {
    pub site_name: String,
    pub board_code: String,
}

impl BoardDescriptor {
    pub fn new(site_name: impl Into<String>, board_code: impl Into<String>) -> Self {
        Self {
            site_name: site_name.into(),
            board_code: board_code.into(),
        }
    }
}

/// A single thread on a board
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ThreadDescriptor {
    pub board: BoardDescriptor,
    pub thread_no: i64,
}

impl ThreadDescriptor {
    pub fn new(board: BoardDescriptor, thread_no: i64) -> Self {
        Self { board, thread_no }
    }

    pub fn site_name(&self) -> &str {
        &self.board.site_name
    }
}

/// The per-board listing of thread OPs
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CatalogDescriptor {
    pub board: BoardDescriptor,
}

impl CatalogDescriptor {
    pub fn new(board: BoardDescriptor) -> Self {
        Self { board }
    }
}

/// Either a thread or a catalog
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChanDescriptor {
    Thread(ThreadDescriptor),
    Catalog(CatalogDescriptor),
}

impl ChanDescriptor {
    pub fn board(&self) -> &BoardDescriptor {
        match self {
            ChanDescriptor::Thread(thread) => &thread.board,
            ChanDescriptor::Catalog(catalog) => &catalog.board,
        }
    }

    pub fn is_thread(&self) -> bool {
        matches!(self, ChanDescriptor::Thread(_))
    }
}

/// Identity of a post.
///
/// `descriptor` records where the post was loaded from (a thread page or the
/// board catalog). It does not take part in equality, hashing or ordering: a
/// catalog OP and the same OP loaded from its thread are the same post.
///
/// Fields are only set through the constructors, so `thread_no` always
/// matches the thread inside `descriptor`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostDescriptor {
    descriptor: ChanDescriptor,
    thread_no: i64,
    post_no: i64,
    /// Non-zero for same-number edits and ghost posts
    post_sub_no: i64,
}

impl PostDescriptor {
    /// Post loaded from a thread page
    pub fn new(thread: &ThreadDescriptor, post_no: i64) -> Self {
        Self::with_sub_no(thread, post_no, 0)
    }

    pub fn with_sub_no(thread: &ThreadDescriptor, post_no: i64, post_sub_no: i64) -> Self {
        Self {
            descriptor: ChanDescriptor::Thread(thread.clone()),
            thread_no: thread.thread_no,
            post_no,
            post_sub_no,
        }
    }

    /// Original post loaded from the board catalog
    pub fn for_catalog(catalog: &CatalogDescriptor, thread_no: i64) -> Self {
        Self {
            descriptor: ChanDescriptor::Catalog(catalog.clone()),
            thread_no,
            post_no: thread_no,
            post_sub_no: 0,
        }
    }

    /// Where the post was loaded from
    pub fn descriptor(&self) -> &ChanDescriptor {
        &self.descriptor
    }

    pub fn thread_no(&self) -> i64 {
        self.thread_no
    }

    pub fn post_no(&self) -> i64 {
        self.post_no
    }

    pub fn post_sub_no(&self) -> i64 {
        self.post_sub_no
    }

    pub fn board(&self) -> &BoardDescriptor {
        self.descriptor.board()
    }

    /// The thread this post belongs to, regardless of where it was loaded from
    pub fn thread_descriptor(&self) -> ThreadDescriptor {
        ThreadDescriptor::new(self.board().clone(), self.thread_no)
    }

    /// Same post, loaded from its thread page
    pub fn bound_to_thread(&self) -> PostDescriptor {
        PostDescriptor::with_sub_no(&self.thread_descriptor(), self.post_no, self.post_sub_no)
    }

    pub fn is_op(&self) -> bool {
        self.post_no == self.thread_no && self.post_sub_no == 0
    }

    fn key(&self) -> (&str, &str, i64, i64, i64) {
        let board = self.board();
        (
            &board.site_name,
            &board.board_code,
            self.thread_no,
            self.post_no,
            self.post_sub_no,
        )
    }
}

impl PartialEq for PostDescriptor {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for PostDescriptor {}

impl Hash for PostDescriptor {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.key().hash(state);
    }
}

impl PartialOrd for PostDescriptor {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PostDescriptor {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key().cmp(&other.key())
    }
}

impl fmt::Display for PostDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let board = self.board();
        write!(
            f,
            "{}/{}/{}/{}",
            board.site_name, board.board_code, self.thread_no, self.post_no
        )?;
        if self.post_sub_no != 0 {
            write!(f, ".{}", self.post_sub_no)?;
        }
        Ok(())
    }
}

impl fmt::Display for ThreadDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}",
            self.board.site_name, self.board.board_code, self.thread_no
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn board() -> BoardDescriptor {
        BoardDescriptor::new("4chan.org", "g")
    }

    #[test]
    fn test_catalog_and_thread_descriptors_are_equal() {
        let thread = ThreadDescriptor::new(board(), 100);
        let catalog = CatalogDescriptor::new(board());

        let from_thread = PostDescriptor::new(&thread, 100);
        let from_catalog = PostDescriptor::for_catalog(&catalog, 100);

        assert_eq!(from_thread, from_catalog);

        let mut set = HashSet::new();
        set.insert(from_thread);
        assert!(set.contains(&from_catalog));
        assert!(!from_catalog.descriptor().is_thread());
        assert_eq!(from_catalog.thread_descriptor(), thread);
    }

    #[test]
    fn test_thread_no_follows_the_thread() {
        let thread = ThreadDescriptor::new(board(), 42);
        let post = PostDescriptor::with_sub_no(&thread, 50, 2);

        assert_eq!(post.thread_no(), 42);
        assert_eq!(post.thread_descriptor(), thread);
        assert!(!post.is_op());

        let bound = PostDescriptor::for_catalog(&CatalogDescriptor::new(board()), 42).bound_to_thread();
        assert!(bound.descriptor().is_thread());
        assert_eq!(bound.thread_no(), 42);
        assert!(bound.is_op());
    }

    #[test]
    fn test_ordering_uses_post_and_sub_numbers() {
        let thread = ThreadDescriptor::new(board(), 1);
        let a = PostDescriptor::new(&thread, 2);
        let b = PostDescriptor::with_sub_no(&thread, 2, 1);
        let c = PostDescriptor::new(&thread, 3);

        assert!(a < b);
        assert!(b < c);
        assert_eq!(b.to_string(), "4chan.org/g/1/2.1");
    }
}
