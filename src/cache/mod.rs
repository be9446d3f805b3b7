mod posts;
mod thread;

pub use posts::PostsCache;
pub use thread::{ChanThread, PostOrdering};
