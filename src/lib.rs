pub mod cache;
pub mod cleanup;
pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod repository;

use anyhow::{ensure, Result};
use std::{sync::Arc, time::Duration};

pub use crate::cache::{ChanThread, PostOrdering, PostsCache};
pub use crate::config::Config;
pub use crate::db::{LocalSource, MemoryLocalSource, OriginalPostsQuery};
pub use crate::error::ChanError;
pub use crate::repository::ChanPostRepository;

use crate::cleanup::start_cleanup_task;

/// Cache and repository shared by everything that reads or stores posts
#[derive(Clone)]
pub struct ChanState {
    pub config: Arc<Config>,
    pub posts_cache: Arc<PostsCache>,
    pub repository: ChanPostRepository,
}

/// Install a `tracing` subscriber filtered by `RUST_LOG`, defaulting to info
/// for this crate. Does nothing if a subscriber is already set.
pub fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("chan_cache=info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

/// Build the posts cache and repository over `local_source` and start the
/// background prune tasks. Must be called from within a tokio runtime.
pub fn start(config: Config, local_source: Arc<dyn LocalSource>) -> Result<ChanState> {
    ensure!(
        config.cache.max_posts_count_in_posts_cache > 0,
        "max_posts_count_in_posts_cache must be positive"
    );
    ensure!(
        config.database.max_amount_of_posts_in_database > 0
            && config.database.max_amount_of_threads_in_database > 0,
        "local source limits must be positive"
    );

    let config = Arc::new(config);
    let posts_cache = Arc::new(PostsCache::new(
        config.cache.max_posts_count_in_posts_cache,
        config.sites.clone(),
    ));
    tracing::info!(
        "Posts cache: max {} posts, relaxed post order sites: {:?}",
        config.cache.max_posts_count_in_posts_cache,
        config.sites.relaxed_post_order_sites
    );

    let repository = ChanPostRepository::new(
        config.clone(),
        posts_cache.clone(),
        local_source,
    );
    tracing::info!(
        "Local source limits: {} posts, {} threads",
        config.database.max_amount_of_posts_in_database,
        config.database.max_amount_of_threads_in_database
    );

    match config.cleanup.interval_secs {
        Some(secs) => {
            start_cleanup_task(repository.clone(), Duration::from_secs(secs));
            tracing::info!("Cleanup task started (interval: {}s)", secs);
        }
        None => tracing::info!("Periodic cleanup disabled, pruning on startup only"),
    }

    Ok(ChanState {
        config,
        posts_cache,
        repository,
    })
}
