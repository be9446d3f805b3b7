//! Local source pruning
//!
//! Handles:
//! - Deleting the oldest replies when the store holds too many posts
//! - Deleting the least recently updated threads when it holds too many threads
//!
//! Runs once when the repository starts and, if configured, on an interval.

use std::time::Duration;
use tokio::time::interval;
use tracing::{debug, error, info};

use crate::config::DatabaseConfig;
use crate::db::LocalSource;
use crate::error::Result;
use crate::repository::ChanPostRepository;

/// Start the periodic prune task
pub fn start_cleanup_task(repository: ChanPostRepository, period: Duration) {
    tokio::spawn(async move {
        let mut ticker = interval(period);
        // The repository already pruned on startup
        ticker.tick().await;

        loop {
            ticker.tick().await;

            if let Err(e) = repository.cleanup(false).await {
                error!("Cleanup task error: {}", e);
            }
        }
    });
}

/// How many rows a prune removes: half of whichever is larger, the current
/// count or the limit
pub fn amount_to_delete(total: usize, limit: usize) -> usize {
    total.max(limit) / 2
}

/// Prune posts first, then threads. Without `force` each step only runs when
/// its count is over the configured limit.
pub async fn prune_database(
    source: &dyn LocalSource,
    config: &DatabaseConfig,
    force: bool,
) -> Result<CleanupReport> {
    let posts_deleted =
        delete_old_posts_if_needed(source, config.max_amount_of_posts_in_database, force).await?;
    let threads_deleted =
        delete_old_threads_if_needed(source, config.max_amount_of_threads_in_database, force)
            .await?;

    Ok(CleanupReport {
        posts_deleted,
        threads_deleted,
    })
}

async fn delete_old_posts_if_needed(
    source: &dyn LocalSource,
    limit: usize,
    force: bool,
) -> Result<usize> {
    let total = source.count_total_amount_of_posts().await?;
    if !force && total <= limit {
        debug!("Local source holds {} posts (limit {}), nothing to prune", total, limit);
        return Ok(0);
    }

    let to_delete = amount_to_delete(total, limit);
    if to_delete == 0 {
        return Ok(0);
    }

    let deleted = source.delete_old_posts(to_delete).await?;
    info!(
        "Pruned {} old posts (had {}, limit {}, force {})",
        deleted, total, limit, force
    );
    Ok(deleted)
}

async fn delete_old_threads_if_needed(
    source: &dyn LocalSource,
    limit: usize,
    force: bool,
) -> Result<usize> {
    let total = source.count_total_amount_of_threads().await?;
    if !force && total <= limit {
        debug!("Local source holds {} threads (limit {}), nothing to prune", total, limit);
        return Ok(0);
    }

    let to_delete = amount_to_delete(total, limit);
    if to_delete == 0 {
        return Ok(0);
    }

    let deleted = source.delete_old_threads(to_delete).await?;
    info!(
        "Pruned {} old threads (had {}, limit {}, force {})",
        deleted, total, limit, force
    );
    Ok(deleted)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct CleanupReport {
    pub posts_deleted: usize,
    pub threads_deleted: usize,
}
