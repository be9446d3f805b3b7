use serde::Deserialize;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub sites: SiteConfig,
    #[serde(default)]
    pub cleanup: CleanupConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    /// Posts kept in memory across all threads before eviction starts
    #[serde(default = "default_max_posts_in_cache")]
    pub max_posts_count_in_posts_cache: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Posts in the local source before old posts are pruned
    #[serde(default = "default_max_posts_in_database")]
    pub max_amount_of_posts_in_database: usize,
    /// Threads in the local source before old threads are pruned
    #[serde(default = "default_max_threads_in_database")]
    pub max_amount_of_threads_in_database: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SiteConfig {
    /// Sites known to serve threads whose post numbers are not increasing
    #[serde(default = "default_relaxed_post_order_sites")]
    pub relaxed_post_order_sites: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CleanupConfig {
    /// Periodic prune interval in seconds. Unset means prune on startup only.
    pub interval_secs: Option<u64>,
}

fn default_max_posts_in_cache() -> usize { 50_000 }
fn default_max_posts_in_database() -> usize { 125_000 }
fn default_max_threads_in_database() -> usize { 12_500 }
fn default_relaxed_post_order_sites() -> Vec<String> { vec!["lainchan.org".to_string()] }

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_posts_count_in_posts_cache: default_max_posts_in_cache(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            max_amount_of_posts_in_database: default_max_posts_in_database(),
            max_amount_of_threads_in_database: default_max_threads_in_database(),
        }
    }
}

impl Default for SiteConfig {
    fn default() -> Self {
        Self {
            relaxed_post_order_sites: default_relaxed_post_order_sites(),
        }
    }
}

impl SiteConfig {
    pub fn allows_unordered_post_numbers(&self, site_name: &str) -> bool {
        self.relaxed_post_order_sites
            .iter()
            .any(|site| site.eq_ignore_ascii_case(site_name))
    }
}

impl Config {
    /// Load from the environment, reading a `.env` file first if one exists
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();

        Config {
            cache: CacheConfig {
                max_posts_count_in_posts_cache: std::env::var("MAX_POSTS_IN_CACHE")
                    .ok()
                    .and_then(|p| p.parse().ok())
                    .unwrap_or_else(default_max_posts_in_cache),
            },
            database: DatabaseConfig {
                max_amount_of_posts_in_database: std::env::var("MAX_POSTS_IN_DATABASE")
                    .ok()
                    .and_then(|p| p.parse().ok())
                    .unwrap_or_else(default_max_posts_in_database),
                max_amount_of_threads_in_database: std::env::var("MAX_THREADS_IN_DATABASE")
                    .ok()
                    .and_then(|p| p.parse().ok())
                    .unwrap_or_else(default_max_threads_in_database),
            },
            sites: SiteConfig {
                relaxed_post_order_sites: std::env::var("RELAXED_POST_ORDER_SITES")
                    .map(|sites| parse_site_list(&sites))
                    .unwrap_or_else(|_| default_relaxed_post_order_sites()),
            },
            cleanup: CleanupConfig {
                interval_secs: std::env::var("CLEANUP_INTERVAL_SECS")
                    .ok()
                    .and_then(|p| p.parse().ok())
                    .filter(|secs| *secs > 0),
            },
        }
    }
}

fn parse_site_list(sites: &str) -> Vec<String> {
    sites
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}
