use crate::assembler::BookMetadata;
use crate::cache::Category;
use crate::collector::Source;
use crate::converter::Format;
use reqwest::Url;
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_BASE_URL: &str = "https://www.lesswrong.com";
pub const USER_AGENT: &str = concat!("lw-epub/", env!("CARGO_PKG_VERSION"));

/// Everything a run needs, built once from the command line.
#[derive(Debug, Clone)]
pub struct Config {
    pub source: Source,
    pub base_url: Url,
    pub fetch: FetchConfig,
    pub cache: CacheConfig,
    pub images: ImageConfig,
    pub output: OutputConfig,
    pub book: BookMetadata,
}

#[derive(Debug, Clone)]
pub struct FetchConfig {
    pub user_agent: String,
    /// Minimum pause between two live requests.
    pub request_delay: Duration,
    /// Extra attempts after the first one for transient failures.
    pub retries: u32,
    /// First backoff; doubled on every further retry.
    pub retry_backoff: Duration,
    pub timeout: Duration,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            user_agent: USER_AGENT.to_string(),
            request_delay: Duration::from_millis(500),
            retries: 2,
            retry_backoff: Duration::from_secs(1),
            timeout: Duration::from_secs(30),
        }
    }
}

/// Which part of the cache to wipe before the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClearScope {
    All,
    Only(Category),
}

impl ClearScope {
    pub fn parse(value: Option<&str>) -> Result<Self, String> {
        match value {
            None => Ok(ClearScope::All),
            Some(value) if value.trim().eq_ignore_ascii_case("all") => Ok(ClearScope::All),
            Some(value) => value.parse().map(ClearScope::Only),
        }
    }

    pub fn category(&self) -> Option<Category> {
        match self {
            ClearScope::All => None,
            ClearScope::Only(category) => Some(*category),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Cache root; `None` when no usable directory exists.
    pub dir: Option<PathBuf>,
    /// When false the run neither reads nor writes the cache.
    pub enabled: bool,
    /// `None` disables expiry.
    pub expiry_days: Option<u32>,
    /// Applied before `enabled` is taken into account.
    pub clear: Option<ClearScope>,
}

#[derive(Debug, Clone)]
pub struct ImageConfig {
    pub enabled: bool,
    pub max_width: u32,
    pub jpeg_quality: u8,
    /// zlib-style level, 0 (fastest) to 9 (smallest).
    pub png_compression: u8,
    pub max_bytes: usize,
}

impl Default for ImageConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_width: 1200,
            jpeg_quality: 80,
            png_compression: 6,
            max_bytes: 1024 * 1024,
        }
    }
}

impl ImageConfig {
    pub fn validate(&self) -> Result<(), String> {
        if !(1..=100).contains(&self.jpeg_quality) {
            return Err(format!("JPEG quality must be between 1 and 100, got {}", self.jpeg_quality));
        }
        if self.png_compression > 9 {
            return Err(format!("PNG compression must be between 0 and 9, got {}", self.png_compression));
        }
        if self.max_width == 0 {
            return Err("maximum image width must be positive".to_string());
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub struct OutputConfig {
    /// Maximum posts per volume; `None` writes a single file.
    pub split_threshold: Option<usize>,
    /// Keep only the first `limit` collected URLs.
    pub limit: Option<usize>,
    pub kindle: bool,
    pub convert: Option<Format>,
}

#[test]
fn test_clear_scope_parse() {
    assert_eq!(Ok(ClearScope::All), ClearScope::parse(None));
    assert_eq!(Ok(ClearScope::All), ClearScope::parse(Some("ALL")));
    assert_eq!(Ok(ClearScope::Only(Category::Posts)), ClearScope::parse(Some("posts")));
    assert!(ClearScope::parse(Some("everything")).is_err());
}

#[test]
fn test_image_config_validation() {
    assert!(ImageConfig::default().validate().is_ok());
    assert!(ImageConfig { png_compression: 10, ..ImageConfig::default() }.validate().is_err());
    assert!(ImageConfig { jpeg_quality: 0, ..ImageConfig::default() }.validate().is_err());
}
