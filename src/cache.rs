use chrono::{DateTime, Duration, Utc};
use easy_error::{Error, ResultExt};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::{create_dir_all, remove_dir_all};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::debug;

/// Kinds of cached data; each gets its own directory under the cache root.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Category {
    /// Raw HTML of fetched pages.
    Pages,
    /// Extracted posts, before cleaning.
    Posts,
    /// Post URL lists parsed from sequence index pages.
    Sequences,
    /// Processed (resized and re-encoded) image bytes.
    Images,
}

impl Category {
    pub const ALL: [Category; 4] = [Category::Pages, Category::Posts, Category::Sequences, Category::Images];

    pub fn dir_name(&self) -> &'static str {
        match self {
            Category::Pages => "pages",
            Category::Posts => "posts",
            Category::Sequences => "sequences",
            Category::Images => "images",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.dir_name())
    }
}

impl FromStr for Category {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Category::ALL
            .into_iter()
            .find(|category| category.dir_name().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| format!("unknown cache category '{s}' (expected pages, posts, sequences or images)"))
    }
}

/// Bookkeeping stored next to each payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: String,
    pub stored_at: DateTime<Utc>,
}

impl CacheEntry {
    /// Whether the entry may still be used at `now`; `expiry` of `None` never expires.
    pub fn is_fresh(&self, now: DateTime<Utc>, expiry: Option<Duration>) -> bool {
        match expiry {
            Some(max_age) => now - self.stored_at <= max_age,
            None => true,
        }
    }
}

/// Disk-backed blob store shared by all cache categories.
pub struct Cache {
    root: PathBuf,
    expiry: Option<Duration>,
}

impl Cache {
    /// Opens (creating if needed) the cache rooted at `root`.
    /// `expiry_days` of `None` disables expiry.
    pub fn open(root: &Path, expiry_days: Option<u32>) -> Result<Self, Error> {
        for category in Category::ALL {
            let dir = root.join(category.dir_name());
            create_dir_all(&dir).context(format!("Could not create cache directory {dir:?}"))?;
        }

        Ok(Self {
            root: root.to_path_buf(),
            expiry: expiry_days.map(|days| Duration::days(i64::from(days))),
        })
    }

    fn entry_paths(&self, category: Category, key: &str) -> (PathBuf, PathBuf) {
        let name = hex::encode(blake3::hash(key.as_bytes()).as_bytes());
        let dir = self.root.join(category.dir_name());
        (dir.join(format!("{name}.data")), dir.join(format!("{name}.meta")))
    }

    pub fn get(&self, category: Category, key: &str) -> Result<Option<Vec<u8>>, Error> {
        self.get_at(category, key, Utc::now())
    }

    /// Returns the payload stored for `key` unless it is missing or stale at `now`.
    pub fn get_at(&self, category: Category, key: &str, now: DateTime<Utc>) -> Result<Option<Vec<u8>>, Error> {
        let (data_path, meta_path) = self.entry_paths(category, key);
        if !data_path.exists() || !meta_path.exists() {
            return Ok(None);
        }

        let meta = std::fs::read(&meta_path).context(format!("Unable to load {meta_path:?} from cache"))?;
        let entry: CacheEntry = match serde_json::from_slice(&meta) {
            Ok(entry) => entry,
            Err(err) => {
                debug!("Ignoring corrupt cache entry {meta_path:?}: {err}");
                return Ok(None);
            }
        };

        if !entry.is_fresh(now, self.expiry) {
            debug!("Cache entry for {key} in {category} expired (stored at {})", entry.stored_at);
            return Ok(None);
        }

        let payload = std::fs::read(&data_path).context(format!("Unable to load {data_path:?} from cache"))?;
        Ok(Some(payload))
    }

    pub fn put(&self, category: Category, key: &str, payload: &[u8]) -> Result<(), Error> {
        self.put_at(category, key, payload, Utc::now())
    }

    pub fn put_at(&self, category: Category, key: &str, payload: &[u8], stored_at: DateTime<Utc>) -> Result<(), Error> {
        let (data_path, meta_path) = self.entry_paths(category, key);
        let entry = CacheEntry {
            key: key.to_string(),
            stored_at,
        };
        let meta = serde_json::to_vec(&entry).context(format!("Could not serialize cache entry for {key}"))?;

        std::fs::write(&data_path, payload).context(format!("Could not cache {key}"))?;
        std::fs::write(&meta_path, meta).context(format!("Could not cache metadata for {key}"))?;
        Ok(())
    }

    /// Deletes one category, or everything when `category` is `None`.
    pub fn clear(&self, category: Option<Category>) -> Result<(), Error> {
        let categories = match category {
            Some(category) => vec![category],
            None => Category::ALL.to_vec(),
        };

        for category in categories {
            let dir = self.root.join(category.dir_name());
            if dir.exists() {
                remove_dir_all(&dir).context(format!("Could not clear cache directory {dir:?}"))?;
            }
            create_dir_all(&dir).context(format!("Could not create cache directory {dir:?}"))?;
        }
        Ok(())
    }
}

#[cfg(test)]
use chrono::TimeZone;

#[cfg(test)]
fn stored_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
}

#[test]
fn test_entry_fresh_within_expiry() {
    let dir = tempfile::tempdir().unwrap();
    let cache = Cache::open(dir.path(), Some(7)).unwrap();
    cache.put_at(Category::Pages, "https://example.com/a", b"hello", stored_time()).unwrap();

    let read_at = stored_time() + Duration::days(7);
    assert_eq!(
        Some(b"hello".to_vec()),
        cache.get_at(Category::Pages, "https://example.com/a", read_at).unwrap()
    );
}

#[test]
fn test_entry_stale_after_expiry() {
    let dir = tempfile::tempdir().unwrap();
    let cache = Cache::open(dir.path(), Some(7)).unwrap();
    cache.put_at(Category::Pages, "https://example.com/a", b"hello", stored_time()).unwrap();

    let read_at = stored_time() + Duration::days(7) + Duration::seconds(1);
    assert_eq!(None, cache.get_at(Category::Pages, "https://example.com/a", read_at).unwrap());
}

#[test]
fn test_expiry_disabled() {
    let dir = tempfile::tempdir().unwrap();
    let cache = Cache::open(dir.path(), None).unwrap();
    cache.put_at(Category::Posts, "key", b"payload", stored_time()).unwrap();

    let read_at = stored_time() + Duration::days(10_000);
    assert_eq!(Some(b"payload".to_vec()), cache.get_at(Category::Posts, "key", read_at).unwrap());
}

#[test]
fn test_categories_are_separate() {
    let dir = tempfile::tempdir().unwrap();
    let cache = Cache::open(dir.path(), None).unwrap();
    cache.put(Category::Pages, "same-key", b"page").unwrap();
    cache.put(Category::Images, "same-key", b"image").unwrap();

    assert_eq!(Some(b"page".to_vec()), cache.get(Category::Pages, "same-key").unwrap());
    assert_eq!(Some(b"image".to_vec()), cache.get(Category::Images, "same-key").unwrap());
    assert_eq!(None, cache.get(Category::Posts, "same-key").unwrap());
}

#[test]
fn test_clear_single_category() {
    let dir = tempfile::tempdir().unwrap();
    let cache = Cache::open(dir.path(), None).unwrap();
    cache.put(Category::Pages, "a", b"page").unwrap();
    cache.put(Category::Sequences, "a", b"sequence").unwrap();

    cache.clear(Some(Category::Pages)).unwrap();

    assert_eq!(None, cache.get(Category::Pages, "a").unwrap());
    assert_eq!(Some(b"sequence".to_vec()), cache.get(Category::Sequences, "a").unwrap());
}

#[test]
fn test_clear_everything() {
    let dir = tempfile::tempdir().unwrap();
    let cache = Cache::open(dir.path(), None).unwrap();
    for category in Category::ALL {
        cache.put(category, "a", b"x").unwrap();
    }

    cache.clear(None).unwrap();

    for category in Category::ALL {
        assert_eq!(None, cache.get(category, "a").unwrap());
    }
}

#[test]
fn test_long_keys_are_storable() {
    let dir = tempfile::tempdir().unwrap();
    let cache = Cache::open(dir.path(), None).unwrap();
    let key = format!("https://example.com/{}", "segment/".repeat(100));
    cache.put(Category::Pages, &key, b"deep").unwrap();
    assert_eq!(Some(b"deep".to_vec()), cache.get(Category::Pages, &key).unwrap());
}

#[test]
fn test_category_from_str() {
    assert_eq!(Ok(Category::Images), "Images".parse());
    assert!("thumbnails".parse::<Category>().is_err());
}
