use crate::assembler::assemble;
use crate::cache::Cache;
use crate::cleaner::clean;
use crate::collector::Collector;
use crate::config::{CacheConfig, Config};
use crate::converter::{Converter, Format};
use crate::error::Error;
use crate::extractor::{cache_post, cached_post, extract, PostRecord};
use crate::fetcher::Fetcher;
use crate::images::{ImageAsset, ImageHandler};
use reqwest::Url;
use std::path::PathBuf;
use tracing::{debug, info, warn};

/// Opens the cache and applies a requested clear.
/// Returns `None` when the run should not use a cache at all.
fn open_cache(config: &CacheConfig) -> Result<Option<Cache>, Error> {
    let dir = match &config.dir {
        Some(dir) => dir,
        None => {
            if config.enabled || config.clear.is_some() {
                warn!("No cache directory available, running without cache");
            }
            return Ok(None);
        }
    };
    if !config.enabled && config.clear.is_none() {
        return Ok(None);
    }

    let cache = Cache::open(dir, config.expiry_days).map_err(Error::Cache)?;
    info!("Using cache directory: {dir:?}");
    if let Some(scope) = config.clear {
        cache.clear(scope.category()).map_err(Error::Cache)?;
        match scope.category() {
            Some(category) => info!("Cleared the {category} cache"),
            None => info!("Cleared the whole cache"),
        }
    }

    if config.enabled {
        Ok(Some(cache))
    } else {
        debug!("Caching disabled for this run");
        Ok(None)
    }
}

/// Fetches and extracts one post, preferring a fresh extracted copy from the cache.
/// Failures are logged and the post is skipped.
fn load_post(fetcher: &Fetcher, url: &Url) -> Option<PostRecord> {
    if let Some(cache) = fetcher.cache() {
        match cached_post(cache, url) {
            Ok(Some(post)) => {
                info!("Using {} from cache for {url}", post.title);
                return Some(post);
            }
            Ok(None) => {}
            Err(err) => debug!("Ignoring cached post for {url}: {err}"),
        }
    }

    let page = match fetcher.fetch_page(url) {
        Ok(page) => page,
        Err(err) => {
            warn!("Skipping {url}: {err}");
            return None;
        }
    };
    let post = match extract(url, page.contents()) {
        Ok(post) => post,
        Err(failure) => {
            warn!("Skipping {url}: {failure}");
            return None;
        }
    };
    if page.is_cached() {
        info!("Using {} from cache for {url}", post.title);
    } else {
        info!("Downloaded {} from {url}", post.title);
    }

    if let Some(cache) = fetcher.cache() {
        if let Err(err) = cache_post(cache, &post) {
            warn!("Could not cache post {url}: {err}");
        }
    }
    Some(post)
}

/// Loads and cleans every URL in order; the result keeps the collected order.
pub fn download_posts(fetcher: &Fetcher, urls: &[Url], mut images: Option<&mut ImageHandler<'_>>) -> Vec<PostRecord> {
    let mut posts = Vec::with_capacity(urls.len());
    for (index, url) in urls.iter().enumerate() {
        debug!("Post {}/{}: {url}", index + 1, urls.len());
        let mut post = match load_post(fetcher, url) {
            Some(post) => post,
            None => continue,
        };
        post.order_index = index;
        post.body_html = clean(&post.body_html, &post.source_url, images.as_deref_mut());
        if post.body_html.trim().is_empty() {
            warn!("Skipping {url}: nothing left after cleaning");
            continue;
        }
        posts.push(post);
    }
    info!("Extracted {} of {} posts", posts.len(), urls.len());
    posts
}

/// Runs the optional conversion for every volume. Failures keep the EPUB.
fn convert_all(paths: &[PathBuf], format: Format, kindle: bool) -> Vec<PathBuf> {
    let converter = Converter::default();
    paths
        .iter()
        .filter_map(|path| match converter.convert(path, format, kindle) {
            Ok(converted) => Some(converted),
            Err(err) => {
                warn!("Could not convert {path:?} to {format}: {err}");
                None
            }
        })
        .collect()
}

/// Collects, downloads, cleans and assembles; returns every file written.
pub fn run(config: &Config) -> Result<Vec<PathBuf>, Error> {
    let cache = open_cache(&config.cache)?;
    let fetcher = Fetcher::new(config.fetch.clone(), cache).map_err(Error::Client)?;

    let urls = Collector::new(&fetcher, config.base_url.clone()).collect(&config.source, config.output.limit)?;
    if urls.is_empty() {
        return Err(Error::NothingCollected);
    }

    let mut images = config
        .images
        .enabled
        .then(|| ImageHandler::new(&fetcher, config.images.clone()));
    let posts = download_posts(&fetcher, &urls, images.as_mut());
    let assets = images.map(ImageHandler::into_assets).unwrap_or_default();
    debug!(
        "Collected {} images, {} bytes in total",
        assets.len(),
        assets.iter().map(ImageAsset::byte_size).sum::<usize>()
    );

    let mut written = assemble(
        &posts,
        &config.book,
        config.output.split_threshold,
        &assets,
        config.output.kindle,
    )?;

    if let Some(format) = config.output.convert {
        let converted = convert_all(&written, format, config.output.kindle);
        written.extend(converted);
    }
    Ok(written)
}

#[cfg(test)]
use crate::assembler::BookMetadata;
#[cfg(test)]
use crate::cache::Category;
#[cfg(test)]
use crate::collector::Source;
#[cfg(test)]
use crate::config::{ClearScope, FetchConfig, ImageConfig, OutputConfig};
#[cfg(test)]
use std::path::Path;

#[cfg(test)]
fn offline_base() -> Url {
    Url::parse("http://127.0.0.1:9").unwrap()
}

#[cfg(test)]
fn offline_config(dir: &Path, source: Source) -> Config {
    Config {
        source,
        base_url: offline_base(),
        fetch: FetchConfig {
            request_delay: std::time::Duration::ZERO,
            retries: 0,
            ..FetchConfig::default()
        },
        cache: CacheConfig {
            dir: Some(dir.join("cache")),
            enabled: true,
            expiry_days: None,
            clear: None,
        },
        images: ImageConfig {
            enabled: false,
            ..ImageConfig::default()
        },
        output: OutputConfig::default(),
        book: BookMetadata {
            title: "Offline".to_string(),
            author: "Tester".to_string(),
            language: "en".to_string(),
            output_path: dir.join("offline.epub"),
        },
    }
}

#[cfg(test)]
fn post_page(title: &str) -> String {
    format!(
        r#"<html><body><h1 class="PostsPageTitle-root">{title}</h1>
        <div id="postContent"><p>Text of {title}.</p><p><span></span></p></div></body></html>"#
    )
}

#[test]
fn test_run_from_cached_pages() {
    let dir = tempfile::tempdir().unwrap();
    let cache = Cache::open(&dir.path().join("cache"), None).unwrap();
    let first = offline_base().join("/posts/aaa/first").unwrap();
    let second = offline_base().join("/posts/bbb/second").unwrap();
    cache.put(Category::Pages, first.as_str(), post_page("First").as_bytes()).unwrap();
    cache.put(Category::Pages, second.as_str(), post_page("Second").as_bytes()).unwrap();

    let list = dir.path().join("urls.txt");
    std::fs::write(&list, format!("{first}\n{}\n{second}\n", offline_base().join("/posts/ccc/missing").unwrap())).unwrap();

    let config = offline_config(dir.path(), Source::FileList(list));
    let written = run(&config).unwrap();
    assert_eq!(vec![dir.path().join("offline.epub")], written);
    assert!(written[0].exists());

    // Extracted posts are cached for the next run.
    assert!(cached_post(&cache, &first).unwrap().is_some());
    assert!(cached_post(&cache, &second).unwrap().is_some());
}

#[test]
fn test_posts_keep_collected_order() {
    let dir = tempfile::tempdir().unwrap();
    let cache = Cache::open(dir.path(), None).unwrap();
    let urls: Vec<Url> = ["c", "a", "b"]
        .iter()
        .map(|slug| offline_base().join(&format!("/posts/{slug}/post")).unwrap())
        .collect();
    for (url, title) in urls.iter().zip(["Gamma", "Alpha", "Beta"]) {
        cache.put(Category::Pages, url.as_str(), post_page(title).as_bytes()).unwrap();
    }

    let fetcher = Fetcher::new(
        FetchConfig {
            request_delay: std::time::Duration::ZERO,
            retries: 0,
            ..FetchConfig::default()
        },
        Some(cache),
    )
    .unwrap();
    let posts = download_posts(&fetcher, &urls, None);

    let titles: Vec<_> = posts.iter().map(|post| post.title.as_str()).collect();
    assert_eq!(vec!["Gamma", "Alpha", "Beta"], titles);
    let indices: Vec<_> = posts.iter().map(|post| post.order_index).collect();
    assert_eq!(vec![0, 1, 2], indices);
    assert!(posts.iter().all(|post| !post.body_html.contains("<span>")));
}

#[test]
fn test_empty_url_list_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let list = dir.path().join("urls.txt");
    std::fs::write(&list, "# nothing yet\n\n").unwrap();

    let config = offline_config(dir.path(), Source::FileList(list));
    assert!(matches!(run(&config), Err(Error::NothingCollected)));
    assert!(!dir.path().join("offline.epub").exists());
}

#[test]
fn test_no_extracted_posts_fails_assembly() {
    let dir = tempfile::tempdir().unwrap();
    let list = dir.path().join("urls.txt");
    std::fs::write(&list, format!("{}\n", offline_base().join("/posts/zzz/unreachable").unwrap())).unwrap();

    let config = offline_config(dir.path(), Source::FileList(list));
    assert!(matches!(run(&config), Err(Error::Assembly(_))));
}

#[test]
fn test_clear_runs_even_without_cache() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("cache");
    let cache = Cache::open(&root, None).unwrap();
    cache.put(Category::Posts, "https://example.com/posts/a", b"{}").unwrap();

    let config = CacheConfig {
        dir: Some(root),
        enabled: false,
        expiry_days: None,
        clear: Some(ClearScope::Only(Category::Posts)),
    };
    assert!(open_cache(&config).unwrap().is_none());
    assert_eq!(None, cache.get(Category::Posts, "https://example.com/posts/a").unwrap());
}
