use crate::cache::Category;
use crate::error::CollectError;
use crate::extractor::parse_selectors;
use crate::fetcher::Fetcher;
use chrono::{Datelike, Utc};
use easy_error::ResultExt;
use lazy_static::lazy_static;
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use reqwest::Url;
use scraper::{Html, Selector};
use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::{debug, info, warn};

/// Where the list of posts comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Source {
    /// Text file with one URL per line.
    FileList(PathBuf),
    /// A single sequence page.
    Sequence(Url),
    /// A page linking to several sequences.
    SequenceList(Url),
    /// The curated "best of" listing, one query per year and category pair.
    BestOf {
        years: Vec<BestOfYear>,
        categories: Vec<BestOfCategory>,
    },
}

/// First year the "best of" review covers.
const FIRST_REVIEW_YEAR: i32 = 2018;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BestOfYear {
    All,
    Year(i32),
}

impl FromStr for BestOfYear {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.eq_ignore_ascii_case("all") {
            return Ok(BestOfYear::All);
        }
        let latest = Utc::now().year();
        match s.parse::<i32>() {
            Ok(year) if (FIRST_REVIEW_YEAR..=latest).contains(&year) => Ok(BestOfYear::Year(year)),
            _ => Err(format!("invalid year '{s}', expected 'all' or {FIRST_REVIEW_YEAR}-{latest}")),
        }
    }
}

impl fmt::Display for BestOfYear {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BestOfYear::All => f.write_str("all"),
            BestOfYear::Year(year) => write!(f, "{year}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BestOfCategory {
    All,
    Rationality,
    World,
    Optimization,
    AiStrategy,
    TechnicalAiSafety,
    Practical,
}

impl BestOfCategory {
    const NAMED: [BestOfCategory; 6] = [
        BestOfCategory::Rationality,
        BestOfCategory::World,
        BestOfCategory::Optimization,
        BestOfCategory::AiStrategy,
        BestOfCategory::TechnicalAiSafety,
        BestOfCategory::Practical,
    ];

    /// The category as the site spells it.
    pub fn as_str(&self) -> &'static str {
        match self {
            BestOfCategory::All => "all",
            BestOfCategory::Rationality => "Rationality",
            BestOfCategory::World => "World",
            BestOfCategory::Optimization => "Optimization",
            BestOfCategory::AiStrategy => "AI Strategy",
            BestOfCategory::TechnicalAiSafety => "Technical AI Safety",
            BestOfCategory::Practical => "Practical",
        }
    }
}

impl FromStr for BestOfCategory {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.eq_ignore_ascii_case("all") {
            return Ok(BestOfCategory::All);
        }
        BestOfCategory::NAMED
            .into_iter()
            .find(|category| category.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| {
                let valid: Vec<_> = BestOfCategory::NAMED.iter().map(|category| category.as_str()).collect();
                format!("invalid category '{s}', expected 'all' or one of: {}", valid.join(", "))
            })
    }
}

/// Characters escaped in query values; everything but unreserved characters.
const QUERY_VALUE: &AsciiSet = &NON_ALPHANUMERIC.remove(b'-').remove(b'_').remove(b'.').remove(b'~');

/// Builds the listing URL for one year and category filter.
pub fn best_of_url(base_url: &Url, year: BestOfYear, category: BestOfCategory) -> Url {
    let mut url = base_url.clone();
    url.set_path("/bestoflesswrong");
    let query = format!(
        "year={}&category={}",
        utf8_percent_encode(&year.to_string(), QUERY_VALUE),
        utf8_percent_encode(category.as_str(), QUERY_VALUE)
    );
    url.set_query(Some(&query));
    url
}

lazy_static! {
    static ref SEQUENCE_POST_SELECTORS: Vec<Selector> = parse_selectors(&[
        "div.LWPostsItem-postsItem span.LWPostsItem-title a[href]",
        "div.ChaptersItem-posts span.PostsTitle-eaTitleDesktopEllipsis > a[href]",
        "div.SequencesSmallPostLink-title a[href]",
        "div.CollectionPageContents-item a.CollectionPageContents-postTitle[href]",
        "div.LargeSequencesItem-right div.SequencesSmallPostLink-title a[href]",
    ]);
    static ref SEQUENCE_LINK_SELECTORS: Vec<Selector> = parse_selectors(&[
        "a.LargeSequencesItem-title[href]",
        "div.SequencesPage-grid a.LargeSequencesItem-title[href]",
        "div.AllSequencesPage-content a.LargeSequencesItem-title[href]",
        "div.SequencesGridItem-title a[href]",
        "a.SequencesPageSequencesList-item[href]",
    ]);
    static ref BEST_OF_POST_SELECTORS: Vec<Selector> = parse_selectors(&[
        "div.SpotlightItem-title a[href], a.PostsList-itemTitle[href]",
    ]);
}

/// Whether a URL points at a post rather than a user, tag or comment page.
pub fn is_post_link(url: &Url) -> bool {
    let path = url.path();
    path.contains("/posts/") || (path.contains("/s/") && path.contains("/p/"))
}

fn is_sequence_link(url: &Url) -> bool {
    url.path().contains("/s/") && !url.path().contains("/p/")
}

/// Links matched by the first selector that matches anything, in page order.
fn links_by_first_selector(html: &str, page_url: &Url, strategies: &[Selector]) -> Vec<Url> {
    let doc = Html::parse_document(html);
    for (i, selector) in strategies.iter().enumerate() {
        let links: Vec<Url> = doc
            .select(selector)
            .filter_map(|elem| elem.value().attr("href"))
            .filter_map(|href| page_url.join(href.trim()).ok())
            .map(|mut url| {
                url.set_fragment(None);
                url.set_query(None);
                url
            })
            .collect();
        if !links.is_empty() {
            debug!("Found {} links on {page_url} using selector variant {}", links.len(), i + 1);
            return links;
        }
    }
    Vec::new()
}

pub fn parse_sequence_posts(html: &str, page_url: &Url) -> Vec<Url> {
    let links = links_by_first_selector(html, page_url, &SEQUENCE_POST_SELECTORS);
    dedup_preserving_order(links.into_iter().filter(is_post_link))
}

pub fn parse_sequence_links(html: &str, page_url: &Url) -> Vec<Url> {
    let links = links_by_first_selector(html, page_url, &SEQUENCE_LINK_SELECTORS);
    dedup_preserving_order(links.into_iter().filter(is_sequence_link))
}

pub fn parse_best_of_posts(html: &str, page_url: &Url) -> Vec<Url> {
    let links = links_by_first_selector(html, page_url, &BEST_OF_POST_SELECTORS);
    dedup_preserving_order(links.into_iter().filter(is_post_link))
}

/// Reads one URL per line; blank lines and `#` comments are skipped,
/// relative URLs are resolved against `base_url`.
pub fn parse_url_list(text: &str, base_url: &Url) -> Vec<Url> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| match base_url.join(line) {
            Ok(url) => Some(url),
            Err(err) => {
                warn!("Skipping invalid URL '{line}': {err}");
                None
            }
        })
        .collect()
}

/// Drops repeated URLs, keeping the first occurrence of each.
pub fn dedup_preserving_order<I: IntoIterator<Item = Url>>(urls: I) -> Vec<Url> {
    let mut seen = HashSet::new();
    urls.into_iter().filter(|url| seen.insert(url.clone())).collect()
}

/// Keeps the first `limit` URLs.
pub fn apply_limit(mut urls: Vec<Url>, limit: Option<usize>) -> Vec<Url> {
    if let Some(limit) = limit {
        urls.truncate(limit);
    }
    urls
}

/// Turns a `Source` into the ordered list of post URLs to download.
pub struct Collector<'f> {
    fetcher: &'f Fetcher,
    base_url: Url,
}

impl<'f> Collector<'f> {
    pub fn new(fetcher: &'f Fetcher, base_url: Url) -> Self {
        Self { fetcher, base_url }
    }

    /// Collects everything the source lists, de-duplicates it and only then applies `limit`.
    pub fn collect(&self, source: &Source, limit: Option<usize>) -> Result<Vec<Url>, CollectError> {
        let urls = match source {
            Source::FileList(path) => self.from_file(path)?,
            Source::Sequence(url) => self.sequence(url)?,
            Source::SequenceList(url) => self.sequence_list(url)?,
            Source::BestOf { years, categories } => self.best_of(years, categories)?,
        };
        let urls = dedup_preserving_order(urls);
        info!("Collected {} unique post URLs", urls.len());
        Ok(apply_limit(urls, limit))
    }

    fn from_file(&self, path: &Path) -> Result<Vec<Url>, CollectError> {
        let text = std::fs::read_to_string(path)
            .context(format!("Could not read {path:?}"))
            .map_err(CollectError::File)?;
        let urls = parse_url_list(&text, &self.base_url);
        if urls.is_empty() {
            warn!("No URLs found in {path:?}");
        }
        Ok(urls)
    }

    fn sequence(&self, url: &Url) -> Result<Vec<Url>, CollectError> {
        if let Some(cache) = self.fetcher.cache() {
            match cache.get(Category::Sequences, url.as_str()) {
                Ok(Some(payload)) => match serde_json::from_slice::<Vec<Url>>(&payload) {
                    Ok(posts) => {
                        info!("Using {} posts from cache for sequence {url}", posts.len());
                        return Ok(posts);
                    }
                    Err(err) => debug!("Ignoring corrupt sequence cache for {url}: {err}"),
                },
                Ok(None) => {}
                Err(err) => warn!("Could not read sequence cache for {url}: {err}"),
            }
        }

        info!("Fetching sequence: {url}");
        let page = self.fetcher.fetch_page(url)?;
        let posts = parse_sequence_posts(page.contents(), url);
        if posts.is_empty() {
            return Err(CollectError::NoLinks(url.clone()));
        }
        info!("Found {} posts in sequence {url}", posts.len());

        if let Some(cache) = self.fetcher.cache() {
            let stored = serde_json::to_vec(&posts)
                .context(format!("Could not serialize posts of {url}"))
                .and_then(|payload| cache.put(Category::Sequences, url.as_str(), &payload));
            if let Err(err) = stored {
                warn!("Could not cache sequence {url}: {err}");
            }
        }
        Ok(posts)
    }

    fn sequence_list(&self, url: &Url) -> Result<Vec<Url>, CollectError> {
        info!("Fetching sequence list: {url}");
        let page = self.fetcher.fetch_page(url)?;
        let sequences = parse_sequence_links(page.contents(), url);
        if sequences.is_empty() {
            return Err(CollectError::NoLinks(url.clone()));
        }
        info!("Found {} sequences on {url}", sequences.len());

        let mut posts = Vec::new();
        for sequence_url in &sequences {
            match self.sequence(sequence_url) {
                Ok(found) => posts.extend(found),
                Err(err) => warn!("Skipping sequence {sequence_url}: {err}"),
            }
        }
        Ok(posts)
    }

    fn best_of(&self, years: &[BestOfYear], categories: &[BestOfCategory]) -> Result<Vec<Url>, CollectError> {
        let years = if years.is_empty() { &[BestOfYear::All][..] } else { years };
        let categories = if categories.is_empty() { &[BestOfCategory::All][..] } else { categories };

        let mut posts = Vec::new();
        let mut last_error = None;
        let mut fetched = 0;
        for year in years {
            for category in categories {
                let listing = best_of_url(&self.base_url, *year, *category);
                info!("Fetching Best Of listing: {listing}");
                let page = match self.fetcher.fetch_page(&listing) {
                    Ok(page) => page,
                    Err(err) => {
                        warn!("Skipping listing {listing}: {err}");
                        last_error = Some(err);
                        continue;
                    }
                };
                fetched += 1;
                let found = parse_best_of_posts(page.contents(), &listing);
                if found.is_empty() {
                    warn!("No post URLs found on {listing}");
                }
                posts.extend(found);
            }
        }
        match last_error {
            Some(err) if fetched == 0 => Err(err.into()),
            _ => Ok(posts),
        }
    }
}

#[cfg(test)]
use crate::cache::Cache;
#[cfg(test)]
use crate::config::FetchConfig;

#[cfg(test)]
fn offline_base() -> Url {
    // Nothing listens on the discard port, so only cached pages can be read.
    Url::parse("http://127.0.0.1:9").unwrap()
}

#[cfg(test)]
fn offline_fetcher(cache: Cache) -> Fetcher {
    let config = FetchConfig {
        request_delay: std::time::Duration::ZERO,
        retries: 0,
        ..FetchConfig::default()
    };
    Fetcher::new(config, Some(cache)).unwrap()
}

#[cfg(test)]
fn sequence_page(slugs: &[&str]) -> String {
    let items: String = slugs
        .iter()
        .map(|slug| {
            format!(
                r#"<div class="LWPostsItem-postsItem"><span class="LWPostsItem-title"><a href="/s/seq/p/{slug}">{slug}</a></span></div>"#
            )
        })
        .collect();
    format!("<html><body>{items}<a href=\"/users/someone\">Author</a></body></html>")
}

#[test]
fn test_sequence_preserves_order() {
    let dir = tempfile::tempdir().unwrap();
    let cache = Cache::open(dir.path(), None).unwrap();
    let sequence = offline_base().join("/s/seq").unwrap();
    cache.put(Category::Pages, sequence.as_str(), sequence_page(&["a", "b", "c"]).as_bytes()).unwrap();

    let fetcher = offline_fetcher(cache);
    let collector = Collector::new(&fetcher, offline_base());
    let urls = collector.collect(&Source::Sequence(sequence), None).unwrap();

    let paths: Vec<_> = urls.iter().map(|url| url.path().to_string()).collect();
    assert_eq!(vec!["/s/seq/p/a", "/s/seq/p/b", "/s/seq/p/c"], paths);
}

#[test]
fn test_limit_applies_after_collection() {
    let dir = tempfile::tempdir().unwrap();
    let cache = Cache::open(dir.path(), None).unwrap();
    let sequence = offline_base().join("/s/seq").unwrap();
    let page = sequence_page(&["one", "two", "one", "three", "four", "five"]);
    cache.put(Category::Pages, sequence.as_str(), page.as_bytes()).unwrap();

    let fetcher = offline_fetcher(cache);
    let collector = Collector::new(&fetcher, offline_base());
    let urls = collector.collect(&Source::Sequence(sequence), Some(2)).unwrap();

    let paths: Vec<_> = urls.iter().map(|url| url.path().to_string()).collect();
    assert_eq!(vec!["/s/seq/p/one", "/s/seq/p/two"], paths);
}

#[test]
fn test_apply_limit_keeps_prefix() {
    let urls: Vec<Url> = ["a", "b", "c", "d", "e"]
        .iter()
        .map(|slug| offline_base().join(&format!("/posts/{slug}")).unwrap())
        .collect();
    assert_eq!(urls[..2].to_vec(), apply_limit(urls.clone(), Some(2)));
    assert_eq!(urls, apply_limit(urls.clone(), None));
}

#[test]
fn test_sequence_list_skips_broken_sequence() {
    let dir = tempfile::tempdir().unwrap();
    let cache = Cache::open(dir.path(), None).unwrap();
    let listing = offline_base().join("/library").unwrap();
    cache
        .put(
            Category::Pages,
            listing.as_str(),
            br#"<html><body>
                <a class="LargeSequencesItem-title" href="/s/first">First</a>
                <a class="LargeSequencesItem-title" href="/s/missing">Missing</a>
                <a class="LargeSequencesItem-title" href="/s/second">Second</a>
                <a class="LargeSequencesItem-title" href="/s/first">First again</a>
            </body></html>"#,
        )
        .unwrap();
    let first = offline_base().join("/s/first").unwrap();
    let second = offline_base().join("/s/second").unwrap();
    cache.put(Category::Pages, first.as_str(), sequence_page(&["a", "b"]).as_bytes()).unwrap();
    cache.put(Category::Pages, second.as_str(), sequence_page(&["c", "a"]).as_bytes()).unwrap();

    let fetcher = offline_fetcher(cache);
    let collector = Collector::new(&fetcher, offline_base());
    let urls = collector.collect(&Source::SequenceList(listing), None).unwrap();

    let paths: Vec<_> = urls.iter().map(|url| url.path().to_string()).collect();
    assert_eq!(vec!["/s/seq/p/a", "/s/seq/p/b", "/s/seq/p/c"], paths);
}

#[test]
fn test_sequence_result_is_cached() {
    let dir = tempfile::tempdir().unwrap();
    let cache = Cache::open(dir.path(), None).unwrap();
    let sequence = offline_base().join("/s/seq").unwrap();
    cache.put(Category::Pages, sequence.as_str(), sequence_page(&["a"]).as_bytes()).unwrap();

    let fetcher = offline_fetcher(cache);
    let collector = Collector::new(&fetcher, offline_base());
    collector.collect(&Source::Sequence(sequence.clone()), None).unwrap();

    let cached = fetcher.cache().unwrap().get(Category::Sequences, sequence.as_str()).unwrap().unwrap();
    let posts: Vec<Url> = serde_json::from_slice(&cached).unwrap();
    assert_eq!(vec![offline_base().join("/s/seq/p/a").unwrap()], posts);
}

#[test]
fn test_file_list_skips_comments_and_blanks() {
    let text = "# reading list\n\nhttps://www.lesswrong.com/posts/abc/first\n   \n/posts/def/second\n#https://skipped.example/\n";
    let urls = parse_url_list(text, &Url::parse("https://www.lesswrong.com").unwrap());
    assert_eq!(
        vec![
            Url::parse("https://www.lesswrong.com/posts/abc/first").unwrap(),
            Url::parse("https://www.lesswrong.com/posts/def/second").unwrap(),
        ],
        urls
    );
}

#[test]
fn test_best_of_category_is_percent_encoded() {
    let base = Url::parse("https://www.lesswrong.com").unwrap();
    let url = best_of_url(&base, BestOfYear::Year(2019), "ai strategy".parse().unwrap());
    assert_eq!("https://www.lesswrong.com/bestoflesswrong?year=2019&category=AI%20Strategy", url.as_str());
    assert!(!url.as_str().contains(' '));
}

#[test]
fn test_best_of_defaults_to_all() {
    let base = Url::parse("https://www.lesswrong.com").unwrap();
    let url = best_of_url(&base, BestOfYear::All, BestOfCategory::All);
    assert_eq!(Some("year=all&category=all"), url.query());
}

#[test]
fn test_best_of_filters_are_validated() {
    assert!("2017".parse::<BestOfYear>().is_err());
    assert_eq!(Ok(BestOfYear::Year(2020)), "2020".parse());
    assert_eq!(Ok(BestOfCategory::TechnicalAiSafety), "technical ai SAFETY".parse());
    assert!("Cooking".parse::<BestOfCategory>().is_err());
}

#[test]
fn test_best_of_listing_links() {
    let page = r#"<html><body>
        <div class="SpotlightItem-title"><a href="/posts/aaa/first#comments">First</a></div>
        <a class="PostsList-itemTitle" href="/posts/bbb/second">Second</a>
        <a class="PostsList-itemTitle" href="/tag/ai">Tag</a>
        <a class="PostsList-itemTitle" href="/posts/aaa/first">First again</a>
    </body></html>"#;
    let listing = Url::parse("https://www.lesswrong.com/bestoflesswrong?year=all&category=all").unwrap();
    let urls = parse_best_of_posts(page, &listing);
    assert_eq!(
        vec![
            Url::parse("https://www.lesswrong.com/posts/aaa/first").unwrap(),
            Url::parse("https://www.lesswrong.com/posts/bbb/second").unwrap(),
        ],
        urls
    );
}

#[test]
fn test_best_of_keeps_listings_that_loaded() {
    let dir = tempfile::tempdir().unwrap();
    let cache = Cache::open(dir.path(), None).unwrap();
    let listing = best_of_url(&offline_base(), BestOfYear::Year(2019), BestOfCategory::All);
    cache
        .put(
            Category::Pages,
            listing.as_str(),
            br#"<html><body><a class="PostsList-itemTitle" href="/posts/aaa/first">First</a></body></html>"#,
        )
        .unwrap();

    let fetcher = offline_fetcher(cache);
    let collector = Collector::new(&fetcher, offline_base());
    let source = Source::BestOf {
        years: vec![BestOfYear::Year(2019), BestOfYear::Year(2020)],
        categories: vec![],
    };
    let urls = collector.collect(&source, None).unwrap();
    assert_eq!(vec![offline_base().join("/posts/aaa/first").unwrap()], urls);
}

#[test]
fn test_best_of_fails_when_no_listing_loads() {
    let dir = tempfile::tempdir().unwrap();
    let fetcher = offline_fetcher(Cache::open(dir.path(), None).unwrap());
    let collector = Collector::new(&fetcher, offline_base());
    let source = Source::BestOf {
        years: vec![BestOfYear::Year(2019), BestOfYear::Year(2020)],
        categories: vec![],
    };
    assert!(matches!(collector.collect(&source, None), Err(CollectError::Fetch(_))));
}
