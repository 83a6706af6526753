use crate::cache::{Cache, Category};
use crate::config::FetchConfig;
use crate::error::FetchError;
use reqwest::blocking::{Client, Response};
use reqwest::Url;
use std::cell::Cell;
use std::thread::sleep;
use std::time::Instant;
use tracing::{debug, warn};

/// Facilitates response type selection in `Fetcher`
/// by converting the cached and fetched responses to requested type.
pub trait DataType: AsRef<[u8]> + Clone {
    fn from_response(response: Response) -> Result<Self, reqwest::Error>
    where
        Self: Sized;
    fn from_bytes(contents: &[u8]) -> Self
    where
        Self: Sized;
}

impl DataType for String {
    fn from_response(response: Response) -> Result<Self, reqwest::Error> {
        // Pages are decoded as UTF-8 regardless of the Content-Type header,
        // the same way they are decoded when loaded back from the cache.
        let contents = response.bytes()?;
        Ok(String::from_utf8_lossy(&contents).to_string())
    }

    fn from_bytes(contents: &[u8]) -> Self {
        String::from_utf8_lossy(contents).to_string()
    }
}

impl DataType for Vec<u8> {
    fn from_response(response: Response) -> Result<Self, reqwest::Error> {
        Ok(Vec::from(response.bytes()?))
    }

    fn from_bytes(contents: &[u8]) -> Self {
        Vec::from(contents)
    }
}

/// Wraps the response from `Fetcher` to allow the consumer
/// to find out whether the resource was fetched or obtained from cache.
#[derive(Debug)]
pub enum Resource<T: DataType> {
    Fetched(T),
    Cached(T),
}

impl<T: DataType> Resource<T> {
    pub fn contents(&self) -> &T {
        match self {
            Resource::Fetched(contents) => contents,
            Resource::Cached(contents) => contents,
        }
    }

    pub fn is_cached(&self) -> bool {
        match self {
            Resource::Fetched(_) => false,
            Resource::Cached(_) => true,
        }
    }
}

/// Blocking HTTP client that keeps a polite distance between live requests
/// and stores pages in the cache, when one is available.
pub struct Fetcher {
    client: Client,
    cache: Option<Cache>,
    config: FetchConfig,
    last_request: Cell<Option<Instant>>,
}

impl Fetcher {
    pub fn new(config: FetchConfig, cache: Option<Cache>) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .user_agent(config.user_agent.clone())
            .timeout(config.timeout)
            .build()?;

        Ok(Self {
            client,
            cache,
            config,
            last_request: Cell::new(None),
        })
    }

    /// The cache shared with the other components, `None` when caching is disabled.
    pub fn cache(&self) -> Option<&Cache> {
        self.cache.as_ref()
    }

    /// Provides the HTML of given URL, from the page cache when a fresh copy exists.
    pub fn fetch_page(&self, url: &Url) -> Result<Resource<String>, FetchError> {
        if let Some(cache) = &self.cache {
            if let Some(contents) = cache.get(Category::Pages, url.as_str())? {
                debug!("Page cache hit for {url}");
                return Ok(Resource::Cached(DataType::from_bytes(&contents)));
            }
        }

        let contents: String = self.fetch_live(url)?;
        if let Some(cache) = &self.cache {
            if let Err(err) = cache.put(Category::Pages, url.as_str(), contents.as_bytes()) {
                warn!("Could not cache page {url}: {err}");
            }
        }
        Ok(Resource::Fetched(contents))
    }

    /// Downloads raw bytes without consulting the page cache.
    pub fn fetch_bytes(&self, url: &Url) -> Result<Vec<u8>, FetchError> {
        self.fetch_live(url)
    }

    fn fetch_live<T: DataType>(&self, url: &Url) -> Result<T, FetchError> {
        let mut backoff = self.config.retry_backoff;
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.request(url, attempt) {
                Ok(contents) => return Ok(contents),
                Err(err) if err.is_transient() && attempt <= self.config.retries => {
                    warn!("Attempt {attempt} for {url} failed: {err}, retrying in {backoff:?}");
                    sleep(backoff);
                    backoff *= 2;
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn request<T: DataType>(&self, url: &Url, attempt: u32) -> Result<T, FetchError> {
        self.wait_for_turn();
        debug!("GET {url}");
        let result = self.client.get(url.clone()).send();
        self.last_request.set(Some(Instant::now()));

        let network_error = |source| FetchError::Network {
            url: url.clone(),
            attempts: attempt,
            source,
        };
        let response = result.map_err(network_error)?;
        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                url: url.clone(),
                status,
            });
        }
        T::from_response(response).map_err(network_error)
    }

    fn wait_for_turn(&self) {
        if let Some(last) = self.last_request.get() {
            let elapsed = last.elapsed();
            if elapsed < self.config.request_delay {
                sleep(self.config.request_delay - elapsed);
            }
        }
    }
}

#[cfg(test)]
use std::time::Duration;

#[cfg(test)]
fn offline_config() -> FetchConfig {
    FetchConfig {
        request_delay: Duration::ZERO,
        retries: 1,
        retry_backoff: Duration::ZERO,
        timeout: Duration::from_secs(2),
        ..FetchConfig::default()
    }
}

#[test]
fn test_cached_page_skips_network() {
    let dir = tempfile::tempdir().unwrap();
    let cache = Cache::open(dir.path(), None).unwrap();
    // Nothing listens on the discard port, so a live request would fail.
    let url = Url::parse("http://127.0.0.1:9/posts/abc/cached").unwrap();
    cache.put(Category::Pages, url.as_str(), b"<html>cached</html>").unwrap();

    let fetcher = Fetcher::new(offline_config(), Some(cache)).unwrap();
    let res = fetcher.fetch_page(&url).unwrap();

    assert!(res.is_cached());
    assert_eq!("<html>cached</html>", res.contents());
}

#[test]
fn test_connection_failure_is_retried_then_reported() {
    let fetcher = Fetcher::new(offline_config(), None).unwrap();
    let url = Url::parse("http://127.0.0.1:9/posts/abc/missing").unwrap();

    match fetcher.fetch_page(&url) {
        Err(FetchError::Network { attempts, .. }) => assert_eq!(2, attempts),
        other => panic!("expected network error, got {other:?}"),
    }
}

#[test]
fn test_status_transience() {
    let url = Url::parse("https://example.com/").unwrap();
    let server_error = FetchError::Status {
        url: url.clone(),
        status: reqwest::StatusCode::BAD_GATEWAY,
    };
    let not_found = FetchError::Status {
        url,
        status: reqwest::StatusCode::NOT_FOUND,
    };
    assert!(server_error.is_transient());
    assert!(!not_found.is_transient());
}

#[test]
fn test_polite_delay_between_live_requests_only() {
    let dir = tempfile::tempdir().unwrap();
    let cache = Cache::open(dir.path(), None).unwrap();
    let cached = Url::parse("http://127.0.0.1:9/posts/abc/cached").unwrap();
    cache.put(Category::Pages, cached.as_str(), b"<html>cached</html>").unwrap();

    let delay = Duration::from_millis(500);
    let config = FetchConfig {
        request_delay: delay,
        retries: 0,
        ..offline_config()
    };
    let fetcher = Fetcher::new(config, Some(cache)).unwrap();
    let missing = Url::parse("http://127.0.0.1:9/posts/abc/missing").unwrap();

    let start = Instant::now();
    assert!(fetcher.fetch_bytes(&missing).is_err());
    assert!(start.elapsed() < delay, "the first request must not wait");
    assert!(fetcher.fetch_bytes(&missing).is_err());
    assert!(start.elapsed() >= delay, "consecutive live requests must be spaced out");

    let before_hit = Instant::now();
    assert!(fetcher.fetch_page(&cached).unwrap().is_cached());
    assert!(before_hit.elapsed() < delay / 2, "a cache hit must not wait");
}

#[cfg(test)]
fn serve_once(body: &'static str) -> Url {
    use std::io::{Read, Write};
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    std::thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        let mut request = [0; 4096];
        let _ = stream.read(&mut request);
        let response = format!(
            "HTTP/1.1 200 OK\r\nContent-Type: text/html\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
            body.len()
        );
        stream.write_all(response.as_bytes()).unwrap();
    });
    Url::parse(&format!("http://{addr}/posts/abc/live")).unwrap()
}

#[test]
fn test_cache_write_failure_keeps_page() {
    let dir = tempfile::tempdir().unwrap();
    let cache = Cache::open(dir.path(), None).unwrap();
    // A file where the pages directory should be makes every write fail.
    std::fs::remove_dir_all(dir.path().join(Category::Pages.dir_name())).unwrap();
    std::fs::write(dir.path().join(Category::Pages.dir_name()), b"").unwrap();

    let url = serve_once("<html>live</html>");
    let fetcher = Fetcher::new(offline_config(), Some(cache)).unwrap();
    let res = fetcher.fetch_page(&url).unwrap();

    assert!(!res.is_cached());
    assert_eq!("<html>live</html>", res.contents());
}
