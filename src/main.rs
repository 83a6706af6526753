#[macro_use]
extern crate html5ever;

mod assembler;
mod cache;
mod cleaner;
mod collector;
mod config;
mod converter;
mod dom_manipulation;
mod error;
mod extractor;
mod fetcher;
mod images;
mod pipeline;
mod xml_utils;

use assembler::{sanitize_filename, BookMetadata};
use collector::{BestOfCategory, BestOfYear, Source};
use config::{CacheConfig, ClearScope, Config, FetchConfig, ImageConfig, OutputConfig, DEFAULT_BASE_URL};
use converter::Format;
use directories::ProjectDirs;
use error::Error;
use reqwest::Url;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use structopt::clap::ArgGroup;
use structopt::StructOpt;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Downloads LessWrong posts, sequences or the "Best of LessWrong" collection and packages them as EPUB.
#[derive(StructOpt, Debug)]
#[structopt(name = "lw-epub", group = ArgGroup::with_name("source").required(true))]
struct Args {
    /// Text file with one post URL per line
    #[structopt(long, parse(from_os_str), group = "source")]
    file: Option<PathBuf>,
    /// URL of a sequence
    #[structopt(long, group = "source")]
    sequence: Option<Url>,
    /// URL of a page listing several sequences
    #[structopt(long, group = "source")]
    sequence_list: Option<Url>,
    /// Use the "Best of LessWrong" listing
    #[structopt(long, group = "source")]
    best_of: bool,
    /// Review year for --best-of, "all" or 2018 onwards; repeatable
    #[structopt(long, requires = "best-of", number_of_values = 1)]
    year: Vec<BestOfYear>,
    /// Category for --best-of, e.g. "AI Strategy"; repeatable
    #[structopt(long, requires = "best-of", number_of_values = 1)]
    category: Vec<BestOfCategory>,

    /// Output file, derived from the title if omitted
    #[structopt(short, long, parse(from_os_str))]
    output: Option<PathBuf>,
    #[structopt(long, default_value = "LessWrong Collection")]
    title: String,
    #[structopt(long, default_value = "LessWrong Community")]
    author: String,
    #[structopt(long, default_value = "en")]
    language: String,

    /// Neither read nor write the cache
    #[structopt(long)]
    no_cache: bool,
    /// Clear pages, posts, sequences, images or all (default) before running
    #[structopt(long)]
    clear_cache: Option<Option<String>>,
    /// Days before cached entries are refetched; 0 keeps them forever
    #[structopt(long, default_value = "30")]
    cache_expiry_days: u32,
    #[structopt(long, parse(from_os_str))]
    cache_dir: Option<PathBuf>,

    #[structopt(long, default_value = DEFAULT_BASE_URL)]
    base_url: Url,
    /// Milliseconds to wait between requests
    #[structopt(long, default_value = "500")]
    delay: u64,
    /// Retries for transient network failures
    #[structopt(long, default_value = "2")]
    retries: u32,
    /// Request timeout in seconds
    #[structopt(long, default_value = "30")]
    timeout: u64,

    /// Keep images as remote references
    #[structopt(long)]
    no_images: bool,
    #[structopt(long, default_value = "1200")]
    max_image_width: u32,
    #[structopt(long, default_value = "80")]
    jpeg_quality: u8,
    /// 0 (fastest) to 9 (smallest)
    #[structopt(long, default_value = "6")]
    png_compression: u8,
    /// Images larger than this after processing are replaced by a placeholder
    #[structopt(long, default_value = "1048576")]
    max_image_bytes: usize,

    /// Produce EPUB 2 and use the Kindle profile when converting
    #[structopt(long)]
    kindle: bool,
    /// Also convert to mobi, azw3 or pdf with ebook-convert
    #[structopt(long)]
    convert: Option<Format>,

    /// Split into volumes of --max-posts-per-volume posts
    #[structopt(long)]
    split: bool,
    #[structopt(long, default_value = "50")]
    max_posts_per_volume: usize,
    /// Only download the first N collected posts
    #[structopt(long)]
    limit: Option<usize>,

    /// More logging; repeat for even more
    #[structopt(short, long, parse(from_occurrences))]
    verbose: u8,
}

impl Args {
    fn source(&self) -> Result<Source, Error> {
        if let Some(path) = &self.file {
            return Ok(Source::FileList(path.clone()));
        }
        if let Some(url) = &self.sequence {
            return Ok(Source::Sequence(url.clone()));
        }
        if let Some(url) = &self.sequence_list {
            return Ok(Source::SequenceList(url.clone()));
        }
        if self.best_of {
            return Ok(Source::BestOf {
                years: self.year.clone(),
                categories: self.category.clone(),
            });
        }
        Err(Error::Config("one of --file, --sequence, --sequence-list or --best-of is required".to_string()))
    }

    fn into_config(self) -> Result<Config, Error> {
        let source = self.source()?;

        let images = ImageConfig {
            enabled: !self.no_images,
            max_width: self.max_image_width,
            jpeg_quality: self.jpeg_quality,
            png_compression: self.png_compression,
            max_bytes: self.max_image_bytes,
        };
        images.validate().map_err(Error::Config)?;

        if self.split && self.max_posts_per_volume == 0 {
            return Err(Error::Config("--max-posts-per-volume must be positive".to_string()));
        }

        let clear = match &self.clear_cache {
            Some(scope) => Some(ClearScope::parse(scope.as_deref()).map_err(Error::Config)?),
            None => None,
        };
        let cache_dir = self.cache_dir.clone().or_else(|| {
            ProjectDirs::from("com", "LessWrong", "lw-epub").map(|dirs| dirs.cache_dir().to_path_buf())
        });

        let output_path = self
            .output
            .clone()
            .unwrap_or_else(|| PathBuf::from(format!("{}.epub", sanitize_filename(&self.title))));

        Ok(Config {
            source,
            base_url: self.base_url,
            fetch: FetchConfig {
                request_delay: Duration::from_millis(self.delay),
                retries: self.retries,
                timeout: Duration::from_secs(self.timeout),
                ..FetchConfig::default()
            },
            cache: CacheConfig {
                dir: cache_dir,
                enabled: !self.no_cache,
                expiry_days: (self.cache_expiry_days > 0).then_some(self.cache_expiry_days),
                clear,
            },
            images,
            output: OutputConfig {
                split_threshold: self.split.then_some(self.max_posts_per_volume),
                limit: self.limit,
                kindle: self.kindle,
                convert: self.convert,
            },
            book: BookMetadata {
                title: self.title,
                author: self.author,
                language: self.language,
                output_path,
            },
        })
    }
}

fn init_logging(verbosity: u8) {
    let default_level = match verbosity {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();
}

fn main() -> ExitCode {
    let args = Args::from_args();
    init_logging(args.verbose);

    let config = match args.into_config() {
        Ok(config) => config,
        Err(err) => {
            error!("{err}");
            return ExitCode::FAILURE;
        }
    };

    match pipeline::run(&config) {
        Ok(written) if !written.is_empty() => {
            for path in &written {
                info!("Created {path:?}");
            }
            ExitCode::SUCCESS
        }
        Ok(_) => ExitCode::FAILURE,
        Err(err) => {
            let mut message = err.to_string();
            let mut source = std::error::Error::source(&err);
            while let Some(cause) = source {
                message.push_str(&format!(": {cause}"));
                source = cause.source();
            }
            error!("{message}");
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
fn parse_args(args: &[&str]) -> Args {
    Args::from_iter_safe(std::iter::once("lw-epub").chain(args.iter().copied())).unwrap()
}

#[test]
fn test_exactly_one_source() {
    assert!(Args::from_iter_safe(["lw-epub"]).is_err());
    assert!(Args::from_iter_safe(["lw-epub", "--file", "urls.txt", "--best-of"]).is_err());
    assert!(Args::from_iter_safe(["lw-epub", "--year", "2019"]).is_err());
}

#[test]
fn test_best_of_config() {
    let config = parse_args(&["--best-of", "--year", "2019", "--year", "2020", "--category", "ai strategy"])
        .into_config()
        .unwrap();
    assert_eq!(
        Source::BestOf {
            years: vec![BestOfYear::Year(2019), BestOfYear::Year(2020)],
            categories: vec![BestOfCategory::AiStrategy],
        },
        config.source
    );
    assert_eq!(PathBuf::from("LessWrong Collection.epub"), config.book.output_path);
}

#[test]
fn test_cache_flags() {
    let config = parse_args(&["--file", "urls.txt", "--no-cache", "--clear-cache", "--cache-expiry-days", "0"])
        .into_config()
        .unwrap();
    assert!(!config.cache.enabled);
    assert_eq!(Some(ClearScope::All), config.cache.clear);
    assert_eq!(None, config.cache.expiry_days);

    let config = parse_args(&["--file", "urls.txt", "--clear-cache", "images"]).into_config().unwrap();
    assert_eq!(Some(ClearScope::Only(cache::Category::Images)), config.cache.clear);
    assert_eq!(Some(30), config.cache.expiry_days);
}

#[test]
fn test_split_and_images() {
    let config = parse_args(&["--file", "urls.txt", "--split", "--max-posts-per-volume", "20", "--png-compression", "9"])
        .into_config()
        .unwrap();
    assert_eq!(Some(20), config.output.split_threshold);
    assert_eq!(9, config.images.png_compression);

    assert!(parse_args(&["--file", "urls.txt", "--png-compression", "10"]).into_config().is_err());
    let unsplit = parse_args(&["--file", "urls.txt"]).into_config().unwrap();
    assert_eq!(None, unsplit.output.split_threshold);
}
