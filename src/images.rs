use crate::cache::Category;
use crate::config::ImageConfig;
use crate::error::ImageProcessingError;
use crate::fetcher::Fetcher;
use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::{CompressionType, FilterType as PngFilterType, PngEncoder};
use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView, ImageFormat};
use reqwest::Url;
use std::collections::HashMap;
use tracing::{debug, info, warn};

/// Formats images are stored in inside the ebook.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaType {
    Jpeg,
    Png,
    Svg,
}

impl MediaType {
    pub fn content_type(&self) -> &'static str {
        match self {
            Self::Jpeg => "image/jpeg",
            Self::Png => "image/png",
            Self::Svg => "image/svg+xml",
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            Self::Jpeg => "jpg",
            Self::Png => "png",
            Self::Svg => "svg",
        }
    }

    /// Recognises already processed bytes, e.g. when loaded back from the cache.
    pub fn sniff(data: &[u8]) -> Option<Self> {
        match image::guess_format(data) {
            Ok(ImageFormat::Jpeg) => Some(Self::Jpeg),
            Ok(ImageFormat::Png) => Some(Self::Png),
            _ if looks_like_svg(data) => Some(Self::Svg),
            _ => None,
        }
    }
}

fn looks_like_svg(data: &[u8]) -> bool {
    let head = String::from_utf8_lossy(&data[..data.len().min(1024)]).to_lowercase();
    let head = head.trim_start();
    head.starts_with("<svg") || ((head.starts_with("<?xml") || head.starts_with("<!doctype svg")) && head.contains("<svg"))
}

fn is_svg(data: &[u8], url: &Url) -> bool {
    url.path().to_lowercase().ends_with(".svg") || looks_like_svg(data)
}

/// An image ready to be embedded into the ebook.
#[derive(Debug, Clone)]
pub struct ImageAsset {
    pub source_url: Url,
    /// Path of the image inside the ebook container.
    pub href: String,
    pub media_type: MediaType,
    pub data: Vec<u8>,
}

impl ImageAsset {
    pub fn byte_size(&self) -> usize {
        self.data.len()
    }
}

/// What a post should reference instead of the remote image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LocalImageRef {
    Local(String),
    /// The image exceeded the size limit and is left out.
    Placeholder,
}

/// Result of resizing and re-encoding a downloaded image.
#[derive(Debug)]
pub enum Processed {
    Image { data: Vec<u8>, media_type: MediaType },
    TooLarge { size: usize },
}

fn png_compression(level: u8) -> CompressionType {
    match level {
        0..=3 => CompressionType::Fast,
        4..=6 => CompressionType::Default,
        _ => CompressionType::Best,
    }
}

fn encode(img: &DynamicImage, source: ImageFormat, url: &Url, config: &ImageConfig) -> Result<(Vec<u8>, MediaType), ImageProcessingError> {
    let mut buf = Vec::new();
    let encode_error = |source| ImageProcessingError::Encode {
        url: url.clone(),
        source,
    };

    let media_type = if source == ImageFormat::Jpeg {
        // JPEG has no alpha channel.
        let rgb = DynamicImage::ImageRgb8(img.to_rgb8());
        rgb.write_with_encoder(JpegEncoder::new_with_quality(&mut buf, config.jpeg_quality))
            .map_err(encode_error)?;
        MediaType::Jpeg
    } else {
        let encoder = PngEncoder::new_with_quality(&mut buf, png_compression(config.png_compression), PngFilterType::Adaptive);
        img.write_with_encoder(encoder).map_err(encode_error)?;
        MediaType::Png
    };
    Ok((buf, media_type))
}

/// Downscales and re-encodes raster images; vector images pass through untouched.
pub fn process_bytes(bytes: &[u8], url: &Url, config: &ImageConfig) -> Result<Processed, ImageProcessingError> {
    let (data, media_type) = if is_svg(bytes, url) {
        (bytes.to_vec(), MediaType::Svg)
    } else {
        let format = image::guess_format(bytes).map_err(|_| ImageProcessingError::Unsupported(url.clone()))?;
        let mut img = image::load_from_memory_with_format(bytes, format).map_err(|source| ImageProcessingError::Decode {
            url: url.clone(),
            source,
        })?;

        let (width, height) = img.dimensions();
        if width > config.max_width {
            let new_height = (u64::from(height) * u64::from(config.max_width) / u64::from(width)).max(1) as u32;
            debug!("Resizing {url} from {width}x{height} to {}x{new_height}", config.max_width);
            img = img.resize_exact(config.max_width, new_height, FilterType::Lanczos3);
        }
        encode(&img, format, url, config)?
    };

    if data.len() > config.max_bytes {
        return Ok(Processed::TooLarge { size: data.len() });
    }
    Ok(Processed::Image { data, media_type })
}

/// Downloads images referenced by posts and keeps the processed copies
/// that end up inside the ebook.
pub struct ImageHandler<'f> {
    fetcher: &'f Fetcher,
    config: ImageConfig,
    assets: Vec<ImageAsset>,
    by_href: HashMap<String, usize>,
    resolved: HashMap<Url, LocalImageRef>,
}

impl<'f> ImageHandler<'f> {
    pub fn new(fetcher: &'f Fetcher, config: ImageConfig) -> Self {
        Self {
            fetcher,
            config,
            assets: Vec::new(),
            by_href: HashMap::new(),
            resolved: HashMap::new(),
        }
    }

    /// Resolves `image_url` to a local reference, a placeholder,
    /// or `None` when the image cannot be used and the remote reference should stay.
    pub fn process(&mut self, image_url: &Url, referring_page_url: &Url) -> Option<LocalImageRef> {
        if let Some(resolved) = self.resolved.get(image_url) {
            return Some(resolved.clone());
        }

        let processed = match self.load(image_url, referring_page_url) {
            Ok(processed) => processed,
            Err(err) => {
                warn!("Keeping remote image {image_url} in {referring_page_url}: {err}");
                return None;
            }
        };

        let local = match processed {
            Processed::Image { data, media_type } => LocalImageRef::Local(self.register(image_url, data, media_type)),
            Processed::TooLarge { size } => {
                warn!(
                    "Image {image_url} is {size} bytes, over the {} byte limit; using a placeholder",
                    self.config.max_bytes
                );
                LocalImageRef::Placeholder
            }
        };
        self.resolved.insert(image_url.clone(), local.clone());
        Some(local)
    }

    fn load(&self, image_url: &Url, referring_page_url: &Url) -> Result<Processed, ImageProcessingError> {
        if let Some(cache) = self.fetcher.cache() {
            match cache.get(Category::Images, image_url.as_str()) {
                Ok(Some(data)) if data.is_empty() => {
                    debug!("Cache remembers {image_url} as too large");
                    return Ok(Processed::TooLarge { size: 0 });
                }
                Ok(Some(data)) => {
                    if let Some(media_type) = MediaType::sniff(&data) {
                        info!("Found image in cache for {image_url}");
                        return Ok(Processed::Image { data, media_type });
                    }
                    debug!("Ignoring unrecognised cached image for {image_url}");
                }
                Ok(None) => {}
                Err(err) => warn!("Could not read image cache for {image_url}: {err}"),
            }
        }

        let bytes = self.fetcher.fetch_bytes(image_url)?;
        info!("Downloaded image from {image_url} for {referring_page_url}");
        let processed = process_bytes(&bytes, image_url, &self.config)?;

        if let Some(cache) = self.fetcher.cache() {
            let payload: &[u8] = match &processed {
                Processed::Image { data, .. } => data,
                Processed::TooLarge { .. } => &[],
            };
            if let Err(err) = cache.put(Category::Images, image_url.as_str(), payload) {
                warn!("Could not cache image {image_url}: {err}");
            }
        }
        Ok(processed)
    }

    fn register(&mut self, image_url: &Url, data: Vec<u8>, media_type: MediaType) -> String {
        // Named after the contents, so re-uploads of the same picture share one file.
        let digest = blake3::hash(&data);
        let href = format!("images/img_{}.{}", hex::encode(&digest.as_bytes()[..8]), media_type.extension());
        if self.by_href.contains_key(&href) {
            debug!("Will re-use {href} for {image_url} since it is the same.");
        } else {
            self.by_href.insert(href.clone(), self.assets.len());
            self.assets.push(ImageAsset {
                source_url: image_url.clone(),
                href: href.clone(),
                media_type,
                data,
            });
        }
        href
    }

    /// Whether `src` points at an image this handler put into the book.
    pub fn is_local(&self, src: &str) -> bool {
        self.by_href.contains_key(src)
    }

    pub fn assets(&self) -> &[ImageAsset] {
        &self.assets
    }

    pub fn into_assets(self) -> Vec<ImageAsset> {
        self.assets
    }
}

#[cfg(test)]
use crate::cache::Cache;
#[cfg(test)]
use crate::config::FetchConfig;
#[cfg(test)]
use std::io::Cursor;

#[cfg(test)]
fn encoded(width: u32, height: u32, format: ImageFormat) -> Vec<u8> {
    let img = image::RgbImage::from_fn(width, height, |x, y| image::Rgb([(x % 256) as u8, (y % 256) as u8, 128]));
    let mut bytes = Vec::new();
    DynamicImage::ImageRgb8(img).write_to(&mut Cursor::new(&mut bytes), format).unwrap();
    bytes
}

#[cfg(test)]
fn image_url(name: &str) -> Url {
    Url::parse("http://127.0.0.1:9/images/").unwrap().join(name).unwrap()
}

#[cfg(test)]
fn offline_fetcher(cache: Option<Cache>) -> Fetcher {
    let config = FetchConfig {
        request_delay: std::time::Duration::ZERO,
        retries: 0,
        ..FetchConfig::default()
    };
    Fetcher::new(config, cache).unwrap()
}

#[test]
fn test_wide_image_is_downscaled() {
    let config = ImageConfig {
        max_width: 100,
        max_bytes: usize::MAX,
        ..ImageConfig::default()
    };
    let processed = process_bytes(&encoded(400, 80, ImageFormat::Png), &image_url("wide.png"), &config).unwrap();

    match processed {
        Processed::Image { data, media_type } => {
            assert_eq!(MediaType::Png, media_type);
            let img = image::load_from_memory(&data).unwrap();
            assert_eq!((100, 20), img.dimensions());
        }
        other => panic!("expected image, got {other:?}"),
    }
}

#[test]
fn test_narrow_jpeg_keeps_size_and_format() {
    let config = ImageConfig {
        max_bytes: usize::MAX,
        ..ImageConfig::default()
    };
    let processed = process_bytes(&encoded(64, 32, ImageFormat::Jpeg), &image_url("photo.jpg"), &config).unwrap();

    match processed {
        Processed::Image { data, media_type } => {
            assert_eq!(MediaType::Jpeg, media_type);
            assert_eq!((64, 32), image::load_from_memory(&data).unwrap().dimensions());
        }
        other => panic!("expected image, got {other:?}"),
    }
}

#[test]
fn test_oversized_result_becomes_placeholder() {
    let config = ImageConfig {
        max_bytes: 10,
        ..ImageConfig::default()
    };
    let processed = process_bytes(&encoded(64, 64, ImageFormat::Png), &image_url("big.png"), &config).unwrap();
    assert!(matches!(processed, Processed::TooLarge { .. }));
}

#[test]
fn test_svg_passes_through() {
    let svg = br#"<svg xmlns="http://www.w3.org/2000/svg" width="4000" height="10"><rect width="4000" height="10"/></svg>"#;
    let processed = process_bytes(svg, &image_url("diagram"), &ImageConfig::default()).unwrap();

    match processed {
        Processed::Image { data, media_type } => {
            assert_eq!(MediaType::Svg, media_type);
            assert_eq!(svg.to_vec(), data);
        }
        other => panic!("expected image, got {other:?}"),
    }
}

#[test]
fn test_garbage_is_unsupported() {
    let result = process_bytes(b"definitely not an image", &image_url("broken.png"), &ImageConfig::default());
    assert!(matches!(result, Err(ImageProcessingError::Unsupported(_))));
}

#[test]
fn test_cached_images_are_deduplicated() {
    let dir = tempfile::tempdir().unwrap();
    let cache = Cache::open(dir.path(), None).unwrap();
    let png = encoded(8, 8, ImageFormat::Png);
    cache.put(Category::Images, image_url("a.png").as_str(), &png).unwrap();
    cache.put(Category::Images, image_url("copy-of-a.png").as_str(), &png).unwrap();

    let fetcher = offline_fetcher(Some(cache));
    let mut handler = ImageHandler::new(&fetcher, ImageConfig::default());
    let page = Url::parse("https://www.lesswrong.com/posts/abc").unwrap();

    let first = handler.process(&image_url("a.png"), &page).unwrap();
    let second = handler.process(&image_url("copy-of-a.png"), &page).unwrap();

    assert_eq!(first, second);
    match first {
        LocalImageRef::Local(href) => {
            assert!(href.starts_with("images/img_") && href.ends_with(".png"));
            assert!(handler.is_local(&href));
        }
        LocalImageRef::Placeholder => panic!("expected a local image"),
    }
    assert_eq!(1, handler.assets().len());
    assert_eq!(png.len(), handler.assets()[0].byte_size());
}

#[test]
fn test_cached_placeholder_decision() {
    let dir = tempfile::tempdir().unwrap();
    let cache = Cache::open(dir.path(), None).unwrap();
    cache.put(Category::Images, image_url("huge.png").as_str(), &[]).unwrap();

    let fetcher = offline_fetcher(Some(cache));
    let mut handler = ImageHandler::new(&fetcher, ImageConfig::default());
    let page = Url::parse("https://www.lesswrong.com/posts/abc").unwrap();

    assert_eq!(Some(LocalImageRef::Placeholder), handler.process(&image_url("huge.png"), &page));
    assert!(handler.assets().is_empty());
}

#[test]
fn test_unreachable_image_keeps_remote_reference() {
    let fetcher = offline_fetcher(None);
    let mut handler = ImageHandler::new(&fetcher, ImageConfig::default());
    let page = Url::parse("https://www.lesswrong.com/posts/abc").unwrap();

    assert_eq!(None, handler.process(&image_url("gone.png"), &page));
}
