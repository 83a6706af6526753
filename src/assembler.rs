use crate::error::AssemblyError;
use crate::extractor::PostRecord;
use crate::images::ImageAsset;
use crate::xml_utils::XmlSerializable;
use epub_builder::{EpubBuilder, EpubContent, EpubVersion, ReferenceType, ZipLibrary};
use scraper::Html;
use std::fmt;
use std::fs::File;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Title, author and destination of the ebook.
#[derive(Debug, Clone)]
pub struct BookMetadata {
    pub title: String,
    pub author: String,
    /// BCP 47 tag, e.g. `en`.
    pub language: String,
    pub output_path: PathBuf,
}

const STYLESHEET: &str = "
    body {
        font-family: serif;
        line-height: 1.4;
    }
    .title-page {
        text-align: center;
        margin-top: 30%;
    }
    .post-meta {
        font-size: 0.9em;
        color: #555555;
        margin-bottom: 2em;
    }
    .post-meta a {
        word-break: break-all;
    }
    img {
        max-width: 100%;
        height: auto;
    }
    .image-placeholder {
        font-style: italic;
        color: #777777;
    }
    blockquote {
        margin-left: 1.5em;
        font-style: italic;
    }
    pre, code {
        font-family: monospace;
        white-space: pre-wrap;
    }
";

/// Splits posts into contiguous volumes of at most `threshold` posts.
pub fn partition(posts: &[PostRecord], threshold: Option<usize>) -> Vec<&[PostRecord]> {
    match threshold {
        Some(max) if max > 0 && posts.len() > max => posts.chunks(max).collect(),
        _ => vec![posts],
    }
}

/// `book.epub` becomes `book_vol2.epub` for the second volume.
pub fn volume_path(path: &Path, volume: usize) -> PathBuf {
    let stem = path
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| "book".to_string());
    let extension = path
        .extension()
        .map(|extension| extension.to_string_lossy().into_owned())
        .unwrap_or_else(|| "epub".to_string());
    path.with_file_name(format!("{stem}_vol{volume}.{extension}"))
}

pub fn volume_title(title: &str, volume: usize) -> String {
    format!("{title} (Volume {volume})")
}

/// Turns a book title into something usable as a file name.
pub fn sanitize_filename(title: &str) -> String {
    let cleaned: String = title
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();
    let cleaned = cleaned.trim().trim_matches('.').trim();
    if cleaned.is_empty() {
        "book".to_string()
    } else {
        cleaned.to_string()
    }
}

/// Writes one EPUB per volume and returns the paths in volume order.
pub fn assemble(
    posts: &[PostRecord],
    meta: &BookMetadata,
    split_threshold: Option<usize>,
    assets: &[ImageAsset],
    kindle: bool,
) -> Result<Vec<PathBuf>, AssemblyError> {
    if posts.is_empty() {
        return Err(AssemblyError::NoPosts);
    }

    let volumes = partition(posts, split_threshold);
    if volumes.len() == 1 {
        write_volume(posts, &meta.title, &meta.output_path, meta, assets, kindle)?;
        return Ok(vec![meta.output_path.clone()]);
    }

    info!("Splitting {} posts into {} volumes", posts.len(), volumes.len());
    let mut paths = Vec::with_capacity(volumes.len());
    for (i, volume) in volumes.into_iter().enumerate() {
        let path = volume_path(&meta.output_path, i + 1);
        write_volume(volume, &volume_title(&meta.title, i + 1), &path, meta, assets, kindle)?;
        paths.push(path);
    }
    Ok(paths)
}

/// Re-serialises cleaned HTML as XHTML for the ebook.
fn to_xhtml(body_html: &str) -> String {
    Html::parse_fragment(body_html).root_element().inner_xml()
}

fn wrap_xhtml(title: &str, body: &str) -> String {
    let escaped_title = html_escape::encode_text(title);
    "<?xml version='1.0' encoding='utf-8' ?><html xmlns='http://www.w3.org/1999/xhtml'><head><title>".to_string()
        + &escaped_title
        + "</title><meta http-equiv='Content-Type' content='text/html; charset=utf-8' />\n<link rel='stylesheet' type='text/css' href='stylesheet.css' />\n</head><body>"
        + body
        + "</body></html>"
}

fn title_page(title: &str, author: &str, post_count: usize) -> String {
    let noun = if post_count == 1 { "post" } else { "posts" };
    let body = format!(
        "<div class=\"title-page\"><h1>{}</h1>\n<h2>{}</h2>\n<p>{post_count} {noun}</p></div>",
        html_escape::encode_text(title),
        html_escape::encode_text(author),
    );
    wrap_xhtml(title, &body)
}

fn chapter_page(post: &PostRecord) -> String {
    let mut meta = Vec::new();
    if let Some(author) = &post.author {
        meta.push(format!("By {}", html_escape::encode_text(author)));
    }
    if let Some(published) = &post.published {
        meta.push(html_escape::encode_text(published).into_owned());
    }
    let source = html_escape::encode_double_quoted_attribute(post.source_url.as_str());
    meta.push(format!("<a href=\"{source}\">Original post</a>"));

    let body = format!(
        "<h1>{}</h1>\n<p class=\"post-meta\">{}</p>\n{}",
        html_escape::encode_text(&post.title),
        meta.join(" &#183; "),
        to_xhtml(&post.body_html),
    );
    wrap_xhtml(&post.title, &body)
}

/// Title as it appears in the navigation documents.
fn toc_title(title: &str) -> String {
    // epub-builder leaves `&` unescaped in nav.xhtml but escapes it in toc.ncx,
    // so swap it for the small ampersand.
    title.replace('&', "﹠")
}

fn epub_error<E: fmt::Display>(what: &'static str) -> impl FnOnce(E) -> AssemblyError {
    move |err| AssemblyError::Epub(format!("{what}: {err}"))
}

fn write_volume(
    posts: &[PostRecord],
    title: &str,
    path: &Path,
    meta: &BookMetadata,
    assets: &[ImageAsset],
    kindle: bool,
) -> Result<(), AssemblyError> {
    let mut builder = EpubBuilder::new(ZipLibrary::new().map_err(epub_error("could not create zip library"))?)
        .map_err(epub_error("could not create EPUB builder"))?;

    builder
        .epub_version(if kindle { EpubVersion::V20 } else { EpubVersion::V30 })
        .stylesheet(STYLESHEET.as_bytes())
        .map_err(epub_error("could not set stylesheet"))?
        .metadata("author", &meta.author)
        .map_err(epub_error("could not set author metadata"))?
        .metadata("title", title)
        .map_err(epub_error("could not set title metadata"))?
        .metadata("lang", &meta.language)
        .map_err(epub_error("could not set language metadata"))?;

    builder
        .add_content(
            EpubContent::new("title.xhtml", title_page(title, &meta.author, posts.len()).as_bytes())
                .title(toc_title(title))
                .reftype(ReferenceType::TitlePage),
        )
        .map_err(epub_error("could not add title page"))?;
    builder.inline_toc();

    let mut chapters = String::new();
    for (i, post) in posts.iter().enumerate() {
        let page = chapter_page(post);
        builder
            .add_content(
                EpubContent::new(format!("chapter_{:04}.xhtml", i + 1), page.as_bytes())
                    .title(toc_title(&post.title))
                    .reftype(ReferenceType::Text),
            )
            .map_err(epub_error("could not add chapter"))?;
        chapters.push_str(&page);
    }

    let mut embedded = 0;
    for asset in assets {
        if !chapters.contains(&format!("src=\"{}\"", asset.href)) {
            continue;
        }
        builder
            .add_resource(&asset.href, asset.data.as_slice(), asset.media_type.content_type())
            .map_err(epub_error("could not add image"))?;
        debug!("Embedding {} from {}", asset.href, asset.source_url);
        embedded += 1;
    }
    debug!("{embedded} images embedded into {path:?}");

    let mut file = File::create(path).map_err(|source| AssemblyError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    builder
        .generate(&mut file)
        .map_err(epub_error("could not generate ebook"))?;
    info!("Wrote {} posts to {path:?}", posts.len());
    Ok(())
}

#[cfg(test)]
use crate::images::MediaType;
#[cfg(test)]
use reqwest::Url;

#[cfg(test)]
fn sample_posts(count: usize) -> Vec<PostRecord> {
    (0..count)
        .map(|i| PostRecord {
            source_url: Url::parse(&format!("https://www.lesswrong.com/posts/id{i}/post-{i}")).unwrap(),
            title: format!("Post {i} & Friends"),
            author: Some("Some Author".to_string()),
            published: Some("May 04, 2019".to_string()),
            body_html: format!("<p>Body of post {i}.<br>Second line.</p>"),
            order_index: i,
        })
        .collect()
}

#[cfg(test)]
fn sample_meta(dir: &Path) -> BookMetadata {
    BookMetadata {
        title: "Collected Posts".to_string(),
        author: "Various".to_string(),
        language: "en".to_string(),
        output_path: dir.join("collected.epub"),
    }
}

#[test]
fn test_partition_sizes() {
    let posts = sample_posts(130);
    let sizes: Vec<_> = partition(&posts, Some(50)).iter().map(|volume| volume.len()).collect();
    assert_eq!(vec![50, 50, 30], sizes);
    assert_eq!(1, partition(&posts, None).len());
    assert_eq!(1, partition(&posts, Some(130)).len());
}

#[test]
fn test_volume_naming() {
    assert_eq!(PathBuf::from("out/book_vol2.epub"), volume_path(Path::new("out/book.epub"), 2));
    assert_eq!(PathBuf::from("book_vol1.epub"), volume_path(Path::new("book"), 1));
    assert_eq!("Sequences (Volume 3)", volume_title("Sequences", 3));
}

#[test]
fn test_sanitize_filename() {
    assert_eq!("A_B_ C", sanitize_filename("A/B: C"));
    assert_eq!("book", sanitize_filename(" ... "));
}

#[test]
fn test_no_posts_writes_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let meta = sample_meta(dir.path());
    assert!(matches!(assemble(&[], &meta, None, &[], false), Err(AssemblyError::NoPosts)));
    assert!(!meta.output_path.exists());
}

#[test]
fn test_single_volume() {
    let dir = tempfile::tempdir().unwrap();
    let meta = sample_meta(dir.path());
    let paths = assemble(&sample_posts(3), &meta, Some(50), &[], false).unwrap();
    assert_eq!(vec![meta.output_path.clone()], paths);
    assert!(std::fs::metadata(&meta.output_path).unwrap().len() > 0);
}

#[test]
fn test_split_volumes_written() {
    let dir = tempfile::tempdir().unwrap();
    let meta = sample_meta(dir.path());
    let paths = assemble(&sample_posts(5), &meta, Some(2), &[], true).unwrap();
    assert_eq!(
        vec![
            dir.path().join("collected_vol1.epub"),
            dir.path().join("collected_vol2.epub"),
            dir.path().join("collected_vol3.epub"),
        ],
        paths
    );
    assert!(paths.iter().all(|path| path.exists()));
    assert!(!meta.output_path.exists());
}

#[test]
fn test_chapter_is_xhtml() {
    let post = &sample_posts(1)[0];
    let page = chapter_page(post);
    assert!(page.contains("<br></br>") || page.contains("<br/>"));
    assert!(page.contains("<h1>Post 0 &amp; Friends</h1>"));
    assert!(page.contains("href=\"https://www.lesswrong.com/posts/id0/post-0\""));
    assert!(page.contains("By Some Author"));
}

#[cfg(test)]
fn contains_bytes(haystack: &[u8], needle: &str) -> bool {
    haystack.windows(needle.len()).any(|window| window == needle.as_bytes())
}

#[test]
fn test_only_referenced_images_embedded() {
    let dir = tempfile::tempdir().unwrap();
    let meta = sample_meta(dir.path());
    let mut posts = sample_posts(1);
    posts[0].body_html = r#"<p>Figure:</p><p><img src="images/img_0123456789abcdef.png" alt="figure"></p>"#.to_string();

    let asset = |href: &str| ImageAsset {
        source_url: Url::parse("https://www.lesswrong.com/static/figure.png").unwrap(),
        href: href.to_string(),
        media_type: MediaType::Png,
        data: b"\x89PNG\r\n\x1a\nnot much of an image".to_vec(),
    };
    let assets = vec![
        asset("images/img_0123456789abcdef.png"),
        asset("images/img_fedcba9876543210.png"),
    ];

    let paths = assemble(&posts, &meta, None, &assets, false).unwrap();
    let book = std::fs::read(&paths[0]).unwrap();
    assert!(contains_bytes(&book, "images/img_0123456789abcdef.png"));
    assert!(!contains_bytes(&book, "images/img_fedcba9876543210.png"));
}
