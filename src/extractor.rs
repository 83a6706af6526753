use crate::cache::{Cache, Category};
use crate::dom_manipulation::{DomOperation, MutableDom};
use crate::error::ExtractionFailure;
use crate::xml_utils::{collapse_whitespace, spaced_text};
use html5ever::tree_builder::NodeOrText;
use chrono::DateTime;
use easy_error::{Error, ResultExt};
use lazy_static::lazy_static;
use regex::Regex;
use reqwest::Url;
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// One post, as it travels from extraction to the ebook.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostRecord {
    pub source_url: Url,
    pub title: String,
    pub author: Option<String>,
    pub published: Option<String>,
    pub body_html: String,
    /// Position of the URL in the collected list.
    pub order_index: usize,
}

pub(crate) fn parse_selectors(selectors: &[&str]) -> Vec<Selector> {
    selectors
        .iter()
        .map(|selector| Selector::parse(selector).unwrap())
        .collect()
}

lazy_static! {
    static ref TITLE_SELECTORS: Vec<Selector> = parse_selectors(&[
        "h1.PostsPageTitle-root a.PostsPageTitle-link",
        "h1.PostsPageTitle-root",
        "h1.PostsPageTitle-title",
        "h1.SequencePage-title",
    ]);
    static ref DOCUMENT_TITLE_SELECTOR: Selector = Selector::parse("head > title, title").unwrap();
    static ref CONTENT_SELECTORS: Vec<Selector> = parse_selectors(&[
        "div#postContent div.InlineReactSelectionWrapper-root > div",
        "div#postContent",
        "div.PostsPage-postContent div.ContentStyles-base",
        "div.content",
    ]);
    static ref AUTHOR_SELECTORS: Vec<Selector> = parse_selectors(&[
        ".PostsAuthors-authorName a",
        ".PostsAuthors-authorName",
        ".UsersNameDisplay-userName",
    ]);
    static ref DATE_ATTR_SELECTOR: Selector = Selector::parse("time[datetime]").unwrap();
    static ref DATE_TEXT_SELECTOR: Selector = Selector::parse(".PostsPageDate-date").unwrap();
    static ref STRIPPED_SELECTOR: Selector = Selector::parse(
        "script, style, noscript, iframe, form, button, input, textarea, select, object, embed, nav, \
         div.commentOnSelection, .AudioToggle-audioIcon, .VoteArrowIconSolid-root, .PostActionsButton-root, \
         .ReviewPillContainer-root, .LWPostsPageHeader-root, div[class*=\"reaction-buttons\"], \
         div.PostsVoteDefault-voteBlock, .CommentsListSection-root, .CommentsNode-root, #comments"
    ).unwrap();
    static ref MEDIA_SELECTOR: Selector = Selector::parse("img, svg, video, math").unwrap();
    static ref NOSCRIPT_SELECTOR: Selector = Selector::parse("noscript").unwrap();
    static ref SOURCED_IMAGE_SELECTOR: Selector = Selector::parse("img[src]").unwrap();
    static ref SITE_SUFFIX: Regex = Regex::new(r"\s+[—–|-]\s+(LessWrong|AI Alignment Forum|EA Forum)(\s+2\.0)?\s*$").unwrap();
}

/// Tries each selector in turn and returns the first element
/// whose visible text is not blank.
pub fn first_match<'a>(doc: &'a Html, strategies: &[Selector]) -> Option<ElementRef<'a>> {
    strategies.iter().enumerate().find_map(|(i, selector)| {
        let found = doc.select(selector).find(|elem| !spaced_text(elem).is_empty());
        if found.is_some() {
            debug!("Selector variant {} matched", i + 1);
        }
        found
    })
}

/// Whitespace-collapsed text without control characters.
pub fn sanitize_title(raw: &str) -> String {
    let without_controls: String = raw.chars().map(|c| if c.is_control() { ' ' } else { c }).collect();
    collapse_whitespace(&without_controls)
}

fn untitled(url: &Url) -> String {
    let slug = url
        .path_segments()
        .and_then(|segments| segments.filter(|segment| !segment.is_empty()).last())
        .unwrap_or("unknown");
    format!("Untitled Post ({slug})")
}

fn extract_title(doc: &Html, url: &Url) -> String {
    if let Some(heading) = first_match(doc, &TITLE_SELECTORS) {
        return sanitize_title(&spaced_text(&heading));
    }

    let document_title = doc
        .select(&DOCUMENT_TITLE_SELECTOR)
        .next()
        .map(|title| sanitize_title(&title.text().collect::<String>()))
        .map(|title| SITE_SUFFIX.replace(&title, "").trim().to_string())
        .filter(|title| !title.is_empty());

    match document_title {
        Some(title) => {
            debug!("Using document title for {url}");
            title
        }
        None => {
            debug!("Could not find a title for {url}");
            untitled(url)
        }
    }
}

fn extract_author(doc: &Html) -> Option<String> {
    first_match(doc, &AUTHOR_SELECTORS).map(|elem| spaced_text(&elem))
}

fn extract_date(doc: &Html) -> Option<String> {
    let from_attr = doc
        .select(&DATE_ATTR_SELECTOR)
        .filter_map(|elem| elem.value().attr("datetime"))
        .map(|raw| match DateTime::parse_from_rfc3339(raw) {
            Ok(date) => date.format("%B %d, %Y").to_string(),
            Err(_) => raw.trim().to_string(),
        })
        .find(|date| !date.is_empty());

    from_attr.or_else(|| {
        doc.select(&DATE_TEXT_SELECTOR)
            .map(|elem| spaced_text(&elem))
            .find(|date| !date.is_empty())
    })
}

fn image_attrs(img: ElementRef) -> Vec<(String, String)> {
    img.value()
        .attrs()
        .map(|(name, value)| (name.to_string(), value.to_string()))
        .collect()
}

/// Attributes of the image a `<noscript>` fallback shows, if any.
/// The parser keeps `<noscript>` content as raw text, so that text is parsed again.
fn noscript_image(noscript: &ElementRef) -> Option<Vec<(String, String)>> {
    if let Some(img) = noscript.select(&SOURCED_IMAGE_SELECTOR).next() {
        return Some(image_attrs(img));
    }
    let fallback = Html::parse_fragment(&noscript.text().collect::<String>());
    let img = fallback.select(&SOURCED_IMAGE_SELECTOR).next()?;
    Some(image_attrs(img))
}

/// Removes scripts, widgets and comment threads from the content's markup.
/// Images inside `<noscript>` replace their wrapper before it is stripped.
fn strip_body(content: &ElementRef) -> Option<String> {
    let mut body = Html::parse_fragment(&content.inner_html());

    let lifted: Vec<_> = body
        .select(&NOSCRIPT_SELECTOR)
        .filter_map(|noscript| noscript_image(&noscript).map(|attrs| (noscript.id(), attrs)))
        .collect();
    let ops = lifted
        .into_iter()
        .map(|(node_id, attrs)| {
            let attrs: Vec<(&str, &str)> = attrs.iter().map(|(name, value)| (name.as_str(), value.as_str())).collect();
            let img = body.create_element_with_attrs("img", &attrs);
            DomOperation::ReplaceElement {
                node_id,
                replacement: NodeOrText::AppendNode(img),
            }
        })
        .collect();
    body.perform_operations(ops);

    let ops = body
        .select(&STRIPPED_SELECTOR)
        .map(|elem| DomOperation::RemoveElement { node_id: elem.id() })
        .collect();
    body.perform_operations(ops);

    let root = body.root_element();
    if spaced_text(&root).is_empty() && root.select(&MEDIA_SELECTOR).next().is_none() {
        return None;
    }
    Some(root.inner_html().trim().to_string())
}

/// Locates title, metadata and content of a fetched post page.
pub fn extract(url: &Url, html: &str) -> Result<PostRecord, ExtractionFailure> {
    let doc = Html::parse_document(html);
    let failure = |reason: &str| ExtractionFailure {
        url: url.clone(),
        reason: reason.to_string(),
    };

    let content = first_match(&doc, &CONTENT_SELECTORS)
        .or_else(|| CONTENT_SELECTORS.iter().find_map(|selector| doc.select(selector).next()))
        .ok_or_else(|| failure("no content container found"))?;
    let body_html = strip_body(&content).ok_or_else(|| failure("content is empty"))?;

    Ok(PostRecord {
        source_url: url.clone(),
        title: extract_title(&doc, url),
        author: extract_author(&doc),
        published: extract_date(&doc),
        body_html,
        order_index: 0,
    })
}

/// Returns the previously extracted post for `url`, if the cache has a fresh one.
pub fn cached_post(cache: &Cache, url: &Url) -> Result<Option<PostRecord>, Error> {
    match cache.get(Category::Posts, url.as_str())? {
        Some(payload) => {
            let post = serde_json::from_slice(&payload).context(format!("Corrupt cached post for {url}"))?;
            Ok(Some(post))
        }
        None => Ok(None),
    }
}

pub fn cache_post(cache: &Cache, post: &PostRecord) -> Result<(), Error> {
    let payload = serde_json::to_vec(post).context(format!("Could not serialize post {}", post.source_url))?;
    cache.put(Category::Posts, post.source_url.as_str(), &payload)
}

#[cfg(test)]
fn post_url() -> Url {
    Url::parse("https://www.lesswrong.com/posts/abc123/slippery-slopes").unwrap()
}

#[cfg(test)]
const POST_PAGE: &str = r#"<html><head><title>Slippery Slopes — LessWrong</title></head><body>
<h1 class="PostsPageTitle-root"><a class="PostsPageTitle-link" href="/posts/abc123">Slippery<br/>Slopes</a></h1>
<span class="PostsAuthors-authorName"><a href="/users/someone">Some   Author</a></span>
<time datetime="2019-05-04T12:30:00.000Z">4th May 2019</time>
<div id="postContent"><div class="InlineReactSelectionWrapper-root"><div>
  <p>First paragraph.</p>
  <script>track()</script>
  <div class="PostsVoteDefault-voteBlock"><button>Upvote</button></div>
  <p>Second <a href="/posts/xyz">paragraph</a>.</p>
</div></div></div>
<div class="CommentsListSection-root"><p>A comment</p></div>
</body></html>"#;

#[test]
fn test_extract_post() {
    let post = extract(&post_url(), POST_PAGE).unwrap();

    assert_eq!("Slippery Slopes", post.title);
    assert_eq!(Some("Some Author".to_string()), post.author);
    assert_eq!(Some("May 04, 2019".to_string()), post.published);
    assert!(post.body_html.contains("First paragraph."));
    assert!(post.body_html.contains("Second <a href=\"/posts/xyz\">paragraph</a>."));
    assert!(!post.body_html.contains("track()"));
    assert!(!post.body_html.contains("Upvote"));
    assert!(!post.body_html.contains("A comment"));
}

#[test]
fn test_title_falls_back_to_document_title() {
    let page = r#"<html><head><title>On   Priors — LessWrong</title></head>
        <body><div class="content"><p>Body</p></div></body></html>"#;
    let post = extract(&post_url(), page).unwrap();
    assert_eq!("On Priors", post.title);
}

#[test]
fn test_title_falls_back_to_slug() {
    let page = r#"<html><head></head><body><div class="content"><p>Body</p></div></body></html>"#;
    let post = extract(&post_url(), page).unwrap();
    assert_eq!("Untitled Post (slippery-slopes)", post.title);
}

#[test]
fn test_missing_content_is_failure() {
    let page = r#"<html><head><title>Nothing here</title></head><body><p>Not a post</p></body></html>"#;
    let failure = extract(&post_url(), page).unwrap_err();
    assert_eq!(post_url(), failure.url);
}

#[test]
fn test_content_of_only_widgets_is_failure() {
    let page = r#"<html><body><h1 class="PostsPageTitle-root">Title</h1>
        <div id="postContent"><script>x()</script><nav>Menu</nav></div></body></html>"#;
    assert!(extract(&post_url(), page).is_err());
}

#[test]
fn test_image_only_content_is_kept() {
    let page = r#"<html><body><h1 class="PostsPageTitle-root">Diagram</h1>
        <div id="postContent"><p><img src="/diagram.png"></p></div></body></html>"#;
    let post = extract(&post_url(), page).unwrap();
    assert!(post.body_html.contains("<img src=\"/diagram.png\">"));
}

#[test]
fn test_noscript_image_is_kept() {
    let page = r#"<html><body><h1 class="PostsPageTitle-root">Lazy</h1>
        <div id="postContent"><p>Text</p><noscript><img src="/lazy.png" alt="lazy"></noscript>
        <noscript><p>Enable scripts</p></noscript></div></body></html>"#;
    let post = extract(&post_url(), page).unwrap();
    assert!(post.body_html.contains("src=\"/lazy.png\""));
    assert!(post.body_html.contains("alt=\"lazy\""));
    assert!(!post.body_html.contains("noscript"));
    assert!(!post.body_html.contains("Enable scripts"));
}

#[test]
fn test_sanitize_title_removes_controls() {
    assert_eq!("Tab Separated Title", sanitize_title("Tab\tSeparated\u{0007}Title\n"));
}

#[test]
fn test_post_cache_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let cache = Cache::open(dir.path(), None).unwrap();
    let post = extract(&post_url(), POST_PAGE).unwrap();

    assert_eq!(None, cached_post(&cache, &post_url()).unwrap());
    cache_post(&cache, &post).unwrap();
    assert_eq!(Some(post), cached_post(&cache, &post_url()).unwrap());
}
