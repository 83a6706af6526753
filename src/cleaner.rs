use crate::dom_manipulation::{DomOperation, MutableDom};
use crate::images::{ImageHandler, LocalImageRef};
use crate::xml_utils::html_attr_name;
use html5ever::tree_builder::NodeOrText;
use lazy_static::lazy_static;
use reqwest::Url;
use scraper::{ElementRef, Html, Selector};
use url::ParseError;

lazy_static! {
    static ref ANY_ELEMENT_SELECTOR: Selector = Selector::parse("*").unwrap();
    static ref LINK_SELECTOR: Selector = Selector::parse("a[href]").unwrap();
    static ref IMAGE_SELECTOR: Selector = Selector::parse("img").unwrap();
    static ref REMOVABLE_WHEN_EMPTY_SELECTOR: Selector = Selector::parse("p, span, em, strong, b, i, u, a, div").unwrap();
    static ref CONTENTFUL_SELECTOR: Selector = Selector::parse("img, svg, br, hr, iframe, video, math, picture, table").unwrap();
}

/// Attributes that only make sense for responsive or lazy loading in a browser.
const DROPPED_IMAGE_ATTRIBUTES: &[&str] = &["srcset", "sizes", "loading", "data-src"];

const PLACEHOLDER_CLASS: &str = "image-placeholder";

/// Resolves a relative reference against the post's URL.
/// Absolute URLs and in-page fragments are left alone.
fn absolutize(reference: &str, base: &Url) -> Option<Url> {
    let reference = reference.trim();
    if reference.is_empty() || reference.starts_with('#') {
        return None;
    }
    match Url::parse(reference) {
        Err(ParseError::RelativeUrlWithoutBase) => base.join(reference).ok(),
        _ => None,
    }
}

fn is_empty_element(elem: &ElementRef) -> bool {
    let value = elem.value();
    // Anchors and other link targets must survive even without content.
    if value.attr("id").is_some() || value.attr("name").is_some() {
        return false;
    }
    elem.text().all(|text| text.chars().all(char::is_whitespace)) && elem.select(&CONTENTFUL_SELECTOR).next().is_none()
}

/// Normalises a post body for the ebook; running it again on its own output changes nothing.
pub fn clean(body: &str, base_url: &Url, mut images: Option<&mut ImageHandler<'_>>) -> String {
    let mut doc = Html::parse_fragment(body);
    let mut ops = Vec::new();

    for elem in doc.select(&ANY_ELEMENT_SELECTOR) {
        for (name, _) in elem.value().attrs() {
            let is_handler = name.len() > 2 && name.get(..2).is_some_and(|prefix| prefix.eq_ignore_ascii_case("on"));
            let is_dropped = elem.value().name() == "img" && DROPPED_IMAGE_ATTRIBUTES.iter().any(|dropped| *dropped == name);
            if is_handler || is_dropped {
                ops.push(DomOperation::RemoveAttribute {
                    node_id: elem.id(),
                    attr_name: html_attr_name(name),
                });
            }
        }
    }

    for link in doc.select(&LINK_SELECTOR) {
        if let Some(absolute) = link.value().attr("href").and_then(|href| absolutize(href, base_url)) {
            ops.push(DomOperation::SetAttribute {
                node_id: link.id(),
                attr_name: html_attr_name("href"),
                value: absolute.to_string(),
            });
        }
    }

    let image_sources: Vec<_> = doc
        .select(&IMAGE_SELECTOR)
        .filter_map(|img| img.value().attr("src").map(|src| (img.id(), src.to_string())))
        .collect();

    for (node_id, src) in image_sources {
        if images.as_ref().is_some_and(|handler| handler.is_local(&src)) {
            continue;
        }
        let absolute = absolutize(&src, base_url);
        let remote = match absolute.clone().or_else(|| Url::parse(&src).ok()) {
            Some(remote) if remote.scheme() == "http" || remote.scheme() == "https" => Some(remote),
            _ => None,
        };

        let local = match (images.as_deref_mut(), &remote) {
            (Some(handler), Some(remote)) => handler.process(remote, base_url),
            _ => None,
        };

        match (local, remote) {
            (Some(LocalImageRef::Local(href)), _) => ops.push(DomOperation::SetAttribute {
                node_id,
                attr_name: html_attr_name("src"),
                value: href,
            }),
            (Some(LocalImageRef::Placeholder), Some(remote)) => {
                let placeholder =
                    doc.create_text_element("span", &[("class", PLACEHOLDER_CLASS)], &format!("[Image omitted: {remote}]"));
                ops.push(DomOperation::ReplaceElement {
                    node_id,
                    replacement: NodeOrText::AppendNode(placeholder),
                });
            }
            _ => {
                if let Some(absolute) = absolute {
                    ops.push(DomOperation::SetAttribute {
                        node_id,
                        attr_name: html_attr_name("src"),
                        value: absolute.to_string(),
                    });
                }
            }
        }
    }

    doc.perform_operations(ops);

    // Removing an element can leave its parent empty, so repeat until nothing changes.
    loop {
        let empty: Vec<_> = doc
            .select(&REMOVABLE_WHEN_EMPTY_SELECTOR)
            .filter(is_empty_element)
            .map(|elem| DomOperation::RemoveElement { node_id: elem.id() })
            .collect();
        if empty.is_empty() {
            break;
        }
        doc.perform_operations(empty);
    }

    doc.root_element().inner_html()
}

#[cfg(test)]
use crate::cache::{Cache, Category};
#[cfg(test)]
use crate::config::{FetchConfig, ImageConfig};
#[cfg(test)]
use crate::fetcher::Fetcher;

#[cfg(test)]
fn base() -> Url {
    Url::parse("https://www.lesswrong.com/posts/abc123/some-post").unwrap()
}

#[cfg(test)]
const MESSY_BODIES: &[&str] = &[
    r#"<p>Plain &amp; simple &mdash; text with&nbsp;entities.</p>"#,
    r##"<p>See <a href="/posts/xyz/other">this</a> and <a href="other-post">that</a> or <a href="#fn1">note</a>.</p>"##,
    r#"<p onclick="evil()">Click</p><div onmouseover='x()'><p></p><p> <em> </em> </p></div><span>kept</span>"#,
    r#"<p><img src="/img/a.png" srcset="/img/a-2x.png 2x" loading="lazy" alt="a"></p><p>&nbsp;</p>"#,
    r#"<ol><li>One<a id="fn1"></a></li><li>Two</li></ol><p><strong><em></em></strong></p><br><hr>"#,
    r#"<blockquote><p>Quote</p></blockquote><pre><code>let x = 1 &lt; 2;</code></pre>"#,
    r#"<table><tr><td>cell</td><td></td></tr></table><p><a href="mailto:someone@example.com">mail</a></p>"#,
];

#[test]
fn test_clean_is_idempotent() {
    for body in MESSY_BODIES {
        let once = clean(body, &base(), None);
        let twice = clean(&once, &base(), None);
        assert_eq!(once, twice, "cleaning {body:?} twice changed the output");
    }
}

#[test]
fn test_relative_links_become_absolute() {
    let cleaned = clean(MESSY_BODIES[1], &base(), None);
    assert!(cleaned.contains(r#"href="https://www.lesswrong.com/posts/xyz/other""#));
    assert!(cleaned.contains(r#"href="https://www.lesswrong.com/posts/abc123/other-post""#));
    assert!(cleaned.contains(r##"href="#fn1""##));
}

#[test]
fn test_handlers_and_empty_elements_removed() {
    let cleaned = clean(MESSY_BODIES[2], &base(), None);
    assert_eq!("<p>Click</p><span>kept</span>", cleaned);
}

#[test]
fn test_image_attributes_without_handler() {
    let cleaned = clean(MESSY_BODIES[3], &base(), None);
    assert_eq!(r#"<p><img src="https://www.lesswrong.com/img/a.png" alt="a"></p>"#, cleaned);
}

#[test]
fn test_anchor_targets_survive() {
    let cleaned = clean(MESSY_BODIES[4], &base(), None);
    assert!(cleaned.contains(r#"<a id="fn1"></a>"#));
    assert!(!cleaned.contains("<strong>"));
    assert!(cleaned.contains("<br>"));
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

#[test]
fn test_images_are_localised_idempotently() {
    let dir = tempfile::tempdir().unwrap();
    let cache = Cache::open(dir.path(), None).unwrap();
    let svg = br#"<svg xmlns="http://www.w3.org/2000/svg" width="10" height="10"></svg>"#;
    cache.put(Category::Images, "http://127.0.0.1:9/diagram.svg", svg).unwrap();
    cache.put(Category::Images, "http://127.0.0.1:9/huge.png", &[]).unwrap();

    let fetcher = offline_fetcher(cache);
    let mut handler = ImageHandler::new(&fetcher, ImageConfig::default());
    let body = r#"<p><img src="http://127.0.0.1:9/diagram.svg"></p><p>Text <img src="http://127.0.0.1:9/huge.png"></p>"#;

    let once = clean(body, &base(), Some(&mut handler));
    let twice = clean(&once, &base(), Some(&mut handler));

    assert_eq!(once, twice);
    let href = &handler.assets()[0].href;
    assert!(once.contains(&format!(r#"<img src="{href}">"#)));
    assert!(once.contains(r#"<span class="image-placeholder">[Image omitted: http://127.0.0.1:9/huge.png]</span>"#));
}
