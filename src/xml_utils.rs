use ego_tree::iter::{Edge, Traverse};
use lazy_static::lazy_static;
use markup5ever::{LocalName, QualName};
use regex::Regex;
use scraper::node::Element;
use scraper::{ElementRef, Node};
use xml5ever::serialize::{serialize, SerializeOpts, TraversalScope};

pub(crate) trait XmlSerializable {
    fn serialize_xml(&self, traversal_scope: TraversalScope) -> String;

    /// Returns the inner XML of this element.
    fn inner_xml(&self) -> String {
        self.serialize_xml(TraversalScope::ChildrenOnly(None))
    }
}

impl<'a> XmlSerializable for ElementRef<'a> {
    fn serialize_xml(&self, traversal_scope: TraversalScope) -> String {
        let opts = SerializeOpts { traversal_scope };
        let mut buf = Vec::new();
        if serialize(&mut buf, self, opts).is_err() {
            return String::new();
        }
        String::from_utf8_lossy(&buf)
            // The serializer does not support XML fragments,
            // we need to remove redundant namespace attributes.
            .replace(r#" xmlns="http://www.w3.org/1999/xhtml""#, "")
    }
}

/// Creates a qualified name for a HTML element.
pub fn html_elem_name(name: &str) -> QualName {
    QualName::new(None, ns!(html), LocalName::from(name))
}

/// Creates a qualified name for an attribute without namespace.
pub fn html_attr_name(name: &str) -> QualName {
    QualName::new(None, ns!(), LocalName::from(name))
}

/// Elements whose edges separate words even when the markup has no whitespace.
const WORD_BREAKING_ELEMENTS: &[&str] = &[
    "br", "hr", "p", "div", "li", "ul", "ol", "blockquote", "pre", "h1", "h2", "h3", "h4", "h5", "h6", "tr", "td",
    "th", "section", "article", "header", "footer", "figure", "figcaption",
];

fn breaks_words(element: &Element) -> bool {
    WORD_BREAKING_ELEMENTS.iter().any(|name| *name == element.name())
}

lazy_static! {
    static ref WHITESPACE_RUN: Regex = Regex::new(r"\s+").unwrap();
}

/// Collapses whitespace runs to a single space and trims the ends.
pub fn collapse_whitespace(text: &str) -> String {
    WHITESPACE_RUN.replace_all(text, " ").trim().to_string()
}

/// Helper trait that will allow us to call `text_filter` on `ElementRef`.
pub(crate) trait FilterableTree<'a, P> {
    fn text_filter(&self, is_allowed: P) -> TextFiltered<'a, P>
    where
        Self: Sized,
        P: FnMut(&Element) -> bool;
}

impl<'a, P> FilterableTree<'a, P> for ElementRef<'a> {
    fn text_filter(&self, is_allowed: P) -> TextFiltered<'a, P>
    where
        Self: Sized,
        P: FnMut(&Element) -> bool,
    {
        TextFiltered {
            inner: self.traverse(),
            is_in_filtered: 0,
            is_allowed,
        }
    }
}

/// Iterator over descendent text nodes
/// that allows pruning elements in the tree using a predicate.
/// A single space is yielded at the edges of word-breaking elements
/// so that `Slippery<br/>Slopes` does not turn into one word.
pub struct TextFiltered<'a, P> {
    /// Internal tree iterator.
    inner: Traverse<'a, Node>,
    /// Counter representing how deeply we are in removed node, element-wise.
    is_in_filtered: usize,
    /// When this predicate returns false on a node,
    /// its child text nodes will not be yielded from the iterator.
    is_allowed: P,
}

impl<'a, P> Iterator for TextFiltered<'a, P>
where
    Self: Sized,
    P: FnMut(&Element) -> bool,
{
    type Item = &'a str;

    fn next(&mut self) -> Option<Self::Item> {
        for edge in &mut self.inner {
            match edge {
                Edge::Open(node) => match node.value() {
                    Node::Element(ref element) => {
                        if !(self.is_allowed)(element) || self.is_in_filtered > 0 {
                            // If we enter a forbidden element, or dive in deeper inside it.
                            self.is_in_filtered += 1;
                        } else if breaks_words(element) {
                            return Some(" ");
                        }
                    }
                    Node::Text(ref text) => {
                        if self.is_in_filtered == 0 {
                            return Some(&**text);
                        }
                    }
                    _ => {}
                },
                Edge::Close(node) => {
                    if let Node::Element(ref element) = node.value() {
                        if self.is_in_filtered > 0 {
                            self.is_in_filtered -= 1;
                        } else if breaks_words(element) {
                            return Some(" ");
                        }
                    }
                }
            }
        }
        None
    }
}

/// Visible text of an element with word boundaries kept and whitespace collapsed.
pub fn spaced_text(elem: &ElementRef) -> String {
    let text = elem
        .text_filter(|element: &Element| !matches!(element.name(), "script" | "style" | "template"))
        .collect::<String>();
    collapse_whitespace(&text)
}

#[cfg(test)]
use scraper::{Html, Selector};

#[test]
fn test_filter_text_iterator() {
    let doc = Html::parse_fragment(
        "<p>hullo <a href='prev'>Prev chap</a> hey <a href='prev'>Next <strong>chap</strong></a><em>foo</em></p>",
    );
    let p = doc.select(&Selector::parse("p").unwrap()).next().unwrap();
    assert_eq!(
        " hullo  hey foo ",
        p.text_filter(|elem| elem.name != html_elem_name("a")).collect::<String>()
    );
}

#[test]
fn test_spaced_text_keeps_word_boundary_at_break() {
    let doc = Html::parse_fragment("<h1>Slippery<br/>Slopes</h1>");
    let h1 = doc.select(&Selector::parse("h1").unwrap()).next().unwrap();
    assert_eq!("Slippery Slopes", spaced_text(&h1));
}

#[test]
fn test_spaced_text_joins_inline_spans() {
    let doc = Html::parse_fragment("<h1><span>The </span><span>Sequences</span>\n\t <em>Revisited</em></h1>");
    let h1 = doc.select(&Selector::parse("h1").unwrap()).next().unwrap();
    assert_eq!("The Sequences Revisited", spaced_text(&h1));
}

#[test]
fn test_spaced_text_skips_scripts() {
    let doc = Html::parse_fragment("<div>Title<script>var x = 1;</script></div>");
    let div = doc.select(&Selector::parse("div").unwrap()).next().unwrap();
    assert_eq!("Title", spaced_text(&div));
}

#[test]
fn test_xml_closes_void_elements() {
    let doc = Html::parse_fragment("<p>one<br>two<img src='a.png'></p>");
    let p = doc.select(&Selector::parse("p").unwrap()).next().unwrap();
    let xml = p.inner_xml();
    assert!(xml.starts_with("one"));
    assert!(xml.contains("</br>") || xml.contains("<br/>") || xml.contains("<br />"));
    assert!(xml.contains("</img>") || xml.contains("/>"));
}
