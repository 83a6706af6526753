use crate::xml_utils::{html_attr_name, html_elem_name};
use html5ever::tree_builder::{Attribute, ElementFlags, NodeOrText, TreeSink};
use markup5ever::QualName;
#[cfg(test)]
use scraper::Selector;
use scraper::{Html, Node};

pub(crate) enum DomOperation<Handle> {
    /// Will remove the attribute `attr_name` of element `node_id`.
    RemoveAttribute { node_id: Handle, attr_name: QualName },
    /// Will set the value of attribute `attr_name` of element `node_id` to `value`.
    SetAttribute {
        node_id: Handle,
        attr_name: QualName,
        value: String,
    },
    /// Will remove element with `node_id` together with its subtree.
    RemoveElement { node_id: Handle },
    /// Will remove element with `node_id` and put replacement in its place in the tree.
    ReplaceElement {
        node_id: Handle,
        replacement: NodeOrText<Handle>,
    },
}

pub(crate) trait MutableDom: TreeSink {
    /// Performs given operation to mutate the tree.
    fn perform_operation(&mut self, op: DomOperation<Self::Handle>);

    /// Performs a sequence of scheduled operations.
    fn perform_operations(&mut self, ops: Vec<DomOperation<Self::Handle>>) {
        for op in ops {
            self.perform_operation(op);
        }
    }

    /// Creates a detached, empty element `<name attrs…>`.
    fn create_element_with_attrs(&mut self, name: &str, attrs: &[(&str, &str)]) -> Self::Handle {
        let attrs = attrs
            .iter()
            .map(|(name, value)| Attribute {
                name: html_attr_name(name),
                value: (*value).into(),
            })
            .collect();
        self.create_element(html_elem_name(name), attrs, ElementFlags::default())
    }

    /// Creates a detached element `<name attrs…>text</name>`,
    /// ready to be used as a replacement.
    fn create_text_element(&mut self, name: &str, attrs: &[(&str, &str)], text: &str) -> Self::Handle {
        let elem = self.create_element_with_attrs(name, attrs);
        self.append(&elem, NodeOrText::AppendText(text.into()));
        elem
    }
}

impl MutableDom for Html {
    fn perform_operation(&mut self, op: DomOperation<Self::Handle>) {
        match op {
            DomOperation::RemoveAttribute { node_id, attr_name } => {
                if let Some(mut node) = self.tree.get_mut(node_id) {
                    if let Node::Element(ref mut elem) = node.value() {
                        elem.attrs.remove(&attr_name);
                    }
                }
            }
            DomOperation::SetAttribute {
                node_id,
                attr_name,
                value,
            } => {
                if let Some(mut node) = self.tree.get_mut(node_id) {
                    if let Node::Element(ref mut elem) = node.value() {
                        elem.attrs.insert(attr_name, value.into());
                    }
                }
            }
            DomOperation::RemoveElement { node_id } => {
                self.remove_from_parent(&node_id);
            }
            DomOperation::ReplaceElement { node_id, replacement } => {
                self.append_before_sibling(&node_id, replacement);
                self.remove_from_parent(&node_id);
            }
        }
    }
}

#[test]
fn test_remove_attribute() {
    let mut doc = Html::parse_fragment("<em title='foo'>Emphasis</em> <strong id='important' title='bar' data-test='other'>Bold</strong> <del title='bar'>Wrong</del>");
    let strong = doc.select(&Selector::parse("strong").unwrap()).next().expect("Strong tag not found.");

    doc.perform_operation(DomOperation::RemoveAttribute {
        node_id: strong.id(),
        attr_name: html_attr_name("title"),
    });

    assert_eq!(
        Html::parse_fragment("<em title='foo'>Emphasis</em> <strong id='important' data-test='other'>Bold</strong> <del title='bar'>Wrong</del>"),
        Html::parse_fragment(&doc.root_element().inner_html()),
    );
}

#[test]
fn test_set_attribute_existing() {
    let mut doc = Html::parse_fragment("<a href='/posts/abc'>Link</a>");
    let link = doc.select(&Selector::parse("a").unwrap()).next().expect("Link not found.");

    doc.perform_operation(DomOperation::SetAttribute {
        node_id: link.id(),
        attr_name: html_attr_name("href"),
        value: String::from("https://www.lesswrong.com/posts/abc"),
    });

    assert_eq!(
        Html::parse_fragment("<a href='https://www.lesswrong.com/posts/abc'>Link</a>"),
        Html::parse_fragment(&doc.root_element().inner_html()),
    );
}

#[test]
fn test_remove_element() {
    let mut doc = Html::parse_fragment("<div><p>Keep</p><script>alert(1)</script><p>Also <em>keep</em></p></div>");
    let ops = doc
        .select(&Selector::parse("script").unwrap())
        .map(|elem| DomOperation::RemoveElement { node_id: elem.id() })
        .collect();

    doc.perform_operations(ops);

    assert_eq!(
        Html::parse_fragment("<div><p>Keep</p><p>Also <em>keep</em></p></div>"),
        Html::parse_fragment(&doc.root_element().inner_html()),
    );
}

#[test]
fn test_replace_element() {
    let mut doc = Html::parse_fragment("<p>Before <img src='huge.png'> after</p>");
    let img = doc.select(&Selector::parse("img").unwrap()).next().expect("Image not found.").id();
    let placeholder = doc.create_text_element("span", &[("class", "image-placeholder")], "[Image omitted]");

    doc.perform_operation(DomOperation::ReplaceElement {
        node_id: img,
        replacement: NodeOrText::AppendNode(placeholder),
    });

    assert_eq!(
        Html::parse_fragment("<p>Before <span class='image-placeholder'>[Image omitted]</span> after</p>"),
        Html::parse_fragment(&doc.root_element().inner_html()),
    );
}
