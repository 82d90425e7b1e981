//! Render tree snapshots.
//!
//! A render produces a brand new tree every time; trees are never mutated
//! after construction, so the diff engine can compare two of them freely.

use std::fmt;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// Attribute carrying a stable child identity for keyed reconciliation.
pub const KEY_ATTR: &str = "live-key";

/// Elements that never have children or a closing tag.
const VOID_ELEMENTS: &[&str] = &[
    "area", "base", "br", "col", "embed", "hr", "img", "input", "link", "meta", "source", "track",
    "wbr",
];

/// A node in a render tree: text leaf or element.
///
/// On the wire text nodes are plain JSON strings and elements are objects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Node {
    Text(String),
    Element(Element),
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Element {
    pub tag: String,
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub attrs: IndexMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<Node>,
}

impl Element {
    /// The stable identity of this element, if it carries one.
    pub fn key(&self) -> Option<&str> {
        self.attrs.get(KEY_ATTR).map(String::as_str)
    }
}

impl Node {
    pub fn text(content: impl Into<String>) -> Self {
        Node::Text(content.into())
    }

    pub fn element(tag: impl Into<String>) -> Self {
        Node::Element(Element {
            tag: tag.into(),
            ..Element::default()
        })
    }

    /// Set an attribute. No-op on text nodes.
    pub fn attr(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        if let Node::Element(el) = &mut self {
            el.attrs.insert(name.into(), value.into());
        }
        self
    }

    /// Set the stable identity used when reconciling sibling lists.
    pub fn key(self, key: impl Into<String>) -> Self {
        self.attr(KEY_ATTR, key)
    }

    /// Append a child. No-op on text nodes.
    pub fn child(mut self, child: Node) -> Self {
        if let Node::Element(el) = &mut self {
            el.children.push(child);
        }
        self
    }

    pub fn children(mut self, children: impl IntoIterator<Item = Node>) -> Self {
        if let Node::Element(el) = &mut self {
            el.children.extend(children);
        }
        self
    }

    pub fn as_element(&self) -> Option<&Element> {
        match self {
            Node::Element(el) => Some(el),
            Node::Text(_) => None,
        }
    }

    pub fn tag(&self) -> Option<&str> {
        self.as_element().map(|el| el.tag.as_str())
    }

    /// Node at a path of child indices from this node.
    pub fn at(&self, path: &[usize]) -> Option<&Node> {
        let mut node = self;
        for &index in path {
            node = node.as_element()?.children.get(index)?;
        }
        Some(node)
    }

    pub(crate) fn at_mut(&mut self, path: &[usize]) -> Option<&mut Node> {
        let mut node = self;
        for &index in path {
            node = match node {
                Node::Element(el) => el.children.get_mut(index)?,
                Node::Text(_) => return None,
            };
        }
        Some(node)
    }

    /// The tree as a browser holds it after parsing its HTML: adjacent text
    /// merged into one node, empty text dropped, void elements childless.
    ///
    /// Patch paths are child indices, so only normalized trees may be sent
    /// to a client or kept as the snapshot it is diffed against.
    pub fn normalize(self) -> Node {
        let mut el = match self {
            Node::Text(_) => return self,
            Node::Element(el) => el,
        };
        if VOID_ELEMENTS.contains(&el.tag.as_str()) {
            el.children.clear();
            return Node::Element(el);
        }

        let mut children: Vec<Node> = Vec::with_capacity(el.children.len());
        for child in el.children.drain(..) {
            match child.normalize() {
                Node::Text(text) if text.is_empty() => {}
                Node::Text(text) => match children.last_mut() {
                    Some(Node::Text(previous)) => previous.push_str(&text),
                    _ => children.push(Node::Text(text)),
                },
                element => children.push(element),
            }
        }
        el.children = children;
        Node::Element(el)
    }

    /// Serialize to HTML. A root `html` element gets a doctype.
    pub fn to_html(&self) -> String {
        let mut out = String::new();
        if self.tag() == Some("html") {
            out.push_str("<!DOCTYPE html>");
        }
        write_html(self, &mut out);
        out
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut out = String::new();
        write_html(self, &mut out);
        f.write_str(&out)
    }
}

fn write_html(node: &Node, out: &mut String) {
    match node {
        Node::Text(text) => out.push_str(&html_escape(text)),
        Node::Element(el) => {
            out.push('<');
            out.push_str(&el.tag);
            for (name, value) in &el.attrs {
                out.push(' ');
                out.push_str(name);
                out.push_str("=\"");
                out.push_str(&html_escape(value));
                out.push('"');
            }
            out.push('>');
            if VOID_ELEMENTS.contains(&el.tag.as_str()) {
                return;
            }
            for child in &el.children {
                write_html(child, out);
            }
            out.push_str("</");
            out.push_str(&el.tag);
            out.push('>');
        }
    }
}

/// Escape HTML special characters
pub fn html_escape(s: &str) -> String {
    let mut result = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => result.push_str("&amp;"),
            '<' => result.push_str("&lt;"),
            '>' => result.push_str("&gt;"),
            '"' => result.push_str("&quot;"),
            '\'' => result.push_str("&#x27;"),
            _ => result.push(c),
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_to_html_escapes_text_and_attributes() {
        let node = Node::element("p")
            .attr("title", "a \"quote\"")
            .child(Node::text("1 < 2 & 3"));
        assert_eq!(
            node.to_html(),
            r#"<p title="a &quot;quote&quot;">1 &lt; 2 &amp; 3</p>"#
        );
    }

    #[test]
    fn test_void_elements_have_no_closing_tag() {
        let node = Node::element("div").child(Node::element("br")).child(
            Node::element("input")
                .attr("type", "text")
                .attr("value", "x"),
        );
        assert_eq!(
            node.to_html(),
            r#"<div><br><input type="text" value="x"></div>"#
        );
    }

    #[test]
    fn test_html_root_gets_doctype() {
        let node = Node::element("html").child(Node::element("body"));
        assert_eq!(node.to_html(), "<!DOCTYPE html><html><body></body></html>");
        assert_eq!(node.to_string(), "<html><body></body></html>");
    }

    #[test]
    fn test_attribute_order_is_preserved() {
        let node = Node::element("a").attr("z", "1").attr("a", "2").attr("m", "3");
        assert_eq!(node.to_html(), r#"<a z="1" a="2" m="3"></a>"#);
    }

    #[test]
    fn test_at_follows_child_indices() {
        let node = Node::element("ul")
            .child(Node::element("li").child(Node::text("one")))
            .child(Node::element("li").key("b").child(Node::text("two")));
        assert_eq!(node.at(&[1, 0]), Some(&Node::text("two")));
        assert_eq!(node.at(&[1]).and_then(Node::as_element).and_then(Element::key), Some("b"));
        assert_eq!(node.at(&[2]), None);
        assert_eq!(node.at(&[0, 0, 0]), None);
    }

    #[test]
    fn test_normalize_matches_parsed_html() {
        let node = Node::element("p")
            .child(Node::text("Count: "))
            .child(Node::text("0"))
            .child(Node::text(""))
            .child(Node::element("b").child(Node::text("")))
            .child(Node::text(""))
            .child(Node::text("!"))
            .child(Node::element("br").child(Node::text("lost")));
        let html = node.to_html();

        let normalized = node.normalize();
        assert_eq!(
            normalized,
            Node::element("p")
                .child(Node::text("Count: 0"))
                .child(Node::element("b"))
                .child(Node::text("!"))
                .child(Node::element("br"))
        );
        assert_eq!(normalized.to_html(), html);
        assert_eq!(normalized.clone().normalize(), normalized);
    }

    #[test]
    fn test_wire_form() {
        let node = Node::element("b").attr("class", "x").child(Node::text("hi"));
        let json = serde_json::to_value(&node).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"tag": "b", "attrs": {"class": "x"}, "children": ["hi"]})
        );
        let back: Node = serde_json::from_value(json).unwrap();
        assert_eq!(back, node);
    }
}
