//! Conversion of XML command output into nested maps.
//!
//! Device replies such as `show interfaces | display xml` are trees where
//! repeated siblings are told apart by an index child, usually `<name>`:
//!
//! ```xml
//! <interface-information>
//!     <physical-interface>
//!         <name>ge-0/0/0</name>
//!         <oper-status>up</oper-status>
//!     </physical-interface>
//!     <physical-interface>
//!         <name>ge-0/0/1</name>
//!         <oper-status>down</oper-status>
//!     </physical-interface>
//! </interface-information>
//! ```
//!
//! [`XmlParser`] turns this into
//! `{"physical-interface": {"ge-0/0/0": {"oper-status": "up"}, "ge-0/0/1": {...}}}`.
//! The index tag defaults to `name` and can be overridden per full tag path.
//!
//! Rules:
//!
//! - a node without element children (its own index tag aside) is a leaf
//!   holding its text verbatim;
//! - a child carrying its index tag is stored under `tag -> index text`, with
//!   the index child removed from the stored value;
//! - a child without index tag is stored under `tag`;
//! - the first occurrence of a tag decides between the two, a later sibling
//!   disagreeing is an [`ParseError::InconsistentIndex`].

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, NaiveDate, Utc};
use roxmltree::{Document, Node};
use serde::{Deserialize, Serialize};

use crate::error::ParseError;

const DEFAULT_INDEX_TAG: &str = "name";

/// A parsed XML subtree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    /// Text of an element without children, `None` for empty elements.
    Leaf(Option<String>),
    Map(BTreeMap<String, Value>),
}

impl Value {
    /// Child value under `key`, `None` for leaves.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.as_map()?.get(key)
    }

    /// Follows a sequence of keys. Index keys may contain slashes
    /// (`ge-0/0/0`), so paths are never split.
    pub fn get_path<'a, I>(&self, keys: I) -> Option<&Value>
    where
        I: IntoIterator<Item = &'a str>,
    {
        keys.into_iter().try_fold(self, |value, key| value.get(key))
    }

    pub fn text(&self) -> Option<&str> {
        match self {
            Value::Leaf(text) => text.as_deref(),
            Value::Map(_) => None,
        }
    }

    pub fn as_map(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Value::Map(map) => Some(map),
            Value::Leaf(_) => None,
        }
    }

    pub fn is_leaf(&self) -> bool {
        matches!(self, Value::Leaf(_))
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Shape {
    Scalar,
    Keyed,
}

/// Recursive XML to [`Value`] converter with per-path index tags.
#[derive(Debug, Clone, Default)]
pub struct XmlParser {
    indices: HashMap<String, String>,
}

impl XmlParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keys repetitions of the element at `path` by their `tag` child.
    ///
    /// `path` is the slash-joined tag path starting at the root element, e.g.
    /// `rpc-reply/interface-information/physical-interface/logical-interface/address-family`.
    pub fn index(mut self, path: impl Into<String>, tag: impl Into<String>) -> Self {
        self.indices.insert(path.into(), tag.into());
        self
    }

    fn index_tag(&self, path: &str) -> &str {
        self.indices
            .get(path)
            .map(String::as_str)
            .unwrap_or(DEFAULT_INDEX_TAG)
    }

    pub fn parse_str(&self, xml: &str) -> Result<Value, ParseError> {
        let document = Document::parse(xml)?;
        self.parse(&document)
    }

    pub fn parse(&self, document: &Document<'_>) -> Result<Value, ParseError> {
        let root = document.root_element();
        self.parse_node(root, root.tag_name().name(), None)
    }

    fn parse_node(
        &self,
        node: Node<'_, '_>,
        path: &str,
        own_index: Option<&str>,
    ) -> Result<Value, ParseError> {
        let mut elements = node
            .children()
            .filter(|child| child.is_element())
            .filter(|child| Some(child.tag_name().name()) != own_index)
            .peekable();
        if elements.peek().is_none() {
            return Ok(Value::Leaf(node.text().map(str::to_string)));
        }

        let mut value = BTreeMap::new();
        let mut shapes: HashMap<&str, Shape> = HashMap::new();
        for element in elements {
            let tag = element.tag_name().name();
            let element_path = format!("{path}/{tag}");
            let index_tag = self.index_tag(&element_path);
            let index = child(element, index_tag);
            let shape = if index.is_some() {
                Shape::Keyed
            } else {
                Shape::Scalar
            };

            match shapes.get(tag) {
                Some(&seen) if seen != shape => {
                    return Err(ParseError::InconsistentIndex {
                        path: element_path,
                        index_tag: index_tag.to_string(),
                    });
                }
                Some(Shape::Scalar) => return Err(ParseError::DuplicateTag(element_path)),
                _ => {
                    shapes.insert(tag, shape);
                }
            }

            let Some(index) = index else {
                let parsed = self.parse_node(element, &element_path, Some(index_tag))?;
                value.insert(tag.to_string(), parsed);
                continue;
            };

            let key = match index.text() {
                Some(text) if !text.is_empty() => text.to_string(),
                _ => return Err(ParseError::EmptyIndex { path: element_path }),
            };
            let parsed = self.parse_node(element, &element_path, Some(index_tag))?;
            let entry = value
                .entry(tag.to_string())
                .or_insert_with(|| Value::Map(BTreeMap::new()));
            if let Value::Map(keyed) = entry {
                if keyed.contains_key(&key) {
                    return Err(ParseError::DuplicateIndex {
                        path: element_path,
                        index: key,
                    });
                }
                keyed.insert(key, parsed);
            }
        }
        Ok(Value::Map(value))
    }
}

fn child<'a, 'input>(node: Node<'a, 'input>, tag: &str) -> Option<Node<'a, 'input>> {
    node.children()
        .find(|child| child.is_element() && child.tag_name().name() == tag)
}

/// First element found by walking `path` (slash separated child tags).
pub fn find<'a, 'input>(node: Node<'a, 'input>, path: &str) -> Option<Node<'a, 'input>> {
    path.split('/')
        .filter(|segment| !segment.is_empty())
        .try_fold(node, |current, segment| child(current, segment))
}

/// Text of the element at `path`, optionally trimmed.
pub fn text(node: Node<'_, '_>, path: &str, strip: bool) -> Option<String> {
    let text = find(node, path)?.text()?;
    Some(if strip { text.trim() } else { text }.to_string())
}

/// Unsigned number held by the element at `path`; `None` unless all digits.
pub fn number(node: Node<'_, '_>, path: &str) -> Option<u64> {
    let text = find(node, path)?.text()?;
    is_digits(text).then(|| text.parse().ok()).flatten()
}

/// Timestamp held by the element at `path`.
///
/// Tried in order: epoch seconds as text, epoch seconds in a `seconds`
/// attribute, a date like `Jan 02 2024` in a `format` attribute.
pub fn timestamp(node: Node<'_, '_>, path: &str) -> Option<DateTime<Utc>> {
    let element = find(node, path)?;
    if let Some(text) = element.text()
        && is_digits(text)
    {
        return DateTime::from_timestamp(text.parse().ok()?, 0);
    }
    if let Some(seconds) = element.attribute("seconds")
        && is_digits(seconds)
        && let Some(parsed) = seconds
            .parse()
            .ok()
            .and_then(|seconds| DateTime::from_timestamp(seconds, 0))
    {
        return Some(parsed);
    }
    let format = element.attribute("format")?;
    let date = NaiveDate::parse_from_str(format, "%b %d %Y").ok()?;
    Some(date.and_hms_opt(0, 0, 0)?.and_utc())
}

fn is_digits(text: &str) -> bool {
    !text.is_empty() && text.bytes().all(|b| b.is_ascii_digit())
}
