//! Query collaborator seams
//!
//! The XPath compiler lives outside this crate; engines only ever see the
//! compiled artifacts: a matcher deciding whether a row participates in an
//! operation, an update mutating a row element in place, and a selector
//! extracting the sharding value from a row. The concrete types here are
//! the simple implementations the crate itself needs (shard routing and
//! tests); anything richer plugs in through the same traits.

use xmltree::Element;

use crate::error::Result;
use crate::xml;

/// Decides whether a row participates in a query, update or delete.
pub trait RowMatcher: Send + Sync {
    fn matches(&self, row_id: &str, element: &Element) -> bool;

    /// Human-readable form, used in error messages.
    fn expression(&self) -> &str;
}

/// A compiled row mutation, applied to a clone of the visible version.
pub trait RowUpdate: Send + Sync {
    fn apply(&self, element: &mut Element) -> Result<()>;

    fn expression(&self) -> &str;
}

/// Extracts the sharding value from an incoming row.
///
/// Keyed operations only carry the row id, so `element` may be absent; a
/// selector that needs the row content reports `None` in that case, which
/// the router surfaces as a routing failure.
pub trait ShardSelector: Send + Sync {
    fn select(&self, row_id: &str, element: Option<&Element>) -> Option<String>;

    fn expression(&self) -> &str;
}

/// Matches every row.
#[derive(Debug, Default, Clone, Copy)]
pub struct MatchAll;

impl RowMatcher for MatchAll {
    fn matches(&self, _row_id: &str, _element: &Element) -> bool {
        true
    }

    fn expression(&self) -> &str {
        "*"
    }
}

/// Matches rows whose named child element carries exactly the given text.
#[derive(Debug, Clone)]
pub struct ChildEquals {
    name: String,
    value: String,
    expression: String,
}

impl ChildEquals {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        let name = name.into();
        let value = value.into();
        let expression = format!("{name} = '{value}'");
        Self {
            name,
            value,
            expression,
        }
    }
}

impl RowMatcher for ChildEquals {
    fn matches(&self, _row_id: &str, element: &Element) -> bool {
        xml::child_by_name(element, &self.name)
            .map(|child| xml::text_of(child) == self.value)
            .unwrap_or(false)
    }

    fn expression(&self) -> &str {
        &self.expression
    }
}

/// Sets the text of a named child element, creating the child if absent.
#[derive(Debug, Clone)]
pub struct SetChildText {
    name: String,
    value: String,
    expression: String,
}

impl SetChildText {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        let name = name.into();
        let value = value.into();
        let expression = format!("set {name} = '{value}'");
        Self {
            name,
            value,
            expression,
        }
    }
}

impl RowUpdate for SetChildText {
    fn apply(&self, element: &mut Element) -> Result<()> {
        match xml::child_by_name_mut(element, &self.name) {
            Some(child) => xml::set_text(child, &self.value),
            None => {
                let mut child = Element::new(&self.name);
                xml::set_text(&mut child, &self.value);
                element.children.push(xmltree::XMLNode::Element(child));
            }
        }
        Ok(())
    }

    fn expression(&self) -> &str {
        &self.expression
    }
}

/// Shards on the row id itself.
#[derive(Debug, Default, Clone, Copy)]
pub struct RowIdSelector;

impl ShardSelector for RowIdSelector {
    fn select(&self, row_id: &str, _element: Option<&Element>) -> Option<String> {
        Some(row_id.to_string())
    }

    fn expression(&self) -> &str {
        "@xflat:id"
    }
}

/// Shards on the text of a named child element.
#[derive(Debug, Clone)]
pub struct ChildTextSelector {
    name: String,
    expression: String,
}

impl ChildTextSelector {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        let expression = format!("{name}/text()");
        Self { name, expression }
    }
}

impl ShardSelector for ChildTextSelector {
    fn select(&self, _row_id: &str, element: Option<&Element>) -> Option<String> {
        let element = element?;
        let child = xml::child_by_name(element, &self.name)?;
        let text = xml::text_of(child);
        if text.is_empty() {
            None
        } else {
            Some(text)
        }
    }

    fn expression(&self) -> &str {
        &self.expression
    }
}
