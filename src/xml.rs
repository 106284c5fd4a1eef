//! XML document helpers
//!
//! The on-disk table format and the small set of element utilities the rest
//! of the crate works with. A table file is a single XML document:
//!
//! ```text
//! <table name="people" xmlns:xflat="http://xflat">
//!   <row xflat:id="42">
//!     <person tx="17" commit="17">..</person>
//!     <xflat:delete tx="20" commit="21"/>
//!   </row>
//! </table>
//! ```
//!
//! Every child of a `<row>` is one committed version of that row, tagged
//! with the writer transaction id and the commit id in base 10. Deleted
//! versions are rendered as the `xflat:delete` sentinel. Uncommitted
//! versions are never written.

use std::fs;
use std::io::Write;
use std::path::Path;

use xmltree::{Element, XMLNode};

use crate::engine::row::{RowData, UNCOMMITTED};
use crate::error::Result;

/// The XFlat namespace URI.
pub const XFLAT_NS: &str = "http://xflat";
/// Prefix used for XFlat-owned names in table documents.
pub const XFLAT_PREFIX: &str = "xflat";

const TABLE_TAG: &str = "table";
const ROW_TAG: &str = "row";
const DELETE_TAG: &str = "delete";
/// Row ids live in the XFlat namespace; the parser hands the attribute
/// back keyed by its local name.
const ID_ATTR_QUALIFIED: &str = "xflat:id";
const ID_ATTR: &str = "id";
const NAME_ATTR: &str = "name";
const TX_ATTR: &str = "tx";
const COMMIT_ATTR: &str = "commit";

/// Iterate the element children of `element`, skipping text and comments.
pub fn child_elements(element: &Element) -> impl Iterator<Item = &Element> {
    element.children.iter().filter_map(|node| match node {
        XMLNode::Element(el) => Some(el),
        _ => None,
    })
}

/// First child element with the given local name.
pub fn child_by_name<'a>(element: &'a Element, name: &str) -> Option<&'a Element> {
    child_elements(element).find(|el| el.name == name)
}

/// Mutable lookup of the first child element with the given local name.
pub fn child_by_name_mut<'a>(element: &'a mut Element, name: &str) -> Option<&'a mut Element> {
    element.children.iter_mut().find_map(|node| match node {
        XMLNode::Element(el) if el.name == name => Some(el),
        _ => None,
    })
}

/// Concatenated text content of an element.
pub fn text_of(element: &Element) -> String {
    let mut out = String::new();
    for node in &element.children {
        match node {
            XMLNode::Text(t) | XMLNode::CData(t) => out.push_str(t),
            _ => {}
        }
    }
    out
}

/// Replace the text content of an element.
pub fn set_text(element: &mut Element, text: &str) {
    element
        .children
        .retain(|node| !matches!(node, XMLNode::Text(_) | XMLNode::CData(_)));
    element.children.push(XMLNode::Text(text.to_string()));
}

/// Parse a numeric attribute, defaulting to 0 when missing or malformed.
pub fn attr_i64_or_zero(element: &Element, name: &str) -> i64 {
    element
        .attributes
        .get(name)
        .and_then(|v| v.parse::<i64>().ok())
        .unwrap_or(0)
}

/// Namespace map declaring the `xflat` prefix, for document roots that
/// carry XFlat-owned names.
pub fn xflat_namespace() -> xmltree::Namespace {
    let mut ns = xmltree::Namespace::empty();
    ns.put(XFLAT_PREFIX, XFLAT_NS);
    ns
}

/// The deletion sentinel written in place of a deleted row version. Carries
/// its own namespace declaration so it serialises correctly wherever it
/// lands.
pub fn tombstone_element() -> Element {
    let mut el = Element::new(DELETE_TAG);
    el.prefix = Some(XFLAT_PREFIX.to_string());
    el.namespace = Some(XFLAT_NS.to_string());
    el.namespaces = Some(xflat_namespace());
    el
}

/// True when `element` is the deletion sentinel.
pub fn is_tombstone(element: &Element) -> bool {
    element.name == DELETE_TAG
}

/// Write `root` to `path` atomically: serialise to a sibling temp file,
/// fsync, then rename over the target.
pub fn write_document(path: &Path, root: &Element) -> std::io::Result<()> {
    let tmp = path.with_extension("xml.tmp");
    {
        let mut file = fs::File::create(&tmp)?;
        let mut buf = Vec::new();
        root.write(&mut buf)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()))?;
        file.write_all(&buf)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)
}

/// Parse an XML document from disk.
pub fn read_document(path: &Path) -> Result<Element> {
    let file = fs::File::open(path)?;
    Ok(Element::parse(std::io::BufReader::new(file))?)
}

/// Build the durable document for a table.
///
/// `rows` carries, per row id, the committed versions in commit order. Rows
/// whose versions are all tombstones are omitted entirely; uncommitted
/// versions are skipped even if present.
pub fn build_table_document(table: &str, rows: &[(String, Vec<RowData>)]) -> Element {
    let mut root = Element::new(TABLE_TAG);
    root.attributes
        .insert(NAME_ATTR.to_string(), table.to_string());
    root.namespaces = Some(xflat_namespace());

    for (row_id, versions) in rows {
        let committed: Vec<&RowData> = versions
            .iter()
            .filter(|v| v.commit_id != UNCOMMITTED)
            .collect();
        if !committed.iter().any(|v| !v.is_tombstone()) {
            continue;
        }

        let mut row_el = Element::new(ROW_TAG);
        row_el
            .attributes
            .insert(ID_ATTR_QUALIFIED.to_string(), row_id.clone());

        for version in committed {
            let mut version_el = match &version.element {
                Some(el) => el.clone(),
                None => tombstone_element(),
            };
            version_el
                .attributes
                .insert(TX_ATTR.to_string(), version.transaction_id.to_string());
            version_el
                .attributes
                .insert(COMMIT_ATTR.to_string(), version.commit_id.to_string());
            row_el.children.push(XMLNode::Element(version_el));
        }
        root.children.push(XMLNode::Element(row_el));
    }
    root
}

/// Decode a table document back into per-row version lists.
///
/// Unknown children are skipped; `tx`/`commit` attributes default to 0 when
/// malformed. The returned elements have the version attributes stripped so
/// readers see the stored content verbatim.
pub fn parse_table_document(root: &Element) -> Vec<(String, Vec<RowData>)> {
    let mut rows = Vec::new();
    for row_el in child_elements(root) {
        if row_el.name != ROW_TAG {
            continue;
        }
        let row_id = row_el
            .attributes
            .get(ID_ATTR_QUALIFIED)
            .or_else(|| row_el.attributes.get(ID_ATTR))
            .cloned();
        let Some(row_id) = row_id else {
            tracing::warn!("skipping <row> without id attribute");
            continue;
        };

        let mut versions = Vec::new();
        for version_el in child_elements(row_el) {
            let tx = attr_i64_or_zero(version_el, TX_ATTR);
            let commit = attr_i64_or_zero(version_el, COMMIT_ATTR);
            let element = if is_tombstone(version_el) {
                None
            } else {
                let mut el = version_el.clone();
                el.attributes.remove(TX_ATTR);
                el.attributes.remove(COMMIT_ATTR);
                Some(el)
            };
            versions.push(RowData {
                row_id: row_id.clone(),
                transaction_id: tx,
                commit_id: commit,
                element,
            });
        }
        rows.push((row_id, versions));
    }
    rows
}
