//! Row-id generators
//!
//! Generators persist their state through the per-table metadata element,
//! which outlives engine spin-down, so a stateful generator never reissues
//! an id across engine restarts.

use std::sync::atomic::{AtomicI64, Ordering};

use xmltree::Element;

/// Attribute carrying the high-water mark of the integer generator.
const MAX_ID_ATTR: &str = "xflat:maxId";

pub trait IdGenerator: Send + Sync {
    fn generate(&self) -> String;

    /// Write generator state onto the table's metadata element.
    fn save_state(&self, element: &mut Element);

    /// Restore generator state from the table's metadata element.
    fn load_state(&self, element: &Element);
}

/// Stateless random UUIDs; supports string ids only.
#[derive(Debug, Default)]
pub struct UuidIdGenerator;

impl IdGenerator for UuidIdGenerator {
    fn generate(&self) -> String {
        uuid::Uuid::new_v4().to_string()
    }

    fn save_state(&self, _element: &mut Element) {}

    fn load_state(&self, _element: &Element) {}
}

/// Monotonic integer ids starting at 1.
#[derive(Debug)]
pub struct IntegerIdGenerator {
    next: AtomicI64,
}

impl IntegerIdGenerator {
    pub fn new() -> Self {
        Self {
            next: AtomicI64::new(1),
        }
    }
}

impl Default for IntegerIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl IdGenerator for IntegerIdGenerator {
    fn generate(&self) -> String {
        self.next.fetch_add(1, Ordering::SeqCst).to_string()
    }

    fn save_state(&self, element: &mut Element) {
        let max_id = self.next.load(Ordering::SeqCst) - 1;
        element
            .attributes
            .insert(MAX_ID_ATTR.to_string(), max_id.to_string());
    }

    fn load_state(&self, element: &Element) {
        // the XML layer may hand back the attribute under its local name
        let raw = element
            .attributes
            .get(MAX_ID_ATTR)
            .or_else(|| element.attributes.get("maxId"));
        if let Some(max_id) = raw.and_then(|v| v.parse::<i64>().ok()) {
            self.next.store(max_id + 1, Ordering::SeqCst);
        }
    }
}
