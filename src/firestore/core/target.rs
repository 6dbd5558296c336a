use std::cmp::Ordering;

use crate::firestore::core::filter::{reference_key, Filter};
use crate::firestore::model::{Document, DocumentKey, FieldPath, ResourcePath};
use crate::firestore::value::{canonical_id, compare_values, FirestoreValue};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Direction {
    Ascending,
    Descending,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Ascending => "asc",
            Direction::Descending => "desc",
        }
    }

    pub fn flipped(&self) -> Self {
        match self {
            Direction::Ascending => Direction::Descending,
            Direction::Descending => Direction::Ascending,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct OrderBy {
    field: FieldPath,
    direction: Direction,
}

impl OrderBy {
    pub fn new(field: FieldPath, direction: Direction) -> Self {
        Self { field, direction }
    }

    pub fn ascending(field: FieldPath) -> Self {
        Self::new(field, Direction::Ascending)
    }

    pub fn field(&self) -> &FieldPath {
        &self.field
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn flipped(&self) -> Self {
        Self::new(self.field.clone(), self.direction.flipped())
    }

    /// Compares two documents on this ordering only. Documents missing the
    /// field are never compared; queries drop them before sorting.
    pub fn compare(&self, left: &Document, right: &Document) -> Ordering {
        let ordering = if self.field.is_key_field() {
            left.key().cmp(right.key())
        } else {
            match (left.field(&self.field), right.field(&self.field)) {
                (Some(l), Some(r)) => compare_values(l, r),
                (Some(_), None) => Ordering::Greater,
                (None, Some(_)) => Ordering::Less,
                (None, None) => Ordering::Equal,
            }
        };
        match self.direction {
            Direction::Ascending => ordering,
            Direction::Descending => ordering.reverse(),
        }
    }

    fn canonical_id(&self) -> String {
        format!("{}{}", self.field.canonical_string(), self.direction.as_str())
    }
}

/// A query cursor: positional values matched against the query's order-by
/// fields.
#[derive(Clone, Debug, PartialEq)]
pub struct Bound {
    position: Vec<FirestoreValue>,
    inclusive: bool,
}

impl Bound {
    pub fn new(position: Vec<FirestoreValue>, inclusive: bool) -> Self {
        Self {
            position,
            inclusive,
        }
    }

    pub fn position(&self) -> &[FirestoreValue] {
        &self.position
    }

    pub fn inclusive(&self) -> bool {
        self.inclusive
    }

    fn compare_to_document(&self, order_by: &[OrderBy], doc: &Document) -> Ordering {
        for (order, bound_value) in order_by.iter().zip(self.position.iter()) {
            let ordering = if order.field.is_key_field() {
                match reference_key(bound_value) {
                    Some(key) => key.cmp(doc.key()),
                    None => Ordering::Equal,
                }
            } else {
                match doc.field(&order.field) {
                    Some(value) => compare_values(bound_value, value),
                    None => Ordering::Equal,
                }
            };
            let ordering = match order.direction {
                Direction::Ascending => ordering,
                Direction::Descending => ordering.reverse(),
            };
            if ordering != Ordering::Equal {
                return ordering;
            }
        }
        Ordering::Equal
    }

    /// True when a start cursor admits `doc`.
    pub fn sorts_before_document(&self, order_by: &[OrderBy], doc: &Document) -> bool {
        let comparison = self.compare_to_document(order_by, doc);
        if self.inclusive {
            comparison != Ordering::Greater
        } else {
            comparison == Ordering::Less
        }
    }

    /// True when an end cursor admits `doc`.
    pub fn sorts_after_document(&self, order_by: &[OrderBy], doc: &Document) -> bool {
        let comparison = self.compare_to_document(order_by, doc);
        if self.inclusive {
            comparison != Ordering::Less
        } else {
            comparison == Ordering::Greater
        }
    }

    fn canonical_id(&self) -> String {
        let values: Vec<String> = self.position.iter().map(canonical_id).collect();
        format!("{}{}", if self.inclusive { "b:" } else { "a:" }, values.join(","))
    }
}

/// What the backend is asked to watch. Two targets with equal canonical ids
/// share one listen on the watch stream.
#[derive(Clone, Debug, PartialEq)]
pub struct Target {
    pub path: ResourcePath,
    pub collection_group: Option<String>,
    pub order_by: Vec<OrderBy>,
    pub filters: Vec<Filter>,
    pub limit: Option<u32>,
    pub start_at: Option<Bound>,
    pub end_at: Option<Bound>,
}

impl Target {
    pub fn for_path(path: ResourcePath) -> Self {
        Self {
            path,
            collection_group: None,
            order_by: Vec::new(),
            filters: Vec::new(),
            limit: None,
            start_at: None,
            end_at: None,
        }
    }

    /// Single-document target, as used for limbo resolution.
    pub fn for_document(key: &DocumentKey) -> Self {
        Self::for_path(key.path().clone())
    }

    pub fn is_document_target(&self) -> bool {
        DocumentKey::is_document_key(&self.path)
            && self.collection_group.is_none()
            && self.filters.is_empty()
    }

    pub fn canonical_id(&self) -> String {
        let mut id = self.path.canonical_string();
        if let Some(group) = &self.collection_group {
            id.push_str("|cg:");
            id.push_str(group);
        }
        id.push_str("|f:");
        for filter in &self.filters {
            id.push_str(&filter.canonical_id());
        }
        id.push_str("|ob:");
        for order in &self.order_by {
            id.push_str(&order.canonical_id());
        }
        if let Some(limit) = self.limit {
            id.push_str(&format!("|l:{limit}"));
        }
        if let Some(bound) = &self.start_at {
            id.push_str("|lb:");
            id.push_str(&bound.canonical_id());
        }
        if let Some(bound) = &self.end_at {
            id.push_str("|ub:");
            id.push_str(&bound.canonical_id());
        }
        id
    }
}
