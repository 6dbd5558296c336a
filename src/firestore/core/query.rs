use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::fmt::{Display, Formatter};
use std::sync::Arc;

use crate::firestore::core::filter::Filter;
use crate::firestore::core::target::{Bound, Direction, OrderBy, Target};
use crate::firestore::model::{Document, DocumentComparator, DocumentKey, FieldPath, ResourcePath};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum LimitType {
    First,
    Last,
}

/// A client-side query. Compiles to a [`Target`]; `limit_to_last` queries
/// are sent with flipped ordering and cursors and reversed locally.
#[derive(Clone, Debug, PartialEq)]
pub struct Query {
    path: ResourcePath,
    collection_group: Option<String>,
    explicit_order_by: Vec<OrderBy>,
    filters: Vec<Filter>,
    limit: Option<u32>,
    limit_type: LimitType,
    start_at: Option<Bound>,
    end_at: Option<Bound>,
}

impl Query {
    pub fn new(path: ResourcePath) -> Self {
        Self {
            path,
            collection_group: None,
            explicit_order_by: Vec::new(),
            filters: Vec::new(),
            limit: None,
            limit_type: LimitType::First,
            start_at: None,
            end_at: None,
        }
    }

    /// Rebuilds a query from a target persisted by another client. The
    /// target's ordering is kept as the explicit ordering.
    pub fn from_target(target: &Target) -> Self {
        Self {
            path: target.path.clone(),
            collection_group: target.collection_group.clone(),
            explicit_order_by: target.order_by.clone(),
            filters: target.filters.clone(),
            limit: target.limit,
            limit_type: LimitType::First,
            start_at: target.start_at.clone(),
            end_at: target.end_at.clone(),
        }
    }

    /// Query over every collection named `collection_id` below `path`.
    pub fn collection_group(path: ResourcePath, collection_id: impl Into<String>) -> Self {
        Self {
            collection_group: Some(collection_id.into()),
            ..Self::new(path)
        }
    }

    pub fn path(&self) -> &ResourcePath {
        &self.path
    }

    pub fn collection_group_id(&self) -> Option<&str> {
        self.collection_group.as_deref()
    }

    pub fn filters(&self) -> &[Filter] {
        &self.filters
    }

    pub fn explicit_order_by(&self) -> &[OrderBy] {
        &self.explicit_order_by
    }

    pub fn limit(&self) -> Option<u32> {
        self.limit
    }

    pub fn limit_type(&self) -> LimitType {
        self.limit_type
    }

    pub fn start_at(&self) -> Option<&Bound> {
        self.start_at.as_ref()
    }

    pub fn end_at(&self) -> Option<&Bound> {
        self.end_at.as_ref()
    }

    pub fn with_filter(&self, filter: Filter) -> Self {
        let mut next = self.clone();
        next.filters.push(filter);
        next
    }

    pub fn with_order_by(&self, order_by: OrderBy) -> Self {
        let mut next = self.clone();
        next.explicit_order_by.push(order_by);
        next
    }

    pub fn with_limit_to_first(&self, limit: u32) -> Self {
        let mut next = self.clone();
        next.limit = Some(limit);
        next.limit_type = LimitType::First;
        next
    }

    pub fn with_limit_to_last(&self, limit: u32) -> Self {
        let mut next = self.clone();
        next.limit = Some(limit);
        next.limit_type = LimitType::Last;
        next
    }

    pub fn with_start_at(&self, bound: Bound) -> Self {
        let mut next = self.clone();
        next.start_at = Some(bound);
        next
    }

    pub fn with_end_at(&self, bound: Bound) -> Self {
        let mut next = self.clone();
        next.end_at = Some(bound);
        next
    }

    /// Same query restricted to the collection at `path`; used to expand
    /// collection-group queries.
    pub fn as_collection_query_at_path(&self, path: ResourcePath) -> Self {
        Self {
            path,
            collection_group: None,
            ..self.clone()
        }
    }

    pub fn has_limit_to_first(&self) -> bool {
        self.limit.is_some() && self.limit_type == LimitType::First
    }

    pub fn has_limit_to_last(&self) -> bool {
        self.limit.is_some() && self.limit_type == LimitType::Last
    }

    pub fn is_document_query(&self) -> bool {
        DocumentKey::is_document_key(&self.path)
            && self.collection_group.is_none()
            && self.filters.is_empty()
    }

    pub fn is_collection_group_query(&self) -> bool {
        self.collection_group.is_some()
    }

    /// True for an unfiltered, unbounded query over a whole collection.
    pub fn matches_all_documents(&self) -> bool {
        self.filters.is_empty()
            && self.limit.is_none()
            && self.start_at.is_none()
            && self.end_at.is_none()
            && (self.explicit_order_by.is_empty()
                || (self.explicit_order_by.len() == 1
                    && self.explicit_order_by[0].field().is_key_field()))
    }

    /// Fields constrained by inequality filters, in field order.
    pub fn inequality_fields(&self) -> BTreeSet<FieldPath> {
        self.filters
            .iter()
            .flat_map(Filter::flattened_field_filters)
            .filter(|filter| filter.is_inequality())
            .map(|filter| filter.field().clone())
            .collect()
    }

    /// Explicit orderings followed by the implicit ones: inequality fields
    /// not yet ordered, then the document key. Implicit orderings take the
    /// direction of the last explicit one.
    pub fn normalized_order_by(&self) -> Vec<OrderBy> {
        let mut result = self.explicit_order_by.clone();
        let mut seen: BTreeSet<FieldPath> = result.iter().map(|o| o.field().clone()).collect();
        let direction = result
            .last()
            .map(OrderBy::direction)
            .unwrap_or(Direction::Ascending);

        for field in self.inequality_fields() {
            if !field.is_key_field() && seen.insert(field.clone()) {
                result.push(OrderBy::new(field, direction));
            }
        }
        if !seen.contains(&FieldPath::document_id()) {
            result.push(OrderBy::new(FieldPath::document_id(), direction));
        }
        result
    }

    pub fn to_target(&self) -> Target {
        let order_by = self.normalized_order_by();
        match self.limit_type {
            LimitType::First => Target {
                path: self.path.clone(),
                collection_group: self.collection_group.clone(),
                order_by,
                filters: self.filters.clone(),
                limit: self.limit,
                start_at: self.start_at.clone(),
                end_at: self.end_at.clone(),
            },
            LimitType::Last => Target {
                path: self.path.clone(),
                collection_group: self.collection_group.clone(),
                order_by: order_by.iter().map(OrderBy::flipped).collect(),
                filters: self.filters.clone(),
                limit: self.limit,
                start_at: self.end_at.clone(),
                end_at: self.start_at.clone(),
            },
        }
    }

    pub fn canonical_id(&self) -> String {
        let limit_type = match self.limit_type {
            LimitType::First => "f",
            LimitType::Last => "l",
        };
        format!("{}|lt:{limit_type}", self.to_target().canonical_id())
    }

    pub fn matches(&self, doc: &Document) -> bool {
        self.matches_path(doc)
            && self.matches_order_by(doc)
            && self.filters.iter().all(|filter| filter.matches(doc))
            && self.matches_bounds(doc)
    }

    fn matches_path(&self, doc: &Document) -> bool {
        let doc_path = doc.key().path();
        if let Some(group) = &self.collection_group {
            doc.key().has_collection_id(group) && self.path.is_prefix_of(doc_path)
        } else if DocumentKey::is_document_key(&self.path) {
            &self.path == doc_path
        } else {
            self.path.is_immediate_parent_of(doc_path)
        }
    }

    fn matches_order_by(&self, doc: &Document) -> bool {
        self.explicit_order_by
            .iter()
            .all(|order| order.field().is_key_field() || doc.field(order.field()).is_some())
    }

    fn matches_bounds(&self, doc: &Document) -> bool {
        let order_by = self.normalized_order_by();
        if let Some(start) = &self.start_at {
            if !start.sorts_before_document(&order_by, doc) {
                return false;
            }
        }
        if let Some(end) = &self.end_at {
            if !end.sorts_after_document(&order_by, doc) {
                return false;
            }
        }
        true
    }

    /// Orders documents the way this query returns them.
    pub fn comparator(&self) -> DocumentComparator {
        let order_by = self.normalized_order_by();
        Arc::new(move |left: &Document, right: &Document| {
            for order in &order_by {
                let ordering = order.compare(left, right);
                if ordering != Ordering::Equal {
                    return ordering;
                }
            }
            Ordering::Equal
        })
    }
}

impl Display for Query {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Query({})", self.canonical_id())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::core::filter::FilterOperator;
    use crate::firestore::test_support::{doc, field, query};
    use crate::firestore::value::FirestoreValue;

    #[test]
    fn implicit_order_follows_inequality_then_key() {
        let q = query("rooms")
            .with_filter(Filter::field(field("age"), FilterOperator::GreaterThan, 3i64.into()).unwrap());
        let order: Vec<String> = q
            .normalized_order_by()
            .iter()
            .map(|o| o.field().canonical_string())
            .collect();
        assert_eq!(order, vec!["age", "__name__"]);
    }

    #[test]
    fn implicit_key_order_uses_last_direction() {
        let q = query("rooms").with_order_by(OrderBy::new(field("age"), Direction::Descending));
        let order = q.normalized_order_by();
        assert_eq!(order[1].direction(), Direction::Descending);
    }

    #[test]
    fn matches_only_direct_children() {
        let q = query("rooms");
        assert!(q.matches(&doc("rooms/a", 1, &[])));
        assert!(!q.matches(&doc("rooms/a/messages/b", 1, &[])));
        assert!(!q.matches(&doc("other/a", 1, &[])));
    }

    #[test]
    fn collection_group_matches_nested_collections() {
        let q = Query::collection_group(ResourcePath::root(), "messages");
        assert!(q.matches(&doc("rooms/a/messages/b", 1, &[])));
        assert!(!q.matches(&doc("rooms/a", 1, &[])));
    }

    #[test]
    fn order_by_excludes_documents_missing_field() {
        let q = query("rooms").with_order_by(OrderBy::ascending(field("sort")));
        assert!(!q.matches(&doc("rooms/a", 1, &[])));
        assert!(q.matches(&doc("rooms/b", 1, &[("sort", FirestoreValue::from_integer(1))])));
    }

    #[test]
    fn limit_to_last_flips_target() {
        let q = query("rooms")
            .with_order_by(OrderBy::ascending(field("sort")))
            .with_start_at(Bound::new(vec![1i64.into()], true))
            .with_limit_to_last(2);
        let target = q.to_target();
        assert_eq!(target.order_by[0].direction(), Direction::Descending);
        assert!(target.start_at.is_none());
        assert!(target.end_at.is_some());
        assert_ne!(q.canonical_id(), q.clone().with_limit_to_first(2).canonical_id());
    }

    #[test]
    fn comparator_sorts_by_field_then_key() {
        let q = query("rooms").with_order_by(OrderBy::ascending(field("sort")));
        let cmp = q.comparator();
        let a = doc("rooms/a", 1, &[("sort", 2i64.into())]);
        let b = doc("rooms/b", 1, &[("sort", 1i64.into())]);
        let c = doc("rooms/c", 1, &[("sort", 1i64.into())]);
        assert_eq!(cmp(&a, &b), Ordering::Greater);
        assert_eq!(cmp(&b, &c), Ordering::Less);
    }

    #[test]
    fn matches_all_documents_for_plain_collection() {
        assert!(query("rooms").matches_all_documents());
        assert!(!query("rooms").with_limit_to_first(1).matches_all_documents());
    }
}
