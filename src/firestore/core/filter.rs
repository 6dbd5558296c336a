use std::cmp::Ordering;
use std::fmt::{Display, Formatter};

use crate::firestore::error::{invalid_argument, FirestoreResult};
use crate::firestore::model::{Document, DocumentKey, FieldPath};
use crate::firestore::value::{canonical_id, compare_values, type_order, values_equal, FirestoreValue, ValueKind};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FilterOperator {
    LessThan,
    LessThanOrEqual,
    Equal,
    NotEqual,
    GreaterThanOrEqual,
    GreaterThan,
    ArrayContains,
    ArrayContainsAny,
    In,
    NotIn,
}

impl FilterOperator {
    pub fn as_str(&self) -> &'static str {
        match self {
            FilterOperator::LessThan => "<",
            FilterOperator::LessThanOrEqual => "<=",
            FilterOperator::Equal => "==",
            FilterOperator::NotEqual => "!=",
            FilterOperator::GreaterThanOrEqual => ">=",
            FilterOperator::GreaterThan => ">",
            FilterOperator::ArrayContains => "array-contains",
            FilterOperator::ArrayContainsAny => "array-contains-any",
            FilterOperator::In => "in",
            FilterOperator::NotIn => "not-in",
        }
    }

    pub fn parse(op: &str) -> Option<Self> {
        Some(match op {
            "<" => FilterOperator::LessThan,
            "<=" => FilterOperator::LessThanOrEqual,
            "==" => FilterOperator::Equal,
            "!=" => FilterOperator::NotEqual,
            ">=" => FilterOperator::GreaterThanOrEqual,
            ">" => FilterOperator::GreaterThan,
            "array-contains" => FilterOperator::ArrayContains,
            "array-contains-any" => FilterOperator::ArrayContainsAny,
            "in" => FilterOperator::In,
            "not-in" => FilterOperator::NotIn,
            _ => return None,
        })
    }

    pub fn is_inequality(&self) -> bool {
        matches!(
            self,
            FilterOperator::LessThan
                | FilterOperator::LessThanOrEqual
                | FilterOperator::GreaterThan
                | FilterOperator::GreaterThanOrEqual
                | FilterOperator::NotEqual
                | FilterOperator::NotIn
        )
    }

    fn takes_array(&self) -> bool {
        matches!(
            self,
            FilterOperator::In | FilterOperator::NotIn | FilterOperator::ArrayContainsAny
        )
    }

    fn matches_comparison(&self, comparison: Ordering) -> bool {
        match self {
            FilterOperator::LessThan => comparison == Ordering::Less,
            FilterOperator::LessThanOrEqual => comparison != Ordering::Greater,
            FilterOperator::Equal => comparison == Ordering::Equal,
            FilterOperator::NotEqual => comparison != Ordering::Equal,
            FilterOperator::GreaterThan => comparison == Ordering::Greater,
            FilterOperator::GreaterThanOrEqual => comparison != Ordering::Less,
            _ => false,
        }
    }
}

impl Display for FilterOperator {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A predicate on a single field. Filters on `__name__` compare document keys
/// against reference values.
#[derive(Clone, Debug, PartialEq)]
pub struct FieldFilter {
    field: FieldPath,
    op: FilterOperator,
    value: FirestoreValue,
}

impl FieldFilter {
    pub fn new(field: FieldPath, op: FilterOperator, value: FirestoreValue) -> FirestoreResult<Self> {
        if op.takes_array() && value.as_array().is_none() {
            return Err(invalid_argument(format!(
                "Invalid query. A non-empty array is required for '{op}' filters."
            )));
        }
        if field.is_key_field() {
            if matches!(op, FilterOperator::ArrayContains | FilterOperator::ArrayContainsAny) {
                return Err(invalid_argument(format!(
                    "Invalid query. You can't perform '{op}' queries on document id."
                )));
            }
            let all_references = match value.as_array() {
                Some(array) if op.takes_array() => {
                    array.values().iter().all(|v| reference_key(v).is_some())
                }
                _ => reference_key(&value).is_some(),
            };
            if !all_references {
                return Err(invalid_argument(
                    "Invalid query. Document id filters require document references.",
                ));
            }
        } else if (value.is_null() || value.is_nan())
            && !matches!(op, FilterOperator::Equal | FilterOperator::NotEqual)
        {
            return Err(invalid_argument(
                "Invalid query. Null and NaN only support '==' and '!=' comparisons.",
            ));
        }
        Ok(Self { field, op, value })
    }

    pub fn field(&self) -> &FieldPath {
        &self.field
    }

    pub fn op(&self) -> FilterOperator {
        self.op
    }

    pub fn value(&self) -> &FirestoreValue {
        &self.value
    }

    pub fn is_inequality(&self) -> bool {
        self.op.is_inequality()
    }

    pub fn matches(&self, doc: &Document) -> bool {
        if self.field.is_key_field() {
            return self.matches_key(doc.key());
        }
        let other = doc.field(&self.field);
        match self.op {
            FilterOperator::ArrayContains => other
                .and_then(FirestoreValue::as_array)
                .map(|array| array.values().iter().any(|v| values_equal(v, &self.value)))
                .unwrap_or(false),
            FilterOperator::ArrayContainsAny => match (other.and_then(FirestoreValue::as_array), self.value.as_array()) {
                (Some(array), Some(needles)) => needles
                    .values()
                    .iter()
                    .any(|needle| array.values().iter().any(|v| values_equal(v, needle))),
                _ => false,
            },
            FilterOperator::In => match (other, self.value.as_array()) {
                (Some(other), Some(candidates)) => {
                    candidates.values().iter().any(|v| values_equal(v, other))
                }
                _ => false,
            },
            FilterOperator::NotIn => {
                let Some(candidates) = self.value.as_array() else {
                    return false;
                };
                if candidates.values().iter().any(FirestoreValue::is_null) {
                    return false;
                }
                match other {
                    Some(other) if !other.is_null() => {
                        !candidates.values().iter().any(|v| values_equal(v, other))
                    }
                    _ => false,
                }
            }
            FilterOperator::NotEqual => match other {
                Some(other) if !other.is_null() => {
                    self.op.matches_comparison(compare_values(other, &self.value))
                }
                _ => false,
            },
            _ => match other {
                Some(other) if type_order(other) == type_order(&self.value) => {
                    self.op.matches_comparison(compare_values(other, &self.value))
                }
                _ => false,
            },
        }
    }

    fn matches_key(&self, key: &DocumentKey) -> bool {
        match self.op {
            FilterOperator::In | FilterOperator::NotIn => {
                let contained = self
                    .value
                    .as_array()
                    .map(|array| {
                        array
                            .values()
                            .iter()
                            .filter_map(reference_key)
                            .any(|candidate| &candidate == key)
                    })
                    .unwrap_or(false);
                (self.op == FilterOperator::In) == contained
            }
            _ => match reference_key(&self.value) {
                Some(reference) => self.op.matches_comparison(key.cmp(&reference)),
                None => false,
            },
        }
    }

    pub fn canonical_id(&self) -> String {
        format!(
            "{}{}{}",
            self.field.canonical_string(),
            self.op.as_str(),
            canonical_id(&self.value)
        )
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CompositeOperator {
    And,
    Or,
}

#[derive(Clone, Debug, PartialEq)]
pub struct CompositeFilter {
    op: CompositeOperator,
    filters: Vec<Filter>,
}

impl CompositeFilter {
    pub fn new(op: CompositeOperator, filters: Vec<Filter>) -> Self {
        Self { op, filters }
    }

    pub fn op(&self) -> CompositeOperator {
        self.op
    }

    pub fn filters(&self) -> &[Filter] {
        &self.filters
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Filter {
    Field(FieldFilter),
    Composite(CompositeFilter),
}

impl Filter {
    pub fn field(field: FieldPath, op: FilterOperator, value: FirestoreValue) -> FirestoreResult<Self> {
        FieldFilter::new(field, op, value).map(Filter::Field)
    }

    pub fn and(filters: Vec<Filter>) -> Self {
        Filter::Composite(CompositeFilter::new(CompositeOperator::And, filters))
    }

    pub fn or(filters: Vec<Filter>) -> Self {
        Filter::Composite(CompositeFilter::new(CompositeOperator::Or, filters))
    }

    pub fn matches(&self, doc: &Document) -> bool {
        match self {
            Filter::Field(filter) => filter.matches(doc),
            Filter::Composite(composite) => match composite.op {
                // An empty AND matches everything, an empty OR nothing.
                CompositeOperator::And => composite.filters.iter().all(|f| f.matches(doc)),
                CompositeOperator::Or => composite.filters.iter().any(|f| f.matches(doc)),
            },
        }
    }

    pub fn flattened_field_filters(&self) -> Vec<&FieldFilter> {
        match self {
            Filter::Field(filter) => vec![filter],
            Filter::Composite(composite) => composite
                .filters
                .iter()
                .flat_map(Filter::flattened_field_filters)
                .collect(),
        }
    }

    pub fn canonical_id(&self) -> String {
        match self {
            Filter::Field(filter) => filter.canonical_id(),
            Filter::Composite(composite) => {
                let inner: Vec<String> = composite.filters.iter().map(Filter::canonical_id).collect();
                let name = match composite.op {
                    CompositeOperator::And => "and",
                    CompositeOperator::Or => "or",
                };
                format!("{name}({})", inner.join(","))
            }
        }
    }
}

impl From<FieldFilter> for Filter {
    fn from(filter: FieldFilter) -> Self {
        Filter::Field(filter)
    }
}

/// Resolves a reference value (`projects/p/databases/d/documents/a/b` or a
/// bare `a/b`) to a document key.
pub fn reference_key(value: &FirestoreValue) -> Option<DocumentKey> {
    let ValueKind::Reference(reference) = value.kind() else {
        return None;
    };
    let path = match reference.find("/documents/") {
        Some(index) => &reference[index + "/documents/".len()..],
        None => reference.as_str(),
    };
    DocumentKey::from_string(path).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::test_support::{doc, field};

    #[test]
    fn comparison_requires_same_type() {
        let filter = FieldFilter::new(field("n"), FilterOperator::GreaterThan, FirestoreValue::from_integer(1)).unwrap();
        assert!(filter.matches(&doc("c/a", 1, &[("n", FirestoreValue::from_double(1.5))])));
        assert!(!filter.matches(&doc("c/b", 1, &[("n", FirestoreValue::from_string("2"))])));
        assert!(!filter.matches(&doc("c/c", 1, &[])));
    }

    #[test]
    fn not_equal_skips_missing_and_null() {
        let filter = FieldFilter::new(field("n"), FilterOperator::NotEqual, FirestoreValue::from_integer(1)).unwrap();
        assert!(filter.matches(&doc("c/a", 1, &[("n", FirestoreValue::from_integer(2))])));
        assert!(filter.matches(&doc("c/a", 1, &[("n", FirestoreValue::from_string("x"))])));
        assert!(!filter.matches(&doc("c/b", 1, &[("n", FirestoreValue::null())])));
        assert!(!filter.matches(&doc("c/c", 1, &[])));
    }

    #[test]
    fn array_and_membership_operators() {
        let tags = FirestoreValue::from_array(vec!["a".into(), "b".into()]);
        let d = doc("c/a", 1, &[("tags", tags), ("n", FirestoreValue::from_integer(3))]);

        let contains = FieldFilter::new(field("tags"), FilterOperator::ArrayContains, "b".into()).unwrap();
        assert!(contains.matches(&d));
        let any = FieldFilter::new(
            field("tags"),
            FilterOperator::ArrayContainsAny,
            FirestoreValue::from_array(vec!["z".into(), "a".into()]),
        )
        .unwrap();
        assert!(any.matches(&d));
        let in_filter = FieldFilter::new(
            field("n"),
            FilterOperator::In,
            FirestoreValue::from_array(vec![FirestoreValue::from_integer(3)]),
        )
        .unwrap();
        assert!(in_filter.matches(&d));
        let not_in = FieldFilter::new(
            field("n"),
            FilterOperator::NotIn,
            FirestoreValue::from_array(vec![FirestoreValue::from_integer(4)]),
        )
        .unwrap();
        assert!(not_in.matches(&d));
    }

    #[test]
    fn key_filters_compare_references() {
        let d = doc("c/b", 1, &[]);
        let gt = FieldFilter::new(
            FieldPath::document_id(),
            FilterOperator::GreaterThan,
            FirestoreValue::from_reference("projects/p/databases/(default)/documents/c/a"),
        )
        .unwrap();
        assert!(gt.matches(&d));
        let in_filter = FieldFilter::new(
            FieldPath::document_id(),
            FilterOperator::In,
            FirestoreValue::from_array(vec![FirestoreValue::from_reference("c/b")]),
        )
        .unwrap();
        assert!(in_filter.matches(&d));
    }

    #[test]
    fn rejects_invalid_filters() {
        assert!(FieldFilter::new(field("n"), FilterOperator::LessThan, FirestoreValue::null()).is_err());
        assert!(FieldFilter::new(field("n"), FilterOperator::In, FirestoreValue::from_integer(1)).is_err());
        assert!(FieldFilter::new(
            FieldPath::document_id(),
            FilterOperator::ArrayContains,
            FirestoreValue::from_reference("c/a")
        )
        .is_err());
    }

    #[test]
    fn composite_filters_combine() {
        let a = Filter::field(field("a"), FilterOperator::Equal, 1i64.into()).unwrap();
        let b = Filter::field(field("b"), FilterOperator::Equal, 2i64.into()).unwrap();
        let or = Filter::or(vec![a.clone(), b.clone()]);
        let and = Filter::and(vec![a, b]);
        let d = doc("c/a", 1, &[("a", FirestoreValue::from_integer(1))]);
        assert!(or.matches(&d));
        assert!(!and.matches(&d));
        assert_eq!(or.flattened_field_filters().len(), 2);
        assert_eq!(or.canonical_id(), "or(a==1,b==2)");
    }
}
