use std::collections::BTreeSet;

use crate::firestore::error::{internal_error, invalid_argument, FirestoreResult};
use crate::firestore::model::{
    Document, DocumentKey, FieldPath, MaybeDocument, NoDocument, SnapshotVersion, Timestamp,
    UnknownDocument,
};
use crate::firestore::value::server_timestamp::server_timestamp_value;
use crate::firestore::value::{values_equal, FirestoreValue, MapValue, ValueKind};

/// Condition a document must meet for a mutation to apply.
#[derive(Clone, Debug, PartialEq, Default)]
pub enum Precondition {
    #[default]
    None,
    Exists(bool),
    UpdateTime(SnapshotVersion),
}

impl Precondition {
    pub fn is_none(&self) -> bool {
        matches!(self, Precondition::None)
    }

    pub fn is_valid_for(&self, maybe_doc: Option<&MaybeDocument>) -> bool {
        match self {
            Precondition::None => true,
            Precondition::UpdateTime(version) => matches!(
                maybe_doc,
                Some(MaybeDocument::Document(doc)) if doc.version() == *version
            ),
            Precondition::Exists(true) => matches!(maybe_doc, Some(MaybeDocument::Document(_))),
            Precondition::Exists(false) => {
                matches!(maybe_doc, None | Some(MaybeDocument::NoDocument(_)))
            }
        }
    }
}

/// The set of field paths a patch touches.
#[derive(Clone, Debug, PartialEq, Default)]
pub struct FieldMask {
    fields: BTreeSet<FieldPath>,
}

impl FieldMask {
    pub fn new(fields: impl IntoIterator<Item = FieldPath>) -> Self {
        Self {
            fields: fields.into_iter().collect(),
        }
    }

    pub fn fields(&self) -> impl Iterator<Item = &FieldPath> + '_ {
        self.fields.iter()
    }

    pub fn covers(&self, path: &FieldPath) -> bool {
        self.fields.iter().any(|field| field.is_prefix_of(path))
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum TransformOperation {
    ServerTimestamp,
    ArrayUnion(Vec<FirestoreValue>),
    ArrayRemove(Vec<FirestoreValue>),
    NumericIncrement(FirestoreValue),
}

impl TransformOperation {
    /// Value the field takes in the latency-compensated view.
    pub fn apply_to_local_view(
        &self,
        previous: Option<&FirestoreValue>,
        local_write_time: Timestamp,
    ) -> FirestoreValue {
        match self {
            TransformOperation::ServerTimestamp => {
                server_timestamp_value(local_write_time, previous.cloned())
            }
            TransformOperation::ArrayUnion(elements) => array_union(previous, elements),
            TransformOperation::ArrayRemove(elements) => array_remove(previous, elements),
            TransformOperation::NumericIncrement(operand) => {
                numeric_increment(self.compute_base_value(previous), operand)
            }
        }
    }

    /// Value the field takes once the backend acknowledged the write.
    pub fn apply_to_remote_document(
        &self,
        previous: Option<&FirestoreValue>,
        transform_result: Option<FirestoreValue>,
    ) -> FirestoreValue {
        match self {
            TransformOperation::ArrayUnion(elements) => array_union(previous, elements),
            TransformOperation::ArrayRemove(elements) => array_remove(previous, elements),
            TransformOperation::ServerTimestamp | TransformOperation::NumericIncrement(_) => {
                transform_result.unwrap_or_else(FirestoreValue::null)
            }
        }
    }

    /// Base value an idempotent replay of this transform starts from, if the
    /// transform is not idempotent on its own.
    pub fn compute_base_value(&self, previous: Option<&FirestoreValue>) -> Option<FirestoreValue> {
        match self {
            TransformOperation::NumericIncrement(_) => match previous {
                Some(value) if value.is_number() => Some(value.clone()),
                _ => Some(FirestoreValue::from_integer(0)),
            },
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct FieldTransform {
    field: FieldPath,
    operation: TransformOperation,
}

impl FieldTransform {
    pub fn new(field: FieldPath, operation: TransformOperation) -> Self {
        Self { field, operation }
    }

    pub fn field(&self) -> &FieldPath {
        &self.field
    }

    pub fn operation(&self) -> &TransformOperation {
        &self.operation
    }
}

/// Outcome of a single write as reported by the backend.
#[derive(Clone, Debug, PartialEq)]
pub struct MutationResult {
    pub version: SnapshotVersion,
    pub transform_results: Option<Vec<FirestoreValue>>,
}

impl MutationResult {
    pub fn new(version: SnapshotVersion, transform_results: Option<Vec<FirestoreValue>>) -> Self {
        Self {
            version,
            transform_results,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Mutation {
    Set {
        key: DocumentKey,
        value: MapValue,
        precondition: Precondition,
    },
    Patch {
        key: DocumentKey,
        data: MapValue,
        field_mask: FieldMask,
        precondition: Precondition,
    },
    Transform {
        key: DocumentKey,
        field_transforms: Vec<FieldTransform>,
    },
    Delete {
        key: DocumentKey,
        precondition: Precondition,
    },
    Verify {
        key: DocumentKey,
        precondition: Precondition,
    },
}

impl Mutation {
    pub fn set(key: DocumentKey, value: MapValue) -> Self {
        Mutation::Set {
            key,
            value,
            precondition: Precondition::None,
        }
    }

    /// A patch over every leaf of `data`, requiring the document to exist.
    pub fn patch(key: DocumentKey, data: MapValue) -> Self {
        let field_mask = FieldMask::new(data.leaf_paths());
        Mutation::Patch {
            key,
            data,
            field_mask,
            precondition: Precondition::Exists(true),
        }
    }

    pub fn delete(key: DocumentKey) -> Self {
        Mutation::Delete {
            key,
            precondition: Precondition::None,
        }
    }

    pub fn transform(key: DocumentKey, field_transforms: Vec<FieldTransform>) -> Self {
        Mutation::Transform {
            key,
            field_transforms,
        }
    }

    pub fn key(&self) -> &DocumentKey {
        match self {
            Mutation::Set { key, .. }
            | Mutation::Patch { key, .. }
            | Mutation::Transform { key, .. }
            | Mutation::Delete { key, .. }
            | Mutation::Verify { key, .. } => key,
        }
    }

    pub fn precondition(&self) -> Precondition {
        match self {
            Mutation::Set { precondition, .. }
            | Mutation::Patch { precondition, .. }
            | Mutation::Delete { precondition, .. }
            | Mutation::Verify { precondition, .. } => precondition.clone(),
            // Transforms only make sense on a document that exists.
            Mutation::Transform { .. } => Precondition::Exists(true),
        }
    }

    pub fn field_transforms(&self) -> &[FieldTransform] {
        match self {
            Mutation::Transform {
                field_transforms, ..
            } => field_transforms,
            _ => &[],
        }
    }

    /// Fields a patch writes; `None` for writes that replace or remove the
    /// whole document.
    pub fn field_mask(&self) -> Option<&FieldMask> {
        match self {
            Mutation::Patch { field_mask, .. } => Some(field_mask),
            _ => None,
        }
    }

    pub fn verify(key: DocumentKey, precondition: Precondition) -> Self {
        Mutation::Verify { key, precondition }
    }

    /// Same write guarded by `precondition`. Transforms keep their implicit
    /// existence check.
    pub fn with_precondition(self, precondition: Precondition) -> Self {
        match self {
            Mutation::Set { key, value, .. } => Mutation::Set {
                key,
                value,
                precondition,
            },
            Mutation::Patch {
                key,
                data,
                field_mask,
                ..
            } => Mutation::Patch {
                key,
                data,
                field_mask,
                precondition,
            },
            Mutation::Delete { key, .. } => Mutation::Delete { key, precondition },
            Mutation::Verify { key, .. } => Mutation::Verify { key, precondition },
            transform @ Mutation::Transform { .. } => transform,
        }
    }

    /// Applies the mutation to the last known remote state once the backend
    /// acknowledged it with `result`.
    pub fn apply_to_remote_document(
        &self,
        maybe_doc: Option<MaybeDocument>,
        result: &MutationResult,
    ) -> FirestoreResult<MaybeDocument> {
        let key = self.key().clone();
        match self {
            Mutation::Set { value, .. } => Ok(Document::new(key, result.version, value.clone())
                .with_committed_mutations()
                .into()),
            Mutation::Patch {
                data,
                field_mask,
                precondition,
                ..
            } => {
                if !precondition.is_valid_for(maybe_doc.as_ref()) {
                    // The patch was acknowledged but we never saw the base document.
                    return Ok(UnknownDocument::new(key, result.version).into());
                }
                let patched = patch_document(maybe_doc.as_ref(), data, field_mask);
                Ok(Document::new(key, result.version, patched)
                    .with_committed_mutations()
                    .into())
            }
            Mutation::Transform {
                field_transforms, ..
            } => {
                if !self.precondition().is_valid_for(maybe_doc.as_ref()) {
                    return Ok(UnknownDocument::new(key, result.version).into());
                }
                let doc = require_document(maybe_doc, &key)?;
                let server_results = result.transform_results.as_ref().ok_or_else(|| {
                    internal_error("Transform results missing for a transform mutation")
                })?;
                if server_results.len() != field_transforms.len() {
                    return Err(internal_error(format!(
                        "Server transform count ({}) does not match field transform count ({})",
                        server_results.len(),
                        field_transforms.len()
                    )));
                }
                let values = field_transforms
                    .iter()
                    .zip(server_results.iter())
                    .map(|(transform, server_value)| {
                        transform.operation().apply_to_remote_document(
                            doc.field(transform.field()),
                            Some(server_value.clone()),
                        )
                    })
                    .collect::<Vec<_>>();
                let data = transform_object(doc.data(), field_transforms, values);
                Ok(Document::new(key, result.version, data)
                    .with_committed_mutations()
                    .into())
            }
            Mutation::Delete { .. } => Ok(NoDocument::new(key, result.version)
                .with_committed_mutations()
                .into()),
            Mutation::Verify { .. } => Err(internal_error(
                "Verify mutations are only used by transactions",
            )),
        }
    }

    /// Applies the mutation to the latency-compensated view. `base_doc` is the
    /// document before the enclosing batch was applied. Returns the input
    /// unchanged when the precondition fails.
    pub fn apply_to_local_view(
        &self,
        maybe_doc: Option<MaybeDocument>,
        base_doc: Option<&MaybeDocument>,
        local_write_time: Timestamp,
    ) -> Option<MaybeDocument> {
        if !self.precondition().is_valid_for(maybe_doc.as_ref()) {
            return maybe_doc;
        }
        let key = self.key().clone();
        match self {
            Mutation::Set { value, .. } => {
                let version = post_mutation_version(maybe_doc.as_ref());
                Some(
                    Document::new(key, version, value.clone())
                        .with_local_mutations()
                        .into(),
                )
            }
            Mutation::Patch {
                data, field_mask, ..
            } => {
                let version = post_mutation_version(maybe_doc.as_ref());
                let patched = patch_document(maybe_doc.as_ref(), data, field_mask);
                Some(Document::new(key, version, patched).with_local_mutations().into())
            }
            Mutation::Transform {
                field_transforms, ..
            } => {
                let doc = maybe_doc.as_ref().and_then(MaybeDocument::as_document)?;
                let base = base_doc.and_then(MaybeDocument::as_document);
                let values = field_transforms
                    .iter()
                    .map(|transform| {
                        // Fall back to the pre-batch value when an earlier patch in
                        // the batch cleared the field.
                        let previous = doc
                            .field(transform.field())
                            .or_else(|| base.and_then(|b| b.field(transform.field())));
                        transform
                            .operation()
                            .apply_to_local_view(previous, local_write_time)
                    })
                    .collect::<Vec<_>>();
                let data = transform_object(doc.data(), field_transforms, values);
                Some(
                    Document::new(key, doc.version(), data)
                        .with_local_mutations()
                        .into(),
                )
            }
            Mutation::Delete { .. } => {
                Some(NoDocument::new(key, SnapshotVersion::min()).into())
            }
            Mutation::Verify { .. } => maybe_doc,
        }
    }

    /// For non-idempotent transforms, captures the values they start from so
    /// that the write can be replayed against a changed base document.
    pub fn extract_base_value(&self, maybe_doc: Option<&MaybeDocument>) -> Option<MapValue> {
        let Mutation::Transform {
            field_transforms, ..
        } = self
        else {
            return None;
        };
        let doc = maybe_doc.and_then(MaybeDocument::as_document);
        let mut base = MapValue::empty();
        for transform in field_transforms {
            let existing = doc.and_then(|doc| doc.field(transform.field()));
            if let Some(value) = transform.operation().compute_base_value(existing) {
                base.set_field(transform.field(), value);
            }
        }
        if base.is_empty() {
            None
        } else {
            Some(base)
        }
    }
}

fn require_document(maybe_doc: Option<MaybeDocument>, key: &DocumentKey) -> FirestoreResult<Document> {
    maybe_doc
        .and_then(MaybeDocument::into_document)
        .ok_or_else(|| internal_error(format!("Expected a document for key {key}")))
}

fn post_mutation_version(maybe_doc: Option<&MaybeDocument>) -> SnapshotVersion {
    match maybe_doc {
        Some(MaybeDocument::Document(doc)) => doc.version(),
        _ => SnapshotVersion::min(),
    }
}

fn patch_document(maybe_doc: Option<&MaybeDocument>, data: &MapValue, mask: &FieldMask) -> MapValue {
    let mut base = maybe_doc
        .and_then(MaybeDocument::as_document)
        .map(|doc| doc.data().clone())
        .unwrap_or_default();
    let updates = mask
        .fields()
        .filter(|path| !path.is_empty())
        .map(|path| (path.clone(), data.field(path).cloned()))
        .collect::<Vec<_>>();
    base.set_all(updates);
    base
}

fn transform_object(
    data: &MapValue,
    transforms: &[FieldTransform],
    values: Vec<FirestoreValue>,
) -> MapValue {
    let mut result = data.clone();
    for (transform, value) in transforms.iter().zip(values) {
        result.set_field(transform.field(), value);
    }
    result
}

fn existing_elements(previous: Option<&FirestoreValue>) -> Vec<FirestoreValue> {
    match previous.map(FirestoreValue::kind) {
        Some(ValueKind::Array(array)) => array.values().to_vec(),
        _ => Vec::new(),
    }
}

fn array_union(previous: Option<&FirestoreValue>, additions: &[FirestoreValue]) -> FirestoreValue {
    let mut values = existing_elements(previous);
    for element in additions {
        if !values.iter().any(|candidate| values_equal(candidate, element)) {
            values.push(element.clone());
        }
    }
    FirestoreValue::from_array(values)
}

fn array_remove(previous: Option<&FirestoreValue>, removals: &[FirestoreValue]) -> FirestoreValue {
    let values = existing_elements(previous)
        .into_iter()
        .filter(|candidate| !removals.iter().any(|needle| values_equal(needle, candidate)))
        .collect();
    FirestoreValue::from_array(values)
}

fn numeric_increment(base: Option<FirestoreValue>, operand: &FirestoreValue) -> FirestoreValue {
    let base = base.unwrap_or_else(|| FirestoreValue::from_integer(0));
    match (base.kind(), operand.kind()) {
        (ValueKind::Integer(current), ValueKind::Integer(delta)) => {
            FirestoreValue::from_integer(current.saturating_add(*delta))
        }
        _ => {
            let current = base.as_double().unwrap_or(0.0);
            let delta = operand.as_double().unwrap_or(0.0);
            FirestoreValue::from_double(current + delta)
        }
    }
}

/// Validates an increment operand before it is queued.
pub fn validate_increment_operand(operand: &FirestoreValue) -> FirestoreResult<()> {
    if operand.is_number() {
        Ok(())
    } else {
        Err(invalid_argument("increment() requires a numeric operand"))
    }
}
