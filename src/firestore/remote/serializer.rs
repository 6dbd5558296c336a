use std::collections::BTreeMap;
use std::str::FromStr;

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use serde_json::{json, Map as JsonMap, Value as JsonValue};

use crate::firestore::core::filter::{CompositeOperator, FieldFilter, Filter, FilterOperator};
use crate::firestore::core::target::{Bound, Direction, OrderBy, Target};
use crate::firestore::core::types::TargetId;
use crate::firestore::error::{invalid_argument, FirestoreResult};
use crate::firestore::local::target_data::{TargetData, TargetPurpose};
use crate::firestore::model::{
    DatabaseId, Document, DocumentKey, FieldMask, FieldPath, FieldTransform, GeoPoint,
    MaybeDocument, Mutation, MutationResult, NoDocument, Precondition, ResourcePath,
    SnapshotVersion, Timestamp, TransformOperation,
};
use crate::firestore::value::{BytesValue, FirestoreValue, MapValue, ValueKind};

/// Decoded write-stream response.
#[derive(Clone, Debug, PartialEq)]
pub struct WriteResponse {
    pub stream_token: Vec<u8>,
    pub commit_version: SnapshotVersion,
    pub write_results: Vec<MutationResult>,
}

/// Converts between the model and the JSON form of the Firestore protos.
#[derive(Clone, Debug)]
pub struct JsonProtoSerializer {
    database_id: DatabaseId,
}

impl JsonProtoSerializer {
    pub fn new(database_id: DatabaseId) -> Self {
        Self { database_id }
    }

    pub fn database_id(&self) -> &DatabaseId {
        &self.database_id
    }

    pub fn database_name(&self) -> String {
        format!(
            "projects/{}/databases/{}",
            self.database_id.project_id(),
            self.database_id.database()
        )
    }

    pub fn document_name(&self, key: &DocumentKey) -> String {
        self.resource_name(key.path())
    }

    fn resource_name(&self, path: &ResourcePath) -> String {
        if path.is_empty() {
            format!("{}/documents", self.database_name())
        } else {
            format!(
                "{}/documents/{}",
                self.database_name(),
                path.canonical_string()
            )
        }
    }

    /// Path below `.../documents` for a fully qualified resource name.
    fn decode_resource_path(&self, name: &str) -> FirestoreResult<ResourcePath> {
        let prefix = format!("{}/documents", self.database_name());
        let Some(rest) = name.strip_prefix(&prefix) else {
            return Err(invalid_argument(format!(
                "Tried to deserialize '{name}' from a different database than {}",
                self.database_name()
            )));
        };
        if rest.is_empty() {
            return Ok(ResourcePath::root());
        }
        let rest = rest
            .strip_prefix('/')
            .ok_or_else(|| invalid_argument(format!("Invalid resource name '{name}'")))?;
        ResourcePath::from_string(rest)
    }

    pub fn document_key_from_name(&self, name: &str) -> FirestoreResult<DocumentKey> {
        DocumentKey::from_path(self.decode_resource_path(name)?)
    }

    pub fn encode_value(&self, value: &FirestoreValue) -> JsonValue {
        encode_value(value)
    }

    pub fn decode_value(&self, value: &JsonValue) -> FirestoreResult<FirestoreValue> {
        decode_value(value)
    }

    pub fn encode_fields(&self, map: &MapValue) -> JsonValue {
        encode_map_fields(map)
    }

    pub fn decode_map_value(&self, value: &JsonValue) -> FirestoreResult<MapValue> {
        decode_map_value(value)
    }

    pub fn encode_version(&self, version: SnapshotVersion) -> String {
        encode_timestamp(&version.timestamp())
    }

    pub fn decode_version(&self, value: &JsonValue) -> FirestoreResult<SnapshotVersion> {
        let text = value
            .as_str()
            .ok_or_else(|| invalid_argument("Expected timestamp string"))?;
        Ok(SnapshotVersion::new(decode_timestamp_string(text)?))
    }

    pub fn encode_bytes(&self, bytes: &[u8]) -> String {
        BASE64_STANDARD.encode(bytes)
    }

    pub fn decode_bytes(&self, value: &JsonValue) -> FirestoreResult<Vec<u8>> {
        let text = value
            .as_str()
            .ok_or_else(|| invalid_argument("Expected base64 string"))?;
        BASE64_STANDARD
            .decode(text)
            .map_err(|err| invalid_argument(format!("Invalid base64 bytes: {err}")))
    }

    pub fn encode_document(&self, doc: &Document) -> JsonValue {
        json!({
            "name": self.document_name(doc.key()),
            "fields": encode_map_fields(doc.data()),
            "updateTime": self.encode_version(doc.version()),
        })
    }

    /// Decodes a `Document` proto. The version comes from `updateTime`.
    pub fn decode_document(&self, value: &JsonValue) -> FirestoreResult<Document> {
        let name = value
            .get("name")
            .and_then(JsonValue::as_str)
            .ok_or_else(|| invalid_argument("Document is missing its name"))?;
        let key = self.document_key_from_name(name)?;
        let version = value
            .get("updateTime")
            .map(|time| self.decode_version(time))
            .transpose()?
            .unwrap_or_else(SnapshotVersion::min);
        let data = decode_map_value(value)?;
        Ok(Document::new(key, version, data))
    }

    /// Decodes one element of a `BatchGetDocuments` response.
    pub fn decode_maybe_document(&self, value: &JsonValue) -> FirestoreResult<MaybeDocument> {
        if let Some(found) = value.get("found") {
            return Ok(self.decode_document(found)?.into());
        }
        if let Some(missing) = value.get("missing").and_then(JsonValue::as_str) {
            let key = self.document_key_from_name(missing)?;
            let read_time = value
                .get("readTime")
                .ok_or_else(|| invalid_argument("Missing document has no readTime"))?;
            let version = self.decode_version(read_time)?;
            return Ok(NoDocument::new(key, version).into());
        }
        Err(invalid_argument(
            "BatchGetDocuments response has neither 'found' nor 'missing'",
        ))
    }

    fn encode_precondition(&self, precondition: &Precondition) -> Option<JsonValue> {
        match precondition {
            Precondition::None => None,
            Precondition::Exists(exists) => Some(json!({ "exists": exists })),
            Precondition::UpdateTime(version) => {
                Some(json!({ "updateTime": self.encode_version(*version) }))
            }
        }
    }

    fn decode_precondition(&self, value: Option<&JsonValue>) -> FirestoreResult<Precondition> {
        let Some(value) = value else {
            return Ok(Precondition::None);
        };
        if let Some(update_time) = value.get("updateTime") {
            return Ok(Precondition::UpdateTime(self.decode_version(update_time)?));
        }
        if let Some(exists) = value.get("exists").and_then(JsonValue::as_bool) {
            return Ok(Precondition::Exists(exists));
        }
        Ok(Precondition::None)
    }

    pub fn encode_mutation(&self, mutation: &Mutation) -> JsonValue {
        let mut write = JsonMap::new();
        match mutation {
            Mutation::Set { key, value, .. } => {
                write.insert(
                    "update".to_string(),
                    json!({
                        "name": self.document_name(key),
                        "fields": encode_map_fields(value),
                    }),
                );
            }
            Mutation::Patch {
                key,
                data,
                field_mask,
                ..
            } => {
                write.insert(
                    "update".to_string(),
                    json!({
                        "name": self.document_name(key),
                        "fields": encode_map_fields(data),
                    }),
                );
                let paths: Vec<String> = field_mask
                    .fields()
                    .map(FieldPath::canonical_string)
                    .collect();
                write.insert("updateMask".to_string(), json!({ "fieldPaths": paths }));
            }
            Mutation::Transform {
                key,
                field_transforms,
            } => {
                let transforms: Vec<JsonValue> = field_transforms
                    .iter()
                    .map(|transform| self.encode_field_transform(transform))
                    .collect();
                write.insert(
                    "transform".to_string(),
                    json!({
                        "document": self.document_name(key),
                        "fieldTransforms": transforms,
                    }),
                );
            }
            Mutation::Delete { key, .. } => {
                write.insert("delete".to_string(), json!(self.document_name(key)));
            }
            Mutation::Verify { key, .. } => {
                write.insert("verify".to_string(), json!(self.document_name(key)));
            }
        }
        if let Some(precondition) = self.encode_precondition(&mutation.precondition()) {
            write.insert("currentDocument".to_string(), precondition);
        }
        JsonValue::Object(write)
    }

    pub fn decode_mutation(&self, value: &JsonValue) -> FirestoreResult<Mutation> {
        let precondition = self.decode_precondition(value.get("currentDocument"))?;

        if let Some(update) = value.get("update") {
            let doc = self.decode_document(update)?;
            let key = doc.key().clone();
            let data = doc.into_data();
            return match value.get("updateMask") {
                Some(mask) => {
                    let paths = mask
                        .get("fieldPaths")
                        .and_then(JsonValue::as_array)
                        .map(Vec::as_slice)
                        .unwrap_or_default()
                        .iter()
                        .map(|path| {
                            path.as_str()
                                .ok_or_else(|| invalid_argument("fieldPaths must be strings"))
                                .and_then(FieldPath::from_server_format)
                        })
                        .collect::<FirestoreResult<Vec<_>>>()?;
                    Ok(Mutation::Patch {
                        key,
                        data,
                        field_mask: FieldMask::new(paths),
                        precondition,
                    })
                }
                None => Ok(Mutation::Set {
                    key,
                    value: data,
                    precondition,
                }),
            };
        }
        if let Some(transform) = value.get("transform") {
            let name = transform
                .get("document")
                .and_then(JsonValue::as_str)
                .ok_or_else(|| invalid_argument("Transform is missing its document"))?;
            let key = self.document_key_from_name(name)?;
            let field_transforms = transform
                .get("fieldTransforms")
                .and_then(JsonValue::as_array)
                .map(Vec::as_slice)
                .unwrap_or_default()
                .iter()
                .map(|entry| self.decode_field_transform(entry))
                .collect::<FirestoreResult<Vec<_>>>()?;
            return Ok(Mutation::transform(key, field_transforms));
        }
        if let Some(name) = value.get("delete").and_then(JsonValue::as_str) {
            let key = self.document_key_from_name(name)?;
            return Ok(Mutation::Delete { key, precondition });
        }
        if let Some(name) = value.get("verify").and_then(JsonValue::as_str) {
            let key = self.document_key_from_name(name)?;
            return Ok(Mutation::verify(key, precondition));
        }
        Err(invalid_argument(format!("Unknown mutation: {value}")))
    }

    fn encode_field_transform(&self, transform: &FieldTransform) -> JsonValue {
        let field_path = transform.field().canonical_string();
        let encode_all = |values: &[FirestoreValue]| -> Vec<JsonValue> {
            values.iter().map(encode_value).collect()
        };
        match transform.operation() {
            TransformOperation::ServerTimestamp => json!({
                "fieldPath": field_path,
                "setToServerValue": "REQUEST_TIME",
            }),
            TransformOperation::ArrayUnion(elements) => json!({
                "fieldPath": field_path,
                "appendMissingElements": { "values": encode_all(elements) },
            }),
            TransformOperation::ArrayRemove(elements) => json!({
                "fieldPath": field_path,
                "removeAllFromArray": { "values": encode_all(elements) },
            }),
            TransformOperation::NumericIncrement(operand) => json!({
                "fieldPath": field_path,
                "increment": encode_value(operand),
            }),
        }
    }

    fn decode_field_transform(&self, value: &JsonValue) -> FirestoreResult<FieldTransform> {
        let path = value
            .get("fieldPath")
            .and_then(JsonValue::as_str)
            .ok_or_else(|| invalid_argument("Field transform is missing fieldPath"))?;
        let field = FieldPath::from_server_format(path)?;
        let decode_all = |array: &JsonValue| -> FirestoreResult<Vec<FirestoreValue>> {
            array
                .get("values")
                .and_then(JsonValue::as_array)
                .map(Vec::as_slice)
                .unwrap_or_default()
                .iter()
                .map(decode_value)
                .collect()
        };

        let operation = if let Some(server_value) = value.get("setToServerValue") {
            if server_value.as_str() != Some("REQUEST_TIME") {
                return Err(invalid_argument(format!(
                    "Unknown server value transform {server_value}"
                )));
            }
            TransformOperation::ServerTimestamp
        } else if let Some(elements) = value.get("appendMissingElements") {
            TransformOperation::ArrayUnion(decode_all(elements)?)
        } else if let Some(elements) = value.get("removeAllFromArray") {
            TransformOperation::ArrayRemove(decode_all(elements)?)
        } else if let Some(operand) = value.get("increment") {
            TransformOperation::NumericIncrement(decode_value(operand)?)
        } else {
            return Err(invalid_argument(format!("Unknown field transform {value}")));
        };
        Ok(FieldTransform::new(field, operation))
    }

    /// Decodes the per-write results of a commit. A write without an
    /// `updateTime` (transforms, verifies) reports the commit time.
    pub fn decode_write_results(
        &self,
        results: Option<&JsonValue>,
        commit_version: SnapshotVersion,
    ) -> FirestoreResult<Vec<MutationResult>> {
        let Some(results) = results.and_then(JsonValue::as_array) else {
            return Ok(Vec::new());
        };
        results
            .iter()
            .map(|result| {
                let version = match result.get("updateTime") {
                    Some(time) => self.decode_version(time)?,
                    None => commit_version,
                };
                let version = if version.is_min() {
                    commit_version
                } else {
                    version
                };
                let transform_results = result
                    .get("transformResults")
                    .and_then(JsonValue::as_array)
                    .map(|values| values.iter().map(decode_value).collect())
                    .transpose()?;
                Ok(MutationResult::new(version, transform_results))
            })
            .collect()
    }

    /// `Target` proto for the watch stream: either a `documents` or a
    /// `query` target, resuming from the token or the read time.
    pub fn encode_target(&self, target_data: &TargetData) -> JsonValue {
        let target = &target_data.target;
        let mut encoded = JsonMap::new();
        if target.is_document_target() {
            encoded.insert(
                "documents".to_string(),
                json!({ "documents": [self.resource_name(&target.path)] }),
            );
        } else {
            encoded.insert("query".to_string(), self.encode_query_target(target));
        }
        encoded.insert("targetId".to_string(), json!(target_data.target_id));

        let resuming = if !target_data.resume_token.is_empty() {
            encoded.insert(
                "resumeToken".to_string(),
                json!(self.encode_bytes(&target_data.resume_token)),
            );
            true
        } else if target_data.snapshot_version > SnapshotVersion::min() {
            encoded.insert(
                "readTime".to_string(),
                json!(self.encode_version(target_data.snapshot_version)),
            );
            true
        } else {
            false
        };
        if resuming {
            if let Some(count) = target_data.expected_count {
                encoded.insert("expectedCount".to_string(), json!(count));
            }
        }
        JsonValue::Object(encoded)
    }

    pub fn encode_query_target(&self, target: &Target) -> JsonValue {
        let (parent, from) = match &target.collection_group {
            Some(group) => (
                target.path.clone(),
                json!({ "collectionId": group, "allDescendants": true }),
            ),
            None => (
                target.path.without_last(),
                json!({ "collectionId": target.path.last_segment().unwrap_or_default() }),
            ),
        };

        let mut query = JsonMap::new();
        query.insert("from".to_string(), json!([from]));
        if let Some(filter) = self.encode_filters(&target.filters) {
            query.insert("where".to_string(), filter);
        }
        if !target.order_by.is_empty() {
            let order_by: Vec<JsonValue> = target
                .order_by
                .iter()
                .map(|order| {
                    json!({
                        "field": { "fieldPath": order.field().canonical_string() },
                        "direction": match order.direction() {
                            Direction::Ascending => "ASCENDING",
                            Direction::Descending => "DESCENDING",
                        },
                    })
                })
                .collect();
            query.insert("orderBy".to_string(), JsonValue::Array(order_by));
        }
        if let Some(limit) = target.limit {
            query.insert("limit".to_string(), json!(limit));
        }
        if let Some(start) = &target.start_at {
            query.insert(
                "startAt".to_string(),
                json!({
                    "values": start.position().iter().map(encode_value).collect::<Vec<_>>(),
                    "before": start.inclusive(),
                }),
            );
        }
        if let Some(end) = &target.end_at {
            query.insert(
                "endAt".to_string(),
                json!({
                    "values": end.position().iter().map(encode_value).collect::<Vec<_>>(),
                    "before": !end.inclusive(),
                }),
            );
        }

        json!({
            "parent": self.resource_name(&parent),
            "structuredQuery": JsonValue::Object(query),
        })
    }

    pub fn decode_query_target(&self, value: &JsonValue) -> FirestoreResult<Target> {
        let parent = value
            .get("parent")
            .and_then(JsonValue::as_str)
            .ok_or_else(|| invalid_argument("Query target is missing its parent"))?;
        let parent = self.decode_resource_path(parent)?;
        let query = value
            .get("structuredQuery")
            .ok_or_else(|| invalid_argument("Query target is missing structuredQuery"))?;

        let from = query
            .get("from")
            .and_then(JsonValue::as_array)
            .ok_or_else(|| invalid_argument("StructuredQuery is missing 'from'"))?;
        if from.len() != 1 {
            return Err(invalid_argument(
                "StructuredQuery.from with more than one collection is not supported.",
            ));
        }
        let collection_id = from[0]
            .get("collectionId")
            .and_then(JsonValue::as_str)
            .ok_or_else(|| invalid_argument("'from' is missing collectionId"))?;
        let all_descendants = from[0]
            .get("allDescendants")
            .and_then(JsonValue::as_bool)
            .unwrap_or(false);

        let mut target = if all_descendants {
            let mut target = Target::for_path(parent);
            target.collection_group = Some(collection_id.to_string());
            target
        } else {
            Target::for_path(parent.child([collection_id]))
        };

        if let Some(filter) = query.get("where") {
            target.filters = match self.decode_filter(filter)? {
                Filter::Composite(composite) if composite.op() == CompositeOperator::And => {
                    composite.filters().to_vec()
                }
                other => vec![other],
            };
        }
        if let Some(order_by) = query.get("orderBy").and_then(JsonValue::as_array) {
            target.order_by = order_by
                .iter()
                .map(|order| self.decode_order_by(order))
                .collect::<FirestoreResult<Vec<_>>>()?;
        }
        if let Some(limit) = query.get("limit") {
            let limit = limit
                .as_u64()
                .or_else(|| limit.get("value").and_then(JsonValue::as_u64))
                .ok_or_else(|| invalid_argument("Invalid limit"))?;
            target.limit = Some(limit as u32);
        }
        if let Some(start) = query.get("startAt") {
            let (values, before) = self.decode_cursor(start)?;
            target.start_at = Some(Bound::new(values, before));
        }
        if let Some(end) = query.get("endAt") {
            let (values, before) = self.decode_cursor(end)?;
            target.end_at = Some(Bound::new(values, !before));
        }
        Ok(target)
    }

    pub fn decode_documents_target(&self, value: &JsonValue) -> FirestoreResult<Target> {
        let documents = value
            .get("documents")
            .and_then(JsonValue::as_array)
            .ok_or_else(|| invalid_argument("Documents target is missing documents"))?;
        if documents.len() != 1 {
            return Err(invalid_argument(format!(
                "DocumentsTarget contained other than 1 document: {}",
                documents.len()
            )));
        }
        let name = documents[0]
            .as_str()
            .ok_or_else(|| invalid_argument("Document names must be strings"))?;
        Ok(Target::for_document(&self.document_key_from_name(name)?))
    }

    fn decode_cursor(&self, value: &JsonValue) -> FirestoreResult<(Vec<FirestoreValue>, bool)> {
        let values = value
            .get("values")
            .and_then(JsonValue::as_array)
            .map(Vec::as_slice)
            .unwrap_or_default()
            .iter()
            .map(decode_value)
            .collect::<FirestoreResult<Vec<_>>>()?;
        let before = value
            .get("before")
            .and_then(JsonValue::as_bool)
            .unwrap_or(false);
        Ok((values, before))
    }

    fn decode_order_by(&self, value: &JsonValue) -> FirestoreResult<OrderBy> {
        let field = decode_field_reference(value.get("field"))?;
        let direction = match value.get("direction").and_then(JsonValue::as_str) {
            Some("DESCENDING") => Direction::Descending,
            _ => Direction::Ascending,
        };
        Ok(OrderBy::new(field, direction))
    }

    /// Encodes the query's filters; several top-level filters are joined in
    /// an implicit AND.
    pub fn encode_filters(&self, filters: &[Filter]) -> Option<JsonValue> {
        match filters {
            [] => None,
            [single] => Some(self.encode_filter(single)),
            many => Some(json!({
                "compositeFilter": {
                    "op": "AND",
                    "filters": many.iter().map(|f| self.encode_filter(f)).collect::<Vec<_>>(),
                }
            })),
        }
    }

    fn encode_filter(&self, filter: &Filter) -> JsonValue {
        match filter {
            Filter::Field(field_filter) => self.encode_field_filter(field_filter),
            Filter::Composite(composite) => json!({
                "compositeFilter": {
                    "op": match composite.op() {
                        CompositeOperator::And => "AND",
                        CompositeOperator::Or => "OR",
                    },
                    "filters": composite
                        .filters()
                        .iter()
                        .map(|f| self.encode_filter(f))
                        .collect::<Vec<_>>(),
                }
            }),
        }
    }

    fn encode_field_filter(&self, filter: &FieldFilter) -> JsonValue {
        let field = json!({ "fieldPath": filter.field().canonical_string() });
        let unary = match (filter.op(), filter.value()) {
            (FilterOperator::Equal, value) if value.is_null() => Some("IS_NULL"),
            (FilterOperator::Equal, value) if value.is_nan() => Some("IS_NAN"),
            (FilterOperator::NotEqual, value) if value.is_null() => Some("IS_NOT_NULL"),
            (FilterOperator::NotEqual, value) if value.is_nan() => Some("IS_NOT_NAN"),
            _ => None,
        };
        if let Some(op) = unary {
            return json!({ "unaryFilter": { "field": field, "op": op } });
        }
        json!({
            "fieldFilter": {
                "field": field,
                "op": encode_operator(filter.op()),
                "value": encode_value(filter.value()),
            }
        })
    }

    pub fn decode_filter(&self, value: &JsonValue) -> FirestoreResult<Filter> {
        if let Some(composite) = value.get("compositeFilter") {
            let filters = composite
                .get("filters")
                .and_then(JsonValue::as_array)
                .map(Vec::as_slice)
                .unwrap_or_default()
                .iter()
                .map(|entry| self.decode_filter(entry))
                .collect::<FirestoreResult<Vec<_>>>()?;
            return match composite.get("op").and_then(JsonValue::as_str) {
                Some("OR") => Ok(Filter::or(filters)),
                _ => Ok(Filter::and(filters)),
            };
        }
        if let Some(unary) = value.get("unaryFilter") {
            let field = decode_field_reference(unary.get("field"))?;
            let (op, operand) = match unary.get("op").and_then(JsonValue::as_str) {
                Some("IS_NULL") => (FilterOperator::Equal, FirestoreValue::null()),
                Some("IS_NAN") => (FilterOperator::Equal, FirestoreValue::from_double(f64::NAN)),
                Some("IS_NOT_NULL") => (FilterOperator::NotEqual, FirestoreValue::null()),
                Some("IS_NOT_NAN") => {
                    (FilterOperator::NotEqual, FirestoreValue::from_double(f64::NAN))
                }
                other => {
                    return Err(invalid_argument(format!("Unknown unary filter op {other:?}")))
                }
            };
            return Filter::field(field, op, operand);
        }
        if let Some(field_filter) = value.get("fieldFilter") {
            let field = decode_field_reference(field_filter.get("field"))?;
            let op = field_filter
                .get("op")
                .and_then(JsonValue::as_str)
                .and_then(decode_operator)
                .ok_or_else(|| invalid_argument("Unknown field filter op"))?;
            let operand = field_filter
                .get("value")
                .ok_or_else(|| invalid_argument("Field filter is missing its value"))?;
            return Filter::field(field, op, decode_value(operand)?);
        }
        Err(invalid_argument(format!("Unknown filter: {value}")))
    }

    /// Labels attached to a listen request so the backend can tell why a
    /// target was added.
    pub fn encode_listen_labels(&self, purpose: TargetPurpose) -> Option<JsonValue> {
        let tag = match purpose {
            TargetPurpose::Listen => return None,
            TargetPurpose::ExistenceFilterMismatch => "existence-filter-mismatch",
            TargetPurpose::LimboResolution => "limbo-document",
        };
        Some(json!({ "goog-listen-tags": tag }))
    }

    pub fn encode_listen_request(&self, target_data: &TargetData) -> JsonValue {
        let mut request = JsonMap::new();
        request.insert("database".to_string(), json!(self.database_name()));
        request.insert("addTarget".to_string(), self.encode_target(target_data));
        if let Some(labels) = self.encode_listen_labels(target_data.purpose) {
            request.insert("labels".to_string(), labels);
        }
        JsonValue::Object(request)
    }

    pub fn encode_unlisten_request(&self, target_id: TargetId) -> JsonValue {
        json!({
            "database": self.database_name(),
            "removeTarget": target_id,
        })
    }

    pub fn encode_write_handshake(&self) -> JsonValue {
        json!({ "database": self.database_name() })
    }

    pub fn encode_write_request(&self, stream_token: &[u8], mutations: &[Mutation]) -> JsonValue {
        json!({
            "streamToken": self.encode_bytes(stream_token),
            "writes": mutations
                .iter()
                .map(|mutation| self.encode_mutation(mutation))
                .collect::<Vec<_>>(),
        })
    }

    pub fn decode_write_response(&self, value: &JsonValue) -> FirestoreResult<WriteResponse> {
        let stream_token = match value.get("streamToken") {
            Some(token) => self.decode_bytes(token)?,
            None => Vec::new(),
        };
        let commit_version = match value.get("commitTime") {
            Some(time) => self.decode_version(time)?,
            None => SnapshotVersion::min(),
        };
        let write_results = self.decode_write_results(value.get("writeResults"), commit_version)?;
        Ok(WriteResponse {
            stream_token,
            commit_version,
            write_results,
        })
    }

    /// Body of a unary `Commit` call.
    pub fn encode_commit_request(&self, mutations: &[Mutation]) -> JsonValue {
        json!({
            "writes": mutations
                .iter()
                .map(|mutation| self.encode_mutation(mutation))
                .collect::<Vec<_>>(),
        })
    }
}

fn encode_operator(op: FilterOperator) -> &'static str {
    match op {
        FilterOperator::LessThan => "LESS_THAN",
        FilterOperator::LessThanOrEqual => "LESS_THAN_OR_EQUAL",
        FilterOperator::Equal => "EQUAL",
        FilterOperator::NotEqual => "NOT_EQUAL",
        FilterOperator::GreaterThanOrEqual => "GREATER_THAN_OR_EQUAL",
        FilterOperator::GreaterThan => "GREATER_THAN",
        FilterOperator::ArrayContains => "ARRAY_CONTAINS",
        FilterOperator::ArrayContainsAny => "ARRAY_CONTAINS_ANY",
        FilterOperator::In => "IN",
        FilterOperator::NotIn => "NOT_IN",
    }
}

fn decode_operator(op: &str) -> Option<FilterOperator> {
    Some(match op {
        "LESS_THAN" => FilterOperator::LessThan,
        "LESS_THAN_OR_EQUAL" => FilterOperator::LessThanOrEqual,
        "EQUAL" => FilterOperator::Equal,
        "NOT_EQUAL" => FilterOperator::NotEqual,
        "GREATER_THAN_OR_EQUAL" => FilterOperator::GreaterThanOrEqual,
        "GREATER_THAN" => FilterOperator::GreaterThan,
        "ARRAY_CONTAINS" => FilterOperator::ArrayContains,
        "ARRAY_CONTAINS_ANY" => FilterOperator::ArrayContainsAny,
        "IN" => FilterOperator::In,
        "NOT_IN" => FilterOperator::NotIn,
        _ => return None,
    })
}

fn decode_field_reference(value: Option<&JsonValue>) -> FirestoreResult<FieldPath> {
    let path = value
        .and_then(|field| field.get("fieldPath"))
        .and_then(JsonValue::as_str)
        .ok_or_else(|| invalid_argument("Field reference is missing fieldPath"))?;
    FieldPath::from_server_format(path)
}

fn encode_map_fields(map: &MapValue) -> JsonValue {
    let mut fields = JsonMap::new();
    for (key, value) in map.fields() {
        fields.insert(key.clone(), encode_value(value));
    }
    JsonValue::Object(fields)
}

fn encode_double(value: f64) -> JsonValue {
    if value.is_nan() {
        json!("NaN")
    } else if value.is_infinite() {
        json!(if value > 0.0 { "Infinity" } else { "-Infinity" })
    } else {
        json!(value)
    }
}

fn encode_value(value: &FirestoreValue) -> JsonValue {
    match value.kind() {
        ValueKind::Null => json!({ "nullValue": JsonValue::Null }),
        ValueKind::Boolean(boolean) => json!({ "booleanValue": boolean }),
        ValueKind::Integer(integer) => json!({ "integerValue": integer.to_string() }),
        ValueKind::Double(double) => json!({ "doubleValue": encode_double(*double) }),
        ValueKind::Timestamp(timestamp) => json!({ "timestampValue": encode_timestamp(timestamp) }),
        ValueKind::String(string) => json!({ "stringValue": string }),
        ValueKind::Bytes(bytes) => {
            json!({ "bytesValue": BASE64_STANDARD.encode(bytes.as_slice()) })
        }
        ValueKind::Reference(reference) => json!({ "referenceValue": reference }),
        ValueKind::GeoPoint(point) => json!({ "geoPointValue": point.to_proto() }),
        ValueKind::Array(array) => {
            let values = array.values().iter().map(encode_value).collect::<Vec<_>>();
            json!({ "arrayValue": { "values": values } })
        }
        ValueKind::Map(map) => json!({
            "mapValue": {
                "fields": encode_map_fields(map)
            }
        }),
    }
}

fn decode_map_value(value: &JsonValue) -> FirestoreResult<MapValue> {
    let map = value
        .as_object()
        .ok_or_else(|| invalid_argument("Expected object for map value"))?;
    let fields_object = match map.get("fields") {
        Some(fields_value) => fields_value
            .as_object()
            .ok_or_else(|| invalid_argument("Expected 'fields' to be an object"))?,
        None => return Ok(MapValue::new(BTreeMap::new())),
    };

    let mut fields = BTreeMap::new();
    for (key, value) in fields_object {
        fields.insert(key.clone(), decode_value(value)?);
    }
    Ok(MapValue::new(fields))
}

fn decode_value(value: &JsonValue) -> FirestoreResult<FirestoreValue> {
    let object = value
        .as_object()
        .ok_or_else(|| invalid_argument("Expected Firestore value object"))?;
    if object.contains_key("nullValue") {
        return Ok(FirestoreValue::null());
    }
    if let Some(bool_value) = object.get("booleanValue") {
        let value = bool_value
            .as_bool()
            .ok_or_else(|| invalid_argument("booleanValue must be bool"))?;
        return Ok(FirestoreValue::from_bool(value));
    }
    if let Some(integer_value) = object.get("integerValue") {
        let parsed = match integer_value {
            JsonValue::String(value) => i64::from_str(value)
                .map_err(|err| invalid_argument(format!("Invalid integerValue: {err}")))?,
            JsonValue::Number(number) => number
                .as_i64()
                .ok_or_else(|| invalid_argument("Integer out of range"))?,
            _ => return Err(invalid_argument("integerValue must be a string or number")),
        };
        return Ok(FirestoreValue::from_integer(parsed));
    }
    if let Some(double_value) = object.get("doubleValue") {
        let parsed = match double_value {
            JsonValue::Number(number) => number
                .as_f64()
                .ok_or_else(|| invalid_argument("Invalid doubleValue"))?,
            JsonValue::String(value) => value
                .parse::<f64>()
                .map_err(|err| invalid_argument(format!("Invalid doubleValue: {err}")))?,
            _ => return Err(invalid_argument("doubleValue must be a number or string")),
        };
        return Ok(FirestoreValue::from_double(parsed));
    }
    if let Some(timestamp_value) = object.get("timestampValue") {
        let timestamp_str = timestamp_value
            .as_str()
            .ok_or_else(|| invalid_argument("timestampValue must be string"))?;
        return Ok(FirestoreValue::from_timestamp(decode_timestamp_string(
            timestamp_str,
        )?));
    }
    if let Some(string_value) = object.get("stringValue") {
        let str_value = string_value
            .as_str()
            .ok_or_else(|| invalid_argument("stringValue must be string"))?;
        return Ok(FirestoreValue::from_string(str_value));
    }
    if let Some(bytes_value) = object.get("bytesValue") {
        let str_value = bytes_value
            .as_str()
            .ok_or_else(|| invalid_argument("bytesValue must be base64 string"))?;
        let decoded = BASE64_STANDARD
            .decode(str_value)
            .map_err(|err| invalid_argument(format!("Invalid bytesValue: {err}")))?;
        return Ok(FirestoreValue::from_bytes(BytesValue::new(decoded)));
    }
    if let Some(reference_value) = object.get("referenceValue") {
        let str_value = reference_value
            .as_str()
            .ok_or_else(|| invalid_argument("referenceValue must be string"))?;
        return Ok(FirestoreValue::from_reference(str_value));
    }
    if let Some(geo_point) = object.get("geoPointValue") {
        return Ok(FirestoreValue::from_geo_point(GeoPoint::from_proto(geo_point)?));
    }
    if let Some(array_value) = object.get("arrayValue") {
        let decoded = match array_value.get("values").and_then(JsonValue::as_array) {
            Some(entries) => entries
                .iter()
                .map(decode_value)
                .collect::<FirestoreResult<Vec<_>>>()?,
            None => Vec::new(),
        };
        return Ok(FirestoreValue::from_array(decoded));
    }
    if let Some(map_value) = object.get("mapValue") {
        return Ok(FirestoreValue::from_map_value(decode_map_value(map_value)?));
    }

    Err(invalid_argument("Unknown Firestore value type"))
}

pub fn encode_timestamp(timestamp: &Timestamp) -> String {
    match Utc
        .timestamp_opt(timestamp.seconds, timestamp.nanos.max(0) as u32)
        .single()
    {
        Some(datetime) => datetime.to_rfc3339_opts(SecondsFormat::Nanos, true),
        None => "1970-01-01T00:00:00.000000000Z".to_string(),
    }
}

pub fn decode_timestamp_string(value: &str) -> FirestoreResult<Timestamp> {
    let datetime = DateTime::parse_from_rfc3339(value)
        .map_err(|err| invalid_argument(format!("Invalid timestamp: {err}")))?;
    let datetime_utc = datetime.with_timezone(&Utc);
    Ok(Timestamp::new(
        datetime_utc.timestamp(),
        datetime_utc.timestamp_subsec_nanos() as i32,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::core::query::Query;
    use crate::firestore::test_support::{doc, field, key, query};

    fn serializer() -> JsonProtoSerializer {
        JsonProtoSerializer::new(DatabaseId::new("p", "d"))
    }

    #[test]
    fn document_names_round_trip() {
        let s = serializer();
        let name = s.document_name(&key("rooms/eros"));
        assert_eq!(name, "projects/p/databases/d/documents/rooms/eros");
        assert_eq!(s.document_key_from_name(&name).unwrap(), key("rooms/eros"));
        assert!(s
            .document_key_from_name("projects/other/databases/d/documents/rooms/eros")
            .is_err());
    }

    #[test]
    fn non_finite_doubles_encode_as_strings() {
        assert_eq!(
            encode_value(&FirestoreValue::from_double(f64::NAN)),
            json!({ "doubleValue": "NaN" })
        );
        assert_eq!(
            encode_value(&FirestoreValue::from_double(f64::NEG_INFINITY)),
            json!({ "doubleValue": "-Infinity" })
        );
        let decoded = decode_value(&json!({ "doubleValue": "Infinity" })).unwrap();
        assert_eq!(decoded.as_double(), Some(f64::INFINITY));
        assert!(decode_value(&json!({ "doubleValue": "NaN" })).unwrap().is_nan());
    }

    #[test]
    fn decodes_found_and_missing_documents() {
        let s = serializer();
        let found = json!({
            "found": {
                "name": "projects/p/databases/d/documents/rooms/a",
                "fields": { "n": { "integerValue": "1" } },
                "updateTime": "1970-01-01T00:00:00.000002Z",
            }
        });
        let decoded = s.decode_maybe_document(&found).unwrap();
        assert_eq!(decoded.as_document(), Some(&doc("rooms/a", 2, &[("n", 1i64.into())])));

        let missing = json!({
            "missing": "projects/p/databases/d/documents/rooms/b",
            "readTime": "1970-01-01T00:00:00.000003Z",
        });
        let decoded = s.decode_maybe_document(&missing).unwrap();
        assert!(decoded.is_no_document());
        assert_eq!(decoded.version(), SnapshotVersion::from_micros(3));
    }

    #[test]
    fn patch_carries_mask_and_precondition() {
        let s = serializer();
        let mut data = BTreeMap::new();
        data.insert("a".to_string(), FirestoreValue::from_integer(1));
        let mutation = Mutation::patch(key("rooms/a"), MapValue::new(data));
        let encoded = s.encode_mutation(&mutation);
        assert_eq!(encoded["updateMask"], json!({ "fieldPaths": ["a"] }));
        assert_eq!(encoded["currentDocument"], json!({ "exists": true }));
        assert_eq!(s.decode_mutation(&encoded).unwrap(), mutation);
    }

    #[test]
    fn transform_and_verify_mutations_encode() {
        let s = serializer();
        let transform = Mutation::transform(
            key("rooms/a"),
            vec![
                FieldTransform::new(field("at"), TransformOperation::ServerTimestamp),
                FieldTransform::new(
                    field("n"),
                    TransformOperation::NumericIncrement(FirestoreValue::from_integer(2)),
                ),
            ],
        );
        let encoded = s.encode_mutation(&transform);
        assert_eq!(
            encoded["transform"]["fieldTransforms"][0]["setToServerValue"],
            json!("REQUEST_TIME")
        );
        assert_eq!(s.decode_mutation(&encoded).unwrap(), transform);

        let verify = Mutation::verify(
            key("rooms/a"),
            Precondition::UpdateTime(SnapshotVersion::from_micros(5)),
        );
        let encoded = s.encode_mutation(&verify);
        assert_eq!(
            encoded["verify"],
            json!("projects/p/databases/d/documents/rooms/a")
        );
        assert_eq!(s.decode_mutation(&encoded).unwrap(), verify);
    }

    #[test]
    fn write_results_fall_back_to_commit_time() {
        let s = serializer();
        let commit = SnapshotVersion::from_micros(10);
        let results = json!([
            { "updateTime": "1970-01-01T00:00:00.000004Z" },
            { "transformResults": [ { "integerValue": "7" } ] },
        ]);
        let decoded = s.decode_write_results(Some(&results), commit).unwrap();
        assert_eq!(decoded[0].version, SnapshotVersion::from_micros(4));
        assert_eq!(decoded[1].version, commit);
        assert_eq!(
            decoded[1].transform_results,
            Some(vec![FirestoreValue::from_integer(7)])
        );
    }

    #[test]
    fn query_target_encodes_structured_query() {
        let s = serializer();
        let q = query("rooms/eros/messages")
            .with_filter(Filter::field(field("n"), FilterOperator::GreaterThan, 1i64.into()).unwrap())
            .with_filter(Filter::field(field("tag"), FilterOperator::Equal, FirestoreValue::null()).unwrap())
            .with_limit_to_first(5)
            .with_start_at(Bound::new(vec![2i64.into()], true));
        let target = q.to_target();
        let encoded = s.encode_query_target(&target);
        assert_eq!(
            encoded["parent"],
            json!("projects/p/databases/d/documents/rooms/eros")
        );
        let structured = &encoded["structuredQuery"];
        assert_eq!(structured["from"], json!([{ "collectionId": "messages" }]));
        assert_eq!(structured["where"]["compositeFilter"]["op"], json!("AND"));
        assert_eq!(
            structured["where"]["compositeFilter"]["filters"][1]["unaryFilter"]["op"],
            json!("IS_NULL")
        );
        assert_eq!(structured["orderBy"][0]["direction"], json!("ASCENDING"));
        assert_eq!(structured["limit"], json!(5));
        assert_eq!(structured["startAt"]["before"], json!(true));

        let decoded = s.decode_query_target(&encoded).unwrap();
        assert_eq!(decoded.canonical_id(), target.canonical_id());
    }

    #[test]
    fn collection_group_target_uses_all_descendants() {
        let s = serializer();
        let target = Query::collection_group(ResourcePath::root(), "messages").to_target();
        let encoded = s.encode_query_target(&target);
        assert_eq!(encoded["parent"], json!("projects/p/databases/d/documents"));
        assert_eq!(
            encoded["structuredQuery"]["from"],
            json!([{ "collectionId": "messages", "allDescendants": true }])
        );
        let decoded = s.decode_query_target(&encoded).unwrap();
        assert_eq!(decoded.collection_group.as_deref(), Some("messages"));
        assert!(decoded.path.is_empty());
    }

    #[test]
    fn listen_request_resumes_with_token_and_labels() {
        let s = serializer();
        let target = Target::for_document(&key("rooms/a"));
        let data = TargetData::new(target, 3, TargetPurpose::LimboResolution, 1)
            .with_resume_token(vec![1, 2, 3], SnapshotVersion::from_micros(9))
            .with_expected_count(1);
        let request = s.encode_listen_request(&data);
        assert_eq!(request["database"], json!("projects/p/databases/d"));
        assert_eq!(
            request["addTarget"]["documents"]["documents"],
            json!(["projects/p/databases/d/documents/rooms/a"])
        );
        assert_eq!(request["addTarget"]["resumeToken"], json!("AQID"));
        assert_eq!(request["addTarget"]["expectedCount"], json!(1));
        assert!(request["addTarget"].get("readTime").is_none());
        assert_eq!(
            request["labels"]["goog-listen-tags"],
            json!("limbo-document")
        );

        let fresh = TargetData::new(
            Target::for_document(&key("rooms/a")),
            3,
            TargetPurpose::Listen,
            1,
        );
        let request = s.encode_listen_request(&fresh);
        assert!(request.get("labels").is_none());
        assert!(request["addTarget"].get("expectedCount").is_none());
    }

    #[test]
    fn write_response_decodes_token_and_results() {
        let s = serializer();
        let response = json!({
            "streamToken": "AQI=",
            "commitTime": "1970-01-01T00:00:01Z",
            "writeResults": [ {} ],
        });
        let decoded = s.decode_write_response(&response).unwrap();
        assert_eq!(decoded.stream_token, vec![1, 2]);
        assert_eq!(decoded.commit_version, SnapshotVersion::from_micros(1_000_000));
        assert_eq!(decoded.write_results[0].version, decoded.commit_version);
    }
}
