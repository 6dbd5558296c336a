use serde::Deserialize;
use serde_json::Value as JsonValue;

use crate::firestore::core::types::TargetId;
use crate::firestore::error::{internal_error, invalid_argument, map_rpc_status, FirestoreError, FirestoreResult};
use crate::firestore::model::{DocumentKey, MaybeDocument, NoDocument, SnapshotVersion};
use crate::firestore::remote::serializer::JsonProtoSerializer;

/// One decoded message of the listen stream.
#[derive(Debug, Clone, PartialEq)]
pub enum WatchChange {
    TargetChange(WatchTargetChange),
    DocumentChange(DocumentWatchChange),
    ExistenceFilter(ExistenceFilterChange),
}

#[derive(Debug, Clone, PartialEq)]
pub struct WatchTargetChange {
    pub state: TargetChangeState,
    /// Empty means "every active target".
    pub target_ids: Vec<TargetId>,
    pub resume_token: Vec<u8>,
    /// Set when the backend removed the targets because of an error.
    pub cause: Option<FirestoreError>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetChangeState {
    NoChange,
    Added,
    Removed,
    Current,
    Reset,
}

/// A document entering, changing in, or leaving a set of targets.
///
/// `new_doc` is `None` when the backend only said the document left the
/// targets without saying whether it still exists.
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentWatchChange {
    pub updated_target_ids: Vec<TargetId>,
    pub removed_target_ids: Vec<TargetId>,
    pub key: DocumentKey,
    pub new_doc: Option<MaybeDocument>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExistenceFilterChange {
    pub target_id: TargetId,
    pub count: usize,
}

#[derive(Debug, Deserialize)]
struct StatusCause {
    #[serde(default)]
    code: i32,
    #[serde(default)]
    message: Option<String>,
}

pub fn decode_watch_change(
    serializer: &JsonProtoSerializer,
    value: &JsonValue,
) -> FirestoreResult<Option<WatchChange>> {
    if let Some(target_change) = value.get("targetChange") {
        return decode_target_change(serializer, target_change).map(Some);
    }

    if let Some(document_change) = value.get("documentChange") {
        return decode_document_change(serializer, document_change).map(Some);
    }

    if let Some(document_delete) = value.get("documentDelete") {
        return decode_document_delete(serializer, document_delete).map(Some);
    }

    if let Some(document_remove) = value.get("documentRemove") {
        return decode_document_remove(serializer, document_remove).map(Some);
    }

    if let Some(filter) = value.get("filter") {
        return decode_filter_change(filter).map(Some);
    }

    Ok(None)
}

/// The global snapshot version a listen response establishes. Only a target
/// change addressed to all targets carries one; everything else is `min`.
pub fn snapshot_version_from_response(
    serializer: &JsonProtoSerializer,
    value: &JsonValue,
) -> FirestoreResult<SnapshotVersion> {
    let Some(target_change) = value.get("targetChange") else {
        return Ok(SnapshotVersion::min());
    };
    if !numeric_array(target_change.get("targetIds")).is_empty() {
        return Ok(SnapshotVersion::min());
    }
    match target_change.get("readTime") {
        Some(read_time) => serializer.decode_version(read_time),
        None => Ok(SnapshotVersion::min()),
    }
}

fn decode_target_change(
    serializer: &JsonProtoSerializer,
    value: &JsonValue,
) -> FirestoreResult<WatchChange> {
    let target_ids = numeric_array(value.get("targetIds"));

    let resume_token = value
        .get("resumeToken")
        .map(|token| serializer.decode_bytes(token))
        .transpose()?
        .unwrap_or_default();

    let state = value
        .get("targetChangeType")
        .and_then(JsonValue::as_str)
        .map(target_state_from_str)
        .unwrap_or(TargetChangeState::NoChange);

    let cause = value
        .get("cause")
        .map(|cause| serde_json::from_value::<StatusCause>(cause.clone()))
        .transpose()
        .map_err(|err| internal_error(format!("Failed to decode watch cause: {err}")))?
        .map(|cause| map_rpc_status(cause.code, cause.message));

    Ok(WatchChange::TargetChange(WatchTargetChange {
        state,
        target_ids,
        resume_token,
        cause,
    }))
}

fn decode_document_change(
    serializer: &JsonProtoSerializer,
    value: &JsonValue,
) -> FirestoreResult<WatchChange> {
    let document = value
        .get("document")
        .ok_or_else(|| invalid_argument("documentChange missing document"))?;
    let doc = serializer.decode_document(document)?;

    Ok(WatchChange::DocumentChange(DocumentWatchChange {
        updated_target_ids: numeric_array(value.get("targetIds")),
        removed_target_ids: numeric_array(value.get("removedTargetIds")),
        key: doc.key().clone(),
        new_doc: Some(doc.into()),
    }))
}

fn decode_document_delete(
    serializer: &JsonProtoSerializer,
    value: &JsonValue,
) -> FirestoreResult<WatchChange> {
    let key = document_key(serializer, value, "documentDelete")?;
    let read_time = value
        .get("readTime")
        .map(|time| serializer.decode_version(time))
        .transpose()?
        .unwrap_or_else(SnapshotVersion::min);

    Ok(WatchChange::DocumentChange(DocumentWatchChange {
        updated_target_ids: Vec::new(),
        removed_target_ids: numeric_array(value.get("removedTargetIds")),
        key: key.clone(),
        new_doc: Some(NoDocument::new(key, read_time).into()),
    }))
}

fn decode_document_remove(
    serializer: &JsonProtoSerializer,
    value: &JsonValue,
) -> FirestoreResult<WatchChange> {
    let key = document_key(serializer, value, "documentRemove")?;

    Ok(WatchChange::DocumentChange(DocumentWatchChange {
        updated_target_ids: Vec::new(),
        removed_target_ids: numeric_array(value.get("removedTargetIds")),
        key,
        new_doc: None,
    }))
}

fn decode_filter_change(value: &JsonValue) -> FirestoreResult<WatchChange> {
    let target_id = value
        .get("targetId")
        .and_then(JsonValue::as_i64)
        .ok_or_else(|| invalid_argument("filter missing targetId"))? as TargetId;
    let count = value.get("count").and_then(JsonValue::as_u64).unwrap_or(0) as usize;
    Ok(WatchChange::ExistenceFilter(ExistenceFilterChange {
        target_id,
        count,
    }))
}

fn document_key(
    serializer: &JsonProtoSerializer,
    value: &JsonValue,
    kind: &str,
) -> FirestoreResult<DocumentKey> {
    let name = value
        .get("document")
        .and_then(JsonValue::as_str)
        .ok_or_else(|| invalid_argument(format!("{kind} missing document")))?;
    serializer.document_key_from_name(name)
}

fn numeric_array(value: Option<&JsonValue>) -> Vec<TargetId> {
    value
        .and_then(JsonValue::as_array)
        .map(|entries| {
            entries
                .iter()
                .filter_map(|entry| entry.as_i64().map(|value| value as TargetId))
                .collect::<Vec<_>>()
        })
        .unwrap_or_default()
}

fn target_state_from_str(value: &str) -> TargetChangeState {
    match value {
        "ADD" => TargetChangeState::Added,
        "REMOVE" => TargetChangeState::Removed,
        "CURRENT" => TargetChangeState::Current,
        "RESET" => TargetChangeState::Reset,
        _ => TargetChangeState::NoChange,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::error::FirestoreErrorCode;
    use crate::firestore::model::DatabaseId;
    use serde_json::json;

    fn serializer() -> JsonProtoSerializer {
        JsonProtoSerializer::new(DatabaseId::new("project", "(default)"))
    }

    fn name(path: &str) -> String {
        format!("projects/project/databases/(default)/documents/{path}")
    }

    #[test]
    fn decodes_target_change() {
        let serializer = serializer();
        let change = json!({
            "targetChange": {
                "targetIds": [1, 2],
                "resumeToken": serializer.encode_bytes(&[1, 2, 3]),
                "targetChangeType": "CURRENT"
            }
        });

        let decoded = decode_watch_change(&serializer, &change).unwrap().unwrap();
        match decoded {
            WatchChange::TargetChange(change) => {
                assert_eq!(change.target_ids, vec![1, 2]);
                assert_eq!(change.resume_token, vec![1, 2, 3]);
                assert_eq!(change.state, TargetChangeState::Current);
                assert!(change.cause.is_none());
            }
            other => panic!("unexpected change: {other:?}"),
        }
    }

    #[test]
    fn removal_cause_maps_status_code() {
        let change = json!({
            "targetChange": {
                "targetIds": [4],
                "targetChangeType": "REMOVE",
                "cause": {"code": 7, "message": "denied"}
            }
        });
        let WatchChange::TargetChange(change) =
            decode_watch_change(&serializer(), &change).unwrap().unwrap()
        else {
            panic!("expected target change");
        };
        assert_eq!(change.state, TargetChangeState::Removed);
        let cause = change.cause.unwrap();
        assert_eq!(cause.code, FirestoreErrorCode::PermissionDenied);
        assert_eq!(cause.message(), "denied");
    }

    #[test]
    fn document_change_carries_update_time() {
        let change = json!({
            "documentChange": {
                "document": {
                    "name": name("rooms/a"),
                    "fields": {"n": {"integerValue": "1"}},
                    "updateTime": "1970-01-01T00:00:01Z"
                },
                "targetIds": [2],
                "removedTargetIds": [4]
            }
        });
        let WatchChange::DocumentChange(change) =
            decode_watch_change(&serializer(), &change).unwrap().unwrap()
        else {
            panic!("expected document change");
        };
        assert_eq!(change.updated_target_ids, vec![2]);
        assert_eq!(change.removed_target_ids, vec![4]);
        let doc = change.new_doc.unwrap();
        assert!(doc.is_document());
        assert_eq!(doc.version(), SnapshotVersion::from_micros(1_000_000));
    }

    #[test]
    fn delete_and_remove_differ_in_new_doc() {
        let delete = json!({
            "documentDelete": {
                "document": name("rooms/a"),
                "readTime": "1970-01-01T00:00:02Z",
                "removedTargetIds": [2]
            }
        });
        let WatchChange::DocumentChange(delete) =
            decode_watch_change(&serializer(), &delete).unwrap().unwrap()
        else {
            panic!("expected document change");
        };
        let deleted = delete.new_doc.unwrap();
        assert!(deleted.is_no_document());
        assert_eq!(deleted.version(), SnapshotVersion::from_micros(2_000_000));

        let remove = json!({
            "documentRemove": {"document": name("rooms/a"), "removedTargetIds": [2]}
        });
        let WatchChange::DocumentChange(remove) =
            decode_watch_change(&serializer(), &remove).unwrap().unwrap()
        else {
            panic!("expected document change");
        };
        assert!(remove.new_doc.is_none());
        assert_eq!(remove.removed_target_ids, vec![2]);
    }

    #[test]
    fn decodes_existence_filter() {
        let change = json!({"filter": {"targetId": 2, "count": 3}});
        assert_eq!(
            decode_watch_change(&serializer(), &change).unwrap(),
            Some(WatchChange::ExistenceFilter(ExistenceFilterChange {
                target_id: 2,
                count: 3
            }))
        );
        assert_eq!(decode_watch_change(&serializer(), &json!({})).unwrap(), None);
    }

    #[test]
    fn only_global_target_changes_carry_a_snapshot_version() {
        let serializer = serializer();
        let global = json!({
            "targetChange": {"targetChangeType": "NO_CHANGE", "readTime": "1970-01-01T00:00:05Z"}
        });
        assert_eq!(
            snapshot_version_from_response(&serializer, &global).unwrap(),
            SnapshotVersion::from_micros(5_000_000)
        );

        let targeted = json!({
            "targetChange": {"targetIds": [2], "readTime": "1970-01-01T00:00:05Z"}
        });
        assert!(snapshot_version_from_response(&serializer, &targeted)
            .unwrap()
            .is_min());
        assert!(snapshot_version_from_response(&serializer, &json!({"filter": {}}))
            .unwrap()
            .is_min());
    }
}
