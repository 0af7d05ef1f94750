//! Bulk-update records consumed by the search index
//!
//! Each record is a pair of newline-terminated JSON lines: an action
//! descriptor naming the target document, then the partial document to upsert.

use crate::config::IndexSection;
use crate::writer::WriterError;
use serde::Serialize;
use serde_json::{Map, Value};

/// `@type` of the document wrapping group output
pub const GROUP_OUTPUT_TYPE: &str = "NaturalLanguageProcessing";

/// Field of the wrapping document holding the group output
pub const GROUP_OUTPUT_FIELD: &str = "naturalLanguageProcessing";

#[derive(Debug, Serialize)]
struct BulkAction<'a> {
    update: UpdateTarget<'a>,
}

#[derive(Debug, Serialize)]
struct UpdateTarget<'a> {
    #[serde(rename = "_id")]
    id: &'a str,
    #[serde(rename = "_type")]
    doc_type: &'a str,
    #[serde(rename = "_index")]
    index: &'a str,
    #[serde(rename = "_parent", skip_serializing_if = "Option::is_none")]
    parent: Option<&'a str>,
}

#[derive(Debug, Serialize)]
struct Upsert<T> {
    doc: T,
    doc_as_upsert: bool,
}

/// Identifiers stamped on the group document
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StorageMeta {
    pub user_id: String,
    pub project_id: String,
    pub job_id: String,
    pub task_id: String,
    pub stored_at: String,
}

#[derive(Debug, Serialize)]
struct GroupDocument<'a> {
    meta: &'a StorageMeta,
    #[serde(rename = "jsonLD")]
    json_ld: Value,
}

fn encode_pair<A: Serialize, D: Serialize>(action: &A, doc: &D) -> Result<String, WriterError> {
    let mut record = serde_json::to_string(action)?;
    record.push('\n');
    record.push_str(&serde_json::to_string(doc)?);
    record.push('\n');
    Ok(record)
}

/// Document id of a fragment: `<fragment @id>:<taskId>`
pub fn fragment_document_id(fragment: &Value, task_id: &str) -> Result<String, WriterError> {
    let id = match fragment.get("@id") {
        Some(Value::String(id)) if !id.is_empty() => id.clone(),
        Some(Value::Number(id)) => id.to_string(),
        _ => return Err(WriterError::MissingFragmentId),
    };
    Ok(format!("{id}:{task_id}"))
}

/// Record upserting one fragment as a child of the task's group document
pub fn fragment_record(
    fragment: &Value,
    task_id: &str,
    index: &IndexSection,
) -> Result<String, WriterError> {
    let id = fragment_document_id(fragment, task_id)?;
    let action = BulkAction {
        update: UpdateTarget {
            id: &id,
            doc_type: &index.group_type_task,
            index: &index.group_index,
            parent: Some(task_id),
        },
    };
    encode_pair(
        &action,
        &Upsert {
            doc: fragment,
            doc_as_upsert: true,
        },
    )
}

/// Record upserting the task's group document
pub fn group_record(
    group_output: &Value,
    meta: &StorageMeta,
    index: &IndexSection,
) -> Result<String, WriterError> {
    let action = BulkAction {
        update: UpdateTarget {
            id: &meta.task_id,
            doc_type: &index.group_type_group,
            index: &index.group_index,
            parent: None,
        },
    };
    let mut json_ld = Map::new();
    json_ld.insert("@type".to_string(), Value::from(GROUP_OUTPUT_TYPE));
    json_ld.insert(GROUP_OUTPUT_FIELD.to_string(), group_output.clone());
    let document = GroupDocument {
        meta,
        json_ld: Value::Object(json_ld),
    };
    encode_pair(
        &action,
        &Upsert {
            doc: document,
            doc_as_upsert: true,
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn meta() -> StorageMeta {
        StorageMeta {
            user_id: "u-1".to_string(),
            project_id: "p-1".to_string(),
            job_id: "j-1".to_string(),
            task_id: "t-1".to_string(),
            stored_at: "2024-01-01T00:00:00Z".to_string(),
        }
    }

    fn lines(record: &str) -> Vec<Value> {
        record
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect()
    }

    #[test]
    fn test_fragment_record_shape() {
        let fragment = json!({"@id": "doc-9", "entities": ["Berlin"]});
        let record = fragment_record(&fragment, "t-1", &IndexSection::default()).unwrap();

        assert!(record.ends_with('\n'));
        let parsed = lines(&record);
        assert_eq!(parsed.len(), 2);
        assert_eq!(
            parsed[0],
            json!({"update": {"_id": "doc-9:t-1", "_type": "taskResults", "_index": "group", "_parent": "t-1"}})
        );
        assert_eq!(parsed[1], json!({"doc": fragment, "doc_as_upsert": true}));
    }

    #[test]
    fn test_fragment_without_id_is_rejected() {
        let err = fragment_record(&json!({"text": "x"}), "t-1", &IndexSection::default())
            .unwrap_err();
        assert!(matches!(err, WriterError::MissingFragmentId));

        let err = fragment_record(&json!({"@id": ""}), "t-1", &IndexSection::default())
            .unwrap_err();
        assert!(matches!(err, WriterError::MissingFragmentId));
    }

    #[test]
    fn test_numeric_fragment_id() {
        assert_eq!(
            fragment_document_id(&json!({"@id": 42}), "t-1").unwrap(),
            "42:t-1"
        );
    }

    #[test]
    fn test_group_record_shape() {
        let record = group_record(&json!({"topics": 3}), &meta(), &IndexSection::default())
            .unwrap();
        let parsed = lines(&record);

        assert_eq!(
            parsed[0],
            json!({"update": {"_id": "t-1", "_type": "groupResults", "_index": "group"}})
        );
        assert_eq!(parsed[1]["doc_as_upsert"], true);
        assert_eq!(parsed[1]["doc"]["meta"]["userId"], "u-1");
        assert_eq!(parsed[1]["doc"]["meta"]["storedAt"], "2024-01-01T00:00:00Z");
        assert_eq!(parsed[1]["doc"]["jsonLD"]["@type"], GROUP_OUTPUT_TYPE);
        assert_eq!(parsed[1]["doc"]["jsonLD"][GROUP_OUTPUT_FIELD]["topics"], 3);
    }
}
