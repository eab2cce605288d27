use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::Path;

use crate::error::StoreError;
use crate::request::RecordedRequest;
use crate::response::RecordedResponse;

/// One request, its hash and the response it got.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordInteraction {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request: Option<RecordedRequest>,
    pub sha_sum: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<RecordedResponse>,
}

/// Interactions grouped under one name, stored as `<name>.json`.
///
/// ```json
/// {
///   "recordID": "my_test",
///   "interactions": [
///     { "request": {...}, "shaSum": "...", "response": {...} }
///   ]
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RecordFile {
    #[serde(rename = "recordID", default)]
    pub record_id: String,
    #[serde(default)]
    pub interactions: Vec<RecordInteraction>,
}

impl RecordFile {
    pub fn new(record_id: impl Into<String>) -> Self {
        Self {
            record_id: record_id.into(),
            interactions: Vec::new(),
        }
    }

    /// Load a record file from disk.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        let data = fs::read(path).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => StoreError::RecordingNotFound(path.display().to_string()),
            _ => StoreError::io(format!("reading {}", path.display()), e),
        })?;
        serde_json::from_slice(&data)
            .map_err(|e| StoreError::json(format!("parsing {}", path.display()), e))
    }

    /// Write the whole file, replacing any previous content.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| StoreError::io(format!("creating {}", parent.display()), e))?;
        }
        let data = serde_json::to_vec_pretty(self)
            .map_err(|e| StoreError::json(format!("serializing {}", path.display()), e))?;
        fs::write(path, data).map_err(|e| StoreError::io(format!("writing {}", path.display()), e))
    }

    pub fn push(&mut self, request: RecordedRequest, sha_sum: String, response: RecordedResponse) {
        self.interactions.push(RecordInteraction {
            request: Some(request),
            sha_sum,
            response: Some(response),
        });
    }

    pub fn lookup(&self, sha_sum: &str) -> Option<&RecordInteraction> {
        self.interactions.iter().find(|i| i.sha_sum == sha_sum)
    }

    /// Response recorded for `sha_sum`, or [`StoreError::InteractionNotFound`].
    pub fn find_response(&self, sha_sum: &str) -> Result<&RecordedResponse, StoreError> {
        self.lookup(sha_sum)
            .and_then(|i| i.response.as_ref())
            .ok_or_else(|| StoreError::InteractionNotFound {
                file: self.record_id.clone(),
                hash: sha_sum.to_string(),
            })
    }

    pub fn len(&self) -> usize {
        self.interactions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.interactions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::{Body, HEAD_SHA};
    use serde_json::json;

    fn sample(n: u16) -> (RecordedRequest, RecordedResponse) {
        let req = RecordedRequest {
            method: "GET".into(),
            url: format!("/item/{n}"),
            request: format!("GET /item/{n} HTTP/1.1"),
            previous_request: HEAD_SHA.into(),
            ..Default::default()
        };
        let resp = RecordedResponse {
            status_code: 200 + n,
            headers: [("X-N".to_string(), vec![n.to_string()])].into(),
            body: Body::Segments(vec![json!({ "n": n })]),
        };
        (req, resp)
    }

    #[test]
    fn save_and_open() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("my_test.json");

        let mut file = RecordFile::new("my_test");
        for n in 0..3 {
            let (req, resp) = sample(n);
            file.push(req, format!("hash{n}"), resp);
        }
        file.save(&path).unwrap();

        let loaded = RecordFile::open(&path).unwrap();
        assert_eq!(loaded, file);
        assert_eq!(loaded.len(), 3);
        assert_eq!(loaded.find_response("hash1").unwrap().status_code, 201);
    }

    #[test]
    fn uses_original_field_names() {
        let (req, resp) = sample(0);
        let mut file = RecordFile::new("t");
        file.push(req, "abc".into(), resp);
        let value = serde_json::to_value(&file).unwrap();
        assert_eq!(value["recordID"], "t");
        assert_eq!(value["interactions"][0]["shaSum"], "abc");
        assert_eq!(value["interactions"][0]["response"]["statusCode"], 200);
    }

    #[test]
    fn missing_hash_is_not_found() {
        let file = RecordFile::new("t");
        let err = file.find_response("nope").unwrap_err();
        assert!(err.is_not_found());
        assert!(err.to_string().contains("nope"));
    }

    #[test]
    fn missing_file_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let err = RecordFile::open(dir.path().join("absent.json")).unwrap_err();
        assert!(matches!(err, StoreError::RecordingNotFound(_)));
    }

    #[test]
    fn corrupt_file_is_a_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.json");
        std::fs::write(&path, b"{ not json").unwrap();
        assert!(matches!(
            RecordFile::open(&path),
            Err(StoreError::Json { .. })
        ));
    }
}
