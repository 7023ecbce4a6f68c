//! Typed decoding of the daemon's JSON-RPC replies.
//!
//! Numeric fields arrive as quoted decimal strings; plain numbers are accepted
//! too. A status reply's `files` array carries nested objects with their own
//! `status` keys, so it is detached from the result before the top-level
//! fields are read.

use downloader_core::{DaemonReport, JobId};
use serde::{Deserialize, Deserializer};
use serde_json::{Map, Value};

use crate::types::RpcError;

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<ErrorObject>,
}

#[derive(Debug, Deserialize)]
struct ErrorObject {
    #[serde(default)]
    code: Option<i64>,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct StatusFields {
    status: String,
    #[serde(deserialize_with = "lenient_u64")]
    total_length: u64,
    #[serde(deserialize_with = "lenient_u64")]
    completed_length: u64,
    #[serde(deserialize_with = "lenient_u64")]
    download_speed: u64,
    error_message: String,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum NumberOrString {
    Number(u64),
    Text(String),
}

fn lenient_u64<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    match NumberOrString::deserialize(deserializer)? {
        NumberOrString::Number(n) => Ok(n),
        NumberOrString::Text(text) if text.trim().is_empty() => Ok(0),
        NumberOrString::Text(text) => text.trim().parse().map_err(serde::de::Error::custom),
    }
}

/// Extracts the `result` member, turning an `error` member into [`RpcError::Protocol`].
pub(crate) fn parse_result(body: &str) -> Result<Value, RpcError> {
    if body.trim().is_empty() {
        return Err(RpcError::EmptyResult);
    }
    let envelope: Envelope =
        serde_json::from_str(body).map_err(|err| RpcError::Parse(err.to_string()))?;
    if let Some(error) = envelope.error {
        return Err(RpcError::Protocol {
            code: error.code,
            message: error.message,
        });
    }
    match envelope.result {
        None | Some(Value::Null) => Err(RpcError::EmptyResult),
        Some(value) => Ok(value),
    }
}

/// Reply of an add call: the daemon-assigned job id.
pub fn parse_job_id(body: &str) -> Result<JobId, RpcError> {
    match parse_result(body)? {
        Value::String(id) if !id.is_empty() => Ok(JobId::new(id)),
        Value::String(_) => Err(RpcError::EmptyResult),
        other => Err(RpcError::Parse(format!("expected job id, got {other}"))),
    }
}

/// Reply of a pause/unpause/remove call; the daemon echoes the job id.
pub fn parse_ack(body: &str) -> Result<(), RpcError> {
    parse_result(body).map(|_| ())
}

pub fn parse_status(body: &str) -> Result<DaemonReport, RpcError> {
    let mut object = match parse_result(body)? {
        Value::Object(map) => map,
        other => return Err(RpcError::Parse(format!("expected status object, got {other}"))),
    };

    let files = file_paths(object.remove("files"));
    let fields: StatusFields = serde_json::from_value(Value::Object(object))
        .map_err(|err| RpcError::Parse(err.to_string()))?;

    Ok(DaemonReport {
        state: fields.status,
        total_length: fields.total_length,
        completed_length: fields.completed_length,
        download_speed: fields.download_speed,
        error_message: fields.error_message,
        files,
    })
}

fn file_paths(files: Option<Value>) -> Vec<String> {
    let Some(Value::Array(files)) = files else {
        return Vec::new();
    };
    files
        .iter()
        .filter_map(Value::as_object)
        .filter_map(|file: &Map<String, Value>| file.get("path").and_then(Value::as_str))
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blank_numbers_read_as_zero() {
        let report =
            parse_status(r#"{"id":"dl_1","result":{"status":"waiting","totalLength":""}}"#).unwrap();
        assert_eq!(report.total_length, 0);
        assert_eq!(report.state, "waiting");
    }

    #[test]
    fn non_numeric_length_is_a_parse_error() {
        let err =
            parse_status(r#"{"result":{"status":"active","totalLength":"lots"}}"#).unwrap_err();
        assert!(matches!(err, RpcError::Parse(_)));
    }
}
