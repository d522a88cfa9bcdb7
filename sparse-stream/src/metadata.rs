//! Stream metadata header.

use serde::{Deserialize, Deserializer, Serialize};

use crate::StreamError;

/// Current stream format version. Version 1 predates compression
/// support; readers accept both.
pub const STREAM_VERSION: u32 = 2;

fn default_stream_version() -> u32 {
    1
}

/// Metadata payload of the leading META frame.
///
/// Field names on the wire are camelCase, the format predates this
/// implementation. Consumers must tolerate unknown keys.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Metadata {
    pub virtual_size: u64,
    /// Sum of all DATA frame lengths in the stream.
    pub data_size: u64,
    #[serde(default)]
    pub date: String,
    pub disk_name: String,
    pub disk_format: String,
    /// Checkpoint this stream was taken at. Differential streams carry
    /// a unix timestamp here instead of a name.
    #[serde(default, deserialize_with = "string_or_integer")]
    pub checkpoint_name: String,
    pub compressed: bool,
    #[serde(default)]
    pub compression_method: Option<String>,
    /// None for full and copy streams.
    #[serde(default, deserialize_with = "optional_string")]
    pub parent_checkpoint: Option<String>,
    pub incremental: bool,
    #[serde(default = "default_stream_version")]
    pub stream_version: u32,
}

/// Accept both a JSON string and an integer checkpoint identifier.
fn string_or_integer<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum NameOrStamp {
        Name(String),
        Stamp(i64),
    }
    Ok(match NameOrStamp::deserialize(deserializer)? {
        NameOrStamp::Name(name) => name,
        NameOrStamp::Stamp(stamp) => stamp.to_string(),
    })
}

// Streams written by older tool versions encode a missing parent as
// `false` instead of `null`.
fn optional_string<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<String>, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Compat {
        Name(Option<String>),
        Legacy(bool),
    }
    Ok(match Compat::deserialize(deserializer)? {
        Compat::Name(name) => name,
        Compat::Legacy(_) => None,
    })
}

/// Serialize the metadata header payload.
pub fn dump_metadata(meta: &Metadata) -> Result<Vec<u8>, StreamError> {
    serde_json::to_vec_pretty(meta)
        .map_err(|err| StreamError::format(format!("unable to encode metadata - {}", err)))
}

/// Parse a metadata header payload.
pub fn load_metadata(payload: &[u8]) -> Result<Metadata, StreamError> {
    serde_json::from_slice(payload)
        .map_err(|err| StreamError::format(format!("invalid meta header - {}", err)))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn metadata_roundtrip() {
        let meta = Metadata {
            virtual_size: 1 << 30,
            data_size: 4096,
            date: "2024-05-01T10:00:00+00:00".to_string(),
            disk_name: "vda".to_string(),
            disk_format: "qcow2".to_string(),
            checkpoint_name: "virtsparse.1".to_string(),
            compressed: false,
            compression_method: None,
            parent_checkpoint: Some("virtsparse.0".to_string()),
            incremental: true,
            stream_version: STREAM_VERSION,
        };
        let payload = dump_metadata(&meta).unwrap();
        assert_eq!(load_metadata(&payload).unwrap(), meta);
    }

    #[test]
    fn tolerates_unknown_keys_and_integer_checkpoint() {
        let payload = br#"{
            "virtualSize": 65536,
            "dataSize": 0,
            "diskName": "sda",
            "diskFormat": "raw",
            "checkpointName": 1714552800,
            "compressed": false,
            "parentCheckpoint": false,
            "incremental": true,
            "futureExtension": {"nested": true}
        }"#;
        let meta = load_metadata(payload).unwrap();
        assert_eq!(meta.checkpoint_name, "1714552800");
        assert_eq!(meta.parent_checkpoint, None);
        assert_eq!(meta.stream_version, 1);
    }

    #[test]
    fn rejects_garbage() {
        assert!(matches!(
            load_metadata(b"not json"),
            Err(StreamError::Format(_))
        ));
    }
}
