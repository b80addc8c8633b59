//! Write transaction parameters and the persisted transaction record

use crate::obj_file::DiffInfo;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Declared sizes of a version being written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjSizes {
    pub header: u64,
    /// Physical segment bytes; `None` (`-1` on the wire) grows by appends.
    #[serde(with = "unknown_as_negative")]
    pub segments: Option<u64>,
}

/// How segment bytes arrive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionType {
    /// Known size, offset-addressed writes.
    Write,
    /// Unknown size, sequential appends.
    Append,
}

/// What a caller asks for when starting a transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionParams {
    pub version: u64,
    #[serde(default)]
    pub is_new_obj: bool,
    pub sizes: ObjSizes,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diff: Option<DiffInfo>,
}

impl TransactionParams {
    pub fn transaction_type(&self) -> TransactionType {
        match self.sizes.segments {
            Some(_) => TransactionType::Write,
            None => TransactionType::Append,
        }
    }
}

/// State of an open transaction, persisted inside its lease folder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionRecord {
    pub transaction_id: String,
    pub transaction_type: TransactionType,
    pub version: u64,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_new_obj: bool,
    pub sizes: ObjSizes,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diff: Option<DiffInfo>,
    pub header_offset: u64,
    pub segs_offset: u64,
    pub started_at: DateTime<Utc>,
}

mod unknown_as_negative {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<u64>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(v) => s.serialize_u64(*v),
            None => s.serialize_i64(-1),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<u64>, D::Error> {
        let value = i64::deserialize(d)?;
        Ok(u64::try_from(value).ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_sentinel_on_the_wire() {
        let params: TransactionParams = serde_json::from_str(
            r#"{"version":1,"isNewObj":true,"sizes":{"header":20,"segments":-1}}"#,
        )
        .unwrap();
        assert_eq!(params.sizes.segments, None);
        assert_eq!(params.transaction_type(), TransactionType::Append);
        assert!(params.is_new_obj);

        let json = serde_json::to_string(&params.sizes).unwrap();
        assert_eq!(json, r#"{"header":20,"segments":-1}"#);
    }

    #[test]
    fn test_record_omits_defaults() {
        let record = TransactionRecord {
            transaction_id: "t1".into(),
            transaction_type: TransactionType::Write,
            version: 2,
            is_new_obj: false,
            sizes: ObjSizes { header: 1, segments: Some(2) },
            diff: None,
            header_offset: 8,
            segs_offset: 9,
            started_at: DateTime::from_timestamp(0, 0).unwrap(),
        };
        let json = serde_json::to_value(&record).unwrap();
        assert!(json.get("isNewObj").is_none());
        assert!(json.get("diff").is_none());
        assert_eq!(json["transactionType"], "write");
        let back: TransactionRecord = serde_json::from_value(json).unwrap();
        assert_eq!(back, record);
    }
}
