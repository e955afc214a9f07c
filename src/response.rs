//! Client-facing response shapes.
//!
//! These mirror the header/kvs/count/more layout of a coordination store's
//! KV API so a wire layer can serialize them directly. Records are mapped
//! field by field: `revision` becomes `mod_revision`, and the absolute ttl is
//! reported as `lease`.

use serde::{Deserialize, Serialize};

use crate::types::{DeleteResult, KeyValue, ListResult, PutResult, Revision};

/// Store revision a response was served at.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct ResponseHeader {
    pub revision: i64,
}

impl ResponseHeader {
    pub fn at(revision: Revision) -> Self {
        Self {
            revision: revision.as_raw(),
        }
    }
}

/// One key as a client sees it.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct ResponseKeyValue {
    pub key: String,
    pub create_revision: i64,
    pub mod_revision: i64,
    pub version: i64,
    pub value: Vec<u8>,
    pub lease: i64,
}

impl From<&KeyValue> for ResponseKeyValue {
    fn from(kv: &KeyValue) -> Self {
        Self {
            key: kv.key.clone(),
            create_revision: kv.create_revision.as_raw(),
            mod_revision: kv.revision.as_raw(),
            version: kv.version,
            value: kv.value.clone(),
            lease: kv.ttl,
        }
    }
}

impl From<KeyValue> for ResponseKeyValue {
    fn from(kv: KeyValue) -> Self {
        Self {
            create_revision: kv.create_revision.as_raw(),
            mod_revision: kv.revision.as_raw(),
            version: kv.version,
            lease: kv.ttl,
            key: kv.key,
            value: kv.value,
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct PutResponse {
    pub header: ResponseHeader,
    /// The value the put replaced, if the key existed.
    pub prev_kv: Option<ResponseKeyValue>,
}

impl From<PutResult> for PutResponse {
    fn from(result: PutResult) -> Self {
        Self {
            header: ResponseHeader::at(result.record.revision),
            prev_kv: result.prior.map(ResponseKeyValue::from),
        }
    }
}

/// Result of a get or list.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct RangeResponse {
    pub header: ResponseHeader,
    pub kvs: Vec<ResponseKeyValue>,
    /// True when the listing was cut off at its limit.
    pub more: bool,
    /// Number of keys in this page, also when `kvs` was dropped for a
    /// count-only request.
    pub count: i64,
}

impl RangeResponse {
    /// Shapes a listing. With `count_only` the keys are counted but not
    /// returned.
    pub fn from_list(list: ListResult, count_only: bool) -> Self {
        let count = list.kvs.len() as i64;
        let kvs = if count_only {
            Vec::new()
        } else {
            list.kvs.into_iter().map(ResponseKeyValue::from).collect()
        };

        Self {
            header: ResponseHeader::at(list.revision),
            kvs,
            more: list.more,
            count,
        }
    }
}

impl From<ListResult> for RangeResponse {
    fn from(list: ListResult) -> Self {
        Self::from_list(list, false)
    }
}

#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct DeleteResponse {
    pub header: ResponseHeader,
    pub deleted: i64,
    pub prev_kvs: Vec<ResponseKeyValue>,
}

impl DeleteResponse {
    /// `current` is the store revision, reported when the delete wrote
    /// nothing.
    pub fn from_result(result: DeleteResult, current: Revision) -> Self {
        let revision = result
            .record
            .as_ref()
            .map_or(current, |record| record.revision);

        Self {
            header: ResponseHeader::at(revision),
            deleted: result.deleted() as i64,
            prev_kvs: result.prior.into_iter().map(ResponseKeyValue::from).collect(),
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EventType {
    Put,
    Delete,
}

/// One change-feed record, shaped for a watcher.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct WatchEvent {
    #[serde(rename = "type")]
    pub kind: EventType,
    pub kv: ResponseKeyValue,
    pub prev_kv: Option<ResponseKeyValue>,
}

impl From<KeyValue> for WatchEvent {
    fn from(record: KeyValue) -> Self {
        let kind = if record.del {
            EventType::Delete
        } else {
            EventType::Put
        };
        let prev_kv = record.previous().map(ResponseKeyValue::from);

        Self {
            kind,
            kv: record.into(),
            prev_kv,
        }
    }
}
