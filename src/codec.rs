//! Decoding backend snapshot payloads into canonical records.
//!
//! Decoding is pure and deliberately lax: backends deliver loose field bags,
//! and transitional snapshots (server timestamp not yet resolved, fields
//! missing entirely) must decode to something renderable rather than fail.

use crate::backend::{BackendPayload, FieldMap, FIELD_CLIENT_TOKEN, FIELD_CONTENT, FIELD_CREATED_AT};
use crate::types::{ClientToken, CreatedAt, Record, RecordId, Timestamp};
use serde_json::Value;

/// Decode a backend payload into canonical records.
///
/// Key-value payloads decode in unspecified order; the caller applies the
/// ordering policy afterwards. Ordered payloads keep the order given.
pub fn decode(payload: BackendPayload) -> Vec<Record> {
    match payload {
        BackendPayload::KeyValue(map) => map
            .into_iter()
            .map(|(key, fields)| decode_fields(key, &fields))
            .collect(),
        BackendPayload::Ordered(docs) => docs
            .into_iter()
            .map(|doc| decode_fields(doc.id, &doc.fields))
            .collect(),
    }
}

/// Decode one field bag. Never fails: absent content becomes an empty
/// string, anything but a numeric timestamp stays `Pending`.
fn decode_fields(id: String, fields: &FieldMap) -> Record {
    let content = fields
        .get(FIELD_CONTENT)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    let created_at = fields
        .get(FIELD_CREATED_AT)
        .and_then(Value::as_i64)
        .map(|micros| CreatedAt::At(Timestamp(micros)))
        .unwrap_or(CreatedAt::Pending);

    let token = fields
        .get(FIELD_CLIENT_TOKEN)
        .and_then(Value::as_str)
        .map(|s| ClientToken(s.to_string()));

    Record {
        id: RecordId(id),
        content,
        created_at,
        token,
    }
}
