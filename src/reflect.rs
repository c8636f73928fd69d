//! Aggregate <-> row reflection.
//!
//! `spec.md` treats this mapping as an external collaborator: "the
//! reflection/aggregate-mapping helper ... its only contract is that it can
//! flatten an aggregate into positional textual parameters and rebuild an
//! aggregate from a row of textual columns." This module is that contract,
//! implemented the way the teacher's `executor.rs` converts between its own
//! `LazyRow`/`RowValue` representation and caller-facing values, generalized
//! from a Python-object target to a `serde`-derived Rust target.
//!
//! A row crosses this boundary as a `{column_name: text}` JSON object; the
//! caller's type derives `serde::Deserialize` (for [`FromRow`]) and/or
//! `serde::Serialize` (for [`ToParams`]). "Strict" vs "loose" decoding
//! (§8 scenario S2) is the caller's own `#[serde(deny_unknown_fields)]`
//! choice on their struct — [`decode_row_strict`] and [`decode_row_loose`]
//! run the identical `serde_json` deserialize; the difference in observed
//! behavior comes entirely from whether the target type opted into
//! `deny_unknown_fields`.

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value as JsonValue;

use crate::error::{ErrorCode, PgOpError};
use crate::statement::SharedColumns;
use crate::wire::types::{decode_array_literal, PgValue};

/// Flattens a native record into positional textual parameters.
///
/// Blanket-implemented for any `T: Serialize` whose `serde_json`
/// representation is a JSON object: fields become parameters in the order
/// `serde_json` emits them (stable with the `preserve_order` feature,
/// i.e. struct field declaration order).
pub trait ToParams {
    fn to_params(&self) -> Result<Vec<PgValue>, PgOpError>;
}

impl<T: Serialize> ToParams for T {
    fn to_params(&self) -> Result<Vec<PgValue>, PgOpError> {
        let json = serde_json::to_value(self).map_err(|e| PgOpError {
            code: ErrorCode::Unknown,
            message: format!("failed to flatten aggregate to params: {}", e),
            diagnostics: None,
        })?;
        let obj = json.as_object().ok_or_else(|| PgOpError {
            code: ErrorCode::Unknown,
            message: "aggregate does not serialize to a JSON object".to_string(),
            diagnostics: None,
        })?;
        Ok(obj.values().map(json_value_to_pgvalue).collect())
    }
}

fn json_value_to_pgvalue(value: &JsonValue) -> PgValue {
    match value {
        JsonValue::Null => PgValue::Null,
        JsonValue::Bool(b) => PgValue::Bool(*b),
        JsonValue::Number(n) => {
            if let Some(i) = n.as_i64() {
                PgValue::Int8(i)
            } else {
                PgValue::Float8(n.as_f64().unwrap_or_default())
            }
        }
        JsonValue::String(s) => PgValue::Text(s.clone()),
        JsonValue::Array(items) => PgValue::Array(items.iter().map(json_value_to_pgvalue).collect()),
        JsonValue::Object(_) => PgValue::Json(value.to_string()),
    }
}

/// Rebuilds a native record from one row of textual columns.
///
/// Blanket-implemented for any `T: DeserializeOwned` via [`decode_row_loose`].
/// Use [`decode_row_strict`] directly (with a `deny_unknown_fields` target
/// type) when an unexpected extra column should be a hard error rather than
/// silently dropped.
pub trait FromRow: Sized {
    fn from_row(columns: &SharedColumns, row: &[Option<String>]) -> Result<Self, PgOpError>;
}

impl<T: DeserializeOwned> FromRow for T {
    fn from_row(columns: &SharedColumns, row: &[Option<String>]) -> Result<Self, PgOpError> {
        decode_row_loose(columns, row)
    }
}

fn row_to_json_object(columns: &SharedColumns, row: &[Option<String>]) -> JsonValue {
    let mut map = serde_json::Map::with_capacity(row.len());
    for (i, value) in row.iter().enumerate() {
        let key = columns
            .get(i)
            .map(|c| c.name.clone())
            .unwrap_or_else(|| format!("_{}", i));
        let json_value = match value {
            Some(text) => text_column_to_json(text),
            None => JsonValue::Null,
        };
        map.insert(key, json_value);
    }
    JsonValue::Object(map)
}

/// Convert one textual column to the JSON shape `FromRow` targets expect.
///
/// A PostgreSQL array literal (`{a,b,c}`) decodes as a JSON array of its
/// element texts rather than the literal string, so a target field typed
/// `Vec<String>` (or `Vec<Option<String>>`) round-trips instead of failing
/// to deserialize against the raw `"{a,b,c}"` text. Anything that isn't an
/// array literal is passed through as a JSON string, same as before.
fn text_column_to_json(text: &str) -> JsonValue {
    let trimmed = text.trim();
    if trimmed.starts_with('{') && trimmed.ends_with('}') {
        if let Ok(elements) = decode_array_literal(trimmed) {
            return JsonValue::Array(
                elements
                    .into_iter()
                    .map(|e| e.map(JsonValue::String).unwrap_or(JsonValue::Null))
                    .collect(),
            );
        }
    }
    JsonValue::String(text.to_string())
}

/// Decode one row into `T`. Fails (`ErrorCode::Unknown`) if `T` carries
/// `#[serde(deny_unknown_fields)]` and the row has a column `T` doesn't
/// declare.
pub fn decode_row_strict<T: DeserializeOwned>(
    columns: &SharedColumns,
    row: &[Option<String>],
) -> Result<T, PgOpError> {
    let json = row_to_json_object(columns, row);
    serde_json::from_value(json).map_err(|e| PgOpError {
        code: ErrorCode::Unknown,
        message: format!("strict row decode failed: {}", e),
        diagnostics: None,
    })
}

/// Decode one row into `T`, silently dropping any column `T` doesn't
/// declare (the default `serde` behavior absent `deny_unknown_fields`).
pub fn decode_row_loose<T: DeserializeOwned>(
    columns: &SharedColumns,
    row: &[Option<String>],
) -> Result<T, PgOpError> {
    let json = row_to_json_object(columns, row);
    serde_json::from_value(json).map_err(|e| PgOpError {
        code: ErrorCode::Unknown,
        message: format!("row decode failed: {}", e),
        diagnostics: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::protocol::FieldDescription;
    use crate::wire::types::Oid;
    use std::sync::Arc;
    use serde::Deserialize;

    fn columns(names: &[&str]) -> SharedColumns {
        Arc::new(
            names
                .iter()
                .map(|n| FieldDescription {
                    name: n.to_string(),
                    table_oid: 0,
                    column_attr: 0,
                    type_oid: Oid::TEXT,
                    type_size: -1,
                    type_modifier: -1,
                    format: crate::wire::protocol::Format::Text,
                })
                .collect(),
        )
    }

    #[derive(Debug, Deserialize, PartialEq)]
    struct LooseProfile {
        age: String,
        city: String,
        flags: Vec<String>,
    }

    #[derive(Debug, Deserialize, PartialEq)]
    #[serde(deny_unknown_fields)]
    struct StrictProfile {
        age: String,
        city: String,
        flags: Vec<String>,
    }

    #[derive(Debug, Serialize)]
    struct NewUser {
        name: String,
        age: i64,
        active: bool,
    }

    #[test]
    fn test_s2_loose_decode_drops_unknown_column() {
        let cols = columns(&["age", "city", "flags", "unknown"]);
        let row = vec![
            Some("1".to_string()),
            Some("A".to_string()),
            Some("{x}".to_string()),
            Some("123".to_string()),
        ];
        let decoded: LooseProfile = decode_row_loose(&cols, &row).unwrap();
        assert_eq!(decoded.age, "1");
        assert_eq!(decoded.city, "A");
    }

    #[test]
    fn test_s2_strict_decode_rejects_unknown_column() {
        let cols = columns(&["age", "city", "flags", "unknown"]);
        let row = vec![
            Some("1".to_string()),
            Some("A".to_string()),
            Some("{x}".to_string()),
            Some("123".to_string()),
        ];
        let result: Result<StrictProfile, PgOpError> = decode_row_strict(&cols, &row);
        assert!(result.is_err());
    }

    #[test]
    fn test_s2_strict_decode_accepts_exact_columns() {
        let cols = columns(&["age", "city", "flags"]);
        let row = vec![
            Some("1".to_string()),
            Some("A".to_string()),
            Some("{x}".to_string()),
        ];
        let decoded: StrictProfile = decode_row_strict(&cols, &row).unwrap();
        assert_eq!(decoded.age, "1");
    }

    #[test]
    fn test_null_column_becomes_none() {
        #[derive(Debug, Deserialize)]
        struct Nullable {
            maybe: Option<String>,
        }
        let cols = columns(&["maybe"]);
        let row = vec![None];
        let decoded: Nullable = decode_row_loose(&cols, &row).unwrap();
        assert!(decoded.maybe.is_none());
    }

    #[test]
    fn test_to_params_preserves_field_order() {
        let user = NewUser {
            name: "ada".to_string(),
            age: 30,
            active: true,
        };
        let params = user.to_params().unwrap();
        assert_eq!(params.len(), 3);
        assert_eq!(params[0], PgValue::Text("ada".to_string()));
        assert_eq!(params[1], PgValue::Int8(30));
        assert_eq!(params[2], PgValue::Bool(true));
    }
}
