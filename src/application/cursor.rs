//! Opaque keyset cursors for list pagination.

use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::error::Error;
use super::store::Row;
use crate::domain::base;

/// Cursor parameters of a list request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CursorQuery {
    /// Token of the boundary row; `None` asks for the first page.
    pub value: Option<String>,
    pub fields: Vec<String>,
    /// Page after the token when true, before it otherwise.
    pub next: bool,
}

/// Decoded cursor: one value per cursor field plus the id tiebreaker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CursorToken {
    pub values: Vec<Value>,
    pub id: String,
}

impl CursorToken {
    /// Token describing `row`'s position under `fields`.
    pub fn from_row(row: &Row, fields: &[String]) -> Self {
        Self {
            values: fields
                .iter()
                .map(|field| row.get(field).cloned().unwrap_or(Value::Null))
                .collect(),
            id: row
                .get(base::ID)
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
        }
    }

    pub fn encode(&self) -> String {
        // A JSON array of values and a string cannot fail to serialize.
        let serialized = serde_json::to_vec(self).unwrap_or_default();
        URL_SAFE_NO_PAD.encode(serialized)
    }

    pub fn decode(cursor: &str, fields: usize) -> Result<Self, Error> {
        let bytes = URL_SAFE_NO_PAD
            .decode(cursor)
            .map_err(|err| Error::bad_request(format!("invalid cursor: {err}")))?;
        let token: CursorToken = serde_json::from_slice(&bytes)
            .map_err(|err| Error::bad_request(format!("invalid cursor: {err}")))?;
        if token.values.len() != fields {
            return Err(Error::bad_request(format!(
                "invalid cursor: expected {fields} values, found {}",
                token.values.len()
            )));
        }
        Ok(token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn token_captures_fields_and_id() {
        let row = json!({ "id": "u3", "name": "carol", "age": 41 })
            .as_object()
            .cloned()
            .expect("object");
        let token = CursorToken::from_row(&row, &["age".to_string(), "missing".to_string()]);
        assert_eq!(token.values, vec![json!(41), Value::Null]);
        assert_eq!(token.id, "u3");
        let decoded = CursorToken::decode(&token.encode(), 2).expect("decode");
        assert_eq!(decoded, token);
    }

    #[test]
    fn malformed_or_mismatched_tokens_are_bad_requests() {
        assert!(matches!(
            CursorToken::decode("%%%", 1),
            Err(Error::BadRequest(_))
        ));
        let token = CursorToken {
            values: vec![json!(1)],
            id: "x".into(),
        };
        assert!(matches!(
            CursorToken::decode(&token.encode(), 2),
            Err(Error::BadRequest(_))
        ));
    }
}
