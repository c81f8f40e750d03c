use bson::{Bson, Document};
use rand::{distr::Alphanumeric, Rng};

use crate::error::{Error, Result};

/// Length of the random ids used for sessions, subscription handles and
/// unmatchable selector rewrites.
const RANDOM_ID_LEN: usize = 17;

/// Generates a random alphanumeric identifier. Collisions are what the
/// callers care about, not unpredictability.
pub(crate) fn random_id() -> String {
    rand::rng()
        .sample_iter(&Alphanumeric)
        .take(RANDOM_ID_LEN)
        .map(char::from)
        .collect()
}

/// Serializes a value deterministically: object keys are emitted in sorted
/// order at every level, so two structurally equal values always produce the
/// same string. Used as the dedup key for observe multiplexers.
pub(crate) fn canonical_stringify(value: &Bson) -> Result<String> {
    let mut out = String::new();
    write_canonical(value, &mut out)?;
    Ok(out)
}

fn write_canonical(value: &Bson, out: &mut String) -> Result<()> {
    match value {
        Bson::Document(doc) => {
            out.push('{');
            let mut keys: Vec<&String> = doc.keys().collect();
            keys.sort();
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_json_string(key, out);
                out.push(':');
                if let Some(field) = doc.get(key.as_str()) {
                    write_canonical(field, out)?;
                }
            }
            out.push('}');
        }
        Bson::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out)?;
            }
            out.push(']');
        }
        other => {
            let json = serde_json::to_string(&other).map_err(|e| {
                Error::invalid_argument(format!("unserializable value in selector: {}", e))
            })?;
            out.push_str(&json);
        }
    }
    Ok(())
}

fn write_json_string(s: &str, out: &mut String) {
    out.push('"');
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if (c as u32) < 0x20 => {
                out.push_str(&format!("\\u{:04x}", c as u32));
            }
            c => out.push(c),
        }
    }
    out.push('"');
}

/// Extracts a document's `_id`, which must be a string.
pub(crate) fn document_id(doc: &Document) -> Result<&str> {
    match doc.get("_id") {
        Some(Bson::String(id)) => Ok(id),
        Some(other) => Err(Error::invalid_argument(format!(
            "document _id must be a string, got {:?}",
            other
        ))),
        None => Err(Error::invalid_argument("document is missing _id")),
    }
}

/// The set of specific string ids a selector can match, if it is restricted
/// to one: `{_id: "x"}` or `{_id: {$in: ["x", "y"]}}`. A selector with a
/// non-string or unrestricted id filter returns `None`, which callers treat
/// as "may match any id".
pub(crate) fn selector_id_filter(selector: &Document) -> Option<Vec<String>> {
    match selector.get("_id")? {
        Bson::String(id) => Some(vec![id.clone()]),
        Bson::Document(spec) if spec.len() == 1 => match spec.get("$in")? {
            Bson::Array(ids) => ids
                .iter()
                .map(|id| match id {
                    Bson::String(s) => Some(s.clone()),
                    _ => None,
                })
                .collect(),
            _ => None,
        },
        _ => None,
    }
}

/// Returns the document with its `_id` field stripped, the shape in which
/// fields travel to clients (`added`/`changed` carry the id separately).
pub(crate) fn fields_without_id(doc: &Document) -> Document {
    let mut fields = doc.clone();
    fields.remove("_id");
    fields
}
