//! Contact list normalization.
//!
//! Accepts store rows (string → JSON value maps), delimited text with a header row or
//! already normalized records, and turns them into an ordered list of deliverable
//! [`ContactRecord`]s.

use std::path::Path;

use serde_json::{Map, Value};

use crate::{
    domain::{ContactRecord, ImageRef},
    errors::Error,
    Result,
};

const PHONE_KEYS: &[&str] = &["phone", "telefone", "tel"];
const MESSAGE_KEYS: &[&str] = &["message", "mensagem"];
const IMAGE_KEYS: &[&str] = &["image", "imagem", "foto"];

pub type Row = Map<String, Value>;

/// Raw, not yet normalized contact input.
#[derive(Clone, Debug)]
pub enum RawContacts {
    Rows(Vec<Row>),
    Delimited(String),
    /// Output of an earlier `normalize`, e.g. after re-send filtering.
    Records(Vec<ContactRecord>),
}

pub fn normalize(raw: &RawContacts) -> Result<Vec<ContactRecord>> {
    let rows: Vec<Vec<(String, Field)>> = match raw {
        RawContacts::Rows(rows) => rows.iter().map(row_fields).collect(),
        RawContacts::Delimited(text) => parse_delimited(text)?
            .into_iter()
            .map(|r| r.into_iter().map(|(k, v)| (k, Field::Text(v))).collect())
            .collect(),
        RawContacts::Records(records) => {
            return Ok(records
                .iter()
                .filter(|c| !c.phone.is_empty())
                .cloned()
                .collect())
        }
    };

    Ok(rows.iter().filter_map(|r| record_from_fields(r)).collect())
}

/// Read a contact file: `.json` (array of objects) or delimited text.
pub fn load_contacts_file(path: &Path) -> Result<RawContacts> {
    if !path.is_file() {
        return Err(Error::SourceFormat(format!(
            "contact file not found: {}",
            path.display()
        )));
    }
    let raw = std::fs::read_to_string(path)?;
    tracing::debug!(bytes = raw.len(), path = %path.display(), "read contact file");

    let is_json = path
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("json"));
    if !is_json {
        return Ok(RawContacts::Delimited(raw));
    }

    let value: Value = serde_json::from_str(&raw)
        .map_err(|e| Error::SourceFormat(format!("invalid JSON contact list: {e}")))?;
    let Value::Array(items) = value else {
        return Err(Error::SourceFormat(
            "JSON contact list must be an array of objects".to_string(),
        ));
    };
    let rows = items
        .into_iter()
        .map(|item| match item {
            Value::Object(map) => Ok(map),
            other => Err(Error::SourceFormat(format!(
                "JSON contact entry is not an object: {other}"
            ))),
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(RawContacts::Rows(rows))
}

enum Field {
    Text(String),
    Bytes(Vec<u8>),
}

fn row_fields(row: &Row) -> Vec<(String, Field)> {
    row.iter()
        .filter_map(|(k, v)| {
            let field = match v {
                Value::String(s) => Field::Text(s.clone()),
                Value::Number(n) => Field::Text(number_text(n)),
                Value::Array(xs) => Field::Bytes(
                    xs.iter()
                        .filter_map(|x| x.as_u64())
                        .filter_map(|x| u8::try_from(x).ok())
                        .collect(),
                ),
                Value::Null | Value::Bool(_) | Value::Object(_) => return None,
            };
            Some((k.clone(), field))
        })
        .collect()
}

/// Integral numbers print without a fraction so `5511988887777.0` stays the same phone.
fn number_text(n: &serde_json::Number) -> String {
    if let Some(u) = n.as_u64() {
        return u.to_string();
    }
    if let Some(i) = n.as_i64() {
        return i.to_string();
    }
    match n.as_f64() {
        Some(f) if f.is_finite() && f.fract() == 0.0 => format!("{f:.0}"),
        _ => n.to_string(),
    }
}

/// First synonym whose value is non-empty and passes `accept`.
fn lookup<'a>(
    fields: &'a [(String, Field)],
    keys: &[&str],
    accept: impl Fn(&Field) -> bool,
) -> Option<&'a Field> {
    keys.iter().find_map(|want| {
        fields.iter().find_map(|(k, v)| {
            let non_empty = match v {
                Field::Text(s) => !s.trim().is_empty(),
                Field::Bytes(b) => !b.is_empty(),
            };
            (k.trim().eq_ignore_ascii_case(want) && non_empty && accept(v)).then_some(v)
        })
    })
}

fn is_text(f: &Field) -> bool {
    matches!(f, Field::Text(_))
}

fn record_from_fields(fields: &[(String, Field)]) -> Option<ContactRecord> {
    let phone = match lookup(fields, PHONE_KEYS, is_text) {
        Some(Field::Text(s)) => digits_only(s),
        _ => String::new(),
    };
    if phone.is_empty() {
        return None;
    }

    let message = match lookup(fields, MESSAGE_KEYS, is_text) {
        Some(Field::Text(s)) => non_empty_trimmed(s),
        _ => None,
    };

    let image = match lookup(fields, IMAGE_KEYS, |_| true) {
        Some(Field::Text(s)) => non_empty_trimmed(s).map(ImageRef::path),
        Some(Field::Bytes(b)) => Some(ImageRef::blob(b.clone())),
        None => None,
    };

    Some(ContactRecord {
        phone,
        message,
        image,
    })
}

pub fn digits_only(s: &str) -> String {
    s.chars().filter(|c| c.is_ascii_digit()).collect()
}

fn non_empty_trimmed(s: &str) -> Option<String> {
    let t = s.trim();
    if t.is_empty() {
        None
    } else {
        Some(t.to_string())
    }
}

/// Parse header + data rows. Both `,` and `;` separate cells.
fn parse_delimited(text: &str) -> Result<Vec<Vec<(String, String)>>> {
    let text = text.strip_prefix('\u{feff}').unwrap_or(text);
    let mut records = split_records(text)?.into_iter();

    let Some(header) = records.next() else {
        return Ok(Vec::new());
    };
    let header: Vec<String> = header.into_iter().map(|h| h.trim().to_string()).collect();
    if header.iter().all(|h| h.is_empty()) {
        return Err(Error::SourceFormat(
            "header row has no column names".to_string(),
        ));
    }

    Ok(records
        .map(|cells| {
            header
                .iter()
                .cloned()
                .zip(cells.into_iter().map(|c| c.trim().to_string()))
                .collect()
        })
        .collect())
}

fn split_records(text: &str) -> Result<Vec<Vec<String>>> {
    let mut records = Vec::new();
    let mut record: Vec<String> = Vec::new();
    let mut cell = String::new();
    let mut in_quotes = false;
    let mut chars = text.chars().peekable();

    while let Some(c) = chars.next() {
        if in_quotes {
            match c {
                '"' if chars.peek() == Some(&'"') => {
                    chars.next();
                    cell.push('"');
                }
                '"' => in_quotes = false,
                _ => cell.push(c),
            }
            continue;
        }

        match c {
            '"' if cell.trim().is_empty() => {
                cell.clear();
                in_quotes = true;
            }
            ',' | ';' => record.push(std::mem::take(&mut cell)),
            '\r' if chars.peek() == Some(&'\n') => {}
            '\n' | '\r' => {
                record.push(std::mem::take(&mut cell));
                push_record(&mut records, std::mem::take(&mut record));
            }
            _ => cell.push(c),
        }
    }

    if in_quotes {
        return Err(Error::SourceFormat("unterminated quoted field".to_string()));
    }
    if !cell.is_empty() || !record.is_empty() {
        record.push(cell);
        push_record(&mut records, record);
    }
    Ok(records)
}

fn push_record(records: &mut Vec<Vec<String>>, record: Vec<String>) {
    // Blank lines are skipped, not treated as rows.
    if record.iter().all(|c| c.trim().is_empty()) {
        return;
    }
    records.push(record);
}
