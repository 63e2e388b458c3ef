//! Framing: `KEY: VALUE` lines terminated by a blank line, one message per UDP datagram.

use std::collections::BTreeMap;

/// Flat field map carried by every datagram. Always holds `TYPE` once decoded.
pub type Fields = BTreeMap<String, String>;

const SEPARATOR: &str = ": ";
/// Largest payload that fits a single IPv4 UDP datagram.
pub const MAX_DATAGRAM_LEN: usize = 65_507;

/// Encode a field map as `KEY: VALUE` lines followed by a blank line. `TYPE` goes first.
pub fn encode_fields(fields: &Fields) -> Result<Vec<u8>, EncodeError> {
    let mut out = String::new();
    let ordered = fields
        .get_key_value("TYPE")
        .into_iter()
        .chain(fields.iter().filter(|(k, _)| k.as_str() != "TYPE"));
    for (key, value) in ordered {
        if key.is_empty() || key.contains(SEPARATOR) || key.contains(['\n', '\r']) {
            return Err(EncodeError::InvalidKey(key.clone()));
        }
        if value.contains(['\n', '\r']) {
            return Err(EncodeError::InvalidValue(key.clone()));
        }
        out.push_str(key);
        out.push_str(SEPARATOR);
        out.push_str(value);
        out.push('\n');
    }
    out.push('\n');
    if out.len() > MAX_DATAGRAM_LEN {
        return Err(EncodeError::TooLarge(out.len()));
    }
    Ok(out.into_bytes())
}

/// Error encoding a field map (a key or value would break the line format, or the datagram is too big).
#[derive(Debug, thiserror::Error)]
pub enum EncodeError {
    #[error("field name {0:?} cannot be framed")]
    InvalidKey(String),
    #[error("value of field {0} contains a line break")]
    InvalidValue(String),
    #[error("datagram of {0} bytes exceeds the UDP limit")]
    TooLarge(usize),
}

/// Decode one datagram into a field map. Lines without `": "` are skipped.
pub fn decode_fields(bytes: &[u8]) -> Result<Fields, DecodeError> {
    let text = std::str::from_utf8(bytes).map_err(|_| DecodeError::NotUtf8)?;
    let mut fields = Fields::new();
    for line in text.split('\n') {
        let line = line.strip_suffix('\r').unwrap_or(line);
        if let Some((key, value)) = line.split_once(SEPARATOR) {
            let key = key.trim();
            if key.is_empty() {
                continue;
            }
            fields.insert(key.to_string(), value.trim().to_string());
        }
    }
    if !fields.contains_key("TYPE") {
        return Err(DecodeError::MissingType);
    }
    Ok(fields)
}

/// Error decoding a datagram.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("datagram is not valid UTF-8")]
    NotUtf8,
    #[error("message has no TYPE field")]
    MissingType,
    #[error("unknown message type {0}")]
    UnknownType(String),
    #[error("missing field {0}")]
    MissingField(&'static str),
    #[error("field {field} has invalid value {value:?}")]
    InvalidField { field: &'static str, value: String },
}
