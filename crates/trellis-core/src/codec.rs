//! JSON ⇄ YAML conversion for the resolve pipeline.
//!
//! Documents enter and leave as JSON bytes; template expansion happens over a
//! YAML rendering so the text-level rewrites see the same delimiters an
//! author wrote. Round-trips are semantically equivalent, not byte-identical.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Renders a JSON document as YAML text with two-space indentation.
pub fn json_to_yaml(input: &[u8]) -> Result<String, CodecError> {
    let value: serde_json::Value = serde_json::from_slice(input)?;

    Ok(serde_yaml::to_string(&value)?)
}

/// Parses YAML text and serializes it back to compact JSON bytes.
pub fn yaml_to_json(input: &str) -> Result<Vec<u8>, CodecError> {
    let value: serde_json::Value = serde_yaml::from_str(input)?;

    Ok(serde_json::to_vec(&value)?)
}
