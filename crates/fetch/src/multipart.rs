use std::collections::HashMap;

use crate::body::FormDataError;
use crate::headers::Headers;

/// Parse a `multipart/form-data` body into field name/value pairs.
///
/// The boundary comes from the `Content-Type` header's boundary parameter.
/// Later fields with a repeated name overwrite earlier ones.
pub fn parse_multipart(
    headers: &Headers,
    body: &str,
) -> Result<HashMap<String, String>, FormDataError> {
    let content_type = headers
        .get("content-type")
        .ok_or(FormDataError::MissingContentType)?;
    let boundary = boundary_param(content_type).ok_or(FormDataError::MissingBoundary)?;

    let delimiter = format!("--{}", boundary);
    let mut fields = HashMap::new();

    for segment in body.split(delimiter.as_str()).skip(1) {
        // The final segment after the closing delimiter is "--" plus
        // trailing whitespace.
        if segment.starts_with("--") {
            break;
        }

        let segment = segment
            .strip_prefix("\r\n")
            .or_else(|| segment.strip_prefix('\n'))
            .unwrap_or(segment);

        let (raw_headers, content) = split_part(segment)
            .ok_or_else(|| FormDataError::MalformedPart("missing header terminator".into()))?;

        let name = field_name(raw_headers)
            .ok_or_else(|| FormDataError::MalformedPart("missing field name".into()))?;

        let value = content
            .strip_suffix("\r\n")
            .or_else(|| content.strip_suffix('\n'))
            .unwrap_or(content);

        fields.insert(name.to_string(), value.to_string());
    }

    Ok(fields)
}

/// Extract the boundary parameter from a content-type value.
fn boundary_param(content_type: &str) -> Option<&str> {
    for param in content_type.split(';').map(str::trim) {
        if let Some(value) = param.strip_prefix("boundary=") {
            let value = value.trim_matches('"');
            if !value.is_empty() {
                return Some(value);
            }
        }
    }
    None
}

/// Split one part into its header block and its content.
fn split_part(segment: &str) -> Option<(&str, &str)> {
    if let Some(index) = segment.find("\r\n\r\n") {
        return Some((&segment[..index], &segment[index + 4..]));
    }
    if let Some(index) = segment.find("\n\n") {
        return Some((&segment[..index], &segment[index + 2..]));
    }
    None
}

/// Pull `name="..."` out of the part's Content-Disposition header.
fn field_name(raw_headers: &str) -> Option<&str> {
    for line in raw_headers.lines() {
        let lower = line.to_ascii_lowercase();
        if !lower.starts_with("content-disposition:") {
            continue;
        }
        for param in line.split(';').map(str::trim) {
            if let Some(value) = param.strip_prefix("name=") {
                return Some(value.trim_matches('"'));
            }
        }
    }
    None
}
