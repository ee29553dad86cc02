use anyhow::{bail, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;

use crate::providers::InlinePart;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractedImage {
    pub mime_type: Option<String>,
    pub bytes: Vec<u8>,
}

impl ExtractedImage {
    pub fn extension(&self) -> String {
        extension_from_mime_type(self.mime_type.as_deref())
    }
}

/// Decodes the first part that carries non-empty inline data.
pub fn extract_first_image(item_id: &str, parts: &[InlinePart]) -> Result<ExtractedImage> {
    let Some(part) = parts
        .iter()
        .find(|part| part.data.as_deref().is_some_and(|data| !data.is_empty()))
    else {
        bail!("No image returned for {item_id}");
    };
    let data = part.data.as_deref().unwrap_or_default();
    let bytes = BASE64
        .decode(data.trim().as_bytes())
        .with_context(|| format!("image payload for {item_id} is not valid base64"))?;
    Ok(ExtractedImage {
        mime_type: part.mime_type.clone(),
        bytes,
    })
}

/// `image/<subtype>` becomes `<subtype>`, with `jpeg` shortened to `jpg`.
/// Anything without a usable subtype falls back to `png`.
pub fn extension_from_mime_type(mime_type: Option<&str>) -> String {
    let Some(mime_type) = mime_type else {
        return "png".to_string();
    };
    let essence = mime_type.split(';').next().unwrap_or_default();
    let subtype = essence
        .split('/')
        .nth(1)
        .map(str::trim)
        .filter(|value| !value.is_empty());
    match subtype {
        None => "png".to_string(),
        Some("jpeg") => "jpg".to_string(),
        Some(value) => value.to_string(),
    }
}
