use std::env;
use std::io::Cursor;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
use reqwest::blocking::{Client as HttpClient, Response as HttpResponse};
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};

use crate::{map_object, truncate_text};

pub const DEFAULT_GEMINI_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";
const GEMINI_API_KEY_HEADER: &str = "x-goog-api-key";

/// One generation call: a single prompt with fixed image settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationRequest {
    pub model: String,
    pub prompt: String,
    pub image_size: String,
    pub aspect_ratio: String,
}

/// A response part. Only parts carrying inline data are of interest.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InlinePart {
    pub mime_type: Option<String>,
    pub data: Option<String>,
}

#[derive(Debug, Clone)]
pub struct GenerationResponse {
    pub provider_request: Map<String, Value>,
    pub provider_response: Map<String, Value>,
    pub parts: Vec<InlinePart>,
}

pub trait ImageProvider: Send + Sync {
    fn name(&self) -> &str;
    fn generate(&self, request: &GenerationRequest) -> Result<GenerationResponse>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    Gemini,
    Dryrun,
}

#[derive(Debug, Clone, Default)]
pub struct ProviderOptions {
    pub api_base: Option<String>,
    pub request_timeout: Option<Duration>,
    /// Edge length of the dryrun placeholder image.
    pub dryrun_size: Option<u32>,
}

/// Builds the provider for `kind`. Credentials are resolved here, so a
/// missing key fails before any request is issued.
pub fn build_provider(
    kind: ProviderKind,
    options: &ProviderOptions,
    lookup_env: impl Fn(&str) -> Option<String>,
) -> Result<Box<dyn ImageProvider>> {
    match kind {
        ProviderKind::Gemini => {
            let api_key = resolve_api_key(&lookup_env)?;
            let api_base = options
                .api_base
                .clone()
                .or_else(|| lookup_env("GEMINI_API_BASE"));
            Ok(Box::new(GeminiProvider::new(
                api_key,
                api_base,
                options.request_timeout,
            )?))
        }
        ProviderKind::Dryrun => Ok(Box::new(DryrunProvider::new(
            options.dryrun_size.unwrap_or(64),
        ))),
    }
}

/// First non-empty of `GEMINI_API_KEY`, `GOOGLE_API_KEY`.
pub fn resolve_api_key(lookup_env: impl Fn(&str) -> Option<String>) -> Result<String> {
    ["GEMINI_API_KEY", "GOOGLE_API_KEY"]
        .into_iter()
        .filter_map(|key| lookup_env(key))
        .map(|value| value.trim().to_string())
        .find(|value| !value.is_empty())
        .context("Missing GEMINI_API_KEY or GOOGLE_API_KEY in environment.")
}

pub fn process_env(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

pub struct GeminiProvider {
    api_base: String,
    api_key: String,
    http: HttpClient,
}

impl GeminiProvider {
    pub fn new(
        api_key: String,
        api_base: Option<String>,
        request_timeout: Option<Duration>,
    ) -> Result<Self> {
        let api_base = api_base
            .map(|value| value.trim().trim_end_matches('/').to_string())
            .filter(|value| !value.is_empty())
            .unwrap_or_else(|| DEFAULT_GEMINI_API_BASE.to_string());
        let http = HttpClient::builder()
            .timeout(request_timeout)
            .build()
            .context("failed to build Gemini HTTP client")?;
        Ok(Self {
            api_base,
            api_key,
            http,
        })
    }

    fn endpoint_for_model(&self, model: &str) -> String {
        let trimmed = model.trim();
        let model_path = if trimmed.starts_with("models/") {
            trimmed.to_string()
        } else {
            format!("models/{trimmed}")
        };
        format!("{}/{}:generateContent", self.api_base, model_path)
    }

    fn build_payload(request: &GenerationRequest) -> Value {
        json!({
            "contents": [{
                "role": "user",
                "parts": [{ "text": request.prompt }],
            }],
            "generationConfig": {
                "responseModalities": ["IMAGE"],
                "imageConfig": {
                    "aspectRatio": request.aspect_ratio,
                    "imageSize": request.image_size,
                },
            },
        })
    }
}

impl ImageProvider for GeminiProvider {
    fn name(&self) -> &str {
        "gemini"
    }

    fn generate(&self, request: &GenerationRequest) -> Result<GenerationResponse> {
        let endpoint = self.endpoint_for_model(&request.model);
        let payload = Self::build_payload(request);
        let response = self
            .http
            .post(&endpoint)
            .header(GEMINI_API_KEY_HEADER, self.api_key.as_str())
            .json(&payload)
            .send()
            .map_err(reqwest::Error::without_url)
            .with_context(|| format!("Gemini request failed ({endpoint})"))?;
        let response_payload = response_json_or_error("Gemini", response)?;

        Ok(GenerationResponse {
            provider_request: map_object(json!({
                "endpoint": endpoint,
                "payload": payload,
            })),
            provider_response: map_object(json!({
                "candidates": response_payload
                    .get("candidates")
                    .and_then(Value::as_array)
                    .map(|rows| rows.len())
                    .unwrap_or(0),
                "usage_metadata": response_payload.get("usageMetadata").cloned().unwrap_or(Value::Null),
            })),
            parts: first_candidate_parts(&response_payload),
        })
    }
}

/// Parts of the first candidate; later candidates are ignored.
pub(crate) fn first_candidate_parts(response_payload: &Value) -> Vec<InlinePart> {
    let parts = response_payload
        .get("candidates")
        .and_then(Value::as_array)
        .and_then(|candidates| candidates.first())
        .and_then(|candidate| candidate.get("content"))
        .and_then(|content| content.get("parts"))
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();

    parts
        .iter()
        .map(|part| {
            let inline = part
                .get("inlineData")
                .or_else(|| part.get("inline_data"))
                .and_then(Value::as_object);
            let Some(inline) = inline else {
                return InlinePart::default();
            };
            InlinePart {
                mime_type: inline
                    .get("mimeType")
                    .or_else(|| inline.get("mime_type"))
                    .and_then(Value::as_str)
                    .map(str::to_string),
                data: inline
                    .get("data")
                    .and_then(Value::as_str)
                    .map(str::to_string),
            }
        })
        .collect()
}

fn response_json_or_error(provider: &str, response: HttpResponse) -> Result<Value> {
    let status = response.status();
    let code = status.as_u16();
    let body = response
        .text()
        .map_err(reqwest::Error::without_url)
        .with_context(|| format!("{provider} response body read failed"))?;
    if !status.is_success() {
        bail!(
            "{provider} request failed ({code}): {}",
            truncate_text(&body, 512)
        );
    }
    let parsed: Value = serde_json::from_str(&body)
        .with_context(|| format!("{provider} returned invalid JSON payload"))?;
    Ok(parsed)
}

/// Offline provider answering every prompt with a flat PNG whose color is
/// derived from the prompt text.
pub struct DryrunProvider {
    size: u32,
}

impl DryrunProvider {
    pub fn new(size: u32) -> Self {
        Self { size: size.max(1) }
    }
}

impl ImageProvider for DryrunProvider {
    fn name(&self) -> &str {
        "dryrun"
    }

    fn generate(&self, request: &GenerationRequest) -> Result<GenerationResponse> {
        let (r, g, b) = color_from_prompt(&request.prompt);
        let bytes = encode_solid_png(self.size, self.size, [r, g, b])?;
        Ok(GenerationResponse {
            provider_request: map_object(json!({
                "endpoint": "dryrun-native",
                "payload": {
                    "model": request.model,
                    "imageSize": request.image_size,
                    "aspectRatio": request.aspect_ratio,
                },
            })),
            provider_response: map_object(json!({
                "status": "ok",
                "bytes": bytes.len(),
            })),
            parts: vec![InlinePart {
                mime_type: Some("image/png".to_string()),
                data: Some(BASE64.encode(bytes)),
            }],
        })
    }
}

pub(crate) fn encode_solid_png(width: u32, height: u32, rgb: [u8; 3]) -> Result<Vec<u8>> {
    let mut image = RgbImage::new(width, height);
    for pixel in image.pixels_mut() {
        *pixel = Rgb(rgb);
    }
    let mut out = Cursor::new(Vec::new());
    DynamicImage::ImageRgb8(image)
        .write_to(&mut out, ImageFormat::Png)
        .context("failed to encode dryrun image")?;
    Ok(out.into_inner())
}

fn color_from_prompt(prompt: &str) -> (u8, u8, u8) {
    let digest = Sha256::digest(prompt.as_bytes());
    (digest[0], digest[1], digest[2])
}
