pub mod convert;
pub mod extract;
pub mod providers;

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};
use sprite_contracts::catalog::{Catalog, ItemDescriptor, PromptTemplate};
use sprite_contracts::events::EventWriter;
use sprite_contracts::runs::{write_summary, ItemOutcome, ItemStatus, RunSummary};

use crate::convert::{post_process, ImageConverter, PostProcessOutcome};
use crate::extract::extract_first_image;
use crate::providers::{GenerationRequest, ImageProvider};

pub const DEFAULT_MODEL: &str = "gemini-3-pro-image-preview";
pub const DEFAULT_IMAGE_SIZE: &str = "1K";
pub const DEFAULT_ASPECT_RATIO: &str = "1:1";

/// What happens to the rest of the batch when an item fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ErrorPolicy {
    #[default]
    Abort,
    Continue,
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub output_dir: PathBuf,
    pub events_path: Option<PathBuf>,
    pub model: String,
    pub image_size: String,
    pub aspect_ratio: String,
    pub final_size: u32,
    pub error_policy: ErrorPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("outputs"),
            events_path: None,
            model: DEFAULT_MODEL.to_string(),
            image_size: DEFAULT_IMAGE_SIZE.to_string(),
            aspect_ratio: DEFAULT_ASPECT_RATIO.to_string(),
            final_size: sprite_contracts::catalog::DEFAULT_FINAL_SIZE,
            error_policy: ErrorPolicy::Abort,
        }
    }
}

#[derive(Debug)]
pub enum BatchProgress<'a> {
    Started {
        index: usize,
        total: usize,
        item: &'a ItemDescriptor,
    },
    Saved {
        item: &'a ItemDescriptor,
        path: &'a Path,
    },
    Degraded {
        item: &'a ItemDescriptor,
        path: &'a Path,
        converter: &'a str,
        reason: &'a str,
    },
    Failed {
        item: &'a ItemDescriptor,
        error: &'a anyhow::Error,
    },
}

pub struct SpriteEngine {
    config: EngineConfig,
    template: PromptTemplate,
    provider: Box<dyn ImageProvider>,
    converter: Box<dyn ImageConverter>,
    events: EventWriter,
    run_id: String,
    started_at: String,
    summary_path: PathBuf,
}

impl SpriteEngine {
    pub fn new(
        config: EngineConfig,
        template: PromptTemplate,
        provider: Box<dyn ImageProvider>,
        converter: Box<dyn ImageConverter>,
    ) -> Result<Self> {
        fs::create_dir_all(&config.output_dir).with_context(|| {
            format!(
                "failed to create output dir {}",
                config.output_dir.display()
            )
        })?;
        let run_id = config
            .output_dir
            .file_name()
            .and_then(|value| value.to_str())
            .filter(|value| !value.is_empty())
            .unwrap_or("sprites")
            .to_string();
        let events_path = config
            .events_path
            .clone()
            .unwrap_or_else(|| config.output_dir.join("events.jsonl"));
        let events = EventWriter::new(events_path, run_id.clone());
        let summary_path = config.output_dir.join("summary.json");

        events.emit(
            "run_started",
            map_object(json!({
                "output_dir": config.output_dir.to_string_lossy().to_string(),
                "provider": provider.name(),
                "converter": converter.name(),
                "model": config.model,
                "final_size": config.final_size,
            })),
        )?;

        Ok(Self {
            config,
            template,
            provider,
            converter,
            events,
            run_id,
            started_at: now_utc_iso(),
            summary_path,
        })
    }

    pub fn summary_path(&self) -> &Path {
        &self.summary_path
    }

    /// Processes the catalog in order, one item at a time.
    ///
    /// Under [`ErrorPolicy::Abort`] the first failing item ends the run and
    /// its error is returned after the summary is written; a summary write
    /// failure is attached to that error rather than replacing it. Under
    /// [`ErrorPolicy::Continue`] failures are recorded and the loop moves on.
    pub fn run<F>(&mut self, catalog: &Catalog, mut on_progress: F) -> Result<RunSummary>
    where
        F: FnMut(BatchProgress<'_>),
    {
        let total = catalog.len();
        let mut outcomes = Vec::with_capacity(total);
        let mut abort_error = None;

        for (index, item) in catalog.iter().enumerate() {
            on_progress(BatchProgress::Started { index, total, item });
            match self.process_item(item) {
                Ok((outcome, final_path)) => {
                    match &outcome.status {
                        ItemStatus::Degraded { reason } => {
                            on_progress(BatchProgress::Degraded {
                                item,
                                path: &final_path,
                                converter: self.converter.name(),
                                reason,
                            });
                        }
                        _ => on_progress(BatchProgress::Saved {
                            item,
                            path: &final_path,
                        }),
                    }
                    outcomes.push(outcome);
                }
                Err(err) => {
                    on_progress(BatchProgress::Failed { item, error: &err });
                    self.events.emit(
                        "item_failed",
                        map_object(json!({
                            "item_id": item.id,
                            "error": error_chain_text(&err, 1024),
                        })),
                    )?;
                    outcomes.push(ItemOutcome {
                        id: item.id.clone(),
                        status: ItemStatus::Failed {
                            error: error_chain_text(&err, 1024),
                        },
                        path: None,
                        mime_type: None,
                    });
                    if self.config.error_policy == ErrorPolicy::Abort {
                        abort_error = Some(err);
                        break;
                    }
                }
            }
        }

        let finished = self.finish(total, outcomes, abort_error.is_some());
        match (abort_error, finished) {
            (None, finished) => finished,
            (Some(err), Ok(_)) => Err(err),
            (Some(err), Err(summary_err)) => {
                Err(err.context(format!("run summary not written: {summary_err:#}")))
            }
        }
    }

    fn process_item(&self, item: &ItemDescriptor) -> Result<(ItemOutcome, PathBuf)> {
        let prompt = self.template.build(&item.label);
        self.events.emit(
            "item_started",
            map_object(json!({
                "item_id": item.id,
                "prompt_sha256": prompt_digest(&prompt),
            })),
        )?;

        let request = GenerationRequest {
            model: self.config.model.clone(),
            prompt,
            image_size: self.config.image_size.clone(),
            aspect_ratio: self.config.aspect_ratio.clone(),
        };
        let response = self
            .provider
            .generate(&request)
            .with_context(|| format!("generation failed for {}", item.id))?;
        let image = extract_first_image(&item.id, &response.parts)?;

        let raw_path = self
            .config
            .output_dir
            .join(format!("{}.{}", item.id, image.extension()));
        let final_path = self.config.output_dir.join(item.output_file_name());
        fs::write(&raw_path, &image.bytes)
            .with_context(|| format!("failed to write {}", raw_path.display()))?;

        let post = post_process(
            self.converter.as_ref(),
            &raw_path,
            &final_path,
            &image.bytes,
            self.config.final_size,
        )?;
        let status = match post {
            PostProcessOutcome::Normalized => ItemStatus::Saved,
            PostProcessOutcome::RawCopy { reason } => {
                self.events.emit(
                    "conversion_degraded",
                    map_object(json!({
                        "item_id": item.id,
                        "converter": self.converter.name(),
                        "reason": reason,
                    })),
                )?;
                ItemStatus::Degraded { reason }
            }
        };

        self.events.emit(
            "item_saved",
            map_object(json!({
                "item_id": item.id,
                "path": final_path.to_string_lossy().to_string(),
                "mime_type": image.mime_type,
                "bytes": image.bytes.len(),
                "normalized": status == ItemStatus::Saved,
                "endpoint": response.provider_request.get("endpoint"),
                "provider_response": response.provider_response,
            })),
        )?;

        let outcome = ItemOutcome {
            id: item.id.clone(),
            status,
            path: Some(final_path.to_string_lossy().to_string()),
            mime_type: image.mime_type,
        };
        Ok((outcome, final_path))
    }

    fn finish(&self, total: usize, items: Vec<ItemOutcome>, aborted: bool) -> Result<RunSummary> {
        let summary = RunSummary {
            run_id: self.run_id.clone(),
            started_at: self.started_at.clone(),
            finished_at: now_utc_iso(),
            provider: self.provider.name().to_string(),
            model: self.config.model.clone(),
            total_items: total as u64,
            aborted,
            items,
        };
        let mut extra = Map::new();
        extra.insert(
            "output_dir".to_string(),
            Value::String(self.config.output_dir.to_string_lossy().to_string()),
        );
        write_summary(&self.summary_path, &summary, Some(&extra))?;
        self.events.emit(
            "run_finished",
            map_object(json!({
                "summary_path": self.summary_path.to_string_lossy().to_string(),
                "saved": summary.saved(),
                "degraded": summary.degraded(),
                "failed": summary.failed(),
                "aborted": aborted,
            })),
        )?;
        Ok(summary)
    }
}

pub(crate) fn error_chain_text(err: &anyhow::Error, max_chars: usize) -> String {
    let mut parts: Vec<String> = Vec::new();
    for cause in err.chain() {
        let text = cause.to_string();
        let trimmed = text.trim();
        if trimmed.is_empty() {
            continue;
        }
        if parts.last().is_some_and(|existing| existing == trimmed) {
            continue;
        }
        parts.push(trimmed.to_string());
    }
    if parts.is_empty() {
        return truncate_text(&err.to_string(), max_chars);
    }
    truncate_text(&parts.join(" | caused by: "), max_chars)
}

pub(crate) fn truncate_text(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    value.chars().take(max_chars).collect::<String>() + "…"
}

fn prompt_digest(prompt: &str) -> String {
    hex::encode(Sha256::digest(prompt.as_bytes()))
}

pub(crate) fn map_object(value: Value) -> Map<String, Value> {
    value.as_object().cloned().unwrap_or_default()
}

fn now_utc_iso() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Micros, false)
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::fs;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    use anyhow::{anyhow, bail};
    use base64::engine::general_purpose::STANDARD as BASE64;
    use base64::Engine as _;
    use serde_json::Map;
    use sprite_contracts::catalog::{Catalog, ItemDescriptor, PromptTemplate};
    use sprite_contracts::events::event_types;
    use sprite_contracts::runs::ItemStatus;

    use super::{error_chain_text, BatchProgress, EngineConfig, ErrorPolicy, SpriteEngine};
    use crate::convert::{BuiltinConverter, ImageConverter};
    use crate::providers::{
        encode_solid_png, GeminiProvider, GenerationRequest, GenerationResponse, ImageProvider,
        InlinePart,
    };

    type Scripted = anyhow::Result<Vec<InlinePart>>;

    /// Replays one scripted reply per call and counts calls.
    struct ScriptedProvider {
        replies: Mutex<VecDeque<Scripted>>,
        calls: Arc<AtomicUsize>,
        prompts: Arc<Mutex<Vec<String>>>,
    }

    impl ScriptedProvider {
        fn new(replies: Vec<Scripted>) -> Self {
            Self {
                replies: Mutex::new(replies.into()),
                calls: Arc::new(AtomicUsize::new(0)),
                prompts: Arc::new(Mutex::new(Vec::new())),
            }
        }
    }

    impl ImageProvider for ScriptedProvider {
        fn name(&self) -> &str {
            "scripted"
        }

        fn generate(&self, request: &GenerationRequest) -> anyhow::Result<GenerationResponse> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Ok(mut prompts) = self.prompts.lock() {
                prompts.push(request.prompt.clone());
            }
            let reply = self
                .replies
                .lock()
                .map_err(|_| anyhow!("script lock poisoned"))?
                .pop_front()
                .unwrap_or_else(|| Err(anyhow!("script exhausted")));
            Ok(GenerationResponse {
                provider_request: Map::new(),
                provider_response: Map::new(),
                parts: reply?,
            })
        }
    }

    struct FailingConverter;

    impl ImageConverter for FailingConverter {
        fn name(&self) -> &str {
            "sips"
        }

        fn convert(&self, _input: &Path, _output: &Path, _size: u32) -> anyhow::Result<()> {
            bail!("failed to launch sips")
        }
    }

    fn inline(mime_type: &str, bytes: &[u8]) -> Vec<InlinePart> {
        vec![
            InlinePart::default(),
            InlinePart {
                mime_type: Some(mime_type.to_string()),
                data: Some(BASE64.encode(bytes)),
            },
        ]
    }

    fn two_item_catalog() -> Catalog {
        Catalog::from_items(vec![
            ItemDescriptor::new("item1", "red trucker cap"),
            ItemDescriptor::new("item2", "brown work boots"),
        ])
        .expect("valid catalog")
    }

    fn config_for(output_dir: &Path, error_policy: ErrorPolicy) -> EngineConfig {
        EngineConfig {
            output_dir: output_dir.to_path_buf(),
            final_size: 40,
            error_policy,
            ..EngineConfig::default()
        }
    }

    fn png_files(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = fs::read_dir(dir)
            .map(|entries| {
                entries
                    .filter_map(|entry| entry.ok())
                    .map(|entry| entry.file_name().to_string_lossy().to_string())
                    .filter(|name| name.ends_with(".png"))
                    .collect()
            })
            .unwrap_or_default();
        names.sort();
        names
    }

    #[test]
    fn two_items_are_generated_normalized_and_summarized() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let out = temp.path().join("outputs");
        let png = encode_solid_png(10, 6, [255, 0, 0])?;
        let provider = ScriptedProvider::new(vec![
            Ok(inline("image/png", &png)),
            Ok(inline("image/png", &png)),
        ]);
        let prompts = provider.prompts.clone();
        let mut engine = SpriteEngine::new(
            config_for(&out, ErrorPolicy::Abort),
            PromptTemplate::new("BASE", 40),
            Box::new(provider),
            Box::new(BuiltinConverter),
        )?;

        let mut saved_lines = Vec::new();
        let summary = engine.run(&two_item_catalog(), |progress| {
            if let BatchProgress::Saved { path, .. } = progress {
                saved_lines.push(format!("Saved: {}", path.display()));
            }
        })?;

        assert_eq!(png_files(&out), vec!["item1.png", "item2.png"]);
        assert_eq!(image::image_dimensions(out.join("item1.png"))?, (40, 40));
        assert_eq!(saved_lines.len(), 2);
        assert_eq!(summary.saved(), 2);
        assert_eq!(summary.failed(), 0);
        assert!(!summary.aborted);

        let prompts = prompts.lock().map_err(|_| anyhow!("poisoned"))?.clone();
        assert!(prompts[0].contains("red trucker cap"));
        assert!(prompts[1].contains("40x40"));

        let types = event_types(&out.join("events.jsonl"))?;
        assert_eq!(types.first().map(String::as_str), Some("run_started"));
        assert_eq!(types.last().map(String::as_str), Some("run_finished"));
        assert_eq!(types.iter().filter(|kind| *kind == "item_saved").count(), 2);
        assert!(out.join("summary.json").exists());
        Ok(())
    }

    #[test]
    fn jpeg_payload_becomes_png_and_raw_file_is_removed() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let out = temp.path().join("outputs");
        let mut jpeg = std::io::Cursor::new(Vec::new());
        image::DynamicImage::ImageRgb8(image::RgbImage::new(12, 12))
            .write_to(&mut jpeg, image::ImageFormat::Jpeg)?;
        let provider = ScriptedProvider::new(vec![Ok(inline("image/jpeg", jpeg.get_ref()))]);
        let catalog = Catalog::from_items(vec![ItemDescriptor::new("item1", "gold chain")])?;
        let mut engine = SpriteEngine::new(
            config_for(&out, ErrorPolicy::Abort),
            PromptTemplate::default(),
            Box::new(provider),
            Box::new(BuiltinConverter),
        )?;

        let summary = engine.run(&catalog, |_| {})?;
        let path = summary.items[0].path.clone().unwrap_or_default();
        assert!(path.ends_with("item1.png"));
        assert!(!out.join("item1.jpg").exists());
        assert_eq!(
            image::ImageFormat::from_path(&path)?,
            image::ImageFormat::Png
        );
        assert_eq!(
            image::guess_format(&fs::read(&path)?)?,
            image::ImageFormat::Png
        );
        Ok(())
    }

    #[test]
    fn conversion_failure_degrades_to_verbatim_copy() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let out = temp.path().join("outputs");
        let payload = b"RIFF....WEBPVP8 fake".to_vec();
        let provider = ScriptedProvider::new(vec![Ok(inline("image/webp", &payload))]);
        let catalog = Catalog::from_items(vec![ItemDescriptor::new("item1", "sneakers")])?;
        let mut engine = SpriteEngine::new(
            config_for(&out, ErrorPolicy::Abort),
            PromptTemplate::default(),
            Box::new(provider),
            Box::new(FailingConverter),
        )?;

        let mut warnings = Vec::new();
        let summary = engine.run(&catalog, |progress| {
            if let BatchProgress::Degraded {
                converter, reason, ..
            } = progress
            {
                warnings.push(format!("{converter}: {reason}"));
            }
        })?;

        assert_eq!(fs::read(out.join("item1.png"))?, payload);
        assert!(!out.join("item1.webp").exists());
        assert_eq!(warnings, vec!["sips: failed to launch sips"]);
        assert_eq!(summary.degraded(), 1);
        assert!(matches!(
            summary.items[0].status,
            ItemStatus::Degraded { .. }
        ));
        let types = event_types(&out.join("events.jsonl"))?;
        assert!(types.contains(&"conversion_degraded".to_string()));
        Ok(())
    }

    #[test]
    fn missing_inline_data_aborts_the_batch() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let out = temp.path().join("outputs");
        let png = encode_solid_png(4, 4, [0, 0, 255])?;
        let provider = ScriptedProvider::new(vec![
            Ok(vec![InlinePart::default()]),
            Ok(inline("image/png", &png)),
        ]);
        let calls = provider.calls.clone();
        let mut engine = SpriteEngine::new(
            config_for(&out, ErrorPolicy::Abort),
            PromptTemplate::default(),
            Box::new(provider),
            Box::new(BuiltinConverter),
        )?;

        let err = engine.run(&two_item_catalog(), |_| {}).unwrap_err();
        assert_eq!(err.to_string(), "No image returned for item1");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(png_files(&out).is_empty());

        let summary: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(out.join("summary.json"))?)?;
        assert_eq!(summary["aborted"], serde_json::json!(true));
        assert_eq!(summary["failed"], serde_json::json!(1));
        Ok(())
    }

    #[test]
    fn first_service_error_leaves_no_outputs() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let out = temp.path().join("outputs");
        let provider = ScriptedProvider::new(vec![Err(anyhow!("Gemini request failed (403): quota"))]);
        let calls = provider.calls.clone();
        let mut engine = SpriteEngine::new(
            config_for(&out, ErrorPolicy::Abort),
            PromptTemplate::default(),
            Box::new(provider),
            Box::new(BuiltinConverter),
        )?;

        let mut failed = Vec::new();
        let err = engine
            .run(&two_item_catalog(), |progress| {
                if let BatchProgress::Failed { item, .. } = progress {
                    failed.push(item.id.clone());
                }
            })
            .unwrap_err();

        assert!(format!("{err:#}").contains("quota"));
        assert_eq!(failed, vec!["item1"]);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(out.is_dir());
        assert!(png_files(&out).is_empty());
        Ok(())
    }

    #[test]
    fn continue_policy_records_failure_and_proceeds() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let out = temp.path().join("outputs");
        let png = encode_solid_png(4, 4, [9, 9, 9])?;
        let provider = ScriptedProvider::new(vec![
            Err(anyhow!("network unreachable")),
            Ok(inline("image/png", &png)),
        ]);
        let mut engine = SpriteEngine::new(
            config_for(&out, ErrorPolicy::Continue),
            PromptTemplate::default(),
            Box::new(provider),
            Box::new(BuiltinConverter),
        )?;

        let summary = engine.run(&two_item_catalog(), |_| {})?;
        assert_eq!(png_files(&out), vec!["item2.png"]);
        assert_eq!(summary.failed(), 1);
        assert_eq!(summary.saved(), 1);
        assert!(!summary.aborted);
        match &summary.items[0].status {
            ItemStatus::Failed { error } => assert!(error.contains("network unreachable")),
            other => panic!("unexpected status: {other:?}"),
        }
        Ok(())
    }

    #[test]
    fn summary_write_failure_keeps_the_item_error() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let out = temp.path().join("outputs");
        fs::create_dir_all(out.join("summary.json"))?;
        let provider = ScriptedProvider::new(vec![Ok(vec![InlinePart::default()])]);
        let mut engine = SpriteEngine::new(
            config_for(&out, ErrorPolicy::Abort),
            PromptTemplate::default(),
            Box::new(provider),
            Box::new(BuiltinConverter),
        )?;

        let err = engine.run(&two_item_catalog(), |_| {}).unwrap_err();
        assert_eq!(err.root_cause().to_string(), "No image returned for item1");
        assert!(format!("{err:#}").contains("run summary not written"));
        Ok(())
    }

    #[test]
    fn gemini_transport_failure_keeps_api_key_out_of_run_files() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let out = temp.path().join("outputs");
        let provider = GeminiProvider::new(
            "SECRETKEY123".to_string(),
            Some("http://127.0.0.1:9".to_string()),
            Some(std::time::Duration::from_secs(5)),
        )?;
        let mut engine = SpriteEngine::new(
            config_for(&out, ErrorPolicy::Abort),
            PromptTemplate::default(),
            Box::new(provider),
            Box::new(BuiltinConverter),
        )?;

        let err = engine.run(&two_item_catalog(), |_| {}).unwrap_err();
        assert!(!format!("{err:#}").contains("SECRETKEY123"));
        let events = fs::read_to_string(out.join("events.jsonl"))?;
        let summary = fs::read_to_string(out.join("summary.json"))?;
        assert!(events.contains("item_failed"));
        assert!(!events.contains("SECRETKEY123"));
        assert!(summary.contains("\"failed\""));
        assert!(!summary.contains("SECRETKEY123"));
        Ok(())
    }

    #[test]
    fn error_chain_text_joins_distinct_causes() {
        let err = anyhow!("connection refused").context("Gemini request failed");
        assert_eq!(
            error_chain_text(&err, 200),
            "Gemini request failed | caused by: connection refused"
        );
        assert_eq!(error_chain_text(&err, 6), "Gemini…");
    }
}
