use std::path::Path;

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::outcome::ItemOutcome;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: String,
    pub started_at: String,
    pub finished_at: String,
    pub provider: String,
    pub model: String,
    pub total_items: u64,
    pub aborted: bool,
    pub items: Vec<ItemOutcome>,
}

impl RunSummary {
    pub fn saved(&self) -> u64 {
        self.items.iter().filter(|item| !item.is_failed()).count() as u64
    }

    pub fn degraded(&self) -> u64 {
        self.items.iter().filter(|item| item.is_degraded()).count() as u64
    }

    pub fn failed(&self) -> u64 {
        self.items.iter().filter(|item| item.is_failed()).count() as u64
    }
}

/// Writes `summary.json`. `extra` adds keys but never replaces the summary's
/// own fields or the computed counts.
pub fn write_summary(
    path: &Path,
    summary: &RunSummary,
    extra: Option<&Map<String, Value>>,
) -> anyhow::Result<()> {
    let mut payload = match serde_json::to_value(summary)? {
        Value::Object(map) => map,
        _ => Map::new(),
    };
    payload.insert("saved".to_string(), Value::Number(summary.saved().into()));
    payload.insert(
        "degraded".to_string(),
        Value::Number(summary.degraded().into()),
    );
    payload.insert("failed".to_string(), Value::Number(summary.failed().into()));
    payload.insert("ts".to_string(), Value::String(now_utc_iso()));
    if let Some(extra) = extra {
        for (key, value) in extra {
            if payload.contains_key(key) {
                continue;
            }
            payload.insert(key.clone(), value.clone());
        }
    }

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, serde_json::to_string_pretty(&Value::Object(payload))?)?;
    Ok(())
}

fn now_utc_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false)
}
