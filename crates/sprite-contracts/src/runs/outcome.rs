use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ItemStatus {
    /// Converted to the canonical PNG size.
    Saved,
    /// Conversion failed; the decoded payload was written as-is.
    Degraded { reason: String },
    Failed { error: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemOutcome {
    pub id: String,
    #[serde(flatten)]
    pub status: ItemStatus,
    pub path: Option<String>,
    pub mime_type: Option<String>,
}

impl ItemOutcome {
    pub fn is_failed(&self) -> bool {
        matches!(self.status, ItemStatus::Failed { .. })
    }

    pub fn is_degraded(&self) -> bool {
        matches!(self.status, ItemStatus::Degraded { .. })
    }
}
