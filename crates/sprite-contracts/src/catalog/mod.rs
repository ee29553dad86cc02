mod builtin;
mod prompt;

use std::path::Path;

use anyhow::{bail, Context, Result};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub use builtin::builtin_items;
pub use prompt::{PromptTemplate, DEFAULT_BASE_PROMPT, DEFAULT_FINAL_SIZE, SIZE_PLACEHOLDER};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemDescriptor {
    pub id: String,
    pub label: String,
}

impl ItemDescriptor {
    pub fn new(id: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            label: label.into(),
        }
    }

    /// File name of the normalized artifact for this item.
    pub fn output_file_name(&self) -> String {
        format!("{}.png", self.id)
    }
}

/// Ordered, validated table of items to generate.
///
/// Ids are unique and safe to use as a file stem, so `<id>.png` never
/// collides between two entries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Catalog {
    items: IndexMap<String, ItemDescriptor>,
}

impl Catalog {
    pub fn from_items(items: Vec<ItemDescriptor>) -> Result<Self> {
        let mut table = IndexMap::new();
        for item in items {
            validate_item_id(&item.id)?;
            if item.label.trim().is_empty() {
                bail!("catalog item '{}' has an empty label", item.id);
            }
            if table.contains_key(&item.id) {
                bail!("duplicate catalog item id '{}'", item.id);
            }
            table.insert(item.id.clone(), item);
        }
        Ok(Self { items: table })
    }

    pub fn builtin() -> Result<Self> {
        Self::from_items(builtin_items())
    }

    /// Loads a catalog file: either a JSON array of `{id, label}` objects or
    /// an object with an `items` array.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read catalog {}", path.display()))?;
        let parsed: Value = serde_json::from_str(&raw)
            .with_context(|| format!("catalog {} is not valid JSON", path.display()))?;
        let rows = match parsed {
            rows @ Value::Array(_) => rows,
            Value::Object(mut map) => match map.remove("items") {
                Some(rows @ Value::Array(_)) => rows,
                _ => bail!("catalog {} has no 'items' array", path.display()),
            },
            _ => bail!(
                "catalog {} must be an array or an object with 'items'",
                path.display()
            ),
        };
        let items: Vec<ItemDescriptor> = serde_json::from_value(rows)
            .with_context(|| format!("catalog {} has malformed items", path.display()))?;
        Self::from_items(items)
            .with_context(|| format!("catalog {} failed validation", path.display()))
    }

    pub fn get(&self, id: &str) -> Option<&ItemDescriptor> {
        self.items.get(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ItemDescriptor> {
        self.items.values()
    }

    pub fn ids(&self) -> Vec<String> {
        self.items.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

fn validate_item_id(id: &str) -> Result<()> {
    if id.trim().is_empty() {
        bail!("catalog item id must not be empty");
    }
    if id != id.trim() {
        bail!("catalog item id '{id}' has surrounding whitespace");
    }
    if id == "." || id == ".." || id.contains(['/', '\\', '\0']) {
        bail!("catalog item id '{id}' is not a valid file stem");
    }
    Ok(())
}
