use std::path::Path;

use anyhow::{bail, Context, Result};

pub const DEFAULT_FINAL_SIZE: u32 = 1000;

/// Placeholder in a base prompt replaced with the target edge length.
pub const SIZE_PLACEHOLDER: &str = "{size}";

pub const DEFAULT_BASE_PROMPT: &str = "SPRITE SHEET (GRID) for a dress-up game.

Generate ONE PNG {size}x{size}.
Background: perfectly solid chroma key green #00FF00 (every pixel exactly #00FF00), no gradient, no texture.

Layout:
- Single item centered with 12px internal padding.
- Item must be front-facing inventory icon, consistent camera and lighting.
- NO GRID. Generate only one item in the image.

Style:
Semi-realistic 3D game clothing icons, slightly gritty / worn realism (light scuffs, mild stains, frayed seams), sharp clean cutout edges.
Soft studio key light from top-left, subtle shading contained inside the image (no long shadows).
NO UI, NO text, NO logos, NO prices, NO frames, NO watermarks, NO characters, NO mannequins, NO hangers, NO scenery.

Chroma-key safety:
Avoid green hues on the item (no green accents, no green shadows).

Consistency:
Keep the same camera, lighting, and material style across the whole 12-image set.";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptTemplate {
    base: String,
    final_size: u32,
}

impl Default for PromptTemplate {
    fn default() -> Self {
        Self::new(DEFAULT_BASE_PROMPT, DEFAULT_FINAL_SIZE)
    }
}

impl PromptTemplate {
    pub fn new(base: impl Into<String>, final_size: u32) -> Self {
        Self {
            base: base.into(),
            final_size,
        }
    }

    pub fn from_file(path: &Path, final_size: u32) -> Result<Self> {
        let base = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read base prompt {}", path.display()))?;
        let base = base.trim();
        if base.is_empty() {
            bail!("base prompt {} is empty", path.display());
        }
        Ok(Self::new(base, final_size))
    }

    pub fn base(&self) -> &str {
        &self.base
    }

    pub fn final_size(&self) -> u32 {
        self.final_size
    }

    pub fn build(&self, label: &str) -> String {
        let size = self.final_size;
        let base = self.base.replace(SIZE_PLACEHOLDER, &size.to_string());
        format!("{base}\n\nItem:\n{label}.\n\nReturn exactly one PNG image sized {size}x{size}.")
    }
}
