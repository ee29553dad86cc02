use std::ffi::OsString;
use std::fs;
use std::path::Path;
use std::process::Command;

use anyhow::{bail, Context, Result};
use image::imageops::FilterType;
use image::ImageFormat;

use crate::{error_chain_text, truncate_text};

/// Normalizes an image file to a square PNG of `size` pixels.
pub trait ImageConverter: Send + Sync {
    fn name(&self) -> &str;
    fn convert(&self, input: &Path, output: &Path, size: u32) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConverterKind {
    Sips,
    Magick,
    Builtin,
}

impl ConverterKind {
    pub fn build(self) -> Box<dyn ImageConverter> {
        match self {
            Self::Sips => Box::new(SipsConverter::default()),
            Self::Magick => Box::new(MagickConverter::default()),
            Self::Builtin => Box::new(BuiltinConverter),
        }
    }
}

/// macOS `sips`: `sips -s format png -z <h> <w> <input> --out <output>`.
#[derive(Debug, Clone)]
pub struct SipsConverter {
    program: String,
}

impl Default for SipsConverter {
    fn default() -> Self {
        Self::with_program("sips")
    }
}

impl SipsConverter {
    pub fn with_program(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl ImageConverter for SipsConverter {
    fn name(&self) -> &str {
        "sips"
    }

    fn convert(&self, input: &Path, output: &Path, size: u32) -> Result<()> {
        let size = size.to_string();
        run_command(
            &self.program,
            vec![
                "-s".into(),
                "format".into(),
                "png".into(),
                "-z".into(),
                size.clone().into(),
                size.into(),
                input.into(),
                "--out".into(),
                output.into(),
            ],
        )
    }
}

/// ImageMagick 7: `magick <input> -resize <w>x<h>! png:<output>`.
#[derive(Debug, Clone)]
pub struct MagickConverter {
    program: String,
}

impl Default for MagickConverter {
    fn default() -> Self {
        Self::with_program("magick")
    }
}

impl MagickConverter {
    pub fn with_program(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl ImageConverter for MagickConverter {
    fn name(&self) -> &str {
        "magick"
    }

    fn convert(&self, input: &Path, output: &Path, size: u32) -> Result<()> {
        let mut target = OsString::from("png:");
        target.push(output);
        run_command(
            &self.program,
            vec![
                input.into(),
                "-resize".into(),
                format!("{size}x{size}!").into(),
                target,
            ],
        )
    }
}

/// In-process exact resize, for hosts with no conversion tool installed.
#[derive(Debug, Clone, Copy, Default)]
pub struct BuiltinConverter;

impl ImageConverter for BuiltinConverter {
    fn name(&self) -> &str {
        "builtin"
    }

    fn convert(&self, input: &Path, output: &Path, size: u32) -> Result<()> {
        let decoded = image::open(input)
            .with_context(|| format!("failed to decode {}", input.display()))?;
        decoded
            .resize_exact(size, size, FilterType::Lanczos3)
            .save_with_format(output, ImageFormat::Png)
            .with_context(|| format!("failed to write {}", output.display()))?;
        Ok(())
    }
}

fn run_command(program: &str, args: Vec<OsString>) -> Result<()> {
    let output = Command::new(program)
        .args(&args)
        .output()
        .with_context(|| format!("failed to launch {program}"))?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        bail!(
            "{program} exited with {}: {}",
            output.status,
            truncate_text(stderr.trim(), 256)
        );
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PostProcessOutcome {
    Normalized,
    /// The converter failed and the decoded payload was written unchanged.
    RawCopy { reason: String },
}

/// Runs `converter` from `raw_path` into `final_path`, falling back to a
/// verbatim copy of `payload` when conversion fails. The raw file is removed
/// afterwards when it is not the final file.
pub fn post_process(
    converter: &dyn ImageConverter,
    raw_path: &Path,
    final_path: &Path,
    payload: &[u8],
    size: u32,
) -> Result<PostProcessOutcome> {
    let outcome = match converter.convert(raw_path, final_path, size) {
        Ok(()) => PostProcessOutcome::Normalized,
        Err(err) => {
            fs::write(final_path, payload)
                .with_context(|| format!("failed to write {}", final_path.display()))?;
            PostProcessOutcome::RawCopy {
                reason: error_chain_text(&err, 512),
            }
        }
    };
    if raw_path != final_path {
        let _ = fs::remove_file(raw_path);
    }
    Ok(outcome)
}
