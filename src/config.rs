//! Effect settings and shader loading.

use crate::bridge::{ShaderSource, TransformUniforms, MAX_PALETTE};
use crate::error::{KaleidoError, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// User-facing knobs for the built-in effect, loadable from a YAML file.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EffectSettings {
    /// Blend between source and effect, 0.0 to 1.0.
    #[serde(default = "default_strength")]
    pub strength: f32,
    /// Mosaic cell edge in pixels; values <= 1 disable the mosaic.
    #[serde(default = "default_cell_size")]
    pub cell_size: f32,
    /// Palette entries as `#rrggbb` hex colors; empty disables quantization.
    #[serde(default)]
    pub palette: Vec<String>,
}

fn default_strength() -> f32 {
    1.0
}

fn default_cell_size() -> f32 {
    8.0
}

impl Default for EffectSettings {
    fn default() -> Self {
        Self {
            strength: default_strength(),
            cell_size: default_cell_size(),
            palette: Vec::new(),
        }
    }
}

impl EffectSettings {
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        serde_yaml::from_str(&content)
            .map_err(|e| KaleidoError::Setup(format!("invalid effect settings: {e}")))
    }

    /// Resolve the settings into the uniform bundle for a given frame size.
    pub fn to_uniforms(&self, width: u32, height: u32) -> Result<TransformUniforms> {
        if self.palette.len() > MAX_PALETTE {
            warn!(
                "palette has {} entries; only the first {} are used",
                self.palette.len(),
                MAX_PALETTE
            );
        }
        let mut palette = [[0.0f32; 4]; MAX_PALETTE];
        let mut palette_len = 0u32;
        for hex in self.palette.iter().take(MAX_PALETTE) {
            let [r, g, b] = parse_hex_color(hex)?;
            palette[palette_len as usize] = [r, g, b, 1.0];
            palette_len += 1;
        }
        Ok(TransformUniforms {
            strength: self.strength.clamp(0.0, 1.0),
            cell_size: self.cell_size,
            width: width as f32,
            height: height as f32,
            palette_len,
            _pad: [0; 3],
            palette,
        })
    }
}

/// Parses `#rrggbb` (leading `#` optional) into normalized RGB.
pub fn parse_hex_color(hex: &str) -> Result<[f32; 3]> {
    let digits = hex.strip_prefix('#').unwrap_or(hex);
    if digits.len() != 6 || !digits.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(KaleidoError::Setup(format!(
            "invalid palette color '{hex}'; expected #rrggbb"
        )));
    }
    let channel = |range: std::ops::Range<usize>| {
        u8::from_str_radix(&digits[range], 16).unwrap_or(0) as f32 / 255.0
    };
    Ok([channel(0..2), channel(2..4), channel(4..6)])
}

/// Reads user fragment shaders from disk. `.wgsl` files pass through;
/// everything else is treated as GLSL and converted at bridge setup.
pub fn load_shaders(paths: &[PathBuf]) -> Result<Vec<ShaderSource>> {
    let mut shaders = Vec::new();
    for path in paths {
        info!("loading shader from {:?}", path);
        let source = fs::read_to_string(path)?;
        if path.extension().is_some_and(|ext| ext == "wgsl") {
            shaders.push(ShaderSource::Wgsl(source));
        } else {
            shaders.push(ShaderSource::Glsl(source));
        }
    }
    Ok(shaders)
}
