//! Style guides for consistent icon and cover sets
//!
//! A style guide names the visual vocabulary (palette, rendering style) and
//! the brand voice (keywords, mood, terms to avoid) shared by every asset in
//! a workspace. The competition prompt carries it to the prompt-writing
//! models, the scorer rewards variants that honour it, and the image request
//! gets its negative prompt.

use atelier_core::{AtelierError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StyleGuide {
    /// Style name (e.g., "calm_office")
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    /// Prepended to every image prompt
    #[serde(default)]
    pub prompt_prefix: Option<String>,
    /// Appended to every image prompt
    #[serde(default)]
    pub prompt_suffix: Option<String>,
    /// Things the image model should avoid
    #[serde(default)]
    pub negative_prompt: Option<String>,
    /// Color palette as hex strings
    #[serde(default)]
    pub palette: Vec<String>,
    /// Rendering style words ("watercolor", "isometric")
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default)]
    pub brand: BrandVoice,
}

/// How the brand should feel
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BrandVoice {
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default)]
    pub mood: Vec<String>,
    /// Terms a prompt must not use
    #[serde(default)]
    pub avoid: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct StyleFile {
    style: StyleGuide,
}

impl StyleGuide {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content).map_err(|e| {
            AtelierError::Config(format!("Failed to parse style guide {}: {}", path.display(), e))
        })
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let file: StyleFile =
            toml::from_str(content).map_err(|e| AtelierError::TomlParseError(e.to_string()))?;
        Ok(file.style)
    }

    /// Find and load a style guide by name, searching standard locations
    pub fn find(name: &str) -> Result<Self> {
        let candidates = [
            format!("styles/{}.style.toml", name),
            format!(".atelier/styles/{}.style.toml", name),
        ];

        for candidate in &candidates {
            let path = Path::new(candidate);
            if path.exists() {
                return Self::load(path);
            }
        }

        Err(AtelierError::NotFound(format!(
            "Style guide '{}' (searched: {})",
            name,
            candidates.join(", ")
        )))
    }

    /// Wrap an image prompt with the style's prefix, palette and suffix
    pub fn enrich_prompt(&self, base_prompt: &str) -> String {
        let mut parts = Vec::new();

        if let Some(ref prefix) = self.prompt_prefix {
            parts.push(prefix.clone());
        }

        parts.push(base_prompt.to_string());

        if !self.palette.is_empty() {
            parts.push(format!("Color palette: {}", self.palette.join(", ")));
        }

        if let Some(ref suffix) = self.prompt_suffix {
            parts.push(suffix.clone());
        }

        parts.join(". ")
    }

    /// Negative prompt, extended with the brand's avoid list
    pub fn negative(&self) -> Option<String> {
        let mut terms: Vec<&str> = self.negative_prompt.iter().map(String::as_str).collect();
        terms.extend(self.brand.avoid.iter().map(String::as_str));
        if terms.is_empty() {
            None
        } else {
            Some(terms.join(", "))
        }
    }
}
