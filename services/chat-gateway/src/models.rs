//! Caller-facing model names and the upstream bots they map to.

use crate::wire::{ModelEntry, ModelList};
use std::collections::{BTreeMap, HashMap};

/// Used when the configuration carries no `[bot]` table.
pub const DEFAULT_BOTS: &[(&str, &str)] = &[
    ("gpt-3.5-turbo-16k", "ChatGPT-16k"),
    ("gpt-3.5-turbo", "ChatGPT-16k"),
    ("gpt-4", "GPT-4"),
    ("gpt-4o", "GPT-4o"),
    ("gpt-4-vision-preview", "GPT-4-128k"),
    ("gpt-4-turbo-preview", "Claude-3-Opus"),
    ("Claude-3.5-Sonnet", "Claude-3.5-Sonnet"),
    ("Claude-3-Sonnet", "Claude-3-Sonnet"),
    ("Claude-3-Haiku", "Claude-3-Haiku"),
    ("Llama-3-70b-Groq", "Llama-3-70b-Groq"),
    ("Gemini-1.5-Pro", "Gemini-1.5-Pro"),
    ("Gemini-1.5-Pro-128k", "Gemini-1.5-Pro-128k"),
    ("Gemini-1.5-Pro-1M", "Gemini-1.5-Pro-1M"),
    ("DALL-E-3", "DALL-E-3"),
    ("StableDiffusionXL", "StableDiffusionXL"),
];

/// Static model table. Read-only after startup.
#[derive(Debug, Clone)]
pub struct ModelRegistry {
    bots: BTreeMap<String, String>,
    /// Lowercased caller name → canonical caller name.
    folded: HashMap<String, String>,
}

impl ModelRegistry {
    pub fn new(bots: BTreeMap<String, String>) -> Self {
        let mut folded = HashMap::with_capacity(bots.len());
        for name in bots.keys() {
            // First name in sorted order wins when two differ only by case.
            folded
                .entry(name.to_lowercase())
                .or_insert_with(|| name.clone());
        }
        Self { bots, folded }
    }

    pub fn with_defaults() -> Self {
        Self::new(
            DEFAULT_BOTS
                .iter()
                .map(|(model, bot)| (model.to_string(), bot.to_string()))
                .collect(),
        )
    }

    /// Build from the configured `[bot]` table, falling back to the defaults.
    pub fn from_config(bots: Option<&BTreeMap<String, String>>) -> Self {
        match bots {
            Some(bots) => Self::new(bots.clone()),
            None => Self::with_defaults(),
        }
    }

    /// Upstream bot id for a caller model name: exact match first, then
    /// case-insensitive.
    pub fn resolve(&self, model: &str) -> Option<&str> {
        if let Some(bot) = self.bots.get(model) {
            return Some(bot);
        }
        let canonical = self.folded.get(&model.to_lowercase())?;
        self.bots.get(canonical).map(String::as_str)
    }

    /// Listing body for `/v1/models`, sorted by id.
    pub fn list(&self) -> ModelList {
        ModelList {
            object: "",
            data: self.bots.keys().map(ModelEntry::new).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.bots.len()
    }
}
