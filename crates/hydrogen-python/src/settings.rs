//! User settings for the plugin.
//!
//! Settings are read from a JSON file in the user's config directory:
//! - macOS: ~/Library/Application Support/hydrogen-python/settings.json
//! - Linux: ~/.config/hydrogen-python/settings.json
//! - Windows: C:\Users\<User>\AppData\Roaming\hydrogen-python\settings.json
//!
//! Settings are never written back; a missing or unreadable file means
//! defaults.

use serde::{Deserialize, Deserializer, Serialize};
use std::path::{Path, PathBuf};

use crate::expander::ExpansionRules;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Expand the executed block to the whole statement before sending it.
    pub expand_code: bool,

    /// Lines above a block starting with one of these are attached to it.
    #[serde(deserialize_with = "deserialize_keyword_list")]
    pub prepend_keywords: Vec<String>,

    /// Lines below a block starting with one of these are attached to it.
    #[serde(deserialize_with = "deserialize_keyword_list")]
    pub expand_keywords: Vec<String>,

    /// Start new sessions with the variable explorer enabled
    pub variable_explorer: bool,

    /// Directory holding replacement kernel-side helper sources
    pub resources_dir: Option<PathBuf>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            expand_code: true,
            prepend_keywords: vec!["@".into()],
            expand_keywords: ["else", "elif", "except", "finally", ")", "]", "}"]
                .into_iter()
                .map(String::from)
                .collect(),
            variable_explorer: false,
            resources_dir: None,
        }
    }
}

impl Settings {
    pub fn rules(&self) -> ExpansionRules {
        ExpansionRules::new(
            self.prepend_keywords.iter().cloned(),
            self.expand_keywords.iter().cloned(),
        )
    }
}

/// Deserialize a keyword list that accepts both:
/// - Old format: `"else, elif, except"` (comma-separated string)
/// - New format: `["else", "elif", "except"]` (JSON array)
fn deserialize_keyword_list<'de, D>(deserializer: D) -> std::result::Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de;

    struct KeywordListVisitor;

    impl<'de> de::Visitor<'de> for KeywordListVisitor {
        type Value = Vec<String>;

        fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
            formatter.write_str("a string or array of strings")
        }

        fn visit_str<E: de::Error>(self, v: &str) -> std::result::Result<Vec<String>, E> {
            Ok(v.split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect())
        }

        fn visit_seq<A: de::SeqAccess<'de>>(
            self,
            mut seq: A,
        ) -> std::result::Result<Vec<String>, A::Error> {
            let mut items = Vec::new();
            while let Some(item) = seq.next_element::<String>()? {
                let trimmed = item.trim().to_string();
                if !trimmed.is_empty() {
                    items.push(trimmed);
                }
            }
            Ok(items)
        }
    }

    deserializer.deserialize_any(KeywordListVisitor)
}

/// Get the path to the settings file
pub fn settings_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("hydrogen-python")
        .join("settings.json")
}

/// Load settings from the default location
pub fn load_settings() -> Settings {
    load_settings_from(&settings_path())
}

/// Load settings from `path`, returning defaults if it is missing or invalid
pub fn load_settings_from(path: &Path) -> Settings {
    if !path.exists() {
        return Settings::default();
    }
    match std::fs::read_to_string(path)
        .map_err(anyhow::Error::from)
        .and_then(|s| serde_json::from_str(&s).map_err(anyhow::Error::from))
    {
        Ok(settings) => settings,
        Err(e) => {
            log::warn!(
                "[settings] Ignoring {} ({}); using defaults",
                path.display(),
                e
            );
            Settings::default()
        }
    }
}
