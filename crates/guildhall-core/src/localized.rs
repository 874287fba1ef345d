//! Localized text maps.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Locale used when a requested locale has no entry.
pub const DEFAULT_LOCALE: &str = "en";

/// A locale → text map, as stored on templates, instances and relationships.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LocalizedText(pub BTreeMap<String, String>);

impl LocalizedText {
    /// Creates a map with a single default-locale entry.
    pub fn plain(text: impl Into<String>) -> Self {
        let mut map = BTreeMap::new();
        map.insert(DEFAULT_LOCALE.to_owned(), text.into());
        Self(map)
    }

    /// Adds or replaces the text for `locale`.
    #[must_use]
    pub fn with(mut self, locale: impl Into<String>, text: impl Into<String>) -> Self {
        self.0.insert(locale.into(), text.into());
        self
    }

    /// Returns the text for `locale`, falling back to the default locale and
    /// then to any entry.
    #[must_use]
    pub fn get(&self, locale: &str) -> Option<&str> {
        self.0
            .get(locale)
            .or_else(|| self.0.get(DEFAULT_LOCALE))
            .or_else(|| self.0.values().next())
            .map(String::as_str)
    }

    /// Returns `true` when no locale has any text.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.values().all(|text| text.trim().is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_falls_back_to_default_locale() {
        let text = LocalizedText::plain("The Lost Relic").with("de", "Das verlorene Relikt");

        assert_eq!(text.get("de"), Some("Das verlorene Relikt"));
        assert_eq!(text.get("fr"), Some("The Lost Relic"));
    }

    #[test]
    fn test_blank_text_is_empty() {
        assert!(LocalizedText::plain("  ").is_empty());
        assert!(LocalizedText::default().is_empty());
        assert!(!LocalizedText::plain("x").is_empty());
    }
}
