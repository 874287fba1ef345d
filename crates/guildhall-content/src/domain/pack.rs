//! The content pack document and its validation.

use std::collections::BTreeSet;
use std::fmt::Write as _;

use guildhall_core::error::DomainError;
use guildhall_quest::domain::template::QuestTemplate;
use guildhall_relationship::domain::rules::RelationshipRule;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Why a content pack was refused.
#[derive(Debug, Error)]
pub enum PackError {
    /// The document is not valid YAML or does not match the pack schema;
    /// malformed rule expressions surface here.
    #[error("content pack is malformed: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// The parsed pack could not be serialized for hashing.
    #[error("content pack could not be fingerprinted: {0}")]
    Fingerprint(#[from] serde_json::Error),

    /// Two templates or two rules share an id.
    #[error("duplicate {kind} id {id}")]
    Duplicate {
        /// `template` or `rule`.
        kind: &'static str,
        /// The repeated id.
        id: String,
    },

    /// An entry already declares a guild; packs are guild-neutral.
    #[error("{kind} {id} declares a guild; content packs must not")]
    GuildTagged {
        /// `template` or `rule`.
        kind: &'static str,
        /// The offending id.
        id: String,
    },

    /// A template or rule failed its own validation.
    #[error("{kind} {id} is invalid: {source}")]
    Invalid {
        /// `template` or `rule`.
        kind: &'static str,
        /// The offending id.
        id: String,
        /// What was wrong.
        source: DomainError,
    },
}

impl From<PackError> for DomainError {
    fn from(error: PackError) -> Self {
        DomainError::Validation(error.to_string())
    }
}

/// A bundle of quest templates and relationship rules.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ContentPack {
    /// Pack name, used in logs.
    pub name: String,
    /// Author-supplied version label.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    /// Quest templates.
    #[serde(default)]
    pub templates: Vec<QuestTemplate>,
    /// Relationship rules.
    #[serde(default)]
    pub rules: Vec<RelationshipRule>,
}

/// A validated pack together with its version hash.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedPack {
    /// The pack.
    pub pack: ContentPack,
    /// SHA-256 of the pack's canonical JSON form, hex encoded.
    pub version_hash: String,
}

impl ContentPack {
    /// Parses and validates a YAML document.
    ///
    /// # Errors
    ///
    /// Returns a [`PackError`] for malformed YAML, uncompilable rule
    /// expressions, duplicate ids, guild-tagged entries and invalid
    /// templates or rules.
    pub fn parse(yaml: &str) -> Result<ParsedPack, PackError> {
        let pack: Self = serde_yaml::from_str(yaml)?;
        pack.validate()?;
        let version_hash = pack.fingerprint()?;
        Ok(ParsedPack { pack, version_hash })
    }

    /// Checks the pack as a whole.
    ///
    /// # Errors
    ///
    /// See [`ContentPack::parse`].
    pub fn validate(&self) -> Result<(), PackError> {
        let mut template_ids = BTreeSet::new();
        for template in &self.templates {
            if !template_ids.insert(template.id.as_str()) {
                return Err(PackError::Duplicate {
                    kind: "template",
                    id: template.id.clone(),
                });
            }
            if template.guild_id.is_some() {
                return Err(PackError::GuildTagged {
                    kind: "template",
                    id: template.id.clone(),
                });
            }
            template.validate().map_err(|source| PackError::Invalid {
                kind: "template",
                id: template.id.clone(),
                source,
            })?;
        }

        let mut rule_ids = BTreeSet::new();
        for rule in &self.rules {
            if !rule_ids.insert(rule.id.as_str()) {
                return Err(PackError::Duplicate {
                    kind: "rule",
                    id: rule.id.clone(),
                });
            }
            if rule.guild_id.is_some() {
                return Err(PackError::GuildTagged {
                    kind: "rule",
                    id: rule.id.clone(),
                });
            }
            rule.validate().map_err(|source| PackError::Invalid {
                kind: "rule",
                id: rule.id.clone(),
                source,
            })?;
        }
        Ok(())
    }

    /// Hex SHA-256 of the canonical JSON serialization, so formatting-only
    /// edits to the YAML keep the same hash.
    ///
    /// # Errors
    ///
    /// Returns `PackError::Fingerprint` if serialization fails.
    pub fn fingerprint(&self) -> Result<String, PackError> {
        let canonical = serde_json::to_vec(self)?;
        let digest = Sha256::digest(&canonical);
        let mut hex = String::with_capacity(digest.len() * 2);
        for byte in digest.iter() {
            let _ = write!(hex, "{byte:02x}");
        }
        Ok(hex)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WOLVES: &str = r#"
name: wolves-of-the-vale
version: "1.0"
templates:
  - id: T1
    name:
      en: Wolf Trouble
      de: Wolfsplage
    objectives:
      - id: obj1
        kind: collect
        target: wolf_pelt
        completion:
          type: at_least
          value: 3
    rewards:
      experience: 50
  - id: T2
    name:
      en: The Den
    prerequisites: [T1]
    objectives:
      - id: den
        kind: visit
        target: wolf_den
        completion:
          type: flag
rules:
  - id: giver-trust
    event_type: quest_completed
    condition: "outcome == 'success'"
    changes:
      - entity_a: { field: character_id, kind: character }
        entity_b: { field: npc_id, kind: npc }
        relationship_type: trust
        formula: "xp * 0.1"
"#;

    #[test]
    fn test_parse_valid_pack() {
        let parsed = ContentPack::parse(WOLVES).unwrap();

        assert_eq!(parsed.pack.name, "wolves-of-the-vale");
        assert_eq!(parsed.pack.templates.len(), 2);
        assert_eq!(parsed.pack.templates[1].prerequisites, vec!["T1".to_owned()]);
        assert_eq!(parsed.pack.rules[0].changes[0].formula.source(), "xp * 0.1");
        assert_eq!(parsed.version_hash.len(), 64);
    }

    #[test]
    fn test_hash_ignores_formatting_but_tracks_content() {
        let reformatted = WOLVES.replace("[T1]", "\n      - T1");
        let changed = WOLVES.replace("experience: 50", "experience: 75");

        let original = ContentPack::parse(WOLVES).unwrap().version_hash;

        assert_eq!(ContentPack::parse(&reformatted).unwrap().version_hash, original);
        assert_ne!(ContentPack::parse(&changed).unwrap().version_hash, original);
    }

    #[test]
    fn test_malformed_rule_expression_is_rejected() {
        let broken = WOLVES.replace("xp * 0.1", "xp * (0.1");

        let result = ContentPack::parse(&broken);

        assert!(matches!(result, Err(PackError::Yaml(_))));
    }

    #[test]
    fn test_duplicate_objective_ids_are_rejected() {
        let broken = WOLVES.replace("id: den", "id: den\n        kind: visit\n        target: x\n        completion:\n          type: flag\n      - id: den");

        let result = ContentPack::parse(&broken);

        assert!(matches!(
            result,
            Err(PackError::Invalid { kind: "template", .. })
        ));
    }

    #[test]
    fn test_duplicate_template_ids_are_rejected() {
        let broken = WOLVES.replace("id: T2", "id: T1");

        let result = ContentPack::parse(&broken);

        assert!(matches!(
            result,
            Err(PackError::Duplicate { kind: "template", .. })
        ));
    }

    #[test]
    fn test_unknown_top_level_field_is_rejected() {
        let broken = format!("{WOLVES}\nnpcs: []\n");

        assert!(ContentPack::parse(&broken).is_err());
    }

    #[test]
    fn test_pack_error_converts_to_validation() {
        let error: DomainError = PackError::Duplicate {
            kind: "rule",
            id: "r".into(),
        }
        .into();

        assert!(matches!(error, DomainError::Validation(_)));
    }
}
