//! Installs parsed content packs into a guild.

use std::collections::BTreeSet;

use guildhall_core::error::DomainError;
use guildhall_core::guild::GuildId;
use guildhall_quest::application::lifecycle::QuestLifecycle;
use guildhall_relationship::application::evaluator::RelationshipRuleEvaluator;
use serde::Serialize;
use tracing::info;

use crate::domain::pack::ParsedPack;

/// What an installation wrote.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InstallSummary {
    /// Pack name.
    pub pack: String,
    /// The pack's version hash.
    pub version_hash: String,
    /// Templates installed.
    pub templates: usize,
    /// Rules installed.
    pub rules: usize,
}

/// Installs `parsed` into `guild`. Entries replace existing ones with the
/// same id.
///
/// Prerequisites may name templates of the same pack or templates already
/// installed in the guild.
///
/// # Errors
///
/// Returns `DomainError::Validation` for a prerequisite that resolves to
/// neither; nothing is installed in that case.
pub fn install_pack(
    guild: GuildId,
    parsed: ParsedPack,
    quests: &QuestLifecycle,
    relationships: &RelationshipRuleEvaluator,
) -> Result<InstallSummary, DomainError> {
    let ParsedPack { pack, version_hash } = parsed;

    let in_pack: BTreeSet<&str> = pack.templates.iter().map(|t| t.id.as_str()).collect();
    for template in &pack.templates {
        for prerequisite in &template.prerequisites {
            if !in_pack.contains(prerequisite.as_str())
                && quests.template(guild, prerequisite).is_none()
            {
                return Err(DomainError::Validation(format!(
                    "template {} requires unknown template {prerequisite}",
                    template.id
                )));
            }
        }
    }

    let templates = quests.install_templates(guild, pack.templates)?;
    let rules = relationships.install_rules(guild, pack.rules)?;
    info!(%guild, pack = %pack.name, %version_hash, templates, rules, "content pack installed");

    Ok(InstallSummary {
        pack: pack.name,
        version_hash,
        templates,
        rules,
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use guildhall_consequence::application::engine::ConsequenceEngine;
    use guildhall_core::config::StrengthBounds;
    use guildhall_test_support::{
        RecordingNotifier, RecordingWorld, ScriptedGenerator, ScriptedValidator, fixed_clock,
    };
    use serde_json::json;

    use super::*;
    use crate::domain::pack::ContentPack;

    const GUILD: GuildId = GuildId(3);

    const SEQUEL: &str = r"
name: sequel
templates:
  - id: T3
    name:
      en: Return of the Pack
    prerequisites: [T1]
    objectives:
      - id: alpha
        kind: defeat
        target: alpha_wolf
        completion:
          type: flag
rules:
  - id: den-rivalry
    event_type: den_cleared
    changes:
      - entity_a: { field: character_id, kind: character }
        entity_b: { id: pack-wolves, kind: faction }
        relationship_type: rivalry
        mode: set
        formula: '-50'
";

    const BASE: &str = r"
name: base
templates:
  - id: T1
    name:
      en: Wolf Trouble
    objectives:
      - id: obj1
        kind: collect
        target: wolf_pelt
        completion:
          type: at_least
          value: 3
";

    fn collaborators() -> (QuestLifecycle, RelationshipRuleEvaluator) {
        let clock = Arc::new(fixed_clock());
        let engine = ConsequenceEngine::new(
            Arc::new(RecordingWorld::new()),
            Arc::new(RecordingNotifier::new()),
            clock.clone(),
        );
        let quests = QuestLifecycle::new(
            Arc::new(engine),
            Arc::new(ScriptedGenerator::new(json!({}))),
            Arc::new(ScriptedValidator::accepting()),
            clock.clone(),
        );
        let relationships = RelationshipRuleEvaluator::new(StrengthBounds::default(), clock);
        (quests, relationships)
    }

    #[test]
    fn test_install_pack_writes_templates_and_rules() {
        // Arrange
        let (quests, relationships) = collaborators();
        install_pack(GUILD, ContentPack::parse(BASE).unwrap(), &quests, &relationships).unwrap();
        let parsed = ContentPack::parse(SEQUEL).unwrap();
        let hash = parsed.version_hash.clone();

        // Act
        let summary = install_pack(GUILD, parsed, &quests, &relationships).unwrap();

        // Assert
        assert_eq!(summary.pack, "sequel");
        assert_eq!(summary.version_hash, hash);
        assert_eq!((summary.templates, summary.rules), (1, 1));
        assert_eq!(quests.template(GUILD, "T3").unwrap().guild_id, Some(GUILD));
        assert_eq!(relationships.rules_for_event(GUILD, "den_cleared").len(), 1);
    }

    #[test]
    fn test_unknown_prerequisite_installs_nothing() {
        let (quests, relationships) = collaborators();

        let result = install_pack(GUILD, ContentPack::parse(SEQUEL).unwrap(), &quests, &relationships);

        assert!(matches!(result, Err(DomainError::Validation(_))));
        assert!(quests.template(GUILD, "T3").is_none());
        assert!(relationships.rules_for_event(GUILD, "den_cleared").is_empty());
    }

    #[test]
    fn test_packs_install_per_guild() {
        let (quests, relationships) = collaborators();

        install_pack(GUILD, ContentPack::parse(BASE).unwrap(), &quests, &relationships).unwrap();

        assert!(quests.template(GuildId(4), "T1").is_none());
    }
}
