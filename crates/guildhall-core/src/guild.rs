//! Tenant and entity identifiers.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Identifier of a guild (tenant). Every guild-scoped entity carries exactly
/// one, fixed at creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GuildId(pub u64);

impl fmt::Display for GuildId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a player character within a guild.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CharacterId(pub String);

impl CharacterId {
    /// Creates a character id from anything string-like.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CharacterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The kind of entity an [`EntityRef`] points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    /// A player-controlled character.
    Character,
    /// A non-player character.
    Npc,
    /// A faction or organisation.
    Faction,
    /// A place in the world.
    Location,
    /// A quest instance.
    Quest,
}

impl EntityKind {
    /// Stable lowercase name used in keys and log lines.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Character => "character",
            Self::Npc => "npc",
            Self::Faction => "faction",
            Self::Location => "location",
            Self::Quest => "quest",
        }
    }

    /// Whether entities of this kind are controlled by a player and should
    /// receive notifications.
    #[must_use]
    pub fn is_player_controlled(self) -> bool {
        matches!(self, Self::Character)
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reference to an entity by id and kind.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityRef {
    /// Entity identifier.
    pub id: String,
    /// Entity kind.
    pub kind: EntityKind,
}

impl EntityRef {
    /// Creates a new entity reference.
    pub fn new(id: impl Into<String>, kind: EntityKind) -> Self {
        Self {
            id: id.into(),
            kind,
        }
    }

    /// Reference to a player character.
    #[must_use]
    pub fn character(id: &CharacterId) -> Self {
        Self::new(id.as_str(), EntityKind::Character)
    }
}

impl fmt::Display for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.id)
    }
}

/// Implemented by every entity that lives inside a guild.
///
/// `guild_id` is `None` only for freshly built entities that have not yet
/// passed through a [`crate::isolation::TenantIsolationGuard`].
pub trait GuildScoped {
    /// The guild this entity belongs to, if already stamped.
    fn guild_id(&self) -> Option<GuildId>;

    /// Stamps the owning guild. Only called on entities without one.
    fn stamp_guild(&mut self, guild_id: GuildId);

    /// The cache key this entity is stored under.
    fn cache_key(&self) -> String;
}
