use thiserror::Error;

use duel_shared::ConfigError;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BotError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("No personality archetype named '{name}'")]
    UnknownArchetype { name: String },

    #[error("Cannot read delay '{text}', expected e.g. '2s' or '500ms-2s'")]
    InvalidDelay { text: String },

    #[error("Malformed personality: {reason}")]
    Malformed { reason: String },
}
