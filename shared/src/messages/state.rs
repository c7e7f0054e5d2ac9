use serde::{Deserialize, Serialize};

use crate::identity::PeerId;

#[derive(Clone, Copy, Debug, PartialEq, Default, Serialize, Deserialize)]
pub struct Position {
    pub x: f32,
    pub y: f32,
}

impl Position {
    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }
}

/// The locally owned, mutable character summary that gets mirrored to peers
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CharacterFields {
    pub position: Position,
    pub animation: String,
    pub mood: f32,
}

impl Default for CharacterFields {
    fn default() -> Self {
        Self {
            position: Position::default(),
            animation: "idle".to_string(),
            mood: 0.5,
        }
    }
}

/// A versioned copy of one peer's [`CharacterFields`]
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CharacterStateSnapshot {
    pub owner: PeerId,
    pub position: Position,
    pub animation: String,
    pub mood: f32,
    pub version: u64,
    pub timestamp: u64,
}

impl CharacterStateSnapshot {
    pub fn new(owner: PeerId, fields: &CharacterFields, version: u64, timestamp: u64) -> Self {
        Self {
            owner,
            position: fields.position,
            animation: fields.animation.clone(),
            mood: fields.mood,
            version,
            timestamp,
        }
    }

    pub fn fields(&self) -> CharacterFields {
        CharacterFields {
            position: self.position,
            animation: self.animation.clone(),
            mood: self.mood,
        }
    }

    /// Last-write-wins: higher version, then later timestamp
    pub fn supersedes(&self, other: &CharacterStateSnapshot) -> bool {
        self.version > other.version
            || (self.version == other.version && self.timestamp > other.timestamp)
    }
}
