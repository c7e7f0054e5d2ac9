use std::time::Duration;

use serde::{Deserialize, Serialize};

use duel_shared::ConfigError;

use crate::error::BotError;

/// Trait values that bias every decision a bot makes, plus how long it
/// pretends to think before acting.
///
/// All traits lie in `0.0..=1.0`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Personality {
    /// Preference for attacking and for accepting battles
    pub aggression: f64,
    /// Preference for defending and healing when hurt
    pub caution: f64,
    /// Willingness to join group activities
    pub sociability: f64,
    /// Likelihood of answering chat
    pub chattiness: f64,
    pub min_delay: Duration,
    pub max_delay: Duration,
}

impl Default for Personality {
    fn default() -> Self {
        Self {
            aggression: 0.5,
            caution: 0.5,
            sociability: 0.5,
            chattiness: 0.3,
            min_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(3),
        }
    }
}

impl Personality {
    /// Built-in archetypes: `social`, `shy`, `playful`, `helper`,
    /// `aggressive`
    pub fn archetype(name: &str) -> Result<Self, BotError> {
        let (aggression, caution, sociability, chattiness, delay) =
            match name.to_ascii_lowercase().as_str() {
                "social" => (0.4, 0.5, 0.9, 0.9, "1s-3s"),
                "shy" => (0.2, 0.8, 0.3, 0.3, "3s-7s"),
                "playful" => (0.7, 0.3, 0.8, 0.7, "500ms-2s"),
                "helper" => (0.3, 0.7, 0.8, 0.6, "1s-4s"),
                "aggressive" => (0.9, 0.2, 0.4, 0.4, "500ms-1500ms"),
                _ => {
                    return Err(BotError::UnknownArchetype {
                        name: name.to_string(),
                    })
                }
            };
        let (min_delay, max_delay) = parse_delay_range(delay)?;
        Ok(Self {
            aggression,
            caution,
            sociability,
            chattiness,
            min_delay,
            max_delay,
        })
    }

    /// Reads and validates a personality from JSON
    pub fn from_json(bytes: &[u8]) -> Result<Self, BotError> {
        let personality: Self = serde_json::from_slice(bytes).map_err(|err| BotError::Malformed {
            reason: err.to_string(),
        })?;
        personality.validate()?;
        Ok(personality)
    }

    pub fn with_aggression(mut self, aggression: f64) -> Self {
        self.aggression = aggression;
        self
    }

    pub fn with_caution(mut self, caution: f64) -> Self {
        self.caution = caution;
        self
    }

    pub fn with_sociability(mut self, sociability: f64) -> Self {
        self.sociability = sociability;
        self
    }

    pub fn with_chattiness(mut self, chattiness: f64) -> Self {
        self.chattiness = chattiness;
        self
    }

    pub fn with_delay(mut self, min_delay: Duration, max_delay: Duration) -> Self {
        self.min_delay = min_delay;
        self.max_delay = max_delay;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        unit("aggression", self.aggression)?;
        unit("caution", self.caution)?;
        unit("sociability", self.sociability)?;
        unit("chattiness", self.chattiness)?;
        if self.min_delay > self.max_delay {
            return Err(ConfigError::OutOfRange {
                field: "minDelay",
                value: format!("{:?}", self.min_delay),
                min: "0s".to_string(),
                max: format!("{:?}", self.max_delay),
            });
        }
        Ok(())
    }
}

fn unit(field: &'static str, value: f64) -> Result<(), ConfigError> {
    if (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(ConfigError::OutOfRange {
            field,
            value: value.to_string(),
            min: "0".to_string(),
            max: "1".to_string(),
        })
    }
}

/// Parses `"2s"`, `"500ms-2s"` or `"1-3s"` into a delay range. A single
/// value becomes a range of plus or minus 25%.
pub fn parse_delay_range(text: &str) -> Result<(Duration, Duration), BotError> {
    let text = text.trim();
    let invalid = || BotError::InvalidDelay {
        text: text.to_string(),
    };

    let Some((low, high)) = text.split_once('-') else {
        let base = parse_duration(text).ok_or_else(invalid)?;
        let variation = base / 4;
        return Ok((base - variation, base + variation));
    };

    let high = high.trim();
    let low = low.trim();
    let high_duration = parse_duration(high).ok_or_else(invalid)?;
    let low_duration = if low.chars().all(|c| c.is_ascii_digit() || c == '.') {
        // unit borrowed from the upper bound
        let unit = high.trim_start_matches(|c: char| c.is_ascii_digit() || c == '.');
        parse_duration(&format!("{}{}", low, unit))
    } else {
        parse_duration(low)
    }
    .ok_or_else(invalid)?;

    if low_duration > high_duration {
        return Err(invalid());
    }
    Ok((low_duration, high_duration))
}

fn parse_duration(text: &str) -> Option<Duration> {
    let split = text.find(|c: char| !(c.is_ascii_digit() || c == '.'))?;
    let (number, unit) = text.split_at(split);
    let value: f64 = number.parse().ok()?;
    if !value.is_finite() || value < 0.0 {
        return None;
    }
    let seconds = match unit {
        "ms" => value / 1000.0,
        "s" => value,
        "m" => value * 60.0,
        _ => return None,
    };
    Some(Duration::from_secs_f64(seconds))
}
