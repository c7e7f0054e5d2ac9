//! # Duel Bot
//! An autonomous battle participant. Decisions are weighted by a
//! [`Personality`] and submitted after a human-like pause through the same
//! [`Participant`] interface a player's UI uses, so the fairness caps and
//! envelope signing apply to bots unchanged.

#![deny(
    trivial_casts,
    trivial_numeric_casts,
    unstable_features,
    unused_import_braces
)]

pub mod engine;

mod controller;
mod error;
mod participant;
mod personality;

pub use controller::BotController;
pub use error::BotError;
pub use participant::Participant;
pub use personality::{parse_delay_range, Personality};
