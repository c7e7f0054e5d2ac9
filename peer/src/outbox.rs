use log::warn;
use serde::Serialize;
use serde_json::Value;

use duel_shared::{MessageType, PeerId};

use crate::events::PeerEvent;

#[derive(Clone, Debug, PartialEq)]
pub enum Recipients {
    /// Every connected peer
    All,
    Peers(Vec<PeerId>),
}

#[derive(Clone, Debug, PartialEq)]
pub struct Outgoing {
    pub to: Recipients,
    pub message_type: MessageType,
    pub payload: Value,
}

/// Messages to send and events to publish, collected while a component
/// handles one input.
///
/// Components stay synchronous and testable; the node flushes the outbox
/// through the connection manager and event bus.
#[derive(Debug, Default)]
pub struct Outbox {
    pub messages: Vec<Outgoing>,
    pub events: Vec<PeerEvent>,
}

impl Outbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn send<P: Serialize>(&mut self, to: Vec<PeerId>, message_type: MessageType, payload: &P) {
        if to.is_empty() {
            return;
        }
        self.push(Recipients::Peers(to), message_type, payload);
    }

    pub fn broadcast<P: Serialize>(&mut self, message_type: MessageType, payload: &P) {
        self.push(Recipients::All, message_type, payload);
    }

    pub fn emit(&mut self, event: PeerEvent) {
        self.events.push(event);
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty() && self.events.is_empty()
    }

    fn push<P: Serialize>(&mut self, to: Recipients, message_type: MessageType, payload: &P) {
        match serde_json::to_value(payload) {
            Ok(payload) => self.messages.push(Outgoing {
                to,
                message_type,
                payload,
            }),
            Err(err) => warn!(
                "dropping unserializable {} payload: {}",
                message_type.as_str(),
                err
            ),
        }
    }

    /// Messages of one type, for assertions
    #[cfg(test)]
    pub fn sent(&self, message_type: MessageType) -> Vec<&Outgoing> {
        self.messages
            .iter()
            .filter(|m| m.message_type == message_type)
            .collect()
    }
}
