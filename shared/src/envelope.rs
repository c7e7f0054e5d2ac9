use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;

use crate::{
    backends::Timestamp,
    error::CodecError,
    identity::{verify_signature, LocalIdentity, PeerId},
};

/// Kinds of envelope exchanged between peers
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Discovery,
    Handshake,
    StateSync,
    BattleInvite,
    BattleAccept,
    BattleAction,
    BattleResult,
    BattleAbort,
    Chat,
    GroupEvent,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Discovery => "discovery",
            MessageType::Handshake => "handshake",
            MessageType::StateSync => "state_sync",
            MessageType::BattleInvite => "battle_invite",
            MessageType::BattleAccept => "battle_accept",
            MessageType::BattleAction => "battle_action",
            MessageType::BattleResult => "battle_result",
            MessageType::BattleAbort => "battle_abort",
            MessageType::Chat => "chat",
            MessageType::GroupEvent => "group_event",
        }
    }

    /// Whether the envelope belongs to the battle session protocol
    pub fn is_battle(&self) -> bool {
        matches!(
            self,
            MessageType::BattleInvite
                | MessageType::BattleAccept
                | MessageType::BattleAction
                | MessageType::BattleResult
                | MessageType::BattleAbort
        )
    }
}

/// Canonical bytes covered by an envelope signature:
/// `type 0x00 payload-json 0x00 sequence(be) timestamp(be)`
pub fn signing_bytes(
    message_type: MessageType,
    payload: &Value,
    sequence: u64,
    timestamp: u64,
) -> Result<Vec<u8>, CodecError> {
    let payload_json =
        serde_json::to_vec(payload).map_err(|e| CodecError::malformed("payload", e))?;
    let type_name = message_type.as_str().as_bytes();

    let mut bytes = Vec::with_capacity(type_name.len() + payload_json.len() + 18);
    bytes.extend_from_slice(type_name);
    bytes.push(0);
    bytes.extend_from_slice(&payload_json);
    bytes.push(0);
    bytes.extend_from_slice(&sequence.to_be_bytes());
    bytes.extend_from_slice(&timestamp.to_be_bytes());
    Ok(bytes)
}

/// The signed, typed message unit exchanged between peers.
///
/// Fields are private: an envelope cannot be altered after [`Envelope::seal`]
/// without going back through its JSON form, where any change shows up as a
/// signature mismatch.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    message_type: MessageType,
    payload: Value,
    #[serde(rename = "senderID")]
    sender_id: PeerId,
    sequence: u64,
    timestamp: u64,
    signature: String,
}

impl Envelope {
    /// Serializes `payload`, stamps it with the identity's next sequence
    /// number and the current time, and signs it
    pub fn seal<P: Serialize>(
        identity: &LocalIdentity,
        message_type: MessageType,
        payload: &P,
    ) -> Result<Self, CodecError> {
        let payload =
            serde_json::to_value(payload).map_err(|e| CodecError::malformed("payload", e))?;
        Self::seal_value(
            identity,
            message_type,
            payload,
            identity.next_sequence(),
            Timestamp::now(),
        )
    }

    /// Signs an already-built payload with an explicit sequence and timestamp
    pub fn seal_value(
        identity: &LocalIdentity,
        message_type: MessageType,
        payload: Value,
        sequence: u64,
        timestamp: u64,
    ) -> Result<Self, CodecError> {
        let bytes = signing_bytes(message_type, &payload, sequence, timestamp)?;
        let signature = hex::encode(identity.sign(&bytes));
        Ok(Self {
            message_type,
            payload,
            sender_id: identity.peer_id().clone(),
            sequence,
            timestamp,
            signature,
        })
    }

    pub fn message_type(&self) -> MessageType {
        self.message_type
    }

    pub fn payload(&self) -> &Value {
        &self.payload
    }

    pub fn sender_id(&self) -> &PeerId {
        &self.sender_id
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    /// Checks the signature against the key named by `senderID`.
    ///
    /// This does not establish that the sender is *known*; that is the key
    /// ring's job. Fails closed on any decode problem.
    pub fn verify_signature(&self) -> bool {
        let Ok(key) = self.sender_id.verifying_key() else {
            return false;
        };
        let Ok(signature) = hex::decode(&self.signature) else {
            return false;
        };
        let Ok(bytes) = signing_bytes(
            self.message_type,
            &self.payload,
            self.sequence,
            self.timestamp,
        ) else {
            return false;
        };
        verify_signature(&bytes, &signature, &key)
    }

    /// Decodes the payload into its typed form, checking the message type
    pub fn open<P: DeserializeOwned>(&self, expected: MessageType) -> Result<P, CodecError> {
        if self.message_type != expected {
            return Err(CodecError::UnexpectedType {
                expected: expected.as_str(),
                actual: self.message_type.as_str(),
            });
        }
        serde_json::from_value(self.payload.clone())
            .map_err(|e| CodecError::malformed(expected.as_str(), e))
    }

    pub fn to_json(&self) -> Result<Vec<u8>, CodecError> {
        serde_json::to_vec(self).map_err(|e| CodecError::malformed("envelope", e))
    }

    pub fn from_json(bytes: &[u8]) -> Result<Self, CodecError> {
        serde_json::from_slice(bytes).map_err(|e| CodecError::malformed("envelope", e))
    }
}
