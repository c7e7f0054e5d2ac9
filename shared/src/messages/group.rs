use std::{collections::BTreeMap, fmt, time::Duration};

use serde::{Deserialize, Serialize};

use crate::identity::PeerId;

#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Debug, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CeremonyId(String);

impl CeremonyId {
    pub fn random() -> Self {
        Self(super::random_id())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CeremonyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CeremonyKind {
    /// One invitee answers yes or no
    Invitation,
    /// Several invitees; goes ahead once enough of them join
    Activity,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CeremonyState {
    Pending,
    Accepted,
    Declined,
    Expired,
}

impl CeremonyState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, CeremonyState::Pending)
    }
}

/// One option of a phase. The protocol only reads `id` and `points`; the
/// label is for whoever presents the phase.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseChoice {
    pub id: String,
    #[serde(default)]
    pub label: String,
    #[serde(default)]
    pub points: i64,
}

/// A voting round of a phased activity.
///
/// The phase closes early once `min_votes` participants have voted, or once
/// everyone has when `auto_advance` is set. Otherwise it closes at its
/// deadline, and it fails if `min_votes` was never reached.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CeremonyPhase {
    pub name: String,
    pub choices: Vec<PhaseChoice>,
    pub duration_ms: u64,
    pub min_votes: usize,
    #[serde(default)]
    pub auto_advance: bool,
}

impl CeremonyPhase {
    pub fn new(name: &str, duration: Duration) -> Self {
        Self {
            name: name.to_string(),
            choices: Vec::new(),
            duration_ms: duration.as_millis() as u64,
            min_votes: 1,
            auto_advance: false,
        }
    }

    pub fn with_choice(mut self, id: &str, label: &str, points: i64) -> Self {
        self.choices.push(PhaseChoice {
            id: id.to_string(),
            label: label.to_string(),
            points,
        });
        self
    }

    pub fn with_min_votes(mut self, min_votes: usize) -> Self {
        self.min_votes = min_votes;
        self
    }

    pub fn with_auto_advance(mut self, auto_advance: bool) -> Self {
        self.auto_advance = auto_advance;
        self
    }

    pub fn duration(&self) -> Duration {
        Duration::from_millis(self.duration_ms)
    }

    pub fn choice(&self, id: &str) -> Option<&PhaseChoice> {
        self.choices.iter().find(|choice| choice.id == id)
    }
}

/// `group_event` envelope payload
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum GroupEventPayload {
    Invite {
        #[serde(rename = "ceremonyID")]
        ceremony_id: CeremonyId,
        #[serde(rename = "ceremonyKind")]
        ceremony_kind: CeremonyKind,
        activity: String,
        invitees: Vec<PeerId>,
        #[serde(rename = "minParticipants")]
        min_participants: usize,
        /// Wall-clock milliseconds
        deadline: u64,
        /// Voting rounds that run once the activity is accepted
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        phases: Vec<CeremonyPhase>,
    },
    Respond {
        #[serde(rename = "ceremonyID")]
        ceremony_id: CeremonyId,
        accept: bool,
    },
    Outcome {
        #[serde(rename = "ceremonyID")]
        ceremony_id: CeremonyId,
        state: CeremonyState,
        /// Initiator plus every invitee that accepted
        #[serde(default)]
        participants: Vec<PeerId>,
    },
    /// A participant's pick in the open phase, sent to the initiator. A later
    /// vote replaces an earlier one.
    Vote {
        #[serde(rename = "ceremonyID")]
        ceremony_id: CeremonyId,
        phase: usize,
        choice: String,
    },
    /// The initiator opened phase `phase`
    Advance {
        #[serde(rename = "ceremonyID")]
        ceremony_id: CeremonyId,
        phase: usize,
        /// Wall-clock milliseconds
        deadline: u64,
    },
    /// The initiator closed phase `phase` as Accepted or Expired
    PhaseResult {
        #[serde(rename = "ceremonyID")]
        ceremony_id: CeremonyId,
        phase: usize,
        state: CeremonyState,
        /// Votes per choice id
        tally: BTreeMap<String, usize>,
        /// Running points per participant
        scores: BTreeMap<PeerId, i64>,
    },
}

impl GroupEventPayload {
    pub fn ceremony_id(&self) -> &CeremonyId {
        match self {
            GroupEventPayload::Invite { ceremony_id, .. }
            | GroupEventPayload::Respond { ceremony_id, .. }
            | GroupEventPayload::Outcome { ceremony_id, .. }
            | GroupEventPayload::Vote { ceremony_id, .. }
            | GroupEventPayload::Advance { ceremony_id, .. }
            | GroupEventPayload::PhaseResult { ceremony_id, .. } => ceremony_id,
        }
    }
}
