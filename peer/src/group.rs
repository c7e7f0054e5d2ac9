use std::{
    collections::{BTreeMap, BTreeSet, HashMap, VecDeque},
    time::{Duration, Instant},
};

use log::{debug, info};

use duel_shared::{
    messages::{CeremonyId, CeremonyKind, CeremonyPhase, CeremonyState, GroupEventPayload},
    GroupConfig, MessageType, PeerId, Timestamp,
};

use crate::{
    error::GroupError,
    events::{GroupInvitation, GroupOutcome, PeerEvent, PhaseOpening, PhaseSummary},
    outbox::Outbox,
};

/// Extra time an invitee waits past the deadline for the initiator's outcome
const OUTCOME_GRACE: Duration = Duration::from_secs(2);
/// How long finished ceremonies stay queryable
const RETENTION: Duration = Duration::from_secs(60);
const MAX_PHASES: usize = 16;
const HISTORY_LIMIT: usize = 32;

/// A phased activity that ran through its last phase
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CompletedCeremony {
    pub ceremony_id: CeremonyId,
    pub activity: String,
    pub participants: Vec<PeerId>,
    pub scores: BTreeMap<PeerId, i64>,
    /// Wall-clock milliseconds
    pub completed_at: u64,
}

/// The open phase of a ceremony
#[derive(Debug)]
struct Round {
    index: usize,
    deadline: Instant,
    votes: BTreeMap<PeerId, String>,
}

#[derive(Debug)]
struct Ceremony {
    kind: CeremonyKind,
    activity: String,
    initiator: PeerId,
    invitees: Vec<PeerId>,
    accepted: BTreeSet<PeerId>,
    declined: BTreeSet<PeerId>,
    min_participants: usize,
    /// The answer deadline, then that of the latest phase
    deadline: Instant,
    state: CeremonyState,
    answered: bool,
    phases: Vec<CeremonyPhase>,
    round: Option<Round>,
    next_phase: usize,
    scores: BTreeMap<PeerId, i64>,
    /// Participants that left while phases were running
    departed: BTreeSet<PeerId>,
}

impl Ceremony {
    fn new(
        kind: CeremonyKind,
        activity: String,
        initiator: PeerId,
        invitees: Vec<PeerId>,
        min_participants: usize,
        deadline: Instant,
        phases: Vec<CeremonyPhase>,
    ) -> Self {
        Self {
            kind,
            activity,
            initiator,
            invitees,
            accepted: BTreeSet::new(),
            declined: BTreeSet::new(),
            min_participants,
            deadline,
            state: CeremonyState::Pending,
            answered: false,
            phases,
            round: None,
            next_phase: 0,
            scores: BTreeMap::new(),
            departed: BTreeSet::new(),
        }
    }

    /// The terminal state the responses so far lead to, if any
    fn settled(&self) -> Option<CeremonyState> {
        match self.kind {
            CeremonyKind::Invitation => {
                if !self.accepted.is_empty() {
                    Some(CeremonyState::Accepted)
                } else if !self.declined.is_empty() {
                    Some(CeremonyState::Declined)
                } else {
                    None
                }
            }
            CeremonyKind::Activity => {
                let still_possible = self.invitees.len() - self.declined.len() + 1;
                if self.accepted.len() + 1 >= self.min_participants {
                    Some(CeremonyState::Accepted)
                } else if still_possible < self.min_participants {
                    Some(CeremonyState::Declined)
                } else {
                    None
                }
            }
        }
    }

    fn participants(&self) -> Vec<PeerId> {
        let mut participants: Vec<PeerId> = self.accepted.iter().cloned().collect();
        participants.push(self.initiator.clone());
        participants.sort();
        participants
    }

    fn others(&self, local: &PeerId) -> Vec<PeerId> {
        self.participants()
            .into_iter()
            .filter(|peer| peer != local && !self.departed.contains(peer))
            .collect()
    }

    fn takes_part(&self, peer: &PeerId) -> bool {
        self.state == CeremonyState::Accepted
            && (&self.initiator == peer || self.accepted.contains(peer))
    }

    fn open_phase(&self) -> Option<(usize, &CeremonyPhase)> {
        let index = self.round.as_ref()?.index;
        Some((index, self.phases.get(index)?))
    }

    fn start_round(&mut self, index: usize, deadline: Instant) {
        self.round = Some(Round {
            index,
            deadline,
            votes: BTreeMap::new(),
        });
        self.next_phase = index + 1;
        self.deadline = deadline;
    }

    fn record_vote(&mut self, voter: &PeerId, choice: &str) {
        if let Some(round) = self.round.as_mut() {
            round.votes.insert(voter.clone(), choice.to_string());
        }
    }

    /// Whether the open phase may close before its deadline
    fn round_ready(&self) -> bool {
        let (Some(round), Some((_, phase))) = (&self.round, self.open_phase()) else {
            return false;
        };
        let votes = round.votes.len();
        let everyone = self
            .participants()
            .iter()
            .all(|peer| round.votes.contains_key(peer) || self.departed.contains(peer));
        (votes > 0 && votes >= phase.min_votes) || (phase.auto_advance && everyone)
    }

    /// How the open phase closes once its deadline passes
    fn verdict(&self) -> CeremonyState {
        match (&self.round, self.open_phase()) {
            (Some(round), Some((_, phase))) if round.votes.len() >= phase.min_votes => {
                CeremonyState::Accepted
            }
            _ => CeremonyState::Expired,
        }
    }
}

/// Multi-party ceremonies with a deadline. The initiator collects answers
/// and announces the terminal state; invitees only answer.
///
/// An accepted activity may then run phases. Participants send their votes
/// to the initiator, which tallies them, announces each phase's result and
/// opens the next one.
pub struct GroupCoordinator {
    local: PeerId,
    config: GroupConfig,
    ceremonies: HashMap<CeremonyId, Ceremony>,
    history: VecDeque<CompletedCeremony>,
}

impl GroupCoordinator {
    pub fn new(local: PeerId, config: GroupConfig) -> Self {
        Self {
            local,
            config,
            ceremonies: HashMap::new(),
            history: VecDeque::new(),
        }
    }

    pub fn state(&self, ceremony_id: &CeremonyId) -> Option<CeremonyState> {
        self.ceremonies.get(ceremony_id).map(|c| c.state)
    }

    /// Running points of a phased activity
    pub fn scores(&self, ceremony_id: &CeremonyId) -> Option<BTreeMap<PeerId, i64>> {
        self.ceremonies.get(ceremony_id).map(|c| c.scores.clone())
    }

    /// Completed phased activities, oldest first
    pub fn history(&self) -> Vec<CompletedCeremony> {
        self.history.iter().cloned().collect()
    }

    /// Opens a ceremony and sends the invite to every invitee
    pub fn invite(
        &mut self,
        kind: CeremonyKind,
        activity: &str,
        invitees: Vec<PeerId>,
        now: Instant,
        outbox: &mut Outbox,
    ) -> Result<CeremonyId, GroupError> {
        self.open(kind, activity, invitees, Vec::new(), now, outbox)
    }

    /// Opens an activity whose participants vote through `phases` once it
    /// is accepted
    pub fn invite_phased(
        &mut self,
        activity: &str,
        invitees: Vec<PeerId>,
        phases: Vec<CeremonyPhase>,
        now: Instant,
        outbox: &mut Outbox,
    ) -> Result<CeremonyId, GroupError> {
        if phases.is_empty() {
            return Err(GroupError::InvalidPhase {
                index: 0,
                reason: "no phases",
            });
        }
        check_phases(&phases, self.config.max_participants)?;
        self.open(CeremonyKind::Activity, activity, invitees, phases, now, outbox)
    }

    fn open(
        &mut self,
        kind: CeremonyKind,
        activity: &str,
        invitees: Vec<PeerId>,
        phases: Vec<CeremonyPhase>,
        now: Instant,
        outbox: &mut Outbox,
    ) -> Result<CeremonyId, GroupError> {
        let invitees: Vec<PeerId> = invitees
            .into_iter()
            .filter(|peer| peer != &self.local)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        let count = invitees.len() + 1;
        if kind == CeremonyKind::Invitation && invitees.len() != 1 {
            return Err(GroupError::InvitationNeedsOneInvitee {
                count: invitees.len(),
            });
        }
        if count > self.config.max_participants {
            return Err(GroupError::TooManyParticipants {
                count,
                max: self.config.max_participants,
            });
        }
        let min_participants = match kind {
            CeremonyKind::Invitation => 2,
            CeremonyKind::Activity => self.config.min_participants,
        };
        if count < min_participants {
            return Err(GroupError::Unreachable {
                invitees: invitees.len(),
                min: min_participants,
            });
        }

        let ceremony_id = CeremonyId::random();
        let timeout = self.config.invitation_timeout;
        outbox.send(
            invitees.clone(),
            MessageType::GroupEvent,
            &GroupEventPayload::Invite {
                ceremony_id: ceremony_id.clone(),
                ceremony_kind: kind,
                activity: activity.to_string(),
                invitees: invitees.clone(),
                min_participants,
                deadline: Timestamp::now() + timeout.as_millis() as u64,
                phases: phases.clone(),
            },
        );
        info!(
            "opened {:?} ceremony {} for '{}' with {} invitees and {} phases",
            kind,
            ceremony_id,
            activity,
            invitees.len(),
            phases.len()
        );
        self.ceremonies.insert(
            ceremony_id.clone(),
            Ceremony::new(
                kind,
                activity.to_string(),
                self.local.clone(),
                invitees,
                min_participants,
                now + timeout,
                phases,
            ),
        );
        Ok(ceremony_id)
    }

    /// Answers an invitation the local peer received
    pub fn respond(
        &mut self,
        ceremony_id: &CeremonyId,
        accept: bool,
        outbox: &mut Outbox,
    ) -> Result<(), GroupError> {
        let unknown = || GroupError::UnknownCeremony {
            ceremony_id: ceremony_id.clone(),
        };
        let ceremony = self.ceremonies.get_mut(ceremony_id).ok_or_else(unknown)?;
        if ceremony.initiator == self.local || !ceremony.invitees.contains(&self.local) {
            return Err(GroupError::NotInvited {
                ceremony_id: ceremony_id.clone(),
            });
        }
        if ceremony.state.is_terminal() {
            return Err(GroupError::NotPending {
                ceremony_id: ceremony_id.clone(),
            });
        }
        if ceremony.answered {
            return Err(GroupError::AlreadyResponded {
                ceremony_id: ceremony_id.clone(),
            });
        }

        ceremony.answered = true;
        outbox.send(
            vec![ceremony.initiator.clone()],
            MessageType::GroupEvent,
            &GroupEventPayload::Respond {
                ceremony_id: ceremony_id.clone(),
                accept,
            },
        );
        Ok(())
    }

    /// Votes for `choice` in the open phase. Voting again replaces the
    /// earlier vote until the phase closes.
    pub fn vote(
        &mut self,
        ceremony_id: &CeremonyId,
        choice: &str,
        now: Instant,
        outbox: &mut Outbox,
    ) -> Result<(), GroupError> {
        let ceremony = self
            .ceremonies
            .get_mut(ceremony_id)
            .ok_or_else(|| GroupError::UnknownCeremony {
                ceremony_id: ceremony_id.clone(),
            })?;
        if !ceremony.takes_part(&self.local) {
            return Err(GroupError::NotParticipant {
                ceremony_id: ceremony_id.clone(),
            });
        }
        let Some((index, phase)) = ceremony.open_phase() else {
            return Err(GroupError::NoOpenPhase {
                ceremony_id: ceremony_id.clone(),
            });
        };
        if phase.choice(choice).is_none() {
            return Err(GroupError::UnknownChoice {
                phase: index,
                choice: choice.to_string(),
            });
        }

        ceremony.record_vote(&self.local, choice);
        if ceremony.initiator != self.local {
            outbox.send(
                vec![ceremony.initiator.clone()],
                MessageType::GroupEvent,
                &GroupEventPayload::Vote {
                    ceremony_id: ceremony_id.clone(),
                    phase: index,
                    choice: choice.to_string(),
                },
            );
            return Ok(());
        }
        if ceremony.round_ready() {
            self.close_phase(ceremony_id, CeremonyState::Accepted, now, outbox);
        }
        Ok(())
    }

    pub fn on_event(
        &mut self,
        sender: &PeerId,
        payload: GroupEventPayload,
        now: Instant,
        outbox: &mut Outbox,
    ) {
        match payload {
            GroupEventPayload::Invite {
                ceremony_id,
                ceremony_kind,
                activity,
                invitees,
                min_participants,
                deadline,
                phases,
            } => {
                if self.ceremonies.contains_key(&ceremony_id) {
                    return;
                }
                if !invitees.contains(&self.local) {
                    debug!("ceremony {} does not include us, ignoring", ceremony_id);
                    return;
                }
                if !phases.is_empty()
                    && (ceremony_kind != CeremonyKind::Activity
                        || check_phases(&phases, self.config.max_participants).is_err())
                {
                    debug!("ceremony {} carries unusable phases, ignoring", ceremony_id);
                    return;
                }
                let remaining = Duration::from_millis(deadline.saturating_sub(Timestamp::now()))
                    .min(self.config.invitation_timeout);
                outbox.emit(PeerEvent::GroupInvited(GroupInvitation {
                    ceremony_id: ceremony_id.clone(),
                    from: sender.clone(),
                    kind: ceremony_kind,
                    activity: activity.clone(),
                    invitees: invitees.clone(),
                    time_left: remaining,
                }));
                self.ceremonies.insert(
                    ceremony_id,
                    Ceremony::new(
                        ceremony_kind,
                        activity,
                        sender.clone(),
                        invitees,
                        min_participants,
                        now + remaining,
                        phases,
                    ),
                );
            }
            GroupEventPayload::Respond {
                ceremony_id,
                accept,
            } => {
                let Some(ceremony) = self.ceremonies.get_mut(&ceremony_id) else {
                    return;
                };
                if ceremony.initiator != self.local
                    || ceremony.state.is_terminal()
                    || !ceremony.invitees.contains(sender)
                    || ceremony.accepted.contains(sender)
                    || ceremony.declined.contains(sender)
                {
                    debug!(
                        "ignoring response from {} to ceremony {}",
                        sender.short(),
                        ceremony_id
                    );
                    return;
                }
                if accept {
                    ceremony.accepted.insert(sender.clone());
                } else {
                    ceremony.declined.insert(sender.clone());
                }
                if let Some(state) = ceremony.settled() {
                    self.conclude(&ceremony_id, state, now, outbox);
                }
            }
            GroupEventPayload::Outcome {
                ceremony_id,
                state,
                participants,
            } => {
                let Some(ceremony) = self.ceremonies.get_mut(&ceremony_id) else {
                    return;
                };
                if &ceremony.initiator != sender || ceremony.state.is_terminal() || !state.is_terminal()
                {
                    return;
                }
                ceremony.state = state;
                ceremony.accepted = participants
                    .into_iter()
                    .filter(|peer| peer != &ceremony.initiator)
                    .collect();
                outbox.emit(PeerEvent::GroupEventTriggered(outcome_of(
                    &ceremony_id,
                    ceremony,
                )));
            }
            GroupEventPayload::Vote {
                ceremony_id,
                phase,
                choice,
            } => {
                let Some(ceremony) = self.ceremonies.get_mut(&ceremony_id) else {
                    return;
                };
                let valid = ceremony.open_phase().is_some_and(|(index, open)| {
                    index == phase && open.choice(&choice).is_some()
                });
                if ceremony.initiator != self.local
                    || !ceremony.takes_part(sender)
                    || ceremony.departed.contains(sender)
                    || !valid
                {
                    debug!(
                        "ignoring vote from {} in ceremony {}",
                        sender.short(),
                        ceremony_id
                    );
                    return;
                }
                ceremony.record_vote(sender, &choice);
                if ceremony.round_ready() {
                    self.close_phase(&ceremony_id, CeremonyState::Accepted, now, outbox);
                }
            }
            GroupEventPayload::Advance {
                ceremony_id,
                phase,
                deadline,
            } => {
                let Some(ceremony) = self.ceremonies.get_mut(&ceremony_id) else {
                    return;
                };
                if &ceremony.initiator != sender
                    || !ceremony.takes_part(&self.local)
                    || phase < ceremony.next_phase
                {
                    return;
                }
                let Some(duration) = ceremony.phases.get(phase).map(CeremonyPhase::duration) else {
                    return;
                };
                let remaining =
                    Duration::from_millis(deadline.saturating_sub(Timestamp::now())).min(duration);
                ceremony.start_round(phase, now + remaining);
                if let Some(opening) = opening_of(&ceremony_id, ceremony, remaining) {
                    outbox.emit(PeerEvent::GroupPhaseOpened(opening));
                }
            }
            GroupEventPayload::PhaseResult {
                ceremony_id,
                phase,
                state,
                tally,
                scores,
            } => {
                let Some(ceremony) = self.ceremonies.get_mut(&ceremony_id) else {
                    return;
                };
                let open = ceremony.round.as_ref().map(|round| round.index);
                if &ceremony.initiator != sender
                    || ceremony.initiator == self.local
                    || open != Some(phase)
                    || !matches!(state, CeremonyState::Accepted | CeremonyState::Expired)
                {
                    return;
                }
                ceremony.scores = scores;
                self.settle_phase(&ceremony_id, state, tally, now, outbox);
            }
        }
    }

    /// Expires pending ceremonies and open phases past their deadline and
    /// forgets old ones
    pub fn expire(&mut self, now: Instant, outbox: &mut Outbox) {
        let due: Vec<CeremonyId> = self
            .ceremonies
            .iter()
            .filter(|(_, c)| {
                let deadline = if c.initiator == self.local {
                    c.deadline
                } else {
                    c.deadline + OUTCOME_GRACE
                };
                c.state == CeremonyState::Pending && now >= deadline
            })
            .map(|(id, _)| id.clone())
            .collect();
        for ceremony_id in due {
            self.conclude(&ceremony_id, CeremonyState::Expired, now, outbox);
        }

        let overdue: Vec<(CeremonyId, bool)> = self
            .ceremonies
            .iter()
            .filter_map(|(id, c)| {
                let round = c.round.as_ref()?;
                let ours = c.initiator == self.local;
                let deadline = if ours {
                    round.deadline
                } else {
                    round.deadline + OUTCOME_GRACE
                };
                (now >= deadline).then(|| (id.clone(), ours))
            })
            .collect();
        for (ceremony_id, ours) in overdue {
            if ours {
                let verdict = self
                    .ceremonies
                    .get(&ceremony_id)
                    .map_or(CeremonyState::Expired, Ceremony::verdict);
                self.close_phase(&ceremony_id, verdict, now, outbox);
            } else {
                let expired = CeremonyState::Expired;
                self.settle_phase(&ceremony_id, expired, BTreeMap::new(), now, outbox);
            }
        }

        self.ceremonies.retain(|_, c| {
            !c.state.is_terminal() || c.round.is_some() || now < c.deadline + RETENTION
        });
    }

    /// A departed initiator ends its ceremonies; a departed invitee counts
    /// as a decline, and stops counting towards a phase's voters
    pub fn peer_left(&mut self, peer: &PeerId, now: Instant, outbox: &mut Outbox) {
        let mut finished = Vec::new();
        let mut abandoned = Vec::new();
        let mut ready = Vec::new();
        for (ceremony_id, ceremony) in self.ceremonies.iter_mut() {
            if ceremony.state.is_terminal() {
                if &ceremony.initiator == peer && ceremony.round.is_some() {
                    abandoned.push(ceremony_id.clone());
                } else if ceremony.initiator == self.local
                    && ceremony.accepted.contains(peer)
                    && !ceremony.phases.is_empty()
                {
                    ceremony.departed.insert(peer.clone());
                    if ceremony.round_ready() {
                        ready.push(ceremony_id.clone());
                    }
                }
                continue;
            }
            if &ceremony.initiator == peer {
                finished.push((ceremony_id.clone(), CeremonyState::Expired));
            } else if ceremony.initiator == self.local && ceremony.invitees.contains(peer) {
                ceremony.accepted.remove(peer);
                ceremony.declined.insert(peer.clone());
                if let Some(state) = ceremony.settled() {
                    finished.push((ceremony_id.clone(), state));
                }
            }
        }
        for (ceremony_id, state) in finished {
            self.conclude(&ceremony_id, state, now, outbox);
        }
        for ceremony_id in abandoned {
            let expired = CeremonyState::Expired;
            self.settle_phase(&ceremony_id, expired, BTreeMap::new(), now, outbox);
        }
        for ceremony_id in ready {
            self.close_phase(&ceremony_id, CeremonyState::Accepted, now, outbox);
        }
    }

    fn conclude(
        &mut self,
        ceremony_id: &CeremonyId,
        state: CeremonyState,
        now: Instant,
        outbox: &mut Outbox,
    ) {
        let Some(ceremony) = self.ceremonies.get_mut(ceremony_id) else {
            return;
        };
        ceremony.state = state;
        info!("ceremony {} for '{}' is {:?}", ceremony_id, ceremony.activity, state);

        let ours = ceremony.initiator == self.local;
        if ours {
            outbox.send(
                ceremony.invitees.clone(),
                MessageType::GroupEvent,
                &GroupEventPayload::Outcome {
                    ceremony_id: ceremony_id.clone(),
                    state,
                    participants: ceremony.participants(),
                },
            );
        }
        outbox.emit(PeerEvent::GroupEventTriggered(outcome_of(
            ceremony_id,
            ceremony,
        )));
        if ours && state == CeremonyState::Accepted && !ceremony.phases.is_empty() {
            self.advance(ceremony_id, now, outbox);
        }
    }

    /// Initiator: opens the next phase for every participant
    fn advance(&mut self, ceremony_id: &CeremonyId, now: Instant, outbox: &mut Outbox) {
        let Some(ceremony) = self.ceremonies.get_mut(ceremony_id) else {
            return;
        };
        let index = ceremony.next_phase;
        let Some(phase) = ceremony.phases.get(index) else {
            return;
        };
        let duration = phase.duration();
        debug!("ceremony {} opens phase {} '{}'", ceremony_id, index, phase.name);
        outbox.send(
            ceremony.others(&self.local),
            MessageType::GroupEvent,
            &GroupEventPayload::Advance {
                ceremony_id: ceremony_id.clone(),
                phase: index,
                deadline: Timestamp::now() + phase.duration_ms,
            },
        );
        ceremony.start_round(index, now + duration);
        if let Some(opening) = opening_of(ceremony_id, ceremony, duration) {
            outbox.emit(PeerEvent::GroupPhaseOpened(opening));
        }
    }

    /// Initiator: tallies the open phase and announces its result
    fn close_phase(
        &mut self,
        ceremony_id: &CeremonyId,
        state: CeremonyState,
        now: Instant,
        outbox: &mut Outbox,
    ) {
        let Some(ceremony) = self.ceremonies.get_mut(ceremony_id) else {
            return;
        };
        let (Some((index, phase)), Some(round)) = (ceremony.open_phase(), &ceremony.round) else {
            return;
        };
        let mut tally: BTreeMap<String, usize> =
            phase.choices.iter().map(|choice| (choice.id.clone(), 0)).collect();
        let mut earned: Vec<(PeerId, i64)> = Vec::new();
        for (voter, choice) in &round.votes {
            *tally.entry(choice.clone()).or_default() += 1;
            earned.push((voter.clone(), phase.choice(choice).map_or(0, |c| c.points)));
        }
        if state == CeremonyState::Accepted {
            for (voter, points) in earned {
                *ceremony.scores.entry(voter).or_default() += points;
            }
        }
        outbox.send(
            ceremony.others(&self.local),
            MessageType::GroupEvent,
            &GroupEventPayload::PhaseResult {
                ceremony_id: ceremony_id.clone(),
                phase: index,
                state,
                tally: tally.clone(),
                scores: ceremony.scores.clone(),
            },
        );
        self.settle_phase(ceremony_id, state, tally, now, outbox);
    }

    /// Ends the open phase locally, reports it and moves on: the initiator
    /// opens the next phase; the last phase or a failed one ends the run
    fn settle_phase(
        &mut self,
        ceremony_id: &CeremonyId,
        state: CeremonyState,
        tally: BTreeMap<String, usize>,
        now: Instant,
        outbox: &mut Outbox,
    ) {
        let Some(ceremony) = self.ceremonies.get_mut(ceremony_id) else {
            return;
        };
        let Some(round) = ceremony.round.take() else {
            return;
        };
        if state != CeremonyState::Accepted {
            ceremony.next_phase = ceremony.phases.len();
        }
        let last = ceremony.next_phase >= ceremony.phases.len();
        let name = ceremony
            .phases
            .get(round.index)
            .map(|phase| phase.name.clone())
            .unwrap_or_default();
        info!(
            "ceremony {} phase {} '{}' is {:?}",
            ceremony_id, round.index, name, state
        );

        let mut outcome = outcome_of(ceremony_id, ceremony);
        outcome.state = state;
        outcome.phase = Some(PhaseSummary {
            index: round.index,
            name,
            tally,
            scores: ceremony.scores.clone(),
            last,
        });
        outbox.emit(PeerEvent::GroupEventTriggered(outcome));

        if !last {
            if ceremony.initiator == self.local {
                self.advance(ceremony_id, now, outbox);
            }
            return;
        }
        if state == CeremonyState::Accepted {
            self.history.push_back(CompletedCeremony {
                ceremony_id: ceremony_id.clone(),
                activity: ceremony.activity.clone(),
                participants: ceremony.participants(),
                scores: ceremony.scores.clone(),
                completed_at: Timestamp::now(),
            });
            if self.history.len() > HISTORY_LIMIT {
                self.history.pop_front();
            }
        }
    }
}

fn check_phases(phases: &[CeremonyPhase], max_participants: usize) -> Result<(), GroupError> {
    if phases.len() > MAX_PHASES {
        return Err(GroupError::InvalidPhase {
            index: MAX_PHASES,
            reason: "too many phases",
        });
    }
    for (index, phase) in phases.iter().enumerate() {
        let invalid = |reason| GroupError::InvalidPhase { index, reason };
        if phase.choices.is_empty() {
            return Err(invalid("no choices"));
        }
        let ids: BTreeSet<&str> = phase.choices.iter().map(|c| c.id.as_str()).collect();
        if ids.len() != phase.choices.len() {
            return Err(invalid("duplicate choice ids"));
        }
        if phase.duration_ms == 0 {
            return Err(invalid("zero duration"));
        }
        if phase.min_votes > max_participants {
            return Err(invalid("more votes required than participants"));
        }
    }
    Ok(())
}

fn outcome_of(ceremony_id: &CeremonyId, ceremony: &Ceremony) -> GroupOutcome {
    GroupOutcome {
        ceremony_id: ceremony_id.clone(),
        kind: ceremony.kind,
        activity: ceremony.activity.clone(),
        state: ceremony.state,
        participants: ceremony.participants(),
        phase: None,
    }
}

fn opening_of(
    ceremony_id: &CeremonyId,
    ceremony: &Ceremony,
    time_left: Duration,
) -> Option<PhaseOpening> {
    let (index, phase) = ceremony.open_phase()?;
    Some(PhaseOpening {
        ceremony_id: ceremony_id.clone(),
        activity: ceremony.activity.clone(),
        index,
        name: phase.name.clone(),
        choices: phase.choices.clone(),
        time_left,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use duel_shared::LocalIdentity;

    fn peer() -> PeerId {
        LocalIdentity::generate().peer_id().clone()
    }

    fn config() -> GroupConfig {
        GroupConfig {
            invitation_timeout: Duration::from_secs(60),
            min_participants: 3,
            max_participants: 4,
        }
    }

    fn outcomes(outbox: &Outbox) -> Vec<&GroupOutcome> {
        outbox
            .events
            .iter()
            .filter_map(|event| match event {
                PeerEvent::GroupEventTriggered(outcome) => Some(outcome),
                _ => None,
            })
            .collect()
    }

    /// Delivers every group_event the initiator queued to `invitee`
    fn deliver(from: &PeerId, outbox: &Outbox, to: &mut GroupCoordinator, now: Instant) -> Outbox {
        let mut received = Outbox::new();
        for message in outbox.sent(MessageType::GroupEvent) {
            let payload: GroupEventPayload = serde_json::from_value(message.payload.clone()).unwrap();
            to.on_event(from, payload, now, &mut received);
        }
        received
    }

    #[test]
    fn invitation_round_trip() {
        let (host_id, guest_id) = (peer(), peer());
        let mut host = GroupCoordinator::new(host_id.clone(), config());
        let mut guest = GroupCoordinator::new(guest_id.clone(), config());
        let now = Instant::now();

        let mut outbox = Outbox::new();
        let id = host
            .invite(CeremonyKind::Invitation, "trade", vec![guest_id.clone()], now, &mut outbox)
            .unwrap();

        let received = deliver(&host_id, &outbox, &mut guest, now);
        assert!(matches!(received.events[0], PeerEvent::GroupInvited(_)));

        let mut answer = Outbox::new();
        guest.respond(&id, true, &mut answer).unwrap();
        assert_eq!(
            guest.respond(&id, true, &mut Outbox::new()),
            Err(GroupError::AlreadyResponded {
                ceremony_id: id.clone()
            })
        );

        let concluded = deliver(&guest_id, &answer, &mut host, now);
        assert_eq!(outcomes(&concluded)[0].state, CeremonyState::Accepted);
        assert_eq!(host.state(&id), Some(CeremonyState::Accepted));

        let announced = deliver(&host_id, &concluded, &mut guest, now);
        let outcome = outcomes(&announced)[0];
        assert_eq!(outcome.state, CeremonyState::Accepted);
        let mut expected = vec![host_id, guest_id];
        expected.sort();
        assert_eq!(outcome.participants, expected);
    }

    #[test]
    fn activity_accepts_at_minimum() {
        let host_id = peer();
        let invitees = vec![peer(), peer(), peer()];
        let mut host = GroupCoordinator::new(host_id, config());
        let now = Instant::now();
        let mut outbox = Outbox::new();
        let id = host
            .invite(CeremonyKind::Activity, "raid", invitees.clone(), now, &mut outbox)
            .unwrap();

        let respond = |accept| GroupEventPayload::Respond {
            ceremony_id: id.clone(),
            accept,
        };
        let mut events = Outbox::new();
        host.on_event(&invitees[0], respond(false), now, &mut events);
        host.on_event(&invitees[1], respond(true), now, &mut events);
        assert_eq!(host.state(&id), Some(CeremonyState::Pending));
        host.on_event(&invitees[2], respond(true), now, &mut events);

        let outcome = outcomes(&events)[0];
        assert_eq!(outcome.state, CeremonyState::Accepted);
        assert_eq!(outcome.participants.len(), 3);
    }

    #[test]
    fn activity_declines_when_minimum_unreachable() {
        let invitees = vec![peer(), peer()];
        let mut host = GroupCoordinator::new(peer(), config());
        let now = Instant::now();
        let id = host
            .invite(CeremonyKind::Activity, "raid", invitees.clone(), now, &mut Outbox::new())
            .unwrap();

        let mut events = Outbox::new();
        host.on_event(
            &invitees[0],
            GroupEventPayload::Respond {
                ceremony_id: id.clone(),
                accept: false,
            },
            now,
            &mut events,
        );
        assert_eq!(host.state(&id), Some(CeremonyState::Declined));
    }

    #[test]
    fn pending_ceremony_expires_at_deadline() {
        let mut host = GroupCoordinator::new(peer(), config());
        let now = Instant::now();
        let id = host
            .invite(CeremonyKind::Invitation, "duel", vec![peer()], now, &mut Outbox::new())
            .unwrap();

        let mut events = Outbox::new();
        host.expire(now + Duration::from_secs(59), &mut events);
        assert!(events.is_empty());
        host.expire(now + Duration::from_secs(60), &mut events);
        assert_eq!(host.state(&id), Some(CeremonyState::Expired));
        assert_eq!(events.sent(MessageType::GroupEvent).len(), 1);
    }

    #[test]
    fn invalid_invites_are_refused() {
        let mut host = GroupCoordinator::new(peer(), config());
        let now = Instant::now();
        let mut outbox = Outbox::new();

        assert_eq!(
            host.invite(CeremonyKind::Invitation, "x", vec![peer(), peer()], now, &mut outbox),
            Err(GroupError::InvitationNeedsOneInvitee { count: 2 })
        );
        assert_eq!(
            host.invite(CeremonyKind::Activity, "x", vec![peer()], now, &mut outbox),
            Err(GroupError::Unreachable { invitees: 1, min: 3 })
        );
        assert_eq!(
            host.invite(
                CeremonyKind::Activity,
                "x",
                (0..4).map(|_| peer()).collect(),
                now,
                &mut outbox
            ),
            Err(GroupError::TooManyParticipants { count: 5, max: 4 })
        );
        assert!(outbox.is_empty());
    }

    #[test]
    fn departed_initiator_expires_ceremony() {
        let (host_id, guest_id) = (peer(), peer());
        let mut guest = GroupCoordinator::new(guest_id.clone(), config());
        let now = Instant::now();
        let id = CeremonyId::random();
        guest.on_event(
            &host_id,
            GroupEventPayload::Invite {
                ceremony_id: id.clone(),
                ceremony_kind: CeremonyKind::Invitation,
                activity: "trade".to_string(),
                invitees: vec![guest_id],
                min_participants: 2,
                deadline: Timestamp::now() + 60_000,
                phases: Vec::new(),
            },
            now,
            &mut Outbox::new(),
        );

        let mut events = Outbox::new();
        guest.peer_left(&host_id, now, &mut events);
        assert_eq!(guest.state(&id), Some(CeremonyState::Expired));
        assert!(events.messages.is_empty());
    }

    fn two_phases() -> Vec<CeremonyPhase> {
        vec![
            CeremonyPhase::new("route", Duration::from_secs(30))
                .with_choice("left", "Left", 2)
                .with_choice("right", "Right", 5)
                .with_min_votes(2),
            CeremonyPhase::new("camp", Duration::from_secs(30))
                .with_choice("fire", "Fire", 1)
                .with_min_votes(3),
        ]
    }

    struct Party {
        host_id: PeerId,
        host: GroupCoordinator,
        guests: Vec<(PeerId, GroupCoordinator)>,
        id: CeremonyId,
    }

    /// A host and two guests that accepted `phases`, with the first phase
    /// open everywhere
    fn party(phases: Vec<CeremonyPhase>, now: Instant) -> Party {
        let host_id = peer();
        let mut host = GroupCoordinator::new(host_id.clone(), config());
        let mut guests: Vec<(PeerId, GroupCoordinator)> = (0..2)
            .map(|_| {
                let id = peer();
                (id.clone(), GroupCoordinator::new(id, config()))
            })
            .collect();

        let mut invite = Outbox::new();
        let invitees = guests.iter().map(|(id, _)| id.clone()).collect();
        let id = host
            .invite_phased("expedition", invitees, phases, now, &mut invite)
            .unwrap();
        let mut opened = Outbox::new();
        for (guest_id, guest) in guests.iter_mut() {
            deliver(&host_id, &invite, guest, now);
            let mut answer = Outbox::new();
            guest.respond(&id, true, &mut answer).unwrap();
            opened = deliver(guest_id, &answer, &mut host, now);
        }
        assert!(opened
            .events
            .iter()
            .any(|event| matches!(event, PeerEvent::GroupPhaseOpened(o) if o.index == 0)));

        for (_, guest) in guests.iter_mut() {
            let received = deliver(&host_id, &opened, guest, now);
            assert!(received.events.iter().any(|event| matches!(
                event,
                PeerEvent::GroupPhaseOpened(o) if o.index == 0 && o.choices.len() == 2
            )));
        }
        Party {
            host_id,
            host,
            guests,
            id,
        }
    }

    fn ballot(voter: &mut GroupCoordinator, id: &CeremonyId, choice: &str, now: Instant) -> Outbox {
        let mut outbox = Outbox::new();
        voter.vote(id, choice, now, &mut outbox).unwrap();
        outbox
    }

    #[test]
    fn phases_advance_on_minimum_votes_and_score_points() {
        let now = Instant::now();
        let Party {
            host_id,
            mut host,
            mut guests,
            id,
        } = party(two_phases(), now);
        let (first, second) = (guests[0].0.clone(), guests[1].0.clone());

        // a second vote replaces the first
        let votes = ballot(&mut guests[0].1, &id, "right", now);
        assert!(deliver(&first, &votes, &mut host, now).is_empty());
        let votes = ballot(&mut guests[0].1, &id, "left", now);
        assert!(deliver(&first, &votes, &mut host, now).is_empty());

        let closed = ballot(&mut host, &id, "right", now);
        let result = outcomes(&closed)[0];
        assert_eq!(result.state, CeremonyState::Accepted);
        let summary = result.phase.as_ref().unwrap();
        assert_eq!(summary.index, 0);
        assert!(!summary.last);
        assert_eq!(
            summary.tally,
            BTreeMap::from([("left".to_string(), 1), ("right".to_string(), 1)])
        );
        assert_eq!(
            summary.scores,
            BTreeMap::from([(first.clone(), 2), (host_id.clone(), 5)])
        );

        for (_, guest) in guests.iter_mut() {
            let received = deliver(&host_id, &closed, guest, now);
            assert_eq!(outcomes(&received)[0].phase, result.phase);
            assert!(received.events.iter().any(|event| matches!(
                event,
                PeerEvent::GroupPhaseOpened(o) if o.index == 1 && o.name == "camp"
            )));
        }

        for (guest_id, guest) in guests.iter_mut() {
            let votes = ballot(guest, &id, "fire", now);
            assert!(deliver(guest_id, &votes, &mut host, now).is_empty());
        }
        let finished = ballot(&mut host, &id, "fire", now);
        let summary = outcomes(&finished)[0].phase.clone().unwrap();
        assert!(summary.last);
        let expected = BTreeMap::from([(first, 3), (second, 1), (host_id.clone(), 6)]);
        assert_eq!(summary.scores, expected);
        assert_eq!(finished.sent(MessageType::GroupEvent).len(), 1);

        let history = host.history();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].scores, expected);
        assert_eq!(history[0].participants.len(), 3);
        for (_, guest) in guests.iter_mut() {
            deliver(&host_id, &finished, guest, now);
            assert_eq!(guest.history()[0].scores, expected);
            assert_eq!(guest.scores(&id), Some(expected.clone()));
        }
    }

    #[test]
    fn phase_short_of_votes_ends_the_run_at_its_deadline() {
        let now = Instant::now();
        let Party {
            host_id,
            mut host,
            mut guests,
            id,
        } = party(two_phases(), now);
        let voter = guests[0].0.clone();
        let votes = ballot(&mut guests[0].1, &id, "left", now);
        deliver(&voter, &votes, &mut host, now);

        let mut events = Outbox::new();
        host.expire(now + Duration::from_secs(29), &mut events);
        assert!(events.is_empty());
        host.expire(now + Duration::from_secs(30), &mut events);

        let result = outcomes(&events)[0];
        assert_eq!(result.state, CeremonyState::Expired);
        let summary = result.phase.as_ref().unwrap();
        assert!(summary.last);
        assert_eq!(summary.tally["left"], 1);
        assert!(summary.scores.is_empty());
        // the result only; no further phase opens
        assert_eq!(events.sent(MessageType::GroupEvent).len(), 1);
        assert!(host.history().is_empty());
        assert_eq!(host.state(&id), Some(CeremonyState::Accepted));

        let received = deliver(&host_id, &events, &mut guests[1].1, now);
        assert_eq!(outcomes(&received)[0].state, CeremonyState::Expired);
    }

    #[test]
    fn auto_advance_waits_only_for_participants_still_present() {
        let now = Instant::now();
        let phases = vec![CeremonyPhase::new("toast", Duration::from_secs(30))
            .with_choice("cheers", "Cheers", 1)
            .with_min_votes(4)
            .with_auto_advance(true)];
        let Party {
            mut host,
            guests,
            id,
            ..
        } = party(phases, now);

        let mut events = Outbox::new();
        host.vote(&id, "cheers", now, &mut events).unwrap();
        host.on_event(
            &guests[0].0,
            GroupEventPayload::Vote {
                ceremony_id: id.clone(),
                phase: 0,
                choice: "cheers".to_string(),
            },
            now,
            &mut events,
        );
        assert!(outcomes(&events).is_empty());

        host.peer_left(&guests[1].0, now, &mut events);
        let result = outcomes(&events)[0];
        assert_eq!(result.state, CeremonyState::Accepted);
        assert!(result.phase.as_ref().unwrap().last);
        assert_eq!(host.history().len(), 1);
    }

    #[test]
    fn votes_outside_an_open_phase_are_refused() {
        let now = Instant::now();
        let Party {
            mut host,
            guests,
            id,
            ..
        } = party(two_phases(), now);

        assert_eq!(
            host.vote(&id, "fire", now, &mut Outbox::new()),
            Err(GroupError::UnknownChoice {
                phase: 0,
                choice: "fire".to_string()
            })
        );

        let vote = |phase, choice: &str| GroupEventPayload::Vote {
            ceremony_id: id.clone(),
            phase,
            choice: choice.to_string(),
        };
        let mut events = Outbox::new();
        host.on_event(&peer(), vote(0, "left"), now, &mut events);
        host.on_event(&guests[0].0, vote(1, "fire"), now, &mut events);
        assert!(events.is_empty());
        assert!(host.ceremonies[&id]
            .round
            .as_ref()
            .is_some_and(|round| round.votes.is_empty()));

        let invitees = guests.iter().map(|(id, _)| id.clone()).collect();
        let plain = host
            .invite(CeremonyKind::Activity, "raid", invitees, now, &mut Outbox::new())
            .unwrap();
        assert_eq!(
            host.vote(&plain, "left", now, &mut Outbox::new()),
            Err(GroupError::NotParticipant {
                ceremony_id: plain.clone()
            })
        );
        for (guest_id, _) in &guests {
            let accept = GroupEventPayload::Respond {
                ceremony_id: plain.clone(),
                accept: true,
            };
            host.on_event(guest_id, accept, now, &mut Outbox::new());
        }
        assert_eq!(host.state(&plain), Some(CeremonyState::Accepted));
        assert_eq!(
            host.vote(&plain, "left", now, &mut Outbox::new()),
            Err(GroupError::NoOpenPhase {
                ceremony_id: plain.clone()
            })
        );
    }

    #[test]
    fn invitee_closes_a_phase_the_initiator_never_settles() {
        let now = Instant::now();
        let Party { mut guests, .. } = party(two_phases(), now);
        let guest = &mut guests[0].1;

        let mut events = Outbox::new();
        guest.expire(now + Duration::from_secs(30), &mut events);
        assert!(events.is_empty());
        guest.expire(now + Duration::from_secs(30) + OUTCOME_GRACE, &mut events);

        let result = outcomes(&events)[0];
        assert_eq!(result.state, CeremonyState::Expired);
        assert!(result.phase.as_ref().is_some_and(|summary| summary.last));
        assert!(events.messages.is_empty());
        assert!(guest.history().is_empty());
    }

    #[test]
    fn unusable_phases_are_refused() {
        let mut host = GroupCoordinator::new(peer(), config());
        let now = Instant::now();
        let invitees = vec![peer(), peer()];
        let mut outbox = Outbox::new();
        let mut attempt = |phases: Vec<CeremonyPhase>| {
            host.invite_phased("x", invitees.clone(), phases, now, &mut outbox)
        };
        let invalid = |index: usize, reason: &'static str| -> Result<CeremonyId, GroupError> {
            Err(GroupError::InvalidPhase { index, reason })
        };

        let bare = CeremonyPhase::new("bare", Duration::from_secs(1));
        assert_eq!(attempt(Vec::new()), invalid(0, "no phases"));
        assert_eq!(attempt(vec![bare.clone()]), invalid(0, "no choices"));
        let doubled = bare.clone().with_choice("a", "", 1).with_choice("a", "", 2);
        assert_eq!(
            attempt(vec![bare.clone().with_choice("a", "", 0), doubled]),
            invalid(1, "duplicate choice ids")
        );
        assert_eq!(
            attempt(vec![bare.with_choice("a", "", 0).with_min_votes(5)]),
            invalid(0, "more votes required than participants")
        );
        assert!(outbox.is_empty());
    }
}
