use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    time::{Duration, Instant},
};

use log::{debug, info, trace, warn};
use serde::de::DeserializeOwned;
use serde_json::Value;

use duel_shared::{
    battle::{
        ActionType, BattleOutcome, BattleRuleError, BattleState, BattleView, LoggedAction,
        SessionPhase,
    },
    messages::{
        AbortReason, BattleAbortPayload, BattleAcceptPayload, BattleActionPayload,
        BattleInvitePayload, ResultSummary, SessionId,
    },
    BattleConfig, MessageType, PeerId, Timestamp,
};

use crate::{
    error::BattleError,
    events::{AppliedAction, BattleInvitation, BattleStart, FairnessRejection, PeerEvent, TurnStart},
    outbox::Outbox,
};

use super::session::{ActionRequest, PendingAction, Session, MAX_PENDING_ACTIONS};

pub const MIN_BATTLE_PARTICIPANTS: usize = 2;
pub const MAX_BATTLE_PARTICIPANTS: usize = 8;

/// How long finished sessions stay queryable
const RETENTION: Duration = Duration::from_secs(600);
const MAX_EARLY_ACCEPTS: usize = 64;

enum Readiness {
    Apply,
    Wait,
    Reject(&'static str),
}

/// Runs every battle session the local peer takes part in.
///
/// Each participant replays the same action log through the same rules, so
/// there is no authority: the coordinator only decides whose action is
/// accepted for which turn, when a silent actor forfeits, and when a
/// session ends.
pub struct BattleCoordinator {
    local: PeerId,
    config: BattleConfig,
    sessions: HashMap<SessionId, Session>,
    /// Accepts that arrived before the invite they answer
    early_accepts: HashMap<SessionId, (Instant, BTreeSet<PeerId>)>,
}

impl BattleCoordinator {
    pub fn new(local: PeerId, config: BattleConfig) -> Self {
        Self {
            local,
            config,
            sessions: HashMap::new(),
            early_accepts: HashMap::new(),
        }
    }

    pub fn view(&self, session_id: &SessionId, now: Instant) -> Option<BattleView> {
        self.sessions
            .get(session_id)
            .map(|session| session.view(&self.local, now))
    }

    pub fn views(&self, now: Instant) -> Vec<BattleView> {
        let mut views: Vec<BattleView> = self
            .sessions
            .values()
            .map(|session| session.view(&self.local, now))
            .collect();
        views.sort_by(|a, b| a.session_id.cmp(&b.session_id));
        views
    }

    /// Opens a session with the local peer and `opponents`, sending the
    /// invite to each of them
    pub fn propose(
        &mut self,
        opponents: Vec<PeerId>,
        now: Instant,
        outbox: &mut Outbox,
    ) -> Result<SessionId, BattleError> {
        let mut participants: BTreeSet<PeerId> = opponents.into_iter().collect();
        participants.insert(self.local.clone());
        let count = participants.len();
        if !(MIN_BATTLE_PARTICIPANTS..=MAX_BATTLE_PARTICIPANTS).contains(&count) {
            return Err(BattleError::ParticipantCount {
                count,
                min: MIN_BATTLE_PARTICIPANTS,
                max: MAX_BATTLE_PARTICIPANTS,
            });
        }

        let invite = BattleInvitePayload {
            session_id: SessionId::random(),
            participants: participants.into_iter().collect(),
            fairness: self.config.fairness.clone(),
            rules: self.config.rules.clone(),
            max_turns: self.config.max_turns,
            turn_timeout_ms: self.config.turn_timeout.as_millis() as u64,
            time_budget_ms: self.config.time_budget.as_millis() as u64,
        };
        let mut session = open(&invite, self.config.forfeit_grace, now);
        session.accepted.insert(self.local.clone());
        outbox.send(session.others(&self.local), MessageType::BattleInvite, &invite);
        info!(
            "proposed battle {} to {} opponents",
            invite.session_id,
            count - 1
        );

        let session_id = invite.session_id;
        self.sessions.insert(session_id.clone(), session);
        Ok(session_id)
    }

    pub fn accept(
        &mut self,
        session_id: &SessionId,
        now: Instant,
        outbox: &mut Outbox,
    ) -> Result<(), BattleError> {
        let local = self.local.clone();
        let grace = self.config.forfeit_grace;
        let session = self.session_mut(session_id)?;
        if session.phase != SessionPhase::Proposed {
            return Err(wrong_phase(session));
        }
        if !session.includes(&local) {
            return Err(BattleError::NotParticipant {
                session_id: session_id.clone(),
            });
        }
        if !session.accepted.insert(local.clone()) {
            return Err(BattleError::AlreadyAccepted {
                session_id: session_id.clone(),
            });
        }

        outbox.send(
            session.others(&local),
            MessageType::BattleAccept,
            &BattleAcceptPayload {
                session_id: session_id.clone(),
            },
        );
        start_if_ready(&local, session, grace, now, outbox);
        Ok(())
    }

    pub fn decline(
        &mut self,
        session_id: &SessionId,
        now: Instant,
        outbox: &mut Outbox,
    ) -> Result<(), BattleError> {
        let local = self.local.clone();
        let session = self.session_mut(session_id)?;
        if session.phase != SessionPhase::Proposed {
            return Err(wrong_phase(session));
        }
        abort(
            &local,
            session,
            AbortReason::Declined { peer: local.clone() },
            true,
            now,
            outbox,
        );
        Ok(())
    }

    pub fn cancel(
        &mut self,
        session_id: &SessionId,
        now: Instant,
        outbox: &mut Outbox,
    ) -> Result<(), BattleError> {
        let local = self.local.clone();
        let session = self.session_mut(session_id)?;
        if session.phase.is_terminal() {
            return Err(wrong_phase(session));
        }
        abort(
            &local,
            session,
            AbortReason::Cancelled { peer: local.clone() },
            true,
            now,
            outbox,
        );
        Ok(())
    }

    /// Submits the local participant's action for the current turn
    pub fn submit(
        &mut self,
        session_id: &SessionId,
        request: ActionRequest,
        now: Instant,
        outbox: &mut Outbox,
    ) -> Result<LoggedAction, BattleError> {
        let local = self.local.clone();
        let session = self.session_mut(session_id)?;
        if session.phase != SessionPhase::InProgress {
            return Err(wrong_phase(session));
        }
        let Some(state) = session.state.as_ref() else {
            return Err(wrong_phase(session));
        };
        let turn = state.turn();
        let current = state.current_actor().cloned();
        if current.as_ref() != Some(&local) {
            return Err(BattleError::NotYourTurn { current });
        }
        // the next actor may already have recorded a forfeit for this turn
        if session.pending.contains_key(&turn)
            || session.submit_deadline().is_some_and(|closes| now >= closes)
        {
            return Err(BattleError::TurnExpired { turn });
        }

        let action = request.into_action(&local, Timestamp::now())?;
        let Some(state) = session.state.as_mut() else {
            return Err(wrong_phase(session));
        };
        if let Some(violation) = state.preview(&action).rejection {
            debug!("turn {} action refused locally: {}", turn, violation);
            outbox.emit(PeerEvent::FairnessRejected(FairnessRejection {
                session_id: session_id.clone(),
                actor: local,
                turn,
                violation: violation.clone(),
            }));
            return Err(BattleError::Fairness(violation));
        }
        let entry = state.apply(turn, action.clone())?.clone();

        outbox.send(
            session.others(&local),
            MessageType::BattleAction,
            &BattleActionPayload {
                session_id: session_id.clone(),
                turn,
                action,
            },
        );
        committed(&local, session, entry.clone(), now, outbox);
        Ok(entry)
    }

    /// Handles a verified battle envelope from `sender`
    pub fn on_message(
        &mut self,
        sender: &PeerId,
        message_type: MessageType,
        payload: Value,
        now: Instant,
        outbox: &mut Outbox,
    ) {
        match message_type {
            MessageType::BattleInvite => {
                if let Some(invite) = decode(sender, message_type, payload) {
                    self.on_invite(sender, invite, now, outbox);
                }
            }
            MessageType::BattleAccept => {
                if let Some(accept) = decode(sender, message_type, payload) {
                    self.on_accept(sender, accept, now, outbox);
                }
            }
            MessageType::BattleAction => {
                if let Some(action) = decode(sender, message_type, payload) {
                    self.on_action(sender, action, now, outbox);
                }
            }
            MessageType::BattleResult => {
                if let Some(result) = decode(sender, message_type, payload) {
                    self.on_result(sender, result);
                }
            }
            MessageType::BattleAbort => {
                if let Some(abort_payload) = decode(sender, message_type, payload) {
                    self.on_abort(sender, abort_payload, now, outbox);
                }
            }
            other => trace!("battle coordinator ignores {}", other.as_str()),
        }
    }

    fn on_invite(
        &mut self,
        sender: &PeerId,
        invite: BattleInvitePayload,
        now: Instant,
        outbox: &mut Outbox,
    ) {
        if self.sessions.contains_key(&invite.session_id) {
            return;
        }
        let distinct: BTreeSet<&PeerId> = invite.participants.iter().collect();
        let well_formed = distinct.len() == invite.participants.len()
            && (MIN_BATTLE_PARTICIPANTS..=MAX_BATTLE_PARTICIPANTS).contains(&distinct.len())
            && distinct.contains(sender)
            && distinct.contains(&self.local)
            && invite.max_turns > 0
            && invite.turn_timeout_ms > 0
            && invite.time_budget_ms > 0
            && invite.fairness.validate().is_ok()
            && invite.rules.validate().is_ok();
        if !well_formed {
            warn!(
                "ignoring malformed battle invite {} from {}",
                invite.session_id,
                sender.short()
            );
            return;
        }

        let mut session = open(&invite, self.config.forfeit_grace, now);
        session.accepted.insert(sender.clone());
        if let Some((_, early)) = self.early_accepts.remove(&invite.session_id) {
            session
                .accepted
                .extend(early.into_iter().filter(|peer| invite.participants.contains(peer)));
        }
        info!("invited to battle {} by {}", invite.session_id, sender.short());
        outbox.emit(PeerEvent::BattleInvited(BattleInvitation {
            session_id: invite.session_id.clone(),
            from: sender.clone(),
            participants: invite.participants.clone(),
        }));
        self.sessions.insert(invite.session_id, session);
    }

    fn on_accept(
        &mut self,
        sender: &PeerId,
        accept: BattleAcceptPayload,
        now: Instant,
        outbox: &mut Outbox,
    ) {
        let Some(session) = self.sessions.get_mut(&accept.session_id) else {
            if self.early_accepts.len() < MAX_EARLY_ACCEPTS {
                self.early_accepts
                    .entry(accept.session_id)
                    .or_insert_with(|| (now, BTreeSet::new()))
                    .1
                    .insert(sender.clone());
            }
            return;
        };
        if session.phase != SessionPhase::Proposed || !session.includes(sender) {
            return;
        }
        session.accepted.insert(sender.clone());
        start_if_ready(&self.local, session, self.config.forfeit_grace, now, outbox);
    }

    fn on_action(
        &mut self,
        sender: &PeerId,
        payload: BattleActionPayload,
        now: Instant,
        outbox: &mut Outbox,
    ) {
        let Some(session) = self.sessions.get_mut(&payload.session_id) else {
            debug!(
                "action for unknown battle {} from {}",
                payload.session_id,
                sender.short()
            );
            return;
        };
        if !session.includes(sender) || session.phase.is_terminal() {
            return;
        }
        let turn = payload.turn;
        if payload.action.action_type != ActionType::Forfeit && &payload.action.actor != sender {
            debug!("turn {} action relayed by {}, dropping", turn, sender.short());
            return;
        }

        let held = session
            .state
            .as_ref()
            .and_then(|state| state.log().get(turn as usize))
            .map(|entry| &entry.action)
            .or_else(|| session.pending.get(&turn).map(|queued| &queued.action));
        let (held, conflicts) = match held {
            Some(action) => (true, !action.same_move(&payload.action)),
            None => (false, false),
        };
        if conflicts {
            warn!(
                "{} sent a different turn {} entry than the one already held",
                sender.short(),
                turn
            );
            abort(
                &self.local,
                session,
                AbortReason::Diverged { turn },
                true,
                now,
                outbox,
            );
            return;
        }
        if held {
            trace!("duplicate turn {} entry from {}", turn, sender.short());
            return;
        }
        if session.pending.len() >= MAX_PENDING_ACTIONS {
            warn!(
                "too many queued actions in battle {}, dropping turn {}",
                session.id, turn
            );
            return;
        }
        session.pending.insert(
            turn,
            PendingAction {
                sender: sender.clone(),
                action: payload.action,
            },
        );
        drain_pending(&self.local, session, self.config.forfeit_grace, now, outbox);
    }

    fn on_result(&mut self, sender: &PeerId, result: ResultSummary) {
        let Some(session) = self.sessions.get_mut(&result.session_id) else {
            return;
        };
        if !session.includes(sender) {
            return;
        }
        match &session.result {
            Some(local_result) => compare_results(local_result, sender, &result),
            None if session.remote_results.len() < session.participants.len() => {
                session.remote_results.push((sender.clone(), result));
            }
            None => {}
        }
    }

    fn on_abort(
        &mut self,
        sender: &PeerId,
        payload: BattleAbortPayload,
        now: Instant,
        outbox: &mut Outbox,
    ) {
        let local = self.local.clone();
        let Some(session) = self.sessions.get_mut(&payload.session_id) else {
            return;
        };
        if !session.includes(sender) || session.phase.is_terminal() {
            return;
        }
        abort(&local, session, payload.reason, false, now, outbox);
    }

    /// Aborts every unfinished session the lost peer takes part in
    pub fn peer_lost(&mut self, peer: &PeerId, now: Instant, outbox: &mut Outbox) {
        let local = self.local.clone();
        for session in self.sessions.values_mut() {
            if session.phase.is_terminal() || !session.includes(peer) {
                continue;
            }
            abort(
                &local,
                session,
                AbortReason::Disconnect { peer: peer.clone() },
                true,
                now,
                outbox,
            );
        }
    }

    /// Invite timeouts, deadline forfeits and housekeeping
    pub fn tick(&mut self, now: Instant, outbox: &mut Outbox) {
        let local = self.local.clone();
        let grace = self.config.forfeit_grace;
        let invite_timeout = self.config.invite_timeout;

        for session in self.sessions.values_mut() {
            match session.phase {
                SessionPhase::Proposed if now >= session.created + invite_timeout => {
                    abort(
                        &local,
                        session,
                        AbortReason::HandshakeTimeout,
                        true,
                        now,
                        outbox,
                    );
                }
                SessionPhase::InProgress => {
                    drain_pending(&local, session, grace, now, outbox);
                    author_forfeit(&local, session, grace, now, outbox);
                }
                _ => {}
            }
        }

        self.sessions.retain(|_, session| {
            session
                .finished_at
                .map_or(true, |finished| now < finished + RETENTION)
        });
        self.early_accepts
            .retain(|_, (received, _)| now < *received + invite_timeout);
    }

    fn session_mut(&mut self, session_id: &SessionId) -> Result<&mut Session, BattleError> {
        self.sessions
            .get_mut(session_id)
            .ok_or_else(|| BattleError::UnknownSession {
                session_id: session_id.clone(),
            })
    }
}

fn decode<P: DeserializeOwned>(sender: &PeerId, message_type: MessageType, payload: Value) -> Option<P> {
    match serde_json::from_value(payload) {
        Ok(payload) => Some(payload),
        Err(err) => {
            debug!(
                "malformed {} payload from {}: {}",
                message_type.as_str(),
                sender.short(),
                err
            );
            None
        }
    }
}

fn wrong_phase(session: &Session) -> BattleError {
    BattleError::WrongPhase {
        session_id: session.id.clone(),
        phase: session.phase,
    }
}

fn open(invite: &BattleInvitePayload, forfeit_grace: Duration, now: Instant) -> Session {
    Session {
        id: invite.session_id.clone(),
        phase: SessionPhase::Proposed,
        participants: invite.participants.clone(),
        accepted: BTreeSet::new(),
        rules: invite.rules.clone(),
        fairness: invite.fairness.clone(),
        max_turns: invite.max_turns,
        turn_timeout: Duration::from_millis(invite.turn_timeout_ms),
        time_budget: Duration::from_millis(invite.time_budget_ms),
        forfeit_grace,
        created: now,
        state: None,
        turn_started: now,
        spent: HashMap::new(),
        pending: BTreeMap::new(),
        result: None,
        remote_results: Vec::new(),
        finished_at: None,
    }
}

/// Fixes turn order and starts the first turn once everyone has accepted
fn start_if_ready(
    local: &PeerId,
    session: &mut Session,
    grace: Duration,
    now: Instant,
    outbox: &mut Outbox,
) {
    if session.accepted.len() < session.participants.len() {
        return;
    }
    session.phase = SessionPhase::Accepted;
    let state = match BattleState::new(
        session.participants.iter().cloned(),
        session.rules.clone(),
        session.fairness.clone(),
        session.max_turns,
    ) {
        Ok(state) => state,
        Err(err) => {
            warn!("battle {} cannot start: {}", session.id, err);
            return;
        }
    };
    let order: Vec<PeerId> = state.order().cloned().collect();
    session.state = Some(state);
    session.phase = SessionPhase::InProgress;
    info!("battle {} started, order {:?}", session.id, order);

    outbox.emit(PeerEvent::BattleStarted(BattleStart {
        session_id: session.id.clone(),
        order,
    }));
    begin_turn(session, now, outbox);
    drain_pending(local, session, grace, now, outbox);
}

fn begin_turn(session: &mut Session, now: Instant, outbox: &mut Outbox) {
    session.turn_started = now;
    let (Some(state), Some(closes)) = (session.state.as_ref(), session.submit_deadline()) else {
        return;
    };
    let Some(actor) = state.current_actor() else {
        return;
    };
    outbox.emit(PeerEvent::TurnStarted(TurnStart {
        session_id: session.id.clone(),
        turn: state.turn(),
        actor: actor.clone(),
        time_left: closes.saturating_duration_since(now),
    }));
}

/// Bookkeeping after an entry joined the log
fn committed(
    local: &PeerId,
    session: &mut Session,
    entry: LoggedAction,
    now: Instant,
    outbox: &mut Outbox,
) {
    session.charge_turn(&entry.action.actor, now);
    outbox.emit(PeerEvent::ActionApplied(AppliedAction {
        session_id: session.id.clone(),
        entry,
    }));

    let outcome = session.state.as_ref().and_then(|state| state.outcome());
    match outcome {
        Some(outcome) => resolve(local, session, outcome, now, outbox),
        None => begin_turn(session, now, outbox),
    }
}

fn resolve(
    local: &PeerId,
    session: &mut Session,
    outcome: BattleOutcome,
    now: Instant,
    outbox: &mut Outbox,
) {
    let final_log = session
        .state
        .as_ref()
        .map(|state| state.log().to_vec())
        .unwrap_or_default();
    let summary = ResultSummary {
        session_id: session.id.clone(),
        winner_id: outcome.winner().cloned(),
        draw: outcome.is_draw(),
        final_log,
    };
    session.finish(SessionPhase::Resolved, now);
    for (peer, remote) in session.remote_results.drain(..) {
        compare_results(&summary, &peer, &remote);
    }
    session.result = Some(summary.clone());

    info!(
        "battle {} resolved after {} turns: {}",
        session.id,
        summary.final_log.len(),
        match &summary.winner_id {
            Some(winner) => format!("{} wins", winner.short()),
            None => "draw".to_string(),
        }
    );
    outbox.send(session.others(local), MessageType::BattleResult, &summary);
    outbox.emit(PeerEvent::BattleResolved(summary));
}

fn compare_results(local: &ResultSummary, peer: &PeerId, remote: &ResultSummary) {
    if local.agrees_with(remote) {
        debug!("{} confirms result of battle {}", peer.short(), local.session_id);
    } else {
        warn!(
            "battle {} diverged: {} reports winner {:?} (draw {}) after {} turns, local replay has {:?} (draw {}) after {}",
            local.session_id,
            peer.short(),
            remote.winner_id.as_ref().map(|w| w.short()),
            remote.draw,
            remote.final_log.len(),
            local.winner_id.as_ref().map(|w| w.short()),
            local.draw,
            local.final_log.len()
        );
    }
}

fn abort(
    local: &PeerId,
    session: &mut Session,
    reason: AbortReason,
    notify: bool,
    now: Instant,
    outbox: &mut Outbox,
) {
    session.finish(SessionPhase::Aborted, now);
    warn!("battle {} aborted: {}", session.id, reason);

    let payload = BattleAbortPayload {
        session_id: session.id.clone(),
        reason,
    };
    if notify {
        outbox.send(session.others(local), MessageType::BattleAbort, &payload);
    }
    outbox.emit(PeerEvent::BattleAborted(payload));
}

fn readiness(session: &Session, pending: &PendingAction, grace: Duration, now: Instant) -> Readiness {
    let Some(state) = session.state.as_ref() else {
        return Readiness::Wait;
    };
    let Some(actor) = state.current_actor() else {
        return Readiness::Reject("battle is over");
    };

    if pending.action.action_type != ActionType::Forfeit {
        if pending.sender != pending.action.actor {
            return Readiness::Reject("sender is not the actor");
        }
        return Readiness::Apply;
    }

    if &pending.action.actor != actor {
        return Readiness::Reject("forfeit names the wrong actor");
    }
    let next = state.next_actors().next();
    if next != Some(&pending.sender) {
        return Readiness::Reject("forfeit not from the next actor");
    }
    match session.turn_deadline() {
        Some(deadline) if now + grace < deadline => Readiness::Wait,
        _ => Readiness::Apply,
    }
}

/// Applies queued actions for as long as the next turn's action is there
fn drain_pending(
    local: &PeerId,
    session: &mut Session,
    grace: Duration,
    now: Instant,
    outbox: &mut Outbox,
) {
    while session.phase == SessionPhase::InProgress {
        let Some(turn) = session.state.as_ref().map(|state| state.turn()) else {
            return;
        };
        let Some(pending) = session.pending.get(&turn) else {
            return;
        };
        match readiness(session, pending, grace, now) {
            Readiness::Wait => return,
            Readiness::Reject(reason) => {
                debug!(
                    "discarding turn {} action from {}: {}",
                    turn,
                    pending.sender.short(),
                    reason
                );
                session.pending.remove(&turn);
                continue;
            }
            Readiness::Apply => {}
        }
        let Some(pending) = session.pending.remove(&turn) else {
            return;
        };
        let Some(state) = session.state.as_mut() else {
            return;
        };

        match state.apply(turn, pending.action.clone()) {
            Ok(entry) => {
                let entry = entry.clone();
                committed(local, session, entry, now, outbox);
            }
            Err(BattleRuleError::Fairness(violation)) => {
                warn!(
                    "{} sent a turn {} action its own enforcer should have refused: {}",
                    pending.sender.short(),
                    turn,
                    violation
                );
                outbox.emit(PeerEvent::FairnessRejected(FairnessRejection {
                    session_id: session.id.clone(),
                    actor: pending.action.actor,
                    turn,
                    violation,
                }));
            }
            Err(err) => debug!(
                "turn {} action from {} not applied: {}",
                turn,
                pending.sender.short(),
                err
            ),
        }
    }
}

/// Records a forfeit for a silent actor when the local peer is next in line
/// and the deadline plus grace has passed
fn author_forfeit(
    local: &PeerId,
    session: &mut Session,
    grace: Duration,
    now: Instant,
    outbox: &mut Outbox,
) {
    let Some(state) = session.state.as_ref() else {
        return;
    };
    let Some(actor) = state.current_actor().cloned() else {
        return;
    };
    if &actor == local || state.next_actors().next() != Some(local) {
        return;
    }
    match session.turn_deadline() {
        Some(deadline) if now >= deadline + grace => {}
        _ => return,
    }

    let turn = state.turn();
    let Some(state) = session.state.as_mut() else {
        return;
    };
    let entry = match state.forfeit(turn, Timestamp::now()) {
        Ok(entry) => entry.clone(),
        Err(err) => {
            debug!("could not record forfeit for turn {}: {}", turn, err);
            return;
        }
    };
    info!(
        "{} timed out on turn {} of battle {}, recording forfeit",
        actor.short(),
        turn,
        session.id
    );
    outbox.send(
        session.others(local),
        MessageType::BattleAction,
        &BattleActionPayload {
            session_id: session.id.clone(),
            turn,
            action: entry.action.clone(),
        },
    );
    committed(local, session, entry, now, outbox);
}
