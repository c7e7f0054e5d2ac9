use std::{sync::Arc, time::Duration};

use fastrand::Rng;
use log::{debug, info, warn};
use tokio::{sync::watch, task::JoinHandle, time};

use duel_peer::{PeerEvent, TurnStart};

use crate::{
    engine::{
        choose_action, choose_vote, chat_reply, should_accept_battle, should_join_activity,
        think_delay,
    },
    error::BotError,
    participant::Participant,
    personality::Personality,
};

/// Drives a [`Participant`] from its own event stream until shutdown.
///
/// Every decision is made when the event arrives; acting on it waits a
/// personality-dependent delay on a separate task so the event loop never
/// stalls.
pub struct BotController<P: Participant> {
    participant: Arc<P>,
    personality: Personality,
    rng: Rng,
}

impl<P: Participant> BotController<P> {
    pub fn new(participant: P, personality: Personality) -> Result<Self, BotError> {
        personality.validate()?;
        Ok(Self {
            participant: Arc::new(participant),
            personality,
            rng: Rng::new(),
        })
    }

    /// Makes every decision reproducible
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = Rng::with_seed(seed);
        self
    }

    pub fn personality(&self) -> &Personality {
        &self.personality
    }

    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }

    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let mut events = self.participant.subscribe();
        info!("bot {} running", self.participant.local_id().short());
        loop {
            let event = tokio::select! {
                _ = shutdown.changed() => break,
                event = events.recv() => event,
            };
            let Some(event) = event else {
                break;
            };
            self.handle(event, &shutdown);
        }
        info!("bot {} stopped", self.participant.local_id().short());
    }

    fn handle(&mut self, event: PeerEvent, shutdown: &watch::Receiver<bool>) {
        match event {
            PeerEvent::BattleInvited(invitation) => {
                let accept = should_accept_battle(&self.personality, &mut self.rng);
                let delay = think_delay(&self.personality, None, &mut self.rng);
                self.later(delay, shutdown, move |participant| {
                    let session_id = &invitation.session_id;
                    let result = if accept {
                        participant.accept_battle(session_id)
                    } else {
                        participant.decline_battle(session_id)
                    };
                    match result {
                        Ok(()) => debug!("answered battle {}: accept={}", session_id, accept),
                        Err(err) => debug!("could not answer battle {}: {}", session_id, err),
                    }
                });
            }
            PeerEvent::TurnStarted(turn) if &turn.actor == self.participant.local_id() => {
                let delay = think_delay(&self.personality, Some(turn.time_left), &mut self.rng);
                let personality = self.personality.clone();
                let mut rng = Rng::with_seed(self.rng.u64(..));
                self.later(delay, shutdown, move |participant| {
                    play_turn(participant, &turn, &personality, &mut rng)
                });
            }
            PeerEvent::GroupInvited(invitation) => {
                let join = should_join_activity(&self.personality, &mut self.rng);
                let delay = think_delay(&self.personality, Some(invitation.time_left), &mut self.rng);
                self.later(delay, shutdown, move |participant| {
                    if let Err(err) = participant.respond_to_ceremony(&invitation.ceremony_id, join) {
                        debug!("could not answer ceremony {}: {}", invitation.ceremony_id, err);
                    }
                });
            }
            PeerEvent::GroupPhaseOpened(opening) => {
                let Some(choice) = choose_vote(&self.personality, &opening.choices, &mut self.rng)
                else {
                    return;
                };
                let delay = think_delay(&self.personality, Some(opening.time_left), &mut self.rng);
                self.later(delay, shutdown, move |participant| {
                    match participant.vote_in_ceremony(&opening.ceremony_id, &choice) {
                        Ok(()) => debug!(
                            "voted '{}' in phase {} of ceremony {}",
                            choice, opening.index, opening.ceremony_id
                        ),
                        Err(err) => {
                            debug!("could not vote in ceremony {}: {}", opening.ceremony_id, err)
                        }
                    }
                });
            }
            // direct messages are replies; answering them would never end
            PeerEvent::ChatReceived(chat) if !chat.direct => {
                let Some(reply) = chat_reply(&self.personality, &chat.text, &mut self.rng) else {
                    return;
                };
                let delay = think_delay(&self.personality, None, &mut self.rng);
                self.later(delay, shutdown, move |participant| {
                    if let Err(err) = participant.send_chat(&reply, Some(&chat.from)) {
                        debug!("chat reply to {} failed: {}", chat.from.short(), err);
                    }
                });
            }
            _ => {}
        }
    }

    fn later<F>(&self, delay: Duration, shutdown: &watch::Receiver<bool>, act: F)
    where
        F: FnOnce(&P) + Send + 'static,
    {
        let participant = self.participant.clone();
        let mut shutdown = shutdown.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = shutdown.changed() => {}
                _ = time::sleep(delay) => act(&participant),
            }
        });
    }
}

fn play_turn<P: Participant>(
    participant: &P,
    turn: &TurnStart,
    personality: &Personality,
    rng: &mut Rng,
) {
    let Some(view) = participant.battle_view(&turn.session_id) else {
        return;
    };
    if view.turn() != Some(turn.turn) || !view.is_my_turn() {
        return;
    }
    let Some(request) = choose_action(&view, personality, rng) else {
        warn!(
            "no acceptable action on turn {} of battle {}, letting it lapse",
            turn.turn, turn.session_id
        );
        return;
    };
    match participant.submit_battle_action(&turn.session_id, request) {
        Ok(entry) => debug!(
            "played {:?} on turn {} of battle {}",
            entry.action.action_type, entry.turn, turn.session_id
        ),
        Err(err) => warn!(
            "turn {} of battle {} refused: {}",
            turn.turn, turn.session_id, err
        ),
    }
}
