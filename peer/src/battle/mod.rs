//! Battle sessions: lifecycle, turn arbitration and deadline forfeits on
//! top of the deterministic replay in `duel_shared::battle`.

mod coordinator;
mod session;

pub use coordinator::{BattleCoordinator, MAX_BATTLE_PARTICIPANTS, MIN_BATTLE_PARTICIPANTS};
pub use session::ActionRequest;
