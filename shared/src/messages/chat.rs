use serde::{Deserialize, Serialize};

use crate::identity::PeerId;

/// Free-form chat line, broadcast unless addressed with `to`
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatPayload {
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<PeerId>,
}
