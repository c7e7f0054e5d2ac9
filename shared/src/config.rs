use std::{
    default::Default,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    time::Duration,
};

use serde::{Deserialize, Serialize};

use crate::{
    battle::{BattleRules, FairnessConstraint},
    error::ConfigError,
};

/// Upper bound on `max_peers`
pub const MAX_PEERS_LIMIT: usize = 16;
/// Lowest non-privileged port accepted for discovery
pub const MIN_DISCOVERY_PORT: u16 = 1024;
/// Capability string advertised by nodes that run a bot
pub const BOT_CAPABILITY: &str = "bot";

/// Contains the networking properties of a node
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkConfig {
    /// Only peers announcing the same id are admitted
    #[serde(rename = "networkID")]
    pub network_id: String,
    pub max_peers: usize,
    /// UDP port discovery announcements are sent to and received on
    pub discovery_port: u16,
    /// Advertise the `bot` capability
    pub bot_capable: bool,
    /// Run the UDP announce/listen loop. Without it peers are only learned
    /// from packets handed to the node directly.
    #[serde(default = "enabled")]
    pub discovery_enabled: bool,
    pub discovery_interval: Duration,
    pub broadcast_address: IpAddr,
    /// Stream listener bind address. Port 0 picks an ephemeral port.
    pub listen_address: SocketAddr,
    /// Discovered peers silent for this long are forgotten
    pub peer_silence_timeout: Duration,
    pub handshake_timeout: Duration,
    pub max_frame_size: usize,
    pub max_message_age: Duration,
    pub max_clock_skew: Duration,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            network_id: String::new(),
            max_peers: 8,
            discovery_port: 8080,
            bot_capable: false,
            discovery_enabled: true,
            discovery_interval: Duration::from_secs(5),
            broadcast_address: IpAddr::V4(Ipv4Addr::BROADCAST),
            listen_address: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
            peer_silence_timeout: Duration::from_secs(30),
            handshake_timeout: Duration::from_secs(10),
            max_frame_size: 1024 * 1024,
            max_message_age: Duration::from_secs(300),
            max_clock_skew: Duration::from_secs(60),
        }
    }
}

impl NetworkConfig {
    pub fn new(network_id: &str) -> Self {
        Self {
            network_id: network_id.to_string(),
            ..Self::default()
        }
    }

    pub fn with_max_peers(mut self, max_peers: usize) -> Self {
        self.max_peers = max_peers;
        self
    }

    pub fn with_discovery_port(mut self, port: u16) -> Self {
        self.discovery_port = port;
        self
    }

    pub fn with_bot_capable(mut self, bot_capable: bool) -> Self {
        self.bot_capable = bot_capable;
        self
    }

    pub fn with_discovery_enabled(mut self, enabled: bool) -> Self {
        self.discovery_enabled = enabled;
        self
    }

    pub fn with_listen_address(mut self, address: SocketAddr) -> Self {
        self.listen_address = address;
        self
    }

    pub fn with_discovery_interval(mut self, interval: Duration) -> Self {
        self.discovery_interval = interval;
        self
    }

    pub fn with_peer_silence_timeout(mut self, timeout: Duration) -> Self {
        self.peer_silence_timeout = timeout;
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Capabilities advertised in discovery packets and handshakes
    pub fn capabilities(&self) -> Vec<String> {
        if self.bot_capable {
            vec![BOT_CAPABILITY.to_string()]
        } else {
            Vec::new()
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_network_id(&self.network_id)?;
        if self.max_peers > MAX_PEERS_LIMIT {
            return Err(ConfigError::MaxPeersOutOfRange {
                value: self.max_peers,
                max: MAX_PEERS_LIMIT,
            });
        }
        if self.discovery_port < MIN_DISCOVERY_PORT {
            return Err(ConfigError::PrivilegedPort {
                port: self.discovery_port,
            });
        }
        non_zero("discoveryInterval", self.discovery_interval)?;
        non_zero("peerSilenceTimeout", self.peer_silence_timeout)?;
        non_zero("handshakeTimeout", self.handshake_timeout)?;
        non_zero("maxMessageAge", self.max_message_age)?;
        if self.max_frame_size == 0 {
            return Err(ConfigError::NotPositive {
                field: "maxFrameSize",
            });
        }
        Ok(())
    }
}

fn enabled() -> bool {
    true
}

/// `networkID` must be non-empty and limited to `[A-Za-z0-9_-]`
pub fn validate_network_id(network_id: &str) -> Result<(), ConfigError> {
    if network_id.is_empty() {
        return Err(ConfigError::MissingNetworkId);
    }
    if !network_id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err(ConfigError::InvalidNetworkId {
            network_id: network_id.to_string(),
        });
    }
    Ok(())
}

/// Jittered exponential backoff used while a lost peer is being re-dialed
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconnectConfig {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_attempts: u32,
    /// Fraction of each delay randomly added or removed, in `[0, 1)`
    pub jitter: f64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            max_attempts: 5,
            jitter: 0.2,
        }
    }
}

impl ReconnectConfig {
    pub fn with_base_delay(mut self, base_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        non_zero("baseDelay", self.base_delay)?;
        if self.max_delay < self.base_delay {
            return Err(ConfigError::OutOfRange {
                field: "maxDelay",
                value: format!("{:?}", self.max_delay),
                min: format!("{:?}", self.base_delay),
                max: "unbounded".to_string(),
            });
        }
        if !(0.0..1.0).contains(&self.jitter) {
            return Err(ConfigError::OutOfRange {
                field: "jitter",
                value: self.jitter.to_string(),
                min: "0".to_string(),
                max: "1".to_string(),
            });
        }
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncConfig {
    /// Period of full local snapshot re-broadcasts
    pub sync_interval: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            sync_interval: Duration::from_secs(30),
        }
    }
}

impl SyncConfig {
    pub fn with_sync_interval(mut self, sync_interval: Duration) -> Self {
        self.sync_interval = sync_interval;
        self
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BattleConfig {
    pub turn_timeout: Duration,
    /// Extra wait before the next actor records a forfeit
    pub forfeit_grace: Duration,
    /// Time every invitee has to accept before the session aborts
    pub invite_timeout: Duration,
    pub max_turns: u64,
    /// Total thinking time each participant may spend over a session
    pub time_budget: Duration,
    pub fairness: FairnessConstraint,
    pub rules: BattleRules,
}

impl Default for BattleConfig {
    fn default() -> Self {
        Self {
            turn_timeout: Duration::from_secs(30),
            forfeit_grace: Duration::from_secs(1),
            invite_timeout: Duration::from_secs(60),
            max_turns: 50,
            time_budget: Duration::from_secs(300),
            fairness: FairnessConstraint::default(),
            rules: BattleRules::default(),
        }
    }
}

impl BattleConfig {
    pub fn with_turn_timeout(mut self, turn_timeout: Duration) -> Self {
        self.turn_timeout = turn_timeout;
        self
    }

    pub fn with_forfeit_grace(mut self, grace: Duration) -> Self {
        self.forfeit_grace = grace;
        self
    }

    pub fn with_invite_timeout(mut self, invite_timeout: Duration) -> Self {
        self.invite_timeout = invite_timeout;
        self
    }

    pub fn with_max_turns(mut self, max_turns: u64) -> Self {
        self.max_turns = max_turns;
        self
    }

    pub fn with_time_budget(mut self, time_budget: Duration) -> Self {
        self.time_budget = time_budget;
        self
    }

    pub fn with_rules(mut self, rules: BattleRules) -> Self {
        self.rules = rules;
        self
    }

    pub fn with_fairness(mut self, fairness: FairnessConstraint) -> Self {
        self.fairness = fairness;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        non_zero("turnTimeout", self.turn_timeout)?;
        if self.forfeit_grace >= self.turn_timeout {
            return Err(ConfigError::OutOfRange {
                field: "forfeitGrace",
                value: format!("{:?}", self.forfeit_grace),
                min: "0s".to_string(),
                max: format!("{:?}", self.turn_timeout),
            });
        }
        non_zero("inviteTimeout", self.invite_timeout)?;
        non_zero("timeBudget", self.time_budget)?;
        if self.max_turns == 0 {
            return Err(ConfigError::NotPositive { field: "maxTurns" });
        }
        self.fairness.validate()?;
        self.rules.validate()
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupConfig {
    pub invitation_timeout: Duration,
    /// Includes the initiator
    pub min_participants: usize,
    /// Includes the initiator
    pub max_participants: usize,
}

impl Default for GroupConfig {
    fn default() -> Self {
        Self {
            invitation_timeout: Duration::from_secs(60),
            min_participants: 2,
            max_participants: 8,
        }
    }
}

impl GroupConfig {
    pub fn with_invitation_timeout(mut self, invitation_timeout: Duration) -> Self {
        self.invitation_timeout = invitation_timeout;
        self
    }

    pub fn with_min_participants(mut self, min_participants: usize) -> Self {
        self.min_participants = min_participants;
        self
    }

    pub fn with_max_participants(mut self, max_participants: usize) -> Self {
        self.max_participants = max_participants;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        non_zero("invitationTimeout", self.invitation_timeout)?;
        if self.min_participants < 2 || self.min_participants > self.max_participants {
            return Err(ConfigError::OutOfRange {
                field: "minParticipants",
                value: self.min_participants.to_string(),
                min: "2".to_string(),
                max: self.max_participants.to_string(),
            });
        }
        Ok(())
    }
}

/// Contains Config properties which will be used by a Node
#[derive(Clone, Debug, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeConfig {
    pub network: NetworkConfig,
    pub reconnect: ReconnectConfig,
    pub sync: SyncConfig,
    pub battle: BattleConfig,
    pub group: GroupConfig,
}

impl NodeConfig {
    pub fn new(network_id: &str) -> Self {
        Self {
            network: NetworkConfig::new(network_id),
            ..Self::default()
        }
    }

    pub fn with_network(mut self, network: NetworkConfig) -> Self {
        self.network = network;
        self
    }

    pub fn with_reconnect(mut self, reconnect: ReconnectConfig) -> Self {
        self.reconnect = reconnect;
        self
    }

    pub fn with_sync(mut self, sync: SyncConfig) -> Self {
        self.sync = sync;
        self
    }

    pub fn with_battle(mut self, battle: BattleConfig) -> Self {
        self.battle = battle;
        self
    }

    pub fn with_group(mut self, group: GroupConfig) -> Self {
        self.group = group;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.network.validate()?;
        self.reconnect.validate()?;
        non_zero("syncInterval", self.sync.sync_interval)?;
        self.battle.validate()?;
        self.group.validate()
    }
}

fn non_zero(field: &'static str, value: Duration) -> Result<(), ConfigError> {
    if value.is_zero() {
        Err(ConfigError::NotPositive { field })
    } else {
        Ok(())
    }
}
