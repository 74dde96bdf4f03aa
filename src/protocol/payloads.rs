//! Gateway payload definitions
//!
//! Inbound payloads are deserialized from the `d` field of a frame.
//! Outbound commands are plain structs with explicit optional fields; the
//! `into_payload` conversions validate them before anything touches the wire.

use crate::error::GatewayError;
use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value;

/// Maximum nonce length accepted by the gateway, in bytes
pub const MAX_NONCE_LEN: usize = 32;

/// Maximum number of user ids in one member request
pub const MAX_MEMBER_REQUEST_USERS: usize = 100;

// === Inbound ===

/// HELLO (op 10)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct HelloPayload {
    /// Heartbeat interval in milliseconds
    pub heartbeat_interval: u64,
}

/// The parts of the READY dispatch the connection keeps
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ReadyPayload {
    pub session_id: String,
    #[serde(default)]
    pub resume_gateway_url: Option<String>,
}

// === Outbound: handshake ===

/// Client identification metadata sent with IDENTIFY
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionProperties {
    pub os: String,
    pub browser: String,
    pub device: String,
}

impl Default for ConnectionProperties {
    fn default() -> Self {
        Self {
            os: std::env::consts::OS.to_string(),
            browser: env!("CARGO_PKG_NAME").to_string(),
            device: env!("CARGO_PKG_NAME").to_string(),
        }
    }
}

/// IDENTIFY (op 2)
#[derive(Debug, Clone, Serialize)]
pub struct IdentifyPayload {
    pub token: String,
    pub properties: ConnectionProperties,
    pub intents: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub large_threshold: Option<u32>,
    /// `[shard_id, shard_count]`; omitted when sharding is disabled
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shard: Option<[u32; 2]>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub presence: Option<Presence>,
}

/// RESUME (op 6)
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResumePayload {
    pub token: String,
    pub session_id: String,
    pub seq: Option<u64>,
}

// === Outbound: commands ===

/// Request for REQUEST_GUILD_MEMBERS (op 8)
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GuildMembersRequest {
    pub guild_id: u64,
    /// Username prefix to match; empty string matches everyone
    pub query: Option<String>,
    pub limit: Option<u32>,
    pub presences: Option<bool>,
    /// Explicit users to fetch; takes precedence over `user_id`
    pub user_ids: Vec<u64>,
    pub user_id: Option<u64>,
    /// Echoed back in the GUILD_MEMBERS_CHUNK dispatches
    pub nonce: Option<String>,
}

/// A single user id or a list, as the gateway accepts both
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UserIds {
    One(u64),
    Many(Vec<u64>),
}

impl Serialize for UserIds {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match self {
            Self::One(id) => serializer.serialize_str(&id.to_string()),
            Self::Many(ids) => serializer.collect_seq(ids.iter().map(u64::to_string)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RequestGuildMembersPayload {
    pub guild_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub query: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub presences: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_ids: Option<UserIds>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
}

impl GuildMembersRequest {
    /// Request every member whose username starts with `query`.
    pub fn query(guild_id: u64, query: impl Into<String>, limit: u32) -> Self {
        Self {
            guild_id,
            query: Some(query.into()),
            limit: Some(limit),
            ..Self::default()
        }
    }

    /// Request specific members by id.
    pub fn users(guild_id: u64, user_ids: impl IntoIterator<Item = u64>) -> Self {
        Self {
            guild_id,
            user_ids: user_ids.into_iter().collect(),
            ..Self::default()
        }
    }

    pub fn into_payload(self) -> Result<RequestGuildMembersPayload, GatewayError> {
        const COMMAND: &str = "request_guild_members";

        if self.guild_id == 0 {
            return Err(GatewayError::invalid_command(COMMAND, "guild_id must be set"));
        }

        let user_ids = if !self.user_ids.is_empty() {
            if self.user_ids.len() > MAX_MEMBER_REQUEST_USERS {
                return Err(GatewayError::invalid_command(
                    COMMAND,
                    format!(
                        "at most {MAX_MEMBER_REQUEST_USERS} user ids per request, got {}",
                        self.user_ids.len()
                    ),
                ));
            }
            Some(UserIds::Many(self.user_ids))
        } else {
            self.user_id.map(UserIds::One)
        };

        match (&self.query, &user_ids) {
            (Some(_), Some(_)) => {
                return Err(GatewayError::invalid_command(
                    COMMAND,
                    "query and user ids are mutually exclusive",
                ));
            }
            (None, None) => {
                return Err(GatewayError::invalid_command(
                    COMMAND,
                    "either query or user ids must be set",
                ));
            }
            _ => {}
        }

        if let Some(nonce) = &self.nonce {
            if nonce.len() > MAX_NONCE_LEN {
                return Err(GatewayError::invalid_command(
                    COMMAND,
                    format!("nonce exceeds {MAX_NONCE_LEN} bytes"),
                ));
            }
        }

        // The gateway requires a limit alongside a query; 0 means "no limit".
        let limit = match (&self.query, self.limit) {
            (Some(_), None) => Some(0),
            (_, limit) => limit,
        };

        Ok(RequestGuildMembersPayload {
            guild_id: self.guild_id.to_string(),
            query: self.query,
            limit,
            presences: self.presences,
            user_ids,
            nonce: self.nonce,
        })
    }
}

/// Request for VOICE_STATE_UPDATE (op 4)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VoiceStateUpdate {
    pub guild_id: u64,
    /// `None` disconnects from voice in this guild
    pub channel_id: Option<u64>,
    pub self_mute: bool,
    pub self_deaf: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VoiceStateUpdatePayload {
    pub guild_id: String,
    pub channel_id: Option<String>,
    pub self_mute: bool,
    pub self_deaf: bool,
}

impl VoiceStateUpdate {
    pub fn join(guild_id: u64, channel_id: u64) -> Self {
        Self {
            guild_id,
            channel_id: Some(channel_id),
            ..Self::default()
        }
    }

    pub fn leave(guild_id: u64) -> Self {
        Self {
            guild_id,
            ..Self::default()
        }
    }

    pub fn into_payload(self) -> Result<VoiceStateUpdatePayload, GatewayError> {
        const COMMAND: &str = "update_voice_state";

        if self.guild_id == 0 {
            return Err(GatewayError::invalid_command(COMMAND, "guild_id must be set"));
        }
        if self.channel_id == Some(0) {
            return Err(GatewayError::invalid_command(
                COMMAND,
                "channel_id must be a valid id or absent",
            ));
        }

        Ok(VoiceStateUpdatePayload {
            guild_id: self.guild_id.to_string(),
            channel_id: self.channel_id.map(|id| id.to_string()),
            self_mute: self.self_mute,
            self_deaf: self.self_deaf,
        })
    }
}

// === Presence ===

/// Online status shown to other users
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    #[default]
    Online,
    Dnd,
    Idle,
    Invisible,
    Offline,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ActivityType {
    Game = 0,
    Streaming = 1,
    Listening = 2,
    Watching = 3,
    Custom = 4,
    Competing = 5,
}

impl Serialize for ActivityType {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u8(*self as u8)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Activity {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: ActivityType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
}

impl Activity {
    pub fn new(kind: ActivityType, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind,
            url: None,
            state: None,
        }
    }
}

/// Presence, sent with IDENTIFY or as PRESENCE_UPDATE (op 3)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Presence {
    /// Unix time in milliseconds since the client went idle
    pub since: Option<u64>,
    pub activities: Vec<Activity>,
    pub status: Status,
    pub afk: bool,
}

impl Presence {
    pub fn new(status: Status) -> Self {
        Self {
            status,
            ..Self::default()
        }
    }

    pub fn with_activity(mut self, activity: Activity) -> Self {
        self.activities.push(activity);
        self
    }

    pub fn validate(&self) -> Result<(), GatewayError> {
        for activity in &self.activities {
            if activity.name.is_empty() && activity.kind != ActivityType::Custom {
                return Err(GatewayError::invalid_command(
                    "update_presence",
                    "activity name must not be empty",
                ));
            }
            if activity.url.is_some() && activity.kind != ActivityType::Streaming {
                return Err(GatewayError::invalid_command(
                    "update_presence",
                    "only streaming activities carry a url",
                ));
            }
        }
        Ok(())
    }
}

/// Parse a payload out of a frame's `d` field.
pub fn parse_data<T: for<'de> Deserialize<'de>>(data: &Value) -> Result<T, serde_json::Error> {
    T::deserialize(data)
}
