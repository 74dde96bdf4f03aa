//! Gateway close codes and reconnect classification

use std::ops::RangeInclusive;

/// Close codes after which the session can no longer be resumed.
pub const SESSION_EXPIRED_CODES: [u16; 2] = [4007, 4009];

/// Standard WebSocket closures; the session survives and is resumed.
pub const NORMAL_CLOSURE_RANGE: RangeInclusive<u16> = 1000..=1010;

/// Used when the client itself drops the connection but wants to resume.
///
/// Private-use range, so the gateway keeps the session alive; a 1000/1001
/// close would invalidate it server side.
pub const CLIENT_RESUME_CLOSE: u16 = 4900;

/// Used when the client drops the connection to start a fresh session.
pub const CLIENT_FRESH_CLOSE: u16 = 1000;

/// Reported when the transport went away without a close frame.
pub const ABNORMAL_CLOSE: u16 = 1006;

/// Reported when a close frame carried no status code.
pub const NO_STATUS_CLOSE: u16 = 1005;

/// Application-level close codes sent by the gateway
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum GatewayCloseCode {
    UnknownError = 4000,
    UnknownOpcode = 4001,
    DecodeError = 4002,
    NotAuthenticated = 4003,
    AuthenticationFailed = 4004,
    AlreadyAuthenticated = 4005,
    InvalidSequence = 4007,
    RateLimited = 4008,
    SessionTimedOut = 4009,
    InvalidShard = 4010,
    ShardingRequired = 4011,
    InvalidApiVersion = 4012,
    InvalidIntents = 4013,
    DisallowedIntents = 4014,
}

impl GatewayCloseCode {
    #[must_use]
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            4000 => Some(Self::UnknownError),
            4001 => Some(Self::UnknownOpcode),
            4002 => Some(Self::DecodeError),
            4003 => Some(Self::NotAuthenticated),
            4004 => Some(Self::AuthenticationFailed),
            4005 => Some(Self::AlreadyAuthenticated),
            4007 => Some(Self::InvalidSequence),
            4008 => Some(Self::RateLimited),
            4009 => Some(Self::SessionTimedOut),
            4010 => Some(Self::InvalidShard),
            4011 => Some(Self::ShardingRequired),
            4012 => Some(Self::InvalidApiVersion),
            4013 => Some(Self::InvalidIntents),
            4014 => Some(Self::DisallowedIntents),
            _ => None,
        }
    }

    #[must_use]
    pub const fn as_u16(self) -> u16 {
        self as u16
    }

    /// Whether the client may reconnect after receiving this code
    #[must_use]
    pub const fn is_recoverable(self) -> bool {
        !matches!(
            self,
            Self::AuthenticationFailed
                | Self::InvalidShard
                | Self::ShardingRequired
                | Self::InvalidApiVersion
                | Self::InvalidIntents
                | Self::DisallowedIntents
        )
    }

    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::UnknownError => "Unknown error",
            Self::UnknownOpcode => "Unknown opcode",
            Self::DecodeError => "Decode error",
            Self::NotAuthenticated => "Not authenticated",
            Self::AuthenticationFailed => "Authentication failed",
            Self::AlreadyAuthenticated => "Already authenticated",
            Self::InvalidSequence => "Invalid seq",
            Self::RateLimited => "Rate limited",
            Self::SessionTimedOut => "Session timed out",
            Self::InvalidShard => "Invalid shard",
            Self::ShardingRequired => "Sharding required",
            Self::InvalidApiVersion => "Invalid API version",
            Self::InvalidIntents => "Invalid intent(s)",
            Self::DisallowedIntents => "Disallowed intent(s)",
        }
    }

    #[must_use]
    pub const fn description(self) -> &'static str {
        match self {
            Self::UnknownError => "Something went wrong on the gateway side.",
            Self::UnknownOpcode => "An invalid op code or payload for an op code was sent.",
            Self::DecodeError => "An undecodable payload was sent.",
            Self::NotAuthenticated => "A payload was sent before identifying.",
            Self::AuthenticationFailed => "The token sent with the identify payload is incorrect.",
            Self::AlreadyAuthenticated => "More than one identify payload was sent.",
            Self::InvalidSequence => "The sequence sent when resuming was invalid.",
            Self::RateLimited => "Payloads were sent too quickly.",
            Self::SessionTimedOut => "The session timed out.",
            Self::InvalidShard => "An invalid shard was sent when identifying.",
            Self::ShardingRequired => "The session would handle too many guilds; sharding is required.",
            Self::InvalidApiVersion => "An invalid gateway version was requested.",
            Self::InvalidIntents => "An invalid intent bitmask was sent.",
            Self::DisallowedIntents => "An intent that is not enabled or approved was sent.",
        }
    }
}

impl std::fmt::Display for GatewayCloseCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({}): {}", self.name(), self.as_u16(), self.description())
    }
}

/// What the connection does after its transport closed with a given code
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseDisposition {
    /// Reconnect; resume if a session is still held
    Resume,
    /// Drop the session, reconnect and identify again
    Fresh,
    /// Terminal; do not reconnect
    Fatal(GatewayCloseCode),
}

impl CloseDisposition {
    #[must_use]
    pub const fn reconnects(self) -> bool {
        !matches!(self, Self::Fatal(_))
    }
}

/// Classify a close code.
///
/// Session-expiry codes win over everything else, normal closures resume,
/// named codes follow the table and anything unrecognised is treated as
/// recoverable.
#[must_use]
pub fn classify(code: u16) -> CloseDisposition {
    if SESSION_EXPIRED_CODES.contains(&code) {
        return CloseDisposition::Fresh;
    }
    if NORMAL_CLOSURE_RANGE.contains(&code) {
        return CloseDisposition::Resume;
    }
    match GatewayCloseCode::from_u16(code) {
        Some(known) if !known.is_recoverable() => CloseDisposition::Fatal(known),
        _ => CloseDisposition::Resume,
    }
}
