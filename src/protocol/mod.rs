//! Gateway wire protocol
//!
//! Op codes, close codes, frame envelope and payload types.

pub mod close_codes;
pub mod frame;
pub mod opcodes;
pub mod payloads;

pub use close_codes::{classify, CloseDisposition, GatewayCloseCode};
pub use frame::{InboundFrame, OutboundFrame};
pub use opcodes::OpCode;
pub use payloads::{
    Activity, ActivityType, ConnectionProperties, GuildMembersRequest, HelloPayload,
    IdentifyPayload, Presence, ReadyPayload, ResumePayload, Status, VoiceStateUpdate,
};

/// Gateway API version requested on connect
pub const API_VERSION: u8 = 10;

/// Default gateway endpoint
pub const DEFAULT_GATEWAY_URL: &str = "wss://gateway.discord.gg";

/// Append the version and encoding query to a gateway base URL.
pub fn gateway_url(base: &str) -> String {
    format!(
        "{}/?v={API_VERSION}&encoding=json",
        base.trim_end_matches('/')
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gateway_url_suffix() {
        assert_eq!(
            gateway_url(DEFAULT_GATEWAY_URL),
            "wss://gateway.discord.gg/?v=10&encoding=json"
        );
        assert_eq!(
            gateway_url("wss://resume.example/"),
            "wss://resume.example/?v=10&encoding=json"
        );
    }
}
