//! Gateway frame envelope
//!
//! Every message is a JSON object `{op, d}`; dispatches also carry the
//! sequence number `s` and event name `t`.

use super::OpCode;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A frame received from the gateway
///
/// `op` stays a raw integer so frames with op codes this client does not
/// know about still decode and can be skipped.
#[derive(Debug, Clone, Deserialize)]
pub struct InboundFrame {
    pub op: u8,
    #[serde(default)]
    pub d: Option<Value>,
    #[serde(default)]
    pub s: Option<u64>,
    #[serde(default)]
    pub t: Option<String>,
}

impl InboundFrame {
    pub fn opcode(&self) -> Option<OpCode> {
        OpCode::from_u8(self.op)
    }

    /// The payload, or JSON null when absent
    pub fn data(&self) -> &Value {
        self.d.as_ref().unwrap_or(&Value::Null)
    }
}

/// A frame sent to the gateway
#[derive(Debug, Serialize)]
pub struct OutboundFrame<'a, T: Serialize + ?Sized> {
    pub op: OpCode,
    pub d: &'a T,
}

impl<'a, T: Serialize + ?Sized> OutboundFrame<'a, T> {
    pub fn new(op: OpCode, d: &'a T) -> Self {
        Self { op, d }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_dispatch_frame_decodes() {
        let frame: InboundFrame = serde_json::from_str(
            r#"{"op":0,"s":42,"t":"MESSAGE_CREATE","d":{"content":"hi"}}"#,
        )
        .unwrap();
        assert_eq!(frame.opcode(), Some(OpCode::Dispatch));
        assert_eq!(frame.s, Some(42));
        assert_eq!(frame.t.as_deref(), Some("MESSAGE_CREATE"));
        assert_eq!(frame.data()["content"], "hi");
    }

    #[test]
    fn test_unknown_op_still_decodes() {
        let frame: InboundFrame = serde_json::from_str(r#"{"op":42,"d":null}"#).unwrap();
        assert_eq!(frame.opcode(), None);
        assert!(frame.data().is_null());
    }

    #[test]
    fn test_outbound_heartbeat_shape() {
        let seq: Option<u64> = Some(7);
        let json = OutboundFrame::new(OpCode::Heartbeat, &seq).to_json().unwrap();
        let value: Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value, json!({"op": 1, "d": 7}));

        let none: Option<u64> = None;
        let json = OutboundFrame::new(OpCode::Heartbeat, &none).to_json().unwrap();
        assert_eq!(json, r#"{"op":1,"d":null}"#);
    }
}
