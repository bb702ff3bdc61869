use serde::{Deserialize, Serialize};

use crate::delta::{ContextDelta, ContextValue};
use crate::ids::{ContextName, PeerId};

/// One context mutation as it crosses a process boundary. The transport
/// assigns the total order of versions per name; receivers apply envelopes
/// in strictly increasing version order.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Envelope {
    pub name: ContextName,
    pub version: u64,
    pub delta: ContextDelta,
    pub sender: PeerId,
}

/// Authoritative full value of one context, sent in answer to a resync
/// request when a receiver's local view has diverged.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Snapshot {
    pub name: ContextName,
    pub version: u64,
    pub value: ContextValue,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn envelope_serde_roundtrip() {
        let envelope = Envelope {
            name: ContextName::from("theme"),
            version: 2,
            delta: ContextDelta {
                updated: match json!({"font": 11}) {
                    serde_json::Value::Object(m) => m,
                    _ => unreachable!(),
                },
                ..ContextDelta::default()
            },
            sender: PeerId::new(),
        };
        let json = serde_json::to_string(&envelope).unwrap();
        assert!(json.contains("\"name\":\"theme\""));
        assert!(json.contains("\"version\":2"));
        let parsed: Envelope = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.name, envelope.name);
        assert_eq!(parsed.version, 2);
        assert_eq!(parsed.delta, envelope.delta);
    }

    #[test]
    fn snapshot_serde_roundtrip() {
        let snapshot = Snapshot {
            name: ContextName::from("instruments"),
            version: 7,
            value: match json!({"ric": "VOD.L"}) {
                serde_json::Value::Object(m) => m,
                _ => unreachable!(),
            },
        };
        let json = serde_json::to_string(&snapshot).unwrap();
        let parsed: Snapshot = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.version, 7);
        assert_eq!(parsed.value, snapshot.value);
    }
}
