//! Wire message types for the backend streaming protocol.
//!
//! All control messages are JSON-encoded and tagged by a `type` field.
//! Caller audio normally travels as raw binary WebSocket frames; backend
//! audio arrives either base64-embedded in a control message or as a raw
//! binary frame.
//!
//! Two spellings are accepted for several message types and payload fields.
//! Both have been observed from the backend and neither is confirmed legacy,
//! so the aliases are enumerated here at the parsing boundary rather than
//! collapsed to one canonical name. Outbound traffic always uses the primary
//! name.

use base64::prelude::*;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Backend error kind that permanently disables reconnection for the
/// session. Distinct from ordinary transport errors.
pub const FATAL_ERROR_KIND: &str = "resource_exhausted";

// =============================================================================
// Handshake
// =============================================================================

/// Parameters sent when establishing or resuming a connection.
///
/// Absence of `resume_handle` signals a fresh session. `silent_streak` is
/// only meaningful alongside a resume handle: it tells the backend how long
/// the caller has been silent across the gap.
#[derive(Debug, Clone, Serialize)]
pub struct SetupParams {
    /// Session mode (e.g. "conversation")
    pub session_mode: String,

    /// Voice profile for synthesized output
    #[serde(skip_serializing_if = "Option::is_none")]
    pub voice_profile: Option<String>,

    /// Caller identity
    pub caller_id: String,

    /// Scheduled-call reference, when the session belongs to one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scheduled_call_ref: Option<String>,

    /// Opaque resumption handle from a prior connection
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resume_handle: Option<String>,

    /// Consecutive silent intervals carried across the reconnect
    #[serde(skip_serializing_if = "Option::is_none")]
    pub silent_streak: Option<u32>,
}

// =============================================================================
// Client Events (sent to the backend)
// =============================================================================

/// Control messages sent to the backend.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum ClientEvent {
    /// Open or resume a session
    #[serde(rename = "setup")]
    Setup {
        /// Handshake parameters
        session: SetupParams,
    },

    /// Caller audio, base64-encoded. Raw binary frames are preferred on the
    /// wire; this form exists for paths that cannot carry binary.
    #[serde(rename = "audio")]
    Audio {
        /// Base64-encoded audio payload
        data: String,
    },

    /// Text hint injected into the conversation
    #[serde(rename = "text")]
    Text {
        /// Hint content
        text: String,
    },
}

impl ClientEvent {
    /// Create an audio event from raw bytes.
    pub fn audio(data: &[u8]) -> Self {
        ClientEvent::Audio {
            data: BASE64_STANDARD.encode(data),
        }
    }
}

// =============================================================================
// Server Events (received from the backend)
// =============================================================================

/// Control messages received from the backend.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum ServerEvent {
    /// The session is live; streaming may begin
    #[serde(rename = "ready", alias = "setup_complete")]
    Ready,

    /// Backend audio, base64-encoded
    #[serde(rename = "audio", alias = "audio_chunk")]
    Audio {
        /// Base64-encoded audio payload
        #[serde(alias = "audio")]
        data: String,
    },

    /// Backend text
    #[serde(rename = "text", alias = "text_chunk")]
    Text {
        /// Text content
        text: String,
    },

    /// Caller speech detected while the backend was speaking; interrupt
    /// playback immediately
    #[serde(rename = "interrupted", alias = "barge_in")]
    Interrupted,

    /// A fresher resumption handle; keep talking, update stored state only
    #[serde(rename = "session_resumption_update", alias = "resumption_update")]
    ResumptionUpdate {
        /// Opaque resumption handle
        #[serde(alias = "new_handle")]
        handle: String,
    },

    /// The current session is expiring and must be replaced now
    #[serde(rename = "reconnect", alias = "go_away")]
    Reconnect {
        /// Handle to resume with
        handle: String,
        /// Attempt number assigned by the backend
        #[serde(default)]
        attempt: u32,
        /// Attempt ceiling; 0 means "use the local default"
        #[serde(default, alias = "maxAttempts")]
        max_attempts: u32,
        /// Silent-interval count to replay on resume
        #[serde(default, alias = "silentStreak")]
        silent_streak: u32,
    },

    /// The backend ended the session; terminal
    #[serde(rename = "terminated", alias = "session_end")]
    Terminated {
        /// Backend-supplied reason
        reason: String,
        /// Optional detail
        #[serde(default)]
        detail: Option<String>,
    },

    /// Error report; the `resource_exhausted` kind is fatal
    #[serde(rename = "error")]
    Error {
        /// Backend error kind
        kind: String,
        /// Optional detail
        #[serde(default)]
        detail: Option<String>,
    },
}

// =============================================================================
// Frame Decoding
// =============================================================================

/// A decoded inbound WebSocket frame.
#[derive(Debug, Clone)]
pub enum InboundFrame {
    /// A tagged control message
    Control(ServerEvent),
    /// Raw audio payload, forwarded without the JSON codec
    Audio(Bytes),
}

/// Decode a text frame.
///
/// Unparseable control messages are a protocol error: logged and dropped.
pub fn decode_text(text: &str) -> Option<InboundFrame> {
    match serde_json::from_str::<ServerEvent>(text) {
        Ok(event) => Some(InboundFrame::Control(event)),
        Err(e) => {
            tracing::warn!("Dropping unparseable control message: {e}");
            None
        }
    }
}

/// Decode a binary frame.
///
/// The backend emits JSON control messages inside binary frames on some
/// paths, so a parse is attempted first; anything else is raw audio.
pub fn decode_binary(data: Bytes) -> InboundFrame {
    if let Ok(event) = serde_json::from_slice::<ServerEvent>(&data) {
        return InboundFrame::Control(event);
    }
    InboundFrame::Audio(data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_setup_skips_absent_fields() {
        let event = ClientEvent::Setup {
            session: SetupParams {
                session_mode: "conversation".to_string(),
                voice_profile: None,
                caller_id: "+15550100".to_string(),
                scheduled_call_ref: None,
                resume_handle: None,
                silent_streak: None,
            },
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"setup\""));
        assert!(!json.contains("resume_handle"));
        assert!(!json.contains("silent_streak"));
    }

    #[test]
    fn test_setup_carries_resume_handle() {
        let event = ClientEvent::Setup {
            session: SetupParams {
                session_mode: "conversation".to_string(),
                voice_profile: Some("aria".to_string()),
                caller_id: "+15550100".to_string(),
                scheduled_call_ref: Some("call-7".to_string()),
                resume_handle: Some("H1".to_string()),
                silent_streak: Some(4),
            },
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"resume_handle\":\"H1\""));
        assert!(json.contains("\"silent_streak\":4"));
    }

    #[test]
    fn test_reconnect_signal_both_spellings() {
        let primary = r#"{"type":"reconnect","handle":"H2","attempt":1,"max_attempts":3,"silent_streak":2}"#;
        let legacy = r#"{"type":"go_away","handle":"H2","attempt":1,"maxAttempts":3,"silentStreak":2}"#;
        for raw in [primary, legacy] {
            match serde_json::from_str::<ServerEvent>(raw).unwrap() {
                ServerEvent::Reconnect {
                    handle,
                    attempt,
                    max_attempts,
                    silent_streak,
                } => {
                    assert_eq!(handle, "H2");
                    assert_eq!(attempt, 1);
                    assert_eq!(max_attempts, 3);
                    assert_eq!(silent_streak, 2);
                }
                other => panic!("Expected Reconnect, got {other:?}"),
            }
        }
    }

    #[test]
    fn test_resumption_update_aliases() {
        for raw in [
            r#"{"type":"session_resumption_update","handle":"H3"}"#,
            r#"{"type":"resumption_update","new_handle":"H3"}"#,
        ] {
            match serde_json::from_str::<ServerEvent>(raw).unwrap() {
                ServerEvent::ResumptionUpdate { handle } => assert_eq!(handle, "H3"),
                other => panic!("Expected ResumptionUpdate, got {other:?}"),
            }
        }
    }

    #[test]
    fn test_barge_in_aliases() {
        for raw in [r#"{"type":"interrupted"}"#, r#"{"type":"barge_in"}"#] {
            assert!(matches!(
                serde_json::from_str::<ServerEvent>(raw).unwrap(),
                ServerEvent::Interrupted
            ));
        }
    }

    #[test]
    fn test_audio_field_alias() {
        let raw = r#"{"type":"audio_chunk","audio":"AAAA"}"#;
        match serde_json::from_str::<ServerEvent>(raw).unwrap() {
            ServerEvent::Audio { data } => assert_eq!(data, "AAAA"),
            other => panic!("Expected Audio, got {other:?}"),
        }
    }

    #[test]
    fn test_unparseable_text_dropped() {
        assert!(decode_text("not json").is_none());
        assert!(decode_text(r#"{"type":"no_such_message"}"#).is_none());
    }

    #[test]
    fn test_binary_json_is_control() {
        let frame = decode_binary(Bytes::from_static(br#"{"type":"ready"}"#));
        assert!(matches!(
            frame,
            InboundFrame::Control(ServerEvent::Ready)
        ));
    }

    #[test]
    fn test_binary_garbage_is_audio() {
        let payload = Bytes::from_static(&[0x00, 0x7f, 0x80, 0xff]);
        match decode_binary(payload.clone()) {
            InboundFrame::Audio(data) => assert_eq!(data, payload),
            other => panic!("Expected Audio, got {other:?}"),
        }
    }
}
