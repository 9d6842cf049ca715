//! Signaling protocol messages
//!
//! Signaling messages travel as `{"type": ..., "payload": ...}` JSON objects.
//! Data channel messages (`frame_token`, `playback_control`) are flat objects
//! with their fields next to `type`; both forms are accepted when parsing.

use nvc_core::{NvcError, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Normal closure; no reconnect
pub const CLOSE_NORMAL: u16 = 1000;
/// Endpoint going away
pub const CLOSE_GOING_AWAY: u16 = 1001;
/// Close frame carried no status code
pub const CLOSE_NO_STATUS: u16 = 1005;
/// Connection dropped without a close frame
pub const CLOSE_ABNORMAL: u16 = 1006;

/// STUN/TURN server entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceServer {
    /// Server URLs
    pub urls: Vec<String>,
    /// TURN username
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    /// TURN credential
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl IceServer {
    /// A STUN server entry
    pub fn stun(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            username: None,
            credential: None,
        }
    }
}

/// Peer connection configuration forwarded to the server
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtcConfiguration {
    /// ICE servers
    pub ice_servers: Vec<IceServer>,
}

/// `init` payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitPayload {
    /// Playback frame rate requested by the client
    pub fps: u32,
    /// Peer connection configuration
    pub rtc_config: RtcConfiguration,
}

/// Server side playback limits announced in `init_response`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerConfig {
    /// Largest frame buffer the server recommends
    pub buffer_size: Option<usize>,
    /// Frame count cap for the session
    pub max_frames: Option<u64>,
    /// Frame rate the server streams at
    pub fps: Option<u32>,
}

/// `init_response` payload
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct InitResponsePayload {
    /// Server assigned session identifier
    pub session_id: Option<String>,
    /// Server side limits
    pub config: Option<ServerConfig>,
}

/// Session description kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    /// Offer
    Offer,
    /// Answer
    Answer,
    /// Provisional answer
    Pranswer,
    /// Rollback
    Rollback,
}

/// Session description (`offer` / `answer` payload)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionDescription {
    /// Description kind
    #[serde(rename = "type")]
    pub kind: SdpType,
    /// SDP body
    pub sdp: String,
}

impl SessionDescription {
    /// An offer description
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    /// An answer description
    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

/// ICE candidate (`ice-candidate` payload)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    /// Candidate line
    pub candidate: String,
    /// Media stream identification tag
    #[serde(default)]
    pub sdp_mid: Option<String>,
    /// Media line index
    #[serde(default)]
    pub sdp_m_line_index: Option<u16>,
    /// ICE username fragment
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

/// `error` payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorPayload {
    /// Human readable message
    pub message: String,
    /// Optional numeric code
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<u16>,
}

/// `process_frames` payload asking the server to stream tokens
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessFramesPayload {
    /// Video to stream
    pub video_id: u64,
    /// First frame to stream
    pub current_frame: u64,
    /// Frame the reference data was taken from
    pub reference_frame: u64,
}

/// Frame token delivered over the data channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FrameTokenMessage {
    /// Frame index
    pub frame_index: u64,
    /// Token values, possibly nested
    pub token: Value,
}

/// Playback control action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlaybackAction {
    /// Playback started
    Play,
    /// Playback paused
    Pause,
    /// Playback resumed
    Resume,
    /// Playback stopped
    Stop,
    /// Playback position changed
    Seek,
}

/// Playback control notification sent over the data channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaybackControl {
    /// Action taken
    pub action: PlaybackAction,
    /// Media clock position in seconds
    pub timestamp: f64,
    /// Frame index at the time of the action
    pub frame_index: u64,
}

/// All messages exchanged with the signaling server
#[derive(Debug, Clone, PartialEq)]
pub enum SignalingMessage {
    /// Session initialisation request
    Init(InitPayload),
    /// Session initialisation response
    InitResponse(InitResponsePayload),
    /// Session offer
    Offer(SessionDescription),
    /// Session answer
    Answer(SessionDescription),
    /// Trickled ICE candidate
    IceCandidate(IceCandidate),
    /// Error reported by the peer
    Error(ErrorPayload),
    /// Server asks the client to renegotiate the session
    Restart,
    /// Request to stream frame tokens
    ProcessFrames(ProcessFramesPayload),
    /// Frame token (data channel)
    FrameToken(FrameTokenMessage),
    /// Playback control (data channel)
    PlaybackControl(PlaybackControl),
    /// Message of a type this client does not know
    Unknown {
        /// Message type
        kind: String,
        /// Raw payload
        payload: Value,
    },
}

impl SignalingMessage {
    /// Wire type string
    pub fn message_type(&self) -> &str {
        match self {
            SignalingMessage::Init(_) => "init",
            SignalingMessage::InitResponse(_) => "init_response",
            SignalingMessage::Offer(_) => "offer",
            SignalingMessage::Answer(_) => "answer",
            SignalingMessage::IceCandidate(_) => "ice-candidate",
            SignalingMessage::Error(_) => "error",
            SignalingMessage::Restart => "restart",
            SignalingMessage::ProcessFrames(_) => "process_frames",
            SignalingMessage::FrameToken(_) => "frame_token",
            SignalingMessage::PlaybackControl(_) => "playback_control",
            SignalingMessage::Unknown { kind, .. } => kind,
        }
    }

    /// Whether the message belongs on the data channel
    pub fn is_data_channel_message(&self) -> bool {
        matches!(
            self,
            SignalingMessage::FrameToken(_) | SignalingMessage::PlaybackControl(_)
        )
    }

    /// Build an `error` message
    pub fn error(message: impl Into<String>, code: Option<u16>) -> Self {
        SignalingMessage::Error(ErrorPayload {
            message: message.into(),
            code,
        })
    }

    /// Parse a text frame
    pub fn parse(text: &str) -> Result<Self> {
        let value: Value =
            serde_json::from_str(text).map_err(|e| NvcError::invalid_message(text, e))?;
        let mut object = match value {
            Value::Object(object) => object,
            _ => {
                return Err(NvcError::ProtocolError {
                    message: format!("expected a JSON object, got {}", text),
                })
            }
        };

        let kind = match object.remove("type") {
            Some(Value::String(kind)) => kind,
            _ => {
                return Err(NvcError::ProtocolError {
                    message: format!("message without a type: {}", text),
                })
            }
        };
        let payload = object
            .remove("payload")
            .unwrap_or(Value::Object(object));

        let message = match kind.as_str() {
            "init" => SignalingMessage::Init(from_payload(text, payload)?),
            "init_response" => SignalingMessage::InitResponse(if payload.is_null() {
                InitResponsePayload::default()
            } else {
                from_payload(text, payload)?
            }),
            "offer" => SignalingMessage::Offer(from_payload(text, payload)?),
            "answer" => SignalingMessage::Answer(from_payload(text, payload)?),
            "ice-candidate" => SignalingMessage::IceCandidate(from_payload(text, payload)?),
            "error" => SignalingMessage::Error(from_payload(text, payload)?),
            "restart" => SignalingMessage::Restart,
            "process_frames" => SignalingMessage::ProcessFrames(from_payload(text, payload)?),
            "frame_token" => SignalingMessage::FrameToken(from_payload(text, payload)?),
            "playback_control" => SignalingMessage::PlaybackControl(from_payload(text, payload)?),
            _ => SignalingMessage::Unknown { kind, payload },
        };
        Ok(message)
    }

    /// Serialize to a text frame
    pub fn to_json(&self) -> Result<String> {
        let payload = match self {
            SignalingMessage::Init(p) => to_payload(p)?,
            SignalingMessage::InitResponse(p) => to_payload(p)?,
            SignalingMessage::Offer(p) | SignalingMessage::Answer(p) => to_payload(p)?,
            SignalingMessage::IceCandidate(p) => to_payload(p)?,
            SignalingMessage::Error(p) => to_payload(p)?,
            SignalingMessage::Restart => Value::Null,
            SignalingMessage::ProcessFrames(p) => to_payload(p)?,
            SignalingMessage::FrameToken(p) => to_payload(p)?,
            SignalingMessage::PlaybackControl(p) => to_payload(p)?,
            SignalingMessage::Unknown { payload, .. } => payload.clone(),
        };

        let mut envelope = Map::new();
        envelope.insert(
            "type".to_string(),
            Value::String(self.message_type().to_string()),
        );
        match payload {
            Value::Object(fields) if self.is_data_channel_message() => {
                envelope.extend(fields);
            }
            Value::Null => {}
            payload => {
                envelope.insert("payload".to_string(), payload);
            }
        }
        Ok(Value::Object(envelope).to_string())
    }
}

fn from_payload<T: DeserializeOwned>(text: &str, payload: Value) -> Result<T> {
    serde_json::from_value(payload).map_err(|e| NvcError::invalid_message(text, e))
}

fn to_payload<T: Serialize>(payload: &T) -> Result<Value> {
    serde_json::to_value(payload).map_err(|e| NvcError::InvalidData {
        reason: format!("failed to serialize payload: {}", e),
    })
}

/// How a WebSocket connection ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseInfo {
    /// Close code
    pub code: u16,
    /// Close reason
    pub reason: String,
}

impl CloseInfo {
    /// Close info for a connection that dropped without a close frame
    pub fn abnormal(reason: impl Into<String>) -> Self {
        Self {
            code: CLOSE_ABNORMAL,
            reason: reason.into(),
        }
    }

    /// Whether the closure was a deliberate normal close
    pub fn is_normal(&self) -> bool {
        self.code == CLOSE_NORMAL
    }

    /// Whether the client should try to reconnect
    pub fn should_reconnect(&self) -> bool {
        !self.is_normal()
    }
}
