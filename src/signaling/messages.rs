//! Message types for the department-call signaling protocol
//!
//! Every frame is a JSON envelope `{"type": ..., "payload": ...}` with
//! camelCase payload keys, matching what the hospital console's signaling
//! server speaks.

use serde::{Deserialize, Serialize};

// ============================================================================
// CLIENT → SERVER MESSAGES
// ============================================================================

/// All messages a client may send
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "kebab-case")]
pub enum ClientMessage {
    /// Announces the local user after every (re)connect
    Register(RegisterPayload),

    /// Starts a call towards one or more users
    InitiateCall(InitiateCallPayload),

    /// Accepts a ringing call
    AcceptCall(CallReplyPayload),

    /// Declines a ringing call
    RejectCall(CallReplyPayload),

    /// Ends the active call, or releases one late callee when targeted
    EndCall(EndCallPayload),

    /// Relays SDP or ICE data to the other party
    Signal(OutboundSignal),
}

impl ClientMessage {
    /// Wire name of the message, used for logging
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Register(_) => "register",
            Self::InitiateCall(_) => "initiate-call",
            Self::AcceptCall(_) => "accept-call",
            Self::RejectCall(_) => "reject-call",
            Self::EndCall(_) => "end-call",
            Self::Signal(_) => "signal",
        }
    }
}

/// Registration of the local user
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterPayload {
    pub user_id: String,
    pub department: String,
    pub role: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitiateCallPayload {
    pub target_user_ids: Vec<String>,
    pub caller_id: String,
    pub caller_name: String,
    pub call_id: String,
}

/// Answer to an incoming call, addressed back to the caller's connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallReplyPayload {
    pub call_id: String,
    pub caller_socket_id: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallIdPayload {
    pub call_id: String,
}

/// Hang-up notice. Without a target the server ends the call for every
/// participant; with one it only releases that connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndCallPayload {
    pub call_id: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub target_socket_id: Option<String>,
}

impl EndCallPayload {
    /// Ends the whole call
    pub fn all(call_id: impl Into<String>) -> Self {
        Self {
            call_id: call_id.into(),
            target_socket_id: None,
        }
    }

    /// Releases a single connection that answered too late
    pub fn targeted(call_id: impl Into<String>, socket_id: impl Into<String>) -> Self {
        Self {
            call_id: call_id.into(),
            target_socket_id: Some(socket_id.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboundSignal {
    pub target_socket_id: String,
    pub signal: SignalData,
}

// ============================================================================
// SERVER → CLIENT MESSAGES
// ============================================================================

/// All messages the server may push
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "kebab-case")]
pub enum ServerMessage {
    /// Full presence snapshot
    OnlineUsers(Vec<PresenceEntry>),

    /// Somebody is calling us
    IncomingCall(IncomingCallPayload),

    /// A callee picked up
    CallAccepted(CallAcceptedPayload),

    /// A callee declined
    CallRejected(CallRejectedPayload),

    /// The other side hung up
    CallEnded(CallIdPayload),

    /// SDP or ICE data relayed from the other party
    Signal(InboundSignal),
}

impl ServerMessage {
    /// Wire name of the message, used for logging
    pub fn kind(&self) -> &'static str {
        match self {
            Self::OnlineUsers(_) => "online-users",
            Self::IncomingCall(_) => "incoming-call",
            Self::CallAccepted(_) => "call-accepted",
            Self::CallRejected(_) => "call-rejected",
            Self::CallEnded(_) => "call-ended",
            Self::Signal(_) => "signal",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IncomingCallPayload {
    pub call_id: String,
    pub caller_id: String,
    pub caller_name: String,
    pub caller_socket_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallAcceptedPayload {
    pub call_id: String,
    pub callee_socket_id: String,
    #[serde(default)]
    pub callee_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallRejectedPayload {
    pub call_id: String,
    #[serde(default)]
    pub reason: Option<String>,
    /// Which target declined; older servers omit it
    #[serde(default)]
    pub callee_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundSignal {
    #[serde(default)]
    pub from_socket_id: Option<String>,
    pub signal: SignalData,
}

// ============================================================================
// SHARED TYPES
// ============================================================================

/// One online user as reported by the server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceEntry {
    pub user_id: String,
    pub department: String,
    #[serde(default)]
    pub role: String,
    #[serde(default)]
    pub status: PresenceStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceStatus {
    #[default]
    Online,
    Busy,
    Away,
    Offline,
    #[serde(other)]
    Unknown,
}

impl std::fmt::Display for PresenceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Online => write!(f, "online"),
            Self::Busy => write!(f, "busy"),
            Self::Away => write!(f, "away"),
            Self::Offline => write!(f, "offline"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

/// Negotiation data carried by `signal` messages
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SignalData {
    Offer { sdp: String },
    Answer { sdp: String },
    Candidate { candidate: IceCandidate },
}

/// ICE candidate in the browser's `RTCIceCandidateInit` shape
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default)]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", default)]
    pub sdp_mline_index: Option<u16>,
    #[serde(default)]
    pub username_fragment: Option<String>,
}

// ============================================================================
// TESTS
// ============================================================================
