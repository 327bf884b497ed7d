//! Wire format exchanged with the collector
//!
//! Every frame is a JSON `{channel, payload}` envelope. Outbound frames sent
//! through [`crate::Transporter::send`] wrap their data in a [`Payload`]
//! that carries a timestamp and the process identity. Inbound frames are
//! decoded in two steps: the channel discriminator first, then the payload
//! shape that channel implies.

use crate::error::ProtocolError;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::net::IpAddr;

pub const CHANNEL_TRIGGER_ACTION: &str = "trigger:action";
pub const CHANNEL_ACTION_SUCCESS: &str = "trigger:action:success";
pub const CHANNEL_ACTION_FAILURE: &str = "trigger:action:failure";
pub const CHANNEL_AXM_REPLY: &str = "axm:reply";
pub const CHANNEL_PM2_ACTION: &str = "trigger:pm2:action";
pub const CHANNEL_PM2_RESULT: &str = "trigger:pm2:result";
pub const CHANNEL_STATUS: &str = "status";
pub const CHANNEL_LOGS: &str = "logs";
pub const CHANNEL_EXCEPTION: &str = "process:exception";

/// Method name of the only pm2 remote method answered by the agent
pub const METHOD_START_LOGGING: &str = "startLogging";

/// The `{channel, payload}` unit of the wire
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope<P = Value> {
    pub channel: String,
    pub payload: P,
}

impl<P: Serialize> Envelope<P> {
    pub fn new(channel: impl Into<String>, payload: P) -> Self {
        Self {
            channel: channel.into(),
            payload,
        }
    }

    pub fn to_json(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::SerializationFailed {
            channel: self.channel.clone(),
            reason: e.to_string(),
        })
    }
}

/// Identity of the monitored process
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessIdentity {
    pub pm_id: u32,
    pub name: String,
    pub server: String,
}

/// Enriched payload of every outbound `send`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Payload {
    /// Epoch milliseconds
    pub at: i64,
    pub process: ProcessIdentity,
    pub data: Value,
    pub active: bool,
    pub server_name: String,
    pub protected: bool,
    pub rev_con: bool,
    pub internal_ip: Option<IpAddr>,
}

/// Payload of an inbound `trigger:action` frame
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ActionTrigger {
    pub action_name: String,
    /// Echoed back verbatim, the collector sends numbers or strings
    #[serde(default)]
    pub process_id: Value,
    #[serde(default)]
    pub opts: Value,
}

/// Payload of an inbound `trigger:pm2:action` frame
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Pm2Action {
    pub method_name: String,
    #[serde(default)]
    pub parameters: Value,
}

/// Inbound frame after channel-specific decoding
#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    TriggerAction(ActionTrigger),
    Pm2Action(Pm2Action),
    Unknown { channel: String },
}

impl InboundMessage {
    /// Decode a text frame
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        let envelope: Envelope<Value> =
            serde_json::from_str(text).map_err(|e| ProtocolError::MalformedFrame {
                reason: e.to_string(),
            })?;

        match envelope.channel.as_str() {
            CHANNEL_TRIGGER_ACTION => decode_payload(&envelope).map(Self::TriggerAction),
            CHANNEL_PM2_ACTION => decode_payload(&envelope).map(Self::Pm2Action),
            _ => Ok(Self::Unknown {
                channel: envelope.channel,
            }),
        }
    }

    pub fn channel(&self) -> &str {
        match self {
            InboundMessage::TriggerAction(_) => CHANNEL_TRIGGER_ACTION,
            InboundMessage::Pm2Action(_) => CHANNEL_PM2_ACTION,
            InboundMessage::Unknown { channel } => channel,
        }
    }
}

fn decode_payload<T: DeserializeOwned>(envelope: &Envelope<Value>) -> Result<T, ProtocolError> {
    T::deserialize(&envelope.payload).map_err(|e| ProtocolError::InvalidPayload {
        channel: envelope.channel.clone(),
        reason: e.to_string(),
    })
}
