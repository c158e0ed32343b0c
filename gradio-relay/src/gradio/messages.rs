//! Queue protocol message types.
//!
//! Defines the server-to-client packets and the client-to-server replies
//! exchanged over `/queue/join`.

use serde::{Deserialize, Serialize};

/// Packet kind, carried in the `msg` field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    /// Server asks which function this connection is for
    SendHash,
    /// Server asks for the call arguments
    SendData,
    /// Queue position / ETA update
    Estimation,
    ProcessStarts,
    /// Intermediate output while the function streams
    ProcessGenerating,
    /// Final output; the server closes the socket afterwards
    ProcessCompleted,
}

/// A packet pushed by the queue server
#[derive(Debug, Clone, Deserialize)]
pub struct ServerPacket {
    #[serde(rename = "msg")]
    pub kind: MessageKind,
    #[serde(default)]
    pub output: Option<PacketOutput>,
    #[serde(default)]
    pub success: Option<bool>,
}

/// Output block of `process_generating` / `process_completed`
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PacketOutput {
    /// Positional function outputs; the shape depends on the backend
    #[serde(default)]
    pub data: Vec<serde_json::Value>,
    #[serde(default)]
    pub is_generating: bool,
    #[serde(default)]
    pub duration: Option<f64>,
    #[serde(default)]
    pub average_duration: Option<f64>,
    /// Set by the server when the function raised
    #[serde(default)]
    pub error: Option<String>,
}

/// Reply to `send_hash`
#[derive(Debug, Serialize)]
pub struct HashReply<'a> {
    pub session_hash: &'a str,
    pub fn_index: u32,
}

/// Reply to `send_data`
#[derive(Debug, Serialize)]
pub struct DataReply<'a> {
    pub session_hash: &'a str,
    pub fn_index: u32,
    pub data: serde_json::Value,
    pub event_data: Option<serde_json::Value>,
}

/// One generated image as announced by the image backend
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ImageDescriptor {
    #[serde(rename = "name")]
    pub filename: String,
    #[serde(default)]
    pub is_file: bool,
}
