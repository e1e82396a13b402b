//! Session channel message types
//!
//! Both directions are JSON objects tagged by a `type` field.

use serde::{Deserialize, Serialize};

use crate::Result;

/// Server to client
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundMessage {
    /// Begin a listening round
    StartListening,

    /// A spoken reply is ready at `audio_url`
    ChatResponse {
        /// Where to download the reply WAV
        audio_url: String,
    },

    /// Any other message type; ignored
    #[serde(other)]
    Unknown,
}

impl InboundMessage {
    /// Parse a text frame
    ///
    /// # Errors
    ///
    /// Returns `Error::Serialization` for malformed JSON or a known type
    /// with missing fields
    pub fn parse(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }
}

/// Client to server
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundMessage {
    /// Ready for the next round; sent on every (re)connect
    Listen,

    /// An upload finished and can be processed
    ProcessAudio {
        /// Name the upload was stored under
        filename: String,
    },
}

impl OutboundMessage {
    /// Encode as a text frame
    ///
    /// # Errors
    ///
    /// Returns `Error::Serialization` if encoding fails
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}
