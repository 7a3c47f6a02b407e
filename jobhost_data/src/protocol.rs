use serde::{Deserialize, Serialize};

/// Messages sent to a log viewer, in order, ending with `End` or `Error`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum LogMessage {
    Log { data: String },
    End { message: String },
    Error { message: String },
}

impl LogMessage {
    pub fn is_final(&self) -> bool {
        !matches!(self, LogMessage::Log { .. })
    }
}

/// Out-of-band control messages on the otherwise raw terminal channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TerminalControl {
    Resize { cols: u16, rows: u16 },
}

impl TerminalControl {
    /// returns None for anything that is not a known control message,
    /// such frames are treated as terminal input by the caller
    pub fn parse(text: &str) -> Option<Self> {
        serde_json::from_str(text).ok()
    }
}
