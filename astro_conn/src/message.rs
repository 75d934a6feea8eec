//! Log messages relayed between processes.

use crate::error::ParamError;
use crate::lexer::ParamCursor;
use astro::consts::{MESSAGE_DEBUG, MESSAGE_ERROR, MESSAGE_INFO, MESSAGE_WARNING, PROTO_MESSAGE};
use serde::Serialize;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Message {
    /// Time since the epoch.
    pub time: Duration,
    pub origin: String,
    pub message_type: u32,
    pub text: String,
}

impl Message {
    pub fn new(time: Duration, origin: &str, message_type: u32, text: &str) -> Self {
        Self {
            time,
            origin: origin.to_string(),
            message_type,
            text: text.to_string(),
        }
    }

    /// Parse the parameters of an `M` line.
    pub fn parse(params: &mut ParamCursor<'_>) -> Result<Self, ParamError> {
        let time = params.next_timeval()?;
        let origin = params.next_string()?.to_string();
        let message_type = params.next_integer()?;
        let message_type = u32::try_from(message_type).map_err(|_| ParamError::Invalid {
            expected: "message type",
            token: message_type.to_string(),
        })?;
        let text = params.whole_string().to_string();
        Ok(Self {
            time,
            origin,
            message_type,
            text,
        })
    }

    pub fn to_wire(&self) -> String {
        format!(
            "{PROTO_MESSAGE} {} {} {} {} {}",
            self.time.as_secs(),
            self.time.subsec_micros(),
            self.origin,
            self.message_type,
            self.text
        )
    }

    pub fn type_name(&self) -> &'static str {
        match self.message_type {
            MESSAGE_ERROR => "error",
            MESSAGE_WARNING => "warning",
            MESSAGE_INFO => "info",
            MESSAGE_DEBUG => "debug",
            _ => "unknown",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_and_writes_back() {
        let line = "1700000000 5 C0 2 shutter slow to close";
        let mut params = ParamCursor::new(line);
        let msg = Message::parse(&mut params).unwrap();
        assert_eq!(msg.origin, "C0");
        assert_eq!(msg.type_name(), "warning");
        assert_eq!(msg.text, "shutter slow to close");
        assert_eq!(msg.to_wire(), format!("M {line}"));
    }

    #[test]
    fn negative_type_rejected() {
        let mut params = ParamCursor::new("1 0 C0 -1 x");
        assert!(Message::parse(&mut params).is_err());
    }
}
