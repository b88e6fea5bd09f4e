use serde::Deserialize;
use thiserror::Error;

use crate::{
    topics::{is_own_publication, OPERATION_REBOOT, OPERATION_VALVE},
    types::{StatusMessage, ValvePosition},
};

pub const MAX_COMMAND_PAYLOAD_BYTES: usize = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Reboot,
    Valve(ValvePosition),
}

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("payload too large ({0} bytes)")]
    PayloadTooLarge(usize),
    #[error("payload is not valid utf-8")]
    NotUtf8,
    #[error("unknown operation `{0}`")]
    UnknownOperation(String),
    #[error("invalid valve payload: {0}")]
    InvalidJson(#[from] serde_json::Error),
    #[error("valve payload has no `position`")]
    MissingPosition,
}

impl Command {
    /// Status published before the command takes effect.
    pub fn acknowledgement(&self) -> Option<StatusMessage> {
        match self {
            Command::Reboot => Some(StatusMessage::ok("Rebooting device")),
            // Valve moves report through their own events.
            Command::Valve(_) => None,
        }
    }
}

impl CommandError {
    pub fn status_message(&self) -> StatusMessage {
        StatusMessage::error(self.to_string())
    }
}

#[derive(Debug, Deserialize)]
struct ValvePayload {
    #[serde(default)]
    position: Option<serde_json::Value>,
}

/// Last path segment of a topic, e.g. `valve` for `home/garden/pool/valve`.
pub fn operation_of(topic: &str) -> &str {
    match topic.rfind('/') {
        Some(pos) => &topic[pos + 1..],
        None => topic,
    }
}

pub fn parse_command(topic: &str, payload: &[u8]) -> Result<Command, CommandError> {
    if payload.len() > MAX_COMMAND_PAYLOAD_BYTES {
        return Err(CommandError::PayloadTooLarge(payload.len()));
    }

    match operation_of(topic) {
        OPERATION_REBOOT => Ok(Command::Reboot),
        OPERATION_VALVE => {
            let message = core::str::from_utf8(payload).map_err(|_| CommandError::NotUtf8)?;
            parse_valve_payload(message).map(Command::Valve)
        }
        other => Err(CommandError::UnknownOperation(other.to_string())),
    }
}

/// Decides what a message received on the command subscription asks for.
/// Returns `None` for the controller's own publications.
pub fn dispatch(topic: &str, payload: &[u8]) -> Option<Result<Command, CommandError>> {
    if is_own_publication(topic) {
        return None;
    }
    Some(parse_command(topic, payload))
}

fn parse_valve_payload(message: &str) -> Result<ValvePosition, CommandError> {
    let payload: ValvePayload = serde_json::from_str(message)?;
    match payload.position {
        Some(serde_json::Value::String(position)) => Ok(ValvePosition::from_command(&position)),
        _ => Err(CommandError::MissingPosition),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        topics::{TOPIC_AVAILABILITY, TOPIC_STATE, TOPIC_STATUS, TOPIC_TEMPERATURE},
        types::StatusState,
    };

    #[test]
    fn solar_position_selects_solar_circuit() {
        let command = parse_command("home/garden/pool/valve", br#"{"position":"solar"}"#).unwrap();
        assert_eq!(command, Command::Valve(ValvePosition::Solar));

        let command = parse_command("home/garden/pool/valve", br#"{"position":"SOLAR"}"#).unwrap();
        assert_eq!(command, Command::Valve(ValvePosition::Solar));
    }

    #[test]
    fn other_positions_fall_back_to_regular() {
        for payload in [
            br#"{"position":"regular"}"#.as_slice(),
            br#"{"position":"pool"}"#.as_slice(),
            br#"{"position":""}"#.as_slice(),
        ] {
            let command = parse_command("home/garden/pool/valve", payload).unwrap();
            assert_eq!(command, Command::Valve(ValvePosition::Regular));
        }
    }

    #[test]
    fn reboot_ignores_payload() {
        let command = parse_command("home/garden/pool/reboot", b"whatever").unwrap();
        assert_eq!(command, Command::Reboot);
    }

    #[test]
    fn operation_is_last_topic_segment() {
        assert_eq!(operation_of("home/garden/pool/valve"), "valve");
        assert_eq!(operation_of("valve"), "valve");
        assert_eq!(operation_of("home/garden/pool/"), "");

        let err = parse_command("home/garden/pool/valve/extra", b"{}").unwrap_err();
        assert!(matches!(err, CommandError::UnknownOperation(op) if op == "extra"));
    }

    #[test]
    fn malformed_valve_payloads_are_rejected() {
        let err = parse_command("home/garden/pool/valve", b"solar").unwrap_err();
        assert!(matches!(err, CommandError::InvalidJson(_)));

        let err = parse_command("home/garden/pool/valve", br#"{"mode":"solar"}"#).unwrap_err();
        assert!(matches!(err, CommandError::MissingPosition));

        let err = parse_command("home/garden/pool/valve", br#"{"position":1}"#).unwrap_err();
        assert!(matches!(err, CommandError::MissingPosition));

        let err = parse_command("home/garden/pool/valve", &[0xff, 0xfe]).unwrap_err();
        assert!(matches!(err, CommandError::NotUtf8));
    }

    #[test]
    fn oversized_payload_is_rejected() {
        let payload = vec![b' '; MAX_COMMAND_PAYLOAD_BYTES + 1];
        let err = parse_command("home/garden/pool/valve", &payload).unwrap_err();
        assert!(matches!(err, CommandError::PayloadTooLarge(513)));
    }

    #[test]
    fn own_publications_are_skipped() {
        for topic in [TOPIC_STATUS, TOPIC_TEMPERATURE, TOPIC_STATE, TOPIC_AVAILABILITY] {
            assert!(dispatch(topic, br#"{"state":"OK","message":"x"}"#).is_none());
        }
    }

    #[test]
    fn dispatch_parses_command_topics() {
        let decision = dispatch("home/garden/pool/valve", br#"{"position":"solar"}"#);
        assert!(matches!(decision, Some(Ok(Command::Valve(ValvePosition::Solar)))));

        let decision = dispatch("home/garden/pool/heater", b"{}");
        assert!(matches!(decision, Some(Err(CommandError::UnknownOperation(_)))));
    }

    #[test]
    fn rejected_command_reports_error_status() {
        let err = match dispatch("home/garden/pool/valve", b"{") {
            Some(Err(err)) => err,
            other => panic!("expected parse error, got {other:?}"),
        };

        let status = err.status_message();
        assert_eq!(status.state, StatusState::Error);
        assert!(status.message.starts_with("invalid valve payload"));
    }

    #[test]
    fn reboot_is_acknowledged_before_restart() {
        let status = Command::Reboot.acknowledgement().unwrap();
        assert_eq!(status.state, StatusState::Ok);
        assert_eq!(status.message, "Rebooting device");

        assert!(Command::Valve(ValvePosition::Solar).acknowledgement().is_none());
    }
}
