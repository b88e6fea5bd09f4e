use crate::{
    config::ControllerConfig,
    types::{StatusMessage, ValvePosition, ValveState, ValveStatePayload},
};

/// Levels of the two end-stop feedback inputs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ValveFeedback {
    pub regular: bool,
    pub solar: bool,
}

impl ValveFeedback {
    pub fn reached(self, position: ValvePosition) -> bool {
        match position {
            ValvePosition::Regular => self.regular,
            ValvePosition::Solar => self.solar,
        }
    }

    /// Position indicated by the end stops, if exactly one of them is closed.
    pub fn position(self) -> Option<ValvePosition> {
        match (self.regular, self.solar) {
            (true, false) => Some(ValvePosition::Regular),
            (false, true) => Some(ValvePosition::Solar),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValveEvent {
    Switching(ValvePosition),
    Reached(ValvePosition),
    TimedOut(ValvePosition),
}

impl ValveEvent {
    pub fn status_message(self) -> StatusMessage {
        match self {
            Self::Switching(position) => {
                StatusMessage::ok(format!("Switching valve to {}.", position.as_str()))
            }
            Self::Reached(position) => {
                StatusMessage::ok(format!("Valve successfully set to {}.", position.as_str()))
            }
            Self::TimedOut(position) => StatusMessage::error(format!(
                "Valve did not report {} position in time; relay released.",
                position.as_str()
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValveAction {
    /// Both relays low.
    Release,
    Drive(ValvePosition),
    Notify(ValveEvent),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Switching { target: ValvePosition, since_ms: u64 },
}

#[derive(Debug, Clone)]
pub struct ValveController {
    switch_timeout_ms: u64,
    phase: Phase,
    position: Option<ValvePosition>,
}

impl ValveController {
    pub fn new(config: &ControllerConfig) -> Self {
        Self {
            switch_timeout_ms: config.valve_switch_timeout_ms,
            phase: Phase::Idle,
            position: None,
        }
    }

    pub fn state(&self) -> ValveState {
        match self.phase {
            Phase::Idle => ValveState::Idle,
            Phase::Switching { .. } => ValveState::Switching,
        }
    }

    /// Last confirmed position. Unknown while switching or after a timeout.
    pub fn position(&self) -> Option<ValvePosition> {
        self.position
    }

    pub fn target(&self) -> Option<ValvePosition> {
        match self.phase {
            Phase::Idle => None,
            Phase::Switching { target, .. } => Some(target),
        }
    }

    pub fn switching_ms(&self, now_ms: u64) -> u64 {
        match self.phase {
            Phase::Idle => 0,
            Phase::Switching { since_ms, .. } => now_ms.saturating_sub(since_ms),
        }
    }

    /// Actions to put the outputs into a known state at boot.
    pub fn release_all(&mut self) -> Vec<ValveAction> {
        self.phase = Phase::Idle;
        vec![ValveAction::Release]
    }

    pub fn command(&mut self, target: ValvePosition, now_ms: u64) -> Vec<ValveAction> {
        self.phase = Phase::Switching {
            target,
            since_ms: now_ms,
        };
        self.position = None;

        vec![
            ValveAction::Release,
            ValveAction::Drive(target),
            ValveAction::Notify(ValveEvent::Switching(target)),
        ]
    }

    pub fn poll(&mut self, feedback: ValveFeedback, now_ms: u64) -> Vec<ValveAction> {
        match self.phase {
            Phase::Idle => {
                if let Some(observed) = feedback.position() {
                    self.position = Some(observed);
                }
                Vec::new()
            }
            Phase::Switching { target, since_ms } => {
                if feedback.reached(target) {
                    self.phase = Phase::Idle;
                    self.position = Some(target);
                    return vec![
                        ValveAction::Release,
                        ValveAction::Notify(ValveEvent::Reached(target)),
                    ];
                }

                if now_ms.saturating_sub(since_ms) >= self.switch_timeout_ms {
                    self.phase = Phase::Idle;
                    self.position = None;
                    return vec![
                        ValveAction::Release,
                        ValveAction::Notify(ValveEvent::TimedOut(target)),
                    ];
                }

                Vec::new()
            }
        }
    }

    pub fn state_payload(&self, now_ms: u64) -> ValveStatePayload {
        ValveStatePayload {
            state: self.state().as_str(),
            position: self.position,
            target: self.target(),
            switching_ms: self.switching_ms(now_ms),
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn controller() -> ValveController {
        ValveController::new(&ControllerConfig::default())
    }

    const SOLAR_CLOSED: ValveFeedback = ValveFeedback {
        regular: false,
        solar: true,
    };

    #[test]
    fn command_releases_before_driving() {
        let mut valve = controller();

        let actions = valve.command(ValvePosition::Solar, 1_000);

        assert_eq!(
            actions,
            vec![
                ValveAction::Release,
                ValveAction::Drive(ValvePosition::Solar),
                ValveAction::Notify(ValveEvent::Switching(ValvePosition::Solar)),
            ]
        );
        assert_eq!(valve.state(), ValveState::Switching);
        assert_eq!(valve.target(), Some(ValvePosition::Solar));
        assert_eq!(valve.position(), None);
    }

    #[test]
    fn feedback_confirms_position_and_releases_relay() {
        let mut valve = controller();
        valve.command(ValvePosition::Solar, 1_000);

        assert!(valve.poll(ValveFeedback::default(), 2_000).is_empty());
        assert_eq!(valve.switching_ms(2_000), 1_000);

        let actions = valve.poll(SOLAR_CLOSED, 3_000);

        assert_eq!(
            actions,
            vec![
                ValveAction::Release,
                ValveAction::Notify(ValveEvent::Reached(ValvePosition::Solar)),
            ]
        );
        assert_eq!(valve.state(), ValveState::Idle);
        assert_eq!(valve.position(), Some(ValvePosition::Solar));
        assert_eq!(valve.switching_ms(3_000), 0);
    }

    #[test]
    fn feedback_of_other_end_stop_is_not_confirmation() {
        let mut valve = controller();
        valve.command(ValvePosition::Regular, 0);

        assert!(valve.poll(SOLAR_CLOSED, 500).is_empty());
        assert_eq!(valve.state(), ValveState::Switching);
    }

    #[test]
    fn switch_timeout_releases_relay() {
        let mut valve = controller();
        valve.command(ValvePosition::Regular, 100);

        assert!(valve.poll(ValveFeedback::default(), 120_099).is_empty());

        let actions = valve.poll(ValveFeedback::default(), 120_100);

        assert_eq!(
            actions,
            vec![
                ValveAction::Release,
                ValveAction::Notify(ValveEvent::TimedOut(ValvePosition::Regular)),
            ]
        );
        assert_eq!(valve.state(), ValveState::Idle);
        assert_eq!(valve.position(), None);
    }

    #[test]
    fn recommand_restarts_the_move() {
        let mut valve = controller();
        valve.command(ValvePosition::Solar, 0);
        valve.command(ValvePosition::Regular, 100_000);

        assert_eq!(valve.target(), Some(ValvePosition::Regular));
        assert!(valve.poll(SOLAR_CLOSED, 150_000).is_empty());
        assert_eq!(valve.switching_ms(150_000), 50_000);
    }

    #[test]
    fn idle_poll_learns_position_from_end_stops() {
        let mut valve = controller();

        assert!(valve.poll(SOLAR_CLOSED, 0).is_empty());
        assert_eq!(valve.position(), Some(ValvePosition::Solar));

        // Both end stops closed is a wiring fault; keep the last known position.
        let both = ValveFeedback {
            regular: true,
            solar: true,
        };
        assert!(valve.poll(both, 10).is_empty());
        assert_eq!(valve.position(), Some(ValvePosition::Solar));
    }

    #[test]
    fn state_payload_reports_switching() {
        let mut valve = controller();
        valve.command(ValvePosition::Solar, 1_000);

        let payload = serde_json::to_value(valve.state_payload(4_000)).unwrap();

        assert_eq!(
            payload,
            serde_json::json!({
                "state": "SWITCHING",
                "position": null,
                "target": "solar",
                "switchingMs": 3_000,
            })
        );
    }

    #[test]
    fn event_messages() {
        assert_eq!(
            ValveEvent::Reached(ValvePosition::Regular)
                .status_message()
                .to_json(),
            r#"{"state":"OK","message":"Valve successfully set to regular."}"#
        );
        assert_eq!(
            ValveEvent::TimedOut(ValvePosition::Solar)
                .status_message()
                .state,
            crate::types::StatusState::Error
        );
    }
}
