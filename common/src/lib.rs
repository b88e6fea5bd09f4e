pub mod command;
pub mod config;
pub mod ota;
pub mod temperature;
pub mod topics;
pub mod types;
pub mod valve;

pub use command::{dispatch, parse_command, Command, CommandError, MAX_COMMAND_PAYLOAD_BYTES};
pub use config::{ControllerConfig, HardwareConfig, NetworkConfig, RuntimeConfig};
pub use temperature::{format_rom_address, ProbeScan, SensorReading, TemperatureReport};
pub use topics::*;
pub use types::{StatusMessage, StatusState, ValvePosition, ValveState};
pub use valve::{ValveAction, ValveController, ValveEvent, ValveFeedback};
