pub const TOPIC_STATUS: &str = "home/garden/pool";
pub const TOPIC_TEMPERATURE: &str = "home/garden/pool/temperature";
pub const TOPIC_STATE: &str = "home/garden/pool/state";
pub const TOPIC_AVAILABILITY: &str = "home/garden/pool/availability";

pub const TOPIC_COMMANDS: &str = "home/garden/pool/#";

pub const OPERATION_REBOOT: &str = "reboot";
pub const OPERATION_VALVE: &str = "valve";

pub const AVAILABILITY_ONLINE: &str = "online";
pub const AVAILABILITY_OFFLINE: &str = "offline";

/// Topics this controller publishes itself. They come back through the
/// wildcard subscription and carry no commands.
pub const OWN_TOPICS: [&str; 4] = [
    TOPIC_STATUS,
    TOPIC_TEMPERATURE,
    TOPIC_STATE,
    TOPIC_AVAILABILITY,
];

pub fn is_own_publication(topic: &str) -> bool {
    OWN_TOPICS.contains(&topic)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn own_topics_are_not_commands() {
        assert!(is_own_publication(TOPIC_TEMPERATURE));
        assert!(is_own_publication(TOPIC_STATUS));
        assert!(!is_own_publication("home/garden/pool/valve"));
        assert!(!is_own_publication("home/garden/pool/reboot"));
    }
}
