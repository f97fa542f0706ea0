pub const TOPIC_ROOT: &str = "Advantech";
pub const DISCOVERY_PREFIX: &str = "homeassistant";

pub const PAYLOAD_ON: &str = "on";
pub const PAYLOAD_OFF: &str = "off";

/// Inbound control payloads above this size are dropped unread.
pub const MAX_CONTROL_PAYLOAD_BYTES: usize = 512;

pub fn data_topic(edge_id: &str) -> String {
    format!("{TOPIC_ROOT}/{edge_id}/data")
}

pub fn control_topic(edge_id: &str) -> String {
    format!("{TOPIC_ROOT}/{edge_id}/led")
}

pub fn discovery_topic(component: &str, edge_id: &str, field: &str) -> String {
    format!("{DISCOVERY_PREFIX}/{component}/{edge_id}/{field}/config")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topics_are_derived_from_edge_id() {
        assert_eq!(data_topic("24dcc3a736ec"), "Advantech/24dcc3a736ec/data");
        assert_eq!(control_topic("24dcc3a736ec"), "Advantech/24dcc3a736ec/led");
        assert_eq!(
            discovery_topic("light", "abc", "led"),
            "homeassistant/light/abc/led/config"
        );
    }
}
