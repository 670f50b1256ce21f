//! Topic and session identifier construction for the device bridge
//!
//! Segments are inserted verbatim. Empty segments are preserved rather than
//! collapsed so a misconfigured identity stays visible to the broker, which
//! rejects it during CONNECT.

/// Topic and client identifier patterns used by the device bridge
pub struct TopicBuilder;

impl TopicBuilder {
    /// Telemetry topic: `/devices/{device_id}/events`
    pub fn build_events_topic(device_id: &str) -> String {
        format!("/devices/{device_id}/events")
    }

    /// Error notification topic: `/devices/{device_id}/errors`
    pub fn build_errors_topic(device_id: &str) -> String {
        format!("/devices/{device_id}/errors")
    }

    /// Session identifier:
    /// `projects/{project}/locations/{region}/registries/{registry}/devices/{device}`
    pub fn build_client_id(project_id: &str, region: &str, registry_id: &str, device_id: &str) -> String {
        format!(
            "projects/{project_id}/locations/{region}/registries/{registry_id}/devices/{device_id}"
        )
    }
}

/// True when a topic can be published to: non-empty, no wildcards, no NUL
pub fn is_publishable_topic(topic: &str) -> bool {
    !topic.is_empty() && !topic.contains(['+', '#', '\0'])
}

/// True when any `/`-separated segment of the identifier is empty
pub fn has_empty_segment(identifier: &str) -> bool {
    identifier.split('/').any(str::is_empty)
}
