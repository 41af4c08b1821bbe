//! Store key naming.

/// Prefix of the pub/sub channels lifecycle events are published on.
pub const EVENT_CHANNEL_PREFIX: &str = "redka-job-events:";

/// Queue names that collide with shared keys.
pub const RESERVED_QUEUE_NAMES: [&str; 2] = ["_global-delay", "_batcher"];

/// Key builder for queues, lists and registries.
///
/// Queue-scoped keys take the fully-qualified queue name (prefix included),
/// which is also what a job record stores in its `queue` field.
#[derive(Debug, Clone)]
pub struct KeySpace {
    prefix: String,
}

impl KeySpace {
    /// Create a new key builder with the given prefix.
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// Key prefix.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Fully-qualified name of a user-facing queue.
    pub fn queue(&self, name: &str) -> String {
        format!("{}{}", self.prefix, name)
    }

    /// List of ids waiting to be claimed.
    pub fn pending(queue: &str) -> String {
        format!("{queue}_pending")
    }

    /// List of ids claimed by a worker.
    pub fn progress(queue: &str) -> String {
        format!("{queue}_progress")
    }

    /// Legacy list of completed ids.
    pub fn complete(queue: &str) -> String {
        format!("{queue}_complete")
    }

    /// Legacy list of failed ids.
    pub fn failed(queue: &str) -> String {
        format!("{queue}_failed")
    }

    /// Delay list shared by every queue.
    pub fn delay(&self) -> String {
        format!("{}_global-delay", self.prefix)
    }

    /// Set of known fully-qualified queue names.
    pub fn queues(&self) -> String {
        format!("{}_queues", self.prefix)
    }

    /// First-seen timestamp of a pending batch.
    pub fn batcher(&self, source_queue: &str, source_name: &str) -> String {
        format!("{}_batcher:{}:{}", self.prefix, source_queue, source_name)
    }

    /// Job record key. Records are keyed by the bare id.
    pub fn job(&self, job_id: &str) -> String {
        job_id.to_string()
    }

    /// Pub/sub channel of an event type.
    pub fn channel(event_type: &str) -> String {
        format!("{EVENT_CHANNEL_PREFIX}{event_type}")
    }
}

impl Default for KeySpace {
    fn default() -> Self {
        Self::new("redka_")
    }
}

/// Returns true if `name` may not be used as a queue name.
pub fn is_reserved(name: &str) -> bool {
    RESERVED_QUEUE_NAMES.contains(&name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keys() {
        let keys = KeySpace::default();
        let queue = keys.queue("hello");

        assert_eq!(queue, "redka_hello");
        assert_eq!(KeySpace::pending(&queue), "redka_hello_pending");
        assert_eq!(KeySpace::progress(&queue), "redka_hello_progress");
        assert_eq!(KeySpace::complete(&queue), "redka_hello_complete");
        assert_eq!(KeySpace::failed(&queue), "redka_hello_failed");
        assert_eq!(keys.delay(), "redka__global-delay");
        assert_eq!(keys.queues(), "redka__queues");
        assert_eq!(keys.batcher(&queue, "item"), "redka__batcher:redka_hello:item");
        assert_eq!(keys.job("abc"), "abc");
    }

    #[test]
    fn test_channel() {
        assert_eq!(KeySpace::channel("COMPLETE"), "redka-job-events:COMPLETE");
    }

    #[test]
    fn test_reserved_names() {
        assert!(is_reserved("_global-delay"));
        assert!(is_reserved("_batcher"));
        assert!(!is_reserved("emails"));
    }
}
