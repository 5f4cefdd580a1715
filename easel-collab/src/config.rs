use std::time::Duration;

/// Per-session tuning knobs.
#[derive(Debug, Clone)]
pub struct CollabConfig {
    /// Minimum spacing between cursor writes (default: 50ms)
    pub cursor_throttle: Duration,
    /// Undo/redo history depth (default: 10)
    pub undo_capacity: usize,
    /// Values buffered per feed subscriber before it resyncs (default: 256)
    pub feed_capacity: usize,
    /// Session event channel depth (default: 256)
    pub event_capacity: usize,
}

impl Default for CollabConfig {
    fn default() -> Self {
        Self {
            cursor_throttle: Duration::from_millis(50),
            undo_capacity: 10,
            feed_capacity: 256,
            event_capacity: 256,
        }
    }
}
