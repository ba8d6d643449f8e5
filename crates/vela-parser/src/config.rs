use std::time::Duration;

/// Construction-time tuning for the background parser.
#[derive(Debug, Clone)]
pub struct ParserConfig {
    /// Number of parse worker threads.
    pub worker_threads: usize,
    /// Threads for the internal IO runtime driving timers and dispatch.
    /// Ignored when the parser is built with an external runtime handle.
    pub io_threads: usize,
    /// Debounce delay between an `add` and the dispatch that serves it.
    pub delay: Duration,
    /// Capacity of the event broadcast channel.
    pub event_channel_capacity: usize,
}

impl Default for ParserConfig {
    fn default() -> Self {
        let available = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Self {
            // In containers, `available_parallelism()` can report the host
            // CPU count even when the process is constrained by thread
            // limits. Keep the default modest.
            worker_threads: available.saturating_sub(1).clamp(1, 8),
            io_threads: 2,
            delay: Duration::from_millis(500),
            event_channel_capacity: 1024,
        }
    }
}

/// User-facing settings, applied on top of a running parser.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParserSettings {
    pub delay_ms: u64,
    pub worker_threads: usize,
    /// `false` suspends background parsing entirely.
    pub enabled: bool,
}

impl Default for ParserSettings {
    fn default() -> Self {
        Self {
            delay_ms: 500,
            worker_threads: 1,
            enabled: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_stays_within_bounds() {
        let config = ParserConfig::default();
        assert!(config.worker_threads >= 1);
        assert!(config.worker_threads <= 8);
        assert_eq!(config.delay, Duration::from_millis(500));
    }
}
