//! Tunables for the discovery pool, probers and reconciler.

use std::time::Duration;

/// Configuration shared by the [`crate::Reconciler`], [`crate::DiscoveryPool`]
/// and the probing subsystem.
///
/// All values have production defaults; override them with the builder
/// methods.
///
/// ```ignore
/// use std::time::Duration;
/// use thirdcomponent::ControllerConfig;
///
/// let config = ControllerConfig::new("thirdcomponent-controller")
///     .static_poll_interval(Duration::from_secs(10))
///     .probe_attempts(5);
/// ```
#[derive(Clone, Debug)]
pub struct ControllerConfig {
    /// Field manager used for server-side apply of derived `Endpoints`.
    pub field_manager: String,

    /// Controller name reported on published events.
    pub reporter: String,

    /// Upper bound for one synchronous `discover_one` snapshot.
    pub discover_timeout: Duration,

    /// Upper bound for each status or `Endpoints` write.
    pub write_timeout: Duration,

    /// Delay before the owning loop retries a pass that could not finish.
    pub requeue_after: Duration,

    /// Capacity of the pool's shared component update queue.
    pub update_queue_capacity: usize,

    /// Capacity of each component's probe result notification queue.
    pub result_queue_capacity: usize,

    /// Attempts per probe tick for transport-level errors.
    pub probe_attempts: u32,

    /// How often the static source re-reads the registry.
    pub static_poll_interval: Duration,

    /// Pause before restarting a discover loop that ended with an error.
    pub watch_restart_backoff: Duration,

    /// Maximum retries for a status write that hits a conflict.
    pub status_retries: usize,

    /// Initial backoff between conflicting status writes.
    pub status_retry_delay: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            field_manager: "thirdcomponent-controller".to_string(),
            reporter: "thirdcomponent-controller".to_string(),
            discover_timeout: Duration::from_secs(10),
            write_timeout: Duration::from_secs(10),
            requeue_after: Duration::from_secs(5),
            update_queue_capacity: 1024,
            result_queue_capacity: 64,
            probe_attempts: 3,
            static_poll_interval: Duration::from_secs(5),
            watch_restart_backoff: Duration::from_secs(1),
            status_retries: 5,
            status_retry_delay: Duration::from_millis(10),
        }
    }
}

impl ControllerConfig {
    /// Creates a configuration whose field manager and reporter are `name`.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            field_manager: name.clone(),
            reporter: name,
            ..Self::default()
        }
    }

    /// Sets the timeout for synchronous discovery snapshots.
    #[must_use]
    pub fn discover_timeout(mut self, timeout: Duration) -> Self {
        self.discover_timeout = timeout;
        self
    }

    /// Sets the timeout for each status or `Endpoints` write.
    #[must_use]
    pub fn write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }

    /// Sets the requeue interval returned for retryable passes.
    #[must_use]
    pub fn requeue_after(mut self, interval: Duration) -> Self {
        self.requeue_after = interval;
        self
    }

    /// Sets the capacity of the shared update queue.
    #[must_use]
    pub fn update_queue_capacity(mut self, capacity: usize) -> Self {
        self.update_queue_capacity = capacity.max(1);
        self
    }

    /// Sets the capacity of each probe result notification queue.
    #[must_use]
    pub fn result_queue_capacity(mut self, capacity: usize) -> Self {
        self.result_queue_capacity = capacity.max(1);
        self
    }

    /// Sets how many attempts a probe makes per tick on transport errors.
    #[must_use]
    pub fn probe_attempts(mut self, attempts: u32) -> Self {
        self.probe_attempts = attempts.max(1);
        self
    }

    /// Sets the registry poll interval of static sources.
    #[must_use]
    pub fn static_poll_interval(mut self, interval: Duration) -> Self {
        self.static_poll_interval = interval;
        self
    }

    /// Sets the pause before a failed discover loop restarts.
    #[must_use]
    pub fn watch_restart_backoff(mut self, backoff: Duration) -> Self {
        self.watch_restart_backoff = backoff;
        self
    }

    /// Sets the conflict retry bounds for status writes.
    #[must_use]
    pub fn status_retry(mut self, retries: usize, delay: Duration) -> Self {
        self.status_retries = retries;
        self.status_retry_delay = delay;
        self
    }
}
