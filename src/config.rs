/// Configuration for one warden server instance.
///
/// Populated once at startup; there is no runtime reconfiguration.
#[derive(Debug, Clone)]
pub struct WardenConfig {
    /// TCP port the listener binds on.
    pub port: u16,
    /// Deadline applied to ACQUIRE requests that carry no timeout, in
    /// milliseconds.
    pub default_timeout_ms: u64,
    /// Admit new readers while a writer is queued. Greedy mode maximizes
    /// read throughput; non-greedy mode keeps new readers from starving a
    /// waiting writer. Fixed per lock entity at creation.
    pub greedy_readers: bool,
}

impl Default for WardenConfig {
    fn default() -> Self {
        Self {
            port: 11311,
            default_timeout_ms: 30_000, // 30 s
            greedy_readers: false,
        }
    }
}

impl WardenConfig {
    /// A config tuned for fast testing.
    ///
    /// - **port:** 0, so the kernel picks a free one.
    /// - **default_timeout_ms:** tiny, so untimed pending acquires expire
    ///   quickly.
    #[cfg(test)]
    pub fn for_testing() -> Self {
        Self {
            port: 0,
            default_timeout_ms: 200,
            ..Default::default()
        }
    }
}
