//! Isolate limits.

/// Resource ceilings for one Isolate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IsolateConfig {
    /// Guest heap limit in bytes.
    pub memory_limit: usize,
    /// Guest stack limit in bytes.
    pub max_stack_size: usize,
    /// Most imports a single `execute` may bind.
    pub max_imports: usize,
    /// Most arguments a single `execute` may bind.
    pub max_args: usize,
    /// Most event deliveries drained between two inbound messages.
    pub max_event_deliveries: usize,
}

impl IsolateConfig {
    pub fn new() -> Self {
        Self {
            memory_limit: 64 * 1024 * 1024,
            max_stack_size: 1024 * 1024,
            max_imports: 64,
            max_args: 64,
            max_event_deliveries: 10_000,
        }
    }

    pub fn with_memory_limit(mut self, bytes: usize) -> Self {
        self.memory_limit = bytes;
        self
    }

    pub fn with_max_stack_size(mut self, bytes: usize) -> Self {
        self.max_stack_size = bytes;
        self
    }

    pub fn with_max_imports(mut self, count: usize) -> Self {
        self.max_imports = count;
        self
    }

    pub fn with_max_args(mut self, count: usize) -> Self {
        self.max_args = count;
        self
    }

    pub fn with_max_event_deliveries(mut self, count: usize) -> Self {
        self.max_event_deliveries = count;
        self
    }

    /// OS stack for the Isolate thread; leaves headroom above the guest limit.
    pub(crate) fn thread_stack_size(&self) -> usize {
        self.max_stack_size.saturating_mul(2).max(8 * 1024 * 1024)
    }
}

impl Default for IsolateConfig {
    fn default() -> Self {
        Self::new()
    }
}
