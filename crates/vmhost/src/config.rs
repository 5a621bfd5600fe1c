//! VM configuration.

use std::time::Duration;

use vmguest::IsolateConfig;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmConfig {
    /// Boot deadline used when `start` is given none.
    pub boot_timeout: Duration,
    /// Largest boot deadline `start` accepts.
    pub max_boot_timeout: Duration,
    pub isolate: IsolateConfig,
}

impl VmConfig {
    pub fn new() -> Self {
        Self {
            boot_timeout: Duration::from_millis(100),
            max_boot_timeout: Duration::from_secs(10),
            isolate: IsolateConfig::default(),
        }
    }

    pub fn with_boot_timeout(mut self, timeout: Duration) -> Self {
        self.boot_timeout = timeout;
        self
    }

    pub fn with_max_boot_timeout(mut self, timeout: Duration) -> Self {
        self.max_boot_timeout = timeout;
        self
    }

    pub fn with_isolate(mut self, isolate: IsolateConfig) -> Self {
        self.isolate = isolate;
        self
    }
}

impl Default for VmConfig {
    fn default() -> Self {
        Self::new()
    }
}
