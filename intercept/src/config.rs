//! Engine settings, with `REHOOK_*` environment overrides.

use std::time::Duration;

pub const ENV_QUIESCE: &str = "REHOOK_QUIESCE";
pub const ENV_QUIESCE_TIMEOUT_MS: &str = "REHOOK_QUIESCE_TIMEOUT_MS";
pub const ENV_NO_LOAD: &str = "REHOOK_NO_LOAD";
pub const ENV_FAR_ONLY: &str = "REHOOK_FAR_ONLY";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Park every other thread while target bytes are rewritten.
    pub quiesce_threads: bool,
    /// How long to wait for threads to park before patching anyway.
    pub quiesce_timeout: Duration,
    /// Let resolution `dlopen` modules that are not loaded yet.
    pub load_missing_modules: bool,
    /// Try to place trampolines within short-branch range of the target.
    pub prefer_near_allocation: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            quiesce_threads: false,
            quiesce_timeout: Duration::from_millis(250),
            load_missing_modules: true,
            prefer_near_allocation: true,
        }
    }
}

fn flag(value: &str) -> bool {
    matches!(value.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on")
}

impl EngineConfig {
    /// Defaults with the process environment applied.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub(crate) fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        if let Some(v) = lookup(ENV_QUIESCE) {
            config.quiesce_threads = flag(&v);
        }
        if let Some(v) = lookup(ENV_QUIESCE_TIMEOUT_MS) {
            match v.trim().parse::<u64>() {
                Ok(ms) => config.quiesce_timeout = Duration::from_millis(ms),
                Err(_) => log::warn!(
                    "ignoring {ENV_QUIESCE_TIMEOUT_MS}={v:?}; using {} ms",
                    config.quiesce_timeout.as_millis()
                ),
            }
        }
        if let Some(v) = lookup(ENV_NO_LOAD) {
            config.load_missing_modules = !flag(&v);
        }
        if let Some(v) = lookup(ENV_FAR_ONLY) {
            config.prefer_near_allocation = !flag(&v);
        }
        config
    }

    pub fn with_quiesce_threads(mut self, enabled: bool) -> Self {
        self.quiesce_threads = enabled;
        self
    }

    pub fn with_quiesce_timeout(mut self, timeout: Duration) -> Self {
        self.quiesce_timeout = timeout;
        self
    }

    pub fn with_load_missing_modules(mut self, enabled: bool) -> Self {
        self.load_missing_modules = enabled;
        self
    }

    pub fn with_prefer_near_allocation(mut self, enabled: bool) -> Self {
        self.prefer_near_allocation = enabled;
        self
    }

    /// Timeout to quiesce with, or `None` when quiescing is off.
    pub(crate) fn quiesce(&self) -> Option<Duration> {
        self.quiesce_threads.then_some(self.quiesce_timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn with(vars: &[(&str, &str)]) -> EngineConfig {
        let vars: HashMap<String, String> = vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        EngineConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn empty_environment_gives_defaults() {
        assert_eq!(with(&[]), EngineConfig::default());
        assert_eq!(EngineConfig::default().quiesce(), None);
    }

    #[test]
    fn overrides_apply() {
        let config = with(&[
            (ENV_QUIESCE, "1"),
            (ENV_QUIESCE_TIMEOUT_MS, "40"),
            (ENV_NO_LOAD, "true"),
            (ENV_FAR_ONLY, "1"),
        ]);
        assert!(config.quiesce_threads);
        assert_eq!(config.quiesce(), Some(Duration::from_millis(40)));
        assert!(!config.load_missing_modules);
        assert!(!config.prefer_near_allocation);
    }

    #[test]
    fn malformed_timeout_keeps_default() {
        let config = with(&[(ENV_QUIESCE_TIMEOUT_MS, "soon")]);
        assert_eq!(config.quiesce_timeout, Duration::from_millis(250));
    }

    #[test]
    fn zero_disables_flags() {
        let config = with(&[(ENV_QUIESCE, "0"), (ENV_NO_LOAD, "0")]);
        assert!(!config.quiesce_threads);
        assert!(config.load_missing_modules);
    }

    #[test]
    fn builder_setters() {
        let config = EngineConfig::default()
            .with_quiesce_threads(true)
            .with_quiesce_timeout(Duration::from_millis(5))
            .with_load_missing_modules(false)
            .with_prefer_near_allocation(false);
        assert_eq!(config.quiesce(), Some(Duration::from_millis(5)));
        assert!(!config.load_missing_modules && !config.prefer_near_allocation);
    }
}
