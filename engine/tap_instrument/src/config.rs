//! Coordinator configuration.

/// Settings of one [`Instrumentation`](crate::Instrumentation).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InstrumentationConfig {
    trace: bool,
    observer_errors_are_thrown: bool,
    initial_list_capacity: usize,
}

impl Default for InstrumentationConfig {
    fn default() -> Self {
        InstrumentationConfig {
            trace: false,
            observer_errors_are_thrown: false,
            initial_list_capacity: 8,
        }
    }
}

impl InstrumentationConfig {
    pub fn builder() -> InstrumentationConfigBuilder {
        InstrumentationConfigBuilder::default()
    }

    /// Read `TAP_TRACE` and `TAP_OBSERVER_ERRORS_THROWN` from the environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let flag = |key: &str| {
            lookup(key).is_some_and(|value| {
                let value = value.trim();
                value == "1" || value.eq_ignore_ascii_case("true")
            })
        };
        InstrumentationConfig::builder()
            .trace(flag("TAP_TRACE"))
            .observer_errors_are_thrown(flag("TAP_OBSERVER_ERRORS_THROWN"))
            .build()
    }

    /// Whether every walk logs a summary at debug level.
    pub fn trace(&self) -> bool {
        self.trace
    }

    /// Whether observer errors of client bindings propagate like those of
    /// language bindings instead of being logged.
    pub fn observer_errors_are_thrown(&self) -> bool {
        self.observer_errors_are_thrown
    }

    pub fn initial_list_capacity(&self) -> usize {
        self.initial_list_capacity
    }
}

/// Builder for [`InstrumentationConfig`].
#[derive(Default)]
pub struct InstrumentationConfigBuilder {
    config: InstrumentationConfig,
}

impl InstrumentationConfigBuilder {
    #[must_use]
    pub fn trace(mut self, trace: bool) -> Self {
        self.config.trace = trace;
        self
    }

    #[must_use]
    pub fn observer_errors_are_thrown(mut self, thrown: bool) -> Self {
        self.config.observer_errors_are_thrown = thrown;
        self
    }

    /// Starting capacity of the tree registries. Values below 1 are raised
    /// to 1.
    #[must_use]
    pub fn initial_list_capacity(mut self, capacity: usize) -> Self {
        self.config.initial_list_capacity = capacity.max(1);
        self
    }

    pub fn build(self) -> InstrumentationConfig {
        self.config
    }
}
