// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Runtime configuration knobs.

/// Cooperative yield budget: after this many interpreter steps without
/// suspending, a fiber resubmits itself to the pool rather than running on.
pub const DEFAULT_YIELD_MAX_OP_COUNT: u64 = 1 << 20;

/// How many nested synchronous async resumptions are allowed to run inline
/// before the interpreter resubmits to the pool instead, bounding host
/// stack depth under deeply chained callbacks.
pub const DEFAULT_MAX_RESUMPTION_DEPTH: usize = 10;

/// Configuration for an [`crate::host::Rts`] instance.
///
/// Built with [`RtsConfig::builder`]; every knob has a documented default,
/// so `RtsConfig::default()` is always a reasonable starting point.
#[derive(Debug, Clone)]
pub struct RtsConfig {
    pub(crate) yield_max_op_count: u64,
    pub(crate) max_resumption_depth: usize,
    pub(crate) thread_pool_size: usize,
}

impl Default for RtsConfig {
    fn default() -> Self {
        Self {
            yield_max_op_count: DEFAULT_YIELD_MAX_OP_COUNT,
            max_resumption_depth: DEFAULT_MAX_RESUMPTION_DEPTH,
            thread_pool_size: std::thread::available_parallelism()
                .map(|n| n.get().max(2))
                .unwrap_or(2),
        }
    }
}

impl RtsConfig {
    pub fn builder() -> RtsConfigBuilder {
        RtsConfigBuilder::default()
    }
}

/// Fluent builder for [`RtsConfig`].
#[derive(Debug, Default)]
pub struct RtsConfigBuilder {
    config: Option<RtsConfig>,
}

impl RtsConfigBuilder {
    fn config_mut(&mut self) -> &mut RtsConfig {
        self.config.get_or_insert_with(RtsConfig::default)
    }

    #[track_caller]
    pub fn yield_max_op_count(mut self, count: u64) -> Self {
        assert!(count > 0, "yield_max_op_count must be non-zero");
        self.config_mut().yield_max_op_count = count;
        self
    }

    #[track_caller]
    pub fn max_resumption_depth(mut self, depth: usize) -> Self {
        self.config_mut().max_resumption_depth = depth;
        self
    }

    #[track_caller]
    pub fn thread_pool_size(mut self, size: usize) -> Self {
        assert!(size > 0, "thread_pool_size must be non-zero");
        self.config_mut().thread_pool_size = size;
        self
    }

    pub fn build(self) -> RtsConfig {
        self.config.unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = RtsConfig::default();
        assert_eq!(config.yield_max_op_count, DEFAULT_YIELD_MAX_OP_COUNT);
        assert_eq!(config.max_resumption_depth, DEFAULT_MAX_RESUMPTION_DEPTH);
        assert!(config.thread_pool_size >= 2);
    }

    #[test]
    fn builder_overrides_apply() {
        let config = RtsConfig::builder()
            .yield_max_op_count(128)
            .max_resumption_depth(3)
            .thread_pool_size(4)
            .build();
        assert_eq!(config.yield_max_op_count, 128);
        assert_eq!(config.max_resumption_depth, 3);
        assert_eq!(config.thread_pool_size, 4);
    }

    #[test]
    #[should_panic(expected = "non-zero")]
    fn zero_yield_budget_panics() {
        RtsConfig::builder().yield_max_op_count(0);
    }
}
