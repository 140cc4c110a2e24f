//! Keyed store of circuit breakers.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerStats};
use crate::clock::{SharedClock, SystemClock};

/// Maps operation keys to breakers. Breakers are created on first use and only
/// removed by [`CircuitBreakerRegistry::reset`].
///
/// Keys name operation classes ("probe:live.twitch.tv:1935"), not individual
/// requests, so the map stays small.
#[derive(Debug)]
pub struct CircuitBreakerRegistry {
    config: CircuitBreakerConfig,
    clock: SharedClock,
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
}

impl CircuitBreakerRegistry {
    /// Create a registry whose breakers share `config` and `clock`.
    pub fn new(config: CircuitBreakerConfig, clock: SharedClock) -> Self {
        Self {
            config,
            clock,
            breakers: Mutex::new(HashMap::new()),
        }
    }

    /// Breaker for `key`, creating it with the registry defaults.
    pub fn get_or_create(&self, key: &str) -> Arc<CircuitBreaker> {
        self.get_or_create_with(key, self.config)
    }

    /// Breaker for `key`, creating it with `config` if absent.
    pub fn get_or_create_with(&self, key: &str, config: CircuitBreakerConfig) -> Arc<CircuitBreaker> {
        let mut breakers = self.breakers.lock();
        if let Some(breaker) = breakers.get(key) {
            return Arc::clone(breaker);
        }

        debug!(key, "Creating circuit breaker");
        let breaker = Arc::new(CircuitBreaker::new(key, config, Arc::clone(&self.clock)));
        breakers.insert(key.to_string(), Arc::clone(&breaker));
        breaker
    }

    /// Existing breaker for `key`.
    pub fn get(&self, key: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.lock().get(key).cloned()
    }

    /// Forget the breaker for `key`. Returns true if one existed.
    pub fn reset(&self, key: &str) -> bool {
        self.breakers.lock().remove(key).is_some()
    }

    /// Forget every breaker.
    pub fn reset_all(&self) {
        self.breakers.lock().clear();
    }

    /// Number of breakers created so far.
    pub fn len(&self) -> usize {
        self.breakers.lock().len()
    }

    /// Returns true if no breaker has been created.
    pub fn is_empty(&self) -> bool {
        self.breakers.lock().is_empty()
    }

    /// Stats for every breaker, sorted by key.
    pub fn snapshot(&self) -> Vec<CircuitBreakerStats> {
        let breakers: Vec<_> = self.breakers.lock().values().cloned().collect();
        let mut stats: Vec<_> = breakers.iter().map(|b| b.stats()).collect();
        stats.sort_by(|a, b| a.key.cmp(&b.key));
        stats
    }
}

impl Default for CircuitBreakerRegistry {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default(), Arc::new(SystemClock))
    }
}
