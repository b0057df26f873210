//! In-memory packet filter for tests.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::SandboxError;
use crate::filter::{FilterRule, PacketFilter};

#[derive(Debug, Default)]
struct MockFilterState {
    chains: HashMap<String, Vec<FilterRule>>,
    fail_append: Option<String>,
    fail_once_after: Option<(usize, String)>,
}

/// A [`PacketFilter`] that records chains and rules in memory.
#[derive(Debug)]
pub struct MockFilter {
    available: bool,
    state: Mutex<MockFilterState>,
}

impl Default for MockFilter {
    fn default() -> Self {
        Self::new()
    }
}

impl MockFilter {
    pub fn new() -> Self {
        Self {
            available: true,
            state: Mutex::new(MockFilterState::default()),
        }
    }

    /// A filter that behaves like an undetected tool.
    pub fn unavailable() -> Self {
        Self {
            available: false,
            state: Mutex::new(MockFilterState::default()),
        }
    }

    pub fn fail_append(&self, message: impl Into<String>) {
        self.state.lock().fail_append = Some(message.into());
    }

    /// Let `successes` appends through, fail the next one, then recover.
    pub fn fail_append_once_after(&self, successes: usize, message: impl Into<String>) {
        self.state.lock().fail_once_after = Some((successes, message.into()));
    }

    /// Rules currently in `chain`, in evaluation order.
    pub fn rules(&self, chain: &str) -> Option<Vec<FilterRule>> {
        self.state.lock().chains.get(chain).cloned()
    }

    pub fn chain_count(&self) -> usize {
        self.state.lock().chains.len()
    }
}

#[async_trait]
impl PacketFilter for MockFilter {
    fn name(&self) -> &str {
        "mock-filter"
    }

    fn is_available(&self) -> bool {
        self.available
    }

    async fn create_chain(&self, chain: &str, _subnet: &str) -> Result<(), SandboxError> {
        let mut state = self.state.lock();
        if state.chains.contains_key(chain) {
            return Err(SandboxError::tool_failure("mock-filter", "Chain already exists"));
        }
        state.chains.insert(chain.to_string(), Vec::new());
        Ok(())
    }

    async fn append_rule(&self, chain: &str, rule: &FilterRule) -> Result<(), SandboxError> {
        let mut state = self.state.lock();
        if let Some(ref message) = state.fail_append {
            return Err(SandboxError::tool_failure("mock-filter", message.clone()));
        }
        if let Some((remaining, message)) = state.fail_once_after.take() {
            if remaining == 0 {
                return Err(SandboxError::tool_failure("mock-filter", message));
            }
            state.fail_once_after = Some((remaining - 1, message));
        }
        state
            .chains
            .get_mut(chain)
            .ok_or_else(|| SandboxError::tool_failure("mock-filter", "No chain by that name"))?
            .push(rule.clone());
        Ok(())
    }

    async fn flush_chain(&self, chain: &str) -> Result<(), SandboxError> {
        self.state
            .lock()
            .chains
            .get_mut(chain)
            .ok_or_else(|| SandboxError::tool_failure("mock-filter", "No chain by that name"))?
            .clear();
        Ok(())
    }

    async fn delete_chain(&self, chain: &str, _subnet: &str) -> Result<(), SandboxError> {
        self.state
            .lock()
            .chains
            .remove(chain)
            .map(|_| ())
            .ok_or_else(|| SandboxError::tool_failure("mock-filter", "No chain by that name"))
    }
}
