//! Authentication mechanism registry.
//!
//! Mechanism internals live in the engine; the front-end only decides which
//! mechanism names a channel may use.

use std::collections::HashMap;

/// Channels a mechanism is offered on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelRequirement {
    /// TLS or local socket only
    SecureOnly,
    Any,
}

/// Mechanism names keyed for lookup.
#[derive(Debug, Clone)]
pub struct AuthenticationRegistry {
    mechanisms: HashMap<&'static str, ChannelRequirement>,
}

impl AuthenticationRegistry {
    /// Empty registry.
    #[must_use]
    pub fn empty() -> Self {
        Self { mechanisms: HashMap::new() }
    }

    /// `PLAIN` on secure channels, `MYSQL41` and `SHA256_MEMORY` everywhere.
    #[must_use]
    pub fn with_defaults() -> Self {
        let mut registry = Self::empty();
        registry.register("PLAIN", ChannelRequirement::SecureOnly);
        registry.register("MYSQL41", ChannelRequirement::Any);
        registry.register("SHA256_MEMORY", ChannelRequirement::Any);
        registry
    }

    pub fn register(&mut self, name: &'static str, requirement: ChannelRequirement) {
        self.mechanisms.insert(name, requirement);
    }

    /// Whether `name` may be used on a channel of the given security.
    #[must_use]
    pub fn is_allowed(&self, name: &str, secure: bool) -> bool {
        let upper = name.to_ascii_uppercase();
        match self.mechanisms.get(upper.as_str()) {
            Some(ChannelRequirement::SecureOnly) => secure,
            Some(ChannelRequirement::Any) => true,
            None => false,
        }
    }

    /// Mechanism names offered on a channel, sorted.
    #[must_use]
    pub fn list(&self, secure: bool) -> Vec<&'static str> {
        let mut names: Vec<_> = self
            .mechanisms
            .iter()
            .filter(|(_, req)| secure || **req == ChannelRequirement::Any)
            .map(|(name, _)| *name)
            .collect();
        names.sort_unstable();
        names
    }
}

impl Default for AuthenticationRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}
