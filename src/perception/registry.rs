use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};

use super::backend::{Capability, PerceptionBackend};

pub type SharedBackend = Arc<Mutex<dyn PerceptionBackend>>;

/// Registry of perception backends.
///
/// Backends are wrapped in `Mutex` because every inference method takes `&mut self`.
pub struct BackendRegistry {
    backends: HashMap<String, SharedBackend>,
    /// Registration order, so capability lookups are deterministic.
    order: Vec<String>,
    default_name: Option<String>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self {
            backends: HashMap::new(),
            order: Vec::new(),
            default_name: None,
        }
    }

    /// Register a backend. The first registered backend becomes the default.
    pub fn register<B: PerceptionBackend + 'static>(&mut self, backend: B) {
        let name = backend.name().to_string();
        if self.default_name.is_none() {
            self.default_name = Some(name.clone());
        }
        if !self.order.contains(&name) {
            self.order.push(name.clone());
        }
        self.backends.insert(name, Arc::new(Mutex::new(backend)));
    }

    /// Set default backend by name.
    pub fn set_default(&mut self, name: &str) -> Result<()> {
        if !self.backends.contains_key(name) {
            return Err(anyhow!("backend '{}' not registered", name));
        }
        self.default_name = Some(name.to_string());
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<SharedBackend> {
        self.backends.get(name).cloned()
    }

    pub fn default_backend(&self) -> Option<SharedBackend> {
        self.default_name.as_ref().and_then(|name| self.get(name))
    }

    /// Registered backend names, in registration order.
    pub fn list(&self) -> Vec<String> {
        self.order.clone()
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }

    /// Select a backend that supports the requested capability.
    ///
    /// Prefers the default backend when it supports the capability, then
    /// falls back to registration order.
    pub fn backend_for_capability(
        &self,
        capability: Capability,
    ) -> Result<(String, SharedBackend)> {
        let default = self.default_name.iter();
        let rest = self.order.iter().filter(|n| Some(*n) != self.default_name.as_ref());
        for name in default.chain(rest) {
            let Some(backend) = self.backends.get(name) else {
                continue;
            };
            let supports = {
                let guard = backend
                    .lock()
                    .map_err(|_| anyhow!("backend '{}' lock poisoned", name))?;
                guard.supports(capability)
            };
            if supports {
                return Ok((name.clone(), backend.clone()));
            }
        }

        Err(anyhow!(
            "no registered backend supports capability {}",
            capability.as_str()
        ))
    }
}

impl Default for BackendRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::perception::backends::StubBackend;

    struct DetectOnly;

    impl PerceptionBackend for DetectOnly {
        fn name(&self) -> &'static str {
            "detect-only"
        }

        fn supports(&self, capability: Capability) -> bool {
            capability == Capability::ObjectDetection
        }
    }

    #[test]
    fn default_backend_preferred_then_registration_order() {
        let mut reg = BackendRegistry::new();
        reg.register(DetectOnly);
        reg.register(StubBackend::new());

        let (name, _) = reg
            .backend_for_capability(Capability::ObjectDetection)
            .unwrap();
        assert_eq!(name, "detect-only");
        let (name, _) = reg
            .backend_for_capability(Capability::HandLandmarks)
            .unwrap();
        assert_eq!(name, "stub");

        reg.set_default("stub").unwrap();
        let (name, _) = reg
            .backend_for_capability(Capability::ObjectDetection)
            .unwrap();
        assert_eq!(name, "stub");
    }

    #[test]
    fn missing_capability_is_an_error() {
        let mut reg = BackendRegistry::new();
        reg.register(DetectOnly);
        assert!(reg.backend_for_capability(Capability::FacePose).is_err());
        assert!(reg.set_default("nope").is_err());
    }
}
