//! Authentication mechanism registry.
//!
//! Maps mechanism names to factories. Registration order is the daemon's
//! preference order when picking among mechanisms a peer offers. The
//! configured `auth_mechanisms` list narrows the active set at startup via
//! [`AuthManager::filter_mechanisms`]; registration is not expected to race
//! with authentication once the daemon is serving.

use std::sync::{Arc, Mutex};

use meshbus_core::BusError;

use super::mechanism::{
    AnonymousMechanism, AuthListener, AuthMechanism, HmacSha256Mechanism, KeyStore, ANONYMOUS,
    HMAC_SHA256,
};

/// Instantiates a mechanism, given the key store and an optional listener.
pub type MechanismFactory =
    Arc<dyn Fn(&Arc<dyn KeyStore>, Option<&Arc<dyn AuthListener>>) -> Box<dyn AuthMechanism> + Send + Sync>;

/// Registry of authentication mechanism factories.
pub struct AuthManager {
    key_store: Arc<dyn KeyStore>,
    mechanisms: Mutex<Vec<(String, MechanismFactory)>>,
}

impl AuthManager {
    /// Empty registry.
    #[must_use]
    pub fn new(key_store: Arc<dyn KeyStore>) -> Self {
        Self {
            key_store,
            mechanisms: Mutex::new(Vec::new()),
        }
    }

    /// Registry with the built-in mechanisms, strongest first.
    #[must_use]
    pub fn with_default_mechanisms(key_store: Arc<dyn KeyStore>) -> Self {
        let manager = Self::new(key_store);
        manager.register_mechanism(HMAC_SHA256, Arc::new(|ks, listener| {
            let secret = listener
                .and_then(|l| l.request_secret(HMAC_SHA256))
                .or_else(|| ks.secret());
            Box::new(HmacSha256Mechanism::new(secret))
        }));
        manager.register_mechanism(ANONYMOUS, Arc::new(|_, _| Box::new(AnonymousMechanism)));
        manager
    }

    /// Registers a factory under `name`, replacing any previous entry.
    pub fn register_mechanism(&self, name: &str, factory: MechanismFactory) {
        let mut mechanisms = self.mechanisms.lock().unwrap();
        if let Some(slot) = mechanisms.iter_mut().find(|(n, _)| n == name) {
            slot.1 = factory;
        } else {
            mechanisms.push((name.to_string(), factory));
        }
    }

    /// Removes the factory registered under `name`, if any.
    pub fn unregister_mechanism(&self, name: &str) {
        self.mechanisms.lock().unwrap().retain(|(n, _)| n != name);
    }

    /// Retains only mechanisms whose name appears as a space-separated
    /// token in `list`. Returns the retained count. An empty list retains
    /// everything.
    pub fn filter_mechanisms(&self, list: &str) -> usize {
        let mut mechanisms = self.mechanisms.lock().unwrap();
        if !list.trim().is_empty() {
            let allowed: Vec<&str> = list.split_whitespace().collect();
            mechanisms.retain(|(n, _)| allowed.contains(&n.as_str()));
        }
        mechanisms.len()
    }

    /// Verifies every token in `list` names a registered mechanism.
    pub fn check_names(&self, list: &str) -> Result<(), BusError> {
        let mechanisms = self.mechanisms.lock().unwrap();
        for token in list.split_whitespace() {
            if !mechanisms.iter().any(|(n, _)| n == token) {
                return Err(BusError::InvalidAuthMechanism(token.to_string()));
            }
        }
        Ok(())
    }

    /// Instantiates the mechanism registered under `name`.
    #[must_use]
    pub fn get_mechanism(
        &self,
        name: &str,
        listener: Option<&Arc<dyn AuthListener>>,
    ) -> Option<Box<dyn AuthMechanism>> {
        let factory = {
            let mechanisms = self.mechanisms.lock().unwrap();
            mechanisms
                .iter()
                .find(|(n, _)| n == name)
                .map(|(_, f)| Arc::clone(f))?
        };
        Some(factory(&self.key_store, listener))
    }

    /// Active mechanism names in preference order.
    #[must_use]
    pub fn mechanism_names(&self) -> Vec<String> {
        self.mechanisms
            .lock()
            .unwrap()
            .iter()
            .map(|(n, _)| n.clone())
            .collect()
    }

    /// First of our mechanisms, in preference order, that the peer also
    /// offers.
    #[must_use]
    pub fn pick_common(&self, offered: &[String]) -> Option<String> {
        self.mechanism_names()
            .into_iter()
            .find(|n| offered.iter().any(|o| o == n))
    }
}
