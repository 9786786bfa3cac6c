//! Virtual endpoints.
//!
//! A virtual endpoint is the local stand-in for a unique name hosted on a
//! remote daemon. It carries no stream of its own; it carries an ordered
//! route set of bus-to-bus endpoint names through which the remote name is
//! reachable, and the router picks one per message round-robin.
//!
//! Invariant: a live virtual endpoint has a non-empty route set. When the
//! last route is removed the endpoint is destroyed by its map.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Local proxy for one remote unique name.
pub struct VirtualEndpoint {
    unique_name: String,
    routes: Mutex<Vec<String>>,
    next_route: AtomicUsize,
}

impl VirtualEndpoint {
    fn new(unique_name: String) -> Self {
        Self {
            unique_name,
            routes: Mutex::new(Vec::new()),
            next_route: AtomicUsize::new(0),
        }
    }

    #[must_use]
    pub fn unique_name(&self) -> &str {
        &self.unique_name
    }

    /// Adds a bus-to-bus route. Returns true if it was not present.
    pub fn add_route(&self, b2b_name: &str) -> bool {
        let mut routes = self.routes.lock().unwrap();
        if routes.iter().any(|r| r == b2b_name) {
            return false;
        }
        routes.push(b2b_name.to_string());
        true
    }

    /// Removes a route. Returns true if the route set is now empty.
    pub fn remove_route(&self, b2b_name: &str) -> bool {
        let mut routes = self.routes.lock().unwrap();
        routes.retain(|r| r != b2b_name);
        routes.is_empty()
    }

    /// Picks the next route round-robin.
    #[must_use]
    pub fn pick_route(&self) -> Option<String> {
        let routes = self.routes.lock().unwrap();
        if routes.is_empty() {
            return None;
        }
        let index = self.next_route.fetch_add(1, Ordering::Relaxed) % routes.len();
        Some(routes[index].clone())
    }

    /// Snapshot of the route set, in insertion order.
    #[must_use]
    pub fn routes(&self) -> Vec<String> {
        self.routes.lock().unwrap().clone()
    }

    #[must_use]
    pub fn has_route(&self, b2b_name: &str) -> bool {
        self.routes.lock().unwrap().iter().any(|r| r == b2b_name)
    }

    /// Whether this endpoint's only route is `b2b_name`.
    #[must_use]
    pub fn sole_route_is(&self, b2b_name: &str) -> bool {
        let routes = self.routes.lock().unwrap();
        routes.len() == 1 && routes[0] == b2b_name
    }
}

impl std::fmt::Debug for VirtualEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VirtualEndpoint")
            .field("unique_name", &self.unique_name)
            .field("routes", &self.routes())
            .finish()
    }
}

/// The registry of remote unique names reachable through this daemon.
#[derive(Default)]
pub struct VirtualEndpointMap {
    inner: Mutex<HashMap<String, Arc<VirtualEndpoint>>>,
}

impl VirtualEndpointMap {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `b2b_name` as a route for `unique_name`, creating the virtual
    /// endpoint if needed. The boolean is true when the endpoint was
    /// freshly created.
    pub fn add(&self, unique_name: &str, b2b_name: &str) -> (Arc<VirtualEndpoint>, bool) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(existing) = inner.get(unique_name) {
            existing.add_route(b2b_name);
            return (Arc::clone(existing), false);
        }
        let endpoint = Arc::new(VirtualEndpoint::new(unique_name.to_string()));
        endpoint.add_route(b2b_name);
        inner.insert(unique_name.to_string(), Arc::clone(&endpoint));
        (endpoint, true)
    }

    /// Resolves a unique name to its virtual endpoint.
    #[must_use]
    pub fn find(&self, unique_name: &str) -> Option<Arc<VirtualEndpoint>> {
        self.inner.lock().unwrap().get(unique_name).cloned()
    }

    /// Destroys the virtual endpoint for `unique_name`.
    pub fn remove(&self, unique_name: &str) -> Option<Arc<VirtualEndpoint>> {
        self.inner.lock().unwrap().remove(unique_name)
    }

    /// Detaches `b2b_name` from every virtual endpoint and destroys those
    /// left with an empty route set. Returns the unique names destroyed.
    pub fn detach_b2b(&self, b2b_name: &str) -> Vec<String> {
        let mut inner = self.inner.lock().unwrap();
        let mut destroyed = Vec::new();
        inner.retain(|unique_name, endpoint| {
            if endpoint.remove_route(b2b_name) {
                destroyed.push(unique_name.clone());
                false
            } else {
                true
            }
        });
        destroyed
    }

    /// Unique names currently routed (among other routes) via `b2b_name`.
    #[must_use]
    pub fn names_via(&self, b2b_name: &str) -> Vec<String> {
        self.inner
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, ep)| ep.has_route(b2b_name))
            .map(|(name, _)| name.clone())
            .collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.lock().unwrap().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_reports_fresh_creation_once() {
        let map = VirtualEndpointMap::new();
        let (_, created) = map.add(":7.1", ":1.5");
        assert!(created);
        let (ep, created) = map.add(":7.1", ":1.6");
        assert!(!created);
        assert_eq!(ep.routes(), vec![":1.5", ":1.6"]);
    }

    #[test]
    fn round_robin_walks_the_route_set() {
        let map = VirtualEndpointMap::new();
        let (ep, _) = map.add(":7.1", ":1.5");
        map.add(":7.1", ":1.6");

        let picks: Vec<String> = (0..4).map(|_| ep.pick_route().unwrap()).collect();
        assert_eq!(picks, vec![":1.5", ":1.6", ":1.5", ":1.6"]);
    }

    #[test]
    fn detach_destroys_only_orphaned_endpoints() {
        let map = VirtualEndpointMap::new();
        map.add(":7.1", ":1.5");
        map.add(":7.2", ":1.5");
        map.add(":7.2", ":1.6");

        let mut destroyed = map.detach_b2b(":1.5");
        destroyed.sort();
        assert_eq!(destroyed, vec![":7.1"]);
        assert!(map.find(":7.1").is_none());

        let survivor = map.find(":7.2").unwrap();
        assert_eq!(survivor.routes(), vec![":1.6"]);
        assert!(survivor.sole_route_is(":1.6"));
    }

    #[test]
    fn route_set_never_observably_empty() {
        let map = VirtualEndpointMap::new();
        let (ep, _) = map.add(":7.1", ":1.5");
        assert!(ep.pick_route().is_some());
        map.detach_b2b(":1.5");
        // The map slot is gone; a held reference reports no routes.
        assert!(map.find(":7.1").is_none());
        assert!(ep.pick_route().is_none());
    }
}
