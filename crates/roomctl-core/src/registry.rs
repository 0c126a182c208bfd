//! C7: the process-wide controller registry.
//!
//! One [`Controller`] per endpoint for the life of the process. Repeated
//! calls for the same endpoint return the same handle rather than opening
//! a second connection; the cache is never evicted on disconnect, so a
//! disconnected controller stays reachable for reconnection attempts
//! through the same handle.

use std::collections::HashMap;
use std::sync::Mutex;

use once_cell::sync::Lazy;

use crate::config::ClientOptions;
use crate::controller::Controller;

static REGISTRY: Lazy<Mutex<HashMap<String, Controller>>> = Lazy::new(|| Mutex::new(HashMap::new()));

/// Return the cached controller for `endpoint`, creating and scheduling a
/// connection attempt for it if this is the first call for that
/// endpoint. `options` is only consulted on first creation — later calls
/// for the same endpoint ignore a different `options` value and return
/// the existing handle.
pub fn get_or_create(endpoint: &str, options: ClientOptions) -> Controller {
    let mut registry = REGISTRY.lock().unwrap_or_else(|e| e.into_inner());
    if let Some(controller) = registry.get(endpoint) {
        return controller.clone();
    }

    let controller = Controller::new(endpoint, options);
    registry.insert(endpoint.to_owned(), controller.clone());
    let spawned = controller.clone();
    tokio::spawn(async move {
        spawned.connect().await;
    });
    controller
}

/// Look up an already-created controller without creating one.
#[must_use]
pub fn get(endpoint: &str) -> Option<Controller> {
    REGISTRY
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .get(endpoint)
        .cloned()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn repeated_lookup_returns_the_same_controller() {
        let endpoint = "registry-test-host:8000";
        let first = get_or_create(endpoint, ClientOptions::default());
        let second = get_or_create(endpoint, ClientOptions::default());
        assert!(first.ptr_eq(&second));
        assert!(get(endpoint).is_some());
    }
}
