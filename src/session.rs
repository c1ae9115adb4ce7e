//! Exclusive single-controller session tracking for the control surface.

use std::time::{Duration, Instant};

use parking_lot::Mutex;
use uuid::Uuid;

struct Controller {
    token: String,
    last_seen: Instant,
}

/// At most one session token may hold the controller slot at a time. A
/// controller is considered stale after `timeout` of silence, at which point
/// any caller may claim the slot.
pub struct SessionRegistry {
    timeout: Duration,
    controller: Mutex<Option<Controller>>,
}

impl SessionRegistry {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            controller: Mutex::new(None),
        }
    }

    fn is_stale(&self, controller: &Controller) -> bool {
        !self.timeout.is_zero() && controller.last_seen.elapsed() > self.timeout
    }

    /// Updates `last_seen` for `token` if it is the current controller, without
    /// ever claiming the slot. Returns whether `token` is (still) controller.
    pub fn touch(&self, token: &str) -> bool {
        let mut guard = self.controller.lock();
        match guard.as_mut() {
            Some(controller) if controller.token == token => {
                controller.last_seen = Instant::now();
                true
            }
            _ => false,
        }
    }

    pub fn is_controller(&self, token: &str) -> bool {
        let guard = self.controller.lock();
        matches!(guard.as_ref(), Some(c) if c.token == token)
    }

    pub fn controller_present(&self) -> bool {
        let guard = self.controller.lock();
        matches!(guard.as_ref(), Some(c) if !self.is_stale(c))
    }

    pub fn can_claim(&self, token: &str) -> bool {
        let guard = self.controller.lock();
        match guard.as_ref() {
            None => true,
            Some(c) if c.token == token => true,
            Some(c) => self.is_stale(c),
        }
    }

    /// Test-and-set claim: succeeds if there is no controller, the controller
    /// is stale, or the caller already is the controller.
    pub fn claim(&self, token: &str) -> bool {
        let mut guard = self.controller.lock();
        let can_claim = match guard.as_ref() {
            None => true,
            Some(c) if c.token == token => true,
            Some(c) => self.is_stale(c),
        };
        if can_claim {
            *guard = Some(Controller {
                token: token.to_string(),
                last_seen: Instant::now(),
            });
        }
        can_claim
    }

    pub fn logout(&self, token: &str, force: bool) {
        let mut guard = self.controller.lock();
        if force || matches!(guard.as_ref(), Some(c) if c.token == token) {
            *guard = None;
        }
    }
}

pub fn new_token() -> String {
    Uuid::new_v4().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_claim_succeeds() {
        let registry = SessionRegistry::new(Duration::from_secs(30));
        assert!(registry.claim("a"));
        assert!(registry.is_controller("a"));
    }

    #[test]
    fn second_claim_fails_while_fresh() {
        let registry = SessionRegistry::new(Duration::from_secs(30));
        assert!(registry.claim("a"));
        assert!(!registry.claim("b"));
        assert!(registry.is_controller("a"));
    }

    #[test]
    fn stale_controller_is_reclaimable() {
        let registry = SessionRegistry::new(Duration::from_millis(1));
        assert!(registry.claim("a"));
        std::thread::sleep(Duration::from_millis(5));
        assert!(registry.can_claim("b"));
        assert!(registry.claim("b"));
        assert!(registry.is_controller("b"));
    }

    #[test]
    fn logout_without_force_only_clears_own_token() {
        let registry = SessionRegistry::new(Duration::from_secs(30));
        registry.claim("a");
        registry.logout("b", false);
        assert!(registry.is_controller("a"));
        registry.logout("a", false);
        assert!(!registry.is_controller("a"));
    }

    #[test]
    fn zero_timeout_never_goes_stale() {
        let registry = SessionRegistry::new(Duration::from_secs(0));
        registry.claim("a");
        std::thread::sleep(Duration::from_millis(5));
        assert!(!registry.can_claim("b"));
    }
}
