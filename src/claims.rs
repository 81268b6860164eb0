//! Interface ownership claimed from the connection manager.
//!
//! While an interface is claimed the connection manager stops managing it.
//! A restarted connection manager forgets every claim, so the claimed set is
//! replayed whenever the service (re)appears.

use std::collections::BTreeSet;

use tracing::{debug, error, info};

use crate::bus::{ConnectionManagerService, CLAIMER_NAME};
use crate::error::RemoteError;

pub struct InterfaceClaimManager {
    service: Box<dyn ConnectionManagerService>,
    claimed: BTreeSet<String>,
}

impl InterfaceClaimManager {
    pub fn new(service: Box<dyn ConnectionManagerService>) -> Self {
        Self {
            service,
            claimed: BTreeSet::new(),
        }
    }

    pub fn claim_interface(&mut self, interface: &str) {
        self.send_claim(interface);
        self.claimed.insert(interface.to_string());
    }

    pub fn release_interface(&mut self, interface: &str) {
        if let Err(err) = self.service.release_interface(CLAIMER_NAME, interface) {
            log_remote_error("release interface", interface, &err);
        }
        self.claimed.remove(interface);
    }

    pub fn on_service_available(&mut self, available: bool) {
        info!(available, "connection manager availability changed");
        if !available {
            return;
        }
        self.resync_all();
    }

    pub fn on_owner_changed(&mut self, old_owner: &str, new_owner: &str) {
        info!(old_owner = %old_owner, new_owner = %new_owner, "connection manager owner changed");
        if new_owner.is_empty() {
            return;
        }
        self.resync_all();
    }

    pub fn resync_all(&mut self) {
        if self.claimed.is_empty() {
            return;
        }
        info!(count = self.claimed.len(), "re-claiming interfaces");
        let claimed: Vec<String> = self.claimed.iter().cloned().collect();
        for interface in &claimed {
            self.send_claim(interface);
        }
    }

    pub fn claimed(&self) -> &BTreeSet<String> {
        &self.claimed
    }

    pub fn is_claimed(&self, interface: &str) -> bool {
        self.claimed.contains(interface)
    }

    fn send_claim(&mut self, interface: &str) {
        match self.service.claim_interface(CLAIMER_NAME, interface) {
            Ok(()) => debug!(interface = %interface, "interface claimed"),
            Err(err) => log_remote_error("claim interface", interface, &err),
        }
    }
}

fn log_remote_error(action: &str, interface: &str, err: &RemoteError) {
    // Without a connection manager there is nobody to conflict with.
    if err.is_service_unknown() {
        debug!(interface = %interface, "{}: connection manager not present", action);
    } else {
        error!(interface = %interface, "failed to {} from connection manager: {}", action, err);
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub(crate) enum ClaimCall {
        Claim(String),
        Release(String),
    }

    #[derive(Clone, Default)]
    pub(crate) struct RecordingConnectionManager {
        pub calls: Rc<RefCell<Vec<ClaimCall>>>,
        pub failure: Rc<RefCell<Option<RemoteError>>>,
    }

    impl RecordingConnectionManager {
        pub fn take_calls(&self) -> Vec<ClaimCall> {
            std::mem::take(&mut *self.calls.borrow_mut())
        }

        pub fn fail_with(&self, err: Option<RemoteError>) {
            *self.failure.borrow_mut() = err;
        }

        fn outcome(&self) -> Result<(), RemoteError> {
            match self.failure.borrow().clone() {
                Some(err) => Err(err),
                None => Ok(()),
            }
        }
    }

    impl ConnectionManagerService for RecordingConnectionManager {
        fn claim_interface(&mut self, claimer: &str, interface: &str) -> Result<(), RemoteError> {
            assert_eq!(claimer, CLAIMER_NAME);
            self.calls
                .borrow_mut()
                .push(ClaimCall::Claim(interface.to_string()));
            self.outcome()
        }

        fn release_interface(&mut self, claimer: &str, interface: &str) -> Result<(), RemoteError> {
            assert_eq!(claimer, CLAIMER_NAME);
            self.calls
                .borrow_mut()
                .push(ClaimCall::Release(interface.to_string()));
            self.outcome()
        }
    }

    fn manager() -> (InterfaceClaimManager, RecordingConnectionManager) {
        let remote = RecordingConnectionManager::default();
        (InterfaceClaimManager::new(Box::new(remote.clone())), remote)
    }

    fn claim(name: &str) -> ClaimCall {
        ClaimCall::Claim(name.to_string())
    }

    #[test]
    fn claim_and_release_update_set() {
        let (mut claims, remote) = manager();
        claims.claim_interface("wlan0");
        assert!(claims.is_claimed("wlan0"));

        claims.release_interface("wlan0");
        assert!(claims.claimed().is_empty());
        assert_eq!(
            remote.take_calls(),
            vec![claim("wlan0"), ClaimCall::Release("wlan0".to_string())]
        );
    }

    #[test]
    fn owner_restart_reclaims_exactly_once() {
        let (mut claims, remote) = manager();
        claims.claim_interface("wlan0");
        remote.take_calls();

        claims.on_owner_changed(":1.7", ":1.8");
        assert_eq!(remote.take_calls(), vec![claim("wlan0")]);
        assert_eq!(
            claims.claimed().iter().collect::<Vec<_>>(),
            vec!["wlan0"]
        );
    }

    #[test]
    fn vanished_owner_keeps_claims_for_later() {
        let (mut claims, remote) = manager();
        claims.claim_interface("wlan0");
        remote.take_calls();

        claims.on_owner_changed(":1.7", "");
        assert!(remote.take_calls().is_empty());
        assert!(claims.is_claimed("wlan0"));

        claims.on_service_available(true);
        assert_eq!(remote.take_calls(), vec![claim("wlan0")]);
    }

    #[test]
    fn absent_service_still_records_claim() {
        let (mut claims, remote) = manager();
        remote.fail_with(Some(RemoteError::ServiceUnknown));
        claims.claim_interface("wlan0");
        assert!(claims.is_claimed("wlan0"));
    }

    #[test]
    fn internal_error_on_release_still_forgets_claim() {
        let (mut claims, remote) = manager();
        claims.claim_interface("wlan0");
        remote.fail_with(Some(RemoteError::internal("org.example.Failure", "denied")));
        claims.release_interface("wlan0");
        assert!(!claims.is_claimed("wlan0"));

        remote.fail_with(None);
        remote.take_calls();
        claims.on_service_available(true);
        assert!(remote.take_calls().is_empty());
    }

    #[test]
    fn resync_with_nothing_claimed_sends_nothing() {
        let (mut claims, remote) = manager();
        claims.on_service_available(true);
        claims.on_owner_changed("", ":1.3");
        assert!(remote.take_calls().is_empty());
    }

    #[test]
    fn resync_covers_every_claimed_interface() {
        let (mut claims, remote) = manager();
        claims.claim_interface("wlan1");
        claims.claim_interface("wlan0");
        claims.claim_interface("wlan0");
        remote.take_calls();

        claims.resync_all();
        assert_eq!(remote.take_calls(), vec![claim("wlan0"), claim("wlan1")]);
        assert_eq!(claims.claimed().len(), 2);
    }
}
