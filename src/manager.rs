use std::collections::BTreeMap;

use tracing::{debug, info, warn};

use crate::bus::{BusEvent, RemoteService};
use crate::config::ApConfig;
use crate::error::ServiceError;
use crate::service::{HostapdEvent, Resources, Service, ServiceEnv, ServiceState};

/// Owns every AP service and the process-wide lease managers they share.
pub struct Manager {
    resources: Resources,
    env: ServiceEnv,
    services: BTreeMap<u32, Service>,
    next_id: u32,
}

impl Manager {
    pub fn new(resources: Resources, env: ServiceEnv) -> Self {
        Self {
            resources,
            env,
            services: BTreeMap::new(),
            next_id: 0,
        }
    }

    pub fn create_service(&mut self, config: ApConfig) -> u32 {
        let id = self.next_id;
        self.next_id += 1;
        info!(service_id = id, interface = %config.interface, "service created");
        self.services
            .insert(id, Service::new(id, config, self.env.clone()));
        id
    }

    pub fn start_service(&mut self, id: u32) -> Result<(), ServiceError> {
        let interface = self
            .services
            .get(&id)
            .ok_or(ServiceError::UnknownService(id))?
            .config()
            .interface
            .clone();
        // Claims and leases are keyed by interface alone, so a second active
        // service would release them out from under the first on stop.
        if let Some(owner) = self.active_user_of(&interface, id) {
            warn!(service_id = id, owner, interface = %interface, "interface already in use");
            return Err(ServiceError::InterfaceInUse { interface, owner });
        }
        let service = self
            .services
            .get_mut(&id)
            .ok_or(ServiceError::UnknownService(id))?;
        service.start(&mut self.resources)
    }

    fn active_user_of(&self, interface: &str, except: u32) -> Option<u32> {
        self.services
            .values()
            .find(|service| {
                service.id() != except
                    && service.config().interface == interface
                    && matches!(
                        service.state(),
                        ServiceState::Starting | ServiceState::Started
                    )
            })
            .map(Service::id)
    }

    pub fn stop_service(&mut self, id: u32) -> Result<(), ServiceError> {
        let service = self
            .services
            .get_mut(&id)
            .ok_or(ServiceError::UnknownService(id))?;
        service.stop(&mut self.resources);
        Ok(())
    }

    pub fn remove_service(&mut self, id: u32) -> Result<(), ServiceError> {
        let mut service = self
            .services
            .remove(&id)
            .ok_or(ServiceError::UnknownService(id))?;
        service.stop(&mut self.resources);
        info!(service_id = id, "service removed");
        Ok(())
    }

    pub fn service_state(&self, id: u32) -> Option<ServiceState> {
        self.services.get(&id).map(Service::state)
    }

    pub fn services(&self) -> impl Iterator<Item = &Service> {
        self.services.values()
    }

    pub fn resources(&self) -> &Resources {
        &self.resources
    }

    pub fn handle_bus_event(&mut self, event: BusEvent) {
        let service = match &event {
            BusEvent::ServiceAvailable { service, .. } => *service,
            BusEvent::NameOwnerChanged { service, .. } => *service,
        };
        debug!(remote = service.as_str(), "bus event received");
        match event {
            BusEvent::ServiceAvailable {
                service: RemoteService::Firewall,
                available,
            } => self.resources.firewall.on_service_available(available),
            BusEvent::ServiceAvailable {
                service: RemoteService::ConnectionManager,
                available,
            } => self.resources.claims.on_service_available(available),
            BusEvent::NameOwnerChanged {
                service: RemoteService::Firewall,
                old_owner,
                new_owner,
            } => self
                .resources
                .firewall
                .on_owner_changed(&old_owner, &new_owner),
            BusEvent::NameOwnerChanged {
                service: RemoteService::ConnectionManager,
                old_owner,
                new_owner,
            } => self
                .resources
                .claims
                .on_owner_changed(&old_owner, &new_owner),
        }
    }

    pub fn handle_hostapd_event(&mut self, id: u32, event: HostapdEvent) -> Result<(), ServiceError> {
        let service = self
            .services
            .get_mut(&id)
            .ok_or(ServiceError::UnknownService(id))?;
        service.handle_hostapd_event(event, &mut self.resources);
        Ok(())
    }

    /// Checks every running service for an exited hostapd.
    pub fn poll(&mut self) {
        for service in self.services.values_mut() {
            service.check_process(&mut self.resources);
        }
    }

    pub fn stop_all(&mut self) {
        for service in self.services.values_mut() {
            service.stop(&mut self.resources);
        }
        if self.resources.firewall.lease_count() > 0 || !self.resources.claims.claimed().is_empty() {
            warn!("leases still recorded after stopping every service");
        }
    }
}
