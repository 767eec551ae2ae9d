/*!
 * Service Manager
 * Named service registry and the `sm:` port guests use to reach it
 */

use super::context::RequestContext;
use super::service::{CommandMap, CommandTable, IpcService, ServiceFactory, ServiceResult};
use crate::core::errors::ResultCode;
use crate::core::limits::MAX_SERVICE_NAME_LEN;
use crate::core::types::{FirmwareVersion, VersionRange};
use ahash::RandomState;
use dashmap::DashMap;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Service name packed into a u64, as sent over `sm:`
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ServiceName(u64);

impl ServiceName {
    /// Pack a name of 1 to 8 bytes
    pub fn new(name: &str) -> Result<Self, ResultCode> {
        let bytes = name.as_bytes();
        if bytes.is_empty() || bytes.len() > MAX_SERVICE_NAME_LEN || bytes.contains(&0) {
            return Err(ResultCode::SM_INVALID_SERVICE_NAME);
        }
        let mut packed = [0u8; 8];
        packed[..bytes.len()].copy_from_slice(bytes);
        Ok(Self(u64::from_le_bytes(packed)))
    }

    /// Validate a packed name: non-empty, nothing after the first NUL
    pub fn from_u64(raw: u64) -> Result<Self, ResultCode> {
        let bytes = raw.to_le_bytes();
        let len = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
        if len == 0 || bytes[len..].iter().any(|&b| b != 0) {
            return Err(ResultCode::SM_INVALID_SERVICE_NAME);
        }
        Ok(Self(raw))
    }

    pub fn raw(&self) -> u64 {
        self.0
    }

    pub fn as_string(&self) -> String {
        let bytes = self.0.to_le_bytes();
        let len = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
        String::from_utf8_lossy(&bytes[..len]).into_owned()
    }
}

impl fmt::Display for ServiceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_string())
    }
}

impl fmt::Debug for ServiceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ServiceName({})", self.as_string())
    }
}

/// Registry of named services
pub struct ServiceManager {
    firmware: FirmwareVersion,
    services: DashMap<ServiceName, Arc<dyn ServiceFactory>, RandomState>,
}

impl ServiceManager {
    pub fn new(firmware: FirmwareVersion) -> Self {
        Self {
            firmware,
            services: DashMap::with_hasher(RandomState::new()),
        }
    }

    pub fn register(&self, name: &str, factory: Arc<dyn ServiceFactory>) -> Result<(), ResultCode> {
        let name = ServiceName::new(name)?;
        match self.services.entry(name) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(ResultCode::SM_ALREADY_REGISTERED),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(factory);
                info!("Registered service {}", name);
                Ok(())
            }
        }
    }

    pub fn unregister(&self, name: &str) -> Result<(), ResultCode> {
        let name = ServiceName::new(name)?;
        self.services
            .remove(&name)
            .map(|_| debug!("Unregistered service {}", name))
            .ok_or(ResultCode::SM_NOT_REGISTERED)
    }

    /// Create a fresh service object for a new session
    pub fn get_service(&self, name: ServiceName) -> Result<Arc<dyn IpcService>, ResultCode> {
        let factory = self
            .services
            .get(&name)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or(ResultCode::SM_NOT_REGISTERED)?;
        Ok(factory.create(self.firmware))
    }

    pub fn is_registered(&self, name: &str) -> bool {
        ServiceName::new(name).map_or(false, |name| self.services.contains_key(&name))
    }

    pub fn service_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.services.iter().map(|entry| entry.key().as_string()).collect();
        names.sort();
        names
    }

    /// Factory for the `sm:` named port
    pub fn port_factory(self: &Arc<Self>) -> Arc<dyn ServiceFactory> {
        let manager = Arc::clone(self);
        Arc::new(move |firmware: FirmwareVersion| -> Arc<dyn IpcService> {
            Arc::new(SmService::new(Arc::clone(&manager), firmware))
        })
    }
}

impl fmt::Debug for ServiceManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceManager")
            .field("firmware", &self.firmware)
            .field("services", &self.service_names())
            .finish()
    }
}

/// `sm:` session object
pub struct SmService {
    manager: Arc<ServiceManager>,
    initialized: AtomicBool,
    commands: CommandMap<SmService>,
}

impl SmService {
    fn commands() -> CommandTable<SmService> {
        CommandTable::new()
            .with(0, "Initialize", Self::initialize)
            .with(1, "GetServiceHandle", Self::get_service_handle)
            .with_stub(2, "RegisterService")
            .with_stub(3, "UnregisterService")
            .with_versioned(
                4,
                "DetachClient",
                VersionRange::since(FirmwareVersion::new(11, 0, 0)),
                Self::detach_client,
            )
    }

    pub fn new(manager: Arc<ServiceManager>, firmware: FirmwareVersion) -> Self {
        Self {
            manager,
            initialized: AtomicBool::new(false),
            commands: Self::commands().build(firmware),
        }
    }

    fn initialize(&self, ctx: &mut RequestContext<'_>) -> ServiceResult {
        self.initialized.store(true, Ordering::SeqCst);
        debug!("sm: initialized by process {}", ctx.pid());
        Ok(())
    }

    fn get_service_handle(&self, ctx: &mut RequestContext<'_>) -> ServiceResult {
        if !self.initialized.load(Ordering::SeqCst) {
            return Err(ResultCode::SM_INVALID_CLIENT);
        }
        let name = ServiceName::from_u64(ctx.pop_u64()?)?;
        let service = self.manager.get_service(name)?;
        debug!("sm: process {} opened {}", ctx.pid(), name);
        ctx.push_interface(service);
        Ok(())
    }

    fn detach_client(&self, _ctx: &mut RequestContext<'_>) -> ServiceResult {
        self.initialized.store(false, Ordering::SeqCst);
        Ok(())
    }
}

impl IpcService for SmService {
    fn service_name(&self) -> &str {
        "sm:"
    }

    fn handle_request(&self, ctx: &mut RequestContext<'_>) -> ServiceResult {
        self.commands.dispatch(self, "sm:", ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_service_name_packing() {
        let name = ServiceName::new("fsp-srv").unwrap();
        assert_eq!(name.as_string(), "fsp-srv");
        assert_eq!(ServiceName::from_u64(name.raw()), Ok(name));
        assert_eq!(ServiceName::new(""), Err(ResultCode::SM_INVALID_SERVICE_NAME));
        assert_eq!(ServiceName::new("toolongname"), Err(ResultCode::SM_INVALID_SERVICE_NAME));
        // bytes after the terminator are rejected
        assert_eq!(
            ServiceName::from_u64(0x41_00_41),
            Err(ResultCode::SM_INVALID_SERVICE_NAME)
        );
    }
}
