/*!
 * Service Objects
 * IPC service trait and firmware-versioned command tables
 */

use super::context::RequestContext;
use crate::core::errors::ResultCode;
use crate::core::types::{FirmwareVersion, VersionRange};
use ahash::RandomState;
use log::warn;
use std::collections::HashMap;
use std::sync::Arc;

/// Result of a service command; errors become the response result code
pub type ServiceResult = Result<(), ResultCode>;

/// A service object reachable through a session or a domain id
pub trait IpcService: Send + Sync {
    /// Name used in logs
    fn service_name(&self) -> &str;

    /// Handle one request; the command id is in `ctx.command_id()`
    fn handle_request(&self, ctx: &mut RequestContext<'_>) -> ServiceResult;
}

/// Creates one service object per connection
pub trait ServiceFactory: Send + Sync {
    fn create(&self, firmware: FirmwareVersion) -> Arc<dyn IpcService>;
}

impl<F> ServiceFactory for F
where
    F: Fn(FirmwareVersion) -> Arc<dyn IpcService> + Send + Sync,
{
    fn create(&self, firmware: FirmwareVersion) -> Arc<dyn IpcService> {
        self(firmware)
    }
}

/// Handler bound to a command id
pub type CommandHandler<S> = fn(&S, &mut RequestContext<'_>) -> ServiceResult;

struct CommandEntry<S> {
    id: u32,
    name: &'static str,
    versions: VersionRange,
    handler: Option<CommandHandler<S>>,
}

/// Command registrations for one service type, in registration order
pub struct CommandTable<S> {
    entries: Vec<CommandEntry<S>>,
}

impl<S> Default for CommandTable<S> {
    fn default() -> Self {
        Self { entries: Vec::new() }
    }
}

impl<S> CommandTable<S> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a command available on every firmware
    pub fn with(self, id: u32, name: &'static str, handler: CommandHandler<S>) -> Self {
        self.with_versioned(id, name, VersionRange::ALL, handler)
    }

    /// Register a command for a firmware range
    ///
    /// When two entries for one id both match a firmware, the one registered
    /// first is used.
    pub fn with_versioned(
        mut self,
        id: u32,
        name: &'static str,
        versions: VersionRange,
        handler: CommandHandler<S>,
    ) -> Self {
        self.entries.push(CommandEntry {
            id,
            name,
            versions,
            handler: Some(handler),
        });
        self
    }

    /// Register a known command that is not implemented
    pub fn with_stub(mut self, id: u32, name: &'static str) -> Self {
        self.entries.push(CommandEntry {
            id,
            name,
            versions: VersionRange::ALL,
            handler: None,
        });
        self
    }

    /// Resolve the table for one firmware version
    pub fn build(&self, firmware: FirmwareVersion) -> CommandMap<S> {
        let mut commands: HashMap<u32, ResolvedCommand<S>, RandomState> = HashMap::default();
        for entry in self.entries.iter().filter(|entry| entry.versions.contains(firmware)) {
            commands.entry(entry.id).or_insert(ResolvedCommand {
                name: entry.name,
                handler: entry.handler,
            });
        }
        CommandMap { commands }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

struct ResolvedCommand<S> {
    name: &'static str,
    handler: Option<CommandHandler<S>>,
}

/// Command table resolved against a firmware version
pub struct CommandMap<S> {
    commands: HashMap<u32, ResolvedCommand<S>, RandomState>,
}

impl<S> CommandMap<S> {
    /// Run the handler for the request's command id
    ///
    /// Unknown ids fail with CMIF UnknownCommandId before anything runs;
    /// stubs fail with NotImplemented.
    pub fn dispatch(&self, service: &S, service_name: &str, ctx: &mut RequestContext<'_>) -> ServiceResult {
        let id = ctx.command_id();
        let Some(command) = self.commands.get(&id) else {
            warn!("{}: unknown command {}", service_name, id);
            return Err(ResultCode::CMIF_UNKNOWN_COMMAND_ID);
        };
        match command.handler {
            Some(handler) => handler(service, ctx),
            None => {
                warn!("{}: command {} ({}) is not implemented", service_name, id, command.name);
                Err(ResultCode::NOT_IMPLEMENTED)
            }
        }
    }

    pub fn name_of(&self, id: u32) -> Option<&'static str> {
        self.commands.get(&id).map(|command| command.name)
    }

    pub fn contains(&self, id: u32) -> bool {
        self.commands.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }
}
