/*!
 * IPC Module
 * CMIF message handling between guest clients and HLE service objects
 */

pub mod context;
pub mod manager;
pub mod message;
pub mod service;
pub mod session;

pub use context::RequestContext;
pub use manager::{ServiceManager, ServiceName, SmService};
pub use message::{
    parse_request, parse_response, CommandType, IpcError, IpcResult, ParsedResponse, Payload, Request,
    RequestBuilder, Response,
};
pub use service::{CommandHandler, CommandMap, CommandTable, IpcService, ServiceFactory, ServiceResult};
pub use session::KSession;
