//! The uniform tool invocation contract and the manager that owns tools.

mod contract;
mod manager;

pub use contract::{PrivilegePolicy, Tool, ToolErrorInfo, ToolHealth, ToolHealthReport, UnifiedResult};
pub use manager::{ToolDescriptor, ToolManager, ToolScope};
