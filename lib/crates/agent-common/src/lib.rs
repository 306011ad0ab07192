pub mod config;
pub mod error;
pub mod protocol;
pub mod registry;
pub mod target;

pub use config::{AgentServerConfig, TimeoutPolicy};
pub use error::{ConfigError, ProtocolError, RegistryError, ValidationError};
pub use protocol::{ClientCommand, CompletionStatus, ErrorReason, OutputStream, ServerEvent};
pub use registry::{ArgTemplate, ToolDefinition, ToolFamily, ToolRegistry};
pub use target::{MAX_TARGET_LEN, Target, TargetKind, validate_target};
