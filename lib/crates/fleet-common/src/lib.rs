pub mod config;
pub mod protocol;
pub mod task_kind;
pub mod types;

pub use config::{AgentConfig, PersistMode, ServerConfig};
pub use protocol::{codes, routes, timing};
pub use task_kind::{PortForwardParams, TaskKind, TaskKindError};
pub use types::*;
