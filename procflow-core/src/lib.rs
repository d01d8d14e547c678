//! Embeddable process execution engine.
//!
//! Definitions are graphs of typed nodes. A `ProcessRuntime` runs instances
//! of them: node instances wait on signals, timers, work items or child
//! instances, and every public operation commits through a unit of work.

pub mod calendar;
pub mod config;
pub mod constraint;
pub mod definition;
pub mod error;
pub mod events;
pub mod expiration;
pub mod instance;
pub mod jobs;
pub mod node;
pub mod runtime;
pub mod signal;
pub mod store;
pub mod store_memory;
pub mod types;
mod uow;
pub mod validate;
pub mod variables;
pub mod workitem;

pub use config::EngineConfig;
pub use definition::{DefinitionRegistry, NodeKind, ProcessDefinition};
pub use error::{ProcessError, ProcessResult};
pub use events::{EventPublisher, ProcessEvent};
pub use instance::ProcessInstance;
pub use runtime::{ProcessRuntime, ProcessRuntimeBuilder};
pub use signal::{EventListener, SignalManager};
pub use types::{NodeId, ProcessInstanceId, ProcessState, Value, WorkItemId};
pub use workitem::{Transition, WorkItem, WorkItemPhase};
