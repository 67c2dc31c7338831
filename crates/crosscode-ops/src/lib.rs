//! Client side of the CrossCode backend protocol: typed event channels,
//! a single-flight command runner, and the multi-step operation executor.

mod bridge;
mod cancel;
mod command;
mod console;
mod error;
mod events;
mod executor;
mod local;
mod params;
pub mod registry;
mod state;
mod topic;
mod view;

pub use bridge::{Backend, InvokeRequest, Subscription};
pub use cancel::CancelToken;
pub use command::CommandRunner;
pub use console::{parse_console_payload, CommandConsole, ConsoleEvent, DEFAULT_CONSOLE_LINES};
pub use error::{BackendError, CommandError, OperationError};
pub use events::EventBus;
pub use executor::{
    ConcurrencyPolicy, OperationExecutor, OperationSnapshot, RunPhase, StateWatcher,
};
pub use local::{CommandContext, CommandHandler, HandlerResult, LocalBackend, StepReporter};
pub use params::{DeployParams, DeviceInfo, InstallSdkParams, OperationParams};
pub use registry::{Operation, StepDescriptor};
pub use state::{FailedStep, OperationState, OperationUpdate, StepStatus, UpdateType};
pub use topic::{InvocationToken, Topic};
pub use view::OperationView;
