//! Core module - Bypass, instance lifecycle, governance, coordination and launching

pub mod account;
pub mod bypass;
pub mod error;
pub mod governor;
pub mod instance;
pub mod launch;
pub mod monitor;
pub mod orchestrator;
pub mod process;
pub mod registry;
pub mod resource;
pub mod settings;
pub mod sync;

pub use account::{Account, AccountStats};
pub use bypass::{BypassController, BypassState, BypassStatus, LeaseMethod, LockBackend, MutexLease};
pub use error::{FleetError, FleetResult};
pub use instance::{Instance, InstanceId, InstanceStatus, LaunchMethod, LaunchTarget};
pub use launch::BatchOutcome;
pub use orchestrator::{Collaborators, MutexStatus, Orchestrator};
pub use process::{LaunchOutcome, LaunchRequest, Launcher, ProcessHost};
pub use registry::Registry;
pub use resource::{ResourceLimits, ResourceUsage, SystemLoad, SystemPerformance};
pub use settings::Settings;
pub use sync::{CommandKind, CommandSink, DeliveryResult, DispatchReport, SyncRole, SyncStatus};
