//! SiteGate daemon: delay scheduler, gate controller, notifier and socket server.

pub mod clock;
mod error;
pub mod gate;
pub mod notifier;
pub mod paths;
pub mod protocol;
pub mod repository;
mod runtime;
pub mod scheduler;

pub use clock::{Clock, SystemClock, TokioClock};
pub use error::{DaemonError, GateError};
pub use gate::{
    CheckOutcome, ForceUnblockOutcome, GateHandle, GateInfo, GateReply, GateRequest,
    RecoveryReport, SiteGate, ToggleOutcome,
};
pub use notifier::{Notification, Notifier, Subscription};
pub use protocol::{
    request_data, request_status, request_stop, send_request, watch, DaemonRequest, DaemonResponse,
};
pub use repository::{FileRepository, MemoryRepository, SiteRepository};
pub use runtime::{run, start_blocking};
pub use scheduler::{DelayEvent, DelayScheduler};
