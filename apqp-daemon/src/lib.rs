//! apqp daemon: serves sync, log, conflict and resolution requests for every
//! project over a Unix socket.

mod error;
pub mod paths;
pub mod protocol;
mod runtime;

pub use error::DaemonError;
pub use protocol::{
    request_conflicts, request_log, request_resolve, request_status, request_stop, request_sync,
    send_request, DaemonRequest, DaemonResponse,
};
pub use runtime::{init_tracing, run, start_blocking};
