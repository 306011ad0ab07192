//! Desktop Agent server: runs allow-listed security tools on behalf of a
//! local front-end and streams their output over a loopback WebSocket.

pub mod broker;
pub mod discovery;
pub mod error;
pub mod runner;
pub mod server;
pub mod session;
pub mod state;

pub use error::{CommandError, SpawnError, TransitionError};
pub use runner::{ProcessHandle, ProcessRunner, RunEvent, RunOutcome, Termination};
pub use server::{router, serve};
pub use session::{ScanSession, SessionState};
pub use state::AppState;
