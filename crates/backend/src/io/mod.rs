//! Listeners and sessions for worker connections.
//!
//! ```text
//! Actor (chamber runtime)          ExecutionUnit (engine runtime)
//!   accept ──► Attach::attach ──►    session task
//!                                      Channel <─► Dispatch
//! ```

pub mod actor;
pub mod chamber;
pub mod mapper;
pub mod unit;

pub use actor::{Actor, ActorError};
pub use chamber::Chamber;
pub use mapper::{MapperError, PortMapper};
pub use unit::{Attach, Dispatch, ExecutionUnit, SessionId};
