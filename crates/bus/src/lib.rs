//! In-process command and query dispatch.
//!
//! Commands route to exactly one handler; queries fan out to zero or more
//! providers. Both buses are built once at startup through their builders
//! and are immutable afterwards, so dispatch is lock-free.

pub mod command;
pub mod error;
pub mod query;

pub use command::{Command, CommandBus, CommandBusBuilder, CommandHandler};
pub use error::{BusError, Result};
pub use query::{Query, QueryBus, QueryBusBuilder, QueryProvider};
