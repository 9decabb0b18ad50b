pub mod api;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod node;
pub mod scheduler;
pub mod shutdown;
pub mod store;

pub use dispatcher::{DispatchStats, Dispatcher};
pub use error::{DispatchError, Result};
