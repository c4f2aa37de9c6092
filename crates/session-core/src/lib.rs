pub mod config;
pub mod control;
pub mod error;
pub mod executor;
pub mod matrix;
pub mod schedule;
pub mod scheduler;
pub mod session;
pub mod stats;

pub use config::*;
pub use control::*;
pub use error::*;
pub use executor::*;
pub use matrix::*;
pub use schedule::*;
pub use scheduler::*;
pub use session::*;
pub use stats::*;
