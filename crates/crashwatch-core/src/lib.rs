pub mod artifacts;
pub mod backend;
pub mod cancel;
pub mod config;
pub mod correlate;
pub mod error;
pub mod registry;
pub mod report;
pub mod ticket;
pub mod trigger;
pub mod types;
pub mod window;
pub mod worker;

pub use artifacts::*;
pub use backend::*;
pub use cancel::*;
pub use config::*;
pub use correlate::*;
pub use error::*;
pub use registry::*;
pub use report::*;
pub use ticket::*;
pub use trigger::*;
pub use types::*;
pub use window::*;
pub use worker::*;
