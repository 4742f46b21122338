pub mod journal;
pub mod parser;
pub mod spool;

pub use journal::*;
pub use parser::*;
pub use spool::*;
