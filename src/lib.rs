pub mod device;
pub mod error;
pub mod filetypes;
pub mod fs;
pub mod internals;
pub mod logging;
pub mod recovery;
pub mod session;
pub mod spool;
pub mod tree;

pub type Result<T> = std::result::Result<T, error::Error>;
