//! Platform-backed connection implementations.

#[cfg(unix)]
pub mod process_connection;

#[cfg(unix)]
pub use process_connection::ProcessConnection;
