//! Durable, segmented queue of raw events between the fetcher and the applier.
mod cursor;
mod errors;
mod index;
mod log;
mod segment;

pub use cursor::RelayCursor;
pub use errors::RelayLogError;
pub use log::RelayLog;
pub use log::RelayLogConfig;

#[cfg(test)]
pub(crate) use log::test_support;
