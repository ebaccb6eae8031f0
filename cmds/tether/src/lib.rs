pub mod commands;
pub mod error;
mod fanout;
pub mod instance;
pub mod k8s;
pub mod manifest;
pub mod options;
pub mod release;
pub mod telemetry;
#[cfg(test)]
pub mod test_utils;

pub use error::{Error, Errors};
