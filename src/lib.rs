mod aggregate;
mod config;
mod decode;
mod error;
mod fields;
mod persist;

pub use aggregate::*;
pub use config::*;
pub use decode::*;
pub use error::*;
pub use fields::*;
pub use persist::*;
