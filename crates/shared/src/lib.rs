pub mod domain;
pub mod error;
pub mod protocol;
pub mod surface;
pub mod timeouts;
pub mod transport;
