pub mod http;
pub mod lease;
pub mod signal;
