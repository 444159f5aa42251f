// concord-session: coordination layer running inside one client session.

pub mod bus;
pub mod client;
pub mod config;
pub mod draft_lock;
pub mod invalidation;
pub mod leader;
pub mod poller;
pub mod runtime;
pub mod store;
