// concord-common: wire types shared by the session runtime and the server.

pub mod protocol;
pub mod types;
