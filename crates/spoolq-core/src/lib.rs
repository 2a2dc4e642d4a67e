#![forbid(unsafe_code)]
#![deny(unreachable_pub)]

//! Types shared between the `spoolq` client, runner, and server: the wire
//! protocol, the user-table config file, and path resolution.

pub mod paths;
pub mod protocol;
pub mod users;
