//! nodegate-server: connection admission and node leasing in front of a
//! terminal application server.
//!
//! Accepts telnet, SSH and BinkP connections, screens each caller against
//! allow/deny lists, DNS block lists, a country filter, an auto-ban rate
//! window and an ESC probe, then leases a free node and hands the socket
//! to a worker process.

pub mod admission;
pub mod config;
pub mod events;
pub mod handoff;
pub mod listener;
pub mod node;
pub mod reputation;
pub mod server;

pub use config::ServerConfig;
pub use events::EventSink;
pub use listener::{Listener, ListenerState};
pub use server::Server;
