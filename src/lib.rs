//! boardterm - drive a remote board from the local terminal.
//!
//! Characters typed locally are sent to every TCP client connected to the
//! relay; whatever the clients send back is printed on the local terminal.

pub mod broadcast;
pub mod config;
pub mod interrupt;
pub mod keyboard;
pub mod output;
pub mod registry;
pub mod relay;
pub mod server;
pub mod terminal;
