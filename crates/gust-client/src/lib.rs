pub mod client;
pub mod connection;
pub mod loopback;

pub use client::*;
pub use connection::*;
pub use loopback::*;
