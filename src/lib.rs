pub mod addr;
pub mod broadcast;
pub mod client;
pub mod config;
pub mod diagnostics;
pub mod error;
pub mod host;
pub mod pipe;
mod poll;
pub mod pty;
pub mod router;
pub mod transport;
pub mod wire;


pub use addr::{Address, Transport};
pub use broadcast::{WriteBroadcaster, WriteCloser};
pub use client::Client;
pub use config::{ClientOptions, HostOptions};
pub use diagnostics::Diagnostics;
pub use error::{Result, SiphonError};
pub use host::Host;
pub use pipe::{pipe, PipeReader, PipeWriter};
pub use router::Router;
pub use wire::{Connection, Message};
