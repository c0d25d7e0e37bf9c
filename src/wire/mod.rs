// Framed wire protocol: records, the connection that carries them, and the
// handshake that gates every new connection.
mod conn;
pub mod handshake;
mod message;

pub use conn::Connection;
pub use handshake::{Hello, Redirect, PROTOCOL_TAG};
pub use message::Message;
