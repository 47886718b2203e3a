pub mod connection;
pub mod encoding;
pub mod error;
pub mod protocol;
pub mod sourcemap;
pub mod transport;
