//! Realtime Core Library
//! Connection state machine, command loop and acknowledgement tracking for a
//! realtime pub/sub client

pub mod ack;
pub mod auth;
pub mod codec;
pub mod config;
pub mod connection;
pub mod error;
pub mod heartbeat;
pub mod protocol;
pub mod timer;
pub mod transport;

pub use config::ClientOptions;
pub use connection::{
    Connection, ConnectionBuilder, ConnectionEvent, ConnectionInfo, ConnectionState,
    ConnectionStateChange,
};
pub use error::{ErrorInfo, RealtimeError};
pub use protocol::{Action, Message, ProtocolMessage};

/// Initialize the core library (logging)
pub fn init() {
    // Host applications may install their own subscriber first.
    // We treat "already set" as a no-op.
    let _ = tracing::subscriber::set_global_default(
        tracing_subscriber::FmtSubscriber::builder()
            .with_max_level(tracing::Level::INFO)
            .finish(),
    );

    tracing::info!("Realtime core initialized (logger ready)");
}
