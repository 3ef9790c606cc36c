//! Network bindings for the Mosaic listing engine.
//!
//! [`RestItemSource`] implements the list and mutation endpoints over HTTP,
//! [`PushChannel`] feeds WebSocket item events into the invalidator, and
//! [`connect`] wires both into a running [`ListingEngine`].

pub mod config;
pub mod error;
pub mod rest;
pub mod telemetry;
pub mod ws;

use std::sync::Arc;

use mosaic_storage::FilterPersistence;
use mosaic_sync::{ListingEngine, RealtimeInvalidator};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::info;

pub use config::ClientConfig;
pub use error::ClientError;
pub use rest::RestItemSource;
pub use ws::{Backoff, PushChannel};

const SIGNAL_CHANNEL_CAPACITY: usize = 256;

pub type RemoteEngine = ListingEngine<Box<dyn FilterPersistence>, RestItemSource>;

/// A running engine with its push channel attached.
pub struct Session {
    pub engine: RemoteEngine,
    pub invalidator: RealtimeInvalidator,
    push: JoinHandle<()>,
}

impl Session {
    /// Stop the push channel and the invalidator.
    pub fn shutdown(self) {
        self.push.abort();
        self.invalidator.abort();
    }
}

/// Build the engine from configuration and start the push channel.
///
/// Must be called from within a tokio runtime.
pub fn connect(config: &ClientConfig) -> Result<Session, ClientError> {
    let persistence = config.persistence.open()?;
    let source = Arc::new(RestItemSource::new(config)?);
    let engine = ListingEngine::new(config.user(), persistence, source, config.engine_config())?;

    let (sender, signals) = mpsc::channel(SIGNAL_CHANNEL_CAPACITY);
    let invalidator = engine.attach(signals);
    let push = PushChannel::new(config).spawn(sender);
    info!(
        user_id = %config.user_id,
        persistence = config.persistence.name(),
        "Session started"
    );
    Ok(Session {
        engine,
        invalidator,
        push,
    })
}
