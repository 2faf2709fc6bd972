//! ts2021-server: TS2021 control server core.
//!
//! Upgrades HTTP/1.1 requests to the Noise control channel, sends the
//! early payload, and serves registration and map polling over HTTP/2
//! inside the channel.

pub mod body;
pub mod config;
pub mod error;
pub mod gate;
pub mod mapper;
pub mod poll;
pub mod register;
pub mod registrar;
pub mod router;
pub mod server;
pub mod session;
pub mod store;
pub mod upgrade;

#[cfg(test)]
mod testing;

pub use config::ServerConfig;
pub use error::{HttpError, ServerError, ServerResult};
pub use poll::{MapSession, MapSessionError, MapSessionFactory, MapUpdates};
pub use register::{RegisterError, Registrar};
pub use server::{ControlServer, ControlState};
pub use session::NoiseSession;
pub use store::{NodeStore, StoreError};
pub use upgrade::EarlyNoiseHook;
