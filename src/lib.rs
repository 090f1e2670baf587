//! Login and world servers for the legacy 7.1 binary client protocol of a
//! classic 2D tile MMO.
//!
//! The world server is logically single-threaded: one engine thread owns
//! all world state and consumes the engine queue, the only structure shared
//! across threads. Connection reader threads turn frames into queued engine
//! tasks; per-connection writer threads carry packets back out.

pub mod accounts;
pub mod config;
pub mod game;
pub mod logging;
pub mod net;
pub mod proto;
pub mod world;
pub mod xml;

pub use accounts::AccountStore;
pub use config::ConfigFile;
pub use game::engine::{EngineHandle, EngineQueue, GameEngine};
pub use game::session::WorldSession;
pub use net::packet::{PacketReader, PacketWriter};
pub use net::server::ServerControl;
pub use world::state::World;
