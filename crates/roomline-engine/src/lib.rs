//! Async room engine: one single-writer controller per open conversation,
//! driven by a [`MatrixPort`] implementation.

/// Environment-backed tuning.
pub mod config;
/// Room controller and its worker.
pub mod controller;
/// Subscription acquisition and release.
pub mod coordinator;
/// Registry of open rooms.
pub mod hub;
/// Fixture-backed port.
pub mod memory;
/// Collaborator seam.
pub mod port;
/// Thread reply paging.
pub mod thread;
/// Typing notice debouncing.
pub mod typing;

pub use config::{ConfigError, EngineConfig};
pub use controller::{RoomController, RoomOptions};
pub use coordinator::{RoomStreams, SubscriptionCoordinator, SubscriptionKind};
pub use hub::RoomHub;
pub use memory::{InMemoryPort, PortCall, RoomFixture};
pub use port::{MatrixPort, Subscription, SubscriptionHandle};
pub use thread::ThreadView;
pub use typing::TypingDebouncer;
