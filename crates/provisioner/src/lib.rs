//! Meshprov provisioning engine
//!
//! Issues overlay identities to devices, allocates their addresses, and
//! keeps the overlay's live peer table in step with the peer store.

pub mod allocator;
pub mod config;
pub mod engine;
pub mod reconciler;
pub mod render;
pub mod store;

pub use allocator::AddressPool;
pub use config::ProvisionerConfig;
pub use engine::{LiveOutcome, ProvisioningEngine, Registration, StateChange, TestOutcome};
pub use reconciler::{DriftReport, LivePeer, LivePeerTable, PeerSnapshot, PeerTableReconciler, ReachabilityProbe};
pub use render::DeviceConfigRenderer;
pub use store::PeerStore;
