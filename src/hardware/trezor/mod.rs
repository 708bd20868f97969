//! Trezor hardware wallet integration
//!
//! The device is reached through the vendor bridge daemon, so nothing here
//! touches USB directly.

pub mod device;
pub mod messages;
pub mod mock;
pub mod transport;

pub use device::TrezorDriver;
pub use mock::SimulatedBridge;
pub use transport::{BridgeTransport, HttpBridge};
