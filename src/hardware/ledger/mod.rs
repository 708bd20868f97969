//! Ledger hardware wallet integration
//!
//! - `apdu`: command/response frames and status words
//! - `transport`: HID packet framing and the link traits
//! - `device`: the [`LedgerDriver`]
//! - `mock`: an in-process chain app for tests and `--simulate`

pub mod apdu;
pub mod device;
pub mod mock;
pub mod transport;

pub use device::LedgerDriver;
pub use mock::SimulatedLedger;
#[cfg(feature = "ledger")]
pub use transport::HidLink;
pub use transport::{ApduTransport, LedgerLink};
