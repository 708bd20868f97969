pub mod signing;

pub use signing::{SignedTransaction, Signer, SigningCoordinator};
