#![allow(clippy::needless_range_loop)]
#![allow(clippy::doc_lazy_continuation)]
// src/lib.rs

pub mod cli;
pub mod core;
pub mod crypto;
pub mod security;
pub mod storage;
pub mod vault;

// Hardware wallet support. Ledger USB access needs the `ledger` feature.
pub mod hardware;

// Signing orchestration on top of the vault and the hardware manager
pub mod service;
