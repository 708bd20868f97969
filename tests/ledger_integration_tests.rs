//! Ledger driver tests against the simulated device.

use pretty_assertions::assert_eq;
use std::sync::Arc;
use std::time::Duration;
use test_case::test_case;
use wallet_custody::core::{CustodyError, DerivationPath};
use wallet_custody::crypto::{self, sha256};
use wallet_custody::hardware::ledger::apdu::{P1_CONFIRM, P1_FIRST_CHUNK, P1_MORE_CHUNK, P2_LAST, P2_MORE};
use wallet_custody::hardware::ledger::{LedgerDriver, SimulatedLedger};
use wallet_custody::hardware::{DeviceType, HardwareDriver};

const SEED: [u8; 32] = [0x11; 32];
const INS_GET_PUBLIC_KEY: u8 = 0x40;
const INS_SIGN: u8 = 0x44;

async fn connected() -> (SimulatedLedger, LedgerDriver) {
    let sim = SimulatedLedger::new(SEED);
    let driver = LedgerDriver::new(Arc::new(sim.clone()));
    driver.connect().await.unwrap();
    (sim, driver)
}

fn sign_frames(sim: &SimulatedLedger) -> Vec<Vec<u8>> {
    sim.frames().into_iter().filter(|f| f[1] == INS_SIGN).collect()
}

#[tokio::test]
async fn test_connect_reports_app() {
    let sim = SimulatedLedger::new(SEED);
    let driver = LedgerDriver::new(Arc::new(sim.clone()));
    assert!(driver.is_supported().await);
    let handle = driver.connect().await.unwrap();
    assert_eq!(handle.device_type, DeviceType::Ledger);
    assert_eq!(handle.firmware_version, "1.2.0");
    assert!(handle.model.contains("Axiom"));
    assert!(handle.device_id.starts_with("ledger-"));
    assert!(driver.is_connected());
}

#[tokio::test]
async fn test_address_matches_local_derivation() {
    let (sim, driver) = connected().await;
    let path = DerivationPath::new(0, 0, 7).unwrap();
    let derived = driver.get_address(&path, false).await.unwrap();
    assert_eq!(derived.public_key, sim.public_key(&path).unwrap());
    assert_eq!(derived.address, crypto::derive_address(&derived.public_key).unwrap());

    let shown = driver.verify_address_on_device(&path).await.unwrap();
    assert_eq!(shown, derived);
}

#[tokio::test]
async fn test_address_confirmed_on_device() {
    let (sim, driver) = connected().await;
    let path = DerivationPath::parse("m/44'/22593'/0'/0/0").unwrap();
    let derived = driver.get_address(&path, true).await.unwrap();

    assert_eq!(derived.address, crypto::derive_address(&derived.public_key).unwrap());
    assert_eq!(derived.public_key, sim.public_key(&path).unwrap());
    let request = sim.frames().last().cloned().unwrap();
    assert_eq!((request[1], request[2]), (INS_GET_PUBLIC_KEY, P1_CONFIRM));
}

#[tokio::test]
async fn test_misreported_address_is_rejected() {
    let (sim, driver) = connected().await;
    sim.set_misreport_address(true);
    let err = driver.get_address(&DerivationPath::default(), true).await.unwrap_err();
    assert!(matches!(err, CustodyError::Transport(ref d) if d.contains("mismatch")));
}

#[tokio::test]
async fn test_signature_verifies_against_device_key() {
    let (sim, driver) = connected().await;
    let path = DerivationPath::default();
    let payload = br#"{"amount":"1","from":"a","to":"b","type":"transfer"}"#;
    let sig = driver.sign(payload, &path).await.unwrap();
    assert!(sig.is_low_s());
    assert!(crypto::verify(sig.as_bytes(), &sha256(payload), &sim.public_key(&path).unwrap()));
}

#[tokio::test]
async fn test_high_s_is_normalized() {
    let (sim, driver) = connected().await;
    sim.set_high_s(true);
    let path = DerivationPath::default();
    let sig = driver.sign(b"payload", &path).await.unwrap();
    assert!(sig.is_low_s());
    assert!(crypto::verify(sig.as_bytes(), &sha256(b"payload"), &sim.public_key(&path).unwrap()));
}

#[test_case(0, 1 ; "empty payload")]
#[test_case(255, 2 ; "exactly one chunk")]
#[test_case(256, 3 ; "one byte over")]
#[test_case(600, 4 ; "three chunks")]
#[tokio::test]
async fn test_payload_chunking(len: usize, expected_frames: usize) {
    let (sim, driver) = connected().await;
    let payload = vec![0x5Au8; len];
    driver.sign(&payload, &DerivationPath::default()).await.unwrap();

    let frames = sign_frames(&sim);
    assert_eq!(frames.len(), expected_frames);
    // CLA INS P1 P2 LC: the path frame first, then payload chunks
    assert_eq!(frames[0][2], P1_FIRST_CHUNK);
    assert_eq!(&frames[0][5..], &DerivationPath::default().to_bytes()[..]);
    for frame in &frames[1..] {
        assert_eq!(frame[2], P1_MORE_CHUNK);
        assert!(frame[4] as usize <= 255);
    }
    for frame in &frames[..frames.len() - 1] {
        assert_eq!(frame[3], P2_MORE);
    }
    assert_eq!(frames[frames.len() - 1][3], P2_LAST);

    let carried: usize = frames[1..].iter().map(|f| f.len() - 5).sum();
    assert_eq!(carried, len);
}

#[test_case(0x6985, "USER_REJECTED")]
#[test_case(0x5515, "DEVICE_LOCKED")]
#[test_case(0x6511, "APP_NOT_OPEN")]
#[test_case(0x6F00, "SIGNING_FAILED")]
#[tokio::test]
async fn test_sign_status_mapping(status_word: u16, code: &str) {
    let (sim, driver) = connected().await;
    sim.script_status(status_word);
    let err = driver.sign(b"payload", &DerivationPath::default()).await.unwrap_err();
    assert_eq!(err.code(), code);

    // The session survives a device-side refusal.
    assert!(driver.is_connected());
    driver.sign(b"payload", &DerivationPath::default()).await.unwrap();
}

#[tokio::test]
async fn test_connect_failures() {
    let sim = SimulatedLedger::new(SEED);
    let driver = LedgerDriver::new(Arc::new(sim.clone()));

    sim.set_app_open(false);
    assert_eq!(driver.connect().await.unwrap_err().code(), "APP_NOT_OPEN");
    sim.set_app_open(true);

    sim.set_locked(true);
    assert_eq!(driver.connect().await.unwrap_err().code(), "DEVICE_LOCKED");
    sim.set_locked(false);

    sim.set_present(false);
    assert!(!driver.is_supported().await);
    assert_eq!(driver.connect().await.unwrap_err().code(), "DEVICE_NOT_CONNECTED");
    assert!(!driver.is_connected());
}

#[tokio::test]
async fn test_unplug_drops_session() {
    let (sim, driver) = connected().await;
    sim.set_present(false);
    let err = driver.sign(b"payload", &DerivationPath::default()).await.unwrap_err();
    assert_eq!(err.code(), "DEVICE_NOT_CONNECTED");
    assert!(!driver.is_connected());
}

#[tokio::test]
async fn test_concurrent_exchange_is_busy() {
    let (sim, driver) = connected().await;
    sim.set_delay(Duration::from_millis(100));
    let path = DerivationPath::default();

    let (first, second) = tokio::join!(driver.sign(b"one", &path), driver.sign(b"two", &path));
    assert!(first.is_ok());
    assert!(matches!(second, Err(CustodyError::Transport(ref d)) if d == "device busy"));

    // The slot is released afterwards.
    sim.set_delay(Duration::ZERO);
    driver.get_address(&path, false).await.unwrap();
}

#[tokio::test]
async fn test_operations_require_session() {
    let sim = SimulatedLedger::new(SEED);
    let driver = LedgerDriver::new(Arc::new(sim.clone()));
    let err = driver.get_address(&DerivationPath::default(), false).await.unwrap_err();
    assert_eq!(err.code(), "DEVICE_NOT_CONNECTED");
    assert_eq!(sim.exchange_count(), 0);
}
