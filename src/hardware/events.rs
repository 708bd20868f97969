//! Device lifecycle events.

use super::{DeviceHandle, DeviceType};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::debug;

/// Why a connect attempt failed, as shown to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ConnectionFailure {
    UserRejected,
    DeviceNotFound,
    AppNotOpen,
    Locked,
    Unknown,
}

impl ConnectionFailure {
    pub fn from_error(err: &crate::core::errors::CustodyError) -> Self {
        use crate::core::errors::CustodyError::*;
        match err {
            UserRejected(_) => ConnectionFailure::UserRejected,
            DeviceNotConnected(_) => ConnectionFailure::DeviceNotFound,
            AppNotOpen(_) => ConnectionFailure::AppNotOpen,
            DeviceLocked(_) => ConnectionFailure::Locked,
            _ => ConnectionFailure::Unknown,
        }
    }
}

/// Events emitted by the manager, in the order things happen.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum HardwareEvent {
    Connecting {
        device_type: DeviceType,
    },
    Connected {
        device: DeviceHandle,
    },
    Disconnected {
        device_type: DeviceType,
    },
    Signing {
        device_type: DeviceType,
        #[serde(serialize_with = "super::serialize_hex")]
        payload_hash: Vec<u8>,
    },
    Signed {
        #[serde(serialize_with = "super::serialize_hex")]
        payload_hash: Vec<u8>,
        timestamp: DateTime<Utc>,
    },
    Error {
        kind: Option<ConnectionFailure>,
        code: String,
        message: String,
    },
}

/// Broadcast bus for [`HardwareEvent`]s.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<HardwareEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish synchronously. Having no subscriber is not an error.
    pub fn publish(&self, event: HardwareEvent) {
        debug!("Hardware event: {:?}", event);
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<HardwareEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(64)
    }
}
