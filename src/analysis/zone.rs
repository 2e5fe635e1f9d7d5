use std::fmt;

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use super::AlertMode;
use crate::remote::AnalysisResponse;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ZoneStatus {
    Safe,
    Alert,
}

impl fmt::Display for ZoneStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ZoneStatus::Safe => write!(f, "safe"),
            ZoneStatus::Alert => write!(f, "alert"),
        }
    }
}

/// Static description of the monitored zone
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ZoneConfig {
    pub id: u32,
    pub name: String,
    pub area: String,
}

impl Default for ZoneConfig {
    fn default() -> Self {
        Self {
            id: 1,
            name: "Building A 1F".to_string(),
            area: "Press area".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ZoneRecord {
    pub id: u32,
    pub name: String,
    pub area: String,
    pub status: ZoneStatus,
    /// Time of the most recent dangerous verdict
    pub last_detection: Option<DateTime<Local>>,
    /// Most recent successful inference response
    pub last_inference: Option<AnalysisResponse>,
}

impl ZoneRecord {
    pub fn new(config: &ZoneConfig) -> Self {
        Self {
            id: config.id,
            name: config.name.clone(),
            area: config.area.clone(),
            status: ZoneStatus::Safe,
            last_detection: None,
            last_inference: None,
        }
    }
}

/// Write side of the zone state. There is exactly one of these per zone,
/// owned by the analysis scheduler; everyone else holds a reader.
pub struct ZoneStatusStore {
    tx: watch::Sender<ZoneRecord>,
}

impl ZoneStatusStore {
    pub fn new(record: ZoneRecord) -> Self {
        let (tx, _rx) = watch::channel(record);
        Self { tx }
    }

    pub fn reader(&self) -> ZoneStatusReader {
        ZoneStatusReader {
            rx: self.tx.subscribe(),
        }
    }

    pub fn snapshot(&self) -> ZoneRecord {
        self.tx.borrow().clone()
    }

    /// Fold one successful inference response into the zone.
    ///
    /// A dangerous verdict raises the alert and stamps `last_detection`.
    /// A safe verdict clears the alert unless the mode is `Latch`.
    pub fn apply(
        &self,
        response: &AnalysisResponse,
        at: DateTime<Local>,
        mode: AlertMode,
    ) -> ZoneStatus {
        let mut status = ZoneStatus::Safe;
        self.tx.send_modify(|zone| {
            if response.is_dangerous {
                zone.status = ZoneStatus::Alert;
                zone.last_detection = Some(at);
            } else if mode == AlertMode::Follow {
                zone.status = ZoneStatus::Safe;
            }
            zone.last_inference = Some(response.clone());
            status = zone.status;
        });
        status
    }

    /// Clear a standing alert. `last_detection` is kept.
    /// Returns whether the status changed.
    pub fn acknowledge(&self) -> bool {
        self.tx.send_if_modified(|zone| {
            if zone.status == ZoneStatus::Alert {
                zone.status = ZoneStatus::Safe;
                true
            } else {
                false
            }
        })
    }
}

/// Read-only, cloneable view of a zone
#[derive(Clone)]
pub struct ZoneStatusReader {
    rx: watch::Receiver<ZoneRecord>,
}

impl ZoneStatusReader {
    pub fn snapshot(&self) -> ZoneRecord {
        self.rx.borrow().clone()
    }

    pub fn status(&self) -> ZoneStatus {
        self.rx.borrow().status
    }

    /// Wait for the next change. Returns false once the store is gone.
    pub async fn changed(&mut self) -> bool {
        self.rx.changed().await.is_ok()
    }
}
