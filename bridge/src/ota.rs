// OTA 升级跟踪: 每个升级一个状态机

use chrono::{DateTime, Utc};
use iiot_shared::{
    generate_update_id, validate_device_id, validate_firmware_url, validate_firmware_version,
    FirmwareRef, OtaStatusReport,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::str::FromStr;
use tokio::sync::Mutex;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OtaStatus {
    Pending,
    Sent,
    Downloading,
    Installing,
    Success,
    Failed,
    Cancelled,
}

impl OtaStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OtaStatus::Pending => "pending",
            OtaStatus::Sent => "sent",
            OtaStatus::Downloading => "downloading",
            OtaStatus::Installing => "installing",
            OtaStatus::Success => "success",
            OtaStatus::Failed => "failed",
            OtaStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, OtaStatus::Success | OtaStatus::Failed | OtaStatus::Cancelled)
    }

    pub fn can_transition_to(&self, next: OtaStatus) -> bool {
        use OtaStatus::*;
        match (self, next) {
            (Pending, Sent | Failed | Cancelled) => true,
            (Sent, Downloading | Installing | Success | Failed | Cancelled) => true,
            // 进度更新允许重复上报同一状态
            (Downloading, Downloading | Installing | Success | Failed) => true,
            (Installing, Installing | Success | Failed) => true,
            _ => false,
        }
    }
}

impl fmt::Display for OtaStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OtaStatus {
    type Err = OtaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pending" => Ok(OtaStatus::Pending),
            "sent" => Ok(OtaStatus::Sent),
            "downloading" | "in_progress" => Ok(OtaStatus::Downloading),
            "installing" => Ok(OtaStatus::Installing),
            "success" | "completed" => Ok(OtaStatus::Success),
            "failed" | "error" => Ok(OtaStatus::Failed),
            "cancelled" => Ok(OtaStatus::Cancelled),
            other => Err(OtaError::UnknownStatus(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum OtaError {
    #[error("OTA update not found: {0}")]
    NotFound(String),

    #[error("Invalid OTA transition from {from} to {to}")]
    InvalidTransition { from: OtaStatus, to: OtaStatus },

    #[error("Unknown OTA status: {0}")]
    UnknownStatus(String),

    #[error("OTA update {update_id} does not belong to device {device_id}")]
    DeviceMismatch { update_id: String, device_id: String },

    #[error("No active OTA update for device {0}")]
    NoActiveUpdate(String),

    #[error("Invalid OTA request: {0}")]
    Invalid(String),

    #[error("OTA update {0} is being dispatched")]
    DispatchInProgress(String),
}

/// One firmware rollout to one device.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OtaUpdate {
    pub update_id: String,
    pub device_id: String,
    pub firmware: FirmwareRef,
    pub status: OtaStatus,
    pub progress: f64,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl OtaUpdate {
    pub fn new(device_id: &str, firmware: FirmwareRef, now: DateTime<Utc>) -> Self {
        Self {
            update_id: generate_update_id(),
            device_id: device_id.to_string(),
            firmware,
            status: OtaStatus::Pending,
            progress: 0.0,
            start_time: None,
            end_time: None,
            error_message: None,
            created_at: now,
        }
    }

    /// Move to `next`, keeping `end_time` set exactly when terminal.
    pub fn transition(&mut self, next: OtaStatus, now: DateTime<Utc>) -> Result<(), OtaError> {
        if !self.status.can_transition_to(next) {
            return Err(OtaError::InvalidTransition {
                from: self.status,
                to: next,
            });
        }

        if next == OtaStatus::Sent {
            self.start_time = Some(now);
        }
        if next == OtaStatus::Success {
            self.progress = 100.0;
        }
        if next.is_terminal() {
            self.end_time = Some(now);
        }
        self.status = next;
        Ok(())
    }

    pub fn set_progress(&mut self, progress: f64) {
        if progress.is_finite() {
            self.progress = progress.clamp(0.0, 100.0);
        }
    }

    pub fn fail(&mut self, message: impl Into<String>, now: DateTime<Utc>) -> Result<(), OtaError> {
        self.transition(OtaStatus::Failed, now)?;
        self.error_message = Some(message.into());
        Ok(())
    }

    /// Apply a device-side status report.
    pub fn apply_report(&mut self, report: &OtaStatusReport, now: DateTime<Utc>) -> Result<(), OtaError> {
        let next: OtaStatus = report.status.parse()?;
        if matches!(next, OtaStatus::Pending | OtaStatus::Sent | OtaStatus::Cancelled) {
            return Err(OtaError::InvalidTransition {
                from: self.status,
                to: next,
            });
        }

        self.transition(next, now)?;
        if let Some(progress) = report.progress {
            if next != OtaStatus::Success {
                self.set_progress(progress);
            }
        }
        if next == OtaStatus::Failed {
            self.error_message = Some(
                report
                    .error
                    .clone()
                    .unwrap_or_else(|| "Device reported failure".to_string()),
            );
        }
        Ok(())
    }

    /// Payload published on the device command topic when dispatched.
    pub fn dispatch_payload(&self) -> Value {
        json!({
            "command": "ota_update",
            "update_id": self.update_id,
            "firmware_url": self.firmware.url,
            "checksum": self.firmware.checksum,
            "version": self.firmware.version,
        })
    }
}

#[derive(Default)]
struct Registry {
    updates: HashMap<String, OtaUpdate>,
    // 正在发布 ota_update 命令的更新, 期间不允许取消
    dispatching: HashSet<String>,
}

// 失败的变更不留下半修改的状态
fn apply_change<F>(
    updates: &mut HashMap<String, OtaUpdate>,
    update_id: &str,
    change: F,
) -> Result<OtaUpdate, OtaError>
where
    F: FnOnce(&mut OtaUpdate) -> Result<(), OtaError>,
{
    let update = updates
        .get_mut(update_id)
        .ok_or_else(|| OtaError::NotFound(update_id.to_string()))?;

    let mut candidate = update.clone();
    change(&mut candidate)?;
    *update = candidate.clone();
    Ok(candidate)
}

/// In-memory registry of OTA updates.
pub struct OtaTracker {
    registry: Mutex<Registry>,
}

impl Default for OtaTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl OtaTracker {
    pub fn new() -> Self {
        Self {
            registry: Mutex::new(Registry::default()),
        }
    }

    pub async fn schedule(&self, device_id: &str, firmware: FirmwareRef) -> Result<OtaUpdate, OtaError> {
        if !validate_device_id(device_id) {
            return Err(OtaError::Invalid(format!("invalid device id '{}'", device_id)));
        }
        if !validate_firmware_version(&firmware.version) {
            return Err(OtaError::Invalid(format!(
                "invalid firmware version '{}'",
                firmware.version
            )));
        }
        if !validate_firmware_url(&firmware.url) {
            return Err(OtaError::Invalid(format!("invalid firmware url '{}'", firmware.url)));
        }

        let update = OtaUpdate::new(device_id, firmware, Utc::now());
        info!(
            "Scheduled OTA update {} ({}) for {}",
            update.update_id, update.firmware.version, device_id
        );

        self.registry
            .lock()
            .await
            .updates
            .insert(update.update_id.clone(), update.clone());
        Ok(update)
    }

    pub async fn get(&self, update_id: &str) -> Option<OtaUpdate> {
        self.registry.lock().await.updates.get(update_id).cloned()
    }

    pub async fn list_for_device(&self, device_id: &str) -> Vec<OtaUpdate> {
        let mut updates: Vec<OtaUpdate> = self
            .registry
            .lock()
            .await
            .updates
            .values()
            .filter(|u| u.device_id == device_id)
            .cloned()
            .collect();
        updates.sort_by_key(|u| u.created_at);
        updates
    }

    async fn modify<F>(&self, update_id: &str, change: F) -> Result<OtaUpdate, OtaError>
    where
        F: FnOnce(&mut OtaUpdate) -> Result<(), OtaError>,
    {
        let mut registry = self.registry.lock().await;
        apply_change(&mut registry.updates, update_id, change)
    }

    /// Claim a pending update for dispatch.
    ///
    /// The update moves to `sent` before anything is published, so a second
    /// dispatch is refused and a cancel waits for `finish_dispatch`.
    pub async fn begin_dispatch(&self, update_id: &str) -> Result<OtaUpdate, OtaError> {
        let mut registry = self.registry.lock().await;
        let update = apply_change(&mut registry.updates, update_id, |u| {
            u.transition(OtaStatus::Sent, Utc::now())
        })?;
        registry.dispatching.insert(update_id.to_string());
        Ok(update)
    }

    /// Release the dispatch claim; a publish error fails the update.
    pub async fn finish_dispatch(
        &self,
        update_id: &str,
        publish_error: Option<&str>,
    ) -> Result<OtaUpdate, OtaError> {
        let mut registry = self.registry.lock().await;
        registry.dispatching.remove(update_id);

        match publish_error {
            Some(message) => {
                let update = apply_change(&mut registry.updates, update_id, |u| u.fail(message, Utc::now()))?;
                warn!("OTA update {} failed: {}", update_id, message);
                Ok(update)
            }
            None => {
                let update = registry
                    .updates
                    .get(update_id)
                    .cloned()
                    .ok_or_else(|| OtaError::NotFound(update_id.to_string()))?;
                info!("OTA update {} sent to {}", update_id, update.device_id);
                Ok(update)
            }
        }
    }

    pub async fn cancel(&self, update_id: &str) -> Result<OtaUpdate, OtaError> {
        let mut registry = self.registry.lock().await;
        if registry.dispatching.contains(update_id) {
            return Err(OtaError::DispatchInProgress(update_id.to_string()));
        }

        let update = apply_change(&mut registry.updates, update_id, |u| {
            u.transition(OtaStatus::Cancelled, Utc::now())
        })?;
        info!("OTA update {} cancelled", update_id);
        Ok(update)
    }

    /// Forget finished updates that ended at or before `cutoff`.
    pub async fn prune_finished(&self, cutoff: DateTime<Utc>) -> usize {
        let mut registry = self.registry.lock().await;
        let before = registry.updates.len();
        registry
            .updates
            .retain(|_, u| !u.status.is_terminal() || u.end_time.map_or(true, |end| end > cutoff));

        let removed = before - registry.updates.len();
        if removed > 0 {
            info!("Pruned {} finished OTA updates", removed);
        }
        removed
    }

    /// Apply a status report from `device_id`.
    ///
    /// Without an `update_id` the report goes to the device's newest
    /// non-terminal update that has already been sent.
    pub async fn apply_device_report(
        &self,
        device_id: &str,
        report: &OtaStatusReport,
    ) -> Result<OtaUpdate, OtaError> {
        let update_id = match &report.update_id {
            Some(update_id) => {
                let owner = self
                    .get(update_id)
                    .await
                    .ok_or_else(|| OtaError::NotFound(update_id.clone()))?
                    .device_id;
                if owner != device_id {
                    return Err(OtaError::DeviceMismatch {
                        update_id: update_id.clone(),
                        device_id: device_id.to_string(),
                    });
                }
                update_id.clone()
            }
            None => self
                .list_for_device(device_id)
                .await
                .into_iter()
                .rev()
                .find(|u| !u.status.is_terminal() && u.status != OtaStatus::Pending)
                .map(|u| u.update_id)
                .ok_or_else(|| OtaError::NoActiveUpdate(device_id.to_string()))?,
        };

        let update = self
            .modify(&update_id, |u| u.apply_report(report, Utc::now()))
            .await?;
        info!(
            "OTA update {} for {} now {} ({:.0}%)",
            update.update_id, device_id, update.status, update.progress
        );
        Ok(update)
    }
}
