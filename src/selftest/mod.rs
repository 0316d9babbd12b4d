//! Media-device reports.
//!
//! The embedding application owns device enumeration and permission prompts;
//! it hands the current picture over as a [`DeviceSnapshot`] and these helpers
//! turn it into camera, microphone and speaker reports on the result store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::report::TestReport;
use crate::storage::ResultStore;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInfo {
    pub device_id: String,
    pub label: String,
    #[serde(default)]
    pub selected: bool,
}

impl DeviceInfo {
    pub fn new(device_id: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            label: label.into(),
            selected: false,
        }
    }

    pub fn selected(mut self) -> Self {
        self.selected = true;
        self
    }
}

/// State of one input (camera or microphone) as seen by the application.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InputState {
    pub devices: Vec<DeviceInfo>,
    /// e.g. `granted`, `blocked`, `in-use`, `not-found`.
    pub state: Option<String>,
    #[serde(default)]
    pub has_error: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceSnapshot {
    pub camera: InputState,
    pub mic: InputState,
    pub speakers: Vec<DeviceInfo>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceReport {
    pub devices: Vec<DeviceInfo>,
    pub selected: Option<DeviceInfo>,
    pub state: Option<String>,
    pub has_error: bool,
    /// The device state when it is an error, else `None`.
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub id: Uuid,
}

impl DeviceReport {
    fn from_input(input: &InputState) -> Self {
        Self {
            error: if input.has_error { input.state.clone() } else { None },
            state: input.state.clone(),
            has_error: input.has_error,
            ..Self::from_devices(&input.devices)
        }
    }

    fn from_devices(devices: &[DeviceInfo]) -> Self {
        Self {
            devices: devices.to_vec(),
            selected: devices.iter().find(|d| d.selected).cloned(),
            state: None,
            has_error: false,
            error: None,
            started_at: Utc::now(),
            id: Uuid::new_v4(),
        }
    }

    pub fn summary(&self) -> String {
        let selected = self
            .selected
            .as_ref()
            .map(|d| d.label.as_str())
            .unwrap_or("none");
        match &self.error {
            Some(error) => format!("{} device(s), selected={}, error={}", self.devices.len(), selected, error),
            None => format!("{} device(s), selected={}", self.devices.len(), selected),
        }
    }
}

pub fn capture_camera_report(store: &ResultStore, snapshot: &DeviceSnapshot) {
    let report = DeviceReport::from_input(&snapshot.camera);
    info!(devices = report.devices.len(), has_error = report.has_error, "camera report captured");
    store.publish(TestReport::Camera(report));
}

pub fn capture_mic_report(store: &ResultStore, snapshot: &DeviceSnapshot) {
    let report = DeviceReport::from_input(&snapshot.mic);
    info!(devices = report.devices.len(), has_error = report.has_error, "mic report captured");
    store.publish(TestReport::Mic(report));
}

pub fn capture_speaker_report(store: &ResultStore, snapshot: &DeviceSnapshot) {
    let report = DeviceReport::from_devices(&snapshot.speakers);
    info!(devices = report.devices.len(), "speaker report captured");
    store.publish(TestReport::Speaker(report));
}

/// Capture all three device reports.
pub fn capture_all(store: &ResultStore, snapshot: &DeviceSnapshot) {
    capture_camera_report(store, snapshot);
    capture_mic_report(store, snapshot);
    capture_speaker_report(store, snapshot);
}
