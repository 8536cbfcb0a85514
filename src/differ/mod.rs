//! Whole-world snapshot differ
//!
//! Adapters hand the differ a complete snapshot of every device they can see.
//! The differ compares each snapshot against the last one it accepted and
//! emits incremental `Updated` / `Deleted` events: a device that is new or
//! structurally different is an update; a device present last time but
//! missing now has been deleted.

use std::collections::{BTreeMap, HashMap};

use tokio::sync::{mpsc, Mutex};

use crate::error::{Error, Result};
use crate::types::{Component, Device, ExternalDeviceID};

/// An incremental change to a single external device.
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceUpdate {
    /// The device is new or its state changed; `device` is the full new state.
    Updated {
        id: ExternalDeviceID,
        device: Device,
    },
    /// The device disappeared from its service.
    Deleted { id: ExternalDeviceID },
}

impl DeviceUpdate {
    pub fn id(&self) -> &ExternalDeviceID {
        match self {
            DeviceUpdate::Updated { id, .. } => id,
            DeviceUpdate::Deleted { id } => id,
        }
    }
}

struct DifferState {
    last_known: HashMap<ExternalDeviceID, Device>,
    dest: Option<mpsc::Sender<DeviceUpdate>>,
}

/// Compares successive full snapshots and emits incremental events.
///
/// The destination channel is set exactly once. `consider` holds the differ
/// lock through its sends, so `get_latest` is serialized against a snapshot
/// being applied.
pub struct Differ {
    state: Mutex<DifferState>,
}

impl Differ {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(DifferState {
                last_known: HashMap::new(),
                dest: None,
            }),
        }
    }

    /// Set the output destination channel. Fails if already set.
    pub async fn set_output(&self, dest: mpsc::Sender<DeviceUpdate>) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.dest.is_some() {
            return Err(Error::InvalidArgument(
                "differ output already set".to_string(),
            ));
        }
        state.dest = Some(dest);
        Ok(())
    }

    /// Consider a new full snapshot. Emits all updates, then all deletes,
    /// relative to the last accepted snapshot, and stores the new one.
    pub async fn consider(&self, snapshot: HashMap<ExternalDeviceID, Device>) {
        let mut state = self.state.lock().await;
        let dest = match &state.dest {
            Some(dest) => dest.clone(),
            None => {
                tracing::error!("differ has no output destination; dropping snapshot");
                return;
            }
        };

        let mut updates = Vec::new();
        for (id, device) in &snapshot {
            match state.last_known.get(id) {
                Some(last) if last == device => {}
                _ => updates.push(DeviceUpdate::Updated {
                    id: id.clone(),
                    device: device.clone(),
                }),
            }
        }

        let mut deletes = Vec::new();
        for id in state.last_known.keys() {
            if !snapshot.contains_key(id) {
                deletes.push(DeviceUpdate::Deleted { id: id.clone() });
            }
        }

        state.last_known = snapshot;

        for event in updates.into_iter().chain(deletes) {
            tracing::debug!(device_id = %event.id(), "differ emitting event");
            if dest.send(event).await.is_err() {
                tracing::debug!("differ output closed; dropping remaining events");
                return;
            }
        }
    }

    /// The latest-considered state of the device with the given id.
    pub async fn get_latest(&self, id: &ExternalDeviceID) -> Result<Device> {
        let state = self.state.lock().await;
        state
            .last_known
            .get(id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("no device with id {id}")))
    }
}

impl Default for Differ {
    fn default() -> Self {
        Self::new()
    }
}

/// The component-level difference between an old and a new version of one
/// device: names that are new or changed are upserted, names that vanished
/// are deleted, and `device_changed` reports a device-attribute change.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct DeviceDiff {
    pub upserted: BTreeMap<String, Component>,
    pub deleted: BTreeMap<String, Component>,
    pub device_changed: bool,
}

/// Diff two versions of a device in the context of `new` replacing `old`.
pub fn diff_device(old: &Device, new: &Device) -> DeviceDiff {
    let mut upserted = BTreeMap::new();
    for (name, component) in &new.components {
        match old.components.get(name) {
            Some(prev) if prev == component => {}
            _ => {
                upserted.insert(name.clone(), component.clone());
            }
        }
    }

    let mut deleted = BTreeMap::new();
    for (name, component) in &old.components {
        if !new.components.contains_key(name) {
            deleted.insert(name.clone(), component.clone());
        }
    }

    DeviceDiff {
        upserted,
        deleted,
        device_changed: old.name != new.name,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BaseComponent, LightEmitter, LightEmitterState};

    fn light(brightness: u8) -> Component {
        Component::LightEmitter(LightEmitter {
            base: BaseComponent {
                make: "demo".to_string(),
                model: "lamp_v1".to_string(),
            },
            state: LightEmitterState {
                brightness_in_percent: brightness,
            },
            specs: None,
            stats: None,
        })
    }

    fn device(brightness: u8) -> Device {
        let mut components = BTreeMap::new();
        components.insert("light1".to_string(), light(brightness));
        Device {
            name: None,
            is_online: true,
            components,
        }
    }

    fn ext(id: &str) -> ExternalDeviceID {
        ExternalDeviceID::new("demo", id)
    }

    async fn wired_differ() -> (Differ, mpsc::Receiver<DeviceUpdate>) {
        let differ = Differ::new();
        let (tx, rx) = mpsc::channel(100);
        differ.set_output(tx).await.unwrap();
        (differ, rx)
    }

    fn drain(rx: &mut mpsc::Receiver<DeviceUpdate>) -> Vec<DeviceUpdate> {
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            out.push(event);
        }
        out
    }

    #[tokio::test]
    async fn first_snapshot_emits_updates_for_every_device() {
        let (differ, mut rx) = wired_differ().await;
        let snapshot: HashMap<_, _> =
            [(ext("a"), device(10)), (ext("b"), device(20))].into();
        differ.consider(snapshot).await;

        let events = drain(&mut rx);
        assert_eq!(events.len(), 2);
        assert!(events
            .iter()
            .all(|e| matches!(e, DeviceUpdate::Updated { .. })));
    }

    #[tokio::test]
    async fn identical_snapshot_emits_nothing() {
        let (differ, mut rx) = wired_differ().await;
        let snapshot: HashMap<_, _> = [(ext("a"), device(10))].into();
        differ.consider(snapshot.clone()).await;
        drain(&mut rx);

        differ.consider(snapshot).await;
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn changed_device_emits_update_and_missing_emits_delete() {
        let (differ, mut rx) = wired_differ().await;
        differ
            .consider([(ext("a"), device(10)), (ext("b"), device(20))].into())
            .await;
        drain(&mut rx);

        // a changes, b disappears
        differ.consider([(ext("a"), device(50))].into()).await;
        let events = drain(&mut rx);
        assert_eq!(
            events,
            vec![
                DeviceUpdate::Updated {
                    id: ext("a"),
                    device: device(50)
                },
                DeviceUpdate::Deleted { id: ext("b") },
            ]
        );
    }

    #[tokio::test]
    async fn replaying_output_reconstructs_the_final_snapshot() {
        let (differ, mut rx) = wired_differ().await;
        let snapshots: Vec<HashMap<ExternalDeviceID, Device>> = vec![
            [(ext("a"), device(10))].into(),
            [(ext("a"), device(10)), (ext("b"), device(5))].into(),
            [(ext("b"), device(7)), (ext("c"), device(1))].into(),
        ];
        let last = snapshots.last().unwrap().clone();
        for snapshot in snapshots {
            differ.consider(snapshot).await;
        }

        let mut replayed: HashMap<ExternalDeviceID, Device> = HashMap::new();
        for event in drain(&mut rx) {
            match event {
                DeviceUpdate::Updated { id, device } => {
                    replayed.insert(id, device);
                }
                DeviceUpdate::Deleted { id } => {
                    replayed.remove(&id);
                }
            }
        }
        assert_eq!(replayed, last);
    }

    #[tokio::test]
    async fn set_output_twice_fails() {
        let differ = Differ::new();
        let (tx, _rx) = mpsc::channel(1);
        differ.set_output(tx.clone()).await.unwrap();
        assert!(matches!(
            differ.set_output(tx).await,
            Err(Error::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn consider_without_output_drops_silently() {
        let differ = Differ::new();
        differ.consider([(ext("a"), device(1))].into()).await;
        assert!(differ.get_latest(&ext("a")).await.is_err());
    }

    #[tokio::test]
    async fn get_latest_returns_last_considered_state() {
        let (differ, _rx) = wired_differ().await;
        differ.consider([(ext("a"), device(33))].into()).await;
        assert_eq!(differ.get_latest(&ext("a")).await.unwrap(), device(33));
        assert!(matches!(
            differ.get_latest(&ext("zzz")).await,
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn diff_device_reports_upserts_deletes_and_name_change() {
        let mut old = device(10);
        old.components.insert("gone".to_string(), light(1));
        let mut new = device(11);
        new.name = Some("renamed".to_string());
        new.components.insert("fresh".to_string(), light(2));

        let diff = diff_device(&old, &new);
        assert!(diff.upserted.contains_key("light1")); // changed
        assert!(diff.upserted.contains_key("fresh")); // new
        assert_eq!(diff.upserted.len(), 2);
        assert!(diff.deleted.contains_key("gone"));
        assert_eq!(diff.deleted.len(), 1);
        assert!(diff.device_changed);
    }

    #[test]
    fn diff_device_of_equal_devices_is_empty() {
        let diff = diff_device(&device(10), &device(10));
        assert!(diff.upserted.is_empty());
        assert!(diff.deleted.is_empty());
        assert!(!diff.device_changed);
    }
}
