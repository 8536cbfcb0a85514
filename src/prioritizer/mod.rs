//! Adapter priority arbitration
//!
//! Several adapters may report on the same physical device at once (a hub
//! over IPv4 and a Zigbee dongle, say). The prioritizer keeps a ranked list
//! of the adapters that have produced events for each external device id and
//! forwards only the events of the current head. When the head reports the
//! device deleted it is removed from the list, letting the next-ranked
//! adapter take over on its next update.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Mutex;

use tokio::sync::mpsc;

use crate::differ::DeviceUpdate;
use crate::error::{Error, Result};
use crate::types::ExternalDeviceID;

const OUTPUT_CHAN_CAP: usize = 100;

/// Transport families, ranked for prioritization. Lower rank wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AdapterKind {
    Zigbee,
    ZWave,
    Bluetooth,
    Ipv4,
    Aggregator,
}

impl AdapterKind {
    pub fn rank(&self) -> u8 {
        match self {
            AdapterKind::Zigbee => 1,
            AdapterKind::ZWave => 2,
            AdapterKind::Bluetooth => 3,
            AdapterKind::Ipv4 => 4,
            AdapterKind::Aggregator => 255,
        }
    }
}

/// Describes an adapter for the purpose of prioritization.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AdapterDescription {
    pub kind: AdapterKind,
    pub id: String,
}

/// Lexicographic comparator over descriptor fields.
pub type CompareFn = dyn Fn(&AdapterDescription, &AdapterDescription) -> Ordering + Send + Sync;

/// The default ordering: by kind rank ascending, then by id ascending.
pub fn compare_by_kind_then_id(a: &AdapterDescription, b: &AdapterDescription) -> Ordering {
    a.kind
        .rank()
        .cmp(&b.kind.rank())
        .then_with(|| a.id.cmp(&b.id))
}

/// Considers updates from adapters and forwards only those coming from the
/// highest-priority adapter currently reporting on each device.
pub struct Prioritizer {
    dest: mpsc::Sender<DeviceUpdate>,
    output_rx: Mutex<Option<mpsc::Receiver<DeviceUpdate>>>,
    compare: Box<CompareFn>,
    ranked: Mutex<HashMap<ExternalDeviceID, Vec<AdapterDescription>>>,
}

impl Prioritizer {
    /// Create a prioritizer with the given comparator, or the default
    /// kind-then-id ordering when `None`.
    pub fn new(compare: Option<Box<CompareFn>>) -> Self {
        let (dest, output_rx) = mpsc::channel(OUTPUT_CHAN_CAP);
        Self {
            dest,
            output_rx: Mutex::new(Some(output_rx)),
            compare: compare.unwrap_or_else(|| Box::new(compare_by_kind_then_id)),
            ranked: Mutex::new(HashMap::new()),
        }
    }

    /// Take the output channel. May be taken exactly once.
    pub fn take_output(&self) -> Option<mpsc::Receiver<DeviceUpdate>> {
        self.output_rx
            .lock()
            .expect("output_rx lock poisoned")
            .take()
    }

    /// Evaluate an adapter's event. Events from anything but the
    /// highest-priority adapter for the device are suppressed; a delete from
    /// the head removes it from the ranking so a lower-priority adapter can
    /// take over. The bounded output applies back-pressure to the caller.
    pub async fn consider(&self, desc: &AdapterDescription, update: DeviceUpdate) -> Result<()> {
        if desc.id.is_empty() {
            return Err(Error::InvalidArgument(
                "adapter description must contain a non-empty id".to_string(),
            ));
        }

        let forward = match &update {
            DeviceUpdate::Updated { id, .. } => self.note_update(desc, id),
            DeviceUpdate::Deleted { id } => self.note_delete(desc, id),
        };

        if forward {
            tracing::debug!(
                adapter_id = %desc.id,
                device_id = %update.id(),
                "forwarding event from highest-priority adapter"
            );
            if self.dest.send(update).await.is_err() {
                return Err(Error::Internal(
                    "prioritizer output channel closed".to_string(),
                ));
            }
        }
        Ok(())
    }

    /// Register desc for the device if unseen, then report whether it is the
    /// head of the ranking.
    fn note_update(&self, desc: &AdapterDescription, id: &ExternalDeviceID) -> bool {
        let mut ranked = self.ranked.lock().expect("ranked lock poisoned");
        let list = ranked.entry(id.clone()).or_default();
        if !list.contains(desc) {
            list.push(desc.clone());
            list.sort_by(|a, b| (self.compare)(a, b));
        }
        list.first() == Some(desc)
    }

    /// Remove desc from the device's ranking. The delete is forwarded only
    /// when the removed adapter was the head.
    fn note_delete(&self, desc: &AdapterDescription, id: &ExternalDeviceID) -> bool {
        let mut ranked = self.ranked.lock().expect("ranked lock poisoned");
        if let Some(list) = ranked.get_mut(id) {
            if let Some(pos) = list.iter().position(|d| d == desc) {
                list.remove(pos);
                if list.is_empty() {
                    ranked.remove(id);
                }
                return pos == 0;
            }
        }
        false
    }

    /// The id of the highest-priority adapter currently reporting on the
    /// device, or `None`.
    pub fn highest_priority_adapter_for_device(&self, id: &ExternalDeviceID) -> Option<String> {
        let ranked = self.ranked.lock().expect("ranked lock poisoned");
        ranked
            .get(id)
            .and_then(|list| list.first())
            .map(|desc| desc.id.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Device;

    fn desc(kind: AdapterKind, id: &str) -> AdapterDescription {
        AdapterDescription {
            kind,
            id: id.to_string(),
        }
    }

    fn ext(id: &str) -> ExternalDeviceID {
        ExternalDeviceID::new("acme", id)
    }

    fn updated(id: &str) -> DeviceUpdate {
        DeviceUpdate::Updated {
            id: ext(id),
            device: Device::default(),
        }
    }

    fn deleted(id: &str) -> DeviceUpdate {
        DeviceUpdate::Deleted { id: ext(id) }
    }

    #[tokio::test]
    async fn first_reporter_is_forwarded() {
        let p = Prioritizer::new(None);
        let mut out = p.take_output().unwrap();

        p.consider(&desc(AdapterKind::Ipv4, "a"), updated("dev"))
            .await
            .unwrap();
        assert_eq!(out.try_recv().unwrap(), updated("dev"));
    }

    #[tokio::test]
    async fn lower_priority_reporter_is_suppressed() {
        let p = Prioritizer::new(None);
        let mut out = p.take_output().unwrap();

        let ipv4 = desc(AdapterKind::Ipv4, "a");
        let aggregator = desc(AdapterKind::Aggregator, "b");
        p.consider(&ipv4, updated("dev")).await.unwrap();
        out.try_recv().unwrap();

        p.consider(&aggregator, updated("dev")).await.unwrap();
        assert!(out.try_recv().is_err());
        assert_eq!(
            p.highest_priority_adapter_for_device(&ext("dev")),
            Some("a".to_string())
        );
    }

    #[tokio::test]
    async fn higher_priority_reporter_takes_over() {
        let p = Prioritizer::new(None);
        let mut out = p.take_output().unwrap();

        let ipv4 = desc(AdapterKind::Ipv4, "a");
        let zigbee = desc(AdapterKind::Zigbee, "z");
        p.consider(&ipv4, updated("dev")).await.unwrap();
        out.try_recv().unwrap();

        // Zigbee outranks IPv4 and becomes the head immediately.
        p.consider(&zigbee, updated("dev")).await.unwrap();
        out.try_recv().unwrap();

        // The old head is now suppressed.
        p.consider(&ipv4, updated("dev")).await.unwrap();
        assert!(out.try_recv().is_err());
    }

    #[tokio::test]
    async fn delete_from_head_is_forwarded_and_promotes_next() {
        let p = Prioritizer::new(None);
        let mut out = p.take_output().unwrap();

        let first = desc(AdapterKind::Ipv4, "a");
        let second = desc(AdapterKind::Ipv4, "b");
        p.consider(&first, updated("dev")).await.unwrap();
        p.consider(&second, updated("dev")).await.unwrap();
        assert_eq!(out.try_recv().unwrap(), updated("dev"));
        assert!(out.try_recv().is_err()); // second was suppressed

        p.consider(&first, deleted("dev")).await.unwrap();
        assert_eq!(out.try_recv().unwrap(), deleted("dev"));

        // The previously suppressed adapter is now authoritative.
        p.consider(&second, updated("dev")).await.unwrap();
        assert_eq!(out.try_recv().unwrap(), updated("dev"));
        assert_eq!(
            p.highest_priority_adapter_for_device(&ext("dev")),
            Some("b".to_string())
        );
    }

    #[tokio::test]
    async fn delete_from_non_head_is_suppressed() {
        let p = Prioritizer::new(None);
        let mut out = p.take_output().unwrap();

        let first = desc(AdapterKind::Ipv4, "a");
        let second = desc(AdapterKind::Ipv4, "b");
        p.consider(&first, updated("dev")).await.unwrap();
        p.consider(&second, updated("dev")).await.unwrap();
        out.try_recv().unwrap();

        p.consider(&second, deleted("dev")).await.unwrap();
        assert!(out.try_recv().is_err());
        // and the head is unchanged
        assert_eq!(
            p.highest_priority_adapter_for_device(&ext("dev")),
            Some("a".to_string())
        );
    }

    #[tokio::test]
    async fn delete_from_unknown_adapter_is_ignored() {
        let p = Prioritizer::new(None);
        let mut out = p.take_output().unwrap();
        p.consider(&desc(AdapterKind::Ipv4, "ghost"), deleted("dev"))
            .await
            .unwrap();
        assert!(out.try_recv().is_err());
    }

    #[tokio::test]
    async fn empty_adapter_id_is_rejected() {
        let p = Prioritizer::new(None);
        let err = p
            .consider(&desc(AdapterKind::Ipv4, ""), updated("dev"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn unknown_device_has_no_highest_priority_adapter() {
        let p = Prioritizer::new(None);
        assert_eq!(p.highest_priority_adapter_for_device(&ext("nope")), None);
    }

    #[tokio::test]
    async fn custom_comparator_is_respected() {
        // Reverse ordering: highest id wins.
        let p = Prioritizer::new(Some(Box::new(|a, b| b.id.cmp(&a.id))));
        let mut out = p.take_output().unwrap();

        p.consider(&desc(AdapterKind::Ipv4, "a"), updated("dev"))
            .await
            .unwrap();
        out.try_recv().unwrap();
        p.consider(&desc(AdapterKind::Ipv4, "z"), updated("dev"))
            .await
            .unwrap();
        assert_eq!(out.try_recv().unwrap(), updated("dev"));
        assert_eq!(
            p.highest_priority_adapter_for_device(&ext("dev")),
            Some("z".to_string())
        );
    }
}
