//! Filtered notification pub/sub
//!
//! ## Responsibilities
//!
//! - Hand subscribers a bounded notification channel, optionally narrowed by
//!   component / device filters and an actions mask
//! - Index subscribers so posts touch only the channels that can match
//! - Authorize every delivery against the subscriber's login token
//!
//! Posting never blocks: a full subscriber channel drops the notification
//! with a warning. Dropping (or unlistening) a `Subscription` removes all of
//! its index entries and closes its channel.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock, Weak};

use tokio::sync::mpsc;
use uuid::Uuid;

use crate::auth::{Authorizor, Token};
use crate::types::{Component, ComponentID, ComponentKind, Device, DeviceID};

/// Capacity of each subscriber's notification channel.
const CHAN_CAP: usize = 100;

/// Actions which may trigger a notification, as a bitmask. A zero mask
/// means "all actions".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ActionsMask(pub u8);

impl ActionsMask {
    pub const ALL: ActionsMask = ActionsMask(0);
    pub const CREATE: ActionsMask = ActionsMask(1);
    pub const UPDATE: ActionsMask = ActionsMask(2);
    pub const DELETE: ActionsMask = ActionsMask(4);
    pub const MOVED: ActionsMask = ActionsMask(8);

    /// Whether a filter with this mask accepts the posted action.
    pub fn accepts(self, action: ActionsMask) -> bool {
        self.0 == 0 || self.0 & action.0 != 0
    }
}

impl std::ops::BitOr for ActionsMask {
    type Output = ActionsMask;
    fn bitor(self, rhs: ActionsMask) -> ActionsMask {
        ActionsMask(self.0 | rhs.0)
    }
}

/// Selects notifications for specific components. Empty fields mean
/// "don't care"; an id takes precedence over a kind.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ComponentFilter {
    pub id: Option<ComponentID>,
    pub kind: Option<ComponentKind>,
    pub actions: ActionsMask,
}

/// Selects notifications for specific devices.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeviceFilter {
    pub id: Option<DeviceID>,
    pub actions: ActionsMask,
}

/// A subscription filter.
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    Component(ComponentFilter),
    Device(DeviceFilter),
}

impl Filter {
    /// Match any component event.
    pub fn components() -> Filter {
        Filter::Component(ComponentFilter::default())
    }

    /// Match any device event.
    pub fn devices() -> Filter {
        Filter::Device(DeviceFilter::default())
    }

    /// Parse a string shorthand ("components") into a filter.
    pub fn parse(s: &str) -> Option<Filter> {
        match s {
            "components" => Some(Filter::components()),
            _ => None,
        }
    }
}

/// A change to a single component.
#[derive(Debug, Clone, PartialEq)]
pub struct ComponentNotification {
    pub id: ComponentID,
    pub component: Component,
    pub action: ActionsMask,
}

/// A change to a single device.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceNotification {
    pub id: DeviceID,
    pub device: Device,
    pub action: ActionsMask,
}

/// What subscribers receive.
#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    Component(ComponentNotification),
    Device(DeviceNotification),
}

struct Subscriber {
    token: Token,
    tx: mpsc::Sender<Notification>,
}

#[derive(Default)]
struct Indexes {
    subscribers: HashMap<Uuid, Subscriber>,

    /// Listeners with no filters at all: every notification matches.
    all_listeners: HashMap<Uuid, ActionsMask>,

    component_by_id: HashMap<ComponentID, HashMap<Uuid, ActionsMask>>,
    component_by_kind: HashMap<ComponentKind, HashMap<Uuid, ActionsMask>>,
    unfiltered_component: HashMap<Uuid, ActionsMask>,

    device_by_id: HashMap<DeviceID, HashMap<Uuid, ActionsMask>>,
    unfiltered_device: HashMap<Uuid, ActionsMask>,
}

impl Indexes {
    fn remove(&mut self, id: &Uuid) {
        self.subscribers.remove(id);
        self.all_listeners.remove(id);
        self.unfiltered_component.remove(id);
        self.unfiltered_device.remove(id);
        self.component_by_id.retain(|_, subs| {
            subs.remove(id);
            !subs.is_empty()
        });
        self.component_by_kind.retain(|_, subs| {
            subs.remove(id);
            !subs.is_empty()
        });
        self.device_by_id.retain(|_, subs| {
            subs.remove(id);
            !subs.is_empty()
        });
    }
}

/// A live subscription. Receive with `recv`; dropping the subscription (or
/// calling `unlisten`) removes its index entries and closes the channel.
pub struct Subscription {
    id: Uuid,
    indexes: Weak<RwLock<Indexes>>,
    receiver: mpsc::Receiver<Notification>,
}

impl Subscription {
    /// The next notification, or None once the subscription is closed.
    pub async fn recv(&mut self) -> Option<Notification> {
        self.receiver.recv().await
    }

    /// A notification if one is immediately available.
    pub fn try_recv(&mut self) -> Option<Notification> {
        self.receiver.try_recv().ok()
    }

    /// Remove this subscription from the notifier.
    pub fn unlisten(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(indexes) = self.indexes.upgrade() {
            indexes
                .write()
                .expect("notifier indexes lock poisoned")
                .remove(&self.id);
            tracing::debug!(subscription_id = %self.id, "subscription removed");
        }
    }
}

/// The notification hub: registers subscribers and fans out posts.
pub struct Notifier {
    authorizor: Arc<dyn Authorizor>,
    indexes: Arc<RwLock<Indexes>>,
}

impl Notifier {
    pub fn new(authorizor: Arc<dyn Authorizor>) -> Self {
        Self {
            authorizor,
            indexes: Arc::new(RwLock::new(Indexes::default())),
        }
    }

    /// Create a notification channel for the holder of `token`. With one or
    /// more filters only matching notifications are delivered; with none,
    /// everything is.
    pub fn listen(&self, token: Token, filters: Vec<Filter>) -> Subscription {
        let (tx, receiver) = mpsc::channel(CHAN_CAP);
        let id = Uuid::new_v4();

        let mut indexes = self.indexes.write().expect("notifier indexes lock poisoned");
        indexes.subscribers.insert(id, Subscriber { token, tx });

        if filters.is_empty() {
            indexes.all_listeners.insert(id, ActionsMask::ALL);
        }
        for filter in filters {
            match filter {
                Filter::Component(f) => {
                    // Index under the most specific part of the filter.
                    if let Some(component_id) = f.id {
                        indexes
                            .component_by_id
                            .entry(component_id)
                            .or_default()
                            .insert(id, f.actions);
                    } else if let Some(kind) = f.kind {
                        indexes
                            .component_by_kind
                            .entry(kind)
                            .or_default()
                            .insert(id, f.actions);
                    } else {
                        indexes.unfiltered_component.insert(id, f.actions);
                    }
                }
                Filter::Device(f) => {
                    if let Some(device_id) = f.id {
                        indexes
                            .device_by_id
                            .entry(device_id)
                            .or_default()
                            .insert(id, f.actions);
                    } else {
                        indexes.unfiltered_device.insert(id, f.actions);
                    }
                }
            }
        }

        tracing::debug!(subscription_id = %id, "subscriber registered");
        Subscription {
            id,
            indexes: Arc::downgrade(&self.indexes),
            receiver,
        }
    }

    /// Notify matching, authorized listeners of a change to a component.
    pub fn post_component(&self, id: &ComponentID, component: &Component, action: ActionsMask) {
        let indexes = self.indexes.read().expect("notifier indexes lock poisoned");

        let mut matched: HashSet<Uuid> = HashSet::new();
        if let Some(subs) = indexes.component_by_id.get(id) {
            collect_matching(&mut matched, subs, action);
        }
        if let Some(subs) = indexes.component_by_kind.get(&component.kind()) {
            collect_matching(&mut matched, subs, action);
        }
        collect_matching(&mut matched, &indexes.unfiltered_component, action);
        collect_matching(&mut matched, &indexes.all_listeners, action);

        let resource = format!("components:{}:{}", component.kind(), id);
        let notification = Notification::Component(ComponentNotification {
            id: id.clone(),
            component: component.clone(),
            action,
        });
        self.deliver(&indexes, &matched, &resource, notification);
    }

    /// Notify matching, authorized listeners of a change to a device.
    pub fn post_device(&self, id: DeviceID, device: &Device, action: ActionsMask) {
        let indexes = self.indexes.read().expect("notifier indexes lock poisoned");

        let mut matched: HashSet<Uuid> = HashSet::new();
        if let Some(subs) = indexes.device_by_id.get(&id) {
            collect_matching(&mut matched, subs, action);
        }
        collect_matching(&mut matched, &indexes.unfiltered_device, action);
        collect_matching(&mut matched, &indexes.all_listeners, action);

        let resource = format!("devices:{id}");
        let notification = Notification::Device(DeviceNotification {
            id,
            device: device.clone(),
            action,
        });
        self.deliver(&indexes, &matched, &resource, notification);
    }

    /// Post to each matched channel after an authorization check. `try_send`
    /// is atomic per channel, so concurrent posts cannot interleave into the
    /// bounded buffer; a full channel drops the notification with a warning.
    fn deliver(
        &self,
        indexes: &Indexes,
        matched: &HashSet<Uuid>,
        resource: &str,
        notification: Notification,
    ) {
        for sub_id in matched {
            let subscriber = match indexes.subscribers.get(sub_id) {
                Some(s) => s,
                None => continue,
            };
            if !self.authorizor.authorize(&subscriber.token, resource) {
                tracing::debug!(subscription_id = %sub_id, resource = %resource, "delivery not authorized");
                continue;
            }
            match subscriber.tx.try_send(notification.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    tracing::warn!(
                        subscription_id = %sub_id,
                        "dropping notification: subscriber channel is full"
                    );
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {}
            }
        }
    }

    #[cfg(test)]
    fn subscriber_count(&self) -> usize {
        self.indexes
            .read()
            .expect("notifier indexes lock poisoned")
            .subscribers
            .len()
    }
}

fn collect_matching(
    matched: &mut HashSet<Uuid>,
    subs: &HashMap<Uuid, ActionsMask>,
    action: ActionsMask,
) {
    for (id, mask) in subs {
        if mask.accepts(action) {
            matched.insert(*id);
        }
    }
}
