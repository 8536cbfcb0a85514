//! End-to-end tests: a real server discovering, persisting, and controlling
//! demo backend fixtures over loopback.

mod support;

use std::sync::Arc;
use std::time::Duration;

use sift::adapter::demo::DemoFactory;
use sift::notif::{
    ActionsMask, ComponentFilter, ComponentNotification, Filter, Notification, Subscription,
};
use sift::scanner::{Ipv4Net, ScanTargets};
use sift::store::{Expansion, Store};
use sift::types::{Component, ComponentID, DeviceID, Intent};
use sift::{Error, Server, ServerConfig};

use support::{one_light_device, DemoBackend};

const WAIT: Duration = Duration::from_secs(20);
const POLL_PERIOD: Duration = Duration::from_millis(300);

fn test_config(dir: &tempfile::TempDir, targets: &[&str]) -> ServerConfig {
    ServerConfig {
        db_path: dir.path().join("sift.db"),
        scan_period: Duration::from_millis(200),
        probe_timeout: Duration::from_millis(500),
        scan_targets: ScanTargets::Networks(
            targets.iter().map(|t| Ipv4Net::parse(t).unwrap()).collect(),
        ),
        ..ServerConfig::default()
    }
}

async fn next_component(subscription: &mut Subscription) -> ComponentNotification {
    let deadline = tokio::time::Instant::now() + WAIT;
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        match tokio::time::timeout(remaining, subscription.recv()).await {
            Ok(Some(Notification::Component(notification))) => return notification,
            Ok(Some(_)) => continue,
            Ok(None) => panic!("subscription closed while waiting for a component notification"),
            Err(_) => panic!("timed out waiting for a component notification"),
        }
    }
}

fn brightness(notification: &ComponentNotification) -> u8 {
    match &notification.component {
        Component::LightEmitter(le) => le.state.brightness_in_percent,
        other => panic!("expected a light emitter, got {other:?}"),
    }
}

#[tokio::test]
async fn empty_world_has_no_devices_and_rejects_intents() {
    let dir = tempfile::tempdir().unwrap();
    let server = Server::new(test_config(&dir, &["127.0.0.1"])).await.unwrap();
    tokio::spawn(server.clone().serve());

    assert!(server.get_devices(Expansion::NONE).await.unwrap().is_empty());
    assert!(server
        .get_components(Expansion::NONE)
        .await
        .unwrap()
        .is_empty());

    let err = server
        .enact_intent(
            ComponentID::new(DeviceID(1), "light1"),
            Intent::SetLightEmitter {
                brightness_in_percent: 50,
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NotFound(_)), "got {err:?}");

    server.stop_and_wait(Duration::from_secs(60)).await.unwrap();
}

#[tokio::test]
async fn single_adapter_lifecycle_syncs_state_both_ways() {
    let (backend, port, _backend_task) = DemoBackend::serve("127.0.0.1").await;
    backend
        .set_device("device1", one_light_device("light1", 100))
        .await;

    let dir = tempfile::tempdir().unwrap();
    let server = Server::new(test_config(&dir, &["127.0.0.1"])).await.unwrap();
    server.add_adapter_factory(Arc::new(DemoFactory::with_poll_period(port, POLL_PERIOD)));

    let token = server.login();
    let mut subscription = server.listen(
        token,
        vec![Filter::Component(ComponentFilter::default())],
    );
    tokio::spawn(server.clone().serve());

    // The fixture's light arrives as a creation at 100%.
    let notification = next_component(&mut subscription).await;
    assert_eq!(notification.action, ActionsMask::CREATE);
    assert_eq!(brightness(&notification), 100);

    let components = server.get_components(Expansion::NONE).await.unwrap();
    assert_eq!(components.len(), 1);
    let (component_id, _) = components.into_iter().next().unwrap();
    assert_eq!(component_id.name, "light1");

    // The intent flows back to the backend; the next poll reflects 42.
    server
        .enact_intent(
            component_id.clone(),
            Intent::SetLightEmitter {
                brightness_in_percent: 42,
            },
        )
        .await
        .unwrap();
    let notification = next_component(&mut subscription).await;
    assert_eq!(notification.action, ActionsMask::UPDATE);
    assert_eq!(brightness(&notification), 42);

    // Specs join in from the preloaded catalog.
    let components = server.get_components(Expansion::SPECS).await.unwrap();
    match &components[&component_id] {
        Component::LightEmitter(le) => {
            let specs = le.specs.as_ref().expect("catalog specs should expand");
            assert_eq!(specs.max_output_in_lumens, 700);
        }
        other => panic!("expected a light emitter, got {other:?}"),
    }

    // Shutdown marks every device offline and releases the store file.
    server.stop_and_wait(Duration::from_secs(60)).await.unwrap();
    let store = Store::open(&dir.path().join("sift.db")).await.unwrap();
    let devices = store.get_devices(Expansion::NONE).await.unwrap();
    assert!(!devices.is_empty());
    assert!(devices.values().all(|d| !d.is_online));
}

#[tokio::test]
async fn removing_a_device_from_the_backend_emits_deletes() {
    let (backend, port, _backend_task) = DemoBackend::serve("127.0.0.1").await;
    backend
        .set_device("device1", one_light_device("light1", 10))
        .await;

    let dir = tempfile::tempdir().unwrap();
    let server = Server::new(test_config(&dir, &["127.0.0.1"])).await.unwrap();
    server.add_adapter_factory(Arc::new(DemoFactory::with_poll_period(port, POLL_PERIOD)));

    let token = server.login();
    // No filters: both component and device notifications arrive.
    let mut subscription = server.listen(token, vec![]);
    tokio::spawn(server.clone().serve());

    let created = next_component(&mut subscription).await;
    assert_eq!(created.action, ActionsMask::CREATE);

    backend.remove_device("device1").await;

    let mut saw_component_delete = false;
    let mut saw_device_delete = false;
    let deadline = tokio::time::Instant::now() + WAIT;
    while !(saw_component_delete && saw_device_delete) {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        match tokio::time::timeout(remaining, subscription.recv()).await {
            Ok(Some(Notification::Component(n))) if n.action == ActionsMask::DELETE => {
                saw_component_delete = true;
            }
            Ok(Some(Notification::Device(n))) if n.action == ActionsMask::DELETE => {
                saw_device_delete = true;
            }
            Ok(Some(_)) => {}
            Ok(None) => panic!("subscription closed while waiting for deletes"),
            Err(_) => panic!("timed out waiting for delete notifications"),
        }
    }

    assert!(server.get_devices(Expansion::NONE).await.unwrap().is_empty());
    server.stop_and_wait(Duration::from_secs(60)).await.unwrap();
}

#[tokio::test]
async fn priority_arbitration_forwards_one_adapter_and_promotes_on_delete() {
    // Two backends on distinct loopback addresses report the same external
    // device id with identical state.
    let (backend_a, port_a, _task_a) = DemoBackend::serve("127.0.0.1").await;
    let (backend_b, port_b, _task_b) = DemoBackend::serve("127.0.0.2").await;
    backend_a
        .set_device("shared", one_light_device("lamp", 80))
        .await;
    backend_b
        .set_device("shared", one_light_device("lamp", 80))
        .await;

    let dir = tempfile::tempdir().unwrap();
    let server = Server::new(test_config(&dir, &["127.0.0.1", "127.0.0.2"]))
        .await
        .unwrap();
    server.add_adapter_factory(Arc::new(DemoFactory::with_poll_period(port_a, POLL_PERIOD)));
    server.add_adapter_factory(Arc::new(DemoFactory::with_poll_period(port_b, POLL_PERIOD)));

    let token = server.login();
    let mut subscription = server.listen(
        token,
        vec![Filter::Component(ComponentFilter::default())],
    );
    tokio::spawn(server.clone().serve());

    // Exactly one creation reaches subscribers despite two reporters.
    let created = next_component(&mut subscription).await;
    assert_eq!(created.action, ActionsMask::CREATE);
    assert_eq!(brightness(&created), 80);

    // Identical updates from the suppressed adapter produce nothing more.
    tokio::time::sleep(POLL_PERIOD * 5).await;
    assert!(
        subscription.try_recv().is_none(),
        "identical state from the second adapter must be suppressed"
    );
    assert_eq!(server.get_components(Expansion::NONE).await.unwrap().len(), 1);

    // Both adapters drop the device: subscribers see one delete.
    backend_a.remove_device("shared").await;
    backend_b.remove_device("shared").await;
    let deleted = next_component(&mut subscription).await;
    assert_eq!(deleted.action, ActionsMask::DELETE);

    // Only B re-reports the device; the previously suppressed adapter is
    // now authoritative and its state reaches subscribers.
    backend_b
        .set_device("shared", one_light_device("lamp", 55))
        .await;
    let recreated = next_component(&mut subscription).await;
    assert_eq!(recreated.action, ActionsMask::CREATE);
    assert_eq!(brightness(&recreated), 55);

    server.stop_and_wait(Duration::from_secs(60)).await.unwrap();
}
