//! A demo backend service used as a test fixture.
//!
//! Speaks the wire format of `sift::adapter::demo`: `GET /status` identifies
//! the server, `GET /devices` dumps every device, and posting a component to
//! `/devices/{device}/{component}` mutates backend state, which the adapter
//! observes on its next poll.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;

use sift::adapter::demo::{WireComponent, WireDevice, WireStatus, SERVER_TYPE_ALL_AT_ONCE};

/// An in-memory demo backend bound to one address.
#[derive(Clone, Default)]
pub struct DemoBackend {
    devices: Arc<RwLock<HashMap<String, WireDevice>>>,
}

impl DemoBackend {
    /// Bind the backend on `(bind_addr, 0)` and serve it. Returns the
    /// backend handle, the bound port, and the server task.
    pub async fn serve(bind_addr: &str) -> (DemoBackend, u16, JoinHandle<()>) {
        let backend = DemoBackend::default();
        let app = Router::new()
            .route("/status", get(status))
            .route("/devices", get(devices))
            .route("/devices/:device/:component", post(set_component))
            .with_state(backend.clone());

        let listener = tokio::net::TcpListener::bind((bind_addr, 0))
            .await
            .expect("fixture backend must bind");
        let port = listener.local_addr().unwrap().port();
        let task = tokio::spawn(async move {
            axum::serve(listener, app).await.expect("fixture backend crashed");
        });
        (backend, port, task)
    }

    pub async fn set_device(&self, id: &str, device: WireDevice) {
        self.devices.write().await.insert(id.to_string(), device);
    }

    pub async fn remove_device(&self, id: &str) {
        self.devices.write().await.remove(id);
    }
}

/// A device with a single light at the given output.
pub fn one_light_device(component_name: &str, output_in_percent: u8) -> WireDevice {
    let mut components = HashMap::new();
    components.insert(
        component_name.to_string(),
        WireComponent::Light(sift::adapter::demo::WireLight {
            is_on: output_in_percent > 0,
            output_in_percent,
        }),
    );
    WireDevice {
        name: None,
        components,
    }
}

async fn status() -> Json<WireStatus> {
    Json(WireStatus {
        server_type: SERVER_TYPE_ALL_AT_ONCE.to_string(),
    })
}

async fn devices(State(backend): State<DemoBackend>) -> Json<HashMap<String, WireDevice>> {
    Json(backend.devices.read().await.clone())
}

async fn set_component(
    State(backend): State<DemoBackend>,
    Path((device, component)): Path<(String, String)>,
    Json(body): Json<WireComponent>,
) -> StatusCode {
    let mut devices = backend.devices.write().await;
    match devices.get_mut(&device) {
        Some(d) => {
            d.components.insert(component, body);
            StatusCode::OK
        }
        None => StatusCode::NOT_FOUND,
    }
}
