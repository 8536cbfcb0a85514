//! Driver for the demo backend service
//!
//! The demo service is a small JSON-over-HTTP hub: `GET /status` identifies
//! the server, `GET /devices` returns every device it knows, and posting a
//! component to `/devices/{device}/{component}` changes real state. Its data
//! model is deliberately different from SIFT's, so this driver shows the
//! full translate-poll-diff cycle in miniature. The in-repo test fixture
//! speaks the same wire format.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};

use crate::adapter::{
    Adapter, AdapterFactory, AdapterStatus, ServiceContext, UPDATE_CHAN_CAP,
};
use crate::differ::{DeviceUpdate, Differ};
use crate::error::{Error, Result};
use crate::scanner::ServiceDescription;
use crate::types::{
    BaseComponent, Component, Device, ExternalComponentID, ExternalDeviceID, Intent, LightEmitter,
    LightEmitterState,
};

/// The manufacturer recorded for devices discovered through this driver.
pub const MANUFACTURER: &str = "demo";

/// Catalog identity of the demo lamp model.
pub const LIGHT_MAKE: &str = "demo";
pub const LIGHT_MODEL: &str = "lamp_v1";

/// The status document's type value identifying a demo service.
pub const SERVER_TYPE_ALL_AT_ONCE: &str = "all_at_once";

const DEFAULT_POLL_PERIOD: Duration = Duration::from_secs(5);
const HEARTBEAT_PERIOD: Duration = Duration::from_secs(5);
const HTTP_TIMEOUT: Duration = Duration::from_secs(5);

/// Status document served at `/status`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireStatus {
    #[serde(rename = "type")]
    pub server_type: String,
}

/// A device as the demo service represents it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WireDevice {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub components: HashMap<String, WireComponent>,
}

/// A component as the demo service represents it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WireComponent {
    Light(WireLight),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WireLight {
    pub is_on: bool,
    pub output_in_percent: u8,
}

/// Creates adapters for demo services on a fixed port.
pub struct DemoFactory {
    port: u16,
    poll_period: Duration,
}

impl DemoFactory {
    pub fn new(port: u16) -> Self {
        Self {
            port,
            poll_period: DEFAULT_POLL_PERIOD,
        }
    }

    /// Override the poll period (embedders with faster backends, tests).
    pub fn with_poll_period(port: u16, poll_period: Duration) -> Self {
        Self { port, poll_period }
    }
}

impl AdapterFactory for DemoFactory {
    fn name(&self) -> &str {
        "demo service"
    }

    fn ipv4_description(&self) -> ServiceDescription {
        ServiceDescription {
            open_ports: vec![self.port],
        }
    }

    fn handle_ipv4(&self, context: ServiceContext) -> Arc<dyn Adapter> {
        DemoAdapter::spawn(self.port, self.poll_period, context)
    }
}

struct DemoAdapter {
    port: u16,
    poll_period: Duration,
    context: ServiceContext,
    differ: Differ,
    updates_rx: Mutex<Option<mpsc::Receiver<DeviceUpdate>>>,
    stop_tx: watch::Sender<bool>,
    client: reqwest::Client,
}

impl DemoAdapter {
    fn spawn(port: u16, poll_period: Duration, context: ServiceContext) -> Arc<dyn Adapter> {
        let (update_tx, update_rx) = mpsc::channel(UPDATE_CHAN_CAP);
        let (stop_tx, _) = watch::channel(false);
        let client = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .expect("default reqwest client must build");

        let adapter = Arc::new(Self {
            port,
            poll_period,
            context,
            differ: Differ::new(),
            updates_rx: Mutex::new(Some(update_rx)),
            stop_tx,
            client,
        });

        let serving = adapter.clone();
        tokio::spawn(async move {
            if let Err(e) = serving.differ.set_output(update_tx).await {
                tracing::error!(error = %e, "demo adapter could not wire its differ");
                return;
            }
            serving.serve().await;
        });
        adapter
    }

    async fn serve(&self) {
        match self.is_demo_service().await {
            Ok(true) => {}
            Ok(false) => {
                tracing::info!(ip = %self.context.addr(), "service is not a demo service");
                let _ = self.context.send_status(AdapterStatus::IncorrectService).await;
                return;
            }
            Err(e) => {
                tracing::info!(ip = %self.context.addr(), error = %e, "demo identity probe failed");
                let _ = self.context.send_status(AdapterStatus::IncorrectService).await;
                return;
            }
        }
        tracing::info!(ip = %self.context.addr(), "demo adapter serving");

        // Heartbeat until the context dies or serving ends.
        let heartbeat = {
            let context = self.context.clone();
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(HEARTBEAT_PERIOD);
                loop {
                    interval.tick().await;
                    if context.send_status(AdapterStatus::Handling).await.is_err() {
                        return;
                    }
                }
            })
        };

        let mut stop_rx = self.stop_tx.subscribe();
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.poll_period) => {}
                _ = stop_rx.changed() => break,
            }

            match self.fetch_devices().await {
                Ok(snapshot) => self.differ.consider(snapshot).await,
                Err(e) => {
                    tracing::warn!(ip = %self.context.addr(), error = %e, "error polling demo service");
                    let _ = self.context.send_status(AdapterStatus::Errored).await;
                    break;
                }
            }
        }
        heartbeat.abort();
    }

    fn url(&self, path: &str) -> String {
        let port = self.context.port().unwrap_or(self.port);
        format!("http://{}:{}{}", self.context.addr(), port, path)
    }

    async fn is_demo_service(&self) -> Result<bool> {
        let status: WireStatus = self
            .client
            .get(self.url("/status"))
            .send()
            .await?
            .json()
            .await?;
        Ok(status.server_type == SERVER_TYPE_ALL_AT_ONCE)
    }

    async fn fetch_devices(&self) -> Result<HashMap<ExternalDeviceID, Device>> {
        let raw: HashMap<String, WireDevice> = self
            .client
            .get(self.url("/devices"))
            .send()
            .await?
            .json()
            .await
            .map_err(|e| Error::Parse(format!("demo /devices response did not parse: {e}")))?;
        Ok(convert_devices(raw))
    }
}

#[async_trait]
impl Adapter for DemoAdapter {
    fn take_updates(&self) -> Option<mpsc::Receiver<DeviceUpdate>> {
        self.updates_rx
            .lock()
            .expect("updates_rx lock poisoned")
            .take()
    }

    async fn enact_intent(&self, target: ExternalComponentID, intent: Intent) -> Result<()> {
        match intent {
            Intent::SetLightEmitter {
                brightness_in_percent,
            } => {
                let device = self.differ.get_latest(&target.device).await?;
                let component = device.components.get(&target.name).ok_or_else(|| {
                    Error::NotFound(format!(
                        "device {} has no component named {}",
                        target.device, target.name
                    ))
                })?;
                if !matches!(component, Component::LightEmitter(_)) {
                    return Err(Error::InvalidArgument(format!(
                        "cannot set light emitter state on a {} component",
                        component.kind()
                    )));
                }

                let light = light_command(brightness_in_percent);
                let url = self.url(&format!("/devices/{}/{}", target.device.id, target.name));
                let response = self
                    .client
                    .post(url)
                    .json(&WireComponent::Light(light))
                    .send()
                    .await?;
                if !response.status().is_success() {
                    return Err(Error::Transport(format!(
                        "demo service rejected the component post: {}",
                        response.status()
                    )));
                }
                Ok(())
            }
            other => Err(Error::UnsupportedIntent(other.kind().to_string())),
        }
    }

    fn stop(&self) {
        self.stop_tx.send_replace(true);
    }
}

/// Translate a demo-side device collection into the SIFT model.
pub fn convert_devices(raw: HashMap<String, WireDevice>) -> HashMap<ExternalDeviceID, Device> {
    raw.into_iter()
        .map(|(id, wire)| {
            let key = ExternalDeviceID::new(MANUFACTURER, id);
            (key, convert_device(wire))
        })
        .collect()
}

fn convert_device(wire: WireDevice) -> Device {
    let mut components = BTreeMap::new();
    for (name, component) in wire.components {
        let WireComponent::Light(light) = component;
        components.insert(
            name,
            Component::LightEmitter(LightEmitter {
                base: BaseComponent {
                    make: LIGHT_MAKE.to_string(),
                    model: LIGHT_MODEL.to_string(),
                },
                state: LightEmitterState {
                    brightness_in_percent: light.output_in_percent,
                },
                specs: None,
                stats: None,
            }),
        );
    }
    Device {
        name: wire.name,
        is_online: true,
        components,
    }
}

/// Build the vendor-side light command for a requested brightness:
/// 0 maps to "off", values above 100 cap at 100.
fn light_command(brightness_in_percent: u8) -> WireLight {
    if brightness_in_percent == 0 {
        return WireLight {
            is_on: false,
            output_in_percent: 0,
        };
    }
    WireLight {
        is_on: true,
        output_in_percent: brightness_in_percent.min(100),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_devices_convert_to_sift_devices() {
        let mut components = HashMap::new();
        components.insert(
            "light1".to_string(),
            WireComponent::Light(WireLight {
                is_on: true,
                output_in_percent: 73,
            }),
        );
        let mut raw = HashMap::new();
        raw.insert(
            "device1".to_string(),
            WireDevice {
                name: None,
                components,
            },
        );

        let devices = convert_devices(raw);
        let device = &devices[&ExternalDeviceID::new(MANUFACTURER, "device1")];
        match &device.components["light1"] {
            Component::LightEmitter(le) => {
                assert_eq!(le.base.make, LIGHT_MAKE);
                assert_eq!(le.base.model, LIGHT_MODEL);
                assert_eq!(le.state.brightness_in_percent, 73);
            }
            other => panic!("expected light emitter, got {other:?}"),
        }
    }

    #[test]
    fn zero_brightness_turns_the_light_off() {
        assert_eq!(
            light_command(0),
            WireLight {
                is_on: false,
                output_in_percent: 0
            }
        );
    }

    #[test]
    fn brightness_above_100_caps_at_100() {
        assert_eq!(
            light_command(250),
            WireLight {
                is_on: true,
                output_in_percent: 100
            }
        );
        assert_eq!(
            light_command(100),
            WireLight {
                is_on: true,
                output_in_percent: 100
            }
        );
        assert_eq!(
            light_command(42),
            WireLight {
                is_on: true,
                output_in_percent: 42
            }
        );
    }

    #[test]
    fn wire_component_tags_by_type() {
        let json = serde_json::to_value(WireComponent::Light(WireLight {
            is_on: true,
            output_in_percent: 5,
        }))
        .unwrap();
        assert_eq!(json["type"], "light");

        let parsed: WireComponent =
            serde_json::from_str(r#"{"type":"light","is_on":false,"output_in_percent":0}"#).unwrap();
        assert_eq!(
            parsed,
            WireComponent::Light(WireLight {
                is_on: false,
                output_in_percent: 0
            })
        );
    }
}
