//! Driver for stateful lighting-gateway hubs
//!
//! The gateway is a hub fronting many bulbs behind one HTTPS endpoint
//! (`/gwr/gop.php`, form-POSTs carrying vendor XML). It is stateful: before
//! anything else works we log in with a process-stable pseudorandom
//! principal and hold on to the returned token. A gateway that has not been
//! paired answers logins with a non-200 code until its pairing button is
//! pressed, which surfaces here as `AuthFailed` with that exact remediation.
//!
//! Gateways ship self-signed certificates. Instead of skipping verification,
//! the adapter pins the peer certificate's SHA-256 fingerprint on first
//! trust and verifies every later response against the pin; a changed
//! certificate is a transport error that kills the adapter.

pub mod xml;

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tokio::sync::{mpsc, watch};
use uuid::Uuid;

use crate::adapter::{
    Adapter, AdapterFactory, AdapterStatus, ServiceContext, UPDATE_CHAN_CAP,
};
use crate::differ::{DeviceUpdate, Differ};
use crate::error::{Error, Result};
use crate::scanner::ServiceDescription;
use crate::types::{Component, Device, ExternalComponentID, ExternalDeviceID, Intent};

const OPEN_PORT: u16 = 443;
const POLL_PERIOD: Duration = Duration::from_secs(10);
const HEARTBEAT_PERIOD: Duration = Duration::from_secs(5);
const HTTP_TIMEOUT: Duration = Duration::from_secs(5);

const LOGIN_RETRIES: usize = 3;
const LOGIN_RETRY_DELAY: Duration = Duration::from_millis(100);

const KEY_PRINCIPAL: &str = "gateway_principal";
const KEY_TOKEN: &str = "gateway_token";
const KEY_CERT_FINGERPRINT: &str = "gateway_cert_sha256";

/// How the adapter treats the gateway's TLS certificate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GatewayTls {
    /// Accept the self-signed certificate but pin its fingerprint on first
    /// trust and verify it on every response.
    #[default]
    PinOnFirstUse,
    /// Require a certificate the system trust store accepts.
    SystemRoots,
}

/// Creates adapters for lighting gateways (expected open port 443).
pub struct GatewayFactory {
    tls: GatewayTls,
}

impl GatewayFactory {
    pub fn new() -> Self {
        Self {
            tls: GatewayTls::PinOnFirstUse,
        }
    }

    pub fn with_tls(tls: GatewayTls) -> Self {
        Self { tls }
    }
}

impl Default for GatewayFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl AdapterFactory for GatewayFactory {
    fn name(&self) -> &str {
        "lighting gateway"
    }

    fn ipv4_description(&self) -> ServiceDescription {
        ServiceDescription {
            open_ports: vec![OPEN_PORT],
        }
    }

    fn handle_ipv4(&self, context: ServiceContext) -> Arc<dyn Adapter> {
        GatewayAdapter::spawn(self.tls, context)
    }
}

struct GatewayAdapter {
    tls: GatewayTls,
    context: ServiceContext,
    differ: Differ,
    updates_rx: Mutex<Option<mpsc::Receiver<DeviceUpdate>>>,
    stop_tx: watch::Sender<bool>,
    client: reqwest::Client,
}

impl GatewayAdapter {
    fn spawn(tls: GatewayTls, context: ServiceContext) -> Arc<dyn Adapter> {
        let (update_tx, update_rx) = mpsc::channel(UPDATE_CHAN_CAP);
        let (stop_tx, _) = watch::channel(false);

        let mut builder = reqwest::Client::builder().timeout(HTTP_TIMEOUT);
        if tls == GatewayTls::PinOnFirstUse {
            // The pin check in checked_post replaces chain verification.
            builder = builder.danger_accept_invalid_certs(true).tls_info(true);
        }
        let client = builder.build().expect("default reqwest client must build");

        let adapter = Arc::new(Self {
            tls,
            context,
            differ: Differ::new(),
            updates_rx: Mutex::new(Some(update_rx)),
            stop_tx,
            client,
        });

        let serving = adapter.clone();
        tokio::spawn(async move {
            if let Err(e) = serving.differ.set_output(update_tx).await {
                tracing::error!(error = %e, "gateway adapter could not wire its differ");
                return;
            }
            serving.serve().await;
        });
        adapter
    }

    async fn serve(&self) {
        // Identity probe: a service that lets us log in is a gateway.
        if let Err(e) = self.login_with_retry().await {
            tracing::info!(
                ip = %self.context.addr(),
                error = %e,
                "service is not a reachable lighting gateway"
            );
            let _ = self.context.send_status(AdapterStatus::IncorrectService).await;
            return;
        }
        tracing::info!(ip = %self.context.addr(), "gateway adapter serving");

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
                _ = tokio::time::sleep(POLL_PERIOD) => {}
                _ = stop_rx.changed() => break,
            }

            match self.fetch_devices().await {
                Ok(snapshot) => self.differ.consider(snapshot).await,
                Err(e) => {
                    tracing::warn!(ip = %self.context.addr(), error = %e, "error polling gateway");
                    let _ = self.context.send_status(AdapterStatus::Errored).await;
                    break;
                }
            }
        }
        heartbeat.abort();
    }

    fn endpoint(&self) -> String {
        format!("https://{}/gwr/gop.php", self.context.addr())
    }

    /// POST a command form and return the body, after verifying the peer
    /// certificate against the stored pin (first use stores it).
    async fn checked_post(&self, cmd: &str, data: String) -> Result<String> {
        let form = [("cmd", cmd), ("fmt", "xml"), ("data", data.as_str())];
        let response = self
            .client
            .post(self.endpoint())
            .form(&form)
            .send()
            .await?;

        if self.tls == GatewayTls::PinOnFirstUse {
            let fingerprint = peer_fingerprint(&response)?;
            match self.context.get_data(KEY_CERT_FINGERPRINT).await? {
                None => {
                    tracing::info!(
                        ip = %self.context.addr(),
                        fingerprint = %fingerprint,
                        "pinning gateway certificate on first trust"
                    );
                    self.context
                        .store_data(KEY_CERT_FINGERPRINT, &fingerprint)
                        .await?;
                }
                Some(pinned) if pinned == fingerprint => {}
                Some(pinned) => {
                    return Err(Error::Transport(format!(
                        "gateway certificate changed (pinned {pinned}, got {fingerprint})"
                    )));
                }
            }
        }

        Ok(response.text().await?)
    }

    /// Log in, reusing a cached token when one exists. A fresh login uses
    /// the process-stable principal stored with the context (created on
    /// first contact) and caches the returned token.
    async fn login(&self) -> Result<String> {
        match self.context.get_data(KEY_TOKEN).await? {
            Some(token) if !token.is_empty() => return Ok(token),
            _ => {}
        }

        let principal = match self.context.get_data(KEY_PRINCIPAL).await? {
            Some(principal) => principal,
            None => {
                let principal = Uuid::new_v4().to_string();
                self.context.store_data(KEY_PRINCIPAL, &principal).await?;
                principal
            }
        };

        let body = self
            .checked_post("GWRLogin", xml::login_command(&principal))
            .await?;
        let reply = xml::parse_login_reply(&body)?;
        match (reply.rc.as_str(), reply.token) {
            ("200", Some(token)) => {
                self.context.store_data(KEY_TOKEN, &token).await?;
                tracing::debug!(ip = %self.context.addr(), "logged in to gateway");
                Ok(token)
            }
            (rc, _) => Err(Error::AuthFailed {
                message: format!(
                    "gateway at {} rejected login with rc={rc}",
                    self.context.addr()
                ),
                user_action: "press the pairing button".to_string(),
            }),
        }
    }

    async fn login_with_retry(&self) -> Result<String> {
        let addr = self.context.addr();
        with_login_retries(LOGIN_RETRIES, LOGIN_RETRY_DELAY, || async move {
            let result = self.login().await;
            if let Err(e) = &result {
                tracing::debug!(ip = %addr, error = %e, "gateway login attempt failed");
            }
            result
        })
        .await
    }

    /// Invalidate the cached token so the next login starts fresh.
    async fn forget_token(&self) -> Result<()> {
        // Overwrite rather than delete; an empty token never validates.
        self.context.store_data(KEY_TOKEN, "").await?;
        Ok(())
    }

    async fn fetch_devices(&self) -> Result<HashMap<ExternalDeviceID, Device>> {
        let token = self.valid_token().await?;
        let body = self
            .checked_post("GWRBatch", xml::carousel_command(&token))
            .await?;

        let devices = match xml::parse_carousel_devices(&body) {
            Ok(devices) => devices,
            Err(Error::AuthFailed { .. }) => {
                // The hub revoked our token; re-pair and retry once.
                self.forget_token().await?;
                let token = self.login_with_retry().await?;
                let body = self
                    .checked_post("GWRBatch", xml::carousel_command(&token))
                    .await?;
                xml::parse_carousel_devices(&body)?
            }
            Err(e) => return Err(e),
        };

        Ok(devices.iter().map(xml::device_to_sift).collect())
    }

    async fn valid_token(&self) -> Result<String> {
        match self.context.get_data(KEY_TOKEN).await? {
            Some(token) if !token.is_empty() => Ok(token),
            _ => self.login_with_retry().await,
        }
    }
}

#[async_trait]
impl Adapter for GatewayAdapter {
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

                let token = self.valid_token().await?;
                let level = brightness_in_percent.min(100);
                let is_on = brightness_in_percent > 0;
                self.checked_post(
                    "GWRBatch",
                    xml::set_level_command(&token, &target.name, level, is_on),
                )
                .await?;
                Ok(())
            }
            other => Err(Error::UnsupportedIntent(other.kind().to_string())),
        }
    }

    fn stop(&self) {
        self.stop_tx.send_replace(true);
    }
}

/// SHA-256 fingerprint of the response's peer certificate.
fn peer_fingerprint(response: &reqwest::Response) -> Result<String> {
    let tls_info = response
        .extensions()
        .get::<reqwest::tls::TlsInfo>()
        .ok_or_else(|| Error::Transport("no TLS information on gateway response".to_string()))?;
    let der = tls_info
        .peer_certificate()
        .ok_or_else(|| Error::Transport("gateway presented no peer certificate".to_string()))?;
    Ok(hex::encode(Sha256::digest(der)))
}

/// Run `attempt` up to `attempts` times with `delay` between failures,
/// returning the first success or the final error.
async fn with_login_retries<F, Fut>(attempts: usize, delay: Duration, mut attempt: F) -> Result<String>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<String>>,
{
    let mut last_err = None;
    for n in 1..=attempts {
        match attempt().await {
            Ok(token) => return Ok(token),
            Err(e) => {
                last_err = Some(e);
                if n < attempts {
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
    Err(last_err.unwrap_or_else(|| Error::Internal("login retry loop ran zero attempts".to_string())))
}
