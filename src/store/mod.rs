//! Persistent device registry
//!
//! ## Responsibilities
//!
//! - Transactional upsert of devices and their components
//! - Component-level diff against the previously persisted state
//! - External <-> internal identity lookup
//! - Catalog (spec) expansion on reads
//! - Per-adapter credential storage for service contexts
//!
//! Backed by a single SQLite file through sqlx. SQLite serializes writers;
//! contention surfaces as `Error::Busy`, which callers may retry. `close`
//! marks every device offline before releasing the file.

mod schema;

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::{Sqlite, Transaction};

use crate::differ::diff_device;
use crate::error::{Error, Result};
use crate::types::{
    BaseComponent, Component, ComponentID, ComponentKind, Device, DeviceID, ExternalDeviceID,
    LightEmitter, LightEmitterSpecs, LightEmitterState, MediaPlayer, MediaPlayerSpecs,
    MediaPlayerState, MediaType, PlayState, Speaker, SpeakerState,
};

/// Selects which optional parts of a component are gathered on reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Expansion(u8);

impl Expansion {
    pub const NONE: Expansion = Expansion(0);
    pub const SPECS: Expansion = Expansion(1);
    pub const STATS: Expansion = Expansion(2);
    pub const ALL: Expansion = Expansion(1 | 2);

    pub fn contains(self, flag: Expansion) -> bool {
        flag.0 != 0 && self.0 & flag.0 == flag.0
    }
}

impl std::ops::BitOr for Expansion {
    type Output = Expansion;
    fn bitor(self, rhs: Expansion) -> Expansion {
        Expansion(self.0 | rhs.0)
    }
}

/// The result of an upsert: the device's internal id and the component-level
/// changes relative to what was previously persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceUpsertResponse {
    pub device_id: DeviceID,
    /// True when the device row was inserted by this call.
    pub created: bool,
    pub upserted: BTreeMap<String, Component>,
    /// Names in `upserted` that had no persisted row before this call.
    pub created_component_names: BTreeSet<String>,
    pub deleted: BTreeMap<String, Component>,
    pub device_changed: bool,
}

#[derive(sqlx::FromRow)]
struct DeviceRow {
    id: i64,
    manufacturer: String,
    external_id: String,
    name: Option<String>,
    is_online: bool,
}

#[derive(sqlx::FromRow)]
struct ComponentRow {
    id: i64,
    device_id: i64,
    name: String,
    make: String,
    model: String,
    kind: String,
}

/// Manages the SIFT database.
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Open the SIFT database at the given path, creating and initializing
    /// it if it does not exist.
    pub async fn open(path: &Path) -> Result<Store> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5))
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(map_db_err)?;

        sqlx::raw_sql(schema::INIT_SQL)
            .execute(&pool)
            .await
            .map_err(map_db_err)?;
        sqlx::raw_sql(schema::POPULATE_SPECS_SQL)
            .execute(&pool)
            .await
            .map_err(map_db_err)?;

        tracing::debug!(path = %path.display(), "opened sift database");
        Ok(Store { pool })
    }

    /// Update or insert a device and its components. The device is treated
    /// as whole: components previously attached but absent from
    /// `device.components` are deleted. The response lists exactly which
    /// components changed relative to the persisted state.
    pub async fn upsert_device(
        &self,
        external_id: &ExternalDeviceID,
        device: &Device,
    ) -> Result<DeviceUpsertResponse> {
        let mut tx = self.pool.begin().await.map_err(map_db_err)?;

        let existing = get_device_row_tx(&mut tx, external_id).await?;
        let (device_id, created, old_device) = match existing {
            Some(row) => {
                let device_id = DeviceID(row.id);
                let old_device = Device {
                    name: row.name.clone(),
                    is_online: row.is_online,
                    components: read_components_tx(&mut tx, device_id, Expansion::NONE).await?,
                };
                sqlx::query("UPDATE device SET name = ?, is_online = ? WHERE id = ?")
                    .bind(&device.name)
                    .bind(device.is_online)
                    .bind(row.id)
                    .execute(&mut *tx)
                    .await
                    .map_err(map_db_err)?;
                (device_id, false, old_device)
            }
            None => {
                let result = sqlx::query(
                    "INSERT INTO device (manufacturer, external_id, name, is_online) \
                     VALUES (?, ?, ?, ?)",
                )
                .bind(&external_id.manufacturer)
                .bind(&external_id.id)
                .bind(&device.name)
                .bind(device.is_online)
                .execute(&mut *tx)
                .await
                .map_err(map_db_err)?;
                let id = result.last_insert_rowid();
                tracing::debug!(device_id = id, external_id = %external_id, "inserted new device");
                (DeviceID(id), true, Device::default())
            }
        };

        // Diff the submitted device against the persisted one so the
        // response names only real changes.
        let diff = diff_device(&old_device, device);
        let created_component_names: BTreeSet<String> = diff
            .upserted
            .keys()
            .filter(|name| !old_device.components.contains_key(*name))
            .cloned()
            .collect();

        for (name, component) in &diff.upserted {
            upsert_component_tx(&mut tx, device_id, name, component).await?;
        }
        for name in diff.deleted.keys() {
            delete_component_tx(&mut tx, device_id, name).await?;
        }

        tx.commit().await.map_err(map_db_err)?;

        Ok(DeviceUpsertResponse {
            device_id,
            created,
            upserted: diff.upserted,
            created_component_names,
            deleted: diff.deleted,
            device_changed: diff.device_changed,
        })
    }

    /// All devices in the database, keyed by internal id.
    pub async fn get_devices(&self, expansion: Expansion) -> Result<BTreeMap<DeviceID, Device>> {
        let mut tx = self.pool.begin().await.map_err(map_db_err)?;
        let ids: Vec<i64> = sqlx::query_scalar("SELECT id FROM device")
            .fetch_all(&mut *tx)
            .await
            .map_err(map_db_err)?;

        let mut devices = BTreeMap::new();
        for id in ids {
            let device_id = DeviceID(id);
            let device = read_device_tx(&mut tx, device_id, expansion).await?;
            devices.insert(device_id, device);
        }
        tx.commit().await.map_err(map_db_err)?;
        Ok(devices)
    }

    /// One device by internal id.
    pub async fn get_device(&self, id: DeviceID, expansion: Expansion) -> Result<Device> {
        let mut tx = self.pool.begin().await.map_err(map_db_err)?;
        let device = read_device_tx(&mut tx, id, expansion).await?;
        tx.commit().await.map_err(map_db_err)?;
        Ok(device)
    }

    /// All components in the database, keyed by internal component id.
    pub async fn get_components(
        &self,
        expansion: Expansion,
    ) -> Result<BTreeMap<ComponentID, Component>> {
        let mut tx = self.pool.begin().await.map_err(map_db_err)?;
        let rows: Vec<ComponentRow> = sqlx::query_as(
            "SELECT id, device_id, name, make, model, kind FROM component",
        )
        .fetch_all(&mut *tx)
        .await
        .map_err(map_db_err)?;

        let mut components = BTreeMap::new();
        for row in rows {
            let id = ComponentID::new(DeviceID(row.device_id), row.name.clone());
            let component = read_component_state_tx(&mut tx, &row, expansion).await?;
            components.insert(id, component);
        }
        tx.commit().await.map_err(map_db_err)?;
        Ok(components)
    }

    /// The external identity matching an internal device id.
    pub async fn get_external_device_id(&self, id: DeviceID) -> Result<ExternalDeviceID> {
        let row: Option<DeviceRow> = sqlx::query_as(
            "SELECT id, manufacturer, external_id, name, is_online FROM device WHERE id = ? LIMIT 1",
        )
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_db_err)?;

        let row = row.ok_or_else(|| Error::NotFound(format!("no device with id {id}")))?;
        Ok(ExternalDeviceID {
            manufacturer: row.manufacturer,
            id: row.external_id,
        })
    }

    /// The internal device id matching an external identity, if persisted.
    pub async fn get_device_id(&self, external_id: &ExternalDeviceID) -> Result<Option<DeviceID>> {
        let id: Option<i64> = sqlx::query_scalar(
            "SELECT id FROM device WHERE manufacturer = ? AND external_id = ? LIMIT 1",
        )
        .bind(&external_id.manufacturer)
        .bind(&external_id.id)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_db_err)?;
        Ok(id.map(DeviceID))
    }

    /// Delete a device and every component it owns, in one transaction.
    /// Returns the internal id and the deleted device state (for
    /// notification fan-out), or None when the external id is unknown.
    pub async fn delete_device(
        &self,
        external_id: &ExternalDeviceID,
    ) -> Result<Option<(DeviceID, Device)>> {
        let mut tx = self.pool.begin().await.map_err(map_db_err)?;
        let row = match get_device_row_tx(&mut tx, external_id).await? {
            Some(row) => row,
            None => return Ok(None),
        };
        let device_id = DeviceID(row.id);
        let device = Device {
            name: row.name.clone(),
            is_online: row.is_online,
            components: read_components_tx(&mut tx, device_id, Expansion::NONE).await?,
        };

        for name in device.components.keys() {
            delete_component_tx(&mut tx, device_id, name).await?;
        }
        sqlx::query("DELETE FROM device WHERE id = ?")
            .bind(row.id)
            .execute(&mut *tx)
            .await
            .map_err(map_db_err)?;
        tx.commit().await.map_err(map_db_err)?;

        tracing::debug!(device_id = %device_id, external_id = %external_id, "deleted device");
        Ok(Some((device_id, device)))
    }

    /// Store a per-adapter credential value. Adapters with different names
    /// cannot read or overwrite each other's data.
    pub async fn store_adapter_data(
        &self,
        adapter_name: &str,
        key: &str,
        value: &str,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO adapter_credential (adapter_name, key, value) VALUES (?, ?, ?) \
             ON CONFLICT (adapter_name, key) DO UPDATE SET value = excluded.value",
        )
        .bind(adapter_name)
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await
        .map_err(map_db_err)?;
        Ok(())
    }

    /// Read a per-adapter credential value.
    pub async fn get_adapter_data(&self, adapter_name: &str, key: &str) -> Result<Option<String>> {
        let value: Option<String> = sqlx::query_scalar(
            "SELECT value FROM adapter_credential WHERE adapter_name = ? AND key = ? LIMIT 1",
        )
        .bind(adapter_name)
        .bind(key)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_db_err)?;
        Ok(value)
    }

    /// Mark every device offline in one transaction, then release the file.
    pub async fn close(&self) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(map_db_err)?;
        sqlx::query("UPDATE device SET is_online = 0")
            .execute(&mut *tx)
            .await
            .map_err(map_db_err)?;
        tx.commit().await.map_err(map_db_err)?;
        self.pool.close().await;
        Ok(())
    }
}

/// Map SQLite contention onto the retryable `Busy` variant.
fn map_db_err(e: sqlx::Error) -> Error {
    if let sqlx::Error::Database(db_err) = &e {
        // SQLITE_BUSY = 5, SQLITE_LOCKED = 6
        if matches!(db_err.code().as_deref(), Some("5") | Some("6")) {
            return Error::Busy(db_err.to_string());
        }
    }
    Error::Database(e)
}

async fn get_device_row_tx(
    tx: &mut Transaction<'_, Sqlite>,
    external_id: &ExternalDeviceID,
) -> Result<Option<DeviceRow>> {
    sqlx::query_as(
        "SELECT id, manufacturer, external_id, name, is_online FROM device \
         WHERE manufacturer = ? AND external_id = ? LIMIT 1",
    )
    .bind(&external_id.manufacturer)
    .bind(&external_id.id)
    .fetch_optional(&mut **tx)
    .await
    .map_err(map_db_err)
}

async fn read_device_tx(
    tx: &mut Transaction<'_, Sqlite>,
    id: DeviceID,
    expansion: Expansion,
) -> Result<Device> {
    let row: Option<DeviceRow> = sqlx::query_as(
        "SELECT id, manufacturer, external_id, name, is_online FROM device WHERE id = ? LIMIT 1",
    )
    .bind(id.0)
    .fetch_optional(&mut **tx)
    .await
    .map_err(map_db_err)?;
    let row = row.ok_or_else(|| Error::NotFound(format!("no device with id {id}")))?;

    Ok(Device {
        name: row.name,
        is_online: row.is_online,
        components: read_components_tx(tx, id, expansion).await?,
    })
}

async fn read_components_tx(
    tx: &mut Transaction<'_, Sqlite>,
    device_id: DeviceID,
    expansion: Expansion,
) -> Result<BTreeMap<String, Component>> {
    let rows: Vec<ComponentRow> = sqlx::query_as(
        "SELECT id, device_id, name, make, model, kind FROM component WHERE device_id = ?",
    )
    .bind(device_id.0)
    .fetch_all(&mut **tx)
    .await
    .map_err(map_db_err)?;

    let mut components = BTreeMap::new();
    for row in rows {
        let name = row.name.clone();
        let component = read_component_state_tx(tx, &row, expansion).await?;
        components.insert(name, component);
    }
    Ok(components)
}

/// Read the kind-specific state (and optionally catalog specs) for one base
/// component row, dispatching on the persisted kind discriminator.
async fn read_component_state_tx(
    tx: &mut Transaction<'_, Sqlite>,
    row: &ComponentRow,
    expansion: Expansion,
) -> Result<Component> {
    let kind = ComponentKind::parse(&row.kind)
        .ok_or_else(|| Error::Parse(format!("unknown component kind in database: {}", row.kind)))?;
    let base = BaseComponent {
        make: row.make.clone(),
        model: row.model.clone(),
    };

    match kind {
        ComponentKind::LightEmitter => {
            let brightness: i64 = sqlx::query_scalar(
                "SELECT brightness_in_percent FROM light_emitter_state WHERE id = ? LIMIT 1",
            )
            .bind(row.id)
            .fetch_one(&mut **tx)
            .await
            .map_err(map_db_err)?;
            if !(0..=255).contains(&brightness) {
                return Err(Error::Parse(format!(
                    "brightness value from database does not fit in u8: {brightness}"
                )));
            }

            let specs = if expansion.contains(Expansion::SPECS) {
                sqlx::query_as::<_, (i64, i64, i64)>(
                    "SELECT max_output_in_lumens, min_output_in_lumens, expected_lifetime_in_hours \
                     FROM light_emitter_spec WHERE make = ? AND model = ? LIMIT 1",
                )
                .bind(&row.make)
                .bind(&row.model)
                .fetch_optional(&mut **tx)
                .await
                .map_err(map_db_err)?
                .map(|(max, min, hours)| LightEmitterSpecs {
                    max_output_in_lumens: max,
                    min_output_in_lumens: min,
                    expected_lifetime_in_hours: hours,
                })
            } else {
                None
            };

            Ok(Component::LightEmitter(LightEmitter {
                base,
                state: LightEmitterState {
                    brightness_in_percent: brightness as u8,
                },
                specs,
                stats: None,
            }))
        }
        ComponentKind::MediaPlayer => {
            let (play_state, media_type, source): (String, String, String) = sqlx::query_as(
                "SELECT play_state, media_type, source FROM media_player_state WHERE id = ? LIMIT 1",
            )
            .bind(row.id)
            .fetch_one(&mut **tx)
            .await
            .map_err(map_db_err)?;

            let play_state = PlayState::parse(&play_state)
                .ok_or_else(|| Error::Parse(format!("unknown play state in database: {play_state}")))?;
            let media_type = MediaType::parse(&media_type)
                .ok_or_else(|| Error::Parse(format!("unknown media type in database: {media_type}")))?;

            let specs = if expansion.contains(Expansion::SPECS) {
                sqlx::query_as::<_, (String, String)>(
                    "SELECT supported_audio_types, supported_video_types \
                     FROM media_player_spec WHERE make = ? AND model = ? LIMIT 1",
                )
                .bind(&row.make)
                .bind(&row.model)
                .fetch_optional(&mut **tx)
                .await
                .map_err(map_db_err)?
                .map(|(audio, video)| MediaPlayerSpecs {
                    supported_audio_types: audio,
                    supported_video_types: video,
                })
            } else {
                None
            };

            Ok(Component::MediaPlayer(MediaPlayer {
                base,
                state: MediaPlayerState {
                    play_state,
                    media_type,
                    source,
                },
                specs,
                stats: None,
            }))
        }
        ComponentKind::Speaker => {
            let output: i64 = sqlx::query_scalar(
                "SELECT output_in_percent FROM speaker_state WHERE id = ? LIMIT 1",
            )
            .bind(row.id)
            .fetch_one(&mut **tx)
            .await
            .map_err(map_db_err)?;
            if !(0..=255).contains(&output) {
                return Err(Error::Parse(format!(
                    "speaker output value from database does not fit in u8: {output}"
                )));
            }

            Ok(Component::Speaker(Speaker {
                base,
                state: SpeakerState {
                    output_in_percent: output as u8,
                },
                specs: None,
            }))
        }
    }
}

/// Upsert the base component row, then the kind-specific state row.
async fn upsert_component_tx(
    tx: &mut Transaction<'_, Sqlite>,
    device_id: DeviceID,
    name: &str,
    component: &Component,
) -> Result<()> {
    let base = component.base();

    // Try updating the base row first; insert when nothing was updated.
    let existing_id: Option<i64> = sqlx::query_scalar(
        "SELECT id FROM component WHERE device_id = ? AND name = ? LIMIT 1",
    )
    .bind(device_id.0)
    .bind(name)
    .fetch_optional(&mut **tx)
    .await
    .map_err(map_db_err)?;

    let component_id = match existing_id {
        Some(id) => {
            sqlx::query("UPDATE component SET make = ?, model = ?, kind = ? WHERE id = ?")
                .bind(&base.make)
                .bind(&base.model)
                .bind(component.kind().as_str())
                .bind(id)
                .execute(&mut **tx)
                .await
                .map_err(map_db_err)?;
            id
        }
        None => {
            let result = sqlx::query(
                "INSERT INTO component (device_id, name, make, model, kind) VALUES (?, ?, ?, ?, ?)",
            )
            .bind(device_id.0)
            .bind(name)
            .bind(&base.make)
            .bind(&base.model)
            .bind(component.kind().as_str())
            .execute(&mut **tx)
            .await
            .map_err(map_db_err)?;
            result.last_insert_rowid()
        }
    };

    match component {
        Component::LightEmitter(le) => {
            sqlx::query(
                "INSERT INTO light_emitter_state (id, brightness_in_percent) VALUES (?, ?) \
                 ON CONFLICT (id) DO UPDATE SET brightness_in_percent = excluded.brightness_in_percent",
            )
            .bind(component_id)
            .bind(le.state.brightness_in_percent as i64)
            .execute(&mut **tx)
            .await
            .map_err(map_db_err)?;
        }
        Component::MediaPlayer(mp) => {
            sqlx::query(
                "INSERT INTO media_player_state (id, play_state, media_type, source) \
                 VALUES (?, ?, ?, ?) \
                 ON CONFLICT (id) DO UPDATE SET play_state = excluded.play_state, \
                 media_type = excluded.media_type, source = excluded.source",
            )
            .bind(component_id)
            .bind(mp.state.play_state.as_str())
            .bind(mp.state.media_type.as_str())
            .bind(&mp.state.source)
            .execute(&mut **tx)
            .await
            .map_err(map_db_err)?;
        }
        Component::Speaker(sp) => {
            sqlx::query(
                "INSERT INTO speaker_state (id, output_in_percent) VALUES (?, ?) \
                 ON CONFLICT (id) DO UPDATE SET output_in_percent = excluded.output_in_percent",
            )
            .bind(component_id)
            .bind(sp.state.output_in_percent as i64)
            .execute(&mut **tx)
            .await
            .map_err(map_db_err)?;
        }
    }
    Ok(())
}

/// Drop the kind-specific state row, then the base row.
async fn delete_component_tx(
    tx: &mut Transaction<'_, Sqlite>,
    device_id: DeviceID,
    name: &str,
) -> Result<()> {
    let row: Option<ComponentRow> = sqlx::query_as(
        "SELECT id, device_id, name, make, model, kind FROM component \
         WHERE device_id = ? AND name = ? LIMIT 1",
    )
    .bind(device_id.0)
    .bind(name)
    .fetch_optional(&mut **tx)
    .await
    .map_err(map_db_err)?;
    let row = match row {
        Some(row) => row,
        None => return Ok(()),
    };

    let state_table = match ComponentKind::parse(&row.kind) {
        Some(ComponentKind::LightEmitter) => "light_emitter_state",
        Some(ComponentKind::MediaPlayer) => "media_player_state",
        Some(ComponentKind::Speaker) => "speaker_state",
        None => {
            return Err(Error::Parse(format!(
                "unknown component kind in database: {}",
                row.kind
            )))
        }
    };
    sqlx::query(&format!("DELETE FROM {state_table} WHERE id = ?"))
        .bind(row.id)
        .execute(&mut **tx)
        .await
        .map_err(map_db_err)?;
    sqlx::query("DELETE FROM component WHERE id = ?")
        .bind(row.id)
        .execute(&mut **tx)
        .await
        .map_err(map_db_err)?;
    Ok(())
}
