//! Core SIFT data model
//!
//! Devices are physical units; each owns a set of functional Components
//! (light emitters, media players, speakers). Components are generically
//! typed so callers can manipulate any light emitter without knowing whether
//! a Hue bridge or a TCP gateway is behind it.
//!
//! Components and Intents are closed tagged unions. The `kind` discriminator
//! doubles as the serde tag and the persisted `kind` column, so encoding and
//! decoding dispatch on the same value everywhere.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Universally identifies a unique physical device. Two separate transports
/// reporting on the same physical unit must use the same ExternalDeviceID.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ExternalDeviceID {
    pub manufacturer: String,
    pub id: String,
}

impl ExternalDeviceID {
    pub fn new(manufacturer: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            manufacturer: manufacturer.into(),
            id: id.into(),
        }
    }
}

impl fmt::Display for ExternalDeviceID {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.manufacturer, self.id)
    }
}

/// Universally identifies a unique component of a device.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExternalComponentID {
    pub device: ExternalDeviceID,
    pub name: String,
}

/// Locally identifies a Device within a particular SIFT server.
/// Assigned by the store on first insert and stable for the row's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceID(pub i64);

impl fmt::Display for DeviceID {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Locally identifies a Component within a particular SIFT server.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ComponentID {
    pub device_id: DeviceID,
    pub name: String,
}

impl ComponentID {
    pub fn new(device_id: DeviceID, name: impl Into<String>) -> Self {
        Self {
            device_id,
            name: name.into(),
        }
    }
}

impl fmt::Display for ComponentID {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.device_id, self.name)
    }
}

/// A single physical unit containing zero or more Components.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Device {
    /// Short human-readable name, like "Kitchen lamp"
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub is_online: bool,
    /// All components of the device, indexed by their local name
    pub components: BTreeMap<String, Component>,
}

/// Shared attributes of every Component.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BaseComponent {
    pub make: String,
    pub model: String,
}

/// The component family discriminator. The set is closed per build; new
/// kinds are added here, to the store's kind dispatch, and nowhere else.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComponentKind {
    LightEmitter,
    MediaPlayer,
    Speaker,
}

impl ComponentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ComponentKind::LightEmitter => "light_emitter",
            ComponentKind::MediaPlayer => "media_player",
            ComponentKind::Speaker => "speaker",
        }
    }

    pub fn parse(s: &str) -> Option<ComponentKind> {
        match s {
            "light_emitter" => Some(ComponentKind::LightEmitter),
            "media_player" => Some(ComponentKind::MediaPlayer),
            "speaker" => Some(ComponentKind::Speaker),
            _ => None,
        }
    }
}

impl fmt::Display for ComponentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single functional element of a Device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Component {
    LightEmitter(LightEmitter),
    MediaPlayer(MediaPlayer),
    Speaker(Speaker),
}

impl Component {
    pub fn kind(&self) -> ComponentKind {
        match self {
            Component::LightEmitter(_) => ComponentKind::LightEmitter,
            Component::MediaPlayer(_) => ComponentKind::MediaPlayer,
            Component::Speaker(_) => ComponentKind::Speaker,
        }
    }

    pub fn base(&self) -> &BaseComponent {
        match self {
            Component::LightEmitter(c) => &c.base,
            Component::MediaPlayer(c) => &c.base,
            Component::Speaker(c) => &c.base,
        }
    }
}

/// A real-world light emitter, like a bulb or lamp.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LightEmitter {
    #[serde(flatten)]
    pub base: BaseComponent,
    pub state: LightEmitterState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub specs: Option<LightEmitterSpecs>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stats: Option<LightEmitterStats>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LightEmitterState {
    pub brightness_in_percent: u8,
}

/// Nominal figures for a light emitter model, read from the preloaded
/// catalog by (make, model). Never written by adapters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LightEmitterSpecs {
    pub max_output_in_lumens: i64,
    pub min_output_in_lumens: i64,
    pub expected_lifetime_in_hours: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LightEmitterStats {
    pub hours_on: i64,
}

/// Media player play states, persisted as their upper-case names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PlayState {
    Idle,
    Stopped,
    Buffering,
    Paused,
    Playing,
}

impl PlayState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlayState::Idle => "IDLE",
            PlayState::Stopped => "STOPPED",
            PlayState::Buffering => "BUFFERING",
            PlayState::Paused => "PAUSED",
            PlayState::Playing => "PLAYING",
        }
    }

    pub fn parse(s: &str) -> Option<PlayState> {
        match s {
            "IDLE" => Some(PlayState::Idle),
            "STOPPED" => Some(PlayState::Stopped),
            "BUFFERING" => Some(PlayState::Buffering),
            "PAUSED" => Some(PlayState::Paused),
            "PLAYING" => Some(PlayState::Playing),
            _ => None,
        }
    }
}

impl Default for PlayState {
    fn default() -> Self {
        PlayState::Idle
    }
}

/// Media types, persisted as their upper-case names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MediaType {
    Audio,
    Video,
}

impl MediaType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaType::Audio => "AUDIO",
            MediaType::Video => "VIDEO",
        }
    }

    pub fn parse(s: &str) -> Option<MediaType> {
        match s {
            "AUDIO" => Some(MediaType::Audio),
            "VIDEO" => Some(MediaType::Video),
            _ => None,
        }
    }
}

impl Default for MediaType {
    fn default() -> Self {
        MediaType::Audio
    }
}

/// A real-world media player, like a streaming stick or cast target.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MediaPlayer {
    #[serde(flatten)]
    pub base: BaseComponent,
    pub state: MediaPlayerState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub specs: Option<MediaPlayerSpecs>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stats: Option<MediaPlayerStats>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaPlayerState {
    pub play_state: PlayState,
    pub media_type: MediaType,
    /// YouTube, Netflix, Plex, etc.
    pub source: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaPlayerSpecs {
    pub supported_audio_types: String,
    pub supported_video_types: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaPlayerStats {
    pub hours_on: i64,
}

/// A real-world speaker.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Speaker {
    #[serde(flatten)]
    pub base: BaseComponent,
    pub state: SpeakerState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub specs: Option<SpeakerSpecs>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpeakerState {
    pub output_in_percent: u8,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpeakerSpecs {
    pub max_output_in_decibels: i64,
    pub min_output_in_decibels: i64,
    pub expected_lifetime_in_hours: i64,
}

/// A desire for a specific Component to behave in a particular way.
/// Intents are applied, never stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Intent {
    SetLightEmitter { brightness_in_percent: u8 },
    SetMediaPlayer { play_state: PlayState },
    SetSpeaker { output_in_percent: u8 },
}

impl Intent {
    pub fn kind(&self) -> &'static str {
        match self {
            Intent::SetLightEmitter { .. } => "set_light_emitter",
            Intent::SetMediaPlayer { .. } => "set_media_player",
            Intent::SetSpeaker { .. } => "set_speaker",
        }
    }
}
