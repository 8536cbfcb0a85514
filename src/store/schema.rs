//! SIFT database schema and catalog seed data.
//!
//! The schema is applied with `CREATE TABLE IF NOT EXISTS` so opening an
//! existing database is idempotent. Spec catalogs are keyed by (make, model)
//! and seeded here; adapters never write them.

pub const INIT_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS device (
    id            INTEGER PRIMARY KEY AUTOINCREMENT,
    manufacturer  TEXT NOT NULL,
    external_id   TEXT NOT NULL,
    name          TEXT,
    is_online     INTEGER NOT NULL DEFAULT 0,
    location_id   INTEGER REFERENCES location(id),
    UNIQUE (manufacturer, external_id)
);

CREATE TABLE IF NOT EXISTS component (
    id         INTEGER PRIMARY KEY AUTOINCREMENT,
    device_id  INTEGER NOT NULL REFERENCES device(id),
    name       TEXT NOT NULL,
    make       TEXT NOT NULL,
    model      TEXT NOT NULL,
    kind       TEXT NOT NULL,
    UNIQUE (device_id, name)
);

CREATE TABLE IF NOT EXISTS light_emitter_state (
    id                     INTEGER PRIMARY KEY REFERENCES component(id),
    brightness_in_percent  INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS media_player_state (
    id          INTEGER PRIMARY KEY REFERENCES component(id),
    play_state  TEXT NOT NULL,
    media_type  TEXT NOT NULL,
    source      TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS speaker_state (
    id                 INTEGER PRIMARY KEY REFERENCES component(id),
    output_in_percent  INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS light_emitter_spec (
    make                        TEXT NOT NULL,
    model                       TEXT NOT NULL,
    max_output_in_lumens        INTEGER NOT NULL,
    min_output_in_lumens        INTEGER NOT NULL,
    expected_lifetime_in_hours  INTEGER NOT NULL,
    PRIMARY KEY (make, model)
);

CREATE TABLE IF NOT EXISTS media_player_spec (
    make                   TEXT NOT NULL,
    model                  TEXT NOT NULL,
    supported_audio_types  TEXT NOT NULL,
    supported_video_types  TEXT NOT NULL,
    PRIMARY KEY (make, model)
);

CREATE TABLE IF NOT EXISTS location (
    id    INTEGER PRIMARY KEY AUTOINCREMENT,
    name  TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS adapter_credential (
    adapter_name  TEXT NOT NULL,
    key           TEXT NOT NULL,
    value         TEXT NOT NULL,
    PRIMARY KEY (adapter_name, key)
);
"#;

pub const POPULATE_SPECS_SQL: &str = r#"
INSERT OR IGNORE INTO light_emitter_spec
    (make, model, max_output_in_lumens, min_output_in_lumens, expected_lifetime_in_hours)
VALUES
    ('demo', 'lamp_v1', 700, 0, 10000),
    ('connected_by_tcp', 'bulb', 800, 0, 25000),
    ('philips', 'hue_a19', 806, 0, 25000);

INSERT OR IGNORE INTO media_player_spec
    (make, model, supported_audio_types, supported_video_types)
VALUES
    ('google', 'chromecast', 'aac,mp3,wav', 'h264,vp8');
"#;
