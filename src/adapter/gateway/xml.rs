//! Vendor XML for the lighting gateway
//!
//! The gateway speaks a small fixed XML dialect over form-POSTs. The
//! documents are flat and unnamespaced, so they are read with simple
//! tag-extraction helpers rather than a full XML parser; every value we care
//! about lives in a leaf element.

use crate::error::{Error, Result};
use crate::types::{
    BaseComponent, Component, Device, ExternalDeviceID, LightEmitter, LightEmitterState,
};
use std::collections::BTreeMap;

/// The manufacturer recorded for devices discovered through the gateway.
pub const MANUFACTURER: &str = "tcp";

/// Catalog identity of the gateway bulb model.
pub const BULB_MAKE: &str = "connected_by_tcp";
pub const BULB_MODEL: &str = "bulb";

/// Extract the text content of the first `<tag>...</tag>` element.
pub fn extract_value(xml: &str, tag: &str) -> Option<String> {
    let open = format!("<{tag}>");
    let close = format!("</{tag}>");
    let start = xml.find(&open)? + open.len();
    let end = xml[start..].find(&close)? + start;
    Some(xml[start..end].to_string())
}

/// Extract every `<tag>...</tag>` block, including the surrounding tags.
fn extract_blocks<'a>(xml: &'a str, tag: &str) -> Vec<&'a str> {
    let open = format!("<{tag}>");
    let close = format!("</{tag}>");
    let mut blocks = Vec::new();
    let mut rest = xml;
    while let Some(start) = rest.find(&open) {
        let Some(end) = rest[start..].find(&close) else {
            break;
        };
        let end = start + end + close.len();
        blocks.push(&rest[start..end]);
        rest = &rest[end..];
    }
    blocks
}

/// The gateway's reply to a GWRLogin command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginReply {
    pub rc: String,
    pub token: Option<String>,
}

/// Parse a login reply. An `rc` of "200" with a token means success;
/// anything else means the gateway is not paired with us.
pub fn parse_login_reply(xml: &str) -> Result<LoginReply> {
    let rc = extract_value(xml, "rc")
        .ok_or_else(|| Error::Parse(format!("login reply carries no <rc> element: {xml}")))?;
    Ok(LoginReply {
        rc,
        token: extract_value(xml, "token").filter(|t| !t.is_empty()),
    })
}

/// One device as described in a RoomGetCarousel reply.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GatewayDevice {
    pub did: String,
    pub name: String,
    /// Present (non-empty) iff the gateway reports the device offline.
    pub offline: Option<String>,
    /// 0 means the bulb is switched off regardless of level.
    pub state: Option<i64>,
    /// Output level in percent.
    pub level: Option<i64>,
}

/// Parse every device out of a RoomGetCarousel reply. The reply nests
/// rooms inside gips inside gwrcmds; device blocks are what we need.
pub fn parse_carousel_devices(xml: &str) -> Result<Vec<GatewayDevice>> {
    let rc = extract_value(xml, "rc");
    if let Some(rc) = &rc {
        if rc != "200" {
            return Err(Error::AuthFailed {
                message: format!("gateway rejected the device query with rc={rc}"),
                user_action: "press the pairing button".to_string(),
            });
        }
    }

    let mut devices = Vec::new();
    for block in extract_blocks(xml, "device") {
        let did = extract_value(block, "did")
            .ok_or_else(|| Error::Parse(format!("device block carries no <did>: {block}")))?;
        let parse_int = |tag: &str| -> Result<Option<i64>> {
            match extract_value(block, tag) {
                None => Ok(None),
                Some(raw) if raw.is_empty() => Ok(None),
                Some(raw) => raw.parse().map(Some).map_err(|e| {
                    Error::Parse(format!("device <{tag}> value {raw:?} is not a number: {e}"))
                }),
            }
        };
        devices.push(GatewayDevice {
            did,
            name: extract_value(block, "name").unwrap_or_default(),
            offline: extract_value(block, "offline").filter(|v| !v.is_empty()),
            state: parse_int("state")?,
            level: parse_int("level")?,
        });
    }
    Ok(devices)
}

/// Convert a gateway device into the SIFT model. The gateway reports a
/// state flag (0 = switched off) and a level; level 0 while switched on
/// still means the bulb is technically on, so it maps to 1%.
pub fn device_to_sift(device: &GatewayDevice) -> (ExternalDeviceID, Device) {
    let output_in_percent: u8 = match (device.state, device.level) {
        (Some(0), _) => 0,
        (Some(_), Some(0)) => 1,
        (Some(_), Some(level)) => level.clamp(0, 100) as u8,
        _ => 0,
    };

    let mut components = BTreeMap::new();
    components.insert(
        device.did.clone(),
        Component::LightEmitter(LightEmitter {
            base: BaseComponent {
                make: BULB_MAKE.to_string(),
                model: BULB_MODEL.to_string(),
            },
            state: LightEmitterState {
                brightness_in_percent: output_in_percent,
            },
            specs: None,
            stats: None,
        }),
    );

    let id = ExternalDeviceID::new(MANUFACTURER, device.did.clone());
    let sift_device = Device {
        name: Some(format!("Gateway bulb {}", device.name)),
        is_online: device.offline.is_none(),
        components,
    };
    (id, sift_device)
}

/// The form body of a GWRLogin command for the given principal.
pub fn login_command(principal: &str) -> String {
    format!(
        "<gip><version>1</version><email>{principal}</email><password>{principal}</password></gip>"
    )
}

/// The form body of a RoomGetCarousel batch query.
pub fn carousel_command(token: &str) -> String {
    format!(
        "<gwrcmds><gwrcmd><gcmd>RoomGetCarousel</gcmd><gdata><gip><version>1</version>\
         <token>{token}</token><fields>name,control,power,product,status</fields>\
         </gip></gdata></gwrcmd></gwrcmds>"
    )
}

/// The form body of the DeviceSendCommand pair that sets a bulb's level and
/// its on/off flag.
pub fn set_level_command(token: &str, did: &str, level: u8, is_on: bool) -> String {
    let on = if is_on { "1" } else { "0" };
    format!(
        "<gwrcmds>\
         <gwrcmd><gcmd>DeviceSendCommand</gcmd><gdata><gip><version>1</version>\
         <token>{token}</token><did>{did}</did><value>{level}</value><type>level</type>\
         </gip></gdata></gwrcmd>\
         <gwrcmd><gcmd>DeviceSendCommand</gcmd><gdata><gip><version>1</version>\
         <token>{token}</token><did>{did}</did><value>{on}</value>\
         </gip></gdata></gwrcmd>\
         </gwrcmds>"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn login_reply_with_token_parses() {
        let xml = "<gip><version>1</version><rc>200</rc><token>abcd1234</token></gip>";
        let reply = parse_login_reply(xml).unwrap();
        assert_eq!(reply.rc, "200");
        assert_eq!(reply.token.as_deref(), Some("abcd1234"));
    }

    #[test]
    fn login_reply_with_error_code_parses_without_token() {
        let xml = "<gip><version>1</version><rc>404</rc></gip>";
        let reply = parse_login_reply(xml).unwrap();
        assert_eq!(reply.rc, "404");
        assert_eq!(reply.token, None);
    }

    #[test]
    fn login_reply_without_rc_is_a_parse_error() {
        assert!(matches!(
            parse_login_reply("<gip><version>1</version></gip>"),
            Err(Error::Parse(_))
        ));
    }

    #[test]
    fn carousel_devices_parse_from_nested_rooms() {
        let xml = "<gwrcmds><gwrcmd><gcmd>RoomGetCarousel</gcmd><gdata><gip><rc>200</rc>\
                   <room><rid>1</rid>\
                   <device><did>216500</did><name>Porch</name><state>1</state><level>74</level></device>\
                   <device><did>216501</did><name>Hall</name><state>0</state><level>80</level></device>\
                   </room>\
                   <room><rid>2</rid>\
                   <device><did>216502</did><name>Attic</name><offline>1</offline><state>1</state><level>0</level></device>\
                   </room>\
                   </gip></gdata></gwrcmd></gwrcmds>";
        let devices = parse_carousel_devices(xml).unwrap();
        assert_eq!(devices.len(), 3);
        assert_eq!(devices[0].did, "216500");
        assert_eq!(devices[0].level, Some(74));
        assert_eq!(devices[1].state, Some(0));
        assert!(devices[2].offline.is_some());
    }

    #[test]
    fn carousel_with_auth_error_code_asks_for_pairing() {
        let xml = "<gwrcmds><gwrcmd><gcmd>RoomGetCarousel</gcmd><gdata><gip><rc>401</rc>\
                   </gip></gdata></gwrcmd></gwrcmds>";
        match parse_carousel_devices(xml) {
            Err(Error::AuthFailed { user_action, .. }) => {
                assert_eq!(user_action, "press the pairing button");
            }
            other => panic!("expected AuthFailed, got {other:?}"),
        }
    }

    #[test]
    fn switched_off_bulb_maps_to_zero_output() {
        let (_, device) = device_to_sift(&GatewayDevice {
            did: "1".to_string(),
            name: "Porch".to_string(),
            offline: None,
            state: Some(0),
            level: Some(80),
        });
        match &device.components["1"] {
            Component::LightEmitter(le) => assert_eq!(le.state.brightness_in_percent, 0),
            other => panic!("expected light emitter, got {other:?}"),
        }
    }

    #[test]
    fn level_zero_while_on_maps_to_one_percent() {
        let (_, device) = device_to_sift(&GatewayDevice {
            did: "1".to_string(),
            name: "Porch".to_string(),
            offline: None,
            state: Some(1),
            level: Some(0),
        });
        match &device.components["1"] {
            Component::LightEmitter(le) => assert_eq!(le.state.brightness_in_percent, 1),
            other => panic!("expected light emitter, got {other:?}"),
        }
    }

    #[test]
    fn offline_marker_clears_is_online() {
        let (id, device) = device_to_sift(&GatewayDevice {
            did: "9".to_string(),
            name: "Attic".to_string(),
            offline: Some("1".to_string()),
            state: Some(1),
            level: Some(50),
        });
        assert_eq!(id, ExternalDeviceID::new(MANUFACTURER, "9"));
        assert!(!device.is_online);
    }

    #[test]
    fn commands_embed_their_arguments() {
        assert!(login_command("u-1").contains("<email>u-1</email>"));
        assert!(carousel_command("tok").contains("<token>tok</token>"));
        let cmd = set_level_command("tok", "216500", 42, true);
        assert!(cmd.contains("<did>216500</did>"));
        assert!(cmd.contains("<value>42</value>"));
        assert!(cmd.contains("<value>1</value>"));
    }
}
