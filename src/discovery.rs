//! Home Assistant MQTT discovery payloads for the demo lab devices.

use serde_json::{json, Value};

const DISCOVERY_PREFIX: &str = "homeassistant";

pub fn motion_sensor(name: &str) -> Value {
    json!({
        "name": name,
        "device_class": "motion",
        "state_topic": format!("{DISCOVERY_PREFIX}/binary_sensor/{name}/state"),
    })
}

pub fn temperature_sensor(name: &str) -> Value {
    json!({
        "name": name,
        "device_class": "temperature",
        "state_topic": format!("{DISCOVERY_PREFIX}/sensor/{name}/state"),
        "value_template": "{{ value_json.temperature }}",
    })
}

pub fn humidity_sensor(name: &str) -> Value {
    json!({
        "name": name,
        "unique_id": format!("{name}_humidity"),
        "device_class": "humidity",
        "state_topic": format!("{DISCOVERY_PREFIX}/sensor/{name}/state"),
        "unit_of_measurement": "%",
        "value_template": "{{ value_json.humidity }}",
    })
}

pub fn light(name: &str) -> Value {
    json!({
        "name": name,
        "unique_id": format!("{name}_light"),
        "command_topic": format!("{DISCOVERY_PREFIX}/light/{name}/set"),
        "state_topic": format!("{DISCOVERY_PREFIX}/light/{name}/state"),
        "schema": "json",
        "brightness": true,
    })
}

pub fn climate(name: &str) -> Value {
    let base = format!("{DISCOVERY_PREFIX}/climate/{name}");
    json!({
        "name": name,
        "mode_cmd_t": format!("{base}/thermostatModeCmd"),
        "mode_stat_t": format!("{base}/state"),
        "mode_stat_tpl": "",
        "avty_t": format!("{base}/available"),
        "pl_avail": "online",
        "pl_not_avail": "offline",
        "temp_cmd_t": format!("{base}/targetTempCmd"),
        "temp_stat_t": format!("{base}/state"),
        "state_topic": format!("{base}/state"),
        "temp_stat_tpl": "",
        "curr_temp_t": format!("{base}/state"),
        "curr_temp_tpl": "",
        "min_temp": "60",
        "max_temp": "110",
        "temp_step": "1.0",
        "modes": ["off", "heat"],
    })
}

/// The config topic sits next to the state topic: `<prefix>/<component>/<name>/config`.
pub fn config_topic(discovery: &Value) -> Option<String> {
    let state_topic = discovery.get("state_topic")?.as_str()?;
    let (device, _) = state_topic.rsplit_once('/')?;
    Some(format!("{device}/config"))
}

/// Topic and JSON payload for every demo device announced after connecting.
pub fn demo_device_messages() -> Vec<(String, String)> {
    [
        motion_sensor("bedroom-motion1"),
        temperature_sensor("bedroom-temp1"),
        humidity_sensor("bedroom-temp1"),
        light("bedroom-light1"),
        climate("bedroom-heater1"),
    ]
    .into_iter()
    .filter_map(|config| Some((config_topic(&config)?, config.to_string())))
    .collect()
}
