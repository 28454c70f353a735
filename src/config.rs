//! Layered JSON configuration: `debug_conf.json` alone if present, otherwise
//! `global_conf.json` overlaid by an optional `local_conf.json` (local wins
//! per leaf). Two top-level objects are recognised: `SX1301_conf` (hardware
//! tuning, submitted to the HAL) and `gateway_conf` (everything else).

use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::Value;
use tracing::{info, warn};

use crate::error::Error;
use crate::gps::Coord;
use crate::hal::{
    LgwConfBoard, LgwConfRxIf, LgwConfRxRf, LgwHal, LgwTxGain, BW_125KHZ, BW_250KHZ, BW_500KHZ,
    BW_UNDEFINED, LGW_MULTI_NB, LGW_RF_CHAIN_NB, TX_GAIN_LUT_SIZE_MAX,
};

pub const GLOBAL_CONF_PATH: &str = "global_conf.json";
pub const LOCAL_CONF_PATH: &str = "local_conf.json";
pub const DEBUG_CONF_PATH: &str = "debug_conf.json";

/* support up to 4 servers, more does not seem realistic */
pub const MAX_SERVERS: usize = 4;

pub const DEFAULT_SERVER: &str = "127.0.0.1";
pub const DEFAULT_PORT_UP: u16 = 1780;
pub const DEFAULT_PORT_DW: u16 = 1782;
pub const DEFAULT_KEEPALIVE: u64 = 5; /* default time interval for downstream keep-alive packet */
pub const DEFAULT_STAT: u64 = 30; /* default time interval for statistics */
pub const PUSH_TIMEOUT_MS: u64 = 100;
pub const PULL_TIMEOUT_MS: u64 = 200;

const DISPLAY_PLATFORM: &str = "undefined";

#[derive(Debug, Clone, PartialEq)]
pub struct ServerConf {
    pub address: String,
    pub port_up: u16,
    pub port_down: u16,
}

mod eui_serde {
    use serde::{de, Deserialize, Deserializer};

    /* the gateway EUI-64 is configured as a hex string */
    pub fn deserialize<'de, D>(deserializer: D) -> Result<u64, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s: Option<String> = Option::deserialize(deserializer)?;
        match s {
            None => Ok(0),
            Some(s) => u64::from_str_radix(&s, 16)
                .map_err(|_| de::Error::custom(format!("invalid gateway_ID \"{}\"", s))),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
struct RawServer {
    server_address: Option<String>,
    serv_port_up: Option<u16>,
    serv_port_down: Option<u16>,
    serv_enabled: Option<bool>,
}

fn default_true() -> bool {
    true
}

fn default_beacon_period() -> u32 {
    128 /* must be a sub-multiple of 86400, the nb of sec in a day */
}

fn default_ghost_addr() -> String {
    DEFAULT_SERVER.to_string()
}

fn default_ghost_port() -> u16 {
    1914
}

fn default_monitor_port() -> u16 {
    2008
}

#[derive(Debug, Clone, Deserialize)]
pub struct GatewayConf {
    /* gateway unique identifier (aka MAC address) */
    #[serde(rename = "gateway_ID", default, with = "eui_serde")]
    pub gateway_id: u64,

    #[serde(default)]
    servers: Option<Vec<RawServer>>,
    /* old fashioned single server definition, used when no server array is present */
    #[serde(default)]
    server_address: Option<String>,
    #[serde(default)]
    serv_port_up: Option<u16>,
    #[serde(default)]
    serv_port_down: Option<u16>,
    #[serde(skip)]
    pub server_list: Vec<ServerConf>,

    #[serde(default = "keepalive_default")]
    pub keepalive_interval: u64,
    #[serde(default = "stat_default")]
    pub stat_interval: u64,
    #[serde(default = "push_timeout_default")]
    pub push_timeout_ms: u64,

    /* packet filtering parameters */
    #[serde(default = "default_true")]
    pub forward_crc_valid: bool,
    #[serde(default)]
    pub forward_crc_error: bool,
    #[serde(default)]
    pub forward_crc_disabled: bool,

    #[serde(default)]
    pub gps_tty_path: Option<String>,
    #[serde(default)]
    pub ref_latitude: f64,
    #[serde(default)]
    pub ref_longitude: f64,
    #[serde(default)]
    pub ref_altitude: i16,
    #[serde(default)]
    pub gps: bool,
    #[serde(default)]
    pub fake_gps: bool,

    #[serde(default = "default_beacon_period")]
    pub beacon_period: u32,
    #[serde(default)]
    pub beacon_offset: u32,
    #[serde(default)]
    pub beacon_freq_hz: u32,

    /* control over the separate streams; per default the system behaves
    like a basic packet forwarder */
    #[serde(default = "default_true")]
    pub upstream: bool,
    #[serde(default = "default_true")]
    pub downstream: bool,
    #[serde(default)]
    pub ghoststream: bool,
    #[serde(default = "default_true")]
    pub radiostream: bool,
    #[serde(default = "default_true")]
    pub statusstream: bool,
    #[serde(default)]
    pub beacon: bool,
    #[serde(default)]
    pub monitor: bool,

    /* enable auto-quit after a number of non-acknowledged PULL_DATA (0 = disabled) */
    #[serde(default)]
    pub autoquit_threshold: u32,

    /* informal status fields */
    #[serde(default, rename = "platform")]
    platform_raw: Option<String>,
    #[serde(skip)]
    pub platform: String,
    #[serde(default, rename = "contact_email")]
    pub email: String,
    #[serde(default)]
    pub description: String,

    #[serde(default = "default_ghost_addr")]
    pub ghost_address: String,
    #[serde(default = "default_ghost_port")]
    pub ghost_port: u16,
    #[serde(default = "default_ghost_addr")]
    pub monitor_address: String,
    #[serde(default = "default_monitor_port")]
    pub monitor_port: u16,
    #[serde(default)]
    pub system_calls: Vec<String>,
}

fn keepalive_default() -> u64 {
    DEFAULT_KEEPALIVE
}

fn stat_default() -> u64 {
    DEFAULT_STAT
}

fn push_timeout_default() -> u64 {
    PUSH_TIMEOUT_MS
}

impl GatewayConf {
    pub fn reference_coord(&self) -> Coord {
        Coord {
            lat: self.ref_latitude,
            lon: self.ref_longitude,
            alt: self.ref_altitude,
        }
    }

    /// Resolve the server list and informal fields, logging the effective
    /// configuration the way the daemon always has.
    fn finalize(&mut self) {
        if self.gateway_id != 0 {
            info!("INFO: gateway MAC address is configured to {:016X}", self.gateway_id);
        }

        let mut list = Vec::new();
        if let Some(servers) = self.servers.take() {
            info!("INFO: Found {} servers in array.", servers.len());
            for raw in servers {
                if list.len() >= MAX_SERVERS {
                    break;
                }
                /* no server name: silently progress to the next entry */
                let Some(address) = raw.server_address else {
                    continue;
                };
                let (Some(port_up), Some(port_down)) = (raw.serv_port_up, raw.serv_port_down)
                else {
                    info!("INFO: Skipping server \"{}\" with at least one invalid port number", address);
                    continue;
                };
                if raw.serv_enabled == Some(false) {
                    info!("INFO: Skipping disabled server \"{}\"", address);
                    continue;
                }
                info!(
                    "INFO: Server {} configured to \"{}\", with port up {} and port down {}",
                    list.len(),
                    address,
                    port_up,
                    port_down
                );
                list.push(ServerConf { address, port_up, port_down });
            }
        } else if let (Some(address), Some(port_up), Some(port_down)) = (
            self.server_address.take(),
            self.serv_port_up,
            self.serv_port_down,
        ) {
            /* fall back to the old single server definition, requiring a
            complete triple */
            info!(
                "INFO: Server configured to \"{}\", with port up {} and port down {}",
                address, port_up, port_down
            );
            list.push(ServerConf { address, port_up, port_down });
        }
        if list.is_empty() {
            info!("INFO: Using defaults for server and ports");
            list.push(ServerConf {
                address: DEFAULT_SERVER.to_string(),
                port_up: DEFAULT_PORT_UP,
                port_down: DEFAULT_PORT_DW,
            });
        }
        self.server_list = list;

        /* platform read and override; "*" keeps the built-in value */
        self.platform = match self.platform_raw.take() {
            Some(p) if p != "*" => p,
            _ => DISPLAY_PLATFORM.to_string(),
        };

        info!(
            "INFO: packets received with a valid CRC will{} be forwarded",
            if self.forward_crc_valid { "" } else { " NOT" }
        );
        info!(
            "INFO: packets received with a CRC error will{} be forwarded",
            if self.forward_crc_error { "" } else { " NOT" }
        );
        info!(
            "INFO: packets received with no CRC will{} be forwarded",
            if self.forward_crc_disabled { "" } else { " NOT" }
        );
        info!("INFO: GPS is {}", if self.gps { "enabled" } else { "disabled" });
        if self.gps && self.fake_gps {
            info!("INFO: Using fake GPS coordinates instead of real.");
        }
        if self.autoquit_threshold > 0 {
            info!("INFO: Auto-quit after {} non-acknowledged PULL_DATA", self.autoquit_threshold);
        }
        for (name, enabled) in [
            ("Upstream", self.upstream),
            ("Downstream", self.downstream),
            ("Ghoststream", self.ghoststream),
            ("Radiostream", self.radiostream),
            ("Statusstream", self.statusstream),
            ("Beacon", self.beacon),
            ("Monitor", self.monitor),
        ] {
            info!("INFO: {} is {}", name, if enabled { "enabled" } else { "disabled" });
        }
    }
}

/* LoRa standard channel and FSK channel carry their tuning in raw Hz, to be
mapped onto the HAL bandwidth codes */
#[derive(Debug, Clone, Copy, Default, Deserialize)]
struct RawChanStd {
    #[serde(default)]
    enable: bool,
    #[serde(default)]
    radio: u8,
    #[serde(rename = "if", default)]
    freq_hz: i32,
    #[serde(default)]
    bandwidth: u32,
    #[serde(default)]
    spread_factor: u32,
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
struct RawChanFsk {
    #[serde(default)]
    enable: bool,
    #[serde(default)]
    radio: u8,
    #[serde(rename = "if", default)]
    freq_hz: i32,
    #[serde(default)]
    bandwidth: u32,
    #[serde(default)]
    freq_deviation: u32,
    #[serde(default)]
    datarate: u32,
}

fn bandwidth_code(bw: u32) -> u8 {
    match bw {
        500000 => BW_500KHZ,
        250000 => BW_250KHZ,
        125000 => BW_125KHZ,
        _ => BW_UNDEFINED,
    }
}

#[derive(Debug, Clone, Default)]
pub struct Sx1301Conf {
    pub board: LgwConfBoard,
    pub txlut: Vec<LgwTxGain>,
    pub rf_chains: Vec<(u8, LgwConfRxRf)>,
    pub if_chains: Vec<(u8, LgwConfRxIf)>,
    pub lora_std: Option<LgwConfRxIf>,
    pub fsk: Option<LgwConfRxIf>,
}

impl Sx1301Conf {
    /// Extract the hardware configuration from the `SX1301_conf` object.
    pub fn from_value(conf_obj: &Value) -> Result<Self> {
        let mut conf = Sx1301Conf::default();

        if let Some(val) = conf_obj.get("lorawan_public").and_then(Value::as_bool) {
            conf.board.lorawan_public = val;
        } else {
            warn!("WARNING: Data type for lorawan_public seems wrong, please check");
        }
        if let Some(val) = conf_obj.get("clksrc").and_then(Value::as_u64) {
            conf.board.clksrc = val as u8;
        } else {
            warn!("WARNING: Data type for clksrc seems wrong, please check");
        }
        info!(
            "INFO: lorawan_public {}, clksrc {}",
            conf.board.lorawan_public, conf.board.clksrc
        );

        /* TX gain table */
        for i in 0..TX_GAIN_LUT_SIZE_MAX {
            let Some(val) = conf_obj.get(format!("tx_lut_{}", i)) else {
                continue;
            };
            match serde_json::from_value::<LgwTxGain>(val.clone()) {
                Ok(gain) => conf.txlut.push(gain),
                Err(e) => warn!("WARNING: invalid configuration for tx_lut_{}: {}", i, e),
            }
        }
        info!("INFO: Configuring TX LUT with {} indexes", conf.txlut.len());

        /* RF chains */
        for i in 0..LGW_RF_CHAIN_NB {
            let Some(val) = conf_obj.get(format!("radio_{}", i)) else {
                info!("INFO: no configuration for radio {}", i);
                continue;
            };
            match serde_json::from_value::<LgwConfRxRf>(val.clone()) {
                Ok(rfconf) => {
                    if rfconf.enable {
                        info!(
                            "INFO: radio {} enabled, center frequency {}, RSSI offset {}, tx enabled {}",
                            i, rfconf.freq_hz, rfconf.rssi_offset, rfconf.tx_enable
                        );
                    } else {
                        info!("INFO: radio {} disabled", i);
                    }
                    conf.rf_chains.push((i, rfconf));
                }
                Err(e) => warn!("WARNING: invalid configuration for radio {}: {}", i, e),
            }
        }

        /* LoRa multi-SF channels (bandwidth cannot be set) */
        for i in 0..LGW_MULTI_NB {
            let Some(val) = conf_obj.get(format!("chan_multiSF_{}", i)) else {
                info!("INFO: no configuration for LoRa multi-SF channel {}", i);
                continue;
            };
            match serde_json::from_value::<LgwConfRxIf>(val.clone()) {
                Ok(ifconf) => {
                    if ifconf.enable {
                        info!(
                            "INFO: LoRa multi-SF channel {}> radio {}, IF {} Hz, 125 kHz bw, SF 7 to 12",
                            i, ifconf.rf_chain, ifconf.freq_hz
                        );
                    } else {
                        info!("INFO: LoRa multi-SF channel {} disabled", i);
                    }
                    conf.if_chains.push((i, ifconf));
                }
                Err(e) => {
                    warn!("WARNING: invalid configuration for LoRa multi-SF channel {}: {}", i, e)
                }
            }
        }

        /* LoRa standard channel */
        match conf_obj.get("chan_Lora_std") {
            None => info!("INFO: no configuration for LoRa standard channel"),
            Some(val) => match serde_json::from_value::<RawChanStd>(val.clone()) {
                Ok(raw) => {
                    info!(
                        "INFO: LoRa std channel> radio {}, IF {} Hz, {} Hz bw, SF {}",
                        raw.radio, raw.freq_hz, raw.bandwidth, raw.spread_factor
                    );
                    conf.lora_std = Some(LgwConfRxIf {
                        enable: raw.enable,
                        rf_chain: raw.radio,
                        freq_hz: raw.freq_hz,
                        bandwidth: bandwidth_code(raw.bandwidth),
                        datarate: raw.spread_factor,
                    });
                }
                Err(e) => warn!("WARNING: invalid configuration for LoRa standard channel: {}", e),
            },
        }

        /* FSK channel */
        match conf_obj.get("chan_FSK") {
            None => info!("INFO: no configuration for FSK channel"),
            Some(val) => match serde_json::from_value::<RawChanFsk>(val.clone()) {
                Ok(raw) => {
                    /* if chan_FSK.bandwidth is set, it has priority over
                    chan_FSK.freq_deviation */
                    let bw = if raw.bandwidth == 0 && raw.freq_deviation != 0 {
                        2 * raw.freq_deviation + raw.datarate
                    } else {
                        raw.bandwidth
                    };
                    let bandwidth = if bw == 0 {
                        BW_UNDEFINED
                    } else if bw <= 125000 {
                        BW_125KHZ
                    } else if bw <= 250000 {
                        BW_250KHZ
                    } else if bw <= 500000 {
                        BW_500KHZ
                    } else {
                        BW_UNDEFINED
                    };
                    info!(
                        "INFO: FSK channel> radio {}, IF {} Hz, {} Hz bw, {} bps datarate",
                        raw.radio, raw.freq_hz, bw, raw.datarate
                    );
                    conf.fsk = Some(LgwConfRxIf {
                        enable: raw.enable,
                        rf_chain: raw.radio,
                        freq_hz: raw.freq_hz,
                        bandwidth,
                        datarate: raw.datarate,
                    });
                }
                Err(e) => warn!("WARNING: invalid configuration for FSK channel: {}", e),
            },
        }

        Ok(conf)
    }

    /// Submit the parsed configuration to the HAL, warning (not failing) on
    /// rejected sections like the daemon always has.
    pub fn configure(&self, hal: &mut dyn LgwHal) {
        if hal.lgw_board_setconf(&self.board).is_err() {
            warn!("WARNING: Failed to configure board");
        }
        if !self.txlut.is_empty() && hal.lgw_txgain_setconf(&self.txlut).is_err() {
            warn!("WARNING: Failed to configure concentrator TX Gain LUT");
        }
        for (i, rfconf) in &self.rf_chains {
            if hal.lgw_rxrf_setconf(*i, rfconf).is_err() {
                warn!("WARNING: invalid configuration for radio {}", i);
            }
        }
        for (i, ifconf) in &self.if_chains {
            if hal.lgw_rxif_setconf(*i, ifconf).is_err() {
                warn!("WARNING: invalid configuration for LoRa multi-SF channel {}", i);
            }
        }
        if let Some(ifconf) = &self.lora_std {
            if hal.lgw_rxif_setconf(8, ifconf).is_err() {
                warn!("WARNING: invalid configuration for LoRa standard channel");
            }
        }
        if let Some(ifconf) = &self.fsk {
            if hal.lgw_rxif_setconf(9, ifconf).is_err() {
                warn!("WARNING: invalid configuration for FSK channel");
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub gateway: GatewayConf,
    pub sx1301: Option<Sx1301Conf>,
}

fn read_json(path: &Path) -> Result<Value> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&text)
        .with_context(|| format!("{} is not a valid JSON file", path.display()))
}

/// Merge `overlay` into `base`: objects merge per key, everything else is
/// replaced. Redefined parameters overwrite global parameters.
fn merge(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                match base_map.get_mut(&key) {
                    Some(existing) => merge(existing, value),
                    None => {
                        base_map.insert(key, value);
                    }
                }
            }
        }
        (base_slot, overlay) => *base_slot = overlay,
    }
}

fn parse(root: Value) -> Result<Config> {
    let sx1301 = match root.get("SX1301_conf") {
        Some(obj) if obj.is_object() => Some(Sx1301Conf::from_value(obj)?),
        _ => {
            info!("INFO: no SX1301_conf object in configuration");
            None
        }
    };

    let gateway_obj = match root.get("gateway_conf") {
        Some(obj) if obj.is_object() => obj.clone(),
        _ => {
            info!("INFO: configuration does not contain a gateway_conf object, using defaults");
            Value::Object(Default::default())
        }
    };
    let mut gateway: GatewayConf =
        serde_json::from_value(gateway_obj).context("invalid gateway_conf")?;
    gateway.finalize();

    Ok(Config { gateway, sx1301 })
}

/// Load the configuration from `dir` following the historical layering
/// rules. Finding no configuration file at all is fatal.
pub fn load_from_dir(dir: &Path) -> Result<Config> {
    let debug_path = dir.join(DEBUG_CONF_PATH);
    let global_path = dir.join(GLOBAL_CONF_PATH);
    let local_path = dir.join(LOCAL_CONF_PATH);

    if debug_path.is_file() {
        /* if there is a debug conf, parse only the debug conf */
        info!("INFO: found debug configuration file {}, parsing it", debug_path.display());
        info!("INFO: other configuration files will be ignored");
        return parse(read_json(&debug_path)?);
    }
    if global_path.is_file() {
        /* parse the global conf, then overlay the local conf if any */
        info!("INFO: found global configuration file {}, parsing it", global_path.display());
        let mut root = read_json(&global_path)?;
        if local_path.is_file() {
            info!("INFO: found local configuration file {}, parsing it", local_path.display());
            info!("INFO: redefined parameters will overwrite global parameters");
            merge(&mut root, read_json(&local_path)?);
        }
        return parse(root);
    }
    if local_path.is_file() {
        info!("INFO: found local configuration file {}, parsing it", local_path.display());
        return parse(read_json(&local_path)?);
    }
    warn!(
        "ERROR: [main] failed to find any configuration file named {}, {} OR {}",
        global_path.display(),
        local_path.display(),
        debug_path.display()
    );
    Err(Error::NO_CONFIG.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn parse_gateway(json: &str) -> Config {
        parse(serde_json::from_str(json).unwrap()).unwrap()
    }

    #[test]
    fn defaults_without_servers() {
        let config = parse_gateway(r#"{"gateway_conf":{}}"#);
        let gw = &config.gateway;
        assert_eq!(gw.gateway_id, 0);
        assert_eq!(gw.keepalive_interval, DEFAULT_KEEPALIVE);
        assert_eq!(gw.stat_interval, DEFAULT_STAT);
        assert_eq!(gw.push_timeout_ms, PUSH_TIMEOUT_MS);
        assert!(gw.forward_crc_valid && !gw.forward_crc_error && !gw.forward_crc_disabled);
        assert!(gw.upstream && gw.downstream && gw.radiostream && gw.statusstream);
        assert!(!gw.ghoststream && !gw.beacon && !gw.monitor && !gw.gps);
        assert_eq!(gw.beacon_period, 128);
        assert_eq!(
            gw.server_list,
            vec![ServerConf {
                address: DEFAULT_SERVER.into(),
                port_up: DEFAULT_PORT_UP,
                port_down: DEFAULT_PORT_DW
            }]
        );
    }

    #[test]
    fn gateway_id_parses_as_hex() {
        let config =
            parse_gateway(r#"{"gateway_conf":{"gateway_ID":"AA555A0000000000"}}"#);
        assert_eq!(config.gateway.gateway_id, 0xAA555A0000000000);
    }

    #[test]
    fn server_array_with_skips() {
        let config = parse_gateway(
            r#"{"gateway_conf":{"servers":[
                {"server_address":"a.example.com","serv_port_up":1700,"serv_port_down":1701},
                {"server_address":"b.example.com","serv_port_up":1700},
                {"server_address":"c.example.com","serv_port_up":1700,"serv_port_down":1701,"serv_enabled":false},
                {"serv_port_up":1700,"serv_port_down":1701},
                {"server_address":"d.example.com","serv_port_up":1702,"serv_port_down":1703}
            ]}}"#,
        );
        let list = &config.gateway.server_list;
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].address, "a.example.com");
        assert_eq!(list[1].address, "d.example.com");
        assert_eq!(list[1].port_down, 1703);
    }

    #[test]
    fn single_server_fallback_requires_complete_triple() {
        let config = parse_gateway(
            r#"{"gateway_conf":{"server_address":"x.example.com","serv_port_up":1700,"serv_port_down":1701}}"#,
        );
        assert_eq!(config.gateway.server_list[0].address, "x.example.com");

        /* missing port: fall through to the defaults */
        let config = parse_gateway(
            r#"{"gateway_conf":{"server_address":"x.example.com","serv_port_up":1700}}"#,
        );
        assert_eq!(config.gateway.server_list[0].address, DEFAULT_SERVER);
    }

    #[test]
    fn platform_star_keeps_builtin() {
        let config = parse_gateway(r#"{"gateway_conf":{"platform":"*"}}"#);
        assert_eq!(config.gateway.platform, "undefined");
        let config = parse_gateway(r#"{"gateway_conf":{"platform":"Lorank8"}}"#);
        assert_eq!(config.gateway.platform, "Lorank8");
    }

    #[test]
    fn sx1301_sections_are_extracted() {
        let config = parse_gateway(
            r#"{"SX1301_conf":{
                "lorawan_public":true,"clksrc":1,
                "radio_0":{"enable":true,"type":"SX1257","freq":867500000,"rssi_offset":-166.0,"tx_enable":true},
                "radio_1":{"enable":false},
                "chan_multiSF_0":{"enable":true,"radio":0,"if":-400000},
                "chan_Lora_std":{"enable":true,"radio":0,"if":-200000,"bandwidth":250000,"spread_factor":7},
                "chan_FSK":{"enable":true,"radio":0,"if":300000,"bandwidth":125000,"datarate":50000},
                "tx_lut_0":{"pa_gain":0,"mix_gain":8,"rf_power":-6,"dig_gain":0}
            },"gateway_conf":{}}"#,
        );
        let sx = config.sx1301.unwrap();
        assert!(sx.board.lorawan_public);
        assert_eq!(sx.board.clksrc, 1);
        assert_eq!(sx.rf_chains.len(), 2);
        assert_eq!(sx.rf_chains[0].1.freq_hz, 867500000);
        assert_eq!(sx.if_chains.len(), 1);
        assert_eq!(sx.lora_std.unwrap().bandwidth, BW_250KHZ);
        assert_eq!(sx.fsk.unwrap().datarate, 50000);
        assert_eq!(sx.txlut.len(), 1);
        assert_eq!(sx.txlut[0].rf_power, -6);
        assert_eq!(sx.txlut[0].dac_gain, 3); /* the only supported value fills in */
    }

    #[test]
    fn local_conf_overlays_global() {
        let dir = tempfile::tempdir().unwrap();
        let mut global = std::fs::File::create(dir.path().join(GLOBAL_CONF_PATH)).unwrap();
        write!(
            global,
            r#"{{"gateway_conf":{{"gateway_ID":"0000000000000001","stat_interval":30,"gps":true}}}}"#
        )
        .unwrap();
        let mut local = std::fs::File::create(dir.path().join(LOCAL_CONF_PATH)).unwrap();
        write!(local, r#"{{"gateway_conf":{{"gateway_ID":"00000000000000FF"}}}}"#).unwrap();

        let config = load_from_dir(dir.path()).unwrap();
        assert_eq!(config.gateway.gateway_id, 0xFF, "local value wins");
        assert_eq!(config.gateway.stat_interval, 30, "global leaf survives");
        assert!(config.gateway.gps);
    }

    #[test]
    fn debug_conf_shadows_everything() {
        let dir = tempfile::tempdir().unwrap();
        for (name, id) in [
            (DEBUG_CONF_PATH, "0000000000000002"),
            (GLOBAL_CONF_PATH, "0000000000000001"),
        ] {
            let mut f = std::fs::File::create(dir.path().join(name)).unwrap();
            write!(f, r#"{{"gateway_conf":{{"gateway_ID":"{}"}}}}"#, id).unwrap();
        }
        let config = load_from_dir(dir.path()).unwrap();
        assert_eq!(config.gateway.gateway_id, 2);
    }

    #[test]
    fn missing_configuration_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_from_dir(dir.path()).is_err());
    }
}
