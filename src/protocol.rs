//! Gateway-to-server UDP protocol: datagram framing, acknowledgement
//! matching and the JSON vocabulary carried by PUSH_DATA / PULL_RESP.
//!
//! All datagrams start with a 12-byte header:
//! `[version, token_h, token_l, type, gateway_EUI(8, big endian)]`.
//! ACKs echo the request token and carry no body.

use anyhow::{anyhow, Result};
use base64::Engine;
use serde::Serialize;

use crate::hal::{
    BW_125KHZ, BW_250KHZ, BW_500KHZ, CR_LORA_4_5, CR_LORA_4_6, CR_LORA_4_7, CR_LORA_4_8,
    DR_LORA_SF10, DR_LORA_SF11, DR_LORA_SF12, DR_LORA_SF7, DR_LORA_SF8, DR_LORA_SF9,
};

pub const PROTOCOL_VERSION: u8 = 1;

pub const PKT_PUSH_DATA: u8 = 0;
pub const PKT_PUSH_ACK: u8 = 1;
pub const PKT_PULL_DATA: u8 = 2;
pub const PKT_PULL_RESP: u8 = 3;
pub const PKT_PULL_ACK: u8 = 4;

pub const HEADER_SIZE: usize = 12;

/// Compose a PUSH_DATA datagram: header followed by the JSON body.
pub fn push_data(token: u16, gateway_eui: u64, json: &[u8]) -> Vec<u8> {
    let mut buff = Vec::with_capacity(HEADER_SIZE + json.len());
    buff.push(PROTOCOL_VERSION);
    buff.push((token >> 8) as u8);
    buff.push(token as u8);
    buff.push(PKT_PUSH_DATA);
    buff.extend_from_slice(&gateway_eui.to_be_bytes());
    buff.extend_from_slice(json);
    buff
}

/// Compose a PULL_DATA keep-alive request (header only).
pub fn pull_data(token: u16, gateway_eui: u64) -> [u8; HEADER_SIZE] {
    let mut buff = [0u8; HEADER_SIZE];
    buff[0] = PROTOCOL_VERSION;
    buff[1] = (token >> 8) as u8;
    buff[2] = token as u8;
    buff[3] = PKT_PULL_DATA;
    buff[4..12].copy_from_slice(&gateway_eui.to_be_bytes());
    buff
}

/// True iff `buff` is a well-formed acknowledgement of type `ack_type`
/// carrying `token`: length >= 4, protocol version 1, matching type and
/// matching token bytes. Anything else must be ignored by the caller.
pub fn is_ack(buff: &[u8], ack_type: u8, token: u16) -> bool {
    buff.len() >= 4
        && buff[0] == PROTOCOL_VERSION
        && buff[3] == ack_type
        && buff[1] == (token >> 8) as u8
        && buff[2] == token as u8
}

pub fn b64_encode(data: &[u8]) -> String {
    base64::engine::general_purpose::STANDARD.encode(data)
}

pub fn b64_decode(data: &str) -> Result<Vec<u8>> {
    base64::engine::general_purpose::STANDARD
        .decode(data)
        .map_err(|e| anyhow!("invalid base64 payload: {}", e))
}

/// LoRa or FSK datarate as it appears on the wire: `"SF7BW125"` for LoRa,
/// plain bits-per-second integer for FSK.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(untagged)]
pub enum Datr {
    Lora(String),
    Fsk(u32),
}

/// One received packet as serialised inside the PUSH_DATA `rxpk` array.
/// Field names, types and units must stay bit-compatible with the servers.
#[derive(Debug, Clone, Serialize)]
pub struct Rxpk {
    pub tmst: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time: Option<String>,
    pub chan: u8,
    pub rfch: u8,
    pub freq: f64,
    pub stat: i8,
    pub modu: &'static str,
    pub datr: Datr,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub codr: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lsnr: Option<f64>,
    pub rssi: i32,
    pub size: u16,
    pub data: String,
}

/// The periodic gateway status object (`stat`). Position fields are present
/// only when a position, real or faked, is available.
#[derive(Debug, Clone, Serialize)]
pub struct Stat {
    pub time: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lati: Option<f64>,
    #[serde(rename = "long", skip_serializing_if = "Option::is_none")]
    pub longi: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alti: Option<i16>,
    pub rxnb: u32,
    pub rxok: u32,
    pub rxfw: u32,
    pub ackr: f64,
    pub dwnb: u32,
    pub txnb: u32,
    pub pfrm: String,
    pub mail: String,
    pub desc: String,
}

/// Body of a PUSH_DATA datagram: `rxpk` array and/or `stat` object.
#[derive(Debug, Clone, Serialize, Default)]
pub struct PushData {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rxpk: Option<Vec<Rxpk>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stat: Option<Stat>,
}

/// Wire representation of a LoRa datarate code, e.g. `SF7BW125`.
pub fn lora_datr_string(datarate: u32, bandwidth: u8) -> Option<String> {
    let sf = match datarate {
        DR_LORA_SF7 => "SF7",
        DR_LORA_SF8 => "SF8",
        DR_LORA_SF9 => "SF9",
        DR_LORA_SF10 => "SF10",
        DR_LORA_SF11 => "SF11",
        DR_LORA_SF12 => "SF12",
        _ => return None,
    };
    let bw = match bandwidth {
        BW_125KHZ => "BW125",
        BW_250KHZ => "BW250",
        BW_500KHZ => "BW500",
        _ => return None,
    };
    Some(format!("{}{}", sf, bw))
}

/// Parse a `SF<x>BW<y>` string into (datarate, bandwidth) codes.
pub fn parse_lora_datr(s: &str) -> Option<(u32, u8)> {
    let rest = s.strip_prefix("SF")?;
    let bw_pos = rest.find("BW")?;
    let sf: u16 = rest[..bw_pos].parse().ok()?;
    let bw: u16 = rest[bw_pos + 2..].parse().ok()?;
    let datarate = match sf {
        7 => DR_LORA_SF7,
        8 => DR_LORA_SF8,
        9 => DR_LORA_SF9,
        10 => DR_LORA_SF10,
        11 => DR_LORA_SF11,
        12 => DR_LORA_SF12,
        _ => return None,
    };
    let bandwidth = match bw {
        125 => BW_125KHZ,
        250 => BW_250KHZ,
        500 => BW_500KHZ,
        _ => return None,
    };
    Some((datarate, bandwidth))
}

/// Wire representation of a LoRa coding rate; CR0 (mostly false sync) maps
/// to `"OFF"`.
pub fn lora_codr_string(coderate: u8) -> Option<&'static str> {
    match coderate {
        CR_LORA_4_5 => Some("4/5"),
        CR_LORA_4_6 => Some("4/6"),
        CR_LORA_4_7 => Some("4/7"),
        CR_LORA_4_8 => Some("4/8"),
        0 => Some("OFF"),
        _ => None,
    }
}

/// Parse a coding-rate string; the `2/3` and `1/2` aliases are accepted for
/// server compatibility.
pub fn parse_lora_codr(s: &str) -> Option<u8> {
    match s {
        "4/5" => Some(CR_LORA_4_5),
        "4/6" | "2/3" => Some(CR_LORA_4_6),
        "4/7" => Some(CR_LORA_4_7),
        "4/8" | "1/2" => Some(CR_LORA_4_8),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_data_header_layout() {
        let buff = push_data(0xA1B2, 0xAA555A5AA55A55AA, b"{}");
        assert_eq!(buff[0], PROTOCOL_VERSION);
        assert_eq!(buff[1], 0xA1);
        assert_eq!(buff[2], 0xB2);
        assert_eq!(buff[3], PKT_PUSH_DATA);
        assert_eq!(&buff[4..12], &[0xAA, 0x55, 0x5A, 0x5A, 0xA5, 0x5A, 0x55, 0xAA]);
        assert_eq!(&buff[12..], b"{}");
    }

    #[test]
    fn pull_data_is_header_only() {
        let buff = pull_data(0x0102, 1);
        assert_eq!(buff.len(), HEADER_SIZE);
        assert_eq!(buff[3], PKT_PULL_DATA);
        assert_eq!(buff[11], 1);
    }

    #[test]
    fn ack_matching() {
        let ack = [PROTOCOL_VERSION, 0x12, 0x34, PKT_PUSH_ACK];
        assert!(is_ack(&ack, PKT_PUSH_ACK, 0x1234));
        /* wrong token */
        assert!(!is_ack(&ack, PKT_PUSH_ACK, 0x1235));
        /* wrong type */
        assert!(!is_ack(&ack, PKT_PULL_ACK, 0x1234));
        /* wrong version */
        let bad = [2u8, 0x12, 0x34, PKT_PUSH_ACK];
        assert!(!is_ack(&bad, PKT_PUSH_ACK, 0x1234));
        /* too short */
        assert!(!is_ack(&ack[..3], PKT_PUSH_ACK, 0x1234));
    }

    #[test]
    fn base64_round_trip() {
        for len in [0usize, 1, 2, 3, 8, 254, 255] {
            let data: Vec<u8> = (0..len).map(|i| (i * 7 + 3) as u8).collect();
            assert_eq!(b64_decode(&b64_encode(&data)).unwrap(), data);
        }
    }

    #[test]
    fn datr_round_trip() {
        assert_eq!(parse_lora_datr("SF7BW125"), Some((DR_LORA_SF7, BW_125KHZ)));
        assert_eq!(parse_lora_datr("SF12BW500"), Some((DR_LORA_SF12, BW_500KHZ)));
        assert_eq!(lora_datr_string(DR_LORA_SF9, BW_250KHZ).as_deref(), Some("SF9BW250"));
        assert_eq!(parse_lora_datr("SF6BW125"), None);
        assert_eq!(parse_lora_datr("SF7BW300"), None);
        assert_eq!(parse_lora_datr("garbage"), None);
    }

    #[test]
    fn codr_aliases() {
        assert_eq!(parse_lora_codr("2/3"), Some(CR_LORA_4_6));
        assert_eq!(parse_lora_codr("1/2"), Some(CR_LORA_4_8));
        assert_eq!(parse_lora_codr("5/6"), None);
        assert_eq!(lora_codr_string(0), Some("OFF"));
    }

    #[test]
    fn rxpk_serialization_shape() {
        let rxpk = Rxpk {
            tmst: 3512348611,
            time: None,
            chan: 0,
            rfch: 0,
            freq: 868.1,
            stat: 1,
            modu: "LORA",
            datr: Datr::Lora("SF7BW125".into()),
            codr: Some("4/5"),
            lsnr: Some(9.0),
            rssi: -80,
            size: 2,
            data: b64_encode(&[0x01, 0x02]),
        };
        let body = PushData { rxpk: Some(vec![rxpk]), stat: None };
        let json = serde_json::to_string(&body).unwrap();
        assert!(json.starts_with("{\"rxpk\":[{"));
        assert!(json.contains("\"datr\":\"SF7BW125\""));
        assert!(json.contains("\"rssi\":-80"));
        assert!(json.contains("\"lsnr\":9.0"));
        assert!(!json.contains("stat\":{"));
    }

    #[test]
    fn fsk_rxpk_has_no_codr_nor_lsnr() {
        let rxpk = Rxpk {
            tmst: 1,
            time: None,
            chan: 9,
            rfch: 1,
            freq: 868.8,
            stat: 1,
            modu: "FSK",
            datr: Datr::Fsk(50000),
            codr: None,
            lsnr: None,
            rssi: -75,
            size: 1,
            data: b64_encode(&[0xFF]),
        };
        let json = serde_json::to_string(&rxpk).unwrap();
        assert!(json.contains("\"datr\":50000"));
        assert!(!json.contains("codr"));
        assert!(!json.contains("lsnr"));
    }
}
