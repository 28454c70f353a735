//! Ghost packet source: synthetic uplinks injected over UDP by an external
//! node and fanned out on the same upstream path as radio packets.
//!
//! Each datagram carries one JSON object in the `rxpk` vocabulary
//! (`freq` in MHz, `datr` as `SF<x>BW<y>` or bits/s, base64 `data`).
//! Malformed datagrams are logged and dropped.

use std::collections::VecDeque;
use std::net::UdpSocket;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use tracing::{info, warn};

use crate::hal::{
    LgwPktRx, Modulation, CR_UNDEFINED, STAT_CRC_BAD, STAT_CRC_OK, STAT_NO_CRC,
};
use crate::protocol;
use crate::shutdown::ExitSignal;

/* ghost packets beyond this backlog are dropped */
const GHOST_QUEUE_MAX: usize = 64;

#[derive(Debug, Deserialize)]
struct GhostPkt {
    freq: f64, /* MHz */
    #[serde(default)]
    chan: u8,
    #[serde(default)]
    rfch: u8,
    #[serde(default = "default_stat")]
    stat: i8,
    modu: String,
    datr: serde_json::Value,
    #[serde(default)]
    codr: Option<String>,
    #[serde(default)]
    rssi: f32,
    #[serde(default)]
    lsnr: f32,
    size: u16,
    data: String,
}

fn default_stat() -> i8 {
    1
}

fn decode_ghost(buff: &[u8], count_us: u32) -> Result<LgwPktRx> {
    let ghost: GhostPkt = serde_json::from_slice(buff).context("invalid ghost JSON")?;

    let mut pkt = LgwPktRx::new();
    pkt.freq_hz = (ghost.freq * 1e6) as u32;
    pkt.if_chain = ghost.chan;
    pkt.rf_chain = ghost.rfch;
    pkt.count_us = count_us;
    pkt.status = match ghost.stat {
        1 => STAT_CRC_OK,
        0 => STAT_NO_CRC,
        -1 => STAT_CRC_BAD,
        other => return Err(anyhow!("invalid ghost stat {}", other)),
    };
    pkt.rssi = ghost.rssi;

    match ghost.modu.as_str() {
        "LORA" => {
            pkt.modulation = Modulation::LORA;
            let datr = ghost
                .datr
                .as_str()
                .ok_or_else(|| anyhow!("ghost LORA datr must be a string"))?;
            let (datarate, bandwidth) =
                protocol::parse_lora_datr(datr).ok_or_else(|| anyhow!("invalid ghost datr"))?;
            pkt.datarate = datarate;
            pkt.bandwidth = bandwidth;
            pkt.coderate = match ghost.codr.as_deref() {
                Some(codr) => {
                    protocol::parse_lora_codr(codr).ok_or_else(|| anyhow!("invalid ghost codr"))?
                }
                None => CR_UNDEFINED,
            };
            pkt.snr = ghost.lsnr;
        }
        "FSK" => {
            pkt.modulation = Modulation::FSK;
            pkt.datarate = ghost
                .datr
                .as_u64()
                .ok_or_else(|| anyhow!("ghost FSK datr must be a number"))?
                as u32;
        }
        other => return Err(anyhow!("invalid ghost modulation \"{}\"", other)),
    }

    let payload = protocol::b64_decode(&ghost.data)?;
    if payload.len() != ghost.size as usize || payload.len() > 255 {
        return Err(anyhow!(
            "ghost payload size mismatch ({} bytes, size field {})",
            payload.len(),
            ghost.size
        ));
    }
    pkt.size = ghost.size;
    pkt.payload[..payload.len()].copy_from_slice(&payload);
    Ok(pkt)
}

#[derive(Debug, Default)]
pub struct GhostSource {
    queue: Mutex<VecDeque<LgwPktRx>>,
}

impl GhostSource {
    /// Pop up to `max` queued ghost packets without blocking.
    pub fn fetch(&self, max: usize) -> Vec<LgwPktRx> {
        let mut queue = self.queue.lock().unwrap_or_else(PoisonError::into_inner);
        let n = max.min(queue.len());
        queue.drain(..n).collect()
    }

    fn push(&self, pkt: LgwPktRx) {
        let mut queue = self.queue.lock().unwrap_or_else(PoisonError::into_inner);
        if queue.len() >= GHOST_QUEUE_MAX {
            warn!("WARNING: [ghost] queue full, dropping packet");
            return;
        }
        queue.push_back(pkt);
    }

    /// Inject one packet directly, bypassing the listener. Test hook.
    pub fn inject(&self, pkt: LgwPktRx) {
        self.push(pkt);
    }
}

/// Bind the ghost listener and spawn its thread. The returned source is
/// polled by the upstream task.
pub fn start(
    exit: Arc<ExitSignal>,
    addr: &str,
    port: u16,
) -> Result<(Arc<GhostSource>, std::thread::JoinHandle<()>)> {
    let sock = UdpSocket::bind((addr, port))
        .with_context(|| format!("[ghost] failed to bind {}:{}", addr, port))?;
    sock.set_read_timeout(Some(Duration::from_millis(500)))
        .context("[ghost] setsockopt failed")?;

    let source = Arc::new(GhostSource::default());
    let thread_source = source.clone();
    let epoch = std::time::Instant::now();

    let handle = std::thread::Builder::new()
        .name("ghost".into())
        .spawn(move || {
            info!("INFO: [ghost] listener thread activated");
            let mut buff = [0u8; 1024];
            while exit.should_run() {
                let len = match sock.recv(&mut buff) {
                    Ok(len) => len,
                    Err(e)
                        if e.kind() == std::io::ErrorKind::WouldBlock
                            || e.kind() == std::io::ErrorKind::TimedOut =>
                    {
                        continue
                    }
                    Err(e) => {
                        warn!("WARNING: [ghost] recv returned {}", e);
                        continue;
                    }
                };
                let count_us = epoch.elapsed().as_micros() as u32;
                match decode_ghost(&buff[..len], count_us) {
                    Ok(pkt) => thread_source.push(pkt),
                    Err(e) => warn!("WARNING: [ghost] dropping datagram: {:#}", e),
                }
            }
            info!("INFO: End of ghost thread");
        })
        .context("[main] impossible to create ghost thread")?;

    Ok((source, handle))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::{BW_125KHZ, CR_LORA_4_5, DR_LORA_SF8};

    #[test]
    fn decodes_a_lora_ghost_packet() {
        let json = format!(
            r#"{{"freq":868.3,"chan":2,"rfch":0,"stat":1,"modu":"LORA","datr":"SF8BW125","codr":"4/5","rssi":-92.0,"lsnr":6.5,"size":3,"data":"{}"}}"#,
            protocol::b64_encode(&[1, 2, 3])
        );
        let pkt = decode_ghost(json.as_bytes(), 42).unwrap();
        assert_eq!(pkt.freq_hz, 868_300_000);
        assert_eq!(pkt.if_chain, 2);
        assert_eq!(pkt.status, STAT_CRC_OK);
        assert_eq!(pkt.modulation, Modulation::LORA);
        assert_eq!(pkt.datarate, DR_LORA_SF8);
        assert_eq!(pkt.bandwidth, BW_125KHZ);
        assert_eq!(pkt.coderate, CR_LORA_4_5);
        assert_eq!(pkt.size, 3);
        assert_eq!(&pkt.payload[..3], &[1, 2, 3]);
        assert_eq!(pkt.count_us, 42);
    }

    #[test]
    fn rejects_size_mismatch() {
        let json = format!(
            r#"{{"freq":868.3,"modu":"LORA","datr":"SF8BW125","size":9,"data":"{}"}}"#,
            protocol::b64_encode(&[1, 2, 3])
        );
        assert!(decode_ghost(json.as_bytes(), 0).is_err());
    }

    #[test]
    fn fetch_respects_the_cap() {
        let source = GhostSource::default();
        for _ in 0..10 {
            source.inject(LgwPktRx::new());
        }
        assert_eq!(source.fetch(8).len(), 8);
        assert_eq!(source.fetch(8).len(), 2);
        assert!(source.fetch(8).is_empty());
    }
}
