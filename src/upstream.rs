//! Upstream fan-out: fetch radio and ghost packets, filter them by CRC
//! status, frame one PUSH_DATA datagram and send it to every live endpoint,
//! then collect the acknowledgements. One task serves all servers; token
//! values are identical across endpoints for one iteration.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::{SecondsFormat, Utc};
use tracing::{error, info, warn};

use crate::concentrator::Concentrator;
use crate::endpoint::Endpoint;
use crate::error::Error;
use crate::ghost::GhostSource;
use crate::hal::{LgwPktRx, Modulation, STAT_CRC_BAD, STAT_CRC_OK, STAT_NO_CRC};
use crate::protocol::{self, Datr, PushData, Rxpk, PKT_PUSH_ACK};
use crate::shutdown::ExitSignal;
use crate::stats::{StatusReport, UpstreamCounters};
use crate::timeref::{GpsTimeRef, TimeRef};

/// Max number of packets per fetch/send cycle.
pub const NB_PKT_MAX: usize = 8;
/// Time waited when a fetch returns no packets, in ms.
pub const FETCH_SLEEP_MS: u64 = 10;

/// Packet filtering configuration: which CRC statuses are forwarded.
#[derive(Debug, Clone, Copy)]
pub struct FwdFilter {
    pub fwd_valid_pkt: bool, /* packets with PAYLOAD CRC OK are forwarded */
    pub fwd_error_pkt: bool, /* packets with PAYLOAD CRC ERROR are forwarded */
    pub fwd_nocrc_pkt: bool, /* packets with NO PAYLOAD CRC are forwarded */
}

impl Default for FwdFilter {
    fn default() -> Self {
        Self { fwd_valid_pkt: true, fwd_error_pkt: false, fwd_nocrc_pkt: false }
    }
}

pub struct UpstreamCtx {
    pub exit: Arc<ExitSignal>,
    pub conc: Arc<Concentrator>,
    pub radiostream: bool,
    pub ghost: Option<Arc<GhostSource>>,
    pub endpoints: Vec<Arc<Endpoint>>,
    pub timeref: Arc<GpsTimeRef>,
    pub gps_active: bool,
    pub meas_up: Arc<UpstreamCounters>,
    pub report: Arc<StatusReport>,
    pub gateway_eui: u64,
    pub filter: FwdFilter,
    pub push_timeout_half: Duration, /* ack receive timeout, half of PUSH_TIMEOUT_MS */
}

/// Serialise one received packet into its `rxpk` wire form. Returns `None`
/// (after counting) for packets the filter drops or that carry values the
/// protocol cannot express.
fn serialize_rxpk(
    p: &LgwPktRx,
    ctx: &UpstreamCtx,
    tref: Option<&TimeRef>,
    fetch_timestamp: &str,
) -> Option<Rxpk> {
    let meas = &ctx.meas_up;
    meas.add(&meas.nb_rx_rcv, 1);

    /* basic packet filtering */
    let stat = match p.status {
        STAT_CRC_OK => {
            meas.add(&meas.nb_rx_ok, 1);
            if !ctx.filter.fwd_valid_pkt {
                return None;
            }
            1
        }
        STAT_CRC_BAD => {
            meas.add(&meas.nb_rx_bad, 1);
            if !ctx.filter.fwd_error_pkt {
                return None;
            }
            -1
        }
        STAT_NO_CRC => {
            meas.add(&meas.nb_rx_nocrc, 1);
            if !ctx.filter.fwd_nocrc_pkt {
                return None;
            }
            0
        }
        status => {
            warn!(
                "WARNING: [up] received packet with unknown status {} (size {}, modulation {}, BW {}, DR {}, RSSI {:.1})",
                status, p.size, p.modulation, p.bandwidth, p.datarate, p.rssi
            );
            return None;
        }
    };

    /* packet RX time: GPS-based when the reference is valid, else the
    local clock at fetch time */
    let time = match tref.and_then(|r| r.cnt2utc(p.count_us).ok()) {
        Some(utc) => Some(utc.to_rfc3339_opts(SecondsFormat::Micros, true)),
        None => Some(fetch_timestamp.to_string()),
    };

    let (modu, datr, codr, lsnr) = match p.modulation {
        Modulation::LORA => {
            let Some(datr) = protocol::lora_datr_string(p.datarate, p.bandwidth) else {
                warn!("WARNING: [up] lora packet with unknown datarate or bandwidth");
                return None;
            };
            let Some(codr) = protocol::lora_codr_string(p.coderate) else {
                warn!("WARNING: [up] lora packet with unknown coderate");
                return None;
            };
            let lsnr = (f64::from(p.snr) * 10.0).round() / 10.0;
            ("LORA", Datr::Lora(datr), Some(codr), Some(lsnr))
        }
        Modulation::FSK => ("FSK", Datr::Fsk(p.datarate), None, None),
        Modulation::UNDEFINED => {
            warn!("WARNING: [up] received packet with unknown modulation");
            return None;
        }
    };

    meas.add(&meas.up_pkt_fwd, 1);
    meas.add(&meas.up_payload_byte, u32::from(p.size));

    Some(Rxpk {
        tmst: p.count_us,
        time,
        chan: p.if_chain,
        rfch: p.rf_chain,
        freq: f64::from(p.freq_hz) / 1e6, /* MHz, Hz resolution = 6 decimals */
        stat,
        modu,
        datr,
        codr,
        lsnr,
        rssi: p.rssi.round() as i32,
        size: p.size,
        data: protocol::b64_encode(&p.payload[..p.size as usize]),
    })
}

/// Fetch one batch: radio packets first (under the concentrator lock),
/// topped up from the ghost source to the same cap.
fn fetch_packets(ctx: &UpstreamCtx) -> Result<Vec<LgwPktRx>> {
    let mut pkts = if ctx.radiostream {
        ctx.conc.receive(NB_PKT_MAX).context("[up] failed packet fetch")?
    } else {
        Vec::new()
    };
    if let Some(ghost) = &ctx.ghost {
        pkts.extend(ghost.fetch(NB_PKT_MAX - pkts.len()));
    }
    Ok(pkts)
}

/// Body of the upstream task.
pub fn thread_up(ctx: UpstreamCtx) -> Result<()> {
    info!("INFO: [up] Thread activated for all servers.");

    /* set upstream socket RX timeout */
    for endpoint in &ctx.endpoints {
        endpoint
            .sock_up
            .set_read_timeout(Some(ctx.push_timeout_half))
            .map_err(|e| {
                error!("ERROR: [up] setsockopt for server {} returned {}", endpoint.addr, e);
                Error::SOCKOPT_ERROR
            })?;
    }

    let mut buff_ack = [0u8; 32];

    while ctx.exit.should_run() {
        /* fetch packets */
        let pkts = fetch_packets(&ctx)?;

        /* check if there is a status report to send */
        let send_report = ctx.report.is_ready();

        /* wait a short time if no packets, nor status report */
        if pkts.is_empty() && !send_report {
            std::thread::sleep(Duration::from_millis(FETCH_SLEEP_MS));
            continue;
        }

        /* get a copy of the GPS time reference (avoid 1 mutex per packet) */
        let tref = if !pkts.is_empty() && ctx.gps_active {
            let (tref, valid) = ctx.timeref.snapshot();
            valid.then_some(tref)
        } else {
            None
        };

        /* local timestamp until we get accurate GPS time */
        let fetch_timestamp = Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true);

        /* serialise packet metadata and payloads */
        let rxpk: Vec<Rxpk> = pkts
            .iter()
            .filter_map(|p| serialize_rxpk(p, &ctx, tref.as_ref(), &fetch_timestamp))
            .collect();

        /* restart the fetch sequence without sending an empty datagram if
        all packets have been filtered out and no report is pending */
        if rxpk.is_empty() && !send_report {
            continue;
        }

        let body = PushData {
            rxpk: (!rxpk.is_empty()).then_some(rxpk),
            stat: if send_report { ctx.report.take() } else { None },
        };
        let json = serde_json::to_vec(&body).context("[up] failed to serialize PUSH_DATA body")?;

        /* start composing the datagram with the header */
        let token: u16 = rand::random();
        let buff_up = protocol::push_data(token, ctx.gateway_eui, &json);

        /* send the datagram to all servers sequentially */
        for endpoint in &ctx.endpoints {
            let send_time = Instant::now();
            if let Err(e) = endpoint.sock_up.send(&buff_up) {
                warn!("WARNING: [up] send to server {} failed: {}", endpoint.addr, e);
                continue;
            }
            ctx.meas_up.add(&ctx.meas_up.up_dgram_sent, 1);
            ctx.meas_up.add(&ctx.meas_up.up_network_byte, buff_up.len() as u32);

            /* wait for an acknowledge (in 2 times, to catch extra packets) */
            for _ in 0..2 {
                let len = match endpoint.sock_up.recv(&mut buff_ack) {
                    Ok(len) => len,
                    Err(e)
                        if e.kind() == std::io::ErrorKind::WouldBlock
                            || e.kind() == std::io::ErrorKind::TimedOut =>
                    {
                        continue; /* timeout, try a second receive */
                    }
                    Err(_) => break, /* server connection error */
                };
                if protocol::is_ack(&buff_ack[..len], PKT_PUSH_ACK, token) {
                    info!(
                        "INFO: [up] PUSH_ACK for server {} received in {} ms",
                        endpoint.addr,
                        send_time.elapsed().as_millis()
                    );
                    ctx.meas_up.add(&ctx.meas_up.up_ack_rcv, 1);
                    break;
                }
                /* ignored invalid or out-of-sync packet, keep listening */
            }
        }
    }
    info!("INFO: End of upstream thread");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::{BW_125KHZ, CR_LORA_4_5, DR_LORA_SF7};
    use crate::stats::StatusReport;
    use crate::timeref::GpsTimeRef;
    use std::sync::atomic::Ordering;

    fn test_ctx(filter: FwdFilter) -> UpstreamCtx {
        UpstreamCtx {
            exit: Arc::new(ExitSignal::new()),
            conc: Arc::new(Concentrator::new(Box::new(crate::hal::VirtualConcentrator::new()))),
            radiostream: false,
            ghost: None,
            endpoints: Vec::new(),
            timeref: Arc::new(GpsTimeRef::new()),
            gps_active: false,
            meas_up: Arc::new(UpstreamCounters::default()),
            report: Arc::new(StatusReport::new()),
            gateway_eui: 0,
            filter,
            push_timeout_half: Duration::from_millis(50),
        }
    }

    fn lora_pkt(status: u8) -> LgwPktRx {
        let mut p = LgwPktRx::new();
        p.status = status;
        p.modulation = Modulation::LORA;
        p.datarate = DR_LORA_SF7;
        p.bandwidth = BW_125KHZ;
        p.coderate = CR_LORA_4_5;
        p.freq_hz = 868_100_000;
        p.rssi = -80.0;
        p.snr = 9.0;
        p.size = 8;
        p.count_us = 12345678;
        p
    }

    #[test]
    fn filtering_is_total_over_crc_status() {
        let ctx = test_ctx(FwdFilter::default());
        let ts = "2020-01-01T00:00:00.000000Z";

        assert!(serialize_rxpk(&lora_pkt(STAT_CRC_OK), &ctx, None, ts).is_some());
        assert!(serialize_rxpk(&lora_pkt(STAT_CRC_BAD), &ctx, None, ts).is_none());
        assert!(serialize_rxpk(&lora_pkt(STAT_NO_CRC), &ctx, None, ts).is_none());
        assert!(serialize_rxpk(&lora_pkt(0x42), &ctx, None, ts).is_none());

        assert_eq!(ctx.meas_up.nb_rx_rcv.load(Ordering::Relaxed), 4);
        assert_eq!(ctx.meas_up.nb_rx_ok.load(Ordering::Relaxed), 1);
        assert_eq!(ctx.meas_up.nb_rx_bad.load(Ordering::Relaxed), 1);
        assert_eq!(ctx.meas_up.nb_rx_nocrc.load(Ordering::Relaxed), 1);
        assert_eq!(ctx.meas_up.up_pkt_fwd.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn inverted_filter_forwards_bad_crc_only() {
        let ctx = test_ctx(FwdFilter {
            fwd_valid_pkt: false,
            fwd_error_pkt: true,
            fwd_nocrc_pkt: false,
        });
        let ts = "2020-01-01T00:00:00.000000Z";
        assert!(serialize_rxpk(&lora_pkt(STAT_CRC_OK), &ctx, None, ts).is_none());
        let rxpk = serialize_rxpk(&lora_pkt(STAT_CRC_BAD), &ctx, None, ts).unwrap();
        assert_eq!(rxpk.stat, -1);
    }

    #[test]
    fn rxpk_fields_match_the_wire_vocabulary() {
        let ctx = test_ctx(FwdFilter::default());
        let ts = "2020-01-01T00:00:00.000000Z";
        let rxpk = serialize_rxpk(&lora_pkt(STAT_CRC_OK), &ctx, None, ts).unwrap();
        assert_eq!(rxpk.tmst, 12345678);
        assert_eq!(rxpk.freq, 868.1);
        assert_eq!(rxpk.stat, 1);
        assert_eq!(rxpk.modu, "LORA");
        assert_eq!(rxpk.datr, Datr::Lora("SF7BW125".into()));
        assert_eq!(rxpk.codr, Some("4/5"));
        assert_eq!(rxpk.lsnr, Some(9.0));
        assert_eq!(rxpk.rssi, -80);
        assert_eq!(rxpk.size, 8);
        assert_eq!(rxpk.time.as_deref(), Some(ts));
    }

    #[test]
    fn ghost_top_up_respects_the_cap() {
        let ghost = Arc::new(GhostSource::default());
        for _ in 0..12 {
            ghost.inject(lora_pkt(STAT_CRC_OK));
        }
        let mut ctx = test_ctx(FwdFilter::default());
        ctx.ghost = Some(ghost);
        let pkts = fetch_packets(&ctx).unwrap();
        assert_eq!(pkts.len(), NB_PKT_MAX);
    }
}
