//! Downstream session, one task per live endpoint: PULL_DATA keep-alive
//! loop, PULL_ACK token matching, PULL_RESP parsing and TX scheduling on the
//! concentrator, and the auto-quit watchdog for silent servers.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Context, Result};
use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::{error, info, warn};

use crate::concentrator::Concentrator;
use crate::endpoint::Endpoint;
use crate::error::Error;
use crate::hal::{LgwPktTx, Modulation, TxMode, DR_UNDEFINED};
use crate::protocol::{self, PKT_PULL_ACK, PKT_PULL_RESP, PROTOCOL_VERSION};
use crate::shutdown::ExitSignal;
use crate::stats::DownstreamCounters;
use crate::timeref::GpsTimeRef;

/* minimum preamble lengths enforced for this application, and the defaults
used when the server does not specify one */
pub const MIN_LORA_PREAMB: u16 = 6;
pub const STD_LORA_PREAMB: u16 = 8;
pub const MIN_FSK_PREAMB: u16 = 3;
pub const STD_FSK_PREAMB: u16 = 4;

pub struct DownstreamCtx {
    pub exit: Arc<ExitSignal>,
    pub conc: Arc<Concentrator>,
    pub endpoint: Arc<Endpoint>,
    pub timeref: Arc<GpsTimeRef>,
    pub gps_active: bool,
    pub meas_dw: Arc<DownstreamCounters>,
    pub gateway_eui: u64,
    pub keepalive_time: Duration, /* interval between PULL_DATA requests */
    pub pull_timeout: Duration,   /* downstream socket receive timeout */
    pub autoquit_threshold: u32,  /* 0 = disabled */
}

fn get_number(txpk: &Value, field: &str) -> Option<f64> {
    txpk.get(field).and_then(Value::as_f64)
}

fn get_str<'a>(txpk: &'a Value, field: &str) -> Option<&'a str> {
    txpk.get(field).and_then(Value::as_str)
}

/// Resolve the TX trigger for this job: `imme:true`, a raw counter value in
/// `tmst`, or an ISO-8601 `time` converted through the GPS time reference.
fn parse_tx_trigger(
    txpk: &Value,
    gps_active: bool,
    timeref: &GpsTimeRef,
) -> Result<(TxMode, u32)> {
    if txpk.get("imme").and_then(Value::as_bool) == Some(true) {
        /* TX procedure: send immediately */
        info!("INFO: [down] a packet will be sent in \"immediate\" mode");
        return Ok((TxMode::IMMEDIATE, 0));
    }

    if let Some(tmst) = get_number(txpk, "tmst") {
        /* TX procedure: send on timestamp value */
        let count_us = tmst as u32;
        info!("INFO: [down] a packet will be sent on timestamp value {}", count_us);
        return Ok((TxMode::TIMESTAMPED, count_us));
    }

    /* TX procedure: send on UTC time (converted to timestamp value) */
    let Some(time_str) = get_str(txpk, "time") else {
        bail!("no mandatory \"txpk.tmst\" or \"txpk.time\" objects in JSON");
    };
    if !gps_active {
        bail!("GPS disabled, impossible to send packet on specific UTC time");
    }
    let (tref, tref_valid) = timeref.snapshot();
    if !tref_valid {
        bail!("no valid GPS time reference yet, impossible to send packet on specific UTC time");
    }
    let utc_tx = DateTime::parse_from_rfc3339(time_str)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|_| anyhow!("\"txpk.time\" must follow ISO 8601 format"))?;
    let count_us = tref
        .utc2cnt(utc_tx)
        .map_err(|_| anyhow!("could not convert UTC time to timestamp"))?;
    info!(
        "INFO: [down] a packet will be sent on timestamp value {} (calculated from UTC time)",
        count_us
    );
    Ok((TxMode::TIMESTAMPED, count_us))
}

/// Parse the JSON body of a PULL_RESP into a TX job. Any missing mandatory
/// field or unparsable value aborts this packet; the caller logs the reason
/// and keeps the session alive.
pub fn parse_pull_resp(
    json: &[u8],
    gps_active: bool,
    timeref: &GpsTimeRef,
) -> Result<LgwPktTx> {
    let root: Value = serde_json::from_slice(json).context("invalid JSON")?;

    /* look for JSON sub-object 'txpk' */
    let txpk = root
        .get("txpk")
        .filter(|v| v.is_object())
        .ok_or_else(|| anyhow!("no \"txpk\" object in JSON"))?;

    let mut pkt = LgwPktTx::default();

    let (tx_mode, count_us) = parse_tx_trigger(txpk, gps_active, timeref)?;
    pkt.tx_mode = tx_mode;
    pkt.count_us = count_us;

    /* parse "No CRC" flag (optional field) */
    if let Some(ncrc) = txpk.get("ncrc").and_then(Value::as_bool) {
        pkt.no_crc = ncrc;
    }

    /* parse target frequency (mandatory) */
    let freq_mhz = get_number(txpk, "freq")
        .ok_or_else(|| anyhow!("no mandatory \"txpk.freq\" object in JSON"))?;
    pkt.freq_hz = (1.0e6 * freq_mhz) as u32;

    /* parse RF chain used for TX (mandatory) */
    pkt.rf_chain = get_number(txpk, "rfch")
        .ok_or_else(|| anyhow!("no mandatory \"txpk.rfch\" object in JSON"))?
        as u8;

    /* parse TX power (optional field) */
    if let Some(powe) = get_number(txpk, "powe") {
        pkt.rf_power = powe as i8;
    }

    /* parse modulation (mandatory) */
    let modu = get_str(txpk, "modu")
        .ok_or_else(|| anyhow!("no mandatory \"txpk.modu\" object in JSON"))?;
    match modu {
        "LORA" => {
            pkt.modulation = Modulation::LORA;

            /* parse LoRa spreading-factor and modulation bandwidth (mandatory) */
            let datr = get_str(txpk, "datr")
                .ok_or_else(|| anyhow!("no mandatory \"txpk.datr\" object in JSON"))?;
            let (datarate, bandwidth) = protocol::parse_lora_datr(datr)
                .ok_or_else(|| anyhow!("format error in \"txpk.datr\""))?;
            pkt.datarate = datarate;
            pkt.bandwidth = bandwidth;

            /* parse ECC coding rate (mandatory) */
            let codr = get_str(txpk, "codr")
                .ok_or_else(|| anyhow!("no mandatory \"txpk.codr\" object in json"))?;
            pkt.coderate = protocol::parse_lora_codr(codr)
                .ok_or_else(|| anyhow!("format error in \"txpk.codr\""))?;

            /* parse signal polarity switch (optional field) */
            if let Some(ipol) = txpk.get("ipol").and_then(Value::as_bool) {
                pkt.invert_pol = ipol;
            }

            /* parse LoRa preamble length (optional field, optimum min value enforced) */
            pkt.preamble = match get_number(txpk, "prea") {
                Some(prea) => (prea as u16).max(MIN_LORA_PREAMB),
                None => STD_LORA_PREAMB,
            };
        }
        "FSK" => {
            pkt.modulation = Modulation::FSK;

            /* parse FSK bitrate (mandatory) */
            pkt.datarate = get_number(txpk, "datr")
                .ok_or_else(|| anyhow!("no mandatory \"txpk.datr\" object in JSON"))?
                as u32;
            if pkt.datarate == DR_UNDEFINED {
                bail!("format error in \"txpk.datr\"");
            }

            /* parse frequency deviation (mandatory); JSON value in Hz, f_dev in kHz */
            pkt.f_dev = (get_number(txpk, "fdev")
                .ok_or_else(|| anyhow!("no mandatory \"txpk.fdev\" object in JSON"))?
                / 1000.0) as u8;

            /* parse FSK preamble length (optional field, optimum min value enforced) */
            pkt.preamble = match get_number(txpk, "prea") {
                Some(prea) => (prea as u16).max(MIN_FSK_PREAMB),
                None => STD_FSK_PREAMB,
            };
        }
        _ => bail!("invalid modulation in \"txpk.modu\""),
    }

    /* parse payload length (mandatory) */
    pkt.size = get_number(txpk, "size")
        .ok_or_else(|| anyhow!("no mandatory \"txpk.size\" object in JSON"))?
        as u16;

    /* parse payload data (mandatory) */
    let data = get_str(txpk, "data")
        .ok_or_else(|| anyhow!("no mandatory \"txpk.data\" object in JSON"))?;
    let payload = protocol::b64_decode(data)?;
    if payload.len() > pkt.payload.len() {
        bail!("payload too large once converted to binary");
    }
    if payload.len() != pkt.size as usize {
        warn!("WARNING: [down] mismatch between .size and .data size once converted to binary");
    }
    pkt.payload[..payload.len()].copy_from_slice(&payload);

    Ok(pkt)
}

/// Body of one downstream task.
pub fn thread_down(ctx: DownstreamCtx) -> Result<()> {
    let serv_addr = &ctx.endpoint.addr;
    info!("INFO: [down] Thread activated for server {}", serv_addr);

    /* set downstream socket RX timeout */
    ctx.endpoint
        .sock_down
        .set_read_timeout(Some(ctx.pull_timeout))
        .map_err(|e| {
            error!("ERROR: [down] setsockopt for server {} returned {}", serv_addr, e);
            Error::SOCKOPT_ERROR
        })?;

    let mut buff_down = [0u8; 1000];
    /* count the number of PULL_DATA sent since the latest PULL_ACK */
    let mut autoquit_cnt: u32 = 0;

    while ctx.exit.should_run() {
        /* auto-quit if the threshold is crossed */
        if ctx.autoquit_threshold > 0 && autoquit_cnt >= ctx.autoquit_threshold {
            ctx.exit.request_exit();
            info!(
                "INFO: [down] for server {} the last {} PULL_DATA were not ACKed, exiting application",
                serv_addr, ctx.autoquit_threshold
            );
            break;
        }

        /* generate a random token and send the PULL request */
        let token: u16 = rand::random();
        let buff_req = protocol::pull_data(token, ctx.gateway_eui);
        if let Err(e) = ctx.endpoint.sock_down.send(&buff_req) {
            warn!("WARNING: [down] send to server {} failed: {}", serv_addr, e);
        }
        let send_time = Instant::now();
        ctx.meas_dw.add(&ctx.meas_dw.dw_pull_sent, 1);
        let mut req_ack = false; /* keep track of whether PULL_DATA was acknowledged or not */
        autoquit_cnt += 1;

        /* listen to packets and process them until a new PULL request must be sent */
        while ctx.exit.should_run() && send_time.elapsed() < ctx.keepalive_time {
            /* try to receive a datagram */
            let msg_len = match ctx.endpoint.sock_down.recv(&mut buff_down) {
                Ok(len) => len,
                Err(e)
                    if e.kind() == std::io::ErrorKind::WouldBlock
                        || e.kind() == std::io::ErrorKind::TimedOut =>
                {
                    continue
                }
                Err(e) => {
                    warn!("WARNING: [down] recv returned {}", e);
                    continue;
                }
            };
            let buff = &buff_down[..msg_len];

            /* if the datagram does not respect the protocol, just ignore it */
            if msg_len < 4
                || buff[0] != PROTOCOL_VERSION
                || (buff[3] != PKT_PULL_RESP && buff[3] != PKT_PULL_ACK)
            {
                continue;
            }

            /* if the datagram is an ACK, check the token */
            if buff[3] == PKT_PULL_ACK {
                if protocol::is_ack(buff, PKT_PULL_ACK, token) {
                    if req_ack {
                        info!("INFO: [down] for server {} duplicate ACK received", serv_addr);
                    } else {
                        /* this packet was not already acknowledged */
                        req_ack = true;
                        autoquit_cnt = 0;
                        ctx.meas_dw.add(&ctx.meas_dw.dw_ack_rcv, 1);
                        info!(
                            "INFO: [down] for server {} PULL_ACK received in {} ms",
                            serv_addr,
                            send_time.elapsed().as_millis()
                        );
                    }
                } else {
                    info!("INFO: [down] for server {}, received out-of-sync ACK", serv_addr);
                }
                continue;
            }

            /* the datagram is a PULL_RESP */
            info!("INFO: [down] for server {} PULL_RESP received", serv_addr);
            let pkt = match parse_pull_resp(&buff[4..], ctx.gps_active, &ctx.timeref) {
                Ok(pkt) => pkt,
                Err(e) => {
                    warn!("WARNING: [down] {:#}, TX aborted", e);
                    continue;
                }
            };

            /* record measurement data; count only datagrams with no JSON errors */
            ctx.meas_dw.add(&ctx.meas_dw.dw_dgram_rcv, 1);
            ctx.meas_dw.add(&ctx.meas_dw.dw_network_byte, msg_len as u32);
            ctx.meas_dw.add(&ctx.meas_dw.dw_payload_byte, u32::from(pkt.size));

            /* transfer data and metadata to the concentrator, and schedule TX */
            if let Err(e) = ctx.conc.send(&pkt) {
                ctx.meas_dw.add(&ctx.meas_dw.nb_tx_fail, 1);
                warn!("WARNING: [down] lgw_send failed: {:#}", e);
            } else {
                ctx.meas_dw.add(&ctx.meas_dw.nb_tx_ok, 1);
            }
        }
    }
    info!("INFO: End of downstream thread for server {}", serv_addr);
    Ok(())
}
