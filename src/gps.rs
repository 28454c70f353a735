//! GNSS ingest: blocking serial reads, NMEA reassembly and parsing, time
//! reference synchronisation and position publishing. Only RMC sentences
//! trigger a sync; GGA sentences refresh the position that the next sync
//! cycle publishes.

use std::io::Read;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use crossbeam_channel::Sender;
use serialport::SerialPort;
use tracing::{info, warn};

use crate::beacon::BeaconArm;
use crate::concentrator::Concentrator;
use crate::shutdown::ExitSignal;
use crate::stats::GpsMeas;
use crate::timeref::GpsTimeRef;

/// Geographic position of the gateway.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Coord {
    pub lat: f64, /* degrees, north positive */
    pub lon: f64, /* degrees, east positive */
    pub alt: i16, /* meters above mean sea level */
}

/// Outcome of parsing one NMEA sentence.
#[derive(Debug, PartialEq)]
pub enum NmeaMsg {
    /// Recommended minimum data: UTC time and fix validity.
    Rmc { utc: DateTime<Utc>, valid: bool },
    /// Fix data: position when a fix is available.
    Gga { coord: Option<Coord> },
    /// Valid sentence of a kind the forwarder does not use.
    Ignored,
    /// Bad framing or checksum.
    Invalid,
}

fn checksum_valid(sentence: &str) -> bool {
    let Some(body) = sentence.strip_prefix('$') else {
        return false;
    };
    let Some((data, given)) = body.rsplit_once('*') else {
        return false;
    };
    let Ok(given) = u8::from_str_radix(given.trim_end(), 16) else {
        return false;
    };
    let computed = data.bytes().fold(0u8, |acc, b| acc ^ b);
    computed == given
}

/// Convert a `(d)ddmm.mmmm` NMEA coordinate field plus its hemisphere
/// indicator to signed decimal degrees.
fn parse_coord_field(field: &str, hemi: &str, deg_digits: usize) -> Option<f64> {
    if field.len() < deg_digits {
        return None;
    }
    let deg: f64 = field[..deg_digits].parse().ok()?;
    let min: f64 = field[deg_digits..].parse().ok()?;
    let value = deg + min / 60.0;
    match hemi {
        "N" | "E" => Some(value),
        "S" | "W" => Some(-value),
        _ => None,
    }
}

fn parse_hms(field: &str) -> Option<(u32, u32, u32, u32)> {
    if field.len() < 6 {
        return None;
    }
    let h: u32 = field[0..2].parse().ok()?;
    let m: u32 = field[2..4].parse().ok()?;
    let s: f64 = field[4..].parse().ok()?;
    let sec = s as u32;
    let nanos = ((s - sec as f64) * 1e9) as u32;
    Some((h, m, sec, nanos))
}

fn parse_rmc(fields: &[&str]) -> Option<NmeaMsg> {
    if fields.len() < 10 {
        return None;
    }
    let valid = fields[2] == "A";
    let (h, m, s, nanos) = parse_hms(fields[1])?;
    let date = fields[9];
    if date.len() < 6 {
        return None;
    }
    let day: u32 = date[0..2].parse().ok()?;
    let month: u32 = date[2..4].parse().ok()?;
    let yy: i32 = date[4..6].parse().ok()?;
    let year = if yy < 80 { 2000 + yy } else { 1900 + yy };

    let utc = NaiveDate::from_ymd_opt(year, month, day)?
        .and_hms_nano_opt(h, m, s, nanos)
        .map(|naive| Utc.from_utc_datetime(&naive))?;
    Some(NmeaMsg::Rmc { utc, valid })
}

fn parse_gga(fields: &[&str]) -> Option<NmeaMsg> {
    if fields.len() < 10 {
        return None;
    }
    let fix: u32 = fields[6].parse().ok()?;
    if fix == 0 {
        return Some(NmeaMsg::Gga { coord: None });
    }
    let lat = parse_coord_field(fields[2], fields[3], 2)?;
    let lon = parse_coord_field(fields[4], fields[5], 3)?;
    let alt: f64 = fields[9].parse().ok()?;
    Some(NmeaMsg::Gga {
        coord: Some(Coord { lat, lon, alt: alt.round() as i16 }),
    })
}

/// Parse one complete NMEA sentence (framing `$...*hh`).
pub fn parse_nmea(sentence: &str) -> NmeaMsg {
    let sentence = sentence.trim_end();
    if !checksum_valid(sentence) {
        return NmeaMsg::Invalid;
    }
    /* strip "$", checksum, and split the data fields */
    let body = &sentence[1..sentence.rfind('*').unwrap_or(sentence.len())];
    let fields: Vec<&str> = body.split(',').collect();

    /* the talker prefix (GP, GN, ...) varies with the constellation */
    let msg_type = fields[0];
    if msg_type.len() != 5 {
        return NmeaMsg::Invalid;
    }
    match &msg_type[2..] {
        "RMC" => parse_rmc(&fields).unwrap_or(NmeaMsg::Invalid),
        "GGA" => parse_gga(&fields).unwrap_or(NmeaMsg::Invalid),
        _ => NmeaMsg::Ignored,
    }
}

/// Reassembles NMEA sentences from raw serial chunks.
#[derive(Debug, Default)]
pub struct NmeaBuffer {
    pending: Vec<u8>,
}

impl NmeaBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk, returning every completed line.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();
        for &b in chunk {
            if b == b'\n' {
                let line = String::from_utf8_lossy(&self.pending).trim().to_string();
                self.pending.clear();
                if !line.is_empty() {
                    lines.push(line);
                }
            } else {
                self.pending.push(b);
                if self.pending.len() > 512 {
                    /* garbage on the line, resynchronize */
                    self.pending.clear();
                }
            }
        }
        lines
    }
}

pub struct GpsCtx {
    pub exit: Arc<ExitSignal>,
    pub conc: Arc<Concentrator>,
    pub timeref: Arc<GpsTimeRef>,
    pub gps_meas: Arc<GpsMeas>,
    pub beacon_arm: Option<Sender<BeaconArm>>,
    pub beacon_period: u32,
    pub beacon_offset: u32,
}

/// Body of the GNSS task. Each complete, valid RMC sentence pre-arms the
/// beacon when the next PPS falls on the beacon cycle, reads the trigger
/// counter under the concentrator lock and re-synchronises the time
/// reference; any step failing skips this cycle but does not kill the task.
pub fn thread_gps(ctx: GpsCtx, mut port: Box<dyn SerialPort>) -> Result<()> {
    info!("INFO: GPS thread activated.");

    let mut serial_buff = [0u8; 128];
    let mut nmea = NmeaBuffer::new();
    let mut last_coord: Option<Coord> = None;

    while ctx.exit.should_run() {
        /* read with timeout so the exit flag stays observable */
        let nb_char = match port.read(&mut serial_buff) {
            Ok(n) => n,
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => continue,
            Err(e) => {
                warn!("WARNING: [gps] read() returned {}", e);
                std::thread::sleep(Duration::from_millis(100));
                continue;
            }
        };
        if nb_char == 0 {
            continue;
        }

        for line in nmea.feed(&serial_buff[..nb_char]) {
            match parse_nmea(&line) {
                NmeaMsg::Gga { coord } => last_coord = coord,
                NmeaMsg::Rmc { utc, valid } => {
                    /* trigger sync only on RMC frames */
                    if !valid {
                        ctx.gps_meas.publish(None);
                        continue;
                    }

                    /* check if a beacon must be prepared for the next PPS */
                    if ctx.beacon_period > 0 {
                        let sec_of_cycle =
                            ((utc.timestamp() + 1).rem_euclid(i64::from(ctx.beacon_period))) as u32;
                        if sec_of_cycle == ctx.beacon_offset {
                            if let Some(arm) = &ctx.beacon_arm {
                                /* single-slot channel: a pending arm means the
                                beacon task has not caught up yet */
                                let _ = arm.try_send(BeaconArm {
                                    pps_utc_sec: utc.timestamp() + 1,
                                });
                            }
                        }
                    }

                    /* get the timestamp captured on the PPS pulse */
                    let trig_tstamp = match ctx.conc.trigger_count() {
                        Ok(cnt) => cnt,
                        Err(e) => {
                            warn!("WARNING: [gps] failed to read concentrator timestamp: {:#}", e);
                            continue;
                        }
                    };

                    /* try to update the time reference with the new UTC & timestamp */
                    if ctx.timeref.sync(trig_tstamp, utc).is_err() {
                        warn!("WARNING: [gps] GPS out of sync, keeping previous time reference");
                        continue;
                    }

                    /* update gateway coordinates */
                    ctx.gps_meas.publish(last_coord);
                }
                NmeaMsg::Ignored | NmeaMsg::Invalid => {}
            }
        }
    }
    info!("INFO: End of GPS thread");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    /* textbook sentences with correct checksums */
    const RMC: &str = "$GPRMC,123519,A,4807.038,N,01131.000,E,022.4,084.4,230394,003.1,W*6A";
    const GGA: &str = "$GPGGA,123519,4807.038,N,01131.000,E,1,08,0.9,545.4,M,46.9,M,,*47";

    #[test]
    fn rmc_parses_time_and_validity() {
        match parse_nmea(RMC) {
            NmeaMsg::Rmc { utc, valid } => {
                assert!(valid);
                assert_eq!(utc.to_rfc3339(), "1994-03-23T12:35:19+00:00");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn gga_parses_position() {
        match parse_nmea(GGA) {
            NmeaMsg::Gga { coord: Some(coord) } => {
                assert!((coord.lat - (48.0 + 7.038 / 60.0)).abs() < 1e-9);
                assert!((coord.lon - (11.0 + 31.0 / 60.0)).abs() < 1e-9);
                assert_eq!(coord.alt, 545);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn bad_checksum_is_rejected() {
        let corrupted = RMC.replace("*6A", "*6B");
        assert_eq!(parse_nmea(&corrupted), NmeaMsg::Invalid);
    }

    #[test]
    fn southern_western_hemispheres_are_negative() {
        assert_eq!(parse_coord_field("4807.038", "S", 2), Some(-(48.0 + 7.038 / 60.0)));
        assert_eq!(parse_coord_field("01131.000", "W", 3), Some(-(11.0 + 31.0 / 60.0)));
    }

    #[test]
    fn unknown_sentences_are_ignored() {
        /* GSV sentence, checksum valid */
        let gsv = "$GPGSV,3,1,11,03,03,111,00,04,15,270,00,06,01,010,00,13,06,292,00*74";
        assert_eq!(parse_nmea(gsv), NmeaMsg::Ignored);
    }

    #[test]
    fn buffer_reassembles_split_sentences() {
        let mut buff = NmeaBuffer::new();
        let (a, b) = RMC.split_at(20);
        assert!(buff.feed(a.as_bytes()).is_empty());
        let mut chunk = b.as_bytes().to_vec();
        chunk.extend_from_slice(b"\r\n");
        let lines = buff.feed(&chunk);
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0], RMC);
    }
}
