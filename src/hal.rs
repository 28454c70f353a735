//! Interface to the LoRa concentrator hardware abstraction layer.
//!
//! The forwarding engine only consumes the narrow surface defined here; the
//! real radio driver lives out of tree and plugs in through [`LgwHal`]. A
//! [`VirtualConcentrator`] backend is provided for radio-less operation
//! (ghost/status streams only) and for tests.

use std::time::Instant;

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/* concentrator chipset-specific parameters */
pub const LGW_RF_CHAIN_NB: u8 = 2; /* number of RF chains */
pub const LGW_IF_CHAIN_NB: u8 = 10; /* number of IF+modem RX chains */
pub const LGW_MULTI_NB: u8 = 8; /* number of LoRa 'multi SF' chains */

/* values available for the 'bandwidth' parameters (LoRa & FSK) */
pub const BW_UNDEFINED: u8 = 0;
pub const BW_500KHZ: u8 = 0x06;
pub const BW_250KHZ: u8 = 0x05;
pub const BW_125KHZ: u8 = 0x04;

/* values available for the 'datarate' parameters */
/* NOTE: LoRa values used directly to code SF bitmask in 'multi' modem, do not change */
pub const DR_UNDEFINED: u32 = 0;
pub const DR_LORA_SF7: u32 = 7;
pub const DR_LORA_SF8: u32 = 8;
pub const DR_LORA_SF9: u32 = 9;
pub const DR_LORA_SF10: u32 = 10;
pub const DR_LORA_SF11: u32 = 11;
pub const DR_LORA_SF12: u32 = 12;
pub const DR_FSK_MIN: u32 = 500;
pub const DR_FSK_MAX: u32 = 250000;

/* values available for the 'coderate' parameters (LoRa only) */
/* NOTE: arbitrary values */
pub const CR_UNDEFINED: u8 = 0;
pub const CR_LORA_4_5: u8 = 0x01;
pub const CR_LORA_4_6: u8 = 0x02;
pub const CR_LORA_4_7: u8 = 0x03;
pub const CR_LORA_4_8: u8 = 0x04;

/* status code for received packets */
pub const STAT_UNDEFINED: u8 = 0x00;
pub const STAT_NO_CRC: u8 = 0x01;
pub const STAT_CRC_BAD: u8 = 0x11;
pub const STAT_CRC_OK: u8 = 0x10;

/* status code for TX_STATUS */
/* NOTE: arbitrary values */
pub const TX_STATUS_UNKNOWN: u8 = 0;
pub const TX_OFF: u8 = 1; /* TX modem disabled, it will ignore commands */
pub const TX_FREE: u8 = 2; /* TX modem is free, ready to receive a command */
pub const TX_SCHEDULED: u8 = 3; /* TX modem is loaded, ready to send the packet after an event and/or delay */
pub const TX_EMITTING: u8 = 4; /* TX modem is emitting */

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Modulation {
    UNDEFINED = 0,
    LORA = 0x10,
    FSK = 0x20,
}

impl std::fmt::Display for Modulation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Modulation::UNDEFINED => write!(f, "Undefined"),
            Modulation::LORA => write!(f, "LoRa"),
            Modulation::FSK => write!(f, "FSK"),
        }
    }
}

/* values available for the 'tx_mode' parameter */
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
#[allow(non_camel_case_types)]
pub enum TxMode {
    IMMEDIATE = 0,
    TIMESTAMPED = 1,
    ON_GPS = 2,
}

/**
@struct LgwPktRx
@brief Metadata and payload of a packet that was received
*/
#[derive(Debug, Clone)]
pub struct LgwPktRx {
    pub freq_hz: u32,         /* central frequency of the IF chain */
    pub if_chain: u8,         /* by which IF chain was packet received */
    pub status: u8,           /* status of the received packet */
    pub count_us: u32,        /* internal concentrator counter for timestamping, 1 microsecond resolution */
    pub rf_chain: u8,         /* through which RF chain the packet was received */
    pub modulation: Modulation, /* modulation used by the packet */
    pub bandwidth: u8,        /* modulation bandwidth (LoRa only) */
    pub datarate: u32,        /* RX datarate of the packet (SF for LoRa) */
    pub coderate: u8,         /* error-correcting code of the packet (LoRa only) */
    pub rssi: f32,            /* average packet RSSI in dB */
    pub snr: f32,             /* average packet SNR, in dB (LoRa only) */
    pub size: u16,            /* payload size in bytes */
    pub payload: [u8; 256],   /* buffer containing the payload */
}

impl LgwPktRx {
    pub fn new() -> Self {
        Self {
            freq_hz: 0,
            if_chain: 0,
            status: STAT_UNDEFINED,
            count_us: 0,
            rf_chain: 0,
            modulation: Modulation::UNDEFINED,
            bandwidth: BW_UNDEFINED,
            datarate: DR_UNDEFINED,
            coderate: CR_UNDEFINED,
            rssi: 0.0,
            snr: 0.0,
            size: 0,
            payload: [0; 256],
        }
    }
}

impl Default for LgwPktRx {
    fn default() -> Self {
        Self::new()
    }
}

/**
@struct LgwPktTx
@brief Configuration of a packet to send and its payload
*/
#[derive(Debug, Clone)]
pub struct LgwPktTx {
    pub freq_hz: u32,         /* center frequency of TX */
    pub tx_mode: TxMode,      /* select on what event/time the TX is triggered */
    pub count_us: u32,        /* timestamp or delay in microseconds for TX trigger */
    pub rf_chain: u8,         /* through which RF chain will the packet be sent */
    pub rf_power: i8,         /* TX power, in dBm */
    pub modulation: Modulation, /* modulation to use for the packet */
    pub bandwidth: u8,        /* modulation bandwidth (LoRa only) */
    pub datarate: u32,        /* TX datarate (baudrate for FSK, SF for LoRa) */
    pub coderate: u8,         /* error-correcting code of the packet (LoRa only) */
    pub invert_pol: bool,     /* invert signal polarity, for orthogonal downlinks (LoRa only) */
    pub f_dev: u8,            /* frequency deviation, in kHz (FSK only) */
    pub preamble: u16,        /* set the preamble length, 0 for default */
    pub no_crc: bool,         /* if true, do not send a CRC in the packet */
    pub no_header: bool,      /* if true, enable implicit header mode (LoRa), fixed length (FSK) */
    pub size: u16,            /* payload size in bytes */
    pub payload: [u8; 256],   /* buffer containing the payload */
}

impl Default for LgwPktTx {
    fn default() -> Self {
        Self {
            freq_hz: 0,
            tx_mode: TxMode::IMMEDIATE,
            count_us: 0,
            rf_chain: 0,
            rf_power: 0,
            modulation: Modulation::UNDEFINED,
            bandwidth: BW_UNDEFINED,
            datarate: DR_UNDEFINED,
            coderate: CR_UNDEFINED,
            invert_pol: false,
            f_dev: 0,
            preamble: 0,
            no_crc: false,
            no_header: false,
            size: 0,
            payload: [0; 256],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[allow(non_camel_case_types)]
pub enum LgwRadioType {
    #[serde(rename = "NONE")]
    LGW_RADIO_TYPE_NONE,
    #[serde(rename = "SX1255")]
    LGW_RADIO_TYPE_SX1255,
    #[serde(rename = "SX1257")]
    LGW_RADIO_TYPE_SX1257,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct LgwConfBoard {
    #[serde(default)]
    pub lorawan_public: bool, //* Enable ONLY for *public* networks using the LoRa MAC protocol */
    #[serde(default)]
    pub clksrc: u8, //* Index of RF chain which provides clock to concentrator */
}

impl Default for LgwConfBoard {
    fn default() -> Self {
        Self { lorawan_public: false, clksrc: 0 }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct LgwConfRxRf {
    #[serde(default)]
    pub enable: bool, //* enable or disable that RF chain */
    #[serde(rename = "freq", default)]
    pub freq_hz: u32, //* center frequency of the radio in Hz */
    #[serde(default)]
    pub rssi_offset: f32, //* Board-specific RSSI correction factor */
    #[serde(rename = "type", default = "default_radio_type")]
    pub _type: LgwRadioType, //* Radio type for that RF chain (SX1255, SX1257) */
    #[serde(default)]
    pub tx_enable: bool, //* enable or disable TX on that RF chain */
}

fn default_radio_type() -> LgwRadioType {
    LgwRadioType::LGW_RADIO_TYPE_NONE
}

impl Default for LgwConfRxRf {
    fn default() -> Self {
        Self {
            enable: false,
            freq_hz: 0,
            rssi_offset: 0.0,
            _type: LgwRadioType::LGW_RADIO_TYPE_NONE,
            tx_enable: false,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default)]
pub struct LgwConfRxIf {
    #[serde(default)]
    pub enable: bool, //* enable or disable that IF chain */
    #[serde(rename = "radio", default)]
    pub rf_chain: u8, //* to which RF chain is that IF chain associated */
    #[serde(rename = "if", default)]
    pub freq_hz: i32, //* center frequ of the IF chain, relative to RF chain frequency */
    #[serde(default)]
    pub bandwidth: u8, //* RX bandwidth, 0 for default */
    #[serde(default)]
    pub datarate: u32, //* RX datarate, 0 for default */
}

pub const TX_GAIN_LUT_SIZE_MAX: usize = 16;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default)]
pub struct LgwTxGain {
    #[serde(default)]
    pub pa_gain: u8, //* 2 bits: control of the external PA */
    #[serde(default = "default_dac_gain")]
    pub dac_gain: u8, //* 2 bits: control of the radio DAC */
    #[serde(default)]
    pub dig_gain: u8, //* 2 bits: control of the digital gain */
    #[serde(default)]
    pub mix_gain: u8, //* 4 bits: control of the radio mixer */
    #[serde(default)]
    pub rf_power: i8, //* measured TX power at the board connector, in dBm */
}

fn default_dac_gain() -> u8 {
    3 /* the only dac_gain supported for now */
}

/// Surface of the concentrator library the forwarder relies on. All calls
/// must be serialised by the caller; see `concentrator::Concentrator`.
pub trait LgwHal: Send {
    fn lgw_board_setconf(&mut self, conf: &LgwConfBoard) -> Result<()>;
    fn lgw_rxrf_setconf(&mut self, rf_chain: u8, conf: &LgwConfRxRf) -> Result<()>;
    fn lgw_rxif_setconf(&mut self, if_chain: u8, conf: &LgwConfRxIf) -> Result<()>;
    fn lgw_txgain_setconf(&mut self, conf: &[LgwTxGain]) -> Result<()>;
    fn lgw_start(&mut self) -> Result<()>;
    fn lgw_stop(&mut self) -> Result<()>;
    /// Fetch up to `max_pkt` received packets from the RX buffer.
    fn lgw_receive(&mut self, max_pkt: usize) -> Result<Vec<LgwPktRx>>;
    /// Schedule one packet for transmission.
    fn lgw_send(&mut self, pkt: &LgwPktTx) -> Result<()>;
    /// Current state of the TX path, one of the `TX_*` status codes.
    fn lgw_status(&mut self) -> Result<u8>;
    /// Value of the internal counter latched on the last PPS trigger.
    fn lgw_get_trigcnt(&mut self) -> Result<u32>;
}

/// Concentrator backend with no radio attached. Receives nothing, accepts
/// and discards transmissions, and derives the trigger counter from the host
/// monotonic clock. Used when `radiostream` is disabled and by the tests.
pub struct VirtualConcentrator {
    is_started: bool,
    board_cfg: LgwConfBoard,
    rf_chain_cfg: [LgwConfRxRf; LGW_RF_CHAIN_NB as usize],
    if_chain_cfg: [LgwConfRxIf; LGW_IF_CHAIN_NB as usize],
    txgain_lut: Vec<LgwTxGain>,
    epoch: Instant,
    nb_tx: u32,
}

impl VirtualConcentrator {
    pub fn new() -> Self {
        Self {
            is_started: false,
            board_cfg: Default::default(),
            rf_chain_cfg: Default::default(),
            if_chain_cfg: Default::default(),
            txgain_lut: Vec::new(),
            epoch: Instant::now(),
            nb_tx: 0,
        }
    }

    pub fn packets_sent(&self) -> u32 {
        self.nb_tx
    }
}

impl Default for VirtualConcentrator {
    fn default() -> Self {
        Self::new()
    }
}

impl LgwHal for VirtualConcentrator {
    fn lgw_board_setconf(&mut self, conf: &LgwConfBoard) -> Result<()> {
        if self.is_started {
            return Err(anyhow!("CONCENTRATOR IS RUNNING, STOP IT BEFORE TOUCHING CONFIGURATION"));
        }
        self.board_cfg = *conf;
        Ok(())
    }

    fn lgw_rxrf_setconf(&mut self, rf_chain: u8, conf: &LgwConfRxRf) -> Result<()> {
        if rf_chain >= LGW_RF_CHAIN_NB {
            return Err(anyhow!("NOT A VALID RF_CHAIN NUMBER"));
        }
        self.rf_chain_cfg[rf_chain as usize] = *conf;
        Ok(())
    }

    fn lgw_rxif_setconf(&mut self, if_chain: u8, conf: &LgwConfRxIf) -> Result<()> {
        if if_chain >= LGW_IF_CHAIN_NB {
            return Err(anyhow!("NOT A VALID IF_CHAIN NUMBER"));
        }
        self.if_chain_cfg[if_chain as usize] = *conf;
        Ok(())
    }

    fn lgw_txgain_setconf(&mut self, conf: &[LgwTxGain]) -> Result<()> {
        if conf.len() > TX_GAIN_LUT_SIZE_MAX {
            return Err(anyhow!("TX GAIN LUT TOO LARGE"));
        }
        self.txgain_lut = conf.to_vec();
        Ok(())
    }

    fn lgw_start(&mut self) -> Result<()> {
        if self.is_started {
            return Ok(());
        }
        self.epoch = Instant::now();
        self.is_started = true;
        debug!(
            "virtual concentrator: clksrc {}, {} RF chains enabled, {} IF chains enabled, {} TX gain entries",
            self.board_cfg.clksrc,
            self.rf_chain_cfg.iter().filter(|c| c.enable).count(),
            self.if_chain_cfg.iter().filter(|c| c.enable).count(),
            self.txgain_lut.len()
        );
        info!("INFO: virtual concentrator started, no radio packets will be received");
        Ok(())
    }

    fn lgw_stop(&mut self) -> Result<()> {
        if !self.is_started {
            info!("Note: LoRa concentrator was not started...");
            return Ok(());
        }
        self.is_started = false;
        Ok(())
    }

    fn lgw_receive(&mut self, _max_pkt: usize) -> Result<Vec<LgwPktRx>> {
        if !self.is_started {
            return Err(anyhow!("CONCENTRATOR IS NOT RUNNING"));
        }
        Ok(Vec::new())
    }

    fn lgw_send(&mut self, pkt: &LgwPktTx) -> Result<()> {
        if !self.is_started {
            return Err(anyhow!("CONCENTRATOR IS NOT RUNNING, START IT BEFORE SENDING"));
        }
        if pkt.rf_chain >= LGW_RF_CHAIN_NB {
            return Err(anyhow!("INVALID RF_CHAIN TO SEND PACKETS"));
        }
        if pkt.size > 255 {
            return Err(anyhow!("PAYLOAD LENGTH TOO BIG FOR TX"));
        }
        if pkt.modulation == Modulation::UNDEFINED {
            return Err(anyhow!("INVALID TX MODULATION"));
        }
        self.nb_tx += 1;
        debug!(
            "virtual TX: freq {} Hz, mode {:?}, size {}",
            pkt.freq_hz, pkt.tx_mode, pkt.size
        );
        Ok(())
    }

    fn lgw_status(&mut self) -> Result<u8> {
        if !self.is_started {
            warn!("WARNING: concentrator is not started, TX status unknown");
            return Ok(TX_STATUS_UNKNOWN);
        }
        Ok(TX_FREE)
    }

    fn lgw_get_trigcnt(&mut self) -> Result<u32> {
        if !self.is_started {
            return Err(anyhow!("CONCENTRATOR IS NOT RUNNING"));
        }
        Ok(self.epoch.elapsed().as_micros() as u32)
    }
}
