//! Multi-server LoRa packet forwarder: bridges a LoRa concentrator to one or
//! more network servers over UDP, timestamps packets against a GNSS
//! receiver, emits a PPS-aligned time beacon and accepts synthetic "ghost"
//! uplinks alongside the radio stream.

pub mod beacon;
pub mod concentrator;
pub mod config;
pub mod downstream;
pub mod endpoint;
pub mod error;
pub mod ghost;
pub mod gps;
pub mod hal;
pub mod protocol;
pub mod shutdown;
pub mod stats;
pub mod timeref;
pub mod upstream;
pub mod xtal;
