//! Shared gateway to the concentrator. The hardware cannot be accessed from
//! two tasks at once, so every operation takes the single coarse lock and
//! releases it before returning.

use std::sync::{Mutex, PoisonError};

use anyhow::Result;

use crate::hal::{LgwHal, LgwPktRx, LgwPktTx};

/// Trigger-counter value reported by a concentrator that silently reset
/// itself. Observing it means the hardware state is gone and the process
/// must terminate.
pub const SPURIOUS_RESET_TRIGCNT: u32 = 0x7E000000;

pub struct Concentrator {
    hal: Mutex<Box<dyn LgwHal>>,
}

impl Concentrator {
    pub fn new(hal: Box<dyn LgwHal>) -> Self {
        Self { hal: Mutex::new(hal) }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Box<dyn LgwHal>> {
        self.hal.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn start(&self) -> Result<()> {
        self.lock().lgw_start()
    }

    pub fn stop(&self) -> Result<()> {
        self.lock().lgw_stop()
    }

    /// Fetch up to `max_pkt` packets from the RX buffer.
    pub fn receive(&self, max_pkt: usize) -> Result<Vec<LgwPktRx>> {
        self.lock().lgw_receive(max_pkt)
    }

    /// Transfer one packet to the concentrator and schedule its TX.
    pub fn send(&self, pkt: &LgwPktTx) -> Result<()> {
        self.lock().lgw_send(pkt)
    }

    /// Current TX path status (`hal::TX_*`).
    pub fn tx_status(&self) -> Result<u8> {
        self.lock().lgw_status()
    }

    /// Counter value latched on the last PPS trigger.
    pub fn trigger_count(&self) -> Result<u32> {
        self.lock().lgw_get_trigcnt()
    }

    /// Run `f` with exclusive access to the HAL, for configuration
    /// submission at startup.
    pub fn with_hal<T>(&self, f: impl FnOnce(&mut dyn LgwHal) -> T) -> T {
        f(self.lock().as_mut())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::VirtualConcentrator;
    use std::sync::Arc;

    #[test]
    fn serialised_access_from_multiple_threads() {
        let conc = Arc::new(Concentrator::new(Box::new(VirtualConcentrator::new())));
        conc.start().unwrap();

        let mut handles = Vec::new();
        for _ in 0..4 {
            let conc = conc.clone();
            handles.push(std::thread::spawn(move || {
                for _ in 0..50 {
                    conc.trigger_count().unwrap();
                    conc.receive(8).unwrap();
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
    }
}
