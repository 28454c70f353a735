//! Shared test fixtures: a scripted concentrator backend whose state can be
//! inspected from the test after being handed to the forwarder.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use poly_pkt_fwd::hal::{
    LgwConfBoard, LgwConfRxIf, LgwConfRxRf, LgwHal, LgwPktRx, LgwPktTx, LgwTxGain, TX_FREE,
};

#[derive(Debug, Default)]
pub struct MockState {
    /// Batches handed out by successive `lgw_receive` calls.
    pub rx_batches: VecDeque<Vec<LgwPktRx>>,
    /// Every packet scheduled through `lgw_send`.
    pub sent: Vec<LgwPktTx>,
    pub trigcnt: u32,
    pub tx_status: u8,
}

pub struct MockHal(pub Arc<Mutex<MockState>>);

pub fn mock_hal() -> (MockHal, Arc<Mutex<MockState>>) {
    let state = Arc::new(Mutex::new(MockState {
        tx_status: TX_FREE,
        ..Default::default()
    }));
    (MockHal(state.clone()), state)
}

impl LgwHal for MockHal {
    fn lgw_board_setconf(&mut self, _conf: &LgwConfBoard) -> Result<()> {
        Ok(())
    }
    fn lgw_rxrf_setconf(&mut self, _rf_chain: u8, _conf: &LgwConfRxRf) -> Result<()> {
        Ok(())
    }
    fn lgw_rxif_setconf(&mut self, _if_chain: u8, _conf: &LgwConfRxIf) -> Result<()> {
        Ok(())
    }
    fn lgw_txgain_setconf(&mut self, _conf: &[LgwTxGain]) -> Result<()> {
        Ok(())
    }
    fn lgw_start(&mut self) -> Result<()> {
        Ok(())
    }
    fn lgw_stop(&mut self) -> Result<()> {
        Ok(())
    }
    fn lgw_receive(&mut self, max_pkt: usize) -> Result<Vec<LgwPktRx>> {
        let mut state = self.0.lock().unwrap();
        let mut batch = state.rx_batches.pop_front().unwrap_or_default();
        batch.truncate(max_pkt);
        Ok(batch)
    }
    fn lgw_send(&mut self, pkt: &LgwPktTx) -> Result<()> {
        self.0.lock().unwrap().sent.push(pkt.clone());
        Ok(())
    }
    fn lgw_status(&mut self) -> Result<u8> {
        Ok(self.0.lock().unwrap().tx_status)
    }
    fn lgw_get_trigcnt(&mut self) -> Result<u32> {
        Ok(self.0.lock().unwrap().trigcnt)
    }
}
