#![allow(dead_code)]

//! Mock device and a minimal network server used by the MAC scenario tests.

use aes::cipher::{BlockDecrypt, KeyInit};
use lorawan_node::device::non_volatile_store::NonVolatileStore;
use lorawan_node::device::radio::types::{RfConfig, RxQuality, TxConfig};
use lorawan_node::device::radio::Radio;
use lorawan_node::device::timer::{Timer, TimerId};
use lorawan_node::device::Device;
use lorawan_node::encoding::default_crypto::DefaultFactory;
use lorawan_node::encoding::keys::{AES128, MIC};
use lorawan_node::encoding::parser::{
    parse_data_message, DataMessage, DevAddr, FCtrl, MType, MHDR,
};
use lorawan_node::encoding::securityhelpers::{
    calculate_data_mic, calculate_mic, derive_session_key, encrypt_frm_data_payload, Direction,
    SessionKeyType,
};
use lorawan_node::mac::event::Event;
use lorawan_node::mac::region::channel_plan::dynamic::DynamicChannelPlan;
use lorawan_node::mac::region::eu868::EU868;
use lorawan_node::mac::types::{Configuration, Credentials, Response};
use lorawan_node::mac::Mac;
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};

pub type EuMac = Mac<EU868, DynamicChannelPlan<EU868>>;

pub const APP_EUI: [u8; 8] = [0x70, 0xb3, 0xd5, 0x7e, 0xd0, 0x00, 0x00, 0x01];
pub const DEV_EUI: [u8; 8] = [0x00, 0x04, 0xa3, 0x0b, 0x00, 0x1e, 0x45, 0x92];
pub const APP_KEY: [u8; 16] = [
    0x2b, 0x7e, 0x15, 0x16, 0x28, 0xae, 0xd2, 0xa6, 0xab, 0xf7, 0x15, 0x88, 0x09, 0xcf, 0x4f, 0x3c,
];
pub const NWK_SKEY: [u8; 16] = [0x11; 16];
pub const APP_SKEY: [u8; 16] = [0x22; 16];
pub const DEV_ADDR: DevAddr = DevAddr(0x2601_1f2e);

#[derive(Default)]
pub struct MockTimer {
    pub now: u64,
    pub armed: Vec<(u64, TimerId)>,
}

impl MockTimer {
    pub fn deadline(&self, id: TimerId) -> Option<u64> {
        self.armed.iter().find(|(_, t)| *t == id).map(|(at, _)| *at)
    }

    /// Advance to the earliest armed timer and disarm it.
    pub fn pop_next(&mut self) -> Option<TimerId> {
        let index = (0..self.armed.len()).min_by_key(|i| self.armed[*i].0)?;
        let (at, id) = self.armed.remove(index);
        self.now = self.now.max(at);
        Some(id)
    }
}

impl Timer for MockTimer {
    type Error = ();

    fn now_ms(&self) -> u64 {
        self.now
    }

    fn schedule_once(&mut self, delay_ms: u32, id: TimerId) -> Result<(), ()> {
        self.cancel(id);
        self.armed.push((self.now + u64::from(delay_ms), id));
        Ok(())
    }

    fn cancel(&mut self, id: TimerId) {
        self.armed.retain(|(_, t)| *t != id);
    }
}

#[derive(Default)]
pub struct MockRadio {
    pub sent: Vec<(TxConfig, Vec<u8>)>,
    pub rx_configs: Vec<RfConfig>,
    pub receives: Vec<u32>,
    pub sleeps: usize,
    pub tx_in_progress: bool,
}

impl Radio for MockRadio {
    type Error = ();

    fn send(&mut self, config: TxConfig, buf: &[u8], _timeout_ms: u32) -> Result<(), ()> {
        self.sent.push((config, buf.to_vec()));
        self.tx_in_progress = true;
        Ok(())
    }

    fn set_rx_config(&mut self, config: RfConfig) -> Result<(), ()> {
        self.rx_configs.push(config);
        Ok(())
    }

    fn receive(&mut self, timeout_ms: u32) -> Result<(), ()> {
        self.receives.push(timeout_ms);
        Ok(())
    }

    fn sleep(&mut self) -> Result<(), ()> {
        self.sleeps += 1;
        Ok(())
    }
}

pub struct MockRng(StdRng);

impl lorawan_node::device::rng::Rng for MockRng {
    type Error = ();

    fn next_u32(&mut self) -> Result<u32, ()> {
        Ok(self.0.next_u32())
    }
}

pub struct MockStore(pub Vec<u8>);

impl NonVolatileStore for MockStore {
    type Error = ();

    fn read(&mut self, offset: usize, buf: &mut [u8]) -> Result<(), ()> {
        buf.copy_from_slice(self.0.get(offset..offset + buf.len()).ok_or(())?);
        Ok(())
    }

    fn write(&mut self, offset: usize, data: &[u8]) -> Result<(), ()> {
        self.0.get_mut(offset..offset + data.len()).ok_or(())?.copy_from_slice(data);
        Ok(())
    }
}

pub struct MockDevice {
    pub timer: MockTimer,
    pub radio: MockRadio,
    pub rng: MockRng,
    pub store: MockStore,
    pub battery: Option<f32>,
    pub link_checks: Vec<(u8, u8)>,
}

impl MockDevice {
    pub fn new() -> Self {
        Self {
            timer: MockTimer::default(),
            radio: MockRadio::default(),
            rng: MockRng(StdRng::seed_from_u64(7)),
            store: MockStore(vec![0xff; 4096]),
            battery: None,
            link_checks: Vec::new(),
        }
    }
}

impl Device for MockDevice {
    type Timer = MockTimer;
    type Radio = MockRadio;
    type Rng = MockRng;
    type NonVolatileStore = MockStore;

    fn timer(&mut self) -> &mut MockTimer {
        &mut self.timer
    }

    fn radio(&mut self) -> &mut MockRadio {
        &mut self.radio
    }

    fn rng(&mut self) -> &mut MockRng {
        &mut self.rng
    }

    fn non_volatile_store(&mut self) -> &mut MockStore {
        &mut self.store
    }

    fn max_eirp() -> i8 {
        14
    }

    fn handle_link_check(&mut self, gateway_count: u8, margin: u8) {
        self.link_checks.push((gateway_count, margin));
    }

    fn battery_level(&self) -> Option<f32> {
        self.battery
    }
}

pub fn credentials() -> Credentials {
    Credentials::new(APP_EUI, DEV_EUI, APP_KEY)
}

pub fn new_mac(configuration: Configuration) -> EuMac {
    Mac::new(configuration, credentials(), Default::default())
}

/// MAC with an ABP session, so tests can skip the join.
pub fn abp_mac(configuration: Configuration) -> EuMac {
    let mut mac = new_mac(configuration);
    mac.activate_by_personalization(DEV_ADDR, NWK_SKEY, APP_SKEY);
    mac
}

pub fn post(mac: &mut EuMac, device: &mut MockDevice, event: Event) {
    mac.post(event).unwrap();
    mac.process(device).unwrap();
}

pub fn rx(mac: &mut EuMac, device: &mut MockDevice, frame: &[u8]) {
    post(mac, device, Event::rx_done(frame, RxQuality::new(-70, 7)));
}

/// Report the end of the transmission in progress.
pub fn tx_done(mac: &mut EuMac, device: &mut MockDevice) {
    device.radio.tx_in_progress = false;
    post(mac, device, Event::TxDone);
}

/// Fire the earliest armed timer.
pub fn fire(mac: &mut EuMac, device: &mut MockDevice) -> TimerId {
    let id = device.timer.pop_next().expect("no timer armed");
    post(mac, device, Event::TimerFired(id));
    id
}

/// Run timers, completing every transmission and letting every receive window time out,
/// until the MAC reports something.
pub fn drive(mac: &mut EuMac, device: &mut MockDevice) -> Response {
    for _ in 0..200 {
        if let Some(response) = mac.next_response() {
            return response;
        }
        if device.radio.tx_in_progress {
            tx_done(mac, device);
            continue;
        }
        if let TimerId::Rx1 | TimerId::Rx2 = fire(mac, device) {
            post(mac, device, Event::RxTimeout);
        }
    }
    panic!("MAC never responded");
}

/// Server side of an OTAA join.
pub struct JoinServer {
    pub join_nonce: u32,
    pub net_id: u32,
    pub dev_addr: DevAddr,
}

impl JoinServer {
    pub fn new() -> Self {
        Self { join_nonce: 0x00_0102, net_id: 0x00_0013, dev_addr: DEV_ADDR }
    }

    /// Encrypted Join-Accept as the network would transmit it.
    pub fn accept(&self, dl_settings: u8, rx_delay: u8) -> Vec<u8> {
        let mut phy = vec![MHDR::new(MType::JoinAccept).0];
        phy.extend_from_slice(&self.join_nonce.to_le_bytes()[..3]);
        phy.extend_from_slice(&self.net_id.to_le_bytes()[..3]);
        phy.extend_from_slice(&self.dev_addr.0.to_le_bytes());
        phy.push(dl_settings);
        phy.push(rx_delay);
        let mic = calculate_mic(&DefaultFactory, &AES128(APP_KEY), &phy);
        phy.extend_from_slice(&mic.0);

        let cipher = aes::Aes128::new(&APP_KEY.into());
        for chunk in phy[1..].chunks_mut(16) {
            cipher.decrypt_block(aes::Block::from_mut_slice(chunk));
        }
        phy
    }

    pub fn session_keys(&self, dev_nonce: u16) -> ([u8; 16], [u8; 16]) {
        let derive = |key_type| {
            derive_session_key(
                &DefaultFactory,
                &AES128(APP_KEY),
                key_type,
                self.join_nonce,
                self.net_id,
                dev_nonce,
            )
            .0
        };
        (derive(SessionKeyType::Network), derive(SessionKeyType::Application))
    }
}

/// DevNonce carried by a Join-Request.
pub fn dev_nonce(join_request: &[u8]) -> u16 {
    u16::from_le_bytes([join_request[17], join_request[18]])
}

/// Build a signed downlink, for `DEV_ADDR` unless changed.
pub struct DownlinkBuilder {
    pub dev_addr: DevAddr,
    pub mtype: MType,
    pub fctrl: FCtrl,
    pub fcnt: u32,
    pub fopts: Vec<u8>,
    pub fport: Option<u8>,
    pub payload: Vec<u8>,
    pub nwk_skey: [u8; 16],
    pub app_skey: [u8; 16],
}

impl DownlinkBuilder {
    pub fn new(fcnt: u32) -> Self {
        Self {
            dev_addr: DEV_ADDR,
            mtype: MType::UnconfirmedDataDown,
            fctrl: FCtrl::default(),
            fcnt,
            fopts: Vec::new(),
            fport: None,
            payload: Vec::new(),
            nwk_skey: NWK_SKEY,
            app_skey: APP_SKEY,
        }
    }

    pub fn ack(mut self) -> Self {
        self.fctrl.set_ack(true);
        self
    }

    pub fn fopts(mut self, fopts: &[u8]) -> Self {
        self.fopts = fopts.to_vec();
        self
    }

    pub fn data(mut self, fport: u8, payload: &[u8]) -> Self {
        self.fport = Some(fport);
        self.payload = payload.to_vec();
        self
    }

    pub fn build(&self) -> Vec<u8> {
        let mut payload = self.payload.clone();
        let key = if self.fport == Some(0) { self.nwk_skey } else { self.app_skey };
        encrypt_frm_data_payload(
            &DefaultFactory,
            &AES128(key),
            &mut payload,
            Direction::Downlink,
            self.dev_addr,
            self.fcnt,
        );
        let msg = DataMessage {
            mhdr: MHDR::new(self.mtype),
            dev_addr: self.dev_addr,
            fctrl: self.fctrl,
            fcnt: self.fcnt as u16,
            fopts: heapless::Vec::from_slice(&self.fopts).unwrap(),
            fport: self.fport,
            frm_payload: heapless::Vec::from_slice(&payload).unwrap(),
            mic: MIC::default(),
        };
        let mut phy = [0u8; 256];
        let len = msg.serialize_without_mic(&mut phy).unwrap();
        let mic = calculate_data_mic(
            &DefaultFactory,
            &AES128(self.nwk_skey),
            &phy[..len],
            Direction::Downlink,
            self.dev_addr,
            self.fcnt,
        );
        let mut frame = phy[..len].to_vec();
        frame.extend_from_slice(&mic.0);
        frame
    }
}

/// Check the MIC of an uplink and return it with its payload decrypted.
pub fn open_uplink(phy: &[u8], nwk_skey: [u8; 16], app_skey: [u8; 16]) -> DataMessage {
    let mut msg = parse_data_message(phy).unwrap();
    let fcnt = u32::from(msg.fcnt);
    let mic = calculate_data_mic(
        &DefaultFactory,
        &AES128(nwk_skey),
        &phy[..phy.len() - 4],
        Direction::Uplink,
        msg.dev_addr,
        fcnt,
    );
    assert_eq!(mic, msg.mic, "uplink MIC");
    if let Some(fport) = msg.fport {
        let key = if fport == 0 { nwk_skey } else { app_skey };
        encrypt_frm_data_payload(
            &DefaultFactory,
            &AES128(key),
            &mut msg.frm_payload,
            Direction::Uplink,
            msg.dev_addr,
            fcnt,
        );
    }
    msg
}

/// Last frame handed to the radio.
pub fn last_sent(device: &MockDevice) -> Vec<u8> {
    device.radio.sent.last().expect("nothing sent").1.clone()
}
