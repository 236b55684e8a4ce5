//! LoRaWAN 1.0.x end-device MAC.
//!
//! [`Mac`] is a state machine that never blocks. Radio and timer completions are posted as
//! [`Event`]s and consumed by [`Mac::process`], which reacts by driving the radio, arming
//! timers and queueing [`Response`]s for the application.

pub mod adr;
pub mod band;
pub mod class_b;
pub mod event;
pub mod persistence;
pub mod region;
pub mod security;
pub mod types;

use core::marker::PhantomData;

use heapless::{Deque, Vec};

pub use region::Region;

use self::adr::AdrSettings;
use self::band::Bands;
use self::class_b::{parse_beacon, BeaconState, ClassB, Missed, BEACON_INTERVAL_MS, PING_SLOT_WINDOW_MS};
use self::event::{Event, EventQueue};
use self::persistence::Storable;
use self::region::channel_plan::{Channel, ChannelPlan, MAX_CHANNELS};
use self::security::{KeyId, SecurityContext};
use crate::device::non_volatile_store::StorageLayout;
use crate::device::radio::types::{RfConfig, RxQuality, TxConfig};
use crate::device::radio::Radio;
use crate::device::radio_buffer::RadioBuffer;
use crate::device::rng::Rng;
use crate::device::timer::{Timer, TimerId};
use crate::device::Device;
use crate::encoding::default_crypto::DefaultFactory;
use crate::encoding::keys::{CryptoFactory, AES128, MIC};
use crate::encoding::maccommands::{
    build_mac_commands, mac_commands_len, parse_downlink_mac_commands, DownlinkMacCommand,
    UplinkMacCommand,
};
use crate::encoding::parser::{
    parse_data_message, CfList, DataMessage, DevAddr, FCtrl, MType, MAX_FOPTS_SIZE, MHDR,
    MIC_SIZE,
};
use crate::encoding::securityhelpers::Direction;
use types::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[allow(missing_docs)]
pub enum Error {
    NetworkNotJoined,
    /// FCntUp is exhausted, a new join is required.
    SessionExpired,
    /// A join or an uplink is already in progress.
    Busy,
    NoChannelAvailable,
    /// A confirmed uplink got no acknowledgement within the configured transmissions.
    RetriesExhausted,
    Auth(AuthError),
    Parse(crate::encoding::Error),
    InvalidDevAddr,
    PayloadTooLarge,
    /// Application ports are 1 to 223.
    InvalidPort,
    FOptsFull,
    /// The event queue is full.
    QueueFull,
    /// A multicast frame was confirmed or carried MAC commands.
    InvalidMulticast,
    MulticastGroupsFull,
    Region(region::Error),
}

/// Reasons a downlink is dropped by the security checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum AuthError {
    #[allow(missing_docs)]
    InvalidMic,
    /// The frame counter did not advance.
    Replay,
}

impl<D> From<Error> for super::Error<D>
where
    D: Device,
{
    fn from(value: Error) -> Self {
        Self::Mac(value)
    }
}

/// Errors worth a [`Response`]; device errors are handed back to the caller instead.
fn reportable<D: Device>(err: crate::Error<D>) -> Result<Error, crate::Error<D>> {
    match err {
        crate::Error::Mac(e) => Ok(e),
        crate::Error::Region(region::Error::NoChannelAvailable) => Ok(Error::NoChannelAvailable),
        crate::Error::Region(e) => Ok(Error::Region(e)),
        crate::Error::Encoding(e) => Ok(Error::Parse(e)),
        device => Err(device),
    }
}

fn arm<D: Device>(device: &mut D, id: TimerId, delay_ms: u64) -> Result<(), crate::Error<D>> {
    let timer = device.timer();
    let delay = u32::try_from(delay_ms).unwrap_or(u32::MAX).max(timer.min_delay_ms());
    timer.schedule_once(delay, id).map_err(crate::device::Error::Timer)?;
    Ok(())
}

const EVENT_QUEUE_SIZE: usize = 8;
const RESPONSE_QUEUE_SIZE: usize = 8;
const MAX_UPLINK_COMMANDS: usize = 15;
const TX_TIMEOUT_MARGIN_MS: u32 = 1_000;
const RETRY_DELAY_MIN_MS: u32 = 1_000;
const RETRY_DELAY_SPREAD_MS: u32 = 1_000;

/// What a running receive belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
enum Listening {
    Off,
    Rx(Window),
    Beacon,
}

/// The join or uplink currently on its way.
#[derive(Debug, Clone, Copy)]
struct Pending<Ch> {
    frame: Frame,
    confirmed: bool,
    fcnt: u32,
    /// Transmissions made so far.
    attempts: u8,
    /// Rate asked for, before any per-channel override.
    data_rate: DR,
    /// Rate and channel of the last transmission.
    tx_data_rate: DR,
    channel: Option<Ch>,
    airtime_ms: u32,
}

/// State accumulated over a contiguous block of LinkADRReq commands.
struct LinkAdrBlock {
    mask: [bool; MAX_CHANNELS],
    channel_mask_ok: bool,
    count: u8,
}

impl LinkAdrBlock {
    fn new(mask: [bool; MAX_CHANNELS]) -> Self {
        Self { mask, channel_mask_ok: true, count: 0 }
    }
}

/// End-device MAC for region `R` with channel plan `C`.
pub struct Mac<R, C, F = DefaultFactory>
where
    R: Region,
    C: ChannelPlan<R>,
    F: CryptoFactory,
{
    configuration: Configuration,
    credentials: Credentials,
    layout: StorageLayout,
    security: SecurityContext<F>,
    channel_plan: C,
    bands: Bands,
    class_b: ClassB,
    state: State,
    listening: Listening,
    pending: Option<Pending<C::Channel>>,
    events: EventQueue<EVENT_QUEUE_SIZE>,
    responses: Deque<Response, RESPONSE_QUEUE_SIZE>,
    uplink_cmds: Vec<UplinkMacCommand, MAX_UPLINK_COMMANDS>,
    ack_next: bool,
    adr_ack_counter: u32,
    tx_buffer: RadioBuffer<256>,
    region: PhantomData<R>,
}

impl<R, C> Mac<R, C, DefaultFactory>
where
    R: Region,
    C: ChannelPlan<R>,
{
    /// MAC with the software AES implementation.
    pub fn new(configuration: Configuration, credentials: Credentials, layout: StorageLayout) -> Self {
        Self::with_factory(DefaultFactory, configuration, credentials, layout)
    }
}

impl<R, C, F> Mac<R, C, F>
where
    R: Region,
    C: ChannelPlan<R>,
    F: CryptoFactory,
{
    /// MAC using `factory` for every AES operation.
    pub fn with_factory(
        factory: F,
        configuration: Configuration,
        credentials: Credentials,
        layout: StorageLayout,
    ) -> Self {
        let mut bands = Bands::new(R::band_divisors());
        bands.set_aggregated_duty_cycle(configuration.max_duty_cycle);
        Self {
            security: SecurityContext::new(factory, AES128(credentials.app_key)),
            class_b: ClassB::new(configuration.ping_slot_periodicity),
            configuration,
            credentials,
            layout,
            channel_plan: C::default(),
            bands,
            state: State::Idle,
            listening: Listening::Off,
            pending: None,
            events: EventQueue::new(),
            responses: Deque::new(),
            uplink_cmds: Vec::new(),
            ack_next: false,
            adr_ack_counter: 0,
            tx_buffer: RadioBuffer::new(),
            region: PhantomData,
        }
    }

    #[allow(missing_docs)]
    pub fn state(&self) -> State {
        self.state
    }

    #[allow(missing_docs)]
    pub fn is_joined(&self) -> bool {
        self.security.is_joined()
    }

    #[allow(missing_docs)]
    pub fn dev_addr(&self) -> Option<DevAddr> {
        self.security.dev_addr()
    }

    /// Counter the next uplink will carry.
    pub fn fcnt_up(&self) -> u32 {
        self.security.fcnt_up()
    }

    /// Last accepted downlink counter, `u32::MAX` before the first downlink.
    pub fn fcnt_down(&self) -> u32 {
        self.security.fcnt_down()
    }

    #[allow(missing_docs)]
    pub fn configuration(&self) -> &Configuration {
        &self.configuration
    }

    #[allow(missing_docs)]
    pub fn beacon_state(&self) -> BeaconState {
        self.class_b.state()
    }

    /// Install a session provisioned out of band instead of joining.
    pub fn activate_by_personalization(
        &mut self,
        dev_addr: DevAddr,
        nwk_skey: [u8; 16],
        app_skey: [u8; 16],
    ) {
        self.security.activate_by_personalization(dev_addr, AES128(nwk_skey), AES128(app_skey));
        self.adr_ack_counter = 0;
    }

    /// Queue an event for [`Mac::process`]. Safe to call from the driver's completion path.
    pub fn post(&mut self, event: Event) -> Result<(), Error> {
        self.events.push(event).map_err(|_| Error::QueueFull)
    }

    /// Oldest outcome not yet collected by the application.
    pub fn next_response(&mut self) -> Option<Response> {
        self.responses.pop_front()
    }

    /// Handle every queued event.
    ///
    /// Failures of the pending operation are reported through [`Mac::next_response`]; only
    /// device errors are returned, after the pending operation has been abandoned.
    pub fn process<D: Device>(&mut self, device: &mut D) -> Result<(), crate::Error<D>> {
        while let Some(event) = self.events.pop() {
            trace!("{:?} in {:?}", event, self.state);
            if let Err(err) = self.handle_event(device, event) {
                match reportable(err) {
                    Ok(err) => self.abort(device, Some(err)),
                    Err(err) => {
                        self.abort(device, None);
                        return Err(err);
                    }
                }
            }
        }
        Ok(())
    }

    /// Load the session and network settings written by an earlier run.
    ///
    /// Returns whether a session was restored.
    pub fn restore<D: Device>(&mut self, device: &mut D) -> Result<bool, crate::Error<D>> {
        let Some(offset) = self.layout.offset(R::ID) else {
            warn!("no storage offset for {:?}", R::ID);
            return Ok(false);
        };
        let Some(record) = Storable::load(device.non_volatile_store(), offset)
            .map_err(crate::device::Error::NonVolatileStore)?
        else {
            debug!("nothing stored");
            return Ok(false);
        };
        self.security.restore_session(&record.session);
        self.security.set_dev_nonce(record.dev_nonce);
        record.apply_configuration(&mut self.configuration);
        self.bands.set_aggregated_duty_cycle(self.configuration.max_duty_cycle);
        self.channel_plan.restore(&record.channels);
        Ok(self.security.is_joined())
    }

    fn persist<D: Device>(&self, device: &mut D) -> Result<(), crate::Error<D>> {
        let Some(offset) = self.layout.offset(R::ID) else {
            return Ok(());
        };
        let mut record = Storable { dev_nonce: self.security.dev_nonce(), ..Default::default() };
        self.security.write_session(&mut record.session);
        record.set_configuration(&self.configuration);
        self.channel_plan.save(&mut record.channels);
        record
            .save(device.non_volatile_store(), offset)
            .map_err(crate::device::Error::NonVolatileStore)?;
        Ok(())
    }

    /// Start an OTAA join. The outcome is reported as [`Response::JoinAccepted`] or
    /// [`Response::JoinFailed`].
    pub fn join<D: Device>(&mut self, device: &mut D) -> Result<(), crate::Error<D>> {
        if self.pending.is_some() {
            return Err(Error::Busy.into());
        }
        self.stop_listening(device)?;
        self.stop_class_b(device);
        self.security.reset();
        self.uplink_cmds.clear();
        self.ack_next = false;
        self.adr_ack_counter = 0;
        let now = device.timer().now_ms();
        self.bands.start_join(now);

        let data_rate = self.tx_data_rate();
        self.pending = Some(Pending {
            frame: Frame::Join,
            confirmed: false,
            fcnt: 0,
            attempts: 0,
            data_rate,
            tx_data_rate: data_rate,
            channel: None,
            airtime_ms: 0,
        });
        self.state = State::Joining;
        self.start(device)
    }

    /// Send `data` on `fport`. The outcome is reported as [`Response::UplinkDone`] or
    /// [`Response::UplinkFailed`].
    pub fn send<D: Device>(
        &mut self,
        device: &mut D,
        fport: u8,
        data: &[u8],
        confirmed: bool,
    ) -> Result<(), crate::Error<D>> {
        if self.pending.is_some() {
            return Err(Error::Busy.into());
        }
        if !(1..=223).contains(&fport) {
            return Err(Error::InvalidPort.into());
        }
        if !self.security.is_joined() {
            return Err(Error::NetworkNotJoined.into());
        }

        let adr_enabled = self.configuration.adr && device.adaptive_data_rate_enabled();
        let decision = adr::calc_next::<R>(
            adr_enabled,
            self.adr_ack_counter,
            AdrSettings {
                data_rate: self.tx_data_rate(),
                tx_power: self.configuration.tx_power,
                nb_trans: self.configuration.number_of_transmissions,
            },
        );
        let data_rate = decision.settings.data_rate;
        let fopts_len = mac_commands_len(&self.uplink_cmds).min(MAX_FOPTS_SIZE);
        if data.len() + fopts_len > R::max_payload_size(data_rate) {
            return Err(Error::PayloadTooLarge.into());
        }
        self.configuration.tx_data_rate = Some(data_rate);
        self.configuration.tx_power = decision.settings.tx_power;
        self.configuration.number_of_transmissions = decision.settings.nb_trans.max(1);
        if decision.restore_default_channels {
            debug!("ADR back-off restores the default channels");
            self.channel_plan.reactivate_channels();
        }

        self.stop_listening(device)?;
        let fcnt = self.security.next_fcnt_up()?;
        self.build_data_frame(fport, data, confirmed, fcnt, decision.adr_ack_req, adr_enabled)?;
        self.adr_ack_counter = self.adr_ack_counter.saturating_add(1);
        self.ack_next = false;
        self.uplink_cmds.retain(|cmd| cmd.is_sticky());
        self.persist(device)?;

        self.pending = Some(Pending {
            frame: Frame::Data,
            confirmed,
            fcnt,
            attempts: 0,
            data_rate,
            tx_data_rate: data_rate,
            channel: None,
            airtime_ms: 0,
        });
        self.state = State::Transmitting;
        self.start(device)
    }

    /// Receive downlinks sent to the multicast group `dev_addr` with the given session keys.
    ///
    /// Group frames arrive in Class C reception and Class B ping slots; they are reported as
    /// [`Response::Downlink`] with the group address set.
    pub fn add_multicast_group(
        &mut self,
        dev_addr: DevAddr,
        nwk_skey: [u8; 16],
        app_skey: [u8; 16],
    ) -> Result<(), Error> {
        self.security.add_multicast_group(dev_addr, AES128(nwk_skey), AES128(app_skey))
    }

    /// Stop receiving a multicast group. Returns whether the device was a member.
    pub fn remove_multicast_group(&mut self, dev_addr: DevAddr) -> bool {
        self.security.remove_multicast_group(dev_addr)
    }

    /// Ask the network for a LinkCheckAns in the next uplink.
    pub fn request_link_check(&mut self) -> Result<(), Error> {
        self.queue_answer(UplinkMacCommand::LinkCheckReq)
    }

    /// Ask the network for the GPS time in the next uplink.
    pub fn request_device_time(&mut self) -> Result<(), Error> {
        self.queue_answer(UplinkMacCommand::DeviceTimeReq)
    }

    /// Switch device class.
    ///
    /// Class C starts listening on RX2 right away. Class B additionally needs
    /// [`Mac::start_beacon_acquisition`]; the ping slot periodicity is announced in the next
    /// uplink.
    pub fn set_class<D: Device>(&mut self, device: &mut D, class: Class) -> Result<(), crate::Error<D>> {
        if self.configuration.class == class {
            return Ok(());
        }
        info!("class {:?} -> {:?}", self.configuration.class, class);
        if self.configuration.class == Class::B {
            self.stop_class_b(device);
        }
        self.configuration.class = class;
        if class == Class::B {
            self.class_b.set_periodicity(self.configuration.ping_slot_periodicity);
            self.queue_answer(UplinkMacCommand::PingSlotInfoReq {
                periodicity: self.configuration.ping_slot_periodicity,
            })?;
        }
        self.resume_background(device)
    }

    /// Listen for a beacon for up to one beacon period.
    ///
    /// [`Response::BeaconLocked`] follows once a beacon is received, [`Response::BeaconLost`]
    /// if none arrives.
    pub fn start_beacon_acquisition<D: Device>(&mut self, device: &mut D) -> Result<(), crate::Error<D>> {
        if !self.security.is_joined() {
            return Err(Error::NetworkNotJoined.into());
        }
        if self.pending.is_some() {
            return Err(Error::Busy.into());
        }
        self.configuration.class = Class::B;
        self.stop_listening(device)?;
        let timeout = self.class_b.start_acquisition();
        self.open_beacon_window(device, timeout, self.class_b.beacon_time())?;
        arm(device, TimerId::Beacon, u64::from(timeout))
    }

    fn tx_data_rate(&self) -> DR {
        self.configuration.tx_data_rate.unwrap_or(R::default_data_rate())
    }

    fn max_eirp<D: Device>() -> i8 {
        R::max_eirp().min(D::max_eirp())
    }

    fn rx1_delay(&self) -> u32 {
        self.configuration
            .rx_delay
            .map(|delay| u32::from(delay.max(1)) * 1000)
            .unwrap_or(R::default_rx_delay())
    }

    fn queue_answer(&mut self, cmd: UplinkMacCommand) -> Result<(), Error> {
        self.uplink_cmds.push(cmd).map_err(|_| Error::FOptsFull)
    }

    /// Queue an answer produced while handling a downlink; a full queue drops it.
    fn push_answer(&mut self, cmd: UplinkMacCommand) {
        if self.uplink_cmds.push(cmd).is_err() {
            warn!("answer queue full, dropping {:?}", cmd);
        }
    }

    fn respond(&mut self, response: Response) {
        if let Err(response) = self.responses.push_back(response) {
            warn!("response queue full, dropping the oldest");
            self.responses.pop_front();
            let _ = self.responses.push_back(response);
        }
    }

    fn build_data_frame(
        &mut self,
        fport: u8,
        data: &[u8],
        confirmed: bool,
        fcnt: u32,
        adr_ack_req: bool,
        adr: bool,
    ) -> Result<(), Error> {
        let dev_addr = self.security.dev_addr().ok_or(Error::NetworkNotJoined)?;
        let mut fctrl = FCtrl::default();
        fctrl
            .set_adr(adr)
            .set_adr_ack_req(adr_ack_req)
            .set_ack(self.ack_next)
            // the FPending position announces Class B on uplinks
            .set_f_pending(self.class_b.is_tracking());
        let mtype = if confirmed { MType::ConfirmedDataUp } else { MType::UnconfirmedDataUp };
        let mut msg = DataMessage {
            mhdr: MHDR::new(mtype),
            dev_addr,
            fctrl,
            fcnt: fcnt as u16,
            fopts: Vec::new(),
            fport: Some(fport),
            frm_payload: Vec::new(),
            mic: MIC([0; 4]),
        };
        let mut count = self.uplink_cmds.len();
        while mac_commands_len(&self.uplink_cmds[..count]) > MAX_FOPTS_SIZE {
            count -= 1;
        }
        if count < self.uplink_cmds.len() {
            warn!("FOpts full, {} answers dropped", self.uplink_cmds.len() - count);
        }
        let mut fopts = [0u8; MAX_FOPTS_SIZE];
        let len = build_mac_commands(&self.uplink_cmds[..count], &mut fopts).map_err(Error::Parse)?;
        msg.fopts.extend_from_slice(&fopts[..len]).map_err(|_| Error::FOptsFull)?;
        msg.frm_payload.extend_from_slice(data).map_err(|_| Error::PayloadTooLarge)?;
        self.security.encrypt(KeyId::for_port(fport), &mut msg.frm_payload, Direction::Uplink, fcnt)?;

        let raw = self.tx_buffer.as_raw_slice();
        let len = msg.serialize_without_mic(raw).map_err(Error::Parse)?;
        let mic = self.security.uplink_mic(&raw[..len], fcnt)?;
        raw.get_mut(len..len + MIC_SIZE).ok_or(Error::PayloadTooLarge)?.copy_from_slice(&mic.0);
        self.tx_buffer.set_len(len + MIC_SIZE).map_err(|_| Error::PayloadTooLarge)
    }

    /// First transmission of a new join or uplink; nothing stays pending if it fails.
    fn start<D: Device>(&mut self, device: &mut D) -> Result<(), crate::Error<D>> {
        let result = self.transmit(device);
        if result.is_err() {
            self.pending = None;
            self.state = State::Idle;
        }
        result
    }

    /// Put the pending frame on air, or wait in `Backoff` while the duty cycle forbids it.
    fn transmit<D: Device>(&mut self, device: &mut D) -> Result<(), crate::Error<D>> {
        let Some(pending) = self.pending else {
            return Ok(());
        };
        let now = device.timer().now_ms();
        let random = device.rng().next_u32().map_err(crate::device::Error::Rng)?;
        let channel = match self.channel_plan.select_channel(
            random,
            pending.frame,
            pending.data_rate,
            &self.bands,
            now,
        ) {
            Ok(channel) => channel,
            Err(region::Error::DutyCycleRestricted { wait_ms }) => {
                debug!("duty cycle, next transmission in {} ms", wait_ms);
                self.state = State::Backoff;
                return arm(device, TimerId::Backoff, wait_ms);
            }
            Err(e) => return Err(e.into()),
        };

        if pending.frame == Frame::Join {
            let request =
                self.security.join_request(self.credentials.app_eui, self.credentials.dev_eui);
            // a DevNonce must never be reused, store it before it goes on air
            self.persist(device)?;
            let len = request.serialize(self.tx_buffer.as_raw_slice())?;
            self.tx_buffer.set_len(len).map_err(crate::device::Error::RadioBuffer)?;
        }

        let data_rate =
            R::override_ul_data_rate_if_necessary(pending.data_rate, pending.frame, channel.ul_frequency());
        let rf = RfConfig {
            frequency: channel.ul_frequency(),
            coding_rate: R::default_coding_rate(),
            data_rate: R::convert_data_rate(data_rate)?,
        };
        let pw = match pending.frame {
            Frame::Join => Self::max_eirp::<D>(),
            Frame::Data => self.configuration.tx_power.unwrap_or(Self::max_eirp::<D>()),
        };
        let airtime_ms = rf.time_on_air_ms(self.tx_buffer.len());
        trace!("tx {:?} at {} dBm, {} ms on air", rf, pw, airtime_ms);
        device
            .radio()
            .send(TxConfig { pw, rf }, self.tx_buffer.as_ref(), airtime_ms + TX_TIMEOUT_MARGIN_MS)
            .map_err(crate::device::Error::Radio)?;

        self.listening = Listening::Off;
        self.pending = Some(Pending {
            attempts: pending.attempts.saturating_add(1),
            tx_data_rate: data_rate,
            channel: Some(channel),
            airtime_ms,
            ..pending
        });
        self.state = match pending.frame {
            Frame::Join => State::Joining,
            Frame::Data => State::Transmitting,
        };
        Ok(())
    }

    fn handle_event<D: Device>(&mut self, device: &mut D, event: Event) -> Result<(), crate::Error<D>> {
        match event {
            Event::TxDone => self.on_tx_done(device),
            Event::TxTimeout => {
                if !matches!(self.state, State::Joining | State::Transmitting) {
                    return Ok(());
                }
                warn!("transmission timed out");
                device.radio().sleep().map_err(crate::device::Error::Radio)?;
                self.cycle_ended(device, None)
            }
            Event::RxDone { mut payload, quality } => self.on_rx_done(device, &mut payload, quality),
            Event::RxTimeout | Event::RxError => {
                match core::mem::replace(&mut self.listening, Listening::Off) {
                    Listening::Off => Ok(()),
                    Listening::Beacon => self.on_beacon_timeout(device),
                    Listening::Rx(window) => self.window_closed(device, window),
                }
            }
            Event::TimerFired(id) => self.on_timer(device, id),
        }
    }

    fn on_timer<D: Device>(&mut self, device: &mut D, id: TimerId) -> Result<(), crate::Error<D>> {
        match id {
            TimerId::Rx1 => {
                if self.state == State::WaitingRx1 {
                    self.open_window(device, Window::_1)?;
                }
                Ok(())
            }
            TimerId::Rx2 => {
                if matches!(self.state, State::WaitingRx1 | State::WaitingRx2) {
                    self.state = State::WaitingRx2;
                    self.open_window(device, Window::_2)?;
                }
                Ok(())
            }
            TimerId::Backoff => {
                if self.state == State::Backoff {
                    self.transmit(device)?;
                }
                Ok(())
            }
            TimerId::Beacon => self.on_beacon_timer(device),
            TimerId::PingSlot => self.on_ping_slot_timer(device),
        }
    }

    fn on_tx_done<D: Device>(&mut self, device: &mut D) -> Result<(), crate::Error<D>> {
        if !matches!(self.state, State::Joining | State::Transmitting) {
            return Ok(());
        }
        let Some(pending) = self.pending else {
            return Ok(());
        };
        let now = device.timer().now_ms();
        if let Some(channel) = pending.channel {
            self.bands.record_transmission(channel.band(), pending.airtime_ms, now);
        }
        let (rx1, rx2) = match pending.frame {
            Frame::Join => (R::default_join_accept_delay1(), R::default_join_accept_delay2()),
            Frame::Data => {
                let delay = self.rx1_delay();
                (delay, delay + 1000)
            }
        };
        let lead = self.configuration.rx_window_lead_ms;
        arm(device, TimerId::Rx1, u64::from(rx1.saturating_sub(lead)))?;
        arm(device, TimerId::Rx2, u64::from(rx2.saturating_sub(lead)))?;
        self.state = State::WaitingRx1;
        if self.configuration.class == Class::C && pending.frame == Frame::Data {
            self.open_window(device, Window::Continuous)?;
        }
        Ok(())
    }

    fn rx_config(&self, window: Window) -> Result<RfConfig, region::Error> {
        let frame = self.pending.map(|p| p.frame).unwrap_or(Frame::Data);
        let (frequency, data_rate) = match window {
            Window::_1 => {
                let (channel, ul_dr) = self
                    .pending
                    .and_then(|p| p.channel.map(|c| (c, p.tx_data_rate)))
                    .ok_or(region::Error::NoChannelAvailable)?;
                let offset = match frame {
                    Frame::Join => R::default_rx1_data_rate_offset(),
                    Frame::Data => self
                        .configuration
                        .rx1_data_rate_offset
                        .unwrap_or(R::default_rx1_data_rate_offset()),
                };
                (channel.dl_frequency(), R::get_rx1_dr(ul_dr, offset)?)
            }
            Window::_2 | Window::Continuous => match frame {
                Frame::Join => (R::default_rx2_frequency(), R::default_rx2_data_rate()),
                Frame::Data => (
                    self.configuration.rx2_frequency.unwrap_or(R::default_rx2_frequency()),
                    self.configuration.rx2_data_rate.unwrap_or(R::default_rx2_data_rate()),
                ),
            },
            Window::PingSlot => {
                let (frequency, data_rate) = self.class_b.ping_slot_channel();
                let dev_addr = self.security.dev_addr().unwrap_or_default();
                (
                    frequency.unwrap_or_else(|| {
                        R::ping_slot_frequency(dev_addr, self.class_b.beacon_time())
                    }),
                    data_rate.unwrap_or(R::ping_slot_data_rate()),
                )
            }
        };
        Ok(RfConfig {
            frequency,
            coding_rate: R::default_coding_rate(),
            data_rate: R::convert_data_rate(data_rate)?,
        })
    }

    fn open_window<D: Device>(&mut self, device: &mut D, window: Window) -> Result<(), crate::Error<D>> {
        let rf = self.rx_config(window)?;
        let timeout = match window {
            Window::Continuous => 0,
            _ => self.configuration.rx_window_ms,
        };
        trace!("rx {:?} {:?}", window, rf);
        let radio = device.radio();
        radio.set_rx_config(rf).map_err(crate::device::Error::Radio)?;
        radio.receive(timeout).map_err(crate::device::Error::Radio)?;
        self.listening = Listening::Rx(window);
        Ok(())
    }

    fn stop_listening<D: Device>(&mut self, device: &mut D) -> Result<(), crate::Error<D>> {
        match core::mem::replace(&mut self.listening, Listening::Off) {
            Listening::Off => Ok(()),
            Listening::Rx(_) => {
                device.radio().sleep().map_err(crate::device::Error::Radio)?;
                Ok(())
            }
            Listening::Beacon => {
                device.radio().sleep().map_err(crate::device::Error::Radio)?;
                self.on_beacon_timeout(device)
            }
        }
    }

    /// Background reception once no join or uplink cycle needs the radio.
    fn resume_background<D: Device>(&mut self, device: &mut D) -> Result<(), crate::Error<D>> {
        if !matches!(self.state, State::Idle | State::Backoff) {
            return Ok(());
        }
        match self.configuration.class {
            Class::C if self.security.is_joined() => self.open_window(device, Window::Continuous),
            Class::B if self.class_b.is_tracking() => self.schedule_ping_slot(device, 0),
            _ => {
                if matches!(self.listening, Listening::Rx(_)) {
                    self.stop_listening(device)?;
                }
                Ok(())
            }
        }
    }

    /// A receive window ended without an acceptable frame.
    fn window_closed<D: Device>(&mut self, device: &mut D, window: Window) -> Result<(), crate::Error<D>> {
        self.listening = Listening::Off;
        match window {
            Window::_1 => {
                if self.state == State::WaitingRx1 {
                    self.state = State::WaitingRx2;
                }
                if self.configuration.class == Class::C {
                    self.open_window(device, Window::Continuous)
                } else {
                    device.radio().sleep().map_err(crate::device::Error::Radio)?;
                    Ok(())
                }
            }
            Window::_2 => {
                device.radio().sleep().map_err(crate::device::Error::Radio)?;
                self.cycle_ended(device, None)
            }
            Window::Continuous => self.open_window(device, Window::Continuous),
            Window::PingSlot => {
                device.radio().sleep().map_err(crate::device::Error::Radio)?;
                self.schedule_ping_slot(device, 0)
            }
        }
    }

    /// The receive windows of the pending frame are over. `acked` is `None` if nothing valid
    /// was received, otherwise the ACK bit of the downlink.
    fn cycle_ended<D: Device>(&mut self, device: &mut D, acked: Option<bool>) -> Result<(), crate::Error<D>> {
        let Some(pending) = self.pending else {
            self.state = State::Idle;
            return self.resume_background(device);
        };
        match pending.frame {
            Frame::Join if pending.attempts < self.configuration.max_join_attempts => self.retry(device),
            Frame::Join => {
                warn!("join failed after {} attempts", pending.attempts);
                self.pending = None;
                self.state = State::Idle;
                self.respond(Response::JoinFailed);
                Ok(())
            }
            Frame::Data if pending.confirmed => match acked {
                Some(true) => self.finish_uplink(device, true),
                _ if pending.attempts < self.configuration.max_retries => self.retry(device),
                _ => {
                    warn!("no ACK for fcnt {} after {} transmissions", pending.fcnt, pending.attempts);
                    self.fail_uplink(device, Error::RetriesExhausted)
                }
            },
            Frame::Data => {
                if acked.is_none() && pending.attempts < self.configuration.number_of_transmissions {
                    self.retry(device)
                } else {
                    self.finish_uplink(device, false)
                }
            }
        }
    }

    fn retry<D: Device>(&mut self, device: &mut D) -> Result<(), crate::Error<D>> {
        let random = device.rng().next_u32().map_err(crate::device::Error::Rng)?;
        let delay = RETRY_DELAY_MIN_MS + random % (RETRY_DELAY_SPREAD_MS + 1);
        debug!("retransmission in {} ms", delay);
        self.state = State::Backoff;
        arm(device, TimerId::Backoff, u64::from(delay))?;
        self.resume_background(device)
    }

    fn finish_uplink<D: Device>(&mut self, device: &mut D, acked: bool) -> Result<(), crate::Error<D>> {
        if let Some(pending) = self.pending.take() {
            self.respond(Response::UplinkDone { fcnt: pending.fcnt, acked });
        }
        self.state = State::Idle;
        self.resume_background(device)
    }

    fn fail_uplink<D: Device>(&mut self, device: &mut D, err: Error) -> Result<(), crate::Error<D>> {
        self.pending = None;
        self.state = State::Idle;
        self.respond(Response::UplinkFailed(err));
        self.resume_background(device)
    }

    /// Give up the pending operation after an error in event handling.
    fn abort<D: Device>(&mut self, device: &mut D, err: Option<Error>) {
        warn!("aborting in {:?}: {:?}", self.state, err);
        match (self.pending.take(), err) {
            (Some(Pending { frame: Frame::Join, .. }), Some(_)) => self.respond(Response::JoinFailed),
            (Some(_), Some(err)) => self.respond(Response::UplinkFailed(err)),
            _ => {}
        }
        let timer = device.timer();
        timer.cancel(TimerId::Rx1);
        timer.cancel(TimerId::Rx2);
        timer.cancel(TimerId::Backoff);
        self.state = State::Idle;
    }

    fn on_rx_done<D: Device>(
        &mut self,
        device: &mut D,
        payload: &mut [u8],
        quality: RxQuality,
    ) -> Result<(), crate::Error<D>> {
        let window = match core::mem::replace(&mut self.listening, Listening::Off) {
            Listening::Off => {
                debug!("frame outside of a receive window dropped");
                return Ok(());
            }
            Listening::Beacon => return self.on_beacon_frame(device, payload),
            Listening::Rx(window) => window,
        };
        let in_cycle = matches!(self.state, State::WaitingRx1 | State::WaitingRx2);
        match self.pending.map(|p| p.frame) {
            Some(Frame::Join) if in_cycle => self.on_join_accept(device, payload, window),
            Some(Frame::Data) if in_cycle => self.on_cycle_downlink(device, payload, quality, window),
            _ => {
                match self.open_downlink(payload) {
                    Ok((msg, multicast)) => {
                        self.accept_downlink(device, msg, multicast, quality, window)?
                    }
                    Err(Error::Auth(e)) => {
                        warn!("downlink failed authentication: {:?}", e);
                        self.respond(Response::AuthFailed(e));
                    }
                    Err(e) => debug!("frame dropped: {:?}", e),
                }
                self.window_closed(device, window)
            }
        }
    }

    fn end_windows<D: Device>(&mut self, device: &mut D) -> Result<(), crate::Error<D>> {
        let timer = device.timer();
        timer.cancel(TimerId::Rx1);
        timer.cancel(TimerId::Rx2);
        device.radio().sleep().map_err(crate::device::Error::Radio)?;
        Ok(())
    }

    fn on_join_accept<D: Device>(
        &mut self,
        device: &mut D,
        payload: &mut [u8],
        window: Window,
    ) -> Result<(), crate::Error<D>> {
        if payload.first().map(|b| MHDR(*b).mtype()) != Some(MType::JoinAccept) {
            debug!("not a Join-Accept");
            return self.window_closed(device, window);
        }
        let accept = match self.security.accept_join(payload) {
            Ok(accept) => accept,
            Err(e) => {
                warn!("Join-Accept rejected: {:?}", e);
                return self.window_closed(device, window);
            }
        };
        self.end_windows(device)?;

        self.configuration.rx1_data_rate_offset = Some(accept.dl_settings.rx1_dr_offset());
        self.configuration.rx2_data_rate = DR::try_from(accept.dl_settings.rx2_data_rate()).ok();
        self.configuration.rx_delay = Some((accept.rx_delay & 0x0f).max(1));
        if let Some(raw) = accept.cf_list {
            match CfList::decode(&raw) {
                Ok(cf_list) => {
                    if let Err(e) = self.channel_plan.handle_cf_list(cf_list) {
                        warn!("CFList ignored: {:?}", e);
                    }
                }
                Err(e) => warn!("CFList ignored: {:?}", e),
            }
        }
        self.bands.end_join();
        self.pending = None;
        self.state = State::Idle;
        self.adr_ack_counter = 0;
        if self.configuration.class == Class::B {
            self.push_answer(UplinkMacCommand::PingSlotInfoReq {
                periodicity: self.configuration.ping_slot_periodicity,
            });
        }
        self.persist(device)?;
        info!("joined as {:?}", accept.dev_addr);
        self.respond(Response::JoinAccepted);
        self.resume_background(device)
    }

    fn open_downlink(&mut self, phy: &[u8]) -> Result<(DataMessage, Option<DevAddr>), Error> {
        let mut msg = parse_data_message(phy).map_err(Error::Parse)?;
        let mtype = msg.mhdr.mtype();
        if !mtype.is_data() || mtype.is_uplink() {
            return Err(Error::Parse(crate::encoding::Error::UnsupportedMessageType));
        }
        let opened = self.security.open_downlink(phy, &mut msg)?;
        Ok((msg, opened.multicast))
    }

    fn on_cycle_downlink<D: Device>(
        &mut self,
        device: &mut D,
        payload: &[u8],
        quality: RxQuality,
        window: Window,
    ) -> Result<(), crate::Error<D>> {
        match self.open_downlink(payload) {
            Ok((msg, Some(group))) => {
                // group traffic is not an answer to the pending uplink
                self.accept_downlink(device, msg, Some(group), quality, window)?;
                self.window_closed(device, window)
            }
            Ok((msg, None)) => {
                self.end_windows(device)?;
                self.state = State::ProcessingDownlink;
                let acked = msg.fctrl.ack();
                self.accept_downlink(device, msg, None, quality, window)?;
                self.cycle_ended(device, Some(acked))
            }
            Err(Error::Auth(e)) => {
                warn!("downlink failed authentication: {:?}", e);
                self.end_windows(device)?;
                self.respond(Response::AuthFailed(e));
                self.finish_uplink(device, false)
            }
            Err(e) => {
                debug!("frame dropped: {:?}", e);
                self.window_closed(device, window)
            }
        }
    }

    /// Act on an authenticated downlink.
    fn accept_downlink<D: Device>(
        &mut self,
        device: &mut D,
        msg: DataMessage,
        multicast: Option<DevAddr>,
        quality: RxQuality,
        window: Window,
    ) -> Result<(), crate::Error<D>> {
        self.adr_ack_counter = 0;
        if multicast.is_some() {
            if let Some(fport) = msg.fport {
                self.respond(Response::Downlink(Downlink {
                    fport,
                    data: msg.frm_payload,
                    quality,
                    window,
                    pending: msg.fctrl.f_pending(),
                    multicast,
                }));
            }
            return Ok(());
        }
        // any downlink acknowledges the sticky answers
        self.uplink_cmds.clear();
        self.ack_next = msg.mhdr.mtype().is_confirmed();
        match msg.fport {
            Some(0) if !msg.fopts.is_empty() => {
                warn!("MAC commands in both FOpts and FRMPayload, ignored");
            }
            Some(0) => self.handle_downlink_macs(device, &msg.frm_payload, quality)?,
            Some(fport) => {
                self.handle_downlink_macs(device, &msg.fopts, quality)?;
                self.respond(Response::Downlink(Downlink {
                    fport,
                    data: msg.frm_payload,
                    quality,
                    window,
                    pending: msg.fctrl.f_pending(),
                    multicast: None,
                }));
            }
            None => self.handle_downlink_macs(device, &msg.fopts, quality)?,
        }
        self.persist(device)
    }

    fn handle_downlink_macs<D: Device>(
        &mut self,
        device: &mut D,
        cmds: &[u8],
        quality: RxQuality,
    ) -> Result<(), crate::Error<D>> {
        let mut adr_block = LinkAdrBlock::new(self.channel_plan.channel_mask());
        let mut cmd_iter = parse_downlink_mac_commands(cmds).peekable();
        while let Some(cmd) = cmd_iter.next() {
            let cmd = match cmd {
                Ok(cmd) => cmd,
                Err(e) => {
                    warn!("rest of the MAC commands skipped: {:?}", e);
                    break;
                }
            };
            trace!("handling command {:?}", cmd);
            let answer = match cmd {
                DownlinkMacCommand::LinkCheckAns { margin, gateway_count } => {
                    device.handle_link_check(gateway_count, margin);
                    self.respond(Response::LinkCheck { margin, gateway_count });
                    None
                }
                DownlinkMacCommand::DeviceTimeAns { seconds, fractional } => {
                    device.handle_device_time(seconds, fractional);
                    self.respond(Response::DeviceTime { seconds, fractional });
                    None
                }
                DownlinkMacCommand::LinkADRReq {
                    data_rate,
                    tx_power,
                    channel_mask,
                    ch_mask_cntl,
                    nb_trans,
                } => {
                    adr_block.count += 1;
                    adr_block.channel_mask_ok &= self
                        .channel_plan
                        .handle_channel_mask(&mut adr_block.mask, channel_mask, ch_mask_cntl)
                        .is_ok();
                    // a block of contiguous LinkADRReq is applied as a whole by its last command
                    if matches!(cmd_iter.peek(), Some(Ok(DownlinkMacCommand::LinkADRReq { .. }))) {
                        continue;
                    }
                    let ans = self.apply_link_adr::<D>(&adr_block, data_rate, tx_power, nb_trans);
                    for _ in 1..adr_block.count {
                        self.push_answer(ans);
                    }
                    adr_block = LinkAdrBlock::new(self.channel_plan.channel_mask());
                    Some(ans)
                }
                DownlinkMacCommand::DutyCycleReq { max_duty_cycle } => {
                    self.configuration.max_duty_cycle = max_duty_cycle;
                    self.bands.set_aggregated_duty_cycle(max_duty_cycle);
                    Some(UplinkMacCommand::DutyCycleAns)
                }
                DownlinkMacCommand::RXParamSetupReq { dl_settings, frequency } => {
                    let rx1_dr_offset_ack =
                        R::get_rx1_dr(self.tx_data_rate(), dl_settings.rx1_dr_offset()).is_ok();
                    let rx2_data_rate = DR::try_from(dl_settings.rx2_data_rate())
                        .ok()
                        .filter(|dr| R::convert_data_rate(*dr).is_ok());
                    let channel_ack =
                        self.channel_plan.validate_frequency(frequency.value()).is_ok();
                    if let (true, true, Some(dr)) = (rx1_dr_offset_ack, channel_ack, rx2_data_rate) {
                        self.configuration.rx1_data_rate_offset = Some(dl_settings.rx1_dr_offset());
                        self.configuration.rx2_data_rate = Some(dr);
                        self.configuration.rx2_frequency = Some(frequency.value());
                    }
                    Some(UplinkMacCommand::RXParamSetupAns {
                        rx1_dr_offset_ack,
                        rx2_data_rate_ack: rx2_data_rate.is_some(),
                        channel_ack,
                    })
                }
                DownlinkMacCommand::DevStatusReq => {
                    let battery = match device.battery_level() {
                        Some(level) => (level.clamp(0.0, 1.0) * 253.0) as u8 + 1,
                        None => 255,
                    };
                    Some(UplinkMacCommand::DevStatusAns { battery, margin: quality.snr() })
                }
                DownlinkMacCommand::NewChannelReq { channel_index, frequency, data_rate_range } => {
                    let frequency = frequency.value();
                    let freq_ok =
                        frequency == 0 || self.channel_plan.validate_frequency(frequency).is_ok();
                    let dr_ok = data_rate_range.min_data_rate() <= data_rate_range.max_data_rate()
                        && DR::try_from(data_rate_range.max_data_rate())
                            .map(|dr| dr.in_range(R::ul_data_rate_range()))
                            .unwrap_or(false);
                    match self.channel_plan.handle_new_channel_req(
                        channel_index,
                        frequency,
                        data_rate_range,
                    ) {
                        Ok(()) => Some(UplinkMacCommand::NewChannelAns {
                            data_rate_range_ack: true,
                            channel_freq_ack: true,
                        }),
                        Err(region::Error::CommandNotImplementedForRegion) => None,
                        Err(region::Error::InvalidChannelIndex) => Some(UplinkMacCommand::NewChannelAns {
                            data_rate_range_ack: false,
                            channel_freq_ack: false,
                        }),
                        Err(region::Error::DataRateNotSupported(_)) => {
                            Some(UplinkMacCommand::NewChannelAns {
                                data_rate_range_ack: false,
                                channel_freq_ack: freq_ok,
                            })
                        }
                        Err(_) => Some(UplinkMacCommand::NewChannelAns {
                            data_rate_range_ack: dr_ok,
                            channel_freq_ack: false,
                        }),
                    }
                }
                DownlinkMacCommand::RXTimingSetupReq { delay } => {
                    self.configuration.rx_delay = Some(delay.max(1));
                    Some(UplinkMacCommand::RXTimingSetupAns)
                }
                DownlinkMacCommand::TXParamSetupReq { .. } => {
                    R::supports_tx_param_setup().then_some(UplinkMacCommand::TXParamSetupAns)
                }
                DownlinkMacCommand::DlChannelReq { channel_index, frequency } => {
                    let uplink_freq_exists =
                        self.channel_plan.check_uplink_frequency_exists(channel_index as usize);
                    let frequency = frequency.value();
                    match self.channel_plan.handle_dl_channel_req(channel_index, frequency) {
                        Ok(()) => Some(UplinkMacCommand::DlChannelAns {
                            channel_freq_ack: true,
                            uplink_freq_exists,
                        }),
                        Err(region::Error::CommandNotImplementedForRegion) => None,
                        Err(region::Error::InvalidChannelIndex) => Some(UplinkMacCommand::DlChannelAns {
                            channel_freq_ack: self.channel_plan.validate_frequency(frequency).is_ok(),
                            uplink_freq_exists: false,
                        }),
                        Err(_) => Some(UplinkMacCommand::DlChannelAns {
                            channel_freq_ack: false,
                            uplink_freq_exists,
                        }),
                    }
                }
                DownlinkMacCommand::PingSlotInfoAns => {
                    debug!("ping slot periodicity confirmed");
                    None
                }
                DownlinkMacCommand::PingSlotChannelReq { frequency, data_rate } => {
                    let frequency = frequency.value();
                    let channel_freq_ack =
                        frequency == 0 || self.channel_plan.validate_frequency(frequency).is_ok();
                    let data_rate =
                        DR::try_from(data_rate).ok().filter(|dr| R::convert_data_rate(*dr).is_ok());
                    if let (true, Some(dr)) = (channel_freq_ack, data_rate) {
                        self.class_b.set_ping_slot_channel((frequency != 0).then_some(frequency), dr);
                    }
                    Some(UplinkMacCommand::PingSlotChannelAns {
                        data_rate_ack: data_rate.is_some(),
                        channel_freq_ack,
                    })
                }
                DownlinkMacCommand::BeaconFreqReq { frequency } => {
                    let frequency = frequency.value();
                    let beacon_freq_ack =
                        frequency == 0 || self.channel_plan.validate_frequency(frequency).is_ok();
                    if beacon_freq_ack {
                        self.class_b.set_beacon_frequency((frequency != 0).then_some(frequency));
                    }
                    Some(UplinkMacCommand::BeaconFreqAns { beacon_freq_ack })
                }
            };
            if let Some(answer) = answer {
                trace!("answer {:?}", answer);
                self.push_answer(answer);
            }
        }
        Ok(())
    }

    /// Accept or reject a LinkADRReq block as a whole.
    fn apply_link_adr<D: Device>(
        &mut self,
        block: &LinkAdrBlock,
        data_rate: u8,
        tx_power: u8,
        nb_trans: u8,
    ) -> UplinkMacCommand {
        let data_rate = match data_rate {
            0x0f => Some(self.tx_data_rate()),
            dr => DR::try_from(dr)
                .ok()
                .filter(|dr| dr.in_range(R::ul_data_rate_range()) && R::convert_data_rate(*dr).is_ok()),
        };
        let power = R::modify_dbm(tx_power, self.configuration.tx_power, Self::max_eirp::<D>());
        let mut channel_mask_ack = block.channel_mask_ok;
        if let (true, Some(dr), Ok(power)) = (channel_mask_ack, data_rate, power) {
            if self.channel_plan.set_channel_mask(block.mask).is_ok() {
                self.configuration.tx_data_rate = Some(dr);
                self.configuration.tx_power = power;
                self.configuration.number_of_transmissions = nb_trans.max(1);
            } else {
                channel_mask_ack = false;
            }
        }
        UplinkMacCommand::LinkADRAns {
            power_ack: power.is_ok(),
            data_rate_ack: data_rate.is_some(),
            channel_mask_ack,
        }
    }

    fn stop_class_b<D: Device>(&mut self, device: &mut D) {
        self.class_b.stop();
        let timer = device.timer();
        timer.cancel(TimerId::Beacon);
        timer.cancel(TimerId::PingSlot);
    }

    fn open_beacon_window<D: Device>(
        &mut self,
        device: &mut D,
        timeout_ms: u32,
        beacon_time: u32,
    ) -> Result<(), crate::Error<D>> {
        let rf = RfConfig {
            frequency: self
                .class_b
                .beacon_frequency()
                .unwrap_or_else(|| R::beacon_frequency(beacon_time)),
            coding_rate: R::default_coding_rate(),
            data_rate: R::convert_data_rate(R::beacon_data_rate())?,
        };
        let radio = device.radio();
        radio.set_rx_config(rf).map_err(crate::device::Error::Radio)?;
        radio.receive(timeout_ms).map_err(crate::device::Error::Radio)?;
        self.listening = Listening::Beacon;
        Ok(())
    }

    fn update_ping_offset(&mut self) {
        if let Some(offset) =
            self.security.ping_offset(self.class_b.beacon_time(), self.class_b.ping_period())
        {
            self.class_b.set_ping_offset(offset);
        }
    }

    /// Arm the ping slot timer for the next slot at least `skip_ms` from now.
    fn schedule_ping_slot<D: Device>(&mut self, device: &mut D, skip_ms: u64) -> Result<(), crate::Error<D>> {
        let now = device.timer().now_ms();
        match self.class_b.next_ping_slot_delay(now + skip_ms) {
            Some(delay) => {
                let lead = u64::from(self.configuration.rx_window_lead_ms);
                arm(device, TimerId::PingSlot, (delay + skip_ms).saturating_sub(lead))
            }
            None => Ok(()),
        }
    }

    fn on_beacon_timer<D: Device>(&mut self, device: &mut D) -> Result<(), crate::Error<D>> {
        match self.class_b.state() {
            BeaconState::Off => Ok(()),
            BeaconState::Acquisition => {
                if self.listening == Listening::Beacon {
                    self.listening = Listening::Off;
                    device.radio().sleep().map_err(crate::device::Error::Radio)?;
                }
                self.on_beacon_timeout(device)
            }
            BeaconState::Locked | BeaconState::Reacquisition => {
                // keeps the beacon timing alive if this window never completes
                arm(device, TimerId::Beacon, BEACON_INTERVAL_MS)?;
                let upcoming = self.class_b.beacon_time().wrapping_add((BEACON_INTERVAL_MS / 1000) as u32);
                if self.pending.is_none() && !matches!(self.listening, Listening::Rx(Window::PingSlot)) {
                    self.stop_listening(device)?;
                    let timeout = self.configuration.rx_window_ms + 2 * self.configuration.rx_window_lead_ms;
                    self.open_beacon_window(device, timeout, upcoming)
                } else {
                    debug!("radio busy, beacon skipped");
                    self.on_beacon_timeout(device)
                }
            }
        }
    }

    fn on_beacon_timeout<D: Device>(&mut self, device: &mut D) -> Result<(), crate::Error<D>> {
        let now = device.timer().now_ms();
        match self.class_b.on_beacon_missed(now) {
            Missed::Lost => {
                warn!("beacon lost, back to class A");
                self.stop_class_b(device);
                self.configuration.class = Class::A;
                self.respond(Response::BeaconLost);
                Ok(())
            }
            Missed::Tracking => {
                debug!("beacon missed, keeping the last timing");
                self.update_ping_offset();
                self.schedule_ping_slot(device, 0)
            }
        }
    }

    fn on_beacon_frame<D: Device>(&mut self, device: &mut D, payload: &[u8]) -> Result<(), crate::Error<D>> {
        let Some(beacon) = parse_beacon(payload, R::beacon_layout()) else {
            debug!("invalid beacon");
            if self.class_b.state() == BeaconState::Acquisition {
                // keep searching until the acquisition timer gives up
                return self.open_beacon_window(device, BEACON_INTERVAL_MS as u32, self.class_b.beacon_time());
            }
            return self.on_beacon_timeout(device);
        };
        let now = device.timer().now_ms();
        let airtime = RfConfig {
            frequency: 0,
            coding_rate: R::default_coding_rate(),
            data_rate: R::convert_data_rate(R::beacon_data_rate())?,
        }
        .time_on_air_ms(payload.len());
        let was_locked = self.class_b.state() == BeaconState::Locked;
        let time = self.class_b.on_beacon(&beacon, now.saturating_sub(u64::from(airtime)));
        self.update_ping_offset();
        device.radio().sleep().map_err(crate::device::Error::Radio)?;

        let lead = u64::from(self.configuration.rx_window_lead_ms);
        let next = self.class_b.next_beacon_ms(now);
        arm(device, TimerId::Beacon, (next - now).saturating_sub(lead))?;
        if !was_locked {
            info!("beacon locked, GPS time {}", time);
            self.respond(Response::BeaconLocked { time });
        }
        self.schedule_ping_slot(device, 0)
    }

    fn on_ping_slot_timer<D: Device>(&mut self, device: &mut D) -> Result<(), crate::Error<D>> {
        if !self.class_b.is_tracking() {
            return Ok(());
        }
        if self.pending.is_some() || self.listening != Listening::Off {
            let skip = u64::from(self.configuration.rx_window_lead_ms) + PING_SLOT_WINDOW_MS;
            return self.schedule_ping_slot(device, skip);
        }
        self.open_window(device, Window::PingSlot)
    }
}
