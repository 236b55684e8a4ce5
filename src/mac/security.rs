//! Session keys and frame counters.
//!
//! [`SecurityContext`] is the only holder of key material. Callers name a key by [`KeyId`] and
//! never see its bytes.

use crate::encoding::creator::JoinRequest;
use crate::encoding::keys::{CryptoFactory, AES128, MIC};
use crate::encoding::parser::{parse_join_accept, DataMessage, DevAddr, JoinAcceptMessage, MIC_SIZE};
use heapless::Vec;
use crate::encoding::securityhelpers::{
    calculate_data_mic, calculate_mic, decrypt_join_accept, derive_session_key,
    encrypt_frm_data_payload, ping_offset, Direction, SessionKeyType,
};

use super::{AuthError, Error};

/// Downlink counter value meaning no downlink was accepted in this session yet.
pub const FCNT_DOWN_NONE: u32 = u32::MAX;

/// Multicast groups the device can be a member of at the same time.
pub const MAX_MULTICAST_GROUPS: usize = 4;

/// Serialized size of the session state written by [`SecurityContext::write_session`].
pub const SESSION_SIZE: usize = 1 + 4 + 16 + 16 + 4 + 4 + 2;

/// Key selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum KeyId {
    /// Root key, used for join procedures.
    App,
    /// Network session key, MIC of data frames and port 0 payloads.
    NwkS,
    /// Application session key, payloads on ports 1 to 223.
    AppS,
}

impl KeyId {
    /// Key protecting the FRMPayload sent on `fport`.
    pub fn for_port(fport: u8) -> KeyId {
        if fport == 0 {
            KeyId::NwkS
        } else {
            KeyId::AppS
        }
    }
}

#[derive(Clone)]
struct Session {
    nwk_skey: AES128,
    app_skey: AES128,
    dev_addr: DevAddr,
}

struct MulticastGroup {
    dev_addr: DevAddr,
    nwk_skey: AES128,
    app_skey: AES128,
    fcnt_down: u32,
}

/// An authenticated downlink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Opened {
    /// Full downlink counter.
    pub fcnt: u32,
    /// Group address for a multicast frame, `None` for one sent to this device.
    pub multicast: Option<DevAddr>,
}

fn reconstruct_fcnt(last: u32, wire: u16) -> u32 {
    if last == FCNT_DOWN_NONE {
        return u32::from(wire);
    }
    let diff = i32::from(wire) - (last & 0xffff) as i32;
    match diff {
        d if d > 0 => last.wrapping_add(d as u32),
        0 => last,
        _ => (last & 0xffff_0000).wrapping_add(0x1_0000).wrapping_add(u32::from(wire)),
    }
}

fn advance_fcnt(last: &mut u32, candidate: u32) -> Result<(), AuthError> {
    if *last != FCNT_DOWN_NONE && candidate <= *last {
        return Err(AuthError::Replay);
    }
    *last = candidate;
    Ok(())
}

/// Authenticate `msg` under `nwk_skey`, advance `fcnt_down` and decrypt the payload.
fn open_with<F: CryptoFactory>(
    factory: &F,
    nwk_skey: &AES128,
    app_skey: &AES128,
    fcnt_down: &mut u32,
    phy: &[u8],
    msg: &mut DataMessage,
) -> Result<u32, Error> {
    let fcnt = reconstruct_fcnt(*fcnt_down, msg.fcnt);
    let signed = &phy[..phy.len() - MIC_SIZE];
    let mic = calculate_data_mic(factory, nwk_skey, signed, Direction::Downlink, msg.dev_addr, fcnt);
    if mic != msg.mic {
        return Err(Error::Auth(AuthError::InvalidMic));
    }
    advance_fcnt(fcnt_down, fcnt).map_err(Error::Auth)?;
    if let Some(fport) = msg.fport {
        let key = if fport == 0 { nwk_skey } else { app_skey };
        encrypt_frm_data_payload(
            factory,
            key,
            &mut msg.frm_payload,
            Direction::Downlink,
            msg.dev_addr,
            fcnt,
        );
    }
    Ok(fcnt)
}

/// Key material and counters of the current activation.
pub struct SecurityContext<F> {
    factory: F,
    app_key: AES128,
    session: Option<Session>,
    fcnt_up: u32,
    fcnt_down: u32,
    dev_nonce: u16,
    multicast: Vec<MulticastGroup, MAX_MULTICAST_GROUPS>,
}

impl<F> core::fmt::Debug for SecurityContext<F> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SecurityContext")
            .field("dev_addr", &self.session.as_ref().map(|s| s.dev_addr))
            .field("fcnt_up", &self.fcnt_up)
            .field("fcnt_down", &self.fcnt_down)
            .field("dev_nonce", &self.dev_nonce)
            .field("multicast_groups", &self.multicast.len())
            .finish_non_exhaustive()
    }
}

impl<F: CryptoFactory> SecurityContext<F> {
    /// Creation, without a session.
    pub fn new(factory: F, app_key: AES128) -> Self {
        Self {
            factory,
            app_key,
            session: None,
            fcnt_up: 0,
            fcnt_down: FCNT_DOWN_NONE,
            dev_nonce: 0,
            multicast: Vec::new(),
        }
    }

    /// Install a session with keys provisioned out of band.
    pub fn activate_by_personalization(
        &mut self,
        dev_addr: DevAddr,
        nwk_skey: AES128,
        app_skey: AES128,
    ) {
        self.session = Some(Session { nwk_skey, app_skey, dev_addr });
        self.fcnt_up = 0;
        self.fcnt_down = FCNT_DOWN_NONE;
    }

    /// Drop the session, e.g. before rejoining.
    pub fn reset(&mut self) {
        self.session = None;
        self.fcnt_up = 0;
        self.fcnt_down = FCNT_DOWN_NONE;
    }

    #[allow(missing_docs)]
    pub fn is_joined(&self) -> bool {
        self.session.is_some()
    }

    /// Address assigned by the network, if joined.
    pub fn dev_addr(&self) -> Option<DevAddr> {
        self.session.as_ref().map(|s| s.dev_addr)
    }

    /// Counter the next uplink will use.
    pub fn fcnt_up(&self) -> u32 {
        self.fcnt_up
    }

    /// Last accepted downlink counter, [`FCNT_DOWN_NONE`] if there is none.
    pub fn fcnt_down(&self) -> u32 {
        self.fcnt_down
    }

    #[allow(missing_docs)]
    pub fn dev_nonce(&self) -> u16 {
        self.dev_nonce
    }

    pub(crate) fn set_dev_nonce(&mut self, dev_nonce: u16) {
        self.dev_nonce = dev_nonce;
    }

    fn key(&self, id: KeyId) -> Result<&AES128, Error> {
        match (id, &self.session) {
            (KeyId::App, _) => Ok(&self.app_key),
            (KeyId::NwkS, Some(s)) => Ok(&s.nwk_skey),
            (KeyId::AppS, Some(s)) => Ok(&s.app_skey),
            (_, None) => Err(Error::NetworkNotJoined),
        }
    }

    fn session_addr(&self) -> Result<DevAddr, Error> {
        self.dev_addr().ok_or(Error::NetworkNotJoined)
    }

    /// Plain CMAC based MIC of `data` with the selected key.
    pub fn compute_mic(&self, key: KeyId, data: &[u8]) -> Result<MIC, Error> {
        Ok(calculate_mic(&self.factory, self.key(key)?, data))
    }

    /// Encrypt an FRMPayload in place.
    pub fn encrypt(
        &self,
        key: KeyId,
        payload: &mut [u8],
        dir: Direction,
        fcnt: u32,
    ) -> Result<(), Error> {
        let dev_addr = self.session_addr()?;
        encrypt_frm_data_payload(&self.factory, self.key(key)?, payload, dir, dev_addr, fcnt);
        Ok(())
    }

    /// Decrypt an FRMPayload in place.
    pub fn decrypt(
        &self,
        key: KeyId,
        payload: &mut [u8],
        dir: Direction,
        fcnt: u32,
    ) -> Result<(), Error> {
        self.encrypt(key, payload, dir, fcnt)
    }

    /// Hand out the counter for a new uplink and advance it.
    ///
    /// The counter never wraps; once exhausted the session must be renewed by a join.
    pub fn next_fcnt_up(&mut self) -> Result<u32, Error> {
        if self.session.is_none() {
            return Err(Error::NetworkNotJoined);
        }
        if self.fcnt_up == u32::MAX {
            return Err(Error::SessionExpired);
        }
        let fcnt = self.fcnt_up;
        self.fcnt_up += 1;
        Ok(fcnt)
    }

    /// Full 32 bit counter of a downlink carrying the low 16 bits `wire`.
    ///
    /// The result lies ahead of the last accepted counter where possible; a repeated
    /// counter maps to the last accepted value and is then rejected as a replay.
    pub fn reconstruct_fcnt_down(&self, wire: u16) -> u32 {
        reconstruct_fcnt(self.fcnt_down, wire)
    }

    /// Accept `candidate` as the newest downlink counter, or reject it as a replay.
    pub fn validate_fcnt_down(&mut self, candidate: u32) -> Result<(), AuthError> {
        advance_fcnt(&mut self.fcnt_down, candidate)
    }

    /// Join the multicast group `dev_addr`, or re-key it if already a member.
    ///
    /// The group's downlink counter starts over.
    pub fn add_multicast_group(
        &mut self,
        dev_addr: DevAddr,
        nwk_skey: AES128,
        app_skey: AES128,
    ) -> Result<(), Error> {
        if self.dev_addr() == Some(dev_addr) {
            return Err(Error::InvalidDevAddr);
        }
        let group = MulticastGroup { dev_addr, nwk_skey, app_skey, fcnt_down: FCNT_DOWN_NONE };
        match self.multicast.iter_mut().find(|g| g.dev_addr == dev_addr) {
            Some(existing) => *existing = group,
            None => self.multicast.push(group).map_err(|_| Error::MulticastGroupsFull)?,
        }
        Ok(())
    }

    /// Leave a multicast group. Returns whether the device was a member.
    pub fn remove_multicast_group(&mut self, dev_addr: DevAddr) -> bool {
        let before = self.multicast.len();
        self.multicast.retain(|g| g.dev_addr != dev_addr);
        self.multicast.len() != before
    }

    /// Last accepted downlink counter of a group, `None` if the device is not a member.
    pub fn multicast_fcnt_down(&self, dev_addr: DevAddr) -> Option<u32> {
        self.multicast.iter().find(|g| g.dev_addr == dev_addr).map(|g| g.fcnt_down)
    }

    /// Sign an uplink data frame: `frame` holds the serialized frame without MIC.
    pub fn uplink_mic(&self, frame: &[u8], fcnt: u32) -> Result<MIC, Error> {
        let dev_addr = self.session_addr()?;
        let key = self.key(KeyId::NwkS)?;
        Ok(calculate_data_mic(&self.factory, key, frame, Direction::Uplink, dev_addr, fcnt))
    }

    /// Authenticate a received downlink and decrypt its payload in place.
    ///
    /// `phy` is the raw frame `msg` was parsed from. Frames for a multicast group are checked
    /// with the group's keys and counter, and must be unconfirmed without MAC commands.
    pub fn open_downlink(&mut self, phy: &[u8], msg: &mut DataMessage) -> Result<Opened, Error> {
        if let Some(session) = self.session.as_ref().filter(|s| s.dev_addr == msg.dev_addr) {
            let fcnt = open_with(
                &self.factory,
                &session.nwk_skey,
                &session.app_skey,
                &mut self.fcnt_down,
                phy,
                msg,
            )?;
            return Ok(Opened { fcnt, multicast: None });
        }
        let joined = self.session.is_some();
        let Some(group) = self.multicast.iter_mut().find(|g| g.dev_addr == msg.dev_addr) else {
            return Err(if joined { Error::InvalidDevAddr } else { Error::NetworkNotJoined });
        };
        if msg.mhdr.mtype().is_confirmed() || !msg.fopts.is_empty() || msg.fport == Some(0) {
            return Err(Error::InvalidMulticast);
        }
        let fcnt = open_with(
            &self.factory,
            &group.nwk_skey,
            &group.app_skey,
            &mut group.fcnt_down,
            phy,
            msg,
        )?;
        Ok(Opened { fcnt, multicast: Some(group.dev_addr) })
    }

    /// Build and sign the next Join-Request, consuming a DevNonce.
    pub fn join_request(&mut self, app_eui: [u8; 8], dev_eui: [u8; 8]) -> JoinRequest {
        self.dev_nonce = self.dev_nonce.wrapping_add(1);
        let mut req = JoinRequest::new(app_eui, dev_eui, self.dev_nonce);
        req.sign(&self.factory, &self.app_key);
        req
    }

    /// Decrypt and authenticate a Join-Accept in place, then derive and install the session.
    pub fn accept_join(&mut self, phy: &mut [u8]) -> Result<JoinAcceptMessage, Error> {
        decrypt_join_accept(&self.factory, &self.app_key, phy).map_err(Error::Parse)?;
        let accept = parse_join_accept(phy).map_err(Error::Parse)?;
        let mic = calculate_mic(&self.factory, &self.app_key, &phy[..phy.len() - MIC_SIZE]);
        if mic != accept.mic {
            return Err(Error::Auth(AuthError::InvalidMic));
        }
        let derive = |key_type| {
            derive_session_key(
                &self.factory,
                &self.app_key,
                key_type,
                accept.join_nonce,
                accept.net_id,
                self.dev_nonce,
            )
        };
        let nwk_skey = derive(SessionKeyType::Network);
        let app_skey = derive(SessionKeyType::Application);
        self.activate_by_personalization(accept.dev_addr, nwk_skey, app_skey);
        Ok(accept)
    }

    /// Class B ping slot offset of this device for the beacon period starting at `beacon_time`.
    pub fn ping_offset(&self, beacon_time: u32, ping_period: u16) -> Option<u16> {
        let dev_addr = self.dev_addr()?;
        Some(ping_offset(&self.factory, beacon_time, dev_addr, ping_period))
    }

    /// Serialize the session so it survives a power cycle.
    pub fn write_session(&self, out: &mut [u8; SESSION_SIZE]) {
        out.fill(0);
        if let Some(s) = &self.session {
            out[0] = 1;
            out[1..5].copy_from_slice(&s.dev_addr.to_le_bytes());
            out[5..21].copy_from_slice(&s.nwk_skey.0);
            out[21..37].copy_from_slice(&s.app_skey.0);
        }
        out[37..41].copy_from_slice(&self.fcnt_up.to_le_bytes());
        out[41..45].copy_from_slice(&self.fcnt_down.to_le_bytes());
        out[45..47].copy_from_slice(&self.dev_nonce.to_le_bytes());
    }

    /// Restore what [`SecurityContext::write_session`] produced.
    pub fn restore_session(&mut self, data: &[u8; SESSION_SIZE]) {
        let mut nwk = [0u8; 16];
        let mut app = [0u8; 16];
        nwk.copy_from_slice(&data[5..21]);
        app.copy_from_slice(&data[21..37]);
        self.session = (data[0] == 1).then(|| Session {
            nwk_skey: AES128(nwk),
            app_skey: AES128(app),
            dev_addr: DevAddr::from_le_bytes([data[1], data[2], data[3], data[4]]),
        });
        self.fcnt_up = u32::from_le_bytes([data[37], data[38], data[39], data[40]]);
        self.fcnt_down = u32::from_le_bytes([data[41], data[42], data[43], data[44]]);
        self.dev_nonce = u16::from_le_bytes([data[45], data[46]]);
    }
}
