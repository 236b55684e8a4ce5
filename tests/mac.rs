mod common;

use common::*;
use crc::{Crc, CRC_16_XMODEM};
use lorawan_node::device::radio::types::SpreadingFactor;
use lorawan_node::device::timer::TimerId;
use lorawan_node::encoding::parser::{parse_data_message, DevAddr, MType};
use lorawan_node::mac::class_b::BeaconState;
use lorawan_node::mac::event::Event;
use lorawan_node::mac::types::{Class, Configuration, Response, State, Window, DR};
use lorawan_node::mac::{AuthError, Error};

const JOIN_CHANNELS: [u32; 3] = [868_100_000, 868_300_000, 868_500_000];
/// Long enough for every EU868 band to reopen after a frame at DR0.
const BAND_REOPEN_MS: u64 = 200_000;

/// OTAA join answered in RX1; returns the session keys.
fn join(mac: &mut EuMac, device: &mut MockDevice) -> ([u8; 16], [u8; 16]) {
    mac.join(device).unwrap();
    let nonce = dev_nonce(&last_sent(device));
    tx_done(mac, device);
    assert_eq!(fire(mac, device), TimerId::Rx1);
    let server = JoinServer::new();
    rx(mac, device, &server.accept(0x00, 1));
    assert_eq!(mac.next_response(), Some(Response::JoinAccepted));
    server.session_keys(nonce)
}

#[test]
fn otaa_join_then_uplink() {
    let mut device = MockDevice::new();
    let mut mac = new_mac(Configuration::default());

    mac.join(&mut device).unwrap();
    assert_eq!(mac.state(), State::Joining);
    let (config, request) = device.radio.sent[0].clone();
    assert_eq!(request.len(), 23);
    assert_eq!(request[0], 0x00);
    assert_eq!(dev_nonce(&request), 1);
    assert!(JOIN_CHANNELS.contains(&config.rf.frequency));
    assert_eq!(config.rf.data_rate.spreading_factor, SpreadingFactor::_12);
    assert_eq!(config.pw, 14);

    tx_done(&mut mac, &mut device);
    assert_eq!(mac.state(), State::WaitingRx1);
    assert_eq!(device.timer.deadline(TimerId::Rx1), Some(4_980));
    assert_eq!(device.timer.deadline(TimerId::Rx2), Some(5_980));

    assert_eq!(fire(&mut mac, &mut device), TimerId::Rx1);
    assert_eq!(device.radio.rx_configs.last().unwrap().frequency, config.rf.frequency);
    assert_eq!(device.radio.receives.last(), Some(&800));

    let server = JoinServer::new();
    rx(&mut mac, &mut device, &server.accept(0x00, 1));
    assert_eq!(mac.next_response(), Some(Response::JoinAccepted));
    assert!(mac.is_joined());
    assert_eq!(mac.dev_addr(), Some(DEV_ADDR));
    assert_eq!(mac.state(), State::Idle);
    assert!(device.timer.armed.is_empty());

    device.timer.now += BAND_REOPEN_MS;
    mac.send(&mut device, 1, b"hello", false).unwrap();
    let (nwk_skey, app_skey) = server.session_keys(1);
    let uplink = open_uplink(&last_sent(&device), nwk_skey, app_skey);
    assert_eq!(uplink.mhdr.mtype(), MType::UnconfirmedDataUp);
    assert_eq!(uplink.dev_addr, DEV_ADDR);
    assert_eq!(uplink.fcnt, 0);
    assert_eq!(uplink.fport, Some(1));
    assert_eq!(&uplink.frm_payload[..], b"hello");

    assert_eq!(drive(&mut mac, &mut device), Response::UplinkDone { fcnt: 0, acked: false });
    assert_eq!(mac.fcnt_up(), 1);
    assert_eq!(device.radio.sent.len(), 2);
}

#[test]
fn join_gives_up_after_max_attempts() {
    let mut device = MockDevice::new();
    let mut mac = new_mac(Configuration::default().with_max_join_attempts(2));

    mac.join(&mut device).unwrap();
    assert_eq!(drive(&mut mac, &mut device), Response::JoinFailed);
    assert_eq!(device.radio.sent.len(), 2);
    assert_eq!(dev_nonce(&device.radio.sent[0].1), 1);
    assert_eq!(dev_nonce(&device.radio.sent[1].1), 2);
    assert!(!mac.is_joined());
    assert_eq!(mac.state(), State::Idle);
}

#[test]
fn join_accept_with_wrong_key_is_ignored() {
    let mut device = MockDevice::new();
    let mut mac = new_mac(Configuration::default().with_max_join_attempts(1));

    mac.join(&mut device).unwrap();
    tx_done(&mut mac, &mut device);
    fire(&mut mac, &mut device);
    let mut accept = JoinServer::new().accept(0x00, 1);
    accept[5] ^= 0x01;
    rx(&mut mac, &mut device, &accept);
    assert!(!mac.is_joined());
    assert_eq!(mac.state(), State::WaitingRx2);
    assert_eq!(drive(&mut mac, &mut device), Response::JoinFailed);
}

#[test]
fn downlink_is_delivered_and_replay_rejected() {
    let mut device = MockDevice::new();
    let mut mac = abp_mac(Configuration::default());

    mac.send(&mut device, 1, b"ping", false).unwrap();
    tx_done(&mut mac, &mut device);
    assert_eq!(device.timer.deadline(TimerId::Rx1), Some(980));
    assert_eq!(fire(&mut mac, &mut device), TimerId::Rx1);
    let downlink = DownlinkBuilder::new(5).data(2, b"hi").build();
    rx(&mut mac, &mut device, &downlink);

    match mac.next_response() {
        Some(Response::Downlink(dl)) => {
            assert_eq!(dl.fport, 2);
            assert_eq!(&dl.data[..], b"hi");
            assert_eq!(dl.window, Window::_1);
            assert!(!dl.pending);
        }
        other => panic!("unexpected {:?}", other),
    }
    assert_eq!(mac.next_response(), Some(Response::UplinkDone { fcnt: 0, acked: false }));
    assert_eq!(mac.fcnt_down(), 5);

    device.timer.now += BAND_REOPEN_MS;
    mac.send(&mut device, 1, b"ping", false).unwrap();
    tx_done(&mut mac, &mut device);
    fire(&mut mac, &mut device);
    rx(&mut mac, &mut device, &downlink);
    assert_eq!(mac.next_response(), Some(Response::AuthFailed(AuthError::Replay)));
    assert_eq!(mac.next_response(), Some(Response::UplinkDone { fcnt: 1, acked: false }));
    assert_eq!(mac.fcnt_down(), 5);
}

#[test]
fn downlink_with_bad_mic_is_reported() {
    let mut device = MockDevice::new();
    let mut mac = abp_mac(Configuration::default());

    mac.send(&mut device, 1, b"ping", false).unwrap();
    tx_done(&mut mac, &mut device);
    fire(&mut mac, &mut device);
    let mut builder = DownlinkBuilder::new(1).data(2, b"hi");
    builder.nwk_skey = [0x33; 16];
    rx(&mut mac, &mut device, &builder.build());
    assert_eq!(mac.next_response(), Some(Response::AuthFailed(AuthError::InvalidMic)));
    assert_eq!(mac.next_response(), Some(Response::UplinkDone { fcnt: 0, acked: false }));
    assert_eq!(mac.fcnt_down(), u32::MAX);
}

#[test]
fn confirmed_uplink_is_acknowledged() {
    let mut device = MockDevice::new();
    let mut mac = abp_mac(Configuration::default());

    mac.send(&mut device, 3, b"c", true).unwrap();
    let uplink = open_uplink(&last_sent(&device), NWK_SKEY, APP_SKEY);
    assert_eq!(uplink.mhdr.mtype(), MType::ConfirmedDataUp);
    tx_done(&mut mac, &mut device);
    fire(&mut mac, &mut device);
    rx(&mut mac, &mut device, &DownlinkBuilder::new(0).ack().build());
    assert_eq!(mac.next_response(), Some(Response::UplinkDone { fcnt: 0, acked: true }));
    assert_eq!(mac.next_response(), None);
    assert_eq!(device.radio.sent.len(), 1);
}

#[test]
fn confirmed_uplink_gives_up_after_max_retries() {
    let mut device = MockDevice::new();
    let mut mac = abp_mac(Configuration::default().with_max_retries(3));

    mac.send(&mut device, 1, b"x", true).unwrap();
    assert_eq!(drive(&mut mac, &mut device), Response::UplinkFailed(Error::RetriesExhausted));
    assert_eq!(device.radio.sent.len(), 3);
    for (_, frame) in &device.radio.sent {
        let msg = parse_data_message(frame).unwrap();
        assert_eq!(msg.fcnt, 0);
        assert_eq!(msg.mhdr.mtype(), MType::ConfirmedDataUp);
    }
    assert_eq!(mac.state(), State::Idle);
    assert_eq!(mac.fcnt_up(), 1);
}

#[test]
fn duty_cycle_defers_next_uplink() {
    let mut device = MockDevice::new();
    let mut mac = abp_mac(Configuration::default());

    mac.send(&mut device, 1, b"one", false).unwrap();
    assert_eq!(drive(&mut mac, &mut device), Response::UplinkDone { fcnt: 0, acked: false });

    mac.send(&mut device, 1, b"two", false).unwrap();
    assert_eq!(mac.state(), State::Backoff);
    assert_eq!(device.radio.sent.len(), 1);
    let wake = device.timer.deadline(TimerId::Backoff).unwrap();
    assert!(wake > device.timer.now);

    assert_eq!(fire(&mut mac, &mut device), TimerId::Backoff);
    assert_eq!(device.radio.sent.len(), 2);
    assert_eq!(mac.state(), State::Transmitting);
}

#[test]
fn rejects_invalid_requests() {
    let mut device = MockDevice::new();
    let mut mac = new_mac(Configuration::default());
    let err = mac.send(&mut device, 1, b"x", false).unwrap_err();
    assert_eq!(err.mac(), Some(&Error::NetworkNotJoined));

    let mut mac = abp_mac(Configuration::default());
    let err = mac.send(&mut device, 0, b"x", false).unwrap_err();
    assert_eq!(err.mac(), Some(&Error::InvalidPort));
    let err = mac.send(&mut device, 224, b"x", false).unwrap_err();
    assert_eq!(err.mac(), Some(&Error::InvalidPort));
    let err = mac.send(&mut device, 1, &[0u8; 52], false).unwrap_err();
    assert_eq!(err.mac(), Some(&Error::PayloadTooLarge));

    mac.send(&mut device, 1, b"x", false).unwrap();
    let err = mac.send(&mut device, 1, b"y", false).unwrap_err();
    assert_eq!(err.mac(), Some(&Error::Busy));
    let err = mac.join(&mut device).unwrap_err();
    assert_eq!(err.mac(), Some(&Error::Busy));
    assert_eq!(device.radio.sent.len(), 1);
}

#[test]
fn link_check_reaches_application() {
    let mut device = MockDevice::new();
    let mut mac = abp_mac(Configuration::default());

    mac.request_link_check().unwrap();
    mac.send(&mut device, 1, b"a", false).unwrap();
    let uplink = open_uplink(&last_sent(&device), NWK_SKEY, APP_SKEY);
    assert_eq!(&uplink.fopts[..], &[0x02]);

    tx_done(&mut mac, &mut device);
    fire(&mut mac, &mut device);
    rx(&mut mac, &mut device, &DownlinkBuilder::new(1).fopts(&[0x02, 20, 3]).build());
    assert_eq!(mac.next_response(), Some(Response::LinkCheck { margin: 20, gateway_count: 3 }));
    assert_eq!(mac.next_response(), Some(Response::UplinkDone { fcnt: 0, acked: false }));
    assert_eq!(device.link_checks, vec![(3, 20)]);
}

#[test]
fn mac_commands_are_answered_in_next_uplink() {
    let mut device = MockDevice::new();
    device.battery = Some(0.5);
    let mut mac = abp_mac(Configuration::default());

    mac.send(&mut device, 1, b"a", false).unwrap();
    tx_done(&mut mac, &mut device);
    fire(&mut mac, &mut device);
    // DevStatusReq and RXTimingSetupReq(3) on port 0
    rx(&mut mac, &mut device, &DownlinkBuilder::new(1).data(0, &[0x06, 0x08, 0x03]).build());
    assert_eq!(mac.next_response(), Some(Response::UplinkDone { fcnt: 0, acked: false }));
    assert_eq!(mac.configuration().rx_delay(), Some(3));

    device.timer.now += BAND_REOPEN_MS;
    mac.send(&mut device, 1, b"b", false).unwrap();
    let uplink = open_uplink(&last_sent(&device), NWK_SKEY, APP_SKEY);
    assert_eq!(&uplink.fopts[..], &[0x06, 127, 7, 0x08]);

    let now = device.timer.now;
    tx_done(&mut mac, &mut device);
    assert_eq!(device.timer.deadline(TimerId::Rx1), Some(now + 2_980));
    assert_eq!(device.timer.deadline(TimerId::Rx2), Some(now + 3_980));

    // RXTimingSetupAns is repeated until a downlink arrives
    assert_eq!(drive(&mut mac, &mut device), Response::UplinkDone { fcnt: 1, acked: false });
    device.timer.now += BAND_REOPEN_MS;
    mac.send(&mut device, 1, b"c", false).unwrap();
    let uplink = open_uplink(&last_sent(&device), NWK_SKEY, APP_SKEY);
    assert_eq!(&uplink.fopts[..], &[0x08]);
}

#[test]
fn link_adr_request_changes_rate_power_and_repetitions() {
    let mut device = MockDevice::new();
    let mut mac = abp_mac(Configuration::default());

    mac.send(&mut device, 1, b"a", false).unwrap();
    tx_done(&mut mac, &mut device);
    fire(&mut mac, &mut device);
    // DR5, TXPower 1, channels 0 to 2, NbTrans 2
    let link_adr = [0x03, 0x51, 0x07, 0x00, 0x02];
    rx(&mut mac, &mut device, &DownlinkBuilder::new(1).fopts(&link_adr).build());
    assert_eq!(mac.next_response(), Some(Response::UplinkDone { fcnt: 0, acked: false }));
    assert_eq!(mac.configuration().tx_data_rate(), Some(DR::_5));
    assert_eq!(mac.configuration().tx_power(), Some(12));
    assert_eq!(mac.configuration().number_of_transmissions(), 2);

    device.timer.now += BAND_REOPEN_MS;
    mac.send(&mut device, 1, b"b", false).unwrap();
    let (config, frame) = device.radio.sent.last().unwrap().clone();
    assert_eq!(config.rf.data_rate.spreading_factor, SpreadingFactor::_7);
    assert_eq!(config.pw, 12);
    let uplink = open_uplink(&frame, NWK_SKEY, APP_SKEY);
    assert_eq!(&uplink.fopts[..], &[0x03, 0x07]);

    assert_eq!(drive(&mut mac, &mut device), Response::UplinkDone { fcnt: 1, acked: false });
    assert_eq!(device.radio.sent.len(), 3);
}

#[test]
fn invalid_link_adr_request_changes_nothing() {
    let mut device = MockDevice::new();
    let mut mac = abp_mac(Configuration::default());

    mac.send(&mut device, 1, b"a", false).unwrap();
    tx_done(&mut mac, &mut device);
    fire(&mut mac, &mut device);
    let before = mac.configuration().tx_data_rate();
    let power = mac.configuration().tx_power();
    assert_eq!(before, Some(DR::_0));
    // TXPower 9 does not exist in EU868
    rx(&mut mac, &mut device, &DownlinkBuilder::new(1).fopts(&[0x03, 0x59, 0x07, 0x00, 0x02]).build());
    assert_eq!(mac.configuration().tx_data_rate(), before);
    assert_eq!(mac.configuration().tx_power(), power);
    assert_eq!(mac.configuration().number_of_transmissions(), 1);

    device.timer.now += BAND_REOPEN_MS;
    mac.next_response();
    mac.send(&mut device, 1, b"b", false).unwrap();
    let uplink = open_uplink(&last_sent(&device), NWK_SKEY, APP_SKEY);
    assert_eq!(&uplink.fopts[..], &[0x03, 0x03]);
}

#[test]
fn answers_beyond_the_queue_are_dropped() {
    let mut device = MockDevice::new();
    let mut mac = abp_mac(Configuration::default());

    mac.send(&mut device, 1, b"c", true).unwrap();
    tx_done(&mut mac, &mut device);
    fire(&mut mac, &mut device);
    // sixteen DevStatusReq on port 0, one more than the answer queue holds
    rx(&mut mac, &mut device, &DownlinkBuilder::new(1).ack().data(0, &[0x06; 16]).build());
    assert_eq!(mac.next_response(), Some(Response::UplinkDone { fcnt: 0, acked: true }));
    assert_eq!(mac.next_response(), None);
    assert_eq!(mac.state(), State::Idle);
    assert_eq!(mac.fcnt_down(), 1);

    let mut restarted = new_mac(Configuration::default());
    assert!(restarted.restore(&mut device).unwrap());
    assert_eq!(restarted.fcnt_down(), 1);

    device.timer.now += BAND_REOPEN_MS;
    mac.send(&mut device, 1, b"d", false).unwrap();
    let uplink = open_uplink(&last_sent(&device), NWK_SKEY, APP_SKEY);
    assert_eq!(uplink.fopts.len(), 15);
    assert_eq!(&uplink.fopts[..3], &[0x06, 255, 7]);
}

#[test]
fn session_and_nonce_survive_restart() {
    let mut device = MockDevice::new();
    let mut fresh = new_mac(Configuration::default());
    assert!(!fresh.restore(&mut device).unwrap());

    let mut mac = new_mac(Configuration::default());
    join(&mut mac, &mut device);
    device.timer.now += BAND_REOPEN_MS;
    mac.send(&mut device, 1, b"a", false).unwrap();
    drive(&mut mac, &mut device);

    let mut restarted = new_mac(Configuration::default());
    assert!(restarted.restore(&mut device).unwrap());
    assert_eq!(restarted.dev_addr(), Some(DEV_ADDR));
    assert_eq!(restarted.fcnt_up(), 1);
    assert_eq!(restarted.configuration().rx_delay(), Some(1));

    restarted.join(&mut device).unwrap();
    assert_eq!(dev_nonce(&last_sent(&device)), 2);
}

#[test]
fn class_c_listens_between_uplinks() {
    let mut device = MockDevice::new();
    let mut mac = abp_mac(Configuration::default());

    mac.set_class(&mut device, Class::C).unwrap();
    assert_eq!(device.radio.receives.last(), Some(&0));
    assert_eq!(device.radio.rx_configs.last().unwrap().frequency, 869_525_000);

    rx(&mut mac, &mut device, &DownlinkBuilder::new(3).data(4, b"c").build());
    match mac.next_response() {
        Some(Response::Downlink(dl)) => {
            assert_eq!(dl.fport, 4);
            assert_eq!(dl.window, Window::Continuous);
            assert_eq!(dl.multicast, None);
        }
        other => panic!("unexpected {:?}", other),
    }
    assert_eq!(device.radio.receives.last(), Some(&0));
    assert_eq!(mac.state(), State::Idle);
}

#[test]
fn class_c_receives_multicast_group() {
    const GROUP: DevAddr = DevAddr(0x2601_aaaa);
    let mut device = MockDevice::new();
    let mut mac = abp_mac(Configuration::default());
    mac.set_class(&mut device, Class::C).unwrap();
    mac.add_multicast_group(GROUP, [0x44; 16], [0x55; 16]).unwrap();

    let mut builder = DownlinkBuilder::new(7).data(5, b"fw");
    builder.dev_addr = GROUP;
    builder.nwk_skey = [0x44; 16];
    builder.app_skey = [0x55; 16];
    let frame = builder.build();
    rx(&mut mac, &mut device, &frame);
    match mac.next_response() {
        Some(Response::Downlink(dl)) => {
            assert_eq!(dl.fport, 5);
            assert_eq!(&dl.data[..], b"fw");
            assert_eq!(dl.multicast, Some(GROUP));
            assert_eq!(dl.window, Window::Continuous);
        }
        other => panic!("unexpected {:?}", other),
    }
    assert_eq!(mac.fcnt_down(), u32::MAX);
    assert_eq!(device.radio.receives.last(), Some(&0));

    rx(&mut mac, &mut device, &frame);
    assert_eq!(mac.next_response(), Some(Response::AuthFailed(AuthError::Replay)));

    assert!(mac.remove_multicast_group(GROUP));
    builder.fcnt = 8;
    rx(&mut mac, &mut device, &builder.build());
    assert_eq!(mac.next_response(), None);
    assert_eq!(mac.state(), State::Idle);
}

fn beacon(time: u32) -> [u8; 17] {
    let crc = Crc::<u16>::new(&CRC_16_XMODEM);
    let mut frame = [0u8; 17];
    frame[2..6].copy_from_slice(&time.to_le_bytes());
    let crc0 = crc.checksum(&frame[..6]);
    frame[6..8].copy_from_slice(&crc0.to_le_bytes());
    frame[8] = 0x00;
    let crc1 = crc.checksum(&frame[8..15]);
    frame[15..17].copy_from_slice(&crc1.to_le_bytes());
    frame
}

#[test]
fn class_b_locks_on_beacon() {
    let mut device = MockDevice::new();
    let mut mac = abp_mac(Configuration::default());

    mac.start_beacon_acquisition(&mut device).unwrap();
    assert_eq!(mac.beacon_state(), BeaconState::Acquisition);
    assert_eq!(device.radio.receives.last(), Some(&128_000));
    assert_eq!(device.radio.rx_configs.last().unwrap().frequency, 869_525_000);
    assert_eq!(device.timer.deadline(TimerId::Beacon), Some(128_000));

    rx(&mut mac, &mut device, &beacon(1_000_000_000));
    assert_eq!(mac.next_response(), Some(Response::BeaconLocked { time: 1_000_000_000 }));
    assert_eq!(mac.beacon_state(), BeaconState::Locked);
    assert_eq!(device.timer.deadline(TimerId::Beacon), Some(127_980));
    assert!(device.timer.deadline(TimerId::PingSlot).is_some());

    mac.send(&mut device, 1, b"b", false).unwrap();
    let uplink = open_uplink(&last_sent(&device), NWK_SKEY, APP_SKEY);
    // the Class B bit shares its position with FPending
    assert!(uplink.fctrl.f_pending());
}

#[test]
fn class_b_falls_back_without_beacon() {
    let mut device = MockDevice::new();
    let mut mac = abp_mac(Configuration::default());

    mac.start_beacon_acquisition(&mut device).unwrap();
    post(&mut mac, &mut device, Event::RxTimeout);
    assert_eq!(mac.next_response(), Some(Response::BeaconLost));
    assert_eq!(mac.beacon_state(), BeaconState::Off);
    assert_eq!(mac.configuration().class(), Class::A);
    assert_eq!(device.timer.deadline(TimerId::Beacon), None);
}

#[test]
fn beacon_acquisition_needs_a_session() {
    let mut device = MockDevice::new();
    let mut mac = new_mac(Configuration::default());
    let err = mac.start_beacon_acquisition(&mut device).unwrap_err();
    assert_eq!(err.mac(), Some(&Error::NetworkNotJoined));
}

#[test]
fn full_event_queue_is_reported() {
    let mut mac = abp_mac(Configuration::default());
    for _ in 0..8 {
        mac.post(Event::RxTimeout).unwrap();
    }
    assert_eq!(mac.post(Event::RxTimeout), Err(Error::QueueFull));
}
