//! In-memory device simulator speaking both handshake variants

#![allow(dead_code)]

use async_trait::async_trait;
use ecoflow_core::{
    ConnectionConfig, DeviceClient, DeviceIdentity, DeviceTable, PacketFilter, RecordBinding,
    Scalar,
};
use ecoflow_protocol::ecdh::EphemeralKeyPair;
use ecoflow_protocol::session::{auth_payload, gen_session_key, CMD_KEY_INFO, CMD_PUBLIC_KEY};
use ecoflow_protocol::transport::EVENT_CHANNEL_CAPACITY;
use ecoflow_protocol::{
    address, Candidate, Command, EncPacket, Framing, KeyStrategy, KeyTable, Packet, Reassembler,
    Session, Transport, TransportError, TransportEvent,
};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

pub const SERIAL: &str = "HW51ZEH4SF0001";
pub const USER_ID: &str = "1234567890123456789";

/// Seed the simulator answers key info requests with
pub const SEED: [u8; 2] = [0x12, 0x05];
pub const SRAND: [u8; 16] = [
    0x10, 0x21, 0x32, 0x43, 0x54, 0x65, 0x76, 0x87, 0x98, 0xA9, 0xBA, 0xCB, 0xDC, 0xED, 0xFE, 0x0F,
];

/// Deterministic stand-in for the vendor key table
pub fn key_table() -> Arc<KeyTable> {
    Arc::new(KeyTable::from_bytes(
        (0..0x11000u32).map(|i| (i * 7 + 3) as u8).collect(),
    ))
}

/// Config with the default timings and no history
pub fn config() -> ConnectionConfig {
    ConnectionConfig::default()
}

pub fn identity() -> DeviceIdentity {
    DeviceIdentity {
        serial: SERIAL.to_string(),
        user_id: USER_ID.to_string(),
    }
}

/// Inverter-style table: heartbeat record with the battery level at byte 4
pub fn inverter_table(framing: Framing, key_strategy: KeyStrategy) -> Arc<DeviceTable> {
    Arc::new(
        DeviceTable::builder("inverter")
            .serial_prefix("HW51")
            .framing(framing)
            .key_strategy(key_strategy)
            .xor_payload(true)
            .binding(
                RecordBinding::new(
                    "inverter_heartbeat",
                    PacketFilter::new(0x14, 0x01).from_src(address::IOT),
                )
                .field("pv1_input_watts", 0, Scalar::U16)
                .field("pv2_input_watts", 2, Scalar::U16)
                .field("battery_level", 4, Scalar::U8)
                .field("output_enabled", 5, Scalar::Bool)
                .throttle(Duration::from_secs(5)),
            )
            .encoder(encode_command)
            .build(),
    )
}

fn encode_command(field: &str, value: &ecoflow_core::FieldValue) -> Option<Packet> {
    match field {
        "output_enabled" => Some(Packet::new(
            address::APP,
            address::IOT,
            0x14,
            0x81,
            vec![u8::from(value.as_bool()?)],
        )),
        _ => None,
    }
}

/// Heartbeat payload understood by [`inverter_table`]
pub fn heartbeat(pv1: u16, pv2: u16, battery: u8, output: bool) -> Vec<u8> {
    let mut payload = pv1.to_le_bytes().to_vec();
    payload.extend_from_slice(&pv2.to_le_bytes());
    payload.push(battery);
    payload.push(u8::from(output));
    payload.extend_from_slice(&[0u8; 10]);
    payload
}

/// Device-originated heartbeat packet in the v0x13 layout
pub fn heartbeat_packet(payload: Vec<u8>, sequence: u32) -> Packet {
    Packet::new(address::IOT, address::APP, 0x14, 0x01, payload)
        .with_version(0x13)
        .with_sequence(sequence)
}

struct SimState {
    events: Option<mpsc::Sender<TransportEvent>>,
    reassembler: Box<dyn Reassembler>,
    /// Session from the ECDH shared secret, used for key info
    shared: Option<Session>,
    session: Option<Session>,
    connects: Vec<Instant>,
    received: Vec<Packet>,
    /// Every write call, failed or not
    writes: Vec<Instant>,
    /// Writes still to fail with an I/O error
    write_failures: u32,
    sequence: u32,
}

/// Scripted device behind the [`Transport`] trait
pub struct SimulatedDevice {
    serial: String,
    user_id: String,
    framing: Framing,
    key_strategy: KeyStrategy,
    xor_payload: bool,
    table: Arc<KeyTable>,
    /// Curve id announced in the public key response
    curve: u8,
    /// Byte returned for auto-authentication
    auth_result: u8,
    /// Bytes per notification
    mtu: usize,
    /// Accept the link but never answer
    silent: bool,
    connect_failures: Mutex<u32>,
    state: Mutex<SimState>,
}

impl SimulatedDevice {
    pub fn new(framing: Framing, key_strategy: KeyStrategy) -> Self {
        Self {
            serial: SERIAL.to_string(),
            user_id: USER_ID.to_string(),
            framing,
            key_strategy,
            xor_payload: true,
            table: key_table(),
            curve: 0,
            auth_result: 0,
            mtu: 20,
            silent: false,
            connect_failures: Mutex::new(0),
            state: Mutex::new(SimState {
                events: None,
                reassembler: framing.reassembler(),
                shared: None,
                session: None,
                connects: Vec::new(),
                received: Vec::new(),
                writes: Vec::new(),
                write_failures: 0,
                sequence: 1000,
            }),
        }
    }

    /// Fail the next `count` connects with "not found"
    pub fn with_connect_failures(self, count: u32) -> Self {
        *self.connect_failures.lock().unwrap() = count;
        self
    }

    pub fn with_auth_result(mut self, status: u8) -> Self {
        self.auth_result = status;
        self
    }

    pub fn with_silence(mut self) -> Self {
        self.silent = true;
        self
    }

    /// Fail the next `count` writes with an I/O error
    pub fn fail_writes(&self, count: u32) {
        self.state.lock().unwrap().write_failures = count;
    }

    pub fn writes(&self) -> Vec<Instant> {
        self.state.lock().unwrap().writes.clone()
    }

    pub fn with_curve(mut self, curve: u8) -> Self {
        self.curve = curve;
        self
    }

    /// Client for this simulator using [`inverter_table`]
    pub fn client(self: &Arc<Self>, config: ConnectionConfig) -> DeviceClient {
        DeviceClient::new(
            inverter_table(self.framing, self.key_strategy),
            identity(),
            Arc::clone(self) as Arc<dyn Transport>,
            config,
            Some(key_table()),
        )
    }

    pub fn connects(&self) -> Vec<Instant> {
        self.state.lock().unwrap().connects.clone()
    }

    pub fn received(&self) -> Vec<Packet> {
        self.state.lock().unwrap().received.clone()
    }

    pub fn received_command(&self, command: Command) -> Vec<Packet> {
        self.received()
            .into_iter()
            .filter(|p| command.matches(p))
            .collect()
    }

    pub fn is_linked(&self) -> bool {
        self.state.lock().unwrap().events.is_some()
    }

    /// Wait (in simulated time) until a packet matching `pred` arrives
    pub async fn wait_for_packet(&self, pred: impl Fn(&Packet) -> bool) -> Option<Packet> {
        for _ in 0..1000 {
            if let Some(packet) = self.received().into_iter().find(|p| pred(p)) {
                return Some(packet);
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        None
    }

    /// Send an application packet to the client
    pub async fn push(&self, packet: Packet) {
        let frame = {
            let state = self.state.lock().unwrap();
            let session = state.session.as_ref().expect("no session established");
            let bytes = packet.encode(self.xor_payload).expect("encodable packet");
            self.framing
                .encode_packet(&bytes, session)
                .expect("frameable packet")
        };
        self.notify(vec![frame]).await;
    }

    /// Send an encrypted frame whose plaintext is not a packet
    pub async fn push_garbage(&self) {
        let frame = {
            let state = self.state.lock().unwrap();
            let session = state.session.as_ref().expect("no session established");
            EncPacket::protocol(session.encrypt(b"definitely not a packet"))
                .encode()
                .expect("frameable payload")
        };
        self.notify(vec![frame]).await;
    }

    /// Drop the link as if the device went out of range
    pub async fn drop_link(&self) {
        let events = {
            let mut state = self.state.lock().unwrap();
            state.session = None;
            state.events.take()
        };
        if let Some(events) = events {
            let _ = events.send(TransportEvent::Disconnected).await;
        }
    }

    async fn notify(&self, frames: Vec<Vec<u8>>) {
        let Some(events) = self.state.lock().unwrap().events.clone() else {
            return;
        };
        for frame in frames {
            for chunk in frame.chunks(self.mtu) {
                if events
                    .send(TransportEvent::Notification(chunk.to_vec()))
                    .await
                    .is_err()
                {
                    return;
                }
            }
        }
    }

    fn reply(&self, state: &mut SimState, request: &Packet, payload: Vec<u8>) -> Option<Vec<u8>> {
        state.sequence += 1;
        let packet = Packet::new(
            address::IOT,
            address::APP,
            request.cmd_set(),
            request.cmd_id(),
            payload,
        )
        .with_sequence(state.sequence);
        let bytes = packet.encode(self.xor_payload).ok()?;
        self.framing
            .encode_packet(&bytes, state.session.as_ref()?)
            .ok()
    }

    fn handle_command(&self, state: &mut SimState, payload: &[u8]) -> Option<Vec<u8>> {
        match payload.first() {
            Some(&CMD_PUBLIC_KEY) => {
                let key_pair = EphemeralKeyPair::generate();
                let shared = key_pair.shared_secret(payload.get(2..42)?).ok()?;
                state.shared = Some(Session::from_shared_secret(&shared).ok()?);
                let mut response = vec![CMD_PUBLIC_KEY, 0x00, self.curve];
                response.extend_from_slice(&key_pair.public_key());
                EncPacket::command(response).encode().ok()
            }
            Some(&CMD_KEY_INFO) => {
                let shared = state.shared.clone()?;
                let mut plain = SRAND.to_vec();
                plain.extend_from_slice(&SEED);
                let mut response = vec![CMD_KEY_INFO];
                response.extend(shared.encrypt(&plain));
                let key = gen_session_key(SEED, &SRAND, &self.table).ok()?;
                state.session = Some(shared.rekey(key));
                EncPacket::command(response).encode().ok()
            }
            _ => None,
        }
    }

    fn handle_packet(&self, state: &mut SimState, packet: Packet) -> Option<Vec<u8>> {
        state.received.push(packet.clone());
        match Command::from_ids(packet.cmd_set(), packet.cmd_id()) {
            Some(Command::AuthStatus) => self.reply(state, &packet, vec![0x00]),
            Some(Command::AutoAuthentication) => {
                let expected = auth_payload(&self.user_id, &self.serial);
                let status = if packet.payload() == expected.as_slice() {
                    self.auth_result
                } else {
                    0x01
                };
                self.reply(state, &packet, vec![status])
            }
            _ => None,
        }
    }
}

#[async_trait]
impl Transport for SimulatedDevice {
    async fn connect(&self) -> Result<mpsc::Receiver<TransportEvent>, TransportError> {
        let mut state = self.state.lock().unwrap();
        state.connects.push(Instant::now());
        {
            let mut failures = self.connect_failures.lock().unwrap();
            if *failures > 0 {
                *failures -= 1;
                return Err(TransportError::NotFound(self.serial.clone()));
            }
        }

        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        state.events = Some(tx);
        state.reassembler.clear();
        state.shared = None;
        state.session = match self.key_strategy {
            KeyStrategy::Ecdh => None,
            KeyStrategy::SerialDerived => Some(Session::from_serial(&self.serial)),
        };
        Ok(rx)
    }

    async fn write(&self, data: &[u8]) -> Result<(), TransportError> {
        let frames = {
            let mut state = self.state.lock().unwrap();
            state.writes.push(Instant::now());
            if state.events.is_none() {
                return Err(TransportError::Disconnected);
            }
            if state.write_failures > 0 {
                state.write_failures -= 1;
                return Err(TransportError::Io("write rejected".to_string()));
            }
            if self.silent {
                return Ok(());
            }
            let session = state.session.clone();
            let candidates = state.reassembler.feed(data, session.as_ref());

            let mut frames = Vec::new();
            for candidate in candidates {
                let response = match candidate {
                    Candidate::Command(payload) => self.handle_command(&mut state, &payload),
                    Candidate::Packet(bytes) => match Packet::decode(&bytes, self.xor_payload) {
                        Ok(packet) => self.handle_packet(&mut state, packet),
                        Err(_) => None,
                    },
                };
                frames.extend(response);
            }
            frames
        };
        self.notify(frames).await;
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        let mut state = self.state.lock().unwrap();
        state.events = None;
        state.session = None;
        Ok(())
    }
}
