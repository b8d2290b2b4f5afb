//! EcoFlow BLE command line tool
//!
//! Offline decoding of captured frames, session key derivation, and (with
//! the `ble` feature) scanning and watching live devices.

use anyhow::{anyhow, bail, Context};
use clap::{Parser, Subcommand};
use ecoflow_protocol::session::gen_session_key;
use ecoflow_protocol::{EncPacket, FrameType, KeyTable, Packet, Session};
use serde_json::json;
use std::path::{Path, PathBuf};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "ecoflow")]
#[command(about = "Talk to EcoFlow power stations over Bluetooth LE")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[cfg(feature = "ble")]
#[derive(Clone, Copy, clap::ValueEnum)]
enum FramingArg {
    Wrapped,
    RawHeader,
}

#[cfg(feature = "ble")]
#[derive(Clone, Copy, clap::ValueEnum)]
enum KeyStrategyArg {
    Ecdh,
    Serial,
}

#[derive(Subcommand)]
enum Commands {
    /// Decode an outer 5A5A frame
    DecodeFrame {
        /// Frame bytes as hex
        hex: String,
        /// Decrypt protocol frames with the serial-derived session
        #[arg(short, long)]
        serial: Option<String>,
        /// Inner packet payloads are XOR-obfuscated
        #[arg(long)]
        xor: bool,
    },
    /// Decode an inner AA packet
    DecodePacket {
        /// Packet bytes as hex
        hex: String,
        /// Payload is XOR-obfuscated with the first sequence byte
        #[arg(long)]
        xor: bool,
    },
    /// Derive a session key from seed, srand and the key table
    SessionKey {
        /// 2-byte seed as hex
        #[arg(long)]
        seed: String,
        /// 16-byte srand as hex
        #[arg(long)]
        srand: String,
        /// Key table file
        #[arg(long, env = "EF_KEY_TABLE")]
        table: PathBuf,
    },
    /// Scan for nearby devices
    #[cfg(feature = "ble")]
    Scan {
        /// Scan duration in seconds
        #[arg(short, long, default_value = "5")]
        duration: u64,
    },
    /// Connect to a device and print every packet it sends
    #[cfg(feature = "ble")]
    Watch {
        /// Bluetooth address of the device
        #[arg(short, long)]
        address: String,
        /// Device serial number
        #[arg(short, long)]
        serial: String,
        /// Account user id
        #[arg(short, long, env = "EF_USER_ID")]
        user_id: String,
        /// Connection config file (JSON)
        #[arg(short, long)]
        config: Option<PathBuf>,
        #[arg(long, value_enum, default_value = "wrapped")]
        framing: FramingArg,
        #[arg(long, value_enum, default_value = "ecdh")]
        key_strategy: KeyStrategyArg,
        #[arg(long)]
        xor: bool,
    },
}

#[cfg(feature = "ble")]
impl From<FramingArg> for ecoflow_protocol::Framing {
    fn from(arg: FramingArg) -> Self {
        match arg {
            FramingArg::Wrapped => Self::Wrapped,
            FramingArg::RawHeader => Self::RawHeader,
        }
    }
}

#[cfg(feature = "ble")]
impl From<KeyStrategyArg> for ecoflow_protocol::KeyStrategy {
    fn from(arg: KeyStrategyArg) -> Self {
        match arg {
            KeyStrategyArg::Ecdh => Self::Ecdh,
            KeyStrategyArg::Serial => Self::SerialDerived,
        }
    }
}

/// Parse hex with optional whitespace, colons or a 0x prefix
fn parse_hex(s: &str) -> anyhow::Result<Vec<u8>> {
    let mut nibbles = Vec::new();
    for c in s
        .trim()
        .trim_start_matches("0x")
        .chars()
        .filter(|c| !c.is_whitespace() && *c != ':')
    {
        let nibble = c
            .to_digit(16)
            .with_context(|| format!("invalid hex digit {c:?}"))?;
        #[allow(clippy::cast_possible_truncation)]
        nibbles.push(nibble as u8);
    }
    if nibbles.len() % 2 != 0 {
        bail!("odd number of hex digits");
    }
    Ok(nibbles.chunks(2).map(|pair| (pair[0] << 4) | pair[1]).collect())
}

fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn packet_json(packet: &Packet) -> serde_json::Value {
    json!({
        "version": packet.version(),
        "sequence": packet.sequence(),
        "product_id": packet.product_id(),
        "src": format!("{:#04x}", packet.src()),
        "dst": format!("{:#04x}", packet.dst()),
        "dsrc": packet.dsrc(),
        "ddst": packet.ddst(),
        "cmd_set": format!("{:#04x}", packet.cmd_set()),
        "cmd_id": format!("{:#04x}", packet.cmd_id()),
        "payload": to_hex(packet.payload()),
    })
}

fn decode_frame(hex: &str, serial: Option<&str>, xor: bool) -> anyhow::Result<serde_json::Value> {
    let data = parse_hex(hex)?;
    let (frame, used) = EncPacket::decode(&data)?;
    if used < data.len() {
        tracing::warn!("Ignoring {} trailing bytes", data.len() - used);
    }

    let mut out = json!({
        "frame_type": format!("{:?}", frame.frame_type),
        "payload_type": frame.payload_type,
        "payload": to_hex(&frame.payload),
    });
    if let (FrameType::Protocol, Some(serial)) = (frame.frame_type, serial) {
        let plain = Session::from_serial(serial).decrypt(&frame.payload)?;
        out["packet"] = packet_json(&Packet::decode(&plain, xor)?);
    }
    Ok(out)
}

fn session_key(seed: &str, srand: &str, table: &Path) -> anyhow::Result<String> {
    let seed: [u8; 2] = parse_hex(seed)?
        .try_into()
        .map_err(|_| anyhow!("seed must be 2 bytes"))?;
    let srand: [u8; 16] = parse_hex(srand)?
        .try_into()
        .map_err(|_| anyhow!("srand must be 16 bytes"))?;
    let table = KeyTable::from_bytes(
        std::fs::read(table).with_context(|| format!("reading key table {}", table.display()))?,
    );
    Ok(to_hex(&gen_session_key(seed, &srand, &table)?))
}

#[cfg(feature = "ble")]
async fn watch(
    address: String,
    identity: ecoflow_core::DeviceIdentity,
    config: Option<PathBuf>,
    framing: FramingArg,
    key_strategy: KeyStrategyArg,
    xor: bool,
) -> anyhow::Result<()> {
    use ecoflow_core::{ConnectionConfig, DeviceClient, DeviceTable};
    use ecoflow_protocol::ble::BleTransport;
    use std::sync::Arc;

    let config = match config {
        Some(path) => ConnectionConfig::load(&path).await?,
        None => ConnectionConfig::default(),
    }
    .with_env_overrides();
    let key_table = config.load_key_table().await?.map(Arc::new);

    let table = Arc::new(
        DeviceTable::builder("generic")
            .framing(framing.into())
            .key_strategy(key_strategy.into())
            .xor_payload(xor)
            .build(),
    );
    let transport = Arc::new(BleTransport::new(address));
    let client = DeviceClient::new(table, identity, transport, config, key_table);
    let mut packets = client.connection().subscribe();

    client.connect().await?;
    tracing::info!("Authenticated with {}", client.serial());

    loop {
        tokio::select! {
            packet = packets.recv() => match packet {
                Ok(packet) => println!("{}", packet_json(&packet)),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!("Skipped {} packets", n);
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            },
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Interrupted, disconnecting");
                break;
            }
        }
    }
    client.disconnect().await;
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::DecodeFrame { hex, serial, xor } => {
            let out = decode_frame(&hex, serial.as_deref(), xor)?;
            println!("{}", serde_json::to_string_pretty(&out)?);
        }
        Commands::DecodePacket { hex, xor } => {
            let packet = Packet::decode(&parse_hex(&hex)?, xor)?;
            println!("{}", serde_json::to_string_pretty(&packet_json(&packet))?);
        }
        Commands::SessionKey { seed, srand, table } => {
            println!("{}", session_key(&seed, &srand, &table)?);
        }
        #[cfg(feature = "ble")]
        Commands::Scan { duration } => {
            let found = ecoflow_protocol::ble::scan(std::time::Duration::from_secs(duration)).await?;
            println!("Found {} devices:", found.len());
            for device in found {
                let rssi = device
                    .rssi
                    .map_or_else(|| "N/A".to_string(), |r| format!("{r} dBm"));
                println!("  {} ({}) RSSI: {}", device.name, device.address, rssi);
            }
        }
        #[cfg(feature = "ble")]
        Commands::Watch {
            address,
            serial,
            user_id,
            config,
            framing,
            key_strategy,
            xor,
        } => {
            let identity = ecoflow_core::DeviceIdentity { serial, user_id };
            watch(address, identity, config, framing, key_strategy, xor).await?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ecoflow_protocol::Framing;

    #[test]
    fn test_parse_hex_formats() {
        assert_eq!(parse_hex("0xAA13").unwrap(), vec![0xAA, 0x13]);
        assert_eq!(parse_hex("aa:13 fe").unwrap(), vec![0xAA, 0x13, 0xFE]);
        assert!(parse_hex("abc").is_err());
        assert!(parse_hex("zz").is_err());
        assert!(parse_hex("a\u{e9}1").is_err());
        assert!(parse_hex("\u{e9}").is_err());
    }

    #[test]
    fn test_decode_frame_with_serial() {
        let serial = "R331ZEB4ZEAL0528";
        let packet = Packet::new(0x35, 0x21, 0x14, 0x01, vec![31]).with_sequence(7);
        let frame = Framing::Wrapped
            .encode_packet(&packet.encode(true).unwrap(), &Session::from_serial(serial))
            .unwrap();

        let out = decode_frame(&to_hex(&frame), Some(serial), true).unwrap();
        assert_eq!(out["frame_type"], "Protocol");
        assert_eq!(out["packet"]["cmd_set"], "0x14");
        assert_eq!(out["packet"]["payload"], "1f");
    }

    #[test]
    fn test_decode_command_frame() {
        let frame = EncPacket::command(vec![0x02]).encode().unwrap();
        let out = decode_frame(&to_hex(&frame), None, false).unwrap();
        assert_eq!(out["frame_type"], "Command");
        assert_eq!(out["payload"], "02");
        assert!(out.get("packet").is_none());
    }
}
