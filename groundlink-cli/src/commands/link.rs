//! MAVLink sniffing and MSP requests over a [`Link`].

use anyhow::{Context, Result};
use console::style;
use groundlink::protocol::mavlink::{LengthPolicy, ParserOptions, SigningVerification};
use groundlink::{
    Endpoint, Link, LinkEvent, MavlinkPacket, MessageRegistry, MspFrame, TransportConfig,
};
use log::debug;
use std::time::{Duration, Instant};

use crate::{Cli, CliError, was_interrupted};

/// Resolved `mavlink sniff` arguments.
#[derive(Debug, Clone, Default)]
pub(crate) struct SniffArgs {
    pub(crate) count: Option<usize>,
    pub(crate) strict: bool,
    pub(crate) signing_key: Option<String>,
    pub(crate) json: bool,
}

/// Decode a 32-byte signing key from hex.
pub(crate) fn parse_signing_key(text: &str) -> Result<Vec<u8>> {
    let key = hex::decode(text.trim())
        .map_err(|e| CliError::Usage(format!("Invalid signing key hex: {e}")))?;
    if key.len() != 32 {
        return Err(CliError::Usage(format!(
            "Signing key must be 32 bytes, got {}",
            key.len()
        ))
        .into());
    }
    Ok(key)
}

fn parser_options(args: &SniffArgs) -> Result<ParserOptions> {
    let policy = if args.strict {
        LengthPolicy::Strict
    } else {
        LengthPolicy::AllowV2Truncation
    };
    let mut options = ParserOptions::default().with_length_policy(policy);
    if let Some(text) = &args.signing_key {
        let key = parse_signing_key(text)?;
        options = options.with_signing(SigningVerification::new(&key)?.with_allow_unsigned(false));
    }
    Ok(options)
}

fn message_name<'a>(registry: &'a MessageRegistry, packet: &MavlinkPacket) -> &'a str {
    registry
        .get(packet.msgid())
        .map_or("UNKNOWN", |info| info.name.as_ref())
}

pub(crate) fn format_packet(registry: &MessageRegistry, packet: &MavlinkPacket) -> String {
    format!(
        "seq={:>3} sys={:>3} comp={:>3} {} ({}) len={}{}{}",
        packet.seq(),
        packet.sysid(),
        packet.compid(),
        message_name(registry, packet),
        packet.msgid(),
        packet.payload_length(),
        if packet.is_mavlink2() { " v2" } else { " v1" },
        if packet.is_signed() { " signed" } else { "" },
    )
}

pub(crate) fn packet_json(registry: &MessageRegistry, packet: &MavlinkPacket) -> serde_json::Value {
    serde_json::json!({
        "seq": packet.seq(),
        "sysid": packet.sysid(),
        "compid": packet.compid(),
        "msgid": packet.msgid(),
        "name": message_name(registry, packet),
        "version": if packet.is_mavlink2() { 2 } else { 1 },
        "signed": packet.is_signed(),
        "payload": hex::encode(packet.payload()),
    })
}

/// `mavlink sniff` implementation.
pub(crate) fn cmd_mavlink_sniff(cli: &Cli, endpoint: &Endpoint, args: &SniffArgs) -> Result<()> {
    let options = parser_options(args)?;
    let registry = MessageRegistry::common();
    let mut link = Link::connect(endpoint, TransportConfig::default(), registry.clone())
        .with_context(|| format!("Failed to open {endpoint}"))?
        .with_parser_options(options);

    if !cli.quiet {
        eprintln!("{} Listening on {endpoint}", style("📡").cyan());
    }

    let mut seen = 0usize;
    'outer: while !was_interrupted() {
        for event in link.poll()? {
            let LinkEvent::Mavlink(packet) = event else {
                continue;
            };
            if args.json {
                println!("{}", packet_json(&registry, &packet));
            } else {
                println!("{}", format_packet(&registry, &packet));
            }
            seen += 1;
            if args.count.is_some_and(|limit| seen >= limit) {
                break 'outer;
            }
        }
    }

    let stats = link.mavlink_stats();
    if !cli.quiet {
        eprintln!(
            "{} {} frames, {} bad CRC, {} bad length, {} bad signature, {} unknown",
            style("ℹ").blue(),
            stats.packets_received,
            stats.bad_crc,
            stats.bad_length,
            stats.bad_signature,
            stats.unknown_message
        );
    }
    link.close()?;
    Ok(())
}

/// Wait for the reply to `command`.
fn await_reply<T: groundlink::Transport>(
    link: &mut Link<T>,
    command: u16,
    timeout: Duration,
) -> Result<MspFrame> {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if was_interrupted() {
            return Err(CliError::Cancelled("Interrupted".to_string()).into());
        }
        for event in link.poll()? {
            match event {
                LinkEvent::Msp(frame) if frame.command == command => return Ok(frame),
                LinkEvent::Msp(frame) => debug!("Ignoring MSP reply for {}", frame.command),
                LinkEvent::Mavlink(_) => {},
            }
        }
    }
    Err(groundlink::Error::Timeout(format!("no reply to MSP command {command}")).into())
}

/// `msp request` implementation.
pub(crate) fn cmd_msp_request(
    endpoint: &Endpoint,
    command: u16,
    payload: &[u8],
    force_v2: bool,
    timeout: Duration,
) -> Result<()> {
    let mut link = Link::connect(endpoint, TransportConfig::default(), MessageRegistry::common())
        .with_context(|| format!("Failed to open {endpoint}"))?
        .with_force_msp_v2(force_v2);

    link.send_msp(command, payload)?;
    let reply = await_reply(&mut link, command, timeout)?;
    link.close()?;

    if reply.is_error() {
        anyhow::bail!("Flight controller rejected MSP command {command}");
    }
    println!("{}", hex::encode(&reply.payload));
    Ok(())
}
