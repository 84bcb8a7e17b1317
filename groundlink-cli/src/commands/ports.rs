//! Serial port listing.

use anyhow::Result;
use console::style;
use groundlink::device::format_port_list;
use groundlink::{DetectedPort, auto_detect_port, detect_ports};

use crate::use_fancy_output;

fn port_json(port: &DetectedPort) -> serde_json::Value {
    serde_json::json!({
        "name": port.name,
        "device": port.device.name(),
        "known": port.device.is_known(),
        "flight_controller": port.device.is_flight_controller(),
        "protocol": port.device.protocol_hint().map(|p| format!("{p:?}").to_lowercase()),
        "vid": port.vid,
        "pid": port.pid,
        "manufacturer": port.manufacturer,
        "product": port.product,
        "serial": port.serial,
    })
}

/// List ports command implementation.
pub(crate) fn cmd_list_ports(json: bool) -> Result<()> {
    let detected = detect_ports();

    if json {
        let ports: Vec<serde_json::Value> = detected.iter().map(port_json).collect();
        println!("{}", serde_json::to_string_pretty(&ports)?);
        return Ok(());
    }

    eprintln!("{}", style("Available serial ports:").bold().underlined());

    if detected.is_empty() {
        eprintln!("  {}", style("No serial ports found").dim());
        return Ok(());
    }

    if !use_fancy_output() {
        for line in format_port_list(&detected) {
            eprintln!("  {line}");
        }
        return Ok(());
    }

    for port in &detected {
        let device_type = if port.device.is_known() {
            format!(" [{}]", style(port.device.name()).yellow())
        } else {
            String::new()
        };
        let vid_pid = if let (Some(vid), Some(pid)) = (port.vid, port.pid) {
            format!(" ({vid:04X}:{pid:04X})")
        } else {
            String::new()
        };
        let product = port
            .product
            .as_deref()
            .map(|p| format!(" - {}", style(p).dim()))
            .unwrap_or_default();

        eprintln!(
            "  {} {}{device_type}{vid_pid}{product}",
            style("•").green(),
            style(&port.name).cyan(),
        );
    }

    if let Ok(auto_port) = auto_detect_port() {
        eprintln!(
            "\n{} Auto-detected: {}",
            style("→").green().bold(),
            style(&auto_port.name).cyan().bold()
        );
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use groundlink::DeviceKind;

    #[test]
    fn test_port_json_fields() {
        let port = DetectedPort {
            vid: Some(0x1209),
            pid: Some(0x5740),
            device: DeviceKind::ArduPilot,
            product: Some("CubeOrange".into()),
            ..DetectedPort::plain("/dev/ttyACM0")
        };
        let value = port_json(&port);
        assert_eq!(value["name"], "/dev/ttyACM0");
        assert_eq!(value["device"], "ArduPilot");
        assert_eq!(value["known"], true);
        assert_eq!(value["flight_controller"], true);
        assert_eq!(value["protocol"], "mavlink");
        assert_eq!(value["vid"], 0x1209);
        assert_eq!(value["product"], "CubeOrange");
        assert!(value["serial"].is_null());
    }

    #[test]
    fn test_port_json_unknown() {
        let value = port_json(&DetectedPort::plain("/dev/ttyS0"));
        assert_eq!(value["known"], false);
        assert!(value["protocol"].is_null());
        assert!(value["vid"].is_null());
    }
}
