//! Raw hex monitor.
//!
//! Bytes arrive through a [`TransportDispatcher`] listener and are printed
//! as 16-byte hex dump rows on stdout; status lines go to stderr.

use anyhow::{Context, Result};
use console::style;
use groundlink::{Endpoint, TransportConfig, TransportDispatcher};
use log::warn;
use std::sync::mpsc;

use crate::{Cli, was_interrupted};

const ROW: usize = 16;

/// One hex dump row: offset, hex bytes, printable ASCII.
pub(crate) fn hex_dump_row(offset: usize, bytes: &[u8]) -> String {
    let mut hex = String::with_capacity(ROW * 3 + 1);
    for i in 0..ROW {
        if i == ROW / 2 {
            hex.push(' ');
        }
        match bytes.get(i) {
            Some(b) => hex.push_str(&format!("{b:02x} ")),
            None => hex.push_str("   "),
        }
    }
    let ascii: String = bytes
        .iter()
        .map(|&b| if b.is_ascii_graphic() || b == b' ' { b as char } else { '.' })
        .collect();
    format!("{offset:08x}  {hex} |{ascii}|")
}

/// Accumulates bytes and emits complete rows.
#[derive(Debug, Default)]
pub(crate) struct HexDumper {
    offset: usize,
    pending: Vec<u8>,
}

impl HexDumper {
    /// Add bytes and return every row that is now complete.
    pub(crate) fn push(&mut self, data: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(data);
        let mut rows = Vec::new();
        while self.pending.len() >= ROW {
            let row: Vec<u8> = self.pending.drain(..ROW).collect();
            rows.push(hex_dump_row(self.offset, &row));
            self.offset += ROW;
        }
        rows
    }

    /// Emit the trailing partial row, if any.
    pub(crate) fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let row = hex_dump_row(self.offset, &self.pending);
        self.offset += self.pending.len();
        self.pending.clear();
        Some(row)
    }
}

/// `monitor` implementation.
pub(crate) fn cmd_monitor(cli: &Cli, endpoint: &Endpoint, limit: Option<usize>) -> Result<()> {
    let transport = endpoint
        .connect(TransportConfig::default())
        .with_context(|| format!("Failed to open {endpoint}"))?;

    if !cli.quiet {
        eprintln!("{} Monitoring {endpoint}", style("📡").cyan());
        eprintln!("{}", style("Press Ctrl+C to exit").dim());
    }

    let (tx, rx) = mpsc::channel::<Vec<u8>>();
    let mut dispatcher = TransportDispatcher::new(transport);
    dispatcher.on_data(move |chunk| {
        let _ = tx.send(chunk.to_vec());
    });
    dispatcher.on_error(|e| warn!("Link dropped: {e}"));

    let mut dumper = HexDumper::default();
    let mut total = 0usize;
    let result = loop {
        if was_interrupted() {
            break Ok(());
        }
        if let Err(e) = dispatcher.pump() {
            break Err(e);
        }
        let mut done = false;
        for mut chunk in rx.try_iter() {
            if let Some(limit) = limit {
                chunk.truncate(limit.saturating_sub(total));
                done = total + chunk.len() >= limit;
            }
            total += chunk.len();
            for row in dumper.push(&chunk) {
                println!("{row}");
            }
            if done {
                break;
            }
        }
        if done {
            break Ok(());
        }
    };

    if let Some(row) = dumper.finish() {
        println!("{row}");
    }
    if !cli.quiet {
        eprintln!("{} {total} bytes received", style("ℹ").blue());
    }
    result.context("Monitor stopped")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hex_dump_full_row() {
        let row = hex_dump_row(0x20, b"$M>\x06\x6cABCDEFGHIJK");
        assert_eq!(
            row,
            "00000020  24 4d 3e 06 6c 41 42 43  44 45 46 47 48 49 4a 4b  |$M>.lABCDEFGHIJK|"
        );
    }

    #[test]
    fn test_hex_dump_partial_row_is_padded() {
        let row = hex_dump_row(0, &[0xFD, 0x09]);
        assert!(row.starts_with("00000000  fd 09 "));
        assert!(row.ends_with("|..|"));
        assert_eq!(row.len(), hex_dump_row(0, &[0u8; 16]).len() - 14);
    }

    #[test]
    fn test_dumper_splits_rows_across_chunks() {
        let mut dumper = HexDumper::default();
        assert!(dumper.push(&[1u8; 10]).is_empty());
        let rows = dumper.push(&[2u8; 30]);
        assert_eq!(rows.len(), 2);
        assert!(rows[1].starts_with("00000010"));
        let tail = dumper.finish().unwrap();
        assert!(tail.starts_with("00000020"));
        assert!(dumper.finish().is_none());
    }
}
