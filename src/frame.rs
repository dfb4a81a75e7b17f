//! Framed test lines pushed through a port link by the probe.
//!
//! `@@ SEQ=<n> LEN=<bytes> PAY=<hex> SUM=<hex8> ##\r\n`, payload byte `i` is
//! `(i + seq) & 0xFF` so the receiver can spot corruption without knowing
//! what was sent.

use anyhow::{Context, Result, anyhow, bail};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub seq: u64,
    pub payload: Vec<u8>,
}

pub fn checksum(payload: &[u8]) -> u8 {
    payload.iter().fold(0u8, |s, b| s.wrapping_add(*b))
}

pub fn pattern(seq: u64, len: usize) -> Vec<u8> {
    (0..len).map(|i| ((i as u64 + seq) & 0xFF) as u8).collect()
}

/// Builds the line for frame `seq`, terminator included.
pub fn build_frame(seq: u64, len: usize) -> Vec<u8> {
    let payload = pattern(seq, len);
    format!(
        "@@ SEQ={seq} LEN={len} PAY={} SUM={:02X} ##\r\n",
        hex::encode_upper(&payload),
        checksum(&payload)
    )
    .into_bytes()
}

/// Parses and verifies one line (without terminator). Field order is free
/// and the `@@`/`##` markers are optional.
pub fn parse_frame(line: &str) -> Result<Frame> {
    let mut seq = None;
    let mut len = None;
    let mut pay = None;
    let mut sum = None;
    for tok in line.split_whitespace() {
        if let Some(v) = tok.strip_prefix("SEQ=") {
            seq = Some(v.parse::<u64>().context("bad SEQ")?);
        } else if let Some(v) = tok.strip_prefix("LEN=") {
            len = Some(v.parse::<usize>().context("bad LEN")?);
        } else if let Some(v) = tok.strip_prefix("PAY=") {
            pay = Some(hex::decode(v).context("bad hex in PAY")?);
        } else if let Some(v) = tok.strip_prefix("SUM=") {
            sum = Some(u8::from_str_radix(v, 16).context("bad SUM")?);
        }
    }
    let seq = seq.ok_or_else(|| anyhow!("no SEQ"))?;
    let len = len.ok_or_else(|| anyhow!("no LEN"))?;
    let payload = pay.ok_or_else(|| anyhow!("no PAY"))?;
    let sum = sum.ok_or_else(|| anyhow!("no SUM"))?;

    if payload.len() != len {
        bail!("len mismatch: LEN={len}, {} bytes", payload.len());
    }
    let calc = checksum(&payload);
    if calc != sum {
        bail!("checksum {calc:02X}!={sum:02X}");
    }
    if payload != pattern(seq, len) {
        bail!("payload does not match pattern for SEQ={seq}");
    }
    Ok(Frame { seq, payload })
}

/// Reassembles lines from the chunks an RX FIFO hands out.
#[derive(Debug, Default)]
pub struct LineSplitter {
    buf: Vec<u8>,
}

impl LineSplitter {
    /// Adds received bytes and returns every line they complete, with the
    /// `\r\n` stripped.
    pub fn push(&mut self, data: &[u8]) -> Vec<String> {
        self.buf.extend_from_slice(data);
        let mut lines = Vec::new();
        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            let raw: Vec<u8> = self.buf.drain(..=pos).collect();
            let text = String::from_utf8_lossy(&raw);
            lines.push(text.trim_end_matches(['\r', '\n']).to_string());
        }
        lines
    }

    /// Bytes of an incomplete trailing line.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_then_parse() {
        let line = String::from_utf8(build_frame(42, 8)).unwrap();
        assert!(line.ends_with("##\r\n"));
        let f = parse_frame(line.trim_end()).unwrap();
        assert_eq!(f.seq, 42);
        assert_eq!(f.payload, pattern(42, 8));
    }

    #[test]
    fn corruption_is_caught() {
        let line = String::from_utf8(build_frame(1, 4)).unwrap();
        // 01020304 -> 01020305, sum no longer matches
        let bad = line.replace("PAY=01020304", "PAY=01020305");
        assert!(parse_frame(&bad).unwrap_err().to_string().contains("checksum"));

        let short = line.replace("LEN=4", "LEN=5");
        assert!(parse_frame(&short).is_err());
        assert!(parse_frame("SEQ=1 LEN=0 SUM=00").is_err());
    }

    #[test]
    fn splitter_joins_chunks() {
        let mut s = LineSplitter::default();
        let a = build_frame(0, 3);
        let b = build_frame(1, 3);
        let (head, tail) = a.split_at(5);

        assert!(s.push(head).is_empty());
        assert_eq!(s.pending(), 5);
        let mut rest = tail.to_vec();
        rest.extend_from_slice(&b[..4]);
        let lines = s.push(&rest);
        assert_eq!(lines.len(), 1);
        assert_eq!(parse_frame(&lines[0]).unwrap().seq, 0);
        assert_eq!(s.push(&b[4..]).len(), 1);
        assert_eq!(s.pending(), 0);
    }
}
