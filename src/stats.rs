use std::time::Instant;

use crate::frame::Frame;
use crate::log::vlog;
use crate::proto::command::LineParams;

/// Counters for frames received over a link.
#[derive(Debug, Clone)]
pub struct Stats {
    pub ok: u64,
    pub bad: u64,
    pub lost: u64,
    /// Line errors (framing, parity, overrun, break) latched by the receiver.
    pub line_errors: u64,
    pub bytes: u64,
    /// Bits per character on the line, for the implied bit rate.
    pub bpb: u32,
    expect: Option<u64>,
    t0: Instant,
    last: Instant,
    window_bytes: u64,
}

impl Stats {
    pub fn new(line: &LineParams) -> Self {
        Self {
            ok: 0,
            bad: 0,
            lost: 0,
            line_errors: 0,
            bytes: 0,
            bpb: line.bits_per_byte(),
            expect: None,
            t0: Instant::now(),
            last: Instant::now(),
            window_bytes: 0,
        }
    }

    pub fn add_bytes(&mut self, n: usize) {
        self.bytes += n as u64;
        self.window_bytes += n as u64;
    }

    /// Counts a good frame and any sequence gap before it. Returns the number
    /// of frames lost in the gap.
    pub fn frame(&mut self, f: &Frame) -> u64 {
        self.ok += 1;
        let lost = match self.expect {
            Some(e) if f.seq > e => f.seq - e,
            Some(e) if f.seq < e => 1,
            _ => 0,
        };
        self.lost += lost;
        self.expect = Some(f.seq.wrapping_add(1));
        lost
    }

    pub fn inc_bad(&mut self) {
        self.bad += 1;
    }

    pub fn inc_line_errors(&mut self) {
        self.line_errors += 1;
    }

    /// Frames the receiver never saw after `last_seq` was sent.
    pub fn finish(&mut self, last_seq: u64) {
        if let Some(e) = self.expect {
            self.lost += last_seq.saturating_add(1).saturating_sub(e);
        } else if self.bad == 0 {
            self.lost += last_seq + 1;
        }
    }

    pub fn is_clean(&self) -> bool {
        self.bad == 0 && self.lost == 0 && self.line_errors == 0
    }

    pub fn summary(&self) -> String {
        format!(
            "ok={} bad={} lost={} line_errors={} bytes={}",
            self.ok, self.bad, self.lost, self.line_errors, self.bytes
        )
    }

    pub fn maybe_print(&mut self, interval_s: f64) {
        if self.last.elapsed().as_secs_f64() < interval_s {
            return;
        }
        let dur = self.t0.elapsed().as_secs_f64().max(1e-3);
        let bps_bytes = self.window_bytes as f64 / dur;
        vlog!(
            "probe",
            "{} over {:.1}s => {:.1}kB/s (~{:.0} bps, bpb={})",
            self.summary(),
            dur,
            bps_bytes / 1000.0,
            bps_bytes * f64::from(self.bpb),
            self.bpb
        );
        self.last = Instant::now();
        self.t0 = Instant::now();
        self.window_bytes = 0;
    }
}
