use crate::proto::command::LineParams;
use crate::proto::wire::{
    CHECK_BAUD, CHECK_DATA_SIZE, CHECK_FLOWCTRL, CHECK_PARITY, CHECK_STOP_BITS,
};

/// Errors a receiver would see when bytes arrive with other line settings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CheckOutcome {
    pub framing: bool,
    pub parity: bool,
    pub overrun: bool,
    /// Names of the enabled checks that failed.
    pub failed: Vec<&'static str>,
}

impl CheckOutcome {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Compares sender and receiver settings for every check bit set in
/// `checks` (the receiver's flags).
///
/// Baud, data size and stop bit mismatches garble character framing. A
/// parity mismatch shows up as parity errors, a flow control mismatch as
/// overruns on the side that does not throttle.
pub fn evaluate(checks: u64, sender: &LineParams, receiver: &LineParams) -> CheckOutcome {
    let mut out = CheckOutcome::default();
    let mut fail = |name: &'static str| out.failed.push(name);

    if checks & CHECK_BAUD != 0 && sender.baud != receiver.baud {
        fail("baud");
    }
    if checks & CHECK_DATA_SIZE != 0 && sender.data_bits != receiver.data_bits {
        fail("data-size");
    }
    if checks & CHECK_STOP_BITS != 0 && sender.stop_bits != receiver.stop_bits {
        fail("stop-bits");
    }
    if checks & CHECK_PARITY != 0 && sender.parity != receiver.parity {
        fail("parity");
    }
    if checks & CHECK_FLOWCTRL != 0 && sender.flow != receiver.flow {
        fail("flow-control");
    }

    for name in &out.failed {
        match *name {
            "parity" => out.parity = true,
            "flow-control" => out.overrun = true,
            _ => out.framing = true,
        }
    }
    out
}
