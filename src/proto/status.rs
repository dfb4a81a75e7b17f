use thiserror::Error;

const fn common_err(code: u32) -> u32 {
    0xE000_0000 | code
}

/// Result codes carried in `status.code`. Numbering follows the IOKit common
/// error space so codes stay recognizable in driver logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[repr(u32)]
pub enum StatusCode {
    #[error("success")]
    Success = 0,
    #[error("general error")]
    Error = common_err(0x2BC),
    #[error("memory allocation failed")]
    NoMemory = common_err(0x2BD),
    #[error("invalid data")]
    Invalid = common_err(0x2C1),
    #[error("bad argument")]
    BadArgument = common_err(0x2C2),
    #[error("capacity exceeded")]
    CapacityExceeded = common_err(0x2C4),
    #[error("ports already linked")]
    AlreadyLinked = common_err(0x2C5),
    #[error("I/O error")]
    IoError = common_err(0x2CA),
    #[error("port busy")]
    PortBusy = common_err(0x2D5),
    #[error("not permitted")]
    NotPermitted = common_err(0x2E2),
    #[error("not responding")]
    NotResponding = common_err(0x2ED),
    #[error("not found")]
    NotFound = common_err(0x2F0),
}

impl StatusCode {
    const ALL: [StatusCode; 12] = [
        StatusCode::Success,
        StatusCode::Error,
        StatusCode::NoMemory,
        StatusCode::Invalid,
        StatusCode::BadArgument,
        StatusCode::CapacityExceeded,
        StatusCode::AlreadyLinked,
        StatusCode::IoError,
        StatusCode::PortBusy,
        StatusCode::NotPermitted,
        StatusCode::NotResponding,
        StatusCode::NotFound,
    ];

    pub fn raw(self) -> u32 {
        self as u32
    }

    /// Unknown codes collapse into `Error`.
    pub fn from_raw(v: u32) -> Self {
        StatusCode::ALL
            .iter()
            .copied()
            .find(|c| c.raw() == v)
            .unwrap_or(StatusCode::Error)
    }

    pub fn is_success(self) -> bool {
        self == StatusCode::Success
    }

    /// Split into (system, subsystem, code) like `err_get_system` and friends.
    pub fn parts(self) -> (u32, u32, u32) {
        let v = self.raw();
        ((v >> 26) & 0x3F, (v >> 14) & 0xFFF, v & 0x3FFF)
    }
}
