use std::sync::atomic::{AtomicBool, Ordering};

/// Gate for `vdebug!` output, set from `--debug`.
pub static DEBUG: AtomicBool = AtomicBool::new(false);

pub fn set_debug(on: bool) {
    DEBUG.store(on, Ordering::Relaxed);
}

pub fn debug_enabled() -> bool {
    DEBUG.load(Ordering::Relaxed)
}

pub fn timestamp() -> String {
    chrono::Local::now().format("%H:%M:%S%.3f").to_string()
}

/// Timestamped logging to stderr. The first argument is the component tag.
///
/// ```ignore
/// vlog!("uc", "dispatch {}", cmd);   // 12:00:01.042 [uc] dispatch LinkPorts
/// ```
macro_rules! vlog {
    ($tag:literal, $($arg:tt)*) => {{
        eprintln!("{} [{}] {}", $crate::log::timestamp(), $tag, format_args!($($arg)*));
    }};
}

/// Like `vlog!`, only printed when debug output is enabled.
macro_rules! vdebug {
    ($tag:literal, $($arg:tt)*) => {{
        if $crate::log::debug_enabled() {
            $crate::log::vlog!($tag, $($arg)*);
        }
    }};
}

pub(crate) use {vdebug, vlog};
