use std::{io, sync::Once, thread, time::Instant};

use base64::{engine::general_purpose::STANDARD_NO_PAD, Engine};
use log::LevelFilter;

static LOGGER_INIT: Once = Once::new();

// Set up a logger that prints messages with level `level` and above. Lines read
// `[elapsed][thread][level][component] message`, where `component` is the pof_rs module that logged,
// e.g. `observer::implementation` or `block_sync::client`.
pub(crate) fn setup_logger(level: LevelFilter) {
    LOGGER_INIT.call_once(|| {
        let start = Instant::now();
        fern::Dispatch::new()
            .format(move |out, message, record| {
                let target = record.target();
                let current = thread::current();
                out.finish(format_args!(
                    "[{:>6}ms][{}][{:<5}][{}] {}",
                    start.elapsed().as_millis(),
                    current
                        .name()
                        .map(str::to_string)
                        .unwrap_or_else(|| format!("{:?}", current.id())),
                    record.level(),
                    target.strip_prefix("pof_rs::").unwrap_or(target),
                    message
                ))
            })
            .level(level)
            .chain(io::stdout())
            .apply()
            .unwrap();
    })
}

/// How test logs name a node: its role followed by an abbreviation of its key or address.
pub(crate) fn node_name(role: &str, id: &[u8]) -> String {
    format!("{}:{}", role, short_id(id))
}

// Abbreviate a hash, key or address to the first 7 characters of its base64 encoding, the same way the
// library's event logs do, so test lines can be matched against `CommitBlock` and `GenerateBlock` lines.
pub(crate) fn short_id(bytes: &[u8]) -> String {
    let encoded = STANDARD_NO_PAD.encode(bytes);
    if encoded.len() > 7 {
        encoded[0..7].to_string()
    } else {
        encoded
    }
}
