//! Log lines for the service, written through [`tlog!`]:
//!
//! ```text
//! 20261019T21:33:12.000 - src/executor.rs:88 - s-Q2hfX1a SMS: attempt 2 failed, retrying in 2000ms
//! ```
//!
//! Ids are shortened and, on a terminal, coloured by content so the lines
//! of one session stand out.  PINs, phone numbers and coordinates are never
//! logged; the helpers here are the way identifiers enter a line.
//!
//! Output goes to stderr until [`set_writer`] installs another sink, which
//! also turns colour off.

use std::io::{self, IsTerminal, Write};
use std::sync::{LazyLock, Mutex, MutexGuard};
use std::time::{SystemTime, UNIX_EPOCH};

struct Sink {
    out: Box<dyn Write + Send>,
    colour: bool,
}

static SINK: LazyLock<Mutex<Sink>> = LazyLock::new(|| {
    Mutex::new(Sink {
        out: Box::new(io::stderr()),
        colour: false,
    })
});

fn sink() -> MutexGuard<'static, Sink> {
    SINK.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Turn on colour when stderr is a terminal.  Run once from `main`.
pub fn init() {
    sink().colour = io::stderr().is_terminal();
}

/// Send all further output to `out`, uncoloured.
pub fn set_writer(out: Box<dyn Write + Send>) {
    let mut sink = sink();
    sink.out = out;
    sink.colour = false;
}

pub fn colour_enabled() -> bool {
    sink().colour
}

const RESET: &str = "\x1b[0m";
const DIM: &str = "\x1b[2m";

/// SGR foreground codes readable on dark and light terminals.
const ID_COLOURS: [u8; 10] = [91, 92, 93, 94, 95, 96, 32, 34, 35, 36];

fn colour_code(id: &str) -> u8 {
    let hash = id
        .bytes()
        .fold(5381u32, |h, b| h.wrapping_mul(33) ^ u32::from(b));
    ID_COLOURS[hash as usize % ID_COLOURS.len()]
}

/// Characters of an id kept in log lines.
const SHORT_ID_CHARS: usize = 7;

fn short_id(id: &str) -> &str {
    match id.char_indices().nth(SHORT_ID_CHARS) {
        Some((cut, _)) => &id[..cut],
        None => id,
    }
}

fn tagged(prefix: &str, id: &str) -> String {
    let short = short_id(id);
    match colour_enabled() {
        true => format!("\x1b[{}m{prefix}-{short}{RESET}", colour_code(id)),
        false => format!("{prefix}-{short}"),
    }
}

/// Format a session id, e.g. `s-Q2hfX1a`.
pub fn session_id(id: &str) -> String {
    tagged("s", id)
}

/// Format an owner id, e.g. `u-alice`. Anonymous sessions render as `u-anon`.
pub fn owner_id(id: Option<&str>) -> String {
    match id {
        Some(id) => tagged("u", id),
        None => "u-anon".to_string(),
    }
}

/// Format a realtime connection id, e.g. `c-12`.
pub fn connection_id(id: u64) -> String {
    tagged("c", &id.to_string())
}

/// Refer to a contact by position only; names and numbers stay out of logs.
pub fn contact(index: usize) -> String {
    format!("contact#{index}")
}

fn is_leap(year: u64) -> bool {
    (year % 4 == 0 && year % 100 != 0) || year % 400 == 0
}

/// `(year, month, day)` for a count of days since 1970-01-01.
fn civil_date(mut days: u64) -> (u64, u64, u64) {
    let mut year = 1970;
    loop {
        let len = if is_leap(year) { 366 } else { 365 };
        if days < len {
            break;
        }
        days -= len;
        year += 1;
    }
    let february = if is_leap(year) { 29 } else { 28 };
    let months = [31, february, 31, 30, 31, 30, 31, 31, 30, 31, 30, 31];
    let mut month = 1;
    for len in months {
        if days < len {
            break;
        }
        days -= len;
        month += 1;
    }
    (year, month, days + 1)
}

/// Render milliseconds since the epoch as `YYYYMMDDTHH:MM:SS.mmm` (UTC).
pub fn format_millis(epoch_millis: u64) -> String {
    let secs = epoch_millis / 1000;
    let (year, month, day) = civil_date(secs / 86_400);
    let of_day = secs % 86_400;
    format!(
        "{year:04}{month:02}{day:02}T{:02}:{:02}:{:02}.{:03}",
        of_day / 3600,
        of_day % 3600 / 60,
        of_day % 60,
        epoch_millis % 1000
    )
}

/// The current wall-clock time in [`format_millis`] form.
pub fn format_timestamp() -> String {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default();
    format_millis(millis)
}

#[doc(hidden)]
pub fn emit(file: &str, line: u32, msg: &str) {
    let stamp = format_timestamp();
    let mut sink = sink();
    let rendered = match sink.colour {
        true => format!("{DIM}{stamp} {file}:{line}{RESET} {msg}"),
        false => format!("{stamp} - {file}:{line} - {msg}"),
    };
    let _ = writeln!(sink.out, "{rendered}");
}

/// Emit a log line with timestamp and source location.
///
/// ```ignore
/// tlog!("trigger: created {}", logging::session_id(&id));
/// ```
#[macro_export]
macro_rules! tlog {
    ($($arg:tt)*) => {{
        $crate::logging::emit(file!(), line!(), &format!($($arg)*));
    }};
}
