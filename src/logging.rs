use std::fmt;
use std::sync::{Arc, Once, RwLock};

use env_logger::Env;
use log::{Level, LevelFilter};

static RUST_LOG_ONCE: Once = Once::new();

fn env_level() -> LevelFilter {
    std::env::var("MICRONIR_LOG")
        .or_else(|_| std::env::var("RUST_LOG"))
        .ok()
        .as_deref()
        .and_then(|v| v.parse::<LevelFilter>().ok())
        .unwrap_or(LevelFilter::Info)
}

fn level_to_str(level: LevelFilter) -> &'static str {
    match level {
        LevelFilter::Off => "off",
        LevelFilter::Error => "error",
        LevelFilter::Warn => "warn",
        LevelFilter::Info => "info",
        LevelFilter::Debug => "debug",
        LevelFilter::Trace => "trace",
    }
}

/// Initialize logging for Rust binaries (stderr formatter) based on `MICRONIR_LOG`/`RUST_LOG`.
pub fn init_rust_logging() {
    let level = env_level();
    RUST_LOG_ONCE.call_once(|| {
        let env = Env::default().default_filter_or(level_to_str(level));
        env_logger::Builder::from_env(env)
            .format_timestamp_millis()
            .format_module_path(true)
            .format_target(true)
            .init();
    });
}

/// Receiver for free-text diagnostic lines (TX, RX, timeouts, negotiation progress).
#[derive(Clone)]
pub struct LogSink(Arc<dyn Fn(&str) + Send + Sync>);

impl LogSink {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        Self(Arc::new(f))
    }

    pub fn emit(&self, line: &str) {
        (self.0)(line)
    }
}

impl fmt::Debug for LogSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("LogSink(..)")
    }
}

/// Diagnostic channel shared by the negotiator, the controller and the driver.
///
/// Every line goes to the `log` facade and, when registered, to the sink.
/// Registering a new sink replaces the previous one.
#[derive(Clone, Default)]
pub struct DiagnosticLog {
    sink: Arc<RwLock<Option<LogSink>>>,
}

impl DiagnosticLog {
    pub fn new(sink: Option<LogSink>) -> Self {
        Self {
            sink: Arc::new(RwLock::new(sink)),
        }
    }

    pub fn set_sink(&self, sink: Option<LogSink>) {
        if let Ok(mut slot) = self.sink.write() {
            *slot = sink;
        }
    }

    pub fn line(&self, level: Level, msg: impl AsRef<str>) {
        let msg = msg.as_ref();
        log::log!(target: "micronir", level, "{}", msg);
        let sink = self.sink.read().ok().and_then(|s| s.clone());
        if let Some(sink) = sink {
            sink.emit(msg);
        }
    }

    pub fn info(&self, msg: impl AsRef<str>) {
        self.line(Level::Info, msg)
    }

    pub fn warn(&self, msg: impl AsRef<str>) {
        self.line(Level::Warn, msg)
    }

    pub fn error(&self, msg: impl AsRef<str>) {
        self.line(Level::Error, msg)
    }

    pub fn debug(&self, msg: impl AsRef<str>) {
        self.line(Level::Debug, msg)
    }

    pub fn tx(&self, label: &str) {
        self.info(format!("TX -> {label}"))
    }

    pub fn rx(&self, bytes: &[u8]) {
        self.info(format!("RX << {}", render_bytes(bytes)))
    }
}

impl fmt::Debug for DiagnosticLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DiagnosticLog").finish_non_exhaustive()
    }
}

/// Render bytes as `[HEX HEX ..] ascii`, with non-printable bytes shown as `.`.
pub fn render_bytes(bytes: &[u8]) -> String {
    let hex = bytes
        .iter()
        .map(|b| format!("{b:02X}"))
        .collect::<Vec<_>>()
        .join(" ");
    let ascii: String = bytes
        .iter()
        .map(|&c| if (32..=126).contains(&c) { c as char } else { '.' })
        .collect();
    format!("[{hex}] {ascii}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn renders_hex_and_printable_ascii() {
        assert_eq!(render_bytes(&[0x56, 0x31, 0x00, 0x7F]), "[56 31 00 7F] V1..");
        assert_eq!(render_bytes(&[]), "[] ");
    }

    #[test]
    fn replacing_the_sink_overwrites_instead_of_stacking() {
        let first = Arc::new(Mutex::new(Vec::<String>::new()));
        let second = Arc::new(Mutex::new(Vec::<String>::new()));

        let f = first.clone();
        let log = DiagnosticLog::new(Some(LogSink::new(move |l| {
            f.lock().unwrap().push(l.to_string())
        })));
        log.info("one");

        let s = second.clone();
        log.set_sink(Some(LogSink::new(move |l| {
            s.lock().unwrap().push(l.to_string())
        })));
        log.info("two");

        assert_eq!(*first.lock().unwrap(), vec!["one"]);
        assert_eq!(*second.lock().unwrap(), vec!["two"]);
    }

    #[test]
    fn rx_lines_carry_both_renderings() {
        let lines = Arc::new(Mutex::new(Vec::<String>::new()));
        let l = lines.clone();
        let log = DiagnosticLog::new(Some(LogSink::new(move |m| {
            l.lock().unwrap().push(m.to_string())
        })));
        log.rx(b"OK");
        assert_eq!(lines.lock().unwrap()[0], "RX << [4F 4B] OK");
    }
}
