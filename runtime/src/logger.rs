use std::sync::Once;
use std::time::SystemTime;

use log::{Level, LevelFilter};
use nu_ansi_term::ansi::RESET;
use nu_ansi_term::{Color, Style};

struct Logger;

impl log::Log for Logger {
	fn enabled(&self, _: &log::Metadata) -> bool {
		true
	}

	fn log(&self, record: &log::Record) {
		let time = humantime::format_rfc3339_nanos(SystemTime::now());

		let dim = Style::new().dimmed().prefix();

		eprintln!(
			"{dim}{time}{RESET} {}{:5}{RESET} {}{}{RESET}{dim}:{RESET} {}",
			match record.level() {
				Level::Trace => Color::Purple,
				Level::Debug => Color::Blue,
				Level::Info => Color::Green,
				Level::Warn => Color::Yellow,
				Level::Error => Color::Red,
			}
			.bold()
			.prefix(),
			record.level(),
			Style::new().bold().prefix(),
			record.target(),
			record.args()
		);
	}

	fn flush(&self) {}
}

static INIT: Once = Once::new();

/// Installs the process-wide logger and reads the level filter from
/// `RUST_LOG` (`info` if unset or unrecognized). Safe to call more than
/// once; only the first call takes effect. This, plus the multiplexer
/// registry, is the only global mutable state this crate keeps.
pub fn init() {
	INIT.call_once(|| {
		let filter = std::env::var("RUST_LOG")
			.ok()
			.and_then(|s| s.parse::<LevelFilter>().ok())
			.unwrap_or(LevelFilter::Info);

		log::set_max_level(filter);
		log::set_boxed_logger(Box::new(Logger)).expect("logger installed exactly once");
	});
}
