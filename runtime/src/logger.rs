use std::time::SystemTime;

use log::{Level, LevelFilter, Log, Metadata, Record};
use nu_ansi_term::ansi::RESET;
use nu_ansi_term::{Color, Style};

/// Colored `[axpr]`-prefixed logger for verbose runs.
pub struct Logger;

impl Log for Logger {
	fn enabled(&self, _: &Metadata) -> bool {
		true
	}

	fn log(&self, record: &Record) {
		let time = humantime::format_rfc3339_nanos(SystemTime::now());
		let dim = Style::new().dimmed().prefix();

		eprintln!(
			"{dim}{time}{RESET} {}[axpr]{RESET} {}{:5}{RESET} {}",
			Style::new().dimmed().prefix(),
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
			record.args()
		);
	}

	fn flush(&self) {}
}

/// A logger that discards every record, installed for silent (daemonized) runs.
pub struct Discard;

impl Log for Discard {
	fn enabled(&self, _: &Metadata) -> bool {
		false
	}

	fn log(&self, _: &Record) {}

	fn flush(&self) {}
}

/// Installs the process-wide logger. `verbose` selects between the colored `[axpr]` logger and a discard sink.
pub fn install(verbose: bool) {
	let (logger, level): (&'static dyn Log, LevelFilter) =
		if verbose { (&Logger, LevelFilter::Trace) } else { (&Discard, LevelFilter::Off) };

	log::set_logger(logger).expect("logger installed exactly once");
	log::set_max_level(level);
}
