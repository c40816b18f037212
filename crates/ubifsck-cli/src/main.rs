use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::error::ErrorKind;
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use tracing_subscriber::filter::LevelFilter;
use ubifsck_core::{ExitStatus, Fsck, FsckOptions, ImageVolume, Mode, Prompt};

#[derive(Parser, Debug)]
#[command(
	name = "fsck.ubifs",
	version,
	about = "Check and repair a UBIFS image",
	after_help = "Without -a, -y or -n every fix is confirmed interactively."
)]
struct Cli {
	/// Debug level: 0 none, 1 error, 2 warning, 3 notice, 4 debug
	#[arg(short = 'g', long = "debug", value_name = "LEVEL", default_value_t = 2, value_parser = clap::value_parser!(u8).range(0..=4))]
	debug: u8,
	/// Fix problems that lose no data, abort on the rest (safe mode)
	#[arg(short = 'a', long = "auto", conflicts_with_all = ["yes", "nochange"])]
	auto: bool,
	/// Assume "yes" to every question (danger mode)
	#[arg(short = 'y', long = "yes", conflicts_with = "nochange")]
	yes: bool,
	/// With -y, rebuild the filesystem when the index, log or master is unusable
	#[arg(short = 'b', long = "rebuild", requires = "yes")]
	rebuild: bool,
	/// Check only, never write (check mode)
	#[arg(short = 'n', long = "nochange")]
	nochange: bool,
	/// Accepted for fsck(8) compatibility, ignored
	#[arg(short = 'r', long = "reserve")]
	reserve: bool,
	/// Print the run report as JSON
	#[arg(long)]
	json: bool,
	/// UBIFS image to check
	device: PathBuf,
}

impl Cli {
	fn mode(&self) -> Mode {
		match (self.auto, self.yes, self.rebuild, self.nochange) {
			(true, _, _, _) => Mode::Safe,
			(_, true, true, _) => Mode::Danger1,
			(_, true, false, _) => Mode::Danger0,
			(_, _, _, true) => Mode::Check,
			_ => Mode::Normal,
		}
	}

	fn level(&self) -> LevelFilter {
		match self.debug {
			0 => LevelFilter::OFF,
			1 => LevelFilter::ERROR,
			2 => LevelFilter::WARN,
			3 => LevelFilter::INFO,
			_ => LevelFilter::DEBUG,
		}
	}
}

/// Questions answered on the terminal
struct StdinPrompt;

impl Prompt for StdinPrompt {
	fn confirm(&mut self, question: &str, default: bool) -> bool {
		let hint = if default { "[Y/n]" } else { "[y/N]" };
		loop {
			eprint!("{} {} ", question, hint);
			let _ = io::stderr().flush();
			let mut line = String::new();
			match io::stdin().lock().read_line(&mut line) {
				Ok(0) | Err(_) => return default,
				Ok(_) => {}
			}
			match line.trim().to_ascii_lowercase().as_str() {
				"" => return default,
				"y" | "yes" => return true,
				"n" | "no" => return false,
				_ => continue,
			}
		}
	}
}

extern "C" fn on_signal(signo: libc::c_int) {
	let msg: &[u8] = if signo == libc::SIGINT {
		b"\nkilled by signo 2\n"
	} else {
		b"\nkilled by signo 15\n"
	};
	// Only async-signal-safe calls from here on
	unsafe {
		libc::write(libc::STDERR_FILENO, msg.as_ptr().cast(), msg.len());
		libc::_exit(ExitStatus::CANCELED.bits() as libc::c_int);
	}
}

fn install_signal_handlers() {
	for signo in [libc::SIGINT, libc::SIGTERM] {
		unsafe {
			libc::signal(signo, on_signal as extern "C" fn(libc::c_int) as libc::sighandler_t);
		}
	}
}

fn progress_bar() -> ProgressBar {
	let pb = ProgressBar::new(100);
	pb.set_style(
		ProgressStyle::with_template("{spinner} [{bar:30}] {pos:>3}% {msg}")
			.unwrap_or_else(|_| ProgressStyle::default_bar())
			.progress_chars("=> "),
	);
	pb.enable_steady_tick(Duration::from_millis(120));
	pb
}

fn run(cli: Cli) -> Result<ExitStatus> {
	let mode = cli.mode();
	let dev_name = cli.device.display().to_string();
	if cli.reserve {
		tracing::debug!("-r is ignored");
	}

	let mut vol = ImageVolume::open(&cli.device, !mode.is_read_only())
		.with_context(|| format!("cannot open {}", dev_name))?;

	let mut options = FsckOptions::new(mode, dev_name);
	if mode == Mode::Normal {
		options.prompt = Some(Box::new(StdinPrompt));
	}
	let mut fsck = Fsck::new(options);

	// Interactive questions and a progress bar do not share a terminal well
	let bar = (mode != Mode::Normal && !cli.json && cli.debug <= 2 && atty::is(atty::Stream::Stderr)).then(progress_bar);
	if let Some(pb) = bar.clone() {
		fsck.set_progress_callback(move |progress| {
			pb.set_position(progress.progress_percent as u64);
			pb.set_message(progress.current_operation);
		});
	}

	let report = fsck.run(&mut vol);
	if let Some(pb) = bar {
		pb.finish_and_clear();
	}
	if !mode.is_read_only() {
		vol.flush().context("cannot flush image")?;
	}

	if cli.json {
		println!("{}", serde_json::to_string_pretty(&report)?);
	} else {
		if let Some(err) = &report.error {
			eprintln!("fsck.ubifs: {}", err);
		}
		for line in report.summary() {
			println!("{}", line);
		}
	}
	Ok(report.exit_code)
}

fn main() {
	let cli = match Cli::try_parse() {
		Ok(cli) => cli,
		Err(err) => {
			let code = match err.kind() {
				ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => ExitStatus::OK,
				_ => ExitStatus::USAGE,
			};
			let _ = err.print();
			std::process::exit(code.bits() as i32);
		}
	};

	tracing_subscriber::fmt()
		.with_max_level(cli.level())
		.with_writer(io::stderr)
		.with_target(false)
		.init();
	install_signal_handlers();

	let status = match run(cli) {
		Ok(status) => status,
		Err(err) => {
			eprintln!("fsck.ubifs: {:#}", err);
			println!("FSCK failed, exit code {}", ExitStatus::ERROR.bits());
			ExitStatus::ERROR
		}
	};
	std::process::exit(status.bits() as i32);
}

#[cfg(test)]
mod tests {
	use super::*;

	fn parse(args: &[&str]) -> Result<Cli, clap::Error> {
		Cli::try_parse_from(std::iter::once("fsck.ubifs").chain(args.iter().copied()))
	}

	#[test]
	fn test_modes() {
		assert_eq!(parse(&["img"]).unwrap().mode(), Mode::Normal);
		assert_eq!(parse(&["-a", "img"]).unwrap().mode(), Mode::Safe);
		assert_eq!(parse(&["-y", "img"]).unwrap().mode(), Mode::Danger0);
		assert_eq!(parse(&["-y", "-b", "img"]).unwrap().mode(), Mode::Danger1);
		assert_eq!(parse(&["-n", "img"]).unwrap().mode(), Mode::Check);
	}

	#[test]
	fn test_conflicting_modes_are_usage_errors() {
		assert!(parse(&["-a", "-y", "img"]).is_err());
		assert!(parse(&["-y", "-n", "img"]).is_err());
		assert!(parse(&["-b", "img"]).is_err());
		assert!(parse(&[]).is_err());
	}

	#[test]
	fn test_debug_levels() {
		assert_eq!(parse(&["img"]).unwrap().level(), LevelFilter::WARN);
		assert_eq!(parse(&["-g", "4", "img"]).unwrap().level(), LevelFilter::DEBUG);
		assert_eq!(parse(&["-g", "0", "img"]).unwrap().level(), LevelFilter::OFF);
		assert!(parse(&["-g", "5", "img"]).is_err());
	}
}
