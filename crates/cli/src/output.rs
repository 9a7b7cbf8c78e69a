//! CLI output formatting.
//!
//! Status lines carry a coloured symbol when the stream supports it; results
//! go to stdout and problems to stderr.

use std::time::Duration;

use anyhow::Context;
use clap::ValueEnum;
use owo_colors::{OwoColorize, Stream};

#[derive(Debug, Clone, Copy, Default, ValueEnum)]
pub enum OutputFormat {
  #[default]
  Text,
  Json,
}

impl OutputFormat {
  pub fn is_json(self) -> bool {
    matches!(self, OutputFormat::Json)
  }
}

pub mod symbols {
  pub const SUCCESS: &str = "✓";
  pub const ERROR: &str = "✗";
  pub const WARNING: &str = "⚠";
}

#[derive(Clone, Copy)]
enum Level {
  Success,
  Warning,
  Error,
}

impl Level {
  fn stream(self) -> Stream {
    match self {
      Level::Success => Stream::Stdout,
      Level::Warning | Level::Error => Stream::Stderr,
    }
  }

  fn render(self, message: &str) -> String {
    match self {
      Level::Success => format!(
        "{} {}",
        symbols::SUCCESS.if_supports_color(self.stream(), |s| s.green()),
        message
      ),
      Level::Warning => format!(
        "{} {}",
        symbols::WARNING.if_supports_color(self.stream(), |s| s.yellow()),
        message.if_supports_color(self.stream(), |s| s.yellow())
      ),
      Level::Error => format!(
        "{} {}",
        symbols::ERROR.if_supports_color(self.stream(), |s| s.red()),
        message.if_supports_color(self.stream(), |s| s.red())
      ),
    }
  }
}

fn emit(level: Level, message: &str) {
  let line = level.render(message);
  match level.stream() {
    Stream::Stdout => println!("{}", line),
    _ => eprintln!("{}", line),
  }
}

pub fn print_success(message: &str) {
  emit(Level::Success, message);
}

pub fn print_warning(message: &str) {
  emit(Level::Warning, message);
}

pub fn print_error(message: &str) {
  emit(Level::Error, message);
}

pub fn print_stat(label: &str, value: &str) {
  println!("  {}: {}", label.if_supports_color(Stream::Stdout, |s| s.dimmed()), value);
}

pub fn format_duration(duration: Duration) -> String {
  let secs = duration.as_secs();
  match secs {
    60.. => format!("{}m {}s", secs / 60, secs % 60),
    1.. => format!("{}.{:02}s", secs, duration.subsec_millis() / 10),
    0 => format!("{}ms", duration.subsec_millis()),
  }
}

pub fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
  let json = serde_json::to_string_pretty(value).context("Failed to serialize to JSON")?;
  println!("{}", json);
  Ok(())
}
