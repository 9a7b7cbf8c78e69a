//! Renders build status events for the user.

use std::collections::HashMap;

use owo_colors::{OwoColorize, Stream};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;

use crate::backend::{SolveStatus, StatusEvent};
use crate::util::hash::ObjectHash;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DisplayMode {
  /// Coloured output when the terminal supports it; command logs hidden.
  #[default]
  Auto,
  /// Every event, including command output, without colour.
  Plain,
}

/// Counts of what the display saw.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DisplaySummary {
  pub completed: usize,
  pub cached: usize,
  pub errored: usize,
}

/// Render status events until the stream closes.
pub async fn display(
  mut events: mpsc::Receiver<SolveStatus>,
  mode: DisplayMode,
  mut out: impl AsyncWrite + Send + Unpin,
) -> std::io::Result<DisplaySummary> {
  let mut steps: HashMap<ObjectHash, usize> = HashMap::new();
  let mut summary = DisplaySummary::default();

  while let Some(status) = events.recv().await {
    let next = steps.len() + 1;
    let step = *steps.entry(status.vertex.clone()).or_insert(next);
    let prefix = format!("#{}", step);

    let line = match &status.event {
      StatusEvent::Started => Some(format!("{} {}", prefix, status.name)),
      StatusEvent::Cached => {
        summary.cached += 1;
        Some(format!("{} {} {}", prefix, paint(mode, "CACHED", Tone::Dim), status.name))
      }
      StatusEvent::Completed { elapsed } => {
        summary.completed += 1;
        Some(format!(
          "{} {} {:.1}s",
          prefix,
          paint(mode, "DONE", Tone::Good),
          elapsed.as_secs_f64()
        ))
      }
      StatusEvent::Errored(message) => {
        summary.errored += 1;
        Some(format!("{} {} {}", prefix, paint(mode, "ERROR", Tone::Bad), message))
      }
      StatusEvent::Log(text) => (mode == DisplayMode::Plain).then(|| format!("{} {}", prefix, text)),
    };

    if let Some(line) = line {
      out.write_all(format!("{}\n", line).as_bytes()).await?;
    }
  }

  out.flush().await?;
  Ok(summary)
}

enum Tone {
  Good,
  Bad,
  Dim,
}

fn paint(mode: DisplayMode, label: &str, tone: Tone) -> String {
  if mode == DisplayMode::Plain {
    return label.to_string();
  }
  match tone {
    Tone::Good => label.if_supports_color(Stream::Stderr, |s| s.green()).to_string(),
    Tone::Bad => label.if_supports_color(Stream::Stderr, |s| s.red()).to_string(),
    Tone::Dim => label.if_supports_color(Stream::Stderr, |s| s.dimmed()).to_string(),
  }
}
