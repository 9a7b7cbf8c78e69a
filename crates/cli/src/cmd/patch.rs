//! Implementation of the `imgpatch patch` command.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Args;
use tracing::debug;

use imgpatch_lib::patch::{Collaborators, PatchOptions, PatchSummary, patch};
use imgpatch_lib::pkgmgr::BuildOutputPolicy;
use imgpatch_lib::report::NATIVE_SCANNER;

use crate::output::{OutputFormat, format_duration, print_json, print_stat, print_success, print_warning};

#[derive(Debug, Args)]
pub struct PatchArgs {
  /// Image reference to patch
  #[arg(short, long)]
  pub image: String,

  /// Update report listing the packages to fix; without it every OS package is upgraded
  #[arg(short, long)]
  pub report: Option<PathBuf>,

  /// Parser used to read the report
  #[arg(short, long, env = "IMGPATCH_SCANNER", default_value = NATIVE_SCANNER)]
  pub scanner: String,

  /// Tag for the patched image (default: <tag>-patched)
  #[arg(short, long)]
  pub tag: Option<String>,

  /// Folder for intermediate results (default: a temporary folder)
  #[arg(long, env = "IMGPATCH_WORKING_FOLDER")]
  pub working_folder: Option<PathBuf>,

  /// Record failed packages instead of aborting
  #[arg(long)]
  pub ignore_errors: bool,

  /// Leave language build output out of the patch layer
  #[arg(long)]
  pub skip_build: bool,

  /// Format of the patch statement written to --output
  #[arg(short, long, default_value = "json")]
  pub format: String,

  /// Where to write the patch statement
  #[arg(short, long)]
  pub output: Option<PathBuf>,

  /// Deadline for the whole run
  #[arg(long, env = "IMGPATCH_TIMEOUT", default_value = "5m", value_parser = humantime::parse_duration)]
  pub timeout: Duration,

  /// How to print the summary
  #[arg(long, value_enum, default_value_t)]
  pub output_format: OutputFormat,
}

impl PatchArgs {
  fn into_options(self, debug: bool) -> (PatchOptions, OutputFormat) {
    let options = PatchOptions {
      image: self.image,
      report: self.report,
      scanner: self.scanner,
      patched_tag: self.tag,
      working_folder: self.working_folder,
      ignore_errors: self.ignore_errors,
      build_output: if self.skip_build {
        BuildOutputPolicy::Exclude
      } else {
        BuildOutputPolicy::Include
      },
      format: self.format,
      output: self.output,
      timeout: self.timeout,
      debug,
    };
    (options, self.output_format)
  }
}

/// Run a patch and print its summary.
pub fn cmd_patch(args: PatchArgs, debug: bool) -> Result<()> {
  let (options, output) = args.into_options(debug);
  let image = options.image.clone();
  debug!(?options, "starting patch");

  let rt = tokio::runtime::Runtime::new().context("Failed to create async runtime")?;
  let summary = rt
    .block_on(patch(options, Collaborators::local()))
    .map_err(|err| {
      let kind = err.kind();
      anyhow::Error::new(err).context(format!("Failed to patch {} ({:?})", image, kind))
    })?;

  if output.is_json() {
    print_json(&summary)?;
  } else {
    print_summary(&summary);
  }
  Ok(())
}

fn print_summary(summary: &PatchSummary) {
  println!();
  print_success(&format!("Patched image {}", summary.patched_image));
  print_stat("Source", &summary.image);
  if !summary.managers.is_empty() {
    print_stat("Managers", &summary.managers.join(", "));
  }
  print_stat("Validated updates", &summary.validated.to_string());
  if let Some(path) = &summary.statement {
    print_stat("Statement", &path.display().to_string());
  }
  print_stat("State", &summary.state.to_string());
  print_stat("Duration", &format_duration(summary.duration));

  if !summary.failed.is_empty() {
    print_warning(&format!(
      "{} package(s) could not be updated: {}",
      summary.failed.len(),
      summary.failed.join(", ")
    ));
  }
}
