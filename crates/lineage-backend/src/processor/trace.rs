//! Processor failure context

use std::backtrace::{Backtrace, BacktraceStatus};
use thiserror::Error;

/// Frames from these locations are noise in a failure trail
const SKIPPED_PATHS: &[&str] = &["/rustc/", "/.cargo/registry/", "/library/std/", "/library/core/"];

/// Frames of the capture itself and of error conversions into a trail
const SKIPPED_SYMBOLS: &[&str] = &["capture_trail", "panic_trail", " as core::convert::From<"];

/// How many frames a trail keeps, innermost last
const MAX_FRAMES: usize = 8;

/// A processor run that failed with something other than an interrupt
#[derive(Error, Debug)]
#[error("Processor {processor_type} failed while processing dataset {dataset_key}{}: {source} (trail: {trail})", parent_suffix(.parent_key))]
pub struct ProcessorFailure {
    pub processor_type: String,
    pub dataset_key: String,
    pub parent_key: Option<String>,
    /// `file:line` frames joined with ` -> `, outermost first
    pub trail: String,
    #[source]
    pub source: anyhow::Error,
}

fn parent_suffix(parent_key: &Option<String>) -> String {
    parent_key
        .as_deref()
        .map(|key| format!(" (from {})", key))
        .unwrap_or_default()
}

impl ProcessorFailure {
    pub fn new(
        processor_type: impl Into<String>,
        dataset_key: impl Into<String>,
        parent_key: Option<String>,
        source: anyhow::Error,
        trail: String,
    ) -> Self {
        Self {
            processor_type: processor_type.into(),
            dataset_key: dataset_key.into(),
            parent_key,
            trail,
            source,
        }
    }
}

/// Compact `file:line` trail for a captured backtrace
///
/// Returns `"unavailable"` when the backtrace holds no frames.
pub fn compact_trail(backtrace: &Backtrace) -> String {
    if backtrace.status() != BacktraceStatus::Captured {
        return "unavailable".to_string();
    }
    trail_from_text(&backtrace.to_string())
}

/// Capture a trail at the call site
///
/// Always captures, independent of `RUST_BACKTRACE`/`RUST_LIB_BACKTRACE`.
/// Called where an error is first wrapped, so the innermost frame is the
/// code that produced it.
pub fn capture_trail() -> String {
    compact_trail(&Backtrace::force_capture())
}

/// Build a trail from the text form of a backtrace
pub fn trail_from_text(text: &str) -> String {
    let mut frames = Vec::new();
    let mut symbol = "";
    for line in text.lines().map(str::trim) {
        let Some(location) = line.strip_prefix("at ") else {
            symbol = line;
            continue;
        };
        if SKIPPED_PATHS.iter().any(|skip| location.contains(skip))
            || SKIPPED_SYMBOLS.iter().any(|skip| symbol.contains(skip))
        {
            continue;
        }
        if let Some(frame) = short_location(location) {
            frames.push(frame);
        }
    }

    if frames.is_empty() {
        return "unavailable".to_string();
    }

    // backtraces list the innermost frame first
    frames.reverse();
    if frames.len() > MAX_FRAMES {
        frames.drain(..frames.len() - MAX_FRAMES);
    }
    frames.join(" -> ")
}

/// `./src/processor/runner.rs:120:17` becomes `processor/runner.rs:120`
fn short_location(location: &str) -> Option<String> {
    let mut parts = location.rsplitn(3, ':');
    let _column = parts.next()?;
    let line = parts.next()?;
    let path = parts.next()?;

    line.parse::<u32>().ok()?;
    let mut components = path.rsplit(['/', '\\']);
    let file = components.next().unwrap_or(path);
    match components.next().filter(|dir| !dir.is_empty() && *dir != ".") {
        Some(dir) => Some(format!("{}/{}:{}", dir, file, line)),
        None => Some(format!("{}:{}", file, line)),
    }
}
