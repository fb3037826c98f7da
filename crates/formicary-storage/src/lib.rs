//! Tar-archive recording sink for simulation runs.
//!
//! A recording collects one losslessly compressed PNG frame per tick (named
//! by its zero-based tick index), a `stats.txt` with wall-clock and
//! simulation-only timings, and an `ants_vs_time.csv` population series.
//! Archive failures are transient: they disable recording with a warning and
//! the simulation carries on.

use chrono::Local;
use image::codecs::png::PngEncoder;
use image::{ExtendedColorType, ImageEncoder};
use std::fmt;
use std::fs::File;
use std::path::PathBuf;
use tar::{Builder, Header};
use thiserror::Error;
use tracing::{info, warn};

/// Recording error wrapper.
#[derive(Debug, Error)]
pub enum RecordingError {
    #[error("archive io: {0}")]
    Io(#[from] std::io::Error),
    #[error("frame encode: {0}")]
    Encode(#[from] image::ImageError),
}

/// A millisecond duration with its ticks-per-second rate.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimeInfo {
    pub time_ms: f64,
    pub ticks_per_second: f64,
}

impl TimeInfo {
    /// Derive the rate from a tick count and a millisecond duration.
    #[must_use]
    pub fn from_ticks(ticks: u32, time_ms: f64) -> Self {
        let ticks_per_second = if time_ms > 0.0 {
            f64::from(ticks) / (time_ms / 1000.0)
        } else {
            0.0
        };
        Self {
            time_ms,
            ticks_per_second,
        }
    }
}

impl fmt::Display for TimeInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:.2}ms ({:.2} ticks per second)",
            self.time_ms, self.ticks_per_second
        )
    }
}

/// One row of the `ants_vs_time.csv` series.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TickSample {
    pub num_ants: usize,
    pub time_ms: f64,
}

/// Output archive for a run. Construct with [`Recording::create`]; a failed
/// create degrades to a disabled recorder rather than failing the run.
pub struct Recording {
    tar: Option<Builder<File>>,
    path: PathBuf,
    degraded: bool,
}

impl Recording {
    /// Open `{prefix}ants_{timestamp}.tar` for writing. On failure the
    /// recorder is returned in the degraded state and a warning is logged.
    #[must_use]
    pub fn create(prefix: &str) -> Self {
        let path = PathBuf::from(archive_name(prefix));
        match File::create(&path) {
            Ok(file) => {
                info!(path = %path.display(), "opened output archive for writing");
                Self {
                    tar: Some(Builder::new(file)),
                    path,
                    degraded: false,
                }
            }
            Err(err) => {
                warn!(
                    path = %path.display(),
                    error = %err,
                    "failed to create output archive; recording disabled"
                );
                Self {
                    tar: None,
                    path,
                    degraded: true,
                }
            }
        }
    }

    /// A recorder that never writes anything (recording disabled by config).
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            tar: None,
            path: PathBuf::new(),
            degraded: false,
        }
    }

    /// Whether frames are currently being written.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.tar.is_some()
    }

    /// Whether recording was requested but broke at some point.
    #[must_use]
    pub fn is_degraded(&self) -> bool {
        self.degraded
    }

    /// Where the archive lives on disk.
    #[must_use]
    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    /// Append one frame, PNG-encoded from a packed RGB buffer.
    pub fn append_frame(&mut self, tick_index: u64, width: u32, height: u32, rgb: &[u8]) {
        if self.tar.is_none() {
            return;
        }
        let result = encode_png(width, height, rgb)
            .and_then(|png| self.append_bytes(&format!("{tick_index}.png"), &png));
        if let Err(err) = result {
            self.degrade("frame", &err);
        }
    }

    /// Append the `stats.txt` summary.
    pub fn write_stats(&mut self, num_ticks: u32, wall: TimeInfo, sim: TimeInfo) {
        if self.tar.is_none() {
            return;
        }
        let stats = format!(
            "========== Statistics ==========\n\
             Number of ticks: {num_ticks}\n\
             Wall time: {wall}\n\
             Sim time: {sim}\n"
        );
        if let Err(err) = self.append_bytes("stats.txt", stats.as_bytes()) {
            self.degrade("stats", &err);
        }
    }

    /// Append the `ants_vs_time.csv` population series.
    pub fn write_ant_series(&mut self, samples: &[TickSample]) {
        if self.tar.is_none() {
            return;
        }
        let mut csv = String::from("NumAnts,TimeMs\n");
        for sample in samples {
            csv.push_str(&format!("{},{:.3}\n", sample.num_ants, sample.time_ms));
        }
        if let Err(err) = self.append_bytes("ants_vs_time.csv", csv.as_bytes()) {
            self.degrade("ant series", &err);
        }
    }

    /// Finish the archive. Degradation is surfaced once more here so a run
    /// that lost its recording partway is visible at the end.
    pub fn finalise(mut self) {
        if self.degraded {
            warn!(
                path = %self.path.display(),
                "recording was degraded; the archive is absent or incomplete"
            );
        }
        if let Some(mut tar) = self.tar.take() {
            match tar.finish() {
                Ok(()) => info!(path = %self.path.display(), "finalised output archive"),
                Err(err) => warn!(
                    path = %self.path.display(),
                    error = %err,
                    "failed to finalise output archive"
                ),
            }
        }
    }

    fn append_bytes(&mut self, name: &str, data: &[u8]) -> Result<(), RecordingError> {
        let Some(tar) = self.tar.as_mut() else {
            return Ok(());
        };
        let mut header = Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        tar.append_data(&mut header, name, data)?;
        Ok(())
    }

    fn degrade(&mut self, what: &str, err: &RecordingError) {
        warn!(
            path = %self.path.display(),
            error = %err,
            "failed to append {what}; recording disabled"
        );
        self.tar = None;
        self.degraded = true;
    }
}

fn encode_png(width: u32, height: u32, rgb: &[u8]) -> Result<Vec<u8>, RecordingError> {
    let mut png = Vec::new();
    PngEncoder::new(&mut png).write_image(rgb, width, height, ExtendedColorType::Rgb8)?;
    Ok(png)
}

fn archive_name(prefix: &str) -> String {
    format!(
        "{prefix}ants_{}.tar",
        Local::now().format("%d-%m-%Y_%H-%M-%S")
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn time_info_formats_rate() {
        let info = TimeInfo::from_ticks(100, 2_000.0);
        assert!((info.ticks_per_second - 50.0).abs() < 1e-9);
        assert_eq!(info.to_string(), "2000.00ms (50.00 ticks per second)");
    }

    #[test]
    fn time_info_handles_zero_duration() {
        let info = TimeInfo::from_ticks(10, 0.0);
        assert_eq!(info.ticks_per_second, 0.0);
    }

    #[test]
    fn archive_name_carries_the_prefix() {
        let name = archive_name("run/out-");
        assert!(name.starts_with("run/out-ants_"));
        assert!(name.ends_with(".tar"));
    }

    #[test]
    fn disabled_recorder_ignores_writes() {
        let mut recording = Recording::disabled();
        assert!(!recording.is_active());
        assert!(!recording.is_degraded());
        recording.append_frame(0, 2, 2, &[0u8; 12]);
        recording.write_stats(1, TimeInfo::from_ticks(1, 1.0), TimeInfo::from_ticks(1, 1.0));
        recording.finalise();
    }

    #[test]
    fn unwritable_path_degrades_instead_of_failing() {
        let recording = Recording::create("/definitely/not/a/real/directory/");
        assert!(!recording.is_active());
        assert!(recording.is_degraded());
        recording.finalise();
    }
}
