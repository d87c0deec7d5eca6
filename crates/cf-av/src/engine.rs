//! The transcode engine.
//!
//! [`TranscodeEngine`] is the seam between the worker and the encoder: it
//! turns a local input file into a local output file for a [`Profile`].
//! [`FfmpegEngine`] shells out to ffmpeg with `-progress pipe:2` and reports
//! completion fractions as the encode advances.

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;

use cf_core::config::ToolsConfig;
use cf_core::Result;

use crate::command::ToolCommand;
use crate::profile::{Profile, VIDEO_CRF};
use crate::tools::ToolRegistry;

/// Receives completion fractions in `0.0..=1.0`.
pub type ProgressCallback = Arc<dyn Fn(f32) + Send + Sync>;

/// Minimum spacing between progress reports, except the final one.
const PROGRESS_INTERVAL: Duration = Duration::from_secs(2);

#[async_trait]
pub trait TranscodeEngine: Send + Sync {
    /// Encode `input` into `output` for `profile`.
    ///
    /// Failures are [`cf_core::Error::Tool`]; the caller decides whether to
    /// retry.
    async fn invoke(
        &self,
        input: &Path,
        output: &Path,
        profile: Profile,
        progress: Option<ProgressCallback>,
    ) -> Result<()>;
}

/// ffmpeg-backed engine: libx264 at CRF 18, AAC audio, faststart MP4.
///
/// Tools are looked up at invocation time, so a process without ffmpeg can
/// still build one; every transcode then fails with [`cf_core::Error::Tool`].
pub struct FfmpegEngine {
    tools: ToolRegistry,
    timeout: Duration,
}

impl FfmpegEngine {
    pub fn new(tools: ToolRegistry, config: &ToolsConfig) -> Self {
        Self {
            tools,
            timeout: config.ffmpeg_timeout(),
        }
    }

    /// Discover tools from configuration and `PATH`.
    pub fn discover(config: &ToolsConfig) -> Self {
        Self::new(ToolRegistry::discover(config), config)
    }

    pub fn is_available(&self) -> bool {
        self.tools.get("ffmpeg").is_some()
    }

    pub fn tools(&self) -> &ToolRegistry {
        &self.tools
    }

    /// Assemble the ffmpeg invocation.
    pub fn build_command(
        &self,
        ffmpeg: &Path,
        input: &Path,
        output: &Path,
        profile: Profile,
    ) -> ToolCommand {
        let mut cmd = ToolCommand::new(ffmpeg.to_path_buf());
        cmd.timeout(self.timeout);
        cmd.args(["-y", "-hide_banner", "-nostats", "-progress", "pipe:2"]);
        cmd.arg("-i");
        cmd.arg(input.to_string_lossy().as_ref());
        cmd.args(["-vf", &profile.scale_filter()]);
        cmd.args(["-c:v", "libx264", "-crf", &VIDEO_CRF.to_string(), "-preset", "medium"]);
        cmd.args(["-pix_fmt", "yuv420p"]);
        cmd.args(["-c:a", "aac", "-b:a", "128k"]);
        cmd.args(["-movflags", "+faststart"]);
        cmd.arg(output.to_string_lossy().as_ref());
        cmd
    }

    /// Source duration in seconds from ffprobe, if available.
    async fn probe_duration(&self, input: &Path) -> Option<f64> {
        let ffprobe = self.tools.get("ffprobe")?;
        let mut cmd = ToolCommand::new(ffprobe.to_path_buf());
        cmd.args([
            "-v",
            "error",
            "-show_entries",
            "format=duration",
            "-of",
            "default=noprint_wrappers=1:nokey=1",
        ]);
        cmd.arg(input.to_string_lossy().as_ref());
        match cmd.execute().await {
            Ok(out) => out.stdout.trim().parse::<f64>().ok().filter(|d| *d > 0.0),
            Err(e) => {
                tracing::debug!(input = %input.display(), "ffprobe duration lookup failed: {e}");
                None
            }
        }
    }
}

#[async_trait]
impl TranscodeEngine for FfmpegEngine {
    async fn invoke(
        &self,
        input: &Path,
        output: &Path,
        profile: Profile,
        progress: Option<ProgressCallback>,
    ) -> Result<()> {
        let ffmpeg = self.tools.require("ffmpeg")?;
        let duration = self.probe_duration(input).await;
        tracing::info!(
            input = %input.display(),
            output = %output.display(),
            %profile,
            duration_secs = ?duration,
            "Starting ffmpeg transcode"
        );

        let cmd = self.build_command(ffmpeg, input, output, profile);
        let mut tracker = ProgressTracker::new(duration);
        cmd.execute_with_stderr_callback(
            |line| {
                if let (Some(pct), Some(cb)) = (tracker.feed(line), progress.as_ref()) {
                    cb(pct);
                }
            },
            None,
        )
        .await?;

        tracing::info!(output = %output.display(), %profile, "ffmpeg transcode finished");
        Ok(())
    }
}

/// Turns ffmpeg stderr into throttled completion fractions.
///
/// The duration comes from ffprobe when known, otherwise from the
/// `Duration:` line ffmpeg prints for its input.
#[derive(Debug)]
pub struct ProgressTracker {
    duration_secs: Option<f64>,
    out_time_us: Option<i64>,
    last_emit: Option<Instant>,
}

impl ProgressTracker {
    pub fn new(duration_secs: Option<f64>) -> Self {
        Self {
            duration_secs,
            out_time_us: None,
            last_emit: None,
        }
    }

    /// Consume one stderr line, returning a fraction when one is due.
    pub fn feed(&mut self, line: &str) -> Option<f32> {
        let line = line.trim();

        if self.duration_secs.is_none() {
            if let Some(d) = parse_duration_line(line) {
                self.duration_secs = Some(d);
                return None;
            }
        }

        if let Some(val) = line.strip_prefix("out_time_us=") {
            self.out_time_us = val.parse::<i64>().ok();
            return None;
        }

        let state = line.strip_prefix("progress=")?;
        if state == "end" {
            self.last_emit = Some(Instant::now());
            return Some(1.0);
        }

        let (out_us, dur) = (self.out_time_us?, self.duration_secs?);
        let now = Instant::now();
        if let Some(last) = self.last_emit {
            if now.duration_since(last) < PROGRESS_INTERVAL {
                return None;
            }
        }
        self.last_emit = Some(now);
        Some(((out_us as f64 / 1_000_000.0) / dur).clamp(0.0, 1.0) as f32)
    }
}

/// Parse `Duration: HH:MM:SS.cc, ...` from ffmpeg's input banner.
fn parse_duration_line(line: &str) -> Option<f64> {
    let rest = line.strip_prefix("Duration:")?.trim_start();
    let stamp = rest.split(',').next()?.trim();
    let mut parts = stamp.split(':');
    let h: f64 = parts.next()?.parse().ok()?;
    let m: f64 = parts.next()?.parse().ok()?;
    let s: f64 = parts.next()?.parse().ok()?;
    let total = h * 3600.0 + m * 60.0 + s;
    (total > 0.0).then_some(total)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine() -> FfmpegEngine {
        FfmpegEngine::new(ToolRegistry::default(), &ToolsConfig::default())
    }

    #[test]
    fn command_targets_profile() {
        let cmd = engine().build_command(
            Path::new("/usr/bin/ffmpeg"),
            Path::new("/w/in.mov"),
            Path::new("/w/out.mp4"),
            Profile::P1080,
        );
        let args = cmd.get_args().join(" ");
        assert!(args.contains("-i /w/in.mov"));
        assert!(args.contains("-vf scale=-2:1080"));
        assert!(args.contains("-c:v libx264 -crf 18"));
        assert!(args.contains("-progress pipe:2"));
        assert!(args.ends_with("/w/out.mp4"));
    }

    #[tokio::test]
    async fn missing_ffmpeg_fails_invocation() {
        let e = engine();
        assert!(!e.is_available());
        let err = e
            .invoke(Path::new("/w/in.mov"), Path::new("/w/out.mp4"), Profile::P720, None)
            .await
            .unwrap_err();
        assert!(matches!(err, cf_core::Error::Tool { .. }));
    }

    #[test]
    fn duration_banner_parses() {
        assert_eq!(
            parse_duration_line("Duration: 00:01:02.50, start: 0.000000, bitrate: 1000 kb/s"),
            Some(62.5)
        );
        assert_eq!(parse_duration_line("Duration: N/A, bitrate: N/A"), None);
        assert_eq!(parse_duration_line("Stream #0:0: Video"), None);
    }

    #[test]
    fn tracker_reports_fraction_then_end() {
        let mut t = ProgressTracker::new(Some(10.0));
        assert_eq!(t.feed("out_time_us=5000000"), None);
        assert_eq!(t.feed("progress=continue"), Some(0.5));

        // Throttled until the interval passes.
        t.feed("out_time_us=6000000");
        assert_eq!(t.feed("progress=continue"), None);

        assert_eq!(t.feed("progress=end"), Some(1.0));
    }

    #[test]
    fn tracker_learns_duration_from_banner() {
        let mut t = ProgressTracker::new(None);
        t.feed("out_time_us=1000000");
        assert_eq!(t.feed("progress=continue"), None);

        t.feed("  Duration: 00:00:04.00, start: 0.000000, bitrate: 800 kb/s");
        t.feed("out_time_us=1000000");
        assert_eq!(t.feed("progress=continue"), Some(0.25));
    }

    #[test]
    fn tracker_clamps_overshoot() {
        let mut t = ProgressTracker::new(Some(1.0));
        t.feed("out_time_us=3000000");
        assert_eq!(t.feed("progress=continue"), Some(1.0));
    }
}
