/// FFmpeg-backed measurer/encoder
///
/// Measurement runs the `loudnorm` filter in analysis mode and parses its JSON
/// report from stderr. Encoding applies a `volume` gain followed by an
/// `alimiter` hard ceiling.
use crate::{
    error::{NormalizeError, Result},
    settings::{is_decodable, AudioFormat},
    tool::{AudioTool, EncodeRequest, MeasureOptions},
    types::LoudnessMeasurement,
};
use async_trait::async_trait;
use serde::Deserialize;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;
use tracing::debug;

/// Lines of stderr kept in error messages
const STDERR_TAIL_LINES: usize = 12;

#[derive(Debug, Clone)]
pub struct FfmpegTool {
    ffmpeg_path: PathBuf,
}

impl FfmpegTool {
    pub fn new(ffmpeg_path: PathBuf) -> Self {
        Self { ffmpeg_path }
    }

    pub fn ffmpeg_path(&self) -> &Path {
        &self.ffmpeg_path
    }

    /// First line of `ffmpeg -version`, or `None` if the binary cannot run
    pub async fn version(&self) -> Option<String> {
        let output = Command::new(&self.ffmpeg_path)
            .arg("-version")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .output()
            .await
            .ok()?;

        if !output.status.success() {
            return None;
        }

        String::from_utf8_lossy(&output.stdout)
            .lines()
            .next()
            .map(str::to_string)
    }

    async fn run(&self, args: Vec<OsString>) -> Result<String> {
        let output = Command::new(&self.ffmpeg_path)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| {
                NormalizeError::ToolInvocation(format!(
                    "failed to start {}: {}",
                    self.ffmpeg_path.display(),
                    e
                ))
            })?;

        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();

        if !output.status.success() {
            let tail = stderr_tail(&stderr);
            if stderr.contains("Invalid data found when processing input") {
                return Err(NormalizeError::UnsupportedFormat(tail));
            }
            return Err(NormalizeError::ToolInvocation(format!(
                "FFmpeg exited with {}: {}",
                output.status, tail
            )));
        }

        Ok(stderr)
    }
}

#[async_trait]
impl AudioTool for FfmpegTool {
    async fn measure(&self, path: &Path, options: &MeasureOptions) -> Result<LoudnessMeasurement> {
        if !is_decodable(path) {
            return Err(NormalizeError::UnsupportedFormat(path.display().to_string()));
        }

        debug!("Measuring loudness of {}", path.display());
        let stderr = self.run(measure_args(path, options)).await?;
        parse_loudnorm_report(&stderr)
    }

    async fn encode(&self, request: &EncodeRequest) -> Result<PathBuf> {
        debug!(
            "Encoding {} -> {} ({:+.2} dB, ceiling {:.1} dBTP, {:?})",
            request.input.display(),
            request.output.display(),
            request.gain_db,
            request.true_peak_ceiling,
            request.format
        );
        self.run(encode_args(request)).await?;
        Ok(request.output.clone())
    }
}

/// Arguments for a `loudnorm` analysis run
///
/// The loudnorm filter only accepts I in -70..=-5 and TP in -9..=0. Those
/// values shape its suggested output, not the input statistics we read, so they
/// are clamped into range.
pub fn measure_args(path: &Path, options: &MeasureOptions) -> Vec<OsString> {
    let filter = format!(
        "loudnorm=I={:.1}:TP={:.1}:LRA={:.1}:dual_mono={}:print_format=json",
        options.target_lufs.clamp(-70.0, -5.0),
        options.true_peak_limit.clamp(-9.0, 0.0),
        options.loudness_range.clamp(1.0, 50.0),
        options.dual_mono
    );

    let mut args: Vec<OsString> = ["-hide_banner", "-nostdin", "-nostats", "-i"]
        .iter()
        .map(OsString::from)
        .collect();
    args.push(path.as_os_str().to_os_string());
    for arg in ["-map", "0:a:0", "-af"] {
        args.push(arg.into());
    }
    args.push(filter.into());
    for arg in ["-f", "null", "-"] {
        args.push(arg.into());
    }
    args
}

/// Arguments for a gain + limiter encode
pub fn encode_args(request: &EncodeRequest) -> Vec<OsString> {
    let mut args: Vec<OsString> = ["-hide_banner", "-nostdin", "-y", "-i"]
        .iter()
        .map(OsString::from)
        .collect();
    args.push(request.input.as_os_str().to_os_string());

    let metadata_input = match &request.metadata_source {
        Some(source) if *source == request.input => Some("0"),
        Some(source) => {
            args.push("-i".into());
            args.push(source.as_os_str().to_os_string());
            Some("1")
        }
        None => None,
    };

    args.push("-map".into());
    args.push("0:a:0".into());
    args.push("-map_metadata".into());
    args.push(metadata_input.unwrap_or("-1").into());

    let ceiling_linear = 10f64.powf(request.true_peak_ceiling / 20.0);
    let filter = format!(
        "volume={:.3}dB,alimiter=limit={:.6}:level=0:attack=5:release=50",
        request.gain_db, ceiling_linear
    );
    args.push("-af".into());
    args.push(filter.into());

    let (codec, muxer): (&[&str], &str) = match request.format {
        AudioFormat::Mp3 => (&["-c:a", "libmp3lame", "-b:a", "320k"][..], "mp3"),
        AudioFormat::Wav => (&["-c:a", "pcm_s24le"][..], "wav"),
        AudioFormat::Flac => (&["-c:a", "flac", "-compression_level", "5"][..], "flac"),
        AudioFormat::Ogg => (&["-c:a", "libvorbis", "-q:a", "8"][..], "ogg"),
        AudioFormat::Opus => (&["-c:a", "libopus", "-b:a", "192k"][..], "opus"),
        AudioFormat::M4a => (&["-c:a", "aac", "-b:a", "256k"][..], "ipod"),
        AudioFormat::Aac => (&["-c:a", "aac", "-b:a", "256k"][..], "adts"),
        AudioFormat::Aiff => (&["-c:a", "pcm_s24be"][..], "aiff"),
    };
    args.extend(codec.iter().map(OsString::from));

    if request.format == AudioFormat::Mp3 && metadata_input.is_some() {
        args.push("-id3v2_version".into());
        args.push("3".into());
    }

    args.push("-f".into());
    args.push(muxer.into());
    args.push(request.output.as_os_str().to_os_string());
    args
}

#[derive(Debug, Deserialize)]
struct LoudnormReport {
    input_i: String,
    input_tp: String,
    #[serde(default)]
    input_lra: Option<String>,
}

/// Extract the loudnorm JSON block from FFmpeg's stderr
pub fn parse_loudnorm_report(stderr: &str) -> Result<LoudnessMeasurement> {
    let start = stderr.rfind('{');
    let end = stderr.rfind('}');
    let json = match (start, end) {
        (Some(start), Some(end)) if start < end => &stderr[start..=end],
        _ => {
            return Err(NormalizeError::ToolInvocation(format!(
                "no loudness report in FFmpeg output: {}",
                stderr_tail(stderr)
            )))
        }
    };

    let report: LoudnormReport = serde_json::from_str(json).map_err(|e| {
        NormalizeError::ToolInvocation(format!("failed to parse loudness report: {}", e))
    })?;

    Ok(LoudnessMeasurement {
        integrated_lufs: parse_level("input_i", &report.input_i)?,
        true_peak_dbtp: parse_level("input_tp", &report.input_tp)?,
        loudness_range: report
            .input_lra
            .as_deref()
            .and_then(|lra| lra.trim().parse::<f64>().ok()),
    })
}

/// Parse a level field; `-inf` is kept so the caller can classify silence
fn parse_level(field: &str, value: &str) -> Result<f64> {
    value.trim().parse::<f64>().map_err(|_| {
        NormalizeError::ToolInvocation(format!("unreadable {} value: {:?}", field, value))
    })
}

fn stderr_tail(stderr: &str) -> String {
    let lines: Vec<&str> = stderr.lines().filter(|l| !l.trim().is_empty()).collect();
    let start = lines.len().saturating_sub(STDERR_TAIL_LINES);
    lines[start..].join("\n")
}
