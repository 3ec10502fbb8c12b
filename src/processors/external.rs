//! Command-line invocations of CloudCompare.
//!
//! Coordinates handed to the tool are shifted by a [`CoordinateOffset`] to
//! keep them small; the tool is told the same shift through `-GLOBAL_SHIFT`
//! so its outputs stay in the original coordinate frame.

use std::ffi::OsString;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Command;

use geo::Polygon;
use log::debug;
use thiserror::Error;

use super::footprint::CoordinateOffset;

/// Errors raised while running an external tool.
#[derive(Debug, Error)]
pub enum ToolError {
    #[error("failed to start '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("{label} failed ({status}): {stderr}")]
    ExternalToolFailure {
        label: String,
        status: String,
        stderr: String,
    },
}

/// One fully prepared external call.
#[derive(Debug, Clone, PartialEq)]
pub struct Invocation {
    /// Short name used in logs and errors.
    pub label: String,
    pub program: PathBuf,
    pub args: Vec<OsString>,
}

impl Invocation {
    pub fn new(label: impl Into<String>, program: impl Into<PathBuf>) -> Self {
        Self {
            label: label.into(),
            program: program.into(),
            args: Vec::new(),
        }
    }

    fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Arguments as lossy UTF-8, for logging and inspection.
    pub fn args_lossy(&self) -> Vec<String> {
        self.args
            .iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect()
    }
}

impl fmt::Display for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program.display())?;
        for arg in self.args_lossy() {
            if arg.contains(char::is_whitespace) {
                write!(f, " \"{}\"", arg)?;
            } else {
                write!(f, " {}", arg)?;
            }
        }
        Ok(())
    }
}

/// Captured output of a successful call.
#[derive(Debug, Clone, Default)]
pub struct ToolOutput {
    pub stdout: String,
    pub stderr: String,
}

/// Run an invocation to completion.
///
/// Blocks until the process exits. Standard output and error are captured
/// and logged at debug level; they are not interpreted.
///
/// # Errors
///
/// Returns [`ToolError::Spawn`] if the process cannot be started and
/// [`ToolError::ExternalToolFailure`] on a non-zero exit status.
pub fn run(invocation: &Invocation) -> Result<ToolOutput, ToolError> {
    debug!("Running {}", invocation);

    let output = Command::new(&invocation.program)
        .args(&invocation.args)
        .output()
        .map_err(|e| ToolError::Spawn {
            program: invocation.program.display().to_string(),
            source: e,
        })?;

    let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
    let stderr = String::from_utf8_lossy(&output.stderr).into_owned();

    if !stdout.trim().is_empty() {
        debug!("{} stdout:\n{}", invocation.label, stdout.trim_end());
    }
    if !stderr.trim().is_empty() {
        debug!("{} stderr:\n{}", invocation.label, stderr.trim_end());
    }

    if !output.status.success() {
        return Err(ToolError::ExternalToolFailure {
            label: invocation.label.clone(),
            status: output.status.to_string(),
            stderr: stderr.trim().to_string(),
        });
    }

    Ok(ToolOutput { stdout, stderr })
}

/// Decimal rendering used for every number passed to the tool.
fn decimal(v: f64) -> String {
    format!("{:.3}", v)
}

/// Builder for CloudCompare command lines.
#[derive(Debug, Clone, PartialEq)]
pub struct CloudCompare {
    executable: PathBuf,
}

impl CloudCompare {
    pub fn new(executable: impl Into<PathBuf>) -> Self {
        Self {
            executable: executable.into(),
        }
    }

    pub fn executable(&self) -> &Path {
        &self.executable
    }

    fn base(&self, label: &str, log_file: &Path, timestamps: bool) -> Invocation {
        let mut invocation = Invocation::new(label, &self.executable).arg("-SILENT");
        if !timestamps {
            invocation = invocation.arg("-NO_TIMESTAMP");
        }
        invocation
            .arg("-LOG_FILE")
            .arg(log_file)
            .args(["-C_EXPORT_FMT", "PLY", "-AUTO_SAVE", "OFF"])
    }

    /// Adds an input cloud opened with the global shift.
    fn open_shifted(invocation: Invocation, cloud: &Path, offset: &CoordinateOffset) -> Invocation {
        invocation
            .args(["-O", "-GLOBAL_SHIFT"])
            .arg(decimal(offset.x))
            .arg(decimal(offset.y))
            .arg("0.0")
            .arg(cloud)
    }

    /// Crop `input` to the footprint polygon and save the result to `output`.
    ///
    /// The polygon is passed as its exterior ring, closing vertex included,
    /// with every vertex shifted by `offset`.
    pub fn crop2d(
        &self,
        label: &str,
        input: &Path,
        output: &Path,
        log_file: &Path,
        footprint: &Polygon<f64>,
        offset: &CoordinateOffset,
    ) -> Invocation {
        let ring = footprint.exterior();
        let vertices = ring.coords().flat_map(|c| {
            let [x, y] = offset.apply([c.x, c.y]);
            [decimal(x), decimal(y)]
        });

        let invocation = self.base(label, log_file, true);
        Self::open_shifted(invocation, input, offset)
            .args(["-CROP2D", "Z"])
            .arg(ring.0.len().to_string())
            .args(vertices)
            .args(["-SAVE_CLOUDS", "FILE"])
            .arg(output)
    }

    /// Compute M3C2 distances between the two epochs.
    ///
    /// The resulting clouds are written by the tool next to its inputs.
    pub fn m3c2(
        &self,
        epoch1: &Path,
        epoch2: &Path,
        log_file: &Path,
        m3c2_settings: &Path,
        color_scale: &Path,
        offset: &CoordinateOffset,
    ) -> Invocation {
        let invocation = self.base("m3c2", log_file, false);
        let invocation = Self::open_shifted(invocation, epoch1, offset);
        Self::open_shifted(invocation, epoch2, offset)
            .arg("-M3C2")
            .arg(m3c2_settings)
            .args(["-SET_ACTIVE_SF", "8", "-SF_COLOR_SCALE"])
            .arg(color_scale)
            .args(["-SF_CONVERT_TO_RGB", "FALSE", "-SAVE_CLOUDS"])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use geo::LineString;

    fn offset() -> CoordinateOffset {
        CoordinateOffset { x: -124.0, y: -47.0 }
    }

    fn footprint() -> Polygon<f64> {
        Polygon::new(
            LineString::from(vec![(120.5, 44.25), (126.0, 44.25), (126.0, 50.0)]),
            vec![],
        )
    }

    #[test]
    fn test_crop2d_arguments() {
        let cc = CloudCompare::new("/opt/cc/CloudCompare");
        let inv = cc.crop2d(
            "crop e1",
            Path::new("/tmp/02a_e1_boxcut.ply"),
            Path::new("/tmp/03a_e1_bordercut.ply"),
            Path::new("/tmp/boxcut_e1.log"),
            &footprint(),
            &offset(),
        );

        let args = inv.args_lossy();
        assert_eq!(inv.program, PathBuf::from("/opt/cc/CloudCompare"));
        assert_eq!(
            args[..12],
            [
                "-SILENT",
                "-LOG_FILE",
                "/tmp/boxcut_e1.log",
                "-C_EXPORT_FMT",
                "PLY",
                "-AUTO_SAVE",
                "OFF",
                "-O",
                "-GLOBAL_SHIFT",
                "-124.000",
                "-47.000",
                "0.0",
            ]
        );
        assert_eq!(args[12], "/tmp/02a_e1_boxcut.ply");
        assert_eq!(args[13..16], ["-CROP2D", "Z", "4"]);
        // First vertex shifted, closing vertex repeated
        assert_eq!(args[16..18], ["-3.500", "-2.750"]);
        assert_eq!(args[22..24], ["-3.500", "-2.750"]);
        assert_eq!(args[24..], ["-SAVE_CLOUDS", "FILE", "/tmp/03a_e1_bordercut.ply"]);
    }

    #[test]
    fn test_m3c2_arguments() {
        let cc = CloudCompare::new("cc");
        let inv = cc.m3c2(
            Path::new("a.ply"),
            Path::new("b.ply"),
            Path::new("log_m3c2.log"),
            Path::new("m3c2.txt"),
            Path::new("hsv.xml"),
            &offset(),
        );

        let args = inv.args_lossy();
        assert_eq!(args[..4], ["-SILENT", "-NO_TIMESTAMP", "-LOG_FILE", "log_m3c2.log"]);
        assert_eq!(args.iter().filter(|a| *a == "-GLOBAL_SHIFT").count(), 2);
        assert_eq!(
            args[args.len() - 9..],
            [
                "-M3C2",
                "m3c2.txt",
                "-SET_ACTIVE_SF",
                "8",
                "-SF_COLOR_SCALE",
                "hsv.xml",
                "-SF_CONVERT_TO_RGB",
                "FALSE",
                "-SAVE_CLOUDS",
            ]
        );
    }

    #[test]
    fn test_invocation_display_quotes_whitespace() {
        let inv = Invocation::new("x", "tool").arg("-O").arg("my file.ply");
        assert_eq!(inv.to_string(), "tool -O \"my file.ply\"");
    }

    #[test]
    fn test_run_missing_program() {
        let inv = Invocation::new("missing", "/nonexistent/definitely-not-a-tool");
        assert!(matches!(run(&inv), Err(ToolError::Spawn { .. })));
    }

    #[cfg(unix)]
    #[test]
    fn test_run_success_and_failure() {
        assert!(run(&Invocation::new("ok", "true")).is_ok());

        match run(&Invocation::new("fails", "false")) {
            Err(ToolError::ExternalToolFailure { label, .. }) => assert_eq!(label, "fails"),
            other => panic!("expected ExternalToolFailure, got {:?}", other),
        }
    }

    #[cfg(unix)]
    #[test]
    fn test_run_captures_output() {
        let inv = Invocation::new("echo", "echo").arg("hello");
        let output = run(&inv).unwrap();
        assert_eq!(output.stdout.trim(), "hello");
    }
}
