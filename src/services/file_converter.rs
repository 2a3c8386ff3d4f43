//! Rendering of the first page of a document into an image.

use crate::services::safe_exec::{ExecError, ExecOptions, SafeExec};
use nix::sys::signal::Signal;
use std::{
    fmt,
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};
use thiserror::Error;
use tokio::fs;
use tracing::{debug, warn};

pub const APPROVED_FORMATS: &[&str] = &["png"];

const CONVERT_WIDTH: u32 = 600;
const THUMBNAIL_WIDTH: u32 = 260;
const PREVIEW_WIDTH: u32 = 548;
const CONVERT_TIMEOUT: Duration = Duration::from_secs(40);

#[derive(Debug, Error)]
pub enum ConversionError {
    #[error("format `{0}` is not approved for conversion")]
    UnsupportedFormat(String),
    #[error("style `{0}` is not supported")]
    UnsupportedStyle(String),
    #[error(transparent)]
    Exec(#[from] ExecError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Renderer {
    ImageMagick,
    Ghostscript,
}

impl FromStr for Renderer {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "imagemagick" | "convert" => Ok(Self::ImageMagick),
            "ghostscript" | "gs" => Ok(Self::Ghostscript),
            other => Err(format!("unknown conversion renderer `{other}`")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Style {
    Thumbnail,
    Preview,
}

impl Style {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Thumbnail => "thumbnail",
            Self::Preview => "preview",
        }
    }

    fn width(&self) -> u32 {
        match self {
            Self::Thumbnail => THUMBNAIL_WIDTH,
            Self::Preview => PREVIEW_WIDTH,
        }
    }
}

impl FromStr for Style {
    type Err = ConversionError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "thumbnail" => Ok(Self::Thumbnail),
            "preview" => Ok(Self::Preview),
            other => Err(ConversionError::UnsupportedStyle(other.to_string())),
        }
    }
}

impl fmt::Display for Style {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct FileConverter {
    exec: SafeExec,
    renderer: Renderer,
    command_prefix: Vec<String>,
}

impl FileConverter {
    pub fn new(exec: SafeExec, renderer: Renderer, command_prefix: Vec<String>) -> Self {
        Self {
            exec,
            renderer,
            command_prefix,
        }
    }

    pub fn enabled(&self) -> bool {
        self.exec.enabled()
    }

    /// Render `source` into `{source}.{format}`.
    pub async fn convert(&self, source: &Path, format: &str) -> Result<PathBuf, ConversionError> {
        if !APPROVED_FORMATS.contains(&format) {
            return Err(ConversionError::UnsupportedFormat(format.to_string()));
        }
        let dest = output_path(source, format);
        let args = match self.renderer {
            Renderer::ImageMagick => imagemagick_convert_args(source, &dest),
            Renderer::Ghostscript => ghostscript_args(source, &dest, CONVERT_WIDTH),
        };
        self.render(args, dest).await
    }

    /// Render a `style`-sized png into `{source}.png`.
    pub async fn styled(&self, source: &Path, style: Style) -> Result<PathBuf, ConversionError> {
        let dest = output_path(source, "png");
        let args = match self.renderer {
            Renderer::ImageMagick => imagemagick_resize_args(source, &dest, style.width()),
            Renderer::Ghostscript => ghostscript_args(source, &dest, style.width()),
        };
        self.render(args, dest).await
    }

    pub async fn thumbnail(&self, source: &Path) -> Result<PathBuf, ConversionError> {
        self.styled(source, Style::Thumbnail).await
    }

    async fn render(&self, args: Vec<String>, dest: PathBuf) -> Result<PathBuf, ConversionError> {
        let mut argv = self.command_prefix.clone();
        argv.extend(args);
        let options = ExecOptions {
            timeout: CONVERT_TIMEOUT,
            kill_signal: Signal::SIGTERM,
            ..Default::default()
        };
        match self.exec.run(&argv, &options).await {
            Ok(output) => {
                debug!(dest = %dest.display(), stderr = %output.stderr, "converted file");
                Ok(dest)
            }
            Err(err) => {
                if let ExecError::Failed(failed) = &err {
                    warn!(
                        command = %failed.command,
                        stdout = %failed.stdout,
                        stderr = %failed.stderr,
                        "conversion command failed"
                    );
                }
                remove_partial(&dest).await;
                Err(err.into())
            }
        }
    }
}

async fn remove_partial(dest: &Path) {
    match fs::remove_file(dest).await {
        Ok(()) => {}
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => warn!(path = %dest.display(), error = %err, "failed to remove partial conversion"),
    }
}

/// Where a render of `source` into `format` is written: `{source}.{format}`.
/// Styled renders are always png.
pub fn output_path(source: &Path, format: &str) -> PathBuf {
    let mut name = source.as_os_str().to_owned();
    name.push(".");
    name.push(format);
    PathBuf::from(name)
}

fn first_page(source: &Path) -> String {
    format!("{}[0]", source.display())
}

fn imagemagick_convert_args(source: &Path, dest: &Path) -> Vec<String> {
    vec![
        "convert".into(),
        "-define".into(),
        format!("pdf:fit-page={CONVERT_WIDTH}x"),
        "-flatten".into(),
        "-density".into(),
        "300".into(),
        first_page(source),
        dest.display().to_string(),
    ]
}

fn imagemagick_resize_args(source: &Path, dest: &Path, width: u32) -> Vec<String> {
    vec![
        "convert".into(),
        "-flatten".into(),
        "-background".into(),
        "white".into(),
        "-density".into(),
        "300".into(),
        "-define".into(),
        format!("pdf:fit-page={width}x"),
        first_page(source),
        "-resize".into(),
        format!("{width}x"),
        dest.display().to_string(),
    ]
}

/// First page at `width` pixels on an A-series page, at 72dpi one point is one pixel.
fn ghostscript_args(source: &Path, dest: &Path, width: u32) -> Vec<String> {
    let height = width * 1414 / 1000;
    vec![
        "gs".into(),
        "-q".into(),
        "-dSAFER".into(),
        "-dBATCH".into(),
        "-dNOPAUSE".into(),
        "-sDEVICE=png16m".into(),
        "-dFirstPage=1".into(),
        "-dLastPage=1".into(),
        "-r72".into(),
        format!("-dDEVICEWIDTHPOINTS={width}"),
        format!("-dDEVICEHEIGHTPOINTS={height}"),
        "-dFIXEDMEDIA".into(),
        "-dPDFFitPage".into(),
        format!("-sOutputFile={}", dest.display()),
        source.display().to_string(),
    ]
}
