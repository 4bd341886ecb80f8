use std::{
    fs,
    io::Write,
    path::PathBuf,
    process::{Command, Stdio},
    time::Instant,
};

use tracing::{info, warn};
use uuid::Uuid;

use super::{HtmlRenderer, RenderError};

const TARGET: &str = "cartiera::render";
const STAGING_PREFIX: &str = "html-staged.";
const STAGING_SUFFIX: &str = ".htm";

/// Renders HTML to PDF by staging the input to a temporary file and invoking
/// wkhtmltopdf against it. Stateless; one instance is shared by all render
/// tasks.
#[derive(Debug, Clone)]
pub struct PdfRenderer {
    cli_path: PathBuf,
    staging_dir: PathBuf,
    output_dir: PathBuf,
}

impl PdfRenderer {
    pub fn new(
        cli_path: PathBuf,
        staging_dir: PathBuf,
        output_dir: PathBuf,
    ) -> Result<Self, RenderError> {
        fs::create_dir_all(&staging_dir).map_err(RenderError::Init)?;
        fs::create_dir_all(&output_dir).map_err(RenderError::Init)?;
        Ok(Self {
            cli_path,
            staging_dir,
            output_dir,
        })
    }
}

impl HtmlRenderer for PdfRenderer {
    fn render(&self, html: &str) -> Result<String, RenderError> {
        let started_at = Instant::now();

        // The guard deletes the staged file on every exit path.
        let mut staged = tempfile::Builder::new()
            .prefix(STAGING_PREFIX)
            .suffix(STAGING_SUFFIX)
            .tempfile_in(&self.staging_dir)
            .map_err(RenderError::Staging)?;
        staged
            .write_all(html.as_bytes())
            .map_err(RenderError::Staging)?;
        staged.flush().map_err(RenderError::Staging)?;

        let name = format!("rendered-{}.pdf", Uuid::new_v4());
        let output_path = self.output_dir.join(&name);

        let cli_started_at = Instant::now();
        let output = Command::new(&self.cli_path)
            .arg(staged.path())
            .arg(&output_path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .map_err(|err| {
                warn!(
                    target: TARGET,
                    cli_path = %self.cli_path.display(),
                    error = %err,
                    "failed to spawn wkhtmltopdf"
                );
                RenderError::Unavailable(err)
            })?;

        if !output.status.success() {
            let exit_code = output.status.code();
            let mut detail = String::from_utf8_lossy(&output.stdout).into_owned();
            detail.push_str(&String::from_utf8_lossy(&output.stderr));
            let detail = detail.trim().to_string();
            warn!(
                target: TARGET,
                exit_code = exit_code.map(i64::from).unwrap_or(-1),
                elapsed_ms = started_at.elapsed().as_millis() as u64,
                detail = %detail,
                "wkhtmltopdf invocation failed"
            );
            // A partial output file would otherwise be served as a valid PDF.
            let _ = fs::remove_file(&output_path);
            return Err(RenderError::Conversion { exit_code, detail });
        }

        info!(
            target: TARGET,
            output = %name,
            elapsed_ms = started_at.elapsed().as_millis() as u64,
            cli_elapsed_ms = cli_started_at.elapsed().as_millis() as u64,
            "rendered PDF"
        );

        Ok(name)
    }
}
