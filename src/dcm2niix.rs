//! dcm2niix adapter.
//!
//! All invocations run under a process-wide lock: the tool is not safe to run
//! concurrently against sibling directories on every platform we deploy to.

use crate::error::ConvertError;
use camino::Utf8Path;
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::Mutex;

static DCM2NIIX_LOCK: Mutex<()> = Mutex::const_new(());

const MAX_ATTEMPTS: u32 = 3;
const RETRY_BACKOFF: Duration = Duration::from_millis(500);

/// Whether the external tool can be invoked at all.
pub(crate) async fn is_available() -> bool {
    Command::new("dcm2niix")
        .arg("-h")
        .output()
        .await
        .map(|output| output.status.success())
        .unwrap_or(false)
}

/// Run one conversion: compressed NIfTI, no JSON sidecar, metadata preserved.
/// Retries transient failures with a short back-off; the lock is held only
/// while the process runs.
pub(crate) async fn run(
    input_dir: &Utf8Path,
    output_dir: &Utf8Path,
    output_name: &str,
    timeout: Duration,
) -> Result<(), ConvertError> {
    let mut attempt = 0;
    loop {
        attempt += 1;
        let invocation = async {
            let _guard = DCM2NIIX_LOCK.lock().await;
            tokio::time::timeout(
                timeout,
                Command::new("dcm2niix")
                    .args([
                        "-m",
                        "y",
                        "-f",
                        output_name,
                        "-o",
                        output_dir.as_str(),
                        "-z",
                        "y",
                        "-b",
                        "n",
                        input_dir.as_str(),
                    ])
                    .kill_on_drop(true)
                    .output(),
            )
            .await
        };
        match invocation.await {
            Err(_elapsed) => {
                return Err(ConvertError::Tool(format!(
                    "dcm2niix timed out after {}s",
                    timeout.as_secs()
                )));
            }
            Ok(Err(e)) => {
                return Err(ConvertError::Tool(format!("failed to run dcm2niix: {e}")));
            }
            Ok(Ok(output)) if output.status.success() => return Ok(()),
            Ok(Ok(output)) => {
                let stdout = truncated(&output.stdout);
                let stderr = truncated(&output.stderr);
                if attempt >= MAX_ATTEMPTS {
                    return Err(ConvertError::Tool(format!(
                        "exit status {:?} after {MAX_ATTEMPTS} attempts: stdout={stdout}, stderr={stderr}",
                        output.status.code()
                    )));
                }
                tracing::warn!(
                    attempt,
                    output_name,
                    stdout,
                    stderr,
                    "dcm2niix failed, retrying"
                );
                tokio::time::sleep(RETRY_BACKOFF).await;
            }
        }
    }
}

/// Diagnostics capped at 300 bytes; dcm2niix can be chatty.
fn truncated(bytes: &[u8]) -> String {
    let text = String::from_utf8_lossy(&bytes[..bytes.len().min(300)]);
    text.trim_end().to_string()
}
