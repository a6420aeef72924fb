//! Thin subprocess runner for the hypervisor's external image tool,
//! using the same `tokio::process::Command` idiom used for the
//! hypervisor binary itself.

use crate::error::CoreError;
use std::path::Path;
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, info};

/// Captured result of one subprocess invocation.
#[derive(Debug, Clone)]
pub struct ToolOutput {
    pub status_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl ToolOutput {
    pub fn success(&self) -> bool {
        self.status_code == Some(0)
    }
}

/// Runs `qemu-img` (or whatever the caller names as the image tool
/// binary) synchronously, capturing stdout/stderr.
#[derive(Clone)]
pub struct ImageToolDriver {
    binary: String,
}

impl ImageToolDriver {
    pub fn new(binary: impl Into<String>) -> Self {
        Self { binary: binary.into() }
    }

    async fn run(&self, args: &[&str]) -> Result<ToolOutput, CoreError> {
        info!(tool = %self.binary, args = ?args, "running external image tool");

        let output = Command::new(&self.binary)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| CoreError::ToolFailed {
                tool: self.binary.clone(),
                code: None,
                stderr: e.to_string(),
            })?;

        let result = ToolOutput {
            status_code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        };
        debug!(stdout = %result.stdout, stderr = %result.stderr, "image tool output");
        Ok(result)
    }

    /// Run and require a zero exit code.
    async fn run_checked(&self, args: &[&str]) -> Result<ToolOutput, CoreError> {
        let result = self.run(args).await?;
        if !result.success() {
            return Err(CoreError::ToolFailed {
                tool: self.binary.clone(),
                code: result.status_code,
                stderr: result.stderr,
            });
        }
        Ok(result)
    }

    pub async fn create_qcow2(&self, path: &Path, backing_file: Option<&Path>, size: Option<&str>) -> Result<(), CoreError> {
        let path_str = path.to_string_lossy();
        let mut args: Vec<String> = vec!["create".to_string(), "-f".to_string(), "qcow2".to_string()];
        if let Some(backing) = backing_file {
            args.push("-b".to_string());
            args.push(backing.to_string_lossy().to_string());
            args.push("-F".to_string());
            args.push("qcow2".to_string());
        }
        args.push(path_str.to_string());
        if let Some(size) = size {
            args.push(size.to_string());
        }
        let args_ref: Vec<&str> = args.iter().map(String::as_str).collect();
        self.run_checked(&args_ref).await?;
        Ok(())
    }

    /// `qemu-img info`, used by the optional per-file consistency
    /// check. A non-zero exit (or a parsed corruption report)
    /// is treated as "file is corrupt".
    pub async fn check(&self, path: &Path) -> Result<bool, CoreError> {
        let path_str = path.to_string_lossy();
        let result = self.run(&["check", &path_str]).await?;
        Ok(result.success())
    }

    /// Rewrite the backing-file pointer of `path`.
    pub async fn rebase(&self, path: &Path, backing_file: &Path, unsafe_mode: bool) -> Result<(), CoreError> {
        let path_str = path.to_string_lossy();
        let backing_str = backing_file.to_string_lossy();
        let mut args = vec!["rebase".to_string(), "-f".to_string(), "qcow2".to_string()];
        if unsafe_mode {
            args.push("-u".to_string());
        }
        args.push("-b".to_string());
        args.push(backing_str.to_string());
        args.push(path_str.to_string());
        let args_ref: Vec<&str> = args.iter().map(String::as_str).collect();
        self.run_checked(&args_ref).await?;
        Ok(())
    }

    /// Commit `path` into its backing file. The
    /// rate-limit flag, if given, is forwarded only here.
    pub async fn commit(&self, path: &Path, rate_limit_bytes_per_sec: Option<u64>) -> Result<(), CoreError> {
        let path_str = path.to_string_lossy();
        let mut args = vec!["commit".to_string()];
        if let Some(rate) = rate_limit_bytes_per_sec {
            args.push("-r".to_string());
            args.push(rate.to_string());
        }
        args.push(path_str.to_string());
        let args_ref: Vec<&str> = args.iter().map(String::as_str).collect();
        self.run_checked(&args_ref).await?;
        Ok(())
    }

    /// Create an internal named snapshot inside `path`.
    pub async fn snapshot_create(&self, path: &Path, snapshot_name: &str) -> Result<(), CoreError> {
        let path_str = path.to_string_lossy();
        self.run_checked(&["snapshot", "-c", snapshot_name, &path_str]).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn nonexistent_binary_surfaces_as_tool_failed() {
        let driver = ImageToolDriver::new("qmpbackup-test-nonexistent-binary");
        let err = driver.check(Path::new("/tmp/x.qcow2")).await.unwrap_err();
        assert!(matches!(err, CoreError::ToolFailed { .. }));
    }
}
