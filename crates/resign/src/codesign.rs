use std::io;
use std::path::Path;
use std::process::Output;

use tokio::process::Command;

/// Captured output of one external tool invocation. Retry and downgrade
/// policy belongs to the session, not here.
#[derive(Debug)]
pub struct ToolOutput {
    pub stdout: String,
    pub stderr: String,
    pub success: bool,
}

impl From<Output> for ToolOutput {
    fn from(out: Output) -> Self {
        ToolOutput {
            stdout: String::from_utf8_lossy(&out.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&out.stderr).into_owned(),
            success: out.status.success(),
        }
    }
}

/// Sign one file with the host `codesign` tool.
pub(crate) async fn sign(
    identity: &str,
    entitlements: Option<&Path>,
    keychain: Option<&str>,
    file: &Path,
) -> io::Result<ToolOutput> {
    let mut cmd = Command::new("codesign");
    cmd.arg("-f").arg("-s").arg(identity);
    if let Some(keychain) = keychain {
        cmd.arg("--keychain").arg(keychain);
    }
    if let Some(entitlements) = entitlements {
        cmd.arg("--entitlements").arg(entitlements);
    }
    cmd.arg(file);
    Ok(cmd.output().await?.into())
}

/// Verify one file's signature with the host `codesign` tool.
pub(crate) async fn verify(file: &Path, keychain: Option<&str>) -> io::Result<ToolOutput> {
    let mut cmd = Command::new("codesign");
    cmd.arg("-v");
    if let Some(keychain) = keychain {
        cmd.arg("--keychain").arg(keychain);
    }
    cmd.arg(file);
    Ok(cmd.output().await?.into())
}

/// List the code-signing identities the host keychain knows about, one line
/// per identity as `security find-identity` prints them.
pub async fn find_identities() -> io::Result<Vec<String>> {
    let out = Command::new("security")
        .args(["find-identity", "-v", "-p", "codesigning"])
        .output()
        .await?;

    let stdout = String::from_utf8_lossy(&out.stdout);
    Ok(stdout
        .lines()
        .map(str::trim)
        .filter(|line| line.starts_with(|c: char| c.is_ascii_digit()))
        .map(str::to_string)
        .collect())
}
