use anyhow::{Context, Result};
use std::process::Command;

/// Raw diff plus the `-p` strip count that applies to its file names
#[derive(Debug, Clone)]
pub struct DiffSource {
    pub text: String,
    pub strip: usize,
}

/// Run a diff command through the shell and capture its output.
///
/// `git diff` exits 0 either way, but plain `diff` exits 1 when the inputs
/// differ, so only exit codes above 1 count as failure.
pub fn run_diff_command(command: &str, strip: usize, dir: Option<&str>) -> Result<DiffSource> {
    if command.trim().is_empty() {
        anyhow::bail!("diff command is empty");
    }

    let mut cmd = Command::new("sh");
    cmd.args(["-c", command]);
    if let Some(dir) = dir {
        cmd.current_dir(dir);
    }
    let output = cmd
        .output()
        .with_context(|| format!("Failed to run diff command '{}'", command))?;

    match output.status.code() {
        Some(0) | Some(1) => {}
        _ => {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!("Diff command '{}' failed: {}", command, stderr.trim());
        }
    }

    Ok(DiffSource {
        text: String::from_utf8_lossy(&output.stdout).into_owned(),
        strip,
    })
}

/// Get the repository root directory
pub fn get_repo_root() -> Result<String> {
    git_stdout(&["rev-parse", "--show-toplevel"]).context("Not in a git repository")
}

/// Working directory relative to the repository root ("" at the root,
/// otherwise "sub/dir" without a trailing slash).
pub fn get_rel_workdir() -> Result<String> {
    let prefix = git_stdout(&["rev-parse", "--show-prefix"])
        .context("Failed to resolve working directory inside the repository")?;
    Ok(prefix.trim_end_matches('/').to_string())
}

/// Get the URL of the `origin` remote
pub fn get_origin_url() -> Result<String> {
    git_stdout(&["remote", "get-url", "origin"]).context("Failed to get git remote URL")
}

fn git_stdout(args: &[&str]) -> Result<String> {
    let output = Command::new("git")
        .args(args)
        .output()
        .context("Failed to run git")?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        anyhow::bail!("git {} failed: {}", args.join(" "), stderr.trim());
    }

    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

/// Parse owner/repo from a git remote URL
pub fn parse_owner_repo_from_remote(remote: &str) -> Result<(String, String)> {
    // SSH: git@host:owner/repo.git
    // HTTPS: https://host/owner/repo.git
    let without_scheme = remote
        .strip_prefix("https://")
        .or_else(|| remote.strip_prefix("http://"))
        .or_else(|| remote.strip_prefix("ssh://"))
        .unwrap_or(remote);

    let path = match without_scheme.split_once(':') {
        Some((host, path)) if !host.contains('/') && !path.starts_with("//") => path,
        _ => without_scheme
            .split_once('/')
            .map(|(_, path)| path)
            .unwrap_or(without_scheme),
    };

    let path = path.trim_matches('/');
    let path = path.strip_suffix(".git").unwrap_or(path);
    match path.rsplit_once('/') {
        Some((owner, repo)) if !owner.is_empty() && !repo.is_empty() => {
            Ok((owner.to_string(), repo.to_string()))
        }
        _ => anyhow::bail!("Cannot parse owner/repo from remote: {}", remote),
    }
}
