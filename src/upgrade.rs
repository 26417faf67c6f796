//! Self-upgrade from GitHub releases: check the latest tag, download the
//! platform binary, and swap it into place with a restorable backup.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

use crate::version;

const GITHUB_REPO: &str = "claude-tasks/claude-tasks";

pub async fn upgrade() -> Result<()> {
    let target = format!("{}-{}", std::env::consts::OS, std::env::consts::ARCH);
    println!("Current version: {} ({target})", version::VERSION);
    println!("Checking for updates...");

    let client = reqwest::Client::builder()
        .user_agent(version::user_agent())
        .build()
        .context("failed to build HTTP client")?;

    let release: serde_json::Value = client
        .get(format!(
            "https://api.github.com/repos/{GITHUB_REPO}/releases/latest"
        ))
        .send()
        .await
        .context("failed to reach GitHub API")?
        .error_for_status()
        .context("GitHub API returned an error")?
        .json()
        .await
        .context("failed to parse release metadata")?;

    let tag = release["tag_name"]
        .as_str()
        .context("missing tag_name in release")?;
    let latest_version = tag.strip_prefix('v').unwrap_or(tag);

    let current = semver::Version::parse(version::VERSION)
        .context("failed to parse current version")?;
    let latest = semver::Version::parse(latest_version)
        .with_context(|| format!("failed to parse latest version: {latest_version}"))?;

    if current >= latest {
        println!("Already up to date ({})", version::VERSION);
        return Ok(());
    }

    println!("New version available: {} -> {latest_version}", version::VERSION);

    let asset_name = format!("claude-tasks-{target}");
    let assets = release["assets"]
        .as_array()
        .context("missing assets in release")?;
    let asset = assets
        .iter()
        .find(|asset| asset["name"].as_str() == Some(asset_name.as_str()))
        .with_context(|| format!("no release artifact found for {target}"))?;
    let download_url = asset["browser_download_url"]
        .as_str()
        .context("missing download URL")?;

    println!("Downloading {asset_name}...");
    let binary = client
        .get(download_url)
        .send()
        .await
        .context("failed to download release binary")?
        .error_for_status()
        .context("release download returned an error")?
        .bytes()
        .await
        .context("failed to read release binary")?;

    let current_exe = std::env::current_exe().context("failed to locate current executable")?;
    let staged = stage_binary(&current_exe, &binary)?;
    replace_executable(&current_exe, &staged)?;

    println!("Upgraded to {latest_version}");
    Ok(())
}

/// Writes the downloaded binary next to the current executable with the
/// executable bit set.
fn stage_binary(current_exe: &Path, contents: &[u8]) -> Result<PathBuf> {
    let staged = current_exe.with_extension("staged");
    std::fs::write(&staged, contents)
        .with_context(|| format!("failed to stage binary at {}", staged.display()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut perms = std::fs::metadata(&staged)
            .context("failed to read staged binary metadata")?
            .permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&staged, perms)
            .context("failed to mark staged binary executable")?;
    }

    Ok(staged)
}

/// Moves `staged` over `current_exe`, keeping a `.bak` backup until the
/// swap succeeds. A failed swap restores the original binary.
fn replace_executable(current_exe: &Path, staged: &Path) -> Result<()> {
    anyhow::ensure!(
        staged.exists(),
        "staged binary missing at {}",
        staged.display()
    );

    let backup = current_exe.with_extension("bak");
    std::fs::rename(current_exe, &backup)
        .with_context(|| format!("failed to back up current binary to {}", backup.display()))?;

    if let Err(err) = std::fs::rename(staged, current_exe) {
        let _ = std::fs::rename(&backup, current_exe);
        return Err(err).with_context(|| {
            format!("failed to move staged binary into {}", current_exe.display())
        });
    }

    let _ = std::fs::remove_file(&backup);
    Ok(())
}
