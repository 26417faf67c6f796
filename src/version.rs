/// Crate version, stamped by Cargo at build time.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Formatted multi-line version information for `claude-tasks version`.
pub fn info() -> String {
    let commit = option_env!("CLAUDE_TASKS_COMMIT").unwrap_or("unknown");
    let build_date = option_env!("CLAUDE_TASKS_BUILD_DATE").unwrap_or("unknown");
    format!(
        "claude-tasks {VERSION}\nCommit: {commit}\nBuilt: {build_date}\nOS/Arch: {}/{}",
        std::env::consts::OS,
        std::env::consts::ARCH
    )
}

/// User agent for outbound HTTP requests.
pub fn user_agent() -> String {
    format!("claude-tasks/{VERSION}")
}
