use std::collections::HashMap;

use anyhow::Result;

/// Full application configuration loaded from environment / .env file.
#[derive(Debug, Clone)]
pub struct Config {
    /// Bearer token required on every non-health route. Startup fails
    /// without it.
    pub auth_token: String,
    /// Identity of this worker in the fleet; only jobs whose
    /// `target_machine` matches are admitted here.
    pub machine_id: String,
    pub max_concurrent_jobs: usize,
    pub data_dir: String,
    /// Bare mirrors live under here as `{owner}__{repo}.git`.
    pub repos_dir: String,
    /// Per-job worktrees live under here as `{job-id}-{branch-slug}`.
    pub worktrees_dir: String,
    pub claude_bin: String,
    pub model: String,
    /// Hub CLI used for pull request creation.
    pub gh_bin: String,
    /// Used to authenticate mirror clones and pushes over HTTPS.
    pub github_token: String,

    pub web_bind: String,
    pub web_port: u16,
    pub queue_tick_s: u64,

    /// Per-invocation timeout for feedback commands.
    pub feedback_timeout_s: u64,
    /// Grace window between SIGTERM and SIGKILL when cancelling an agent.
    pub kill_grace_s: u64,
}

fn parse_dotenv() -> HashMap<String, String> {
    let mut map = HashMap::new();
    let Ok(contents) = std::fs::read_to_string(".env") else {
        return map;
    };
    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((k, v)) = line.split_once('=') {
            map.insert(k.trim().to_string(), v.trim().to_string());
        }
    }
    map
}

fn get(key: &str, dotenv: &HashMap<String, String>) -> Option<String> {
    std::env::var(key).ok().or_else(|| dotenv.get(key).cloned())
}

fn get_str(key: &str, dotenv: &HashMap<String, String>, default: &str) -> String {
    get(key, dotenv).unwrap_or_else(|| default.to_string())
}

fn get_u64(key: &str, dotenv: &HashMap<String, String>, default: u64) -> u64 {
    get(key, dotenv)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn get_u16(key: &str, dotenv: &HashMap<String, String>, default: u16) -> u16 {
    get(key, dotenv)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn get_usize(key: &str, dotenv: &HashMap<String, String>, default: usize) -> usize {
    get(key, dotenv)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn resolve_tilde(path: &str) -> String {
    if path.starts_with("~/") {
        if let Ok(home) = std::env::var("HOME") {
            return format!("{}/{}", home, &path[2..]);
        }
    }
    path.to_string()
}

fn default_machine_id() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.is_empty())
        .or_else(|| {
            std::process::Command::new("hostname")
                .output()
                .ok()
                .map(|o| String::from_utf8_lossy(&o.stdout).trim().to_string())
                .filter(|h| !h.is_empty())
        })
        .unwrap_or_else(|| "local".to_string())
}

impl Default for Config {
    fn default() -> Self {
        Self {
            auth_token: String::new(),
            machine_id: "local".to_string(),
            max_concurrent_jobs: 2,
            data_dir: "data".to_string(),
            repos_dir: "data/repos".to_string(),
            worktrees_dir: "data/worktrees".to_string(),
            claude_bin: "claude".to_string(),
            model: "claude-sonnet-4-6".to_string(),
            gh_bin: "gh".to_string(),
            github_token: String::new(),
            web_bind: "0.0.0.0".to_string(),
            web_port: 8080,
            queue_tick_s: 15,
            feedback_timeout_s: 120,
            kill_grace_s: 5,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let dotenv = parse_dotenv();

        let data_dir = get_str("DATA_DIR", &dotenv, "data");
        let repos_dir = get_str("REPOS_DIR", &dotenv, &format!("{data_dir}/repos"));
        let worktrees_dir = get_str("WORKTREES_DIR", &dotenv, &format!("{data_dir}/worktrees"));

        Ok(Self {
            auth_token: get_str("FOREMAN_AUTH_TOKEN", &dotenv, ""),
            machine_id: get("MACHINE_ID", &dotenv).unwrap_or_else(default_machine_id),
            max_concurrent_jobs: get_usize("MAX_CONCURRENT_JOBS", &dotenv, 2),
            data_dir,
            repos_dir,
            worktrees_dir,
            claude_bin: resolve_tilde(&get_str("CLAUDE_BIN", &dotenv, "~/.local/bin/claude")),
            model: get_str("MODEL", &dotenv, "claude-sonnet-4-6"),
            gh_bin: get_str("GH_BIN", &dotenv, "gh"),
            github_token: get_str("GITHUB_TOKEN", &dotenv, ""),
            web_bind: get_str("WEB_BIND", &dotenv, "0.0.0.0"),
            web_port: get_u16("WEB_PORT", &dotenv, 8080),
            queue_tick_s: get_u64("QUEUE_TICK_S", &dotenv, 15),
            feedback_timeout_s: get_u64("FEEDBACK_TIMEOUT_S", &dotenv, 120),
            kill_grace_s: get_u64("KILL_GRACE_S", &dotenv, 5),
        })
    }
}
