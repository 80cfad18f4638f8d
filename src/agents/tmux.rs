//! Tmux session management abstraction layer.
//!
//! Provides a trait-based abstraction over tmux operations to enable:
//! - Unit testing without real tmux
//! - Mocking pane behavior
//! - Graceful handling when tmux is unavailable
//!
//! Every agent owns one session named `overstory-{project}-{agent}`;
//! kill operations are restricted to sessions registered in the
//! SessionStore, which callers enforce before reaching this layer.

use std::collections::HashMap;
use std::process::{Command, Output};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use sha2::{Digest, Sha256};
use thiserror::Error;

/// Errors specific to tmux operations.
#[derive(Error, Debug)]
pub enum TmuxError {
    #[error("tmux is not installed or not in PATH")]
    NotInstalled,

    #[error("tmux version {0} is below minimum required version {1}")]
    VersionTooOld(String, String),

    #[error(
        "tmux server is not running (if you are root, note that tmux sockets \
         are per-user; run overstory as the operator user that owns the agents)"
    )]
    ServerNotRunning,

    #[error("session '{0}' already exists")]
    SessionExists(String),

    #[error("session '{0}' not found")]
    SessionNotFound(String),

    #[error("failed to create session '{0}': {1}")]
    SessionCreationFailed(String, String),

    #[error("failed to send keys to session '{0}': {1}")]
    SendKeysFailed(String, String),

    #[error("tmux command failed: {0}")]
    CommandFailed(String),
}

impl From<TmuxError> for crate::errors::Error {
    fn from(err: TmuxError) -> Self {
        crate::errors::Error::Agent(err.to_string())
    }
}

/// Version information for tmux.
#[derive(Debug, Clone, PartialEq)]
pub struct TmuxVersion {
    pub major: u32,
    pub minor: u32,
    pub raw: String,
}

impl TmuxVersion {
    /// Parse a version string like "tmux 3.4" or "tmux 3.3a".
    pub fn parse(version_str: &str) -> Option<Self> {
        let parts: Vec<&str> = version_str.split_whitespace().collect();
        if parts.len() < 2 {
            return None;
        }

        let numeric_part: String = parts[1]
            .chars()
            .take_while(|c| c.is_ascii_digit() || *c == '.')
            .collect();

        let mut version_nums = numeric_part.split('.');
        let major: u32 = version_nums.next()?.parse().ok()?;
        let minor: u32 = version_nums.next().unwrap_or("0").parse().unwrap_or(0);

        Some(Self {
            major,
            minor,
            raw: version_str.to_string(),
        })
    }

    pub fn meets_minimum(&self, min_major: u32, min_minor: u32) -> bool {
        self.major > min_major || (self.major == min_major && self.minor >= min_minor)
    }
}

/// Minimum tmux version: 3.2 introduced `-e` on `new-session`, which the
/// scheduler relies on to inject `OVERSTORY_AGENT_NAME` into panes.
pub const MIN_TMUX: (u32, u32) = (3, 2);

/// Trait abstracting tmux operations for testability.
pub trait TmuxClient: Send + Sync {
    /// Check if tmux is available and return version info.
    fn check_available(&self) -> Result<TmuxVersion, TmuxError>;

    /// Whether a session with this exact name is alive.
    fn is_session_alive(&self, name: &str) -> Result<bool, TmuxError>;

    /// Create a detached session running `command` in `cwd` with extra
    /// environment variables.
    fn create_session(
        &self,
        name: &str,
        cwd: &str,
        command: &str,
        env: &HashMap<String, String>,
    ) -> Result<(), TmuxError>;

    /// Type `keys` into the session's pane, optionally pressing Enter.
    fn send_keys(&self, session: &str, keys: &str, press_enter: bool) -> Result<(), TmuxError>;

    /// Press Enter alone (explicit submit keypress).
    fn send_enter(&self, session: &str) -> Result<(), TmuxError> {
        self.send_keys(session, "", true)
    }

    /// Tear down the session. Callers kill the process tree first; this
    /// only removes the tmux container.
    fn kill_session(&self, name: &str) -> Result<(), TmuxError>;

    /// Session names, optionally filtered by prefix.
    fn list_sessions(&self, prefix: Option<&str>) -> Result<Vec<String>, TmuxError>;

    /// Capture the pane's current content.
    fn capture_pane(&self, session: &str) -> Result<String, TmuxError>;

    /// Root process of the session's pane.
    fn pane_pid(&self, session: &str) -> Result<Option<i32>, TmuxError>;

    /// The session this process itself runs inside, if any.
    fn current_session_name(&self) -> Result<Option<String>, TmuxError>;
}

/// Real implementation using system tmux.
pub struct SystemTmuxClient;

impl SystemTmuxClient {
    pub fn new() -> Self {
        Self
    }

    fn run_tmux(&self, args: &[&str]) -> Result<Output, TmuxError> {
        Command::new("tmux").args(args).output().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                TmuxError::NotInstalled
            } else {
                TmuxError::CommandFailed(e.to_string())
            }
        })
    }
}

impl Default for SystemTmuxClient {
    fn default() -> Self {
        Self::new()
    }
}

fn stderr_means_no_server(stderr: &str) -> bool {
    stderr.contains("no server running") || stderr.contains("error connecting to")
}

impl TmuxClient for SystemTmuxClient {
    fn check_available(&self) -> Result<TmuxVersion, TmuxError> {
        let output = self.run_tmux(&["-V"])?;
        if !output.status.success() {
            return Err(TmuxError::NotInstalled);
        }
        let version_str = String::from_utf8_lossy(&output.stdout);
        TmuxVersion::parse(version_str.trim()).ok_or_else(|| {
            TmuxError::CommandFailed(format!("could not parse version: {version_str}"))
        })
    }

    fn is_session_alive(&self, name: &str) -> Result<bool, TmuxError> {
        // Exact match with -t=
        let output = self.run_tmux(&["has-session", "-t", &format!("={name}")]);
        match output {
            Ok(out) => Ok(out.status.success()),
            Err(TmuxError::NotInstalled) => Err(TmuxError::NotInstalled),
            Err(_) => Ok(false), // server not running means no session
        }
    }

    fn create_session(
        &self,
        name: &str,
        cwd: &str,
        command: &str,
        env: &HashMap<String, String>,
    ) -> Result<(), TmuxError> {
        if self.is_session_alive(name)? {
            return Err(TmuxError::SessionExists(name.to_string()));
        }

        let mut args: Vec<String> = vec![
            "new-session".to_string(),
            "-d".to_string(),
            "-s".to_string(),
            name.to_string(),
            "-c".to_string(),
            cwd.to_string(),
        ];
        let mut env_sorted: Vec<_> = env.iter().collect();
        env_sorted.sort();
        for (key, value) in env_sorted {
            args.push("-e".to_string());
            args.push(format!("{key}={value}"));
        }
        args.push(command.to_string());

        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        let output = self.run_tmux(&arg_refs)?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(TmuxError::SessionCreationFailed(
                name.to_string(),
                stderr.to_string(),
            ));
        }
        Ok(())
    }

    fn send_keys(&self, session: &str, keys: &str, press_enter: bool) -> Result<(), TmuxError> {
        let mut args = vec!["send-keys", "-t", session];
        if !keys.is_empty() {
            args.push(keys);
        }
        if press_enter {
            args.push("Enter");
        }

        let output = self.run_tmux(&args)?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if stderr_means_no_server(&stderr) {
                return Err(TmuxError::ServerNotRunning);
            }
            if stderr.contains("can't find") {
                return Err(TmuxError::SessionNotFound(session.to_string()));
            }
            return Err(TmuxError::SendKeysFailed(
                session.to_string(),
                stderr.to_string(),
            ));
        }
        Ok(())
    }

    fn kill_session(&self, name: &str) -> Result<(), TmuxError> {
        let output = self.run_tmux(&["kill-session", "-t", &format!("={name}")])?;
        if !output.status.success() {
            return Err(TmuxError::SessionNotFound(name.to_string()));
        }
        Ok(())
    }

    fn list_sessions(&self, prefix: Option<&str>) -> Result<Vec<String>, TmuxError> {
        let output = self.run_tmux(&["list-sessions", "-F", "#{session_name}"]);
        match output {
            Ok(out) if out.status.success() => {
                let stdout = String::from_utf8_lossy(&out.stdout);
                Ok(stdout
                    .lines()
                    .filter(|name| prefix.is_none_or(|p| name.starts_with(p)))
                    .map(ToString::to_string)
                    .collect())
            }
            Ok(_) => Ok(Vec::new()), // no sessions or server not running
            Err(TmuxError::NotInstalled) => Err(TmuxError::NotInstalled),
            Err(_) => Ok(Vec::new()),
        }
    }

    fn capture_pane(&self, session: &str) -> Result<String, TmuxError> {
        let output = self.run_tmux(&["capture-pane", "-p", "-t", session])?;
        if !output.status.success() {
            return Err(TmuxError::SessionNotFound(session.to_string()));
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    fn pane_pid(&self, session: &str) -> Result<Option<i32>, TmuxError> {
        let output = self.run_tmux(&["display-message", "-p", "-t", session, "#{pane_pid}"])?;
        if !output.status.success() {
            return Err(TmuxError::SessionNotFound(session.to_string()));
        }
        let raw = String::from_utf8_lossy(&output.stdout).trim().to_string();
        Ok(raw.parse().ok())
    }

    fn current_session_name(&self) -> Result<Option<String>, TmuxError> {
        if std::env::var_os("TMUX").is_none() {
            return Ok(None);
        }
        let output = self.run_tmux(&["display-message", "-p", "#S"])?;
        if !output.status.success() {
            return Ok(None);
        }
        let name = String::from_utf8_lossy(&output.stdout).trim().to_string();
        Ok(if name.is_empty() { None } else { Some(name) })
    }
}

/// Polling parameters for [`wait_for_tui_ready`].
#[derive(Debug, Clone)]
pub struct TuiReadyParams {
    pub timeout: Duration,
    pub poll: Duration,
    /// Consecutive identical captures required before input is safe.
    pub stable_polls: u32,
}

impl Default for TuiReadyParams {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(15),
            poll: Duration::from_millis(500),
            stable_polls: 2,
        }
    }
}

/// Poll the pane until its content stabilizes (same hash across consecutive
/// polls) or the deadline passes. Returns `true` once input is safe to send.
pub fn wait_for_tui_ready(tmux: &dyn TmuxClient, session: &str) -> Result<bool, TmuxError> {
    wait_for_tui_ready_with(tmux, session, &TuiReadyParams::default())
}

pub fn wait_for_tui_ready_with(
    tmux: &dyn TmuxClient,
    session: &str,
    params: &TuiReadyParams,
) -> Result<bool, TmuxError> {
    let deadline = Instant::now() + params.timeout;
    let mut last_hash: Option<[u8; 32]> = None;
    let mut stable = 0u32;

    loop {
        let content = tmux.capture_pane(session)?;
        let hash: [u8; 32] = Sha256::digest(content.as_bytes()).into();

        if last_hash == Some(hash) {
            stable += 1;
            if stable >= params.stable_polls {
                return Ok(true);
            }
        } else {
            stable = 0;
        }
        last_hash = Some(hash);

        if Instant::now() >= deadline {
            return Ok(false);
        }
        std::thread::sleep(params.poll);
    }
}

/// Sanitize a string for use as a tmux session name.
pub fn sanitize_session_name(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '-'
            }
        })
        .collect()
}

// ============================================================================
// Mock implementation for testing
// ============================================================================

#[derive(Debug, Clone)]
pub struct MockSession {
    pub cwd: String,
    pub command: String,
    pub env: HashMap<String, String>,
    pub content: String,
    pub keys_sent: Vec<String>,
    pub pane_pid: Option<i32>,
}

#[derive(Default)]
pub struct MockTmuxClient {
    sessions: Arc<Mutex<HashMap<String, MockSession>>>,
    pub installed: Arc<Mutex<bool>>,
    pub server_running: Arc<Mutex<bool>>,
    pub command_log: Arc<Mutex<Vec<String>>>,
}

impl MockTmuxClient {
    pub fn new() -> Self {
        Self {
            sessions: Arc::new(Mutex::new(HashMap::new())),
            installed: Arc::new(Mutex::new(true)),
            server_running: Arc::new(Mutex::new(true)),
            command_log: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Simulate tmux not being installed.
    pub fn not_installed() -> Self {
        let mock = Self::new();
        *mock.installed.lock().unwrap() = false;
        mock
    }

    /// Simulate the server being down.
    pub fn server_down() -> Self {
        let mock = Self::new();
        *mock.server_running.lock().unwrap() = false;
        mock
    }

    /// Add a pre-existing session (e.g. one a test pretends was spawned
    /// in a previous process).
    pub fn add_session(&self, name: &str, cwd: &str) {
        self.sessions.lock().unwrap().insert(
            name.to_string(),
            MockSession {
                cwd: cwd.to_string(),
                command: String::new(),
                env: HashMap::new(),
                content: String::new(),
                keys_sent: Vec::new(),
                pane_pid: Some(4242),
            },
        );
    }

    /// Simulate external death of a pane (e.g. `kill -9`).
    pub fn drop_session(&self, name: &str) {
        self.sessions.lock().unwrap().remove(name);
    }

    pub fn set_content(&self, name: &str, content: &str) {
        if let Some(session) = self.sessions.lock().unwrap().get_mut(name) {
            session.content = content.to_string();
        }
    }

    pub fn session(&self, name: &str) -> Option<MockSession> {
        self.sessions.lock().unwrap().get(name).cloned()
    }

    pub fn keys_sent(&self, name: &str) -> Vec<String> {
        self.sessions
            .lock()
            .unwrap()
            .get(name)
            .map(|s| s.keys_sent.clone())
            .unwrap_or_default()
    }

    fn log(&self, op: &str) {
        self.command_log.lock().unwrap().push(op.to_string());
    }

    fn check_installed(&self) -> Result<(), TmuxError> {
        if *self.installed.lock().unwrap() {
            Ok(())
        } else {
            Err(TmuxError::NotInstalled)
        }
    }
}

impl TmuxClient for MockTmuxClient {
    fn check_available(&self) -> Result<TmuxVersion, TmuxError> {
        self.log("check_available");
        self.check_installed()?;
        Ok(TmuxVersion {
            major: 3,
            minor: 4,
            raw: "tmux 3.4".to_string(),
        })
    }

    fn is_session_alive(&self, name: &str) -> Result<bool, TmuxError> {
        self.log("is_session_alive");
        self.check_installed()?;
        if !*self.server_running.lock().unwrap() {
            return Ok(false);
        }
        Ok(self.sessions.lock().unwrap().contains_key(name))
    }

    fn create_session(
        &self,
        name: &str,
        cwd: &str,
        command: &str,
        env: &HashMap<String, String>,
    ) -> Result<(), TmuxError> {
        self.log("create_session");
        self.check_installed()?;
        let mut sessions = self.sessions.lock().unwrap();
        if sessions.contains_key(name) {
            return Err(TmuxError::SessionExists(name.to_string()));
        }
        sessions.insert(
            name.to_string(),
            MockSession {
                cwd: cwd.to_string(),
                command: command.to_string(),
                env: env.clone(),
                content: String::new(),
                keys_sent: Vec::new(),
                pane_pid: Some(4242),
            },
        );
        // a fresh server comes up with the first session
        *self.server_running.lock().unwrap() = true;
        Ok(())
    }

    fn send_keys(&self, session: &str, keys: &str, press_enter: bool) -> Result<(), TmuxError> {
        self.log("send_keys");
        self.check_installed()?;
        if !*self.server_running.lock().unwrap() {
            return Err(TmuxError::ServerNotRunning);
        }
        let mut sessions = self.sessions.lock().unwrap();
        let Some(s) = sessions.get_mut(session) else {
            return Err(TmuxError::SessionNotFound(session.to_string()));
        };
        let mut record = keys.to_string();
        if press_enter {
            record.push_str(" [Enter]");
        }
        s.keys_sent.push(record);
        Ok(())
    }

    fn kill_session(&self, name: &str) -> Result<(), TmuxError> {
        self.log("kill_session");
        self.check_installed()?;
        if self.sessions.lock().unwrap().remove(name).is_some() {
            Ok(())
        } else {
            Err(TmuxError::SessionNotFound(name.to_string()))
        }
    }

    fn list_sessions(&self, prefix: Option<&str>) -> Result<Vec<String>, TmuxError> {
        self.log("list_sessions");
        self.check_installed()?;
        if !*self.server_running.lock().unwrap() {
            return Ok(Vec::new());
        }
        let mut names: Vec<String> = self
            .sessions
            .lock()
            .unwrap()
            .keys()
            .filter(|name| prefix.is_none_or(|p| name.starts_with(p)))
            .cloned()
            .collect();
        names.sort();
        Ok(names)
    }

    fn capture_pane(&self, session: &str) -> Result<String, TmuxError> {
        self.log("capture_pane");
        self.check_installed()?;
        self.sessions
            .lock()
            .unwrap()
            .get(session)
            .map(|s| s.content.clone())
            .ok_or_else(|| TmuxError::SessionNotFound(session.to_string()))
    }

    fn pane_pid(&self, session: &str) -> Result<Option<i32>, TmuxError> {
        self.log("pane_pid");
        self.check_installed()?;
        self.sessions
            .lock()
            .unwrap()
            .get(session)
            .map(|s| s.pane_pid)
            .ok_or_else(|| TmuxError::SessionNotFound(session.to_string()))
    }

    fn current_session_name(&self) -> Result<Option<String>, TmuxError> {
        self.log("current_session_name");
        self.check_installed()?;
        Ok(None)
    }
}
