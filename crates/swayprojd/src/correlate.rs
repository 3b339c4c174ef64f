//! Launch correlation: pairs "a launch was requested" with "a window
//! appeared" by reading the launch token out of the owning process's
//! environment.
//!
//! The external launch wrapper must carry the token env var through to the
//! final exec'd process; when that contract is silently broken the ppid
//! ancestry walk is a second chance, and the expiry sweep is the backstop.

use anyhow::{Context, Result};
use rand::Rng;
use std::collections::VecDeque;
use std::fs;
use std::path::PathBuf;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tracing::{debug, trace, warn};

use swayproj_types::{Geometry, LaunchMatch, LAUNCH_TOKEN_ENV};

/// Default expiry deadline for pending entries.
pub const CORRELATION_TIMEOUT: Duration = Duration::from_secs(30);

/// How far up the process tree to look for the token when the window's own
/// environment lacks it.
const ANCESTRY_DEPTH: usize = 5;

/// Matched-token diagnostics kept for `get_status` debugging.
const MATCHED_RING_CAPACITY: usize = 32;

#[derive(Debug, Clone)]
pub struct PendingLaunch {
    pub token: String,
    pub app_name: String,
    pub expected_class: String,
    pub workspace: u32,
    pub project: Option<String>,
    pub geometry: Option<Geometry>,
    pub focused: bool,
    pub expires_at: Instant,
}

/// Outcome of a successful correlation, consumed by the filter (scope) and
/// layout restore (geometry/focus).
#[derive(Debug, Clone)]
pub struct CorrelationMatch {
    pub token: String,
    pub app_name: String,
    pub workspace: u32,
    pub project: Option<String>,
    pub geometry: Option<Geometry>,
    pub focused: bool,
}

pub struct CorrelationEngine {
    pending: Vec<PendingLaunch>,
    matched: VecDeque<LaunchMatch>,
    proc_root: PathBuf,
    sequence: u64,
}

impl CorrelationEngine {
    pub fn new() -> Self {
        Self::with_proc_root(PathBuf::from("/proc"))
    }

    /// The proc root is overridable so tests can fabricate process trees.
    pub fn with_proc_root(proc_root: PathBuf) -> Self {
        Self {
            pending: Vec::new(),
            matched: VecDeque::new(),
            proc_root,
            sequence: 0,
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn recent_matches(&self) -> impl Iterator<Item = &LaunchMatch> {
        self.matched.iter()
    }

    /// Mint a one-time token: app name, millisecond timestamp, a monotonic
    /// sequence, and a random suffix.
    pub fn generate_token(&mut self, app_name: &str) -> String {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_millis())
            .unwrap_or(0);
        self.sequence += 1;
        let suffix: u16 = rand::thread_rng().gen();
        format!("{app_name}-{millis}-{seq:x}-{suffix:04x}", seq = self.sequence)
    }

    pub fn register(&mut self, entry: PendingLaunch) {
        debug!(
            token = %entry.token,
            app = %entry.app_name,
            workspace = entry.workspace,
            "registered pending launch"
        );
        self.pending.push(entry);
    }

    /// Correlate a freshly appeared window. Reads the owning process's
    /// environment (then its ancestors') for the token; entries are checked
    /// in registration order, so the first-registered entry wins. The token
    /// is authoritative even when the window class differs from the one the
    /// launch expected; a mismatch is only logged.
    pub fn on_window_new(
        &mut self,
        window_id: u64,
        pid: i32,
        class: &str,
    ) -> Option<CorrelationMatch> {
        if self.pending.is_empty() || pid <= 0 {
            return None;
        }

        let token = match self.discover_token(pid) {
            Ok(Some(token)) => token,
            Ok(None) => {
                trace!(pid, "no launch token in process environment");
                return None;
            }
            Err(err) => {
                debug!(pid, "failed to inspect process environment: {err:#}");
                return None;
            }
        };

        let index = self
            .pending
            .iter()
            .position(|entry| entry.token == token)?;
        let entry = self.pending.remove(index);
        if !entry.expected_class.is_empty() && entry.expected_class != class {
            warn!(
                token = %entry.token,
                expected = %entry.expected_class,
                actual = class,
                "correlated window class differs from the launched application"
            );
        }
        self.matched.push_back(LaunchMatch {
            token: entry.token.clone(),
            app_name: entry.app_name.clone(),
            window_id,
            matched_at: swayproj_types::unix_time(),
        });
        while self.matched.len() > MATCHED_RING_CAPACITY {
            self.matched.pop_front();
        }

        debug!(token = %entry.token, window_id, "correlated launch with window");
        Some(CorrelationMatch {
            token: entry.token,
            app_name: entry.app_name,
            workspace: entry.workspace,
            project: entry.project,
            geometry: entry.geometry,
            focused: entry.focused,
        })
    }

    /// Remove and return entries whose deadline has passed.
    pub fn sweep_expired(&mut self, now: Instant) -> Vec<PendingLaunch> {
        let mut expired = Vec::new();
        self.pending.retain(|entry| {
            if entry.expires_at <= now {
                expired.push(entry.clone());
                false
            } else {
                true
            }
        });
        for entry in &expired {
            debug!(token = %entry.token, app = %entry.app_name, "launch token expired");
        }
        expired
    }

    fn discover_token(&self, pid: i32) -> Result<Option<String>> {
        if let Some(token) = self.read_token(pid)? {
            return Ok(Some(token));
        }

        // The wrapper contract sometimes breaks mid-chain; an ancestor shell
        // may still carry the variable.
        let mut current = pid;
        for _ in 0..ANCESTRY_DEPTH {
            let Some(parent) = self.parent_pid(current) else {
                break;
            };
            if parent <= 1 {
                break;
            }
            if let Some(token) = self.read_token(parent)? {
                trace!(pid, ancestor = parent, "token found via process ancestry");
                return Ok(Some(token));
            }
            current = parent;
        }

        Ok(None)
    }

    fn read_token(&self, pid: i32) -> Result<Option<String>> {
        let path = self.proc_root.join(pid.to_string()).join("environ");
        let raw = match fs::read(&path) {
            Ok(raw) => raw,
            // The process may already be gone; that is a not-found, not an error.
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) if err.kind() == std::io::ErrorKind::PermissionDenied => return Ok(None),
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("failed to read {}", path.display()))
            }
        };
        Ok(find_token_var(&raw))
    }

    fn parent_pid(&self, pid: i32) -> Option<i32> {
        let path = self.proc_root.join(pid.to_string()).join("stat");
        let raw = fs::read_to_string(path).ok()?;
        parse_stat_ppid(&raw)
    }
}

fn find_token_var(environ: &[u8]) -> Option<String> {
    let prefix = format!("{LAUNCH_TOKEN_ENV}=");
    environ
        .split(|byte| *byte == 0)
        .filter_map(|entry| std::str::from_utf8(entry).ok())
        .find_map(|entry| entry.strip_prefix(prefix.as_str()))
        .filter(|token| !token.is_empty())
        .map(ToString::to_string)
}

/// The ppid is the second field after the parenthesized comm, which itself
/// may contain spaces and parentheses; split after the last ')'.
fn parse_stat_ppid(stat: &str) -> Option<i32> {
    let after_comm = &stat[stat.rfind(')')? + 1..];
    after_comm
        .split_whitespace()
        .nth(1)
        .and_then(|field| field.parse::<i32>().ok())
}

/// Millisecond override from the environment, for integration tests and
/// slow setups.
pub(crate) fn duration_from_env(var: &str, default: Duration) -> Duration {
    std::env::var(var)
        .ok()
        .and_then(|raw| raw.trim().parse::<u64>().ok())
        .map(Duration::from_millis)
        .unwrap_or(default)
}

pub fn correlation_timeout() -> Duration {
    duration_from_env("SWAYPROJD_CORRELATION_TIMEOUT_MS", CORRELATION_TIMEOUT)
}

pub fn expiry_from_now(now: Instant) -> Instant {
    now + correlation_timeout()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::path::Path;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn unique_temp_dir(label: &str) -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock drift before unix epoch")
            .as_nanos();
        let dir = std::env::temp_dir().join(format!("swayprojd-ut-{label}-{nanos}"));
        fs::create_dir_all(&dir).expect("failed to create temp dir");
        dir
    }

    fn write_fake_process(
        root: &Path,
        pid: i32,
        ppid: Option<i32>,
        env: &[(&str, &str)],
    ) {
        let dir = root.join(pid.to_string());
        fs::create_dir_all(&dir).unwrap();
        let mut environ = Vec::new();
        for (key, value) in env {
            environ.extend_from_slice(format!("{key}={value}").as_bytes());
            environ.push(0);
        }
        fs::write(dir.join("environ"), environ).unwrap();
        if let Some(ppid) = ppid {
            fs::write(
                dir.join("stat"),
                format!("{pid} (some cmd (odd)) S {ppid} 1 1 0 -1"),
            )
            .unwrap();
        }
    }

    fn pending(token: &str, app: &str, workspace: u32) -> PendingLaunch {
        PendingLaunch {
            token: token.to_string(),
            app_name: app.to_string(),
            expected_class: app.to_string(),
            workspace,
            project: None,
            geometry: None,
            focused: false,
            expires_at: Instant::now() + CORRELATION_TIMEOUT,
        }
    }

    #[test]
    fn ten_thousand_tokens_have_no_duplicates() {
        let mut engine = CorrelationEngine::new();
        let mut seen = HashSet::new();
        for _ in 0..10_000 {
            assert!(seen.insert(engine.generate_token("term")));
        }
    }

    #[test]
    fn matches_window_by_environment_token() {
        let root = unique_temp_dir("env-match");
        write_fake_process(&root, 4321, None, &[(LAUNCH_TOKEN_ENV, "term-1-1-aa")]);

        let mut engine = CorrelationEngine::with_proc_root(root.clone());
        engine.register(pending("term-1-1-aa", "term", 3));

        let matched = engine
            .on_window_new(99, 4321, "term")
            .expect("expected a match");
        assert_eq!(matched.workspace, 3);
        assert_eq!(engine.pending_count(), 0);
        assert_eq!(engine.recent_matches().count(), 1);
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn falls_back_to_ancestor_environment() {
        let root = unique_temp_dir("ancestry");
        // The exec'd process lost the variable; its grandparent wrapper kept it.
        write_fake_process(&root, 300, Some(200), &[("PATH", "/bin")]);
        write_fake_process(&root, 200, Some(100), &[("HOME", "/root")]);
        write_fake_process(&root, 100, None, &[(LAUNCH_TOKEN_ENV, "ed-9-1-ff")]);

        let mut engine = CorrelationEngine::with_proc_root(root.clone());
        engine.register(pending("ed-9-1-ff", "ed", 2));

        assert!(engine.on_window_new(7, 300, "ed").is_some());
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn class_mismatch_still_matches_by_token() {
        let root = unique_temp_dir("class-mismatch");
        write_fake_process(&root, 600, None, &[(LAUNCH_TOKEN_ENV, "term-2-1-bb")]);

        let mut engine = CorrelationEngine::with_proc_root(root.clone());
        engine.register(pending("term-2-1-bb", "term", 4));

        // The launch expected "term" but the window reports another class;
        // the token still decides.
        let matched = engine.on_window_new(8, 600, "footclient").unwrap();
        assert_eq!(matched.app_name, "term");
        assert_eq!(engine.recent_matches().count(), 1);
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn untokened_window_is_left_for_static_classification() {
        let root = unique_temp_dir("untokened");
        write_fake_process(&root, 555, None, &[("PATH", "/bin")]);

        let mut engine = CorrelationEngine::with_proc_root(root.clone());
        engine.register(pending("x-1-1-00", "x", 1));

        assert!(engine.on_window_new(1, 555, "x").is_none());
        assert_eq!(engine.pending_count(), 1);
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn first_registered_entry_wins_on_duplicate_tokens() {
        let root = unique_temp_dir("dup");
        write_fake_process(&root, 10, None, &[(LAUNCH_TOKEN_ENV, "dup-1")]);

        let mut engine = CorrelationEngine::with_proc_root(root.clone());
        let mut first = pending("dup-1", "a", 1);
        first.workspace = 1;
        let mut second = pending("dup-1", "b", 2);
        second.workspace = 2;
        engine.register(first);
        engine.register(second);

        let matched = engine.on_window_new(1, 10, "a").unwrap();
        assert_eq!(matched.app_name, "a");
        assert_eq!(engine.pending_count(), 1);
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn sweep_reports_expired_entries() {
        let mut engine = CorrelationEngine::new();
        let mut stale = pending("old-1", "old", 1);
        stale.expires_at = Instant::now() - Duration::from_secs(1);
        engine.register(stale);
        engine.register(pending("fresh-1", "fresh", 2));

        let expired = engine.sweep_expired(Instant::now());
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].token, "old-1");
        assert_eq!(engine.pending_count(), 1);
    }

    #[test]
    fn stat_ppid_survives_parens_in_comm() {
        assert_eq!(parse_stat_ppid("42 (a (weird) name) S 7 42 42"), Some(7));
        assert_eq!(parse_stat_ppid("1 (init) S 0 1 1"), Some(0));
        assert_eq!(parse_stat_ppid("garbage"), None);
    }

    #[test]
    fn timeout_env_override_parses_milliseconds() {
        std::env::set_var("SWAYPROJD_UT_TIMEOUT_MS", "250");
        assert_eq!(
            duration_from_env("SWAYPROJD_UT_TIMEOUT_MS", CORRELATION_TIMEOUT),
            Duration::from_millis(250)
        );
        std::env::set_var("SWAYPROJD_UT_TIMEOUT_MS", "junk");
        assert_eq!(
            duration_from_env("SWAYPROJD_UT_TIMEOUT_MS", CORRELATION_TIMEOUT),
            CORRELATION_TIMEOUT
        );
        std::env::remove_var("SWAYPROJD_UT_TIMEOUT_MS");
    }

    #[test]
    fn environ_parsing_ignores_other_variables() {
        let raw = b"PATH=/bin\0SWAYPROJ_LAUNCH_TOKEN=term-5-2-ab\0HOME=/root\0";
        assert_eq!(find_token_var(raw), Some("term-5-2-ab".to_string()));
        assert_eq!(find_token_var(b"PATH=/bin\0"), None);
    }
}
