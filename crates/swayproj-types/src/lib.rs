use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::env;
use std::path::PathBuf;

pub mod client;

pub const METHOD_PING: &str = "ping";
pub const METHOD_SHUTDOWN: &str = "shutdown";
pub const METHOD_GET_STATUS: &str = "get_status";
pub const METHOD_PROJECT_SWITCH: &str = "project.switch";
pub const METHOD_PROJECT_CLEAR: &str = "project.clear";
pub const METHOD_PROJECT_LIST: &str = "project.list";
pub const METHOD_MONITORS_STATUS: &str = "monitors.status";
pub const METHOD_MONITORS_APPLY: &str = "monitors.apply";
pub const METHOD_MONITORS_REASSIGN: &str = "monitors.reassign";
pub const METHOD_LAYOUT_SAVE: &str = "layout.save";
pub const METHOD_LAYOUT_RESTORE: &str = "layout.restore";
pub const METHOD_SUBSCRIBE_EVENTS: &str = "subscribe_events";
pub const METHOD_EVENT_NOTIFICATION: &str = "event_notification";

pub const ERR_INVALID_REQUEST: &str = "invalid_request";
pub const ERR_INVALID_PARAMS: &str = "invalid_params";
pub const ERR_NOT_FOUND: &str = "not_found";
pub const ERR_VALIDATION: &str = "validation";
pub const ERR_BUSY: &str = "busy";
pub const ERR_COMPOSITOR: &str = "compositor";
pub const ERR_PERSISTENCE: &str = "persistence";
pub const ERR_INTERNAL: &str = "internal";

/// Environment variable the launch wrapper must propagate onto the final
/// exec'd process so a new window can be correlated with its launch request.
pub const LAUNCH_TOKEN_ENV: &str = "SWAYPROJ_LAUNCH_TOKEN";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub id: u64,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub id: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

impl Response {
    pub fn ok(id: u64, result: Value) -> Self {
        Self {
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn err(id: u64, code: &str, message: impl Into<String>) -> Self {
        Self {
            id,
            result: None,
            error: Some(ErrorBody {
                code: code.to_string(),
                message: message.into(),
            }),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

/// Unsolicited daemon-originated message pushed to subscribed clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventNotification {
    pub method: String,
    pub params: Value,
}

impl EventNotification {
    pub fn new(event_type: &str, mut params: Value) -> Self {
        if let Value::Object(ref mut map) = params {
            map.insert(
                "event_type".to_string(),
                Value::String(event_type.to_string()),
            );
        }
        Self {
            method: METHOD_EVENT_NOTIFICATION.to_string(),
            params,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NameParams {
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestoreParams {
    pub project: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Project {
    pub name: String,
    pub display_name: String,
    pub directory: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub layout: Option<String>,
    #[serde(default)]
    pub scoped_classes: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActiveProject {
    pub name: String,
    pub activated_at: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputRole {
    Primary,
    Secondary,
    Tertiary,
    Overflow,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Geometry {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProfileOutput {
    pub name: String,
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<(i32, i32)>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolution: Option<(u32, u32)>,
    /// Remote-display service command for virtual outputs (started while the
    /// output is enabled, stopped when it is disabled).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_command: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitorProfile {
    pub name: String,
    pub outputs: Vec<ProfileOutput>,
}

impl MonitorProfile {
    pub fn enabled_outputs(&self) -> impl Iterator<Item = &ProfileOutput> {
        self.outputs.iter().filter(|output| output.enabled)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CurrentProfile {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputRecord {
    pub name: String,
    pub enabled: bool,
    pub role: OutputRole,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub geometry: Option<Geometry>,
}

/// Persisted mirror of compositor output state, rewritten only after a
/// profile switch fully succeeds.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OutputState {
    pub outputs: Vec<OutputRecord>,
    /// workspace number -> output name
    pub assignments: Vec<(u32, String)>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Placeholder {
    pub app_name: String,
    pub app_class: String,
    pub command: String,
    pub geometry: Geometry,
    pub focused: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkspaceLayout {
    pub workspace: u32,
    pub placeholders: Vec<Placeholder>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayoutSnapshot {
    pub name: String,
    pub saved_at: u64,
    pub workspaces: Vec<WorkspaceLayout>,
}

impl LayoutSnapshot {
    pub fn placeholder_count(&self) -> usize {
        self.workspaces
            .iter()
            .map(|workspace| workspace.placeholders.len())
            .sum()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlaceholderOutcome {
    Matched,
    Expired,
    LaunchFailed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlaceholderResult {
    pub app_name: String,
    pub workspace: u32,
    pub outcome: PlaceholderOutcome,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestoreSummary {
    pub layout: String,
    pub matched: usize,
    pub expired: usize,
    pub launch_failures: usize,
    pub placeholders: Vec<PlaceholderResult>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SaveResult {
    pub layout: String,
    pub windows: usize,
    pub workspaces: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectListResult {
    pub projects: Vec<Project>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwitchResult {
    pub project: String,
    pub shown: usize,
    pub hidden: usize,
    /// False when the project was already active and no commands were issued.
    pub changed: bool,
}

/// One successful launch correlation, kept in a bounded ring for
/// `get_status` diagnostics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LaunchMatch {
    pub token: String,
    pub app_name: String,
    pub window_id: u64,
    pub matched_at: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonStatus {
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_project: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_profile: Option<String>,
    pub tracked_windows: usize,
    pub pending_tokens: usize,
    pub switch_in_progress: bool,
    #[serde(default)]
    pub recent_matches: Vec<LaunchMatch>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProfilePhase {
    Started,
    OutputChanged,
    Reassigned,
    Completed,
    Failed,
    RolledBack,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfileEvent {
    pub at: u64,
    pub profile: String,
    pub phase: ProfilePhase,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorsStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_profile: Option<String>,
    pub state: OutputState,
    pub switch_in_progress: bool,
    pub recent_events: Vec<ProfileEvent>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReassignResult {
    pub moves: usize,
    pub outputs: usize,
}

pub fn default_socket_path() -> PathBuf {
    if let Ok(runtime_dir) = env::var("XDG_RUNTIME_DIR") {
        return PathBuf::from(runtime_dir).join("swayprojd.sock");
    }

    default_config_dir().join("swayprojd.sock")
}

pub fn default_config_dir() -> PathBuf {
    if let Some(config_dir) = dirs::config_dir() {
        return config_dir.join("swayproj");
    }

    if let Ok(home) = env::var("HOME") {
        return PathBuf::from(home).join(".config").join("swayproj");
    }

    PathBuf::from(".swayproj")
}

pub fn unix_time() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn response_error_serializes_code_and_message() {
        let response = Response::err(7, ERR_NOT_FOUND, "no such project");
        let raw = serde_json::to_string(&response).unwrap();
        assert!(raw.contains(r#""code":"not_found""#));
        assert!(raw.contains(r#""message":"no such project""#));
        assert!(!raw.contains("result"));
    }

    #[test]
    fn event_notification_injects_event_type() {
        let note = EventNotification::new(
            "project_switched",
            serde_json::json!({ "project": "blog" }),
        );
        assert_eq!(note.method, METHOD_EVENT_NOTIFICATION);
        assert_eq!(note.params["event_type"], "project_switched");
        assert_eq!(note.params["project"], "blog");
    }

    #[test]
    fn profile_enabled_outputs_filters_disabled() {
        let profile = MonitorProfile {
            name: "docked".to_string(),
            outputs: vec![
                ProfileOutput {
                    name: "eDP-1".to_string(),
                    enabled: false,
                    position: None,
                    resolution: None,
                    remote_command: None,
                },
                ProfileOutput {
                    name: "DP-3".to_string(),
                    enabled: true,
                    position: Some((0, 0)),
                    resolution: Some((2560, 1440)),
                    remote_command: None,
                },
            ],
        };
        let enabled: Vec<_> = profile.enabled_outputs().map(|o| o.name.as_str()).collect();
        assert_eq!(enabled, vec!["DP-3"]);
    }
}
