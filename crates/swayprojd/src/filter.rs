//! Project scoping: tracks every application window, classifies it as
//! project-bound or global, and plans the batched show/hide commands issued
//! on a project switch.

use anyhow::{Context, Result};
use regex::Regex;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use tracing::{debug, warn};

use swayproj_types::Project;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WindowScope {
    Global,
    Project(String),
}

#[derive(Debug, Clone)]
pub struct TrackedWindow {
    pub id: u64,
    pub pid: i32,
    pub class: String,
    pub workspace: u32,
    pub scope: WindowScope,
    pub hidden: bool,
    /// Workspace the window returns to when shown again.
    pub home_workspace: u32,
}

#[derive(Debug, Deserialize)]
struct RawRegistry {
    #[serde(default, rename = "application")]
    applications: Vec<RawRegistryEntry>,
}

#[derive(Debug, Deserialize)]
struct RawRegistryEntry {
    name: String,
    class: String,
    #[serde(default = "default_scope")]
    scope: String,
    #[serde(default)]
    command: Option<String>,
}

fn default_scope() -> String {
    "global".to_string()
}

#[derive(Debug)]
pub struct RegistryEntry {
    pub name: String,
    pub class_pattern: Regex,
    /// "global", "scoped" (bound via project scoped_classes), or a project name.
    pub scope: String,
    pub command: Option<String>,
}

/// Externally authored application-class registry (`class-registry.toml`).
#[derive(Debug, Default)]
pub struct ClassRegistry {
    entries: Vec<RegistryEntry>,
}

impl ClassRegistry {
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            debug!("class registry missing at {}, using empty", path.display());
            return Ok(Self::default());
        }
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read class registry: {}", path.display()))?;
        Self::parse(&raw)
    }

    pub fn parse(raw: &str) -> Result<Self> {
        let parsed: RawRegistry =
            toml::from_str(raw).context("invalid class-registry.toml (failed to parse TOML)")?;
        let mut entries = Vec::with_capacity(parsed.applications.len());
        for application in parsed.applications {
            let pattern = Regex::new(&format!("^(?:{})$", application.class)).with_context(
                || format!("invalid class pattern for '{}'", application.name),
            )?;
            entries.push(RegistryEntry {
                name: application.name,
                class_pattern: pattern,
                scope: application.scope,
                command: application.command,
            });
        }
        Ok(Self { entries })
    }

    /// First matching entry wins; entries are kept in file order.
    pub fn lookup(&self, class: &str) -> Option<&RegistryEntry> {
        self.entries
            .iter()
            .find(|entry| entry.class_pattern.is_match(class))
    }

}

/// Classify a window class through the static registry: an explicit project
/// name binds directly, "scoped" binds to the project listing the entry in
/// its scoped classes, anything else is global.
pub fn classify_class(
    class: &str,
    registry: &ClassRegistry,
    projects: &BTreeMap<String, Project>,
) -> WindowScope {
    let Some(entry) = registry.lookup(class) else {
        return WindowScope::Global;
    };
    match entry.scope.as_str() {
        "global" => WindowScope::Global,
        "scoped" => projects
            .values()
            .find(|project| project.scoped_classes.iter().any(|name| name == &entry.name))
            .map(|project| WindowScope::Project(project.name.clone()))
            .unwrap_or(WindowScope::Global),
        project_name => {
            if projects.contains_key(project_name) {
                WindowScope::Project(project_name.to_string())
            } else {
                warn!(
                    "registry entry '{}' names unknown project '{}', treating as global",
                    entry.name, project_name
                );
                WindowScope::Global
            }
        }
    }
}

/// Batched show/hide work for one switch. Pure data so it can be inspected
/// before any command is issued.
#[derive(Debug, Default, PartialEq)]
pub struct SwitchPlan {
    /// (container id, workspace to return to)
    pub show: Vec<(u64, u32)>,
    pub hide: Vec<u64>,
}

impl SwitchPlan {
    pub fn is_empty(&self) -> bool {
        self.show.is_empty() && self.hide.is_empty()
    }

    pub fn commands(&self) -> Vec<String> {
        let mut commands = Vec::with_capacity(self.show.len() + self.hide.len());
        for (id, workspace) in &self.show {
            commands.push(format!(
                "[con_id={id}] move container to workspace number {workspace}"
            ));
        }
        for id in &self.hide {
            commands.push(format!("[con_id={id}] move scratchpad"));
        }
        commands
    }
}

#[derive(Debug, Default)]
pub struct ProjectFilter {
    windows: BTreeMap<u64, TrackedWindow>,
}

impl ProjectFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tracked_count(&self) -> usize {
        self.windows.len()
    }

    pub fn window(&self, id: u64) -> Option<&TrackedWindow> {
        self.windows.get(&id)
    }

    /// Track (or re-track) a window. An explicit scope recorded at launch by
    /// the correlation engine always beats the static classification.
    pub fn upsert(
        &mut self,
        id: u64,
        pid: i32,
        class: String,
        workspace: u32,
        scope: WindowScope,
    ) {
        let entry = self.windows.entry(id).or_insert_with(|| TrackedWindow {
            id,
            pid,
            class: class.clone(),
            workspace,
            scope: scope.clone(),
            hidden: false,
            home_workspace: workspace,
        });
        entry.pid = pid;
        entry.class = class;
        entry.scope = scope;
        if !entry.hidden {
            entry.workspace = workspace;
            entry.home_workspace = workspace;
        }
    }

    pub fn on_window_moved(&mut self, id: u64, workspace: u32) {
        if let Some(window) = self.windows.get_mut(&id) {
            window.workspace = workspace;
            if !window.hidden {
                window.home_workspace = workspace;
            }
        }
    }

    /// Close drops tracking; no cascade.
    pub fn on_window_closed(&mut self, id: u64) {
        self.windows.remove(&id);
    }

    /// Visible set = global ∪ scoped-to-target; `None` shows everything.
    pub fn plan_switch(&self, target: Option<&str>) -> SwitchPlan {
        let mut plan = SwitchPlan::default();
        for window in self.windows.values() {
            let want_visible = match &window.scope {
                WindowScope::Global => true,
                WindowScope::Project(project) => {
                    target.map_or(true, |name| project == name)
                }
            };
            if want_visible && window.hidden {
                plan.show.push((window.id, window.home_workspace));
            } else if !want_visible && !window.hidden {
                plan.hide.push(window.id);
            }
        }
        plan
    }

    /// Record a plan as applied after the batch succeeded.
    pub fn mark_applied(&mut self, plan: &SwitchPlan) {
        for (id, workspace) in &plan.show {
            if let Some(window) = self.windows.get_mut(id) {
                window.hidden = false;
                window.workspace = *workspace;
            }
        }
        for id in &plan.hide {
            if let Some(window) = self.windows.get_mut(id) {
                window.hidden = true;
            }
        }
    }

    #[cfg(test)]
    fn visible_ids(&self) -> Vec<u64> {
        self.windows
            .values()
            .filter(|window| !window.hidden)
            .map(|window| window.id)
            .collect()
    }

    /// Forget windows the compositor no longer reports (tree resync).
    pub fn retain_ids(&mut self, live: &[u64]) {
        self.windows
            .retain(|id, window| live.contains(id) || window.hidden);
    }
}
