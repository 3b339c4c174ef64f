//! Layout capture and restore.
//!
//! Capture walks the compositor tree and records one placeholder per window
//! whose class has a launch command in the registry. Restore is deferred: it
//! spawns the placeholder commands with correlation tokens and completes from
//! the main loop as matches (or expiries) arrive, reporting partial success
//! rather than blocking.

use anyhow::{bail, Result};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use swayproj_types::{
    Geometry, LayoutSnapshot, Placeholder, PlaceholderOutcome, PlaceholderResult, Project,
    RestoreSummary, WorkspaceLayout, LAUNCH_TOKEN_ENV,
};

use crate::correlate::{expiry_from_now, CorrelationEngine, CorrelationMatch, PendingLaunch};
use crate::filter::ClassRegistry;
use crate::launch::spawn_shell;
use crate::sway::Node;

/// A restore that has not fully resolved by this deadline is finalized with
/// its unresolved placeholders counted as expired.
pub const RESTORE_DEADLINE: Duration = Duration::from_secs(45);

fn restore_deadline() -> Duration {
    crate::correlate::duration_from_env("SWAYPROJD_RESTORE_DEADLINE_MS", RESTORE_DEADLINE)
}

/// Snapshot the current tree. Windows whose class has no registry launch
/// command cannot be relaunched and are skipped.
pub fn capture_layout(tree: &Node, registry: &ClassRegistry, name: &str) -> LayoutSnapshot {
    let mut by_workspace: Vec<WorkspaceLayout> = Vec::new();

    tree.for_each_window(&mut |node, workspace| {
        let Some(workspace) = workspace else {
            return;
        };
        let Some(class) = node.window_class() else {
            return;
        };
        let Some(entry) = registry.lookup(class) else {
            debug!(class, "window class not in registry, skipping in snapshot");
            return;
        };
        let Some(command) = entry.command.as_deref() else {
            debug!(class, "registry entry has no launch command, skipping in snapshot");
            return;
        };

        let placeholder = Placeholder {
            app_name: entry.name.clone(),
            app_class: class.to_string(),
            command: command.to_string(),
            geometry: Geometry {
                x: node.rect.x,
                y: node.rect.y,
                width: node.rect.width,
                height: node.rect.height,
            },
            focused: node.focused,
        };

        match by_workspace
            .iter_mut()
            .find(|layout| layout.workspace == workspace)
        {
            Some(layout) => layout.placeholders.push(placeholder),
            None => by_workspace.push(WorkspaceLayout {
                workspace,
                placeholders: vec![placeholder],
            }),
        }
    });

    by_workspace.sort_by_key(|layout| layout.workspace);
    LayoutSnapshot {
        name: name.to_string(),
        saved_at: swayproj_types::unix_time(),
        workspaces: by_workspace,
    }
}

/// Commands placing a freshly correlated window where its placeholder was.
pub fn placement_commands(window_id: u64, matched: &CorrelationMatch) -> Vec<String> {
    let mut commands = vec![format!(
        "[con_id={window_id}] move container to workspace number {}",
        matched.workspace
    )];
    if let Some(geometry) = matched.geometry {
        if geometry.width > 0 && geometry.height > 0 {
            commands.push(format!(
                "[con_id={window_id}] resize set {} px {} px",
                geometry.width, geometry.height
            ));
        }
    }
    if matched.focused {
        commands.push(format!("[con_id={window_id}] focus"));
    }
    commands
}

struct Slot {
    app_name: String,
    workspace: u32,
}

/// One in-flight restore. The response to the requesting client is deferred
/// until every placeholder resolved or the deadline passed.
pub struct RestoreOp {
    pub client: u64,
    pub request_id: u64,
    pub layout: String,
    deadline: Instant,
    pending: HashMap<String, Slot>,
    results: Vec<PlaceholderResult>,
}

impl RestoreOp {
    /// Launch every placeholder: mint a token, register it with the
    /// correlation engine, and spawn the command with the token in its
    /// environment and the project directory as working directory. Spawn
    /// failures become per-placeholder results rather than aborting the
    /// whole restore.
    pub fn start(
        client: u64,
        request_id: u64,
        snapshot: &LayoutSnapshot,
        project: &Project,
        engine: &mut CorrelationEngine,
        now: Instant,
    ) -> Result<Self> {
        if snapshot.placeholder_count() == 0 {
            bail!("layout '{}' has no placeholders to restore", snapshot.name);
        }

        let mut op = Self {
            client,
            request_id,
            layout: snapshot.name.clone(),
            deadline: now + restore_deadline(),
            pending: HashMap::new(),
            results: Vec::new(),
        };

        for workspace in &snapshot.workspaces {
            for placeholder in &workspace.placeholders {
                let token = engine.generate_token(&placeholder.app_name);
                let env = [(LAUNCH_TOKEN_ENV.to_string(), token.clone())];
                match spawn_shell(
                    &placeholder.command,
                    Some(std::path::Path::new(&project.directory)),
                    &env,
                ) {
                    Ok(_child) => {
                        engine.register(PendingLaunch {
                            token: token.clone(),
                            app_name: placeholder.app_name.clone(),
                            expected_class: placeholder.app_class.clone(),
                            workspace: workspace.workspace,
                            project: Some(project.name.clone()),
                            geometry: Some(placeholder.geometry),
                            focused: placeholder.focused,
                            expires_at: expiry_from_now(now),
                        });
                        op.pending.insert(
                            token,
                            Slot {
                                app_name: placeholder.app_name.clone(),
                                workspace: workspace.workspace,
                            },
                        );
                    }
                    Err(err) => {
                        warn!(
                            app = %placeholder.app_name,
                            "placeholder launch failed: {err:#}"
                        );
                        op.results.push(PlaceholderResult {
                            app_name: placeholder.app_name.clone(),
                            workspace: workspace.workspace,
                            outcome: PlaceholderOutcome::LaunchFailed,
                        });
                    }
                }
            }
        }

        info!(
            layout = %snapshot.name,
            launched = op.pending.len(),
            failed = op.results.len(),
            "restore started"
        );
        Ok(op)
    }

    /// Consume a correlation match; true when the token belonged to this op.
    pub fn on_match(&mut self, token: &str) -> bool {
        let Some(slot) = self.pending.remove(token) else {
            return false;
        };
        self.results.push(PlaceholderResult {
            app_name: slot.app_name,
            workspace: slot.workspace,
            outcome: PlaceholderOutcome::Matched,
        });
        true
    }

    /// Consume an expired pending launch; true when the token was ours.
    pub fn on_expired(&mut self, token: &str) -> bool {
        let Some(slot) = self.pending.remove(token) else {
            return false;
        };
        self.results.push(PlaceholderResult {
            app_name: slot.app_name,
            workspace: slot.workspace,
            outcome: PlaceholderOutcome::Expired,
        });
        true
    }

    pub fn is_complete(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn is_past_deadline(&self, now: Instant) -> bool {
        now >= self.deadline
    }

    /// Finalize: any still-pending placeholder counts as expired.
    pub fn finish(mut self) -> RestoreSummary {
        let mut leftovers: Vec<Slot> = self.pending.drain().map(|(_, slot)| slot).collect();
        leftovers.sort_by(|a, b| a.app_name.cmp(&b.app_name));
        for slot in leftovers {
            self.results.push(PlaceholderResult {
                app_name: slot.app_name,
                workspace: slot.workspace,
                outcome: PlaceholderOutcome::Expired,
            });
        }

        let count = |outcome: PlaceholderOutcome| {
            self.results
                .iter()
                .filter(|result| result.outcome == outcome)
                .count()
        };
        RestoreSummary {
            layout: self.layout,
            matched: count(PlaceholderOutcome::Matched),
            expired: count(PlaceholderOutcome::Expired),
            launch_failures: count(PlaceholderOutcome::LaunchFailed),
            placeholders: self.results,
        }
    }
}
