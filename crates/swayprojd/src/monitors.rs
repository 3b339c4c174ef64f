//! Monitor profile service: atomic transitions between named output
//! profiles, full workspace redistribution, and debounced reaction to
//! spontaneous topology changes.
//!
//! A switch walks IDLE -> SWITCHING -> REASSIGNING -> IDLE; any output
//! failure mid-switch reverts every already-applied change (ROLLING_BACK)
//! so the compositor is left in the previous profile's state.

use anyhow::{anyhow, bail, Context, Result};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::process::Child;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use swayproj_types::{
    Geometry, MonitorProfile, OutputRecord, OutputRole, OutputState, ProfileEvent, ProfilePhase,
    unix_time,
};

use crate::launch::{notify_user, spawn_shell, terminate_child};
use crate::sway::SwayClient;

/// Debounce window for spontaneous output connect/disconnect bursts.
pub const OUTPUT_DEBOUNCE: Duration = Duration::from_millis(500);

pub const WORKSPACE_COUNT: u32 = 10;

const EVENT_RING_CAPACITY: usize = 64;
const SERVICE_STOP_GRACE: Duration = Duration::from_secs(2);

pub fn role_for_index(index: usize) -> OutputRole {
    match index {
        0 => OutputRole::Primary,
        1 => OutputRole::Secondary,
        2 => OutputRole::Tertiary,
        _ => OutputRole::Overflow,
    }
}

/// Full (not incremental) workspace distribution, keyed on enabled-output
/// count with outputs in role order.
pub fn distribute_workspaces(enabled: &[String]) -> Vec<(u32, String)> {
    if enabled.is_empty() {
        return Vec::new();
    }

    let buckets: &[&[u32]] = match enabled.len() {
        1 => &[&[1, 2, 3, 4, 5, 6, 7, 8, 9, 10]],
        2 => &[&[1, 2, 3, 4, 5], &[6, 7, 8, 9, 10]],
        3 => &[&[1, 2, 3, 4], &[5, 6, 7], &[8, 9, 10]],
        _ => &[&[1, 2, 3], &[4, 5, 6], &[7, 8], &[9, 10]],
    };

    let mut assignments = Vec::with_capacity(WORKSPACE_COUNT as usize);
    for (index, workspaces) in buckets.iter().enumerate() {
        let output = &enabled[index.min(enabled.len() - 1)];
        for workspace in *workspaces {
            assignments.push((*workspace, output.clone()));
        }
    }
    assignments.sort_by_key(|(workspace, _)| *workspace);
    assignments
}

pub fn validate_profile(profile: &MonitorProfile) -> Result<()> {
    if profile.enabled_outputs().next().is_none() {
        bail!(
            "profile '{}' would disable every output; at least one must stay enabled",
            profile.name
        );
    }
    Ok(())
}

#[derive(Debug, Clone)]
struct OutputAction {
    name: String,
    enable: bool,
    position: Option<(i32, i32)>,
    resolution: Option<(u32, u32)>,
    remote_command: Option<String>,
}

impl OutputAction {
    fn command(&self) -> String {
        if !self.enable {
            return format!("output {} disable", self.name);
        }
        let mut command = format!("output {} enable", self.name);
        if let Some((x, y)) = self.position {
            command.push_str(&format!(" position {x} {y}"));
        }
        if let Some((width, height)) = self.resolution {
            command.push_str(&format!(" resolution {width}x{height}"));
        }
        command
    }
}

/// Diff current compositor state against the target profile. Enables come
/// first so at least one output stays up throughout the transition.
fn plan_actions(currently_active: &BTreeSet<String>, profile: &MonitorProfile) -> Vec<OutputAction> {
    let mut enables = Vec::new();
    let mut disables = Vec::new();

    for output in &profile.outputs {
        let active = currently_active.contains(&output.name);
        if output.enabled && !active {
            enables.push(OutputAction {
                name: output.name.clone(),
                enable: true,
                position: output.position,
                resolution: output.resolution,
                remote_command: output.remote_command.clone(),
            });
        } else if !output.enabled && active {
            disables.push(OutputAction {
                name: output.name.clone(),
                enable: false,
                position: None,
                resolution: None,
                remote_command: None,
            });
        }
    }

    // Outputs the profile does not mention are disabled too: the enabled set
    // must end up equal to the profile's list.
    let listed: BTreeSet<&str> = profile
        .outputs
        .iter()
        .map(|output| output.name.as_str())
        .collect();
    for name in currently_active {
        if !listed.contains(name.as_str()) {
            disables.push(OutputAction {
                name: name.clone(),
                enable: false,
                position: None,
                resolution: None,
                remote_command: None,
            });
        }
    }

    enables.into_iter().chain(disables).collect()
}

/// One batch moving every workspace to its assigned output, returning focus
/// to the previously focused workspace at the end.
fn reassign_commands(assignments: &[(u32, String)], focused: Option<u32>) -> Vec<String> {
    let mut commands = Vec::with_capacity(assignments.len() * 2 + 1);
    for (workspace, output) in assignments {
        commands.push(format!("workspace number {workspace}"));
        commands.push(format!("move workspace to output {output}"));
    }
    if let Some(workspace) = focused {
        commands.push(format!("workspace number {workspace}"));
    }
    commands
}

fn state_from_profile(profile: &MonitorProfile, assignments: Vec<(u32, String)>) -> OutputState {
    let mut outputs = Vec::with_capacity(profile.outputs.len());
    let mut enabled_index = 0usize;
    for output in &profile.outputs {
        let role = if output.enabled {
            let role = role_for_index(enabled_index);
            enabled_index += 1;
            role
        } else {
            OutputRole::Overflow
        };
        let geometry = match (output.position, output.resolution) {
            (Some((x, y)), Some((width, height))) => Some(Geometry {
                x,
                y,
                width: width as i32,
                height: height as i32,
            }),
            _ => None,
        };
        outputs.push(OutputRecord {
            name: output.name.clone(),
            enabled: output.enabled,
            role,
            geometry,
        });
    }
    OutputState {
        outputs,
        assignments,
    }
}

/// Active outputs in committed role order; outputs the committed state has
/// never seen go last, in query order.
fn order_active_outputs(
    state: &OutputState,
    active: &[(String, Geometry)],
) -> Vec<(String, Geometry)> {
    let mut ordered: Vec<(String, Geometry)> = state
        .outputs
        .iter()
        .filter_map(|record| {
            active
                .iter()
                .find(|(name, _)| name == &record.name)
                .cloned()
        })
        .collect();
    for entry in active {
        if !ordered.iter().any(|(name, _)| name == &entry.0) {
            ordered.push(entry.clone());
        }
    }
    ordered
}

/// Rebuild the output state after a reassignment: every active output gets a
/// record (created from the queried geometry when the committed state never
/// saw it), inactive records are kept but demoted.
fn rebuild_state(
    previous: &OutputState,
    ordered: &[(String, Geometry)],
    assignments: Vec<(u32, String)>,
) -> OutputState {
    let mut outputs = previous.outputs.clone();
    for (name, geometry) in ordered {
        if !outputs.iter().any(|record| &record.name == name) {
            outputs.push(OutputRecord {
                name: name.clone(),
                enabled: true,
                role: OutputRole::Overflow,
                geometry: Some(*geometry),
            });
        }
    }
    for record in &mut outputs {
        let position = ordered.iter().position(|(name, _)| name == &record.name);
        record.enabled = position.is_some();
        record.role = position.map(role_for_index).unwrap_or(OutputRole::Overflow);
    }
    OutputState {
        outputs,
        assignments,
    }
}

struct RemoteService {
    command: String,
    child: Child,
}

pub struct MonitorService {
    state: OutputState,
    current_profile: Option<String>,
    services: BTreeMap<String, RemoteService>,
    events: VecDeque<ProfileEvent>,
    pending_broadcast: Vec<ProfileEvent>,
    switching: bool,
    debounce_deadline: Option<Instant>,
}

impl MonitorService {
    pub fn new(state: OutputState, current_profile: Option<String>) -> Self {
        Self {
            state,
            current_profile,
            services: BTreeMap::new(),
            events: VecDeque::new(),
            pending_broadcast: Vec::new(),
            switching: false,
            debounce_deadline: None,
        }
    }

    pub fn state(&self) -> &OutputState {
        &self.state
    }

    pub fn current_profile(&self) -> Option<&str> {
        self.current_profile.as_deref()
    }

    pub fn switch_in_progress(&self) -> bool {
        self.switching
    }

    pub fn recent_events(&self) -> Vec<ProfileEvent> {
        self.events.iter().cloned().collect()
    }

    /// Switch-phase events emitted since the last drain, for subscribers.
    pub fn take_broadcasts(&mut self) -> Vec<ProfileEvent> {
        std::mem::take(&mut self.pending_broadcast)
    }

    fn record(&mut self, profile: &str, phase: ProfilePhase, detail: Option<String>) {
        let event = ProfileEvent {
            at: unix_time(),
            profile: profile.to_string(),
            phase,
            detail,
        };
        self.events.push_back(event.clone());
        while self.events.len() > EVENT_RING_CAPACITY {
            self.events.pop_front();
        }
        self.pending_broadcast.push(event);
    }

    // Debounce slot: never more than one outstanding delayed reassignment;
    // a successor always replaces its predecessor.

    pub fn schedule_reassign(&mut self, now: Instant) {
        self.debounce_deadline = Some(now + OUTPUT_DEBOUNCE);
    }

    pub fn cancel_pending_reassign(&mut self) {
        self.debounce_deadline = None;
    }

    /// True exactly once when the debounce deadline has passed.
    pub fn take_due_reassign(&mut self, now: Instant) -> bool {
        match self.debounce_deadline {
            Some(deadline) if deadline <= now => {
                self.debounce_deadline = None;
                true
            }
            _ => false,
        }
    }

    /// Apply a target profile. On success returns the new output state; the
    /// caller persists it and then calls [`commit`]. On any output failure
    /// every already-applied change is reverted before the error returns.
    pub fn apply_profile(
        &mut self,
        sway: &mut SwayClient,
        profile: &MonitorProfile,
    ) -> Result<OutputState> {
        if self.switching {
            bail!("a profile switch is already in progress");
        }
        validate_profile(profile)?;

        self.switching = true;
        // An explicit switch supersedes any pending debounced reassignment.
        self.cancel_pending_reassign();
        let result = self.apply_profile_inner(sway, profile);
        self.switching = false;
        result
    }

    fn apply_profile_inner(
        &mut self,
        sway: &mut SwayClient,
        profile: &MonitorProfile,
    ) -> Result<OutputState> {
        self.record(&profile.name, ProfilePhase::Started, None);
        info!(profile = %profile.name, "starting monitor profile switch");

        let currently_active: BTreeSet<String> = sway
            .get_outputs()
            .context("failed to query outputs before switch")?
            .into_iter()
            .filter(|output| output.active)
            .map(|output| output.name)
            .collect();
        let focused_workspace = focused_workspace(sway);

        let actions = plan_actions(&currently_active, profile);
        let mut applied: Vec<OutputAction> = Vec::new();
        let mut stopped_services: Vec<(String, String)> = Vec::new();

        for action in actions {
            if let Err(err) = self.execute_action(sway, &action, &mut stopped_services) {
                let detail = format!("output '{}': {err:#}", action.name);
                return Err(self.revert_switch(
                    sway,
                    &profile.name,
                    detail,
                    &applied,
                    &stopped_services,
                ));
            }
            self.record(
                &profile.name,
                ProfilePhase::OutputChanged,
                Some(format!(
                    "{} {}",
                    action.name,
                    if action.enable { "enabled" } else { "disabled" }
                )),
            );
            applied.push(action);
        }

        let enabled: Vec<String> = profile
            .enabled_outputs()
            .map(|output| output.name.clone())
            .collect();
        let assignments = distribute_workspaces(&enabled);
        if let Err(err) = sway.run_batch(&reassign_commands(&assignments, focused_workspace)) {
            // The outputs already match the target profile here; the failed
            // redistribution reverts them too so state and compositor agree.
            let detail = format!("workspace reassignment failed: {err:#}");
            return Err(self.revert_switch(
                sway,
                &profile.name,
                detail,
                &applied,
                &stopped_services,
            ));
        }
        self.record(
            &profile.name,
            ProfilePhase::Reassigned,
            Some(format!("{} workspaces over {} outputs", assignments.len(), enabled.len())),
        );

        Ok(state_from_profile(profile, assignments))
    }

    /// Shared failure path for a mid-switch error: roll the compositor back
    /// to the previous state, record the terminal phases, and tell the user.
    fn revert_switch(
        &mut self,
        sway: &mut SwayClient,
        profile: &str,
        detail: String,
        applied: &[OutputAction],
        stopped_services: &[(String, String)],
    ) -> anyhow::Error {
        warn!(profile, "{detail}; rolling back");
        self.rollback(sway, applied, stopped_services);
        self.record(profile, ProfilePhase::Failed, Some(detail.clone()));
        self.record(profile, ProfilePhase::RolledBack, None);
        notify_user(
            "Monitor profile switch failed",
            &format!("profile: {profile}\n{detail}\nprevious state restored"),
        );
        anyhow!("profile switch failed ({detail}); previous state restored")
    }

    fn execute_action(
        &mut self,
        sway: &mut SwayClient,
        action: &OutputAction,
        stopped_services: &mut Vec<(String, String)>,
    ) -> Result<()> {
        if action.enable {
            sway.run_command(&action.command())?;
            if let Some(command) = &action.remote_command {
                self.start_service(&action.name, command)?;
            }
        } else {
            if let Some(command) = self.stop_service(&action.name)? {
                stopped_services.push((action.name.clone(), command));
            }
            sway.run_command(&action.command())?;
        }
        Ok(())
    }

    /// Best-effort revert of already-applied actions, newest first, and
    /// restart of any remote-display services that were stopped.
    fn rollback(
        &mut self,
        sway: &mut SwayClient,
        applied: &[OutputAction],
        stopped_services: &[(String, String)],
    ) {
        for action in applied.iter().rev() {
            if action.enable {
                if let Err(err) = self.stop_service(&action.name) {
                    warn!("rollback: failed to stop service for {}: {err:#}", action.name);
                }
                if let Err(err) = sway.run_command(&format!("output {} disable", action.name)) {
                    warn!("rollback: failed to disable {}: {err:#}", action.name);
                }
            } else {
                let mut command = format!("output {} enable", action.name);
                if let Some(geometry) = self
                    .state
                    .outputs
                    .iter()
                    .find(|record| record.name == action.name)
                    .and_then(|record| record.geometry)
                {
                    command.push_str(&format!(
                        " position {} {} resolution {}x{}",
                        geometry.x, geometry.y, geometry.width, geometry.height
                    ));
                }
                if let Err(err) = sway.run_command(&command) {
                    warn!("rollback: failed to re-enable {}: {err:#}", action.name);
                }
            }
        }

        for (name, command) in stopped_services {
            if let Err(err) = self.start_service(name, command) {
                warn!("rollback: failed to restart service for {name}: {err:#}");
            }
        }
    }

    /// Commit a successfully persisted state; records the terminal phase.
    pub fn commit(&mut self, state: OutputState, profile: Option<String>) {
        self.state = state;
        if let Some(profile) = profile {
            self.record(&profile, ProfilePhase::Completed, None);
            self.current_profile = Some(profile);
        }
    }

    pub fn record_persist_failure(&mut self, profile: &str, detail: &str) {
        self.record(profile, ProfilePhase::Failed, Some(detail.to_string()));
    }

    /// Recompute the distribution from the outputs that are active right
    /// now, preserving the committed role order where possible.
    pub fn reassign(&mut self, sway: &mut SwayClient) -> Result<(OutputState, usize)> {
        let active: Vec<(String, Geometry)> = sway
            .get_outputs()
            .context("failed to query outputs for reassignment")?
            .into_iter()
            .filter(|output| output.active)
            .map(|output| {
                let geometry = Geometry {
                    x: output.rect.x,
                    y: output.rect.y,
                    width: output.rect.width,
                    height: output.rect.height,
                };
                (output.name, geometry)
            })
            .collect();
        if active.is_empty() {
            bail!("no active outputs to assign workspaces to");
        }

        let ordered = order_active_outputs(&self.state, &active);
        let names: Vec<String> = ordered.iter().map(|(name, _)| name.clone()).collect();

        let focused = focused_workspace(sway);
        let assignments = distribute_workspaces(&names);
        sway.run_batch(&reassign_commands(&assignments, focused))
            .context("workspace reassignment batch failed")?;

        let count = assignments.len();
        Ok((rebuild_state(&self.state, &ordered, assignments), count))
    }

    fn start_service(&mut self, output: &str, command: &str) -> Result<()> {
        if self.services.contains_key(output) {
            return Ok(());
        }
        debug!(output, command, "starting remote-display service");
        let child = spawn_shell(command, None, &[])
            .with_context(|| format!("failed to start remote-display service for {output}"))?;
        self.services.insert(
            output.to_string(),
            RemoteService {
                command: command.to_string(),
                child,
            },
        );
        Ok(())
    }

    fn stop_service(&mut self, output: &str) -> Result<Option<String>> {
        let Some(mut service) = self.services.remove(output) else {
            return Ok(None);
        };
        debug!(output, "stopping remote-display service");
        terminate_child(&mut service.child, SERVICE_STOP_GRACE)
            .with_context(|| format!("failed to stop remote-display service for {output}"))?;
        Ok(Some(service.command))
    }

    pub fn stop_all_services(&mut self) {
        let outputs: Vec<String> = self.services.keys().cloned().collect();
        for output in outputs {
            if let Err(err) = self.stop_service(&output) {
                warn!("failed to stop service for {output}: {err:#}");
            }
        }
    }
}

fn focused_workspace(sway: &mut SwayClient) -> Option<u32> {
    sway.get_workspaces().ok().and_then(|workspaces| {
        workspaces
            .iter()
            .find(|workspace| workspace.focused)
            .and_then(|workspace| u32::try_from(workspace.num).ok())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use swayproj_types::ProfileOutput;

    fn profile(name: &str, outputs: &[(&str, bool)]) -> MonitorProfile {
        MonitorProfile {
            name: name.to_string(),
            outputs: outputs
                .iter()
                .map(|(output, enabled)| ProfileOutput {
                    name: output.to_string(),
                    enabled: *enabled,
                    position: None,
                    resolution: None,
                    remote_command: None,
                })
                .collect(),
        }
    }

    fn names(assignments: &[(u32, String)]) -> Vec<(u32, &str)> {
        assignments
            .iter()
            .map(|(workspace, output)| (*workspace, output.as_str()))
            .collect()
    }

    #[test]
    fn single_output_owns_every_workspace() {
        let assignments = distribute_workspaces(&["eDP-1".to_string()]);
        assert_eq!(assignments.len(), 10);
        assert!(assignments.iter().all(|(_, output)| output == "eDP-1"));
    }

    #[test]
    fn two_outputs_split_five_and_five() {
        let assignments =
            distribute_workspaces(&["DP-1".to_string(), "DP-2".to_string()]);
        assert_eq!(
            names(&assignments),
            vec![
                (1, "DP-1"),
                (2, "DP-1"),
                (3, "DP-1"),
                (4, "DP-1"),
                (5, "DP-1"),
                (6, "DP-2"),
                (7, "DP-2"),
                (8, "DP-2"),
                (9, "DP-2"),
                (10, "DP-2"),
            ]
        );
    }

    #[test]
    fn three_outputs_follow_role_order() {
        let assignments = distribute_workspaces(&[
            "DP-1".to_string(),
            "DP-2".to_string(),
            "HDMI-1".to_string(),
        ]);
        let on = |output: &str| {
            assignments
                .iter()
                .filter(|(_, name)| name == output)
                .map(|(workspace, _)| *workspace)
                .collect::<Vec<_>>()
        };
        assert_eq!(on("DP-1"), vec![1, 2, 3, 4]);
        assert_eq!(on("DP-2"), vec![5, 6, 7]);
        assert_eq!(on("HDMI-1"), vec![8, 9, 10]);
    }

    #[test]
    fn four_outputs_use_the_overflow_bucket() {
        let assignments = distribute_workspaces(&[
            "a".to_string(),
            "b".to_string(),
            "c".to_string(),
            "d".to_string(),
        ]);
        let overflow: Vec<u32> = assignments
            .iter()
            .filter(|(_, name)| name == "d")
            .map(|(workspace, _)| *workspace)
            .collect();
        assert_eq!(overflow, vec![9, 10]);
    }

    #[test]
    fn roles_assigned_by_position() {
        assert_eq!(role_for_index(0), OutputRole::Primary);
        assert_eq!(role_for_index(1), OutputRole::Secondary);
        assert_eq!(role_for_index(2), OutputRole::Tertiary);
        assert_eq!(role_for_index(3), OutputRole::Overflow);
        assert_eq!(role_for_index(9), OutputRole::Overflow);
    }

    #[test]
    fn all_disabled_profile_fails_validation() {
        let target = profile("broken", &[("eDP-1", false), ("DP-1", false)]);
        assert!(validate_profile(&target).is_err());
        assert!(validate_profile(&profile("ok", &[("eDP-1", true)])).is_ok());
    }

    #[test]
    fn plan_enables_before_disables() {
        let mut active = BTreeSet::new();
        active.insert("eDP-1".to_string());
        let target = profile("docked", &[("eDP-1", false), ("DP-1", true), ("DP-2", true)]);

        let actions = plan_actions(&active, &target);
        let order: Vec<(&str, bool)> = actions
            .iter()
            .map(|action| (action.name.as_str(), action.enable))
            .collect();
        assert_eq!(order, vec![("DP-1", true), ("DP-2", true), ("eDP-1", false)]);
    }

    #[test]
    fn plan_disables_unlisted_active_outputs() {
        let mut active = BTreeSet::new();
        active.insert("HDMI-9".to_string());
        active.insert("eDP-1".to_string());
        let target = profile("laptop", &[("eDP-1", true)]);

        let actions = plan_actions(&active, &target);
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].name, "HDMI-9");
        assert!(!actions[0].enable);
    }

    #[test]
    fn enable_command_carries_geometry() {
        let action = OutputAction {
            name: "DP-1".to_string(),
            enable: true,
            position: Some((1920, 0)),
            resolution: Some((2560, 1440)),
            remote_command: None,
        };
        assert_eq!(
            action.command(),
            "output DP-1 enable position 1920 0 resolution 2560x1440"
        );
    }

    #[test]
    fn reassign_batch_restores_focused_workspace() {
        let assignments = vec![(1, "DP-1".to_string()), (6, "DP-2".to_string())];
        let commands = reassign_commands(&assignments, Some(3));
        assert_eq!(
            commands,
            vec![
                "workspace number 1",
                "move workspace to output DP-1",
                "workspace number 6",
                "move workspace to output DP-2",
                "workspace number 3",
            ]
        );
    }

    #[test]
    fn debounce_successor_replaces_predecessor() {
        let mut service = MonitorService::new(OutputState::default(), None);
        let start = Instant::now();
        service.schedule_reassign(start);
        service.schedule_reassign(start + Duration::from_millis(300));

        // The first deadline alone has passed: nothing is due yet.
        assert!(!service.take_due_reassign(start + OUTPUT_DEBOUNCE));
        // After the second deadline the single pending task fires once.
        let after = start + Duration::from_millis(300) + OUTPUT_DEBOUNCE;
        assert!(service.take_due_reassign(after));
        assert!(!service.take_due_reassign(after));
    }

    #[test]
    fn event_ring_is_bounded() {
        let mut service = MonitorService::new(OutputState::default(), None);
        for index in 0..(EVENT_RING_CAPACITY + 10) {
            service.record("p", ProfilePhase::OutputChanged, Some(index.to_string()));
        }
        assert_eq!(service.recent_events().len(), EVENT_RING_CAPACITY);
        // Oldest entries were dropped.
        assert_eq!(
            service.recent_events()[0].detail.as_deref(),
            Some("10")
        );
    }

    fn geometry(x: i32, y: i32) -> Geometry {
        Geometry {
            x,
            y,
            width: 1920,
            height: 1080,
        }
    }

    #[test]
    fn reassignment_records_previously_unknown_outputs() {
        let active = vec![
            ("eDP-1".to_string(), geometry(0, 0)),
            ("DP-1".to_string(), geometry(1920, 0)),
        ];
        let ordered = order_active_outputs(&OutputState::default(), &active);
        let state = rebuild_state(
            &OutputState::default(),
            &ordered,
            vec![(1, "eDP-1".to_string()), (6, "DP-1".to_string())],
        );

        assert_eq!(state.outputs.len(), 2);
        assert!(state.outputs.iter().all(|record| record.enabled));
        assert_eq!(state.outputs[0].name, "eDP-1");
        assert_eq!(state.outputs[0].role, OutputRole::Primary);
        assert_eq!(state.outputs[0].geometry, Some(geometry(0, 0)));
        assert_eq!(state.outputs[1].role, OutputRole::Secondary);
        assert_eq!(state.assignments.len(), 2);
    }

    #[test]
    fn reassignment_preserves_committed_role_order() {
        let committed = OutputState {
            outputs: vec![
                OutputRecord {
                    name: "DP-1".to_string(),
                    enabled: true,
                    role: OutputRole::Primary,
                    geometry: None,
                },
                OutputRecord {
                    name: "DP-2".to_string(),
                    enabled: true,
                    role: OutputRole::Secondary,
                    geometry: None,
                },
            ],
            assignments: Vec::new(),
        };
        // Query order differs from committed order; the committed order wins.
        let active = vec![
            ("DP-2".to_string(), geometry(1920, 0)),
            ("DP-1".to_string(), geometry(0, 0)),
            ("HDMI-1".to_string(), geometry(3840, 0)),
        ];
        let ordered = order_active_outputs(&committed, &active);
        let names: Vec<&str> = ordered.iter().map(|(name, _)| name.as_str()).collect();
        assert_eq!(names, vec!["DP-1", "DP-2", "HDMI-1"]);

        let state = rebuild_state(&committed, &ordered, Vec::new());
        assert_eq!(state.outputs[0].role, OutputRole::Primary);
        assert_eq!(state.outputs[1].role, OutputRole::Secondary);
        let hdmi = state
            .outputs
            .iter()
            .find(|record| record.name == "HDMI-1")
            .unwrap();
        assert!(hdmi.enabled);
        assert_eq!(hdmi.role, OutputRole::Tertiary);
        assert_eq!(hdmi.geometry, Some(geometry(3840, 0)));
    }

    #[test]
    fn reassignment_demotes_outputs_that_went_away() {
        let committed = OutputState {
            outputs: vec![
                OutputRecord {
                    name: "eDP-1".to_string(),
                    enabled: true,
                    role: OutputRole::Primary,
                    geometry: None,
                },
                OutputRecord {
                    name: "DP-1".to_string(),
                    enabled: true,
                    role: OutputRole::Secondary,
                    geometry: None,
                },
            ],
            assignments: Vec::new(),
        };
        let active = vec![("eDP-1".to_string(), geometry(0, 0))];
        let ordered = order_active_outputs(&committed, &active);
        let state = rebuild_state(&committed, &ordered, vec![(1, "eDP-1".to_string())]);

        let gone = state
            .outputs
            .iter()
            .find(|record| record.name == "DP-1")
            .unwrap();
        assert!(!gone.enabled);
        assert_eq!(gone.role, OutputRole::Overflow);
    }

    #[test]
    fn state_from_profile_assigns_roles_to_enabled_only() {
        let target = profile("mixed", &[("eDP-1", false), ("DP-1", true), ("DP-2", true)]);
        let state = state_from_profile(&target, Vec::new());
        assert_eq!(state.outputs[0].role, OutputRole::Overflow);
        assert!(!state.outputs[0].enabled);
        assert_eq!(state.outputs[1].role, OutputRole::Primary);
        assert_eq!(state.outputs[2].role, OutputRole::Secondary);
    }
}
