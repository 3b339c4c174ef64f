//! Daemon core: owns every piece of mutable state and processes the single
//! event stream fed by the reader threads. Request dispatch, compositor
//! event handling, timers, persistence, and subscriber notifications all run
//! on the loop thread, so state never needs a lock.

use anyhow::{bail, Context, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io::{BufWriter, Write};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use swayproj_types::{
    ActiveProject, CurrentProfile, DaemonStatus, EventNotification, LayoutSnapshot,
    MonitorProfile, MonitorsStatus, NameParams, OutputState, Project, ProjectListResult,
    ReassignResult, Request, Response, RestoreParams, SaveResult, SwitchResult, ERR_BUSY,
    ERR_COMPOSITOR, ERR_INTERNAL, ERR_INVALID_PARAMS, ERR_INVALID_REQUEST, ERR_NOT_FOUND,
    ERR_PERSISTENCE, ERR_VALIDATION, METHOD_GET_STATUS, METHOD_LAYOUT_RESTORE,
    METHOD_LAYOUT_SAVE, METHOD_MONITORS_APPLY, METHOD_MONITORS_REASSIGN,
    METHOD_MONITORS_STATUS, METHOD_PING, METHOD_PROJECT_CLEAR, METHOD_PROJECT_LIST,
    METHOD_PROJECT_SWITCH, METHOD_SHUTDOWN, METHOD_SUBSCRIBE_EVENTS,
};

use crate::correlate::{CorrelationEngine, CorrelationMatch};
use crate::filter::{classify_class, ClassRegistry, ProjectFilter, WindowScope};
use crate::layout::{capture_layout, placement_commands, RestoreOp};
use crate::monitors::{validate_profile, MonitorService};
use crate::sway::{CompositorEvent, SwayClient, WindowChange};

const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// Everything the main loop reacts to, from any reader thread.
pub enum LoopEvent {
    Compositor(CompositorEvent),
    Request { client: u64, request: Request },
    /// A client sent a line that was not valid request JSON.
    Malformed { client: u64 },
    ClientClosed(u64),
}

pub fn atomic_write_file(target: &Path, data: &[u8]) -> Result<()> {
    let parent = target
        .parent()
        .with_context(|| format!("cannot determine parent directory for {}", target.display()))?;
    fs::create_dir_all(parent)
        .with_context(|| format!("failed to create directory: {}", parent.display()))?;
    let tmp_path = target.with_extension("tmp");
    fs::write(&tmp_path, data)
        .with_context(|| format!("failed to write temporary file: {}", tmp_path.display()))?;
    fs::rename(&tmp_path, target).with_context(|| {
        format!(
            "failed to rename {} to {}",
            tmp_path.display(),
            target.display()
        )
    })?;
    Ok(())
}

/// Names double as file names, so they are restricted to kebab-case.
pub fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() {
        bail!("name must not be empty");
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
    {
        bail!("name '{name}' must be kebab-case (lowercase letters, digits, '-')");
    }
    if name.starts_with('-') || name.ends_with('-') {
        bail!("name '{name}' must not start or end with '-'");
    }
    Ok(())
}

/// JSON-document store under the config dir; every write is atomic.
pub struct Store {
    config_dir: PathBuf,
}

impl Store {
    pub fn new(config_dir: PathBuf) -> Self {
        Self { config_dir }
    }

    pub fn config_dir(&self) -> &Path {
        &self.config_dir
    }

    pub fn registry_path(&self) -> PathBuf {
        self.config_dir.join("class-registry.toml")
    }

    fn read_json<T: DeserializeOwned>(&self, path: &Path) -> Result<Option<T>> {
        let raw = match fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(err).with_context(|| format!("failed to read {}", path.display()))
            }
        };
        let value = serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse {}", path.display()))?;
        Ok(Some(value))
    }

    fn write_json<T: Serialize>(&self, path: &Path, value: &T) -> Result<()> {
        let mut data = serde_json::to_vec_pretty(value).context("failed to serialize document")?;
        data.push(b'\n');
        atomic_write_file(path, &data)
    }

    pub fn load_projects(&self) -> Result<BTreeMap<String, Project>> {
        let dir = self.config_dir.join("projects");
        let mut projects = BTreeMap::new();
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(projects),
            Err(err) => {
                return Err(err).with_context(|| format!("failed to read {}", dir.display()))
            }
        };
        for entry in entries {
            let path = entry.context("failed to read projects directory entry")?.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            let project: Option<Project> = match self.read_json(&path) {
                Ok(project) => project,
                Err(err) => {
                    warn!("skipping unreadable project file {}: {err:#}", path.display());
                    continue;
                }
            };
            if let Some(project) = project {
                if let Err(err) = validate_name(&project.name) {
                    warn!("skipping project {}: {err:#}", path.display());
                    continue;
                }
                projects.insert(project.name.clone(), project);
            }
        }
        Ok(projects)
    }

    pub fn load_active(&self) -> Result<Option<ActiveProject>> {
        self.read_json(&self.config_dir.join("active-project.json"))
    }

    pub fn write_active(&self, active: Option<&ActiveProject>) -> Result<()> {
        let path = self.config_dir.join("active-project.json");
        match active {
            Some(active) => self.write_json(&path, active),
            None => match fs::remove_file(&path) {
                Ok(()) => Ok(()),
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(err) => {
                    Err(err).with_context(|| format!("failed to remove {}", path.display()))
                }
            },
        }
    }

    pub fn load_profile(&self, name: &str) -> Result<Option<MonitorProfile>> {
        self.read_json(&self.config_dir.join("profiles").join(format!("{name}.json")))
    }

    pub fn load_current_profile(&self) -> Result<Option<CurrentProfile>> {
        self.read_json(&self.config_dir.join("current-profile.json"))
    }

    pub fn write_current_profile(&self, name: &str) -> Result<()> {
        self.write_json(
            &self.config_dir.join("current-profile.json"),
            &CurrentProfile {
                name: name.to_string(),
            },
        )
    }

    pub fn load_output_state(&self) -> Result<Option<OutputState>> {
        self.read_json(&self.config_dir.join("output-state.json"))
    }

    pub fn write_output_state(&self, state: &OutputState) -> Result<()> {
        self.write_json(&self.config_dir.join("output-state.json"), state)
    }

    pub fn load_layout(&self, name: &str) -> Result<Option<LayoutSnapshot>> {
        self.read_json(&self.config_dir.join("layouts").join(format!("{name}.json")))
    }

    pub fn write_layout(&self, snapshot: &LayoutSnapshot) -> Result<()> {
        self.write_json(
            &self
                .config_dir
                .join("layouts")
                .join(format!("{}.json", snapshot.name)),
            snapshot,
        )
    }
}

pub struct Daemon {
    store: Store,
    sway: SwayClient,
    registry: ClassRegistry,
    projects: BTreeMap<String, Project>,
    active: Option<ActiveProject>,
    filter: ProjectFilter,
    engine: CorrelationEngine,
    monitors: MonitorService,
    restores: Vec<RestoreOp>,
    clients: BTreeMap<u64, BufWriter<UnixStream>>,
    subscribers: BTreeSet<u64>,
    last_sweep: Instant,
    shutdown: bool,
}

impl Daemon {
    pub fn new(store: Store, sway: SwayClient) -> Result<Self> {
        let registry = ClassRegistry::load(&store.registry_path())?;
        let projects = store.load_projects()?;
        let mut active = store.load_active()?;
        if let Some(current) = &active {
            if !projects.contains_key(&current.name) {
                warn!(
                    "active project '{}' no longer exists, clearing pointer",
                    current.name
                );
                store.write_active(None)?;
                active = None;
            }
        }
        let output_state = store.load_output_state()?.unwrap_or_default();
        let current_profile = store.load_current_profile()?.map(|current| current.name);

        info!(
            projects = projects.len(),
            active = active.as_ref().map(|a| a.name.as_str()).unwrap_or("-"),
            "daemon state loaded"
        );
        Ok(Self {
            store,
            sway,
            registry,
            projects,
            active,
            filter: ProjectFilter::new(),
            engine: CorrelationEngine::new(),
            monitors: MonitorService::new(output_state, current_profile),
            restores: Vec::new(),
            clients: BTreeMap::new(),
            subscribers: BTreeSet::new(),
            last_sweep: Instant::now(),
            shutdown: false,
        })
    }

    pub fn should_shutdown(&self) -> bool {
        self.shutdown
    }

    pub fn register_client(&mut self, client: u64, stream: UnixStream) {
        self.clients.insert(client, BufWriter::new(stream));
    }

    pub fn shutdown_cleanup(&mut self) {
        self.monitors.stop_all_services();
    }

    pub fn handle_event(&mut self, event: LoopEvent) {
        match event {
            LoopEvent::Compositor(event) => self.handle_compositor_event(event),
            LoopEvent::Request { client, request } => {
                if let Some(response) = self.dispatch(client, &request) {
                    self.send_response(client, &response);
                }
            }
            LoopEvent::Malformed { client } => {
                let response =
                    Response::err(0, ERR_INVALID_REQUEST, "request line is not valid JSON");
                self.send_response(client, &response);
            }
            LoopEvent::ClientClosed(client) => {
                self.clients.remove(&client);
                self.subscribers.remove(&client);
            }
        }
    }

    /// Periodic work: correlation sweep (1s), restore deadlines, debounced
    /// workspace reassignment, and pending subscriber notifications.
    pub fn tick(&mut self, now: Instant) {
        if now.duration_since(self.last_sweep) >= SWEEP_INTERVAL {
            self.last_sweep = now;
            for entry in self.engine.sweep_expired(now) {
                for op in &mut self.restores {
                    if op.on_expired(&entry.token) {
                        break;
                    }
                }
                self.broadcast(
                    "launch_expired",
                    json!({ "token": entry.token, "app_name": entry.app_name }),
                );
            }
        }

        self.finalize_restores(now);

        if self.monitors.take_due_reassign(now) {
            self.run_reassign_now();
        }

        self.flush_profile_events();
    }

    fn flush_profile_events(&mut self) {
        for event in self.monitors.take_broadcasts() {
            match serde_json::to_value(&event) {
                Ok(value) => self.broadcast("profile_event", value),
                Err(err) => warn!("failed to serialize profile event: {err:#}"),
            }
        }
    }

    // ---- compositor events ----

    fn handle_compositor_event(&mut self, event: CompositorEvent) {
        match event {
            CompositorEvent::Window { change, container } => match change {
                WindowChange::New => self.on_window_new(container),
                WindowChange::Close => self.filter.on_window_closed(container.id),
                WindowChange::Move => {
                    if let Some(workspace) = self.workspace_of(container.id) {
                        self.filter.on_window_moved(container.id, workspace);
                    }
                }
                WindowChange::Focus | WindowChange::Title | WindowChange::Other => {}
            },
            CompositorEvent::Workspace { .. } => {}
            CompositorEvent::Output => {
                if self.monitors.switch_in_progress() {
                    debug!("output event during profile switch, ignoring");
                } else {
                    debug!("output topology changed, debouncing reassignment");
                    self.monitors.schedule_reassign(Instant::now());
                }
            }
            CompositorEvent::Reconnected => {
                if let Err(err) = self.resync() {
                    warn!("compositor resync failed: {err:#}");
                }
            }
        }
    }

    fn on_window_new(&mut self, container: crate::sway::Node) {
        let id = container.id;
        let pid = container.pid.unwrap_or(0);
        let class = container.window_class().unwrap_or_default().to_string();

        if let Some(matched) = self.engine.on_window_new(id, pid, &class) {
            self.place_matched_window(id, pid, class, &matched);
            return;
        }

        let scope = classify_class(&class, &self.registry, &self.projects);
        let workspace = self.workspace_of(id).unwrap_or(1);
        debug!(id, class = %class, workspace, "tracking new window");
        self.filter.upsert(id, pid, class, workspace, scope);
        self.enforce_visibility();
    }

    fn place_matched_window(
        &mut self,
        id: u64,
        pid: i32,
        class: String,
        matched: &CorrelationMatch,
    ) {
        if let Err(err) = self.sway.run_batch(&placement_commands(id, matched)) {
            warn!(id, "failed to place correlated window: {err:#}");
        }
        let scope = match &matched.project {
            Some(project) => WindowScope::Project(project.clone()),
            None => classify_class(&class, &self.registry, &self.projects),
        };
        self.filter.upsert(id, pid, class, matched.workspace, scope);

        let token = matched.token.clone();
        self.broadcast(
            "launch_matched",
            json!({
                "token": token,
                "app_name": matched.app_name,
                "window_id": id,
            }),
        );
        for op in &mut self.restores {
            if op.on_match(&token) {
                break;
            }
        }
        self.finalize_restores(Instant::now());
        self.enforce_visibility();
    }

    /// Re-walk the full tree: track every live window (keeping known scopes),
    /// drop vanished ones, and re-apply the active filter.
    fn resync(&mut self) -> Result<()> {
        let tree = self.sway.get_tree().context("failed to fetch tree for resync")?;
        let mut seen: Vec<(u64, i32, String, u32)> = Vec::new();
        tree.for_each_window(&mut |node, workspace| {
            let Some(workspace) = workspace else { return };
            let class = node.window_class().unwrap_or_default().to_string();
            seen.push((node.id, node.pid.unwrap_or(0), class, workspace));
        });

        let live: Vec<u64> = seen.iter().map(|(id, ..)| *id).collect();
        for (id, pid, class, workspace) in seen {
            let scope = match self.filter.window(id) {
                Some(window) => window.scope.clone(),
                None => classify_class(&class, &self.registry, &self.projects),
            };
            self.filter.upsert(id, pid, class, workspace, scope);
        }
        self.filter.retain_ids(&live);
        info!(windows = self.filter.tracked_count(), "resynced with compositor");
        self.enforce_visibility();
        Ok(())
    }

    /// Re-plan against the active project and apply any delta. A no-op when
    /// the tracked set already matches the active visibility rules.
    fn enforce_visibility(&mut self) {
        let target = self.active.as_ref().map(|active| active.name.clone());
        let plan = self.filter.plan_switch(target.as_deref());
        if plan.is_empty() {
            return;
        }
        match self.sway.run_batch(&plan.commands()) {
            Ok(()) => self.filter.mark_applied(&plan),
            Err(err) => warn!("failed to enforce window visibility: {err:#}"),
        }
    }

    fn workspace_of(&mut self, id: u64) -> Option<u32> {
        let tree = self.sway.get_tree().ok()?;
        let mut found = None;
        tree.for_each_window(&mut |node, workspace| {
            if node.id == id {
                found = workspace;
            }
        });
        found
    }

    // ---- request dispatch ----

    /// `None` means the response is deferred (layout restore).
    fn dispatch(&mut self, client: u64, request: &Request) -> Option<Response> {
        let id = request.id;
        let response = match request.method.as_str() {
            METHOD_PING => Response::ok(id, json!({ "ok": true })),
            METHOD_SHUTDOWN => {
                info!("shutdown requested over IPC");
                self.shutdown = true;
                Response::ok(id, json!({ "ok": true }))
            }
            METHOD_GET_STATUS => self.handle_get_status(id),
            METHOD_PROJECT_LIST => self.handle_project_list(id),
            METHOD_PROJECT_SWITCH => self.handle_project_switch(id, &request.params),
            METHOD_PROJECT_CLEAR => self.handle_project_clear(id),
            METHOD_MONITORS_STATUS => self.handle_monitors_status(id),
            METHOD_MONITORS_APPLY => self.handle_monitors_apply(id, &request.params),
            METHOD_MONITORS_REASSIGN => self.handle_monitors_reassign(id),
            METHOD_LAYOUT_SAVE => self.handle_layout_save(id, &request.params),
            METHOD_LAYOUT_RESTORE => return self.handle_layout_restore(client, id, &request.params),
            METHOD_SUBSCRIBE_EVENTS => {
                self.subscribers.insert(client);
                Response::ok(id, json!({ "subscribed": true }))
            }
            other => Response::err(id, ERR_INVALID_REQUEST, format!("unknown method '{other}'")),
        };
        Some(response)
    }

    fn handle_get_status(&self, id: u64) -> Response {
        let status = DaemonStatus {
            version: env!("CARGO_PKG_VERSION").to_string(),
            active_project: self.active.as_ref().map(|active| active.name.clone()),
            current_profile: self.monitors.current_profile().map(ToString::to_string),
            tracked_windows: self.filter.tracked_count(),
            pending_tokens: self.engine.pending_count(),
            switch_in_progress: self.monitors.switch_in_progress(),
            recent_matches: self.engine.recent_matches().cloned().collect(),
        };
        ok_json(id, &status)
    }

    fn handle_project_list(&self, id: u64) -> Response {
        let result = ProjectListResult {
            projects: self.projects.values().cloned().collect(),
            active: self.active.as_ref().map(|active| active.name.clone()),
        };
        ok_json(id, &result)
    }

    fn handle_project_switch(&mut self, id: u64, params: &Value) -> Response {
        let params: NameParams = match serde_json::from_value(params.clone()) {
            Ok(params) => params,
            Err(err) => return Response::err(id, ERR_INVALID_PARAMS, err.to_string()),
        };
        if !self.projects.contains_key(&params.name) {
            return Response::err(
                id,
                ERR_NOT_FOUND,
                format!("no such project '{}'", params.name),
            );
        }

        let already_active = self
            .active
            .as_ref()
            .is_some_and(|active| active.name == params.name);
        let plan = self.filter.plan_switch(Some(&params.name));
        let (shown, hidden) = (plan.show.len(), plan.hide.len());

        if !plan.is_empty() {
            if let Err(err) = self.sway.run_batch(&plan.commands()) {
                return Response::err(id, ERR_COMPOSITOR, format!("{err:#}"));
            }
            self.filter.mark_applied(&plan);
        }

        if !already_active {
            let active = ActiveProject {
                name: params.name.clone(),
                activated_at: swayproj_types::unix_time(),
            };
            if let Err(err) = self.store.write_active(Some(&active)) {
                return Response::err(id, ERR_PERSISTENCE, format!("{err:#}"));
            }
            self.active = Some(active);
            self.broadcast("project_switched", json!({ "project": params.name }));
        }

        ok_json(
            id,
            &SwitchResult {
                project: params.name,
                shown,
                hidden,
                changed: !already_active || shown + hidden > 0,
            },
        )
    }

    fn handle_project_clear(&mut self, id: u64) -> Response {
        let plan = self.filter.plan_switch(None);
        let shown = plan.show.len();
        if !plan.is_empty() {
            if let Err(err) = self.sway.run_batch(&plan.commands()) {
                return Response::err(id, ERR_COMPOSITOR, format!("{err:#}"));
            }
            self.filter.mark_applied(&plan);
        }
        if let Err(err) = self.store.write_active(None) {
            return Response::err(id, ERR_PERSISTENCE, format!("{err:#}"));
        }
        let was_active = self.active.take().map(|active| active.name);
        if was_active.is_some() {
            self.broadcast("project_cleared", json!({ "project": was_active }));
        }
        ok_json(id, &json!({ "shown": shown }))
    }

    fn handle_monitors_status(&self, id: u64) -> Response {
        let status = MonitorsStatus {
            current_profile: self.monitors.current_profile().map(ToString::to_string),
            state: self.monitors.state().clone(),
            switch_in_progress: self.monitors.switch_in_progress(),
            recent_events: self.monitors.recent_events(),
        };
        ok_json(id, &status)
    }

    fn handle_monitors_apply(&mut self, id: u64, params: &Value) -> Response {
        let params: NameParams = match serde_json::from_value(params.clone()) {
            Ok(params) => params,
            Err(err) => return Response::err(id, ERR_INVALID_PARAMS, err.to_string()),
        };
        if self.monitors.switch_in_progress() {
            return Response::err(id, ERR_BUSY, "a profile switch is already in progress");
        }
        let profile = match self.store.load_profile(&params.name) {
            Ok(Some(profile)) => profile,
            Ok(None) => {
                return Response::err(
                    id,
                    ERR_NOT_FOUND,
                    format!("no such monitor profile '{}'", params.name),
                )
            }
            Err(err) => return Response::err(id, ERR_PERSISTENCE, format!("{err:#}")),
        };
        if let Err(err) = validate_profile(&profile) {
            return Response::err(id, ERR_VALIDATION, format!("{err:#}"));
        }

        let state = match self.monitors.apply_profile(&mut self.sway, &profile) {
            Ok(state) => state,
            Err(err) => {
                self.flush_profile_events();
                return Response::err(id, ERR_COMPOSITOR, format!("{err:#}"));
            }
        };

        // Persist before committing memory so disk and memory never diverge.
        let persisted = self
            .store
            .write_output_state(&state)
            .and_then(|()| self.store.write_current_profile(&profile.name));
        if let Err(err) = persisted {
            self.monitors
                .record_persist_failure(&profile.name, &format!("{err:#}"));
            self.flush_profile_events();
            return Response::err(id, ERR_PERSISTENCE, format!("{err:#}"));
        }

        self.monitors.commit(state, Some(profile.name.clone()));
        self.flush_profile_events();
        self.handle_monitors_status(id)
    }

    fn handle_monitors_reassign(&mut self, id: u64) -> Response {
        if self.monitors.switch_in_progress() {
            return Response::err(id, ERR_BUSY, "a profile switch is already in progress");
        }
        let (state, moves) = match self.monitors.reassign(&mut self.sway) {
            Ok(result) => result,
            Err(err) => return Response::err(id, ERR_COMPOSITOR, format!("{err:#}")),
        };
        if let Err(err) = self.store.write_output_state(&state) {
            return Response::err(id, ERR_PERSISTENCE, format!("{err:#}"));
        }
        let outputs = state.outputs.iter().filter(|record| record.enabled).count();
        self.monitors.commit(state, None);
        ok_json(id, &ReassignResult { moves, outputs })
    }

    /// Debounced variant of reassignment, fired from the tick.
    fn run_reassign_now(&mut self) {
        if self.monitors.switch_in_progress() {
            return;
        }
        match self.monitors.reassign(&mut self.sway) {
            Ok((state, moves)) => {
                if let Err(err) = self.store.write_output_state(&state) {
                    warn!("failed to persist output state after reassign: {err:#}");
                    return;
                }
                info!(moves, "workspaces redistributed after topology change");
                self.monitors.commit(state, None);
                self.broadcast("workspaces_reassigned", json!({ "moves": moves }));
            }
            Err(err) => warn!("debounced reassignment failed: {err:#}"),
        }
    }

    fn handle_layout_save(&mut self, id: u64, params: &Value) -> Response {
        let params: NameParams = match serde_json::from_value(params.clone()) {
            Ok(params) => params,
            Err(err) => return Response::err(id, ERR_INVALID_PARAMS, err.to_string()),
        };
        if let Err(err) = validate_name(&params.name) {
            return Response::err(id, ERR_VALIDATION, format!("{err:#}"));
        }
        let tree = match self.sway.get_tree() {
            Ok(tree) => tree,
            Err(err) => return Response::err(id, ERR_COMPOSITOR, format!("{err:#}")),
        };
        let snapshot = capture_layout(&tree, &self.registry, &params.name);
        if let Err(err) = self.store.write_layout(&snapshot) {
            return Response::err(id, ERR_PERSISTENCE, format!("{err:#}"));
        }
        let result = SaveResult {
            layout: snapshot.name.clone(),
            windows: snapshot.placeholder_count(),
            workspaces: snapshot.workspaces.len(),
        };
        self.broadcast(
            "layout_saved",
            json!({ "layout": result.layout, "windows": result.windows }),
        );
        ok_json(id, &result)
    }

    /// Restore launches placeholders and answers later, once every token
    /// matched or expired (or the total deadline passed).
    fn handle_layout_restore(&mut self, client: u64, id: u64, params: &Value) -> Option<Response> {
        let params: RestoreParams = match serde_json::from_value(params.clone()) {
            Ok(params) => params,
            Err(err) => return Some(Response::err(id, ERR_INVALID_PARAMS, err.to_string())),
        };
        let Some(project) = self.projects.get(&params.project).cloned() else {
            return Some(Response::err(
                id,
                ERR_NOT_FOUND,
                format!("no such project '{}'", params.project),
            ));
        };
        if let Err(err) = validate_name(&params.name) {
            return Some(Response::err(id, ERR_VALIDATION, format!("{err:#}")));
        }
        let snapshot = match self.store.load_layout(&params.name) {
            Ok(Some(snapshot)) => snapshot,
            Ok(None) => {
                return Some(Response::err(
                    id,
                    ERR_NOT_FOUND,
                    format!("no such layout '{}'", params.name),
                ))
            }
            Err(err) => return Some(Response::err(id, ERR_PERSISTENCE, format!("{err:#}"))),
        };

        let now = Instant::now();
        let op = match RestoreOp::start(client, id, &snapshot, &project, &mut self.engine, now) {
            Ok(op) => op,
            Err(err) => return Some(Response::err(id, ERR_VALIDATION, format!("{err:#}"))),
        };
        if op.is_complete() {
            // Every launch failed on the spot; answer immediately.
            let summary = op.finish();
            return Some(ok_json(id, &summary));
        }
        self.restores.push(op);
        None
    }

    fn finalize_restores(&mut self, now: Instant) {
        let mut index = 0;
        while index < self.restores.len() {
            if self.restores[index].is_complete() || self.restores[index].is_past_deadline(now) {
                let op = self.restores.remove(index);
                let client = op.client;
                let request_id = op.request_id;
                let summary = op.finish();
                self.broadcast(
                    "layout_restored",
                    json!({
                        "layout": summary.layout,
                        "matched": summary.matched,
                        "expired": summary.expired,
                    }),
                );
                let response = ok_json(request_id, &summary);
                self.send_response(client, &response);
            } else {
                index += 1;
            }
        }
    }

    // ---- client I/O ----

    fn send_response(&mut self, client: u64, response: &Response) {
        let Some(writer) = self.clients.get_mut(&client) else {
            debug!(client, "dropping response for departed client");
            return;
        };
        if write_json_line(writer, response).is_err() {
            self.clients.remove(&client);
            self.subscribers.remove(&client);
        }
    }

    fn broadcast(&mut self, event_type: &str, params: Value) {
        if self.subscribers.is_empty() {
            return;
        }
        let notification = EventNotification::new(event_type, params);
        let mut dead = Vec::new();
        for client in self.subscribers.iter().copied() {
            let Some(writer) = self.clients.get_mut(&client) else {
                dead.push(client);
                continue;
            };
            if write_json_line(writer, &notification).is_err() {
                dead.push(client);
            }
        }
        for client in dead {
            self.clients.remove(&client);
            self.subscribers.remove(&client);
        }
    }
}

fn ok_json<T: Serialize>(id: u64, value: &T) -> Response {
    match serde_json::to_value(value) {
        Ok(value) => Response::ok(id, value),
        Err(err) => Response::err(id, ERR_INTERNAL, format!("failed to serialize result: {err}")),
    }
}

fn write_json_line<T: Serialize>(writer: &mut BufWriter<UnixStream>, value: &T) -> Result<()> {
    serde_json::to_writer(&mut *writer, value).context("failed to serialize line")?;
    writer.write_all(b"\n").context("failed to write newline")?;
    writer.flush().context("failed to flush line")?;
    Ok(())
}
