//! Shared test doubles: a scripted `tahoe` launcher and an in-memory grid.
#![allow(dead_code)]

use async_trait::async_trait;
use gridsync_tahoe::aliases::lookup_alias;
use gridsync_tahoe::{
    Capability, ClientOptions, Gateway, GatewayConfig, GatewayServices, GridApi, LaunchRequest,
    LauncherKind, LineSink, Node, NodeData, ProcessLauncher, Result, RunOutput, StopStrategy,
    TahoeError,
};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

pub const FAKE_PID: u32 = 4242;
pub const NODE_URL: &str = "http://127.0.0.1:3456/";
pub const API_TOKEN: &str = "fake-api-token";

// ============================================================================
// In-memory grid
// ============================================================================

#[derive(Debug, Clone)]
struct FileEntry {
    size: u64,
    mtime: Option<f64>,
}

#[derive(Default)]
struct GridState {
    next_id: u64,
    /// fingerprint -> child name -> child cap
    dirs: HashMap<String, BTreeMap<String, Capability>>,
    files: HashMap<String, FileEntry>,
    endpoint: Option<(String, String)>,
    connected: u32,
    known: u32,
    status_override: Option<String>,
    link_delay: Duration,
    events: Vec<String>,
    status_queries: Vec<Option<String>>,
}

/// A grid shared by every gateway in a test
pub struct FakeGrid {
    state: Mutex<GridState>,
}

impl Default for FakeGrid {
    fn default() -> Self {
        Self {
            state: Mutex::new(GridState {
                connected: 10,
                known: 10,
                ..Default::default()
            }),
        }
    }
}

/// Deterministic base32-alphabet token of `len` characters
fn token(id: u64, tag: char, len: usize) -> String {
    let digits: String = format!("{id:0>width$}", width = len - 1)
        .chars()
        .map(|d| (b'a' + d as u8 - b'0') as char)
        .collect();
    format!("{tag}{digits}")
}

impl FakeGrid {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Create a mutable directory and return its write cap
    pub fn create_dir(&self) -> Capability {
        let mut state = self.state.lock().unwrap();
        state.next_id += 1;
        let id = state.next_id;
        let fingerprint = token(id, 'z', 52);
        state.dirs.insert(fingerprint.clone(), BTreeMap::new());
        Capability::new(format!("URI:DIR2:{}:{}", token(id, 'w', 26), fingerprint))
    }

    /// Put a file entry directly into a directory
    pub fn add_file(&self, dircap: &Capability, name: &str, size: u64, mtime: Option<f64>) {
        let mut state = self.state.lock().unwrap();
        state.next_id += 1;
        let cap = Capability::new(format!("URI:CHK:{}:{}:1:1:{size}", token(state.next_id, 'c', 26), token(state.next_id, 'd', 52)));
        state
            .files
            .insert(cap.as_str().to_string(), FileEntry { size, mtime });
        let fingerprint = dircap.fingerprint().unwrap().to_string();
        state
            .dirs
            .get_mut(&fingerprint)
            .expect("known directory")
            .insert(name.to_string(), cap);
    }

    pub fn child_names(&self, dircap: &Capability) -> Vec<String> {
        let state = self.state.lock().unwrap();
        state
            .dirs
            .get(dircap.fingerprint().unwrap())
            .map(|children| children.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn child(&self, dircap: &Capability, name: &str) -> Option<Capability> {
        let state = self.state.lock().unwrap();
        state.dirs.get(dircap.fingerprint()?)?.get(name).cloned()
    }

    pub fn set_connected(&self, connected: u32) {
        self.state.lock().unwrap().connected = connected;
    }

    /// Serve this body from the status endpoint instead of the JSON listing
    pub fn set_status_body(&self, body: &str) {
        self.state.lock().unwrap().status_override = Some(body.to_string());
    }

    pub fn set_link_delay(&self, delay: Duration) {
        self.state.lock().unwrap().link_delay = delay;
    }

    pub fn events(&self) -> Vec<String> {
        self.state.lock().unwrap().events.clone()
    }

    pub fn status_queries(&self) -> Vec<Option<String>> {
        self.state.lock().unwrap().status_queries.clone()
    }

    fn require_endpoint(&self) -> Result<()> {
        match self.state.lock().unwrap().endpoint {
            Some(_) => Ok(()),
            None => Err(TahoeError::NotRunning),
        }
    }

    fn node_for(state: &GridState, cap: &Capability) -> Option<Node> {
        if let Some(file) = state.files.get(cap.as_str()) {
            let metadata = file
                .mtime
                .map(|t| serde_json::json!({"tahoe": {"linkmotime": t, "linkcrtime": t}}));
            return Some(Node(
                "filenode".into(),
                NodeData {
                    ro_uri: Some(cap.clone()),
                    size: Some(file.size),
                    mutable: Some(false),
                    metadata,
                    ..Default::default()
                },
            ));
        }
        state.dirs.get(cap.fingerprint()?)?;
        Some(Node(
            "dirnode".into(),
            NodeData {
                rw_uri: cap.is_read_write().then(|| cap.clone()),
                ro_uri: cap.diminish(),
                mutable: Some(true),
                ..Default::default()
            },
        ))
    }

    fn listing(state: &GridState, cap: &Capability) -> Option<Node> {
        let mut node = Self::node_for(state, cap)?;
        if let Some(children) = cap.fingerprint().and_then(|f| state.dirs.get(f)) {
            for (name, child) in children {
                if let Some(child_node) = Self::node_for(state, child) {
                    node.1.children.insert(name.clone(), child_node);
                }
            }
        }
        Some(node)
    }

    fn writable_dir<'a>(
        state: &'a mut GridState,
        dircap: &Capability,
    ) -> Result<&'a mut BTreeMap<String, Capability>> {
        if !dircap.is_read_write() {
            return Err(TahoeError::Web {
                status: 400,
                body: "read-only directory".into(),
            });
        }
        let fingerprint = dircap.fingerprint().unwrap_or_default().to_string();
        state.dirs.get_mut(&fingerprint).ok_or(TahoeError::Web {
            status: 404,
            body: "No such child".into(),
        })
    }

    async fn pause(&self) {
        let delay = self.state.lock().unwrap().link_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }
}

#[async_trait]
impl GridApi for FakeGrid {
    fn connect(&self, nodeurl: &str, api_token: &str) -> Result<()> {
        self.state.lock().unwrap().endpoint = Some((nodeurl.to_string(), api_token.to_string()));
        Ok(())
    }

    fn node_url(&self) -> Option<String> {
        self.state.lock().unwrap().endpoint.as_ref().map(|(url, _)| url.clone())
    }

    async fn mkdir(&self) -> Result<Capability> {
        self.require_endpoint()?;
        Ok(self.create_dir())
    }

    async fn upload(&self, local_path: &Path) -> Result<Capability> {
        self.require_endpoint()?;
        let size = fs::metadata(local_path)?.len();
        let mut state = self.state.lock().unwrap();
        state.next_id += 1;
        let cap = Capability::new(format!("URI:CHK:{}:{}:1:1:{size}", token(state.next_id, 'c', 26), token(state.next_id, 'd', 52)));
        state
            .files
            .insert(cap.as_str().to_string(), FileEntry { size, mtime: None });
        Ok(cap)
    }

    async fn download(&self, cap: &Capability, local_path: &Path) -> Result<()> {
        self.require_endpoint()?;
        let size = self
            .state
            .lock()
            .unwrap()
            .files
            .get(cap.as_str())
            .map(|f| f.size)
            .ok_or(TahoeError::Web {
                status: 404,
                body: "not found".into(),
            })?;
        fs::write(local_path, vec![0u8; size as usize])?;
        Ok(())
    }

    async fn link(&self, dircap: &Capability, childname: &str, childcap: &Capability) -> Result<()> {
        self.require_endpoint()?;
        self.state.lock().unwrap().events.push(format!("enter:{childname}"));
        self.pause().await;
        let result = {
            let mut state = self.state.lock().unwrap();
            let outcome = Self::writable_dir(&mut state, dircap).map(|dir| {
                dir.insert(childname.to_string(), childcap.clone());
            });
            outcome
        };
        self.state.lock().unwrap().events.push(format!("exit:{childname}"));
        result
    }

    async fn unlink(&self, dircap: &Capability, childname: &str) -> Result<()> {
        self.require_endpoint()?;
        self.state.lock().unwrap().events.push(format!("enter:-{childname}"));
        self.pause().await;
        let result = {
            let mut state = self.state.lock().unwrap();
            let outcome = Self::writable_dir(&mut state, dircap).and_then(|dir| {
                dir.remove(childname).map(|_| ()).ok_or(TahoeError::Web {
                    status: 404,
                    body: format!("No such child: {childname}"),
                })
            });
            outcome
        };
        self.state.lock().unwrap().events.push(format!("exit:-{childname}"));
        result
    }

    async fn get_json(&self, cap: &Capability) -> Result<Option<Node>> {
        let state = self.state.lock().unwrap();
        if state.endpoint.is_none() {
            return Ok(None);
        }
        match Self::listing(&state, cap) {
            Some(node) => Ok(Some(node)),
            None => Err(TahoeError::Web {
                status: 404,
                body: "No such file or directory".into(),
            }),
        }
    }

    async fn status_page(&self, structured: bool) -> Result<Option<String>> {
        let state = self.state.lock().unwrap();
        if state.endpoint.is_none() {
            return Ok(None);
        }
        if let Some(body) = &state.status_override {
            return Ok(Some(body.clone()));
        }
        assert!(structured, "readiness should request the structured status");
        let servers: Vec<_> = (0..state.known)
            .map(|i| {
                let status = if i < state.connected {
                    "Connected to tcp:storage:4567 via tcp"
                } else {
                    "Trying to connect"
                };
                serde_json::json!({"connection_status": status, "available_space": 1024})
            })
            .collect();
        Ok(Some(serde_json::json!({ "servers": servers }).to_string()))
    }

    async fn magic_folder_status(&self, name: Option<&str>) -> Result<Option<serde_json::Value>> {
        let mut state = self.state.lock().unwrap();
        if state.endpoint.is_none() {
            return Ok(None);
        }
        state.status_queries.push(name.map(str::to_string));
        Ok(Some(serde_json::json!([{"path": "file.txt", "status": "success", "kind": "upload"}])))
    }
}

// ============================================================================
// Scripted tahoe executable
// ============================================================================

/// One recorded `tahoe -d <nodedir> <args..>` invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub nodedir: PathBuf,
    pub args: Vec<String>,
}

impl Invocation {
    pub fn starts_with(&self, prefix: &[&str]) -> bool {
        self.args.len() >= prefix.len() && self.args.iter().zip(prefix).all(|(a, p)| a == p)
    }
}

#[derive(Default)]
struct LauncherState {
    invocations: Vec<Invocation>,
    failures: Vec<(Vec<String>, String)>,
    versions: HashMap<PathBuf, String>,
    registries: HashMap<PathBuf, BTreeMap<String, (String, Capability, Capability)>>,
    run_pid: Option<u32>,
}

/// Simulates the `tahoe` CLI against real node directories on disk.
///
/// `legacy` daemons reject every folder-scoped (`-n`) subcommand with the
/// "not recognized" failure of single-folder releases.
pub struct FakeLauncher {
    grid: Arc<FakeGrid>,
    legacy: bool,
    state: Mutex<LauncherState>,
}

fn fail(output: &str) -> Result<RunOutput> {
    Err(TahoeError::Command(output.to_string()))
}

fn write_yaml_registry(nodedir: &Path, folders: &BTreeMap<String, (String, Capability, Capability)>) {
    let mut yaml = String::from("magic-folders:\n");
    for (name, (directory, collective, upload)) in folders {
        yaml.push_str(&format!(
            "  '{name}':\n    directory: '{directory}'\n    collective_dircap: '{collective}'\n    upload_dircap: '{upload}'\n    poll_interval: 60\n"
        ));
    }
    fs::write(nodedir.join("private").join("magic_folders.yaml"), yaml).unwrap();
}

fn append_line(path: &Path, line: &str) {
    let mut contents = fs::read_to_string(path).unwrap_or_default();
    contents.push_str(line);
    contents.push('\n');
    fs::write(path, contents).unwrap();
}

impl FakeLauncher {
    pub fn new(grid: Arc<FakeGrid>) -> Arc<Self> {
        Arc::new(Self {
            grid,
            legacy: false,
            state: Mutex::new(LauncherState::default()),
        })
    }

    pub fn legacy(grid: Arc<FakeGrid>) -> Arc<Self> {
        Arc::new(Self {
            grid,
            legacy: true,
            state: Mutex::new(LauncherState::default()),
        })
    }

    /// Fail any invocation whose arguments start with `prefix`
    pub fn fail_on(&self, prefix: &[&str], output: &str) {
        self.state
            .lock()
            .unwrap()
            .failures
            .push((prefix.iter().map(|s| s.to_string()).collect(), output.to_string()));
    }

    pub fn clear_failures(&self) {
        self.state.lock().unwrap().failures.clear();
    }

    pub fn set_version(&self, program: impl Into<PathBuf>, output: &str) {
        self.state
            .lock()
            .unwrap()
            .versions
            .insert(program.into(), output.to_string());
    }

    /// Report `pid` from `run` and leave the pid file to the gateway
    pub fn set_run_pid(&self, pid: u32) {
        self.state.lock().unwrap().run_pid = Some(pid);
    }

    pub fn invocations(&self) -> Vec<Invocation> {
        self.state.lock().unwrap().invocations.clone()
    }

    pub fn invocations_for(&self, nodedir: &Path) -> Vec<Invocation> {
        self.invocations()
            .into_iter()
            .filter(|i| i.nodedir == nodedir)
            .collect()
    }

    /// Create a collective with `admin` as its first member
    fn new_folder(&self) -> (Capability, Capability) {
        let collective = self.grid.create_dir();
        let personal = self.grid.create_dir();
        let readcap = personal.diminish().unwrap();
        self.grid
            .state
            .lock()
            .unwrap()
            .dirs
            .get_mut(collective.fingerprint().unwrap())
            .unwrap()
            .insert("admin".into(), readcap);
        (collective, personal)
    }

    fn invite(&self, collective: &Capability, nickname: &str) -> String {
        let personal = self.grid.create_dir();
        self.grid
            .state
            .lock()
            .unwrap()
            .dirs
            .get_mut(collective.fingerprint().unwrap())
            .unwrap()
            .insert(nickname.to_string(), personal.diminish().unwrap());
        format!("{}+{}\n", collective.diminish().unwrap(), personal)
    }

    fn create_client(&self, nodedir: &Path, args: &[String]) -> Result<RunOutput> {
        let option = |flag: &str| {
            args.iter()
                .position(|a| a == flag)
                .and_then(|i| args.get(i + 1))
                .cloned()
        };
        fs::create_dir_all(nodedir.join("private"))?;
        let mut cfg = String::from("# -*- mode: conf; coding: utf-8 -*-\n\n[node]\nweb.port = tcp:0:interface=127.0.0.1\n");
        if let Some(nickname) = option("--nickname") {
            cfg.push_str(&format!("nickname = {nickname}\n"));
        }
        cfg.push_str("\n[client]\n");
        for (flag, key) in [
            ("--introducer", "introducer.furl"),
            ("--shares-needed", "shares.needed"),
            ("--shares-happy", "shares.happy"),
            ("--shares-total", "shares.total"),
        ] {
            if let Some(value) = option(flag) {
                cfg.push_str(&format!("{key} = {value}\n"));
            }
        }
        fs::write(nodedir.join("tahoe.cfg"), cfg)?;
        Ok(RunOutput::Completed(format!(
            "Node created in '{}'",
            nodedir.display()
        )))
    }

    fn magic_folder(&self, nodedir: &Path, args: &[String]) -> Result<RunOutput> {
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        if self.legacy && args.contains(&"-n") {
            return fail("Usage: tahoe [global-options] magic-folder create\nOption -n not recognized");
        }
        match args.as_slice() {
            ["create", "-n", name, alias, _, path] => {
                let (collective, personal) = self.new_folder();
                append_line(&nodedir.join("private").join("aliases"), &format!("{alias} {collective}"));
                let mut state = self.state.lock().unwrap();
                let registry = state.registries.entry(nodedir.to_path_buf()).or_default();
                registry.insert(name.to_string(), (path.to_string(), collective, personal));
                write_yaml_registry(nodedir, registry);
                Ok(RunOutput::Completed(String::new()))
            }
            ["join", "-n", name, code, path] => {
                let (collective, personal) = code.split_once('+').unwrap();
                let mut state = self.state.lock().unwrap();
                let registry = state.registries.entry(nodedir.to_path_buf()).or_default();
                registry.insert(
                    name.to_string(),
                    (path.to_string(), Capability::new(collective), Capability::new(personal)),
                );
                write_yaml_registry(nodedir, registry);
                Ok(RunOutput::Completed(String::new()))
            }
            ["create", alias, _, path] => {
                let (collective, personal) = self.new_folder();
                let private = nodedir.join("private");
                append_line(&private.join("aliases"), &format!("{alias} {collective}"));
                fs::write(private.join("collective_dircap"), collective.as_str())?;
                fs::write(private.join("magic_folder_dircap"), personal.as_str())?;
                append_line(&nodedir.join("tahoe.cfg"), &format!("\n[magic_folder]\nenabled = True\nlocal.directory = {path}"));
                Ok(RunOutput::Completed(String::new()))
            }
            ["join", code, path] => {
                let (collective, personal) = code.split_once('+').unwrap();
                let private = nodedir.join("private");
                fs::write(private.join("collective_dircap"), collective)?;
                fs::write(private.join("magic_folder_dircap"), personal)?;
                append_line(&nodedir.join("tahoe.cfg"), &format!("\n[magic_folder]\nenabled = True\nlocal.directory = {path}"));
                Ok(RunOutput::Completed(String::new()))
            }
            ["invite", "-n", _, alias, nickname] | ["invite", alias, nickname] => {
                let Some(collective) = lookup_alias(&nodedir.join("private").join("aliases"), alias) else {
                    return fail(&format!("No alias {alias}"));
                };
                Ok(RunOutput::Completed(self.invite(&collective, nickname)))
            }
            ["leave", "-n", name] => {
                let mut state = self.state.lock().unwrap();
                let registry = state.registries.entry(nodedir.to_path_buf()).or_default();
                registry.remove(*name);
                write_yaml_registry(nodedir, registry);
                Ok(RunOutput::Completed(String::new()))
            }
            other => fail(&format!("unexpected magic-folder invocation: {other:?}")),
        }
    }
}

#[async_trait]
impl ProcessLauncher for FakeLauncher {
    async fn launch(&self, request: LaunchRequest, on_line: LineSink) -> Result<RunOutput> {
        assert_eq!(request.args[0], "-d");
        let nodedir = PathBuf::from(&request.args[1]);
        let args = request.args[2..].to_vec();
        let failure = {
            let mut state = self.state.lock().unwrap();
            state.invocations.push(Invocation {
                nodedir: nodedir.clone(),
                args: args.clone(),
            });
            state
                .failures
                .iter()
                .find(|(prefix, _)| args.starts_with(prefix))
                .map(|(_, output)| output.clone())
        };
        if let Some(output) = failure {
            on_line(&output);
            return fail(&output);
        }

        let subcommand = args.first().map(String::as_str).unwrap_or_default();
        let result = match subcommand {
            "--version" => {
                let version = self
                    .state
                    .lock()
                    .unwrap()
                    .versions
                    .get(&request.program)
                    .cloned()
                    .unwrap_or_else(|| "tahoe-lafs: 1.12.1\nfoolscap: 0.12.6".to_string());
                Ok(RunOutput::Completed(version))
            }
            "create-client" => self.create_client(&nodedir, &args[1..]),
            "run" => {
                if !nodedir.join("tahoe.cfg").is_file() {
                    return fail(&format!("'{}' does not look like a node directory", nodedir.display()));
                }
                assert_eq!(request.trigger.as_deref(), Some("client running"));
                on_line("Node starting");
                fs::write(nodedir.join("node.url"), NODE_URL)?;
                fs::write(nodedir.join("private").join("api_auth_token"), API_TOKEN)?;
                let run_pid = self.state.lock().unwrap().run_pid;
                if run_pid.is_none() {
                    fs::write(nodedir.join("twistd.pid"), FAKE_PID.to_string())?;
                }
                on_line("client running");
                Ok(RunOutput::Triggered {
                    pid: Some(run_pid.unwrap_or(FAKE_PID)),
                })
            }
            "stop" => {
                let pidfile = nodedir.join("twistd.pid");
                if pidfile.is_file() {
                    fs::remove_file(pidfile)?;
                    Ok(RunOutput::Completed("process 4242 is dead".into()))
                } else {
                    fail(&format!("No \"twistd.pid\" file in '{}'. Is it running?", nodedir.display()))
                }
            }
            "magic-folder" => self.magic_folder(&nodedir, &args[1..]),
            other => fail(&format!("Unknown command: {other}")),
        };
        if let Ok(RunOutput::Completed(output)) = &result {
            output.lines().filter(|l| !l.is_empty()).for_each(|l| on_line(l));
        }
        result
    }
}

// ============================================================================
// Fixtures
// ============================================================================

pub fn services(launcher: Arc<FakeLauncher>, grid: Arc<FakeGrid>) -> GatewayServices {
    services_with(launcher, grid, StopStrategy::Command)
}

pub fn services_with(
    launcher: Arc<FakeLauncher>,
    grid: Arc<FakeGrid>,
    stop_strategy: StopStrategy,
) -> GatewayServices {
    let config = GatewayConfig {
        executable: Some(PathBuf::from("tahoe")),
        poll_interval_ms: 10,
        stop_strategy,
        launcher: LauncherKind::Streaming,
    };
    GatewayServices::from_config(&config)
        .with_launcher(launcher)
        .with_grid_api(Arc::new(move || -> Result<Arc<dyn GridApi>> { Ok(grid.clone()) }))
}

pub fn grid_options() -> ClientOptions {
    ClientOptions {
        nickname: Some("TestGrid".into()),
        introducer: Some("pb://abc234@introducer.example:44800/introducer".into()),
        shares_needed: Some("1".into()),
        shares_happy: Some("1".into()),
        shares_total: Some("1".into()),
    }
}

/// A temporary node directory with its fakes
pub struct TestNode {
    pub tmp: TempDir,
    pub grid: Arc<FakeGrid>,
    pub launcher: Arc<FakeLauncher>,
    pub gateway: Gateway,
}

impl TestNode {
    /// An unprovisioned gateway at `<tmp>/node`
    pub fn bare(legacy: bool) -> Self {
        Self::with_stop_strategy(legacy, StopStrategy::Command)
    }

    pub fn with_stop_strategy(legacy: bool, stop_strategy: StopStrategy) -> Self {
        let tmp = TempDir::new().unwrap();
        let grid = FakeGrid::new();
        let launcher = if legacy {
            FakeLauncher::legacy(grid.clone())
        } else {
            FakeLauncher::new(grid.clone())
        };
        let gateway = Gateway::new(
            tmp.path().join("node"),
            services_with(launcher.clone(), grid.clone(), stop_strategy),
        )
        .unwrap();
        Self {
            tmp,
            grid,
            launcher,
            gateway,
        }
    }

    /// A provisioned, running gateway
    pub async fn running(legacy: bool) -> Self {
        let mut node = Self::bare(legacy);
        node.gateway.create_client(&grid_options()).await.unwrap();
        node.gateway.start().await.unwrap();
        node
    }

    pub fn nodedir(&self) -> PathBuf {
        self.gateway.nodedir().to_path_buf()
    }

    /// A local folder path inside the temp dir (not yet created)
    pub fn folder_path(&self, name: &str) -> PathBuf {
        self.tmp.path().join("local").join(name)
    }

    pub fn new_gateway(&self, name: &str) -> Gateway {
        Gateway::new(self.tmp.path().join(name), services(self.launcher.clone(), self.grid.clone())).unwrap()
    }
}
