//! Gateway: one Tahoe-LAFS client node and its lifecycle
//!
//! A [`Gateway`] is identified by its node directory. It owns the process
//! runner and the grid API client for that node, caches the rootcap, and
//! holds the registry of magic-folders, including any nested subclient
//! gateways that serve folders on daemons without multi-folder support.
//!
//! Lifecycle: `Stopped -> Starting -> Running -> Stopping -> Stopped`. A
//! crashed node is only noticed indirectly (missing pid file, failed
//! readiness).

use crate::aliases;
use crate::api::{GridApi, Node};
use crate::capability::Capability;
use crate::client::CapabilityClient;
use crate::config::{GatewayConfig, StopStrategy};
use crate::config_store::ConfigStore;
use crate::error::{Result, TahoeError};
use crate::magic_folder::MagicFolder;
use crate::nodedir::NodeDir;
use crate::process::{LineSink, ProcessLauncher, ProcessRunner, RunOutput};
use crate::status::{parse_grid_status, GridStatus, StatusSource};
use futures::future::{try_join_all, BoxFuture};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

/// Output line printed by `tahoe run` once the node is serving
pub const RUNNING_TRIGGER: &str = "client running";

/// Builds a fresh grid API client for a gateway
pub type GridApiFactory = Arc<dyn Fn() -> Result<Arc<dyn GridApi>> + Send + Sync>;

/// Where a gateway is in its start/stop lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatewayState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

/// Collaborators shared by a gateway and every subclient it provisions
#[derive(Clone)]
pub struct GatewayServices {
    pub launcher: Arc<dyn ProcessLauncher>,
    pub grid_api: GridApiFactory,
    pub stop_strategy: StopStrategy,
    pub poll_interval: Duration,
    pub executable: Option<PathBuf>,
    pub line_observer: Option<LineSink>,
}

impl GatewayServices {
    pub fn from_config(config: &GatewayConfig) -> Self {
        Self {
            launcher: config.launcher.build(),
            grid_api: Arc::new(|| -> Result<Arc<dyn GridApi>> {
                Ok(Arc::new(CapabilityClient::new()?))
            }),
            stop_strategy: config.stop_strategy,
            poll_interval: config.poll_interval(),
            executable: config.executable.clone(),
            line_observer: None,
        }
    }

    pub fn with_launcher(mut self, launcher: Arc<dyn ProcessLauncher>) -> Self {
        self.launcher = launcher;
        self
    }

    pub fn with_grid_api(mut self, factory: GridApiFactory) -> Self {
        self.grid_api = factory;
        self
    }

    pub fn with_executable(mut self, executable: impl Into<PathBuf>) -> Self {
        self.executable = Some(executable.into());
        self
    }

    pub fn with_line_observer(mut self, observer: LineSink) -> Self {
        self.line_observer = Some(observer);
        self
    }
}

impl Default for GatewayServices {
    fn default() -> Self {
        Self::from_config(&GatewayConfig::default())
    }
}

/// Options for `tahoe create-client`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ClientOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nickname: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub introducer: Option<String>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "crate::invite::string_or_number"
    )]
    pub shares_needed: Option<String>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "crate::invite::string_or_number"
    )]
    pub shares_happy: Option<String>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "crate::invite::string_or_number"
    )]
    pub shares_total: Option<String>,
}

impl ClientOptions {
    fn to_args(&self) -> Vec<String> {
        let pairs = [
            ("--nickname", &self.nickname),
            ("--introducer", &self.introducer),
            ("--shares-needed", &self.shares_needed),
            ("--shares-happy", &self.shares_happy),
            ("--shares-total", &self.shares_total),
        ];
        pairs
            .into_iter()
            .filter_map(|(flag, value)| value.as_ref().map(|v| [flag.to_string(), v.clone()]))
            .flatten()
            .collect()
    }
}

pub struct Gateway {
    pub(crate) paths: NodeDir,
    name: String,
    pub(crate) services: GatewayServices,
    runner: ProcessRunner,
    config: ConfigStore,
    pub(crate) api: Arc<dyn GridApi>,
    link_lock: Mutex<()>,
    state: GatewayState,
    nodeurl: Option<String>,
    api_token: Option<String>,
    shares_happy: Option<u32>,
    rootcap: Option<Capability>,
    pub(crate) magic_folders: BTreeMap<String, MagicFolder>,
}

impl fmt::Debug for Gateway {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Gateway")
            .field("nodedir", &self.paths.root())
            .field("state", &self.state)
            .field("nodeurl", &self.nodeurl)
            .field("shares_happy", &self.shares_happy)
            .field("magic_folders", &self.magic_folders.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Gateway {
    pub fn new(nodedir: impl Into<PathBuf>, services: GatewayServices) -> Result<Self> {
        let paths = NodeDir::new(nodedir);
        let name = paths
            .root()
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let mut runner = ProcessRunner::new(
            paths.root(),
            services.executable.clone(),
            services.launcher.clone(),
        );
        if let Some(observer) = &services.line_observer {
            runner = runner.with_observer(observer.clone());
        }
        let api = (services.grid_api)()?;
        Ok(Self {
            config: ConfigStore::new(paths.config()),
            paths,
            name,
            services,
            runner,
            api,
            link_lock: Mutex::new(()),
            state: GatewayState::Stopped,
            nodeurl: None,
            api_token: None,
            shares_happy: None,
            rootcap: None,
            magic_folders: BTreeMap::new(),
        })
    }

    /// Gateway for `~/.tahoe`
    pub fn at_default_location(services: GatewayServices) -> Result<Self> {
        Self::new(NodeDir::default_location(), services)
    }

    /// The node directory identifying this gateway
    pub fn nodedir(&self) -> &Path {
        self.paths.root()
    }

    /// Well-known file locations inside the node directory
    pub fn layout(&self) -> &NodeDir {
        &self.paths
    }

    /// Basename of the node directory
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current lifecycle state
    pub fn state(&self) -> GatewayState {
        self.state
    }

    /// Base URL of the web API, set once the node is running
    pub fn nodeurl(&self) -> Option<&str> {
        self.nodeurl.as_deref()
    }

    /// Token from `private/api_auth_token`, set once the node is running
    pub fn api_token(&self) -> Option<&str> {
        self.api_token.as_deref()
    }

    /// `shares.happy` read from `tahoe.cfg` at start
    pub fn shares_happy(&self) -> Option<u32> {
        self.shares_happy
    }

    /// Override the happiness threshold read at start
    pub fn set_shares_happy(&mut self, shares_happy: Option<u32>) {
        self.shares_happy = shares_happy;
    }

    /// The capability API client bound to this node
    pub fn grid_api(&self) -> Arc<dyn GridApi> {
        self.api.clone()
    }

    pub fn runner(&self) -> &ProcessRunner {
        &self.runner
    }

    /// Read an option from `tahoe.cfg`
    pub fn config_get(&self, section: &str, option: &str) -> Option<String> {
        self.config.get(section, option)
    }

    /// Write an option to `tahoe.cfg`
    pub fn config_set(&self, section: &str, option: &str, value: &str) -> Result<()> {
        self.config.set(section, option, value)
    }

    /// Run a `tahoe` subcommand against this node to completion
    pub async fn command(&self, args: &[&str]) -> Result<String> {
        self.runner.command(args).await
    }

    /// `(executable, version)` from `tahoe --version`
    pub async fn version(&self) -> Result<(PathBuf, String)> {
        let output = self.command(&["--version"]).await?;
        let version = parse_version_output(&output)
            .ok_or_else(|| TahoeError::Command(format!("Unexpected --version output: {output}")))?;
        Ok((self.runner.executable()?, version))
    }

    /// Provision a fresh client node in this gateway's directory
    pub async fn create_client(&self, options: &ClientOptions) -> Result<()> {
        if self.paths.root().exists() {
            return Err(TahoeError::NodedirExists(self.paths.root().to_path_buf()));
        }
        let mut args = vec![
            "create-client".to_string(),
            "--webport=tcp:0:interface=127.0.0.1".to_string(),
        ];
        args.extend(options.to_args());
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        info!(nodedir = %self.paths.root().display(), "Creating client");
        self.command(&args).await?;
        Ok(())
    }

    /// Launch the node, wait for it to serve, then bring up every subclient.
    ///
    /// An existing pid file means a previous instance may still be alive, so
    /// it is stopped first.
    pub fn start(&mut self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            if self.paths.pidfile().is_file() {
                self.stop().await?;
            }
            self.state = GatewayState::Starting;
            match self.start_node().await {
                Ok(()) => {
                    self.state = GatewayState::Running;
                    info!(nodedir = %self.paths.root().display(), "Node running");
                    Ok(())
                }
                Err(e) => {
                    error!(nodedir = %self.paths.root().display(), "Failed to start node: {}", e);
                    self.state = GatewayState::Stopped;
                    Err(e)
                }
            }
        })
    }

    async fn start_node(&mut self) -> Result<()> {
        info!(nodedir = %self.paths.root().display(), "Starting node");
        let output = self.runner.run(&["run"], Some(RUNNING_TRIGGER)).await?;
        if self.services.stop_strategy == StopStrategy::Signal {
            if let RunOutput::Triggered { pid: Some(pid) } = output {
                fs::write(self.paths.pidfile(), pid.to_string())?;
            }
        }

        let nodeurl = read_trimmed(&self.paths.node_url())?;
        let api_token = read_trimmed(&self.paths.api_auth_token())?;
        self.api.connect(&nodeurl, &api_token)?;
        self.nodeurl = Some(nodeurl);
        self.api_token = Some(api_token);

        self.shares_happy = match self.config_get("client", "shares.happy") {
            Some(value) => Some(value.parse().map_err(|_| {
                TahoeError::Config(format!("shares.happy is not a number: {value}"))
            })?),
            None => None,
        };

        self.load_magic_folders()?;
        self.start_subclients().await
    }

    async fn start_subclients(&mut self) -> Result<()> {
        let tasks: Vec<_> = self
            .magic_folders
            .values_mut()
            .filter_map(MagicFolder::subclient_mut)
            .map(Gateway::start)
            .collect();
        if !tasks.is_empty() {
            debug!(count = tasks.len(), "Starting magic-folder subclients");
        }
        try_join_all(tasks).await?;
        Ok(())
    }

    /// Stop the node and then every subclient
    pub fn stop(&mut self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let previous = self.state;
            self.state = GatewayState::Stopping;
            if let Err(e) = self.stop_node().await {
                self.state = previous;
                return Err(e);
            }
            if !self.has_subclients() {
                if let Err(e) = self.load_magic_folders() {
                    warn!("Could not load magic-folders while stopping: {}", e);
                }
            }
            let tasks: Vec<_> = self
                .magic_folders
                .values_mut()
                .filter_map(MagicFolder::subclient_mut)
                .map(Gateway::stop)
                .collect();
            try_join_all(tasks).await?;
            self.state = GatewayState::Stopped;
            Ok(())
        })
    }

    async fn stop_node(&mut self) -> Result<()> {
        let pidfile = self.paths.pidfile();
        if !pidfile.is_file() {
            error!("No \"twistd.pid\" file found in {}", self.paths.root().display());
            return Ok(());
        }
        match self.services.stop_strategy {
            StopStrategy::Signal => {
                let contents = fs::read_to_string(&pidfile)?;
                let pid: u32 = contents.trim().parse().map_err(|_| {
                    TahoeError::Config(format!("Invalid pid file {}: {contents}", pidfile.display()))
                })?;
                debug!("Trying to kill PID {}...", pid);
                terminate(pid);
                fs::remove_file(&pidfile)?;
            }
            StopStrategy::Command => match self.command(&["stop"]).await {
                Ok(_) => {}
                Err(TahoeError::Command(output)) if is_already_stopped(&output) => {
                    warn!("Node already stopped: {}", output);
                }
                Err(e) => return Err(e),
            },
        }
        info!(nodedir = %self.paths.root().display(), "Node stopped");
        Ok(())
    }

    fn has_subclients(&self) -> bool {
        self.magic_folders.values().any(|f| f.subclient().is_some())
    }

    /// Connected/known servers and available space, `None` when unknown
    pub async fn get_grid_status(&self) -> Result<Option<GridStatus>> {
        let Some(body) = self.api.status_page(true).await? else {
            return Ok(None);
        };
        let (status, source) = parse_grid_status(&body);
        if source == StatusSource::WelcomePage {
            debug!("Status endpoint returned HTML; used welcome-page parser");
        }
        Ok(Some(status))
    }

    /// Number of connected storage servers, `None` when unknown
    pub async fn get_connected_servers(&self) -> Result<Option<u32>> {
        Ok(self.get_grid_status().await?.map(|s| s.servers_connected))
    }

    /// Connected storage servers meet the happiness threshold
    pub async fn is_ready(&self) -> Result<bool> {
        let Some(happy) = self.shares_happy.filter(|h| *h > 0) else {
            return Ok(false);
        };
        Ok(matches!(
            self.get_connected_servers().await?,
            Some(connected) if connected >= happy
        ))
    }

    /// Poll [`Gateway::is_ready`] until it holds. Safe to drop between polls.
    pub async fn await_ready(&self) -> Result<()> {
        while !self.is_ready().await? {
            tokio::time::sleep(self.services.poll_interval).await;
        }
        Ok(())
    }

    /// Create an unattached directory
    pub async fn mkdir(&self) -> Result<Capability> {
        self.api.mkdir().await
    }

    /// Upload a local file and return its capability
    pub async fn upload(&self, local_path: &Path) -> Result<Capability> {
        self.api.upload(local_path).await
    }

    /// Download `cap` to a local file
    pub async fn download(&self, cap: &Capability, local_path: &Path) -> Result<()> {
        self.api.download(cap, local_path).await
    }

    /// Link `childcap` into `dircap`; serialized with other writes from this gateway
    pub async fn link(&self, dircap: &Capability, childname: &str, childcap: &Capability) -> Result<()> {
        let _guard = self.link_lock.lock().await;
        self.api.link(dircap, childname, childcap).await
    }

    /// Remove `childname` from `dircap`; serialized with other writes from this gateway
    pub async fn unlink(&self, dircap: &Capability, childname: &str) -> Result<()> {
        let _guard = self.link_lock.lock().await;
        self.api.unlink(dircap, childname).await
    }

    /// JSON listing of `cap`, `None` when the node is unreachable
    pub async fn get_json(&self, cap: &Capability) -> Result<Option<Node>> {
        self.api.get_json(cap).await
    }

    /// Create and persist this gateway's rootcap. Never overwrites.
    pub async fn create_rootcap(&mut self) -> Result<Capability> {
        debug!("Creating rootcap...");
        let path = self.paths.rootcap();
        if path.exists() {
            return Err(TahoeError::RootcapExists(path));
        }
        let cap = self.api.mkdir().await?;
        write_private_file(&path, cap.as_str())?;
        debug!("Rootcap saved to file: {}", path.display());
        self.rootcap = Some(cap.clone());
        Ok(cap)
    }

    /// The cached rootcap, loaded from `private/rootcap` on first use
    pub fn get_rootcap(&mut self) -> Option<Capability> {
        if self.rootcap.is_none() {
            self.rootcap = read_cap_from_file(&self.paths.rootcap());
        }
        self.rootcap.clone()
    }

    /// All entries of `private/aliases`
    pub fn get_aliases(&self) -> Option<BTreeMap<String, Capability>> {
        aliases::read_aliases(&self.paths.aliases())
    }

    /// One alias, with or without its trailing `:`
    pub fn get_alias(&self, alias: &str) -> Option<Capability> {
        aliases::lookup_alias(&self.paths.aliases(), alias)
    }

    /// The single-folder capability files written by older daemons
    pub(crate) fn legacy_folder_caps(&self) -> (Option<Capability>, Option<Capability>) {
        (
            read_cap_from_file(&self.paths.collective_dircap()),
            read_cap_from_file(&self.paths.magic_folder_dircap()),
        )
    }
}

/// `tahoe stop` output for a daemon that is not running
fn is_already_stopped(output: &str) -> bool {
    let output = output.to_ascii_lowercase();
    output.contains("not running") || output.contains("is it running?")
}

/// Second whitespace-separated token of `tahoe --version` output
pub(crate) fn parse_version_output(output: &str) -> Option<String> {
    output.split_whitespace().nth(1).map(str::to_string)
}

/// Trimmed capability stored in a file, `None` if unreadable or empty
pub fn read_cap_from_file(path: &Path) -> Option<Capability> {
    let contents = fs::read_to_string(path).ok()?;
    let cap = Capability::new(contents);
    (!cap.as_str().is_empty()).then_some(cap)
}

fn read_trimmed(path: &Path) -> Result<String> {
    Ok(fs::read_to_string(path)?.trim().to_string())
}

/// Create `path` with owner-only permissions; fails if it already exists
pub(crate) fn write_private_file(path: &Path, contents: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut options = fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options.open(path)?;
    file.write_all(contents.as_bytes())?;
    Ok(())
}

#[cfg(unix)]
fn terminate(pid: u32) {
    let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
    if rc != 0 {
        let err = std::io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::ESRCH) | Some(libc::EINVAL) => debug!("Process {} not found: {}", pid, err),
            _ => error!("Failed to kill PID {}: {}", pid, err),
        }
    }
}

#[cfg(not(unix))]
fn terminate(pid: u32) {
    match std::process::Command::new("taskkill")
        .args(["/PID", &pid.to_string(), "/F"])
        .output()
    {
        Ok(output) if output.status.success() => {}
        Ok(output) => debug!(
            "Process {} not found: {}",
            pid,
            String::from_utf8_lossy(&output.stderr).trim()
        ),
        Err(e) => error!("Failed to kill PID {}: {}", pid, e),
    }
}
