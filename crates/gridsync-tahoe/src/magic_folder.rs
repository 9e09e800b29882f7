//! Magic-folder orchestration
//!
//! Folders are created natively (`magic-folder create -n NAME`) when the
//! daemon supports several folders per node. Older daemons reject `-n` with
//! a "not recognized" failure; the folder then gets its own subclient node
//! under `magic-folders/<name>/`, provisioned with the parent's grid
//! settings. Either way the folder's collective and personal directories are
//! linked into the parent's rootcap so they can be rediscovered from the
//! rootcap alone.

use crate::api::Node;
use crate::capability::{Access, Capability};
use crate::error::{Result, TahoeError};
use crate::gateway::{read_cap_from_file, ClientOptions, Gateway};
use crate::nodedir::get_nodedirs;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf, MAIN_SEPARATOR_STR};
use tracing::{debug, error, info, warn};

/// Nickname of the folder creator inside the collective
pub const ADMIN_NICKNAME: &str = "admin";

const COLLECTIVE_SUFFIX: &str = " (collective)";
const PERSONAL_SUFFIX: &str = " (personal)";
const SUBCLIENT_ALIAS: &str = "magic";

/// One registered folder
#[derive(Debug)]
pub struct MagicFolder {
    name: String,
    pub(crate) directory: Option<PathBuf>,
    pub(crate) subclient: Option<Gateway>,
    pub(crate) collective_dircap: Option<Capability>,
    pub(crate) upload_dircap: Option<Capability>,
    pub(crate) member: Option<String>,
}

impl MagicFolder {
    fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            directory: None,
            subclient: None,
            collective_dircap: None,
            upload_dircap: None,
            member: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn directory(&self) -> Option<&Path> {
        self.directory.as_deref()
    }

    /// The dedicated node serving this folder, if any
    pub fn subclient(&self) -> Option<&Gateway> {
        self.subclient.as_ref()
    }

    pub fn subclient_mut(&mut self) -> Option<&mut Gateway> {
        self.subclient.as_mut()
    }

    /// The local member's name in the collective, once members were listed
    pub fn member(&self) -> Option<&str> {
        self.member.as_deref()
    }
}

/// A `magic_folders.yaml` entry
#[derive(Debug, Default, Deserialize)]
struct FolderRecord {
    #[serde(default)]
    directory: Option<PathBuf>,
    #[serde(default)]
    collective_dircap: Option<Capability>,
    #[serde(default)]
    upload_dircap: Option<Capability>,
}

/// Read the persisted folder table, flat or under a `magic-folders` key
fn read_registry(path: &Path) -> Result<BTreeMap<String, FolderRecord>> {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(BTreeMap::new()),
        Err(e) => return Err(e.into()),
    };
    let document: serde_yaml::Value = serde_yaml::from_str(&contents)?;
    let table = match document {
        serde_yaml::Value::Mapping(mut mapping) => match mapping.remove("magic-folders") {
            Some(inner) => inner,
            None => serde_yaml::Value::Mapping(mapping),
        },
        _ => return Ok(BTreeMap::new()),
    };
    if table.is_null() {
        return Ok(BTreeMap::new());
    }
    Ok(serde_yaml::from_value(table)?)
}

/// Both capabilities of a `<collective>+<personal>` join code
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinCode {
    pub collective: Capability,
    pub personal: Capability,
}

impl JoinCode {
    pub fn parse(code: &str) -> Result<Self> {
        match code.trim().split_once('+') {
            Some((collective, personal)) if !collective.is_empty() && !personal.is_empty() => {
                Ok(Self {
                    collective: Capability::new(collective),
                    personal: Capability::new(personal),
                })
            }
            _ => Err(TahoeError::InvalidJoinCode(code.to_string())),
        }
    }
}

impl std::fmt::Display for JoinCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}+{}", self.collective, self.personal)
    }
}

/// Collective/personal capabilities found under a rootcap
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RootcapFolder {
    pub collective: Option<Capability>,
    pub personal: Option<Capability>,
}

/// Aggregated view of a folder across all of its members
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MagicFolderInfo {
    /// `(member, personal readcap)`, local member first
    pub members: Vec<(String, Capability)>,
    pub total_size: u64,
    /// Newest `linkmotime` seen in any member's directory
    pub latest_mtime: i64,
    /// member -> local path -> size
    pub sizes: BTreeMap<String, BTreeMap<String, u64>>,
}

/// Sum of the `size` of every child in a directory listing
pub fn size_from_content(content: &Node) -> u64 {
    content
        .children()
        .values()
        .filter_map(|child| child.data().size)
        .sum()
}

fn expand_home(path: &Path) -> PathBuf {
    match (path.strip_prefix("~"), dirs::home_dir()) {
        (Ok(rest), Some(home)) => home.join(rest),
        _ => path.to_path_buf(),
    }
}

/// Start a freshly created subclient and create or join its single folder
async fn set_up_subclient(subclient: &mut Gateway, path: &Path, join_code: Option<&JoinCode>) -> Result<()> {
    subclient.start().await?;
    subclient.await_ready().await?;

    let path_arg = path.to_string_lossy().into_owned();
    match join_code {
        Some(code) => {
            let code = code.to_string();
            subclient
                .command(&["magic-folder", "join", &code, &path_arg])
                .await?;
        }
        None => {
            let alias = format!("{SUBCLIENT_ALIAS}:");
            subclient
                .command(&["magic-folder", "create", &alias, ADMIN_NICKNAME, &path_arg])
                .await?;
        }
    }
    subclient.stop().await?;
    subclient.start().await
}

impl Gateway {
    /// Merge the persisted registry with subclient node directories found on
    /// disk. Subclients already in the registry are kept as they are.
    pub fn load_magic_folders(&mut self) -> Result<()> {
        for (name, record) in read_registry(&self.paths.magic_folders_yaml())? {
            let folder = self
                .magic_folders
                .entry(name.clone())
                .or_insert_with(|| MagicFolder::new(name));
            folder.directory = record.directory.or(folder.directory.take());
            folder.collective_dircap = record.collective_dircap.or(folder.collective_dircap.take());
            folder.upload_dircap = record.upload_dircap.or(folder.upload_dircap.take());
        }

        for nodedir in get_nodedirs(&self.paths.magic_folders_dir()) {
            let Some(name) = nodedir.file_name().map(|n| n.to_string_lossy().into_owned()) else {
                continue;
            };
            if self
                .magic_folders
                .get(&name)
                .is_some_and(|f| f.subclient.is_some())
            {
                continue;
            }
            let subclient = Gateway::new(&nodedir, self.services.clone())?;
            let directory = subclient
                .config_get("magic_folder", "local.directory")
                .map(PathBuf::from);
            debug!(folder = %name, nodedir = %nodedir.display(), "Discovered magic-folder subclient");
            let folder = self
                .magic_folders
                .entry(name.clone())
                .or_insert_with(|| MagicFolder::new(name));
            folder.directory = folder.directory.take().or(directory);
            folder.subclient = Some(subclient);
        }
        Ok(())
    }

    /// Every registered folder by name
    pub fn magic_folders(&self) -> &BTreeMap<String, MagicFolder> {
        &self.magic_folders
    }

    /// The registered folder called `name`
    pub fn get_magic_folder(&self, name: &str) -> Option<&MagicFolder> {
        self.magic_folders.get(name)
    }

    /// The subclient owning `name`, if the folder uses one
    pub fn get_magic_folder_client(&self, name: &str) -> Option<&Gateway> {
        self.magic_folders.get(name).and_then(MagicFolder::subclient)
    }

    /// Mutable access to the subclient owning `name`
    pub fn get_magic_folder_client_mut(&mut self, name: &str) -> Option<&mut Gateway> {
        self.magic_folders
            .get_mut(name)
            .and_then(MagicFolder::subclient_mut)
    }

    /// Create a folder for `path`, or join an existing one with `join_code`.
    ///
    /// Returns the folder name (the directory's basename).
    pub async fn create_magic_folder(&mut self, path: &Path, join_code: Option<&str>) -> Result<String> {
        let path = expand_home(path);
        tokio::fs::create_dir_all(&path).await?;
        let path = tokio::fs::canonicalize(&path).await?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| TahoeError::Config(format!("Not a folder path: {}", path.display())))?;
        if self.magic_folders.contains_key(&name) {
            return Err(TahoeError::FolderExists(name));
        }
        tokio::fs::create_dir_all(self.paths.magic_folders_dir()).await?;

        let join_code = match join_code {
            Some(code) => Some(self.diminish_join_code(&JoinCode::parse(code)?).await?),
            None => None,
        };

        let path_arg = path.to_string_lossy().into_owned();
        let alias = format!("{name}:");
        let native = match join_code.as_ref().map(JoinCode::to_string) {
            Some(code) => {
                self.command(&["magic-folder", "join", "-n", &name, &code, &path_arg])
                    .await
            }
            None => {
                self.command(&["magic-folder", "create", "-n", &name, &alias, ADMIN_NICKNAME, &path_arg])
                    .await
            }
        };

        match native {
            Ok(_) => {
                info!(folder = %name, "Created magic-folder");
                self.stop().await?;
                self.start().await?;
                self.magic_folders
                    .entry(name.clone())
                    .or_insert_with(|| MagicFolder::new(name.clone()))
                    .directory
                    .get_or_insert(path);
            }
            Err(e) if e.is_not_recognized() => {
                info!(folder = %name, "Multiple magic-folders not supported; creating subclient");
                self.create_magic_folder_subclient(&name, &path, join_code.as_ref())
                    .await?;
            }
            Err(e) => return Err(e),
        }

        self.link_folder_caps(&name).await?;
        Ok(name)
    }

    /// Make sure the collective half of a join code is read-only
    async fn diminish_join_code(&self, code: &JoinCode) -> Result<JoinCode> {
        if code.collective.access() == Access::ReadOnly {
            return Ok(code.clone());
        }
        let collective = match code.collective.diminish() {
            Some(cap) => cap,
            None => {
                debug!("Could not diminish collective locally; asking the grid");
                self.get_json(&code.collective)
                    .await?
                    .and_then(|node| node.data().ro_uri.clone())
                    .ok_or_else(|| {
                        TahoeError::InvalidJoinCode(format!(
                            "Cannot diminish collective capability {}",
                            code.collective
                        ))
                    })?
            }
        };
        Ok(JoinCode {
            collective,
            personal: code.personal.clone(),
        })
    }

    async fn create_magic_folder_subclient(
        &mut self,
        name: &str,
        path: &Path,
        join_code: Option<&JoinCode>,
    ) -> Result<()> {
        let mut subclient = Gateway::new(self.paths.magic_folders_dir().join(name), self.services.clone())?;
        let options = ClientOptions {
            nickname: self.config_get("node", "nickname"),
            introducer: self.config_get("client", "introducer.furl"),
            shares_needed: self.config_get("client", "shares.needed"),
            shares_happy: self.config_get("client", "shares.happy"),
            shares_total: self.config_get("client", "shares.total"),
        };
        subclient.create_client(&options).await?;
        if let Err(e) = set_up_subclient(&mut subclient, path, join_code).await {
            let nodedir = subclient.nodedir().to_path_buf();
            warn!(folder = %name, "Subclient setup failed, removing {}: {}", nodedir.display(), e);
            if let Err(stop_err) = subclient.stop().await {
                debug!("Could not stop subclient: {}", stop_err);
            }
            if let Err(rm_err) = tokio::fs::remove_dir_all(&nodedir).await {
                error!("Failed to remove {}: {}", nodedir.display(), rm_err);
            }
            return Err(e);
        }

        let (collective_dircap, upload_dircap) = subclient.legacy_folder_caps();
        let mut folder = MagicFolder::new(name);
        folder.directory = Some(path.to_path_buf());
        folder.collective_dircap = subclient.get_alias(SUBCLIENT_ALIAS).or(collective_dircap);
        folder.upload_dircap = upload_dircap;
        folder.subclient = Some(subclient);
        self.magic_folders.insert(name.to_string(), folder);
        info!(folder = %name, "Created magic-folder subclient");
        Ok(())
    }

    /// The collective capability used for membership changes
    fn folder_collective_cap(&mut self, name: &str) -> Option<Capability> {
        let alias = match self.get_magic_folder_client(name) {
            Some(subclient) => subclient.get_alias(SUBCLIENT_ALIAS),
            None => self.get_alias(name),
        };
        alias.or_else(|| self.get_collective_dircap(name))
    }

    /// Link the folder's capabilities into the rootcap, creating it on first use
    async fn link_folder_caps(&mut self, name: &str) -> Result<()> {
        let rootcap = match self.get_rootcap() {
            Some(cap) => cap,
            None => self.create_rootcap().await?,
        };
        let collective = self.folder_collective_cap(name).ok_or_else(|| {
            TahoeError::Config(format!("No collective capability for magic-folder {name}"))
        })?;
        let personal = self.get_magic_folder_dircap(name).ok_or_else(|| {
            TahoeError::Config(format!("No personal capability for magic-folder {name}"))
        })?;
        self.link(&rootcap, &format!("{name}{COLLECTIVE_SUFFIX}"), &collective)
            .await?;
        self.link(&rootcap, &format!("{name}{PERSONAL_SUFFIX}"), &personal)
            .await?;
        debug!(folder = %name, "Linked magic-folder into rootcap");
        Ok(())
    }

    /// Invite `nickname` and return the join code for them
    pub async fn magic_folder_invite(&self, name: &str, nickname: &str) -> Result<String> {
        let subclient_alias = format!("{SUBCLIENT_ALIAS}:");
        let folder_alias = format!("{name}:");
        let code = match self.get_magic_folder_client(name) {
            Some(subclient) => {
                subclient
                    .command(&["magic-folder", "invite", &subclient_alias, nickname])
                    .await?
            }
            None => {
                self.command(&["magic-folder", "invite", "-n", name, &folder_alias, nickname])
                    .await?
            }
        };
        Ok(code.trim().to_string())
    }

    /// Remove `nickname` from the folder's collective directory
    pub async fn magic_folder_uninvite(&mut self, name: &str, nickname: &str) -> Result<()> {
        let collective = self
            .folder_collective_cap(name)
            .ok_or_else(|| TahoeError::UnknownFolder(name.to_string()))?;
        if collective.access() != Access::ReadWrite {
            return Err(TahoeError::ReadOnlyCapability(collective.into_string()));
        }
        match self.get_magic_folder_client(name) {
            Some(subclient) => subclient.unlink(&collective, nickname).await,
            None => self.unlink(&collective, nickname).await,
        }
    }

    /// Leave a native folder, or stop and delete a folder's subclient node
    pub async fn remove_magic_folder(&mut self, name: &str) -> Result<()> {
        let mut folder = self
            .magic_folders
            .remove(name)
            .ok_or_else(|| TahoeError::UnknownFolder(name.to_string()))?;
        let result = match folder.subclient.as_mut() {
            Some(subclient) => match subclient.stop().await {
                Ok(()) => {
                    let nodedir = subclient.nodedir().to_path_buf();
                    match tokio::fs::remove_dir_all(&nodedir).await {
                        Ok(()) => Ok(()),
                        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
                        Err(e) => {
                            error!("Failed to remove {}: {}", nodedir.display(), e);
                            Err(e.into())
                        }
                    }
                }
                Err(e) => Err(e),
            },
            None => self
                .command(&["magic-folder", "leave", "-n", name])
                .await
                .map(|_| ()),
        };
        match result {
            Ok(()) => {
                info!(folder = %name, "Removed magic-folder");
                Ok(())
            }
            Err(e) => {
                self.magic_folders.insert(name.to_string(), folder);
                Err(e)
            }
        }
    }

    /// `POST /magic_folder` on whichever node serves `name`
    pub async fn get_magic_folder_status(&self, name: Option<&str>) -> Result<Option<serde_json::Value>> {
        match name.and_then(|n| self.get_magic_folder_client(n)) {
            Some(subclient) => subclient.api.magic_folder_status(None).await,
            None => self.api.magic_folder_status(name).await,
        }
    }

    /// Reconstruct `{name: {collective, personal}}` from the rootcap listing
    pub async fn get_magic_folders_from_rootcap(&mut self) -> Result<Option<BTreeMap<String, RootcapFolder>>> {
        let Some(rootcap) = self.get_rootcap() else {
            return Ok(None);
        };
        let Some(content) = self.get_json(&rootcap).await? else {
            return Ok(None);
        };
        let mut folders: BTreeMap<String, RootcapFolder> = BTreeMap::new();
        for (child, node) in content.children() {
            let cap = node.data().best_uri().cloned();
            if let Some(prefix) = child.strip_suffix(COLLECTIVE_SUFFIX) {
                folders.entry(prefix.to_string()).or_default().collective = cap;
            } else if let Some(prefix) = child.strip_suffix(PERSONAL_SUFFIX) {
                folders.entry(prefix.to_string()).or_default().personal = cap;
            }
        }
        Ok(Some(folders))
    }

    /// Members of the collective with their personal readcaps, local member first
    pub async fn get_magic_folder_members(&mut self, name: &str) -> Result<Option<Vec<(String, Capability)>>> {
        let Some(collective) = self.get_collective_dircap(name) else {
            return Ok(None);
        };
        let Some(content) = self.get_json(&collective).await? else {
            return Ok(None);
        };
        let upload_dircap = self.get_magic_folder_dircap(name);
        let my_fingerprint = upload_dircap.as_ref().and_then(Capability::fingerprint);

        let mut members = Vec::new();
        for (member, node) in content.children() {
            let Some(readcap) = node.data().ro_uri.clone() else {
                continue;
            };
            if my_fingerprint.is_some() && readcap.fingerprint() == my_fingerprint {
                if let Some(folder) = self.magic_folders.get_mut(name) {
                    folder.member = Some(member.clone());
                }
                members.insert(0, (member.clone(), readcap));
            } else {
                members.push((member.clone(), readcap));
            }
        }
        Ok(Some(members))
    }

    /// Total size of the local member's personal directory
    pub async fn get_magic_folder_size(&mut self, name: &str) -> Result<Option<u64>> {
        let Some(dircap) = self.get_magic_folder_dircap(name) else {
            return Ok(None);
        };
        Ok(self.get_json(&dircap).await?.as_ref().map(size_from_content))
    }

    /// Members, sizes and newest modification time across the folder
    pub async fn get_magic_folder_info(&mut self, name: &str) -> Result<Option<MagicFolderInfo>> {
        let Some(members) = self.get_magic_folder_members(name).await? else {
            return Ok(None);
        };
        let mut info = MagicFolderInfo::default();
        for (member, dircap) in members.iter().rev() {
            let sizes = info.sizes.entry(member.clone()).or_default();
            let Some(content) = self.get_json(dircap).await? else {
                continue;
            };
            for (filenode, node) in content.children() {
                // Manually linked entries carry no size
                let Some(size) = node.data().size else {
                    continue;
                };
                sizes.insert(filenode.replace("@_", MAIN_SEPARATOR_STR), size);
                info.total_size += size;
                if let Some(mtime) = node.data().link_mtime() {
                    info.latest_mtime = info.latest_mtime.max(mtime);
                }
            }
        }
        info.members = members;
        Ok(Some(info))
    }

    /// The folder's collective dircap, from the registry or the node's files
    pub fn get_collective_dircap(&mut self, name: &str) -> Option<Capability> {
        if let Some(cap) = self.magic_folders.get(name).and_then(|f| f.collective_dircap.clone()) {
            return Some(cap);
        }
        let cap = match self.get_magic_folder_client(name) {
            Some(subclient) => subclient.legacy_folder_caps().0,
            None => read_cap_from_file(&self.paths.collective_dircap()),
        };
        if let (Some(cap), Some(folder)) = (&cap, self.magic_folders.get_mut(name)) {
            folder.collective_dircap = Some(cap.clone());
        }
        cap
    }

    /// The local member's personal (upload) dircap
    pub fn get_magic_folder_dircap(&mut self, name: &str) -> Option<Capability> {
        if let Some(cap) = self.magic_folders.get(name).and_then(|f| f.upload_dircap.clone()) {
            return Some(cap);
        }
        let cap = match self.get_magic_folder_client(name) {
            Some(subclient) => subclient.legacy_folder_caps().1,
            None => read_cap_from_file(&self.paths.magic_folder_dircap()),
        };
        if let (Some(cap), Some(folder)) = (&cap, self.magic_folders.get_mut(name)) {
            folder.upload_dircap = Some(cap.clone());
        }
        cap
    }

    /// The local directory synchronized by the folder
    pub fn get_magic_folder_directory(&mut self, name: &str) -> Option<PathBuf> {
        if let Some(directory) = self.magic_folders.get(name).and_then(|f| f.directory.clone()) {
            return Some(directory);
        }
        let directory = match self.get_magic_folder_client(name) {
            Some(subclient) => subclient.config_get("magic_folder", "local.directory"),
            None => self.config_get("magic_folder", "local.directory"),
        }
        .map(PathBuf::from);
        if let (Some(directory), Some(folder)) = (&directory, self.magic_folders.get_mut(name)) {
            folder.directory = Some(directory.clone());
        }
        directory
    }
}
