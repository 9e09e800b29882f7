//! Tahoe-LAFS gateway orchestration
//!
//! Drives local Tahoe-LAFS client nodes: process lifecycle, the node's
//! capability web API, rootcap bootstrap, grid readiness and magic-folder
//! management, including per-folder subclient nodes for daemons that can
//! only serve one folder.
//!
//! ## Architecture
//!
//! - [`process`]: launching the `tahoe` executable ([`ProcessLauncher`])
//! - [`client`]: the HTTP capability API ([`GridApi`], [`CapabilityClient`])
//! - [`gateway`]: one node and its lifecycle ([`Gateway`])
//! - [`magic_folder`]: folder create/invite/uninvite/remove and queries
//! - [`status`]: grid status parsing for structured and HTML responses
//!
//! ## Example
//!
//! ```no_run
//! use gridsync_tahoe::{Gateway, GatewayConfig, GatewayServices};
//!
//! # async fn example() -> gridsync_tahoe::Result<()> {
//! let services = GatewayServices::from_config(&GatewayConfig::from_env()?);
//! let mut gateway = Gateway::at_default_location(services)?;
//! gateway.start().await?;
//! gateway.await_ready().await?;
//! let name = gateway.create_magic_folder("~/Documents".as_ref(), None).await?;
//! let code = gateway.magic_folder_invite(&name, "Bob").await?;
//! println!("{code}");
//! # Ok(())
//! # }
//! ```

pub mod aliases;
pub mod api;
pub mod capability;
pub mod client;
pub mod config;
pub mod config_store;
pub mod discovery;
pub mod error;
pub mod gateway;
pub mod invite;
pub mod magic_folder;
pub mod nodedir;
pub mod process;
pub mod status;

pub use api::{GridApi, Node, NodeData};
pub use capability::{Access, Capability};
pub use client::CapabilityClient;
pub use config::{GatewayConfig, StopStrategy};
pub use config_store::ConfigStore;
pub use discovery::{is_valid_furl, select_executable};
pub use error::{Result, TahoeError};
pub use gateway::{ClientOptions, Gateway, GatewayServices, GatewayState, GridApiFactory};
pub use invite::{InviteTransport, Settings};
pub use magic_folder::{JoinCode, MagicFolder, MagicFolderInfo, RootcapFolder};
pub use nodedir::{get_nodedirs, NodeDir};
pub use process::{
    BlockingLauncher, LaunchRequest, LauncherKind, LineSink, ProcessLauncher, ProcessRunner, RunOutput,
    StreamingLauncher,
};
pub use status::{GridStatus, StatusSource};
