//! Peer Commands

use anyhow::Result;
use clap::{Subcommand, ValueEnum};
use meshprov_common::{Caller, PeerFilter, PeerState, PeerSummary};
use meshprov_provisioner::config::ScriptFormat;
use meshprov_provisioner::{LiveOutcome, ProvisioningEngine};
use serde::Serialize;
use uuid::Uuid;

use crate::output::{
    format_time, print_item, print_json, print_list, print_success, print_warning, OutputFormat,
    TableDisplay,
};

#[derive(Subcommand)]
pub enum PeerCommands {
    /// Register a device and print its onboarding config
    Register {
        /// Hardware ID (e.g. MAC address)
        hardware_id: String,

        /// Owning tenant (admin only; tenant callers always register for themselves)
        #[arg(long)]
        owner: Option<String>,
    },

    /// Associate a peer with a site
    Associate {
        /// Peer ID
        id: Uuid,

        /// Site ID
        #[arg(short, long)]
        site: String,
    },

    /// Add the peer back to the live table
    Enable {
        /// Peer ID
        id: Uuid,
    },

    /// Remove the peer from the live table, keeping its address
    Disable {
        /// Peer ID
        id: Uuid,
    },

    /// Probe the peer over the overlay
    Test {
        /// Peer ID
        id: Uuid,
    },

    /// Remove a peer
    Remove {
        /// Peer ID
        id: Uuid,
    },

    /// List peers
    List {
        /// Only peers in this state
        #[arg(long)]
        state: Option<PeerState>,

        /// Only peers of this tenant
        #[arg(long)]
        owner: Option<String>,
    },

    /// Get peer details
    Get {
        /// Peer ID
        id: Uuid,
    },

    /// Re-render the device config, private key included (admin only)
    Config {
        /// Peer ID
        id: Uuid,

        /// Script format (defaults to overlay.script_format)
        #[arg(long, value_enum)]
        script: Option<ScriptArg>,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum ScriptArg {
    Routeros,
    WgQuick,
}

impl From<ScriptArg> for ScriptFormat {
    fn from(arg: ScriptArg) -> Self {
        match arg {
            ScriptArg::Routeros => ScriptFormat::Routeros,
            ScriptArg::WgQuick => ScriptFormat::WgQuick,
        }
    }
}

/// Peer display wrapper for serialization
#[derive(Serialize)]
pub struct PeerDisplay {
    pub id: String,
    pub hardware_id: String,
    pub tenant: String,
    pub site: String,
    pub address: String,
    pub state: String,
    pub last_seen: String,
    pub last_error: String,
    pub public_key: String,
}

impl From<&PeerSummary> for PeerDisplay {
    fn from(peer: &PeerSummary) -> Self {
        Self {
            id: peer.id.to_string(),
            hardware_id: peer.hardware_id.clone(),
            tenant: peer.tenant_id.clone().unwrap_or_else(|| "-".to_string()),
            site: peer.site_id.clone().unwrap_or_else(|| "-".to_string()),
            address: peer.internal_address.to_string(),
            state: peer.state.to_string(),
            last_seen: format_time(peer.last_seen_at),
            last_error: peer.last_error.clone().unwrap_or_default(),
            public_key: peer.public_key.clone(),
        }
    }
}

impl TableDisplay for PeerDisplay {
    fn headers() -> Vec<&'static str> {
        vec![
            "ID",
            "Hardware ID",
            "Tenant",
            "Site",
            "Address",
            "State",
            "Last Seen",
            "Last Error",
            "Public Key",
        ]
    }

    fn row(&self) -> Vec<String> {
        vec![
            self.id.clone(),
            self.hardware_id.clone(),
            self.tenant.clone(),
            self.site.clone(),
            self.address.clone(),
            self.state.clone(),
            self.last_seen.clone(),
            self.last_error.clone(),
            self.public_key.clone(),
        ]
    }
}

fn warn_live(live: &LiveOutcome) {
    match live {
        LiveOutcome::Applied => {}
        LiveOutcome::PartiallyApplied(msg) => {
            print_warning(&format!("Live peer applied but not persisted: {}", msg))
        }
        LiveOutcome::Failed(msg) => print_warning(&format!("Live peer table not updated: {}", msg)),
    }
}

pub async fn execute(
    cmd: PeerCommands,
    engine: &ProvisioningEngine,
    caller: &Caller,
    format: OutputFormat,
) -> Result<()> {
    match cmd {
        PeerCommands::Register { hardware_id, owner } => {
            let reg = engine.register(caller, &hardware_id, owner.as_deref()).await?;
            warn_live(&reg.live);

            if format == OutputFormat::Json {
                print_json(&reg);
            } else {
                print_item(&PeerDisplay::from(&reg.peer), format);
                println!();
                println!("Device configuration (shown once):");
                println!("{}", reg.device_config);
            }
        }

        PeerCommands::Associate { id, site } => {
            let peer = engine.associate(caller, id, &site).await?;
            print_item(&PeerDisplay::from(&peer), format);
        }

        PeerCommands::Enable { id } => {
            let change = engine.enable(caller, id).await?;
            warn_live(&change.live);
            print_item(&PeerDisplay::from(&change.peer), format);
        }

        PeerCommands::Disable { id } => {
            let change = engine.disable(caller, id).await?;
            warn_live(&change.live);
            print_item(&PeerDisplay::from(&change.peer), format);
        }

        PeerCommands::Test { id } => {
            let outcome = engine.test(caller, id).await?;
            if format == OutputFormat::Json {
                print_json(&outcome);
            } else if outcome.reachable {
                print_success(&format!("Peer {} is reachable ({})", id, outcome.state));
            } else {
                print_warning(&format!("Peer {} is unreachable ({})", id, outcome.state));
            }
        }

        PeerCommands::Remove { id } => {
            engine.remove(caller, id).await?;
            print_success(&format!("Peer {} removed", id));
        }

        PeerCommands::List { state, owner } => {
            let filter = PeerFilter {
                tenant_id: owner,
                state,
            };
            let peers = engine.list(caller, filter).await?;
            let displays: Vec<PeerDisplay> = peers.iter().map(PeerDisplay::from).collect();
            print_list(&displays, format);
        }

        PeerCommands::Get { id } => {
            let peer = engine.get(caller, id).await?;
            print_item(&PeerDisplay::from(&peer), format);
        }

        PeerCommands::Config { id, script } => {
            let config = engine
                .device_config(caller, id, script.map(ScriptFormat::from))
                .await?;
            if format == OutputFormat::Json {
                print_json(&serde_json::json!({ "peer_id": id, "device_config": config }));
            } else {
                print!("{}", config);
            }
        }
    }

    Ok(())
}
