//! Site Commands

use anyhow::{bail, Result};
use clap::Subcommand;
use meshprov_common::{Caller, Site};
use meshprov_provisioner::ProvisioningEngine;
use serde::Serialize;

use crate::output::{format_time, print_item, print_list, OutputFormat, TableDisplay};

#[derive(Subcommand)]
pub enum SiteCommands {
    /// Add a site
    Add {
        /// Site ID
        id: String,

        /// Owning tenant (defaults to the caller's tenant)
        #[arg(long)]
        owner: Option<String>,

        /// Display name
        #[arg(short, long)]
        name: Option<String>,
    },

    /// List sites
    List,
}

#[derive(Serialize)]
pub struct SiteDisplay {
    pub id: String,
    pub tenant: String,
    pub name: String,
    pub created: String,
}

impl From<&Site> for SiteDisplay {
    fn from(site: &Site) -> Self {
        Self {
            id: site.id.clone(),
            tenant: site.tenant_id.clone(),
            name: site.name.clone(),
            created: format_time(Some(site.created_at)),
        }
    }
}

impl TableDisplay for SiteDisplay {
    fn headers() -> Vec<&'static str> {
        vec!["ID", "Tenant", "Name", "Created"]
    }

    fn row(&self) -> Vec<String> {
        vec![
            self.id.clone(),
            self.tenant.clone(),
            self.name.clone(),
            self.created.clone(),
        ]
    }
}

pub async fn execute(
    cmd: SiteCommands,
    engine: &ProvisioningEngine,
    caller: &Caller,
    format: OutputFormat,
) -> Result<()> {
    match cmd {
        SiteCommands::Add { id, owner, name } => {
            let Some(tenant) = owner.or_else(|| caller.tenant_id().map(str::to_string)) else {
                bail!("--owner is required when adding a site as admin");
            };
            let name = name.unwrap_or_else(|| id.clone());
            let site = engine.add_site(caller, &id, &tenant, &name).await?;
            print_item(&SiteDisplay::from(&site), format);
        }

        SiteCommands::List => {
            let sites = engine.list_sites(caller).await?;
            let displays: Vec<SiteDisplay> = sites.iter().map(SiteDisplay::from).collect();
            print_list(&displays, format);
        }
    }

    Ok(())
}
