//! Reconcile Command

use anyhow::Result;
use clap::Args;
use meshprov_common::Caller;
use meshprov_provisioner::{DriftReport, LivePeer, ProvisioningEngine};
use serde::Serialize;

use crate::output::{print_json, print_list, print_success, print_warning, OutputFormat, TableDisplay};

#[derive(Args)]
pub struct ReconcileArgs {
    /// Only report drift, change nothing
    #[arg(long)]
    pub dry_run: bool,
}

#[derive(Serialize)]
pub struct DriftDisplay {
    pub drift: String,
    pub public_key: String,
    pub address: String,
}

impl DriftDisplay {
    fn new(drift: &str, peer: &LivePeer) -> Self {
        Self {
            drift: drift.to_string(),
            public_key: peer.public_key.clone(),
            address: peer
                .address
                .map(|a| a.to_string())
                .unwrap_or_else(|| "-".to_string()),
        }
    }
}

impl TableDisplay for DriftDisplay {
    fn headers() -> Vec<&'static str> {
        vec!["Drift", "Public Key", "Address"]
    }

    fn row(&self) -> Vec<String> {
        vec![self.drift.clone(), self.public_key.clone(), self.address.clone()]
    }
}

fn rows(report: &DriftReport) -> Vec<DriftDisplay> {
    let missing = report.missing.iter().map(|p| DriftDisplay::new("missing", p));
    let mismatched = report.mismatched.iter().map(|p| DriftDisplay::new("mismatched", p));
    let unexpected = report.unexpected.iter().map(|p| DriftDisplay::new("unexpected", p));
    let snapshot_missing = report
        .snapshot_missing
        .iter()
        .map(|p| DriftDisplay::new("snapshot missing", p));
    let snapshot_unexpected = report
        .snapshot_unexpected
        .iter()
        .map(|p| DriftDisplay::new("snapshot unexpected", p));
    missing
        .chain(mismatched)
        .chain(unexpected)
        .chain(snapshot_missing)
        .chain(snapshot_unexpected)
        .collect()
}

pub async fn execute(
    args: ReconcileArgs,
    engine: &ProvisioningEngine,
    caller: &Caller,
    format: OutputFormat,
) -> Result<()> {
    let report = if args.dry_run {
        engine.drift(caller).await?
    } else {
        engine.reconcile(caller).await?
    };

    if format == OutputFormat::Json {
        print_json(&report);
        return Ok(());
    }

    if report.is_clean() {
        print_success("Live peer table and snapshot are in sync");
        return Ok(());
    }

    print_list(&rows(&report), format);
    for error in &report.errors {
        print_warning(error);
    }
    if !args.dry_run && report.errors.is_empty() {
        print_success("Live peer table reconciled");
    }
    Ok(())
}
