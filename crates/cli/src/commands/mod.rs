//! CLI Commands

pub mod peer;
pub mod reconcile;
pub mod site;
