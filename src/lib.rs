//! Identity reconciliation, invite claiming and cache-backed sync for OpenSplit
//! accounts.

pub mod accounts;
pub mod auth;
pub mod balance;
pub mod config;
pub mod error;
pub mod expense_normalizer;
pub mod friends;
pub mod group_normalizer;
pub mod identity;
pub mod invites;
pub mod link_failures;
pub mod link_requests;
pub mod link_state;
pub mod names;
pub mod orchestrator;
pub mod persistence;
pub mod routes;
pub mod schemas;
pub mod stores;
pub mod synthesizer;

#[cfg(test)]
mod test_support;
