pub mod agent;
pub mod artifacts;
pub mod config;
pub mod dashboard;
pub mod error;
pub mod gateway;
pub mod git;
pub mod github;
pub mod handlers;
pub mod http_client;
pub mod ingest;
pub mod queue;
pub mod state_machine;
pub mod store;
pub mod webhook;
pub mod worker;
pub mod workspace;

#[cfg(test)]
mod test_support;

use artifacts::Artifacts;
use ingest::Ingestor;
use store::Store;

mod built_info {
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
}

fn short_hash(hash: &str) -> String {
    if hash.len() >= 8 {
        hash[..8].to_string()
    } else {
        hash.to_string()
    }
}

pub fn get_version() -> String {
    // Release builds pass the hash explicitly
    if let Some(git_hash) = option_env!("AGENTLOOP_GIT_HASH") {
        short_hash(git_hash)
    } else if let Some(git_hash) = built_info::GIT_COMMIT_HASH {
        short_hash(git_hash)
    } else {
        built_info::PKG_VERSION.to_string()
    }
}

/// Shared state of the HTTP surface. The worker holds its own handles.
pub struct AppState {
    pub store: Store,
    pub ingestor: Ingestor,
    pub artifacts: Artifacts,
}
