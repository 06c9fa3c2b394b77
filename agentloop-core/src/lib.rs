pub mod agent;
pub mod ci;
pub mod ids;
pub mod prompt;

pub use agent::*;
pub use ci::{aggregate, CheckConclusion, CheckRun, CiPolicy, MergedStatus};
pub use ids::{CommitSha, PrId, RepoId};
pub use prompt::*;
