mod coverage;
mod discovery;
mod gateway;
mod health;
mod read_state;
mod recommender;
mod router;
mod summarizer;
mod sync;
mod vault;

pub use coverage::CoverageService;
pub use discovery::DiscoveryOrchestrator;
pub use gateway::SourceGateway;
pub use health::SourceHealthService;
pub use read_state::ReadStateService;
pub use recommender::Recommender;
pub use router::SourceRouter;
pub use summarizer::Summarizer;
pub use sync::{SyncEngine, SyncOptions};
pub use vault::{SessionVault, VaultSessions, secret_fingerprint};
