pub mod api;
pub mod config;
pub mod ingest;
pub mod mirror;
pub mod server;
pub mod session;
pub mod state;
pub mod storage;

pub use config::{Config, MirrorConfig, NodeConfig, ServerConfig, SessionConfig, StorageConfig};
pub use ingest::{IngestError, IngestSnapshot, Ingestor};
pub use mirror::MirrorError;
pub use server::rpc_server;
pub use session::{SessionRegistry, run_session_sweeper};
pub use state::NodeState;
pub use storage::{MemoryRowStorage, RowStorage, SqliteRowStorage, SqliteStorageError};
