pub mod config;
pub mod diagnostics;
pub mod error;
pub mod proxy;
pub mod server;

pub use config::{Cli, RelayConfig};
pub use diagnostics::{
    DiagnosticsRecord, DiagnosticsSink, Direction, FileSink, MemorySink, SessionId, SessionTap,
    TracingSink, TransferOp, WriterSink,
};
pub use error::RelayError;
pub use proxy::{
    Acceptor, AcceptorStats, Bridge, BridgeConfig, BridgeState, BridgeSummary, Leg,
    TeardownCause, WorkerHandle, WorkerPool, WorkerStats,
};
pub use server::RelayServer;
pub use tcprelay_networking::{Endpoint, NetworkError};
