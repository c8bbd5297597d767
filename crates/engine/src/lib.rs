// Tandem collaboration engine: resident document sessions, update fanout,
// presence and debounced persistence.

pub mod awareness;
pub mod config;
pub mod crdt;
pub mod engine;
pub mod error;
pub mod fanout;
pub mod reaper;
pub mod registry;
pub mod scheduler;
pub(crate) mod session;
pub mod store;
pub mod transport;

pub use config::EngineConfig;
pub use crdt::{CrdtError, CrdtState, YrsDocument};
pub use engine::{BackgroundTasks, CollabEngine};
pub use error::{ApplyError, EngineError, FlushError, LoadError, RelayError};
pub use registry::{DocumentRegistry, FlushOutcome, FlushReport, SessionHandle};
pub use store::{DocumentStore, MemoryDocumentStore, SqliteDocumentStore};
pub use transport::{ChannelTransport, Transport};
