pub mod background;
pub mod cache;
pub mod config;
pub mod context_tracker;
pub mod domain;
pub mod janitor;
pub mod memory;
pub mod ports;
pub mod session_manager;
pub mod state;
pub mod transcript_buffer;

pub use background::BestEffortWriter;
pub use config::StateConfig;
pub use context_tracker::ContextTracker;
pub use domain::{
    ActiveSessionHandle, ContextPosition, LectureStatus, LiveLectureSession, RollingBufferEntry,
    StudyContext, StudySession, TranscriptChunk,
};
pub use janitor::Janitor;
pub use memory::InMemoryStore;
pub use ports::{Clock, ManualClock, PortError, PortResult, StudyStore, SystemClock};
pub use session_manager::SessionManager;
pub use state::{StudyState, SweepReport};
pub use transcript_buffer::{TranscriptBuffer, TranscriptSweep};
