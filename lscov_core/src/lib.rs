pub mod bucket;
pub mod channel;
pub mod config;
pub mod filter;
pub mod handshake;
pub mod hash;
pub mod report;
pub mod session;
pub mod tally;

pub use bucket::{Bucketizer, bucketize};
pub use channel::{ChannelError, ExecutionChannel, LifecycleStatus, STATE_SIZE};
pub use config::LscovConfig;
pub use filter::{FilterError, LogicStateFilter};
pub use handshake::{DaemonEndpoint, HandshakeError, HandshakeNames, TargetEndpoint};
pub use hash::{hash_index, murmur3_32};
pub use report::{ReportError, ReportSink};
pub use session::{Session, SessionError};
pub use tally::{TallyCounter, TallyScheduler, TallySnapshot};
