pub mod bind;
pub mod config;
pub mod error;
pub mod request_context;
pub mod types;

pub use bind::{BindValue, BindVars, BoundQuery, Field, QueryResult, Row};
pub use config::GatewayConfig;
pub use error::{
    BackendError, ErrorCode, ErrorContext, ErrorKind, GatewayError, GatewayResult,
    ResolutionError, ScatterConnError, ShardError, ShardErrorKind, TopoError,
};
pub use request_context::{CallContext, DoneReason};
pub use types::{KeyRange, KeyspaceId, ShardTarget, TabletEndpoint, TabletRole};
