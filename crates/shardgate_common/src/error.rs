use std::fmt;

use thiserror::Error;

use crate::bind::QueryResult;
use crate::types::{ShardTarget, TabletEndpoint};

/// Error classification for the gateway.
///
/// Every `GatewayError` maps to exactly one `ErrorKind`. Callers use
/// it to decide whether a request may be re-resolved and re-sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad input or a request that can never succeed as written.
    UserError,
    /// Safe to re-resolve the topology and send again.
    Retryable,
    /// Backend unreachable or unhealthy; sending again will not help until
    /// the topology or health state changes.
    Transient,
    /// Invariant violation inside the gateway. Never retried.
    InternalBug,
}

/// Top-level gateway error type.
#[derive(Error, Debug)]
pub enum GatewayError {
    #[error(transparent)]
    Scatter(#[from] ScatterConnError),

    #[error(transparent)]
    Shard(#[from] ShardError),

    #[error("Resolution error: {0}")]
    Resolution(#[from] ResolutionError),

    #[error("Topology error: {0}")]
    Topo(#[from] TopoError),

    #[error("DML should not span multiple keyspace_ids: keyspace {keyspace} resolved to shards {shards:?}")]
    CrossShardDml { keyspace: String, shards: Vec<String> },

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// The caller's sink refused a chunk. Shards that failed on their own
    /// before the streams were torn down are kept in `shard_errors`.
    #[error("Stream sink aborted: {cause}{}", shard_lines(.shard_errors))]
    Sink {
        cause: String,
        shard_errors: Vec<ShardError>,
    },

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("InternalBug [{error_code}]: {message} | context: {debug_context}")]
    InternalBug {
        error_code: &'static str,
        message: String,
        debug_context: String,
    },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TopoError {
    #[error("keyspace {0} not found")]
    KeyspaceNotFound(String),

    #[error("topology server unavailable: {0}")]
    Unavailable(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResolutionError {
    #[error("cannot fetch serving graph for keyspace {keyspace}: {source}")]
    TopoUnavailable {
        keyspace: String,
        #[source]
        source: TopoError,
    },

    #[error("no shard in keyspace {keyspace} covers {what}")]
    NoShardCovers { keyspace: String, what: String },

    #[error("invalid shard spec {spec:?}: {reason}")]
    InvalidShardSpec { spec: String, reason: String },
}

impl ResolutionError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, ResolutionError::TopoUnavailable { .. })
    }
}

/// How a single shard failure is classified. Decided once, when the backend
/// error is produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShardErrorKind {
    /// The backend rejected the query itself.
    Server,
    /// The shard refused the query in a way that suggests topology changed.
    Retry,
    /// Backend unreachable, unhealthy, or the call was abandoned.
    Fatal,
}

impl fmt::Display for ShardErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ShardErrorKind::Server => "server",
            ShardErrorKind::Retry => "retry",
            ShardErrorKind::Fatal => "fatal",
        })
    }
}

/// Backend-reported error code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    Unknown,
    Cancelled,
    DeadlineExceeded,
    BadInput,
    IntegrityError,
    PermissionDenied,
    ResourceExhausted,
    QueryNotServed,
    NotInTx,
    TransientError,
    InternalError,
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ErrorCode::Unknown => "UNKNOWN_ERROR",
            ErrorCode::Cancelled => "CANCELLED",
            ErrorCode::DeadlineExceeded => "DEADLINE_EXCEEDED",
            ErrorCode::BadInput => "BAD_INPUT",
            ErrorCode::IntegrityError => "INTEGRITY_ERROR",
            ErrorCode::PermissionDenied => "PERMISSION_DENIED",
            ErrorCode::ResourceExhausted => "RESOURCE_EXHAUSTED",
            ErrorCode::QueryNotServed => "QUERY_NOT_SERVED",
            ErrorCode::NotInTx => "NOT_IN_TX",
            ErrorCode::TransientError => "TRANSIENT_ERROR",
            ErrorCode::InternalError => "INTERNAL_ERROR",
        })
    }
}

/// An error returned by a tablet backend, already classified.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct BackendError {
    pub kind: ShardErrorKind,
    pub code: ErrorCode,
    pub message: String,
}

impl BackendError {
    pub fn server(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            kind: ShardErrorKind::Server,
            code,
            message: message.into(),
        }
    }

    pub fn retry(message: impl Into<String>) -> Self {
        Self {
            kind: ShardErrorKind::Retry,
            code: ErrorCode::QueryNotServed,
            message: message.into(),
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self::fatal_with_code(ErrorCode::InternalError, message)
    }

    pub fn fatal_with_code(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            kind: ShardErrorKind::Fatal,
            code,
            message: message.into(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind == ShardErrorKind::Retry || self.code == ErrorCode::QueryNotServed
    }
}

/// A failure on one shard, annotated with where it happened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardError {
    pub target: ShardTarget,
    pub endpoint: Option<TabletEndpoint>,
    pub kind: ShardErrorKind,
    pub code: ErrorCode,
    pub message: String,
}

impl ShardError {
    pub fn new(target: ShardTarget, endpoint: Option<TabletEndpoint>, err: BackendError) -> Self {
        Self {
            target,
            endpoint,
            kind: err.kind,
            code: err.code,
            message: err.message,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind == ShardErrorKind::Retry || self.code == ErrorCode::QueryNotServed
    }

    /// Fatal and not-served failures mean the cached serving graph may be stale.
    pub fn invalidates_topology(&self) -> bool {
        self.kind == ShardErrorKind::Fatal || self.code == ErrorCode::QueryNotServed
    }
}

impl fmt::Display for ShardError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "shard, host: {}, ", self.target)?;
        match &self.endpoint {
            Some(ep) => write!(f, "{ep}")?,
            None => write!(f, "<no endpoint>")?,
        }
        write!(f, " , {}: {}", self.kind, self.message)
    }
}

impl std::error::Error for ShardError {}

fn shard_lines(errors: &[ShardError]) -> String {
    errors.iter().map(|e| format!("\n{e}")).collect()
}

/// Every shard failure of one scatter call. Retryable only if every failing
/// shard was retryable.
///
/// Shards that answered before the call failed are listed in `succeeded`;
/// for single-query calls their merged rows are in `partial`.
#[derive(Debug, Clone, PartialEq)]
pub struct ScatterConnError {
    pub errors: Vec<ShardError>,
    pub retryable: bool,
    pub succeeded: Vec<ShardTarget>,
    pub partial: Option<QueryResult>,
}

impl ScatterConnError {
    pub fn new(errors: Vec<ShardError>) -> Self {
        let retryable = !errors.is_empty() && errors.iter().all(ShardError::is_retryable);
        Self {
            errors,
            retryable,
            succeeded: Vec::new(),
            partial: None,
        }
    }

    pub fn with_succeeded(mut self, succeeded: Vec<ShardTarget>) -> Self {
        self.succeeded = succeeded;
        self
    }

    pub fn with_partial(mut self, partial: QueryResult) -> Self {
        self.partial = Some(partial);
        self
    }

    pub fn invalidates_topology(&self) -> bool {
        self.errors.iter().any(ShardError::invalidates_topology)
    }

    pub fn failed_shards(&self) -> impl Iterator<Item = &ShardTarget> {
        self.errors.iter().map(|e| &e.target)
    }
}

impl fmt::Display for ScatterConnError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, err) in self.errors.iter().enumerate() {
            if i > 0 {
                f.write_str("\n")?;
            }
            write!(f, "{err}")?;
        }
        Ok(())
    }
}

impl std::error::Error for ScatterConnError {}

impl GatewayError {
    /// Classify this error into an `ErrorKind`.
    pub fn kind(&self) -> ErrorKind {
        match self {
            GatewayError::Scatter(e) => {
                if e.retryable {
                    ErrorKind::Retryable
                } else if e.errors.iter().any(|s| s.kind == ShardErrorKind::Fatal) {
                    ErrorKind::Transient
                } else {
                    ErrorKind::UserError
                }
            }
            GatewayError::Shard(e) => match e.kind {
                _ if e.is_retryable() => ErrorKind::Retryable,
                ShardErrorKind::Fatal => ErrorKind::Transient,
                _ => ErrorKind::UserError,
            },
            GatewayError::Resolution(e) if e.is_retryable() => ErrorKind::Retryable,
            GatewayError::Resolution(_) => ErrorKind::UserError,
            GatewayError::Topo(_) => ErrorKind::Transient,
            GatewayError::CrossShardDml { .. } | GatewayError::InvalidRequest(_) => {
                ErrorKind::UserError
            }
            GatewayError::Sink { .. } => ErrorKind::UserError,
            GatewayError::Internal(_) | GatewayError::InternalBug { .. } => {
                ErrorKind::InternalBug
            }
        }
    }

    /// Whether the resolver may invalidate topology and send this call again.
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Retryable
    }

    pub fn is_user_error(&self) -> bool {
        self.kind() == ErrorKind::UserError
    }

    pub fn is_internal_bug(&self) -> bool {
        self.kind() == ErrorKind::InternalBug
    }

    /// Whether the failure suggests the cached serving graph is stale.
    pub fn invalidates_topology(&self) -> bool {
        match self {
            GatewayError::Scatter(e) => e.invalidates_topology(),
            GatewayError::Shard(e) => e.invalidates_topology(),
            GatewayError::Sink { shard_errors, .. } => {
                shard_errors.iter().any(ShardError::invalidates_topology)
            }
            _ => false,
        }
    }

    /// A sink failure with no shard errors attached.
    pub fn sink(cause: impl Into<String>) -> Self {
        GatewayError::Sink {
            cause: cause.into(),
            shard_errors: Vec::new(),
        }
    }

    pub fn internal_bug(
        error_code: &'static str,
        message: impl Into<String>,
        debug_context: impl Into<String>,
    ) -> Self {
        GatewayError::InternalBug {
            error_code,
            message: message.into(),
            debug_context: debug_context.into(),
        }
    }

    /// Prefix a message with context. Structured shard and resolution errors
    /// keep their exact text and classification.
    pub fn with_context(self, ctx: impl Into<String>) -> Self {
        let ctx = ctx.into();
        match self {
            GatewayError::Internal(msg) => GatewayError::Internal(format!("{ctx}: {msg}")),
            GatewayError::InvalidRequest(msg) => {
                GatewayError::InvalidRequest(format!("{ctx}: {msg}"))
            }
            GatewayError::Sink {
                cause,
                shard_errors,
            } => GatewayError::Sink {
                cause: format!("{ctx}: {cause}"),
                shard_errors,
            },
            GatewayError::InternalBug {
                error_code,
                message,
                debug_context,
            } => GatewayError::InternalBug {
                error_code,
                message: format!("{ctx}: {message}"),
                debug_context,
            },
            other => other,
        }
    }

    /// Append the request tag to the debug context of internal bugs.
    pub fn with_request_context(self, rctx: &crate::request_context::CallContext) -> Self {
        match self {
            GatewayError::InternalBug {
                error_code,
                message,
                debug_context,
            } => {
                let tag = rctx.as_context_str();
                let dc = if debug_context.is_empty() {
                    tag
                } else {
                    format!("{debug_context} | {tag}")
                };
                GatewayError::InternalBug {
                    error_code,
                    message,
                    debug_context: dc,
                }
            }
            other => other,
        }
    }

    /// Emit a structured log entry for internal bugs before they leave the gateway.
    pub fn log_if_fatal(&self) {
        if let GatewayError::InternalBug {
            error_code,
            message,
            debug_context,
        } = self
        {
            tracing::error!(
                error_code = %error_code,
                debug_context = %debug_context,
                "internal bug: {}",
                message
            );
        }
    }
}

pub type GatewayResult<T> = Result<T, GatewayError>;

/// Attach context to any error convertible into `GatewayError`.
pub trait ErrorContext<T> {
    fn ctx(self, msg: &str) -> Result<T, GatewayError>;
    fn ctx_with(self, f: impl FnOnce() -> String) -> Result<T, GatewayError>;
}

impl<T, E: Into<GatewayError>> ErrorContext<T> for Result<T, E> {
    fn ctx(self, msg: &str) -> Result<T, GatewayError> {
        self.map_err(|e| e.into().with_context(msg))
    }

    fn ctx_with(self, f: impl FnOnce() -> String) -> Result<T, GatewayError> {
        self.map_err(|e| e.into().with_context(f()))
    }
}

#[cfg(test)]
mod error_classification {
    use super::*;
    use crate::types::TabletRole;

    fn shard_err(shard: &str, err: BackendError) -> ShardError {
        ShardError::new(
            ShardTarget::new("ks", shard, TabletRole::Primary),
            Some(TabletEndpoint::new(shard).with_port("vt", 1)),
            err,
        )
    }

    #[test]
    fn test_shard_error_display() {
        let err = shard_err("-20", BackendError::server(ErrorCode::BadInput, "err"));
        assert_eq!(
            err.to_string(),
            r#"shard, host: ks.-20.primary, host:"-20" port_map:<key:"vt" value:1 > , server: err"#
        );
        let no_ep = ShardError::new(
            ShardTarget::new("ks", "-20", TabletRole::Replica),
            None,
            BackendError::fatal("no healthy endpoint"),
        );
        assert_eq!(
            no_ep.to_string(),
            "shard, host: ks.-20.replica, <no endpoint> , fatal: no healthy endpoint"
        );
    }

    #[test]
    fn test_scatter_error_joins_lines_in_order() {
        let err = ScatterConnError::new(vec![
            shard_err("-20", BackendError::server(ErrorCode::BadInput, "err")),
            shard_err("20-40", BackendError::retry("err")),
        ]);
        let text = err.to_string();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].ends_with("server: err"));
        assert!(lines[1].ends_with("retry: err"));
    }

    #[test]
    fn test_scatter_retryable_only_when_every_shard_is() {
        let all_retry = ScatterConnError::new(vec![
            shard_err("-20", BackendError::retry("err")),
            shard_err("20-40", BackendError::server(ErrorCode::QueryNotServed, "err")),
        ]);
        assert!(all_retry.retryable);

        let mixed = ScatterConnError::new(vec![
            shard_err("-20", BackendError::retry("err")),
            shard_err("20-40", BackendError::fatal("err")),
        ]);
        assert!(!mixed.retryable);
        assert!(mixed.invalidates_topology());

        assert!(!ScatterConnError::new(vec![]).retryable);
    }

    #[test]
    fn test_is_retryable() {
        let scatter_retry: GatewayError = ScatterConnError {
            retryable: true,
            ..ScatterConnError::new(vec![])
        }
        .into();
        assert!(scatter_retry.is_retryable());

        let scatter_no: GatewayError = ScatterConnError::new(vec![]).into();
        assert!(!scatter_no.is_retryable());

        let shard_retry: GatewayError = shard_err("-20", BackendError::retry("err")).into();
        assert!(shard_retry.is_retryable());

        let not_served: GatewayError =
            shard_err("-20", BackendError::server(ErrorCode::QueryNotServed, "err")).into();
        assert!(not_served.is_retryable());

        let shard_server: GatewayError =
            shard_err("-20", BackendError::server(ErrorCode::BadInput, "err")).into();
        assert!(!shard_server.is_retryable());

        let shard_fatal: GatewayError = shard_err("-20", BackendError::fatal("err")).into();
        assert!(!shard_fatal.is_retryable());
        assert_eq!(shard_fatal.kind(), ErrorKind::Transient);

        assert!(!GatewayError::Internal("boom".into()).is_retryable());
    }

    #[test]
    fn test_resolution_errors() {
        let topo: GatewayError = ResolutionError::TopoUnavailable {
            keyspace: "ks".into(),
            source: TopoError::Unavailable("down".into()),
        }
        .into();
        assert!(topo.is_retryable());

        let gap: GatewayError = ResolutionError::NoShardCovers {
            keyspace: "ks".into(),
            what: "keyspace id 10".into(),
        }
        .into();
        assert!(gap.is_user_error());
    }

    #[test]
    fn test_cross_shard_dml_message() {
        let err = GatewayError::CrossShardDml {
            keyspace: "ks".into(),
            shards: vec!["-20".into(), "20-40".into()],
        };
        assert!(err
            .to_string()
            .contains("DML should not span multiple keyspace_ids"));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_with_context_preserves_classification() {
        let bug = GatewayError::internal_bug("E-GATHER-001", "index out of range", "idx=3");
        let wrapped = bug.with_context("batch gather");
        assert!(wrapped.is_internal_bug());
        assert!(wrapped.to_string().contains("batch gather: index out of range"));

        let shard: GatewayError = shard_err("-20", BackendError::retry("err")).into();
        let before = shard.to_string();
        let after = shard.with_context("ignored");
        assert!(after.is_retryable());
        assert_eq!(after.to_string(), before);
    }

    #[test]
    fn test_sink_error_keeps_shard_failures() {
        let bare = GatewayError::sink("client went away");
        assert_eq!(bare.to_string(), "Stream sink aborted: client went away");
        assert!(!bare.invalidates_topology());

        let with_shards = GatewayError::Sink {
            cause: "client went away".into(),
            shard_errors: vec![shard_err("-20", BackendError::fatal("err"))],
        };
        assert_eq!(
            with_shards.to_string(),
            "Stream sink aborted: client went away\n\
             shard, host: ks.-20.primary, host:\"-20\" port_map:<key:\"vt\" value:1 > , fatal: err"
        );
        assert!(with_shards.invalidates_topology());
        assert!(!with_shards.is_retryable());
    }

    #[test]
    fn test_ctx_trait() {
        let r: Result<(), ResolutionError> = Err(ResolutionError::NoShardCovers {
            keyspace: "ks".into(),
            what: "key range [10-20)".into(),
        });
        let err = r.ctx("resolve").unwrap_err();
        assert!(matches!(err, GatewayError::Resolution(_)));
    }
}
