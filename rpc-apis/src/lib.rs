//! RPC surface of the voteflow platform.
//!
//! Every inter-process operation is a method on one of the `#[rpc]` traits
//! in the submodules; servers implement the generated `...Server` traits and
//! callers use the generated `...Client` extension traits. Error kinds map
//! onto JSON-RPC server-error objects with one stable code per kind so a
//! client can match on them across the wire.

use jsonrpsee::types::{error::ErrorCode, ErrorObject, ErrorObjectOwned};

pub mod broker;
pub mod central;
pub mod dbproxy;
pub mod receiver;
pub mod station;

/// Error kinds of the vote pipeline and the storage layer.
#[derive(thiserror::Error, Debug)]
pub enum VoteflowError {
	#[error("duplicate vote {vote_id}: {reason}")]
	DuplicateVote { vote_id: String, reason: String },
	#[error("storage failure: {0}")]
	Storage(String),
	#[error("queue is full (capacity {0})")]
	QueueFull(usize),
	#[error("query exceeded its deadline")]
	QueryTimeout,
	#[error("no usable connection to {target}: {message}")]
	DbConnection { target: String, message: String },
	#[error("replication of transaction {transaction_id} failed: {message}")]
	Replication { transaction_id: String, message: String },
	#[error("cache {op} failed: {message}")]
	Cache { op: String, message: String },
	#[error("circuit for {0} is open")]
	CircuitOpen(String),
}

/// JSON-RPC server-error codes, one per [`VoteflowError`] kind.
///
/// The JSON-RPC 2.0 range for server errors is -32000..=-32099; start at
/// -32030 to stay clear of the codes jsonrpsee uses itself.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VfErrorCode {
	OtherError = -32030,
	DuplicateVote = -32031,
	StorageError = -32032,
	QueueFull = -32033,
	QueryTimeout = -32034,
	DbConnection = -32035,
	Replication = -32036,
	CacheError = -32037,
	CircuitOpen = -32038,
}

impl VoteflowError {
	pub fn code(&self) -> VfErrorCode {
		match self {
			VoteflowError::DuplicateVote { .. } => VfErrorCode::DuplicateVote,
			VoteflowError::Storage(_) => VfErrorCode::StorageError,
			VoteflowError::QueueFull(_) => VfErrorCode::QueueFull,
			VoteflowError::QueryTimeout => VfErrorCode::QueryTimeout,
			VoteflowError::DbConnection { .. } => VfErrorCode::DbConnection,
			VoteflowError::Replication { .. } => VfErrorCode::Replication,
			VoteflowError::Cache { .. } => VfErrorCode::CacheError,
			VoteflowError::CircuitOpen(_) => VfErrorCode::CircuitOpen,
		}
	}

	pub fn storage(err: impl std::fmt::Display) -> Self {
		VoteflowError::Storage(err.to_string())
	}
}

#[derive(thiserror::Error, Debug)]
pub enum RpcApiError {
	#[error(transparent)]
	ErrorObject(#[from] ErrorObjectOwned),
	#[error(transparent)]
	ClientError(#[from] jsonrpsee::core::ClientError),
	#[error(transparent)]
	Voteflow(#[from] VoteflowError),
	#[error(transparent)]
	Other(#[from] anyhow::Error),
}

pub type RpcResult<T> = Result<T, RpcApiError>;

pub fn internal_error(error: impl core::fmt::Debug) -> ErrorObjectOwned {
	tracing::error!(target: "vf_rpc", "Internal error: {:?}", error);
	ErrorObject::owned(
		ErrorCode::InternalError.code(),
		"Internal error while processing request.",
		None::<()>,
	)
}

pub fn call_error(
	error: impl Into<Box<dyn std::error::Error + Sync + Send>>,
	err_code: VfErrorCode,
) -> ErrorObjectOwned {
	let error = error.into();
	tracing::debug!(target: "vf_rpc", "Call error: {}", error);
	ErrorObject::owned(err_code as i32, format!("{error}"), None::<()>)
}

impl From<VoteflowError> for ErrorObjectOwned {
	fn from(error: VoteflowError) -> Self {
		let code = error.code();
		call_error(error, code)
	}
}

impl From<RpcApiError> for ErrorObjectOwned {
	fn from(error: RpcApiError) -> Self {
		match error {
			RpcApiError::ClientError(client_error) => match client_error {
				jsonrpsee::core::ClientError::Call(obj) => obj,
				other => internal_error(other),
			},
			RpcApiError::ErrorObject(object) => object,
			RpcApiError::Voteflow(error) => error.into(),
			RpcApiError::Other(error) => call_error(error, VfErrorCode::OtherError),
		}
	}
}

/// Kind carried by an error that crossed the wire, if it is one of ours.
pub fn remote_error_code(error: &jsonrpsee::core::ClientError) -> Option<VfErrorCode> {
	match error {
		jsonrpsee::core::ClientError::Call(obj) => match obj.code() {
			-32031 => Some(VfErrorCode::DuplicateVote),
			-32032 => Some(VfErrorCode::StorageError),
			-32033 => Some(VfErrorCode::QueueFull),
			-32034 => Some(VfErrorCode::QueryTimeout),
			-32035 => Some(VfErrorCode::DbConnection),
			-32036 => Some(VfErrorCode::Replication),
			-32037 => Some(VfErrorCode::CacheError),
			-32038 => Some(VfErrorCode::CircuitOpen),
			-32030 => Some(VfErrorCode::OtherError),
			_ => None,
		},
		_ => None,
	}
}
