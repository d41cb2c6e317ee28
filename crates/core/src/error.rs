/// Errors surfaced by the loop driver and its facade.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
	#[error("i/o error: {0}")]
	Io(#[from] std::io::Error),

	#[error("a blocking task panicked or was cancelled: {0}")]
	Join(#[from] tokio::task::JoinError),

	#[error("process error: {0}")]
	Process(#[from] xeno_process::ProcessError),

	#[error("rpc error: {0}")]
	Rpc(#[from] xeno_rpc::RpcError),
}
