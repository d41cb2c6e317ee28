/// Errors surfaced by the process supervisor.
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
	#[error("failed to spawn {command}: {source}")]
	Spawn {
		command: String,
		#[source]
		source: std::io::Error,
	},

	#[error("process already stopped")]
	AlreadyStopped,

	#[error("process abandoned after exceeding teardown budget")]
	TeardownBudgetExceeded,
}
