//! Grace periods and buffer capacities, loaded from environment variables.
//!
//! Mirrors the teacher's `BrokerConfig` (`crates/broker/broker/src/core/mod.rs`):
//! a small `Default`-able struct rather than a generic config-file loader,
//! since every field here has a sane built-in value and the common case is
//! running with none of these variables set.

use std::time::Duration;

/// Tunables for the loop driver and everything it wires together.
#[derive(Debug, Clone)]
pub struct Config {
	/// Grace period between `SIGTERM` and escalating to `SIGKILL` when a
	/// process is asked to stop. See `xeno_process::Supervisor`.
	pub kill_grace: Duration,
	/// Grace period a process gets to flush its remaining stdout/stderr
	/// after its streams report EOF but before exit fires, when it hasn't
	/// already exited by then.
	pub eof_grace: Duration,
	/// Per-stream ring buffer capacity for piped child output and RPC
	/// transports.
	pub read_buffer_capacity: usize,
}

impl Default for Config {
	fn default() -> Self {
		Self {
			kill_grace: xeno_process::DEFAULT_KILL_GRACE,
			eof_grace: xeno_process::DEFAULT_EOF_GRACE,
			read_buffer_capacity: 64 * 1024,
		}
	}
}

impl Config {
	/// Load overrides from `XENO_KILL_GRACE_MS`, `XENO_EOF_GRACE_MS`, and
	/// `XENO_READ_BUFFER_CAPACITY`; any variable that is unset, empty, or
	/// unparseable falls back to the built-in default for that field.
	#[must_use]
	pub fn from_env() -> Self {
		let mut config = Self::default();
		if let Some(ms) = env_u64("XENO_KILL_GRACE_MS") {
			config.kill_grace = Duration::from_millis(ms);
		}
		if let Some(ms) = env_u64("XENO_EOF_GRACE_MS") {
			config.eof_grace = Duration::from_millis(ms);
		}
		if let Some(n) = env_u64("XENO_READ_BUFFER_CAPACITY") {
			config.read_buffer_capacity = n as usize;
		}
		config
	}
}

fn env_u64(name: &str) -> Option<u64> {
	std::env::var(name).ok()?.trim().parse().ok()
}

/// Install a `tracing` subscriber reading its filter from `RUST_LOG`,
/// defaulting to `info` when unset. Call once, at process startup.
pub fn init_tracing() {
	use tracing_subscriber::EnvFilter;

	let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
	let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn from_env_falls_back_to_defaults_when_unset() {
		// SAFETY: test-only, no other thread in this process reads these vars.
		unsafe {
			std::env::remove_var("XENO_KILL_GRACE_MS");
		}
		let config = Config::from_env();
		assert_eq!(config.kill_grace, xeno_process::DEFAULT_KILL_GRACE);
	}

	#[test]
	fn from_env_honors_overrides() {
		// SAFETY: test-only, no other thread in this process reads these vars.
		unsafe {
			std::env::set_var("XENO_KILL_GRACE_MS", "250");
		}
		let config = Config::from_env();
		assert_eq!(config.kill_grace, Duration::from_millis(250));
		unsafe {
			std::env::remove_var("XENO_KILL_GRACE_MS");
		}
	}
}
