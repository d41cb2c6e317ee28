//! Selects which file descriptor feeds editor input, per the external fd
//! contract: stdin on fd 0, falling back to fd 2 when fd 0 is not a TTY but
//! fd 2 is — the shape that lets a pipe feed stdin while fd 2 is borrowed
//! from a genuinely interactive session upstream.

use std::os::unix::io::RawFd;

/// `libc::STDIN_FILENO` unless fd 0 isn't a TTY and fd 2 is, in which case
/// `libc::STDERR_FILENO`.
pub fn select_input_fd() -> RawFd {
	select_fd(is_tty(libc::STDIN_FILENO), is_tty(libc::STDERR_FILENO))
}

fn is_tty(fd: RawFd) -> bool {
	// SAFETY: isatty only inspects the terminal driver state already
	// associated with an open fd; it performs no I/O of its own.
	unsafe { libc::isatty(fd) == 1 }
}

fn select_fd(stdin_is_tty: bool, stderr_is_tty: bool) -> RawFd {
	if !stdin_is_tty && stderr_is_tty {
		libc::STDERR_FILENO
	} else {
		libc::STDIN_FILENO
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn prefers_stdin_when_stdin_is_a_tty() {
		assert_eq!(select_fd(true, true), libc::STDIN_FILENO);
		assert_eq!(select_fd(true, false), libc::STDIN_FILENO);
	}

	#[test]
	fn prefers_stdin_when_neither_is_a_tty() {
		assert_eq!(select_fd(false, false), libc::STDIN_FILENO);
	}

	#[test]
	fn falls_back_to_fd_2_only_when_stdin_is_not_a_tty_and_fd_2_is() {
		assert_eq!(select_fd(false, true), libc::STDERR_FILENO);
	}
}
