//! keyed - deterministic randomness for unmodified programs.
//!
//! keyed launches a command under ptrace and replaces the randomness the
//! child observes with a keystream derived from a passphrase: calls to
//! `getrandom(2)` and reads from `/dev/random` or `/dev/urandom` are
//! neutralised before the kernel dispatches them, and their results are
//! synthesised from a ChaCha20 keystream instead. Two runs with the same
//! passphrase see byte-identical randomness at every intercepted call.
//!
//! # Modules
//!
//! - [`keystream`] - passphrase key derivation and the deterministic byte stream
//! - [`passphrase`] - terminal prompt and keyfile loading
//! - [`tracee`] - child lifecycle and cross-process memory/register access
//! - [`monitor`] - the set of descriptors open on the random devices
//! - [`interceptor`] - the syscall-stop state machine driving it all
//!
//! # Error Handling
//!
//! All operations use the consolidated [`Error`] type. Every error is fatal
//! to the supervisor: a failed trace operation leaves the tracee in an
//! indeterminate stopped state, so there is no partial recovery.

#[cfg(not(all(target_os = "linux", target_arch = "x86_64")))]
compile_error!("keyed needs ptrace syscall stops and the x86_64 register layout");

pub mod interceptor;
pub mod keystream;
pub mod monitor;
pub mod passphrase;
pub mod tracee;

/// Consolidated error type for all keyed operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("{0}: {1}")]
    Io(String, #[source] std::io::Error),

    #[error("passphrase too long")]
    PassphraseTooLong,

    #[error("passphrases don't match")]
    PassphraseMismatch,

    #[error("key derivation failed: {0}")]
    Kdf(argon2::Error),

    #[error("fork: {0}")]
    Spawn(nix::errno::Errno),

    #[error("could not exec command")]
    Exec,

    #[error("{0}")]
    Trace(nix::errno::Errno),

    #[error("unexpected wait status for tracee")]
    UnexpectedStop,

    #[error("partial write to tracee memory")]
    PartialWrite,

    #[error("too many open file descriptors")]
    TooManyDescriptors,

    #[error("out of memory")]
    OutOfMemory,
}

pub type Result<T> = core::result::Result<T, Error>;

pub use interceptor::Session;
pub use keystream::Key;
