//! Passphrase acquisition.
//!
//! Interactive prompts talk to the controlling terminal directly rather
//! than stdin, so a piped stdin still reaches the child command untouched.
//! Echo is suppressed for the duration of each read. Passphrase buffers are
//! zeroised as soon as they stop being needed; the caller zeroises the
//! returned buffer once the key has been derived.

use std::fs::OpenOptions;
use std::io::{Read, Write};

use nix::sys::termios::{self, LocalFlags, SetArg};
use zeroize::Zeroize;

use crate::{Error, Result};

/// Upper bound on passphrase length, terminal or keyfile.
pub const PASSPHRASE_MAX: usize = 1024;

const TTY: &str = "/dev/tty";

/// Load the passphrase from a file, truncating at the first newline. Only
/// the first [`PASSPHRASE_MAX`] bytes are considered; the newline must fall
/// within them.
pub fn read_keyfile(path: &str) -> Result<Vec<u8>> {
    let file = std::fs::File::open(path).map_err(|err| Error::Io(path.to_string(), err))?;
    let mut data = Vec::new();
    file.take(PASSPHRASE_MAX as u64 + 1)
        .read_to_end(&mut data)
        .map_err(|err| Error::Io(path.to_string(), err))?;
    if let Some(end) = data.iter().position(|&b| b == b'\n') {
        data.truncate(end);
    }
    if data.len() > PASSPHRASE_MAX {
        data.zeroize();
        return Err(Error::PassphraseTooLong);
    }
    Ok(data)
}

/// Prompt on the controlling terminal, re-prompting `confirmations` times
/// and failing if any re-entry differs.
pub fn prompt(confirmations: usize) -> Result<Vec<u8>> {
    let mut passphrase = read_tty("passphrase: ")?;
    for _ in 0..confirmations {
        let mut check = match read_tty("passphrase (again): ") {
            Ok(check) => check,
            Err(err) => {
                passphrase.zeroize();
                return Err(err);
            }
        };
        let matched = check == passphrase;
        check.zeroize();
        if !matched {
            passphrase.zeroize();
            return Err(Error::PassphraseMismatch);
        }
    }
    Ok(passphrase)
}

/// One echo-suppressed line from `/dev/tty`.
fn read_tty(prompt: &str) -> Result<Vec<u8>> {
    let mut tty = OpenOptions::new()
        .read(true)
        .write(true)
        .open(TTY)
        .map_err(|err| Error::Io(TTY.to_string(), err))?;

    let saved = termios::tcgetattr(&tty).map_err(tty_error)?;
    let mut quiet = saved.clone();
    quiet.local_flags.remove(LocalFlags::ECHO);
    termios::tcsetattr(&tty, SetArg::TCSANOW, &quiet).map_err(tty_error)?;

    tty.write_all(prompt.as_bytes())
        .map_err(|err| Error::Io(TTY.to_string(), err))?;

    let mut buf = [0u8; PASSPHRASE_MAX];
    let read = tty.read(&mut buf);

    // Restore the terminal before reporting any read error.
    termios::tcsetattr(&tty, SetArg::TCSANOW, &saved).map_err(tty_error)?;
    let _ = tty.write_all(b"\n");

    let len = match read {
        Ok(len) => len,
        Err(err) => {
            buf.zeroize();
            return Err(Error::Io(TTY.to_string(), err));
        }
    };
    if len == buf.len() {
        buf.zeroize();
        return Err(Error::PassphraseTooLong);
    }
    let end = buf[..len]
        .iter()
        .position(|&b| b == b'\n')
        .unwrap_or(len);
    let line = buf[..end].to_vec();
    buf.zeroize();
    Ok(line)
}

fn tty_error(errno: nix::errno::Errno) -> Error {
    Error::Io(TTY.to_string(), errno.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keyfile_truncates_at_first_newline() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pass");
        std::fs::write(&path, "hunter2\ntrailing garbage").unwrap();
        let pass = read_keyfile(path.to_str().unwrap()).unwrap();
        assert_eq!(pass, b"hunter2");
    }

    #[test]
    fn keyfile_without_newline_is_used_whole() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pass");
        std::fs::write(&path, "hunter2").unwrap();
        let pass = read_keyfile(path.to_str().unwrap()).unwrap();
        assert_eq!(pass, b"hunter2");
    }

    #[test]
    fn oversized_keyfile_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pass");
        std::fs::write(&path, vec![b'a'; PASSPHRASE_MAX + 1]).unwrap();
        let err = read_keyfile(path.to_str().unwrap()).unwrap_err();
        assert!(matches!(err, Error::PassphraseTooLong));
    }

    #[test]
    fn oversized_keyfile_with_early_newline_is_fine() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pass");
        let mut data = b"hunter2\n".to_vec();
        data.extend(vec![b'x'; 4096]);
        std::fs::write(&path, data).unwrap();
        let pass = read_keyfile(path.to_str().unwrap()).unwrap();
        assert_eq!(pass, b"hunter2");
    }

    #[test]
    fn missing_keyfile_reports_the_path() {
        let err = read_keyfile("/no/such/keyfile").unwrap_err();
        assert!(err.to_string().starts_with("/no/such/keyfile: "));
    }
}
