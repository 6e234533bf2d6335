//! The syscall-stop state machine.
//!
//! The supervisor drives the tracee through pairs of syscall-entry and
//! syscall-exit stops. At the entry stop the call is classified from the
//! original-syscall register; randomness requests are neutralised by
//! rewriting that register to an invalid syscall number, so the kernel
//! never reads entropy. At the matching exit stop the keystream bytes are
//! written into the tracee and the return register is patched, and the
//! child observes a successful call.

use std::convert::Infallible;
use std::os::fd::RawFd;
use std::process;

use libc::user_regs_struct;
use nix::unistd::Pid;
use tracing::debug;
use zeroize::Zeroize;

use crate::keystream::{self, Key};
use crate::monitor::MonitorSet;
use crate::tracee::{self, Stop};
use crate::{Error, Result};

/// The device paths whose descriptors are monitored. The terminating NUL is
/// part of the match: `/dev/urandomX` is a different file.
const DEV_RANDOM: &[u8] = b"/dev/random\0";
const DEV_URANDOM: &[u8] = b"/dev/urandom\0";

/// Bytes peeked from an open path, enough for the longer sentinel.
const PATH_PEEK: usize = 13;

/// Planted in the original-syscall register to make the kernel dispatch
/// fail cheaply while still delivering the exit stop.
const INVALID_SYSCALL: u64 = u64::MAX;

/// What an entry stop decided about the in-flight syscall. Consumed at the
/// matching exit stop.
enum Frame {
    /// Leave the syscall alone.
    Ignore,
    /// The call was neutralised; write `len` keystream bytes to `dest` and
    /// return `len`.
    EmulateRandom { dest: u64, len: usize },
    /// An open of a monitored device path; capture the returned fd.
    CaptureFd,
    /// A close of a monitored fd; drop it whatever the kernel returns,
    /// since the fd is gone either way.
    DropFd(RawFd),
    /// Patch the return value with this fake pid.
    FakePid(i64),
    /// The tracee is exiting with this code.
    Terminate(i32),
}

/// One supervision run. Owns the derived key, the monitored-descriptor
/// table and the scratch buffer, and drives the tracee to completion.
pub struct Session {
    key: Key,
    fake_pid: Option<i64>,
    pid: Pid,
    monitored: MonitorSet,
    scratch: Vec<u8>,
}

impl Session {
    pub fn new(key: Key, fake_pid: Option<i64>, pid: Pid) -> Self {
        Self {
            key,
            fake_pid,
            pid,
            monitored: MonitorSet::new(),
            scratch: Vec::new(),
        }
    }

    /// Supervise the tracee until it terminates.
    ///
    /// Never returns normally: the tracee's exit status becomes the
    /// supervisor's via [`process::exit`], and any failure against the
    /// tracee is fatal.
    pub fn run(mut self) -> Result<Infallible> {
        loop {
            self.wait_syscall_stop()?;
            let regs = tracee::get_regs(self.pid)?;
            let frame = self.classify(&regs)?;

            match frame {
                Frame::Terminate(code) => {
                    debug!("exit({code})");
                    self.terminate(code);
                }
                Frame::EmulateRandom { len, .. } => self.neutralise(regs, len)?,
                _ => {}
            }

            self.wait_syscall_stop()?;
            self.apply_exit(frame)?;
        }
    }

    /// Advance to the next syscall stop, propagating tracee termination
    /// that bypasses the exit-syscall path (e.g. death by signal).
    fn wait_syscall_stop(&mut self) -> Result<()> {
        match tracee::advance(self.pid)? {
            Stop::Syscall => Ok(()),
            Stop::Exited(code) => {
                debug!("tracee exited with status {code}");
                self.terminate(code);
            }
            Stop::Signaled(signal) => {
                debug!("tracee killed by {signal}");
                self.terminate(128 + signal as i32);
            }
        }
    }

    /// Exit the supervisor with the tracee's status. The key is zeroised
    /// here because `process::exit` does not run destructors.
    fn terminate(&mut self, code: i32) -> ! {
        self.key.zeroize();
        process::exit(code);
    }

    /// Classify the syscall at an entry stop. The number is taken from the
    /// original-syscall register; the return register already holds the
    /// kernel's placeholder at this point and is meaningless.
    fn classify(&self, regs: &user_regs_struct) -> Result<Frame> {
        match regs.orig_rax as i64 {
            libc::SYS_exit | libc::SYS_exit_group => Ok(Frame::Terminate(regs.rdi as i32)),
            libc::SYS_open => self.classify_open(regs.rdi),
            libc::SYS_openat => self.classify_open(regs.rsi),
            libc::SYS_close => {
                let fd = regs.rdi as RawFd;
                if self.monitored.contains(fd) {
                    Ok(Frame::DropFd(fd))
                } else {
                    Ok(Frame::Ignore)
                }
            }
            libc::SYS_read => {
                let fd = regs.rdi as RawFd;
                let len = regs.rdx as usize;
                if self.monitored.contains(fd) && len > 0 {
                    debug!("read({fd}, {:#x}, {len})", regs.rsi);
                    Ok(Frame::EmulateRandom {
                        dest: regs.rsi,
                        len,
                    })
                } else {
                    Ok(Frame::Ignore)
                }
            }
            libc::SYS_getrandom => {
                let len = regs.rsi as usize;
                if len > 0 {
                    debug!("getrandom({:#x}, {len})", regs.rdi);
                    Ok(Frame::EmulateRandom {
                        dest: regs.rdi,
                        len,
                    })
                } else {
                    Ok(Frame::Ignore)
                }
            }
            libc::SYS_getpid => match self.fake_pid {
                Some(fake) => Ok(Frame::FakePid(fake)),
                None => Ok(Frame::Ignore),
            },
            _ => Ok(Frame::Ignore),
        }
    }

    /// Peek the path argument of an open-family call and decide whether the
    /// resulting descriptor should be monitored.
    fn classify_open(&self, path_addr: u64) -> Result<Frame> {
        let mut peek = [0u8; PATH_PEEK];
        let got = tracee::read_bytes(self.pid, path_addr, &mut peek)?;
        if is_monitored_path(&peek[..got]) {
            Ok(Frame::CaptureFd)
        } else {
            Ok(Frame::Ignore)
        }
    }

    /// Rewrite the syscall number so the kernel dispatches an invalid call,
    /// and make sure the scratch buffer can hold the reply.
    fn neutralise(&mut self, mut regs: user_regs_struct, len: usize) -> Result<()> {
        regs.orig_rax = INVALID_SYSCALL;
        tracee::set_regs(self.pid, regs)?;
        if self.scratch.len() < len {
            self.scratch
                .try_reserve(len - self.scratch.len())
                .map_err(|_| Error::OutOfMemory)?;
            self.scratch.resize(len, 0);
        }
        Ok(())
    }

    /// Apply the exit-stop half of the frame decided at entry.
    fn apply_exit(&mut self, frame: Frame) -> Result<()> {
        match frame {
            Frame::Ignore => Ok(()),
            Frame::EmulateRandom { dest, len } => {
                keystream::fill(&self.key, &mut self.scratch[..len]);
                tracee::write_bytes(self.pid, dest, &self.scratch[..len])?;
                tracee::poke_return(self.pid, len as u64)
            }
            Frame::CaptureFd => {
                let regs = tracee::get_regs(self.pid)?;
                let ret = regs.rax as i64;
                if ret >= 0 {
                    let fd = ret as RawFd;
                    debug!("monitoring fd {fd}");
                    self.monitored.insert(fd)?;
                }
                Ok(())
            }
            Frame::DropFd(fd) => {
                debug!("close({fd})");
                self.monitored.remove(fd);
                Ok(())
            }
            Frame::FakePid(fake) => {
                debug!("getpid() = {fake}");
                tracee::poke_return(self.pid, fake as u64)
            }
            Frame::Terminate(_) => unreachable!("terminate frames are consumed at the entry stop"),
        }
    }
}

/// Byte-exact match against the sentinel paths, NUL included. `peek` is
/// whatever prefix of the path could be read, at most [`PATH_PEEK`] bytes.
fn is_monitored_path(peek: &[u8]) -> bool {
    peek.starts_with(DEV_RANDOM) || peek.starts_with(DEV_URANDOM)
}
