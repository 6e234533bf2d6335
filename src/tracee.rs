//! Tracee lifecycle and cross-process access.
//!
//! The child is forked, declares itself traceable and execs the target
//! command; from then on every one of its syscalls produces an entry stop
//! and an exit stop, which [`advance`] surfaces one at a time. The rest of
//! the module is the proxy through which the supervisor touches the tracee:
//! register snapshots and memory transfers. Nothing else in the crate talks
//! to the tracee directly.

use std::ffi::CString;
use std::io::{IoSlice, IoSliceMut};

use libc::user_regs_struct;
use nix::errno::Errno;
use nix::sys::ptrace;
use nix::sys::signal::Signal;
use nix::sys::uio::{process_vm_readv, process_vm_writev, RemoteIoVec};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{execvp, fork, ForkResult, Pid};
use tracing::debug;

use crate::{Error, Result};

const PAGE_SIZE: usize = 4096;

/// What [`advance`] observed.
pub enum Stop {
    /// A syscall-entry or syscall-exit stop.
    Syscall,
    /// The tracee exited without reaching an exit stop we handle.
    Exited(i32),
    /// The tracee was killed by a signal.
    Signaled(Signal),
}

/// Fork and exec `argv` as a tracee.
///
/// Returns once the child is stopped at its initial exec trap, with the
/// kill-on-supervisor-exit and sysgood options already set.
pub fn spawn(argv: &[String]) -> Result<Pid> {
    if argv.is_empty() {
        return Err(Error::Spawn(Errno::EINVAL));
    }
    let args = argv
        .iter()
        .map(|arg| CString::new(arg.as_bytes()))
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|_| Error::Spawn(Errno::EINVAL))?;

    match unsafe { fork() }.map_err(Error::Spawn)? {
        ForkResult::Child => {
            // Only exec failure is reported here. The forked address space
            // must not run atexit handlers, hence _exit.
            let errno = match ptrace::traceme() {
                Ok(()) => match execvp(&args[0], &args) {
                    Ok(never) => match never {},
                    Err(errno) => errno,
                },
                Err(errno) => errno,
            };
            eprintln!("keyed: {}: {errno}", argv[0]);
            unsafe { libc::_exit(127) }
        }
        ForkResult::Parent { child } => {
            match waitpid(child, None).map_err(Error::Trace)? {
                WaitStatus::Stopped(_, Signal::SIGTRAP) => {}
                WaitStatus::Exited(..) => return Err(Error::Exec),
                _ => return Err(Error::UnexpectedStop),
            }
            ptrace::setoptions(
                child,
                ptrace::Options::PTRACE_O_EXITKILL | ptrace::Options::PTRACE_O_TRACESYSGOOD,
            )
            .map_err(Error::Trace)?;
            debug!("spawned tracee {child}");
            Ok(child)
        }
    }
}

/// Resume the tracee until its next syscall stop.
///
/// Signal-delivery stops are not surfaced: the pending signal is handed
/// back on the next resume, so the entry/exit pairing stays intact across
/// signals the tracee takes.
pub fn advance(pid: Pid) -> Result<Stop> {
    let mut pending: Option<Signal> = None;
    loop {
        ptrace::syscall(pid, pending.take()).map_err(Error::Trace)?;
        match waitpid(pid, None).map_err(Error::Trace)? {
            WaitStatus::PtraceSyscall(_) => return Ok(Stop::Syscall),
            WaitStatus::Stopped(_, signal) => pending = Some(signal),
            WaitStatus::Exited(_, code) => return Ok(Stop::Exited(code)),
            WaitStatus::Signaled(_, signal, _) => return Ok(Stop::Signaled(signal)),
            _ => return Err(Error::UnexpectedStop),
        }
    }
}

/// Read up to `buf.len()` bytes from the tracee starting at `addr`.
///
/// The transfer is split at page boundaries so a string sitting at the end
/// of a mapping can still be peeked: a fault in a later page yields a short
/// read instead of an error. A fault on the very first byte is an error.
pub fn read_bytes(pid: Pid, addr: u64, buf: &mut [u8]) -> Result<usize> {
    let mut total = 0;
    while total < buf.len() {
        let base = addr as usize + total;
        let page_left = PAGE_SIZE - (base & (PAGE_SIZE - 1));
        let want = page_left.min(buf.len() - total);
        let mut local = [IoSliceMut::new(&mut buf[total..total + want])];
        let remote = [RemoteIoVec { base, len: want }];
        match process_vm_readv(pid, &mut local, &remote) {
            Ok(0) => break,
            Ok(read) => total += read,
            Err(Errno::EFAULT) if total > 0 => break,
            Err(errno) => return Err(Error::Trace(errno)),
        }
    }
    Ok(total)
}

/// Write all of `data` into the tracee at `addr`. Partial writes are an
/// error: the tracee must never observe a half-filled buffer.
pub fn write_bytes(pid: Pid, addr: u64, data: &[u8]) -> Result<()> {
    let local = [IoSlice::new(data)];
    let remote = [RemoteIoVec {
        base: addr as usize,
        len: data.len(),
    }];
    let written = process_vm_writev(pid, &local, &remote).map_err(Error::Trace)?;
    if written != data.len() {
        return Err(Error::PartialWrite);
    }
    Ok(())
}

/// Snapshot the tracee's saved registers.
pub fn get_regs(pid: Pid) -> Result<user_regs_struct> {
    ptrace::getregs(pid).map_err(Error::Trace)
}

/// Write back a full register snapshot.
pub fn set_regs(pid: Pid, regs: user_regs_struct) -> Result<()> {
    ptrace::setregs(pid, regs).map_err(Error::Trace)
}

/// Patch the return-value slot of the tracee's saved registers.
pub fn poke_return(pid: Pid, value: u64) -> Result<()> {
    let mut regs = get_regs(pid)?;
    regs.rax = value;
    set_regs(pid, regs)
}
