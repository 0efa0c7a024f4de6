//! EXEC: spawn a child process and stream its life back to the client.
//!
//! Background children run detached over /dev/null with a reaper thread
//! waiting on them. Interactive children get a fresh pseudoterminal; the
//! handler then owns the socket, pumping PTY output out as STDOUT chunks
//! and socket bytes in as terminal input until the child is gone, and
//! finishes with an EXITCODE chunk carrying the raw wait status.
//!
//! The child is always made a session leader so control characters typed
//! into the PTY signal only its process group, never the server.

use byteorder::{LittleEndian, WriteBytesExt};
use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::pty::{openpty, OpenptyResult};
use nix::unistd::{close, dup2, fork, read, setsid, write, ForkResult, Pid};
use std::fs::{File, OpenOptions};
use std::io::Read as _;
use std::net::TcpStream;
use std::os::fd::{AsRawFd, BorrowedFd, OwnedFd, RawFd};
use tracing::{debug, warn};

use crate::protocol::{self, ExecRequest, INVALID_PID};

const BUF_SIZE: usize = 64 * 1024;

pub fn handle(stream: &mut TcpStream) -> anyhow::Result<()> {
    let req = protocol::read_exec_request(stream)?;
    if req.argv.is_empty() {
        // payload fully consumed; nothing to spawn, report in-band
        warn!("exec request with empty argv");
        return send_pid(stream, INVALID_PID);
    }
    if req.background {
        handle_background(stream, &req)
    } else {
        handle_interactive(stream, &req)
    }
}

fn send_pid(stream: &mut TcpStream, pid: u32) -> anyhow::Result<()> {
    stream.write_u32::<LittleEndian>(pid)?;
    Ok(())
}

fn handle_background(stream: &mut TcpStream, req: &ExecRequest) -> anyhow::Result<()> {
    let (null_in, null_out) = match open_dev_null() {
        Ok(fds) => fds,
        Err(e) => {
            warn!(error = %e, "open /dev/null failed");
            return send_pid(stream, INVALID_PID);
        }
    };

    let stdio = [
        null_in.as_raw_fd(),
        null_out.as_raw_fd(),
        null_out.as_raw_fd(),
    ];
    let child = match spawn_child(req, stdio, None, &[]) {
        Ok(pid) => pid,
        Err(e) => {
            warn!(error = %e, "fork failed");
            return send_pid(stream, INVALID_PID);
        }
    };

    debug!(pid = child.as_raw(), argv0 = ?req.argv[0], "background child spawned");
    send_pid(stream, child.as_raw() as u32)?;

    // detached reaper keeps the child from lingering as a zombie
    std::thread::spawn(move || {
        let status = wait_status(child);
        debug!(pid = child.as_raw(), status, "background child reaped");
    });
    Ok(())
}

fn handle_interactive(stream: &mut TcpStream, req: &ExecRequest) -> anyhow::Result<()> {
    let OpenptyResult { master, slave } = match openpty(None, None) {
        Ok(pty) => pty,
        Err(e) => {
            warn!(error = %e, "openpty failed");
            return send_pid(stream, INVALID_PID);
        }
    };

    let slave_fd = slave.as_raw_fd();
    let stdio = [slave_fd, slave_fd, slave_fd];
    let child = match spawn_child(
        req,
        stdio,
        Some(slave_fd),
        &[master.as_raw_fd(), slave_fd],
    ) {
        Ok(pid) => pid,
        Err(e) => {
            warn!(error = %e, "fork failed");
            return send_pid(stream, INVALID_PID);
        }
    };
    drop(slave); // parent keeps only the master side

    debug!(pid = child.as_raw(), argv0 = ?req.argv[0], "interactive child spawned");
    send_pid(stream, child.as_raw() as u32)?;
    pump(stream, &master, child)
}

fn open_dev_null() -> std::io::Result<(File, File)> {
    let null_in = File::open("/dev/null")?;
    let null_out = OpenOptions::new().write(true).open("/dev/null")?;
    Ok((null_in, null_out))
}

/// Fork and exec the requested child.
///
/// `stdio` is dup2'ed over fds 0/1/2 in the child; `ctty`, when present, is
/// made the child's controlling terminal; `close_in_child` fds are closed
/// after the dups. The argv/envp pointer tables are built before the fork
/// because the child must not allocate between fork and exec.
fn spawn_child(
    req: &ExecRequest,
    stdio: [RawFd; 3],
    ctty: Option<RawFd>,
    close_in_child: &[RawFd],
) -> nix::Result<Pid> {
    let mut argv_ptrs: Vec<*const libc::c_char> =
        req.argv.iter().map(|a| a.as_ptr()).collect();
    argv_ptrs.push(std::ptr::null());

    let envp_ptrs: Option<Vec<*const libc::c_char>> = if req.envp.is_empty() {
        None
    } else {
        let mut ptrs: Vec<*const libc::c_char> =
            req.envp.iter().map(|e| e.as_ptr()).collect();
        ptrs.push(std::ptr::null());
        Some(ptrs)
    };

    match unsafe { fork() }? {
        ForkResult::Parent { child } => Ok(child),
        ForkResult::Child => {
            setsid().ok();
            if let Some(fd) = ctty {
                unsafe { libc::ioctl(fd, libc::TIOCSCTTY as _, 0) };
            }
            let _ = dup2(stdio[0], libc::STDIN_FILENO);
            let _ = dup2(stdio[1], libc::STDOUT_FILENO);
            let _ = dup2(stdio[2], libc::STDERR_FILENO);
            for &fd in close_in_child {
                if fd > libc::STDERR_FILENO {
                    let _ = close(fd);
                }
            }
            unsafe {
                exec_child(
                    req.argv[0].as_ptr(),
                    argv_ptrs.as_ptr(),
                    envp_ptrs.as_ref().map(|p| p.as_ptr()),
                )
            }
        }
    }
}

#[cfg(target_os = "linux")]
unsafe fn exec_child(
    program: *const libc::c_char,
    argv: *const *const libc::c_char,
    envp: Option<*const *const libc::c_char>,
) -> ! {
    match envp {
        Some(envp) => libc::execvpe(program, argv, envp),
        None => libc::execvp(program, argv),
    };
    let msg = b"exec failed\n";
    libc::write(libc::STDERR_FILENO, msg.as_ptr().cast(), msg.len());
    libc::_exit(127)
}

#[cfg(not(target_os = "linux"))]
unsafe fn exec_child(
    program: *const libc::c_char,
    argv: *const *const libc::c_char,
    envp: Option<*const *const libc::c_char>,
) -> ! {
    // no execvpe here; swap the environment before the PATH-searching exec
    extern "C" {
        #[allow(non_upper_case_globals)]
        static mut environ: *const *const libc::c_char;
    }
    if let Some(envp) = envp {
        environ = envp;
    }
    libc::execvp(program, argv);
    let msg = b"exec failed\n";
    libc::write(libc::STDERR_FILENO, msg.as_ptr().cast(), msg.len());
    libc::_exit(127)
}

/// Full-duplex pump between the PTY master and the socket.
///
/// Master readable: forward up to 64 KiB as one STDOUT chunk; EOF ends the
/// pump. Socket readable: forward the bytes verbatim to the master, they
/// are the child's terminal input; a zero read means the client closed and
/// also ends the pump. No protocol framing is parsed while this runs; the
/// handler is the only reader of the socket.
fn pump(stream: &mut TcpStream, master: &OwnedFd, child: Pid) -> anyhow::Result<()> {
    let master_fd = master.as_raw_fd();
    let sock_fd = stream.as_raw_fd();
    let mut buf = vec![0u8; BUF_SIZE];

    loop {
        let mut fds = [
            PollFd::new(
                unsafe { BorrowedFd::borrow_raw(master_fd) },
                PollFlags::POLLIN,
            ),
            PollFd::new(
                unsafe { BorrowedFd::borrow_raw(sock_fd) },
                PollFlags::POLLIN,
            ),
        ];
        match poll(&mut fds, PollTimeout::NONE) {
            Ok(_) => {}
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(e.into()),
        }

        let master_ready = fds[0]
            .revents()
            .is_some_and(|r| r.intersects(PollFlags::POLLIN | PollFlags::POLLHUP));
        let sock_ready = fds[1]
            .revents()
            .is_some_and(|r| r.intersects(PollFlags::POLLIN | PollFlags::POLLHUP));

        if master_ready {
            match read(master_fd, &mut buf) {
                Ok(0) => break,
                Ok(n) => protocol::write_stdout_chunk(stream, &buf[..n])?,
                Err(Errno::EINTR) => {}
                // EIO here means the child side is gone
                Err(_) => break,
            }
        }

        if sock_ready {
            match stream.read(&mut buf) {
                Ok(0) => {
                    debug!(pid = child.as_raw(), "client closed during exec");
                    break;
                }
                Ok(n) => write_all_fd(master_fd, &buf[..n])?,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }
    }

    let status = wait_status(child);
    debug!(pid = child.as_raw(), status, "interactive child reaped");
    protocol::write_exit_chunk(stream, status)?;
    Ok(())
}

/// Wait for the child and return the raw wait status word, exactly as the
/// wire format expects it.
fn wait_status(child: Pid) -> i32 {
    let mut status: libc::c_int = 0;
    loop {
        let rc = unsafe { libc::waitpid(child.as_raw(), &mut status, 0) };
        if rc == -1 {
            if Errno::last() == Errno::EINTR {
                continue;
            }
            warn!(pid = child.as_raw(), errno = %Errno::last(), "waitpid failed");
            return 0;
        }
        return status;
    }
}

/// Write the whole buffer to a raw fd, retrying on EINTR.
fn write_all_fd(fd: RawFd, mut data: &[u8]) -> nix::Result<()> {
    while !data.is_empty() {
        match write(unsafe { BorrowedFd::borrow_raw(fd) }, data) {
            Ok(n) => data = &data[n..],
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(())
}
