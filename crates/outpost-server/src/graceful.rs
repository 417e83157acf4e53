//! Listener setup and graceful re-exec.
//!
//! Listeners are bound fresh on a normal start. On a graceful restart the
//! old process re-execs the binary with the listening sockets mapped to
//! fds 3..3+N and `LISTEN_FDS=N` in the environment; a child started that
//! way adopts the inherited sockets instead of binding, so no connection
//! is refused during the switch. Addresses keep their configured order on
//! both sides, which is what ties an inherited fd back to its address.

use std::env;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, RawFd};
use std::os::unix::fs::PermissionsExt;
use std::os::unix::process::CommandExt;
use std::process::Command;

use crate::error::ServerError;

/// Environment flag marking a process as a graceful-restart child.
pub const LISTEN_FDS_ENV: &str = "LISTEN_FDS";

/// Inherited fds start here, after stdio.
const FD_START: RawFd = 3;

const MAX_INHERITED: usize = 64;

#[derive(Debug)]
pub enum Listener {
    Tcp(tokio::net::TcpListener),
    Unix(tokio::net::UnixListener),
}

impl Listener {
    pub fn raw_fd(&self) -> RawFd {
        match self {
            Listener::Tcp(listener) => listener.as_raw_fd(),
            Listener::Unix(listener) => listener.as_raw_fd(),
        }
    }
}

/// Number of listener fds inherited from a graceful re-exec, if any.
pub fn inherited_count() -> Option<usize> {
    env::var(LISTEN_FDS_ENV).ok()?.parse().ok()
}

/// Binds (or adopts) one listener per configured address, in order.
/// Addresses starting with `/` are unix socket paths.
pub async fn bind_all(addrs: &[String]) -> Result<Vec<Listener>, ServerError> {
    let inherited = inherited_count().unwrap_or(0);
    let mut listeners = Vec::with_capacity(addrs.len());
    for (i, addr) in addrs.iter().enumerate() {
        if i < inherited {
            listeners.push(adopt(FD_START + i as RawFd, addr)?);
        } else {
            listeners.push(bind(addr).await?);
        }
    }
    Ok(listeners)
}

async fn bind(addr: &str) -> Result<Listener, ServerError> {
    let bind_err = |source: io::Error| ServerError::Bind {
        addr: addr.to_string(),
        source,
    };
    if addr.starts_with('/') {
        match std::fs::remove_file(addr) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => return Err(bind_err(err)),
        }
        let listener = tokio::net::UnixListener::bind(addr).map_err(bind_err)?;
        std::fs::set_permissions(addr, std::fs::Permissions::from_mode(0o777))
            .map_err(bind_err)?;
        tracing::info!("listening on http://unix:{addr}");
        Ok(Listener::Unix(listener))
    } else {
        let listener = tokio::net::TcpListener::bind(addr).await.map_err(bind_err)?;
        tracing::info!("listening on http://{addr}");
        Ok(Listener::Tcp(listener))
    }
}

fn adopt(fd: RawFd, addr: &str) -> Result<Listener, ServerError> {
    let listener = if addr.starts_with('/') {
        let listener = unsafe { std::os::unix::net::UnixListener::from_raw_fd(fd) };
        listener.set_nonblocking(true)?;
        Listener::Unix(tokio::net::UnixListener::from_std(listener)?)
    } else {
        let listener = unsafe { std::net::TcpListener::from_raw_fd(fd) };
        listener.set_nonblocking(true)?;
        Listener::Tcp(tokio::net::TcpListener::from_std(listener)?)
    };
    tracing::info!("adopted inherited listener for {addr}");
    Ok(listener)
}

/// Starts a replacement process inheriting the given listener fds, mapped
/// to fds 3..3+N in configured order. Returns the child's pid.
pub fn respawn(fds: &[RawFd]) -> io::Result<u32> {
    if fds.len() > MAX_INHERITED {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "too many listeners to inherit",
        ));
    }
    let exe = env::current_exe()?;
    let args: Vec<_> = env::args_os().skip(1).collect();
    let mut command = Command::new(exe);
    command.args(args).env(LISTEN_FDS_ENV, fds.len().to_string());

    let mut inherited = [0 as RawFd; MAX_INHERITED];
    inherited[..fds.len()].copy_from_slice(fds);
    let count = fds.len();

    unsafe {
        // Runs in the child after fork. Two passes over stack storage: dup
        // everything above the target range first so a listener already
        // sitting on another listener's target fd is not clobbered, then
        // dup2 into place (which also clears FD_CLOEXEC).
        command.pre_exec(move || {
            let mut temps = [0 as RawFd; MAX_INHERITED];
            for i in 0..count {
                let temp = libc::fcntl(inherited[i], libc::F_DUPFD, 1024);
                if temp < 0 {
                    return Err(io::Error::last_os_error());
                }
                temps[i] = temp;
            }
            for (i, &temp) in temps[..count].iter().enumerate() {
                if libc::dup2(temp, FD_START + i as RawFd) < 0 {
                    return Err(io::Error::last_os_error());
                }
                libc::close(temp);
            }
            Ok(())
        });
    }

    let child = command.spawn()?;
    Ok(child.id())
}
