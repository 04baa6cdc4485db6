//! Process helpers: detaching from the terminal and the PID file

use std::fs;
use std::io;
use std::path::Path;

/// Detach into the background
///
/// The parent exits immediately; the child starts a new session with its
/// standard streams pointed at `/dev/null`. Must be called before any
/// threads are spawned.
#[cfg(unix)]
pub fn daemonize() -> io::Result<()> {
    // SAFETY: the client is single-threaded at this point.
    match unsafe { libc::fork() } {
        -1 => return Err(io::Error::last_os_error()),
        0 => {}
        _ => unsafe { libc::_exit(0) },
    }

    if unsafe { libc::setsid() } < 0 {
        return Err(io::Error::last_os_error());
    }

    let devnull = b"/dev/null\0";
    let fd = unsafe { libc::open(devnull.as_ptr() as *const libc::c_char, libc::O_RDWR) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    unsafe {
        libc::dup2(fd, libc::STDIN_FILENO);
        libc::dup2(fd, libc::STDOUT_FILENO);
        libc::dup2(fd, libc::STDERR_FILENO);
        if fd > libc::STDERR_FILENO {
            libc::close(fd);
        }
    }

    Ok(())
}

#[cfg(not(unix))]
pub fn daemonize() -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "daemonizing is only supported on Unix",
    ))
}

/// Write the current PID followed by a newline
pub fn write_pid_file(path: &Path) -> io::Result<()> {
    fs::write(path, format!("{}\n", std::process::id()))
}
