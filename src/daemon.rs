//! Detach from the controlling terminal. Must run before the tokio runtime
//! is built: forking a process with live worker threads is unsound.

use anyhow::{bail, Context};
use std::fs::OpenOptions;
use std::os::unix::io::AsRawFd;
use std::path::Path;

pub fn daemonize(pid_file: &str) -> anyhow::Result<()> {
    log::info!("Detaching quota-policyd into the background...");

    // First fork
    match unsafe { libc::fork() } {
        -1 => bail!("Failed to fork process"),
        0 => {}
        _ => std::process::exit(0),
    }

    // New session, no controlling terminal
    if unsafe { libc::setsid() } == -1 {
        bail!("Failed to create new session");
    }

    unsafe {
        libc::signal(libc::SIGHUP, libc::SIG_IGN);
    }

    // Second fork so the daemon can never reacquire a terminal
    match unsafe { libc::fork() } {
        -1 => bail!("Failed to fork a second time"),
        0 => {}
        _ => std::process::exit(0),
    }

    if let Err(e) = std::env::set_current_dir("/") {
        log::warn!("Failed to change working directory to /: {e}");
    }

    unsafe {
        libc::umask(0o022);
    }

    // Point stdio at /dev/null; the protocol never uses them in listener mode.
    let dev_null = OpenOptions::new()
        .read(true)
        .write(true)
        .open("/dev/null")
        .context("Failed to open /dev/null")?;
    let null_fd = dev_null.as_raw_fd();
    unsafe {
        libc::dup2(null_fd, 0);
        libc::dup2(null_fd, 1);
        libc::dup2(null_fd, 2);
    }
    if null_fd <= 2 {
        // The descriptor is itself one of stdin/stdout/stderr now.
        std::mem::forget(dev_null);
    }

    write_pid_file(pid_file)?;
    Ok(())
}

pub fn write_pid_file(pid_file: &str) -> anyhow::Result<()> {
    let pid = std::process::id();
    std::fs::write(pid_file, pid.to_string())
        .with_context(|| format!("Failed to write PID file {pid_file}"))?;
    log::info!("PID file written: {pid_file} ({pid})");
    Ok(())
}

pub fn remove_pid_file(pid_file: &str) {
    if Path::new(pid_file).exists() {
        match std::fs::remove_file(pid_file) {
            Ok(()) => log::info!("PID file removed"),
            Err(e) => log::warn!("Failed to remove PID file: {e}"),
        }
    }
}
