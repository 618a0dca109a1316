//! Process plumbing: daemonization, privilege drop, crash signal hook.

use std::ffi::CString;

use anyhow::{bail, Context, Result};

/// Classic double-release into the background: fork, let the parent exit,
/// start a new session, point stdio at /dev/null. Must run before any
/// threads are spawned.
pub fn daemonize() -> Result<()> {
    unsafe {
        match libc::fork() {
            -1 => bail!("fork failed: {}", std::io::Error::last_os_error()),
            0 => {}
            _parent => std::process::exit(0),
        }
        if libc::setsid() == -1 {
            bail!("setsid failed: {}", std::io::Error::last_os_error());
        }
        let devnull = CString::new("/dev/null").expect("static string");
        let fd = libc::open(devnull.as_ptr(), libc::O_RDWR);
        if fd >= 0 {
            libc::dup2(fd, libc::STDIN_FILENO);
            libc::dup2(fd, libc::STDOUT_FILENO);
            libc::dup2(fd, libc::STDERR_FILENO);
            if fd > libc::STDERR_FILENO {
                libc::close(fd);
            }
        }
    }
    Ok(())
}

/// Drops the effective uid/gid to the named user and group. With no
/// explicit group, the user's primary group is used. Keeps the process
/// dumpable so crashes still produce cores.
pub fn drop_privileges(run_as_uid: Option<&str>, run_as_gid: Option<&str>) -> Result<()> {
    unsafe {
        if let Some(group) = run_as_gid {
            let name = CString::new(group).context("group name")?;
            let entry = libc::getgrnam(name.as_ptr());
            if entry.is_null() {
                bail!("unknown group {group:?}");
            }
            let gid = (*entry).gr_gid;
            if libc::setegid(gid) < 0 {
                bail!("cannot drop gid to {gid}");
            }
            tracing::debug!("set egid to {gid}");
        }

        if let Some(user) = run_as_uid {
            let name = CString::new(user).context("user name")?;
            let entry = libc::getpwnam(name.as_ptr());
            if entry.is_null() {
                bail!("unknown user {user:?}");
            }
            let uid = (*entry).pw_uid;
            let primary_gid = (*entry).pw_gid;

            if run_as_gid.is_none() {
                if libc::setegid(primary_gid) < 0 {
                    bail!("cannot drop gid to {primary_gid} (primary group of uid {uid})");
                }
                tracing::debug!("set egid to {primary_gid} (primary group of uid {uid})");
            }
            if libc::seteuid(uid) < 0 {
                bail!("cannot drop uid to {uid}");
            }
            tracing::debug!("set euid to {uid}");
        }

        libc::prctl(libc::PR_SET_DUMPABLE, 1);
    }
    Ok(())
}

/// SIGPIPE would otherwise kill us on a dropped server connection.
pub fn ignore_sigpipe() {
    unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    }
}

/// Log-and-reraise on SIGSEGV so the crash reaches both the log and the
/// default core-dumping disposition.
pub fn install_sigsegv_handler() {
    let handler = sigsegv_handler as extern "C" fn(libc::c_int);
    unsafe {
        libc::signal(libc::SIGSEGV, handler as libc::sighandler_t);
    }
}

extern "C" fn sigsegv_handler(signum: libc::c_int) {
    // Only async-signal-safe calls here.
    const MSG: &[u8] = b"davmount: segmentation fault\n";
    unsafe {
        let _ = libc::write(libc::STDERR_FILENO, MSG.as_ptr().cast(), MSG.len());
        libc::signal(signum, libc::SIG_DFL);
        libc::raise(signum);
    }
}
