//! Chroot and privilege drop.

use nix::errno::Errno;
use nix::sys::stat::Mode;
use nix::unistd::mkdir;
use nix::sys::wait::waitpid;
use nix::unistd::{
    chdir, chroot, fork, getegid, geteuid, getgid, getpid, getuid, setgid, setgroups, setuid,
    ForkResult, Gid, Pid, Uid,
};
use std::fs::{self, File};
use std::io::{Read, Write};
use std::os::unix::fs::MetadataExt;
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};

use crate::supervisor;
use crate::types::{Error, Result, ServerConfig};

/// Traversable only: nothing can be listed or created inside.
const BLIND_DIR_MODE: u32 = 0o100;

/// Chroot, then drop to the configured gid and uid, then verify.
pub fn apply(config: &ServerConfig) -> Result<()> {
    if let Some(root) = &config.chroot {
        if config.blind_chroot {
            chroot_blind(root)?;
        } else {
            chroot_to(root)?;
        }
        tracing::info!(root = %root.display(), blind = config.blind_chroot, "chrooted");
    }

    if let Some(gid) = config.gid {
        let gid = Gid::from_raw(gid);
        setgroups(&[gid]).map_err(|e| Error::config(format!("setgroups({}): {}", gid, e)))?;
        setgid(gid).map_err(|e| Error::config(format!("setgid({}): {}", gid, e)))?;
        if getgid() != gid || getegid() != gid {
            return Err(Error::config(format!("gid is not {} after setgid", gid)));
        }
    }

    if let Some(uid) = config.uid {
        let uid = Uid::from_raw(uid);
        setuid(uid).map_err(|e| Error::config(format!("setuid({}): {}", uid, e)))?;
        if getuid() != uid || geteuid() != uid {
            return Err(Error::config(format!("uid is not {} after setuid", uid)));
        }
    }

    check_root(config.allow_root)
}

fn chroot_to(dir: &Path) -> Result<()> {
    chroot(dir).map_err(|e| Error::config(format!("chroot {}: {}", dir.display(), e)))?;
    chdir("/")?;
    Ok(())
}

fn blind_dir(root: &Path, pid: Pid) -> PathBuf {
    root.join(format!("forkd_blind_chroot_{}.dir", pid))
}

/// Chroot into a new empty directory under `root` that a helper process
/// removes once we are inside, leaving nothing reachable from `/`.
fn chroot_blind(root: &Path) -> Result<()> {
    let dir = blind_dir(root, getpid());
    mkdir(&dir, Mode::from_bits_truncate(BLIND_DIR_MODE))
        .map_err(|e| Error::config(format!("mkdir {}: {}", dir.display(), e)))?;

    let (remover, mut gate) = spawn_remover(&dir)?;
    let entered = enter_blind(&dir);

    // Any outcome releases the remover.
    let _ = gate.write_all(&[1]);
    drop(gate);
    loop {
        match waitpid(remover, None) {
            Err(Errno::EINTR) => continue,
            Err(e) => {
                tracing::warn!(pid = %remover, error = %e, "blind chroot remover not collected");
                break;
            }
            Ok(_) => break,
        }
    }
    entered
}

fn enter_blind(dir: &Path) -> Result<()> {
    let handle = File::open(dir)
        .map_err(|e| Error::config(format!("open {}: {}", dir.display(), e)))?;
    chroot_to(dir)?;

    let meta = handle.metadata()?;
    if meta.uid() != 0 || meta.gid() != 0 {
        return Err(Error::config("blind chroot directory is not owned by root"));
    }
    if meta.mode() & 0o7777 != BLIND_DIR_MODE {
        return Err(Error::config(format!(
            "blind chroot directory has mode {:o}, expected {:o}",
            meta.mode() & 0o7777,
            BLIND_DIR_MODE
        )));
    }
    if fs::read_dir("/")?.next().is_some() {
        return Err(Error::config("blind chroot directory is not empty"));
    }
    Ok(())
}

/// Fork a helper that waits on the returned gate, then removes `dir`.
#[allow(unsafe_code)]
fn spawn_remover(dir: &Path) -> Result<(Pid, UnixStream)> {
    let (gate, mut wait) = UnixStream::pair()
        .map_err(|e| Error::resource(format!("socketpair failed: {}", e)))?;

    // SAFETY: the child blocks on its end of the pair, removes one
    // directory and leaves through `_exit`.
    match unsafe { fork() } {
        Ok(ForkResult::Parent { child }) => {
            drop(wait);
            Ok((child, gate))
        }
        Ok(ForkResult::Child) => {
            drop(gate);
            let mut byte = [0u8; 1];
            let _ = wait.read(&mut byte);
            let status = if fs::remove_dir(dir).is_ok() { 0 } else { 1 };
            supervisor::exit_now(status)
        }
        Err(e) => {
            let _ = fs::remove_dir(dir);
            Err(Error::resource(format!("fork failed: {}", e)))
        }
    }
}

/// Refuse to continue with any root id unless allowed.
pub fn check_root(allow_root: bool) -> Result<()> {
    let root = getuid().is_root()
        || geteuid().is_root()
        || getgid().as_raw() == 0
        || getegid().as_raw() == 0;
    if root && !allow_root {
        return Err(Error::config(
            "refusing to run with root privileges; set server.allow_root or configure uid/gid",
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allow_root_always_passes() {
        assert!(check_root(true).is_ok());
    }

    #[test]
    fn root_check_matches_current_ids() {
        let running_as_root = getuid().is_root()
            || geteuid().is_root()
            || getgid().as_raw() == 0
            || getegid().as_raw() == 0;
        let result = check_root(false);
        if running_as_root {
            assert!(result.unwrap_err().is_config());
        } else {
            assert!(result.is_ok());
        }
    }

    #[test]
    fn blind_dir_lives_under_the_chroot_root() {
        let dir = blind_dir(Path::new("/srv/forkd"), Pid::from_raw(42));
        assert_eq!(dir, PathBuf::from("/srv/forkd/forkd_blind_chroot_42.dir"));
    }

    #[test]
    fn blind_chroot_under_missing_root_fails_before_forking() {
        let config = ServerConfig {
            chroot: Some(PathBuf::from("/nonexistent/forkd-root")),
            blind_chroot: true,
            allow_root: true,
            ..ServerConfig::default()
        };
        let err = apply(&config).unwrap_err();
        assert!(err.is_config());
        assert!(err.to_string().contains("mkdir"));
    }

    #[test]
    fn no_chroot_or_ids_is_a_no_op() {
        let config = ServerConfig {
            allow_root: true,
            ..ServerConfig::default()
        };
        assert!(apply(&config).is_ok());
    }
}
