//! Pid-file bookkeeping and the single-master lock.

use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::Path;

use fs2::FileExt;
use nix::sys::signal::kill;
use nix::unistd::Pid;

use crate::error::ServerError;

/// Advisory exclusive lock held across the master-init critical section.
/// Dropping releases it.
pub struct MasterLock {
    file: File,
}

impl MasterLock {
    pub fn acquire(lock_path: &Path) -> Result<Self, ServerError> {
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(lock_path)?;
        file.try_lock_exclusive()
            .map_err(|_| ServerError::AlreadyRunning(lock_path.display().to_string()))?;
        Ok(Self { file })
    }

    pub fn release(self) {
        let _ = fs2::FileExt::unlock(&self.file);
    }
}

pub fn write_pid(pid_path: &Path) -> std::io::Result<()> {
    let mut file = File::create(pid_path)?;
    write!(file, "{}", std::process::id())
}

pub fn read_pid(pid_path: &Path) -> Option<Pid> {
    let mut content = String::new();
    File::open(pid_path)
        .ok()?
        .read_to_string(&mut content)
        .ok()?;
    content.trim().parse::<i32>().ok().map(Pid::from_raw)
}

/// Signal-zero probe: is the process still there?
pub fn alive(pid: Pid) -> bool {
    kill(pid, None).is_ok()
}

/// The running master's pid, if any.
pub fn running_master(pid_path: &Path) -> Option<Pid> {
    read_pid(pid_path).filter(|&pid| alive(pid))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pid_round_trip() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("master.pid");
        write_pid(&path).unwrap();
        assert_eq!(read_pid(&path), Some(Pid::from_raw(std::process::id() as i32)));
    }

    #[test]
    fn second_lock_acquisition_fails() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("master.lock");
        let first = MasterLock::acquire(&path).unwrap();
        assert!(matches!(
            MasterLock::acquire(&path),
            Err(ServerError::AlreadyRunning(_))
        ));
        first.release();
        MasterLock::acquire(&path).unwrap();
    }

    #[test]
    fn our_own_pid_is_alive() {
        assert!(alive(Pid::from_raw(std::process::id() as i32)));
    }
}
