//! cgroupv2 filesystem preparation.
//!
//! The attach registry opens workload cgroups relative to a cgroupv2 mount.
//! When the default mount point does not exist yet the agent mounts one
//! itself; an existing mount is verified to actually be cgroup2.

use std::ffi::CString;
use std::fs;
use std::path::Path;

use log::info;

use crate::error::Error;

/// Default location of the agent's cgroupv2 mount.
pub const DEFAULT_CGROUP_ROOT: &str = "/var/run/ebpf/cgroupv2";

/// Make sure `path` is a cgroupv2 mount, mounting one when absent.
pub fn ensure(path: &str) -> Result<(), Error> {
    let (mounted, is_cgroup) = is_mount_fs(Path::new(path))?;

    if !mounted {
        return mount_cgroup(path);
    }
    if !is_cgroup {
        return Err(Error::CgroupFs(format!(
            "mount path {path:?} is not a cgroupv2 filesystem"
        )));
    }
    Ok(())
}

fn mount_cgroup(path: &str) -> Result<(), Error> {
    match fs::metadata(path) {
        Ok(stat) if !stat.is_dir() => {
            return Err(Error::CgroupFs(format!(
                "unable to mount {path:?} as it is not a directory"
            )));
        }
        Ok(_) => {}
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            fs::create_dir_all(path).map_err(|err| {
                Error::CgroupFs(format!("unable to create cgroup mount directory: {err}"))
            })?;
        }
        Err(err) => {
            return Err(Error::CgroupFs(format!(
                "unable to stat the mount path {path}: {err}"
            )));
        }
    }

    let source = CString::new("none").expect("static string");
    let target = c_path(path)?;
    let fstype = CString::new("cgroup2").expect("static string");
    let rc = unsafe {
        libc::mount(
            source.as_ptr(),
            target.as_ptr(),
            fstype.as_ptr(),
            0,
            std::ptr::null(),
        )
    };
    if rc != 0 {
        let err = std::io::Error::last_os_error();
        return Err(Error::CgroupFs(format!("unable to mount {path}: {err}")));
    }

    info!("mounted cgroupv2 at {path}");
    Ok(())
}

/// Returns (is a mount point, is a cgroupv2 filesystem).
fn is_mount_fs(path: &Path) -> Result<(bool, bool), Error> {
    let stat = match fs::symlink_metadata(path) {
        Ok(stat) => stat,
        // A non-existent path can't be a mount point.
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok((false, false)),
        Err(err) => {
            return Err(Error::CgroupFs(format!(
                "unable to stat {}: {err}",
                path.display()
            )));
        }
    };

    let parent = path.parent().unwrap_or(Path::new("/"));
    let parent_stat = fs::symlink_metadata(parent).map_err(|err| {
        Error::CgroupFs(format!("unable to stat {}: {err}", parent.display()))
    })?;

    // Same device as the parent means not a mount point.
    use std::os::unix::fs::MetadataExt;
    if stat.dev() == parent_stat.dev() {
        return Ok((false, false));
    }

    let target = c_path(&path.to_string_lossy())?;
    let mut fs_stat: libc::statfs = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::statfs(target.as_ptr(), &mut fs_stat) };
    if rc != 0 {
        let err = std::io::Error::last_os_error();
        return Err(Error::CgroupFs(format!(
            "unable to statfs {}: {err}",
            path.display()
        )));
    }

    let is_cgroup = fs_stat.f_type as u64 == libc::CGROUP2_SUPER_MAGIC as u64;
    Ok((true, is_cgroup))
}

fn c_path(path: &str) -> Result<CString, Error> {
    CString::new(path).map_err(|_| Error::CgroupFs(format!("path {path:?} contains a nul byte")))
}
