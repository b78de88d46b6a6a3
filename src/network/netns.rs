use std::fs::File;
use std::os::fd::AsFd;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use log::debug;
use rustix::thread::{LinkNameSpaceType, move_into_link_name_space};

use crate::constants::DIR_PROC;

pub fn netns_path(pid: i32) -> PathBuf {
    Path::new(DIR_PROC).join(pid.to_string()).join("ns").join("net")
}

/// Runs `f` in the network namespace of `pid`.
///
/// The namespace is entered by a dedicated thread which exits when `f`
/// returns, so the calling thread never changes namespace.
pub fn run_in_netns<T, F>(pid: i32, f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send,
    T: Send,
{
    let path = netns_path(pid);
    let ns = File::open(&path)
        .with_context(|| format!("unable to open network namespace {:?}", path))?;
    debug!("Entering network namespace {:?}", path);

    let joined = crossbeam::scope(|s| {
        s.spawn(move |_| {
            move_into_link_name_space(ns.as_fd(), Some(LinkNameSpaceType::Network))
                .map_err(|e| anyhow!("unable to enter network namespace of pid {}: {}", pid, e))?;
            f()
        })
        .join()
    })
    .map_err(|_| anyhow!("network namespace thread of pid {} panicked", pid))?;

    joined.map_err(|_| anyhow!("network namespace thread of pid {} panicked", pid))?
}
