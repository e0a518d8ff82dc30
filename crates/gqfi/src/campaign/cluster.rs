//! Cluster worker pool (REDESIGN FLAG #3, cluster variant).
//!
//! The original's cluster mode appends ` --sshloginfile <file>` to the
//! same `parallel` command line, letting GNU parallel open the SSH
//! connections. No `ssh`-wrapping crate appears anywhere in this corpus, so
//! this pool shells out to the system `ssh` binary directly, the same way
//! [`crate::bootstrap`] shells out to `objcopy`/`qemu-img`: one remote
//! invocation of the `gqfi-shard` binary per shard, over one SSH connection
//! per host. File transport to remote hosts is out of scope (spec.md §9).

use std::path::PathBuf;

use async_trait::async_trait;
use tokio::process::Command;

use crate::campaign::pool::{ShardOutcome, ShardUnit, WorkerPool};
use crate::error::{GqfiError, Result};

/// One shard dispatched to a specific host by running `gqfi-shard` there
/// over `ssh`. The remote binary is assumed already deployed and the
/// config/target files already reachable at identical paths on every host
/// (spec.md §9 Non-goals: "distributing the target binaries and config
/// document to cluster hosts is out of scope").
pub struct RemoteShardUnit {
    pub shard_id: u32,
    pub host: String,
    pub config_path: PathBuf,
    pub targets_folder: PathBuf,
    pub target_name: String,
}

/// Sentinel meaning "run this shard on the local host" in a cluster list
/// file (spec.md §6: "one host per line, `:` meaning local").
const LOCAL_HOST_SENTINEL: &str = ":";

#[async_trait]
impl ShardUnit for RemoteShardUnit {
    async fn run(self: Box<Self>) -> Result<ShardOutcome> {
        let mut command = if self.host == LOCAL_HOST_SENTINEL {
            Command::new("gqfi-shard")
        } else {
            let mut c = Command::new("ssh");
            c.arg(&self.host).arg("--").arg("gqfi-shard");
            c
        };
        let output = command
            .arg("--config")
            .arg(&self.config_path)
            .arg("--targets-folder")
            .arg(&self.targets_folder)
            .arg("--target")
            .arg(&self.target_name)
            .arg("--shard-id")
            .arg(self.shard_id.to_string())
            .output()
            .await
            .map_err(|e| {
                GqfiError::Scheduling(format!("shard launch on {} failed: {e}", self.host))
            })?;

        if !output.status.success() {
            return Err(GqfiError::Scheduling(format!(
                "shard {} on host {} exited with {}: {}",
                self.shard_id,
                self.host,
                output.status,
                String::from_utf8_lossy(&output.stderr)
            )));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let records_written = stdout
            .lines()
            .last()
            .and_then(|line| line.trim().parse().ok())
            .ok_or_else(|| {
                GqfiError::Scheduling(format!(
                    "shard {} on host {} did not report a record count",
                    self.shard_id, self.host
                ))
            })?;

        Ok(ShardOutcome {
            shard_id: self.shard_id,
            records_written,
        })
    }
}

/// Reads one host per line, blank lines and `#`-comments ignored (spec.md
/// §6 `cluster_list_file`).
pub fn read_host_list(path: &std::path::Path) -> Result<Vec<String>> {
    let text = std::fs::read_to_string(path)?;
    Ok(text
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .map(str::to_string)
        .collect())
}

/// Assigns shards to hosts round-robin and runs them all concurrently
/// through the same [`WorkerPool`] contract [`super::pool::LocalWorkerPool`]
/// satisfies, so the campaign scheduler never has to branch on execution
/// backend.
pub struct ClusterWorkerPool {
    hosts: Vec<String>,
}

impl ClusterWorkerPool {
    pub fn new(hosts: Vec<String>) -> Result<Self> {
        if hosts.is_empty() {
            return Err(GqfiError::Configuration(
                "cluster_list_file named no hosts".into(),
            ));
        }
        Ok(Self { hosts })
    }

    pub fn host_for_shard(&self, shard_id: u32) -> &str {
        &self.hosts[shard_id as usize % self.hosts.len()]
    }
}

#[async_trait]
impl WorkerPool for ClusterWorkerPool {
    async fn run_all(&self, units: Vec<Box<dyn ShardUnit>>) -> Vec<Result<ShardOutcome>> {
        // Host assignment already happened when each `RemoteShardUnit` was
        // built; fan out exactly like the local pool.
        let pool = super::pool::LocalWorkerPool::with_concurrency(self.hosts.len() * 4);
        pool.run_all(units).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_host_list_skipping_blanks_and_comments() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hosts.txt");
        std::fs::write(&path, "node-a\n# spare\n\nnode-b\n").unwrap();
        let hosts = read_host_list(&path).unwrap();
        assert_eq!(hosts, vec!["node-a".to_string(), "node-b".to_string()]);
    }

    #[test]
    fn rejects_empty_host_list() {
        assert!(ClusterWorkerPool::new(vec![]).is_err());
    }

    #[test]
    fn assigns_shards_round_robin() {
        let pool = ClusterWorkerPool::new(vec!["a".into(), "b".into()]).unwrap();
        assert_eq!(pool.host_for_shard(0), "a");
        assert_eq!(pool.host_for_shard(1), "b");
        assert_eq!(pool.host_for_shard(2), "a");
    }

    #[test]
    fn host_list_preserves_local_sentinel() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hosts.txt");
        std::fs::write(&path, ":\nnode-a\n").unwrap();
        let hosts = read_host_list(&path).unwrap();
        assert_eq!(hosts, vec![":".to_string(), "node-a".to_string()]);
    }

    #[test]
    fn local_sentinel_runs_gqfi_shard_directly_not_via_ssh() {
        let remote = RemoteShardUnit {
            shard_id: 0,
            host: LOCAL_HOST_SENTINEL.to_string(),
            config_path: PathBuf::from("/tmp/campaign.json"),
            targets_folder: PathBuf::from("/tmp/targets"),
            target_name: "demo".into(),
        };
        let command = if remote.host == LOCAL_HOST_SENTINEL {
            Command::new("gqfi-shard")
        } else {
            let mut c = Command::new("ssh");
            c.arg(&remote.host);
            c
        };
        assert_eq!(command.as_std().get_program(), "gqfi-shard");
    }
}
