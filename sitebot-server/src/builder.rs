//! Provisioning of preview sites on disk and as local processes.

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use flate2::read::GzDecoder;
use sitebot_core::{InstanceRecord, PrId};
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::github::ArchiveSource;

/// How long a freshly started site must stay up before it counts as started.
pub const DEFAULT_STARTUP_GRACE: Duration = Duration::from_secs(2);

/// How long a site gets to exit after SIGTERM before its group is killed.
pub const STOP_GRACE: Duration = Duration::from_secs(5);

/// Does the actual work behind provision, rebuild and teardown effects.
#[async_trait]
pub trait SiteBuilder: Send + Sync {
    /// Fetch the branch and start the site from scratch.
    async fn provision(&self, record: &InstanceRecord) -> Result<()>;

    /// Refresh the sources and restart on the same ports.
    async fn rebuild(&self, record: &InstanceRecord) -> Result<()>;

    /// Stop the site and delete its artifacts. Must tolerate a site that was
    /// never provisioned.
    async fn teardown(&self, record: &InstanceRecord) -> Result<()>;
}

/// Runs each site as a shell command in its own unpacked source tree.
pub struct ProcessSiteBuilder {
    root: PathBuf,
    start_command: String,
    host: Option<String>,
    startup_grace: Duration,
    archives: Arc<dyn ArchiveSource>,
    children: Mutex<HashMap<PrId, SiteProcess>>,
}

/// A started site: the `sh` child and the process group it leads.
struct SiteProcess {
    child: Child,
    pgid: Option<i32>,
}

impl ProcessSiteBuilder {
    pub fn new(
        root: PathBuf,
        start_command: String,
        host: Option<String>,
        archives: Arc<dyn ArchiveSource>,
    ) -> Self {
        Self {
            root,
            start_command,
            host,
            startup_grace: DEFAULT_STARTUP_GRACE,
            archives,
            children: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_startup_grace(mut self, grace: Duration) -> Self {
        self.startup_grace = grace;
        self
    }

    pub fn instance_dir(&self, pr: PrId) -> PathBuf {
        self.root.join(format!("pr-{}", pr))
    }

    pub async fn is_running(&self, pr: PrId) -> bool {
        self.children.lock().await.contains_key(&pr)
    }

    async fn deploy(&self, record: &InstanceRecord) -> Result<()> {
        let data = &record.data;
        self.stop(data.pr_id).await;

        let archive = self
            .archives
            .download_archive(&data.source_repo_full_name, &data.branch)
            .await?;

        let dir = self.instance_dir(data.pr_id);
        remove_dir_if_present(&dir).await?;
        tokio::fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("Failed to create {}", dir.display()))?;

        let source_dir = unpack_archive(archive, dir).await?;
        let site = self.start(record, &source_dir).await?;
        self.children.lock().await.insert(data.pr_id, site);
        Ok(())
    }

    async fn start(&self, record: &InstanceRecord, source_dir: &Path) -> Result<SiteProcess> {
        let ports: Vec<String> = record.ports.ports().map(|p| p.to_string()).collect();

        let mut command = Command::new("sh");
        command
            .arg("-c")
            .arg(&self.start_command)
            .current_dir(source_dir)
            .env("PORT", record.assigned_port().to_string())
            .env("SITE_PORTS", ports.join(","))
            .env("PR_NUMBER", record.pr_id().to_string())
            .env("BRANCH", &record.data.branch)
            .stdin(Stdio::null())
            .kill_on_drop(true);
        if let Some(host) = &self.host {
            command.env("HOST", host);
        }
        // The site's own server is usually a grandchild; a fresh group lets
        // stop reach it
        #[cfg(unix)]
        command.process_group(0);

        let mut child = command
            .spawn()
            .with_context(|| format!("Failed to run `{}`", self.start_command))?;
        let pgid = child.id().and_then(|pid| i32::try_from(pid).ok());

        // A command that dies straight away never served anything
        match tokio::time::timeout(self.startup_grace, child.wait()).await {
            Err(_elapsed) => {}
            Ok(Ok(status)) if status.success() => {}
            Ok(Ok(status)) => {
                kill_group(pgid);
                bail!("`{}` exited with {}", self.start_command, status)
            }
            Ok(Err(e)) => {
                kill_group(pgid);
                return Err(anyhow!(e).context("Failed to wait for site process"));
            }
        }

        info!(
            "Started PR #{} on port {} from {}",
            record.pr_id(),
            record.assigned_port(),
            source_dir.display()
        );
        Ok(SiteProcess { child, pgid })
    }

    /// Stop the whole process group: SIGTERM, then SIGKILL once `sh` has
    /// exited or [`STOP_GRACE`] has passed.
    async fn stop(&self, pr: PrId) {
        let Some(mut site) = self.children.lock().await.remove(&pr) else {
            return;
        };

        terminate_group(site.pgid);
        if tokio::time::timeout(STOP_GRACE, site.child.wait())
            .await
            .is_err()
        {
            warn!("Site for PR #{} ignored SIGTERM, killing it", pr);
        }
        kill_group(site.pgid);

        if let Err(e) = site.child.kill().await {
            warn!("Failed to stop site for PR #{}: {}", pr, e);
        }
    }
}

#[cfg(unix)]
fn signal_group(pgid: Option<i32>, signal: libc::c_int) {
    if let Some(pgid) = pgid {
        // SAFETY: kill(2) takes plain integers; a group that is already gone
        // only yields ESRCH.
        unsafe {
            libc::kill(-pgid, signal);
        }
    }
}

#[cfg(unix)]
fn terminate_group(pgid: Option<i32>) {
    signal_group(pgid, libc::SIGTERM);
}

#[cfg(unix)]
fn kill_group(pgid: Option<i32>) {
    signal_group(pgid, libc::SIGKILL);
}

#[cfg(not(unix))]
fn terminate_group(_pgid: Option<i32>) {}

#[cfg(not(unix))]
fn kill_group(_pgid: Option<i32>) {}

#[async_trait]
impl SiteBuilder for ProcessSiteBuilder {
    async fn provision(&self, record: &InstanceRecord) -> Result<()> {
        info!("Provisioning PR #{} ({})", record.pr_id(), record.data.branch);
        self.deploy(record).await
    }

    async fn rebuild(&self, record: &InstanceRecord) -> Result<()> {
        info!(
            "Rebuilding PR #{} in place on {}",
            record.pr_id(),
            record.ports
        );
        self.deploy(record).await
    }

    async fn teardown(&self, record: &InstanceRecord) -> Result<()> {
        info!("Tearing down PR #{}", record.pr_id());
        self.stop(record.pr_id()).await;
        remove_dir_if_present(&self.instance_dir(record.pr_id())).await
    }
}

/// Create the instance root before anything is provisioned.
pub async fn prepare_root(root: &Path) -> Result<()> {
    tokio::fs::create_dir_all(root)
        .await
        .with_context(|| format!("Failed to create instance root {}", root.display()))
}

async fn remove_dir_if_present(dir: &Path) -> Result<()> {
    match tokio::fs::remove_dir_all(dir).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).with_context(|| format!("Failed to remove {}", dir.display())),
    }
}

/// Unpack a gzipped tarball into `dest`.
///
/// GitHub tarballs wrap everything in one `owner-repo-sha/` directory; when
/// the archive has exactly one top-level directory, that directory is returned
/// as the source root, otherwise `dest` itself is.
pub async fn unpack_archive(archive: Vec<u8>, dest: PathBuf) -> Result<PathBuf> {
    tokio::task::spawn_blocking(move || -> Result<PathBuf> {
        let mut tarball = tar::Archive::new(GzDecoder::new(archive.as_slice()));
        tarball
            .unpack(&dest)
            .with_context(|| format!("Failed to unpack archive into {}", dest.display()))?;

        let mut entries = std::fs::read_dir(&dest)
            .with_context(|| format!("Failed to list {}", dest.display()))?
            .collect::<io::Result<Vec<_>>>()?;

        if entries.len() == 1 && entries[0].file_type()?.is_dir() {
            if let Some(only) = entries.pop() {
                return Ok(only.path());
            }
        }
        Ok(dest)
    })
    .await
    .context("Archive unpacking task panicked")?
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use sitebot_core::{InstanceData, PortAllocator};

    /// Build a `.tar.gz` from `(path, contents)` pairs.
    fn tarball(files: &[(&str, &str)]) -> Vec<u8> {
        let encoder = GzEncoder::new(Vec::new(), Compression::default());
        let mut builder = tar::Builder::new(encoder);
        for (path, contents) in files {
            let mut header = tar::Header::new_gnu();
            header.set_size(contents.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder
                .append_data(&mut header, path, contents.as_bytes())
                .unwrap();
        }
        builder.into_inner().unwrap().finish().unwrap()
    }

    struct StaticArchive(Vec<u8>);

    #[async_trait]
    impl ArchiveSource for StaticArchive {
        async fn download_archive(&self, _repo: &str, _git_ref: &str) -> Result<Vec<u8>> {
            Ok(self.0.clone())
        }
    }

    /// Hands out archives in order, one per download.
    struct SequencedArchives(std::sync::Mutex<Vec<Vec<u8>>>);

    #[async_trait]
    impl ArchiveSource for SequencedArchives {
        async fn download_archive(&self, _repo: &str, _git_ref: &str) -> Result<Vec<u8>> {
            let mut queue = self.0.lock().unwrap();
            if queue.is_empty() {
                bail!("no more archives");
            }
            Ok(queue.remove(0))
        }
    }

    fn record(pr: u64, block: usize) -> InstanceRecord {
        let mut ports = PortAllocator::new(9400, 9410, None).unwrap();
        InstanceRecord::new(
            InstanceData {
                pr_id: PrId(pr),
                branch: "feature".to_string(),
                source_repo_full_name: "alice/site".to_string(),
                pr_repo_account: "acme".to_string(),
                pr_repo_name: "site".to_string(),
                pr_author: "alice".to_string(),
            },
            ports.allocate(block).unwrap(),
            Utc::now(),
        )
    }

    fn builder(root: &Path, command: &str, archive: Vec<u8>) -> ProcessSiteBuilder {
        ProcessSiteBuilder::new(
            root.to_path_buf(),
            command.to_string(),
            Some("127.0.0.1".to_string()),
            Arc::new(StaticArchive(archive)),
        )
        .with_startup_grace(Duration::from_millis(300))
    }

    async fn wait_for_file(path: &Path) -> String {
        for _ in 0..50 {
            if let Ok(contents) = tokio::fs::read_to_string(path).await {
                if !contents.is_empty() {
                    return contents;
                }
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        panic!("{} never appeared", path.display());
    }

    #[tokio::test]
    async fn test_unpack_returns_single_top_level_directory() {
        let dir = tempfile::tempdir().unwrap();
        let archive = tarball(&[
            ("acme-site-abc123/index.html", "<h1>hi</h1>"),
            ("acme-site-abc123/package.json", "{}"),
        ]);

        let source = unpack_archive(archive, dir.path().to_path_buf())
            .await
            .unwrap();
        assert_eq!(source, dir.path().join("acme-site-abc123"));
        assert!(source.join("index.html").exists());
    }

    #[tokio::test]
    async fn test_unpack_flat_archive_uses_destination() {
        let dir = tempfile::tempdir().unwrap();
        let archive = tarball(&[("index.html", "a"), ("about.html", "b")]);

        let source = unpack_archive(archive, dir.path().to_path_buf())
            .await
            .unwrap();
        assert_eq!(source, dir.path());
    }

    #[tokio::test]
    async fn test_unpack_rejects_garbage() {
        let dir = tempfile::tempdir().unwrap();
        assert!(unpack_archive(b"not a tarball".to_vec(), dir.path().to_path_buf())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_provision_starts_site_with_port_environment() {
        let root = tempfile::tempdir().unwrap();
        let archive = tarball(&[("acme-site-abc/index.html", "hi")]);
        let site = builder(
            root.path(),
            "echo \"$PORT $SITE_PORTS $PR_NUMBER $BRANCH $HOST\" > env.txt; sleep 30",
            archive,
        );
        let record = record(5, 2);

        site.provision(&record).await.unwrap();
        assert!(site.is_running(PrId(5)).await);

        let env = wait_for_file(&site.instance_dir(PrId(5)).join("acme-site-abc/env.txt")).await;
        assert_eq!(env.trim(), "9400 9400,9401 5 feature 127.0.0.1");

        site.teardown(&record).await.unwrap();
        assert!(!site.is_running(PrId(5)).await);
        assert!(!site.instance_dir(PrId(5)).exists());
    }

    #[tokio::test]
    async fn test_start_command_that_exits_with_failure_is_an_error() {
        let root = tempfile::tempdir().unwrap();
        let site = builder(root.path(), "exit 3", tarball(&[("index.html", "hi")]));

        let err = site.provision(&record(6, 1)).await.unwrap_err();
        assert!(err.to_string().contains("exited"), "{err}");
        assert!(!site.is_running(PrId(6)).await);
    }

    #[tokio::test]
    async fn test_rebuild_replaces_previous_sources() {
        let root = tempfile::tempdir().unwrap();
        let archives = Arc::new(SequencedArchives(std::sync::Mutex::new(vec![
            tarball(&[("old.html", "old")]),
            tarball(&[("new.html", "new")]),
        ])));
        let site = ProcessSiteBuilder::new(
            root.path().to_path_buf(),
            "sleep 30".to_string(),
            None,
            archives,
        )
        .with_startup_grace(Duration::from_millis(300));
        let record = record(8, 1);

        site.provision(&record).await.unwrap();
        let dir = site.instance_dir(PrId(8));
        assert!(dir.join("old.html").exists());

        site.rebuild(&record).await.unwrap();
        assert!(dir.join("new.html").exists());
        assert!(!dir.join("old.html").exists());
        assert!(site.is_running(PrId(8)).await);

        site.teardown(&record).await.unwrap();
    }

    /// Whether `pid` is a live (non-zombie) process.
    #[cfg(target_os = "linux")]
    fn process_alive(pid: u32) -> bool {
        match std::fs::read_to_string(format!("/proc/{}/stat", pid)) {
            // Field 3, after the parenthesised command name, is the state
            Ok(stat) => stat
                .rsplit_once(')')
                .and_then(|(_, rest)| rest.split_whitespace().next())
                .is_some_and(|state| state != "Z" && state != "X"),
            Err(_) => false,
        }
    }

    #[cfg(target_os = "linux")]
    async fn wait_until_dead(pid: u32) -> bool {
        for _ in 0..50 {
            if !process_alive(pid) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        false
    }

    #[cfg(target_os = "linux")]
    const BACKGROUND_SERVER: &str = "sleep 300 & echo $! > server.pid; wait";

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_teardown_stops_processes_started_by_the_command() {
        let root = tempfile::tempdir().unwrap();
        let site = builder(root.path(), BACKGROUND_SERVER, tarball(&[("index.html", "hi")]));
        let record = record(10, 1);

        site.provision(&record).await.unwrap();
        let pid_file = site.instance_dir(PrId(10)).join("server.pid");
        let pid: u32 = wait_for_file(&pid_file).await.trim().parse().unwrap();
        assert!(process_alive(pid));

        site.teardown(&record).await.unwrap();
        assert!(wait_until_dead(pid).await, "server {pid} outlived teardown");
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_rebuild_stops_previous_server() {
        let root = tempfile::tempdir().unwrap();
        let archives = Arc::new(SequencedArchives(std::sync::Mutex::new(vec![
            tarball(&[("index.html", "v1")]),
            tarball(&[("index.html", "v2")]),
        ])));
        let site = ProcessSiteBuilder::new(
            root.path().to_path_buf(),
            BACKGROUND_SERVER.to_string(),
            None,
            archives,
        )
        .with_startup_grace(Duration::from_millis(300));
        let record = record(11, 1);

        site.provision(&record).await.unwrap();
        let pid_file = site.instance_dir(PrId(11)).join("server.pid");
        let first: u32 = wait_for_file(&pid_file).await.trim().parse().unwrap();

        site.rebuild(&record).await.unwrap();
        assert!(wait_until_dead(first).await, "server {first} outlived rebuild");
        let second: u32 = wait_for_file(&pid_file).await.trim().parse().unwrap();
        assert_ne!(first, second);
        assert!(process_alive(second));

        site.teardown(&record).await.unwrap();
        assert!(wait_until_dead(second).await);
    }

    #[tokio::test]
    async fn test_teardown_of_unprovisioned_site_is_ok() {
        let root = tempfile::tempdir().unwrap();
        let site = builder(root.path(), "sleep 30", Vec::new());
        site.teardown(&record(9, 1)).await.unwrap();
    }

    #[tokio::test]
    async fn test_prepare_root_creates_nested_directories() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("a/b/site_instances");
        prepare_root(&root).await.unwrap();
        assert!(root.is_dir());
        prepare_root(&root).await.unwrap();
    }
}
