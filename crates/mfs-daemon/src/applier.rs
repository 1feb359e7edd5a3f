//! Inbound applier
//!
//! Applies wire messages from other hosts to the local tree. Every message
//! goes through the same steps:
//! 1. Skip if we published it ourselves
//! 2. Skip if it is addressed to another host
//! 3. Resolve the wire path under our root
//! 4. Echo-lock the target and any parent directory about to be created
//! 5. Refuse paths whose parents lead through a symlink, then perform the
//!    filesystem mutation on the blocking pool
//!
//! Failures are logged and isolated to the message. Retrying transient
//! errors is opt-in through [`RetryPolicy`].

use std::fs;
use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, error, warn};

use mfs_core::path::{check_no_symlink_ancestors, resolve_wire_path};
use mfs_core::{FileOp, ProtocolError, WireMessage};

use crate::echo_lock::EchoLock;

/// Apply errors
#[derive(Debug, Error)]
pub enum ApplyError {
    #[error("rejected path: {0}")]
    Path(#[from] ProtocolError),

    #[error("{op} {path:?} failed: {source}")]
    Io {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("apply task failed: {0}")]
    Task(String),
}

impl ApplyError {
    fn io(op: &'static str, path: &Path, source: io::Error) -> Self {
        ApplyError::Io {
            op,
            path: path.to_path_buf(),
            source,
        }
    }

    /// Errors worth another attempt
    pub fn is_transient(&self) -> bool {
        match self {
            ApplyError::Io { source, .. } => matches!(
                source.kind(),
                io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
            ),
            _ => false,
        }
    }
}

/// Result of handling one inbound message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied,
    SkippedSelfOrigin,
    SkippedOtherTarget,
    Failed(String),
}

impl ApplyOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, ApplyOutcome::Applied)
    }
}

/// Bounded retry for transient filesystem errors
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    /// Total attempts per message (1 = no retry)
    pub max_attempts: u32,
    /// Delay before the first retry, doubled after each attempt
    pub initial_delay: Duration,
    /// Upper bound on the delay
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, initial_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_delay,
            ..Self::default()
        }
    }

    fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.saturating_sub(1).min(16);
        self.initial_delay.saturating_mul(factor).min(self.max_delay)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 1,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
        }
    }
}

/// Applies remote changes under `root`
pub struct Applier {
    host_id: String,
    root: PathBuf,
    echo_lock: EchoLock,
    retry: RetryPolicy,
}

impl Applier {
    pub fn new(host_id: impl Into<String>, root: impl Into<PathBuf>, echo_lock: EchoLock) -> Self {
        Self {
            host_id: host_id.into(),
            root: root.into(),
            echo_lock,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn host_id(&self) -> &str {
        &self.host_id
    }

    /// Decode and apply a raw bus payload
    pub async fn handle_payload(&self, payload: &str) -> ApplyOutcome {
        match WireMessage::decode(payload) {
            Ok(message) => self.apply(message).await,
            Err(e) => {
                warn!("Dropping undecodable message: {}", e);
                ApplyOutcome::Failed(e.to_string())
            }
        }
    }

    /// Apply one message
    pub async fn apply(&self, message: WireMessage) -> ApplyOutcome {
        if message.is_from(&self.host_id) {
            return ApplyOutcome::SkippedSelfOrigin;
        }
        if !message.is_addressed_to(&self.host_id) {
            debug!(
                "Skipping {} for {} (addressed to {:?})",
                message.op.name(),
                message.path,
                message.target_host
            );
            return ApplyOutcome::SkippedOtherTarget;
        }

        let op_name = message.op.name();
        let wire_path = message.path.clone();

        let (path, from) = match self.resolve(&message) {
            Ok(resolved) => resolved,
            Err(e) => {
                warn!("Rejected {} from {}: {}", op_name, message.origin_host, e);
                return ApplyOutcome::Failed(e.to_string());
            }
        };

        let op = Arc::new(message.op);
        let root = self.root.clone();
        let result = self
            .retry_locked(&path, from.as_deref(), &wire_path, || {
                let op = op.clone();
                let root = root.clone();
                let path = path.clone();
                let from = from.clone();
                async move {
                    tokio::task::spawn_blocking(move || apply_op(&root, &path, from.as_deref(), &op))
                        .await
                        .unwrap_or_else(|e| Err(ApplyError::Task(e.to_string())))
                }
            })
            .await;

        match result {
            Ok(()) => {
                debug!("Applied {} {} from {}", op_name, wire_path, message.origin_host);
                ApplyOutcome::Applied
            }
            Err(e) => {
                error!("Failed to apply {} {}: {}", op_name, wire_path, e);
                ApplyOutcome::Failed(e.to_string())
            }
        }
    }

    /// Run `attempt` under the retry policy, taking the echo locks before every try
    async fn retry_locked<F, Fut>(
        &self,
        path: &Path,
        from: Option<&Path>,
        wire_path: &str,
        mut attempt: F,
    ) -> Result<(), ApplyError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<(), ApplyError>>,
    {
        let mut tries = 1;
        loop {
            self.lock_targets(path, from);

            match attempt().await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_transient() && tries < self.retry.max_attempts => {
                    let delay = self.retry.delay_for(tries);
                    warn!(
                        "Attempt {} for {} failed: {}, retrying in {:?}",
                        tries, wire_path, e, delay
                    );
                    tokio::time::sleep(delay).await;
                    tries += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Lock every path the mutation can create or touch, missing parents included
    fn lock_targets(&self, path: &Path, from: Option<&Path>) {
        for dir in missing_ancestors(&self.root, path) {
            self.echo_lock.acquire(&dir);
        }
        self.echo_lock.acquire(path);
        if let Some(from) = from {
            self.echo_lock.acquire(from);
        }
    }

    fn resolve(&self, message: &WireMessage) -> Result<(PathBuf, Option<PathBuf>), ApplyError> {
        let path = resolve_wire_path(&self.root, &message.path)?;
        let from = match &message.op {
            FileOp::Move { from } => Some(resolve_wire_path(&self.root, from)?),
            _ => None,
        };
        Ok((path, from))
    }
}

/// Directories between `root` and `path` that do not exist yet
fn missing_ancestors(root: &Path, path: &Path) -> Vec<PathBuf> {
    path.ancestors()
        .skip(1)
        .take_while(|dir| *dir != root && dir.starts_with(root))
        .take_while(|dir| fs::symlink_metadata(dir).is_err())
        .map(Path::to_path_buf)
        .collect()
}

/// Perform the filesystem mutation for one operation
fn apply_op(root: &Path, path: &Path, from: Option<&Path>, op: &FileOp) -> Result<(), ApplyError> {
    check_no_symlink_ancestors(root, path)?;
    if let Some(from) = from {
        check_no_symlink_ancestors(root, from)?;
    }

    match op {
        FileOp::CreateDir { mode, uid, gid } => {
            if let Err(e) = fs::create_dir_all(path) {
                return Err(ApplyError::io("mkdir", path, e));
            }
            if let Err(e) = set_mode(path, *mode) {
                warn!("chmod {:?} failed: {}", path, e);
            }
            if let Err(e) = set_owner(path, *uid, *gid) {
                warn!("chown {:?} failed: {}", path, e);
            }
            Ok(())
        }

        FileOp::WriteFile {
            mode,
            uid,
            gid,
            content,
        } => {
            ensure_parent(path)?;
            fs::write(path, content).map_err(|e| ApplyError::io("write", path, e))?;
            if let Err(e) = set_mode(path, *mode) {
                warn!("chmod {:?} failed: {}", path, e);
            }
            if let Err(e) = set_owner(path, *uid, *gid) {
                warn!("chown {:?} failed: {}", path, e);
            }
            Ok(())
        }

        FileOp::Symlink { target } => {
            ensure_parent(path)?;
            if let Ok(meta) = fs::symlink_metadata(path) {
                if meta.file_type().is_symlink() {
                    fs::remove_file(path).map_err(|e| ApplyError::io("unlink", path, e))?;
                }
            }
            make_symlink(Path::new(target), path).map_err(|e| ApplyError::io("symlink", path, e))
        }

        FileOp::Remove => {
            let meta = match fs::symlink_metadata(path) {
                Ok(meta) => meta,
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    debug!("Remove of missing {:?}", path);
                    return Ok(());
                }
                Err(e) => return Err(ApplyError::io("stat", path, e)),
            };
            if meta.is_dir() {
                fs::remove_dir(path).map_err(|e| ApplyError::io("rmdir", path, e))
            } else {
                fs::remove_file(path).map_err(|e| ApplyError::io("unlink", path, e))
            }
        }

        FileOp::Move { .. } => {
            let from = from.ok_or_else(|| {
                ApplyError::io(
                    "rename",
                    path,
                    io::Error::new(io::ErrorKind::InvalidInput, "missing source"),
                )
            })?;
            ensure_parent(path)?;
            fs::rename(from, path).map_err(|e| ApplyError::io("rename", from, e))
        }

        FileOp::Chmod { mode } => set_mode(path, *mode).map_err(|e| ApplyError::io("chmod", path, e)),
    }
}

/// Create missing parents; a file can arrive before its directory
fn ensure_parent(path: &Path) -> Result<(), ApplyError> {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() && !parent.exists() => {
            fs::create_dir_all(parent).map_err(|e| ApplyError::io("mkdir", parent, e))
        }
        _ => Ok(()),
    }
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode & mfs_core::PERMISSION_MASK))
}

#[cfg(not(unix))]
fn set_mode(path: &Path, mode: u32) -> io::Result<()> {
    let mut perms = fs::metadata(path)?.permissions();
    perms.set_readonly(mode & 0o222 == 0);
    fs::set_permissions(path, perms)
}

#[cfg(unix)]
fn set_owner(path: &Path, uid: u32, gid: u32) -> io::Result<()> {
    use std::os::unix::fs::MetadataExt;

    let meta = fs::symlink_metadata(path)?;
    if meta.uid() == uid && meta.gid() == gid {
        return Ok(());
    }
    std::os::unix::fs::chown(path, Some(uid), Some(gid))
}

#[cfg(not(unix))]
fn set_owner(_path: &Path, _uid: u32, _gid: u32) -> io::Result<()> {
    Ok(())
}

#[cfg(unix)]
fn make_symlink(target: &Path, link: &Path) -> io::Result<()> {
    std::os::unix::fs::symlink(target, link)
}

#[cfg(not(unix))]
fn make_symlink(_target: &Path, _link: &Path) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "symlinks are not supported on this platform",
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn applier(dir: &TempDir, host: &str) -> (Applier, EchoLock) {
        let lock = EchoLock::new(Duration::from_secs(60));
        (Applier::new(host, dir.path(), lock.clone()), lock)
    }

    /// Owner of the test directory, so chown is a no-op
    fn owner() -> (u32, u32) {
        let sample = TempDir::new().unwrap();
        let meta = mfs_core::FileMeta::lstat(sample.path()).unwrap();
        (meta.uid, meta.gid)
    }

    fn write_msg(origin: &str, path: &str, content: &[u8]) -> WireMessage {
        let (uid, gid) = owner();
        WireMessage::new(
            origin,
            path,
            FileOp::WriteFile {
                mode: 0o640,
                uid,
                gid,
                content: content.to_vec(),
            },
        )
    }

    #[tokio::test]
    async fn test_self_origin_never_applied() {
        let dir = TempDir::new().unwrap();
        let (applier, lock) = applier(&dir, "alpha");

        let outcome = applier.apply(write_msg("alpha", "echo.txt", b"x")).await;
        assert_eq!(outcome, ApplyOutcome::SkippedSelfOrigin);
        assert!(!dir.path().join("echo.txt").exists());
        assert!(lock.is_empty());
    }

    #[tokio::test]
    async fn test_targeted_addressing() {
        let dir_a = TempDir::new().unwrap();
        let dir_b = TempDir::new().unwrap();
        let (a, _) = applier(&dir_a, "A");
        let (b, _) = applier(&dir_b, "B");

        let msg = write_msg("C", "only-b.txt", b"for B").with_target(Some("B"));

        assert_eq!(a.apply(msg.clone()).await, ApplyOutcome::SkippedOtherTarget);
        assert_eq!(b.apply(msg).await, ApplyOutcome::Applied);

        assert!(!dir_a.path().join("only-b.txt").exists());
        assert_eq!(fs::read(dir_b.path().join("only-b.txt")).unwrap(), b"for B");
    }

    #[tokio::test]
    async fn test_write_round_trip_and_lock() {
        let dir = TempDir::new().unwrap();
        let (applier, lock) = applier(&dir, "beta");

        let outcome = applier
            .apply(write_msg("alpha", "nested/deeper/f.txt", b"content C"))
            .await;
        assert!(outcome.is_applied());

        let path = dir.path().join("nested/deeper/f.txt");
        assert_eq!(fs::read(&path).unwrap(), b"content C");
        assert!(lock.is_locked(&path));

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(&path).unwrap().permissions().mode() & 0o7777;
            assert_eq!(mode, 0o640);
        }
    }

    #[tokio::test]
    async fn test_create_dir_existing_is_ok() {
        let dir = TempDir::new().unwrap();
        let (applier, _) = applier(&dir, "beta");
        let (uid, gid) = owner();
        let msg = WireMessage::new(
            "alpha",
            "d1",
            FileOp::CreateDir {
                mode: 0o750,
                uid,
                gid,
            },
        );

        assert!(applier.apply(msg.clone()).await.is_applied());
        assert!(applier.apply(msg).await.is_applied());
        assert!(dir.path().join("d1").is_dir());

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(dir.path().join("d1")).unwrap().permissions().mode() & 0o7777;
            assert_eq!(mode, 0o750);
        }
    }

    #[tokio::test]
    async fn test_move_round_trip() {
        let dir = TempDir::new().unwrap();
        let (applier, lock) = applier(&dir, "beta");
        fs::write(dir.path().join("a"), b"prior").unwrap();

        let msg = WireMessage::new("alpha", "b", FileOp::Move { from: "a".into() });
        assert!(applier.apply(msg).await.is_applied());

        assert!(!dir.path().join("a").exists());
        assert_eq!(fs::read(dir.path().join("b")).unwrap(), b"prior");
        assert!(lock.is_locked(&dir.path().join("a")));
        assert!(lock.is_locked(&dir.path().join("b")));
    }

    #[tokio::test]
    async fn test_move_missing_source_fails() {
        let dir = TempDir::new().unwrap();
        let (applier, _) = applier(&dir, "beta");

        let msg = WireMessage::new("alpha", "b", FileOp::Move { from: "nope".into() });
        assert!(matches!(applier.apply(msg).await, ApplyOutcome::Failed(_)));
    }

    #[tokio::test]
    async fn test_remove_file_and_empty_dir() {
        let dir = TempDir::new().unwrap();
        let (applier, _) = applier(&dir, "beta");
        fs::write(dir.path().join("f"), b"x").unwrap();
        fs::create_dir(dir.path().join("empty")).unwrap();

        for path in ["f", "empty", "never-existed"] {
            let msg = WireMessage::new("alpha", path, FileOp::Remove);
            assert!(applier.apply(msg).await.is_applied(), "remove {}", path);
        }
        assert!(!dir.path().join("f").exists());
        assert!(!dir.path().join("empty").exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_symlink_replaces_existing_link() {
        let dir = TempDir::new().unwrap();
        let (applier, _) = applier(&dir, "beta");
        let link = dir.path().join("link");
        std::os::unix::fs::symlink("old-target", &link).unwrap();

        let msg = WireMessage::new(
            "alpha",
            "link",
            FileOp::Symlink {
                target: "new-target".into(),
            },
        );
        assert!(applier.apply(msg).await.is_applied());
        assert_eq!(fs::read_link(&link).unwrap(), PathBuf::from("new-target"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_chmod() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().unwrap();
        let (applier, _) = applier(&dir, "beta");
        let file = dir.path().join("f");
        fs::write(&file, b"x").unwrap();

        let msg = WireMessage::new("alpha", "f", FileOp::Chmod { mode: 0o600 });
        assert!(applier.apply(msg).await.is_applied());
        assert_eq!(fs::metadata(&file).unwrap().permissions().mode() & 0o7777, 0o600);
    }

    #[tokio::test]
    async fn test_traversal_rejected() {
        let dir = TempDir::new().unwrap();
        let (applier, lock) = applier(&dir, "beta");

        let outcome = applier.apply(write_msg("alpha", "../escape.txt", b"x")).await;
        assert!(matches!(outcome, ApplyOutcome::Failed(_)));
        assert!(lock.is_empty());

        let moved = WireMessage::new("alpha", "inside", FileOp::Move { from: "/etc/passwd".into() });
        assert!(matches!(applier.apply(moved).await, ApplyOutcome::Failed(_)));
    }

    #[tokio::test]
    async fn test_created_parents_are_echo_locked() {
        let dir = TempDir::new().unwrap();
        let (applier, lock) = applier(&dir, "beta");

        let outcome = applier.apply(write_msg("alpha", "nested/deeper/f.txt", b"x")).await;
        assert_eq!(outcome, ApplyOutcome::Applied);

        let nested = dir.path().join("nested");
        assert!(nested.is_dir());
        assert!(lock.is_locked(&nested));
        assert!(lock.is_locked(&dir.path().join("nested/deeper")));
        assert!(!lock.is_locked(dir.path()));

        // The watcher's report of the new parent is swallowed
        let coalescer = crate::coalescer::Coalescer::new(lock.clone());
        assert!(!coalescer.record(mfs_core::ChangeEvent::new(
            &nested,
            mfs_core::Operation::Create
        )));
    }

    #[test]
    fn test_missing_ancestors_stop_at_existing() {
        let dir = TempDir::new().unwrap();
        fs::create_dir(dir.path().join("a")).unwrap();

        let missing = missing_ancestors(dir.path(), &dir.path().join("a/b/c/f"));
        assert_eq!(
            missing,
            vec![dir.path().join("a/b/c"), dir.path().join("a/b")]
        );
        assert!(missing_ancestors(dir.path(), &dir.path().join("f")).is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_symlinked_parent_not_followed() {
        let dir = TempDir::new().unwrap();
        let outside = TempDir::new().unwrap();
        let (applier, _) = applier(&dir, "beta");

        let link = WireMessage::new(
            "alpha",
            "evil",
            FileOp::Symlink {
                target: outside.path().display().to_string(),
            },
        );
        assert_eq!(applier.apply(link).await, ApplyOutcome::Applied);

        let outcome = applier.apply(write_msg("alpha", "evil/pwned.txt", b"x")).await;
        assert!(matches!(outcome, ApplyOutcome::Failed(_)));
        assert!(!outside.path().join("pwned.txt").exists());

        let (uid, gid) = owner();
        let mkdir = WireMessage::new(
            "alpha",
            "evil/sub",
            FileOp::CreateDir {
                mode: 0o755,
                uid,
                gid,
            },
        );
        assert!(matches!(applier.apply(mkdir).await, ApplyOutcome::Failed(_)));
        assert!(!outside.path().join("sub").exists());

        // The link itself can still be removed
        let remove = WireMessage::new("alpha", "evil", FileOp::Remove);
        assert_eq!(applier.apply(remove).await, ApplyOutcome::Applied);
        assert!(outside.path().exists());
    }

    #[tokio::test]
    async fn test_retry_relocks_each_attempt() {
        let dir = TempDir::new().unwrap();
        let lock = EchoLock::new(Duration::from_millis(20));
        let applier = Applier::new("beta", dir.path(), lock.clone())
            .with_retry(RetryPolicy::new(3, Duration::from_millis(60)));
        let path = dir.path().join("slow.txt");

        let mut locked_at_attempt = Vec::new();
        let result = applier
            .retry_locked(&path, None, "slow.txt", || {
                locked_at_attempt.push(lock.is_locked(&path));
                let attempt = locked_at_attempt.len();
                async move {
                    if attempt < 3 {
                        Err(ApplyError::io(
                            "write",
                            Path::new("slow.txt"),
                            io::Error::new(io::ErrorKind::Interrupted, "eintr"),
                        ))
                    } else {
                        Ok(())
                    }
                }
            })
            .await;

        assert!(result.is_ok());
        // Each backoff outlasts the lock TTL
        assert_eq!(locked_at_attempt, vec![true, true, true]);
    }

    #[tokio::test]
    async fn test_retry_gives_up_on_permanent_error() {
        let dir = TempDir::new().unwrap();
        let (applier, _) = applier(&dir, "beta");
        let applier = applier.with_retry(RetryPolicy::new(5, Duration::from_millis(1)));

        let mut attempts = 0;
        let result = applier
            .retry_locked(&dir.path().join("f"), None, "f", || {
                attempts += 1;
                async {
                    Err(ApplyError::io(
                        "write",
                        Path::new("f"),
                        io::Error::new(io::ErrorKind::PermissionDenied, "eperm"),
                    ))
                }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(attempts, 1);
    }

    #[tokio::test]
    async fn test_undecodable_payload() {
        let dir = TempDir::new().unwrap();
        let (applier, _) = applier(&dir, "beta");
        assert!(matches!(
            applier.handle_payload("not json").await,
            ApplyOutcome::Failed(_)
        ));
    }

    #[test]
    fn test_retry_policy() {
        let policy = RetryPolicy::new(0, Duration::from_millis(100));
        assert_eq!(policy.max_attempts, 1);

        let policy = RetryPolicy::new(4, Duration::from_millis(100));
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(400));
        assert_eq!(policy.delay_for(30), Duration::from_secs(5));
    }

    #[test]
    fn test_transient_classification() {
        let transient = ApplyError::io(
            "write",
            Path::new("/x"),
            io::Error::new(io::ErrorKind::Interrupted, "eintr"),
        );
        assert!(transient.is_transient());

        let permanent = ApplyError::io(
            "write",
            Path::new("/x"),
            io::Error::new(io::ErrorKind::PermissionDenied, "eperm"),
        );
        assert!(!permanent.is_transient());
    }
}
