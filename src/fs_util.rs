use std::fs::{self, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use camino::Utf8Path;
use md5::Md5;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};
use zip::ZipArchive;

use crate::error::OneError;

pub const LOCK_FILE: &str = ".cache.lock";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockSettings {
    /// How long a writer polls an existing lock before considering it abandoned.
    pub timeout: Duration,
    pub poll_interval: Duration,
    /// Minimum lock age for it to be removed once the timeout has elapsed.
    pub stale_after: Duration,
}

impl Default for LockSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            poll_interval: Duration::from_millis(100),
            stale_after: Duration::from_secs(30),
        }
    }
}

/// Removes the lock file when dropped.
#[derive(Debug)]
pub struct LockGuard {
    path: PathBuf,
}

impl LockGuard {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Err(err) = fs::remove_file(&self.path) {
            if err.kind() != io::ErrorKind::NotFound {
                warn!(path = %self.path.display(), "failed to release cache lock: {err}");
            }
        }
    }
}

pub fn acquire_lock(dir: &Path, settings: &LockSettings) -> Result<LockGuard, OneError> {
    fs::create_dir_all(dir).map_err(|err| OneError::Filesystem(err.to_string()))?;
    let path = dir.join(LOCK_FILE);
    let start = Instant::now();
    loop {
        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(mut file) => {
                let _ = writeln!(file, "{}", std::process::id());
                return Ok(LockGuard { path });
            }
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
                if start.elapsed() < settings.timeout {
                    thread::sleep(settings.poll_interval);
                    continue;
                }
                let stale = lock_age(&path).is_none_or(|age| age >= settings.stale_after);
                if !stale {
                    return Err(OneError::CacheLocked(dir.to_path_buf()));
                }
                warn!(path = %path.display(), "removing stale cache lock");
                match fs::remove_file(&path) {
                    Ok(()) => continue,
                    Err(err) if err.kind() == io::ErrorKind::NotFound => continue,
                    Err(err) => return Err(OneError::Filesystem(err.to_string())),
                }
            }
            Err(err) => return Err(OneError::Filesystem(err.to_string())),
        }
    }
}

fn lock_age(path: &Path) -> Option<Duration> {
    let modified = fs::metadata(path).and_then(|meta| meta.modified()).ok()?;
    Some(modified.elapsed().unwrap_or(Duration::ZERO))
}

/// Writes `content` beside `path` and renames it into place.
pub fn write_atomic(path: &Utf8Path, content: &[u8]) -> Result<(), OneError> {
    let parent = path
        .parent()
        .ok_or_else(|| OneError::Filesystem(format!("invalid destination path {path}")))?;
    fs::create_dir_all(parent.as_std_path())
        .map_err(|err| OneError::Filesystem(err.to_string()))?;
    let mut temp = tempfile::Builder::new()
        .prefix(".one-write")
        .tempfile_in(parent.as_std_path())
        .map_err(|err| OneError::Filesystem(err.to_string()))?;
    temp.write_all(content)
        .map_err(|err| OneError::Filesystem(err.to_string()))?;
    temp.as_file()
        .sync_all()
        .map_err(|err| OneError::Filesystem(err.to_string()))?;
    temp.persist(path.as_std_path())
        .map_err(|err| OneError::Filesystem(err.to_string()))?;
    debug!(%path, bytes = content.len(), "wrote file");
    Ok(())
}

/// Digest algorithm of a catalog hash, told apart by its hex length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashKind {
    Md5,
    Sha256,
}

impl HashKind {
    pub fn of_hex(digest: &str) -> Option<Self> {
        if !digest.chars().all(|ch| ch.is_ascii_hexdigit()) {
            return None;
        }
        match digest.len() {
            32 => Some(HashKind::Md5),
            64 => Some(HashKind::Sha256),
            _ => None,
        }
    }
}

pub fn hash_file(path: &Path, kind: HashKind) -> Result<String, OneError> {
    match kind {
        HashKind::Md5 => digest_file::<Md5>(path),
        HashKind::Sha256 => digest_file::<Sha256>(path),
    }
}

/// Compares a file against a catalog digest. `None` when the digest is in an unknown
/// format.
pub fn matches_hash(path: &Path, expected: &str) -> Result<Option<bool>, OneError> {
    let Some(kind) = HashKind::of_hex(expected) else {
        return Ok(None);
    };
    let actual = hash_file(path, kind)?;
    Ok(Some(actual.eq_ignore_ascii_case(expected)))
}

fn digest_file<D: Digest>(path: &Path) -> Result<String, OneError> {
    let mut file = fs::File::open(path)
        .map_err(|err| OneError::Filesystem(format!("open {}: {err}", path.display())))?;
    let mut hasher = D::new();
    let mut buffer = [0u8; 64 * 1024];
    loop {
        let read = file
            .read(&mut buffer)
            .map_err(|err| OneError::Filesystem(err.to_string()))?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Moves `names` from `source` into `target` as one unit. Files already in `target` are
/// set aside first and put back if any move fails.
pub fn install_files(source: &Utf8Path, target: &Utf8Path, names: &[String]) -> Result<(), OneError> {
    fs::create_dir_all(target.as_std_path())
        .map_err(|err| OneError::Filesystem(err.to_string()))?;
    let backup = |name: &str| target.join(format!("{name}.bak"));

    let mut set_aside = Vec::new();
    let mut installed = Vec::new();
    let outcome = names.iter().try_for_each(|name| {
        let destination = target.join(name);
        if fs::symlink_metadata(destination.as_std_path()).is_ok() {
            fs::rename(destination.as_std_path(), backup(name).as_std_path())
                .map_err(|err| OneError::Filesystem(format!("set aside {name}: {err}")))?;
            set_aside.push(name.as_str());
        }
        fs::rename(source.join(name).as_std_path(), destination.as_std_path())
            .map_err(|err| OneError::Filesystem(format!("install {name}: {err}")))?;
        installed.push(name.as_str());
        Ok(())
    });

    if let Err(err) = outcome {
        for name in &installed {
            if let Err(remove) = fs::remove_file(target.join(name).as_std_path()) {
                warn!(%target, name, "failed to remove partially installed file: {remove}");
            }
        }
        for name in &set_aside {
            if let Err(restore) =
                fs::rename(backup(name).as_std_path(), target.join(name).as_std_path())
            {
                warn!(%target, name, "failed to restore previous file: {restore}");
            }
        }
        return Err(err);
    }

    for name in &set_aside {
        let path = backup(name);
        let removed = if path.as_std_path().is_dir() {
            fs::remove_dir_all(path.as_std_path())
        } else {
            fs::remove_file(path.as_std_path())
        };
        if let Err(err) = removed {
            debug!(%path, "failed to remove replaced file: {err}");
        }
    }
    Ok(())
}

pub fn extract_zip(zip_path: &Path, target_dir: &Path) -> Result<Vec<PathBuf>, OneError> {
    let file = fs::File::open(zip_path)
        .map_err(|err| OneError::Filesystem(format!("open zip {}: {err}", zip_path.display())))?;
    let mut archive =
        ZipArchive::new(file).map_err(|err| OneError::Filesystem(err.to_string()))?;

    let mut written = Vec::new();
    for i in 0..archive.len() {
        let mut entry = archive
            .by_index(i)
            .map_err(|err| OneError::Filesystem(err.to_string()))?;
        let entry_path = match entry.enclosed_name() {
            Some(path) => target_dir.join(path),
            None => {
                return Err(OneError::Filesystem(
                    "zip entry path traversal detected".to_string(),
                ));
            }
        };

        if entry.is_dir() {
            fs::create_dir_all(&entry_path)
                .map_err(|err| OneError::Filesystem(err.to_string()))?;
            continue;
        }

        if let Some(parent) = entry_path.parent() {
            fs::create_dir_all(parent).map_err(|err| OneError::Filesystem(err.to_string()))?;
        }
        let mut outfile =
            fs::File::create(&entry_path).map_err(|err| OneError::Filesystem(err.to_string()))?;
        io::copy(&mut entry, &mut outfile).map_err(|err| OneError::Filesystem(err.to_string()))?;
        written.push(entry_path);
    }
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digests_of_empty_file() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("empty.npy");
        fs::write(&path, b"").unwrap();
        assert_eq!(
            hash_file(&path, HashKind::Sha256).unwrap(),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
        assert_eq!(
            hash_file(&path, HashKind::Md5).unwrap(),
            "d41d8cd98f00b204e9800998ecf8427e"
        );
        assert_eq!(
            matches_hash(&path, "D41D8CD98F00B204E9800998ECF8427E").unwrap(),
            Some(true)
        );
        assert_eq!(
            matches_hash(&path, "d41d8cda454aaaa4e9800998ecf8497e").unwrap(),
            Some(false)
        );
        assert_eq!(matches_hash(&path, "not-a-digest").unwrap(), None);
    }

    fn utf8(path: &Path) -> &Utf8Path {
        Utf8Path::from_path(path).unwrap()
    }

    fn names() -> Vec<String> {
        vec!["sessions.json".to_string(), "datasets.json".to_string()]
    }

    #[test]
    fn install_replaces_every_file() {
        let temp = tempfile::tempdir().unwrap();
        let (source, target) = (temp.path().join("new"), temp.path().join("tables"));
        fs::create_dir_all(&source).unwrap();
        fs::create_dir_all(&target).unwrap();
        for name in names() {
            fs::write(source.join(&name), b"new").unwrap();
            fs::write(target.join(&name), b"old").unwrap();
        }

        install_files(utf8(&source), utf8(&target), &names()).unwrap();
        for name in names() {
            assert_eq!(fs::read(target.join(&name)).unwrap(), b"new");
            assert!(!target.join(format!("{name}.bak")).exists());
        }
    }

    #[test]
    fn failed_install_restores_previous_files() {
        let temp = tempfile::tempdir().unwrap();
        let (source, target) = (temp.path().join("new"), temp.path().join("tables"));
        fs::create_dir_all(&source).unwrap();
        fs::create_dir_all(&target).unwrap();
        // second file never arrives
        fs::write(source.join("sessions.json"), b"new").unwrap();
        for name in names() {
            fs::write(target.join(&name), b"old").unwrap();
        }

        let err = install_files(utf8(&source), utf8(&target), &names()).unwrap_err();
        assert!(matches!(err, OneError::Filesystem(message) if message.contains("datasets.json")));
        for name in names() {
            assert_eq!(fs::read(target.join(&name)).unwrap(), b"old");
            assert!(!target.join(format!("{name}.bak")).exists());
        }
    }

    #[test]
    fn lock_released_on_drop() {
        let temp = tempfile::tempdir().unwrap();
        let guard = acquire_lock(temp.path(), &LockSettings::default()).unwrap();
        assert!(guard.path().exists());
        let path = guard.path().to_path_buf();
        drop(guard);
        assert!(!path.exists());
    }
}
