//! On-disk fallback for records a target could not take.
//!
//! The spill file `<base>-<kind>-<target>` holds rendered records, one per
//! line, and is replayed once when the target's pool starts. Records the
//! backend refused go to `<spill file>-errors` and are never replayed.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{error, info};

#[derive(Debug)]
pub struct SpillFile {
    path: PathBuf,
    errors_path: PathBuf,
    write_lock: Mutex<()>,
}

impl SpillFile {
    pub fn new(base: &Path, kind: &str, target: &str) -> Self {
        let path = PathBuf::from(format!("{}-{}-{}", base.display(), kind, target));
        let errors_path = PathBuf::from(format!("{}-errors", path.display()));
        Self {
            path,
            errors_path,
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn errors_path(&self) -> &Path {
        &self.errors_path
    }

    /// Append records, each ending with exactly one newline. Returns the
    /// number of records written.
    pub async fn append(&self, records: &[String]) -> std::io::Result<usize> {
        let buf = join_records(records);
        if buf.is_empty() {
            return Ok(0);
        }

        let _guard = self.write_lock.lock().await;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(buf.as_bytes()).await?;
        file.flush().await?;
        Ok(records.iter().filter(|r| !r.trim().is_empty()).count())
    }

    /// Read the whole spill file and delete it. `None` when there is
    /// nothing to replay.
    pub async fn take(&self) -> std::io::Result<Option<String>> {
        let _guard = self.write_lock.lock().await;
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e),
        };
        tokio::fs::remove_file(&self.path).await?;

        if content.trim().is_empty() {
            return Ok(None);
        }
        info!(path = %self.path.display(), bytes = content.len(), "Replaying spill file");
        Ok(Some(content))
    }

    /// Append refused records under a header line. Failures are logged
    /// and otherwise ignored.
    pub async fn dump_errors(&self, target: &str, reason: &str, records: &[String]) {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        let reason = reason.replace('\n', " ");
        let mut buf = format!("# time={} target={} error={}\n", now, target, reason);
        buf.push_str(&join_records(records));

        let _guard = self.write_lock.lock().await;
        let result = async {
            let mut file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.errors_path)
                .await?;
            file.write_all(buf.as_bytes()).await?;
            file.flush().await
        }
        .await;

        if let Err(e) = result {
            error!(
                path = %self.errors_path.display(),
                error = %e,
                "Could not write error dump"
            );
        }
    }
}

fn join_records(records: &[String]) -> String {
    let mut buf = String::new();
    for record in records {
        let record = record.trim_end_matches(['\n', '\r']);
        if record.trim().is_empty() {
            continue;
        }
        buf.push_str(record);
        buf.push('\n');
    }
    buf
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn spill(dir: &TempDir) -> SpillFile {
        SpillFile::new(&dir.path().join("dump"), "influxdb", "primary")
    }

    #[test]
    fn file_names_follow_kind_and_target() {
        let spill = SpillFile::new(Path::new("/var/lib/perfflux/dump"), "elasticsearch", "es1");
        assert_eq!(
            spill.path(),
            Path::new("/var/lib/perfflux/dump-elasticsearch-es1")
        );
        assert_eq!(
            spill.errors_path(),
            Path::new("/var/lib/perfflux/dump-elasticsearch-es1-errors")
        );
    }

    #[tokio::test]
    async fn appends_never_overwrite() {
        let dir = TempDir::new().unwrap();
        let spill = spill(&dir);

        assert_eq!(spill.append(&["a 1".into(), "b 2\n".into()]).await.unwrap(), 2);
        assert_eq!(spill.append(&["c 3\n\n".into(), "".into()]).await.unwrap(), 1);

        let content = std::fs::read_to_string(spill.path()).unwrap();
        assert_eq!(content, "a 1\nb 2\nc 3\n");
    }

    #[tokio::test]
    async fn take_reads_and_deletes() {
        let dir = TempDir::new().unwrap();
        let spill = spill(&dir);

        assert_eq!(spill.take().await.unwrap(), None);

        spill.append(&["a 1".into()]).await.unwrap();
        assert_eq!(spill.take().await.unwrap(), Some("a 1\n".to_string()));
        assert!(!spill.path().exists());
        assert_eq!(spill.take().await.unwrap(), None);
    }

    #[tokio::test]
    async fn empty_spill_file_is_removed() {
        let dir = TempDir::new().unwrap();
        let spill = spill(&dir);
        std::fs::write(spill.path(), "\n").unwrap();

        assert_eq!(spill.take().await.unwrap(), None);
        assert!(!spill.path().exists());
    }

    #[tokio::test]
    async fn error_dump_has_header() {
        let dir = TempDir::new().unwrap();
        let spill = spill(&dir);

        spill
            .dump_errors("primary", "unable to parse\n'x'", &["bad line".into()])
            .await;

        let content = std::fs::read_to_string(spill.errors_path()).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("# time="));
        assert!(lines[0].ends_with("target=primary error=unable to parse 'x'"));
        assert_eq!(lines[1], "bad line");
        // Never replayed.
        assert_eq!(spill.take().await.unwrap(), None);
    }

    #[tokio::test]
    async fn error_dump_failure_is_swallowed() {
        let spill = SpillFile::new(Path::new("/nonexistent/dir/dump"), "influxdb", "x");
        spill.dump_errors("x", "boom", &["r".into()]).await;
    }
}
