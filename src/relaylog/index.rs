use crate::relaylog::errors::io_error;
use crate::relaylog::RelayLogError;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

/// The `<basename>.index` file: live segment names, oldest first, one per line.
pub(super) struct SegmentIndex {
    dir: PathBuf,
    basename: String,
    path: PathBuf,
    names: Vec<String>,
}

impl SegmentIndex {
    pub(super) fn load(dir: &Path, basename: &str) -> Result<Self, RelayLogError> {
        let path = dir.join(format!("{}.index", basename));
        let names = match fs::read_to_string(&path) {
            Ok(content) => content
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty())
                .map(String::from)
                .collect(),
            Err(e) if e.kind() == io::ErrorKind::NotFound => vec![],
            Err(e) => return Err(io_error(&path)(e)),
        };

        Ok(SegmentIndex {
            dir: dir.to_path_buf(),
            basename: basename.to_string(),
            path,
            names,
        })
    }

    pub(super) fn names(&self) -> &[String] {
        &self.names
    }

    pub(super) fn first(&self) -> Option<&str> {
        self.names.first().map(String::as_str)
    }

    pub(super) fn position_of(&self, name: &str) -> Option<usize> {
        self.names.iter().position(|n| n == name)
    }

    pub(super) fn next_after(&self, name: &str) -> Option<&str> {
        let i = self.position_of(name)?;
        self.names.get(i + 1).map(String::as_str)
    }

    /// Name for the next segment: one past the highest sequence ever listed.
    pub(super) fn next_name(&self) -> String {
        let prefix = format!("{}.", self.basename);
        let highest = self
            .names
            .iter()
            .filter_map(|name| name.strip_prefix(&prefix))
            .filter_map(|sequence| sequence.parse::<u64>().ok())
            .max()
            .unwrap_or(0);

        format!("{}.{:06}", self.basename, highest + 1)
    }

    pub(super) fn push(&mut self, name: String) -> Result<(), RelayLogError> {
        self.names.push(name);
        self.persist()
    }

    /// Drops the first `count` names and returns them.
    pub(super) fn remove_first(&mut self, count: usize) -> Result<Vec<String>, RelayLogError> {
        let removed = self.names.drain(..count).collect();
        self.persist()?;
        Ok(removed)
    }

    pub(super) fn retain(&mut self, keep: impl FnMut(&String) -> bool) -> Result<(), RelayLogError> {
        self.names.retain(keep);
        self.persist()
    }

    fn persist(&self) -> Result<(), RelayLogError> {
        let tmp_path = self.path.with_extension("index.tmp");
        let mut content = self.names.join("\n");
        content.push('\n');

        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp_path)
            .map_err(io_error(&tmp_path))?;
        file.write_all(content.as_bytes()).map_err(io_error(&tmp_path))?;
        file.sync_all().map_err(io_error(&tmp_path))?;
        fs::rename(&tmp_path, &self.path).map_err(io_error(&self.path))?;

        if let Ok(dir) = File::open(&self.dir) {
            let _ = dir.sync_all();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_survive_reload() {
        // -- setup --
        let dir = tempfile::tempdir().unwrap();
        let mut index = SegmentIndex::load(dir.path(), "relay").unwrap();
        assert_eq!(index.next_name(), "relay.000001");

        // -- execute --
        index.push(index.next_name()).unwrap();
        index.push(index.next_name()).unwrap();
        index.push(index.next_name()).unwrap();
        let removed = index.remove_first(1).unwrap();

        // -- verify --
        assert_eq!(removed, vec!["relay.000001".to_string()]);
        let reloaded = SegmentIndex::load(dir.path(), "relay").unwrap();
        assert_eq!(reloaded.names(), &["relay.000002".to_string(), "relay.000003".to_string()]);
        assert_eq!(reloaded.next_after("relay.000002"), Some("relay.000003"));
        assert_eq!(reloaded.next_after("relay.000003"), None);
        // Sequence numbers are never reused, even after the oldest segment is gone.
        assert_eq!(reloaded.next_name(), "relay.000004");
    }
}
