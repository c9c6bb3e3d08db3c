//! [`LocalStore`] adapters: in-memory and one-JSON-file-per-key.

use std::collections::HashMap;
use std::fs;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::Mutex;

use anyhow::Context;

use crate::application::lock;
use crate::application::ports::LocalStore;
use crate::domain::member::Member;

/// Simple in-memory store.
#[derive(Default)]
pub struct InMemoryStore {
    entries: Mutex<HashMap<String, String>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LocalStore for InMemoryStore {
    fn load(&self, key: &str) -> anyhow::Result<Option<Member>> {
        lock(&self.entries)
            .get(key)
            .map(|json| serde_json::from_str(json))
            .transpose()
            .map_err(Into::into)
    }

    fn save(&self, key: &str, member: &Member) -> anyhow::Result<()> {
        let json = serde_json::to_string(member)?;
        lock(&self.entries).insert(key.to_string(), json);
        Ok(())
    }
}

/// Stores each key as `<dir>/<key>.json`.
pub struct JsonFileStore {
    dir: PathBuf,
}

impl JsonFileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.json"))
    }
}

impl LocalStore for JsonFileStore {
    fn load(&self, key: &str) -> anyhow::Result<Option<Member>> {
        let path = self.path(key);
        let json = match fs::read_to_string(&path) {
            Ok(json) => json,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(e).with_context(|| format!("reading {}", path.display()));
            }
        };
        let member = serde_json::from_str(&json)
            .with_context(|| format!("parsing {}", path.display()))?;
        Ok(Some(member))
    }

    fn save(&self, key: &str, member: &Member) -> anyhow::Result<()> {
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("creating {}", self.dir.display()))?;
        let path = self.path(key);
        let json = serde_json::to_vec_pretty(member)?;
        // Write-then-rename; readers never see a torn file.
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, json).with_context(|| format!("writing {}", tmp.display()))?;
        fs::rename(&tmp, &path).with_context(|| format!("replacing {}", path.display()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::member::{MemberId, VoiceStatus};

    fn member() -> Member {
        let mut m = Member::new(MemberId::new("a"), "Alice", 7);
        m.game = Some("chess".into());
        m.voice_status = VoiceStatus::Speaking;
        m
    }

    #[test]
    fn in_memory_round_trip() {
        let store = InMemoryStore::new();
        assert!(store.load("k").unwrap().is_none());
        store.save("k", &member()).unwrap();
        assert_eq!(store.load("k").unwrap(), Some(member()));
    }

    #[test]
    fn file_store_survives_a_new_instance() {
        let dir = tempfile::tempdir().unwrap();
        JsonFileStore::new(dir.path()).save("huddle.local_member", &member()).unwrap();

        let reopened = JsonFileStore::new(dir.path());
        assert_eq!(reopened.load("huddle.local_member").unwrap(), Some(member()));
        assert!(reopened.load("other").unwrap().is_none());
    }

    #[test]
    fn corrupt_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("k.json"), "{").unwrap();
        assert!(JsonFileStore::new(dir.path()).load("k").is_err());
    }
}
