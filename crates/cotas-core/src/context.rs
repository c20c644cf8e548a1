use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use anyhow::Context as _;
use tokio::sync::{Mutex, RwLock};
use tracing::debug;

use cotas_types::{Context, DatasetMeta, Session, TranscriptEntry};

const SESSIONS_INDEX: &str = "sessions.json";
const CONTEXT_FILE: &str = "context.json";
const SESSION_SUBDIRS: [&str; 3] = ["datasets", "scripts", "results"];

/// Append-only, file-backed store of session state. Each session owns a
/// directory under the storage root:
///
/// ```text
/// <root>/<session-id>/
///     context.json      transcript + dataset metadata
///     datasets/         uploaded data files
///     scripts/          generated code, one file per ACT step
///     results/          captured execution output
/// ```
///
/// Writes go through a per-session mutex and land via temp-file rename,
/// so a crash mid-write leaves the previous context intact.
pub struct ContextStore {
    base: PathBuf,
    sessions: RwLock<HashMap<String, Session>>,
    locks: RwLock<HashMap<String, Arc<Mutex<()>>>>,
}

impl ContextStore {
    pub async fn new(base: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let base = base.into();
        tokio::fs::create_dir_all(&base)
            .await
            .with_context(|| format!("creating storage root {}", base.display()))?;

        let index_path = base.join(SESSIONS_INDEX);
        let sessions = match tokio::fs::read_to_string(&index_path).await {
            Ok(raw) => {
                let list: Vec<Session> = serde_json::from_str(&raw)
                    .with_context(|| format!("parsing {}", index_path.display()))?;
                list.into_iter().map(|s| (s.id.clone(), s)).collect()
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(err) => return Err(err).context("reading session index"),
        };

        Ok(Self {
            base,
            sessions: RwLock::new(sessions),
            locks: RwLock::new(HashMap::new()),
        })
    }

    pub fn base_dir(&self) -> &Path {
        &self.base
    }

    pub fn session_dir(&self, session_id: &str) -> PathBuf {
        self.base.join(session_id)
    }

    pub async fn create_session(&self, title: &str) -> anyhow::Result<Session> {
        let title = (!title.trim().is_empty()).then(|| title.trim().to_string());
        let session = Session::new(title, self.base.display().to_string());
        let dir = self.session_dir(&session.id);

        for sub in SESSION_SUBDIRS {
            tokio::fs::create_dir_all(dir.join(sub))
                .await
                .with_context(|| format!("scaffolding session {}", session.id))?;
        }

        let context = Context {
            session_id: session.id.clone(),
            ..Context::default()
        };
        write_atomic(&dir.join(CONTEXT_FILE), &serde_json::to_vec_pretty(&context)?).await?;

        self.sessions
            .write()
            .await
            .insert(session.id.clone(), session.clone());
        self.flush_index().await?;

        debug!(session_id = %session.id, "session created");
        Ok(session)
    }

    pub async fn get_session(&self, session_id: &str) -> Option<Session> {
        self.sessions.read().await.get(session_id).cloned()
    }

    pub async fn list_sessions(&self) -> Vec<Session> {
        let mut sessions: Vec<Session> = self.sessions.read().await.values().cloned().collect();
        sessions.sort_by(|a, b| b.time.created.cmp(&a.time.created));
        sessions
    }

    pub async fn read(&self, session_id: &str) -> anyhow::Result<Context> {
        let path = self.session_dir(session_id).join(CONTEXT_FILE);
        let raw = tokio::fs::read_to_string(&path)
            .await
            .with_context(|| format!("reading context for session {session_id}"))?;
        serde_json::from_str(&raw).with_context(|| format!("parsing {}", path.display()))
    }

    /// Append one transcript entry. Entries already present are never
    /// rewritten or reordered.
    pub async fn append(&self, session_id: &str, entry: TranscriptEntry) -> anyhow::Result<()> {
        let lock = self.session_lock(session_id).await;
        let _guard = lock.lock().await;

        let mut context = self.read(session_id).await?;
        context.history.push(entry);
        self.write_context(session_id, &context).await?;
        self.touch(session_id).await;
        Ok(())
    }

    pub async fn register_dataset(
        &self,
        session_id: &str,
        meta: DatasetMeta,
    ) -> anyhow::Result<()> {
        let lock = self.session_lock(session_id).await;
        let _guard = lock.lock().await;

        let mut context = self.read(session_id).await?;
        context.datasets.retain(|d| d.name != meta.name);
        context.datasets.push(meta);
        self.write_context(session_id, &context).await?;
        self.touch(session_id).await;
        Ok(())
    }

    /// Write an auxiliary file (script, result capture, run log) inside
    /// the session directory. `relative` must stay inside the session dir.
    pub async fn write_artifact(
        &self,
        session_id: &str,
        relative: &str,
        contents: &str,
    ) -> anyhow::Result<PathBuf> {
        let rel = Path::new(relative);
        let escapes = rel.components().any(|c| {
            matches!(
                c,
                Component::ParentDir | Component::RootDir | Component::Prefix(_)
            )
        });
        if escapes {
            anyhow::bail!("artifact path `{relative}` escapes the session directory");
        }

        let lock = self.session_lock(session_id).await;
        let _guard = lock.lock().await;

        let path = self.session_dir(session_id).join(rel);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        write_atomic(&path, contents.as_bytes()).await?;
        Ok(path)
    }

    async fn write_context(&self, session_id: &str, context: &Context) -> anyhow::Result<()> {
        let path = self.session_dir(session_id).join(CONTEXT_FILE);
        write_atomic(&path, &serde_json::to_vec_pretty(context)?).await
    }

    async fn session_lock(&self, session_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.write().await;
        locks
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    async fn touch(&self, session_id: &str) {
        if let Some(session) = self.sessions.write().await.get_mut(session_id) {
            session.time.updated = chrono::Utc::now();
        }
    }

    async fn flush_index(&self) -> anyhow::Result<()> {
        let sessions: Vec<Session> = self.sessions.read().await.values().cloned().collect();
        let path = self.base.join(SESSIONS_INDEX);
        write_atomic(&path, &serde_json::to_vec_pretty(&sessions)?).await
    }
}

async fn write_atomic(path: &Path, contents: &[u8]) -> anyhow::Result<()> {
    let tmp = path.with_extension("tmp");
    tokio::fs::write(&tmp, contents)
        .await
        .with_context(|| format!("writing {}", tmp.display()))?;
    tokio::fs::rename(&tmp, path)
        .await
        .with_context(|| format!("replacing {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use cotas_types::{ColumnMeta, TurnKind};

    async fn store() -> (tempfile::TempDir, ContextStore) {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = ContextStore::new(dir.path()).await.expect("store");
        (dir, store)
    }

    #[tokio::test]
    async fn create_session_scaffolds_directories() {
        let (_dir, store) = store().await;
        let session = store.create_session("quarterly revenue").await.expect("session");
        let base = store.session_dir(&session.id);
        for sub in ["datasets", "scripts", "results"] {
            assert!(base.join(sub).is_dir(), "missing {sub}/");
        }
        assert!(base.join("context.json").is_file());
    }

    #[tokio::test]
    async fn append_preserves_existing_entries_as_prefix() {
        let (_dir, store) = store().await;
        let session = store.create_session("t").await.expect("session");

        store
            .append(&session.id, TranscriptEntry::new(TurnKind::User, "goal"))
            .await
            .expect("append");
        let before = store.read(&session.id).await.expect("read");

        store
            .append(
                &session.id,
                TranscriptEntry::for_step(1, TurnKind::Think, "hmm"),
            )
            .await
            .expect("append");
        let after = store.read(&session.id).await.expect("read");

        assert_eq!(after.history.len(), before.history.len() + 1);
        for (a, b) in before.history.iter().zip(after.history.iter()) {
            assert_eq!(a.payload, b.payload);
            assert_eq!(a.kind, b.kind);
        }
        assert_eq!(after.history.last().map(|e| e.payload.as_str()), Some("hmm"));
    }

    #[tokio::test]
    async fn register_dataset_replaces_same_name() {
        let (_dir, store) = store().await;
        let session = store.create_session("t").await.expect("session");

        let meta = DatasetMeta {
            name: "sales.csv".into(),
            columns: vec![ColumnMeta {
                name: "region".into(),
                dtype: "string".into(),
            }],
            row_count: 10,
            sample_rows: vec![],
        };
        store
            .register_dataset(&session.id, meta.clone())
            .await
            .expect("register");

        let updated = DatasetMeta {
            row_count: 20,
            ..meta
        };
        store
            .register_dataset(&session.id, updated)
            .await
            .expect("register");

        let context = store.read(&session.id).await.expect("read");
        assert_eq!(context.datasets.len(), 1);
        assert_eq!(context.datasets[0].row_count, 20);
    }

    #[tokio::test]
    async fn write_artifact_rejects_escaping_paths() {
        let (_dir, store) = store().await;
        let session = store.create_session("t").await.expect("session");
        let err = store
            .write_artifact(&session.id, "../outside.txt", "nope")
            .await
            .expect_err("must reject");
        assert!(err.to_string().contains("escapes"));
    }

    #[tokio::test]
    async fn write_artifact_lands_in_session_dir() {
        let (_dir, store) = store().await;
        let session = store.create_session("t").await.expect("session");
        let path = store
            .write_artifact(&session.id, "scripts/act_001.py", "print(1)")
            .await
            .expect("write");
        assert!(path.starts_with(store.session_dir(&session.id)));
        let raw = tokio::fs::read_to_string(&path).await.expect("read back");
        assert_eq!(raw, "print(1)");
    }

    #[tokio::test]
    async fn sessions_survive_store_reopen() {
        let dir = tempfile::tempdir().expect("tempdir");
        let id = {
            let store = ContextStore::new(dir.path()).await.expect("store");
            store.create_session("persisted").await.expect("session").id
        };
        let reopened = ContextStore::new(dir.path()).await.expect("store");
        let session = reopened.get_session(&id).await.expect("session survives");
        assert_eq!(session.title.as_deref(), Some("persisted"));
    }

    #[tokio::test]
    async fn read_unknown_session_is_an_error() {
        let (_dir, store) = store().await;
        assert!(store.read("no-such-session").await.is_err());
    }
}
