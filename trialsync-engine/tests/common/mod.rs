//! In-memory registry and workspace fixtures shared by the engine tests.
#![allow(dead_code)]

use std::cell::{Cell, RefCell};
use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use serde_json::{json, Value};
use tempfile::TempDir;

use trialsync_core::{ConcurrencyToken, RegistryId, SyncConfig};
use trialsync_engine::allocator::{self, ProtocolEnvState};
use trialsync_engine::client::{Document, RemoteTrial, TrialQuery, TrialRegistry, LOCAL_IDS_FIELD};
use trialsync_engine::ClientError;

// ---------------------------------------------------------------------------
// Fake registry
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    Find(String),
    Create(Document),
    Replace(String, Document),
    Recompute,
    Project,
}

/// Registry double with Eve-like `_id`/`_etag` bookkeeping.
#[derive(Default)]
pub struct FakeRegistry {
    docs: RefCell<Vec<Document>>,
    next_id: Cell<u32>,
    pub calls: RefCell<Vec<Call>>,
    /// Every create/replace fails with a 500.
    pub fail_writes: Cell<bool>,
    /// This many upcoming creates fail with a 500.
    pub fail_next_creates: Cell<usize>,
    /// Every lookup fails with a transport error.
    pub fail_finds: Cell<bool>,
    pub fail_recompute: Cell<bool>,
    /// Lookups report an outdated `_etag`, so replaces conflict.
    pub stale_tokens: Cell<bool>,
}

impl FakeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a stored document; `_id` and `_etag` are assigned.
    pub fn seed(&self, fields: Value) -> String {
        let Value::Object(mut doc) = fields else {
            panic!("seed expects an object");
        };
        let id = self.mint_id();
        doc.insert("_id".into(), json!(id));
        doc.insert("_etag".into(), json!("etag-1"));
        self.docs.borrow_mut().push(doc);
        id
    }

    pub fn doc(&self, id: &str) -> Option<Document> {
        self.docs
            .borrow()
            .iter()
            .find(|d| d["_id"] == id)
            .cloned()
    }

    pub fn docs(&self) -> Vec<Document> {
        self.docs.borrow().clone()
    }

    pub fn creates(&self) -> Vec<Document> {
        self.calls
            .borrow()
            .iter()
            .filter_map(|c| match c {
                Call::Create(doc) => Some(doc.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn replaces(&self) -> Vec<(String, Document)> {
        self.calls
            .borrow()
            .iter()
            .filter_map(|c| match c {
                Call::Replace(id, doc) => Some((id.clone(), doc.clone())),
                _ => None,
            })
            .collect()
    }

    pub fn recompute_count(&self) -> usize {
        self.calls
            .borrow()
            .iter()
            .filter(|c| matches!(c, Call::Recompute))
            .count()
    }

    pub fn find_count(&self) -> usize {
        self.calls
            .borrow()
            .iter()
            .filter(|c| matches!(c, Call::Find(_)))
            .count()
    }

    fn mint_id(&self) -> String {
        let n = self.next_id.get() + 1;
        self.next_id.set(n);
        format!("doc-{n}")
    }

    fn matches(query: &TrialQuery, doc: &Document) -> bool {
        match query {
            TrialQuery::Nct(nct) => doc.get("nct_id").and_then(Value::as_str) == Some(nct.as_str()),
            TrialQuery::ProtocolNo(no) => {
                doc.get("protocol_no").and_then(Value::as_str) == Some(no.as_str())
            }
            TrialQuery::AnyLocalId(ids) => doc
                .get(LOCAL_IDS_FIELD)
                .and_then(Value::as_array)
                .is_some_and(|remote| {
                    remote
                        .iter()
                        .filter_map(Value::as_str)
                        .any(|r| ids.iter().any(|id| id == r))
                }),
        }
    }

    fn server_error() -> ClientError {
        ClientError::Status {
            status: 500,
            body: "injected failure".into(),
        }
    }
}

impl TrialRegistry for FakeRegistry {
    fn find(&self, query: &TrialQuery) -> Result<Vec<RemoteTrial>, ClientError> {
        self.calls
            .borrow_mut()
            .push(Call::Find(query.filter().to_string()));
        if self.fail_finds.get() {
            return Err(ClientError::Transport("connection refused".into()));
        }
        self.docs
            .borrow()
            .iter()
            .filter(|doc| Self::matches(query, doc))
            .map(|doc| {
                let mut doc = doc.clone();
                if self.stale_tokens.get() {
                    doc.insert("_etag".into(), json!("etag-stale"));
                }
                RemoteTrial::from_document(Value::Object(doc))
            })
            .collect()
    }

    fn create(&self, document: &Document) -> Result<Option<RegistryId>, ClientError> {
        self.calls.borrow_mut().push(Call::Create(document.clone()));
        if self.fail_writes.get() {
            return Err(Self::server_error());
        }
        let pending = self.fail_next_creates.get();
        if pending > 0 {
            self.fail_next_creates.set(pending - 1);
            return Err(Self::server_error());
        }
        let id = self.mint_id();
        let mut stored = document.clone();
        stored.insert("_id".into(), json!(id));
        stored.insert("_etag".into(), json!("etag-1"));
        self.docs.borrow_mut().push(stored);
        Ok(Some(RegistryId(id)))
    }

    fn replace(
        &self,
        id: &RegistryId,
        token: &ConcurrencyToken,
        document: &Document,
    ) -> Result<(), ClientError> {
        self.calls
            .borrow_mut()
            .push(Call::Replace(id.0.clone(), document.clone()));
        if self.fail_writes.get() {
            return Err(Self::server_error());
        }
        let mut docs = self.docs.borrow_mut();
        let Some(stored) = docs.iter_mut().find(|d| d["_id"] == id.0.as_str()) else {
            return Err(ClientError::Status {
                status: 404,
                body: String::new(),
            });
        };
        if stored["_etag"] != token.0.as_str() {
            return Err(ClientError::Conflict {
                registry_id: id.0.clone(),
                status: 412,
            });
        }
        let mut next = document.clone();
        next.insert("_id".into(), json!(id.0));
        next.insert("_etag".into(), json!("etag-2"));
        *stored = next;
        Ok(())
    }

    fn trigger_recompute(&self) -> Result<(), ClientError> {
        self.calls.borrow_mut().push(Call::Recompute);
        if self.fail_recompute.get() {
            return Err(Self::server_error());
        }
        Ok(())
    }

    fn project(&self, fields: &[&str]) -> Result<Vec<Value>, ClientError> {
        self.calls.borrow_mut().push(Call::Project);
        Ok(self
            .docs
            .borrow()
            .iter()
            .map(|doc| {
                let projected: Document = fields
                    .iter()
                    .filter_map(|f| doc.get(*f).map(|v| ((*f).to_owned(), v.clone())))
                    .collect();
                Value::Object(projected)
            })
            .collect())
    }
}

// ---------------------------------------------------------------------------
// Workspace fixture
// ---------------------------------------------------------------------------

/// A temp home with trial, archive and state directories and a config
/// pointing at them.
pub struct Workspace {
    pub home: TempDir,
    pub config: SyncConfig,
}

impl Workspace {
    pub fn new() -> Self {
        let home = TempDir::new().expect("home");
        let root = home.path();
        let mut config = SyncConfig::template();
        config.server = "http://registry.invalid".into();
        config.token = "token".into();
        config.trial_dir = root.join("reviewed");
        config.archive_dir = root.join("processed");
        config.status_file = root.join("trial_status.csv");
        config.state_dir = Some(root.join("state"));
        config.relocate.delay_ms = 0;
        std::fs::create_dir_all(&config.trial_dir).expect("trial dir");
        Self { home, config }
    }

    pub fn home(&self) -> &Path {
        self.home.path()
    }

    pub fn state_dir(&self) -> PathBuf {
        self.config.state_dir_at(self.home())
    }

    /// Write the CSV feed; `rows` are `(nct_id, local_ids, status, date)`.
    pub fn feed(&self, rows: &[(&str, &str, &str, &str)]) {
        let mut body = String::from("nct_id,local_protocol_ids,status,entry_last_updated_date\n");
        for (nct, local, status, date) in rows {
            body.push_str(&format!("{nct},{local},{status},{date}\n"));
        }
        std::fs::write(&self.config.status_file, body).expect("feed");
    }

    /// Write `<trial_dir>/<key>.json`.
    pub fn trial(&self, key: &str, body: Value) -> PathBuf {
        let path = self.config.trial_dir.join(format!("{key}.json"));
        std::fs::write(&path, serde_json::to_string_pretty(&body).unwrap()).expect("trial");
        path
    }

    pub fn archived(&self, key: &str) -> PathBuf {
        self.config.archive_dir.join(format!("{key}.json"))
    }

    pub fn seed_allocator(&self, max_id: u64, max_no: Option<&str>) {
        allocator::save_at(&self.state_dir(), &ProtocolEnvState::seeded(max_id, max_no))
            .expect("seed allocator");
    }
}

pub fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}
