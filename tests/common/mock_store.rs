//! In-memory [`DocumentStore`] for integration tests.

use outbound_replication::document::AttachmentInformation;
use outbound_replication::error::Result;
use outbound_replication::etag::Etag;
use outbound_replication::storage::{DocumentStore, ListItem, StorageAccessor, StoredDocument};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Mutex;

#[derive(Default)]
struct Inner {
    docs: HashMap<String, StoredDocument>,
    attachments: Vec<(AttachmentInformation, Vec<u8>)>,
    lists: HashMap<String, Vec<ListItem>>,
    head_etag: Etag,
    put_counter: u64,
}

/// Hash-map backed store with settable attachments, tombstone lists,
/// recent touches, and head etag.
///
/// Touches live behind their own lock: `recent_touch_etag` is called from
/// inside `batch()` while the main lock is held.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
    touches: Mutex<HashMap<String, Etag>>,
}

impl MemoryStore {
    pub fn add_attachment(&self, info: AttachmentInformation, data: Vec<u8>) {
        let mut inner = self.inner.lock().unwrap();
        inner.attachments.push((info, data));
        inner.attachments.sort_by_key(|(a, _)| a.etag);
    }

    pub fn add_list_item(&self, list: &str, key: &str, etag: Etag) {
        let mut inner = self.inner.lock().unwrap();
        let entries = inner.lists.entry(list.to_string()).or_default();
        entries.push(ListItem {
            key: key.to_string(),
            etag,
        });
        entries.sort_by_key(|item| item.etag);
    }

    pub fn set_touch(&self, key: &str, etag: Etag) {
        self.touches.lock().unwrap().insert(key.to_string(), etag);
    }

    pub fn set_head_etag(&self, etag: Etag) {
        self.inner.lock().unwrap().head_etag = etag;
    }

    pub fn has_doc(&self, key: &str) -> bool {
        self.inner.lock().unwrap().docs.contains_key(key)
    }
}

struct Accessor<'a> {
    inner: &'a Inner,
}

impl StorageAccessor for Accessor<'_> {
    fn most_recent_document_etag(&self) -> Etag {
        self.inner.head_etag
    }

    fn attachments_after(
        &self,
        after: Etag,
        take: usize,
        size_limit: u64,
    ) -> Result<Vec<AttachmentInformation>> {
        let mut out = Vec::new();
        let mut total: u64 = 0;
        for (info, _) in &self.inner.attachments {
            if info.etag <= after {
                continue;
            }
            if out.len() >= take {
                break;
            }
            total += info.size;
            out.push(info.clone());
            if total >= size_limit {
                break;
            }
        }
        Ok(out)
    }

    fn attachment_data(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self
            .inner
            .attachments
            .iter()
            .find(|(info, _)| info.key == key)
            .map(|(_, data)| data.clone()))
    }

    fn read_list(
        &self,
        name: &str,
        from: Etag,
        to: Option<Etag>,
        take: usize,
    ) -> Result<Vec<ListItem>> {
        let entries = match self.inner.lists.get(name) {
            Some(entries) => entries,
            None => return Ok(vec![]),
        };
        Ok(entries
            .iter()
            .filter(|item| item.etag > from && to.map(|t| item.etag <= t).unwrap_or(true))
            .take(take)
            .cloned()
            .collect())
    }
}

impl DocumentStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<StoredDocument>> {
        Ok(self.inner.lock().unwrap().docs.get(key).cloned())
    }

    fn put(
        &self,
        key: &str,
        _expected_etag: Option<Etag>,
        data: Value,
        metadata: Value,
    ) -> Result<Etag> {
        let mut inner = self.inner.lock().unwrap();
        inner.put_counter += 1;
        let etag = Etag::from_parts(u64::MAX, inner.put_counter);
        inner.docs.insert(
            key.to_string(),
            StoredDocument {
                key: key.to_string(),
                etag,
                metadata,
                data,
            },
        );
        Ok(etag)
    }

    fn delete(&self, key: &str, _expected_etag: Option<Etag>) -> Result<bool> {
        Ok(self.inner.lock().unwrap().docs.remove(key).is_some())
    }

    fn documents_with_id_prefix(
        &self,
        prefix: &str,
        skip: usize,
        take: usize,
    ) -> Result<Vec<StoredDocument>> {
        let inner = self.inner.lock().unwrap();
        let mut matches: Vec<StoredDocument> = inner
            .docs
            .values()
            .filter(|doc| doc.key.starts_with(prefix))
            .cloned()
            .collect();
        matches.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(matches.into_iter().skip(skip).take(take).collect())
    }

    fn batch(&self, action: &mut dyn FnMut(&dyn StorageAccessor) -> Result<()>) -> Result<()> {
        let inner = self.inner.lock().unwrap();
        let accessor = Accessor { inner: &inner };
        action(&accessor)
    }

    fn recent_touch_etag(&self, key: &str) -> Option<Etag> {
        self.touches.lock().unwrap().get(key).copied()
    }
}
