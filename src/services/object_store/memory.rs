//! In-process `ObjectStore` double that records every call.
//!
//! Parts can be delayed to force out-of-order completion and individual
//! parts or keys can be made to fail.

use super::{CompletedPart, ObjectStore, StoreError};
use async_trait::async_trait;
use bytes::Bytes;
use std::{
    collections::{BTreeMap, HashMap, HashSet},
    sync::{
        Mutex,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Put { key: String },
    Get { key: String },
    Delete { key: String },
    Create { key: String },
    /// Recorded when the part finishes, so order reflects completion order.
    UploadPart { key: String, part_number: i32 },
    Complete { key: String, parts: Vec<i32> },
    Abort { key: String },
    Presign { key: String },
}

#[derive(Default)]
struct Session {
    key: String,
    parts: BTreeMap<i32, (String, Bytes)>,
}

#[derive(Default)]
struct Inner {
    objects: HashMap<String, Bytes>,
    sessions: HashMap<String, Session>,
    calls: Vec<Call>,
    next_upload: u64,
    in_flight: usize,
    max_in_flight: usize,
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
    part_delays: Mutex<HashMap<i32, Duration>>,
    failing_parts: Mutex<HashSet<i32>>,
    failing_keys: Mutex<HashSet<String>>,
    fail_all: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn delay_part(&self, part_number: i32, delay: Duration) {
        self.part_delays
            .lock()
            .unwrap()
            .insert(part_number, delay);
    }

    pub fn fail_part(&self, part_number: i32) {
        self.failing_parts.lock().unwrap().insert(part_number);
    }

    /// Make every put, part upload and get against `key` fail.
    pub fn fail_key(&self, key: &str) {
        self.failing_keys.lock().unwrap().insert(key.to_string());
    }

    /// Make every put, part upload and get fail, whatever the key.
    pub fn fail_all(&self) {
        self.fail_all.store(true, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.inner.lock().unwrap().calls.clone()
    }

    pub fn object(&self, key: &str) -> Option<Bytes> {
        self.inner.lock().unwrap().objects.get(key).cloned()
    }

    pub fn insert_object(&self, key: &str, body: Bytes) {
        self.inner
            .lock()
            .unwrap()
            .objects
            .insert(key.to_string(), body);
    }

    pub fn open_sessions(&self) -> usize {
        self.inner.lock().unwrap().sessions.len()
    }

    pub fn max_in_flight(&self) -> usize {
        self.inner.lock().unwrap().max_in_flight
    }

    pub fn count(&self, predicate: impl Fn(&Call) -> bool) -> usize {
        self.calls().iter().filter(|call| predicate(call)).count()
    }

    fn record(&self, call: Call) {
        self.inner.lock().unwrap().calls.push(call);
    }

    fn key_fails(&self, key: &str) -> bool {
        self.fail_all.load(Ordering::SeqCst) || self.failing_keys.lock().unwrap().contains(key)
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn put_object(&self, key: &str, body: Bytes) -> Result<(), StoreError> {
        self.record(Call::Put {
            key: key.to_string(),
        });
        if self.key_fails(key) {
            return Err(StoreError::request("PutObject", key, "injected failure"));
        }
        self.insert_object(key, body);
        Ok(())
    }

    async fn get_object(&self, key: &str) -> Result<Bytes, StoreError> {
        self.record(Call::Get {
            key: key.to_string(),
        });
        if self.key_fails(key) {
            return Err(StoreError::request("GetObject", key, "injected failure"));
        }
        self.object(key).ok_or_else(|| StoreError::NotFound {
            key: key.to_string(),
        })
    }

    async fn delete_object(&self, key: &str) -> Result<(), StoreError> {
        self.record(Call::Delete {
            key: key.to_string(),
        });
        self.inner.lock().unwrap().objects.remove(key);
        Ok(())
    }

    async fn create_multipart_upload(&self, key: &str) -> Result<String, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        inner.calls.push(Call::Create {
            key: key.to_string(),
        });
        inner.next_upload += 1;
        let upload_id = format!("upload-{}", inner.next_upload);
        inner.sessions.insert(
            upload_id.clone(),
            Session {
                key: key.to_string(),
                ..Session::default()
            },
        );
        Ok(upload_id)
    }

    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: i32,
        body: Bytes,
    ) -> Result<CompletedPart, StoreError> {
        {
            let mut inner = self.inner.lock().unwrap();
            inner.in_flight += 1;
            inner.max_in_flight = inner.max_in_flight.max(inner.in_flight);
        }

        let delay = self.part_delays.lock().unwrap().get(&part_number).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let fails = self.failing_parts.lock().unwrap().contains(&part_number) || self.key_fails(key);
        let mut inner = self.inner.lock().unwrap();
        inner.in_flight -= 1;
        inner.calls.push(Call::UploadPart {
            key: key.to_string(),
            part_number,
        });
        if fails {
            return Err(StoreError::request(
                "UploadPart",
                key,
                format!("injected failure on part {part_number}"),
            ));
        }

        let session = inner
            .sessions
            .get_mut(upload_id)
            .ok_or_else(|| StoreError::request("UploadPart", key, "no such upload"))?;
        let etag = format!("{:x}", md5::compute(&body));
        session.parts.insert(part_number, (etag.clone(), body));
        Ok(CompletedPart { part_number, etag })
    }

    async fn complete_multipart_upload(
        &self,
        key: &str,
        upload_id: &str,
        parts: Vec<CompletedPart>,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        inner.calls.push(Call::Complete {
            key: key.to_string(),
            parts: parts.iter().map(|part| part.part_number).collect(),
        });

        if parts
            .windows(2)
            .any(|pair| pair[0].part_number >= pair[1].part_number)
        {
            return Err(StoreError::request(
                "CompleteMultipartUpload",
                key,
                "InvalidPartOrder",
            ));
        }

        let session = inner
            .sessions
            .remove(upload_id)
            .ok_or_else(|| StoreError::request("CompleteMultipartUpload", key, "no such upload"))?;
        let mut assembled = Vec::new();
        for part in &parts {
            match session.parts.get(&part.part_number) {
                Some((etag, body)) if *etag == part.etag => assembled.extend_from_slice(body),
                _ => {
                    return Err(StoreError::request(
                        "CompleteMultipartUpload",
                        key,
                        format!("InvalidPart {}", part.part_number),
                    ));
                }
            }
        }
        inner.objects.insert(session.key, Bytes::from(assembled));
        Ok(())
    }

    async fn abort_multipart_upload(&self, key: &str, upload_id: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        inner.calls.push(Call::Abort {
            key: key.to_string(),
        });
        inner.sessions.remove(upload_id);
        Ok(())
    }

    async fn presign_get(&self, key: &str, expires_in: Duration) -> Result<String, StoreError> {
        self.record(Call::Presign {
            key: key.to_string(),
        });
        Ok(format!(
            "https://bucket.test/{key}?X-Amz-Expires={}",
            expires_in.as_secs()
        ))
    }
}
