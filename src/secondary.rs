use std::collections::{BTreeSet, HashMap, HashSet};
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::errors::{DatabaseError, DatabaseResult};
use crate::rid::RID;
use crate::seeding::SeedSet;

/// Shape of the per-value RID container of a secondary index.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SecondaryStructure {
    /// Ordered sequence; cheap to append, linear to delete.
    List,
    /// Hash set; O(1) amortised add/delete, the recommended default.
    Set,
    /// Ordered set; keeps RIDs sorted within a value.
    Sorted,
}

/// The RIDs currently holding one attribute value.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum RidContainer {
    List(Vec<RID>),
    Set(HashSet<RID>),
    Sorted(BTreeSet<RID>),
}

impl RidContainer {
    fn new(structure: SecondaryStructure) -> Self {
        match structure {
            SecondaryStructure::List => RidContainer::List(Vec::new()),
            SecondaryStructure::Set => RidContainer::Set(HashSet::new()),
            SecondaryStructure::Sorted => RidContainer::Sorted(BTreeSet::new()),
        }
    }

    fn add(&mut self, rid: RID) {
        match self {
            RidContainer::List(rids) => {
                if !rids.contains(&rid) {
                    rids.push(rid);
                }
            }
            RidContainer::Set(rids) => {
                rids.insert(rid);
            }
            RidContainer::Sorted(rids) => {
                rids.insert(rid);
            }
        }
    }

    fn remove(&mut self, rid: RID) {
        match self {
            RidContainer::List(rids) => rids.retain(|candidate| *candidate != rid),
            RidContainer::Set(rids) => {
                rids.remove(&rid);
            }
            RidContainer::Sorted(rids) => {
                rids.remove(&rid);
            }
        }
    }

    fn rids(&self) -> Vec<RID> {
        match self {
            RidContainer::List(rids) => rids.clone(),
            RidContainer::Set(rids) => rids.iter().copied().collect(),
            RidContainer::Sorted(rids) => rids.iter().copied().collect(),
        }
    }

    fn is_empty(&self) -> bool {
        match self {
            RidContainer::List(rids) => rids.is_empty(),
            RidContainer::Set(rids) => rids.is_empty(),
            RidContainer::Sorted(rids) => rids.is_empty(),
        }
    }
}

/// On-disk image of a secondary index: the container map first, then the
/// seed set, mirroring the in-memory layout.
#[derive(Serialize, Deserialize)]
struct PersistedIndex {
    dictionary: HashMap<i64, RidContainer>,
    seeds: Option<SeedSet>,
}

/// Multi-valued mapping from attribute value to the base RIDs currently
/// holding it, for one non-primary column. Owns its on-disk file and
/// performs its own load/save.
pub struct SecondaryIndex {
    /// `<table>_attr_attribute_<col>`; also the file name under the root.
    index_name: String,
    path: PathBuf,
    structure: SecondaryStructure,
    dictionary: HashMap<i64, RidContainer>,
    seeds: Option<SeedSet>,
}

impl SecondaryIndex {
    pub fn new(
        root: &Path,
        table: &str,
        column: usize,
        structure: SecondaryStructure,
        seeded: bool,
    ) -> Self {
        let index_name = format!("{}_attr_attribute_{}", table, column);
        SecondaryIndex {
            path: root.join(&index_name),
            index_name,
            structure,
            dictionary: HashMap::new(),
            seeds: seeded.then(SeedSet::new),
        }
    }

    pub fn index_name(&self) -> &str {
        &self.index_name
    }

    pub fn add_record(&mut self, key: i64, rid: RID) {
        self.dictionary
            .entry(key)
            .or_insert_with(|| RidContainer::new(self.structure))
            .add(rid);
        if let Some(seeds) = self.seeds.as_mut() {
            seeds.add(rid);
        }
    }

    pub fn delete_record(&mut self, key: i64, rid: RID) {
        if let Some(container) = self.dictionary.get_mut(&key) {
            container.remove(rid);
            if container.is_empty() {
                self.dictionary.remove(&key);
            }
        }
        if let Some(seeds) = self.seeds.as_mut() {
            seeds.remove(rid);
        }
    }

    pub fn search_record(&self, key: i64) -> Vec<RID> {
        self.dictionary
            .get(&key)
            .map(RidContainer::rids)
            .unwrap_or_default()
    }

    /// Range enumeration over inserted RIDs via the optional seed set.
    pub fn seed_range(&self, low: RID, high: RID) -> Vec<RID> {
        self.seeds
            .as_ref()
            .map(|seeds| seeds.search_range(low, high))
            .unwrap_or_default()
    }

    /// Persist the container and the seed set, in that order.
    pub fn save_index(&self) -> DatabaseResult<()> {
        let image = PersistedIndex {
            dictionary: self.dictionary.clone(),
            seeds: self.seeds.clone(),
        };

        let tmp_path = self.path.with_extension("tmp");
        serde_json::to_writer(File::create(&tmp_path)?, &image)?;
        fs::rename(&tmp_path, &self.path)?;
        debug!("saved secondary index {}", self.index_name);
        Ok(())
    }

    /// Replace the in-memory state with the saved image, when one exists.
    pub fn load_index(&mut self) -> DatabaseResult<()> {
        if !self.path.is_file() {
            return Ok(());
        }

        let image: PersistedIndex = serde_json::from_reader(File::open(&self.path)?)?;
        self.dictionary = image.dictionary;
        // A previously unseeded index stays unseeded.
        if self.seeds.is_some() {
            self.seeds = image.seeds.or_else(|| Some(SeedSet::new()));
        }
        debug!("loaded secondary index {}", self.index_name);
        Ok(())
    }
}

/// Operations accepted by a secondary index, inline or through a worker.
#[derive(Clone, Debug)]
pub enum IndexOperation {
    Insert { key: i64, rid: RID },
    Delete { key: i64, rid: RID },
    Search { key: i64 },
    SaveIndex,
    LoadIndex,
}

/// One request to an index worker. Request ids increase monotonically
/// across the owning table.
#[derive(Clone, Debug)]
pub struct IndexRequest {
    pub request_id: u64,
    pub operation: IndexOperation,
}

/// Outcome of one request, keyed back to its id.
#[derive(Clone, Debug)]
pub enum IndexReply {
    Done,
    Rids(Vec<RID>),
    Failed(String),
}

#[derive(Clone, Debug)]
pub struct IndexResponse {
    pub request_id: u64,
    pub reply: IndexReply,
}

/// A secondary index running as a single-consumer actor on its own worker
/// thread: an inbox of batched requests, an outbox of responses keyed by
/// request id. Stopped by flag once its inbox is drained.
pub struct AsyncSecondaryIndex {
    request_sender: Sender<Vec<IndexRequest>>,
    response_receiver: Mutex<Receiver<IndexResponse>>,
    stop_flag: Arc<AtomicBool>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl AsyncSecondaryIndex {
    pub fn spawn(index: SecondaryIndex) -> Self {
        let (request_sender, request_receiver) = mpsc::channel::<Vec<IndexRequest>>();
        let (response_sender, response_receiver) = mpsc::channel::<IndexResponse>();
        let stop_flag = Arc::new(AtomicBool::new(false));

        let worker_flag = Arc::clone(&stop_flag);
        let worker = thread::spawn(move || {
            run_index_worker(index, request_receiver, response_sender, worker_flag);
        });

        AsyncSecondaryIndex {
            request_sender,
            response_receiver: Mutex::new(response_receiver),
            stop_flag,
            worker: Mutex::new(Some(worker)),
        }
    }

    /// Post a batch of requests. Requests within a batch are processed in
    /// order.
    pub fn post(&self, batch: Vec<IndexRequest>) {
        if self.request_sender.send(batch).is_err() {
            warn!("index worker gone; dropping request batch");
        }
    }

    /// Next response, if one arrives within the timeout.
    pub fn recv_response(&self, timeout: Duration) -> Option<IndexResponse> {
        self.response_receiver.lock().unwrap().recv_timeout(timeout).ok()
    }

    /// Clear the continue flag and join the worker after it drains its
    /// inbox.
    pub fn stop(&self) {
        self.stop_flag.store(true, Ordering::SeqCst);
        if let Some(worker) = self.worker.lock().unwrap().take() {
            let _ = worker.join();
        }
    }
}

fn run_index_worker(
    mut index: SecondaryIndex,
    requests: Receiver<Vec<IndexRequest>>,
    responses: Sender<IndexResponse>,
    stop_flag: Arc<AtomicBool>,
) {
    loop {
        match requests.recv_timeout(Duration::from_millis(20)) {
            Ok(batch) => {
                for request in batch {
                    let reply = perform_operation(&mut index, request.operation);
                    if responses
                        .send(IndexResponse {
                            request_id: request.request_id,
                            reply,
                        })
                        .is_err()
                    {
                        // Table side dropped its receiver; nothing left to do.
                        return;
                    }
                }
            }
            Err(RecvTimeoutError::Timeout) => {
                if stop_flag.load(Ordering::SeqCst) {
                    break;
                }
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    debug!("index worker for {} stopped", index.index_name());
}

/// Failures become `Failed` replies under the originating request id; the
/// worker itself never dies on a bad request.
fn perform_operation(index: &mut SecondaryIndex, operation: IndexOperation) -> IndexReply {
    match operation {
        IndexOperation::Insert { key, rid } => {
            index.add_record(key, rid);
            IndexReply::Done
        }
        IndexOperation::Delete { key, rid } => {
            index.delete_record(key, rid);
            IndexReply::Done
        }
        IndexOperation::Search { key } => IndexReply::Rids(index.search_record(key)),
        IndexOperation::SaveIndex => match index.save_index() {
            Ok(()) => IndexReply::Done,
            Err(error) => IndexReply::Failed(error.to_string()),
        },
        IndexOperation::LoadIndex => match index.load_index() {
            Ok(()) => IndexReply::Done,
            Err(error) => IndexReply::Failed(error.to_string()),
        },
    }
}

/// A table's view of one secondary index: either guarded in-process state or
/// a handle to the index's worker thread.
pub enum SecondaryIndexHandle {
    Inline(Mutex<SecondaryIndex>),
    Worker(AsyncSecondaryIndex),
}

impl SecondaryIndexHandle {
    pub fn new(index: SecondaryIndex, multiprocess: bool) -> Self {
        if multiprocess {
            SecondaryIndexHandle::Worker(AsyncSecondaryIndex::spawn(index))
        } else {
            SecondaryIndexHandle::Inline(Mutex::new(index))
        }
    }

    pub fn is_async(&self) -> bool {
        matches!(self, SecondaryIndexHandle::Worker(_))
    }

    /// Synchronous save used at close for inline indexes. Worker-backed
    /// indexes save through a `SaveIndex` request instead.
    pub fn save_inline(&self) -> DatabaseResult<()> {
        match self {
            SecondaryIndexHandle::Inline(index) => index.lock().unwrap().save_index(),
            SecondaryIndexHandle::Worker(_) => Err(DatabaseError::IndexWorker(
                "save_inline called on a worker-backed index".to_string(),
            )),
        }
    }
}
