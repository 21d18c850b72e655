//! Property documents for nodes and edges.
//!
//! Documents are stored as canonical bytes. A write always bumps the
//! document's `__v`; the store version advances only when the bytes
//! actually changed, so observers can cheap-check for real modifications.

use nervusdb_api::{Document, NodeId, PropertyValue, Triple};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq)]
pub struct StoredDoc {
    pub version: u64,
    pub bytes: Vec<u8>,
}

impl StoredDoc {
    fn to_document(&self) -> Option<Document> {
        PropertyValue::decode(&self.bytes).ok().map(|value| Document {
            version: self.version,
            value,
        })
    }
}

#[derive(Debug, Default)]
pub struct PropertyStore {
    nodes: BTreeMap<NodeId, StoredDoc>,
    edges: BTreeMap<Triple, StoredDoc>,
    version: u64,
}

impl PropertyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_node(&self, id: NodeId) -> Option<Document> {
        self.nodes.get(&id).and_then(StoredDoc::to_document)
    }

    pub fn get_edge(&self, key: Triple) -> Option<Document> {
        self.edges.get(&key).and_then(StoredDoc::to_document)
    }

    /// Writes a node document and returns its new `__v`.
    pub fn set_node(&mut self, id: NodeId, value: &PropertyValue) -> u64 {
        let bytes = value.encode();
        Self::put(&mut self.nodes, &mut self.version, id, bytes)
    }

    /// Writes an edge document and returns its new `__v`.
    pub fn set_edge(&mut self, key: Triple, value: &PropertyValue) -> u64 {
        let bytes = value.encode();
        Self::put(&mut self.edges, &mut self.version, key, bytes)
    }

    fn put<K: Ord>(
        map: &mut BTreeMap<K, StoredDoc>,
        store_version: &mut u64,
        key: K,
        bytes: Vec<u8>,
    ) -> u64 {
        match map.get_mut(&key) {
            Some(existing) => {
                // An identical overwrite is still an acknowledged write:
                // __v moves, the store version does not.
                existing.version += 1;
                if existing.bytes != bytes {
                    existing.bytes = bytes;
                    *store_version += 1;
                }
                existing.version
            }
            None => {
                map.insert(key, StoredDoc { version: 1, bytes });
                *store_version += 1;
                1
            }
        }
    }

    /// Installs a replayed document at an explicit `__v`, keeping the
    /// highest version when records race.
    pub fn apply_node(&mut self, id: NodeId, bytes: Vec<u8>, version: u64) {
        Self::apply(&mut self.nodes, &mut self.version, id, bytes, version);
    }

    pub fn apply_edge(&mut self, key: Triple, bytes: Vec<u8>, version: u64) {
        Self::apply(&mut self.edges, &mut self.version, key, bytes, version);
    }

    fn apply<K: Ord>(
        map: &mut BTreeMap<K, StoredDoc>,
        store_version: &mut u64,
        key: K,
        bytes: Vec<u8>,
        version: u64,
    ) {
        match map.get_mut(&key) {
            Some(existing) if existing.version >= version => {}
            Some(existing) => {
                if existing.bytes != bytes {
                    *store_version += 1;
                }
                existing.version = version;
                existing.bytes = bytes;
            }
            None => {
                map.insert(key, StoredDoc { version, bytes });
                *store_version += 1;
            }
        }
    }

    /// Raw stored record, used by the batch undo log.
    pub fn raw_node(&self, id: NodeId) -> Option<&StoredDoc> {
        self.nodes.get(&id)
    }

    pub fn raw_edge(&self, key: Triple) -> Option<&StoredDoc> {
        self.edges.get(&key)
    }

    pub fn restore_node(&mut self, id: NodeId, doc: Option<StoredDoc>) {
        match doc {
            Some(doc) => {
                self.nodes.insert(id, doc);
            }
            None => {
                self.nodes.remove(&id);
            }
        }
    }

    pub fn restore_edge(&mut self, key: Triple, doc: Option<StoredDoc>) {
        match doc {
            Some(doc) => {
                self.edges.insert(key, doc);
            }
            None => {
                self.edges.remove(&key);
            }
        }
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    /// Rolls the store version back after an aborted batch.
    pub fn restore_version(&mut self, version: u64) {
        self.version = version;
    }

    pub fn nodes(&self) -> &BTreeMap<NodeId, StoredDoc> {
        &self.nodes
    }

    pub fn edges(&self) -> &BTreeMap<Triple, StoredDoc> {
        &self.edges
    }

    pub fn from_parts(nodes: BTreeMap<NodeId, StoredDoc>, edges: BTreeMap<Triple, StoredDoc>) -> Self {
        Self {
            nodes,
            edges,
            version: 0,
        }
    }
}
