//! The main data file `P`: dictionary, residual write buffer, and
//! property payloads behind a 64-byte header. Rewritten atomically on
//! every flush; after a clean flush the buffer sections are empty and the
//! WAL is the only delta.

use crate::dictionary::Dictionary;
use crate::properties::{PropertyStore, StoredDoc};
use crate::{Error, FILE_MAGIC, FORMAT_VERSION, Result};
use nervusdb_api::{NodeId, Triple};
use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::Path;

const HEADER_LEN: usize = 64;

#[derive(Debug, Default)]
pub struct DataFileContents {
    pub dictionary: Dictionary,
    pub staged: Vec<Triple>,
    pub pending_tombstones: Vec<Triple>,
    pub properties: PropertyStore,
}

pub fn save(
    path: &Path,
    dictionary: &Dictionary,
    staged: &BTreeSet<Triple>,
    pending_tombstones: &BTreeSet<Triple>,
    properties: &PropertyStore,
) -> Result<()> {
    let mut dict = Vec::new();
    dict.extend_from_slice(&(dictionary.len() as u64).to_le_bytes());
    for value in dictionary.values() {
        dict.extend_from_slice(&(value.len() as u32).to_le_bytes());
        dict.extend_from_slice(value.as_bytes());
    }

    let triples = encode_triples(staged);
    let staging = encode_triples(pending_tombstones);

    let mut props = Vec::new();
    props.extend_from_slice(&(properties.nodes().len() as u64).to_le_bytes());
    for (id, doc) in properties.nodes() {
        props.extend_from_slice(&id.to_le_bytes());
        push_doc(&mut props, doc);
    }
    props.extend_from_slice(&(properties.edges().len() as u64).to_le_bytes());
    for (key, doc) in properties.edges() {
        props.extend_from_slice(&key.s.to_le_bytes());
        props.extend_from_slice(&key.p.to_le_bytes());
        props.extend_from_slice(&key.o.to_le_bytes());
        push_doc(&mut props, doc);
    }

    let dict_off = HEADER_LEN as u64;
    let triples_off = dict_off + dict.len() as u64;
    let staging_off = triples_off + triples.len() as u64;
    let props_off = staging_off + staging.len() as u64;

    let mut header = [0u8; HEADER_LEN];
    header[0..16].copy_from_slice(&FILE_MAGIC);
    header[16..20].copy_from_slice(&FORMAT_VERSION.to_le_bytes());
    header[24..32].copy_from_slice(&dict_off.to_le_bytes());
    header[32..40].copy_from_slice(&triples_off.to_le_bytes());
    header[40..48].copy_from_slice(&staging_off.to_le_bytes());
    header[48..56].copy_from_slice(&props_off.to_le_bytes());

    let tmp = tmp_path(path);
    {
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp)?;
        file.write_all(&header)?;
        file.write_all(&dict)?;
        file.write_all(&triples)?;
        file.write_all(&staging)?;
        file.write_all(&props)?;
        file.sync_data()?;
    }
    fs::rename(&tmp, path)?;
    if let Some(parent) = path.parent() {
        crate::manifest::sync_dir(parent)?;
    }
    Ok(())
}

/// Loads the main data file; `None` when it does not exist yet.
pub fn load(path: &Path) -> Result<Option<DataFileContents>> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    if bytes.len() < HEADER_LEN {
        return Err(Error::StorageCorrupted("data file too short"));
    }
    if bytes[0..16] != FILE_MAGIC {
        return Err(Error::InvalidMagic);
    }
    let version = u32::from_le_bytes(bytes[16..20].try_into().unwrap());
    if version < 2 {
        return Err(Error::UnsupportedFormatVersion(version));
    }

    let dict_off = read_offset(&bytes, 24)?;
    let triples_off = read_offset(&bytes, 32)?;
    let staging_off = read_offset(&bytes, 40)?;
    let props_off = read_offset(&bytes, 48)?;

    let mut cursor = dict_off;
    let count = read_u64(&bytes, &mut cursor)?;
    let mut values = Vec::with_capacity(count.min(1 << 20) as usize);
    for _ in 0..count {
        let len = read_u32(&bytes, &mut cursor)? as usize;
        let slice = take(&bytes, &mut cursor, len)?;
        values.push(
            std::str::from_utf8(slice)
                .map_err(|_| Error::StorageCorrupted("invalid UTF-8 in dictionary"))?
                .to_owned(),
        );
    }
    let dictionary = Dictionary::from_values(values);

    let mut cursor = triples_off;
    let staged = decode_triples(&bytes, &mut cursor)?;
    let mut cursor = staging_off;
    let pending_tombstones = decode_triples(&bytes, &mut cursor)?;

    let mut cursor = props_off;
    let node_count = read_u64(&bytes, &mut cursor)?;
    let mut nodes: BTreeMap<NodeId, StoredDoc> = BTreeMap::new();
    for _ in 0..node_count {
        let id = read_u64(&bytes, &mut cursor)?;
        nodes.insert(id, read_doc(&bytes, &mut cursor)?);
    }
    let edge_count = read_u64(&bytes, &mut cursor)?;
    let mut edges: BTreeMap<Triple, StoredDoc> = BTreeMap::new();
    for _ in 0..edge_count {
        let s = read_u64(&bytes, &mut cursor)?;
        let p = read_u64(&bytes, &mut cursor)?;
        let o = read_u64(&bytes, &mut cursor)?;
        edges.insert(Triple::new(s, p, o), read_doc(&bytes, &mut cursor)?);
    }

    Ok(Some(DataFileContents {
        dictionary,
        staged,
        pending_tombstones,
        properties: PropertyStore::from_parts(nodes, edges),
    }))
}

fn tmp_path(path: &Path) -> std::path::PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".tmp");
    path.with_file_name(name)
}

fn encode_triples(set: &BTreeSet<Triple>) -> Vec<u8> {
    let mut out = Vec::with_capacity(8 + set.len() * 24);
    out.extend_from_slice(&(set.len() as u64).to_le_bytes());
    for t in set {
        out.extend_from_slice(&t.s.to_le_bytes());
        out.extend_from_slice(&t.p.to_le_bytes());
        out.extend_from_slice(&t.o.to_le_bytes());
    }
    out
}

fn decode_triples(bytes: &[u8], cursor: &mut usize) -> Result<Vec<Triple>> {
    let count = read_u64(bytes, cursor)?;
    let mut out = Vec::with_capacity(count.min(1 << 20) as usize);
    for _ in 0..count {
        let s = read_u64(bytes, cursor)?;
        let p = read_u64(bytes, cursor)?;
        let o = read_u64(bytes, cursor)?;
        out.push(Triple::new(s, p, o));
    }
    Ok(out)
}

fn push_doc(out: &mut Vec<u8>, doc: &StoredDoc) {
    out.extend_from_slice(&doc.version.to_le_bytes());
    out.extend_from_slice(&(doc.bytes.len() as u32).to_le_bytes());
    out.extend_from_slice(&doc.bytes);
}

fn read_doc(bytes: &[u8], cursor: &mut usize) -> Result<StoredDoc> {
    let version = read_u64(bytes, cursor)?;
    let len = read_u32(bytes, cursor)? as usize;
    let slice = take(bytes, cursor, len)?;
    Ok(StoredDoc {
        version,
        bytes: slice.to_vec(),
    })
}

fn read_offset(bytes: &[u8], at: usize) -> Result<usize> {
    let off = u64::from_le_bytes(bytes[at..at + 8].try_into().unwrap()) as usize;
    if off < HEADER_LEN || off > bytes.len() {
        return Err(Error::StorageCorrupted("section offset out of bounds"));
    }
    Ok(off)
}

fn take<'a>(bytes: &'a [u8], cursor: &mut usize, n: usize) -> Result<&'a [u8]> {
    let end = cursor
        .checked_add(n)
        .filter(|end| *end <= bytes.len())
        .ok_or(Error::StorageCorrupted("section truncated"))?;
    let slice = &bytes[*cursor..end];
    *cursor = end;
    Ok(slice)
}

fn read_u32(bytes: &[u8], cursor: &mut usize) -> Result<u32> {
    Ok(u32::from_le_bytes(take(bytes, cursor, 4)?.try_into().unwrap()))
}

fn read_u64(bytes: &[u8], cursor: &mut usize) -> Result<u64> {
    Ok(u64::from_le_bytes(take(bytes, cursor, 8)?.try_into().unwrap()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use nervusdb_api::PropertyValue;
    use tempfile::tempdir;

    #[test]
    fn roundtrip_all_sections() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("db.synapse");

        let mut dictionary = Dictionary::new();
        let a = dictionary.intern("alice");
        let r = dictionary.intern("knows");
        let b = dictionary.intern("bob");

        let staged: BTreeSet<Triple> = [Triple::new(a, r, b)].into();
        let tombs: BTreeSet<Triple> = [Triple::new(b, r, a)].into();
        let mut properties = PropertyStore::new();
        properties.set_node(a, &PropertyValue::Int(1));
        properties.set_edge(Triple::new(a, r, b), &PropertyValue::Bool(true));

        save(&path, &dictionary, &staged, &tombs, &properties).unwrap();
        let loaded = load(&path).unwrap().unwrap();

        assert_eq!(loaded.dictionary.get_id("alice"), Some(a));
        assert_eq!(loaded.dictionary.get_id("bob"), Some(b));
        assert_eq!(loaded.staged, vec![Triple::new(a, r, b)]);
        assert_eq!(loaded.pending_tombstones, vec![Triple::new(b, r, a)]);
        assert_eq!(
            loaded.properties.get_node(a).unwrap().value,
            PropertyValue::Int(1)
        );
        assert_eq!(loaded.properties.get_node(a).unwrap().version, 1);
        assert_eq!(
            loaded
                .properties
                .get_edge(Triple::new(a, r, b))
                .unwrap()
                .value,
            PropertyValue::Bool(true)
        );
    }

    #[test]
    fn missing_file_is_none() {
        let dir = tempdir().unwrap();
        assert!(load(&dir.path().join("absent")).unwrap().is_none());
    }

    #[test]
    fn bad_magic_is_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("db.synapse");
        fs::write(&path, vec![0u8; 128]).unwrap();
        assert!(matches!(load(&path), Err(Error::InvalidMagic)));
    }
}
