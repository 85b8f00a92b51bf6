//! Bundle container format: a count header, a table of (size, id) entries,
//! then the concatenated data items. Offsets into the payload are fully
//! determined by the entry table, which the offset writer relies on.

use crate::{b64url_decode, data_item_id};
use anyhow::{Context, Result};

pub const ENTRY_LEN: usize = 64;
pub const COUNT_LEN: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BundleEntry {
    pub id: [u8; 32],
    pub size: u64,
}

/// Byte length of the bundle header for `count` items.
pub fn header_len(count: usize) -> usize {
    COUNT_LEN + ENTRY_LEN * count
}

/// Start offset of each item within the bundle payload, in entry order.
pub fn item_offsets(sizes: &[u64]) -> Vec<u64> {
    let mut offsets = Vec::with_capacity(sizes.len());
    let mut cursor = header_len(sizes.len()) as u64;
    for size in sizes {
        offsets.push(cursor);
        cursor += size;
    }
    offsets
}

fn write_u64_as_32le(out: &mut Vec<u8>, value: u64) {
    out.extend_from_slice(&value.to_le_bytes());
    out.extend_from_slice(&[0u8; 24]);
}

fn read_u64_from_32le(bytes: &[u8]) -> Result<u64> {
    if bytes.len() < 32 {
        anyhow::bail!("truncated 32-byte number");
    }
    if bytes[8..32].iter().any(|b| *b != 0) {
        anyhow::bail!("bundle number exceeds u64 range");
    }
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&bytes[..8]);
    Ok(u64::from_le_bytes(buf))
}

/// Assembles a bundle payload from (id, item bytes) pairs.
pub fn encode_bundle(items: &[(String, Vec<u8>)]) -> Result<Vec<u8>> {
    let total: usize = items.iter().map(|(_, bytes)| bytes.len()).sum();
    let mut out = Vec::with_capacity(header_len(items.len()) + total);
    write_u64_as_32le(&mut out, items.len() as u64);
    for (id, bytes) in items {
        write_u64_as_32le(&mut out, bytes.len() as u64);
        let raw = b64url_decode(id).with_context(|| format!("decode item id {id}"))?;
        let raw: [u8; 32] = raw
            .try_into()
            .map_err(|_| anyhow::anyhow!("item id {id} is not 32 bytes"))?;
        out.extend_from_slice(&raw);
    }
    for (_, bytes) in items {
        out.extend_from_slice(bytes);
    }
    Ok(out)
}

/// Reads the entry table of a bundle payload.
pub fn parse_bundle_entries(payload: &[u8]) -> Result<Vec<BundleEntry>> {
    let count = read_u64_from_32le(payload).context("read bundle item count")?;
    let count = usize::try_from(count).context("bundle item count overflow")?;
    let expected_header = header_len(count);
    if payload.len() < expected_header {
        anyhow::bail!(
            "bundle of {} bytes too short for {count} entries",
            payload.len()
        );
    }
    let mut entries = Vec::with_capacity(count);
    for i in 0..count {
        let at = COUNT_LEN + i * ENTRY_LEN;
        let size = read_u64_from_32le(&payload[at..]).with_context(|| format!("entry {i} size"))?;
        let mut id = [0u8; 32];
        id.copy_from_slice(&payload[at + 32..at + 64]);
        entries.push(BundleEntry { id, size });
    }
    // The entry table must account for the payload exactly.
    let body: u64 = entries.iter().map(|e| e.size).sum();
    if expected_header as u64 + body != payload.len() as u64 {
        anyhow::bail!(
            "bundle length mismatch: header {expected_header} + items {body} != {}",
            payload.len()
        );
    }
    Ok(entries)
}

/// Content id of the assembled bundle payload, used as the chain tx id.
pub fn bundle_id_for_payload(payload: &[u8]) -> String {
    data_item_id(payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::b64url;

    fn item(id_byte: u8, len: usize) -> (String, Vec<u8>) {
        (b64url(&[id_byte; 32]), vec![id_byte; len])
    }

    #[test]
    fn encode_then_parse_recovers_entries() {
        let items = vec![item(1, 100), item(2, 7), item(3, 0)];
        let payload = encode_bundle(&items).unwrap();
        assert_eq!(payload.len(), header_len(3) + 107);

        let entries = parse_bundle_entries(&payload).unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].size, 100);
        assert_eq!(entries[1].size, 7);
        assert_eq!(entries[2].size, 0);
        assert_eq!(entries[0].id, [1u8; 32]);
        assert_eq!(entries[2].id, [3u8; 32]);
    }

    #[test]
    fn offsets_start_after_the_header() {
        let offsets = item_offsets(&[100, 7, 0]);
        let base = header_len(3) as u64;
        assert_eq!(offsets, vec![base, base + 100, base + 107]);
    }

    #[test]
    fn items_land_at_their_computed_offsets() {
        let items = vec![item(9, 16), item(8, 3)];
        let payload = encode_bundle(&items).unwrap();
        let offsets = item_offsets(&[16, 3]);
        assert_eq!(
            &payload[offsets[0] as usize..offsets[0] as usize + 16],
            &[9u8; 16][..]
        );
        assert_eq!(
            &payload[offsets[1] as usize..offsets[1] as usize + 3],
            &[8u8; 3][..]
        );
    }

    #[test]
    fn parse_rejects_length_mismatch() {
        let items = vec![item(1, 10)];
        let mut payload = encode_bundle(&items).unwrap();
        payload.push(0);
        assert!(parse_bundle_entries(&payload).is_err());
        payload.truncate(payload.len() - 2);
        assert!(parse_bundle_entries(&payload).is_err());
    }

    #[test]
    fn empty_bundle_is_valid() {
        let payload = encode_bundle(&[]).unwrap();
        assert_eq!(payload.len(), COUNT_LEN);
        assert!(parse_bundle_entries(&payload).unwrap().is_empty());
    }
}
