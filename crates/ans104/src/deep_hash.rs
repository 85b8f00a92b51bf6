//! Arweave deep-hash: a SHA-384 construction over nested blob/list values.
//! Both data-item signing payloads and upload receipts are digested with it.

use sha2::{Digest, Sha384};

pub enum DeepHashChunk<'a> {
    Blob(&'a [u8]),
    List(Vec<DeepHashChunk<'a>>),
}

pub const DIGEST_LEN: usize = 48;

pub fn deep_hash(chunk: &DeepHashChunk<'_>) -> [u8; DIGEST_LEN] {
    match chunk {
        DeepHashChunk::Blob(data) => {
            let tag = format!("blob{}", data.len());
            let tag_hash = Sha384::digest(tag.as_bytes());
            let data_hash = Sha384::digest(data);
            let mut h = Sha384::new();
            h.update(tag_hash);
            h.update(data_hash);
            h.finalize().into()
        }
        DeepHashChunk::List(items) => {
            let tag = format!("list{}", items.len());
            let mut acc: [u8; DIGEST_LEN] = Sha384::digest(tag.as_bytes()).into();
            for item in items {
                let item_hash = deep_hash(item);
                let mut h = Sha384::new();
                h.update(acc);
                h.update(item_hash);
                acc = h.finalize().into();
            }
            acc
        }
    }
}

pub fn blob(data: &[u8]) -> DeepHashChunk<'_> {
    DeepHashChunk::Blob(data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blob_hash_depends_on_content_and_length() {
        let a = deep_hash(&blob(b"abc"));
        let b = deep_hash(&blob(b"abd"));
        let c = deep_hash(&blob(b"ab"));
        assert_ne!(a, b);
        assert_ne!(a, c);
        assert_eq!(a, deep_hash(&blob(b"abc")));
    }

    #[test]
    fn list_hash_is_order_sensitive() {
        let ab = deep_hash(&DeepHashChunk::List(vec![blob(b"a"), blob(b"b")]));
        let ba = deep_hash(&DeepHashChunk::List(vec![blob(b"b"), blob(b"a")]));
        assert_ne!(ab, ba);
    }

    #[test]
    fn list_differs_from_concatenated_blob() {
        let as_list = deep_hash(&DeepHashChunk::List(vec![blob(b"a"), blob(b"b")]));
        let as_blob = deep_hash(&blob(b"ab"));
        assert_ne!(as_list, as_blob);
    }

    #[test]
    fn empty_list_hashes_to_its_tag() {
        let empty = deep_hash(&DeepHashChunk::List(vec![]));
        let expected: [u8; DIGEST_LEN] = Sha384::digest(b"list0").into();
        assert_eq!(empty, expected);
    }
}
