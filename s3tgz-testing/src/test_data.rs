//! Generate random test objects and check them against what was archived.
use crate::archive::ArchiveEntry;
use bytes::Bytes;
use rand::prelude::*;
use sha2::Digest;
use std::collections::HashMap;

#[derive(Clone, Debug)]
pub struct TestObject {
    pub key: String,
    pub size: usize,
}

impl TestObject {
    /// Make a new test object spec with the size specified as a string so we can use
    /// human-friendly units like "10 KB" or "20 MiB"
    pub fn new(key: impl Into<String>, size: impl AsRef<str>) -> Self {
        let key = key.into();

        let size = byte_unit::Byte::from_str(size).unwrap();

        Self {
            key,
            size: size.get_bytes() as usize,
        }
    }
}

/// The same test object spec as in [`TestObject`], but with the data that is written to the object
/// as well
#[derive(Clone, Debug)]
pub struct TestObjectWithData {
    pub key: String,
    pub data: Bytes,
    pub hash: [u8; 32],
}

/// Generate random contents for each test object.
///
/// The key to the hash table is the object key.
pub fn make_test_data(
    objects: impl IntoIterator<Item = TestObject>,
) -> HashMap<String, TestObjectWithData> {
    let mut rand = rand::thread_rng();
    let mut test_objects = HashMap::new();

    for object in objects {
        let mut data = vec![0u8; object.size];
        rand.fill(&mut data[..]);

        let key = object.key;
        let object = TestObjectWithData {
            key: key.clone(),
            hash: hash(&data),
            data: Bytes::from(data),
        };

        assert!(
            test_objects.insert(key.clone(), object).is_none(),
            "BUG: test data contains the same key '{}' more than once",
            key
        );
    }

    test_objects
}

/// SHA-256 hash of some data
pub fn hash(data: &[u8]) -> [u8; 32] {
    let mut hasher = sha2::Sha256::new();
    hasher.update(data);

    let mut hash = [0u8; 32];
    hash.copy_from_slice(&hasher.finalize());
    hash
}

/// Check that an archive contains exactly the objects in `expected_keys`, in that order, each with
/// the same contents as the corresponding test object.
#[track_caller]
pub fn validate_test_data_in_archive<'a>(
    test_data: &HashMap<String, TestObjectWithData>,
    entries: &[ArchiveEntry],
    expected_keys: impl IntoIterator<Item = &'a str>,
) {
    let expected_keys = expected_keys.into_iter().collect::<Vec<_>>();

    println!("Archive contains the following entries:");
    for entry in entries {
        println!("  {} ({} bytes)", entry.path, entry.data.len());
    }

    assert_eq!(
        expected_keys,
        entries
            .iter()
            .map(|entry| entry.path.as_str())
            .collect::<Vec<_>>(),
        "Archive entries don't match the expected objects"
    );

    for entry in entries {
        let test_object = test_data.get(&entry.path).unwrap_or_else(|| {
            panic!(
                "BUG: test expects key '{}' but the `test_data` collection doesn't have such an entry",
                entry.path
            )
        });

        assert_eq!(
            test_object.hash,
            hash(&entry.data),
            "Entry '{}' hash doesn't match expected value",
            entry.path
        );
    }
}
