// src/bundle.rs
//
//! Bundle-file capability interface.
//!
//! A bundle file is a container holding multiple named samples (e.g. one
//! simulation run's output). The staging layer treats the container format
//! as opaque: it only needs to open a bundle by path, enumerate the names of
//! the samples it contains, and read one named sample into a [`Record`].
//! Production container formats implement [`BundleFormat`]; the sample list
//! and handle pool are generic over it rather than over a base-class
//! hierarchy.
//!
//! [`JsonBundle`] is a concrete backend (one JSON object per bundle file,
//! sample name -> record) used by tests and small runs.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

use crate::error::{Result, StageError};
use crate::record::Record;

/// Capability interface one bundle container format must provide.
pub trait BundleFormat: Send + Sync + 'static {
    /// An open bundle file. Dropping a handle must release its descriptor.
    type Handle: Send;

    /// Open a bundle for reading. A failure here may be transient; callers
    /// retry a bounded number of times before treating it as fatal.
    fn open_for_read(&self, path: &Path) -> Result<Self::Handle>;

    /// Release the handle's underlying descriptor.
    fn close(&self, handle: &mut Self::Handle);

    /// Whether the handle still holds a usable descriptor.
    fn is_valid(&self, handle: &Self::Handle) -> bool;

    /// Names of all samples contained in the bundle.
    fn list_sample_names(&self, handle: &Self::Handle) -> Result<Vec<String>>;

    /// Read one named sample into a hierarchical record.
    fn read_sample(&self, handle: &Self::Handle, name: &str) -> Result<Record>;
}

/// Open a bundle with the bounded retry policy for transient I/O errors:
/// up to `attempts` tries, no backoff. Returns the last error if all fail.
pub fn open_with_retry<B: BundleFormat>(
    bundle: &B,
    path: &Path,
    attempts: usize,
) -> Result<B::Handle> {
    let mut last: Option<StageError> = None;
    for attempt in 1..=attempts.max(1) {
        match bundle.open_for_read(path) {
            Ok(h) => return Ok(h),
            Err(e) => {
                log::warn!(
                    "attempt {}/{} to open bundle file {} failed: {}",
                    attempt,
                    attempts,
                    path.display(),
                    e
                );
                last = Some(e);
            }
        }
    }
    Err(StageError::FileOpenError {
        path: path.display().to_string(),
        attempts: attempts.max(1),
        detail: last.map(|e| e.to_string()).unwrap_or_default(),
    })
}

/// Bundle backend storing samples as one JSON object per file.
///
/// The whole object is parsed on open, so a handle is just the decoded map;
/// `close` drops it. Adequate for tests and small datasets, and a reference
/// for wiring real container formats (HDF5 and friends) into the trait.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonBundle;

#[derive(Debug)]
pub struct JsonBundleHandle {
    samples: Option<BTreeMap<String, Record>>,
}

impl JsonBundle {
    /// Write a bundle file holding `samples`. Fixture helper for tests and
    /// dataset-preparation tools.
    pub fn write_bundle(path: &Path, samples: &BTreeMap<String, Record>) -> Result<()> {
        let f = File::create(path)?;
        serde_json::to_writer(BufWriter::new(f), samples)?;
        Ok(())
    }
}

impl BundleFormat for JsonBundle {
    type Handle = JsonBundleHandle;

    fn open_for_read(&self, path: &Path) -> Result<Self::Handle> {
        let f = File::open(path)?;
        let samples: BTreeMap<String, Record> = serde_json::from_reader(BufReader::new(f))?;
        Ok(JsonBundleHandle {
            samples: Some(samples),
        })
    }

    fn close(&self, handle: &mut Self::Handle) {
        handle.samples = None;
    }

    fn is_valid(&self, handle: &Self::Handle) -> bool {
        handle.samples.is_some()
    }

    fn list_sample_names(&self, handle: &Self::Handle) -> Result<Vec<String>> {
        let samples = handle.samples.as_ref().ok_or_else(|| {
            StageError::Invariant("list_sample_names on a closed bundle handle".into())
        })?;
        Ok(samples.keys().cloned().collect())
    }

    fn read_sample(&self, handle: &Self::Handle, name: &str) -> Result<Record> {
        let samples = handle.samples.as_ref().ok_or_else(|| {
            StageError::Invariant("read_sample on a closed bundle handle".into())
        })?;
        samples.get(name).cloned().ok_or_else(|| StageError::UnknownSample {
            name: name.to_string(),
            file: "<open bundle>".to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::Value;

    fn fixture() -> BTreeMap<String, Record> {
        let mut samples = BTreeMap::new();
        for name in ["s0", "s1", "s2"] {
            let mut r = Record::new();
            r.set(&format!("{}/x", name), Value::Float(1.0));
            samples.insert(name.to_string(), r);
        }
        samples
    }

    #[test]
    fn json_bundle_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run0.bundle");
        JsonBundle::write_bundle(&path, &fixture()).unwrap();

        let b = JsonBundle;
        let mut h = b.open_for_read(&path).unwrap();
        assert!(b.is_valid(&h));
        assert_eq!(b.list_sample_names(&h).unwrap(), vec!["s0", "s1", "s2"]);
        let r = b.read_sample(&h, "s1").unwrap();
        assert_eq!(r.get("s1/x"), Some(&Value::Float(1.0)));
        assert!(b.read_sample(&h, "nope").is_err());

        b.close(&mut h);
        assert!(!b.is_valid(&h));
    }

    #[test]
    fn open_with_retry_reports_attempts() {
        let b = JsonBundle;
        let err = open_with_retry(&b, Path::new("/no/such/file.bundle"), 3).unwrap_err();
        match err {
            StageError::FileOpenError { attempts, .. } => assert_eq!(attempts, 3),
            other => panic!("unexpected error: {other}"),
        }
    }
}
