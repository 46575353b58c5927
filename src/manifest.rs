// src/manifest.rs
//
//! Sample-list manifest parsing.
//!
//! A manifest is newline-terminated text:
//!
//! ```text
//! line 1: BUNDLE_EXCLUSION | BUNDLE_INCLUSION [...]
//! line 2: <included_count> <excluded_count> <num_files>
//! line 3: <root_directory>
//! line 4..N: <filename> <included> <excluded> [<name>...]
//! ```
//!
//! In exclusion form the trailing tokens are the names to *exclude* from the
//! file's full sample set; in inclusion form they are the included names
//! directly. This module parses the header and tokenizes body lines; list
//! assembly (which needs to open bundle files) lives in
//! [`crate::sample_list`].

use std::fmt;
use std::io::BufRead;
use std::path::{Path, PathBuf};

use crate::constants::SAMPLE_EXCLUSION_LIST;
use crate::error::{Result, StageError};

/// The native identifier of a sample inside a bundle file. Names appear as
/// whitespace-delimited tokens in a manifest, so anything parseable from
/// text (integer, float, string) qualifies.
pub trait SampleName:
    Clone + fmt::Debug + fmt::Display + PartialEq + Send + Sync + 'static
{
    fn parse(text: &str) -> Result<Self>;
}

macro_rules! numeric_sample_name {
    ($($t:ty),*) => {$(
        impl SampleName for $t {
            fn parse(text: &str) -> Result<Self> {
                text.parse::<$t>().map_err(|e| StageError::MalformedHeader {
                    list: "<sample name>".to_string(),
                    detail: format!("cannot parse '{}' as {}: {}", text, stringify!($t), e),
                })
            }
        }
    )*};
}

numeric_sample_name!(i64, u64, f64);

impl SampleName for String {
    fn parse(text: &str) -> Result<Self> {
        Ok(text.to_string())
    }
}

/// Parsed three-line manifest header.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ManifestHeader {
    exclusive: bool,
    included_count: usize,
    excluded_count: usize,
    num_files: usize,
    root_dir: PathBuf,
    list_name: String,
}

impl ManifestHeader {
    pub fn is_exclusive(&self) -> bool {
        self.exclusive
    }

    /// Force the encoding flag; the loader flips an exclusion list to
    /// inclusion form once the exclusions have been resolved.
    pub(crate) fn set_exclusive(&mut self, exclusive: bool) {
        self.exclusive = exclusive;
    }

    /// Re-point the counts at what a list actually holds, after a merge or
    /// split changes its contents.
    pub(crate) fn set_counts(&mut self, included: usize, num_files: usize) {
        self.included_count = included;
        self.num_files = num_files;
    }

    pub fn sample_count(&self) -> usize {
        self.included_count
    }

    pub fn excluded_count(&self) -> usize {
        self.excluded_count
    }

    pub fn num_files(&self) -> usize {
        self.num_files
    }

    pub fn root_dir(&self) -> &Path {
        &self.root_dir
    }

    /// The manifest's own filename (or a placeholder for in-memory loads),
    /// used in error context.
    pub fn list_name(&self) -> &str {
        &self.list_name
    }
}

fn read_header_line<R: BufRead>(input: &mut R, list: &str, what: &str) -> Result<String> {
    let mut line = String::new();
    let n = input.read_line(&mut line).map_err(|e| StageError::MalformedHeader {
        list: list.to_string(),
        detail: format!("unable to read the header line for {}: {}", what, e),
    })?;
    let line = line.trim();
    if n == 0 || line.is_empty() {
        return Err(StageError::MalformedHeader {
            list: list.to_string(),
            detail: format!("the header line for {} was empty", what),
        });
    }
    Ok(line.to_string())
}

/// Read exactly the three header lines from `input`.
///
/// Line 1's first token, case-folded, decides exclusivity; line 2 carries
/// the three counts; line 3 names the data root directory, which must exist.
pub fn read_header<R: BufRead>(input: &mut R, list: &str) -> Result<ManifestHeader> {
    let line1 = read_header_line(input, list, "the exclusiveness")?;
    let line2 = read_header_line(input, list, "the sample and file counts")?;
    let line3 = read_header_line(input, list, "the data root directory")?;

    let first = line1.split_whitespace().next().unwrap_or("").to_uppercase();
    let exclusive = first.contains(SAMPLE_EXCLUSION_LIST);

    let mut counts = line2.split_whitespace().map(|t| {
        t.parse::<usize>().map_err(|e| StageError::MalformedHeader {
            list: list.to_string(),
            detail: format!("cannot parse count '{}': {}", t, e),
        })
    });
    let mut next_count = |what: &str| {
        counts.next().unwrap_or_else(|| {
            Err(StageError::MalformedHeader {
                list: list.to_string(),
                detail: format!("header line 2 is missing the {}", what),
            })
        })
    };
    let included_count = next_count("included-sample count")?;
    let excluded_count = next_count("excluded-sample count")?;
    let num_files = next_count("file count")?;

    let root_dir = PathBuf::from(line3.split_whitespace().next().unwrap_or(""));
    if root_dir.as_os_str().is_empty() || !root_dir.is_dir() {
        return Err(StageError::MissingRootDir {
            list: list.to_string(),
            dir: root_dir.display().to_string(),
        });
    }

    Ok(ManifestHeader {
        exclusive,
        included_count,
        excluded_count,
        num_files,
        root_dir,
        list_name: list.to_string(),
    })
}

/// One tokenized manifest body line. `names` are exclusions in exclusive
/// mode and inclusions in inclusive mode.
#[derive(Debug, Clone, PartialEq)]
pub struct FileLine {
    pub filename: String,
    pub included: usize,
    pub excluded: usize,
    pub names: Vec<String>,
}

/// Tokenize one non-blank body line.
pub fn parse_file_line(line: &str, list: &str) -> Result<FileLine> {
    let mut tokens = line.split_whitespace();
    let malformed = |detail: String| StageError::MalformedHeader {
        list: list.to_string(),
        detail,
    };
    let filename = tokens
        .next()
        .ok_or_else(|| malformed("file line is missing the filename".into()))?
        .to_string();
    let mut count = |what: &str| -> Result<usize> {
        let t = tokens
            .next()
            .ok_or_else(|| malformed(format!("file line for '{}' is missing the {}", filename, what)))?;
        t.parse::<usize>()
            .map_err(|e| malformed(format!("bad {} '{}' for '{}': {}", what, t, filename, e)))
    };
    let included = count("included count")?;
    let excluded = count("excluded count")?;
    let names = tokens.map(|t| t.to_string()).collect();
    Ok(FileLine {
        filename,
        included,
        excluded,
        names,
    })
}

/// Render the header of an inclusion-form manifest (the only form written;
/// for written lists the excluded count per header is always 0).
pub fn write_header(out: &mut String, sample_count: usize, num_files: usize, root_dir: &Path) {
    out.push_str(crate::constants::SAMPLE_INCLUSION_LIST);
    out.push('\n');
    out.push_str(&format!("{} 0 {}\n", sample_count, num_files));
    out.push_str(&format!("{}\n", root_dir.display()));
}
