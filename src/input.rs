//! Edge-list file parsing.
//!
//! One edge per line, `src<sep>dest[<sep>op]`, where `<sep>` is a comma or
//! whitespace, detected from the first line (no comma means whitespace).
//! The optional third field is `1` for an insertion and `0` for a deletion;
//! lines without it take the file-wide default. The largest vertex id seen
//! establishes the store size.

use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use thiserror::Error;

/// Kind of update a line describes.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Op {
    /// Insert the edge.
    Add,
    /// Delete the edge.
    Delete,
}

/// One parsed update.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Update {
    /// What to do with the edge.
    pub op: Op,
    /// Source vertex id.
    pub src: u32,
    /// Destination vertex id.
    pub dest: u32,
}

/// Failures while reading an edge list.
#[derive(Debug, Error)]
pub enum ParseError {
    /// The file could not be opened or read.
    #[error("failed to read {path}: {source}")]
    Io {
        /// Offending path.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },
    /// A line did not contain two vertex ids.
    #[error("{path}:{line}: malformed edge record `{text}`")]
    Malformed {
        /// Offending path.
        path: PathBuf,
        /// 1-based line number.
        line: usize,
        /// The rejected line.
        text: String,
    },
    /// The third field was neither `0` nor `1`.
    #[error("{path}:{line}: invalid operation flag `{flag}`")]
    BadOp {
        /// Offending path.
        path: PathBuf,
        /// 1-based line number.
        line: usize,
        /// The rejected flag.
        flag: String,
    },
}

/// Reads an edge list, returning the updates in file order and the largest
/// vertex id encountered (0 for an empty file).
pub fn read_updates(path: &Path, default_op: Op) -> Result<(Vec<Update>, u32), ParseError> {
    let file = std::fs::File::open(path).map_err(|source| ParseError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let reader = BufReader::new(file);

    let mut updates = Vec::new();
    let mut max_vertex = 0u32;
    let mut comma_separated: Option<bool> = None;

    for (idx, line) in reader.lines().enumerate() {
        let line = line.map_err(|source| ParseError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let text = line.trim();
        if text.is_empty() {
            continue;
        }
        let comma = *comma_separated.get_or_insert_with(|| text.contains(','));

        let mut fields = if comma {
            Field::Comma(text.split(','))
        } else {
            Field::Space(text.split_whitespace())
        };
        let malformed = || ParseError::Malformed {
            path: path.to_path_buf(),
            line: idx + 1,
            text: text.to_string(),
        };
        let src: u32 = fields
            .next()
            .and_then(|f| f.trim().parse().ok())
            .ok_or_else(|| malformed())?;
        let dest: u32 = fields
            .next()
            .and_then(|f| f.trim().parse().ok())
            .ok_or_else(|| malformed())?;
        let op = match fields.next().map(str::trim).filter(|f| !f.is_empty()) {
            None => default_op,
            Some("1") => Op::Add,
            Some("0") => Op::Delete,
            Some(flag) => {
                return Err(ParseError::BadOp {
                    path: path.to_path_buf(),
                    line: idx + 1,
                    flag: flag.to_string(),
                })
            }
        };

        max_vertex = max_vertex.max(src).max(dest);
        updates.push(Update { op, src, dest });
    }
    Ok((updates, max_vertex))
}

enum Field<'a> {
    Comma(std::str::Split<'a, char>),
    Space(std::str::SplitWhitespace<'a>),
}

impl<'a> Iterator for Field<'a> {
    type Item = &'a str;

    fn next(&mut self) -> Option<&'a str> {
        match self {
            Field::Comma(it) => it.next(),
            Field::Space(it) => it.next(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_tmp(name: &str, contents: &str) -> PathBuf {
        let mut path = std::env::temp_dir();
        path.push(format!("strata-input-{name}-{}", std::process::id()));
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(contents.as_bytes()).unwrap();
        path
    }

    #[test]
    fn parses_space_separated() {
        let path = write_tmp("space", "0 1\n2 3\n\n4 0\n");
        let (updates, max) = read_updates(&path, Op::Add).unwrap();
        std::fs::remove_file(&path).unwrap();
        assert_eq!(updates.len(), 3);
        assert_eq!(max, 4);
        assert_eq!(
            updates[0],
            Update {
                op: Op::Add,
                src: 0,
                dest: 1
            }
        );
    }

    #[test]
    fn parses_comma_separated_with_ops() {
        let path = write_tmp("comma", "0,1,1\n1,2,0\n2,3\n");
        let (updates, max) = read_updates(&path, Op::Delete).unwrap();
        std::fs::remove_file(&path).unwrap();
        assert_eq!(max, 3);
        assert_eq!(updates[0].op, Op::Add);
        assert_eq!(updates[1].op, Op::Delete);
        assert_eq!(updates[2].op, Op::Delete); // file default
    }

    #[test]
    fn rejects_garbage() {
        let path = write_tmp("garbage", "0 not-a-number\n");
        let err = read_updates(&path, Op::Add).unwrap_err();
        std::fs::remove_file(&path).unwrap();
        assert!(matches!(err, ParseError::Malformed { line: 1, .. }));
    }

    #[test]
    fn rejects_bad_op_flag() {
        let path = write_tmp("badop", "0,1,7\n");
        let err = read_updates(&path, Op::Add).unwrap_err();
        std::fs::remove_file(&path).unwrap();
        assert!(matches!(err, ParseError::BadOp { line: 1, .. }));
    }

    #[test]
    fn missing_file_is_an_io_error() {
        let err = read_updates(Path::new("/nonexistent/edges.txt"), Op::Add).unwrap_err();
        assert!(matches!(err, ParseError::Io { .. }));
    }
}
