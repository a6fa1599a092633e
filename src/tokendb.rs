//! Load, index, and validate the token database (§4.9). A flat
//! dictionary, immutable once loaded -- the only module-level state
//! this core permits is this database within a single decoder
//! session (§9 "No global singletons").
use std::collections::HashMap;
use std::io::BufRead;
use std::path::Path;

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::diag;
use crate::fnv::fnv1a_32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Level {
    Error,
    Warn,
    Info,
    Debug,
    /// Not stored in the database; assigned to packets whose
    /// `token_hash` has no matching record (§4.10 point 4).
    Unknown,
}

impl Level {
    /// §3 binary log packet header: `level` occupies the upper nibble
    /// as an index into {ERROR, WARN, INFO, DEBUG}.
    fn from_nibble(nibble: u8) -> Option<Level> {
        match nibble {
            0 => Some(Level::Error),
            1 => Some(Level::Warn),
            2 => Some(Level::Info),
            3 => Some(Level::Debug),
            _ => None,
        }
    }

    pub(crate) fn to_nibble(self) -> u8 {
        match self {
            Level::Error => 0,
            Level::Warn => 1,
            Level::Info => 2,
            Level::Debug => 3,
            Level::Unknown => 0xF,
        }
    }

    pub(crate) fn from_header_byte(byte: u8) -> Option<Level> {
        Self::from_nibble(byte >> 4)
    }
}

impl std::fmt::Display for Level {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Level::Error => "ERROR",
            Level::Warn => "WARN",
            Level::Info => "INFO",
            Level::Debug => "DEBUG",
            Level::Unknown => "UNKNOWN",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgType {
    I32,
    U32,
    Hex32,
    F32,
    Str,
}

impl ArgType {
    fn parse(name: &str) -> Option<ArgType> {
        match name {
            "i32" => Some(ArgType::I32),
            "u32" => Some(ArgType::U32),
            "hex32" => Some(ArgType::Hex32),
            "f32" => Some(ArgType::F32),
            "str" => Some(ArgType::Str),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TokenRecord {
    pub token_hash: u32,
    pub level: Level,
    pub format_string: String,
    pub arg_types: Vec<ArgType>,
    pub file: String,
    pub line: u32,
}

#[derive(Debug, Error)]
pub enum DatabaseError {
    #[error("failed to open token database {0}: {1}")]
    Io(std::path::PathBuf, #[source] std::io::Error),
    #[error("malformed row {0} in token database: {1}")]
    MalformedRow(usize, String),
    #[error("duplicate token_hash 0x{0:08x} in token database (rows {1} and {2})")]
    DuplicateHash(u32, usize, usize),
    #[error("token_hash 0x{0:08x} does not match fnv1a_32(format_string) = 0x{1:08x}")]
    HashMismatch(u32, u32),
    #[error("token database is missing its `# build_id=0x...` metadata line")]
    MissingBuildId,
}

impl diag::DiagnosableError for DatabaseError {
    fn diagnose(&self) -> Vec<String> {
        match self {
            DatabaseError::DuplicateHash(..) => vec![
                "Two distinct format strings hashed to the same token_hash. This is a build-blocking collision upstream in the token generator.".into(),
            ],
            _ => vec![],
        }
    }
}

pub struct Database {
    records: HashMap<u32, TokenRecord>,
    build_id: u32,
}

impl Database {
    pub fn load(path: &Path) -> Result<Self, DatabaseError> {
        let file = std::fs::File::open(path).map_err(|e| DatabaseError::Io(path.to_path_buf(), e))?;
        let reader = std::io::BufReader::new(file);

        let mut build_id = None;
        let mut rows: Vec<(usize, csv::StringRecord)> = Vec::new();

        // A single pre-pass line reader lets us pick out the
        // `# build_id=` comment (which `csv` would otherwise just
        // treat as a skippable comment line) before handing the rest
        // to a proper CSV reader.
        let mut raw = String::new();
        for line in reader.lines() {
            let line = line.map_err(|e| DatabaseError::Io(path.to_path_buf(), e))?;
            if let Some(rest) = line.strip_prefix("# build_id=") {
                build_id = u32::from_str_radix(rest.trim_start_matches("0x"), 16).ok();
                continue;
            }
            if line.starts_with('#') {
                continue;
            }
            raw.push_str(&line);
            raw.push('\n');
        }

        let mut csv_reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .from_reader(raw.as_bytes());

        for (i, record) in csv_reader.records().enumerate() {
            let record = record.map_err(|e| DatabaseError::MalformedRow(i + 2, e.to_string()))?;
            rows.push((i + 2, record));
        }

        let mut records = HashMap::new();
        let mut first_seen_row: HashMap<u32, usize> = HashMap::new();
        for (row_no, record) in rows {
            let hash_str = record
                .get(0)
                .ok_or_else(|| DatabaseError::MalformedRow(row_no, "missing token_hash".into()))?;
            let token_hash = u32::from_str_radix(hash_str.trim_start_matches("0x"), 16)
                .map_err(|_| DatabaseError::MalformedRow(row_no, format!("bad token_hash {hash_str}")))?;

            let level = match record.get(1).unwrap_or("") {
                "ERROR" => Level::Error,
                "WARN" => Level::Warn,
                "INFO" => Level::Info,
                "DEBUG" => Level::Debug,
                other => {
                    return Err(DatabaseError::MalformedRow(row_no, format!("bad level {other}")))
                }
            };

            let format_string = record
                .get(2)
                .ok_or_else(|| DatabaseError::MalformedRow(row_no, "missing format_string".into()))?
                .to_string();

            let arg_types = record
                .get(3)
                .unwrap_or("")
                .split(|c| c == ';' || c == '|')
                .filter(|s| !s.is_empty())
                .map(|s| {
                    ArgType::parse(s.trim())
                        .ok_or_else(|| DatabaseError::MalformedRow(row_no, format!("bad arg type {s}")))
                })
                .collect::<Result<Vec<_>, _>>()?;

            let file = record.get(4).unwrap_or("").to_string();
            let line = record
                .get(5)
                .unwrap_or("0")
                .parse()
                .map_err(|_| DatabaseError::MalformedRow(row_no, "bad line number".into()))?;

            let computed_hash = fnv1a_32(format_string.as_bytes());
            if computed_hash != token_hash {
                return Err(DatabaseError::HashMismatch(token_hash, computed_hash));
            }

            if let Some(&first_row) = first_seen_row.get(&token_hash) {
                return Err(DatabaseError::DuplicateHash(token_hash, first_row, row_no));
            }
            first_seen_row.insert(token_hash, row_no);

            records.insert(
                token_hash,
                TokenRecord {
                    token_hash,
                    level,
                    format_string,
                    arg_types,
                    file,
                    line,
                },
            );
        }

        let build_id = build_id.ok_or(DatabaseError::MissingBuildId)?;

        Ok(Database { records, build_id })
    }

    pub fn lookup(&self, hash: u32) -> Option<&TokenRecord> {
        self.records.get(&hash)
    }

    pub fn build_id(&self) -> u32 {
        self.build_id
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Derives `arg_types` from a printf-style format string, for callers
/// (e.g. a test fixture or a replacement token generator) that only
/// have the format string and not a pre-computed `arg_types` column.
pub fn derive_arg_types(format_string: &str) -> Vec<ArgType> {
    let re = Regex::new(r"%[-+ #0-9.]*(?:hh|h|ll|l|L|z|j|t)?([diouxXeEfFgGaAcsp])").unwrap();
    re.captures_iter(format_string)
        .filter_map(|c| match &c[1] {
            "d" | "i" => Some(ArgType::I32),
            "u" | "o" => Some(ArgType::U32),
            "x" | "X" => Some(ArgType::Hex32),
            "e" | "E" | "f" | "F" | "g" | "G" | "a" | "A" => Some(ArgType::F32),
            "s" => Some(ArgType::Str),
            _ => None,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_db(dir: &Path, body: &str) -> std::path::PathBuf {
        let path = dir.join("tokens.csv");
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(body.as_bytes()).unwrap();
        path
    }

    fn row_for(fmt: &str) -> (u32, String) {
        (fnv1a_32(fmt.as_bytes()), fmt.to_string())
    }

    #[test]
    fn loads_and_looks_up() {
        let dir = tempfile::tempdir().unwrap();
        let (hash, fmt) = row_for("Motor rpm=%d, temp=%f");
        let body = format!(
            "# build_id=0x{:08x}\ntoken_hash,level,format_string,arg_types,file,line\n0x{:08x},INFO,\"{}\",i32;f32,main.c,87\n",
            crate::fnv::build_id_of([hash]),
            hash,
            fmt
        );
        let path = write_db(dir.path(), &body);

        let db = Database::load(&path).unwrap();
        assert_eq!(db.len(), 1);
        let record = db.lookup(hash).unwrap();
        assert_eq!(record.level, Level::Info);
        assert_eq!(record.arg_types, vec![ArgType::I32, ArgType::F32]);
        assert_eq!(record.file, "main.c");
        assert_eq!(record.line, 87);
    }

    #[test]
    fn rejects_duplicate_hash() {
        let dir = tempfile::tempdir().unwrap();
        let (hash, fmt) = row_for("same hash");
        let body = format!(
            "# build_id=0x00000000\ntoken_hash,level,format_string,arg_types,file,line\n0x{hash:08x},INFO,\"{fmt}\",,a.c,1\n0x{hash:08x},INFO,\"{fmt}\",,b.c,2\n"
        );
        let path = write_db(dir.path(), &body);
        assert!(matches!(
            Database::load(&path),
            Err(DatabaseError::DuplicateHash(..))
        ));
    }

    #[test]
    fn rejects_hash_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let body = "# build_id=0x00000000\ntoken_hash,level,format_string,arg_types,file,line\n0xdeadbeef,INFO,\"not the hashed string\",,a.c,1\n";
        let path = write_db(dir.path(), body);
        assert!(matches!(
            Database::load(&path),
            Err(DatabaseError::HashMismatch(..))
        ));
    }

    #[test]
    fn derives_arg_types_from_format_string() {
        let types = derive_arg_types("Motor rpm=%d, temp=%f, name=%s");
        assert_eq!(types, vec![ArgType::I32, ArgType::F32, ArgType::Str]);
    }
}
