//! Database directory layout.
//!
//! ```text
//! <db>/000007.log      write-ahead log for memtable 7
//! <db>/000012.ldb      sstable 12
//! <db>/000013.dbtmp    sstable 13 under construction
//! <db>/MANIFEST-000005 descriptor log
//! <db>/CURRENT         one line: "MANIFEST-000005\n"
//! <db>/LOCK            held while the db is open
//! <db>/LOG, LOG.old    informational logs
//! ```

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::Result;

/// Kind of file living in a database directory.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FileType {
    Log,
    Lock,
    Table,
    Descriptor,
    Current,
    Temp,
    InfoLog,
}

pub fn log_file_name(dbname: &Path, number: u64) -> PathBuf {
    dbname.join(format!("{:06}.log", number))
}

pub fn table_file_name(dbname: &Path, number: u64) -> PathBuf {
    dbname.join(format!("{:06}.ldb", number))
}

pub fn temp_file_name(dbname: &Path, number: u64) -> PathBuf {
    dbname.join(format!("{:06}.dbtmp", number))
}

pub fn descriptor_file_name(dbname: &Path, number: u64) -> PathBuf {
    dbname.join(format!("MANIFEST-{:06}", number))
}

pub fn current_file_name(dbname: &Path) -> PathBuf {
    dbname.join("CURRENT")
}

pub fn lock_file_name(dbname: &Path) -> PathBuf {
    dbname.join("LOCK")
}

pub fn info_log_file_name(dbname: &Path) -> PathBuf {
    dbname.join("LOG")
}

pub fn old_info_log_file_name(dbname: &Path) -> PathBuf {
    dbname.join("LOG.old")
}

/// Parses a bare file name from a database directory. Returns the embedded
/// number (0 where the name carries none) and the file type, or None for
/// foreign files.
pub fn parse_file_name(name: &str) -> Option<(u64, FileType)> {
    if name == "CURRENT" {
        return Some((0, FileType::Current));
    }
    if name == "LOCK" {
        return Some((0, FileType::Lock));
    }
    if name == "LOG" || name == "LOG.old" {
        return Some((0, FileType::InfoLog));
    }
    if let Some(rest) = name.strip_prefix("MANIFEST-") {
        let number = rest.parse::<u64>().ok()?;
        return Some((number, FileType::Descriptor));
    }
    let (stem, ext) = name.split_once('.')?;
    let number = stem.parse::<u64>().ok()?;
    match ext {
        "log" => Some((number, FileType::Log)),
        "ldb" => Some((number, FileType::Table)),
        "dbtmp" => Some((number, FileType::Temp)),
        _ => None,
    }
}

/// Points CURRENT at the descriptor with the given number. Written through a
/// temp file and renamed so a crash never leaves a partial CURRENT.
pub fn set_current_file(dbname: &Path, descriptor_number: u64) -> Result<()> {
    let contents = format!("MANIFEST-{:06}\n", descriptor_number);
    let tmp = temp_file_name(dbname, descriptor_number);
    {
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp)?;
        file.write_all(contents.as_bytes())?;
        file.sync_all()?;
    }
    fs::rename(&tmp, current_file_name(dbname))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_name_formats() {
        let db = Path::new("/data/db");
        assert_eq!(log_file_name(db, 7), Path::new("/data/db/000007.log"));
        assert_eq!(table_file_name(db, 12), Path::new("/data/db/000012.ldb"));
        assert_eq!(temp_file_name(db, 13), Path::new("/data/db/000013.dbtmp"));
        assert_eq!(
            descriptor_file_name(db, 5),
            Path::new("/data/db/MANIFEST-000005")
        );
        assert_eq!(current_file_name(db), Path::new("/data/db/CURRENT"));
    }

    #[test]
    fn test_parse_file_name() {
        assert_eq!(parse_file_name("000007.log"), Some((7, FileType::Log)));
        assert_eq!(parse_file_name("000012.ldb"), Some((12, FileType::Table)));
        assert_eq!(parse_file_name("000013.dbtmp"), Some((13, FileType::Temp)));
        assert_eq!(
            parse_file_name("MANIFEST-000005"),
            Some((5, FileType::Descriptor))
        );
        assert_eq!(parse_file_name("CURRENT"), Some((0, FileType::Current)));
        assert_eq!(parse_file_name("LOCK"), Some((0, FileType::Lock)));
        assert_eq!(parse_file_name("LOG"), Some((0, FileType::InfoLog)));
        assert_eq!(parse_file_name("LOG.old"), Some((0, FileType::InfoLog)));
        assert_eq!(parse_file_name("readme.txt"), None);
        assert_eq!(parse_file_name("xyz.ldb"), None);
    }

    #[test]
    fn test_set_current_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        set_current_file(dir.path(), 42).expect("set current");
        let contents = fs::read_to_string(current_file_name(dir.path())).expect("read");
        assert_eq!(contents, "MANIFEST-000042\n");
        // The temp file used for the atomic rename is gone.
        assert!(!temp_file_name(dir.path(), 42).exists());
    }
}
