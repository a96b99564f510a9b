//! # FILE CODE SOURCE
//!
//! Real file access for job and macro files, backing `mc_core::code::FileOpener`.
//! Parsing each line goes through `mc_core::code::parse_line`, which is
//! deliberately small (letter-plus-number parameters, no inline
//! expressions) — the full grammar is the out-of-scope lexer's job. This
//! is enough to dispatch real files end to end against the daemon.

use std::fs;
use std::path::{Path, PathBuf};

use mc_core::code::{parse_line, Channel, Code, CodeSource, FileOpener};
use mc_core::{CancelToken, CoreError, CoreResult};

pub struct FileCodeSource {
  lines: std::vec::IntoIter<(u64, String)>,
  position: u64,
}

impl FileCodeSource {
  pub fn open(path: &Path) -> CoreResult<Self> {
    let text = fs::read_to_string(path).map_err(|err| CoreError::FileError(format!("{}: {err}", path.display())))?;
    let mut lines = Vec::new();
    let mut offset = 0u64;
    for line in text.split_inclusive('\n') {
      let content_len = line.trim_end_matches(['\n', '\r']).len();
      lines.push((offset, line[..content_len].to_string()));
      offset += line.len() as u64;
    }
    Ok(Self { lines: lines.into_iter(), position: 0 })
  }
}

impl CodeSource for FileCodeSource {
  fn next_code(&mut self) -> CoreResult<Option<Code>> {
    let Some((offset, text)) = self.lines.next() else {
      return Ok(None);
    };
    let consumed = text.len() as u64 + 1;
    self.position = offset + consumed;
    let (kind, major, minor, params) = parse_line(&text);
    Ok(Some(Code {
      kind,
      major,
      minor,
      params,
      channel: Channel::File,
      source_offset: Some(offset),
      length: consumed as u32,
      cancel: CancelToken::root(),
    }))
  }

  fn position(&self) -> u64 {
    self.position
  }
}

/// Resolves macro/job filenames against a fixed root directory and opens
/// them with [`FileCodeSource`]. Existence is checked explicitly so a
/// missing file is reported as [`CoreError::FileError`] rather than
/// silently producing an empty source.
pub struct FsFileOpener {
  root: PathBuf,
}

impl FsFileOpener {
  pub fn new(root: PathBuf) -> Self {
    Self { root }
  }
}

impl FileOpener for FsFileOpener {
  fn open(&self, filename: &str) -> CoreResult<Box<dyn CodeSource>> {
    let path = self.root.join(filename);
    if !path.is_file() {
      return Err(CoreError::FileError(format!("{} not found", path.display())));
    }
    Ok(Box::new(FileCodeSource::open(&path)?))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn reads_lines_into_codes_with_advancing_offsets() {
    let dir = std::env::temp_dir().join("mcd-codesource-test-basic.g");
    fs::write(&dir, "G28\nG1 X10 Y20\n").unwrap();
    let mut source = FileCodeSource::open(&dir).unwrap();
    let first = source.next_code().unwrap().unwrap();
    assert_eq!(first.major, 28);
    assert_eq!(first.source_offset, Some(0));
    let second = source.next_code().unwrap().unwrap();
    assert_eq!(second.params[0], ('X', mc_core::ParamValue::Int(10)));
    assert_eq!(second.source_offset, Some(4));
    assert!(source.next_code().unwrap().is_none());
    fs::remove_file(&dir).unwrap();
  }

  #[test]
  fn opener_reports_missing_files_instead_of_an_empty_source() {
    let opener = FsFileOpener::new(std::env::temp_dir());
    assert!(opener.open("does-not-exist.g").is_err());
  }

  #[test]
  fn opener_reads_an_existing_file() {
    let dir = std::env::temp_dir();
    let path = dir.join("mcd-codesource-test-opener.g");
    fs::write(&path, "M104 S200\n").unwrap();
    let opener = FsFileOpener::new(dir);
    let mut source = opener.open("mcd-codesource-test-opener.g").unwrap();
    let code = source.next_code().unwrap().unwrap();
    assert_eq!(code.major, 104);
    fs::remove_file(&path).unwrap();
  }
}
