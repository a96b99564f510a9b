//! # PLUGIN LIST
//!
//! The set of enabled plugin names persists across restarts as a plain
//! text file, one name per line — no format extension, per the design
//! note that the distilled spec names this file exactly this way.

use std::path::Path;

pub fn load(path: &Path) -> std::io::Result<Vec<String>> {
  match std::fs::read_to_string(path) {
    Ok(text) => Ok(text.lines().map(str::trim).filter(|line| !line.is_empty()).map(str::to_string).collect()),
    Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
    Err(err) => Err(err),
  }
}

pub fn save(path: &Path, names: &[String]) -> std::io::Result<()> {
  let mut text = names.join("\n");
  if !text.is_empty() {
    text.push('\n');
  }
  std::fs::write(path, text)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn loading_a_missing_file_returns_an_empty_list() {
    let path = std::env::temp_dir().join("mcd-plugins-test-missing.list");
    let _ = std::fs::remove_file(&path);
    assert_eq!(load(&path).unwrap(), Vec::<String>::new());
  }

  #[test]
  fn save_then_load_round_trips_plugin_names() {
    let path = std::env::temp_dir().join("mcd-plugins-test-roundtrip.list");
    save(&path, &["leveling".to_string(), "filament_sensor".to_string()]).unwrap();
    assert_eq!(load(&path).unwrap(), vec!["leveling".to_string(), "filament_sensor".to_string()]);
    std::fs::remove_file(&path).unwrap();
  }

  #[test]
  fn blank_lines_are_ignored_on_load() {
    let path = std::env::temp_dir().join("mcd-plugins-test-blank.list");
    std::fs::write(&path, "leveling\n\n\nfilament_sensor\n").unwrap();
    assert_eq!(load(&path).unwrap(), vec!["leveling".to_string(), "filament_sensor".to_string()]);
    std::fs::remove_file(&path).unwrap();
  }
}
