use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use crate::error::Result;

/// Class labels in model output order.
pub const CLASS_NAMES: [&str; 9] = [
    "Anthracnose",
    "Banana Fruit-Scarring Beetle",
    "Banana Skipper Damage",
    "Banana Split Peel",
    "Black and Yellow Sigatoka",
    "Chewing insect damage on banana leaf",
    "Healthy Banana",
    "Healthy Banana leaf",
    "Panama Wilt Disease",
];

pub fn default_labels() -> Vec<String> {
    CLASS_NAMES.iter().map(|s| s.to_string()).collect()
}

/// Reads one label per line. Index in the returned vector is the model output position.
pub fn load_class_mapping<P: AsRef<Path>>(file_path: P) -> Result<Vec<String>> {
    let file = File::open(file_path)?;
    let reader = BufReader::new(file);

    let mut labels = Vec::new();
    for line in reader.lines() {
        let line = line?;
        let name = line.trim();
        if !name.is_empty() {
            labels.push(name.to_string());
        }
    }
    Ok(labels)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn default_labels_has_nine_classes() {
        let labels = default_labels();
        assert_eq!(labels.len(), 9);
        assert_eq!(labels[0], "Anthracnose");
        assert_eq!(labels[8], "Panama Wilt Disease");
    }

    #[test]
    fn load_class_mapping_trims_and_skips_blank_lines() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "  Healthy Banana  ").unwrap();
        writeln!(file).unwrap();
        writeln!(file, "Anthracnose").unwrap();

        let labels = load_class_mapping(file.path()).unwrap();
        assert_eq!(labels, vec!["Healthy Banana", "Anthracnose"]);
    }

    #[test]
    fn load_class_mapping_missing_file_is_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_class_mapping(dir.path().join("labels.txt")).is_err());
    }
}
