use crate::config::LabelsSettings;
use std::{
    collections::HashMap,
    fs::File,
    io::{self, BufRead, BufReader},
    path::Path,
};

pub const UNKNOWN_CATEGORY: &str = "Unknown";

/// Static detection metadata: the model's class list and the nutri-score
/// table keyed by class name.
#[derive(Debug)]
pub struct LabelCatalog {
    classes: Vec<String>,
    scores: HashMap<String, String>,
}

impl LabelCatalog {
    pub fn load(settings: &LabelsSettings) -> io::Result<Self> {
        let classes = load_class_labels(&settings.get_labels_path())?;
        let scores = load_nutri_scores(&settings.get_scores_path())?;
        Ok(Self { classes, scores })
    }

    pub fn from_parts(classes: Vec<String>, scores: HashMap<String, String>) -> Self {
        Self { classes, scores }
    }

    pub fn class_name(&self, class_id: usize) -> Option<&str> {
        self.classes.get(class_id).map(String::as_str)
    }

    pub fn nutri_score(&self, class_name: &str) -> &str {
        self.scores
            .get(class_name)
            .map(String::as_str)
            .unwrap_or(UNKNOWN_CATEGORY)
    }

    pub fn len(&self) -> usize {
        self.classes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }
}

pub fn load_class_labels(filepath: &Path) -> io::Result<Vec<String>> {
    let file = File::open(filepath)?;
    let reader = BufReader::new(file);
    let mut labels = Vec::new();

    for line_result in reader.lines() {
        let line = line_result?;
        let label = line.trim();
        if !label.is_empty() {
            labels.push(label.to_string());
        }
    }

    Ok(labels)
}

pub fn load_nutri_scores(filepath: &Path) -> io::Result<HashMap<String, String>> {
    let file = File::open(filepath)?;
    parse_nutri_scores(BufReader::new(file))
}

fn parse_nutri_scores<R: BufRead>(reader: R) -> io::Result<HashMap<String, String>> {
    let mut scores = HashMap::new();

    for line_result in reader.lines() {
        let line = line_result?;
        if line.trim().is_empty() {
            continue;
        }
        let parts: Vec<&str> = line.split(',').collect();

        if parts.len() == 2 {
            scores.insert(parts[0].trim().to_string(), parts[1].trim().to_string());
        } else {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("Invalid line format: {}", line),
            ));
        }
    }

    Ok(scores)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn catalog() -> LabelCatalog {
        let classes = vec!["pasta rummo".to_string(), "koffie ekoplaza".to_string()];
        let mut scores = HashMap::new();
        scores.insert("pasta rummo".to_string(), "A".to_string());
        LabelCatalog::from_parts(classes, scores)
    }

    #[test]
    fn class_name_resolves_by_id() {
        let catalog = catalog();
        assert_eq!(catalog.class_name(0), Some("pasta rummo"));
        assert_eq!(catalog.class_name(1), Some("koffie ekoplaza"));
        assert_eq!(catalog.class_name(2), None);
    }

    #[test]
    fn nutri_score_falls_back_to_unknown() {
        let catalog = catalog();
        assert_eq!(catalog.nutri_score("pasta rummo"), "A");
        assert_eq!(catalog.nutri_score("koffie ekoplaza"), UNKNOWN_CATEGORY);
        assert_eq!(catalog.nutri_score("never seen"), UNKNOWN_CATEGORY);
    }

    #[test]
    fn parses_score_lines() {
        let input = "pasta rummo,A\nkoffie ekoplaza, D\n\n";
        let scores = parse_nutri_scores(Cursor::new(input)).unwrap();
        assert_eq!(scores.get("pasta rummo").map(String::as_str), Some("A"));
        assert_eq!(scores.get("koffie ekoplaza").map(String::as_str), Some("D"));
    }

    #[test]
    fn rejects_malformed_score_lines() {
        let input = "pasta rummo,A,extra";
        assert!(parse_nutri_scores(Cursor::new(input)).is_err());
    }

    #[test]
    fn loads_labels_and_scores_from_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("labels.txt"), "pasta rummo\npasta de cecco\n").unwrap();
        std::fs::write(dir.path().join("scores.csv"), "pasta de cecco,A\n").unwrap();

        let settings = crate::config::LabelsSettings {
            labels_file: "labels.txt".to_string(),
            scores_file: "scores.csv".to_string(),
            labels_dir: dir.path().to_path_buf(),
        };

        let catalog = LabelCatalog::load(&settings).unwrap();
        assert_eq!(catalog.len(), 2);
        assert_eq!(catalog.class_name(1), Some("pasta de cecco"));
        assert_eq!(catalog.nutri_score("pasta de cecco"), "A");
        assert_eq!(catalog.nutri_score("pasta rummo"), UNKNOWN_CATEGORY);
    }
}
