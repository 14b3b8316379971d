use crate::chunking::{build_chunks, ChunkingConfig};
use crate::error::IngestError;
use crate::extractor::extractor_for;
use crate::models::{Chunk, DocType, KnowledgeDocument};
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// Record files expected at the corpus root. Each holds a JSON array and
/// every element becomes exactly one document.
pub const STRUCTURED_FILES: [(&str, DocType); 4] = [
    ("careers.json", DocType::Career),
    ("roadmaps.json", DocType::Roadmap),
    ("skills.json", DocType::Skill),
    ("government_schemes.json", DocType::Scheme),
];

const TITLE_KEYS: [&str; 3] = ["title", "name", "scheme_name"];

#[derive(Debug, Clone)]
pub struct SkippedFile {
    pub path: PathBuf,
    pub reason: String,
}

#[derive(Debug, Default)]
pub struct IngestionReport {
    pub documents: Vec<KnowledgeDocument>,
    pub skipped_files: Vec<SkippedFile>,
    pub files_read: usize,
}

/// Recursively lists files with a supported free-text extension.
pub fn discover_documents(folder: &Path) -> Vec<PathBuf> {
    let mut files = Vec::new();

    for entry in WalkDir::new(folder)
        .into_iter()
        .filter_map(|item| item.ok())
    {
        if !entry.file_type().is_file() {
            continue;
        }

        if extractor_for(entry.path()).is_some() {
            files.push(entry.path().to_path_buf());
        } else {
            debug!(path = %entry.path().display(), "unsupported file type, skipping");
        }
    }

    files.sort_unstable();
    files
}

/// Loads the whole corpus. A file that cannot be read is logged and
/// reported in `skipped_files`; it never aborts the load.
pub fn load_corpus(folder: &Path) -> Result<IngestionReport, IngestError> {
    if !folder.is_dir() {
        return Err(IngestError::InvalidArgument(format!(
            "corpus directory does not exist: {}",
            folder.display()
        )));
    }

    let mut report = IngestionReport::default();

    for (file_name, doc_type) in STRUCTURED_FILES {
        let path = folder.join(file_name);
        if !path.is_file() {
            debug!(path = %path.display(), "structured file absent");
            continue;
        }
        record_outcome(&mut report, path.clone(), load_structured_records(&path, doc_type));
    }

    for path in discover_documents(folder) {
        let outcome = (|| {
            let source = source_name(&path)?;
            let extractor = extractor_for(&path).ok_or_else(|| {
                IngestError::InvalidArgument(format!("unsupported file: {}", path.display()))
            })?;
            extractor.extract(&path, &source)
        })();
        record_outcome(&mut report, path, outcome);
    }

    info!(
        folder = %folder.display(),
        files = report.files_read,
        documents = report.documents.len(),
        skipped = report.skipped_files.len(),
        "corpus loaded"
    );
    Ok(report)
}

fn record_outcome(
    report: &mut IngestionReport,
    path: PathBuf,
    outcome: Result<Vec<KnowledgeDocument>, IngestError>,
) {
    match outcome {
        Ok(documents) => {
            report.files_read += 1;
            report.documents.extend(documents);
        }
        Err(error) => {
            warn!(path = %path.display(), reason = %error, "skipping unreadable file");
            report.skipped_files.push(SkippedFile {
                path,
                reason: error.to_string(),
            });
        }
    }
}

fn source_name(path: &Path) -> Result<String, IngestError> {
    path.file_name()
        .and_then(|name| name.to_str())
        .map(str::to_string)
        .ok_or_else(|| IngestError::MissingFileName(format!("path missing filename: {}", path.display())))
}

pub fn load_structured_records(path: &Path, doc_type: DocType) -> Result<Vec<KnowledgeDocument>, IngestError> {
    let source = source_name(path)?;
    let parsed: Value = serde_json::from_str(&fs::read_to_string(path)?)?;
    let records = parsed.as_array().ok_or_else(|| {
        IngestError::InvalidArgument(format!("{} must hold a JSON array of records", path.display()))
    })?;

    Ok(records
        .iter()
        .enumerate()
        .filter_map(|(index, record)| {
            let text = render_record(record);
            if text.trim().is_empty() {
                return None;
            }

            let mut document = KnowledgeDocument::new(source.as_str(), text, doc_type).with_extra("record", index);
            if let Some(title) = record_title(record) {
                document = document.with_extra("title", title);
            }
            Some(document)
        })
        .collect())
}

fn record_title(record: &Value) -> Option<&str> {
    TITLE_KEYS
        .iter()
        .find_map(|key| record.get(*key).and_then(Value::as_str))
}

/// Renders a record as `key: value` lines. Title-like keys come first, arrays
/// of scalars are joined with `, ` and nested objects use dotted keys.
pub fn render_record(record: &Value) -> String {
    let mut lines = Vec::new();

    match record {
        Value::Object(fields) => {
            let mut keys = fields.keys().collect::<Vec<_>>();
            keys.sort_by_key(|key| !TITLE_KEYS.contains(&key.as_str()));
            for key in keys {
                flatten_into(key, &fields[key.as_str()], &mut lines);
            }
        }
        other => {
            if let Some(value) = scalar_text(other) {
                lines.push(value);
            }
        }
    }

    lines.join("\n")
}

fn flatten_into(prefix: &str, value: &Value, lines: &mut Vec<String>) {
    match value {
        Value::Null => {}
        Value::Object(fields) => {
            for (key, nested) in fields {
                flatten_into(&format!("{prefix}.{key}"), nested, lines);
            }
        }
        Value::Array(items) => {
            let scalars = items.iter().map(scalar_text).collect::<Option<Vec<_>>>();
            match scalars {
                Some(values) if !values.is_empty() => lines.push(format!("{prefix}: {}", values.join(", "))),
                Some(_) => {}
                None => {
                    for item in items {
                        flatten_into(prefix, item, lines);
                    }
                }
            }
        }
        scalar => {
            if let Some(text) = scalar_text(scalar) {
                lines.push(format!("{prefix}: {text}"));
            }
        }
    }
}

fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::String(text) => Some(text.trim().to_string()),
        Value::Number(number) => Some(number.to_string()),
        Value::Bool(flag) => Some(flag.to_string()),
        _ => None,
    }
}

pub fn chunk_documents(documents: &[KnowledgeDocument], config: ChunkingConfig) -> Result<Vec<Chunk>, IngestError> {
    config.validate()?;
    let mut chunks = Vec::new();
    for document in documents {
        chunks.extend(build_chunks(document, config)?);
    }
    Ok(chunks)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::{self, File};
    use std::io::Write;
    use tempfile::tempdir;

    #[test]
    fn discovery_is_recursive_and_filters_extensions() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let base = dir.path();
        let nested = base.join("nested");
        fs::create_dir(&nested)?;

        File::create(base.join("a.txt")).and_then(|mut file| file.write_all(b"alpha"))?;
        File::create(nested.join("b.md")).and_then(|mut file| file.write_all(b"bravo"))?;
        File::create(nested.join("c.png")).and_then(|mut file| file.write_all(b"\x89PNG"))?;

        let files = discover_documents(base);
        assert_eq!(files.len(), 2);
        Ok(())
    }

    #[test]
    fn missing_corpus_is_an_error() {
        let result = load_corpus(Path::new("/definitely/not/a/corpus"));
        assert!(matches!(result, Err(IngestError::InvalidArgument(_))));
    }

    #[test]
    fn one_record_per_structured_entry() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        fs::write(
            dir.path().join("careers.json"),
            r#"[{"title":"Java Developer","requirements":["Java","Spring","SQL"]},
                {"title":"Nurse","requirements":["GNM"],"salary":{"entry":18000}}]"#,
        )?;

        let report = load_corpus(dir.path())?;
        assert_eq!(report.documents.len(), 2);
        assert_eq!(report.documents[0].source_id, "careers.json");
        assert_eq!(report.documents[0].doc_type, DocType::Career);
        assert_eq!(
            report.documents[0].raw_text,
            "title: Java Developer\nrequirements: Java, Spring, SQL"
        );
        assert_eq!(report.documents[1].extra.get("title").map(String::as_str), Some("Nurse"));
        assert!(report.documents[1].raw_text.contains("salary.entry: 18000"));
        Ok(())
    }

    #[test]
    fn best_effort_skips_unreadable_files() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        fs::write(dir.path().join("unreadable.pdf"), b"%PDF-1.4\n%broken")?;
        fs::write(dir.path().join("skills.json"), b"{\"not\": \"an array\"}")?;
        fs::write(dir.path().join("notes.txt"), "Solar technician courses in Kutch")?;

        let report = load_corpus(dir.path())?;

        assert_eq!(report.documents.len(), 1);
        assert_eq!(report.documents[0].source_id, "notes.txt");
        assert_eq!(report.skipped_files.len(), 2);
        let mut skipped = report
            .skipped_files
            .iter()
            .filter_map(|skipped| skipped.path.file_name().and_then(|name| name.to_str()))
            .collect::<Vec<_>>();
        skipped.sort_unstable();
        assert_eq!(skipped, vec!["skills.json", "unreadable.pdf"]);
        Ok(())
    }

    #[test]
    fn nested_arrays_of_objects_are_flattened() {
        let record = serde_json::json!({
            "career": "Electrician",
            "steps": [{"stage": "ITI"}, {"stage": "Apprenticeship"}],
            "remote": false,
            "notes": null
        });
        let text = render_record(&record);
        assert_eq!(
            text,
            "career: Electrician\nremote: false\nsteps.stage: ITI\nsteps.stage: Apprenticeship"
        );
    }

    #[test]
    fn chunking_rejects_bad_config_up_front() {
        let documents = vec![KnowledgeDocument::new("a.txt", "text", DocType::Text)];
        let config = ChunkingConfig { max_chars: 10, overlap_chars: 10 };
        assert!(matches!(
            chunk_documents(&documents, config),
            Err(IngestError::InvalidChunkConfig(_))
        ));
    }
}
