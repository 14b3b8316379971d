use crate::error::IngestError;
use crate::models::{DocType, KnowledgeDocument};
use lopdf::Document;
use quick_xml::events::Event;
use quick_xml::Reader;
use std::fs::{self, File};
use std::io::Read;
use std::path::Path;

/// Reads one file format into normalized documents tagged with `source`.
pub trait Extractor: Send + Sync {
    fn doc_type(&self) -> DocType;
    fn extract(&self, path: &Path, source: &str) -> Result<Vec<KnowledgeDocument>, IngestError>;
}

#[derive(Default)]
pub struct PdfExtractor;

#[derive(Default)]
pub struct TextExtractor;

#[derive(Default)]
pub struct WordExtractor;

#[derive(Default)]
pub struct TableExtractor;

static PDF: PdfExtractor = PdfExtractor;
static TEXT: TextExtractor = TextExtractor;
static WORD: WordExtractor = WordExtractor;
static TABLE: TableExtractor = TableExtractor;

/// Picks the extractor for a file by extension. Unsupported files yield `None`.
pub fn extractor_for(path: &Path) -> Option<&'static dyn Extractor> {
    let extension = path.extension()?.to_str()?.to_ascii_lowercase();
    match extension.as_str() {
        "pdf" => Some(&PDF),
        "txt" | "md" => Some(&TEXT),
        "docx" => Some(&WORD),
        "csv" => Some(&TABLE),
        _ => None,
    }
}

impl Extractor for PdfExtractor {
    fn doc_type(&self) -> DocType {
        DocType::Pdf
    }

    fn extract(&self, path: &Path, source: &str) -> Result<Vec<KnowledgeDocument>, IngestError> {
        let document = Document::load(path).map_err(|error| IngestError::PdfParse(error.to_string()))?;

        let mut pages = Vec::new();
        for (page_no, _page_id) in document.get_pages() {
            let text = document
                .extract_text(&[page_no])
                .map_err(|error| IngestError::PdfParse(error.to_string()))?;

            if !text.trim().is_empty() {
                pages.push(KnowledgeDocument::new(source, text, DocType::Pdf).with_extra("page", page_no));
            }
        }

        if pages.is_empty() {
            return Err(IngestError::PdfParse(format!(
                "pdf had no readable page text: {}",
                path.display()
            )));
        }

        Ok(pages)
    }
}

impl Extractor for TextExtractor {
    fn doc_type(&self) -> DocType {
        DocType::Text
    }

    fn extract(&self, path: &Path, source: &str) -> Result<Vec<KnowledgeDocument>, IngestError> {
        let bytes = fs::read(path)?;
        let text = match String::from_utf8(bytes) {
            Ok(text) => text,
            Err(error) => String::from_utf8_lossy(error.as_bytes()).into_owned(),
        };

        if text.trim().is_empty() {
            return Ok(Vec::new());
        }
        Ok(vec![KnowledgeDocument::new(source, text, DocType::Text)])
    }
}

impl Extractor for WordExtractor {
    fn doc_type(&self) -> DocType {
        DocType::Word
    }

    fn extract(&self, path: &Path, source: &str) -> Result<Vec<KnowledgeDocument>, IngestError> {
        let file = File::open(path)?;
        let mut archive =
            zip::ZipArchive::new(file).map_err(|error| IngestError::WordParse(error.to_string()))?;
        let mut xml = String::new();
        archive
            .by_name("word/document.xml")
            .map_err(|error| IngestError::WordParse(error.to_string()))?
            .read_to_string(&mut xml)?;

        let text = plaintext_from_docx_xml(&xml)?;
        if text.trim().is_empty() {
            return Ok(Vec::new());
        }
        Ok(vec![KnowledgeDocument::new(source, text, DocType::Word)])
    }
}

/// Collects run text from WordprocessingML, one line per paragraph.
pub fn plaintext_from_docx_xml(xml: &str) -> Result<String, IngestError> {
    let mut reader = Reader::from_str(xml);
    let mut text = String::new();
    let mut in_run_text = false;

    loop {
        let event = reader
            .read_event()
            .map_err(|error| IngestError::WordParse(error.to_string()))?;

        match event {
            Event::Start(element) => {
                if element.local_name().as_ref() == b"t" {
                    in_run_text = true;
                }
            }
            Event::Empty(element) => match element.local_name().as_ref() {
                b"tab" => text.push('\t'),
                b"br" | b"cr" => text.push('\n'),
                _ => {}
            },
            Event::Text(content) if in_run_text => {
                let unescaped = content
                    .unescape()
                    .map_err(|error| IngestError::WordParse(error.to_string()))?;
                text.push_str(&unescaped);
            }
            Event::End(element) => match element.local_name().as_ref() {
                b"t" => in_run_text = false,
                b"p" => text.push('\n'),
                _ => {}
            },
            Event::Eof => break,
            _ => {}
        }
    }

    Ok(text)
}

impl Extractor for TableExtractor {
    fn doc_type(&self) -> DocType {
        DocType::Table
    }

    fn extract(&self, path: &Path, source: &str) -> Result<Vec<KnowledgeDocument>, IngestError> {
        let mut reader = csv::ReaderBuilder::new()
            .flexible(true)
            .from_path(path)
            .map_err(|error| IngestError::TableParse(error.to_string()))?;
        let headers = reader
            .headers()
            .map_err(|error| IngestError::TableParse(error.to_string()))?
            .clone();

        let mut rows = Vec::new();
        for (index, record) in reader.records().enumerate() {
            let record = record.map_err(|error| IngestError::TableParse(error.to_string()))?;
            let text = record
                .iter()
                .enumerate()
                .filter(|(_, value)| !value.trim().is_empty())
                .map(|(column, value)| match headers.get(column) {
                    Some(header) if !header.trim().is_empty() => format!("{}: {}", header.trim(), value.trim()),
                    _ => value.trim().to_string(),
                })
                .collect::<Vec<_>>()
                .join("\n");

            if !text.is_empty() {
                rows.push(KnowledgeDocument::new(source, text, DocType::Table).with_extra("row", index + 1));
            }
        }

        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::tempdir;

    #[test]
    fn extractors_are_chosen_by_extension() {
        assert_eq!(extractor_for(Path::new("a/b.PDF")).map(|e| e.doc_type()), Some(DocType::Pdf));
        assert_eq!(extractor_for(Path::new("notes.md")).map(|e| e.doc_type()), Some(DocType::Text));
        assert_eq!(extractor_for(Path::new("cv.docx")).map(|e| e.doc_type()), Some(DocType::Word));
        assert_eq!(extractor_for(Path::new("fees.csv")).map(|e| e.doc_type()), Some(DocType::Table));
        assert!(extractor_for(Path::new("image.png")).is_none());
        assert!(extractor_for(Path::new("README")).is_none());
    }

    #[test]
    fn docx_xml_paragraphs_become_lines() -> Result<(), Box<dyn std::error::Error>> {
        let xml = r#"<w:document xmlns:w="http://schemas.openxmlformats.org/wordprocessingml/2006/main">
            <w:body>
              <w:p><w:r><w:t>Skill &amp; Training</w:t></w:r></w:p>
              <w:p><w:r><w:t xml:space="preserve">Apply </w:t></w:r><w:r><w:tab/><w:t>online</w:t></w:r></w:p>
            </w:body>
          </w:document>"#;

        let text = plaintext_from_docx_xml(xml)?;
        assert_eq!(text, "Skill & Training\nApply \tonline\n");
        Ok(())
    }

    #[test]
    fn docx_archive_is_read() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let path = dir.path().join("guide.docx");
        let mut writer = zip::ZipWriter::new(File::create(&path)?);
        writer.start_file("word/document.xml", zip::write::SimpleFileOptions::default())?;
        writer.write_all(br#"<w:document><w:body><w:p><w:r><w:t>Nursing diploma</w:t></w:r></w:p></w:body></w:document>"#)?;
        writer.finish()?;

        let documents = WordExtractor.extract(&path, "guide.docx")?;
        assert_eq!(documents.len(), 1);
        assert_eq!(documents[0].raw_text.trim(), "Nursing diploma");
        Ok(())
    }

    #[test]
    fn csv_rows_become_documents() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let path = dir.path().join("colleges.csv");
        fs::write(&path, "name,city,fees\nGEC,Gandhinagar,15000\nLDCE,Ahmedabad,\n")?;

        let documents = TableExtractor.extract(&path, "colleges.csv")?;
        assert_eq!(documents.len(), 2);
        assert_eq!(documents[0].raw_text, "name: GEC\ncity: Gandhinagar\nfees: 15000");
        assert_eq!(documents[1].raw_text, "name: LDCE\ncity: Ahmedabad");
        assert_eq!(documents[1].extra.get("row").map(String::as_str), Some("2"));
        Ok(())
    }

    #[test]
    fn invalid_utf8_text_is_read_lossily() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let path = dir.path().join("notes.txt");
        fs::write(&path, b"caf\xe9 menu")?;

        let documents = TextExtractor.extract(&path, "notes.txt")?;
        assert_eq!(documents.len(), 1);
        assert!(documents[0].raw_text.starts_with("caf"));
        Ok(())
    }

    #[test]
    fn broken_pdf_is_an_error() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let path = dir.path().join("broken.pdf");
        fs::write(&path, b"%PDF-1.4\n%broken")?;

        assert!(matches!(PdfExtractor.extract(&path, "broken.pdf"), Err(IngestError::PdfParse(_))));
        Ok(())
    }
}
