use crate::error::ExtractError;
use crate::traits::TextExtractor;
use lopdf::Document;
use quick_xml::events::Event;
use quick_xml::Reader;
use std::fs;
use std::io::{Cursor, Read};
use std::path::Path;
use tracing::debug;

const MAX_DOCX_XML_BYTES: u64 = 64 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileFormat {
    PlainText,
    Markdown,
    Pdf,
    Docx,
}

impl FileFormat {
    /// Resolves the format from the file extension, ignoring case.
    pub fn from_path(path: &Path) -> Option<Self> {
        let extension = path.extension()?.to_str()?.to_ascii_lowercase();
        match extension.as_str() {
            "txt" => Some(Self::PlainText),
            "md" => Some(Self::Markdown),
            "pdf" => Some(Self::Pdf),
            "docx" => Some(Self::Docx),
            _ => None,
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct FileExtractor;

impl TextExtractor for FileExtractor {
    fn extract(&self, path: &Path) -> Result<String, ExtractError> {
        let format = FileFormat::from_path(path).ok_or_else(|| {
            ExtractError::UnsupportedFormat(
                path.extension()
                    .map(|extension| extension.to_string_lossy().to_string())
                    .unwrap_or_else(|| path.display().to_string()),
            )
        })?;

        debug!(path = %path.display(), ?format, "extracting text");
        match format {
            FileFormat::PlainText | FileFormat::Markdown => extract_plain(path),
            FileFormat::Pdf => extract_pdf(path),
            FileFormat::Docx => extract_docx(path),
        }
    }
}

/// Decodes as UTF-8, dropping undecodable bytes.
fn extract_plain(path: &Path) -> Result<String, ExtractError> {
    let bytes = fs::read(path)?;
    let decoded = String::from_utf8_lossy(&bytes);
    Ok(decoded.chars().filter(|ch| *ch != '\u{FFFD}').collect())
}

fn extract_pdf(path: &Path) -> Result<String, ExtractError> {
    let document = Document::load(path).map_err(|error| ExtractError::Pdf(error.to_string()))?;

    let mut pages = Vec::new();
    for (page_no, _page_id) in document.get_pages() {
        let text = document
            .extract_text(&[page_no])
            .map_err(|error| ExtractError::Pdf(error.to_string()))?;
        pages.push(text);
    }

    Ok(pages.join("\n"))
}

fn extract_docx(path: &Path) -> Result<String, ExtractError> {
    let bytes = fs::read(path)?;
    let mut archive = zip::ZipArchive::new(Cursor::new(bytes.as_slice()))
        .map_err(|error| ExtractError::Docx(error.to_string()))?;
    let entry = archive
        .by_name("word/document.xml")
        .map_err(|error| ExtractError::Docx(error.to_string()))?;

    let mut xml = Vec::new();
    entry
        .take(MAX_DOCX_XML_BYTES)
        .read_to_end(&mut xml)
        .map_err(|error| ExtractError::Docx(error.to_string()))?;
    if xml.len() as u64 >= MAX_DOCX_XML_BYTES {
        return Err(ExtractError::Docx(
            "word/document.xml exceeds size limit".to_string(),
        ));
    }

    docx_paragraphs(&xml).map(|paragraphs| paragraphs.join("\n"))
}

/// Collects the text runs of every `w:p`, one string per paragraph.
fn docx_paragraphs(xml: &[u8]) -> Result<Vec<String>, ExtractError> {
    let mut reader = Reader::from_reader(xml);
    let mut buf = Vec::new();
    let mut paragraphs = Vec::new();
    let mut current = String::new();
    let mut in_text = false;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(element)) => match element.local_name().as_ref() {
                b"p" => current.clear(),
                b"t" => in_text = true,
                _ => {}
            },
            Ok(Event::End(element)) => match element.local_name().as_ref() {
                b"p" => paragraphs.push(std::mem::take(&mut current)),
                b"t" => in_text = false,
                _ => {}
            },
            Ok(Event::Empty(element)) => match element.local_name().as_ref() {
                b"p" => paragraphs.push(String::new()),
                b"tab" => current.push('\t'),
                b"br" => current.push('\n'),
                _ => {}
            },
            Ok(Event::Text(text)) if in_text => {
                let unescaped = text
                    .unescape()
                    .map_err(|error| ExtractError::Docx(error.to_string()))?;
                current.push_str(&unescaped);
            }
            Ok(Event::Eof) => break,
            Err(error) => return Err(ExtractError::Docx(error.to_string())),
            _ => {}
        }
        buf.clear();
    }

    Ok(paragraphs)
}

#[cfg(test)]
mod tests {
    use super::{docx_paragraphs, FileExtractor, FileFormat};
    use crate::error::ExtractError;
    use crate::traits::TextExtractor;
    use std::fs::{self, File};
    use std::io::Write;
    use std::path::Path;
    use tempfile::tempdir;
    use zip::write::SimpleFileOptions;

    const DOCUMENT_XML: &str = r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<w:document xmlns:w="http://schemas.openxmlformats.org/wordprocessingml/2006/main">
  <w:body>
    <w:p><w:r><w:t>Safety </w:t></w:r><w:r><w:t>first &amp; always.</w:t></w:r></w:p>
    <w:p/>
    <w:p><w:r><w:t>Second</w:t><w:tab/><w:t>line</w:t></w:r></w:p>
  </w:body>
</w:document>"#;

    fn write_docx(path: &Path, xml: &str) -> Result<(), Box<dyn std::error::Error>> {
        let mut writer = zip::ZipWriter::new(File::create(path)?);
        writer.start_file("word/document.xml", SimpleFileOptions::default())?;
        writer.write_all(xml.as_bytes())?;
        writer.finish()?;
        Ok(())
    }

    #[test]
    fn format_detection_ignores_case() {
        assert_eq!(FileFormat::from_path(Path::new("a/B.PDF")), Some(FileFormat::Pdf));
        assert_eq!(FileFormat::from_path(Path::new("notes.Md")), Some(FileFormat::Markdown));
        assert_eq!(FileFormat::from_path(Path::new("sheet.xlsx")), None);
        assert_eq!(FileFormat::from_path(Path::new("README")), None);
    }

    #[test]
    fn plain_text_drops_invalid_utf8() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let path = dir.path().join("notes.txt");
        fs::write(&path, b"caf\xC3\xA9 \xFFok")?;

        assert_eq!(FileExtractor.extract(&path)?, "café ok");
        Ok(())
    }

    #[test]
    fn markdown_is_read_verbatim() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let path = dir.path().join("guide.MD");
        fs::write(&path, "# Title\n\nBody.")?;

        assert_eq!(FileExtractor.extract(&path)?, "# Title\n\nBody.");
        Ok(())
    }

    #[test]
    fn docx_paragraphs_are_newline_joined() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let path = dir.path().join("manual.docx");
        write_docx(&path, DOCUMENT_XML)?;

        let text = FileExtractor.extract(&path)?;
        assert_eq!(text, "Safety first & always.\n\nSecond\tline");
        Ok(())
    }

    #[test]
    fn docx_parser_keeps_run_whitespace() -> Result<(), Box<dyn std::error::Error>> {
        let paragraphs = docx_paragraphs(DOCUMENT_XML.as_bytes())?;
        assert_eq!(paragraphs[0], "Safety first & always.");
        assert_eq!(paragraphs.len(), 3);
        Ok(())
    }

    #[test]
    fn invalid_zip_is_a_docx_error() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let path = dir.path().join("broken.docx");
        fs::write(&path, b"not a zip")?;

        assert!(matches!(FileExtractor.extract(&path), Err(ExtractError::Docx(_))));
        Ok(())
    }

    #[test]
    fn broken_pdf_is_a_pdf_error() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let path = dir.path().join("broken.pdf");
        fs::write(&path, b"%PDF-1.4\n%broken")?;

        assert!(matches!(FileExtractor.extract(&path), Err(ExtractError::Pdf(_))));
        Ok(())
    }

    #[test]
    fn unknown_extension_is_unsupported() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let path = dir.path().join("data.csv");
        fs::write(&path, b"a,b")?;

        match FileExtractor.extract(&path) {
            Err(ExtractError::UnsupportedFormat(extension)) => assert_eq!(extension, "csv"),
            other => panic!("expected unsupported format, got {other:?}"),
        }
        Ok(())
    }
}
