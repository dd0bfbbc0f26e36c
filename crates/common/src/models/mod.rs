//! Core data model shared by the indexing and query paths
//!
//! Documents are owned by the ingestion collaborator and read-only here.
//! Chunks are created once at index-build time and never mutated; a
//! re-index produces new chunks that supersede the old ones.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Stable document identifier (assigned by the ingestion collaborator)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DocumentId(pub String);

impl DocumentId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Content-addressed chunk identifier
///
/// Derived from the parent document id and the byte span, so re-chunking an
/// unchanged document yields the same ids.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChunkId(pub String);

impl ChunkId {
    pub fn derive(document_id: &DocumentId, span: TextSpan) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(document_id.as_str().as_bytes());
        hasher.update(span.start.to_le_bytes());
        hasher.update(span.end.to_le_bytes());
        let digest = hasher.finalize();
        Self(hex::encode(&digest[..12]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ChunkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Content type of a document or a block within one
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentType {
    Code,
    Prose,
    Table,
    List,
    Mixed,
}

impl ContentType {
    /// Guess the content type from a file extension
    pub fn from_path(path: &str) -> Option<Self> {
        let ext = path.rsplit_once('.').map(|(_, ext)| ext.to_ascii_lowercase())?;
        match ext.as_str() {
            "rs" | "py" | "js" | "ts" | "go" | "java" | "c" | "h" | "cpp" | "hpp" | "rb"
            | "kt" | "swift" | "scala" | "sh" => Some(ContentType::Code),
            "csv" | "tsv" => Some(ContentType::Table),
            "txt" => Some(ContentType::Prose),
            "md" | "markdown" | "rst" => Some(ContentType::Mixed),
            _ => None,
        }
    }

    /// Detect the dominant content type of raw text
    pub fn detect(text: &str) -> Self {
        let lines: Vec<&str> = text.lines().filter(|l| !l.trim().is_empty()).collect();
        if lines.is_empty() {
            return ContentType::Prose;
        }

        let total = lines.len() as f32;
        let table = lines.iter().filter(|l| is_table_line(l)).count() as f32;
        let list = lines.iter().filter(|l| is_list_line(l)).count() as f32;
        let code = lines.iter().filter(|l| is_code_line(l)).count() as f32;
        let fenced = text.contains("```");

        if table / total > 0.8 {
            ContentType::Table
        } else if list / total > 0.8 {
            ContentType::List
        } else if code / total > 0.6 && !fenced {
            ContentType::Code
        } else if fenced || table > 0.0 || list / total > 0.2 || code / total > 0.2 {
            ContentType::Mixed
        } else {
            ContentType::Prose
        }
    }
}

pub fn is_table_line(line: &str) -> bool {
    let trimmed = line.trim();
    trimmed.starts_with('|') && trimmed.ends_with('|') && trimmed.len() > 1
}

pub fn is_list_line(line: &str) -> bool {
    let trimmed = line.trim_start();
    if trimmed.starts_with("- ") || trimmed.starts_with("* ") || trimmed.starts_with("+ ") {
        return true;
    }
    let digits = trimmed.chars().take_while(|c| c.is_ascii_digit()).count();
    digits > 0 && (trimmed[digits..].starts_with(". ") || trimmed[digits..].starts_with(") "))
}

fn is_code_line(line: &str) -> bool {
    let trimmed = line.trim();
    const KEYWORDS: [&str; 14] = [
        "def ", "class ", "fn ", "pub ", "import ", "from ", "use ", "return", "let ",
        "const ", "impl ", "struct ", "function ", "#include",
    ];
    KEYWORDS.iter().any(|k| trimmed.starts_with(k))
        || trimmed.ends_with('{')
        || trimmed.ends_with(';')
        || trimmed == "}"
        || (trimmed.ends_with(':') && line.starts_with("    "))
}

/// Byte span within a document's full text
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextSpan {
    pub start: usize,
    pub end: usize,
}

impl TextSpan {
    pub fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }

    pub fn len(&self) -> usize {
        self.end.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Inclusive 1-based line range
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LineRange {
    pub start: usize,
    pub end: usize,
}

impl LineRange {
    pub fn new(start: usize, end: usize) -> Self {
        Self {
            start,
            end: end.max(start),
        }
    }
}

impl fmt::Display for LineRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.start == self.end {
            write!(f, "L{}", self.start)
        } else {
            write!(f, "L{}-L{}", self.start, self.end)
        }
    }
}

/// One section of a source document
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Section {
    /// Heading or symbol name; empty for untitled leading text
    #[serde(default)]
    pub title: String,

    pub text: String,

    /// 1-based line of the section's first line in the source file
    #[serde(default = "default_start_line")]
    pub start_line: usize,
}

fn default_start_line() -> usize {
    1
}

/// Source document handed over by the ingestion collaborator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub id: DocumentId,

    /// Source path (used for citations and path cross-references)
    pub path: String,

    pub content_type: ContentType,

    pub sections: Vec<Section>,
}

impl Document {
    /// Build a single-section document, detecting its content type
    pub fn from_text(id: impl Into<String>, path: impl Into<String>, text: impl Into<String>) -> Self {
        let path = path.into();
        let text = text.into();
        let content_type = ContentType::from_path(&path).unwrap_or_else(|| ContentType::detect(&text));
        Self {
            id: DocumentId::new(id),
            path,
            content_type,
            sections: vec![Section {
                title: String::new(),
                text,
                start_line: 1,
            }],
        }
    }

    /// Split markdown-like text into sections at `#` headings
    pub fn from_markdown(id: impl Into<String>, path: impl Into<String>, text: &str) -> Self {
        let mut sections = Vec::new();
        let mut current = String::new();
        let mut title = String::new();
        let mut start_line = 1;
        let mut in_fence = false;

        for (idx, line) in text.lines().enumerate() {
            if line.trim_start().starts_with("```") {
                in_fence = !in_fence;
            }
            if !in_fence && line.starts_with('#') && !current.trim().is_empty() {
                sections.push(Section {
                    title: std::mem::take(&mut title),
                    text: std::mem::take(&mut current),
                    start_line,
                });
                start_line = idx + 1;
            }
            if !in_fence && line.starts_with('#') && current.trim().is_empty() {
                title = line.trim_start_matches('#').trim().to_string();
                if current.is_empty() {
                    start_line = idx + 1;
                }
            }
            current.push_str(line);
            current.push('\n');
        }

        if !current.trim().is_empty() {
            sections.push(Section {
                title,
                text: current,
                start_line,
            });
        }

        Self {
            id: DocumentId::new(id),
            path: path.into(),
            content_type: ContentType::detect(text),
            sections,
        }
    }

    /// Total characters across all sections
    pub fn len(&self) -> usize {
        self.sections.iter().map(|s| s.text.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.sections.iter().all(|s| s.text.trim().is_empty())
    }
}

/// Immutable, quality-scored segment of a document
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
    pub id: ChunkId,
    pub document_id: DocumentId,

    /// Index of the parent section within the document
    pub section_index: usize,

    /// Source path of the parent document
    pub path: String,

    /// Span within the parent section's text
    pub span: TextSpan,

    pub lines: LineRange,

    pub content_type: ContentType,

    pub text: String,

    /// `0.5 * boundary_clarity + 0.5 * stickiness`, in [0, 1]
    pub quality_score: f32,

    pub boundary_clarity: f32,

    pub stickiness: f32,

    /// Dense embedding; filled in by the indexer
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub embedding: Vec<f32>,
}
