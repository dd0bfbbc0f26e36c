//! Document indexing handlers

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::engine::{IndexReport, RemovalReport};
use crate::http::AppState;
use lodestar_common::errors::{AppError, Result};
use lodestar_common::models::{ContentType, Document, DocumentId, Section};

/// Index request: new or replacement documents
#[derive(Debug, Deserialize, Validate)]
pub struct IndexDocumentsRequest {
    #[validate(length(min = 1, max = 500), nested)]
    pub documents: Vec<DocumentInput>,
}

/// One document, given either as raw text or as pre-split sections
///
/// `Serialize` lets validation errors on the batch echo the offending value.
#[derive(Debug, Serialize, Deserialize, Validate)]
pub struct DocumentInput {
    #[validate(length(min = 1, max = 256))]
    pub id: String,

    #[validate(length(min = 1, max = 1024))]
    pub path: String,

    #[serde(default)]
    pub content_type: Option<ContentType>,

    #[serde(default)]
    pub text: Option<String>,

    #[serde(default)]
    pub sections: Option<Vec<Section>>,
}

impl DocumentInput {
    fn into_document(self) -> Result<Document> {
        let mut document = match (self.sections, self.text) {
            (Some(sections), _) if !sections.is_empty() => {
                let sample = sections.iter().map(|s| s.text.as_str()).collect::<Vec<_>>().join("\n");
                let content_type =
                    ContentType::from_path(&self.path).unwrap_or_else(|| ContentType::detect(&sample));
                Document {
                    id: DocumentId::new(self.id),
                    path: self.path,
                    content_type,
                    sections,
                }
            }
            (_, Some(text)) if is_markdown_path(&self.path) => Document::from_markdown(self.id, self.path, &text),
            (_, Some(text)) => Document::from_text(self.id, self.path, text),
            _ => {
                return Err(AppError::Validation {
                    message: format!("document '{}' needs either text or sections", self.id),
                    field: Some("documents".to_string()),
                })
            }
        };
        if let Some(content_type) = self.content_type {
            document.content_type = content_type;
        }
        Ok(document)
    }
}

fn is_markdown_path(path: &str) -> bool {
    let lower = path.to_ascii_lowercase();
    lower.ends_with(".md") || lower.ends_with(".markdown")
}

/// Index or replace documents
pub async fn index_documents(
    State(state): State<AppState>,
    Json(request): Json<IndexDocumentsRequest>,
) -> Result<(StatusCode, Json<IndexReport>)> {
    request.validate().map_err(|e| AppError::Validation {
        message: e.to_string(),
        field: None,
    })?;

    let documents = request
        .documents
        .into_iter()
        .map(DocumentInput::into_document)
        .collect::<Result<Vec<_>>>()?;

    let report = state.engine.index_documents(documents).await?;
    Ok((StatusCode::CREATED, Json(report)))
}

/// Remove one document from the index
pub async fn remove_document(State(state): State<AppState>, Path(id): Path<String>) -> Result<Json<RemovalReport>> {
    let report = state.engine.remove_documents(&[DocumentId::new(id)]).await?;
    Ok(Json(report))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input(path: &str, text: Option<&str>) -> DocumentInput {
        DocumentInput {
            id: "doc-1".to_string(),
            path: path.to_string(),
            content_type: None,
            text: text.map(str::to_string),
            sections: None,
        }
    }

    #[test]
    fn test_markdown_text_splits_sections() {
        let doc = input("docs/guide.md", Some("# Intro\nHello there.\n\n# Usage\nRun it.\n"))
            .into_document()
            .unwrap();
        assert_eq!(doc.sections.len(), 2);
        assert_eq!(doc.sections[1].title, "Usage");
    }

    #[test]
    fn test_sections_take_precedence() {
        let mut raw = input("src/lib.rs", Some("ignored"));
        raw.sections = Some(vec![Section {
            title: "main".to_string(),
            text: "fn main() {}\n".to_string(),
            start_line: 4,
        }]);
        let doc = raw.into_document().unwrap();
        assert_eq!(doc.sections.len(), 1);
        assert_eq!(doc.sections[0].start_line, 4);
        assert_eq!(doc.content_type, ContentType::from_path("src/lib.rs").unwrap());
    }

    #[test]
    fn test_missing_content_is_rejected() {
        let err = input("notes.txt", None).into_document().unwrap_err();
        assert!(matches!(err, AppError::Validation { .. }));
    }

    #[test]
    fn test_request_validation() {
        let empty = IndexDocumentsRequest { documents: Vec::new() };
        assert!(empty.validate().is_err());

        let bad_id = IndexDocumentsRequest {
            documents: vec![DocumentInput {
                id: String::new(),
                ..input("a.md", Some("text"))
            }],
        };
        assert!(bad_id.validate().is_err());
    }

    #[test]
    fn test_oversized_batch_reports_documents_field() {
        let request = IndexDocumentsRequest {
            documents: (0..501).map(|_| input("a.md", Some("text"))).collect(),
        };
        let errors = request.validate().unwrap_err();
        assert!(errors.field_errors().contains_key("documents"));
    }
}
