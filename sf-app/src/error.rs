//! Failure taxonomy for the chat workflows.
//!
//! Every step boundary turns a [`FlowError`] into a reply; nothing here is
//! allowed to reach the gateway loop.

use sf_catalog::CatalogError;
use sf_metadata::MetadataError;
use thiserror::Error;

pub type FlowResult<T> = std::result::Result<T, FlowError>;

#[derive(Debug, Error)]
pub enum FlowError {
    /// Input outside the step's allowed set.
    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    DuplicateKey(String),

    #[error("metadata lookup failed: {0}")]
    ExternalLookup(#[from] MetadataError),

    #[error("archival forward failed: {0}")]
    ForwardFailed(String),

    #[error("malformed caption {0:?}")]
    MalformedCaption(String),

    #[error("catalog error: {0}")]
    Catalog(CatalogError),

    #[error("transport error: {0}")]
    Transport(#[from] anyhow::Error),
}

impl From<CatalogError> for FlowError {
    fn from(e: CatalogError) -> Self {
        match e {
            CatalogError::DuplicateKey(key) => Self::DuplicateKey(key),
            CatalogError::TitleNotFound(_)
            | CatalogError::SeasonNotFound { .. }
            | CatalogError::EpisodeNotFound { .. } => Self::NotFound(e.to_string()),
            other => Self::Catalog(other),
        }
    }
}

impl FlowError {
    /// Whether the user can fix this by answering the same step again.
    pub fn is_user_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Validation(_) | Self::NotFound(_) | Self::MalformedCaption(_)
        )
    }

    pub fn user_message(&self) -> String {
        match self {
            Self::Validation(msg) | Self::NotFound(msg) => msg.clone(),
            Self::DuplicateKey(_) => "This title already exists in the catalog.".to_string(),
            Self::ExternalLookup(_) => {
                "The metadata service did not answer. Please try again.".to_string()
            }
            Self::ForwardFailed(_) => {
                "The file was saved but could not be archived.".to_string()
            }
            Self::MalformedCaption(caption) => format!(
                "Skipped a file: caption {caption:?} does not start with a valid episode number."
            ),
            Self::Catalog(_) | Self::Transport(_) => {
                "Something went wrong. Please try again.".to_string()
            }
        }
    }
}
