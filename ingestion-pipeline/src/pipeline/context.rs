use std::path::PathBuf;

use common::{
    error::AppError,
    storage::types::extracted_document::{Entity, Relationship},
};
use tracing::{error, warn};

use super::services::PipelineServices;

/// Deletes the downloaded file when dropped, whichever way the pipeline ends.
pub struct ScratchFile {
    path: PathBuf,
}

impl ScratchFile {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }
}

impl Drop for ScratchFile {
    fn drop(&mut self) {
        match std::fs::remove_file(&self.path) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => warn!(path = %self.path.display(), error = %err, "failed to remove scratch file"),
        }
    }
}

pub struct PipelineContext<'a> {
    pub package_id: &'a str,
    pub download_link: &'a str,
    pub collection: &'a str,
    pub services: &'a dyn PipelineServices,
    pub scratch: Option<ScratchFile>,
    pub text: Option<String>,
    pub entities: Vec<Entity>,
    pub relationships: Vec<Relationship>,
    pub embedding: Option<Vec<f32>>,
}

impl<'a> PipelineContext<'a> {
    pub fn new(
        package_id: &'a str,
        download_link: &'a str,
        collection: &'a str,
        services: &'a dyn PipelineServices,
    ) -> Self {
        Self {
            package_id,
            download_link,
            collection,
            services,
            scratch: None,
            text: None,
            entities: Vec::new(),
            relationships: Vec::new(),
            embedding: None,
        }
    }

    pub fn scratch(&self) -> Result<&ScratchFile, AppError> {
        self.scratch
            .as_ref()
            .ok_or_else(|| AppError::InternalError("downloaded file expected to be available".into()))
    }

    pub fn text(&self) -> Result<&str, AppError> {
        self.text
            .as_deref()
            .ok_or_else(|| AppError::InternalError("extracted text expected to be available".into()))
    }

    pub fn take_text(&mut self) -> Result<String, AppError> {
        self.text.take().ok_or_else(|| {
            AppError::InternalError("extracted text expected to be available for persistence".into())
        })
    }

    pub fn take_embedding(&mut self) -> Result<Vec<f32>, AppError> {
        self.embedding.take().ok_or_else(|| {
            AppError::InternalError("embedding expected to be available for persistence".into())
        })
    }

    pub fn abort(&mut self, err: AppError) -> AppError {
        error!(
            package_id = %self.package_id,
            error = %err,
            "document pipeline aborted"
        );
        err
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scratch_file_is_removed_on_drop() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("PKG-1.pdf");
        std::fs::write(&path, b"%PDF-1.7").expect("write");

        drop(ScratchFile::new(path.clone()));
        assert!(!path.exists());

        // Already gone is fine.
        drop(ScratchFile::new(path));
    }
}
