use common::{error::AppError, storage::types::extracted_document::ExtractedDocument};
use state_machines::core::GuardError;
use tracing::{debug, info, instrument};

use super::{
    context::{PipelineContext, ScratchFile},
    state::{Analyzed, DocumentMachine, Downloaded, Extracted, Persisted, Ready},
};

#[instrument(level = "trace", skip_all, fields(package_id = %ctx.package_id, stage = "download"))]
pub async fn download(
    machine: DocumentMachine<(), Ready>,
    ctx: &mut PipelineContext<'_>,
) -> Result<DocumentMachine<(), Downloaded>, AppError> {
    let file = ctx
        .services
        .download(ctx.package_id, ctx.download_link)
        .await?;

    debug!(
        package_id = %ctx.package_id,
        bytes = file.content_length,
        content_type = %file.content_type,
        "document downloaded"
    );
    ctx.scratch = Some(ScratchFile::new(file.file_path));

    machine
        .download()
        .map_err(|(_, guard)| map_guard_error("download", &guard))
}

#[instrument(level = "trace", skip_all, fields(package_id = %ctx.package_id, stage = "extract"))]
pub async fn extract(
    machine: DocumentMachine<(), Downloaded>,
    ctx: &mut PipelineContext<'_>,
) -> Result<DocumentMachine<(), Extracted>, AppError> {
    let text = ctx.services.extract_text(ctx.scratch()?.path()).await?;

    debug!(
        package_id = %ctx.package_id,
        chars = text.chars().count(),
        "document text extracted"
    );
    ctx.text = Some(text);
    // The file is no longer needed once the text is in memory.
    ctx.scratch = None;

    machine
        .extract()
        .map_err(|(_, guard)| map_guard_error("extract", &guard))
}

/// Entity tagging and embedding are independent, so they run side by side.
#[instrument(level = "trace", skip_all, fields(package_id = %ctx.package_id, stage = "analyze"))]
pub async fn analyze(
    machine: DocumentMachine<(), Extracted>,
    ctx: &mut PipelineContext<'_>,
) -> Result<DocumentMachine<(), Analyzed>, AppError> {
    let text = ctx.text()?;
    let ((entities, relationships), embedding) = tokio::try_join!(
        ctx.services.find_entities(text),
        ctx.services.embed(text)
    )?;

    debug!(
        package_id = %ctx.package_id,
        entities = entities.len(),
        relationships = relationships.len(),
        dimension = embedding.len(),
        "document analyzed"
    );
    ctx.entities = entities;
    ctx.relationships = relationships;
    ctx.embedding = Some(embedding);

    machine
        .analyze()
        .map_err(|(_, guard)| map_guard_error("analyze", &guard))
}

#[instrument(level = "trace", skip_all, fields(package_id = %ctx.package_id, stage = "persist"))]
pub async fn persist(
    machine: DocumentMachine<(), Analyzed>,
    ctx: &mut PipelineContext<'_>,
) -> Result<(DocumentMachine<(), Persisted>, ExtractedDocument), AppError> {
    let document = ExtractedDocument::new(
        ctx.package_id,
        ctx.collection,
        ctx.take_text()?,
        std::mem::take(&mut ctx.entities),
        std::mem::take(&mut ctx.relationships),
        ctx.package_id.to_string(),
    );
    let embedding = ctx.take_embedding()?;

    let stored = ctx.services.persist(document, embedding).await?;
    info!(
        package_id = %stored.package_id,
        collection = %stored.collection,
        entities = stored.entities.len(),
        "document stored"
    );

    let machine = machine
        .persist()
        .map_err(|(_, guard)| map_guard_error("persist", &guard))?;
    Ok((machine, stored))
}

fn map_guard_error(event: &str, guard: &GuardError) -> AppError {
    AppError::InternalError(format!(
        "invalid document pipeline transition during {event}: {guard:?}"
    ))
}
