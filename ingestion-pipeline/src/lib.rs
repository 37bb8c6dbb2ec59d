#![allow(clippy::missing_docs_in_private_items, clippy::result_large_err)]

pub mod downloader;
pub mod embedding;
pub mod entities;
pub mod extraction;
pub mod handlers;
pub mod pipeline;
pub mod utils;

pub use downloader::{DocumentDownloader, DownloadedFile, DownloaderConfig};
pub use embedding::{EmbeddingGenerator, InMemoryVectorIndex, SurrealVectorIndex, VectorIndex};
pub use entities::EntityProcessor;
pub use extraction::TextExtractor;
pub use handlers::{IngestBatchHandler, IngestDocumentHandler};
pub use pipeline::{BatchReport, IngestionConfig, IngestionSupervisor};
