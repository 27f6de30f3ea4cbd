//! # Medlar Executors
//! One executor per task kind, registered into the dispatcher's registry.
//! Expected failures come back as `ExecutionResult { success: false }`;
//! subprocess tools are invoked with explicit argument vectors (the `shell`
//! kind is the only one that goes through a shell, by definition).

pub mod batch;
pub mod code;
pub mod llm;
pub mod media;
pub mod planner;
pub mod review;
pub mod run_code;
pub mod shell;
pub mod tool;
mod util;

use std::sync::Arc;

use medlar_core::config::MedlarConfig;
use medlar_engine::ExecutorRegistry;
use medlar_providers::{ChromaIndex, SearchClient, TextGenClient, VectorIndex};

/// Wire every executor for the configured backends.
pub fn build_registry(config: &MedlarConfig) -> ExecutorRegistry {
    let textgen = TextGenClient::new(&config.textgen.endpoint, &config.textgen.model);
    let similarity: Arc<dyn VectorIndex> = Arc::new(ChromaIndex::new(
        &config.vector.url,
        &config.vector.collection,
    ));
    let search = Arc::new(SearchClient::new(&config.search.url));

    let mut registry = ExecutorRegistry::new();
    registry.register(Arc::new(shell::ShellExecutor));
    registry.register(Arc::new(llm::LlmExecutor::new(textgen.clone())));
    registry.register(Arc::new(planner::PlannerExecutor::new(
        textgen.clone(),
        Arc::clone(&similarity),
    )));
    registry.register(Arc::new(code::CodeExecutor::new(textgen.clone())));
    registry.register(Arc::new(review::ReviewExecutor::new(textgen.clone())));
    registry.register(Arc::new(run_code::RunCodeExecutor));
    registry.register(Arc::new(batch::BatchExecutor));
    registry.register(Arc::new(tool::ToolExecutor::with_defaults()));

    registry.register(Arc::new(media::MediaDownloadExecutor::youtube()));
    registry.register(Arc::new(media::MediaDownloadExecutor::download()));
    registry.register(Arc::new(media::MediaIngestExecutor));
    registry.register(Arc::new(media::MediaOrganizeExecutor));
    registry.register(Arc::new(media::MediaTranscribeExecutor));
    registry.register(Arc::new(media::MediaTagExecutor::new(textgen.clone())));
    registry.register(Arc::new(media::IndexMeiliExecutor::new(
        Arc::clone(&search),
        config.search.index.clone(),
    )));
    registry.register(Arc::new(media::IndexChromaExecutor::new(Arc::clone(
        &similarity,
    ))));
    registry.register(Arc::new(media::MediaSummarizeExecutor::new(
        textgen.clone(),
        Arc::clone(&search),
        config.search.index.clone(),
    )));
    registry.register(Arc::new(media::MediaRecommendExecutor::new(textgen)));
    registry.register(Arc::new(media::VideoSceneDetectExecutor));
    registry.register(Arc::new(media::VideoObjectDetectExecutor));
    registry.register(Arc::new(media::AudioAnalyzeExecutor));
    registry
}

#[cfg(test)]
mod tests {
    use super::*;
    use medlar_core::types::TaskKind;

    #[test]
    fn test_registry_covers_every_kind() {
        let registry = build_registry(&MedlarConfig::default());
        for kind in TaskKind::all() {
            assert!(registry.get(*kind).is_some(), "no executor for {kind}");
        }
        assert_eq!(registry.len(), TaskKind::all().len());
    }
}
