//! The operations a host exposes, over one opened index.

use std::sync::{Arc, Mutex, PoisonError};

use crate::{
    config::Config,
    doc_id::{PageId, SectionId},
    error::{Error, Result},
    page::{CategoryCount, Crumb, Page, Statistics},
    pipeline::{self, CancelToken, PipelineOptions, RunSummary},
    search::{BrowseListing, SearchEngine, SearchRequest, SearchResults},
    store::IndexStore,
};

/// An index that has been brought up to date with its corpus.
///
/// [`HelpIndex::open`] runs a full indexing pass before returning, so every
/// query sees at least the corpus as it was at startup. Queries may run
/// concurrently with each other and with [`HelpIndex::run_index`]; index
/// runs themselves are serialized.
pub struct HelpIndex {
    config: Config,
    store: Arc<IndexStore>,
    engine: SearchEngine,
    cancel: CancelToken,
    run_lock: Mutex<()>,
    startup: RunSummary,
}

impl HelpIndex {
    pub fn open(config: Config) -> Result<Self> {
        config.validate()?;

        let store = Arc::new(IndexStore::open(
            &config.data_dir.store_db(),
            &config.data_dir.fulltext_dir()?,
        )?);
        tracing::info!(
            corpus = %config.corpus_root.display(),
            data_dir = %config.data_dir.root().display(),
            commit_seq = store.commit_seq(),
            "opened store",
        );

        let cancel = CancelToken::new();
        let startup = pipeline::run(
            &store,
            &config.corpus_root,
            &pipeline_options(&config, config.force_rebuild),
            &cancel,
        );
        if startup.failed() {
            return Err(Error::IndexFailed(
                startup.error.clone().unwrap_or_else(|| "unknown error".into()),
            ));
        }
        cancel.reset();

        let engine = SearchEngine::new(Arc::clone(&store), config.link_format());
        Ok(Self {
            config,
            store,
            engine,
            cancel,
            run_lock: Mutex::new(()),
            startup,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &IndexStore {
        &self.store
    }

    /// Summary of the indexing pass performed by [`HelpIndex::open`].
    pub fn startup_summary(&self) -> &RunSummary {
        &self.startup
    }

    /// Token that stops the index run in progress. It is re-armed when that
    /// run returns.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Run the pipeline again. Blocks while another run is in progress.
    pub fn run_index(&self, force: bool) -> RunSummary {
        let _guard = self.run_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let summary = pipeline::run(
            &self.store,
            &self.config.corpus_root,
            &pipeline_options(&self.config, force),
            &self.cancel,
        );
        self.cancel.reset();
        summary
    }

    /// The most recent run that changed the store, as recorded on disk.
    pub fn last_run(&self) -> Result<Option<RunSummary>> {
        pipeline::read_run_record(&self.config.metadata_dir)
    }

    pub fn search(&self, request: &SearchRequest) -> Result<SearchResults> {
        self.engine.search(request)
    }

    pub fn list_categories(&self) -> Result<Vec<CategoryCount>> {
        self.engine.list_categories()
    }

    pub fn browse(&self, section: Option<SectionId>) -> Result<Option<BrowseListing>> {
        self.engine.browse(section)
    }

    pub fn get_page(&self, page_id: PageId) -> Result<Option<Page>> {
        self.engine.get_page(page_id)
    }

    pub fn get_page_by_help_id(&self, help_id: u64) -> Result<Option<Page>> {
        self.engine.get_page_by_help_id(help_id)
    }

    pub fn get_breadcrumb(&self, page_id: PageId) -> Result<Option<Vec<Crumb>>> {
        self.engine.get_breadcrumb(page_id)
    }

    pub fn get_statistics(&self) -> Result<Statistics> {
        self.engine.get_statistics()
    }

    pub fn online_url(&self, page: &Page) -> String {
        self.engine.online_url(page)
    }
}

fn pipeline_options(config: &Config, force: bool) -> PipelineOptions {
    PipelineOptions {
        workers: config.workers,
        force,
        extraction_timeout: config.extraction_timeout,
        metadata_dir: Some(config.metadata_dir.clone()),
    }
}
