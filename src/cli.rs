use std::path::PathBuf;

use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use helpdex::{DocVersion, PageId, SectionId};

#[derive(Debug, Parser)]
#[command(
    name = "helpdex",
    about = "Index and search a local tree of structured help pages"
)]
pub struct Cli {
    /// Root directory of the help corpus
    #[arg(long, global = true, env = "HELPDEX_CORPUS_ROOT")]
    pub corpus_root: Option<PathBuf>,

    /// Override the XDG data directory
    #[arg(long, global = true, env = "HELPDEX_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    /// Where to keep the last run record (default: <data-dir>/metadata)
    #[arg(long, global = true, env = "HELPDEX_METADATA_DIR")]
    pub metadata_dir: Option<PathBuf>,

    /// Documentation release used for online links (4 or 6, default 4)
    #[arg(long, global = true, env = "HELPDEX_DOC_VERSION")]
    pub doc_version: Option<DocVersion>,

    /// Base URL for online links, overriding the doc version's
    #[arg(long, global = true, env = "HELPDEX_BASE_URL")]
    pub base_url: Option<String>,

    /// Re-extract every page on startup
    #[arg(long, global = true, env = "HELPDEX_FORCE_REBUILD")]
    pub force_rebuild: bool,

    /// Number of extraction threads
    #[arg(long, global = true, env = "HELPDEX_WORKERS")]
    pub workers: Option<usize>,

    /// Per-file extraction timeout in seconds
    #[arg(long, global = true)]
    pub extraction_timeout: Option<u64>,

    /// Increase log verbosity (can be repeated: -v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Only log warnings and errors
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Bring the index up to date with the corpus
    Index(IndexArgs),
    /// Ranked full-text search
    Search(SearchArgs),
    /// List categories with page counts
    Categories(JsonArgs),
    /// List the children of a section (the root when omitted)
    Browse(BrowseArgs),
    /// Show a page by id
    Get(GetArgs),
    /// Show the page registered for a help id
    HelpId(HelpIdArgs),
    /// Show the section trail leading to a page
    Breadcrumb(BreadcrumbArgs),
    /// Show index statistics and the last run
    Stats(JsonArgs),
    /// Generate shell completions
    #[command(hide = true)]
    Completions(CompletionsArgs),
}

#[derive(Debug, Parser)]
pub struct JsonArgs {
    /// Output as JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(Debug, Parser)]
pub struct IndexArgs {
    /// Re-extract every page, even unchanged ones
    #[arg(long)]
    pub force: bool,

    /// Output the run summary as JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(Debug, Parser)]
pub struct SearchArgs {
    /// The search query
    pub query: String,

    /// Restrict to a category; a trailing `*` matches by prefix
    #[arg(short = 'c', long)]
    pub category: Option<String>,

    /// Number of results to return
    #[arg(short = 'n', long, default_value = "10")]
    pub limit: usize,

    /// Number of results to skip
    #[arg(long, default_value = "0")]
    pub offset: usize,

    /// Match page titles only, not their content
    #[arg(short = 't', long)]
    pub titles_only: bool,

    /// Output results as JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(Debug, Parser)]
pub struct BrowseArgs {
    /// Section id as printed by a previous browse
    pub section: Option<SectionId>,

    /// Output as JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(Debug, Parser)]
pub struct GetArgs {
    /// Page id (16 hex digits, optionally prefixed with #)
    pub page_id: PageId,

    /// Print the original markup instead of the extracted text
    #[arg(long)]
    pub raw: bool,

    /// Output as JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(Debug, Parser)]
pub struct HelpIdArgs {
    /// Numeric help id
    pub help_id: u64,

    /// Output as JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(Debug, Parser)]
pub struct BreadcrumbArgs {
    pub page_id: PageId,

    /// Output as JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(Debug, Parser)]
pub struct CompletionsArgs {
    /// Shell to generate completions for
    #[arg(value_enum)]
    pub shell: Shell,
}

impl CompletionsArgs {
    /// Generate shell completions and print to stdout.
    pub fn generate(&self) {
        let mut cmd = Cli::command();
        clap_complete::generate(
            self.shell,
            &mut cmd,
            "helpdex",
            &mut std::io::stdout(),
        );
    }
}
