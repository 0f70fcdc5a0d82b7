use std::{process::ExitCode, time::Duration};

use clap::Parser;
use helpdex::{
    Config,
    DataDir,
    HelpIndex,
    RunSummary,
    SearchRequest,
    error::{Error, Result},
    page::{SectionChild, Statistics},
};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

mod cli;

use cli::{Cli, Command};

fn init_tracing(verbose: u8, quiet: bool) {
    let filter = if let Ok(env) = std::env::var("HELPDEX_LOG") {
        EnvFilter::new(env)
    } else if quiet {
        EnvFilter::new("warn")
    } else {
        match verbose {
            0 => EnvFilter::new("info"),
            1 => EnvFilter::new("debug"),
            _ => EnvFilter::new("trace"),
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .without_time()
        .init();
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.quiet);

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<()> {
    if let Command::Completions(args) = &cli.command {
        args.generate();
        return Ok(());
    }

    let force = cli.force_rebuild
        || matches!(&cli.command, Command::Index(args) if args.force);
    let index = HelpIndex::open(build_config(&cli, force)?)?;

    match cli.command {
        Command::Index(args) => {
            cmd_index(index.startup_summary(), args.json)?;
        }
        Command::Search(args) => {
            let mut request = SearchRequest::new(args.query)
                .limit(args.limit)
                .offset(args.offset);
            if let Some(category) = args.category {
                request = request.category(category);
            }
            if args.titles_only {
                request = request.titles_only();
            }
            let results = index.search(&request)?;

            if args.json {
                print_json(&results)?;
            } else if results.results.is_empty() {
                println!("No results.");
            } else {
                for (i, hit) in results.results.iter().enumerate() {
                    println!(
                        "{:>3}. {} (score: {:.3})",
                        results.offset + i + 1,
                        hit.breadcrumb_path,
                        hit.score
                    );
                    println!("     #{}  {}", hit.page_id, hit.online_url);
                    if let Some(snippet) = &hit.snippet {
                        println!("     {snippet}");
                    }
                }
                println!(
                    "\n{} of {} match(es)",
                    results.results.len(),
                    results.total_matches
                );
            }
        }
        Command::Categories(args) => {
            let categories = index.list_categories()?;
            if args.json {
                print_json(&categories)?;
            } else {
                for category in &categories {
                    println!("{}\t{}", category.pages, category.name);
                }
            }
        }
        Command::Browse(args) => {
            let listing = index.browse(args.section)?.ok_or_else(|| {
                Error::NotFound {
                    kind: "section",
                    name: args.section.map(|s| s.to_string()).unwrap_or_default(),
                }
            })?;

            if args.json {
                print_json(&listing)?;
            } else {
                if !listing.breadcrumb.is_empty() {
                    let trail: Vec<&str> =
                        listing.breadcrumb.iter().map(|c| c.name.as_str()).collect();
                    println!("{}", trail.join(" > "));
                }
                for child in &listing.children {
                    match child {
                        SectionChild::Section {
                            node_id,
                            name,
                            page_count,
                        } => println!("+ {name}  [{node_id}] ({page_count} pages)"),
                        SectionChild::Page { page_id, title, .. } => {
                            println!("  {title}  #{page_id}")
                        }
                    }
                }
            }
        }
        Command::Get(args) => {
            let page = index.get_page(args.page_id)?.ok_or_else(|| {
                Error::NotFound {
                    kind: "page",
                    name: args.page_id.to_string(),
                }
            })?;

            if args.json {
                print_json(&page)?;
            } else if args.raw {
                print!("{}", page.raw_markup);
            } else {
                println!("{}", page.title);
                println!("{}", index.online_url(&page));
                println!();
                println!("{}", page.body_text);
            }
        }
        Command::HelpId(args) => {
            let page = index.get_page_by_help_id(args.help_id)?.ok_or_else(|| {
                Error::NotFound {
                    kind: "help id",
                    name: args.help_id.to_string(),
                }
            })?;

            if args.json {
                print_json(&page.header())?;
            } else {
                println!("#{}\t{}", page.page_id, page.header().breadcrumb_path());
                println!("{}", index.online_url(&page));
            }
        }
        Command::Breadcrumb(args) => {
            let crumbs = index.get_breadcrumb(args.page_id)?.ok_or_else(|| {
                Error::NotFound {
                    kind: "page",
                    name: args.page_id.to_string(),
                }
            })?;

            if args.json {
                print_json(&crumbs)?;
            } else {
                for crumb in &crumbs {
                    println!("{}\t{}", crumb.node_id, crumb.name);
                }
            }
        }
        Command::Stats(args) => {
            let stats = index.get_statistics()?;
            let last_run = index.last_run()?;

            if args.json {
                print_json(&StatsReport {
                    statistics: &stats,
                    last_run: last_run.as_ref(),
                })?;
            } else {
                println!("Corpus: {}", index.config().corpus_root.display());
                println!("Data directory: {}", index.config().data_dir.root().display());
                println!("Pages: {}", stats.total_pages);
                println!(
                    "Sections: {} ({} at root)",
                    stats.total_sections, stats.root_sections
                );
                println!("Help ids: {}", stats.help_id_mappings);
                println!("Commit sequence: {}", stats.commit_seq);
                if let Some(at) = stats.last_indexed_at {
                    println!("Last indexed: {at} (unix)");
                }
                for category in &stats.categories {
                    println!("  {}: {}", category.name, category.pages);
                }
                if let Some(run) = last_run {
                    println!(
                        "Last run: {} indexed, {} removed, {} skipped",
                        run.indexed,
                        run.removed,
                        run.skipped.len()
                    );
                }
            }
        }
        Command::Completions(_) => {}
    }

    Ok(())
}

fn build_config(cli: &Cli, force: bool) -> Result<Config> {
    let corpus_root = cli.corpus_root.clone().ok_or_else(|| {
        Error::Config(
            "no corpus root given (use --corpus-root or HELPDEX_CORPUS_ROOT)"
                .into(),
        )
    })?;
    let data_dir = DataDir::resolve(cli.data_dir.as_deref())?;

    let mut config = Config::new(corpus_root, data_dir);
    if let Some(dir) = &cli.metadata_dir {
        config.metadata_dir = dir.clone();
    }
    if let Some(version) = cli.doc_version {
        config.doc_version = version;
    }
    config.online_base_url = cli.base_url.clone();
    config.force_rebuild = force;
    if let Some(workers) = cli.workers {
        config.workers = workers;
    }
    if let Some(secs) = cli.extraction_timeout {
        config.extraction_timeout = Duration::from_secs(secs);
    }
    Ok(config)
}

fn cmd_index(summary: &RunSummary, json: bool) -> Result<()> {
    if json {
        return print_json(summary);
    }

    println!(
        "Indexed {} page(s) ({} added, {} modified), removed {}, unchanged {}",
        summary.indexed,
        summary.added,
        summary.modified,
        summary.removed,
        summary.unchanged
    );
    if summary.forced {
        println!("Forced rebuild.");
    }
    for skipped in &summary.skipped {
        println!("  skipped {} [{}]: {}", skipped.path, skipped.kind, skipped.reason);
    }
    println!("Done in {} ms.", summary.duration_ms);
    Ok(())
}

#[derive(Serialize)]
struct StatsReport<'a> {
    statistics: &'a Statistics,
    last_run: Option<&'a RunSummary>,
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
