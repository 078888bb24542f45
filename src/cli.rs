use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};

use ff2zim_core::build::{build, export};
use ff2zim_core::config::SECTIONS;
use ff2zim_core::detector::{scan_category, scan_mailbox};
use ff2zim_core::lifecycle::{
    download_all, download_n, mark_for_update, update_all, update_n, AttemptOutcome, BatchReport, MarkOutcome,
};
use ff2zim_core::project::Project;
use ff2zim_core::registry::{StateFilter, TargetState};

use crate::category::FfnetCategoryLister;
use crate::fetcher::FanFicFareFetcher;
use crate::load_config::{load_config, ToolSettings};
use crate::mailbox::MaildirSource;
use crate::minify::CommandMinifier;
use crate::packager::ZimPackager;
use crate::selection;

/// CLI for ff2zim: track fanfiction targets and build offline archives.
#[derive(Parser)]
#[clap(
    name = "ff2zim",
    version,
    about = "Track fanfiction stories, keep them up to date and package them into ZIM archives"
)]
pub struct Cli {
    /// Project to operate on, overriding the selected one
    #[clap(long, global = true)]
    pub project: Option<PathBuf>,

    /// YAML file with tool settings (executables, Maildir, HTTP)
    #[clap(long, global = true)]
    pub config: Option<PathBuf>,

    #[clap(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Create a new project directory
    Init { path: PathBuf },
    /// Remember a project for later invocations
    Select { path: PathBuf },
    /// Forget the selected project
    Unselect,
    /// Show the project in use
    Project,
    /// Register a story by id or URL
    Add { identifier: String },
    /// Register every story listed in a file, one per line
    Import { file: PathBuf },
    /// Remove a story and its downloaded content
    Remove { identifier: String },
    /// List targets: all, new, downloaded, update-required, failed or missing
    List {
        #[clap(default_value = "all")]
        filter: String,
    },
    /// List titles of downloaded stories
    Titles,
    /// Show per-state counts and totals
    Stats,
    /// Fetch stories that have not been downloaded yet
    Download {
        #[clap(long)]
        count: Option<usize>,
    },
    /// Queue a downloaded story for re-fetch
    MarkUpdate { identifier: String },
    /// Re-fetch stories queued for update
    Update {
        #[clap(long)]
        count: Option<usize>,
    },
    /// Queue stories mentioned in unread update notifications
    CheckMail,
    /// Add new and queue changed stories of a remote category
    CheckCategory { url: String },
    /// Print one option
    GetOption { section: String, option: String },
    /// Change one option
    SetOption {
        section: String,
        option: String,
        value: String,
    },
    /// Print every option, or those of one section
    Options { section: Option<String> },
    /// Group stories of category FROM under TO
    Alias { from: String, to: String },
    /// Include another project's stories in builds
    AddSubproject { path: PathBuf },
    /// Build the archive
    Build { output: PathBuf },
    /// Export every story as a standalone EPUB
    Export {
        output_dir: PathBuf,
        #[clap(long)]
        by_category: bool,
    },
}

/// Async CLI entrypoint shared by main() and the tests.
pub async fn run(cli: Cli) -> Result<()> {
    tracing::info!("trace_initialised");

    let explicit = cli.project.as_deref();
    match cli.command {
        Commands::Init { path } => {
            let project = Project::init(&path).with_context(|| format!("initialising {}", path.display()))?;
            println!("Initialised project at {}", project.root().display());
        }
        Commands::Select { path } => {
            let root = selection::select(&path)?;
            println!("Selected {}", root.display());
        }
        Commands::Unselect => {
            if selection::unselect()? {
                println!("Selection cleared");
            } else {
                println!("No project was selected");
            }
        }
        Commands::Project => {
            let (project, _lock) = selection::open_project(explicit)?;
            println!("{} ({} targets)", project.root().display(), project.registry().len());
        }
        Commands::Add { identifier } => {
            let (mut project, _lock) = selection::open_project(explicit)?;
            if project.registry_mut().add(&identifier)? {
                println!("Added {identifier}");
            } else {
                println!("Already registered: {identifier}");
            }
        }
        Commands::Import { file } => {
            let (mut project, _lock) = selection::open_project(explicit)?;
            let text = read_import(&file)?;
            let report = project.registry_mut().bulk_add(&text)?;
            for (line, reason) in &report.invalid {
                println!("invalid\t{line}\t{reason}");
            }
            println!(
                "{} added, {} already registered, {} invalid",
                report.added.len(),
                report.already_present.len(),
                report.invalid.len()
            );
        }
        Commands::Remove { identifier } => {
            let (mut project, _lock) = selection::open_project(explicit)?;
            let removed = project.remove_target(&identifier)?;
            println!("Removed {}", removed.identifier);
        }
        Commands::List { filter } => {
            let (project, _lock) = selection::open_project(explicit)?;
            let filter: StateFilter = filter.parse().map_err(|e: String| anyhow!(e))?;
            for target in project.registry().list(filter) {
                println!("{}\t{}\t{}", target.state, target.identifier, target.display_title());
            }
        }
        Commands::Titles => {
            let (project, _lock) = selection::open_project(explicit)?;
            let mut titles: Vec<&str> = project
                .registry()
                .list(StateFilter::State(TargetState::Downloaded))
                .map(|t| t.display_title())
                .collect();
            titles.sort_by_key(|t| t.to_lowercase());
            for title in titles {
                println!("{title}");
            }
        }
        Commands::Stats => {
            let (project, _lock) = selection::open_project(explicit)?;
            let s = project.registry().summary();
            println!("targets:         {}", s.total);
            println!("new:             {}", s.new);
            println!("downloaded:      {}", s.downloaded);
            println!("update required: {}", s.update_required);
            println!("failed:          {}", s.failed);
            println!("words:           {}", s.words);
            println!("chapters:        {}", s.chapters);
            println!("categories:      {}", s.categories);
        }
        Commands::Download { count } => {
            let settings = settings(cli.config.as_deref())?;
            let (mut project, _lock) = selection::open_project(explicit)?;
            let fetcher = FanFicFareFetcher::new(&settings.fanficfare);
            let report = match count {
                Some(n) => download_n(&mut project, &fetcher, n).await?,
                None => download_all(&mut project, &fetcher).await?,
            };
            print_batch(&report);
        }
        Commands::MarkUpdate { identifier } => {
            let (mut project, _lock) = selection::open_project(explicit)?;
            match mark_for_update(&mut project, &identifier)? {
                MarkOutcome::Marked => println!("Marked {identifier} for update"),
                MarkOutcome::AlreadyPending => println!("{identifier} is already queued for update"),
                MarkOutcome::NotYetDownloaded => {
                    println!("{identifier} has not been downloaded yet; `download` will fetch it")
                }
            }
        }
        Commands::Update { count } => {
            let settings = settings(cli.config.as_deref())?;
            let (mut project, _lock) = selection::open_project(explicit)?;
            let fetcher = FanFicFareFetcher::new(&settings.fanficfare);
            let report = match count {
                Some(n) => update_n(&mut project, &fetcher, n).await?,
                None => update_all(&mut project, &fetcher).await?,
            };
            print_batch(&report);
        }
        Commands::CheckMail => {
            let settings = settings(cli.config.as_deref())?;
            let maildir = settings
                .mail
                .maildir
                .clone()
                .ok_or_else(|| anyhow!("no Maildir configured; set mail.maildir in the --config file"))?;
            let (mut project, _lock) = selection::open_project(explicit)?;
            let source = MaildirSource::new(maildir);
            let report = scan_mailbox(&mut project, &source).await?;
            for id in &report.marked {
                println!("marked\t{id}");
            }
            for id in &report.unknown {
                println!("unknown\t{id}");
            }
            for (message, reason) in &report.mark_read_failures {
                println!("unread\t{message}\t{reason}");
            }
            println!(
                "{} messages, {} marked for update, {} already queued, {} unknown",
                report.messages,
                report.marked.len(),
                report.already_pending.len(),
                report.unknown.len()
            );
        }
        Commands::CheckCategory { url } => {
            let settings = settings(cli.config.as_deref())?;
            let (mut project, _lock) = selection::open_project(explicit)?;
            let lister = FfnetCategoryLister::new(settings.http.clone())?;
            let report = scan_category(&mut project, &lister, &url).await?;
            for id in &report.added {
                println!("added\t{id}");
            }
            for id in &report.marked {
                println!("marked\t{id}");
            }
            println!(
                "{} listed, {} added, {} marked for update, {} unchanged",
                report.listed,
                report.added.len(),
                report.marked.len(),
                report.unchanged
            );
        }
        Commands::GetOption { section, option } => {
            let (project, _lock) = selection::open_project(explicit)?;
            println!("{}", project.config().get(&section, &option)?);
        }
        Commands::SetOption { section, option, value } => {
            let (project, _lock) = selection::open_project(explicit)?;
            let stored = project.config().set(&section, &option, &value)?;
            println!("{section}.{option} = {stored}");
        }
        Commands::Options { section } => {
            let (project, _lock) = selection::open_project(explicit)?;
            let sections: Vec<&str> = match &section {
                Some(s) => vec![s.as_str()],
                None => SECTIONS.to_vec(),
            };
            for name in sections {
                for (option, value) in project.config().effective_section(name)? {
                    println!("{name}.{option} = {value}");
                }
            }
        }
        Commands::Alias { from, to } => {
            let (project, _lock) = selection::open_project(explicit)?;
            project.add_category_alias(&from, &to)?;
            println!("{from} -> {to}");
        }
        Commands::AddSubproject { path } => {
            let (project, _lock) = selection::open_project(explicit)?;
            if project.add_subproject(&path)? {
                println!("Added subproject {}", path.display());
            } else {
                println!("Already a subproject: {}", path.display());
            }
        }
        Commands::Build { output } => {
            let settings = settings(cli.config.as_deref())?;
            let (project, _lock) = selection::open_project(explicit)?;
            let packager = ZimPackager::new(&settings.zimwriterfs, &settings.pandoc);
            let minifier = CommandMinifier::new(&settings.minify);
            let report = build(&project, &packager, &minifier, &output).await?;
            for (id, reason) in &report.excluded {
                println!("excluded\t{id}\t{reason}");
            }
            for duplicate in &report.duplicates {
                println!("duplicate\t{}\t{}", duplicate.identifier, duplicate.dropped_from.display());
            }
            println!(
                "Built {} with {} stories and {} images",
                report.archive.display(),
                report.included.len(),
                report.images_packaged
            );
        }
        Commands::Export { output_dir, by_category } => {
            let settings = settings(cli.config.as_deref())?;
            let (project, _lock) = selection::open_project(explicit)?;
            let packager = ZimPackager::new(&settings.zimwriterfs, &settings.pandoc);
            let report = export(&project, &packager, &output_dir, by_category).await?;
            for (id, reason) in report.excluded.iter().chain(&report.failures) {
                println!("failed\t{id}\t{reason}");
            }
            println!("Exported {} stories to {}", report.exports.len(), output_dir.display());
        }
    }
    Ok(())
}

fn settings(path: Option<&Path>) -> Result<ToolSettings> {
    load_config(path)
}

fn read_import(file: &Path) -> Result<String> {
    if file == Path::new("-") {
        return std::io::read_to_string(std::io::stdin()).context("reading identifiers from stdin");
    }
    fs::read_to_string(file).with_context(|| format!("reading {}", file.display()))
}

fn print_batch(report: &BatchReport) {
    for attempt in &report.attempts {
        match &attempt.outcome {
            AttemptOutcome::Fetched { title, .. } => {
                println!("ok\t{}\t{}", attempt.identifier, title)
            }
            AttemptOutcome::Failed { reason } => {
                println!("failed\t{}\t{}", attempt.identifier, reason)
            }
        }
    }
    println!("{} fetched, {} failed", report.succeeded(), report.failed());
}
