use chrono::{DateTime, Utc};
use clap::{Args, Parser, Subcommand, ValueEnum};
use notedeck_core::Quality;
use std::path::PathBuf;

#[derive(Debug, Clone, ValueEnum)]
pub enum StoreKind {
    Json,
    Sqlite,
}

#[derive(Debug, Parser, Clone)]
#[command(name = "notedeck", version, about = "NoteDeck: book notes, spaced review, and a deck marketplace")]
pub struct Cli {
    /// Storage backend
    #[arg(long, value_enum, default_value_t = StoreKind::Json, env = "NOTEDECK_STORE")]
    pub store: StoreKind,

    /// SQLite DB path when --store sqlite (defaults to the data dir)
    #[arg(long, env = "NOTEDECK_DB_PATH")]
    pub db_path: Option<PathBuf>,

    /// Data directory (defaults to the platform app data dir)
    #[arg(long, env = "NOTEDECK_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    /// Acting user; owns created decks and listings
    #[arg(long, env = "NOTEDECK_USER", default_value = "local")]
    pub user: String,

    #[command(subcommand)]
    pub cmd: Command,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Deck operations
    #[command(subcommand)]
    Deck(DeckCmd),
    /// Note operations
    #[command(subcommand)]
    Note(NoteCmd),
    /// Interactive review loop
    Review(ReviewCmd),
    /// List notes due for review
    Due(DueCmd),
    /// Show the schedule a quality rating would produce
    Schedule(ScheduleCmd),
    /// Review statistics
    Stats(StatsCmd),
    /// Marketplace
    #[command(subcommand)]
    Store(StoreCmd),
    /// Export data
    #[command(subcommand)]
    Export(ExportCmd),
    /// Import data
    #[command(subcommand)]
    Import(ImportCmd),
    /// Launch Axum HTTP API
    Api(ApiCmd),
}

#[derive(Debug, Subcommand, Clone)]
pub enum DeckCmd {
    Add { name: String },
    List {
        /// Include decks by every author
        #[arg(long)]
        all: bool,
    },
    Rename { deck: String, name: String },
    Describe { deck: String, description: String },
    Rm { deck: String },
}

#[derive(Debug, Subcommand, Clone)]
pub enum NoteCmd {
    Add(NoteAdd),
    List {
        #[arg(long)]
        deck: Option<String>,
        #[arg(long)]
        search: Option<String>,
        #[arg(long)]
        book: Option<String>,
    },
    Edit {
        note_id: String,
        #[arg(long)]
        text: String,
    },
    History { note_id: String },
    Rm { note_id: String },
}

#[derive(Debug, Args, Clone)]
pub struct NoteAdd {
    #[arg(long)]
    pub deck: String,
    #[arg(long)]
    pub book: String,
    /// Stable book identifier (defaults to the lowercased book name)
    #[arg(long)]
    pub book_id: Option<String>,
    /// Chapter, page or other locator inside the book
    #[arg(long)]
    pub detail: Option<String>,
    #[arg(long)]
    pub text: String,
}

#[derive(Debug, Args, Clone)]
pub struct ReviewCmd {
    #[arg(long)]
    pub deck: Option<String>,
    /// Leave out notes that were never reviewed
    #[arg(long)]
    pub no_new: bool,
    /// Leave out notes overdue by a day or more
    #[arg(long)]
    pub no_lapsed: bool,
    #[arg(long, default_value_t = 50)]
    pub max: usize,
}

#[derive(Debug, Args, Clone)]
pub struct DueCmd {
    #[arg(long)]
    pub deck: Option<String>,
}

#[derive(Debug, Args, Clone)]
pub struct ScheduleCmd {
    /// Recall quality, 0 (forgot) to 5 (trivial)
    #[arg(long)]
    pub quality: Quality,
    /// Review time (RFC 3339); defaults to now
    #[arg(long)]
    pub now: Option<DateTime<Utc>>,
    /// Reviews completed so far
    #[arg(long, default_value_t = 0)]
    pub count: u32,
}

#[derive(Debug, Args, Clone)]
pub struct StatsCmd {
    #[arg(long)]
    pub deck: Option<String>,
}

#[derive(Debug, Subcommand, Clone)]
pub enum StoreCmd {
    List,
    Show { listing: String },
    Sell {
        #[arg(long)]
        deck: String,
        #[arg(long)]
        price_cents: u64,
        #[arg(long, default_value = "")]
        description: String,
    },
    Unlist { listing: String },
    Price { listing: String, price_cents: u64 },
    Buy { listing: String },
    Rate {
        listing: String,
        rating: u8,
        #[arg(long)]
        review: Option<String>,
    },
}

#[derive(Debug, Subcommand, Clone)]
pub enum ExportCmd {
    Json { path: PathBuf },
    Csv { path: PathBuf, #[arg(long)] deck: Option<String> },
}

#[derive(Debug, Subcommand, Clone)]
pub enum ImportCmd {
    Json { path: PathBuf },
}

#[derive(Debug, Args, Clone)]
pub struct ApiCmd {
    /// Bind address (host:port)
    #[arg(long, default_value = "127.0.0.1:8080")]
    pub addr: String,
}
