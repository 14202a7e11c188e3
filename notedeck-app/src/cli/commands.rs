use crate::api::server as api_server;
use crate::cli::opts::*;

use anyhow::{anyhow, bail, Result};
use chrono::Utc;
use notedeck_core::{
    daily_streak, due_queue, filter_by_book, filter_by_text, library, market, per_deck_totals,
    scheduler, summarize, Deck, DeckId, NewNote, Note, NoteId, Quality, QueueOptions, Repository,
    Review, ReviewState,
};
use notedeck_json::paths::data_root;
use notedeck_json::JsonStore;
use notedeck_sqlite::SqliteRepo;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::io::{stdin, stdout, BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

pub async fn run_cli(args: Cli) -> Result<()> {
    let repo = open_repo(&args.store, args.db_path.clone(), args.data_dir.clone()).await?;
    let user = args.user.as_str();
    match args.cmd.clone() {
        Command::Api(api) => {
            let addr: std::net::SocketAddr = api.addr.parse()?;
            api_server::run(repo, user.to_string(), addr).await
        }
        Command::Deck(cmd) => deck_cmd(repo, user, cmd).await,
        Command::Note(cmd) => note_cmd(repo, user, cmd).await,
        Command::Review(cmd) => review_cmd(repo, user, cmd).await,
        Command::Due(cmd) => due_cmd(repo, user, cmd).await,
        Command::Schedule(cmd) => schedule_cmd(cmd),
        Command::Stats(cmd) => stats_cmd(repo, user, cmd).await,
        Command::Store(cmd) => store_cmd(repo, user, cmd).await,
        Command::Export(cmd) => export_cmd(repo, user, cmd).await,
        Command::Import(cmd) => import_cmd(repo, user, cmd).await,
    }
}

pub async fn open_repo(
    store: &StoreKind,
    db_path: Option<PathBuf>,
    data_dir: Option<PathBuf>,
) -> Result<Arc<dyn Repository>> {
    let root = data_dir.unwrap_or_else(data_root);
    match store {
        StoreKind::Json => {
            let s = JsonStore::open_in(&root).await?;
            info!(path = %s.path().display(), "using json store");
            Ok(Arc::new(s))
        }
        StoreKind::Sqlite => {
            let p = db_path.unwrap_or_else(|| root.join("notedeck.sqlite3"));
            if let Some(parent) = p.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let s = SqliteRepo::open_file(&p).await?;
            info!(path = %p.display(), "using sqlite store");
            Ok(Arc::new(s))
        }
    }
}

async fn deck_cmd(repo: Arc<dyn Repository>, user: &str, cmd: DeckCmd) -> Result<()> {
    match cmd {
        DeckCmd::Add { name } => {
            let d = library::create_deck(&*repo, user, &name).await?;
            println!("{}", d.id);
        }
        DeckCmd::List { all } => {
            let author = if all { None } else { Some(user) };
            for d in repo.list_decks(author).await? {
                let n = repo.list_notes(Some(d.id)).await?.len();
                println!("{}\t{}\tauthor={}\tnotes={}", d.id, d.name, d.author, n);
            }
        }
        DeckCmd::Rename { deck, name } => {
            let d = resolve_deck(&*repo, user, &deck).await?;
            library::rename_deck(&*repo, user, d.id, &name).await?;
            println!("ok");
        }
        DeckCmd::Describe { deck, description } => {
            let d = resolve_deck(&*repo, user, &deck).await?;
            library::describe_deck(&*repo, user, d.id, &description).await?;
            println!("ok");
        }
        DeckCmd::Rm { deck } => {
            let d = resolve_deck(&*repo, user, &deck).await?;
            library::delete_deck(&*repo, user, d.id).await?;
            println!("ok");
        }
    }
    Ok(())
}

async fn note_cmd(repo: Arc<dyn Repository>, user: &str, cmd: NoteCmd) -> Result<()> {
    match cmd {
        NoteCmd::Add(a) => {
            let deck = resolve_deck(&*repo, user, &a.deck).await?;
            let new = NewNote {
                book_id: a.book_id.unwrap_or_else(|| a.book.trim().to_lowercase()),
                book_name: a.book,
                book_detail: a.detail,
                content: a.text,
            };
            let n = library::add_note(&*repo, user, deck.id, new).await?;
            println!("{}", n.id);
        }
        NoteCmd::List { deck, search, book } => {
            let deck_id = deck_filter(&*repo, user, deck).await?;
            let mut notes = repo.list_notes(deck_id).await?;
            if let Some(q) = search {
                notes = filter_by_text(&notes, &q);
            }
            if let Some(b) = book {
                notes = filter_by_book(&notes, &b);
            }
            for n in notes {
                println!("{}", note_line(&n));
            }
        }
        NoteCmd::Edit { note_id, text } => {
            let id = parse_uuid(&note_id)?;
            library::edit_note(&*repo, user, id, &text).await?;
            println!("ok");
        }
        NoteCmd::History { note_id } => {
            for line in history_lines(&*repo, user, parse_uuid(&note_id)?).await? {
                println!("{line}");
            }
        }
        NoteCmd::Rm { note_id } => {
            let id = parse_uuid(&note_id)?;
            library::delete_note(&*repo, user, id).await?;
            println!("ok");
        }
    }
    Ok(())
}

async fn review_cmd(repo: Arc<dyn Repository>, user: &str, cmd: ReviewCmd) -> Result<()> {
    let deck_id = deck_filter(&*repo, user, cmd.deck.clone()).await?;
    let notes = owned_notes(&*repo, user, deck_id).await?;
    let queue = due_queue(&notes, Utc::now(), &queue_options(&cmd));
    if queue.is_empty() {
        println!("no notes due");
        return Ok(());
    }

    let total = queue.len();
    let mut reviewed = 0usize;
    for (i, note) in queue.into_iter().enumerate() {
        println!("\n[{}/{}] {}", i + 1, total, note.id);
        match &note.book_detail {
            Some(d) => println!("{} ({})", note.book_name, d),
            None => println!("{}", note.book_name),
        }
        if !prompt_enter(&mut stdin().lock(), "[enter=show]")? {
            break;
        }
        println!("{}", note.content.latest);
        println!("[0-5 quality (0=forgot, 5=trivial), s=skip, q=quit]");
        let q = match read_answer(&mut stdin().lock())? {
            Answer::Grade(q) => q,
            Answer::Skip => continue,
            Answer::Quit => break,
        };

        let out = library::review_note(&*repo, user, note.id, q, Utc::now()).await?;
        reviewed += 1;
        println!(
            "→ next review in {} day(s), {}",
            scheduler::days_until_review(q),
            out.next_review_date.format("%Y-%m-%d")
        );
    }

    println!("\nreviewed {reviewed}");
    Ok(())
}

fn queue_options(cmd: &ReviewCmd) -> QueueOptions {
    QueueOptions {
        include_new: !cmd.no_new,
        include_lapsed: !cmd.no_lapsed,
        max: Some(cmd.max),
    }
}

#[derive(Debug, PartialEq)]
enum Answer {
    Grade(Quality),
    Skip,
    Quit,
}

/// Prompts until a grade, skip or quit comes back. End of input quits.
fn read_answer<I: BufRead>(input: &mut I) -> Result<Answer> {
    loop {
        let Some(line) = read_line(input, "quality> ")? else {
            return Ok(Answer::Quit);
        };
        match line.trim().to_lowercase().as_str() {
            "s" | "skip" => return Ok(Answer::Skip),
            "q" | "quit" => return Ok(Answer::Quit),
            other => match other.parse::<Quality>() {
                Ok(q) => return Ok(Answer::Grade(q)),
                Err(e) => println!("{e}"),
            },
        }
    }
}

async fn due_cmd(repo: Arc<dyn Repository>, user: &str, cmd: DueCmd) -> Result<()> {
    let deck_id = deck_filter(&*repo, user, cmd.deck).await?;
    let notes = owned_notes(&*repo, user, deck_id).await?;
    let now = Utc::now();
    for n in due_queue(&notes, now, &QueueOptions::default()) {
        println!("{}\t{:?}", note_line(&n), n.due_status(now));
    }
    Ok(())
}

fn schedule_cmd(cmd: ScheduleCmd) -> Result<()> {
    let now = cmd.now.unwrap_or_else(Utc::now);
    let out = scheduler::schedule(cmd.quality, now, cmd.count);
    println!("{}", serde_json::to_string_pretty(&out)?);
    Ok(())
}

async fn stats_cmd(repo: Arc<dyn Repository>, user: &str, cmd: StatsCmd) -> Result<()> {
    let deck_id = deck_filter(&*repo, user, cmd.deck).await?;
    let notes = owned_notes(&*repo, user, deck_id).await?;
    let note_to_deck: HashMap<_, _> = notes.iter().map(|n| (n.id, n.deck_id)).collect();
    let reviews: Vec<_> = repo
        .list_reviews()
        .await?
        .into_iter()
        .filter(|r| note_to_deck.contains_key(&r.note_id))
        .collect();

    let summary = summarize(&reviews);
    let t = &summary.totals;
    println!(
        "reviews={} recalled={} failed={} accuracy={:.0}% mean_quality={:.2}",
        t.total,
        t.recalled,
        t.failed,
        t.accuracy() * 100.0,
        t.mean_quality()
    );
    println!("streak={} day(s)", daily_streak(&reviews, Utc::now().date_naive()));

    let decks: HashMap<DeckId, String> = repo
        .list_decks(Some(user))
        .await?
        .into_iter()
        .map(|d| (d.id, d.name))
        .collect();
    for (deck_id, totals) in per_deck_totals(&reviews, &note_to_deck) {
        let name = decks.get(&deck_id).cloned().unwrap_or_else(|| deck_id.to_string());
        println!("deck={}\treviews={}\taccuracy={:.0}%", name, totals.total, totals.accuracy() * 100.0);
    }
    Ok(())
}

async fn store_cmd(repo: Arc<dyn Repository>, user: &str, cmd: StoreCmd) -> Result<()> {
    match cmd {
        StoreCmd::List => {
            for l in repo.list_listings().await? {
                println!(
                    "{}\t{}\tby={}\tprice={}\tnotes={}\tbought={}\trating={:.1}",
                    l.id,
                    l.deck_name,
                    l.author,
                    format_cents(l.price_cents),
                    l.note_count,
                    l.purchase_count,
                    l.average_rating()
                );
            }
        }
        StoreCmd::Show { listing } => {
            let l = repo.get_listing(parse_uuid(&listing)?).await?;
            println!("{}", serde_json::to_string_pretty(&l)?);
            for r in repo.list_ratings(l.id).await? {
                println!("{}★ {} {}", r.rating, r.user_id, r.review.unwrap_or_default());
            }
        }
        StoreCmd::Sell { deck, price_cents, description } => {
            let d = resolve_deck(&*repo, user, &deck).await?;
            let l = market::list_for_sale(&*repo, user, d.id, price_cents, &description).await?;
            println!("{}", l.id);
        }
        StoreCmd::Unlist { listing } => {
            market::unlist(&*repo, user, parse_uuid(&listing)?).await?;
            println!("ok");
        }
        StoreCmd::Price { listing, price_cents } => {
            market::update_price(&*repo, user, parse_uuid(&listing)?, price_cents).await?;
            println!("ok");
        }
        StoreCmd::Buy { listing } => {
            market::purchase(&*repo, user, parse_uuid(&listing)?).await?;
            println!("ok");
        }
        StoreCmd::Rate { listing, rating, review } => {
            market::rate(&*repo, user, parse_uuid(&listing)?, rating, review).await?;
            println!("ok");
        }
    }
    Ok(())
}

async fn export_cmd(repo: Arc<dyn Repository>, user: &str, cmd: ExportCmd) -> Result<()> {
    match cmd {
        ExportCmd::Json { path } => {
            let decks = repo.list_decks(Some(user)).await?;
            let notes = owned_notes(&*repo, user, None).await?;
            let mut reviews = Vec::new();
            for n in &notes {
                reviews.extend(repo.list_reviews_for_note(n.id).await?);
            }
            let bundle = ExportBundle { version: EXPORT_VERSION, decks, notes, reviews };
            std::fs::write(&path, serde_json::to_string_pretty(&bundle)?)?;
            println!("wrote {}", path.display());
        }
        ExportCmd::Csv { path, deck } => {
            let deck_id = deck_filter(&*repo, user, deck).await?;
            let notes = owned_notes(&*repo, user, deck_id).await?;
            let deck_name: HashMap<DeckId, String> = repo
                .list_decks(Some(user))
                .await?
                .into_iter()
                .map(|d| (d.id, d.name))
                .collect();

            let mut wtr = csv::Writer::from_path(&path)?;
            wtr.write_record([
                "deck",
                "book",
                "detail",
                "content",
                "review_count",
                "last_reviewed",
                "next_review_date",
            ])?;
            for n in notes {
                let dn = deck_name
                    .get(&n.deck_id)
                    .cloned()
                    .unwrap_or_else(|| n.deck_id.to_string());
                wtr.write_record([
                    dn,
                    n.book_name,
                    n.book_detail.unwrap_or_default(),
                    n.content.latest,
                    n.review.review_count.to_string(),
                    n.review.last_reviewed.map(|t| t.to_rfc3339()).unwrap_or_default(),
                    n.review.next_review_date.map(|t| t.to_rfc3339()).unwrap_or_default(),
                ])?;
            }
            wtr.flush()?;
            println!("wrote {}", path.display());
        }
    }
    Ok(())
}

async fn import_cmd(repo: Arc<dyn Repository>, user: &str, cmd: ImportCmd) -> Result<()> {
    match cmd {
        ImportCmd::Json { path } => {
            let data = std::fs::read_to_string(&path)?;
            let bundle: ExportBundle = serde_json::from_str(&data)?;
            let report = import_bundle(&*repo, user, bundle).await?;
            println!(
                "imported {} note(s), skipped {} already present, reset {} review state(s)",
                report.imported, report.skipped, report.reset
            );
        }
    }
    Ok(())
}

#[derive(Debug, Default, PartialEq)]
struct ImportReport {
    imported: usize,
    skipped: usize,
    reset: usize,
}

/// Copies a bundle into `user`'s decks. Notes already present (same deck,
/// book and text) are skipped. A review state the scheduler could not have
/// produced is reset, and its log entries are dropped with it.
async fn import_bundle<R: Repository + ?Sized>(
    repo: &R,
    user: &str,
    bundle: ExportBundle,
) -> Result<ImportReport> {
    if bundle.version > EXPORT_VERSION {
        bail!("unsupported export version {}", bundle.version);
    }

    let mut deck_map: HashMap<DeckId, Deck> = HashMap::new();
    let mut present: HashSet<(DeckId, String, String)> = HashSet::new();
    for d in &bundle.decks {
        let mut target = ensure_deck_by_name(repo, user, &d.name).await?;
        if !d.description.is_empty() && target.description.is_empty() {
            target = library::describe_deck(repo, user, target.id, &d.description).await?;
        }
        for n in repo.list_notes(Some(target.id)).await? {
            present.insert((n.deck_id, n.book_id, n.content.latest));
        }
        deck_map.insert(d.id, target);
    }

    let mut logs: HashMap<NoteId, Vec<Review>> = HashMap::new();
    for r in bundle.reviews {
        logs.entry(r.note_id).or_default().push(r);
    }

    let mut report = ImportReport::default();
    for old in bundle.notes {
        let Some(deck) = deck_map.get(&old.deck_id) else {
            bail!("note {} references a deck missing from the bundle", old.id);
        };
        let key = (deck.id, old.book_id.clone(), old.content.latest.clone());
        if !present.insert(key) {
            report.skipped += 1;
            continue;
        }

        let mut note = Note::new(
            deck.id,
            NewNote {
                book_id: old.book_id,
                book_name: old.book_name,
                book_detail: old.book_detail,
                content: String::new(),
            },
        );
        note.content = old.content;
        let log = logs.remove(&old.id).unwrap_or_default();
        let log = if old.review.is_consistent() {
            note.review = old.review;
            log
        } else {
            warn!(note = %old.id, "inconsistent review state in import, resetting");
            note.review = ReviewState::default();
            report.reset += 1;
            Vec::new()
        };

        repo.insert_note(&note).await?;
        for r in log {
            repo.insert_review(&Review::new(note.id, r.quality, r.reviewed_at, r.interval_days))
                .await?;
        }
        report.imported += 1;
    }
    Ok(report)
}

// ===== Helpers =====
fn parse_uuid(s: &str) -> Result<Uuid> {
    Uuid::parse_str(s).map_err(|_| anyhow!("invalid uuid: {s}"))
}

fn format_cents(c: u64) -> String {
    format!("{}.{:02}", c / 100, c % 100)
}

fn note_line(n: &Note) -> String {
    let next = n
        .review
        .next_review_date
        .map(|t| t.format("%Y-%m-%d").to_string())
        .unwrap_or_else(|| "-".to_string());
    format!(
        "{}\t{}\t{}\treviews={}\tnext={}",
        n.id, n.book_name, n.content.latest, n.review.review_count, next
    )
}

/// Finds one of `user`'s decks by id or case-insensitive name.
pub async fn resolve_deck<R: Repository + ?Sized>(repo: &R, user: &str, sel: &str) -> Result<Deck> {
    if let Ok(id) = Uuid::parse_str(sel) {
        if let Ok(d) = repo.get_deck(id).await {
            if d.is_owned_by(user) {
                return Ok(d);
            }
        }
    }
    let decks = repo.list_decks(Some(user)).await?;
    if let Some(d) = decks.into_iter().find(|d| d.has_name(sel)) {
        return Ok(d);
    }
    bail!("deck not found: {}", sel)
}

async fn deck_filter<R: Repository + ?Sized>(
    repo: &R,
    user: &str,
    sel: Option<String>,
) -> Result<Option<DeckId>> {
    match sel {
        Some(s) => Ok(Some(resolve_deck(repo, user, &s).await?.id)),
        None => Ok(None),
    }
}

/// Notes in `user`'s decks, optionally narrowed to one deck.
pub async fn owned_notes<R: Repository + ?Sized>(
    repo: &R,
    user: &str,
    deck_id: Option<DeckId>,
) -> Result<Vec<Note>> {
    if deck_id.is_some() {
        return Ok(repo.list_notes(deck_id).await?);
    }
    let mut notes = Vec::new();
    for d in repo.list_decks(Some(user)).await? {
        notes.extend(repo.list_notes(Some(d.id)).await?);
    }
    Ok(notes)
}

async fn ensure_deck_by_name<R: Repository + ?Sized>(repo: &R, user: &str, name: &str) -> Result<Deck> {
    let decks = repo.list_decks(Some(user)).await?;
    if let Some(d) = decks.into_iter().find(|d| d.has_name(name)) {
        return Ok(d);
    }
    Ok(library::create_deck(repo, user, name).await?)
}

/// Edit history and review log of one of `user`'s notes.
async fn history_lines<R: Repository + ?Sized>(
    repo: &R,
    user: &str,
    note_id: NoteId,
) -> Result<Vec<String>> {
    let n = library::owned_note(repo, user, note_id).await?;
    let mut lines: Vec<String> = n
        .content
        .history
        .iter()
        .enumerate()
        .map(|(i, old)| format!("v{}\t{}", i + 1, old))
        .collect();
    lines.push(format!("latest\t{}", n.content.latest));
    for r in repo.list_reviews_for_note(note_id).await? {
        lines.push(format!(
            "review\t{}\tquality={}\tinterval={}d",
            r.reviewed_at.to_rfc3339(),
            r.quality,
            r.interval_days
        ));
    }
    Ok(lines)
}

/// False once input is exhausted.
fn prompt_enter<I: BufRead>(input: &mut I, label: &str) -> Result<bool> {
    Ok(read_line(input, label)?.is_some())
}

/// `None` at end of input.
fn read_line<I: BufRead>(input: &mut I, prompt: &str) -> Result<Option<String>> {
    print!("{prompt}");
    stdout().flush().ok();
    let mut s = String::new();
    if input.read_line(&mut s)? == 0 {
        return Ok(None);
    }
    Ok(Some(s))
}

const EXPORT_VERSION: u32 = 2;

#[derive(Serialize, Deserialize)]
struct ExportBundle {
    version: u32,
    decks: Vec<Deck>,
    notes: Vec<Note>,
    #[serde(default)]
    reviews: Vec<Review>,
}
