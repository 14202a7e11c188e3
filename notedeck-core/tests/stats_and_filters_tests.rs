use chrono::{Duration, Utc};
use notedeck_core::{
    daily_streak, due_queue, filter_by_book, filter_by_due, filter_by_text, review_order,
    schedule, summarize, Deck, DueStatus, NewNote, Note, QueueOptions, Quality, Review,
};

fn note(deck: &Deck, book: &str, text: &str) -> Note {
    Note::new(
        deck.id,
        NewNote {
            book_id: book.to_lowercase(),
            book_name: book.into(),
            book_detail: Some("ch. 1".into()),
            content: text.into(),
        },
    )
}

#[test]
fn filters_text_and_book() {
    let deck = Deck::new("ann", "Mixed");
    let n1 = note(&deck, "Walden", "Simplify, simplify");
    let n2 = note(&deck, "Meditations", "The obstacle is the way");
    let v = vec![n1, n2];

    let by_text = filter_by_text(&v, "OBSTACLE");
    assert_eq!(by_text.len(), 1);
    assert_eq!(by_text[0].book_name, "Meditations");

    assert_eq!(filter_by_text(&v, "walden").len(), 1);
    assert_eq!(filter_by_text(&v, "  ").len(), 2);
    assert_eq!(filter_by_book(&v, "walden").len(), 1);
}

#[test]
fn due_status_and_queue() {
    let deck = Deck::new("ann", "D");
    let now = Utc::now();
    let q = Quality::new(5).unwrap();

    let fresh = note(&deck, "A", "new");

    let mut due = note(&deck, "B", "due");
    due.review = schedule(q, now - Duration::days(2), 1).into();

    let mut lapsed = note(&deck, "C", "lapsed");
    lapsed.review = schedule(q, now - Duration::days(5), 3).into();

    let mut future = note(&deck, "D", "future");
    future.review = schedule(q, now, 1).into();

    let v = vec![future.clone(), lapsed.clone(), due.clone(), fresh.clone()];
    assert_eq!(filter_by_due(&v, now, DueStatus::New).len(), 1);
    assert_eq!(filter_by_due(&v, now, DueStatus::DueToday).len(), 1);
    assert_eq!(filter_by_due(&v, now, DueStatus::Lapsed).len(), 1);
    assert_eq!(filter_by_due(&v, now, DueStatus::Future).len(), 1);

    let queue = due_queue(&v, now, &QueueOptions::default());
    let order: Vec<&str> = queue.iter().map(|n| n.content.latest.as_str()).collect();
    assert_eq!(order, vec!["new", "lapsed", "due"]);

    let only_due = due_queue(
        &v,
        now,
        &QueueOptions {
            include_new: false,
            include_lapsed: false,
            max: Some(5),
        },
    );
    assert_eq!(only_due.len(), 1);
}

#[test]
fn review_order_puts_unreviewed_first() {
    let deck = Deck::new("ann", "D");
    let now = Utc::now();
    let mut reviewed = note(&deck, "A", "reviewed");
    reviewed.review = schedule(Quality::new(0).unwrap(), now, 0).into();
    let fresh = note(&deck, "B", "fresh");

    let mut v = vec![reviewed, fresh];
    review_order(&mut v);
    assert_eq!(v[0].content.latest, "fresh");
}

#[test]
fn stats_and_streak() {
    let deck = Deck::new("ann", "D");
    let n = note(&deck, "A", "x");
    let now = Utc::now();
    let q = |v| Quality::new(v).unwrap();

    let r0 = Review::new(n.id, q(5), now - Duration::days(2), 2);
    let r1 = Review::new(n.id, q(3), now - Duration::days(1), 8);
    let r2 = Review::new(n.id, q(0), now, 14);
    let reviews = [r0, r1, r2];

    let s = summarize(&reviews);
    assert_eq!(s.totals.total, 3);
    assert_eq!(s.totals.failed, 1);
    assert_eq!(s.totals.recalled, 2);
    assert!((s.totals.accuracy() - 2.0 / 3.0).abs() < 1e-6);
    assert!((s.totals.mean_quality() - 8.0 / 3.0).abs() < 1e-6);

    assert_eq!(daily_streak(&reviews, now.date_naive()), 3);
    assert_eq!(
        daily_streak(&reviews, (now - Duration::days(3)).date_naive()),
        0
    );
}
