use notedeck_core::{library, market, repo::memory::MemoryRepo, CoreError, NewNote, Repository};

async fn seeded() -> (MemoryRepo, notedeck_core::Deck) {
    let repo = MemoryRepo::new();
    let deck = library::create_deck(&repo, "ann", "Stoic quotes").await.unwrap();
    let books = [
        ("Meditations", Some("Book II")),
        ("Letters", None),
        ("Meditations", Some("Book II")),
        ("Enchiridion", None),
    ];
    for (i, (book, detail)) in books.into_iter().enumerate() {
        library::add_note(
            &repo,
            "ann",
            deck.id,
            NewNote {
                book_id: book.to_lowercase(),
                book_name: book.into(),
                book_detail: detail.map(String::from),
                content: format!("quote {i}"),
            },
        )
        .await
        .unwrap();
    }
    (repo, deck)
}

#[tokio::test]
async fn listing_snapshots_the_deck() {
    let (repo, deck) = seeded().await;
    let listing = market::list_for_sale(&repo, "ann", deck.id, 499, "Daily wisdom")
        .await
        .unwrap();

    assert_eq!(listing.deck_name, "Stoic quotes");
    assert_eq!(listing.note_count, 4);
    assert_eq!(listing.preview_notes.len(), 3);
    let mut names: Vec<&str> = listing
        .referenced_books
        .iter()
        .map(|b| b.name.as_str())
        .collect();
    names.sort();
    assert_eq!(names, vec!["Enchiridion", "Letters", "Meditations"]);
    assert_eq!(listing.average_rating(), 0.0);
}

#[tokio::test]
async fn cannot_list_someone_elses_deck() {
    let (repo, deck) = seeded().await;
    let err = market::list_for_sale(&repo, "bob", deck.id, 100, "")
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::Forbidden(_)));
}

#[tokio::test]
async fn purchase_then_rate() {
    let (repo, deck) = seeded().await;
    let listing = market::list_for_sale(&repo, "ann", deck.id, 499, "").await.unwrap();

    let err = market::rate(&repo, "bob", listing.id, 5, None).await.unwrap_err();
    assert!(matches!(err, CoreError::Forbidden(_)));

    market::purchase(&repo, "bob", listing.id).await.unwrap();
    market::purchase(&repo, "cat", listing.id).await.unwrap();
    let again = market::purchase(&repo, "bob", listing.id).await.unwrap_err();
    assert!(matches!(again, CoreError::Conflict(_)));
    let own = market::purchase(&repo, "ann", listing.id).await.unwrap_err();
    assert!(matches!(own, CoreError::Invalid(_)));

    market::rate(&repo, "bob", listing.id, 5, Some("great".into())).await.unwrap();
    market::rate(&repo, "cat", listing.id, 2, None).await.unwrap();
    let bad = market::rate(&repo, "cat", listing.id, 0, None).await.unwrap_err();
    assert!(matches!(bad, CoreError::Invalid(_)));
    let twice = market::rate(&repo, "bob", listing.id, 5, None).await.unwrap_err();
    assert!(matches!(twice, CoreError::Conflict(_)));

    let stored = repo.get_listing(listing.id).await.unwrap();
    assert_eq!(stored.purchase_count, 2);
    assert_eq!(stored.rating_count, 2);
    assert!((stored.average_rating() - 3.5).abs() < f32::EPSILON);
    assert_eq!(repo.list_ratings(listing.id).await.unwrap().len(), 2);
}

#[tokio::test]
async fn only_author_changes_price_or_unlists() {
    let (repo, deck) = seeded().await;
    let listing = market::list_for_sale(&repo, "ann", deck.id, 499, "").await.unwrap();

    let err = market::update_price(&repo, "bob", listing.id, 1).await.unwrap_err();
    assert!(matches!(err, CoreError::Forbidden(_)));
    let updated = market::update_price(&repo, "ann", listing.id, 299).await.unwrap();
    assert_eq!(updated.price_cents, 299);

    assert!(market::unlist(&repo, "bob", listing.id).await.is_err());
    market::unlist(&repo, "ann", listing.id).await.unwrap();
    assert!(repo.list_listings().await.unwrap().is_empty());
}
