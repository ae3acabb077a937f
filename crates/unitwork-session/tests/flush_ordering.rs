mod common;

use std::sync::Arc;

use asupersync::Cx;
use unitwork_core::{EntityRef, MetadataStorage, Platform, Value};
use unitwork_session::{UnitOfWork, UnitOfWorkConfig};

use common::{MemoryDriver, Statement, company, library, meta, run, unwrap_outcome};

fn setup(storage: Arc<MetadataStorage>) -> (Arc<MemoryDriver>, UnitOfWork<MemoryDriver>) {
    let driver = Arc::new(MemoryDriver::new(Arc::clone(&storage)));
    let uow = UnitOfWork::new(Arc::clone(&driver), storage);
    (driver, uow)
}

#[test]
fn parent_is_inserted_before_child_and_key_propagates() {
    let storage = library();
    let (driver, mut uow) = setup(Arc::clone(&storage));
    let cx = Cx::for_testing();

    run(async {
        let author = EntityRef::new(&meta(&storage, "Author")).with("name", "Ursula");
        let book = EntityRef::new(&meta(&storage, "Book")).with("title", "The Dispossessed");
        book.link_reference("author", Some(&author)).unwrap();

        uow.persist(&book).unwrap();
        assert_eq!(uow.pending_counts().persist, 2);

        let result = unwrap_outcome(uow.commit(&cx).await);
        assert_eq!(result.inserted, 2);
        assert_eq!(driver.write_labels(), vec!["insert:authors", "insert:books"]);

        let statements = driver.statements();
        assert_eq!(statements.first(), Some(&Statement::Begin));
        assert_eq!(statements.last(), Some(&Statement::Commit));

        let author_id = author.get("id");
        assert!(!author_id.is_null());
        let book_row = driver
            .row("books", &[book.get("id")])
            .expect("book row written");
        assert_eq!(book_row.get("author"), Some(&author_id));

        let counts = uow.pending_counts();
        assert_eq!(counts.persist, 0);
        assert_eq!(counts.managed, 2);
        assert!(uow.is_managed(&author));
        assert!(uow.is_managed(&book));
    });
}

#[test]
fn update_carries_only_changed_properties() {
    let storage = library();
    let (driver, mut uow) = setup(Arc::clone(&storage));
    let cx = Cx::for_testing();

    run(async {
        let author = EntityRef::new(&meta(&storage, "Author")).with("name", "Ursula");
        let book = EntityRef::new(&meta(&storage, "Book")).with("title", "The Lathe of Heaven");
        book.link_reference("author", Some(&author)).unwrap();
        uow.persist(&book).unwrap();
        unwrap_outcome(uow.commit(&cx).await);
        driver.clear_log();

        author.set("name", "Ursula K. Le Guin");
        let result = unwrap_outcome(uow.commit(&cx).await);
        assert_eq!(result.updated, 1);
        assert_eq!(result.inserted, 0);

        let writes = driver.writes();
        assert_eq!(writes.len(), 1);
        let Statement::Update { table, data } = &writes[0] else {
            panic!("expected an update, got {writes:?}");
        };
        assert_eq!(*table, "authors");
        assert_eq!(data.keys().copied().collect::<Vec<_>>(), vec!["name"]);
    });
}

#[test]
fn clean_flush_issues_no_statements() {
    let storage = library();
    let (driver, mut uow) = setup(Arc::clone(&storage));
    let cx = Cx::for_testing();

    run(async {
        let author = EntityRef::new(&meta(&storage, "Author")).with("name", "Octavia");
        uow.persist(&author).unwrap();
        unwrap_outcome(uow.commit(&cx).await);
        driver.clear_log();

        let result = unwrap_outcome(uow.commit(&cx).await);
        assert_eq!(result.total(), 0);
        assert!(driver.statements().is_empty());

        // persisting a clean managed entity is not a change either
        uow.persist(&author).unwrap();
        let result = unwrap_outcome(uow.commit(&cx).await);
        assert_eq!(result.total(), 0);
        assert!(driver.statements().is_empty());
    });
}

#[test]
fn removing_an_unflushed_entity_cancels_its_insert() {
    let storage = library();
    let (driver, mut uow) = setup(Arc::clone(&storage));
    let cx = Cx::for_testing();

    run(async {
        let author = EntityRef::new(&meta(&storage, "Author")).with("name", "Draft");
        uow.persist(&author).unwrap();
        uow.remove(&author).unwrap();
        assert_eq!(uow.pending_counts().persist, 0);
        assert_eq!(uow.pending_counts().remove, 0);

        let result = unwrap_outcome(uow.commit(&cx).await);
        assert_eq!(result.total(), 0);
        assert!(driver.writes().is_empty());
    });
}

#[test]
fn recreated_unique_value_deletes_first() {
    let storage = library();
    let (driver, mut uow) = setup(Arc::clone(&storage));
    let cx = Cx::for_testing();

    run(async {
        let user_meta = meta(&storage, "User");
        let old = EntityRef::new(&user_meta).with("email", "ada@example.com");
        uow.persist(&old).unwrap();
        unwrap_outcome(uow.commit(&cx).await);
        driver.clear_log();

        uow.remove(&old).unwrap();
        let new = EntityRef::new(&user_meta).with("email", "ada@example.com");
        uow.persist(&new).unwrap();

        let result = unwrap_outcome(uow.commit(&cx).await);
        assert_eq!(result.deleted, 1);
        assert_eq!(result.inserted, 1);
        assert_eq!(driver.write_labels(), vec!["delete:users", "insert:users"]);
        assert_eq!(driver.count("users"), 1);

        assert!(!uow.is_managed(&old));
        assert!(old.primary_key().is_none());
        let by_email = uow
            .get_by_unique("User", &["email"], &[Value::from("ada@example.com")])
            .unwrap()
            .expect("new user indexed by email");
        assert!(by_email.ptr_eq(&new));
    });
}

#[test]
fn update_freeing_a_unique_value_runs_before_insert() {
    let storage = library();
    let (driver, mut uow) = setup(Arc::clone(&storage));
    let cx = Cx::for_testing();

    run(async {
        let user_meta = meta(&storage, "User");
        let first = EntityRef::new(&user_meta).with("email", "grace@example.com");
        uow.persist(&first).unwrap();
        unwrap_outcome(uow.commit(&cx).await);
        driver.clear_log();

        first.set("email", "grace.hopper@example.com");
        let second = EntityRef::new(&user_meta).with("email", "grace@example.com");
        uow.persist(&second).unwrap();

        unwrap_outcome(uow.commit(&cx).await);
        assert_eq!(driver.write_labels(), vec!["update:users", "insert:users"]);
        assert_eq!(driver.count("users"), 2);
    });
}

#[test]
fn nullable_unique_values_can_be_swapped() {
    let storage = library();
    let (driver, mut uow) = setup(Arc::clone(&storage));
    let cx = Cx::for_testing();

    run(async {
        let user_meta = meta(&storage, "User");
        let a = EntityRef::new(&user_meta)
            .with("email", "a@example.com")
            .with("nickname", "left");
        let b = EntityRef::new(&user_meta)
            .with("email", "b@example.com")
            .with("nickname", "right");
        uow.persist(&a).unwrap();
        uow.persist(&b).unwrap();
        unwrap_outcome(uow.commit(&cx).await);
        driver.clear_log();

        a.set("nickname", "right");
        b.set("nickname", "left");
        let result = unwrap_outcome(uow.commit(&cx).await);
        assert_eq!(result.updated, 2);
        assert_eq!(result.extra_updates, 2);

        let writes = driver.writes();
        assert_eq!(writes.len(), 4);
        let Statement::Update { data, .. } = &writes[0] else {
            panic!("expected an update, got {writes:?}");
        };
        assert_eq!(data.get("nickname"), Some(&Value::Null));

        let a_row = driver.row("users", &[a.get("id")]).unwrap();
        let b_row = driver.row("users", &[b.get("id")]).unwrap();
        assert_eq!(a_row.get("nickname"), Some(&Value::from("right")));
        assert_eq!(b_row.get("nickname"), Some(&Value::from("left")));
    });
}

#[test]
fn platform_with_unique_batch_updates_skips_deferral() {
    let storage = library();
    let platform = Platform {
        allows_unique_batch_updates: true,
        ..Platform::default()
    };
    let driver = Arc::new(MemoryDriver::with_platform(Arc::clone(&storage), platform));
    let mut uow = UnitOfWork::new(Arc::clone(&driver), Arc::clone(&storage));
    let cx = Cx::for_testing();

    run(async {
        let user = EntityRef::new(&meta(&storage, "User"))
            .with("email", "c@example.com")
            .with("nickname", "before");
        uow.persist(&user).unwrap();
        unwrap_outcome(uow.commit(&cx).await);
        driver.clear_log();

        user.set("nickname", "after");
        let result = unwrap_outcome(uow.commit(&cx).await);
        assert_eq!(result.extra_updates, 0);
        assert_eq!(driver.writes().len(), 1);
    });
}

#[test]
fn cascade_remove_deletes_children_first() {
    let storage = library();
    let (driver, mut uow) = setup(Arc::clone(&storage));
    let cx = Cx::for_testing();

    run(async {
        let author = EntityRef::new(&meta(&storage, "Author")).with("name", "Iain");
        let book = EntityRef::new(&meta(&storage, "Book")).with("title", "Excession");
        author.add_to_collection("books", &book).unwrap();
        uow.persist(&author).unwrap();
        unwrap_outcome(uow.commit(&cx).await);
        assert_eq!(driver.count("books"), 1);
        driver.clear_log();

        uow.remove(&author).unwrap();
        assert_eq!(uow.pending_counts().remove, 2);
        let result = unwrap_outcome(uow.commit(&cx).await);
        assert_eq!(result.deleted, 2);
        assert_eq!(driver.write_labels(), vec!["delete:books", "delete:authors"]);
        assert_eq!(driver.count("authors"), 0);

        assert!(!uow.is_managed(&author));
        assert!(!uow.is_managed(&book));
        assert!(author.primary_key().is_none());
        assert!(book.primary_key().is_none());
    });
}

#[test]
fn orphaned_child_is_deleted() {
    let storage = library();
    let (driver, mut uow) = setup(Arc::clone(&storage));
    let cx = Cx::for_testing();

    run(async {
        let author = EntityRef::new(&meta(&storage, "Author")).with("name", "Becky");
        let kept = EntityRef::new(&meta(&storage, "Book")).with("title", "Record of a Spaceborn Few");
        let dropped = EntityRef::new(&meta(&storage, "Book")).with("title", "Draft");
        author.add_to_collection("books", &kept).unwrap();
        author.add_to_collection("books", &dropped).unwrap();
        uow.persist(&author).unwrap();
        unwrap_outcome(uow.commit(&cx).await);
        driver.clear_log();

        author.remove_from_collection("books", &dropped).unwrap();
        let result = unwrap_outcome(uow.commit(&cx).await);
        assert_eq!(result.deleted, 1);
        assert_eq!(driver.write_labels(), vec!["delete:books"]);
        assert_eq!(driver.count("books"), 1);
        assert!(uow.is_managed(&kept));
        assert!(!uow.is_managed(&dropped));
    });
}

#[test]
fn reparented_child_is_not_orphaned() {
    let storage = library();
    let (driver, mut uow) = setup(Arc::clone(&storage));
    let cx = Cx::for_testing();

    run(async {
        let first = EntityRef::new(&meta(&storage, "Author")).with("name", "First");
        let second = EntityRef::new(&meta(&storage, "Author")).with("name", "Second");
        let book = EntityRef::new(&meta(&storage, "Book")).with("title", "Shared");
        first.add_to_collection("books", &book).unwrap();
        uow.persist(&first).unwrap();
        uow.persist(&second).unwrap();
        unwrap_outcome(uow.commit(&cx).await);
        driver.clear_log();

        first.remove_from_collection("books", &book).unwrap();
        second.add_to_collection("books", &book).unwrap();
        unwrap_outcome(uow.commit(&cx).await);

        assert_eq!(driver.write_labels(), vec!["update:books"]);
        let row = driver.row("books", &[book.get("id")]).unwrap();
        assert_eq!(row.get("author"), Some(&second.get("id")));
    });
}

#[test]
fn cycle_is_broken_with_an_extra_update() {
    let storage = company();
    let (driver, mut uow) = setup(Arc::clone(&storage));
    let cx = Cx::for_testing();

    run(async {
        let department = EntityRef::new(&meta(&storage, "Department")).with("name", "Research");
        let head = EntityRef::new(&meta(&storage, "Employee")).with("name", "Mary");
        head.link_reference("department", Some(&department)).unwrap();
        department.link_reference("head", Some(&head)).unwrap();

        uow.persist(&department).unwrap();
        let result = unwrap_outcome(uow.commit(&cx).await);
        assert_eq!(result.inserted, 2);
        assert_eq!(result.extra_updates, 1);
        assert_eq!(
            driver.write_labels(),
            vec!["insert:departments", "insert:employees", "update:departments"]
        );

        let row = driver.row("departments", &[department.get("id")]).unwrap();
        assert_eq!(row.get("head"), Some(&head.get("id")));

        // the snapshot already holds the resolved key
        driver.clear_log();
        unwrap_outcome(uow.commit(&cx).await);
        assert!(driver.writes().is_empty());
    });
}

#[test]
fn self_reference_within_one_type_resolves() {
    let storage = company();
    let (driver, mut uow) = setup(Arc::clone(&storage));
    let cx = Cx::for_testing();

    run(async {
        let department = EntityRef::new(&meta(&storage, "Department")).with("name", "Ops");
        let boss = EntityRef::new(&meta(&storage, "Employee")).with("name", "Boss");
        let report = EntityRef::new(&meta(&storage, "Employee")).with("name", "Report");
        boss.link_reference("department", Some(&department)).unwrap();
        report.link_reference("department", Some(&department)).unwrap();
        report.link_reference("manager", Some(&boss)).unwrap();

        uow.persist(&report).unwrap();
        unwrap_outcome(uow.commit(&cx).await);

        assert_eq!(driver.count("employees"), 2);
        let row = driver.row("employees", &[report.get("id")]).unwrap();
        assert_eq!(row.get("manager"), Some(&boss.get("id")));
    });
}

#[test]
fn pivot_collection_is_synchronized() {
    let storage = library();
    let (driver, mut uow) = setup(Arc::clone(&storage));
    let cx = Cx::for_testing();

    run(async {
        let book = EntityRef::new(&meta(&storage, "Book")).with("title", "Ancillary Justice");
        let space = EntityRef::new(&meta(&storage, "Tag")).with("label", "space");
        let ai = EntityRef::new(&meta(&storage, "Tag")).with("label", "ai");
        book.add_to_collection("tags", &space).unwrap();
        book.add_to_collection("tags", &ai).unwrap();

        uow.persist(&book).unwrap();
        let result = unwrap_outcome(uow.commit(&cx).await);
        assert_eq!(result.inserted, 3);
        assert_eq!(result.collections, 1);
        assert_eq!(driver.pivot_len("book_tags"), 2);
        assert_eq!(driver.write_labels().last().map(String::as_str), Some("sync:book_tags"));
        driver.clear_log();

        book.remove_from_collection("tags", &space).unwrap();
        let result = unwrap_outcome(uow.commit(&cx).await);
        assert_eq!(result.collections, 1);
        assert_eq!(
            driver.writes(),
            vec![Statement::Sync {
                pivot: "book_tags",
                added: 0,
                removed: 1
            }]
        );
        assert_eq!(driver.pivot_len("book_tags"), 1);

        driver.clear_log();
        unwrap_outcome(uow.commit(&cx).await);
        assert!(driver.writes().is_empty());
    });
}

#[test]
fn disabled_change_tracking_only_diffs_persisted_entities() {
    let storage = library();
    let driver = Arc::new(MemoryDriver::new(Arc::clone(&storage)));
    let config = UnitOfWorkConfig::new().disable_change_tracking(true);
    let mut uow = UnitOfWork::with_config(Arc::clone(&driver), Arc::clone(&storage), config);
    let cx = Cx::for_testing();

    run(async {
        let author = EntityRef::new(&meta(&storage, "Author")).with("name", "N. K.");
        uow.persist(&author).unwrap();
        unwrap_outcome(uow.commit(&cx).await);
        driver.clear_log();

        author.set("name", "N. K. Jemisin");
        unwrap_outcome(uow.commit(&cx).await);
        assert!(driver.writes().is_empty());

        uow.persist(&author).unwrap();
        let result = unwrap_outcome(uow.commit(&cx).await);
        assert_eq!(result.updated, 1);
    });
}

#[test]
fn implicit_transactions_can_be_turned_off() {
    let storage = library();
    let driver = Arc::new(MemoryDriver::new(Arc::clone(&storage)));
    let config = UnitOfWorkConfig::new().implicit_transactions(false);
    let mut uow = UnitOfWork::with_config(Arc::clone(&driver), Arc::clone(&storage), config);
    let cx = Cx::for_testing();

    run(async {
        let author = EntityRef::new(&meta(&storage, "Author")).with("name", "Ted");
        uow.persist(&author).unwrap();
        unwrap_outcome(uow.commit(&cx).await);
        assert_eq!(driver.statements().len(), 1);
        assert!(!driver.statements().contains(&Statement::Begin));
    });
}

#[test]
fn batched_inserts_assign_keys_in_order() {
    let storage = library();
    let (driver, mut uow) = setup(Arc::clone(&storage));
    let cx = Cx::for_testing();

    run(async {
        let tags: Vec<EntityRef> = ["one", "two", "three"]
            .into_iter()
            .map(|label| EntityRef::new(&meta(&storage, "Tag")).with("label", label))
            .collect();
        for tag in &tags {
            uow.persist(tag).unwrap();
        }
        let result = unwrap_outcome(uow.commit(&cx).await);
        assert_eq!(result.inserted, 3);
        for tag in &tags {
            let row = driver.row("tags", &[tag.get("id")]).expect("row per tag");
            assert_eq!(row.get("label"), Some(&tag.get("label")));
        }
    });
}
