use kvrel::Database;
use kvrel::catalog::schema::ForeignKeyDef;
use kvrel::catalog::types::{Row, Value};
use kvrel::commit::update::Assignments;
use kvrel::config::StoreConfig;
use kvrel::query::plan::Predicate;
use kvrel::storage::memory::MemoryBackend;

async fn users_db() -> Database<MemoryBackend> {
    let db = Database::in_memory(StoreConfig::default()).expect("open");
    db.create_table("users", &["id", "email", "team"])
        .await
        .expect("users");
    db
}

fn user(email: &str, team: &str) -> Row {
    Row::new().with("email", email).with("team", team)
}

#[tokio::test]
async fn insert_requires_exact_non_key_fields() {
    let db = users_db().await;
    for (row, what) in [
        (Row::new().with("email", "a@x"), "missing field"),
        (user("a@x", "red").with("age", 3_i64), "extra field"),
        (user("a@x", "red").with("id", 9_i64), "explicit primary key"),
    ] {
        let err = db.insert("users", row).await.expect_err(what);
        assert_eq!(err.code_str(), "invalid_schema", "{what}");
    }
    let err = db
        .insert("ghosts", user("a@x", "red"))
        .await
        .expect_err("no table");
    assert_eq!(err.code_str(), "no_such_table");
}

#[tokio::test]
async fn select_validates_fields() {
    let db = users_db().await;
    let err = db.select(&["nope"], "users", None).await.expect_err("projection");
    assert_eq!(err.code_str(), "invalid_query_fields");
    assert!(err.is_schema_error());
    let err = db
        .select(&["*"], "users", Some(Predicate::new().equals("nope", 1_i64)))
        .await
        .expect_err("predicate");
    assert_eq!(err.code_str(), "invalid_predicate_fields");
    assert!(err.is_schema_error());
}

#[tokio::test]
async fn primary_key_lookup_beyond_counter_is_out_of_range() {
    let db = users_db().await;
    db.insert("users", user("a@x", "red")).await.expect("insert");
    let rows = db
        .select(&["email"], "users", Some(Predicate::new().equals("id", 1_i64)))
        .await
        .expect("in range");
    assert_eq!(rows, vec![Row::new().with("email", "a@x")]);
    let err = db
        .select(&["*"], "users", Some(Predicate::new().equals("id", 2_i64)))
        .await
        .expect_err("beyond counter");
    assert_eq!(err.code_str(), "out_of_range");
}

#[tokio::test]
async fn index_scans_follow_updates() {
    let db = users_db().await;
    db.create_index("users", "by_team", &["team"]).await.expect("index");
    for (email, team) in [("a@x", "red"), ("b@x", "blue"), ("c@x", "red")] {
        db.insert("users", user(email, team)).await.expect("insert");
    }
    let red = Predicate::new().equals("team", "red");
    let rows = db
        .select(&["email"], "users", Some(red.clone()))
        .await
        .expect("select");
    assert_eq!(
        rows,
        vec![Row::new().with("email", "a@x"), Row::new().with("email", "c@x")]
    );

    let moved = db
        .update(
            "users",
            Assignments::new().set("team", "blue"),
            Some(Predicate::new().equals("email", "a@x")),
        )
        .await
        .expect("update");
    assert_eq!(moved, 1);

    let rows = db.select(&["id"], "users", Some(red)).await.expect("select");
    assert_eq!(rows, vec![Row::new().with("id", 3_i64)]);
    let blue = db
        .select(&["id"], "users", Some(Predicate::new().equals("team", "blue")))
        .await
        .expect("select");
    assert_eq!(blue.len(), 2);

    // The stale entry for a@x is gone from the store, not just filtered out.
    let keys = db.backend().register_keys("default-bucket");
    assert!(!keys.iter().any(|k| k == "users/I/by_team/team/s:red/1"));
    assert!(keys.iter().any(|k| k == "users/I/by_team/team/s:blue/1"));
}

#[tokio::test]
async fn unique_value_is_released_by_update() {
    let db = users_db().await;
    db.create_unique_index("users", "by_email", &["email"])
        .await
        .expect("unique");
    db.insert("users", user("a@x", "red")).await.expect("first");

    let err = db
        .insert("users", user("a@x", "blue"))
        .await
        .expect_err("taken");
    assert_eq!(err.code_str(), "uniqueness_violation");

    db.update(
        "users",
        Assignments::new().set("email", "renamed@x"),
        Some(Predicate::new().equals("id", 1_i64)),
    )
    .await
    .expect("rename");
    let pk = db
        .insert("users", user("a@x", "blue"))
        .await
        .expect("address free again");
    // The failed duplicate insert consumed key 2.
    assert_eq!(pk, 3);

    let rows = db
        .select(&["id"], "users", Some(Predicate::new().equals("email", "renamed@x")))
        .await
        .expect("select");
    assert_eq!(rows, vec![Row::new().with("id", 1_i64)]);

    // Setting a value onto itself keeps ownership.
    db.update(
        "users",
        Assignments::new().set("email", "renamed@x"),
        Some(Predicate::new().equals("id", 1_i64)),
    )
    .await
    .expect("same value");
    let err = db
        .update(
            "users",
            Assignments::new().set("email", "renamed@x"),
            Some(Predicate::new().equals("id", 3_i64)),
        )
        .await
        .expect_err("collides with row 1");
    assert_eq!(err.code_str(), "uniqueness_violation");
}

#[tokio::test]
async fn composite_unique_index_rejects_collision_on_any_field() {
    let db = users_db().await;
    db.create_unique_index("users", "ux", &["email", "team"])
        .await
        .expect("unique");
    db.insert("users", user("a@x", "red")).await.expect("first");

    let err = db
        .insert("users", user("b@x", "red"))
        .await
        .expect_err("team taken");
    assert_eq!(err.code_str(), "uniqueness_violation");
    let rows = db
        .select(&["id"], "users", Some(Predicate::new().equals("email", "b@x")))
        .await
        .expect("select");
    assert!(rows.is_empty());
    let keys = db.backend().register_keys("default-bucket");
    assert!(!keys.iter().any(|k| k == "users/U/ux/email/s:b@x"));

    let rows = db
        .select(
            &["id"],
            "users",
            Some(Predicate::new().equals("email", "a@x").equals("team", "red")),
        )
        .await
        .expect("select");
    assert_eq!(rows, vec![Row::new().with("id", 1_i64)]);
}

#[tokio::test]
async fn referenced_parent_field_cannot_change() {
    let db = Database::in_memory(StoreConfig::default()).expect("open");
    db.create_table("teams", &["id", "code"]).await.expect("teams");
    db.create_table("players", &["id", "team_code", "name"])
        .await
        .expect("players");
    db.create_foreign_key(
        "players",
        ForeignKeyDef::new("code", "teams").with_alias("team_code"),
    )
    .await
    .expect("fk");

    db.insert("teams", Row::new().with("code", "RED")).await.expect("red");
    db.insert("teams", Row::new().with("code", "BLU")).await.expect("blue");
    db.insert(
        "players",
        Row::new().with("team_code", "RED").with("name", "ann"),
    )
    .await
    .expect("player");

    let err = db
        .update(
            "teams",
            Assignments::new().set("code", "ROT"),
            Some(Predicate::new().equals("code", "RED")),
        )
        .await
        .expect_err("still referenced");
    assert_eq!(err.code_str(), "foreign_key_violation");

    db.update(
        "teams",
        Assignments::new().set("code", "BLAU"),
        Some(Predicate::new().equals("code", "BLU")),
    )
    .await
    .expect("unreferenced");

    let err = db
        .update(
            "players",
            Assignments::new().set("team_code", "BLU"),
            None,
        )
        .await
        .expect_err("no such parent anymore");
    assert_eq!(err.code_str(), "foreign_key_violation");

    let moved = db
        .update("players", Assignments::new().set("team_code", "BLAU"), None)
        .await
        .expect("valid parent");
    assert_eq!(moved, 1);
}

#[tokio::test]
async fn foreign_key_definition_is_validated() {
    let db = Database::in_memory(StoreConfig::default()).expect("open");
    db.create_table("A", &["idA", "fieldA"]).await.expect("A");
    db.create_table("B", &["idB", "ref"]).await.expect("B");

    let err = db
        .create_foreign_key("B", ForeignKeyDef::new("idA", "missing").with_alias("ref"))
        .await
        .expect_err("no parent table");
    assert_eq!(err.code_str(), "no_such_table");
    let err = db
        .create_foreign_key("B", ForeignKeyDef::new("nope", "A").with_alias("ref"))
        .await
        .expect_err("no parent field");
    assert_eq!(err.code_str(), "invalid_field");
    let err = db
        .create_foreign_key("B", ForeignKeyDef::new("idA", "A"))
        .await
        .expect_err("alias defaults to idA, which B lacks");
    assert_eq!(err.code_str(), "invalid_field");

    let fk = db
        .create_foreign_key("B", ForeignKeyDef::new("idA", "A").with_alias("ref"))
        .await
        .expect("fk");
    assert_eq!(fk.alias, "ref");
    let parent = db.describe_table("A").await.expect("describe");
    assert_eq!(parent.incoming_foreign_keys.len(), 1);
    assert_eq!(parent.incoming_foreign_keys[0].reference_table, "B");
    let child = db.describe_table("B").await.expect("describe");
    assert_eq!(child.foreign_keys, vec![fk]);
}

#[tokio::test]
async fn float_and_boolean_values_round_trip_through_indices() {
    let db = Database::in_memory(StoreConfig::default()).expect("open");
    db.create_table("m", &["id", "score", "ok"]).await.expect("table");
    db.create_index("m", "by_score", &["score"]).await.expect("index");
    db.insert("m", Row::new().with("score", 0.5_f64).with("ok", true))
        .await
        .expect("insert");
    db.insert("m", Row::new().with("score", -2.25_f64).with("ok", false))
        .await
        .expect("insert");

    let rows = db
        .select(&["ok"], "m", Some(Predicate::new().equals("score", -2.25_f64)))
        .await
        .expect("select");
    assert_eq!(rows, vec![Row::new().with("ok", Value::Boolean(false))]);
}
