use criterion::{Criterion, black_box, criterion_group, criterion_main};
use kvrel::Database;
use kvrel::catalog::schema::ForeignKeyDef;
use kvrel::catalog::types::Row;
use kvrel::commit::update::Assignments;
use kvrel::config::StoreConfig;
use kvrel::query::plan::{Predicate, UsingJoin};
use kvrel::storage::memory::MemoryBackend;
use tokio::runtime::Runtime;

const SEEDED_USERS: i64 = 2_000;
const ORDERS_PER_USER: i64 = 2;

async fn setup_db(users: i64) -> Database<MemoryBackend> {
    let db = Database::in_memory(StoreConfig::default()).expect("open");
    db.create_table("users", &["id", "name", "age"])
        .await
        .expect("users");
    db.create_index("users", "by_age", &["age"]).await.expect("index");
    db.create_unique_index("users", "by_name", &["name"])
        .await
        .expect("unique index");
    db.create_table("orders", &["id", "user_id", "amount"])
        .await
        .expect("orders");
    db.create_foreign_key("orders", ForeignKeyDef::new("id", "users").with_alias("user_id"))
        .await
        .expect("fk");

    for id in 1..=users {
        db.insert(
            "users",
            Row::new()
                .with("name", format!("user-{id}"))
                .with("age", 18 + (id % 50)),
        )
        .await
        .expect("seed user");
    }
    for id in 1..=(users / 10).max(1) {
        for n in 0..ORDERS_PER_USER {
            db.insert(
                "orders",
                Row::new().with("user_id", id).with("amount", n * 10),
            )
            .await
            .expect("seed order");
        }
    }
    db
}

fn bench_hot_paths(c: &mut Criterion) {
    let rt = Runtime::new().expect("tokio runtime");
    let db = rt.block_on(setup_db(SEEDED_USERS));

    let mut next_name = SEEDED_USERS;
    c.bench_function("insert_indexed_row", |b| {
        b.iter(|| {
            rt.block_on(async {
                next_name += 1;
                db.insert(
                    "users",
                    Row::new()
                        .with("name", format!("user-{}", black_box(next_name)))
                        .with("age", 30_i64),
                )
                .await
                .expect("insert");
            });
        })
    });

    let mut next_id = 1_i64;
    c.bench_function("point_select_by_primary_key", |b| {
        b.iter(|| {
            rt.block_on(async {
                let id = black_box(next_id);
                next_id = next_id % SEEDED_USERS + 1;
                db.select(&["name"], "users", Some(Predicate::new().equals("id", id)))
                    .await
                    .expect("select");
            });
        })
    });

    c.bench_function("select_by_unique_index", |b| {
        b.iter(|| {
            rt.block_on(async {
                db.select(
                    &["*"],
                    "users",
                    Some(Predicate::new().equals("name", black_box("user-77"))),
                )
                .await
                .expect("select");
            });
        })
    });

    c.bench_function("select_by_index", |b| {
        b.iter(|| {
            rt.block_on(async {
                db.select(&["id"], "users", Some(Predicate::new().equals("age", black_box(42_i64))))
                    .await
                    .expect("select");
            });
        })
    });

    c.bench_function("update_indexed_field", |b| {
        b.iter(|| {
            rt.block_on(async {
                db.update(
                    "users",
                    Assignments::new().apply("age", |v| (v.as_integer().unwrap_or(0) % 50 + 18).into()),
                    Some(Predicate::new().equals("id", black_box(5_i64))),
                )
                .await
                .expect("update");
            });
        })
    });

    c.bench_function("join_orders_with_users", |b| {
        b.iter(|| {
            rt.block_on(async {
                db.select_join(
                    &["orders.amount", "users.name"],
                    &["orders", "users"],
                    UsingJoin::new()
                        .on("orders", "user_id", "users", "id")
                        .filter("users", Predicate::new().one_of("id", [1_i64, 2, 3])),
                )
                .await
                .expect("join");
            });
        })
    });
}

criterion_group!(benches, bench_hot_paths);
criterion_main!(benches);
