//! # Seed Data Generator
//!
//! Populates a device database with synced records and unsynced local edits
//! for development.
//!
//! ## Usage
//! ```bash
//! # 200 clients with quotes and work orders (default)
//! cargo run -p fieldops-db --bin seed
//!
//! # Custom amount and 25 queued local edits
//! cargo run -p fieldops-db --bin seed -- --count 1000 --pending 25
//!
//! # Specify database path
//! cargo run -p fieldops-db --bin seed -- --db ./data/fieldops.db
//! ```
//!
//! ## Generated Data
//! - `clients`: one row per index
//! - `quotes`: one per client, every second one accepted
//! - `work_orders`: one per accepted quote
//! - `mutation_queue`: pending edits on the first clients, so the
//!   pending-mutation guard has something to protect

use chrono::{Duration, Utc};
use serde_json::json;
use std::env;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use fieldops_core::{entities, MutationOperation};
use fieldops_db::{Database, DbConfig, LocalRow};

const CLIENT_NAMES: &[&str] = &[
    "Harbor Plumbing",
    "Northside Dental",
    "Maple Street Bakery",
    "Greenfield Apartments",
    "Summit Fitness",
    "Riverside Clinic",
    "Oak & Iron Cafe",
    "Bluewater Marina",
];

const QUOTE_TOTALS_CENTS: &[i64] = &[12_500, 48_000, 9_900, 150_000, 27_350];

/// Rows per transaction while seeding.
const CHUNK: usize = 250;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // Parse command line arguments
    let args: Vec<String> = env::args().collect();

    let mut count: usize = 200;
    let mut pending: usize = 10;
    let mut db_path = String::from("./fieldops_dev.db");

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--count" | "-c" => {
                if i + 1 < args.len() {
                    count = args[i + 1].parse().unwrap_or(200);
                    i += 1;
                }
            }
            "--pending" | "-p" => {
                if i + 1 < args.len() {
                    pending = args[i + 1].parse().unwrap_or(10);
                    i += 1;
                }
            }
            "--db" | "-d" => {
                if i + 1 < args.len() {
                    db_path = args[i + 1].clone();
                    i += 1;
                }
            }
            "--help" | "-h" => {
                println!("fieldops Seed Data Generator");
                println!();
                println!("Usage: seed [OPTIONS]");
                println!();
                println!("Options:");
                println!("  -c, --count <N>      Number of clients to generate (default: 200)");
                println!("  -p, --pending <N>    Number of queued local edits (default: 10)");
                println!("  -d, --db <PATH>      Database file path (default: ./fieldops_dev.db)");
                println!("  -h, --help           Show this help message");
                return Ok(());
            }
            _ => {}
        }
        i += 1;
    }

    println!("🌱 fieldops Seed Data Generator");
    println!("===============================");
    println!("Database: {}", db_path);
    println!("Clients:  {}", count);
    println!("Pending:  {}", pending);
    println!();

    let db = Database::new(DbConfig::new(&db_path)).await?;
    let (total, applied) = fieldops_db::migrations::migration_status(db.pool()).await?;
    println!("✓ Connected to database");
    println!("✓ Migrations applied ({}/{})", applied, total);

    let records = db.records();
    for table in [entities::CLIENTS, entities::QUOTES, entities::WORK_ORDERS] {
        records.ensure_table(table).await?;
    }

    let existing = records.count(entities::CLIENTS).await?;
    if existing > 0 {
        println!("⚠ Database already has {} clients", existing);
        println!("  Skipping seed to avoid duplicates.");
        println!("  Delete the database file to regenerate.");
        return Ok(());
    }

    let start = std::time::Instant::now();
    let synced_at = Utc::now();

    let mut clients = Vec::with_capacity(count);
    let mut quotes = Vec::with_capacity(count);
    let mut work_orders = Vec::new();

    for idx in 0..count {
        let created = synced_at - Duration::days((idx % 90) as i64 + 1);
        let created_str = created.to_rfc3339();

        let client_id = Uuid::new_v4().to_string();
        let name = format!("{} #{}", CLIENT_NAMES[idx % CLIENT_NAMES.len()], idx + 1);
        clients.push(local_row(
            &client_id,
            json!({
                "id": client_id,
                "name": name,
                "email": format!("contact{}@example.com", idx + 1),
                "created_at": created_str,
                "updated_at": created_str,
            }),
            &created_str,
            synced_at,
        ));

        let quote_id = Uuid::new_v4().to_string();
        let accepted = idx % 2 == 0;
        quotes.push(local_row(
            &quote_id,
            json!({
                "id": quote_id,
                "client_id": client_id,
                "status": if accepted { "accepted" } else { "sent" },
                "total_cents": QUOTE_TOTALS_CENTS[idx % QUOTE_TOTALS_CENTS.len()],
                "created_at": created_str,
                "updated_at": created_str,
            }),
            &created_str,
            synced_at,
        ));

        if accepted {
            let work_order_id = Uuid::new_v4().to_string();
            let scheduled = (created + Duration::days(7)).to_rfc3339();
            work_orders.push(local_row(
                &work_order_id,
                json!({
                    "id": work_order_id,
                    "client_id": client_id,
                    "quote_id": quote_id,
                    "status": "scheduled",
                    "scheduled_at": scheduled,
                    "created_at": created_str,
                    "updated_at": created_str,
                }),
                &created_str,
                synced_at,
            ));
        }
    }

    for (table, rows) in [
        (entities::CLIENTS, &clients),
        (entities::QUOTES, &quotes),
        (entities::WORK_ORDERS, &work_orders),
    ] {
        let mut written = 0;
        for chunk in rows.chunks(CHUNK) {
            written += records.upsert_chunk(table, chunk).await?;
        }
        println!("  {:<12} {} rows", table, written);
    }

    // Local edits made "offline" on the first clients
    let queue = db.mutation_queue();
    for row in clients.iter().take(pending) {
        let Some(id) = row.id.as_deref() else {
            continue;
        };
        let mut payload: serde_json::Value = serde_json::from_str(&row.payload)?;
        payload["phone"] = json!("+1 555 0100");
        payload["updated_at"] = json!(Utc::now().to_rfc3339());

        queue
            .enqueue(
                entities::CLIENTS,
                id,
                MutationOperation::Update,
                &payload.to_string(),
            )
            .await?;
    }

    let elapsed = start.elapsed();
    println!();
    println!(
        "✓ Seeded {} records and {} pending edits in {:?}",
        clients.len() + quotes.len() + work_orders.len(),
        queue.pending_count().await?,
        elapsed
    );

    Ok(())
}

fn local_row(
    id: &str,
    payload: serde_json::Value,
    created_at: &str,
    synced_at: chrono::DateTime<Utc>,
) -> LocalRow {
    LocalRow {
        id: Some(id.to_string()),
        payload: payload.to_string(),
        created_at: Some(created_at.to_string()),
        updated_at: Some(created_at.to_string()),
        synced_at,
    }
}
