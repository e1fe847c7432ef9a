use std::collections::BTreeMap;

use anyhow::Context;
use chrono::NaiveDate;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::models::{AttrValue, EventRecord};

pub async fn init_db(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

/// Deterministic demo data: three services over four quarters of 2024, with
/// a surge on checkout-api, steady billing, and a fading auth service.
pub async fn seed(pool: &PgPool) -> anyhow::Result<()> {
    let seeds: Vec<(&str, &str, u32, &str, f64)> = vec![
        // (entity, month, how many, category, amount per event)
        ("checkout-api", "2024-01-15", 4, "timeout", 120.0),
        ("checkout-api", "2024-04-12", 9, "timeout", 150.0),
        ("checkout-api", "2024-07-09", 21, "timeout", 300.0),
        ("checkout-api", "2024-07-21", 8, "validation", 80.0),
        ("checkout-api", "2024-10-02", 35, "timeout", 410.0),
        ("billing", "2024-02-03", 12, "invoice", 60.0),
        ("billing", "2024-05-06", 13, "invoice", 65.0),
        ("billing", "2024-08-18", 11, "invoice", 55.0),
        ("billing", "2024-11-11", 12, "invoice", 62.0),
        ("auth", "2024-01-20", 18, "lockout", 40.0),
        ("auth", "2024-04-22", 10, "lockout", 35.0),
        ("auth", "2024-07-25", 6, "lockout", 30.0),
        ("auth", "2024-10-28", 3, "lockout", 25.0),
    ];

    for (entity, date, n, category, amount) in seeds {
        let occurred_at: NaiveDate = date.parse().context("invalid seed date")?;
        for i in 0..n {
            let attributes = serde_json::json!({
                "category": category,
                "amount": amount + i as f64,
            });
            sqlx::query(
                r#"
                INSERT INTO escalation_watch.events
                (id, entity, occurred_at, attributes, source_key)
                VALUES ($1, $2, $3, $4, $5)
                ON CONFLICT (source_key) DO NOTHING
                "#,
            )
            .bind(Uuid::new_v4())
            .bind(entity)
            .bind(occurred_at)
            .bind(&attributes)
            .bind(format!("seed-{entity}-{date}-{i}"))
            .execute(pool)
            .await?;
        }
    }

    Ok(())
}

/// Fetch events, optionally scoped to one entity or a start date. Ordered by
/// (entity, occurred_at) so downstream output is reproducible.
pub async fn fetch_events(
    pool: &PgPool,
    entity: Option<&str>,
    since: Option<NaiveDate>,
) -> anyhow::Result<Vec<EventRecord>> {
    let mut query = String::from(
        "SELECT id, entity, occurred_at, attributes \
         FROM escalation_watch.events WHERE TRUE",
    );
    if entity.is_some() {
        query.push_str(" AND entity = $1");
    }
    if since.is_some() {
        query.push_str(if entity.is_some() {
            " AND occurred_at >= $2"
        } else {
            " AND occurred_at >= $1"
        });
    }
    query.push_str(" ORDER BY entity, occurred_at, id");

    let mut rows = sqlx::query(&query);
    if let Some(value) = entity {
        rows = rows.bind(value);
    }
    if let Some(value) = since {
        rows = rows.bind(value);
    }

    let records = rows.fetch_all(pool).await?;
    let mut events = Vec::with_capacity(records.len());

    for row in records {
        let attributes: serde_json::Value = row.get("attributes");
        let attributes: BTreeMap<String, AttrValue> = serde_json::from_value(attributes)
            .context("malformed attributes jsonb")?;
        events.push(EventRecord {
            id: row.get("id"),
            entity: row.get("entity"),
            occurred_at: row.get("occurred_at"),
            attributes,
        });
    }

    Ok(events)
}

/// Import events from a CSV file. `entity` and `occurred_at` are required
/// columns; `source_key` is optional (a fresh one is minted when absent);
/// every other column becomes an event attribute, numeric when it parses.
pub async fn import_csv(pool: &PgPool, csv_path: &std::path::Path) -> anyhow::Result<usize> {
    let mut reader = csv::Reader::from_path(csv_path)?;
    let headers = reader.headers()?.clone();

    let entity_idx = headers
        .iter()
        .position(|h| h == "entity")
        .context("CSV is missing an 'entity' column")?;
    let occurred_idx = headers
        .iter()
        .position(|h| h == "occurred_at")
        .context("CSV is missing an 'occurred_at' column")?;
    let source_idx = headers.iter().position(|h| h == "source_key");

    let mut inserted = 0usize;

    for result in reader.records() {
        let record = result?;
        let entity = record
            .get(entity_idx)
            .context("row is missing the entity field")?;
        let occurred_at: NaiveDate = record
            .get(occurred_idx)
            .context("row is missing the occurred_at field")?
            .parse()
            .with_context(|| format!("unparseable occurred_at in row for '{entity}'"))?;

        let mut attributes = serde_json::Map::new();
        for (idx, value) in record.iter().enumerate() {
            if idx == entity_idx || idx == occurred_idx || Some(idx) == source_idx {
                continue;
            }
            if value.is_empty() {
                continue;
            }
            let key = headers.get(idx).unwrap_or_default().to_string();
            let json_value = match value.parse::<f64>() {
                Ok(n) => serde_json::json!(n),
                Err(_) => serde_json::json!(value),
            };
            attributes.insert(key, json_value);
        }

        let source_key = source_idx
            .and_then(|idx| record.get(idx))
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| format!("import-{}", Uuid::new_v4()));

        let result = sqlx::query(
            r#"
            INSERT INTO escalation_watch.events
            (id, entity, occurred_at, attributes, source_key)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (source_key) DO NOTHING
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(entity)
        .bind(occurred_at)
        .bind(serde_json::Value::Object(attributes))
        .bind(source_key)
        .execute(pool)
        .await?;

        if result.rows_affected() > 0 {
            inserted += 1;
        }
    }

    Ok(inserted)
}
