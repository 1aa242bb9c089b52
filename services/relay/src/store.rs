// Pooled access to the persistent event table: connect-with-backoff,
// schema migration, batched writes, range/count reads, and the
// change-data-capture notify that feeds the Dispatcher (spec.md §4.2).
//
// Grounded on the teacher's `db.rs` (`create_pool`/`run_migrations`) and
// `repo/events.rs` (`upsert_event`'s conflict-detection idiom); extended
// with the backoff connect and replaceable/addressable/deletion semantics
// spec.md §4.2 requires.

use relay_protocol::{Event, EventClass, Filter, Tag};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};
use std::time::Duration;

/// The channel `PgListener` subscribes to; every successful write issues a
/// `pg_notify` on this channel inside the same transaction, so the
/// Dispatcher only ever observes committed events (spec.md §4.2, §4.5).
pub const CDC_CHANNEL: &str = "relay_events";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    Duplicate,
}

pub struct Store {
    pool: PgPool,
}

impl Store {
    /// Connect with up to 5 attempts, exponential backoff starting at 2s
    /// and doubling to 32s, per spec.md §4.2. Failure is a fatal init error.
    pub async fn connect(database_url: &str, pool_size: u32) -> Result<Self, sqlx::Error> {
        let mut delay = Duration::from_secs(2);
        let max_attempts = 5;
        let mut last_err = None;
        for attempt in 1..=max_attempts {
            match PgPoolOptions::new()
                .max_connections(pool_size)
                .connect(database_url)
                .await
            {
                Ok(pool) => {
                    sqlx::query("SELECT 1").fetch_one(&pool).await?;
                    return Ok(Self { pool });
                }
                Err(e) => {
                    tracing::warn!(attempt, error = %e, "store connect failed, retrying");
                    last_err = Some(e);
                    if attempt < max_attempts {
                        tokio::time::sleep(delay).await;
                        delay = (delay * 2).min(Duration::from_secs(32));
                    }
                }
            }
        }
        Err(last_err.expect("at least one attempt recorded an error"))
    }

    pub async fn run_migrations(&self) -> Result<(), sqlx::migrate::MigrateError> {
        sqlx::migrate!("./migrations").run(&self.pool).await
    }

    #[must_use]
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    #[cfg(test)]
    pub fn from_pool_for_tests(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Every id in the table, for seeding the Membership Filter on startup.
    pub async fn all_ids(&self) -> Result<Vec<String>, sqlx::Error> {
        let rows = sqlx::query("SELECT id FROM events").fetch_all(&self.pool).await?;
        Ok(rows.iter().map(|r| r.get::<String, _>("id")).collect())
    }

    pub async fn total_event_count(&self) -> Result<i64, sqlx::Error> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM events")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get("n"))
    }

    /// `INSERT ... ON CONFLICT (id) DO NOTHING`. Duplicate is a logical
    /// signal, not an error.
    pub async fn insert_event(&self, e: &Event) -> Result<InsertOutcome, sqlx::Error> {
        let mut tx = self.pool.begin().await?;
        let result = insert_row(&mut tx, e).await?;
        if result == InsertOutcome::Inserted {
            notify(&mut tx, &e.id).await?;
        }
        tx.commit().await?;
        Ok(result)
    }

    /// Transactional: delete any row with the same `(pubkey, kind)` whose
    /// `created_at` is older (or equal with a lexicographically larger
    /// id), then insert.
    pub async fn insert_replaceable(&self, e: &Event) -> Result<InsertOutcome, sqlx::Error> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "DELETE FROM events WHERE pubkey = $1 AND kind = $2 \
             AND (created_at < $3 OR (created_at = $3 AND id > $4))",
        )
        .bind(&e.pubkey)
        .bind(e.kind)
        .bind(e.created_at)
        .bind(&e.id)
        .execute(&mut *tx)
        .await?;
        let result = insert_row(&mut tx, e).await?;
        if result == InsertOutcome::Inserted {
            notify(&mut tx, &e.id).await?;
        }
        tx.commit().await?;
        Ok(result)
    }

    /// As `insert_replaceable`, keyed on `(pubkey, kind, d_tag)`.
    pub async fn insert_addressable(&self, e: &Event) -> Result<InsertOutcome, sqlx::Error> {
        let d_tag = e.d_tag();
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "DELETE FROM events WHERE pubkey = $1 AND kind = $2 AND d_tag = $3 \
             AND (created_at < $4 OR (created_at = $4 AND id > $5))",
        )
        .bind(&e.pubkey)
        .bind(e.kind)
        .bind(d_tag)
        .bind(e.created_at)
        .bind(&e.id)
        .execute(&mut *tx)
        .await?;
        let result = insert_row(&mut tx, e).await?;
        if result == InsertOutcome::Inserted {
            notify(&mut tx, &e.id).await?;
        }
        tx.commit().await?;
        Ok(result)
    }

    /// Within one transaction: delete rows whose id is named in an `e` tag
    /// of the deletion event and whose pubkey matches, then insert the
    /// deletion event itself.
    pub async fn persist_deletion(&self, e: &Event) -> Result<InsertOutcome, sqlx::Error> {
        let target_ids: Vec<&str> = e.tag_values("e").collect();
        let mut tx = self.pool.begin().await?;
        if !target_ids.is_empty() {
            sqlx::query("DELETE FROM events WHERE pubkey = $1 AND id = ANY($2)")
                .bind(&e.pubkey)
                .bind(&target_ids as &[&str])
                .execute(&mut *tx)
                .await?;
        }
        let result = insert_row(&mut tx, e).await?;
        if result == InsertOutcome::Inserted {
            notify(&mut tx, &e.id).await?;
        }
        tx.commit().await?;
        Ok(result)
    }

    /// Composes a parameterized SELECT from the filter's present clauses,
    /// ordered `created_at DESC, id ASC`, honoring `limit`.
    pub async fn get_events(&self, filter: &Filter) -> Result<Vec<Event>, sqlx::Error> {
        if filter.since.is_some() && filter.until.is_some() && filter.since > filter.until {
            return Ok(Vec::new());
        }
        if filter.limit == Some(0) {
            return Ok(Vec::new());
        }
        let (where_sql, binds) = build_where(filter);
        let limit = filter.limit.unwrap_or(5000).min(5000);
        let sql = format!(
            "SELECT id, pubkey, created_at, kind, tags, content, sig FROM events \
             WHERE {where_sql} ORDER BY created_at DESC, id ASC LIMIT {limit}"
        );
        let mut query = sqlx::query(&sql);
        for bind in &binds {
            query = bind.apply(query);
        }
        let rows = query.fetch_all(&self.pool).await?;
        rows.iter().map(row_to_event).collect()
    }

    pub async fn get_event_count(&self, filter: &Filter) -> Result<i64, sqlx::Error> {
        if filter.since.is_some() && filter.until.is_some() && filter.since > filter.until {
            return Ok(0);
        }
        let (where_sql, binds) = build_where(filter);
        let sql = format!("SELECT COUNT(*) AS n FROM events WHERE {where_sql}");
        let mut query = sqlx::query(&sql);
        for bind in &binds {
            query = bind.apply(query);
        }
        let row = query.fetch_one(&self.pool).await?;
        Ok(row.get("n"))
    }
}

async fn insert_row(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    e: &Event,
) -> Result<InsertOutcome, sqlx::Error> {
    // No conflict target: this suppresses a violation of *any* unique
    // constraint on the table, not just the primary key. A replaceable or
    // addressable event that lost its tie-break (the DELETE above left the
    // existing winning row in place) hits the partial unique index instead
    // of the id column, and must be dropped the same way a duplicate id is.
    let tags = sqlx::types::Json(&e.tags);
    let result = sqlx::query(
        "INSERT INTO events (id, pubkey, created_at, kind, tags, content, sig, d_tag) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8) ON CONFLICT DO NOTHING",
    )
    .bind(&e.id)
    .bind(&e.pubkey)
    .bind(e.created_at)
    .bind(e.kind)
    .bind(tags)
    .bind(&e.content)
    .bind(&e.sig)
    .bind(e.d_tag())
    .execute(&mut **tx)
    .await?;
    Ok(if result.rows_affected() == 1 {
        InsertOutcome::Inserted
    } else {
        InsertOutcome::Duplicate
    })
}

async fn notify(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    id: &str,
) -> Result<(), sqlx::Error> {
    sqlx::query(&format!("SELECT pg_notify('{CDC_CHANNEL}', $1)"))
        .bind(id)
        .execute(&mut **tx)
        .await?;
    Ok(())
}

fn row_to_event(row: &PgRow) -> Result<Event, sqlx::Error> {
    let tags: sqlx::types::Json<Vec<Tag>> = row.try_get("tags")?;
    Ok(Event {
        id: row.try_get("id")?,
        pubkey: row.try_get("pubkey")?,
        created_at: row.try_get("created_at")?,
        kind: row.try_get("kind")?,
        tags: tags.0,
        content: row.try_get("content")?,
        sig: row.try_get("sig")?,
    })
}

/// One bound parameter for a dynamically composed WHERE clause.
enum Bind {
    Text(String),
    TextArray(Vec<String>),
    I64(i64),
    I64Array(Vec<i64>),
}

impl Bind {
    fn apply<'q>(
        &'q self,
        query: sqlx::query::Query<'q, sqlx::Postgres, sqlx::postgres::PgArguments>,
    ) -> sqlx::query::Query<'q, sqlx::Postgres, sqlx::postgres::PgArguments> {
        match self {
            Bind::Text(s) => query.bind(s),
            Bind::TextArray(v) => query.bind(v),
            Bind::I64(n) => query.bind(n),
            Bind::I64Array(v) => query.bind(v),
        }
    }
}

fn build_where(filter: &Filter) -> (String, Vec<Bind>) {
    let mut clauses = Vec::new();
    let mut binds: Vec<Bind> = Vec::new();
    let mut next = 1;
    let mut param = || {
        next += 1;
        next - 1
    };

    if let Some(ids) = &filter.ids {
        clauses.push(format!("id = ANY(${})", param()));
        binds.push(Bind::TextArray(ids.clone()));
    }
    if let Some(authors) = &filter.authors {
        clauses.push(format!("pubkey = ANY(${})", param()));
        binds.push(Bind::TextArray(authors.clone()));
    }
    if let Some(kinds) = &filter.kinds {
        clauses.push(format!("kind = ANY(${})", param()));
        binds.push(Bind::I64Array(kinds.clone()));
    }
    if let Some(since) = filter.since {
        clauses.push(format!("created_at >= ${}", param()));
        binds.push(Bind::I64(since));
    }
    if let Some(until) = filter.until {
        clauses.push(format!("created_at <= ${}", param()));
        binds.push(Bind::I64(until));
    }
    for (key, values) in &filter.tags {
        let Some(letter) = key.strip_prefix('#').filter(|l| l.len() == 1) else {
            continue;
        };
        // tags @> '[["<letter>","<value>"]]' for any of the listed values
        let letter_idx = param();
        let values_idx = param();
        clauses.push(format!(
            "EXISTS (SELECT 1 FROM jsonb_array_elements(tags) t \
             WHERE t->>0 = ${letter_idx} AND t->>1 = ANY(${values_idx}))"
        ));
        binds.push(Bind::Text(letter.to_owned()));
        binds.push(Bind::TextArray(values.clone()));
    }

    let where_sql = if clauses.is_empty() {
        "TRUE".to_owned()
    } else {
        clauses.join(" AND ")
    };
    (where_sql, binds)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_where_with_no_clauses_matches_everything() {
        let (sql, binds) = build_where(&Filter::default());
        assert_eq!(sql, "TRUE");
        assert!(binds.is_empty());
    }

    #[test]
    fn build_where_combines_present_clauses_with_and() {
        let filter = Filter {
            kinds: Some(vec![1]),
            authors: Some(vec!["pk".to_owned()]),
            ..Default::default()
        };
        let (sql, binds) = build_where(&filter);
        assert!(sql.contains("pubkey = ANY"));
        assert!(sql.contains("kind = ANY"));
        assert!(sql.contains(" AND "));
        assert_eq!(binds.len(), 2);
    }

    #[test]
    fn build_where_binds_tag_letter_instead_of_interpolating_it() {
        let mut tags = std::collections::HashMap::new();
        tags.insert("#'".to_owned(), vec!["x".to_owned()]);
        let filter = Filter { tags, ..Default::default() };
        let (sql, binds) = build_where(&filter);
        assert!(!sql.contains('\''), "tag letter must not be interpolated into the SQL text: {sql}");
        assert_eq!(binds.len(), 2);
        assert!(matches!(&binds[0], Bind::Text(s) if s == "'"));
    }
}
