//! Postgres backend for the persistence boundary.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use reag_core::{
    AddressFields, CanonicalProperty, DedupMetricSample, ListingAttributes, MarketTrendPoint,
    NormalizedAddress, Provenance,
};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::{PgConnection, Row};

use crate::store::{
    fold_matches, inventory_column, validate, CommitSummary, LoadBatch, Locality, MetricsStore,
    PropertyStore, StoreError,
};

const PROPERTY_COLUMNS: &str = r#"
    property_key, address, normalized, attributes, audit_artifacts,
    created_at, updated_at, stale_at, merged_into
"#;

const MAX_MERGE_HOPS: usize = 32;

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(8)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }
}

fn property_from_row(row: &PgRow, provenance: Provenance) -> Result<CanonicalProperty, StoreError> {
    let address: Json<AddressFields> = row.try_get("address")?;
    let normalized: Json<NormalizedAddress> = row.try_get("normalized")?;
    let attributes: Json<ListingAttributes> = row.try_get("attributes")?;
    let audit_artifacts: Json<Vec<String>> = row.try_get("audit_artifacts")?;
    Ok(CanonicalProperty {
        property_key: row.try_get("property_key")?,
        address: address.0,
        normalized: normalized.0,
        attributes: attributes.0,
        source_provenance: provenance,
        audit_artifacts: audit_artifacts.0,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        stale_at: row.try_get("stale_at")?,
        merged_into: row.try_get("merged_into")?,
    })
}

async fn provenance_for(
    conn: &mut PgConnection,
    keys: &[String],
) -> Result<HashMap<String, Provenance>, StoreError> {
    let rows = sqlx::query(
        r#"
        SELECT property_key, source_id, external_id
          FROM property_provenance
         WHERE property_key = ANY($1)
         ORDER BY first_seen, source_id, external_id
        "#,
    )
    .bind(keys)
    .fetch_all(conn)
    .await?;

    let mut out: HashMap<String, Provenance> = HashMap::new();
    for row in rows {
        let key: String = row.try_get("property_key")?;
        let source_id: String = row.try_get("source_id")?;
        let external_id: String = row.try_get("external_id")?;
        out.entry(key).or_default().add(&source_id, &external_id);
    }
    Ok(out)
}

async fn with_provenance(
    conn: &mut PgConnection,
    rows: &[PgRow],
) -> Result<Vec<CanonicalProperty>, StoreError> {
    let keys = rows
        .iter()
        .map(|r| r.try_get::<String, _>("property_key"))
        .collect::<Result<Vec<_>, _>>()?;
    let mut provenance = provenance_for(conn, &keys).await?;
    rows.iter()
        .zip(keys.iter())
        .map(|(row, key)| property_from_row(row, provenance.remove(key).unwrap_or_default()))
        .collect()
}

/// Follow retirement pointers to the record that is still live.
async fn live_key(conn: &mut PgConnection, key: &str) -> Result<Option<String>, StoreError> {
    let mut key = key.to_string();
    for _ in 0..MAX_MERGE_HOPS {
        let merged_into: Option<Option<String>> =
            sqlx::query_scalar("SELECT merged_into FROM canonical_properties WHERE property_key = $1")
                .bind(&key)
                .fetch_optional(&mut *conn)
                .await?;
        match merged_into {
            None => return Ok(None),
            Some(None) => return Ok(Some(key)),
            Some(Some(next)) => key = next,
        }
    }
    Ok(None)
}

async fn matching_keys(
    conn: &mut PgConnection,
    candidate: &CanonicalProperty,
) -> Result<Vec<String>, StoreError> {
    let mut keys: Vec<String> = live_key(conn, &candidate.property_key).await?.into_iter().collect();
    for (source_id, external_id) in candidate.source_provenance.pairs() {
        let existing: Option<String> = sqlx::query_scalar(
            "SELECT property_key FROM property_provenance WHERE source_id = $1 AND external_id = $2",
        )
        .bind(source_id)
        .bind(external_id)
        .fetch_optional(&mut *conn)
        .await?;
        let Some(existing) = existing else {
            continue;
        };
        if let Some(key) = live_key(conn, &existing).await? {
            if !keys.contains(&key) {
                keys.push(key);
            }
        }
    }
    Ok(keys)
}

/// Rows are locked in key order so concurrent batches cannot deadlock.
async fn load_for_update(
    conn: &mut PgConnection,
    keys: &[String],
) -> Result<Vec<CanonicalProperty>, StoreError> {
    let rows = sqlx::query(&format!(
        "SELECT {PROPERTY_COLUMNS} FROM canonical_properties WHERE property_key = ANY($1) ORDER BY property_key FOR UPDATE"
    ))
    .bind(keys)
    .fetch_all(&mut *conn)
    .await?;
    with_provenance(conn, &rows).await
}

/// `false` when another transaction already holds the key.
async fn insert_new(conn: &mut PgConnection, property: &CanonicalProperty) -> Result<bool, StoreError> {
    let result = sqlx::query(
        r#"
        INSERT INTO canonical_properties
            (property_key, address, normalized, attributes, audit_artifacts, created_at, updated_at, stale_at, merged_into)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
        ON CONFLICT (property_key) DO NOTHING
        "#,
    )
    .bind(&property.property_key)
    .bind(Json(&property.address))
    .bind(Json(&property.normalized))
    .bind(Json(&property.attributes))
    .bind(Json(&property.audit_artifacts))
    .bind(property.created_at)
    .bind(property.updated_at)
    .bind(property.stale_at)
    .bind(&property.merged_into)
    .execute(&mut *conn)
    .await?;
    Ok(result.rows_affected() == 1)
}

async fn update_property(conn: &mut PgConnection, property: &CanonicalProperty) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        UPDATE canonical_properties
           SET address = $2,
               normalized = $3,
               attributes = $4,
               audit_artifacts = $5,
               updated_at = $6,
               stale_at = $7,
               merged_into = $8
         WHERE property_key = $1
        "#,
    )
    .bind(&property.property_key)
    .bind(Json(&property.address))
    .bind(Json(&property.normalized))
    .bind(Json(&property.attributes))
    .bind(Json(&property.audit_artifacts))
    .bind(property.updated_at)
    .bind(property.stale_at)
    .bind(&property.merged_into)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Point every provenance pair of `property` at it.
async fn write_provenance(conn: &mut PgConnection, property: &CanonicalProperty) -> Result<(), StoreError> {
    for (source_id, external_id) in property.source_provenance.pairs() {
        sqlx::query(
            r#"
            INSERT INTO property_provenance (source_id, external_id, property_key)
            VALUES ($1, $2, $3)
            ON CONFLICT (source_id, external_id) DO UPDATE
               SET property_key = EXCLUDED.property_key
            "#,
        )
        .bind(source_id)
        .bind(external_id)
        .bind(&property.property_key)
        .execute(&mut *conn)
        .await?;
    }
    Ok(())
}

/// Returns `true` when the candidate was inserted as a new property.
async fn upsert(conn: &mut PgConnection, candidate: &CanonicalProperty) -> Result<bool, StoreError> {
    let mut keys = matching_keys(conn, candidate).await?;
    if keys.is_empty() {
        if insert_new(conn, candidate).await? {
            write_provenance(conn, candidate).await?;
            return Ok(true);
        }
        // Lost an insert race on this key; merge into the winner instead.
        let winner = live_key(conn, &candidate.property_key).await?;
        keys.push(winner.unwrap_or_else(|| candidate.property_key.clone()));
    }

    let matches = load_for_update(conn, &keys).await?;
    let (survivor, retired) = fold_matches(matches, candidate)
        .ok_or_else(|| StoreError::Vanished(candidate.property_key.clone()))?;

    for record in &retired {
        sqlx::query("UPDATE property_provenance SET property_key = $2 WHERE property_key = $1")
            .bind(&record.property_key)
            .bind(&survivor.property_key)
            .execute(&mut *conn)
            .await?;
        update_property(conn, record).await?;
    }
    update_property(conn, &survivor).await?;
    write_provenance(conn, &survivor).await?;
    Ok(false)
}

#[async_trait]
impl PropertyStore for PgStore {
    async fn commit_batch(&self, batch: &LoadBatch) -> Result<CommitSummary, StoreError> {
        let mut tx = self.pool.begin().await?;
        let mut summary = CommitSummary::default();

        for candidate in &batch.properties {
            validate(candidate)?;
            if upsert(&mut *tx, candidate).await? {
                summary.inserted += 1;
            } else {
                summary.updated += 1;
            }
        }

        for point in &batch.trends {
            let inventory = inventory_column(point)?;
            sqlx::query(
                r#"
                INSERT INTO market_trends (source_id, resource_id, period, median_list_price, inventory)
                VALUES ($1, $2, $3, $4, $5)
                ON CONFLICT (source_id, resource_id, period) DO UPDATE
                   SET median_list_price = EXCLUDED.median_list_price,
                       inventory = EXCLUDED.inventory
                "#,
            )
            .bind(&point.source_id)
            .bind(&point.resource_id)
            .bind(point.period)
            .bind(point.median_list_price)
            .bind(inventory)
            .execute(&mut *tx)
            .await?;
            summary.trends_upserted += 1;
        }

        tx.commit().await?;
        Ok(summary)
    }

    async fn get(&self, property_key: &str) -> Result<Option<CanonicalProperty>, StoreError> {
        let mut conn = self.pool.acquire().await?;
        let row = sqlx::query(&format!(
            "SELECT {PROPERTY_COLUMNS} FROM canonical_properties WHERE property_key = $1"
        ))
        .bind(property_key)
        .fetch_optional(&mut *conn)
        .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        let mut provenance = provenance_for(&mut conn, &[property_key.to_string()]).await?;
        property_from_row(&row, provenance.remove(property_key).unwrap_or_default()).map(Some)
    }

    async fn find_nearby(
        &self,
        address: &NormalizedAddress,
        limit: usize,
    ) -> Result<Vec<CanonicalProperty>, StoreError> {
        let Some(locality) = Locality::of(address) else {
            return Ok(Vec::new());
        };
        let mut conn = self.pool.acquire().await?;
        let rows = match locality {
            Locality::Zip(zip) => {
                sqlx::query(&format!(
                    r#"
                    SELECT {PROPERTY_COLUMNS}
                      FROM canonical_properties
                     WHERE merged_into IS NULL AND normalized->>'zip' = $1
                     ORDER BY created_at, property_key
                     LIMIT $2
                    "#
                ))
                .bind(zip)
                .bind(limit as i64)
                .fetch_all(&mut *conn)
                .await?
            }
            Locality::CityState { city, state } => {
                sqlx::query(&format!(
                    r#"
                    SELECT {PROPERTY_COLUMNS}
                      FROM canonical_properties
                     WHERE merged_into IS NULL
                       AND normalized->>'zip' = ''
                       AND normalized->>'city' = $1
                       AND normalized->>'state' = $2
                     ORDER BY created_at, property_key
                     LIMIT $3
                    "#
                ))
                .bind(city)
                .bind(state)
                .bind(limit as i64)
                .fetch_all(&mut *conn)
                .await?
            }
        };
        with_provenance(&mut conn, &rows).await
    }

    async fn list(
        &self,
        source_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<CanonicalProperty>, StoreError> {
        let mut conn = self.pool.acquire().await?;
        let rows = sqlx::query(&format!(
            r#"
            SELECT {PROPERTY_COLUMNS}
              FROM canonical_properties cp
             WHERE cp.merged_into IS NULL
               AND ($1::text IS NULL
                OR EXISTS (SELECT 1 FROM property_provenance pp
                            WHERE pp.property_key = cp.property_key AND pp.source_id = $1))
             ORDER BY updated_at DESC, property_key
             LIMIT $2
            "#
        ))
        .bind(source_id)
        .bind(limit as i64)
        .fetch_all(&mut *conn)
        .await?;
        with_provenance(&mut conn, &rows).await
    }

    async fn find_by_provenance(
        &self,
        source_id: &str,
        external_id: &str,
    ) -> Result<Option<CanonicalProperty>, StoreError> {
        let key: Option<String> = sqlx::query_scalar(
            "SELECT property_key FROM property_provenance WHERE source_id = $1 AND external_id = $2",
        )
        .bind(source_id)
        .bind(external_id)
        .fetch_optional(&self.pool)
        .await?;
        match key {
            Some(key) => self.get(&key).await,
            None => Ok(None),
        }
    }

    async fn mark_stale(&self, property_key: &str, at: DateTime<Utc>) -> Result<bool, StoreError> {
        let result = sqlx::query("UPDATE canonical_properties SET stale_at = $2 WHERE property_key = $1")
            .bind(property_key)
            .bind(at)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn market_trends(
        &self,
        source_id: &str,
        resource_id: &str,
    ) -> Result<Vec<MarketTrendPoint>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT period, median_list_price, inventory
              FROM market_trends
             WHERE source_id = $1 AND resource_id = $2
             ORDER BY period
            "#,
        )
        .bind(source_id)
        .bind(resource_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| -> Result<MarketTrendPoint, StoreError> {
                let period: NaiveDate = row.try_get("period")?;
                let inventory: Option<i32> = row.try_get("inventory")?;
                Ok(MarketTrendPoint {
                    source_id: source_id.to_string(),
                    resource_id: resource_id.to_string(),
                    period,
                    median_list_price: row.try_get("median_list_price")?,
                    inventory: inventory.and_then(|v| u32::try_from(v).ok()),
                })
            })
            .collect()
    }
}

#[async_trait]
impl MetricsStore for PgStore {
    async fn append_sample(&self, sample: &DedupMetricSample) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO dedup_metric_samples
                (source_id, observed_at, input_count, strict_count, fuzzy_count, threshold)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(&sample.source_id)
        .bind(sample.timestamp)
        .bind(sample.input_count as i64)
        .bind(sample.strict_count as i64)
        .bind(sample.fuzzy_count as i64)
        .bind(i16::from(sample.threshold))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_recent_samples(
        &self,
        source_id: &str,
        n: usize,
    ) -> Result<Vec<DedupMetricSample>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT observed_at, input_count, strict_count, fuzzy_count, threshold
              FROM dedup_metric_samples
             WHERE source_id = $1
             ORDER BY observed_at DESC, id DESC
             LIMIT $2
            "#,
        )
        .bind(source_id)
        .bind(n as i64)
        .fetch_all(&self.pool)
        .await?;

        let mut samples = rows
            .into_iter()
            .map(|row| -> Result<DedupMetricSample, StoreError> {
                let input_count: i64 = row.try_get("input_count")?;
                let strict_count: i64 = row.try_get("strict_count")?;
                let fuzzy_count: i64 = row.try_get("fuzzy_count")?;
                let threshold: i16 = row.try_get("threshold")?;
                Ok(DedupMetricSample {
                    timestamp: row.try_get("observed_at")?,
                    source_id: source_id.to_string(),
                    input_count: input_count.max(0) as usize,
                    strict_count: strict_count.max(0) as usize,
                    fuzzy_count: fuzzy_count.max(0) as usize,
                    threshold: threshold.clamp(0, 100) as u8,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        samples.reverse();
        Ok(samples)
    }
}
