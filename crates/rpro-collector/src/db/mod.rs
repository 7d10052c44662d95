//! Persistent record store
//!
//! The collector only needs two things from storage: bulk inserts that
//! silently skip rows already stored, and a paginated read for reports.
//! Uniqueness is enforced by the database through natural-key constraints,
//! never by an application lock, so several collectors may write at once.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{Postgres, QueryBuilder, Row};
use std::time::Duration;
use tracing::{debug, info};

use rpro_common::checksum::sha256_hex;

use crate::config::DatabaseConfig;
use crate::ingest::models::{
    parse_flow_date, parse_production_date, CollectedFile, FlowRole, FlowRow, ProductionRow,
};

pub mod memory;

pub use memory::InMemoryRecordStore;

/// Rows per INSERT statement
const INSERT_CHUNK: usize = 500;

/// Feed batch ready for insertion
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewProductionRecord {
    /// Natural key derived from every exported field
    pub row_key: String,
    pub date: String,
    pub recorded_on: Option<NaiveDate>,
    pub time: String,
    pub label: String,
    pub code1: Option<i32>,
    pub code2: Option<i32>,
    /// Exactly 40 slots; slot n is at index n - 1
    pub quantities: Vec<f64>,
    pub source_file: String,
    pub source_ihm: String,
}

impl NewProductionRecord {
    pub fn from_row(row: &ProductionRow, file: &CollectedFile) -> Self {
        let quantities = row.product_slots().to_vec();
        let row_key = production_row_key(row, &quantities);

        Self {
            row_key,
            date: row.date.clone(),
            recorded_on: parse_production_date(&row.date),
            time: row.time.clone(),
            label: row.label.clone(),
            code1: row.code1,
            code2: row.code2,
            quantities,
            source_file: file.name.clone(),
            source_ihm: file.source.clone(),
        }
    }
}

fn production_row_key(row: &ProductionRow, slots: &[f64]) -> String {
    let code = |c: Option<i32>| c.map(|v| v.to_string()).unwrap_or_default();
    let quantities: Vec<String> = slots.iter().map(|q| q.to_string()).collect();
    let material = format!(
        "{}|{}|{}|{}|{}|{}",
        row.date.trim(),
        row.time.trim(),
        row.label.trim(),
        code(row.code1),
        code(row.code2),
        quantities.join(";")
    );
    sha256_hex(material.as_bytes())
}

/// Peanut weighing ready for insertion
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewFlowRecord {
    pub role: FlowRole,
    pub date: String,
    pub recorded_on: Option<NaiveDate>,
    pub time: String,
    pub product_code: String,
    pub product_name: String,
    pub weight: f64,
    pub scale: Option<String>,
    pub source_file: String,
    pub source_ihm: String,
}

impl NewFlowRecord {
    pub fn from_row(row: &FlowRow, role: FlowRole, file: &CollectedFile) -> Self {
        Self {
            role,
            date: row.date.clone(),
            recorded_on: parse_flow_date(&row.date),
            time: row.time.clone(),
            product_code: row.product_code.clone(),
            product_name: row.product_name.clone(),
            weight: row.weight,
            scale: row.scale.clone(),
            source_file: file.name.clone(),
            source_ihm: file.source.clone(),
        }
    }

    /// (role, date, time, product code, weight)
    pub fn natural_key(&self) -> (FlowRole, String, String, String, u64) {
        (
            self.role,
            self.date.clone(),
            self.time.clone(),
            self.product_code.clone(),
            self.weight.to_bits(),
        )
    }
}

/// Stored feed batch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductionRecord {
    pub id: i64,
    #[serde(flatten)]
    pub record: NewProductionRecord,
    pub created_at: DateTime<Utc>,
}

impl ProductionRecord {
    fn from_pg(row: &PgRow) -> Result<Self> {
        Ok(Self {
            id: row.try_get("id")?,
            record: NewProductionRecord {
                row_key: row.try_get("row_key")?,
                date: row.try_get("date")?,
                recorded_on: row.try_get("recorded_on")?,
                time: row.try_get("time")?,
                label: row.try_get("label")?,
                code1: row.try_get("code1")?,
                code2: row.try_get("code2")?,
                quantities: row.try_get("quantities")?,
                source_file: row.try_get("source_file")?,
                source_ihm: row.try_get("source_ihm")?,
            },
            created_at: row.try_get("created_at")?,
        })
    }
}

/// Stored peanut weighing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowRecord {
    pub id: i64,
    #[serde(flatten)]
    pub record: NewFlowRecord,
    pub created_at: DateTime<Utc>,
}

impl FlowRecord {
    fn from_pg(row: &PgRow) -> Result<Self> {
        let role: String = row.try_get("role")?;
        Ok(Self {
            id: row.try_get("id")?,
            record: NewFlowRecord {
                role: role.parse()?,
                date: row.try_get("date")?,
                recorded_on: row.try_get("recorded_on")?,
                time: row.try_get("time")?,
                product_code: row.try_get("product_code")?,
                product_name: row.try_get("product_name")?,
                weight: row.try_get("weight")?,
                scale: row.try_get("scale")?,
                source_file: row.try_get("source_file")?,
                source_ihm: row.try_get("source_ihm")?,
            },
            created_at: row.try_get("created_at")?,
        })
    }
}

/// Report filter for feed batches
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProductionFilter {
    pub from: Option<NaiveDate>,
    pub to: Option<NaiveDate>,
    /// Case-insensitive substring of the formula label
    pub label: Option<String>,
    pub code1: Option<i32>,
    pub code2: Option<i32>,
}

impl ProductionFilter {
    pub fn matches(&self, record: &NewProductionRecord) -> bool {
        date_in_range(record.recorded_on, self.from, self.to)
            && self.label.as_ref().map_or(true, |label| {
                record.label.to_lowercase().contains(&label.to_lowercase())
            })
            && self.code1.map_or(true, |c| record.code1 == Some(c))
            && self.code2.map_or(true, |c| record.code2 == Some(c))
    }
}

/// Report filter for peanut weighings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FlowFilter {
    pub from: Option<NaiveDate>,
    pub to: Option<NaiveDate>,
    pub role: Option<FlowRole>,
    pub product_code: Option<String>,
}

impl FlowFilter {
    pub fn matches(&self, record: &NewFlowRecord) -> bool {
        date_in_range(record.recorded_on, self.from, self.to)
            && self.role.map_or(true, |role| record.role == role)
            && self
                .product_code
                .as_ref()
                .map_or(true, |code| &record.product_code == code)
    }
}

fn date_in_range(date: Option<NaiveDate>, from: Option<NaiveDate>, to: Option<NaiveDate>) -> bool {
    if from.is_none() && to.is_none() {
        return true;
    }
    match date {
        Some(date) => from.map_or(true, |f| date >= f) && to.map_or(true, |t| date <= t),
        None => false,
    }
}

/// One page of a report query
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: u64,
    /// 1-based
    pub page: u32,
    pub page_size: u32,
}

impl<T> Page<T> {
    pub fn total_pages(&self) -> u64 {
        if self.page_size == 0 {
            return 0;
        }
        self.total.div_ceil(self.page_size as u64)
    }
}

/// Normalise a 1-based page request into (page, page_size, offset)
pub(crate) fn page_window(page: u32, page_size: u32) -> (u32, u32, u64) {
    let page = page.max(1);
    let page_size = page_size.max(1);
    (page, page_size, (page as u64 - 1) * page_size as u64)
}

/// Storage contract consumed by the ingestion pipeline and reports
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Insert feed batches, skipping natural-key duplicates; returns rows inserted
    async fn insert_production(&self, records: &[NewProductionRecord]) -> Result<usize>;

    /// Insert weighings, skipping natural-key duplicates; returns rows inserted
    async fn insert_flow(&self, records: &[NewFlowRecord]) -> Result<usize>;

    /// Newest first
    async fn paginate_production(
        &self,
        filter: &ProductionFilter,
        page: u32,
        page_size: u32,
    ) -> Result<Page<ProductionRecord>>;

    /// Newest first
    async fn paginate_flow(
        &self,
        filter: &FlowFilter,
        page: u32,
        page_size: u32,
    ) -> Result<Page<FlowRecord>>;
}

/// PostgreSQL-backed store
#[derive(Debug, Clone)]
pub struct PgRecordStore {
    pool: PgPool,
}

impl PgRecordStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_secs(config.connect_timeout_secs))
            .idle_timeout(Duration::from_secs(config.idle_timeout_secs))
            .connect(&config.url)
            .await
            .context("Failed to connect to database")?;

        info!(
            max_connections = config.max_connections,
            min_connections = config.min_connections,
            "Database connection pool created"
        );

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create the record tables if they do not exist
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .context("Failed to run database migrations")?;
        info!("Database migrations applied");
        Ok(())
    }

    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .context("Database health check failed")?;
        Ok(())
    }
}

fn push_production_filter(qb: &mut QueryBuilder<'_, Postgres>, filter: &ProductionFilter) {
    qb.push(" WHERE TRUE");
    if let Some(from) = filter.from {
        qb.push(" AND recorded_on >= ").push_bind(from);
    }
    if let Some(to) = filter.to {
        qb.push(" AND recorded_on <= ").push_bind(to);
    }
    if let Some(label) = &filter.label {
        qb.push(" AND label ILIKE ").push_bind(format!("%{}%", label));
    }
    if let Some(code1) = filter.code1 {
        qb.push(" AND code1 = ").push_bind(code1);
    }
    if let Some(code2) = filter.code2 {
        qb.push(" AND code2 = ").push_bind(code2);
    }
}

fn push_flow_filter(qb: &mut QueryBuilder<'_, Postgres>, filter: &FlowFilter) {
    qb.push(" WHERE TRUE");
    if let Some(from) = filter.from {
        qb.push(" AND recorded_on >= ").push_bind(from);
    }
    if let Some(to) = filter.to {
        qb.push(" AND recorded_on <= ").push_bind(to);
    }
    if let Some(role) = filter.role {
        qb.push(" AND role = ").push_bind(role.as_str());
    }
    if let Some(code) = &filter.product_code {
        qb.push(" AND product_code = ").push_bind(code.clone());
    }
}

#[async_trait]
impl RecordStore for PgRecordStore {
    async fn insert_production(&self, records: &[NewProductionRecord]) -> Result<usize> {
        if records.is_empty() {
            return Ok(0);
        }

        let mut tx = self.pool.begin().await.context("Failed to begin transaction")?;
        let mut inserted = 0u64;

        for chunk in records.chunks(INSERT_CHUNK) {
            let mut qb = QueryBuilder::<Postgres>::new(
                r#"
                INSERT INTO production_records (
                    row_key, date, recorded_on, time, label, code1, code2,
                    quantities, source_file, source_ihm
                )
                "#,
            );

            qb.push_values(chunk, |mut b, record| {
                b.push_bind(&record.row_key)
                    .push_bind(&record.date)
                    .push_bind(record.recorded_on)
                    .push_bind(&record.time)
                    .push_bind(&record.label)
                    .push_bind(record.code1)
                    .push_bind(record.code2)
                    .push_bind(&record.quantities)
                    .push_bind(&record.source_file)
                    .push_bind(&record.source_ihm);
            });
            qb.push(" ON CONFLICT (row_key) DO NOTHING");

            let result = qb
                .build()
                .execute(&mut *tx)
                .await
                .context("Failed to insert production records")?;
            inserted += result.rows_affected();
        }

        tx.commit().await.context("Failed to commit production records")?;
        debug!(submitted = records.len(), inserted, "Inserted production records");
        Ok(inserted as usize)
    }

    async fn insert_flow(&self, records: &[NewFlowRecord]) -> Result<usize> {
        if records.is_empty() {
            return Ok(0);
        }

        let mut tx = self.pool.begin().await.context("Failed to begin transaction")?;
        let mut inserted = 0u64;

        for chunk in records.chunks(INSERT_CHUNK) {
            let mut qb = QueryBuilder::<Postgres>::new(
                r#"
                INSERT INTO flow_records (
                    role, date, recorded_on, time, product_code, product_name,
                    weight, scale, source_file, source_ihm
                )
                "#,
            );

            qb.push_values(chunk, |mut b, record| {
                b.push_bind(record.role.as_str())
                    .push_bind(&record.date)
                    .push_bind(record.recorded_on)
                    .push_bind(&record.time)
                    .push_bind(&record.product_code)
                    .push_bind(&record.product_name)
                    .push_bind(record.weight)
                    .push_bind(&record.scale)
                    .push_bind(&record.source_file)
                    .push_bind(&record.source_ihm);
            });
            qb.push(" ON CONFLICT ON CONSTRAINT flow_records_natural_key DO NOTHING");

            let result = qb
                .build()
                .execute(&mut *tx)
                .await
                .context("Failed to insert flow records")?;
            inserted += result.rows_affected();
        }

        tx.commit().await.context("Failed to commit flow records")?;
        debug!(submitted = records.len(), inserted, "Inserted flow records");
        Ok(inserted as usize)
    }

    async fn paginate_production(
        &self,
        filter: &ProductionFilter,
        page: u32,
        page_size: u32,
    ) -> Result<Page<ProductionRecord>> {
        let (page, page_size, offset) = page_window(page, page_size);

        let mut count = QueryBuilder::<Postgres>::new("SELECT COUNT(*) FROM production_records");
        push_production_filter(&mut count, filter);
        let total: i64 = count
            .build_query_scalar::<i64>()
            .fetch_one(&self.pool)
            .await
            .context("Failed to count production records")?;

        let mut select = QueryBuilder::<Postgres>::new("SELECT * FROM production_records");
        push_production_filter(&mut select, filter);
        select
            .push(" ORDER BY recorded_on DESC NULLS LAST, time DESC, id DESC LIMIT ")
            .push_bind(page_size as i64)
            .push(" OFFSET ")
            .push_bind(offset as i64);

        let rows = select
            .build()
            .fetch_all(&self.pool)
            .await
            .context("Failed to query production records")?;
        let items = rows
            .iter()
            .map(ProductionRecord::from_pg)
            .collect::<Result<Vec<_>>>()?;

        Ok(Page {
            items,
            total: total.max(0) as u64,
            page,
            page_size,
        })
    }

    async fn paginate_flow(
        &self,
        filter: &FlowFilter,
        page: u32,
        page_size: u32,
    ) -> Result<Page<FlowRecord>> {
        let (page, page_size, offset) = page_window(page, page_size);

        let mut count = QueryBuilder::<Postgres>::new("SELECT COUNT(*) FROM flow_records");
        push_flow_filter(&mut count, filter);
        let total: i64 = count
            .build_query_scalar::<i64>()
            .fetch_one(&self.pool)
            .await
            .context("Failed to count flow records")?;

        let mut select = QueryBuilder::<Postgres>::new("SELECT * FROM flow_records");
        push_flow_filter(&mut select, filter);
        select
            .push(" ORDER BY recorded_on DESC NULLS LAST, time DESC, id DESC LIMIT ")
            .push_bind(page_size as i64)
            .push(" OFFSET ")
            .push_bind(offset as i64);

        let rows = select
            .build()
            .fetch_all(&self.pool)
            .await
            .context("Failed to query flow records")?;
        let items = rows.iter().map(FlowRecord::from_pg).collect::<Result<Vec<_>>>()?;

        Ok(Page {
            items,
            total: total.max(0) as u64,
            page,
            page_size,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn file() -> CollectedFile {
        CollectedFile {
            name: "relatorio.csv".to_string(),
            local_path: PathBuf::from("/tmp/relatorio.csv"),
            remote_path: "/InternalStorage/data/relatorio.csv".to_string(),
            modified: None,
            size: 0,
            hash: "h".to_string(),
            source: "IHM1".to_string(),
        }
    }

    fn production_row(quantities: Vec<f64>) -> ProductionRow {
        ProductionRow {
            date: "01/03/2024".to_string(),
            time: "07:30".to_string(),
            label: "FormulaX".to_string(),
            code1: Some(5),
            code2: Some(9),
            quantities,
        }
    }

    #[test]
    fn test_production_record_fills_forty_slots() {
        let record = NewProductionRecord::from_row(&production_row(vec![100.0, 200.0, 50.0]), &file());
        assert_eq!(record.quantities.len(), 40);
        assert_eq!(record.quantities[0], 100.0);
        assert_eq!(record.quantities[2], 50.0);
        assert_eq!(record.quantities[3], 0.0);
        assert_eq!(record.recorded_on, NaiveDate::from_ymd_opt(2024, 3, 1));
        assert_eq!(record.source_ihm, "IHM1");
    }

    #[test]
    fn test_production_row_key_is_deterministic() {
        let a = NewProductionRecord::from_row(&production_row(vec![1.0, 2.0]), &file());
        let b = NewProductionRecord::from_row(&production_row(vec![1.0, 2.0, 0.0]), &file());
        let c = NewProductionRecord::from_row(&production_row(vec![1.0, 3.0]), &file());

        // trailing zero slots are the same batch
        assert_eq!(a.row_key, b.row_key);
        assert_ne!(a.row_key, c.row_key);
        assert_eq!(a.row_key.len(), 64);
    }

    #[test]
    fn test_filters() {
        let record = NewProductionRecord::from_row(&production_row(vec![1.0]), &file());
        let day = NaiveDate::from_ymd_opt(2024, 3, 1);

        assert!(ProductionFilter::default().matches(&record));
        assert!(ProductionFilter {
            label: Some("formula".to_string()),
            from: day,
            to: day,
            ..Default::default()
        }
        .matches(&record));
        assert!(!ProductionFilter {
            code1: Some(6),
            ..Default::default()
        }
        .matches(&record));
        assert!(!ProductionFilter {
            from: NaiveDate::from_ymd_opt(2024, 3, 2),
            ..Default::default()
        }
        .matches(&record));
    }

    #[test]
    fn test_page_window() {
        assert_eq!(page_window(0, 0), (1, 1, 0));
        assert_eq!(page_window(3, 20), (3, 20, 40));

        let page: Page<u8> = Page {
            items: vec![],
            total: 41,
            page: 1,
            page_size: 20,
        };
        assert_eq!(page.total_pages(), 3);
    }
}
