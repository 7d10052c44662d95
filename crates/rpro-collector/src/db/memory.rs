//! In-memory record store for dry runs and tests

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashSet;
use tokio::sync::Mutex;

use super::{
    page_window, FlowFilter, FlowRecord, NewFlowRecord, NewProductionRecord, Page,
    ProductionFilter, ProductionRecord, RecordStore,
};
use crate::ingest::models::FlowRole;

type FlowKey = (FlowRole, String, String, String, u64);

#[derive(Default)]
struct Tables {
    next_id: i64,
    production: Vec<ProductionRecord>,
    production_keys: HashSet<String>,
    flow: Vec<FlowRecord>,
    flow_keys: HashSet<FlowKey>,
}

impl Tables {
    fn allocate_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }
}

/// Same natural-key rules as the PostgreSQL schema, held in process memory
#[derive(Default)]
pub struct InMemoryRecordStore {
    tables: Mutex<Tables>,
}

impl InMemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn production_count(&self) -> usize {
        self.tables.lock().await.production.len()
    }

    pub async fn flow_count(&self) -> usize {
        self.tables.lock().await.flow.len()
    }

    /// Every stored weighing in insertion order
    pub async fn flow_records(&self) -> Vec<FlowRecord> {
        self.tables.lock().await.flow.clone()
    }

    /// Every stored feed batch in insertion order
    pub async fn production_records(&self) -> Vec<ProductionRecord> {
        self.tables.lock().await.production.clone()
    }
}

fn paginate<T: Clone>(mut matching: Vec<T>, page: u32, page_size: u32) -> Page<T> {
    let (page, page_size, offset) = page_window(page, page_size);
    let total = matching.len() as u64;
    // newest insertions first
    matching.reverse();
    let items = matching
        .into_iter()
        .skip(offset as usize)
        .take(page_size as usize)
        .collect();

    Page {
        items,
        total,
        page,
        page_size,
    }
}

#[async_trait]
impl RecordStore for InMemoryRecordStore {
    async fn insert_production(&self, records: &[NewProductionRecord]) -> Result<usize> {
        let mut tables = self.tables.lock().await;
        let mut inserted = 0;

        for record in records {
            if !tables.production_keys.insert(record.row_key.clone()) {
                continue;
            }
            let id = tables.allocate_id();
            tables.production.push(ProductionRecord {
                id,
                record: record.clone(),
                created_at: Utc::now(),
            });
            inserted += 1;
        }

        Ok(inserted)
    }

    async fn insert_flow(&self, records: &[NewFlowRecord]) -> Result<usize> {
        let mut tables = self.tables.lock().await;
        let mut inserted = 0;

        for record in records {
            if !tables.flow_keys.insert(record.natural_key()) {
                continue;
            }
            let id = tables.allocate_id();
            tables.flow.push(FlowRecord {
                id,
                record: record.clone(),
                created_at: Utc::now(),
            });
            inserted += 1;
        }

        Ok(inserted)
    }

    async fn paginate_production(
        &self,
        filter: &ProductionFilter,
        page: u32,
        page_size: u32,
    ) -> Result<Page<ProductionRecord>> {
        let tables = self.tables.lock().await;
        let matching = tables
            .production
            .iter()
            .filter(|r| filter.matches(&r.record))
            .cloned()
            .collect();
        Ok(paginate(matching, page, page_size))
    }

    async fn paginate_flow(
        &self,
        filter: &FlowFilter,
        page: u32,
        page_size: u32,
    ) -> Result<Page<FlowRecord>> {
        let tables = self.tables.lock().await;
        let matching = tables
            .flow
            .iter()
            .filter(|r| filter.matches(&r.record))
            .cloned()
            .collect();
        Ok(paginate(matching, page, page_size))
    }
}
