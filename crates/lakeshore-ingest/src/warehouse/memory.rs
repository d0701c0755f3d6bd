use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use lakeshore_common::types::{Batch, Column, Schema, Value};
use tracing::debug;

use super::{LoadOutcome, StagedFile, Warehouse, WarehouseSession};

#[derive(Debug, Clone, Default)]
struct MemTable {
    schema: Schema,
    rows: Vec<Vec<Value>>,
}

impl MemTable {
    fn index_of(&self, name: &str) -> Result<usize> {
        self.schema
            .columns()
            .iter()
            .position(|c| c.name.eq_ignore_ascii_case(name))
            .ok_or_else(|| anyhow!("column {} does not exist", name))
    }
}

type Tables = Arc<Mutex<HashMap<String, MemTable>>>;

/// In-process warehouse. Permanent tables are shared by every session;
/// session tables vanish with their session. Identifiers are
/// case-insensitive.
#[derive(Clone, Default)]
pub struct MemoryWarehouse {
    tables: Tables,
}

impl MemoryWarehouse {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of a permanent table
    pub fn table(&self, name: &str) -> Option<Batch> {
        let tables = self.tables.lock().ok()?;
        let table = tables.get(&name.to_lowercase())?;
        Batch::try_new(table.schema.clone(), table.rows.clone()).ok()
    }

    pub fn table_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .tables
            .lock()
            .map(|t| t.keys().cloned().collect())
            .unwrap_or_default();
        names.sort();
        names
    }
}

#[async_trait]
impl Warehouse for MemoryWarehouse {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn session(&self) -> Result<Box<dyn WarehouseSession>> {
        Ok(Box::new(MemorySession {
            shared: self.tables.clone(),
            temp: HashMap::new(),
            loaded: HashMap::new(),
        }))
    }
}

struct MemorySession {
    shared: Tables,
    temp: HashMap<String, MemTable>,
    loaded: HashMap<String, HashSet<String>>,
}

impl MemorySession {
    /// Run `f` against `name`, session tables shadowing permanent ones
    fn with_table<T>(&mut self, name: &str, f: impl FnOnce(&mut MemTable) -> Result<T>) -> Result<T> {
        let key = name.to_lowercase();
        if let Some(table) = self.temp.get_mut(&key) {
            return f(table);
        }
        let mut shared = self.shared.lock().map_err(|_| anyhow!("warehouse lock poisoned"))?;
        match shared.get_mut(&key) {
            Some(table) => f(table),
            None => bail!("table {} does not exist", name),
        }
    }

    fn snapshot(&mut self, name: &str) -> Result<MemTable> {
        self.with_table(name, |t| Ok(t.clone()))
    }
}

fn key_of(row: &[Value], indexes: &[usize]) -> Option<Vec<String>> {
    indexes
        .iter()
        .map(|&i| match &row[i] {
            Value::Null => None,
            v => Some(v.to_text()),
        })
        .collect()
}

#[async_trait]
impl WarehouseSession for MemorySession {
    async fn create_temp_table(&mut self, name: &str, schema: &Schema) -> Result<()> {
        let key = name.to_lowercase();
        self.temp.insert(
            key.clone(),
            MemTable {
                schema: schema.clone(),
                rows: Vec::new(),
            },
        );
        self.loaded.remove(&key);
        Ok(())
    }

    async fn rename_column(&mut self, table: &str, from: &str, to: &str) -> Result<()> {
        self.with_table(table, |t| {
            let idx = t.index_of(from)?;
            if t.index_of(to).is_ok() {
                bail!("column {} already exists", to);
            }
            let mut columns = t.schema.columns().to_vec();
            columns[idx].name = to.to_string();
            t.schema = Schema::new(columns);
            Ok(())
        })
    }

    async fn describe(&mut self, table: &str) -> Result<Option<Schema>> {
        match self.snapshot(table) {
            Ok(t) => Ok(Some(t.schema)),
            Err(_) => Ok(None),
        }
    }

    async fn create_table_like(&mut self, target: &str, template: &str) -> Result<()> {
        let schema = self.snapshot(template)?.schema;
        let mut shared = self.shared.lock().map_err(|_| anyhow!("warehouse lock poisoned"))?;
        shared.entry(target.to_lowercase()).or_insert(MemTable {
            schema,
            rows: Vec::new(),
        });
        Ok(())
    }

    async fn add_column(&mut self, table: &str, column: &Column) -> Result<()> {
        self.with_table(table, |t| {
            if t.index_of(&column.name).is_ok() {
                return Ok(());
            }
            let mut columns = t.schema.columns().to_vec();
            columns.push(column.clone());
            t.schema = Schema::new(columns);
            for row in &mut t.rows {
                row.push(Value::Null);
            }
            Ok(())
        })
    }

    async fn truncate(&mut self, table: &str) -> Result<()> {
        self.with_table(table, |t| {
            t.rows.clear();
            Ok(())
        })?;
        self.loaded.remove(&table.to_lowercase());
        Ok(())
    }

    async fn load(&mut self, table: &str, file: &StagedFile, rows: &Batch) -> Result<LoadOutcome> {
        let key = table.to_lowercase();
        if self.loaded.get(&key).is_some_and(|tokens| tokens.contains(&file.token)) {
            debug!(key = %file.key, "File already loaded; skipping");
            return Ok(LoadOutcome::Skipped);
        }

        let loaded = self.with_table(table, |t| {
            let conformed = rows.conform_to(&t.schema);
            let n = conformed.num_rows() as u64;
            t.rows.extend(conformed.into_rows());
            Ok(n)
        })?;
        self.loaded.entry(key).or_default().insert(file.token.clone());
        Ok(LoadOutcome::Loaded(loaded))
    }

    async fn count(&mut self, table: &str) -> Result<u64> {
        self.with_table(table, |t| Ok(t.rows.len() as u64))
    }

    async fn deduplicate(&mut self, source: &str, dest: &str, keys: &[String], order_by: Option<&str>) -> Result<()> {
        let src = self.snapshot(source)?;
        let key_idx = keys.iter().map(|k| src.index_of(k)).collect::<Result<Vec<_>>>()?;
        let order_idx = order_by.map(|c| src.index_of(c)).transpose()?;

        // Winner per key; later rows win ties, rows with a null key stay distinct
        let mut winners: HashMap<Vec<String>, usize> = HashMap::new();
        let mut keep: Vec<usize> = Vec::new();
        for (i, row) in src.rows.iter().enumerate() {
            let Some(key) = key_of(row, &key_idx) else {
                keep.push(i);
                continue;
            };
            match winners.get(&key) {
                Some(&current) => {
                    let newer = match order_idx {
                        Some(o) => row[o].sort_cmp(&src.rows[current][o]).is_ge(),
                        None => true,
                    };
                    if newer {
                        winners.insert(key, i);
                    }
                },
                None => {
                    winners.insert(key, i);
                },
            }
        }
        keep.extend(winners.into_values());
        keep.sort_unstable();

        let rows = keep.into_iter().map(|i| src.rows[i].clone()).collect();
        self.temp.insert(
            dest.to_lowercase(),
            MemTable {
                schema: src.schema.clone(),
                rows,
            },
        );
        Ok(())
    }

    async fn merge(&mut self, target: &str, source: &str, keys: &[String], columns: &[String]) -> Result<u64> {
        let src = self.snapshot(source)?;
        let src_key_idx = keys.iter().map(|k| src.index_of(k)).collect::<Result<Vec<_>>>()?;
        let src_col_idx = columns.iter().map(|c| src.index_of(c)).collect::<Result<Vec<_>>>()?;

        self.with_table(target, |tgt| {
            let tgt_key_idx = keys.iter().map(|k| tgt.index_of(k)).collect::<Result<Vec<_>>>()?;
            let tgt_col_idx = columns.iter().map(|c| tgt.index_of(c)).collect::<Result<Vec<_>>>()?;
            let is_key: Vec<bool> = columns
                .iter()
                .map(|c| keys.iter().any(|k| k.eq_ignore_ascii_case(c)))
                .collect();

            // Work on a copy so a failure leaves the target untouched
            let mut rows = tgt.rows.clone();
            let mut index: HashMap<Vec<String>, usize> = HashMap::new();
            for (i, row) in rows.iter().enumerate() {
                if let Some(key) = key_of(row, &tgt_key_idx) {
                    index.insert(key, i);
                }
            }

            let width = tgt.schema.len();
            let mut affected = 0u64;
            for src_row in &src.rows {
                let matched = key_of(src_row, &src_key_idx).and_then(|k| index.get(&k).copied());
                match matched {
                    Some(i) => {
                        let has_updates = is_key.iter().any(|k| !k);
                        if !has_updates {
                            continue;
                        }
                        for ((&s, &t), key) in src_col_idx.iter().zip(&tgt_col_idx).zip(&is_key) {
                            if !key {
                                rows[i][t] = store_as(&src_row[s], &tgt.schema.columns()[t])?;
                            }
                        }
                        affected += 1;
                    },
                    None => {
                        let mut new_row = vec![Value::Null; width];
                        for (&s, &t) in src_col_idx.iter().zip(&tgt_col_idx) {
                            new_row[t] = store_as(&src_row[s], &tgt.schema.columns()[t])?;
                        }
                        if let Some(key) = key_of(&new_row, &tgt_key_idx) {
                            index.insert(key, rows.len());
                        }
                        rows.push(new_row);
                        affected += 1;
                    },
                }
            }

            tgt.rows = rows;
            Ok(affected)
        })
    }
}

/// `value` in the type of a target column; a value the column cannot hold
/// fails the statement instead of becoming null
fn store_as(value: &Value, column: &Column) -> Result<Value> {
    value.try_cast(column.data_type).ok_or_else(|| {
        anyhow!(
            "cannot store {:?} in column {} of type {}",
            value.to_text(),
            column.name,
            column.data_type.as_str()
        )
    })
}
