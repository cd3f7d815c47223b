use ax_types::{AxResult, StrategyId, StrategySpec};
use rusqlite::{params, OptionalExtension, Row};
use tracing::debug;

use crate::{not_found, parse_time, parse_uuid, query_error, Store};

const STRATEGY_COLUMNS: &str = "id, owner, name, description, source_code, created_at, updated_at";

struct StrategyRow {
    id: String,
    owner: String,
    name: String,
    description: String,
    source_code: String,
    created_at: String,
    updated_at: String,
}

impl StrategyRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            owner: row.get(1)?,
            name: row.get(2)?,
            description: row.get(3)?,
            source_code: row.get(4)?,
            created_at: row.get(5)?,
            updated_at: row.get(6)?,
        })
    }

    fn into_spec(self) -> AxResult<StrategySpec> {
        Ok(StrategySpec {
            id: parse_uuid(&self.id)?,
            owner: self.owner,
            name: self.name,
            description: self.description,
            source_code: self.source_code,
            created_at: parse_time(&self.created_at)?,
            updated_at: parse_time(&self.updated_at)?,
        })
    }
}

impl Store {
    pub fn insert_strategy(&self, strategy: &StrategySpec) -> AxResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO strategies (id, owner, name, description, source_code, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                strategy.id.to_string(),
                strategy.owner,
                strategy.name,
                strategy.description,
                strategy.source_code,
                strategy.created_at.to_rfc3339(),
                strategy.updated_at.to_rfc3339(),
            ],
        )
        .map_err(query_error("insert strategy"))?;
        debug!(strategy_id = %strategy.id, owner = %strategy.owner, "Inserted strategy");
        Ok(())
    }

    /// Overwrite name, description and code of an existing strategy.
    pub fn update_strategy(&self, strategy: &StrategySpec) -> AxResult<()> {
        let conn = self.conn.lock();
        let changed = conn
            .execute(
                "UPDATE strategies SET name = ?2, description = ?3, source_code = ?4, updated_at = ?5
                 WHERE id = ?1",
                params![
                    strategy.id.to_string(),
                    strategy.name,
                    strategy.description,
                    strategy.source_code,
                    strategy.updated_at.to_rfc3339(),
                ],
            )
            .map_err(query_error("update strategy"))?;
        if changed == 0 {
            return Err(not_found("strategy", strategy.id));
        }
        Ok(())
    }

    pub fn get_strategy(&self, id: StrategyId) -> AxResult<StrategySpec> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                &format!("SELECT {} FROM strategies WHERE id = ?1", STRATEGY_COLUMNS),
                params![id.to_string()],
                StrategyRow::read,
            )
            .optional()
            .map_err(query_error("get strategy"))?;
        row.ok_or_else(|| not_found("strategy", id))?.into_spec()
    }

    /// Strategies of one owner, newest first.
    pub fn list_strategies(&self, owner: &str) -> AxResult<Vec<StrategySpec>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {} FROM strategies WHERE owner = ?1 ORDER BY created_at DESC",
                STRATEGY_COLUMNS
            ))
            .map_err(query_error("list strategies"))?;
        let rows = stmt
            .query_map(params![owner], StrategyRow::read)
            .map_err(query_error("list strategies"))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(query_error("list strategies"))?;
        rows.into_iter().map(StrategyRow::into_spec).collect()
    }

    /// Returns false when no such strategy existed.
    pub fn delete_strategy(&self, id: StrategyId) -> AxResult<bool> {
        let conn = self.conn.lock();
        let deleted = conn
            .execute("DELETE FROM strategies WHERE id = ?1", params![id.to_string()])
            .map_err(query_error("delete strategy"))?;
        Ok(deleted > 0)
    }
}
