/// Raw row loading from the operational PostgreSQL store
///
/// The caller owns the connection (credentials, TLS, pooling); these
/// functions only issue read queries on a borrowed `postgres::Client`.
/// Every column is cast in SQL so rows arrive as text/float regardless of
/// the source table's column types.

use postgres::Client;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::SourceError;
use crate::ingest::ColumnMap;
use crate::logging::Stage;
use crate::model::{RawRow, RawTimestamp};

/// Tables written by earlier cleaning runs end in `_clean_YYYYMMDD_HHMMSS`
/// and are never used as sources.
const CLEAN_SNAPSHOT_MARKER: &str = "_clean_";

/// Where and how to read visit rows.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceSettings {
    pub table: Option<String>,
    #[serde(flatten)]
    pub columns: ColumnMap,
    /// Cap on rows fetched, for sampling large tables.
    pub limit: Option<i64>,
}

/// Fetch all rows of `settings.table` as raw rows, in primary read order
/// (`ORDER BY` the timestamp column, then id).
pub fn fetch_raw_rows(client: &mut Client, settings: &SourceSettings) -> Result<Vec<RawRow>, SourceError> {
    let table = settings
        .table
        .as_deref()
        .ok_or(SourceError::MissingTable)?;
    let query = build_select(table, &settings.columns, settings.limit)?;

    let rows = client.query(query.as_str(), &[])?;

    let durations = &settings.columns.duration_columns;
    let mut raw = Vec::with_capacity(rows.len());
    for row in rows {
        let mut duration_values = std::collections::BTreeMap::new();
        for (i, name) in durations.iter().enumerate() {
            let value: Option<f64> = row.try_get(5 + i)?;
            duration_values.insert(name.clone(), value);
        }
        raw.push(RawRow {
            id: row.try_get(0)?,
            // Cast to text in the query; `timestamptz` comes back as `2024-05-01 09:00:00.5+00`.
            timestamp: row.try_get::<_, Option<String>>(1)?.map(RawTimestamp::Text),
            branch: row.try_get(2)?,
            description: row.try_get(3)?,
            status: row.try_get(4)?,
            durations: duration_values,
        });
    }

    info!(stage = %Stage::Normalize, table, rows = raw.len(), "loaded raw rows");
    Ok(raw)
}

/// List candidate source tables in the `public` schema, skipping cleaned
/// snapshot tables.
pub fn list_source_tables(client: &mut Client) -> Result<Vec<String>, SourceError> {
    let rows = client.query(
        "SELECT table_name::text FROM information_schema.tables
         WHERE table_schema = 'public' AND table_type = 'BASE TABLE'
         ORDER BY table_name",
        &[],
    )?;

    let mut tables = Vec::new();
    for row in rows {
        let name: String = row.try_get(0)?;
        if !is_clean_snapshot(&name) {
            tables.push(name);
        }
    }
    Ok(tables)
}

/// Builds the SELECT for a source table. Identifiers are validated and
/// double-quoted; nothing user-supplied is interpolated unquoted.
fn build_select(table: &str, columns: &ColumnMap, limit: Option<i64>) -> Result<String, SourceError> {
    let mut select = vec![
        format!("{}::text", quote_ident(&columns.id_column)?),
        format!("{}::text", quote_ident(&columns.timestamp_column)?),
        format!("{}::text", quote_ident(&columns.branch_column)?),
        format!("{}::text", quote_ident(&columns.description_column)?),
        format!("{}::text", quote_ident(&columns.status_column)?),
    ];
    for name in &columns.duration_columns {
        select.push(format!("{}::float8", quote_ident(name)?));
    }

    let mut sql = format!(
        "SELECT {} FROM {} ORDER BY {}, {}",
        select.join(", "),
        quote_ident(table)?,
        quote_ident(&columns.timestamp_column)?,
        quote_ident(&columns.id_column)?,
    );
    if let Some(n) = limit {
        sql.push_str(&format!(" LIMIT {}", n.max(0)));
    }
    Ok(sql)
}

fn quote_ident(name: &str) -> Result<String, SourceError> {
    let valid = !name.is_empty()
        && name.len() <= 63
        && name.chars().all(|c| c.is_alphanumeric() || c == '_' || c == ' ');
    if !valid {
        return Err(SourceError::InvalidIdentifier(name.to_string()));
    }
    Ok(format!("\"{}\"", name))
}

/// True for names like `visits_clean_20240501_130000`.
fn is_clean_snapshot(name: &str) -> bool {
    let Some(pos) = name.rfind(CLEAN_SNAPSHOT_MARKER) else {
        return false;
    };
    let suffix = &name[pos + CLEAN_SNAPSHOT_MARKER.len()..];
    let parts: Vec<&str> = suffix.split('_').collect();
    parts.len() == 2
        && parts[0].len() == 8
        && parts[1].len() == 6
        && parts.iter().all(|p| p.chars().all(|c| c.is_ascii_digit()))
}
