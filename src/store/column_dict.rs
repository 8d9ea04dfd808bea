//! Column-value dictionary: interns (column, value) pairs into small
//! integer ids on the write path.

use std::collections::HashMap;

use rusqlite::Connection;

use crate::error::Result;

/// In-memory lookup over the persisted `column_dictionary` table.
///
/// Within a column the value → id mapping is bijective and ids are dense
/// starting at 1. Entries are append-only: a migration rollback never prunes
/// them. The Writer is the sole mutator, which keeps id assignment race-free.
#[derive(Debug, Default)]
pub struct ColumnDictionary {
    lookup: HashMap<String, HashMap<String, i64>>,
}

impl ColumnDictionary {
    /// Rebuild the lookup from the persisted table.
    pub fn load(conn: &Connection) -> Result<Self> {
        let mut stmt = conn.prepare(r#"SELECT "column", value, value_id FROM column_dictionary"#)?;
        let mut lookup: HashMap<String, HashMap<String, i64>> = HashMap::new();
        let mut count = 0usize;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, i64>(2)?,
            ))
        })?;
        for row in rows {
            let (column, value, value_id) = row?;
            lookup.entry(column).or_default().insert(value, value_id);
            count += 1;
        }
        tracing::info!("loaded column dictionary, total entry count: {count}");
        Ok(Self { lookup })
    }

    /// Return the id for a (column, value) pair, persisting and caching a
    /// fresh one when the pair is unseen. New columns start at id 1; new
    /// values for a known column get `max(existing) + 1`.
    pub fn get_or_create(&mut self, conn: &Connection, column: &str, value: &str) -> Result<i64> {
        if let Some(values) = self.lookup.get(column) {
            if let Some(&id) = values.get(value) {
                return Ok(id);
            }
        }

        let value_id = self
            .lookup
            .get(column)
            .and_then(|values| values.values().copied().max())
            .unwrap_or(0)
            + 1;
        conn.execute(
            r#"INSERT INTO column_dictionary ("column", value, value_id) VALUES (?1, ?2, ?3)"#,
            rusqlite::params![column, value, value_id],
        )?;
        self.lookup
            .entry(column.to_string())
            .or_default()
            .insert(value.to_string(), value_id);
        Ok(value_id)
    }

    pub fn entry_count(&self) -> usize {
        self.lookup.values().map(HashMap::len).sum()
    }

    #[cfg(test)]
    pub(crate) fn lookup(&self) -> &HashMap<String, HashMap<String, i64>> {
        &self.lookup
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dict_conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            r#"CREATE TABLE column_dictionary (
                "column" TEXT NOT NULL,
                value TEXT NOT NULL,
                value_id INTEGER NOT NULL,
                UNIQUE("column", value)
            )"#,
        )
        .unwrap();
        conn
    }

    #[test]
    fn first_value_of_a_column_gets_id_one() {
        let conn = dict_conn();
        let mut dict = ColumnDictionary::default();
        assert_eq!(dict.get_or_create(&conn, "level", "INFO").unwrap(), 1);
    }

    #[test]
    fn ids_are_dense_and_stable() {
        let conn = dict_conn();
        let mut dict = ColumnDictionary::default();
        let a = dict.get_or_create(&conn, "level", "INFO").unwrap();
        let b = dict.get_or_create(&conn, "level", "WARN").unwrap();
        let c = dict.get_or_create(&conn, "level", "ERROR").unwrap();
        assert_eq!((a, b, c), (1, 2, 3));

        // Repeated calls return the existing id.
        assert_eq!(dict.get_or_create(&conn, "level", "WARN").unwrap(), 2);
        assert_eq!(dict.entry_count(), 3);
    }

    #[test]
    fn columns_are_independent() {
        let conn = dict_conn();
        let mut dict = ColumnDictionary::default();
        dict.get_or_create(&conn, "level", "INFO").unwrap();
        dict.get_or_create(&conn, "level", "WARN").unwrap();
        assert_eq!(dict.get_or_create(&conn, "service", "api").unwrap(), 1);
    }

    #[test]
    fn load_rebuilds_from_persisted_rows() {
        let conn = dict_conn();
        let mut dict = ColumnDictionary::default();
        dict.get_or_create(&conn, "level", "INFO").unwrap();
        dict.get_or_create(&conn, "level", "WARN").unwrap();
        dict.get_or_create(&conn, "service", "api").unwrap();

        let reloaded = ColumnDictionary::load(&conn).unwrap();
        assert_eq!(reloaded.entry_count(), 3);
        assert_eq!(reloaded.lookup()["level"]["WARN"], 2);

        // A reloaded dictionary keeps assigning past the persisted maximum.
        let mut reloaded = reloaded;
        assert_eq!(reloaded.get_or_create(&conn, "level", "DEBUG").unwrap(), 3);
    }
}
