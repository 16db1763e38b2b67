//! SQLite persistence for raw predictor measurements. The connection is
//! opened lazily per write block and closed on scope exit rather than held
//! open for the process lifetime.

use std::path::Path;

use rusqlite::{params, Connection};

/// One predictor's outcome for one measured block, as handed to
/// [`MeasurementDb::add_series`].
#[derive(Debug, Clone)]
pub struct PredictorRunRecord {
    pub toolname: String,
    pub version: String,
    pub uarch: String,
    pub result: Option<f64>,
    pub remark: Option<String>,
}

#[derive(Debug, Clone)]
pub struct MeasurementRecord {
    pub input_hex: String,
    pub predictor_runs: Vec<PredictorRunRecord>,
}

/// A batch of measurements sharing one series (one `report_batch` call's
/// worth of blocks), grouped into a single transaction on write.
#[derive(Debug, Clone)]
pub struct SeriesRecord {
    pub source_computer: String,
    pub timestamp_unix: i64,
    pub measurements: Vec<MeasurementRecord>,
}

pub struct MeasurementDb {
    path: std::path::PathBuf,
}

impl MeasurementDb {
    pub fn new(path: impl AsRef<Path>) -> rusqlite::Result<Self> {
        let db = Self { path: path.as_ref().to_path_buf() };
        let con = db.open()?;
        db.create_tables(&con)?;
        Ok(db)
    }

    fn open(&self) -> rusqlite::Result<Connection> {
        Connection::open(&self.path)
    }

    fn create_tables(&self, con: &Connection) -> rusqlite::Result<()> {
        con.execute_batch(
            "CREATE TABLE IF NOT EXISTS predictors (
                predictor_id INTEGER NOT NULL PRIMARY KEY,
                toolname TEXT NOT NULL,
                version TEXT NOT NULL,
                UNIQUE(toolname, version)
            );
            CREATE TABLE IF NOT EXISTS uarchs (
                uarch_id INTEGER NOT NULL PRIMARY KEY,
                uarch_name TEXT UNIQUE NOT NULL
            );
            CREATE TABLE IF NOT EXISTS series (
                series_id INTEGER NOT NULL PRIMARY KEY,
                source_computer TEXT NOT NULL,
                timestamp INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS measurements (
                measurement_id INTEGER NOT NULL PRIMARY KEY,
                series_id INTEGER NOT NULL,
                input_hex TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS predictor_runs (
                predrun_id INTEGER NOT NULL PRIMARY KEY,
                measurement_id INTEGER NOT NULL,
                predictor_id INTEGER NOT NULL,
                uarch_id INTEGER NOT NULL,
                result REAL,
                remark TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_predictor_runs_measurement
                ON predictor_runs(measurement_id);",
        )
    }

    /// Persists one series in a single transaction, grouping every insert
    /// belonging to a batch's report under one commit. Returns the new
    /// `series_id`.
    pub fn add_series(&self, series: &SeriesRecord) -> rusqlite::Result<i64> {
        let mut con = self.open()?;
        let tx = con.transaction()?;

        tx.execute(
            "INSERT INTO series (series_id, source_computer, timestamp) VALUES (NULL, ?1, ?2)",
            params![series.source_computer, series.timestamp_unix],
        )?;
        let series_id = tx.last_insert_rowid();

        let mut predictor_ids: std::collections::HashMap<(String, String), i64> =
            std::collections::HashMap::new();
        let mut uarch_ids: std::collections::HashMap<String, i64> = std::collections::HashMap::new();

        for m in &series.measurements {
            tx.execute(
                "INSERT INTO measurements (measurement_id, series_id, input_hex) VALUES (NULL, ?1, ?2)",
                params![series_id, m.input_hex],
            )?;
            let measurement_id = tx.last_insert_rowid();

            for run in &m.predictor_runs {
                let predictor_key = (run.toolname.clone(), run.version.clone());
                let predictor_id = match predictor_ids.get(&predictor_key) {
                    Some(id) => *id,
                    None => {
                        let existing: Option<i64> = tx
                            .query_row(
                                "SELECT predictor_id FROM predictors WHERE toolname=?1 AND version=?2",
                                params![run.toolname, run.version],
                                |row| row.get(0),
                            )
                            .ok();
                        let id = match existing {
                            Some(id) => id,
                            None => {
                                tx.execute(
                                    "INSERT INTO predictors (predictor_id, toolname, version) VALUES (NULL, ?1, ?2)",
                                    params![run.toolname, run.version],
                                )?;
                                tx.last_insert_rowid()
                            }
                        };
                        predictor_ids.insert(predictor_key, id);
                        id
                    }
                };

                let uarch_id = match uarch_ids.get(&run.uarch) {
                    Some(id) => *id,
                    None => {
                        let existing: Option<i64> = tx
                            .query_row(
                                "SELECT uarch_id FROM uarchs WHERE uarch_name=?1",
                                params![run.uarch],
                                |row| row.get(0),
                            )
                            .ok();
                        let id = match existing {
                            Some(id) => id,
                            None => {
                                tx.execute(
                                    "INSERT INTO uarchs (uarch_id, uarch_name) VALUES (NULL, ?1)",
                                    params![run.uarch],
                                )?;
                                tx.last_insert_rowid()
                            }
                        };
                        uarch_ids.insert(run.uarch.clone(), id);
                        id
                    }
                };

                tx.execute(
                    "INSERT INTO predictor_runs (predrun_id, measurement_id, predictor_id, uarch_id, result, remark)
                     VALUES (NULL, ?1, ?2, ?3, ?4, ?5)",
                    params![measurement_id, predictor_id, uarch_id, run.result, run.remark],
                )?;
            }
        }

        tx.commit()?;
        Ok(series_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_series_round_trips_through_a_fresh_database() {
        let dir = tempfile::tempdir().unwrap();
        let db = MeasurementDb::new(dir.path().join("measurements.db")).unwrap();

        let series = SeriesRecord {
            source_computer: "test-host".to_string(),
            timestamp_unix: 1_700_000_000,
            measurements: vec![MeasurementRecord {
                input_hex: "48ffc0".to_string(),
                predictor_runs: vec![
                    PredictorRunRecord {
                        toolname: "llvm-mca".to_string(),
                        version: "12.0".to_string(),
                        uarch: "SKL".to_string(),
                        result: Some(1.0),
                        remark: None,
                    },
                    PredictorRunRecord {
                        toolname: "uica".to_string(),
                        version: "1.0".to_string(),
                        uarch: "SKL".to_string(),
                        result: None,
                        remark: Some("error".to_string()),
                    },
                ],
            }],
        };

        let series_id = db.add_series(&series).unwrap();
        assert_eq!(series_id, 1);

        let con = db.open().unwrap();
        let count: i64 = con
            .query_row("SELECT COUNT(*) FROM predictor_runs", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 2);
    }

    #[test]
    fn repeated_predictor_and_uarch_are_not_duplicated() {
        let dir = tempfile::tempdir().unwrap();
        let db = MeasurementDb::new(dir.path().join("measurements.db")).unwrap();

        let run = |hex: &str| MeasurementRecord {
            input_hex: hex.to_string(),
            predictor_runs: vec![PredictorRunRecord {
                toolname: "llvm-mca".to_string(),
                version: "12.0".to_string(),
                uarch: "SKL".to_string(),
                result: Some(2.0),
                remark: None,
            }],
        };

        let series = SeriesRecord {
            source_computer: "test-host".to_string(),
            timestamp_unix: 0,
            measurements: vec![run("aa"), run("bb")],
        };
        db.add_series(&series).unwrap();

        let con = db.open().unwrap();
        let predictor_count: i64 = con
            .query_row("SELECT COUNT(*) FROM predictors", [], |row| row.get(0))
            .unwrap();
        assert_eq!(predictor_count, 1);
        let uarch_count: i64 = con
            .query_row("SELECT COUNT(*) FROM uarchs", [], |row| row.get(0))
            .unwrap();
        assert_eq!(uarch_count, 1);
    }
}
