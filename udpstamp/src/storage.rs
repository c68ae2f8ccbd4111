use crate::state::LatencySample;
use rusqlite::{params, Connection, Result, Row};
use serde::Serialize;
use std::fs;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc::Receiver;
use tokio::time::{interval, Duration};

const FLUSH_BATCH: usize = 1000;

const SAMPLE_COLUMNS: &str =
    "received_at, received_ns, pkt_id, ingress_ts, egress_ts, delta, dst_port, src_ip, src_port";

#[derive(Clone)]
pub struct Storage {
    conn: Arc<Mutex<Connection>>,
    /// Highest row id present when this store was opened. Rows above it were
    /// collected by the current run.
    run_start: i64,
}

/// Shape of the JSON export: one document per collector.
#[derive(Debug, Serialize)]
struct DelayEntries<'a> {
    pod_id: &'a str,
    #[serde(rename = "IP_address")]
    ip_address: String,
    delay_timestamps: Vec<DelayEntry>,
}

#[derive(Debug, Serialize)]
struct DelayEntry {
    destination_port: u16,
    pkt_id: u64,
    ingress_ts: u64,
    egress_ts: u64,
    source_ip: String,
    source_port: u16,
    delta: i64,
}

impl From<LatencySample> for DelayEntry {
    fn from(sample: LatencySample) -> Self {
        Self {
            destination_port: sample.dst_port,
            pkt_id: sample.pkt_id,
            ingress_ts: sample.ingress_ts,
            egress_ts: sample.egress_ts,
            source_ip: sample.src_ip,
            source_port: sample.src_port,
            delta: sample.delta,
        }
    }
}

impl Storage {
    pub fn new(db_path: &str) -> Result<Self> {
        let conn = Connection::open(db_path)?;

        let _: String = conn.query_row("PRAGMA journal_mode=WAL;", [], |row| row.get(0))?;
        conn.execute_batch("PRAGMA synchronous=NORMAL;")?;

        // u64 stamps and ids are stored bit-for-bit in INTEGER (i64) columns.
        // AUTOINCREMENT keeps ids above `run_start` even after retention
        // empties the table.
        conn.execute(
            "CREATE TABLE IF NOT EXISTS samples (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                received_at INTEGER NOT NULL,
                received_ns INTEGER NOT NULL,
                pkt_id INTEGER NOT NULL,
                ingress_ts INTEGER NOT NULL,
                egress_ts INTEGER NOT NULL,
                delta INTEGER NOT NULL,
                dst_port INTEGER NOT NULL,
                src_ip TEXT NOT NULL,
                src_port INTEGER NOT NULL
            )",
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_received_at ON samples(received_at)",
            [],
        )?;

        let run_start: i64 =
            conn.query_row("SELECT COALESCE(MAX(id), 0) FROM samples", [], |row| row.get(0))?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            run_start,
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Batch incoming samples into transactions until every sender is gone,
    /// then flush what is left and return.
    pub async fn run_writer(&self, mut rx: Receiver<LatencySample>) {
        let mut buffer = Vec::new();
        let mut ticker = interval(Duration::from_secs(2));

        loop {
            tokio::select! {
                sample = rx.recv() => match sample {
                    Some(sample) => {
                        buffer.push(sample);
                        if buffer.len() >= FLUSH_BATCH {
                            self.flush(&mut buffer);
                        }
                    }
                    None => {
                        if !buffer.is_empty() {
                            self.flush(&mut buffer);
                        }
                        tracing::debug!("sample channel closed, writer exiting");
                        return;
                    }
                },
                _ = ticker.tick() => {
                    if !buffer.is_empty() {
                        self.flush(&mut buffer);
                    }
                }
            }
        }
    }

    fn flush(&self, buffer: &mut Vec<LatencySample>) {
        if let Err(e) = self.insert_samples(buffer) {
            tracing::error!("Failed to store {} samples: {}", buffer.len(), e);
            return;
        }
        buffer.clear();
    }

    pub fn insert_samples(&self, samples: &[LatencySample]) -> Result<()> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(&format!(
                "INSERT INTO samples ({SAMPLE_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)"
            ))?;

            for sample in samples {
                stmt.execute(params![
                    sample.received_at,
                    sample.received_ns as i64,
                    sample.pkt_id as i64,
                    sample.ingress_ts as i64,
                    sample.egress_ts as i64,
                    sample.delta,
                    sample.dst_port,
                    sample.src_ip,
                    sample.src_port
                ])?;
            }
        }
        tx.commit()
    }

    /// Newest samples first.
    pub fn query_history(&self, limit: usize) -> Result<Vec<LatencySample>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {SAMPLE_COLUMNS} FROM samples ORDER BY id DESC LIMIT ?1"
        ))?;
        let rows = stmt.query_map([limit], sample_from_row)?;
        rows.collect()
    }

    /// Every stored sample in arrival order.
    pub fn all_samples(&self) -> Result<Vec<LatencySample>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!("SELECT {SAMPLE_COLUMNS} FROM samples ORDER BY id"))?;
        let rows = stmt.query_map([], sample_from_row)?;
        rows.collect()
    }

    /// Samples stored since this store was opened, in arrival order.
    pub fn run_samples(&self) -> Result<Vec<LatencySample>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {SAMPLE_COLUMNS} FROM samples WHERE id > ?1 ORDER BY id"
        ))?;
        let rows = stmt.query_map([self.run_start], sample_from_row)?;
        rows.collect()
    }

    pub fn delete_old_data(&self, older_than_seconds: u64) -> Result<usize> {
        let cutoff_ms =
            chrono::Utc::now().timestamp_millis() - (older_than_seconds as i64 * 1000);
        let conn = self.conn();
        let deleted = conn.execute(
            "DELETE FROM samples WHERE received_at < ?1",
            params![cutoff_ms],
        )?;
        Ok(deleted)
    }

    /// Write the samples of this run to `<dir>/<pod_id>_delay_entries.json`.
    pub fn export_json(&self, dir: &Path, pod_id: &str, ip: Ipv4Addr) -> anyhow::Result<PathBuf> {
        let entries = DelayEntries {
            pod_id,
            ip_address: ip.to_string(),
            delay_timestamps: self
                .run_samples()?
                .into_iter()
                .map(DelayEntry::from)
                .collect(),
        };

        fs::create_dir_all(dir)?;
        let path = dir.join(format!("{pod_id}_delay_entries.json"));
        let file = fs::File::create(&path)?;
        serde_json::to_writer_pretty(file, &entries)?;
        Ok(path)
    }
}

fn sample_from_row(row: &Row<'_>) -> Result<LatencySample> {
    Ok(LatencySample {
        received_at: row.get(0)?,
        received_ns: row.get::<_, i64>(1)? as u64,
        pkt_id: row.get::<_, i64>(2)? as u64,
        ingress_ts: row.get::<_, i64>(3)? as u64,
        egress_ts: row.get::<_, i64>(4)? as u64,
        delta: row.get(5)?,
        dst_port: row.get(6)?,
        src_ip: row.get(7)?,
        src_port: row.get(8)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use udpstamp_common::TimingRecord;

    fn sample(pkt_id: u64, ingress_ts: u64, egress_ts: u64) -> LatencySample {
        LatencySample::new(
            TimingRecord {
                packet_id: pkt_id,
                ingress_ts,
                egress_ts,
            },
            2100,
            "10.0.0.10:40000".parse().unwrap(),
            egress_ts.wrapping_add(10),
        )
    }

    #[test]
    fn test_insert_and_query_history() {
        let storage = Storage::new(":memory:").unwrap();
        storage
            .insert_samples(&[sample(1, 100, 200), sample(2, 300, 450), sample(3, 0, 900)])
            .unwrap();

        let history = storage.query_history(2).unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].pkt_id, 3);
        assert_eq!(history[1].pkt_id, 2);
        assert_eq!(history[1].delta, 150);
        assert_eq!(history[1].received_ns, 460);

        assert_eq!(storage.all_samples().unwrap().len(), 3);
    }

    #[test]
    fn test_u64_fields_survive_storage() {
        let storage = Storage::new(":memory:").unwrap();
        let big = sample(u64::MAX, 1, u64::MAX - 1);
        storage.insert_samples(std::slice::from_ref(&big)).unwrap();

        let stored = storage.all_samples().unwrap();
        assert_eq!(stored[0].pkt_id, u64::MAX);
        assert_eq!(stored[0].egress_ts, u64::MAX - 1);
        assert_eq!(stored[0], big);
        assert_eq!(stored[0].received_ns, 8);
    }

    #[test]
    fn test_delete_old_data_keeps_recent() {
        let storage = Storage::new(":memory:").unwrap();
        let mut old = sample(1, 1, 2);
        old.received_at -= 3_600_000;
        storage.insert_samples(&[old, sample(2, 1, 2)]).unwrap();

        assert_eq!(storage.delete_old_data(60).unwrap(), 1);
        let left = storage.all_samples().unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].pkt_id, 2);
    }

    #[tokio::test]
    async fn test_writer_flushes_on_close() {
        let storage = Storage::new(":memory:").unwrap();
        let (tx, rx) = tokio::sync::mpsc::channel(16);
        let writer = {
            let storage = storage.clone();
            tokio::spawn(async move { storage.run_writer(rx).await })
        };

        for id in 0..5 {
            tx.send(sample(id, 10, 20)).await.unwrap();
        }
        drop(tx);
        writer.await.unwrap();

        assert_eq!(storage.all_samples().unwrap().len(), 5);
    }

    #[test]
    fn test_export_json_shape() {
        let storage = Storage::new(":memory:").unwrap();
        storage
            .insert_samples(&[sample(42, 1_000, 1_750), sample(43, 0, 2_000)])
            .unwrap();

        let dir = std::env::temp_dir().join(format!("udpstamp-export-{}", std::process::id()));
        let path = storage
            .export_json(&dir, "pod3", Ipv4Addr::new(10, 0, 0, 3))
            .unwrap();
        assert_eq!(path.file_name().unwrap(), "pod3_delay_entries.json");

        let doc: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        fs::remove_dir_all(&dir).unwrap();

        assert_eq!(doc["pod_id"], "pod3");
        assert_eq!(doc["IP_address"], "10.0.0.3");
        let entries = doc["delay_timestamps"].as_array().unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0]["pkt_id"], 42);
        assert_eq!(entries[0]["destination_port"], 2100);
        assert_eq!(entries[0]["source_ip"], "10.0.0.10");
        assert_eq!(entries[0]["source_port"], 40000);
        assert_eq!(entries[0]["delta"], 750);
        assert_eq!(entries[1]["ingress_ts"], 0);
        assert_eq!(entries[1]["delta"], 2_000);
    }

    #[test]
    fn test_export_json_covers_current_run_only() {
        let dir = std::env::temp_dir().join(format!("udpstamp-runs-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        let db = dir.join("latency.db");
        let db = db.to_str().unwrap();

        let first = Storage::new(db).unwrap();
        first.insert_samples(&[sample(1, 10, 20), sample(2, 30, 40)]).unwrap();
        drop(first);

        let second = Storage::new(db).unwrap();
        assert!(second.run_samples().unwrap().is_empty());
        second.insert_samples(&[sample(99, 50, 70)]).unwrap();

        let path = second
            .export_json(&dir, "pod1", Ipv4Addr::new(10, 0, 0, 1))
            .unwrap();
        let doc: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        let all = second.all_samples().unwrap().len();
        drop(second);
        fs::remove_dir_all(&dir).unwrap();

        let entries = doc["delay_timestamps"].as_array().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0]["pkt_id"], 99);
        assert_eq!(all, 3);
    }

    #[test]
    fn test_run_survives_retention_emptying_table() {
        let dir = std::env::temp_dir().join(format!("udpstamp-retention-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        let db = dir.join("latency.db");
        let db = db.to_str().unwrap();

        let mut old = sample(1, 1, 2);
        old.received_at -= 3_600_000;
        Storage::new(db).unwrap().insert_samples(&[old]).unwrap();

        let storage = Storage::new(db).unwrap();
        assert_eq!(storage.delete_old_data(60).unwrap(), 1);
        storage.insert_samples(&[sample(7, 1, 2)]).unwrap();
        let run = storage.run_samples().unwrap();
        drop(storage);
        fs::remove_dir_all(&dir).unwrap();

        assert_eq!(run.len(), 1);
        assert_eq!(run[0].pkt_id, 7);
    }
}
