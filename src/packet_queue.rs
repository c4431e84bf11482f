use crate::config::QueuedClientConfig;
use crate::error::Result;
use crate::packet::DataPacket;
use rusqlite::{params, Connection, TransactionBehavior};
use std::path::PathBuf;
use std::time::Duration;
use ulid::Ulid;

/// Eviction limits for the on-device queue. A zero value disables the
/// corresponding limit.
#[derive(Debug, Clone)]
pub struct QueueLimits {
    pub max_rows: u64,
    pub max_size_bytes: u64,
    pub max_age_millis: u64,
}

impl From<&QueuedClientConfig> for QueueLimits {
    fn from(config: &QueuedClientConfig) -> Self {
        Self {
            max_rows: config.max_rows,
            max_size_bytes: config.max_size_bytes,
            max_age_millis: config.max_age_millis,
        }
    }
}

/// A set of rows checked out for one drain attempt. Rows stay invisible to
/// other drains until the batch is committed or rolled back.
pub struct QueueBatch {
    transaction_id: String,
    rows: Vec<QueueRow>,
}

struct QueueRow {
    id: i64,
    packet: DataPacket,
}

impl QueueBatch {
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Packets in drain order: most recently enqueued first.
    pub fn packets(&self) -> impl Iterator<Item = &DataPacket> {
        self.rows.iter().map(|row| &row.packet)
    }
}

/// Durable packet queue backed by a key-ordered SQLite table.
///
/// Rows are assigned monotonically increasing ids on insert; drains consume
/// them newest-first. Opening the queue rolls back any checkout left behind
/// by an aborted process.
pub struct PacketQueue {
    db_path: PathBuf,
    limits: QueueLimits,
}

impl PacketQueue {
    pub fn open(db_path: impl Into<PathBuf>, limits: QueueLimits) -> Result<Self> {
        let queue = Self {
            db_path: db_path.into(),
            limits,
        };

        let conn = queue.conn()?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS packets (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                created_at INTEGER NOT NULL,
                attributes BLOB NOT NULL,
                content BLOB NOT NULL,
                content_size INTEGER NOT NULL,
                transaction_id TEXT
            )",
            [],
        )?;
        let recovered = conn.execute("UPDATE packets SET transaction_id = NULL", [])?;
        if recovered > 0 {
            tracing::info!("Rolled back {} checked-out packets on open", recovered);
        }

        Ok(queue)
    }

    fn conn(&self) -> Result<Connection> {
        let conn = Connection::open(&self.db_path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        Ok(conn)
    }

    /// Persist packets in insertion order within a single atomic group.
    /// File-backed packet data is read here, so a missing file fails the
    /// whole enqueue before anything is written.
    pub async fn enqueue(&self, packets: &[DataPacket]) -> Result<()> {
        let mut rows = Vec::with_capacity(packets.len());
        for packet in packets {
            let data = packet.read_data().await?;
            let attributes = serde_json::to_vec(&packet.attributes())?;
            rows.push((attributes, data));
        }

        let now = chrono::Utc::now().timestamp_millis();
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        for (attributes, data) in &rows {
            tx.execute(
                "INSERT INTO packets (created_at, attributes, content, content_size)
                 VALUES (?1, ?2, ?3, ?4)",
                params![now, attributes, data.as_ref(), data.len() as i64],
            )?;
        }
        tx.commit()?;

        tracing::debug!("Enqueued {} packets", rows.len());
        Ok(())
    }

    /// Check out up to `max_count` of the most recent unclaimed rows whose
    /// cumulative payload size stays within `max_size` (always at least one
    /// row), skipping rows older than `max_age_millis`. The returned batch
    /// is stamped and invisible to concurrent drains.
    pub fn next_batch(
        &self,
        max_count: u32,
        max_size: u64,
        max_age_millis: u64,
    ) -> Result<QueueBatch> {
        let cutoff = if max_age_millis > 0 {
            chrono::Utc::now().timestamp_millis() - max_age_millis as i64
        } else {
            i64::MIN
        };
        let limit = if max_count > 0 { max_count as i64 } else { -1 };

        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let mut rows = Vec::new();
        {
            let mut stmt = tx.prepare(
                "SELECT id, attributes, content, content_size FROM packets
                 WHERE transaction_id IS NULL AND created_at >= ?1
                 ORDER BY id DESC LIMIT ?2",
            )?;
            let mut total: u64 = 0;
            let mut results = stmt.query(params![cutoff, limit])?;
            while let Some(row) = results.next()? {
                let content_size: i64 = row.get(3)?;
                if !rows.is_empty()
                    && max_size > 0
                    && total + content_size as u64 > max_size
                {
                    break;
                }
                total += content_size as u64;

                let attributes_blob: Vec<u8> = row.get(1)?;
                let content: Vec<u8> = row.get(2)?;
                rows.push(QueueRow {
                    id: row.get(0)?,
                    packet: DataPacket::from_bytes(
                        serde_json::from_slice(&attributes_blob)?,
                        content,
                    ),
                });
            }
        }

        let transaction_id = Ulid::new().to_string();
        for row in &rows {
            tx.execute(
                "UPDATE packets SET transaction_id = ?1 WHERE id = ?2",
                params![transaction_id, row.id],
            )?;
        }
        tx.commit()?;

        Ok(QueueBatch {
            transaction_id,
            rows,
        })
    }

    /// Delete the batch's rows after server confirmation.
    pub fn commit(&self, batch: &QueueBatch) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "DELETE FROM packets WHERE transaction_id = ?1",
            params![batch.transaction_id],
        )?;
        Ok(())
    }

    /// Clear the batch's checkout stamp, making its rows visible to the next
    /// drain.
    pub fn rollback(&self, batch: &QueueBatch) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE packets SET transaction_id = NULL WHERE transaction_id = ?1",
            params![batch.transaction_id],
        )?;
        Ok(())
    }

    /// Evict oldest rows first until the age, row-count and byte budgets all
    /// hold. Checked-out rows are never evicted. Idempotent.
    pub fn cleanup(&self) -> Result<u64> {
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let mut evicted: u64 = 0;

        if self.limits.max_age_millis > 0 {
            let cutoff = chrono::Utc::now().timestamp_millis() - self.limits.max_age_millis as i64;
            evicted += tx.execute(
                "DELETE FROM packets WHERE transaction_id IS NULL AND created_at < ?1",
                params![cutoff],
            )? as u64;
        }

        if self.limits.max_rows > 0 {
            let count: i64 = tx.query_row("SELECT COUNT(*) FROM packets", [], |row| row.get(0))?;
            let excess = count - self.limits.max_rows as i64;
            if excess > 0 {
                evicted += tx.execute(
                    "DELETE FROM packets WHERE id IN (
                        SELECT id FROM packets WHERE transaction_id IS NULL
                        ORDER BY id ASC LIMIT ?1
                    )",
                    params![excess],
                )? as u64;
            }
        }

        if self.limits.max_size_bytes > 0 {
            loop {
                let total: i64 = tx.query_row(
                    "SELECT COALESCE(SUM(content_size), 0) FROM packets",
                    [],
                    |row| row.get(0),
                )?;
                if total as u64 <= self.limits.max_size_bytes {
                    break;
                }
                let deleted = tx.execute(
                    "DELETE FROM packets WHERE id = (
                        SELECT id FROM packets WHERE transaction_id IS NULL
                        ORDER BY id ASC LIMIT 1
                    )",
                    [],
                )?;
                if deleted == 0 {
                    break;
                }
                evicted += deleted as u64;
            }
        }

        tx.commit()?;
        if evicted > 0 {
            tracing::info!("Evicted {} queued packets", evicted);
        }
        Ok(evicted)
    }

    pub fn count(&self) -> Result<u64> {
        let conn = self.conn()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM packets", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    pub fn total_size(&self) -> Result<u64> {
        let conn = self.conn()?;
        let total: i64 = conn.query_row(
            "SELECT COALESCE(SUM(content_size), 0) FROM packets",
            [],
            |row| row.get(0),
        )?;
        Ok(total as u64)
    }
}
