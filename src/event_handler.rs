//! Applies remote events to the local `RemoteNode` view and publishes this
//! device's own events (spec §4.I). Grounded in `lansync/remote.py`'s
//! `RemoteEventHandler`.

use crate::db::Db;
use crate::error::Result;
use crate::event_client::EventClient;
use crate::model::{NodeEvent, NodeOperation};

/// `handle_new_events(namespace)`: pulls every event since the highest
/// sequence number we've already applied, then applies each in order.
pub async fn handle_new_events(db: &Db, client: &EventClient, namespace_row_id: i64, namespace: &str) -> Result<()> {
    let max_seq = db.with_conn(|conn| max_sequence_number(conn, namespace_row_id))?;
    let events = client.fetch_events(namespace, if max_seq == 0 { None } else { Some(max_seq) }).await?;
    for event in events {
        apply_remote_event(db, namespace_row_id, &event)?;
    }
    Ok(())
}

/// `push_events(events)`: publishes this device's own `CREATE`/`DELETE`
/// events and returns the sequence number the server assigned.
pub async fn push_events(client: &EventClient, namespace: &str, events: &[NodeEvent]) -> Result<i64> {
    client.push_events(namespace, events).await
}

pub fn apply_remote_event(db: &Db, namespace_row_id: i64, event: &NodeEvent) -> Result<()> {
    db.atomic(|conn| match event.operation {
        NodeOperation::Create => {
            let chunks_json = serde_json::to_string(&event.chunks)?;
            conn.execute(
                "INSERT INTO remote_node(namespace_id, key, sequence_number, path, timestamp, checksum, size, chunks_json, signature) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9) \
                 ON CONFLICT(namespace_id, key) DO UPDATE SET \
                    sequence_number = excluded.sequence_number, path = excluded.path, \
                    timestamp = excluded.timestamp, checksum = excluded.checksum, \
                    size = excluded.size, chunks_json = excluded.chunks_json, signature = excluded.signature",
                rusqlite::params![
                    namespace_row_id,
                    event.key,
                    event.sequence_number.unwrap_or(0),
                    event.path,
                    event.timestamp,
                    event.checksum,
                    event.size.unwrap_or(0) as i64,
                    chunks_json,
                    event.signature,
                ],
            )?;
            Ok(())
        }
        NodeOperation::Delete => {
            conn.execute(
                "DELETE FROM remote_node WHERE namespace_id = ?1 AND key = ?2",
                rusqlite::params![namespace_row_id, event.key],
            )?;
            Ok(())
        }
    })
}

fn max_sequence_number(conn: &rusqlite::Connection, namespace_row_id: i64) -> Result<i64> {
    let max: Option<i64> = conn.query_row(
        "SELECT MAX(sequence_number) FROM remote_node WHERE namespace_id = ?1",
        [namespace_row_id],
        |r| r.get(0),
    )?;
    Ok(max.unwrap_or(0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn apply_create_then_delete_round_trips() {
        let db = Db::open_in_memory().unwrap();
        let ns_id = db.with_conn(|conn| crate::db::namespace_id(conn, "ns")).unwrap();

        let create = NodeEvent {
            key: "k1".into(),
            operation: NodeOperation::Create,
            sequence_number: Some(5),
            path: "a.txt".into(),
            timestamp: "2026-01-01T00:00:00Z".into(),
            checksum: Some("c1".into()),
            size: Some(10),
            chunks: Some(vec![]),
            signature: None,
        };
        apply_remote_event(&db, ns_id, &create).unwrap();
        assert_eq!(db.with_conn(|conn| max_sequence_number(conn, ns_id)).unwrap(), 5);

        let delete = NodeEvent {
            key: "k1".into(),
            operation: NodeOperation::Delete,
            sequence_number: Some(6),
            path: "a.txt".into(),
            timestamp: "2026-01-01T00:00:01Z".into(),
            checksum: None,
            size: None,
            chunks: None,
            signature: None,
        };
        apply_remote_event(&db, ns_id, &delete).unwrap();

        let count: i64 = db
            .with_conn(|conn| Ok(conn.query_row("SELECT COUNT(*) FROM remote_node WHERE namespace_id = ?1", [ns_id], |r| r.get(0))?))
            .unwrap();
        assert_eq!(count, 0);
    }
}
