use std::collections::HashMap;

use chrono::Utc;
use mongodb::bson::{doc, Bson, DateTime, Document};
use tokio::time::{interval, Duration};
use tracing::{debug, error, info, warn};

use crate::db::DocumentStore;
use crate::tally::MessageTally;

/// Half of every recorded message counts toward the persisted balance.
const BALANCE_SHARE: i64 = 2;
/// How long a freshly credited balance stays current before expiry sweeps
/// pick it up.
const EXPIRY_DAYS: i64 = 7;

/// Periodically drains the message tally into the balance collection.
///
/// Each user's pending count becomes two upserts in one unordered bulk
/// write: a balance increment of `count / 2` and a refreshed `ExpireAt`
/// stamp seven days out. Counts drained for a cycle that then fails to
/// write are dropped, matching the fire-and-forget submission this layer
/// promises; they are logged, never retried.
pub struct TallyFlusher {
    tally: MessageTally,
    store: DocumentStore,
    flush_interval: Duration,
}

impl TallyFlusher {
    pub fn new(tally: MessageTally, store: DocumentStore, flush_interval_secs: u64) -> Self {
        Self {
            tally,
            store,
            flush_interval: Duration::from_secs(flush_interval_secs),
        }
    }

    pub async fn run(self) {
        let mut ticker = interval(self.flush_interval);
        loop {
            ticker.tick().await;
            if let Err(e) = self.flush().await {
                error!("Tally flush cycle failed: {}", e);
            }
        }
    }

    /// Drains and writes one cycle. Exposed so shutdown paths and tests can
    /// force a flush between ticks.
    pub async fn flush(&self) -> anyhow::Result<()> {
        let counts = self.tally.drain();
        if counts.is_empty() {
            debug!("Tally flush: nothing pending");
            return Ok(());
        }

        let users = counts.len();
        let expires_at = expiry_stamp();
        let models = flush_updates(&counts, expires_at)
            .into_iter()
            .map(|(id, update)| self.store.update_model(id, update))
            .collect();

        self.store.bulk_write(models, false).await?;
        info!(
            "Tally flush: credited {} user(s) into '{}'",
            users,
            self.store.name()
        );
        Ok(())
    }
}

fn expiry_stamp() -> DateTime {
    DateTime::from_millis((Utc::now() + chrono::Duration::days(EXPIRY_DAYS)).timestamp_millis())
}

/// The update pair every tally entry flushes to: a balance increment and an
/// expiry refresh, both keyed by the numeric user id. Entries whose key does
/// not parse as an id are dropped with a warning rather than poisoning the
/// batch.
fn flush_updates(counts: &HashMap<String, i64>, expires_at: DateTime) -> Vec<(Bson, Document)> {
    let mut updates = Vec::with_capacity(counts.len() * 2);
    for (user, count) in counts {
        let id = match user.parse::<i64>() {
            Ok(id) => Bson::Int64(id),
            Err(_) => {
                warn!("Tally flush: dropping unparsable user id '{}'", user);
                continue;
            }
        };
        updates.push((id.clone(), doc! { "$inc": { "balance": count / BALANCE_SHARE } }));
        updates.push((id, doc! { "$set": { "ExpireAt": expires_at } }));
    }
    updates
}
