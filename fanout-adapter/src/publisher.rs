//! Record publication.
//!
//! The publisher stamps every record with the instance id and optional
//! `createdAt`, encodes it, then inserts it with bounded retries. Terminal
//! store errors are never retried.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use tokio::time::sleep;
use tracing::{debug, warn};

use fanout_core::{InstanceId, Record, RecordPayload};
use fanout_stream::{EventLog, Offset, StoreError};

use crate::error::{AdapterError, Result};

const RETRY_BASE_DELAY: Duration = Duration::from_millis(50);

pub(crate) struct Publisher {
    store: Arc<dyn EventLog<Value>>,
    uid: InstanceId,
    nsp: String,
    attempts: u32,
    add_created_at: bool,
}

impl Publisher {
    pub(crate) fn new(
        store: Arc<dyn EventLog<Value>>,
        uid: InstanceId,
        nsp: String,
        attempts: u32,
        add_created_at: bool,
    ) -> Self {
        Self {
            store,
            uid,
            nsp,
            attempts: attempts.max(1),
            add_created_at,
        }
    }

    fn record(&self, payload: RecordPayload) -> Record {
        Record {
            nsp: self.nsp.clone(),
            uid: self.uid,
            created_at: self.add_created_at.then(Utc::now),
            payload,
        }
    }

    /// Insert one record, retrying transient failures with doubling
    /// backoff up to the configured attempt count.
    pub(crate) async fn publish(&self, payload: RecordPayload) -> Result<Offset> {
        let document = self.record(payload).encode()?;
        let mut delay = RETRY_BASE_DELAY;
        let mut source = StoreError::Unavailable("no insert attempted".to_string());

        for attempt in 1..=self.attempts {
            match self.store.append(&document).await {
                Ok(offset) => {
                    debug!(%offset, attempt, "record published");
                    return Ok(offset);
                }
                Err(StoreError::Gone(reason)) => {
                    return Err(AdapterError::StreamGone(reason));
                }
                Err(err) => {
                    warn!(attempt, error = %err, "record insert failed");
                    source = err;
                    if attempt < self.attempts {
                        sleep(delay).await;
                        delay *= 2;
                    }
                }
            }
        }

        Err(AdapterError::PublishFailed {
            attempts: self.attempts,
            source,
        })
    }
}
