//! Request/response parameter access over the device session.

use std::sync::Arc;
use std::time::Duration;

use futures::future::try_join_all;
use futures::{Stream, StreamExt};
use tokio::time::Instant;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, info, warn};

use super::cache::{CacheLookup, ParameterCache};
use super::pending::PendingRequests;
use super::standard::{AutoMode, OperationMode, ids};
use crate::connection::Session;
use crate::protocol::{ParameterOp, ParameterRequest, ResponseBody};
use crate::types::{ParameterDescriptor, ParameterSet, ParameterValue};
use crate::{Result, TransferError};

/// Handle for reading and writing device parameters.
///
/// Cheap to clone; all clones share the session, the request table and the
/// cache. Every call first waits (bounded by the request timeout) for the
/// session to be live, and fails with `ConnectionLost` once it is closed.
#[derive(Clone)]
pub struct ParameterChannel {
    session: Arc<Session>,
    pending: Arc<PendingRequests>,
    cache: Arc<ParameterCache>,
    request_timeout: Duration,
}

impl ParameterChannel {
    pub(crate) fn new(
        session: Arc<Session>,
        pending: Arc<PendingRequests>,
        cache: Arc<ParameterCache>,
        request_timeout: Duration,
    ) -> Self {
        Self { session, pending, cache, request_timeout }
    }

    /// Fetch all parameters and return a disconnected snapshot.
    pub async fn get_parameter_set(&self) -> Result<ParameterSet> {
        let (body, generation) = self.request(ParameterOp::List, "*").await?;
        match body {
            ResponseBody::Listing(descriptors) => {
                let set = self.cache.replace_all(descriptors, generation);
                debug!(
                    count = set.len(),
                    version = set.version(),
                    "Parameter set refreshed"
                );
                Ok(set)
            }
            other => Err(unexpected("*", &other)),
        }
    }

    /// Fetch one parameter descriptor.
    pub async fn get_parameter(&self, id: &str) -> Result<ParameterDescriptor> {
        let op = ParameterOp::Get { id: id.to_string() };
        let (body, generation) = self.request(op, id).await?;
        match body {
            ResponseBody::Descriptor(descriptor) => {
                self.cache.upsert(descriptor.clone(), generation);
                Ok(descriptor)
            }
            other => Err(unexpected(id, &other)),
        }
    }

    /// Write one parameter and wait for the device to acknowledge it.
    ///
    /// When the parameter was cached during the current session the value is
    /// validated locally first and an invalid write never reaches the device.
    pub async fn set_parameter(&self, id: &str, value: impl Into<ParameterValue>) -> Result<()> {
        let value = self.validate_locally(id, value.into())?;
        self.send_set(id, value).await
    }

    /// Write several parameters concurrently, one request each.
    ///
    /// All values are validated locally before anything is sent. The writes
    /// are independent: when the device rejects one of them the others may
    /// already be applied, and the first failure is returned. Use
    /// [`commit_batch`](Self::commit_batch) when all values must change
    /// together.
    pub async fn set_parameters<I, S, V>(&self, writes: I) -> Result<()>
    where
        I: IntoIterator<Item = (S, V)>,
        S: Into<String>,
        V: Into<ParameterValue>,
    {
        let checked = self.validate_all(writes)?;
        try_join_all(checked.iter().map(|(id, value)| self.send_set(id, value.clone()))).await?;
        Ok(())
    }

    /// Write several parameters as one transaction.
    ///
    /// The device applies every value or, if any of them is rejected, none.
    pub async fn commit_batch<I, S, V>(&self, writes: I) -> Result<()>
    where
        I: IntoIterator<Item = (S, V)>,
        S: Into<String>,
        V: Into<ParameterValue>,
    {
        let writes = self.validate_all(writes)?;
        if writes.is_empty() {
            return Ok(());
        }
        let count = writes.len();
        let (body, generation) = self.request(ParameterOp::Batch { writes }, "").await?;
        match body {
            ResponseBody::BatchAck(descriptors) => {
                debug!(count, "Parameter batch committed");
                for descriptor in descriptors {
                    self.cache.upsert(descriptor, generation);
                }
                Ok(())
            }
            other => Err(unexpected("batch", &other)),
        }
    }

    /// Make the current values of `ids` survive a device restart.
    pub async fn persist_parameters<I, S>(&self, ids: I) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let ids: Vec<String> = ids.into_iter().map(Into::into).collect();
        let generation = self.session.generation();
        for id in &ids {
            if self.cache.lookup(id, generation) == CacheLookup::Unknown {
                return Err(TransferError::UnknownParameter { id: id.clone() });
            }
        }
        let (body, _) = self.request(ParameterOp::Persist { ids }, "").await?;
        match body {
            ResponseBody::Persisted(saved) => {
                info!(count = saved.len(), "Parameters persisted on device");
                Ok(())
            }
            other => Err(unexpected("persist", &other)),
        }
    }

    /// Ask the device to restart. The session reconnects once it is back.
    pub async fn reboot(&self) -> Result<()> {
        warn!("Requesting device reboot");
        self.set_parameter(ids::REBOOT, true).await
    }

    /// Parameter changes the device makes on its own, as they arrive.
    ///
    /// Writes acknowledged to this client are not repeated here. A
    /// subscriber that falls too far behind skips the oldest changes.
    pub fn parameter_updates(&self) -> impl Stream<Item = ParameterDescriptor> + Send + 'static {
        BroadcastStream::new(self.cache.subscribe())
            .filter_map(|update| futures::future::ready(update.ok()))
    }

    /// Last known descriptor, without a round trip.
    pub fn cached_parameter(&self, id: &str) -> Option<ParameterDescriptor> {
        self.cache.last_known(id)
    }

    /// Everything cached so far, including device-pushed updates.
    pub fn cached_parameter_set(&self) -> ParameterSet {
        self.cache.snapshot()
    }

    pub async fn operation_mode(&self) -> Result<OperationMode> {
        let descriptor = self.get_parameter(ids::OPERATION_MODE).await?;
        OperationMode::try_from(&descriptor.current)
    }

    pub async fn set_operation_mode(&self, mode: OperationMode) -> Result<()> {
        info!(%mode, "Changing operation mode");
        self.set_parameter(ids::OPERATION_MODE, mode).await
    }

    pub async fn auto_exposure_mode(&self) -> Result<AutoMode> {
        let descriptor = self.get_parameter(ids::AUTO_EXPOSURE_MODE).await?;
        AutoMode::try_from(&descriptor.current)
    }

    pub async fn set_auto_exposure_mode(&self, mode: AutoMode) -> Result<()> {
        self.set_parameter(ids::AUTO_EXPOSURE_MODE, mode).await
    }

    /// Trigger frequency in Hz.
    pub async fn trigger_frequency(&self) -> Result<f64> {
        let descriptor = self.get_parameter(ids::TRIGGER_FREQUENCY).await?;
        descriptor.current.as_f64().ok_or_else(|| TransferError::TypeMismatch {
            id: ids::TRIGGER_FREQUENCY.to_string(),
            expected: "double".to_string(),
            found: descriptor.current.type_name().to_string(),
        })
    }

    pub async fn set_trigger_frequency(&self, hz: f64) -> Result<()> {
        self.set_parameter(ids::TRIGGER_FREQUENCY, hz).await
    }

    fn validate_all<I, S, V>(&self, writes: I) -> Result<Vec<(String, ParameterValue)>>
    where
        I: IntoIterator<Item = (S, V)>,
        S: Into<String>,
        V: Into<ParameterValue>,
    {
        writes
            .into_iter()
            .map(|(id, value)| {
                let id = id.into();
                let value = self.validate_locally(&id, value.into())?;
                Ok((id, value))
            })
            .collect()
    }

    fn validate_locally(&self, id: &str, value: ParameterValue) -> Result<ParameterValue> {
        match self.cache.lookup(id, self.session.generation()) {
            CacheLookup::Current(descriptor) => descriptor.validate(value),
            CacheLookup::Unknown => Err(TransferError::UnknownParameter { id: id.to_string() }),
            CacheLookup::Unavailable => Ok(value),
        }
    }

    async fn send_set(&self, id: &str, value: ParameterValue) -> Result<()> {
        let op = ParameterOp::Set { id: id.to_string(), value };
        let (body, generation) = self.request(op, id).await?;
        match body {
            ResponseBody::Ack(descriptor) => {
                debug!(id, value = %descriptor.current, "Parameter write acknowledged");
                self.cache.upsert(descriptor, generation);
                Ok(())
            }
            other => Err(unexpected(id, &other)),
        }
    }

    /// One round trip; device-reported errors are mapped to local variants.
    ///
    /// Sending and waiting for the reply share one `request_timeout` budget,
    /// so a device that stops reading cannot stall the caller.
    async fn request(&self, op: ParameterOp, id: &str) -> Result<(ResponseBody, u64)> {
        let (transport, generation) = self.session.wait_live(self.request_timeout).await?;
        let deadline = Instant::now() + self.request_timeout;
        let (request_id, reply) = self.pending.register(self.request_timeout);
        let timed_out = || {
            self.pending.cancel(request_id);
            TransferError::RequestTimeout { request_id, duration: self.request_timeout }
        };
        let frame = match (ParameterRequest { request_id, op }).to_frame() {
            Ok(frame) => frame,
            Err(err) => {
                self.pending.cancel(request_id);
                return Err(err);
            }
        };

        match tokio::time::timeout_at(deadline, transport.send(frame)).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                self.pending.cancel(request_id);
                warn!(request_id, error = %err, "Parameter request could not be sent");
                return Err(TransferError::connection_lost(err.to_string()));
            }
            Err(_) => {
                warn!(request_id, "Parameter request stuck in send");
                return Err(timed_out());
            }
        }

        let body = match tokio::time::timeout_at(deadline, reply).await {
            Ok(Ok(result)) => result?,
            Ok(Err(_)) => return Err(TransferError::connection_lost("session ended")),
            Err(_) => return Err(timed_out()),
        };

        match body {
            ResponseBody::Error { kind, id: remote_id, message } => {
                let id = if remote_id.is_empty() { id.to_string() } else { remote_id };
                Err(kind.into_error(id, message))
            }
            body => Ok((body, generation)),
        }
    }
}

fn unexpected(id: &str, body: &ResponseBody) -> TransferError {
    let kind = match body {
        ResponseBody::Descriptor(_) => "descriptor",
        ResponseBody::Listing(_) => "listing",
        ResponseBody::Ack(_) => "ack",
        ResponseBody::Error { .. } => "error",
        ResponseBody::Update(_) => "update",
        ResponseBody::BatchAck(_) => "batch ack",
        ResponseBody::Persisted(_) => "persisted",
    };
    TransferError::malformed(format!("unexpected {kind} response for '{id}'"))
}
