//! The wire below the converters, and an in-memory recording transport for tests

use core::time::Duration;
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use compact_str::CompactString;
use kitsune_common::{Entity, Patch};
use serde_json::Value;

use crate::converter::{Reporting, WireOp};

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("{target} did not respond")]
    Timeout { target: Entity },
    #[error("{target} rejected the request: {status}")]
    Rejected { target: Entity, status: CompactString },
    #[error("transport unavailable: {0}")]
    Unavailable(String),
}

/// The network below the converters
#[async_trait]
pub trait Transport: Send + Sync {
    async fn read(
        &self,
        target: &Entity,
        cluster: &str,
        attributes: &[CompactString],
        manufacturer_code: Option<u16>,
    ) -> Result<(), TransportError>;

    async fn write(
        &self,
        target: &Entity,
        cluster: &str,
        attributes: &Patch,
        manufacturer_code: Option<u16>,
    ) -> Result<(), TransportError>;

    async fn command(
        &self,
        target: &Entity,
        cluster: &str,
        command: &str,
        payload: &Value,
        manufacturer_code: Option<u16>,
    ) -> Result<(), TransportError>;

    async fn bind(&self, target: &Entity, cluster: &str, destination: &Entity) -> Result<(), TransportError>;

    async fn configure_reporting(
        &self,
        target: &Entity,
        cluster: &str,
        reporting: &[Reporting],
    ) -> Result<(), TransportError>;

    async fn execute(&self, op: &WireOp) -> Result<(), TransportError> {
        tracing::trace!(?op, "executing wire operation");

        match op {
            WireOp::Read { target, cluster, attributes, manufacturer_code } => {
                self.read(target, cluster, attributes, *manufacturer_code).await
            }
            WireOp::Write { target, cluster, attributes, manufacturer_code } => {
                self.write(target, cluster, attributes, *manufacturer_code).await
            }
            WireOp::Command { target, cluster, command, payload, manufacturer_code } => {
                self.command(target, cluster, command, payload, *manufacturer_code)
                    .await
            }
            WireOp::Bind { target, cluster, destination } => {
                self.bind(target, cluster, destination).await
            }
            WireOp::ConfigureReporting { target, cluster, reporting } => {
                self.configure_reporting(target, cluster, reporting).await
            }
        }
    }
}

/// In-memory transport that records every operation; clusters can be made slow or failing
#[derive(Debug, Default)]
pub struct RecordingTransport {
    ops: Mutex<Vec<WireOp>>,
    failing: Mutex<Vec<CompactString>>,
    delays: Mutex<Vec<(CompactString, Duration)>>,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every later operation on `cluster` fails with [`TransportError::Timeout`]
    pub fn fail_cluster(&self, cluster: &str) {
        self.failing
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(cluster.into());
    }

    /// Every later operation on `cluster` takes `delay` to complete
    pub fn delay_cluster(&self, cluster: &str, delay: Duration) {
        self.delays
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((cluster.into(), delay));
    }

    pub fn ops(&self) -> Vec<WireOp> {
        self.ops.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    async fn record(&self, op: WireOp) -> Result<(), TransportError> {
        let delay = self
            .delays
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|(cluster, _)| cluster == op.cluster())
            .map(|(_, delay)| *delay);

        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let failing = self
            .failing
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .any(|cluster| cluster == op.cluster());

        if failing {
            return Err(TransportError::Timeout { target: op.target().clone() });
        }

        self.ops.lock().unwrap_or_else(PoisonError::into_inner).push(op);
        Ok(())
    }
}

#[async_trait]
impl Transport for RecordingTransport {
    async fn read(
        &self,
        target: &Entity,
        cluster: &str,
        attributes: &[CompactString],
        manufacturer_code: Option<u16>,
    ) -> Result<(), TransportError> {
        self.record(WireOp::Read {
            target: target.clone(),
            cluster: cluster.into(),
            attributes: attributes.to_vec(),
            manufacturer_code,
        })
        .await
    }

    async fn write(
        &self,
        target: &Entity,
        cluster: &str,
        attributes: &Patch,
        manufacturer_code: Option<u16>,
    ) -> Result<(), TransportError> {
        self.record(WireOp::Write {
            target: target.clone(),
            cluster: cluster.into(),
            attributes: attributes.clone(),
            manufacturer_code,
        })
        .await
    }

    async fn command(
        &self,
        target: &Entity,
        cluster: &str,
        command: &str,
        payload: &Value,
        manufacturer_code: Option<u16>,
    ) -> Result<(), TransportError> {
        self.record(WireOp::Command {
            target: target.clone(),
            cluster: cluster.into(),
            command: command.into(),
            payload: payload.clone(),
            manufacturer_code,
        })
        .await
    }

    async fn bind(&self, target: &Entity, cluster: &str, destination: &Entity) -> Result<(), TransportError> {
        self.record(WireOp::Bind {
            target: target.clone(),
            cluster: cluster.into(),
            destination: destination.clone(),
        })
        .await
    }

    async fn configure_reporting(
        &self,
        target: &Entity,
        cluster: &str,
        reporting: &[Reporting],
    ) -> Result<(), TransportError> {
        self.record(WireOp::ConfigureReporting {
            target: target.clone(),
            cluster: cluster.into(),
            reporting: reporting.to_vec(),
        })
        .await
    }
}
