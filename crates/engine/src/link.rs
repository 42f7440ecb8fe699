// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Photoelectric link abstraction: a connected device that accepts
//! command frames and delivers raw inbound bytes.

pub mod tcp;

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Inbound traffic from a device link, tagged with the device name.
#[derive(Debug)]
pub enum LinkInbound {
    /// Raw bytes as read off the wire; framing is the decoder's job.
    Data { device: String, chunk: Bytes },
    /// The link's connection state changed.
    Connection { device: String, connected: bool },
}

/// A connected photoelectric device.
///
/// Object-safe for use as `Arc<dyn PeLink>`.
pub trait PeLink: Send + Sync + 'static {
    fn device(&self) -> &str;

    fn is_connected(&self) -> bool;

    /// Write one command frame. Fails fast when disconnected; a write
    /// failure marks the link disconnected.
    fn send(&self, frame: Bytes) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>>;
}

/// Opens device links. The production implementation dials TCP; tests
/// inject scripted fakes.
pub trait LinkConnector: Send + Sync {
    fn connect(
        &self,
        device: &str,
        address: &str,
        port: u16,
        inbound: mpsc::Sender<LinkInbound>,
        shutdown: CancellationToken,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Arc<dyn PeLink>>> + Send + '_>>;
}
