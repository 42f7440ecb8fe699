// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! TCP photoelectric link.
//!
//! One connection attempt per device at initialization; there is no
//! auto-reconnect. A dead link stays dead until the engine is rebuilt,
//! and every send against it fails fast.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use crate::link::{LinkConnector, LinkInbound, PeLink};

const READ_BUF_SIZE: usize = 1024;

/// A live TCP connection to one photoelectric device.
pub struct TcpLink {
    device: String,
    connected: Arc<AtomicBool>,
    writer: Mutex<OwnedWriteHalf>,
}

impl TcpLink {
    /// Dial the device and spawn its reader task.
    ///
    /// The reader forwards raw chunks into `inbound` and reports the
    /// terminal connection transition when the socket dies or shutdown
    /// is requested.
    pub async fn connect(
        device: &str,
        address: &str,
        port: u16,
        inbound: mpsc::Sender<LinkInbound>,
        shutdown: CancellationToken,
    ) -> anyhow::Result<Arc<Self>> {
        let stream = TcpStream::connect((address, port)).await?;
        stream.set_nodelay(true)?;
        let (mut reader, writer) = stream.into_split();

        let link = Arc::new(Self {
            device: device.to_owned(),
            connected: Arc::new(AtomicBool::new(true)),
            writer: Mutex::new(writer),
        });

        let connected = Arc::clone(&link.connected);
        let name = link.device.clone();
        tokio::spawn(async move {
            let mut buf = [0u8; READ_BUF_SIZE];
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    read = reader.read(&mut buf) => match read {
                        Ok(0) => {
                            tracing::warn!(device = %name, "link closed by peer");
                            break;
                        }
                        Ok(n) => {
                            let chunk = Bytes::copy_from_slice(&buf[..n]);
                            if inbound
                                .send(LinkInbound::Data { device: name.clone(), chunk })
                                .await
                                .is_err()
                            {
                                break;
                            }
                        }
                        Err(e) => {
                            tracing::warn!(device = %name, err = %e, "link read failed");
                            break;
                        }
                    },
                }
            }
            if connected.swap(false, Ordering::SeqCst) {
                let _ = inbound
                    .send(LinkInbound::Connection { device: name.clone(), connected: false })
                    .await;
            }
        });

        Ok(link)
    }
}

impl PeLink for TcpLink {
    fn device(&self) -> &str {
        &self.device
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn send(&self, frame: Bytes) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
        Box::pin(async move {
            if !self.is_connected() {
                anyhow::bail!("device {} is disconnected", self.device);
            }
            let mut writer = self.writer.lock().await;
            if let Err(e) = writer.write_all(&frame).await {
                self.connected.store(false, Ordering::SeqCst);
                tracing::warn!(device = %self.device, err = %e, "link write failed");
                return Err(e.into());
            }
            Ok(())
        })
    }
}

/// Production connector that dials [`TcpLink`]s.
pub struct TcpConnector;

impl LinkConnector for TcpConnector {
    fn connect(
        &self,
        device: &str,
        address: &str,
        port: u16,
        inbound: mpsc::Sender<LinkInbound>,
        shutdown: CancellationToken,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Arc<dyn PeLink>>> + Send + '_>> {
        let device = device.to_owned();
        let address = address.to_owned();
        Box::pin(async move {
            let link = TcpLink::connect(&device, &address, port, inbound, shutdown).await?;
            Ok(link as Arc<dyn PeLink>)
        })
    }
}
