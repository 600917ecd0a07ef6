//! Supervisor: wires the three concurrent activities together and owns the
//! shutdown order. The BACnet engine runs on its own OS thread; the MQTT
//! stream, translator loop, and fault tick share the tokio runtime.

use std::thread;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::watch;
use tokio::time;
use tracing::{debug, error, info, warn};

use crate::bacnet::transport::{TransportError, UdpTransport};
use crate::bacnet::{Engine, EngineHandle};
use crate::config::GatewayConfig;
use crate::mqtt::{SensorStream, StreamError};
use crate::translator;

/// Cadence of the staleness scan.
const FAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Stream(#[from] StreamError),
    #[error("failed to spawn the BACnet thread: {0}")]
    Spawn(std::io::Error),
    #[error("sensor stream closed unexpectedly")]
    StreamClosed,
}

pub struct BacPropagator {
    config: GatewayConfig,
}

impl BacPropagator {
    pub fn new(config: GatewayConfig) -> Self {
        Self { config }
    }

    pub async fn run(self) -> Result<(), ServiceError> {
        // Bind first: a taken port is a fatal startup error.
        let transport =
            UdpTransport::bind(self.config.bacnet.bind_addr, self.config.bacnet.port)?;
        info!(
            addr = %self.config.bacnet.bind_addr,
            port = self.config.bacnet.port,
            "BACnet/IP endpoint bound"
        );
        let (engine, handle) = Engine::new(
            transport,
            self.config.bacnet.network,
            self.config.fault_timeout(),
        );
        let bacnet_thread = thread::Builder::new()
            .name("bacnet".into())
            .spawn(move || engine.run())
            .map_err(ServiceError::Spawn)?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let mut stream = match SensorStream::connect(&self.config.mqtt, shutdown_rx.clone()).await
        {
            Ok(stream) => stream,
            Err(error) => {
                // Tear the engine back down before reporting the fatal error.
                handle.shutdown();
                join_engine(bacnet_thread);
                return Err(error.into());
            }
        };

        let fault_task = spawn_fault_sweeper(handle.clone(), shutdown_rx.clone());

        info!("starting stream receive loop");
        let result = self.translate_loop(&mut stream, &handle).await;

        let _ = shutdown_tx.send(true);
        info!("stopping stream loop");
        stream.stop().await;
        let _ = fault_task.await;

        info!("closing bacnet sensor network");
        handle.shutdown();
        join_engine(bacnet_thread);
        result
    }

    /// Feed validated readings into the engine until shutdown.
    async fn translate_loop(
        &self,
        stream: &mut SensorStream,
        handle: &EngineHandle,
    ) -> Result<(), ServiceError> {
        loop {
            tokio::select! {
                record = stream.next() => match record {
                    Some(record) => match translator::translate(&record) {
                        Ok(reading) => {
                            debug!(
                                sensor = reading.sensor_id,
                                fields = reading.values.len(),
                                "forwarding reading"
                            );
                            handle.ingest(reading);
                        }
                        Err(error) => warn!(%error, "rejected sensor record"),
                    },
                    None => {
                        error!("sensor stream ended without a shutdown request");
                        return Err(ServiceError::StreamClosed);
                    }
                },
                signal = tokio::signal::ctrl_c() => {
                    if let Err(error) = signal {
                        warn!(%error, "could not listen for interrupts");
                    }
                    info!("interrupt received, shutting down");
                    return Ok(());
                }
            }
        }
    }
}

fn spawn_fault_sweeper(
    handle: EngineHandle,
    mut shutdown: watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        info!("starting fault check loop");
        let mut interval = time::interval(FAULT_SWEEP_INTERVAL);
        loop {
            tokio::select! {
                _ = interval.tick() => handle.sweep_faults(),
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        debug!("fault check loop finished");
    })
}

fn join_engine(bacnet_thread: thread::JoinHandle<()>) {
    if bacnet_thread.join().is_err() {
        error!("BACnet thread panicked during shutdown");
    }
}
