//! The public driver.
//!
//! A [`MicroNir`] owns at most one negotiated connection. Operations are
//! serialized by an operation guard: starting one while another is in flight
//! fails with [`DriverError::Busy`] instead of queueing. `disconnect` is not
//! guarded; it raises the cancel signal so an in-flight operation resolves
//! promptly, then closes the link.

use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tokio::sync::{watch, MappedMutexGuard, Mutex, MutexGuard};
use tokio::task::JoinHandle;

use crate::acquisition::{raised, AcquisitionController};
use crate::config::DriverConfig;
use crate::errors::{AcquisitionError, DriverError, Result};
use crate::logging::{DiagnosticLog, LogSink};
use crate::negotiator::{negotiate, ConnectionInfo};
use crate::spectrum::Spectrum;
use crate::transport::serial::SerialOpener;
use crate::transport::{Transport, TransportDescriptor};

struct Session {
    transport: Box<dyn Transport>,
    controller: AcquisitionController,
    watcher: JoinHandle<()>,
}

async fn close_session(mut session: Session) {
    session.watcher.abort();
    session.transport.close().await;
}

/// Report a drop the driver did not ask for through the diagnostic log.
fn watch_link(
    log: DiagnosticLog,
    mut down: watch::Receiver<bool>,
    descriptor: TransportDescriptor,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        if down.wait_for(|d| *d).await.is_ok() {
            log.warn(format!(
                "Link dropped: {descriptor} ({})",
                AcquisitionError::UnexpectedDisconnect
            ));
        }
    })
}

/// Everything an operation holds while it runs.
struct ActiveOp<'a> {
    _guard: MutexGuard<'a, ()>,
    session: MappedMutexGuard<'a, Session>,
    cancel: watch::Receiver<bool>,
}

pub struct MicroNir {
    config: DriverConfig,
    log: DiagnosticLog,
    opener: Option<Arc<dyn SerialOpener>>,
    session: Mutex<Option<Session>>,
    op_guard: Mutex<()>,
    cancel: watch::Sender<bool>,
    status: StdMutex<Option<(ConnectionInfo, watch::Receiver<bool>)>>,
}

impl MicroNir {
    pub fn new(config: DriverConfig, sink: Option<LogSink>) -> Self {
        let (cancel, _) = watch::channel(false);
        Self {
            config,
            log: DiagnosticLog::new(sink),
            opener: None,
            session: Mutex::new(None),
            op_guard: Mutex::new(()),
            cancel,
            status: StdMutex::new(None),
        }
    }

    /// Use `opener` instead of the system serial ports.
    pub fn with_serial_opener(mut self, opener: Arc<dyn SerialOpener>) -> Self {
        self.opener = Some(opener);
        self
    }

    /// Replace the log sink. `None` keeps only the `log` facade.
    pub fn set_log_sink(&self, sink: Option<LogSink>) {
        self.log.set_sink(sink);
    }

    pub fn config(&self) -> &DriverConfig {
        &self.config
    }

    /// Negotiate a link, replacing any existing one.
    ///
    /// A `disconnect` issued while negotiation is still running aborts it
    /// with [`DriverError::Cancelled`] and leaves the driver disconnected.
    pub async fn connect(&self) -> Result<ConnectionInfo> {
        let _guard = self.op_guard.try_lock().map_err(|_| DriverError::Busy)?;
        self.config.validate()?;

        let old = self.session.lock().await.take();
        if let Some(old) = old {
            close_session(old).await;
        }
        self.cancel.send_replace(false);
        let mut cancel = self.cancel.subscribe();

        self.log.info(format!("Connecting via {}...", self.config.transport.kind()));
        let negotiated = tokio::select! {
            biased;
            _ = raised(&mut cancel) => Err(DriverError::Cancelled),
            result = negotiate(&self.config, self.opener.as_deref(), &self.log) => result,
        };
        let mut connection = match negotiated {
            Ok(connection) => connection,
            Err(e) => {
                self.log.error(format!("Connection failed: {e}"));
                return Err(e);
            }
        };

        let mut slot = self.session.lock().await;
        // disconnect raises the flag before it takes the slot
        if *cancel.borrow() {
            drop(slot);
            connection.transport.close().await;
            self.log.warn("Connection abandoned: disconnect requested during negotiation");
            return Err(DriverError::Cancelled);
        }

        let info = connection.info.clone();
        self.log.info(format!(
            "Connected: {} [{}] ({})",
            info.display_name, info.descriptor, info.status
        ));
        let link_state = connection.transport.link_state();
        let watcher = watch_link(self.log.clone(), link_state.clone(), info.descriptor.clone());
        *slot = Some(Session {
            transport: connection.transport,
            controller: AcquisitionController::new(&self.config, self.log.clone()),
            watcher,
        });
        self.set_status(Some((info.clone(), link_state)));
        Ok(info)
    }

    /// Cancel any in-flight operation or negotiation and release the link.
    /// Idempotent.
    pub async fn disconnect(&self) {
        self.cancel.send_replace(true);
        let taken = self.session.lock().await.take();
        self.set_status(None);
        if let Some(session) = taken {
            close_session(session).await;
            self.log.info("Disconnected.");
        }
    }

    /// Whether a link is held and has not reported a drop.
    pub fn is_connected(&self) -> bool {
        self.status
            .lock()
            .map(|s| s.as_ref().is_some_and(|(_, down)| !*down.borrow()))
            .unwrap_or(false)
    }

    pub fn connection_info(&self) -> Option<ConnectionInfo> {
        self.status
            .lock()
            .ok()
            .and_then(|s| s.as_ref().map(|(info, _)| info.clone()))
    }

    /// Acquire one spectrum. `Ok(None)` on timeout, drop or cancel.
    pub async fn scan(&self) -> Result<Option<Spectrum>> {
        let Some(mut op) = self.begin().await? else {
            return Ok(None);
        };
        let session = &mut *op.session;
        Ok(session
            .controller
            .scan(session.transport.as_mut(), &mut op.cancel)
            .await)
    }

    pub async fn set_lamp(&self, on: bool) -> Result<bool> {
        let Some(mut op) = self.begin().await? else {
            return Ok(false);
        };
        let session = &mut *op.session;
        Ok(session.controller.set_lamp(session.transport.as_mut(), on).await)
    }

    pub async fn warm_up(&self) -> Result<bool> {
        let Some(mut op) = self.begin().await? else {
            return Ok(false);
        };
        let session = &mut *op.session;
        Ok(session.controller.warm_up(session.transport.as_mut()).await)
    }

    /// Request the firmware version; the reply is only logged.
    pub async fn get_system_info(&self) -> Result<()> {
        let Some(mut op) = self.begin().await? else {
            return Ok(());
        };
        let session = &mut *op.session;
        session
            .controller
            .query_version(session.transport.as_mut(), &mut op.cancel)
            .await;
        Ok(())
    }

    /// Listen passively for `duration`; `true` if anything arrived.
    pub async fn sniff(&self, duration: Duration) -> Result<bool> {
        let Some(mut op) = self.begin().await? else {
            return Ok(false);
        };
        let session = &mut *op.session;
        Ok(session
            .controller
            .sniff(session.transport.as_mut(), duration, &mut op.cancel)
            .await)
    }

    /// Lamp off, then scan.
    pub async fn dark_reference(&self) -> Result<Option<Spectrum>> {
        let Some(mut op) = self.begin().await? else {
            return Ok(None);
        };
        self.log.info("Dark reference: lamp off");
        let session = &mut *op.session;
        session.controller.set_lamp(session.transport.as_mut(), false).await;
        Ok(session
            .controller
            .scan(session.transport.as_mut(), &mut op.cancel)
            .await)
    }

    /// Warm up, lamp on, wait for the lamp to settle, then scan.
    pub async fn white_reference(&self) -> Result<Option<Spectrum>> {
        let Some(mut op) = self.begin().await? else {
            return Ok(None);
        };
        self.log.info("White reference: warm-up + lamp on");
        let session = &mut *op.session;
        session.controller.warm_up(session.transport.as_mut()).await;
        session.controller.set_lamp(session.transport.as_mut(), true).await;

        let settle = session.controller.timeouts().lamp_settle();
        let cancelled = matches!(
            tokio::time::timeout(settle, op.cancel.wait_for(|c| *c)).await,
            Ok(Ok(_))
        );
        if cancelled {
            self.log.warn("White reference cancelled during lamp settle");
            return Ok(None);
        }
        Ok(session
            .controller
            .scan(session.transport.as_mut(), &mut op.cancel)
            .await)
    }

    /// Take the operation guard and the live session.
    ///
    /// `Ok(None)` means there is no usable link; that is logged, not raised.
    async fn begin(&self) -> Result<Option<ActiveOp<'_>>> {
        let guard = self.op_guard.try_lock().map_err(|_| DriverError::Busy)?;
        let cancel = self.cancel.subscribe();
        let slot = self.session.lock().await;
        match MutexGuard::try_map(slot, |s| s.as_mut().filter(|s| s.transport.is_alive())) {
            Ok(session) => Ok(Some(ActiveOp {
                _guard: guard,
                session,
                cancel,
            })),
            Err(_) => {
                self.log.warn("Not connected.");
                Ok(None)
            }
        }
    }

    fn set_status(&self, status: Option<(ConnectionInfo, watch::Receiver<bool>)>) {
        if let Ok(mut slot) = self.status.lock() {
            *slot = status;
        }
    }
}
