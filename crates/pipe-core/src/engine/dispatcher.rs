//! Dispatcher: entrega los eventos del feed al coordinator.
//!
//! Hace el papel de la plataforma que hospeda los triggers: una tarea tokio
//! por evento, sin pool propio, y redelivery de los errores reintentables
//! con backoff exponencial (sin límite de intentos). Los errores permanentes
//! se registran y el evento se descarta.

use std::future::Future;
use std::time::Duration;

use tokio::sync::{broadcast, oneshot};
use tokio::task::{JoinHandle, JoinSet};

use crate::config::EngineSettings;
use crate::engine::outcome::EventOutcome;
use crate::engine::PipelineCoordinator;
use crate::errors::{classify_error, ErrorClass, PipelineError};
use crate::store::{ChangeEvent, DocumentStore};

/// Backoff exponencial `initial * 2^attempt`, acotado por `max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RedeliveryPolicy {
    pub initial: Duration,
    pub max: Duration,
}

impl RedeliveryPolicy {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self { initial,
               max: max.max(initial) }
    }

    pub fn from_settings(settings: &EngineSettings) -> Self {
        Self::new(settings.retry_initial, settings.retry_max)
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.min(31)).unwrap_or(u32::MAX);
        self.initial.saturating_mul(factor).min(self.max)
    }
}

/// Contadores del ciclo de vida del dispatcher.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchStats {
    pub delivered: u64,
    pub dropped: u64,
    pub aborted: u64,
}

pub struct Dispatcher<S: DocumentStore> {
    coordinator: PipelineCoordinator<S>,
    policy: RedeliveryPolicy,
}

impl<S: DocumentStore + 'static> Dispatcher<S> {
    pub fn new(coordinator: PipelineCoordinator<S>) -> Self {
        let policy = RedeliveryPolicy::from_settings(coordinator.settings());
        Self { coordinator,
               policy }
    }

    pub fn with_policy(mut self, policy: RedeliveryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Se suscribe al feed ya (antes de devolver) y procesa eventos en una
    /// tarea de fondo hasta `DispatcherHandle::shutdown`.
    pub fn spawn(self) -> DispatcherHandle {
        let events = self.coordinator.store().subscribe();
        let (tx, rx) = oneshot::channel::<()>();
        let join = tokio::spawn(async move {
            self.run_with(events, async {
                    let _ = rx.await;
                })
                .await
        });
        DispatcherHandle { shutdown: Some(tx),
                           join }
    }

    /// Procesa eventos hasta que `shutdown` resuelva o el feed se cierre.
    pub async fn run<F>(self, shutdown: F) -> DispatchStats
        where F: Future<Output = ()>
    {
        let events = self.coordinator.store().subscribe();
        self.run_with(events, shutdown).await
    }

    async fn run_with<F>(self, mut events: broadcast::Receiver<ChangeEvent>, shutdown: F) -> DispatchStats
        where F: Future<Output = ()>
    {
        tokio::pin!(shutdown);
        let mut inflight: JoinSet<Result<EventOutcome, PipelineError>> = JoinSet::new();
        let mut stats = DispatchStats::default();

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    log::debug!("dispatcher shutting down with {} deliveries in flight", inflight.len());
                    break;
                }
                received = events.recv() => match received {
                    Ok(event) => {
                        log::trace!("dispatching {} event for {}", event.kind(), event.doc());
                        inflight.spawn(deliver(self.coordinator.clone(), self.policy, event));
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        // sin redelivery posible: esos documentos quedan parados
                        // hasta la siguiente escritura o un `drive`
                        log::error!("dispatcher lagged behind the change feed, {skipped} events lost");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        log::debug!("change feed closed");
                        break;
                    }
                },
                Some(joined) = inflight.join_next(), if !inflight.is_empty() => record(&mut stats, joined),
            }
        }

        inflight.abort_all();
        while let Some(joined) = inflight.join_next().await {
            record(&mut stats, joined);
        }
        stats
    }
}

fn record(stats: &mut DispatchStats, joined: Result<Result<EventOutcome, PipelineError>, tokio::task::JoinError>) {
    match joined {
        Ok(Ok(_)) => stats.delivered += 1,
        Ok(Err(_)) => stats.dropped += 1,
        Err(e) if e.is_cancelled() => stats.aborted += 1,
        Err(e) => {
            log::error!("delivery task panicked: {e}");
            stats.dropped += 1;
        }
    }
}

/// Entrega un evento, reintentando mientras el error sea reintentable.
async fn deliver<S>(coordinator: PipelineCoordinator<S>,
                    policy: RedeliveryPolicy,
                    event: ChangeEvent)
                    -> Result<EventOutcome, PipelineError>
    where S: DocumentStore + 'static
{
    let mut attempt: u32 = 0;
    loop {
        let err = match coordinator.handle(&event).await {
            Ok(outcome) => return Ok(outcome),
            Err(err) => err,
        };
        let doc = event.doc();
        match classify_error(&err) {
            ErrorClass::Permanent => {
                log::error!("{doc}: dropping {} event: {err}", event.kind());
                return Err(err);
            }
            ErrorClass::Contention => log::debug!("{doc}: {err}; redelivering"),
            ErrorClass::Transient => log::warn!("{doc}: attempt {} failed: {err}; redelivering", attempt + 1),
        }
        tokio::time::sleep(policy.delay(attempt)).await;
        attempt = attempt.saturating_add(1);
    }
}

/// Handle del dispatcher lanzado con `Dispatcher::spawn`.
#[derive(Debug)]
pub struct DispatcherHandle {
    shutdown: Option<oneshot::Sender<()>>,
    join: JoinHandle<DispatchStats>,
}

impl DispatcherHandle {
    /// Detiene el dispatcher (abortando las redeliveries pendientes) y
    /// devuelve sus contadores.
    pub async fn shutdown(mut self) -> DispatchStats {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        match (&mut self.join).await {
            Ok(stats) => stats,
            Err(e) => {
                log::error!("dispatcher task failed: {e}");
                DispatchStats::default()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        let p = RedeliveryPolicy::new(Duration::from_millis(100), Duration::from_millis(1000));
        assert_eq!(p.delay(0), Duration::from_millis(100));
        assert_eq!(p.delay(1), Duration::from_millis(200));
        assert_eq!(p.delay(3), Duration::from_millis(800));
        assert_eq!(p.delay(4), Duration::from_millis(1000));
        assert_eq!(p.delay(u32::MAX), Duration::from_millis(1000));
    }

    #[test]
    fn max_never_below_initial() {
        let p = RedeliveryPolicy::new(Duration::from_millis(500), Duration::from_millis(10));
        assert_eq!(p.delay(0), Duration::from_millis(500));
    }
}
