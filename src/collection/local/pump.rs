use std::pin::pin;
use std::time::Instant;

use futures::future::{self, Either};
use futures::StreamExt;

use crate::collection::error::{unavailable, CollectionError};
use crate::collection::local::multiplexer::{MultiplexerInner, MultiplexerRef};
use crate::collection::model::{CollectionKey, CREATED_AT_FIELD};
use crate::collection::remote::{
    OrderDirection, RemoteCollectionSourceArc, SourceEvent, SourceStream,
};
use crate::platform::runtime;
use crate::util::backoff::{Backoff, BackoffSettings};

/// Messages the multiplexer sends to a key's pump.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Control {
    /// Deliver queued notices.
    Flush,
    /// Close the upstream subscription and exit.
    Stop,
}

enum PumpEvent {
    Upstream(Option<SourceEvent>),
    RetryDue,
    Control(Option<Control>),
}

/// Per-key event loop.
///
/// Owns the upstream stream for one key, feeds its events into the shared
/// cache, reconnects with backoff after failures and delivers every observer
/// callback for the key.
pub(crate) struct Pump {
    multiplexer: MultiplexerRef,
    source: RemoteCollectionSourceArc,
    backoff: Backoff,
    key: CollectionKey,
    generation: u64,
    control: async_channel::Receiver<Control>,
}

impl Pump {
    pub(crate) fn new(
        multiplexer: MultiplexerRef,
        source: RemoteCollectionSourceArc,
        backoff: BackoffSettings,
        key: CollectionKey,
        generation: u64,
        control: async_channel::Receiver<Control>,
    ) -> Self {
        Self {
            multiplexer,
            source,
            backoff: Backoff::new(backoff),
            key,
            generation,
            control,
        }
    }

    pub(crate) async fn run(mut self) {
        let mut upstream: Option<SourceStream> = None;
        let mut retry_at = Some(Instant::now());

        loop {
            if upstream.is_none() && retry_at.is_some_and(|at| at <= Instant::now()) {
                retry_at = None;
                match self
                    .source
                    .subscribe(&self.key, CREATED_AT_FIELD, OrderDirection::Descending)
                    .await
                {
                    Ok(stream) => {
                        log::debug!("upstream subscription for {} opened", self.key);
                        upstream = Some(stream);
                        let opened = self.with_multiplexer(|inner, key, generation| {
                            inner.upstream_opened(key, generation)
                        });
                        if !opened {
                            break;
                        }
                    }
                    Err(error) => {
                        retry_at = self.schedule_retry(&error);
                        if !self.report_failure(error) {
                            break;
                        }
                    }
                }
                continue;
            }

            let event = next_event(&mut upstream, retry_at, &self.control).await;
            match event {
                PumpEvent::Upstream(Some(Ok(documents))) => {
                    self.backoff.reset();
                    let applied = self.with_multiplexer(|inner, key, generation| {
                        inner.apply_upstream(key, generation, documents)
                    });
                    if !applied {
                        break;
                    }
                }
                PumpEvent::Upstream(Some(Err(error))) => {
                    upstream = None;
                    retry_at = self.schedule_retry(&error);
                    if !self.report_failure(error) {
                        break;
                    }
                }
                PumpEvent::Upstream(None) => {
                    upstream = None;
                    let error = unavailable(format!(
                        "Upstream subscription for {} ended unexpectedly",
                        self.key
                    ));
                    retry_at = self.schedule_retry(&error);
                    if !self.report_failure(error) {
                        break;
                    }
                }
                PumpEvent::RetryDue | PumpEvent::Control(Some(Control::Flush)) => {}
                PumpEvent::Control(Some(Control::Stop)) | PumpEvent::Control(None) => break,
            }

            if !self.flush() {
                break;
            }
        }

        if upstream.take().is_some() {
            log::debug!("upstream subscription for {} closed", self.key);
        }
    }

    /// Next reconnect time, or `None` when `error` is final or attempts ran out.
    fn schedule_retry(&mut self, error: &CollectionError) -> Option<Instant> {
        if !error.is_retryable() {
            log::warn!(
                "upstream subscription for {} failed with {}; not reconnecting",
                self.key,
                error.code_str()
            );
            return None;
        }
        match self.backoff.next_delay() {
            Some(delay) => {
                log::warn!(
                    "reconnecting upstream subscription for {} in {delay:?} (attempt {})",
                    self.key,
                    self.backoff.attempts()
                );
                Some(Instant::now() + delay)
            }
            None => {
                log::warn!(
                    "upstream subscription for {} exhausted {} reconnect attempts",
                    self.key,
                    self.backoff.attempts()
                );
                None
            }
        }
    }

    fn report_failure(&self, error: CollectionError) -> bool {
        self.with_multiplexer(|inner, key, generation| inner.fail_upstream(key, generation, error))
            && self.flush()
    }

    fn flush(&self) -> bool {
        self.with_multiplexer(|inner, key, generation| inner.flush(key, generation))
    }

    /// `false` once the multiplexer or this pump's entry is gone.
    fn with_multiplexer<F>(&self, f: F) -> bool
    where
        F: FnOnce(&MultiplexerInner, &CollectionKey, u64) -> bool,
    {
        match self.multiplexer.upgrade() {
            Some(inner) => f(&inner, &self.key, self.generation),
            None => false,
        }
    }
}

async fn next_event(
    upstream: &mut Option<SourceStream>,
    retry_at: Option<Instant>,
    control: &async_channel::Receiver<Control>,
) -> PumpEvent {
    let upstream_event = pin!(async {
        match (upstream.as_mut(), retry_at) {
            (Some(stream), _) => PumpEvent::Upstream(stream.next().await),
            (None, Some(at)) => {
                runtime::sleep(at.saturating_duration_since(Instant::now())).await;
                PumpEvent::RetryDue
            }
            (None, None) => future::pending::<PumpEvent>().await,
        }
    });
    let control_event = pin!(async { PumpEvent::Control(control.recv().await.ok()) });

    match future::select(upstream_event, control_event).await {
        Either::Left((event, _)) | Either::Right((event, _)) => event,
    }
}
