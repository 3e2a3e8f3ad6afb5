//! Shared full/incremental sync loop.
//!
//! [`SyncConnector`] wraps a [`SyncProvider`] and turns its page-level calls
//! into the [`Connector`] contract: one spawned task per run, a capacity-one
//! item channel, and a oneshot terminal value.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};

use super::cursor::Cursor;
use super::error::{ConnectorError, ConnectorResult};
use super::rate_limiter::{RateLimitConfig, RateLimiter};
use super::traits::{Connector, CredentialProvider, SyncProvider};
use super::types::*;

/// Re-enumerations allowed per sub-resource per run after its resume token
/// is reported expired.
pub const MAX_EXPIRED_TOKEN_RETRIES: u32 = 1;

/// Throttled retries of a single provider call before giving up on it.
pub const MAX_THROTTLE_RETRIES: u32 = 5;

/// Default per-item content ceiling (10 MiB).
pub const DEFAULT_MAX_CONTENT_BYTES: u64 = 10_485_760;

pub type SyncOutcome = Result<SyncComplete, ConnectorError>;

/// Item stream plus terminal value of one sync run.
///
/// Drain with [`SyncStream::next`] until it returns `None`, then call
/// [`SyncStream::finish`].
pub struct SyncStream<T> {
    items: mpsc::Receiver<T>,
    terminal: oneshot::Receiver<SyncOutcome>,
}

impl<T> SyncStream<T> {
    fn channel() -> (mpsc::Sender<T>, oneshot::Sender<SyncOutcome>, Self) {
        let (item_tx, items) = mpsc::channel(1);
        let (done_tx, terminal) = oneshot::channel();
        (item_tx, done_tx, Self { items, terminal })
    }

    /// A run that ended before it started.
    pub(crate) fn failed(err: ConnectorError) -> Self {
        let (item_tx, done_tx, stream) = Self::channel();
        drop(item_tx);
        let _ = done_tx.send(Err(err));
        stream
    }

    pub async fn next(&mut self) -> Option<T> {
        self.items.recv().await
    }

    /// Terminal value. Items still queued are dropped, which also stops a
    /// producer that is still running.
    pub async fn finish(self) -> SyncOutcome {
        let SyncStream { items, terminal } = self;
        drop(items);
        terminal.await.unwrap_or_else(|_| {
            Err(ConnectorError::SyncFailed(
                "sync task ended without reporting a result".to_string(),
            ))
        })
    }

    /// Drain every item, then read the terminal value.
    pub async fn collect(mut self) -> (Vec<T>, SyncOutcome) {
        let mut collected = Vec::new();
        while let Some(item) = self.next().await {
            collected.push(item);
        }
        let outcome = self.finish().await;
        (collected, outcome)
    }

    pub fn into_parts(self) -> (mpsc::Receiver<T>, oneshot::Receiver<SyncOutcome>) {
        (self.items, self.terminal)
    }
}

/// Things a run can push downstream.
trait Emit: Send + 'static {
    fn emit(document: RawDocument, change_type: ChangeType) -> Self;
}

impl Emit for RawDocument {
    fn emit(document: RawDocument, _change_type: ChangeType) -> Self {
        document
    }
}

impl Emit for RawDocumentChange {
    fn emit(document: RawDocument, change_type: ChangeType) -> Self {
        RawDocumentChange {
            change_type,
            document,
        }
    }
}

struct Shared<P: SyncProvider> {
    source: Source,
    provider: P,
    credentials: Arc<dyn CredentialProvider>,
    limiter: RateLimiter,
    max_content_bytes: u64,
    closed: Mutex<bool>,
}

impl<P: SyncProvider> Shared<P> {
    fn guard_open(&self) -> ConnectorResult<()> {
        if *self.closed.lock() {
            return Err(ConnectorError::Closed);
        }
        Ok(())
    }
}

/// Connector for any [`SyncProvider`].
pub struct SyncConnector<P: SyncProvider> {
    shared: Arc<Shared<P>>,
}

impl<P: SyncProvider> SyncConnector<P> {
    pub fn new(
        source: Source,
        provider: P,
        credentials: Arc<dyn CredentialProvider>,
        limits: RateLimitConfig,
        max_content_bytes: u64,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                source,
                provider,
                credentials,
                limiter: RateLimiter::new(limits),
                max_content_bytes,
                closed: Mutex::new(false),
            }),
        }
    }

    pub fn provider(&self) -> &P {
        &self.shared.provider
    }

    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.shared.limiter
    }

    pub fn source(&self) -> &Source {
        &self.shared.source
    }

    pub fn is_closed(&self) -> bool {
        *self.shared.closed.lock()
    }

    fn span(&self, mode: &'static str) -> tracing::Span {
        tracing::info_span!(
            "sync",
            source_id = %self.shared.source.id,
            connector_type = self.shared.provider.connector_type(),
            mode
        )
    }
}

#[async_trait]
impl<P: SyncProvider> Connector for SyncConnector<P> {
    fn connector_type(&self) -> &str {
        self.shared.provider.connector_type()
    }

    fn source_id(&self) -> &str {
        &self.shared.source.id
    }

    fn capabilities(&self) -> Capabilities {
        self.shared.provider.capabilities()
    }

    async fn validate(&self, cancel: &CancellationToken) -> Result<(), ConnectorError> {
        self.shared.guard_open()?;
        if !self.shared.credentials.is_authenticated() {
            return Err(ConnectorError::AuthRequired(format!(
                "no usable credential for authorization {}",
                self.shared.credentials.authorization_id()
            )));
        }

        let run = SyncRun::new(Arc::clone(&self.shared), cancel.clone());
        let provider = &self.shared.provider;
        run.call(|bearer| async move { provider.validate(&bearer).await })
            .await
    }

    fn full_sync(&self, cancel: CancellationToken) -> SyncStream<RawDocument> {
        if let Err(e) = self.shared.guard_open() {
            return SyncStream::failed(e);
        }

        let (item_tx, done_tx, stream) = SyncStream::channel();
        let run = SyncRun::new(Arc::clone(&self.shared), cancel);
        tokio::spawn(
            async move {
                info!("Starting full sync");
                let outcome = run.full_sync(&item_tx).await;
                drop(item_tx);
                report(&outcome);
                let _ = done_tx.send(outcome);
            }
            .instrument(self.span("full")),
        );
        stream
    }

    fn incremental_sync(&self, cancel: CancellationToken, cursor: &str) -> SyncStream<RawDocumentChange> {
        if let Err(e) = self.shared.guard_open() {
            return SyncStream::failed(e);
        }
        if !self.capabilities().incremental {
            return SyncStream::failed(ConnectorError::NotImplemented(format!(
                "{} incremental sync",
                self.connector_type()
            )));
        }

        let prior = match Cursor::<P::Payload>::decode(cursor) {
            Ok(prior) => prior,
            Err(e) => return SyncStream::failed(e),
        };
        if prior.is_empty() {
            return SyncStream::failed(ConnectorError::FullSyncRequired);
        }

        let (item_tx, done_tx, stream) = SyncStream::channel();
        let run = SyncRun::new(Arc::clone(&self.shared), cancel);
        tokio::spawn(
            async move {
                info!("Starting incremental sync");
                let outcome = run.incremental_sync(prior, &item_tx).await;
                drop(item_tx);
                report(&outcome);
                let _ = done_tx.send(outcome);
            }
            .instrument(self.span("incremental")),
        );
        stream
    }

    async fn watch(
        &self,
        _cancel: &CancellationToken,
    ) -> Result<mpsc::Receiver<RawDocumentChange>, ConnectorError> {
        self.shared.guard_open()?;
        Err(ConnectorError::NotImplemented(format!(
            "{} push notifications",
            self.connector_type()
        )))
    }

    fn close(&self) -> Result<(), ConnectorError> {
        let mut closed = self.shared.closed.lock();
        if !*closed {
            *closed = true;
            info!(source_id = %self.shared.source.id, "Connector closed");
        }
        Ok(())
    }
}

fn report(outcome: &SyncOutcome) {
    match outcome {
        Ok(done) => info!(
            emitted = done.stats.emitted,
            deleted = done.stats.deleted,
            filtered = done.stats.filtered,
            content_fetch_failures = done.stats.content_fetch_failures,
            content_skipped_oversize = done.stats.content_skipped_oversize,
            sub_resources_synced = done.stats.sub_resources_synced,
            sub_resources_failed = ?done.stats.sub_resources_failed,
            sub_resources_reset = ?done.stats.sub_resources_reset,
            "Sync complete"
        ),
        Err(e) if e.is_cancellation() => info!("Sync cancelled"),
        Err(e) => error!(error = %e, "Sync failed"),
    }
}

/// State of one run, owned by its task.
struct SyncRun<P: SyncProvider> {
    shared: Arc<Shared<P>>,
    cancel: CancellationToken,
    stats: SyncStats,
}

impl<P: SyncProvider> SyncRun<P> {
    fn new(shared: Arc<Shared<P>>, cancel: CancellationToken) -> Self {
        Self {
            shared,
            cancel,
            stats: SyncStats::default(),
        }
    }

    /// One provider call: rate-limit wait, fresh bearer token, cancellation,
    /// and bounded retries on throttling.
    async fn call<T, F, Fut>(&self, mut op: F) -> ConnectorResult<T>
    where
        F: FnMut(String) -> Fut,
        Fut: Future<Output = ConnectorResult<T>>,
    {
        let mut throttled = 0;
        loop {
            self.shared.limiter.wait(&self.cancel).await?;
            let bearer = self.shared.credentials.get_token(&self.cancel).await?;

            let result = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(ConnectorError::Cancelled),
                result = op(bearer) => result,
            };

            match result {
                Err(ConnectorError::RateLimited { retry_after_secs }) => {
                    self.shared.limiter.record_throttled(retry_after_secs);
                    throttled += 1;
                    if throttled > MAX_THROTTLE_RETRIES {
                        return Err(ConnectorError::RateLimited { retry_after_secs });
                    }
                }
                other => return other,
            }
        }
    }

    async fn push<T>(&self, tx: &mpsc::Sender<T>, value: T) -> ConnectorResult<()> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(ConnectorError::Cancelled),
            // A dropped receiver means nobody is listening any more.
            sent = tx.send(value) => sent.map_err(|_| ConnectorError::Cancelled),
        }
    }

    async fn list_sub_resources(&self) -> ConnectorResult<Vec<SubResource>> {
        let shared = Arc::clone(&self.shared);
        let provider = &shared.provider;
        let subs = self
            .call(|bearer| async move { provider.list_sub_resources(&bearer).await })
            .await?;
        debug!(count = subs.len(), "Listed sub-resources");
        Ok(subs)
    }

    async fn full_sync(mut self, tx: &mpsc::Sender<RawDocument>) -> SyncOutcome {
        if self.cancel.is_cancelled() {
            return Err(ConnectorError::Cancelled);
        }

        let subs = self.list_sub_resources().await?;
        let mut cursor = Cursor::<P::Payload>::new_empty();

        for sub in &subs {
            match self.enumerate(sub, tx, ChangeType::Created).await {
                Ok(token) => {
                    if let Some(token) = token {
                        cursor.set_token(&sub.id, token);
                    }
                    self.stats.sub_resources_synced += 1;
                }
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => self.soft_failure(sub, &e),
            }
        }

        self.complete(&subs, cursor)
    }

    async fn incremental_sync(
        mut self,
        prior: Cursor<P::Payload>,
        tx: &mpsc::Sender<RawDocumentChange>,
    ) -> SyncOutcome {
        if self.cancel.is_cancelled() {
            return Err(ConnectorError::Cancelled);
        }

        let subs = self.list_sub_resources().await?;
        let mut next = Cursor::<P::Payload>::new_empty();

        for sub in &subs {
            let token = prior.token(&sub.id).to_string();

            if token.is_empty() {
                debug!(sub_resource = %sub.id, "No resume token, enumerating");
                match self.enumerate(sub, tx, ChangeType::Created).await {
                    Ok(new_token) => {
                        if let Some(new_token) = new_token {
                            next.set_token(&sub.id, new_token);
                        }
                        self.stats.sub_resources_synced += 1;
                    }
                    Err(e) if e.is_fatal() => return Err(e),
                    Err(e) => self.soft_failure(sub, &e),
                }
                continue;
            }

            let mut outcome = self.follow_changes(sub, &token, tx).await.map(Some);
            let mut resets = 0;
            while let Err(ConnectorError::CursorExpired(reason)) = &outcome {
                if resets >= MAX_EXPIRED_TOKEN_RETRIES {
                    break;
                }
                resets += 1;
                warn!(
                    sub_resource = %sub.id,
                    reason = %reason,
                    "Resume token expired, re-enumerating sub-resource"
                );
                self.stats.sub_resources_reset.push(sub.id.clone());
                outcome = self.enumerate(sub, tx, ChangeType::Updated).await;
            }

            match outcome {
                Ok(new_token) => {
                    if let Some(new_token) = new_token {
                        next.set_token(&sub.id, new_token);
                    }
                    self.stats.sub_resources_synced += 1;
                }
                Err(e) if e.is_fatal() => return Err(e),
                // Dropped so the next run starts this sub-resource fresh.
                Err(e @ ConnectorError::CursorExpired(_)) => self.soft_failure(sub, &e),
                Err(e) => {
                    self.soft_failure(sub, &e);
                    next.set_token(&sub.id, token);
                }
            }
        }

        self.complete(&subs, next)
    }

    fn complete(self, subs: &[SubResource], cursor: Cursor<P::Payload>) -> SyncOutcome {
        if !subs.is_empty() && self.stats.sub_resources_failed.len() == subs.len() {
            return Err(ConnectorError::SyncFailed(format!(
                "all {} sub-resources failed",
                subs.len()
            )));
        }

        Ok(SyncComplete {
            cursor: cursor.encode(),
            stats: self.stats,
        })
    }

    fn soft_failure(&mut self, sub: &SubResource, err: &ConnectorError) {
        warn!(
            sub_resource = %sub.id,
            name = %sub.name,
            error = %err,
            "Sub-resource sync failed, continuing with the rest"
        );
        self.stats.sub_resources_failed.push(sub.id.clone());
    }

    /// Full listing of one sub-resource. Returns its resume token.
    async fn enumerate<T: Emit>(
        &mut self,
        sub: &SubResource,
        tx: &mpsc::Sender<T>,
        change_type: ChangeType,
    ) -> ConnectorResult<Option<String>> {
        let shared = Arc::clone(&self.shared);
        let provider = &shared.provider;

        let start = self
            .call(|bearer| async move { provider.start_token(&bearer, sub).await })
            .await?;

        let mut page_token: Option<String> = None;
        loop {
            let current = page_token.as_deref();
            let page = self
                .call(|bearer| async move { provider.list_page(&bearer, sub, current).await })
                .await?;
            debug!(
                sub_resource = %sub.id,
                items = page.items.len(),
                more = page.next_page.is_some(),
                "Fetched listing page"
            );

            for item in page.items {
                if let Some(document) = self.admit(item).await? {
                    self.push(tx, T::emit(document, change_type)).await?;
                    self.stats.emitted += 1;
                }
            }

            match page.next_page {
                Some(next) => page_token = Some(next),
                None => return Ok(page.resume_token.or(start)),
            }
        }
    }

    /// Change query for one sub-resource. Returns its new resume token.
    async fn follow_changes(
        &mut self,
        sub: &SubResource,
        token: &str,
        tx: &mpsc::Sender<RawDocumentChange>,
    ) -> ConnectorResult<String> {
        let shared = Arc::clone(&self.shared);
        let provider = &shared.provider;

        let mut position = token.to_string();
        loop {
            let current = position.as_str();
            let page = self
                .call(|bearer| async move { provider.changes_page(&bearer, sub, current).await })
                .await?;
            debug!(
                sub_resource = %sub.id,
                changes = page.items.len(),
                more = page.next_page.is_some(),
                "Fetched change page"
            );

            for change in page.items {
                match change {
                    RemoteChange::Removed { uri, metadata } => {
                        let document = RawDocument {
                            source_id: shared.source.id.clone(),
                            uri,
                            mime_type: String::new(),
                            content: None,
                            metadata,
                            parent_uri: None,
                        };
                        self.push(
                            tx,
                            RawDocumentChange {
                                change_type: ChangeType::Deleted,
                                document,
                            },
                        )
                        .await?;
                        self.stats.deleted += 1;
                    }
                    RemoteChange::Upsert { change_type, item } => {
                        if let Some(document) = self.admit(item).await? {
                            self.push(
                                tx,
                                RawDocumentChange {
                                    change_type,
                                    document,
                                },
                            )
                            .await?;
                            self.stats.emitted += 1;
                        }
                    }
                }
            }

            match page.next_page {
                Some(next) => position = next,
                None => return Ok(page.resume_token.unwrap_or(position)),
            }
        }
    }

    /// Inclusion filter plus content fetch.
    async fn admit(&mut self, mut item: RemoteItem) -> ConnectorResult<Option<RawDocument>> {
        if !self.shared.provider.include(&item) {
            self.stats.filtered += 1;
            debug!(uri = %item.uri, "Filtered out");
            return Ok(None);
        }

        let content = match item.inline_content.take() {
            Some(inline) => self.within_ceiling(&item.uri, inline),
            None => self.fetch_content(&item).await?,
        };

        Ok(Some(item.into_document(&self.shared.source.id, content)))
    }

    async fn fetch_content(&mut self, item: &RemoteItem) -> ConnectorResult<Option<Vec<u8>>> {
        if !self.shared.provider.capabilities().binary_content || item.content_ref.is_none() {
            return Ok(None);
        }
        if item.size.map_or(false, |size| size > self.shared.max_content_bytes) {
            self.stats.content_skipped_oversize += 1;
            debug!(uri = %item.uri, size = ?item.size, "Content above ceiling, metadata only");
            return Ok(None);
        }

        let shared = Arc::clone(&self.shared);
        let provider = &shared.provider;
        let ceiling = shared.max_content_bytes;
        match self
            .call(|bearer| async move { provider.fetch_content(&bearer, item, ceiling).await })
            .await
        {
            Ok(Some(bytes)) => Ok(self.within_ceiling(&item.uri, bytes)),
            Ok(None) => {
                self.stats.content_skipped_oversize += 1;
                debug!(uri = %item.uri, "Download passed the ceiling, metadata only");
                Ok(None)
            }
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => {
                warn!(uri = %item.uri, error = %e, "Content fetch failed, emitting metadata only");
                self.stats.content_fetch_failures += 1;
                Ok(None)
            }
        }
    }

    fn within_ceiling(&mut self, uri: &str, bytes: Vec<u8>) -> Option<Vec<u8>> {
        if bytes.len() as u64 > self.shared.max_content_bytes {
            self.stats.content_skipped_oversize += 1;
            debug!(uri = %uri, size = bytes.len(), "Content above ceiling, metadata only");
            return None;
        }
        Some(bytes)
    }
}
