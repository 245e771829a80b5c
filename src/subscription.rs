//! # Live Queries & Change Notification
//!
//! A live query is a registered query that keeps delivering fresh results as
//! the tables it depends on change.
//!
//! ## Delivery Pattern
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────────────┐
//! │ subscribe("employee.all")                                              │
//! │     │                                                                  │
//! │     ├── evaluate now ──────────────────────────► initial result         │
//! │     │                                                                  │
//! │ COMMIT (written = {employee, car})                                     │
//! │     │                                                                  │
//! │     ├── depends on a written table? ── no ──► skip                     │
//! │     │        │ yes                                                     │
//! │     │        ▼                                                         │
//! │     ├── re-evaluate on the committing connection                       │
//! │     │        │                                                         │
//! │     │        ▼                                                         │
//! │     └── equal to last delivery? ── yes ──► skip                        │
//! │              │ no                                                      │
//! │              ▼                                                         │
//! │         deliver, remember as last                                      │
//! └────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Re-evaluation runs right after `COMMIT` on the connection that committed,
//! so each delivery reflects exactly the committed state and deliveries for
//! one subscription arrive in commit order. Rolled-back transactions never
//! reach the notifier.
//!
//! ## Failures and Cancellation
//!
//! - A failed re-evaluation is delivered as [`LiveResult::Failed`]. The
//!   subscription stays active and the next successful evaluation is always
//!   delivered.
//! - [`LiveQuery::cancel`] (or dropping the [`LiveQuery`]) stops delivery. A
//!   result produced concurrently with the cancel is discarded, so nothing is
//!   observed after cancel returns.
//!
//! ## Rust Concepts
//!
//! - **`tokio::sync::mpsc::unbounded_channel`**: the notifier runs on the
//!   writer thread and must never block on a slow consumer.
//! - **`Stream` trait**: a [`LiveQuery`] is also a `futures::Stream`, so it
//!   composes with stream combinators.

use std::collections::BTreeSet;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::Stream;
use rusqlite::Connection;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use crate::error::{Error, Result};
use crate::mapper::{FromRow, FromValue};
use crate::query::{compile, Args, Cardinality, PreparedStatement};
use crate::schema::SchemaRegistry;
use crate::types::{Row, Value};

// =============================================================================
// Results
// =============================================================================

/// One delivery of a live query.
#[derive(Debug)]
pub enum LiveResult<T> {
    /// The current result.
    Value(T),
    /// A single-row or scalar query currently matches nothing.
    Absent,
    /// Evaluating or decoding the query failed.
    Failed(Error),
}

impl<T> LiveResult<T> {
    /// Converts into a `Result`, mapping `Absent` to `None`.
    pub fn into_result(self) -> Result<Option<T>> {
        match self {
            Self::Value(v) => Ok(Some(v)),
            Self::Absent => Ok(None),
            Self::Failed(e) => Err(e),
        }
    }

    pub fn is_absent(&self) -> bool {
        matches!(self, Self::Absent)
    }
}

/// What the notifier hands to a subscriber before decoding.
#[derive(Debug)]
pub(crate) enum Delivery {
    Rows(Vec<Row>),
    Failed(Error),
}

type Decoder<T> = fn(&[Row]) -> Result<Option<T>>;

fn decode_many<T: FromRow>(rows: &[Row]) -> Result<Option<Vec<T>>> {
    rows.iter().map(T::from_row).collect::<Result<Vec<_>>>().map(Some)
}

fn decode_one<T: FromRow>(rows: &[Row]) -> Result<Option<T>> {
    rows.first().map(T::from_row).transpose()
}

fn decode_value<V: FromValue>(rows: &[Row]) -> Result<Option<V>> {
    let Some(row) = rows.first() else {
        return Ok(None);
    };
    match row.values().first() {
        None | Some(Value::Null) => Ok(None),
        Some(value) => {
            let column = row.columns().first().map(String::as_str).unwrap_or("value");
            V::from_value(value, column).map(Some)
        }
    }
}

// =============================================================================
// Cancellation
// =============================================================================

/// Cancels a live query from anywhere. Cloneable and `Send`.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    cancelled: Arc<AtomicBool>,
}

impl CancelHandle {
    fn new() -> Self {
        Self {
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

// =============================================================================
// Live Query
// =============================================================================

/// A subscription to a registered query.
///
/// # Example
///
/// ```rust,ignore
/// let mut live = db.observe_many::<Employee>("employee.all", &Args::new())?;
/// while let Some(result) = live.next().await {
///     match result {
///         LiveResult::Value(employees) => render(&employees),
///         LiveResult::Absent => {}
///         LiveResult::Failed(e) => eprintln!("refresh failed: {e}"),
///     }
/// }
/// ```
pub struct LiveQuery<T> {
    query: String,
    receiver: mpsc::UnboundedReceiver<Delivery>,
    handle: CancelHandle,
    decode: Decoder<T>,
}

impl<T> LiveQuery<T> {
    fn new(query: &str, receiver: mpsc::UnboundedReceiver<Delivery>, handle: CancelHandle, decode: Decoder<T>) -> Self {
        Self {
            query: query.to_string(),
            receiver,
            handle,
            decode,
        }
    }

    /// Name of the observed query.
    pub fn query(&self) -> &str {
        &self.query
    }

    /// Waits for the next delivery. Returns `None` once cancelled or once the
    /// database has shut down.
    pub async fn next(&mut self) -> Option<LiveResult<T>> {
        if self.handle.is_cancelled() {
            return None;
        }
        let delivery = self.receiver.recv().await?;
        self.accept(delivery)
    }

    /// Returns the next delivery if one is already queued.
    pub fn try_next(&mut self) -> Option<LiveResult<T>> {
        if self.handle.is_cancelled() {
            return None;
        }
        let delivery = self.receiver.try_recv().ok()?;
        self.accept(delivery)
    }

    /// Blocking variant of [`next`](Self::next) for synchronous callers.
    ///
    /// Panics if called from within an async runtime.
    pub fn blocking_next(&mut self) -> Option<LiveResult<T>> {
        if self.handle.is_cancelled() {
            return None;
        }
        let delivery = self.receiver.blocking_recv()?;
        self.accept(delivery)
    }

    /// Stops delivery. Idempotent.
    pub fn cancel(&mut self) {
        self.handle.cancel();
        self.receiver.close();
    }

    pub fn is_cancelled(&self) -> bool {
        self.handle.is_cancelled()
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.handle.clone()
    }

    fn accept(&self, delivery: Delivery) -> Option<LiveResult<T>> {
        // A result produced before a concurrent cancel may still be queued.
        if self.handle.is_cancelled() {
            return None;
        }
        Some(match delivery {
            Delivery::Rows(rows) => match (self.decode)(&rows) {
                Ok(Some(value)) => LiveResult::Value(value),
                Ok(None) => LiveResult::Absent,
                Err(e) => LiveResult::Failed(e),
            },
            Delivery::Failed(e) => LiveResult::Failed(e),
        })
    }
}

impl<T> Stream for LiveQuery<T> {
    type Item = LiveResult<T>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.handle.is_cancelled() {
            return Poll::Ready(None);
        }
        match self.receiver.poll_recv(cx) {
            Poll::Ready(Some(delivery)) => Poll::Ready(self.accept(delivery)),
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl<T> Drop for LiveQuery<T> {
    fn drop(&mut self) {
        self.handle.cancel();
    }
}

impl<T> std::fmt::Debug for LiveQuery<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LiveQuery")
            .field("query", &self.query)
            .field("cancelled", &self.handle.is_cancelled())
            .finish()
    }
}

// =============================================================================
// Change Notifier
// =============================================================================

struct Subscription {
    id: u64,
    query: String,
    statement: PreparedStatement,
    dependencies: BTreeSet<String>,
    last: Option<Vec<Row>>,
    sender: mpsc::UnboundedSender<Delivery>,
    handle: CancelHandle,
}

impl Subscription {
    fn is_live(&self) -> bool {
        !self.handle.is_cancelled() && !self.sender.is_closed()
    }

    /// Evaluates and delivers if the result differs from the last delivery.
    fn refresh(&mut self, conn: &Connection) {
        match self.statement.query_rows(conn) {
            Ok(rows) => {
                if self.last.as_ref() == Some(&rows) {
                    trace!(id = self.id, query = %self.query, "result unchanged");
                    return;
                }
                if self.handle.is_cancelled() {
                    return;
                }
                self.last = Some(rows.clone());
                let _ = self.sender.send(Delivery::Rows(rows));
            }
            Err(e) => {
                warn!(id = self.id, query = %self.query, error = %e, "live query evaluation failed");
                self.last = None;
                if !self.handle.is_cancelled() {
                    let _ = self.sender.send(Delivery::Failed(e));
                }
            }
        }
    }
}

/// Tracks live queries and re-evaluates them after each commit.
///
/// Owned by the connection that performs writes.
#[derive(Default)]
pub struct ChangeNotifier {
    subscriptions: Vec<Subscription>,
    next_id: u64,
}

impl ChangeNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribes to a row-returning query decoded as `Vec<T>`.
    pub(crate) fn observe_many<T: FromRow>(
        &mut self,
        conn: &Connection,
        schema: &SchemaRegistry,
        query: &str,
        args: &Args,
    ) -> Result<LiveQuery<Vec<T>>> {
        schema.query(query)?.expect_rows::<T>(Cardinality::Many)?;
        self.subscribe(conn, schema, query, args, decode_many::<T>)
    }

    /// Subscribes to a single-row query decoded as `T`.
    pub(crate) fn observe_one<T: FromRow>(
        &mut self,
        conn: &Connection,
        schema: &SchemaRegistry,
        query: &str,
        args: &Args,
    ) -> Result<LiveQuery<T>> {
        schema.query(query)?.expect_rows::<T>(Cardinality::One)?;
        self.subscribe(conn, schema, query, args, decode_one::<T>)
    }

    /// Subscribes to a scalar query.
    pub(crate) fn observe_value<V: FromValue>(
        &mut self,
        conn: &Connection,
        schema: &SchemaRegistry,
        query: &str,
        args: &Args,
    ) -> Result<LiveQuery<V>> {
        schema.query(query)?.expect_value()?;
        self.subscribe(conn, schema, query, args, decode_value::<V>)
    }

    fn subscribe<T>(
        &mut self,
        conn: &Connection,
        schema: &SchemaRegistry,
        query: &str,
        args: &Args,
        decode: Decoder<T>,
    ) -> Result<LiveQuery<T>> {
        let descriptor = schema.query(query)?;
        let statement = compile(descriptor, args)?;

        let (sender, receiver) = mpsc::unbounded_channel();
        let handle = CancelHandle::new();
        let id = self.next_id;
        self.next_id += 1;

        let mut subscription = Subscription {
            id,
            query: query.to_string(),
            statement,
            dependencies: descriptor.dependencies().clone(),
            last: None,
            sender,
            handle: handle.clone(),
        };
        subscription.refresh(conn);

        debug!(id, query, tables = ?subscription.dependencies, "live query subscribed");
        self.subscriptions.retain(Subscription::is_live);
        self.subscriptions.push(subscription);

        Ok(LiveQuery::new(query, receiver, handle, decode))
    }

    /// Re-evaluates every live query that depends on a written table.
    pub(crate) fn on_commit(&mut self, conn: &Connection, written: &BTreeSet<String>) {
        if written.is_empty() {
            return;
        }
        self.subscriptions.retain(Subscription::is_live);

        for subscription in &mut self.subscriptions {
            if subscription.dependencies.is_disjoint(written) {
                continue;
            }
            subscription.refresh(conn);
        }
    }

    /// Number of subscriptions not yet cancelled.
    pub fn active(&self) -> usize {
        self.subscriptions.iter().filter(|s| s.is_live()).count()
    }
}

// =============================================================================
// Tests
// =============================================================================
