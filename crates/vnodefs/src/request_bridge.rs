//! Blocking calls over callback-style backends.
//!
//! Lowlevel backends do not return their answer; they receive a
//! [`ReplyToken`] and call one of its `reply_*` methods, possibly from a
//! different thread and possibly after the hook itself has returned. The
//! [`RequestBridge`] turns that into an ordinary blocking call: it allocates a
//! token backed by a oneshot channel, invokes the hook, and parks the calling
//! thread in `blocking_recv` until the reply arrives.
//!
//! Each call gets its own token, so concurrent requests never coordinate with
//! each other. There is no timeout: a backend that never replies and never
//! drops its token blocks the caller forever. Dropping every clone of a token
//! without replying unblocks the caller with [`BridgeError::ReplyDropped`].

use crate::backend::{BackendDirEntry, XattrReply};
use crate::error::{BackendResult, Errno, FsError};
use crate::types::{FileStat, StatVfs};
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::oneshot;
use tracing::{error, trace};

/// Shape of the answer a call expects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyKind {
    None,
    Attr,
    Entry,
    Create,
    Open,
    Buffer,
    Written,
    Link,
    Entries,
    Statfs,
    Xattr,
}

/// Payload delivered through a token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyPayload {
    None,
    Attr(FileStat),
    /// Attributes of a looked-up or newly created entry.
    Entry(FileStat),
    /// Attributes plus the open handle of a created file.
    Create { stat: FileStat, fh: u64 },
    Open { fh: u64 },
    Buffer(Vec<u8>),
    Written(usize),
    Link(String),
    Entries(Vec<BackendDirEntry>),
    Statfs(StatVfs),
    Xattr(XattrReply),
}

impl ReplyPayload {
    pub fn kind(&self) -> ReplyKind {
        match self {
            ReplyPayload::None => ReplyKind::None,
            ReplyPayload::Attr(_) => ReplyKind::Attr,
            ReplyPayload::Entry(_) => ReplyKind::Entry,
            ReplyPayload::Create { .. } => ReplyKind::Create,
            ReplyPayload::Open { .. } => ReplyKind::Open,
            ReplyPayload::Buffer(_) => ReplyKind::Buffer,
            ReplyPayload::Written(_) => ReplyKind::Written,
            ReplyPayload::Link(_) => ReplyKind::Link,
            ReplyPayload::Entries(_) => ReplyKind::Entries,
            ReplyPayload::Statfs(_) => ReplyKind::Statfs,
            ReplyPayload::Xattr(_) => ReplyKind::Xattr,
        }
    }
}

/// Error from the bridge itself, as opposed to a backend errno.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BridgeError {
    #[error("backend dropped the reply token without answering")]
    ReplyDropped,

    #[error("backend replied with {got:?}, expected {expected:?}")]
    UnexpectedPayload { expected: ReplyKind, got: ReplyKind },
}

/// Statistics for bridged calls (for observability).
#[derive(Debug, Default)]
pub struct BridgeStats {
    pub calls_started: AtomicU64,
    pub calls_completed: AtomicU64,
    pub replies_dropped: AtomicU64,
    pub duplicate_replies: AtomicU64,
}

impl BridgeStats {
    pub fn record_start(&self) {
        self.calls_started.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_complete(&self) {
        self.calls_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dropped(&self) {
        self.replies_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_duplicate(&self) {
        self.duplicate_replies.fetch_add(1, Ordering::Relaxed);
    }
}

type Reply = BackendResult<ReplyPayload>;

struct TokenInner {
    request_id: u64,
    kind: ReplyKind,
    slot: Mutex<Option<oneshot::Sender<Reply>>>,
    stats: Arc<BridgeStats>,
}

/// Single-use reply handle passed to a lowlevel hook.
///
/// Cloning is allowed so a backend can hand the token to a worker thread,
/// but exactly one reply is expected across all clones. A second reply is a
/// backend contract violation: it panics in debug builds and is logged and
/// ignored in release builds.
#[derive(Clone)]
pub struct ReplyToken {
    inner: Arc<TokenInner>,
}

impl ReplyToken {
    pub fn request_id(&self) -> u64 {
        self.inner.request_id
    }

    /// The payload shape the caller is waiting for.
    pub fn kind(&self) -> ReplyKind {
        self.inner.kind
    }

    pub fn reply(&self, reply: BackendResult<ReplyPayload>) {
        let sender = self.inner.slot.lock().take();
        match sender {
            Some(tx) => {
                trace!(request = self.inner.request_id, "reply delivered");
                // The caller is parked in blocking_recv and cannot go away.
                let _ = tx.send(reply);
            }
            None => {
                self.inner.stats.record_duplicate();
                error!(
                    request = self.inner.request_id,
                    "backend replied twice to the same request"
                );
                if cfg!(debug_assertions) {
                    panic!("request {} replied twice", self.inner.request_id);
                }
            }
        }
    }

    pub fn reply_err(&self, errno: Errno) {
        self.reply(Err(errno));
    }

    pub fn reply_none(&self) {
        self.reply(Ok(ReplyPayload::None));
    }

    pub fn reply_attr(&self, stat: FileStat) {
        self.reply(Ok(ReplyPayload::Attr(stat)));
    }

    pub fn reply_entry(&self, stat: FileStat) {
        self.reply(Ok(ReplyPayload::Entry(stat)));
    }

    pub fn reply_create(&self, stat: FileStat, fh: u64) {
        self.reply(Ok(ReplyPayload::Create { stat, fh }));
    }

    pub fn reply_open(&self, fh: u64) {
        self.reply(Ok(ReplyPayload::Open { fh }));
    }

    pub fn reply_buffer(&self, data: Vec<u8>) {
        self.reply(Ok(ReplyPayload::Buffer(data)));
    }

    pub fn reply_written(&self, count: usize) {
        self.reply(Ok(ReplyPayload::Written(count)));
    }

    pub fn reply_link(&self, target: String) {
        self.reply(Ok(ReplyPayload::Link(target)));
    }

    pub fn reply_entries(&self, entries: Vec<BackendDirEntry>) {
        self.reply(Ok(ReplyPayload::Entries(entries)));
    }

    pub fn reply_statfs(&self, stat: StatVfs) {
        self.reply(Ok(ReplyPayload::Statfs(stat)));
    }

    pub fn reply_xattr(&self, reply: XattrReply) {
        self.reply(Ok(ReplyPayload::Xattr(reply)));
    }

    /// True until a reply has been sent through any clone.
    pub fn is_pending(&self) -> bool {
        self.inner.slot.lock().is_some()
    }
}

impl fmt::Debug for ReplyToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReplyToken")
            .field("request_id", &self.inner.request_id)
            .field("kind", &self.inner.kind)
            .field("pending", &self.is_pending())
            .finish()
    }
}

/// Outcome of a bridged call: a backend errno or a bridge failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallError {
    Backend(Errno),
    Bridge(BridgeError),
}

impl From<CallError> for FsError {
    fn from(err: CallError) -> Self {
        match err {
            CallError::Backend(errno) => FsError::Backend(errno),
            CallError::Bridge(e) => FsError::Bridge(e),
        }
    }
}

/// Issues blocking calls against a callback-style backend.
#[derive(Debug, Default)]
pub struct RequestBridge {
    next_request: AtomicU64,
    stats: Arc<BridgeStats>,
}

impl RequestBridge {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stats(&self) -> &BridgeStats {
        &self.stats
    }

    /// Invoke `hook` with a fresh token and block until it is answered.
    ///
    /// `hook` may reply before returning, or hand the token to another
    /// thread and reply later. Must not be called from inside an async
    /// runtime.
    pub fn call<F>(&self, kind: ReplyKind, hook: F) -> Result<ReplyPayload, CallError>
    where
        F: FnOnce(ReplyToken),
    {
        let request_id = self.next_request.fetch_add(1, Ordering::Relaxed) + 1;
        let (tx, rx) = oneshot::channel();
        let token = ReplyToken {
            inner: Arc::new(TokenInner {
                request_id,
                kind,
                slot: Mutex::new(Some(tx)),
                stats: Arc::clone(&self.stats),
            }),
        };

        self.stats.record_start();
        trace!(request = request_id, ?kind, "bridged call");
        hook(token);

        match rx.blocking_recv() {
            Ok(Ok(payload)) => {
                self.stats.record_complete();
                if payload.kind() != kind {
                    return Err(CallError::Bridge(BridgeError::UnexpectedPayload {
                        expected: kind,
                        got: payload.kind(),
                    }));
                }
                Ok(payload)
            }
            Ok(Err(errno)) => {
                self.stats.record_complete();
                Err(CallError::Backend(errno))
            }
            Err(_closed) => {
                self.stats.record_dropped();
                error!(request = request_id, "reply token dropped without a reply");
                Err(CallError::Bridge(BridgeError::ReplyDropped))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::NodeType;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_same_thread_reply() {
        let bridge = RequestBridge::new();
        let stat = FileStat::with_type(7, NodeType::File, 0o644);
        let expected = stat.clone();

        let payload = bridge
            .call(ReplyKind::Attr, |token| token.reply_attr(stat))
            .unwrap();

        assert_eq!(payload, ReplyPayload::Attr(expected));
        assert_eq!(bridge.stats().calls_started.load(Ordering::Relaxed), 1);
        assert_eq!(bridge.stats().calls_completed.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_cross_thread_reply() {
        let bridge = RequestBridge::new();

        let payload = bridge
            .call(ReplyKind::Buffer, |token| {
                thread::spawn(move || {
                    thread::sleep(Duration::from_millis(20));
                    token.reply_buffer(b"late".to_vec());
                });
            })
            .unwrap();

        assert_eq!(payload, ReplyPayload::Buffer(b"late".to_vec()));
    }

    #[test]
    fn test_error_reply() {
        let bridge = RequestBridge::new();
        let result = bridge.call(ReplyKind::Entry, |token| token.reply_err(Errno::ENOENT));
        assert_eq!(result, Err(CallError::Backend(Errno::ENOENT)));
    }

    #[test]
    fn test_dropped_token() {
        let bridge = RequestBridge::new();
        let result = bridge.call(ReplyKind::None, drop);
        assert_eq!(result, Err(CallError::Bridge(BridgeError::ReplyDropped)));
        assert_eq!(bridge.stats().replies_dropped.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_dropped_on_other_thread() {
        let bridge = RequestBridge::new();
        let result = bridge.call(ReplyKind::None, |token| {
            thread::spawn(move || drop(token));
        });
        assert_eq!(result, Err(CallError::Bridge(BridgeError::ReplyDropped)));
    }

    #[test]
    fn test_unexpected_payload() {
        let bridge = RequestBridge::new();
        let result = bridge.call(ReplyKind::Attr, |token| token.reply_none());
        assert_eq!(
            result,
            Err(CallError::Bridge(BridgeError::UnexpectedPayload {
                expected: ReplyKind::Attr,
                got: ReplyKind::None,
            }))
        );
    }

    #[test]
    fn test_token_reports_kind_and_pending() {
        let bridge = RequestBridge::new();
        bridge
            .call(ReplyKind::Open, |token| {
                assert_eq!(token.kind(), ReplyKind::Open);
                assert!(token.is_pending());
                let clone = token.clone();
                clone.reply_open(3);
                assert!(!token.is_pending());
            })
            .unwrap();
    }

    #[test]
    fn test_request_ids_are_unique() {
        let bridge = RequestBridge::new();
        let mut ids = Vec::new();
        for _ in 0..3 {
            bridge
                .call(ReplyKind::None, |token| {
                    ids.push(token.request_id());
                    token.reply_none();
                })
                .unwrap();
        }
        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[test]
    fn test_concurrent_calls_do_not_cross() {
        let bridge = Arc::new(RequestBridge::new());
        let workers: Vec<_> = (0..8u64)
            .map(|i| {
                let bridge = Arc::clone(&bridge);
                thread::spawn(move || {
                    let payload = bridge
                        .call(ReplyKind::Written, |token| {
                            thread::spawn(move || token.reply_written(i as usize));
                        })
                        .unwrap();
                    assert_eq!(payload, ReplyPayload::Written(i as usize));
                })
            })
            .collect();
        for w in workers {
            w.join().unwrap();
        }
        assert_eq!(bridge.stats().calls_completed.load(Ordering::Relaxed), 8);
    }

    #[test]
    #[cfg_attr(debug_assertions, should_panic(expected = "replied twice"))]
    fn test_double_reply_is_a_contract_violation() {
        let bridge = RequestBridge::new();
        let stats_check = bridge
            .call(ReplyKind::None, |token| {
                token.reply_none();
                token.reply_none();
            })
            .map(|_| ());
        assert!(stats_check.is_ok());
        assert_eq!(bridge.stats().duplicate_replies.load(Ordering::Relaxed), 1);
    }
}
