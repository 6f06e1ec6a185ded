//! Remote agents: trust requests framed over a transport channel
//!
//! The requesting side lives in the stub. It keeps one session per attached
//! skeleton, keyed by the uid the skeleton runs as, and relays requests to
//! the session of the requesting user. Exchanges on a session are strictly
//! one at a time, so answers come back in request order and can never be
//! matched to the wrong caller.
//!
//! The answering side lives in the skeleton and turns every received
//! record into exactly one answer line.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::error::{AgentError, ChannelError};
use crate::request::{Answer, TrustRequest};
use crate::transport::Channel;

/// Skeletons running as root may answer for every user
pub const ROOT_UID: u32 = 0;

/// Requests that may wait on one session before callers are pushed back
const SESSION_QUEUE_DEPTH: usize = 64;

struct Pending {
    request: TrustRequest,
    reply: oneshot::Sender<Result<Answer, AgentError>>,
}

struct Session {
    id: u64,
    queue: mpsc::Sender<Pending>,
}

struct Inner {
    sessions: Mutex<HashMap<u32, Session>>,
    next_id: AtomicU64,
    timeout: Duration,
    abort: CancellationToken,
    tracker: TaskTracker,
}

impl Inner {
    fn sessions(&self) -> MutexGuard<'_, HashMap<u32, Session>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Stub side of the protocol. Cheap to clone; all clones share sessions.
#[derive(Clone)]
pub struct RequestingAgent {
    inner: Arc<Inner>,
}

impl RequestingAgent {
    pub fn new(timeout: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                sessions: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                timeout,
                abort: CancellationToken::new(),
                tracker: TaskTracker::new(),
            }),
        }
    }

    pub fn timeout(&self) -> Duration {
        self.inner.timeout
    }

    /// Adopt a freshly accepted channel as the session for its peer's uid.
    /// A newer session for the same uid replaces the older one.
    pub fn attach(&self, channel: Channel) {
        let Some(uid) = channel.peer_uid() else {
            warn!("Refusing {} peer with unknown credentials", channel.binding());
            self.inner.tracker.spawn(channel.close());
            return;
        };

        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::channel(SESSION_QUEUE_DEPTH);

        if self.inner.sessions().insert(uid, Session { id, queue: tx }).is_some() {
            info!("Skeleton for uid {} replaced by session {}", uid, id);
        } else {
            info!("Skeleton for uid {} attached over {} (session {})", uid, channel.binding(), id);
        }

        self.inner
            .tracker
            .spawn(run_session(Arc::clone(&self.inner), id, uid, channel, rx));
    }

    /// Number of attached skeletons
    pub fn session_count(&self) -> usize {
        self.inner.sessions().len()
    }

    pub fn has_session_for(&self, uid: u32) -> bool {
        let sessions = self.inner.sessions();
        sessions.contains_key(&uid) || sessions.contains_key(&ROOT_UID)
    }

    /// Relay one request and wait for its answer, bounded by the timeout
    pub async fn request(&self, request: TrustRequest) -> Result<Answer, AgentError> {
        let timeout = self.inner.timeout;
        tokio::select! {
            _ = self.inner.abort.cancelled() => Err(AgentError::Cancelled),
            result = tokio::time::timeout(timeout, self.relay(request)) => {
                result.unwrap_or(Err(AgentError::Timeout(timeout)))
            }
        }
    }

    async fn relay(&self, request: TrustRequest) -> Result<Answer, AgentError> {
        let queue = {
            let sessions = self.inner.sessions();
            sessions
                .get(&request.uid)
                .or_else(|| sessions.get(&ROOT_UID))
                .map(|session| session.queue.clone())
        }
        .ok_or(AgentError::NoSession(request.uid))?;

        let (reply, answer) = oneshot::channel();
        queue
            .send(Pending { request, reply })
            .await
            .map_err(|_| AgentError::Transport(ChannelError::Closed))?;

        answer
            .await
            .unwrap_or(Err(AgentError::Transport(ChannelError::Closed)))
    }

    /// Fail every outstanding exchange, close every session and wait for
    /// the session tasks to finish.
    pub async fn shutdown(&self) {
        self.inner.abort.cancel();
        self.inner.sessions().clear();
        self.inner.tracker.close();
        self.inner.tracker.wait().await;
    }
}

async fn run_session(
    inner: Arc<Inner>,
    id: u64,
    uid: u32,
    mut channel: Channel,
    mut queue: mpsc::Receiver<Pending>,
) {
    loop {
        tokio::select! {
            biased;
            _ = inner.abort.cancelled() => break,
            pending = queue.recv() => {
                let Some(pending) = pending else { break };

                // The caller already gave up; do not bother the skeleton
                if pending.reply.is_closed() {
                    continue;
                }

                let result = tokio::select! {
                    _ = inner.abort.cancelled() => Err(AgentError::Cancelled),
                    result = exchange(&mut channel, &pending.request, inner.timeout) => result,
                };

                let failed = match &result {
                    Ok(answer) => {
                        debug!("Session {}: {} -> {}", id, pending.request, answer);
                        false
                    }
                    Err(e) => {
                        warn!("Session {}: {} failed: {}", id, pending.request, e);
                        true
                    }
                };

                let _ = pending.reply.send(result);

                // After a failed exchange the channel may still deliver a
                // late answer, so it cannot be trusted for the next request.
                if failed {
                    break;
                }
            }
            frame = channel.receive() => {
                match frame {
                    Ok(frame) => warn!("Session {}: unsolicited frame {:?}", id, frame),
                    Err(ChannelError::Closed) => info!("Session {}: skeleton for uid {} went away", id, uid),
                    Err(e) => warn!("Session {}: {}", id, e),
                }
                break;
            }
        }
    }

    {
        let mut sessions = inner.sessions();
        if sessions.get(&uid).map(|s| s.id) == Some(id) {
            sessions.remove(&uid);
        }
    }

    queue.close();
    while let Ok(pending) = queue.try_recv() {
        let _ = pending
            .reply
            .send(Err(AgentError::Transport(ChannelError::Closed)));
    }

    channel.close().await;
}

async fn exchange(channel: &mut Channel, request: &TrustRequest, timeout: Duration) -> Result<Answer, AgentError> {
    channel.send(&request.to_string()).await?;

    let token = tokio::time::timeout(timeout, channel.receive())
        .await
        .map_err(|_| AgentError::Timeout(timeout))??;

    Ok(token.parse()?)
}

/// What the answering side does with each relayed request
#[async_trait]
pub trait RequestHandler: Send + Sync {
    async fn handle(&self, request: TrustRequest) -> Answer;
}

/// Why a serve loop returned
#[derive(Debug)]
pub enum ServeOutcome {
    /// Shutdown was requested between two requests
    Cancelled,
    /// The channel failed or the peer went away
    Closed(ChannelError),
}

/// Skeleton side of the protocol
pub struct AnsweringAgent {
    channel: Channel,
    served: u64,
}

impl AnsweringAgent {
    pub fn new(channel: Channel) -> Self {
        Self { channel, served: 0 }
    }

    /// Requests answered so far on this channel
    pub fn served(&self) -> u64 {
        self.served
    }

    /// Answer requests one at a time until the channel closes or `shutdown`
    /// fires. A request that is already being handled always completes.
    pub async fn serve<H: RequestHandler + ?Sized>(
        &mut self,
        handler: &H,
        shutdown: &CancellationToken,
    ) -> ServeOutcome {
        loop {
            let frame = tokio::select! {
                _ = shutdown.cancelled() => return ServeOutcome::Cancelled,
                frame = self.channel.receive() => frame,
            };

            let answer = match frame {
                Ok(line) => match line.parse::<TrustRequest>() {
                    Ok(request) => handler.handle(request).await,
                    Err(e) => {
                        warn!("Malformed request {:?}: {}", line, e);
                        Answer::Denied
                    }
                },
                Err(ChannelError::Malformed(reason)) => {
                    warn!("Malformed frame: {}", reason);
                    Answer::Denied
                }
                Err(e) => return ServeOutcome::Closed(e),
            };

            if let Err(e) = self.channel.send(answer.as_str()).await {
                return ServeOutcome::Closed(e);
            }
            self.served += 1;
        }
    }

    pub async fn close(self) {
        self.channel.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Endpoint;
    use crate::transport::{connect, Listener};
    use std::sync::atomic::AtomicUsize;
    use tempfile::{tempdir, TempDir};

    struct Grant;

    #[async_trait]
    impl RequestHandler for Grant {
        async fn handle(&self, _request: TrustRequest) -> Answer {
            Answer::Granted
        }
    }

    /// Grants even features, denies odd ones, counts calls
    struct Parity(AtomicUsize);

    #[async_trait]
    impl RequestHandler for Parity {
        async fn handle(&self, request: TrustRequest) -> Answer {
            self.0.fetch_add(1, Ordering::SeqCst);
            if request.feature % 2 == 0 {
                Answer::Granted
            } else {
                Answer::Denied
            }
        }
    }

    fn uid() -> u32 {
        unsafe { libc::getuid() }
    }

    async fn pair() -> (TempDir, RequestingAgent, AnsweringAgent) {
        let dir = tempdir().unwrap();
        let endpoint = Endpoint::LocalSocket(dir.path().join("agent.sock"));
        let mut listener = Listener::bind(&endpoint, 128, false).await.unwrap();

        let skeleton_side = connect(&endpoint, 128).await.unwrap();
        let stub_side = listener.accept().await.unwrap();

        let requesting = RequestingAgent::new(Duration::from_secs(5));
        requesting.attach(stub_side);

        (dir, requesting, AnsweringAgent::new(skeleton_side))
    }

    #[tokio::test]
    async fn test_request_is_answered() {
        let (_dir, requesting, mut answering) = pair().await;
        let shutdown = CancellationToken::new();

        let serve_shutdown = shutdown.clone();
        let server = tokio::spawn(async move {
            let outcome = answering.serve(&Grant, &serve_shutdown).await;
            (answering.served(), outcome)
        });

        let answer = requesting.request(TrustRequest::new(1, uid(), 7)).await.unwrap();
        assert_eq!(answer, Answer::Granted);

        shutdown.cancel();
        let (served, outcome) = server.await.unwrap();
        assert_eq!(served, 1);
        assert!(matches!(outcome, ServeOutcome::Cancelled));
    }

    #[tokio::test]
    async fn test_concurrent_requests_get_their_own_answers() {
        let (_dir, requesting, mut answering) = pair().await;
        let shutdown = CancellationToken::new();
        let handler = Arc::new(Parity(AtomicUsize::new(0)));

        let serve_handler = Arc::clone(&handler);
        let serve_shutdown = shutdown.clone();
        let server = tokio::spawn(async move { answering.serve(serve_handler.as_ref(), &serve_shutdown).await });

        let uid = uid();
        let mut callers = Vec::new();
        for feature in 0..20u64 {
            let requesting = requesting.clone();
            callers.push(tokio::spawn(async move {
                (feature, requesting.request(TrustRequest::new(1, uid, feature)).await.unwrap())
            }));
        }

        for caller in callers {
            let (feature, answer) = caller.await.unwrap();
            let expected = if feature % 2 == 0 { Answer::Granted } else { Answer::Denied };
            assert_eq!(answer, expected, "feature {}", feature);
        }
        assert_eq!(handler.0.load(Ordering::SeqCst), 20);

        shutdown.cancel();
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_no_session_for_unknown_user() {
        let requesting = RequestingAgent::new(Duration::from_secs(1));
        let err = requesting.request(TrustRequest::new(1, 4242, 0)).await.unwrap_err();
        assert!(matches!(err, AgentError::NoSession(4242)));
    }

    #[tokio::test]
    async fn test_severed_channel_fails_pending_request() {
        let (_dir, requesting, answering) = pair().await;
        let uid = uid();

        let pending = tokio::spawn({
            let requesting = requesting.clone();
            async move { requesting.request(TrustRequest::new(1, uid, 3)).await }
        });

        // Let the request reach the wire, then cut the channel without answering
        tokio::time::sleep(Duration::from_millis(50)).await;
        answering.close().await;

        let err = pending.await.unwrap().unwrap_err();
        assert!(matches!(err, AgentError::Transport(_)), "{:?}", err);

        // The dead session is dropped
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(requesting.session_count(), 0);
    }

    #[tokio::test]
    async fn test_silent_skeleton_times_out() {
        let dir = tempdir().unwrap();
        let endpoint = Endpoint::LocalSocket(dir.path().join("slow.sock"));
        let mut listener = Listener::bind(&endpoint, 128, false).await.unwrap();
        let _silent = connect(&endpoint, 128).await.unwrap();

        let requesting = RequestingAgent::new(Duration::from_millis(100));
        requesting.attach(listener.accept().await.unwrap());

        let err = requesting.request(TrustRequest::new(1, uid(), 0)).await.unwrap_err();
        assert!(matches!(err, AgentError::Timeout(_)), "{:?}", err);
    }

    #[tokio::test]
    async fn test_malformed_answer_is_a_protocol_error() {
        let dir = tempdir().unwrap();
        let endpoint = Endpoint::LocalSocket(dir.path().join("bad.sock"));
        let mut listener = Listener::bind(&endpoint, 128, false).await.unwrap();
        let mut skeleton_side = connect(&endpoint, 128).await.unwrap();

        let requesting = RequestingAgent::new(Duration::from_secs(5));
        requesting.attach(listener.accept().await.unwrap());

        let responder = tokio::spawn(async move {
            let frame = skeleton_side.receive().await.unwrap();
            skeleton_side.send("maybe").await.unwrap();
            frame
        });

        let err = requesting.request(TrustRequest::new(9, uid(), 2)).await.unwrap_err();
        assert!(matches!(err, AgentError::Protocol(_)), "{:?}", err);
        assert_eq!(responder.await.unwrap(), format!("9 {} 2", uid()));
    }

    #[tokio::test]
    async fn test_malformed_request_is_denied() {
        let dir = tempdir().unwrap();
        let endpoint = Endpoint::LocalSocket(dir.path().join("m.sock"));
        let mut listener = Listener::bind(&endpoint, 128, false).await.unwrap();
        let mut stub_side = connect(&endpoint, 128).await.unwrap();
        let mut answering = AnsweringAgent::new(listener.accept().await.unwrap());

        let shutdown = CancellationToken::new();
        let serve_shutdown = shutdown.clone();
        let server = tokio::spawn(async move { answering.serve(&Grant, &serve_shutdown).await });

        stub_side.send("not a request").await.unwrap();
        assert_eq!(stub_side.receive().await.unwrap(), "denied");
        stub_side.send("1 2 3").await.unwrap();
        assert_eq!(stub_side.receive().await.unwrap(), "granted");

        stub_side.close().await;
        assert!(matches!(server.await.unwrap(), ServeOutcome::Closed(ChannelError::Closed)));
    }

    #[tokio::test]
    async fn test_oversized_request_is_denied_and_serving_continues() {
        let dir = tempdir().unwrap();
        let endpoint = Endpoint::LocalSocket(dir.path().join("o.sock"));
        let mut listener = Listener::bind(&endpoint, 16, false).await.unwrap();
        let mut stub_side = connect(&endpoint, 128).await.unwrap();
        let mut answering = AnsweringAgent::new(listener.accept().await.unwrap());

        let shutdown = CancellationToken::new();
        let serve_shutdown = shutdown.clone();
        let server = tokio::spawn(async move {
            let outcome = answering.serve(&Grant, &serve_shutdown).await;
            (answering.served(), outcome)
        });

        stub_side.send("1 2 33333333333333333333333333").await.unwrap();
        assert_eq!(stub_side.receive().await.unwrap(), "denied");
        stub_side.send("1 2 3").await.unwrap();
        assert_eq!(stub_side.receive().await.unwrap(), "granted");

        shutdown.cancel();
        let (served, outcome) = server.await.unwrap();
        assert_eq!(served, 2);
        assert!(matches!(outcome, ServeOutcome::Cancelled));
    }
}
