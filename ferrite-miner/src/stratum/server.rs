//! Stratum server: connection handling and job distribution.
//!
//! One task per socket. The current job lives in a read-mostly slot and is
//! broadcast through a watch channel; publishing never waits for slow
//! connections. Shares that validate against the job target are handed to
//! the pool supervisor for block assembly and submission.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use futures::SinkExt;
use parking_lot::RwLock;
use serde_json::json;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;
use tokio_stream::StreamExt;
use tokio_util::codec::{Framed, LinesCodec};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::messages::{
    self, Request, StratumError, SubmitParams, error_line, notify_line, result_line,
};
use crate::job::{MiningJob, ShareCheck, Share, validate_share};
use crate::types::Extranonce1;

/// Inbound lines longer than this are protocol abuse.
const MAX_LINE_LEN: usize = 16 * 1024;

/// A connection silent for this long is dropped, not retried in place.
const IDLE_TIMEOUT: Duration = Duration::from_secs(600);

/// Bound on any single outbound write.
const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// Jobs kept around for late share submissions.
const RECENT_JOBS: usize = 4;

/// A share that met the job target, forwarded for block assembly.
#[derive(Debug)]
pub struct AcceptedShare {
    pub share: Share,
    pub check: ShareCheck,
    pub extranonce1: Extranonce1,
}

struct JobBook {
    current: Option<Arc<MiningJob>>,
    recent: HashMap<String, Arc<MiningJob>>,
    order: VecDeque<String>,
}

/// Shared server state: job book, extranonce allocation, share hand-off.
pub struct PoolState {
    jobs: RwLock<JobBook>,
    job_tx: watch::Sender<Option<Arc<MiningJob>>>,
    extranonce_counter: AtomicU64,
    extranonce2_size: u8,
    share_tx: mpsc::Sender<AcceptedShare>,
}

impl PoolState {
    pub fn new(extranonce2_size: u8, share_tx: mpsc::Sender<AcceptedShare>) -> Arc<Self> {
        let (job_tx, _) = watch::channel(None);
        Arc::new(Self {
            jobs: RwLock::new(JobBook {
                current: None,
                recent: HashMap::new(),
                order: VecDeque::new(),
            }),
            job_tx,
            extranonce_counter: AtomicU64::new(1),
            extranonce2_size,
            share_tx,
        })
    }

    pub fn extranonce2_size(&self) -> u8 {
        self.extranonce2_size
    }

    /// Install a new current job and wake every subscribed connection.
    pub fn publish(&self, job: MiningJob) {
        let job = Arc::new(job);
        {
            let mut book = self.jobs.write();
            book.current = Some(job.clone());
            book.order.push_back(job.job_id.clone());
            book.recent.insert(job.job_id.clone(), job.clone());
            while book.order.len() > RECENT_JOBS {
                if let Some(old) = book.order.pop_front() {
                    book.recent.remove(&old);
                }
            }
        }
        debug!(job_id = %job.job_id, clean_jobs = job.clean_jobs, "Job published");
        let _ = self.job_tx.send(Some(job));
    }

    pub fn current_job(&self) -> Option<Arc<MiningJob>> {
        self.jobs.read().current.clone()
    }

    fn lookup(&self, job_id: &str) -> Option<Arc<MiningJob>> {
        self.jobs.read().recent.get(job_id).cloned()
    }

    fn subscribe_jobs(&self) -> watch::Receiver<Option<Arc<MiningJob>>> {
        self.job_tx.subscribe()
    }

    fn next_extranonce1(&self) -> Extranonce1 {
        Extranonce1::from_counter(self.extranonce_counter.fetch_add(1, Ordering::Relaxed))
    }
}

/// Accept loop. Each connection gets its own task and a child cancellation
/// token; a failing connection never disturbs the others.
pub async fn serve(
    listener: TcpListener,
    state: Arc<PoolState>,
    cancel: CancellationToken,
) -> std::io::Result<()> {
    info!(addr = %listener.local_addr()?, "Stratum server listening");

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!(error = %e, "Accept failed");
                        continue;
                    }
                };
                let state = state.clone();
                let conn_cancel = cancel.child_token();
                tokio::spawn(async move {
                    if let Err(e) = serve_connection(stream, peer, state, conn_cancel).await {
                        debug!(%peer, error = %e, "Connection closed with error");
                    }
                });
            }
            _ = cancel.cancelled() => {
                info!("Stratum server shutting down");
                return Ok(());
            }
        }
    }
}

struct Connection {
    peer: SocketAddr,
    extranonce1: Extranonce1,
    subscribed: bool,
    authorized: Option<String>,
}

async fn serve_connection(
    stream: TcpStream,
    peer: SocketAddr,
    state: Arc<PoolState>,
    cancel: CancellationToken,
) -> Result<(), StratumError> {
    let mut framed = Framed::new(stream, LinesCodec::new_with_max_length(MAX_LINE_LEN));
    let mut job_rx = state.subscribe_jobs();

    let mut conn = Connection {
        peer,
        extranonce1: state.next_extranonce1(),
        subscribed: false,
        authorized: None,
    };

    debug!(%peer, extranonce1 = %conn.extranonce1, "Connection accepted");

    let mut last_activity = Instant::now();
    let mut idle_check = tokio::time::interval(Duration::from_secs(30));

    loop {
        tokio::select! {
            line = framed.next() => {
                let line = match line {
                    Some(Ok(line)) => line,
                    Some(Err(e)) => {
                        warn!(%peer, error = %e, "Dropping connection: unreadable line");
                        return Ok(());
                    }
                    None => {
                        debug!(%peer, "Peer disconnected");
                        return Ok(());
                    }
                };
                last_activity = Instant::now();

                let request = match Request::parse(&line) {
                    Ok(request) => request,
                    Err(e) => {
                        warn!(%peer, error = %e, "Dropping connection: malformed message");
                        return Ok(());
                    }
                };

                for reply in handle_request(&state, &mut conn, request) {
                    send_line(&mut framed, reply).await?;
                }
            }

            changed = job_rx.changed() => {
                if changed.is_err() {
                    // Job publisher gone; the server is shutting down.
                    return Ok(());
                }
                let job = job_rx.borrow_and_update().clone();
                if conn.subscribed {
                    if let Some(job) = job {
                        send_line(&mut framed, notify_line(&job)).await?;
                    }
                }
            }

            _ = idle_check.tick() => {
                if last_activity.elapsed() >= IDLE_TIMEOUT {
                    warn!(%peer, "Dropping stalled connection");
                    return Err(StratumError::Stalled);
                }
            }

            _ = cancel.cancelled() => {
                return Ok(());
            }
        }
    }
}

async fn send_line(
    framed: &mut Framed<TcpStream, LinesCodec>,
    line: String,
) -> Result<(), StratumError> {
    match timeout(WRITE_TIMEOUT, framed.send(line)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(StratumError::Malformed(e.to_string())),
        Err(_) => Err(StratumError::Stalled),
    }
}

/// Dispatch one request, returning the lines to send back in order.
fn handle_request(state: &PoolState, conn: &mut Connection, request: Request) -> Vec<String> {
    match request.method.as_str() {
        "mining.subscribe" => {
            conn.subscribed = true;
            let agent = request.params[0].as_str().unwrap_or("unknown");
            info!(peer = %conn.peer, agent, extranonce1 = %conn.extranonce1, "Subscribed");

            let mut replies = vec![result_line(
                request.id,
                messages::subscribe_result(
                    &conn.extranonce1.to_string(),
                    state.extranonce2_size(),
                ),
            )];

            // A late joiner starts on the current job immediately.
            if let Some(job) = state.current_job() {
                replies.push(notify_line(&job));
            }
            replies
        }

        "mining.authorize" => {
            let user = request.params[0].as_str().unwrap_or("").to_string();
            info!(peer = %conn.peer, user = %user, "Authorized");
            conn.authorized = Some(user);
            vec![result_line(request.id, json!(true))]
        }

        "mining.submit" => vec![handle_submit(state, conn, request)],

        other => {
            debug!(peer = %conn.peer, method = other, "Unknown method");
            vec![error_line(request.id, 20, "unknown method")]
        }
    }
}

fn handle_submit(state: &PoolState, conn: &Connection, request: Request) -> String {
    if conn.authorized.is_none() {
        debug!(peer = %conn.peer, "Share from unauthorized connection");
    }

    let submit = match SubmitParams::parse(&request.params) {
        Ok(submit) => submit,
        Err(e) => {
            warn!(peer = %conn.peer, error = %e, "Rejecting unparseable submit");
            return error_line(request.id, 23, "invalid share");
        }
    };

    let Some(job) = state.lookup(&submit.job_id) else {
        debug!(peer = %conn.peer, job_id = %submit.job_id, "Share for unknown job");
        return error_line(request.id, 21, "job not found");
    };

    let share = match submit.into_share(state.extranonce2_size()) {
        Ok(share) => share,
        Err(e) => {
            warn!(peer = %conn.peer, error = %e, "Rejecting share with bad extranonce2");
            return error_line(request.id, 23, "invalid share");
        }
    };

    match validate_share(&job, &conn.extranonce1, &share) {
        Ok(check) if check.accepted => {
            info!(
                peer = %conn.peer,
                job_id = %share.job_id,
                nonce = format!("{:#010x}", share.nonce),
                hash = %hex::encode(check.hash),
                "Share accepted"
            );

            let accepted = AcceptedShare {
                share,
                check,
                extranonce1: conn.extranonce1.clone(),
            };
            if let Err(e) = state.share_tx.try_send(accepted) {
                warn!(error = %e, "Share hand-off channel unavailable");
            }
            result_line(request.id, json!(true))
        }
        Ok(check) => {
            debug!(
                peer = %conn.peer,
                job_id = %share.job_id,
                hash = %hex::encode(check.hash),
                "Share above target"
            );
            result_line(request.id, json!(false))
        }
        Err(e) => {
            warn!(peer = %conn.peer, error = %e, "Share failed validation");
            error_line(request.id, 23, "invalid share")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coinbase::CoinbaseBuilder;
    use crate::job::assemble_job;
    use crate::target::Target;
    use crate::template::BlockTemplate;
    use crate::types::Extranonce2;
    use serde_json::Value;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

    fn template() -> BlockTemplate {
        BlockTemplate {
            version: 0x2000_0000,
            height: 1000,
            previous_block_hash:
                "00000000000000000002a7c4c1e48d76c5a37902165a270156b7a8d72728a054".to_string(),
            bits: "1d00ffff".to_string(),
            current_time: 1_700_000_000,
            coinbase_value: 5_000_000_000,
            rules: vec![],
            witness_commitment: None,
            transactions: vec![],
        }
    }

    fn easy_job() -> MiningJob {
        let template = template();
        let en1 = Extranonce1::from_hex("1234567890abcdef").unwrap();
        let en2 = Extranonce2::new(0, 4).unwrap();
        let coinbase = CoinbaseBuilder::new(
            &template,
            hex::decode("0014841b80d2cc75f5345c482af96294d04fdd66b2b7").unwrap(),
            en1.clone(),
            en2,
        )
        .build()
        .unwrap();

        assemble_job(&template, &coinbase, &en1, &en2, Target::MAX, true).unwrap()
    }

    async fn start_server(
        state: Arc<PoolState>,
    ) -> (std::net::SocketAddr, CancellationToken) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let cancel = CancellationToken::new();
        tokio::spawn(serve(listener, state, cancel.clone()));
        (addr, cancel)
    }

    async fn next_json(
        reader: &mut tokio::io::Lines<BufReader<tokio::net::tcp::OwnedReadHalf>>,
    ) -> Value {
        let line = reader.next_line().await.unwrap().expect("line expected");
        serde_json::from_str(&line).unwrap()
    }

    #[tokio::test]
    async fn subscribe_authorize_submit_roundtrip() {
        let (share_tx, mut share_rx) = mpsc::channel(8);
        let state = PoolState::new(4, share_tx);
        state.publish(easy_job());
        let job_id = state.current_job().unwrap().job_id.clone();

        let (addr, _cancel) = start_server(state).await;

        let stream = TcpStream::connect(addr).await.unwrap();
        let (read_half, mut write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half).lines();

        write_half
            .write_all(b"{\"id\":1,\"method\":\"mining.subscribe\",\"params\":[\"test/0.1\"]}\n")
            .await
            .unwrap();

        let sub = next_json(&mut reader).await;
        assert_eq!(sub["id"], 1);
        assert_eq!(sub["result"][2], 4);
        let extranonce1 = sub["result"][1].as_str().unwrap().to_string();
        assert_eq!(extranonce1.len(), 16);

        // The current job arrives unsolicited right after subscription.
        let notify = next_json(&mut reader).await;
        assert_eq!(notify["method"], "mining.notify");
        assert_eq!(notify["params"][0], job_id.as_str());

        write_half
            .write_all(b"{\"id\":2,\"method\":\"mining.authorize\",\"params\":[\"w1\",\"x\"]}\n")
            .await
            .unwrap();
        let auth = next_json(&mut reader).await;
        assert_eq!(auth["result"], true);

        // Any nonce clears a maximum target.
        let submit = format!(
            "{{\"id\":3,\"method\":\"mining.submit\",\"params\":[\"w1\",\"{job_id}\",\"00000000\",\"65000000\",\"00000001\"]}}\n"
        );
        write_half.write_all(submit.as_bytes()).await.unwrap();
        let reply = next_json(&mut reader).await;
        assert_eq!(reply["result"], true, "reply: {reply}");

        let accepted = share_rx.recv().await.expect("share forwarded");
        assert_eq!(accepted.share.job_id, job_id);
        assert_eq!(accepted.extranonce1.to_string(), extranonce1);
        assert!(accepted.check.accepted);
    }

    #[tokio::test]
    async fn submit_for_unknown_job_is_an_error_reply() {
        let (share_tx, _share_rx) = mpsc::channel(8);
        let state = PoolState::new(4, share_tx);
        let (addr, _cancel) = start_server(state).await;

        let stream = TcpStream::connect(addr).await.unwrap();
        let (read_half, mut write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half).lines();

        write_half
            .write_all(
                b"{\"id\":1,\"method\":\"mining.submit\",\"params\":[\"w\",\"nope\",\"00000000\",\"65000000\",\"00000001\"]}\n",
            )
            .await
            .unwrap();

        let reply = next_json(&mut reader).await;
        assert!(reply["result"].is_null());
        assert_eq!(reply["error"][0], 21);
    }

    #[tokio::test]
    async fn malformed_line_drops_only_that_connection() {
        let (share_tx, _share_rx) = mpsc::channel(8);
        let state = PoolState::new(4, share_tx);
        let (addr, _cancel) = start_server(state.clone()).await;

        // First connection sends garbage and gets dropped.
        let stream = TcpStream::connect(addr).await.unwrap();
        let (read_half, mut write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half).lines();
        write_half.write_all(b"this is not json\n").await.unwrap();
        assert!(reader.next_line().await.unwrap().is_none());

        // A second connection still works.
        let stream = TcpStream::connect(addr).await.unwrap();
        let (read_half, mut write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half).lines();
        write_half
            .write_all(b"{\"id\":1,\"method\":\"mining.subscribe\",\"params\":[]}\n")
            .await
            .unwrap();
        let sub = next_json(&mut reader).await;
        assert_eq!(sub["id"], 1);
    }

    #[tokio::test]
    async fn published_job_is_broadcast_to_subscribers() {
        let (share_tx, _share_rx) = mpsc::channel(8);
        let state = PoolState::new(4, share_tx);
        let (addr, _cancel) = start_server(state.clone()).await;

        let stream = TcpStream::connect(addr).await.unwrap();
        let (read_half, mut write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half).lines();
        write_half
            .write_all(b"{\"id\":1,\"method\":\"mining.subscribe\",\"params\":[]}\n")
            .await
            .unwrap();
        let _sub = next_json(&mut reader).await;

        state.publish(easy_job());

        let notify = next_json(&mut reader).await;
        assert_eq!(notify["method"], "mining.notify");
        assert_eq!(notify["params"][8], true);
    }

    #[test]
    fn job_book_prunes_old_jobs() {
        let (share_tx, _share_rx) = mpsc::channel(8);
        let state = PoolState::new(4, share_tx);

        let mut ids = Vec::new();
        for i in 0..6 {
            let mut job = easy_job();
            job.job_id = format!("job{i}");
            ids.push(job.job_id.clone());
            state.publish(job);
        }

        assert!(state.lookup(&ids[0]).is_none());
        assert!(state.lookup(&ids[5]).is_some());
        assert_eq!(state.jobs.read().recent.len(), RECENT_JOBS);
    }
}
