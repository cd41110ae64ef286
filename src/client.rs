// Copyright (C) 2020  Braiins Systems s.r.o.
//
// This file is part of Braiins Open-Source Initiative (BOSI).
//
// BOSI is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.
//
// Please, keep in mind that we may also license BOSI or any part thereof
// under a proprietary license. For more information on the terms and conditions
// of such proprietary license or if you have any other questions, please
// contact us at opensource@braiins.com.

//! Stratum V1 protocol client: newline-framed JSON-RPC codec, request and
//! response correlation, the subscribe/authorize handshake and the receive
//! and send loops of the session.

use crate::error::{self, ErrorKind};
use crate::hal;
use crate::job;
use crate::misc::LOGGER;
use crate::shutdown;
use crate::work;

use futures::channel::{mpsc, oneshot};
use futures::stream::StreamExt;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use slog::{debug, error, info, warn};

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock};

/// Outbound JSON-RPC request or inbound server call
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Request {
    /// Server calls may come with a null or missing id
    #[serde(default)]
    pub id: Option<u64>,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

/// Response to one of our calls
#[derive(Deserialize, Clone, Debug, PartialEq)]
pub struct Response {
    #[serde(default)]
    pub id: Option<u64>,
    #[serde(default)]
    pub result: Value,
    /// `null` or `[code, message, traceback]`
    #[serde(default)]
    pub error: Value,
}

/// Decoded protocol-level error of a response
#[derive(Clone, Debug, PartialEq)]
pub struct StratumError {
    pub code: i64,
    pub message: String,
}

impl StratumError {
    // 20 other, 21 stale job, 22 duplicate share, 23 low difficulty,
    // 24 unauthorized worker, 25 not subscribed
    const CODE_UNAUTHORIZED: i64 = 24;
    const CODE_NOT_SUBSCRIBED: i64 = 25;

    /// Unauthorized/not-subscribed cannot be recovered within the session
    pub fn is_fatal(&self) -> bool {
        self.code == Self::CODE_UNAUTHORIZED || self.code == Self::CODE_NOT_SUBSCRIBED
    }
}

impl Response {
    /// Decode the error field; `None` means the call succeeded
    pub fn stratum_error(&self) -> Option<StratumError> {
        if self.error.is_null() {
            return None;
        }
        match self.error.as_array() {
            Some(entries) => Some(StratumError {
                code: entries.get(0).and_then(Value::as_i64).unwrap_or(0),
                message: entries
                    .get(1)
                    .and_then(Value::as_str)
                    .unwrap_or("unknown error")
                    .to_string(),
            }),
            None => Some(StratumError {
                code: 0,
                message: self.error.to_string(),
            }),
        }
    }
}

/// One JSON object per line; a frame with an id and a result is a response,
/// anything else has to be a server call
pub enum Frame {
    Call(Request),
    Response(Response),
}

pub fn parse_frame(line: &str) -> error::Result<Frame> {
    let value: Value = serde_json::from_str(line)?;
    if !value.is_object() {
        Err(ErrorKind::Framing(format!("frame is not an object: {}", line)))?
    }

    let has_id = value.get("id").map(|id| !id.is_null()).unwrap_or(false);
    if has_id && (value.get("result").is_some() || value.get("error").is_some()) {
        Ok(Frame::Response(serde_json::from_value(value)?))
    } else if value.get("method").is_some() {
        Ok(Frame::Call(serde_json::from_value(value)?))
    } else {
        Err(ErrorKind::Framing(format!(
            "frame is neither a call nor a response: {}",
            line
        )))?
    }
}

/// Subscription parameters handed out by the server; fixed for the whole
/// connection once `mining.subscribe` went through
#[derive(Clone, Debug, PartialEq)]
pub struct Subscription {
    pub extra_nonce_1: Vec<u8>,
    pub extra_nonce_2_size: usize,
}

impl Subscription {
    /// Decode the result of `mining.subscribe`:
    /// `[subscription_details, extra_nonce_1_hex, extra_nonce_2_size]`.
    /// The subscription details are not interpreted.
    pub fn from_result(result: &Value) -> error::Result<Self> {
        let entries = match result.as_array() {
            Some(entries) if entries.len() >= 3 => entries,
            _ => Err(ErrorKind::Framing(
                "malformed subscribe result".to_string(),
            ))?,
        };

        let extra_nonce_1 = match entries[1].as_str() {
            Some(text) => hex::decode(text)?,
            None => Err(ErrorKind::Framing(
                "extra nonce 1 is not a hex string".to_string(),
            ))?,
        };
        let extra_nonce_2_size = match entries[2].as_u64() {
            Some(size) if size > 0 => size as usize,
            _ => Err(ErrorKind::Framing(
                "extra nonce 2 size is not a positive integer".to_string(),
            ))?,
        };

        Ok(Self {
            extra_nonce_1,
            extra_nonce_2_size,
        })
    }
}

struct CallerInner {
    next_id: AtomicU64,
    pending: StdMutex<HashMap<u64, oneshot::Sender<Response>>>,
    outbound: mpsc::UnboundedSender<Request>,
}

/// Call API over the outbound mailbox. Every call gets a fresh monotonic id
/// and a slot in the pending table; the receive loop routes the matching
/// response back through it.
#[derive(Clone)]
pub struct Caller {
    inner: Arc<CallerInner>,
}

/// Response side of an issued call
pub struct PendingCall {
    id: u64,
    receiver: oneshot::Receiver<Response>,
}

impl PendingCall {
    pub async fn response(self) -> error::Result<Response> {
        match self.receiver.await {
            Ok(response) => Ok(response),
            Err(_) => Err(ErrorKind::Io(format!(
                "connection closed before response to call {}",
                self.id
            )))?,
        }
    }
}

impl Caller {
    pub fn new(outbound: mpsc::UnboundedSender<Request>) -> Self {
        Self {
            inner: Arc::new(CallerInner {
                next_id: AtomicU64::new(0),
                pending: StdMutex::new(HashMap::new()),
                outbound,
            }),
        }
    }

    fn lock_pending(&self) -> std::sync::MutexGuard<HashMap<u64, oneshot::Sender<Response>>> {
        self.inner.pending.lock().expect("pending call table poisoned")
    }

    /// Enqueue a call on the outbound mailbox. The request is put on the
    /// wire in call order; awaiting the returned handle is optional.
    pub fn call(&self, method: &str, params: Value) -> error::Result<PendingCall> {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = oneshot::channel();
        self.lock_pending().insert(id, sender);

        let request = Request {
            id: Some(id),
            method: method.to_string(),
            params,
        };
        if self.inner.outbound.unbounded_send(request).is_err() {
            self.lock_pending().remove(&id);
            Err(ErrorKind::Io("outbound mailbox closed".to_string()))?
        }
        Ok(PendingCall { id, receiver })
    }

    /// Deliver a response to whoever issued the call. Returns false when no
    /// caller is waiting for the id.
    pub(crate) fn dispatch_response(&self, response: Response) -> bool {
        let id = match response.id {
            Some(id) => id,
            None => return false,
        };
        match self.lock_pending().remove(&id) {
            // a dropped receiver just means the caller lost interest
            Some(sender) => {
                let _ = sender.send(response);
                true
            }
            None => false,
        }
    }
}

/// Client session state: the call API plus the subscription handed out
/// during the handshake
pub struct Client {
    caller: Caller,
    subscription: StdRwLock<Option<Subscription>>,
}

impl Client {
    pub fn new(caller: Caller) -> Self {
        Self {
            caller,
            subscription: StdRwLock::new(None),
        }
    }

    pub fn caller(&self) -> &Caller {
        &self.caller
    }

    pub fn subscription(&self) -> Option<Subscription> {
        self.subscription
            .read()
            .expect("subscription lock poisoned")
            .clone()
    }

    pub(crate) fn replace_subscription(&self, subscription: Subscription) {
        *self
            .subscription
            .write()
            .expect("subscription lock poisoned") = Some(subscription);
    }

    /// First step of the handshake. Retains the extra nonce 1 and the extra
    /// nonce 2 size for job construction.
    pub async fn subscribe(&self) -> error::Result<()> {
        let response = self.caller.call("mining.subscribe", json!([]))?.response().await?;
        if let Some(e) = response.stratum_error() {
            Err(ErrorKind::Stratum(e.code, e.message))?
        }

        let subscription = Subscription::from_result(&response.result)?;
        info!(
            LOGGER,
            "Subscribed: extra nonce 1 = {}, extra nonce 2 size = {}",
            hex::encode(&subscription.extra_nonce_1),
            subscription.extra_nonce_2_size
        );
        self.replace_subscription(subscription);
        Ok(())
    }

    /// Second step of the handshake. Authorization counts as successful
    /// when the response carries no error.
    pub async fn authorize(&self, user: &str, password: &str) -> error::Result<()> {
        let response = self
            .caller
            .call("mining.authorize", json!([user, password]))?
            .response()
            .await?;
        match response.stratum_error() {
            Some(e) => {
                error!(LOGGER, "Authorization failed ({}): {}", e.code, e.message);
                Err(ErrorKind::Stratum(e.code, e.message))?
            }
            None => {
                info!(LOGGER, "Authorized as {}", user);
                Ok(())
            }
        }
    }

    /// Ask the server for a difficulty; purely advisory
    pub async fn suggest_difficulty(&self, difficulty: u64) -> error::Result<()> {
        let response = self
            .caller
            .call("mining.suggest_difficulty", json!([difficulty]))?
            .response()
            .await?;
        if let Some(e) = response.stratum_error() {
            warn!(LOGGER, "Difficulty suggestion refused ({}): {}", e.code, e.message);
        }
        Ok(())
    }
}

/// Parameters of `mining.submit`:
/// `[worker_name, job_id, extra_nonce_2_hex, timestamp, nonce_hex]`.
/// The nonce goes out as 8 lowercase hex characters, big endian.
pub fn submit_params(worker_name: &str, built: &job::BuiltJob, nonce: u32) -> Value {
    json!([
        worker_name,
        built.job_id,
        built.extra_nonce_2,
        built.timestamp,
        format!("{:08x}", nonce),
    ])
}

/// Open the TCP session to the upstream server
pub async fn connect(host: &str, port: u16) -> error::Result<(OwnedReadHalf, OwnedWriteHalf)> {
    info!(LOGGER, "Connecting to {}:{}...", host, port);
    let stream = TcpStream::connect((host, port)).await?;
    Ok(stream.into_split())
}

/// Send loop: serializes outbound requests one JSON object per line. Write
/// failures are fatal to the session.
pub async fn send_task<W>(
    mut writer: W,
    mut outbound: mpsc::UnboundedReceiver<Request>,
    shutdown: shutdown::Sender,
) where
    W: AsyncWrite + Unpin,
{
    while let Some(request) = outbound.next().await {
        debug!(LOGGER, "Sending call to server: {}", request.method);

        let mut line = match serde_json::to_string(&request) {
            Ok(line) => line,
            Err(e) => {
                error!(LOGGER, "cannot serialize {} request: {}", request.method, e);
                continue;
            }
        };
        line.push('\n');

        if let Err(e) = writer.write_all(line.as_bytes()).await {
            shutdown.send(format!("connection write failed: {}", e));
            return;
        }
        if let Err(e) = writer.flush().await {
            shutdown.send(format!("connection flush failed: {}", e));
            return;
        }
    }
}

/// Receive loop: reads one framed message at a time and dispatches it.
/// Responses go to the pending-call table, server calls feed the job
/// pipeline. Malformed frames are logged and dropped; transport errors end
/// the session.
pub async fn receive_task<B, R>(
    reader: R,
    client: Arc<Client>,
    queue: work::Queue,
    ctl: Arc<hal::ChainCtl<B>>,
    interrupt_work: bool,
    shutdown: shutdown::Sender,
) where
    B: hal::Bus,
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut line = String::new();
    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) => {
                shutdown.send("connection closed by server".to_string());
                return;
            }
            Ok(_) => {}
            Err(e) => {
                shutdown.send(format!("connection read failed: {}", e));
                return;
            }
        }

        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        match parse_frame(trimmed) {
            Ok(frame) => handle_frame(&client, &queue, &ctl, interrupt_work, &shutdown, frame),
            Err(e) => warn!(LOGGER, "dropping malformed frame: {}", e),
        }
    }
}

pub(crate) fn handle_frame<B: hal::Bus>(
    client: &Client,
    queue: &work::Queue,
    ctl: &hal::ChainCtl<B>,
    interrupt_work: bool,
    shutdown: &shutdown::Sender,
    frame: Frame,
) {
    match frame {
        Frame::Response(response) => handle_response(client, shutdown, response),
        Frame::Call(call) => handle_server_call(client, queue, ctl, interrupt_work, call),
    }
}

fn handle_response(client: &Client, shutdown: &shutdown::Sender, response: Response) {
    debug!(LOGGER, "Call response received: id = {:?}", response.id);

    if client.caller().dispatch_response(response.clone()) {
        return;
    }

    // no caller is waiting for this id; log the outcome here instead
    match response.stratum_error() {
        Some(e) => {
            error!(LOGGER, "Stratum error ({}): {}", e.code, e.message);
            if e.is_fatal() {
                shutdown.send(format!("fatal stratum error ({}): {}", e.code, e.message));
            }
        }
        None => debug!(LOGGER, "unmatched response to call {:?}", response.id),
    }
}

fn handle_server_call<B: hal::Bus>(
    client: &Client,
    queue: &work::Queue,
    ctl: &hal::ChainCtl<B>,
    interrupt_work: bool,
    call: Request,
) {
    debug!(LOGGER, "Received call from server: {}", call.method);

    match call.method.as_str() {
        "mining.notify" => {
            let notification = match job::JobNotification::from_params(&call.params) {
                Ok(notification) => notification,
                Err(e) => {
                    warn!(LOGGER, "dropping malformed job notification: {}", e);
                    return;
                }
            };

            if notification.clean_jobs {
                let purged = queue.flush_jobs();
                debug!(LOGGER, "Clean jobs: dropped {} queued jobs", purged);
                if interrupt_work {
                    debug!(LOGGER, "Interrupting execution...");
                    // the pulse is a bounded two-edge transaction, so it is
                    // the one bus operation safe to issue from here
                    if let Err(e) = ctl.interrupt_execution() {
                        warn!(LOGGER, "interrupt pulse failed: {}", e);
                    }
                }
            }

            match client.subscription() {
                Some(subscription) => {
                    let built = notification.build(&subscription);
                    queue.push(work::WorkItem::Job(built));
                }
                None => warn!(
                    LOGGER,
                    "job notification before subscription completed, dropping"
                ),
            }
        }
        "mining.set_difficulty" => {
            let difficulty = call
                .params
                .as_array()
                .and_then(|params| params.get(0))
                .and_then(|difficulty| {
                    difficulty
                        .as_u64()
                        .or_else(|| difficulty.as_f64().map(|d| d as u64))
                });
            match difficulty {
                Some(difficulty) => {
                    info!(LOGGER, "Server sets difficulty {}", difficulty);
                    queue.push(work::WorkItem::SetDifficulty(difficulty));
                }
                None => warn!(LOGGER, "dropping malformed difficulty update"),
            }
        }
        other => warn!(LOGGER, "Received unknown method from server: {}", other),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::test_utils::{self, MockBus};

    fn test_client() -> (Arc<Client>, mpsc::UnboundedReceiver<Request>) {
        let (outbound_tx, outbound_rx) = mpsc::unbounded();
        (
            Arc::new(Client::new(Caller::new(outbound_tx))),
            outbound_rx,
        )
    }

    #[test]
    fn test_parse_frame_response() {
        let frame = parse_frame(r#"{"id": 1, "result": true, "error": null}"#)
            .expect("frame parsing failed");
        match frame {
            Frame::Response(response) => {
                assert_eq!(response.id, Some(1));
                assert_eq!(response.result, json!(true));
                assert!(response.stratum_error().is_none());
            }
            _ => panic!("frame is not a response"),
        }
    }

    #[test]
    fn test_parse_frame_server_call() {
        let frame = parse_frame(
            r#"{"id": null, "method": "mining.set_difficulty", "params": [512]}"#,
        )
        .expect("frame parsing failed");
        match frame {
            Frame::Call(call) => {
                assert_eq!(call.id, None);
                assert_eq!(call.method, "mining.set_difficulty");
                assert_eq!(call.params, json!([512]));
            }
            _ => panic!("frame is not a call"),
        }
    }

    #[test]
    fn test_parse_frame_rejects_garbage() {
        assert!(parse_frame("{not json").is_err());
        assert!(parse_frame(r#""just a string""#).is_err());
        assert!(parse_frame(r#"{"id": 2}"#).is_err());
    }

    #[test]
    fn test_subscription_from_result() {
        let result = json!([
            [["mining.set_difficulty", "x"], ["mining.notify", "y"]],
            "abcd",
            4
        ]);
        let subscription =
            Subscription::from_result(&result).expect("subscribe result parsing failed");
        assert_eq!(subscription.extra_nonce_1, vec![0xab, 0xcd]);
        assert_eq!(subscription.extra_nonce_2_size, 4);
    }

    #[test]
    fn test_subscription_rejects_malformed() {
        assert!(Subscription::from_result(&json!([])).is_err());
        assert!(Subscription::from_result(&json!([[], "zz", 4])).is_err());
        assert!(Subscription::from_result(&json!([[], "abcd", 0])).is_err());
    }

    #[test]
    fn test_stratum_error_decoding() {
        let response = Response {
            id: Some(4),
            result: Value::Null,
            error: json!([21, "Job not found", null]),
        };
        let e = response.stratum_error().expect("error not decoded");
        assert_eq!(e.code, 21);
        assert_eq!(e.message, "Job not found");
        assert!(!e.is_fatal());

        let response = Response {
            id: Some(5),
            result: Value::Null,
            error: json!([24, "Unauthorized worker", null]),
        };
        assert!(response.stratum_error().expect("error not decoded").is_fatal());
    }

    #[test]
    fn test_submit_params_format() {
        let built = job::BuiltJob {
            job_id: "j".to_string(),
            extra_nonce_2: "deadbeef".to_string(),
            timestamp: "5e6f7a1b".to_string(),
            midstate: [0u8; hal::MIDSTATE_SIZE],
            tail: [0u8; hal::TAIL_SIZE],
        };
        assert_eq!(
            submit_params("w", &built, 0x1234_5678),
            json!(["w", "j", "deadbeef", "5e6f7a1b", "12345678"])
        );
    }

    #[test]
    fn test_request_serialization() {
        let request = Request {
            id: Some(0),
            method: "mining.subscribe".to_string(),
            params: json!([]),
        };
        let line = serde_json::to_string(&request).expect("serialization failed");
        let parsed: Value = serde_json::from_str(&line).expect("round trip failed");
        assert_eq!(
            parsed,
            json!({"id": 0, "method": "mining.subscribe", "params": []})
        );
    }

    #[tokio::test]
    async fn test_caller_correlation() {
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded();
        let caller = Caller::new(outbound_tx);

        let first = caller.call("mining.subscribe", json!([])).expect("call failed");
        let second = caller
            .call("mining.authorize", json!(["user", "pass"]))
            .expect("call failed");

        // ids are monotonic from zero and requests hit the mailbox in order
        assert_eq!(outbound_rx.next().await.unwrap().id, Some(0));
        assert_eq!(outbound_rx.next().await.unwrap().id, Some(1));

        // responses are routed by id, regardless of arrival order
        assert!(caller.dispatch_response(Response {
            id: Some(1),
            result: json!(true),
            error: Value::Null,
        }));
        assert!(caller.dispatch_response(Response {
            id: Some(0),
            result: json!([[], "abcd", 4]),
            error: Value::Null,
        }));
        assert!(!caller.dispatch_response(Response {
            id: Some(7),
            result: Value::Null,
            error: Value::Null,
        }));

        assert_eq!(first.response().await.unwrap().result, json!([[], "abcd", 4]));
        assert_eq!(second.response().await.unwrap().result, json!(true));
    }

    #[tokio::test]
    async fn test_subscribe_handshake() {
        let (client, mut outbound_rx) = test_client();

        let deliver = async {
            let request = outbound_rx.next().await.expect("no subscribe request");
            assert_eq!(request.method, "mining.subscribe");
            client.caller().dispatch_response(Response {
                id: request.id,
                result: json!([
                    [["mining.set_difficulty", "x"], ["mining.notify", "y"]],
                    "abcd",
                    4
                ]),
                error: Value::Null,
            });
        };

        let (result, _) = futures::join!(client.subscribe(), deliver);
        result.expect("subscribe failed");

        let subscription = client.subscription().expect("subscription not stored");
        assert_eq!(subscription.extra_nonce_1, vec![0xab, 0xcd]);
        assert_eq!(subscription.extra_nonce_2_size, 4);
    }

    #[tokio::test]
    async fn test_authorize_error_is_fatal() {
        let (client, mut outbound_rx) = test_client();

        let deliver = async {
            let request = outbound_rx.next().await.expect("no authorize request");
            client.caller().dispatch_response(Response {
                id: request.id,
                result: Value::Null,
                error: json!([24, "Unauthorized worker", null]),
            });
        };

        let (result, _) = futures::join!(client.authorize("w", "secret"), deliver);
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_notify_feeds_queue() {
        let (client, _outbound_rx) = test_client();
        let queue = work::Queue::new();
        let ctl = hal::ChainCtl::new(MockBus::new(), 1, 1).expect("controller build failed");
        let (shutdown_tx, _shutdown_rx) = shutdown::channel();

        // a notification before the handshake finished is dropped
        let call = Request {
            id: None,
            method: "mining.notify".to_string(),
            params: test_utils::notify_params(),
        };
        handle_frame(
            &client,
            &queue,
            &ctl,
            true,
            &shutdown_tx,
            Frame::Call(call.clone()),
        );
        assert!(matches!(
            tokio::time::timeout(std::time::Duration::from_millis(10), queue.pop()).await,
            Err(_)
        ));

        test_utils::install_subscription(&client);
        handle_frame(&client, &queue, &ctl, true, &shutdown_tx, Frame::Call(call));

        match queue.pop().await {
            work::WorkItem::Job(built) => {
                assert_eq!(built.job_id, test_utils::NOTIFY_JOB_ID);
                assert_eq!(built.timestamp, test_utils::NOTIFY_TIMESTAMP);
            }
            other => panic!("unexpected item: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_clean_jobs_purges_and_interrupts() {
        let (client, _outbound_rx) = test_client();
        let queue = work::Queue::new();
        let bus = MockBus::new();
        let ctl = hal::ChainCtl::new(bus.clone(), 1, 1).expect("controller build failed");
        let (shutdown_tx, _shutdown_rx) = shutdown::channel();

        test_utils::install_subscription(&client);
        queue.push(work::WorkItem::Job(test_utils::built_job("stale")));
        queue.push(work::WorkItem::SetDifficulty(8));

        let mut params = test_utils::notify_params();
        params[8] = json!(true);
        let call = Request {
            id: None,
            method: "mining.notify".to_string(),
            params,
        };
        handle_frame(&client, &queue, &ctl, true, &shutdown_tx, Frame::Call(call));

        // one interrupt pulse went out and stale jobs are gone
        assert_eq!(bus.state().daisy_pulses, 1);
        assert_eq!(queue.pop().await, work::WorkItem::SetDifficulty(8));
        match queue.pop().await {
            work::WorkItem::Job(built) => assert_eq!(built.job_id, test_utils::NOTIFY_JOB_ID),
            other => panic!("unexpected item: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_set_difficulty_enqueued() {
        let (client, _outbound_rx) = test_client();
        let queue = work::Queue::new();
        let ctl = hal::ChainCtl::new(MockBus::new(), 1, 1).expect("controller build failed");
        let (shutdown_tx, _shutdown_rx) = shutdown::channel();

        let call = Request {
            id: None,
            method: "mining.set_difficulty".to_string(),
            params: json!([512]),
        };
        handle_frame(&client, &queue, &ctl, true, &shutdown_tx, Frame::Call(call));
        assert_eq!(queue.pop().await, work::WorkItem::SetDifficulty(512));
    }

    #[tokio::test]
    async fn test_receive_task_eof_shuts_down() {
        let (client, _outbound_rx) = test_client();
        let queue = work::Queue::new();
        let ctl =
            Arc::new(hal::ChainCtl::new(MockBus::new(), 1, 1).expect("controller build failed"));
        let (shutdown_tx, mut shutdown_rx) = shutdown::channel();

        let input: &[u8] = b"{\"id\": null, \"method\": \"mining.set_difficulty\", \"params\": [2]}\nnot json at all\n";
        receive_task(input, client, queue.clone(), ctl, false, shutdown_tx).await;

        // the valid frame got through, the malformed one was dropped and the
        // stream end turned into a shutdown message
        assert_eq!(queue.pop().await, work::WorkItem::SetDifficulty(2));
        assert!(shutdown_rx.receive().await.contains("closed"));
    }

    #[tokio::test]
    async fn test_send_task_writes_lines() {
        use tokio::io::AsyncReadExt;

        let (outbound_tx, outbound_rx) = mpsc::unbounded();
        let caller = Caller::new(outbound_tx);
        let (shutdown_tx, _shutdown_rx) = shutdown::channel();

        let (wire, mut server_end) = tokio::io::duplex(4096);
        let _ = caller.call("mining.subscribe", json!([])).expect("call failed");
        let _ = caller
            .call("mining.authorize", json!(["w", "p"]))
            .expect("call failed");
        drop(caller);

        send_task(wire, outbound_rx, shutdown_tx).await;

        let mut text = String::new();
        server_end
            .read_to_string(&mut text)
            .await
            .expect("cannot read back written lines");
        let mut lines = text.lines();
        assert_eq!(
            lines.next().unwrap(),
            r#"{"id":0,"method":"mining.subscribe","params":[]}"#
        );
        assert_eq!(
            lines.next().unwrap(),
            r#"{"id":1,"method":"mining.authorize","params":["w","p"]}"#
        );
        assert!(lines.next().is_none());
    }
}
