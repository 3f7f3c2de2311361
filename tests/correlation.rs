//! Request/response correlation: sanity checks, failure causes and listener notification

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use peerwire::core::message::{commands, Message, MessageType};
use peerwire::core::peer::{PeerAddress, PeerId, PeerSocketAddress};
use peerwire::error::{AbortCause, PeerException, ProtocolError, Result};
use peerwire::pipeline::{ChannelHandler, ChannelInfo, Frame, HandlerContext, InboundHandler, Pipeline};
use peerwire::protocol::future::{FutureResponse, FutureState};
use peerwire::protocol::request::{
    PeerBean, PeerStatusListener, RequestHandler, ResponseDisposition,
};

#[derive(Default)]
struct RecordingListener {
    found: Mutex<Vec<PeerAddress>>,
    failed: Mutex<Vec<(PeerAddress, AbortCause)>>,
}

impl PeerStatusListener for RecordingListener {
    fn peer_found(&self, remote: &PeerAddress) {
        self.found.lock().unwrap().push(remote.clone());
    }

    fn peer_failed(&self, remote: &PeerAddress, exception: &PeerException) {
        self.failed
            .lock()
            .unwrap()
            .push((remote.clone(), exception.cause));
    }
}

fn sock(s: &str) -> SocketAddr {
    s.parse().unwrap()
}

fn local() -> PeerAddress {
    PeerAddress::from_socket(PeerId::from_u64(1), sock("127.0.0.1:7700"))
}

fn remote() -> PeerAddress {
    PeerAddress::from_socket(PeerId::from_u64(2), sock("127.0.0.1:7701"))
}

struct Fixture {
    handler: RequestHandler,
    listener: Arc<RecordingListener>,
    request: Message,
}

fn fixture_with(request: Message) -> Fixture {
    let bean = Arc::new(PeerBean::new(local()));
    let listener = Arc::new(RecordingListener::default());
    bean.add_listener(listener.clone());
    let handler = RequestHandler::new(FutureResponse::new(request.clone()), bean);
    Fixture {
        handler,
        listener,
        request,
    }
}

fn request_to(recipient: PeerAddress) -> Message {
    let mut msg = Message::new();
    msg.set_message_id(4242)
        .set_version(1)
        .set_type(MessageType::Request2)
        .set_command(commands::GET)
        .set_sender(local())
        .set_recipient(recipient);
    msg
}

fn fixture() -> Fixture {
    fixture_with(request_to(remote()))
}

fn reply(f: &Fixture, message_type: MessageType) -> Message {
    Message::response_to(&f.request, &remote(), message_type)
}

fn failure_cause(f: &Fixture) -> AbortCause {
    f.handler.future().failure().unwrap().cause
}

#[test]
fn test_fire_and_forget_completes_empty() {
    let f = fixture();
    assert_eq!(
        f.handler.response_message_received(None),
        ResponseDisposition::Completed
    );
    assert!(f.handler.future().is_success());
    assert!(f.handler.future().response().is_none());
    assert!(f.listener.found.lock().unwrap().is_empty());
}

#[test]
fn test_unknown_id_is_peer_abort() {
    let f = fixture();
    f.handler
        .response_message_received(Some(reply(&f, MessageType::UnknownId)));
    assert_eq!(failure_cause(&f), AbortCause::PeerAbort);

    let failed = f.listener.failed.lock().unwrap();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].0, remote());
    assert_eq!(failed[0].1, AbortCause::PeerAbort);
}

#[test]
fn test_exception_reply_is_peer_abort() {
    let f = fixture();
    f.handler
        .response_message_received(Some(reply(&f, MessageType::Exception)));
    assert_eq!(failure_cause(&f), AbortCause::PeerAbort);
    assert_eq!(f.listener.failed.lock().unwrap().len(), 1);
}

#[test]
fn test_incoming_request_is_ignored() {
    let f = fixture();
    let stray = request_to(local());
    assert_eq!(
        f.handler.response_message_received(Some(stray)),
        ResponseDisposition::NotForThisRequest
    );
    assert!(matches!(f.handler.future().state(), FutureState::Pending));
    assert!(f.listener.failed.lock().unwrap().is_empty());
}

#[test]
fn test_wrong_message_id_is_peer_abort() {
    let f = fixture();
    let mut r = reply(&f, MessageType::Ok);
    r.set_message_id(4243);
    f.handler.response_message_received(Some(r));
    assert_eq!(failure_cause(&f), AbortCause::PeerAbort);
    assert!(f.listener.found.lock().unwrap().is_empty());
}

#[test]
fn test_reply_for_other_requester_is_peer_abort() {
    let f = fixture();
    let mut r = reply(&f, MessageType::Ok);
    r.set_recipient(PeerAddress::from_socket(PeerId::from_u64(99), sock("127.0.0.1:1")));
    f.handler.response_message_received(Some(r));
    assert_eq!(failure_cause(&f), AbortCause::PeerAbort);
}

#[test]
fn test_relay_flag_mismatch_is_peer_abort() {
    let f = fixture();
    let mut r = reply(&f, MessageType::Ok);
    r.set_sender(remote().with_relayed(true));
    f.handler.response_message_received(Some(r));
    assert_eq!(failure_cause(&f), AbortCause::PeerAbort);
}

#[test]
fn test_relay_flag_mismatch_allowed_for_rcon() {
    let mut request = request_to(remote());
    request.set_command(commands::RCON);
    let f = fixture_with(request);

    let mut r = reply(&f, MessageType::Ok);
    r.set_sender(remote().with_relayed(true));
    f.handler.response_message_received(Some(r));
    assert!(f.handler.future().is_success());
}

#[test]
fn test_ok_reply_completes_and_reports_peer_found() {
    let f = fixture();
    let r = reply(&f, MessageType::Ok);
    assert_eq!(
        f.handler.response_message_received(Some(r)),
        ResponseDisposition::Completed
    );

    let response = f.handler.future().response().unwrap();
    assert_eq!(response.message_id(), 4242);
    assert_eq!(response.message_type(), MessageType::Ok);
    assert_eq!(f.listener.found.lock().unwrap().as_slice(), &[remote()]);
}

#[test]
fn test_not_found_still_marks_peer_alive() {
    let f = fixture();
    f.handler
        .response_message_received(Some(reply(&f, MessageType::NotFound)));
    assert!(f.handler.future().is_success());
    assert_eq!(f.listener.found.lock().unwrap().len(), 1);
}

#[test]
fn test_cancel_reply_completes_without_peer_found() {
    let f = fixture();
    f.handler
        .response_message_received(Some(reply(&f, MessageType::Cancel)));
    assert!(f.handler.future().is_success());
    assert!(f.listener.found.lock().unwrap().is_empty());
}

#[test]
fn test_streaming_reply_keeps_future_pending() {
    let f = fixture();
    let mut part = reply(&f, MessageType::PartiallyOk);
    part.set_streaming(true);

    assert_eq!(
        f.handler.response_message_received(Some(part)),
        ResponseDisposition::AwaitMore
    );
    assert!(matches!(f.handler.future().state(), FutureState::Pending));
    assert_eq!(f.listener.found.lock().unwrap().len(), 1);

    let last = reply(&f, MessageType::Ok);
    assert_eq!(
        f.handler.response_message_received(Some(last)),
        ResponseDisposition::Completed
    );
    assert!(f.handler.future().is_success());
}

#[test]
fn test_relayed_sender_addresses_refreshed() {
    let relayed = remote().with_relayed(true);
    let f = fixture_with(request_to(relayed.clone()));

    let fresh = vec![PeerSocketAddress::new(
        "10.0.0.9".parse().unwrap(),
        9000,
        9001,
    )];
    let mut r = Message::response_to(&f.request, &relayed, MessageType::Ok);
    r.set_peer_socket_addresses(fresh.clone()).unwrap();
    f.handler.response_message_received(Some(r));

    let response = f.handler.future().response().unwrap();
    assert_eq!(response.sender().relays(), fresh.as_slice());
    let found = f.listener.found.lock().unwrap();
    assert_eq!(found[0].relays(), fresh.as_slice());
}

#[test]
fn test_user_abort_is_not_reported() {
    let f = fixture();
    f.handler
        .exception_caught(PeerException::user_abort("shutting down"));
    assert_eq!(failure_cause(&f), AbortCause::UserAbort);
    assert!(f.listener.failed.lock().unwrap().is_empty());
}

#[test]
fn test_timeout_is_reported() {
    let f = fixture();
    f.handler
        .exception_caught(PeerException::new(AbortCause::Timeout, "no answer"));
    assert_eq!(failure_cause(&f), AbortCause::Timeout);
    assert_eq!(
        f.listener.failed.lock().unwrap().as_slice(),
        &[(remote(), AbortCause::Timeout)]
    );
}

#[test]
fn test_exception_after_completion_is_ignored() {
    let f = fixture();
    f.handler
        .response_message_received(Some(reply(&f, MessageType::Ok)));
    f.handler
        .exception_caught(PeerException::peer_abort("late"));

    assert!(f.handler.future().is_success());
    assert!(f.listener.failed.lock().unwrap().is_empty());
}

#[test]
fn test_removed_listener_not_notified() {
    let bean = Arc::new(PeerBean::new(local()));
    let listener = Arc::new(RecordingListener::default());
    let as_dyn: Arc<dyn PeerStatusListener> = listener.clone();
    bean.add_listener(as_dyn.clone());
    assert!(bean.remove_listener(&as_dyn));
    assert!(!bean.remove_listener(&as_dyn));
    assert_eq!(bean.listener_count(), 0);

    let request = request_to(remote());
    let handler = RequestHandler::new(FutureResponse::new(request.clone()), bean);
    handler.response_message_received(Some(Message::response_to(
        &request,
        &remote(),
        MessageType::Ok,
    )));
    assert!(listener.found.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_waiter_sees_completion() {
    let f = fixture();
    let future = f.handler.future().clone();
    let waiter = tokio::spawn(async move { future.await_response().await });

    f.handler
        .response_message_received(Some(reply(&f, MessageType::Ok)));
    let response = waiter.await.unwrap().unwrap().unwrap();
    assert_eq!(response.message_id(), 4242);
}

/// Collects the ids of messages passed down the inbound chain.
#[derive(Clone, Default)]
struct Downstream {
    seen: Arc<Mutex<Vec<u32>>>,
}

impl ChannelHandler for Downstream {
    fn create_new_instance(&self) -> Box<dyn ChannelHandler> {
        Box::new(self.clone())
    }

    fn as_inbound(&mut self) -> Option<&mut dyn InboundHandler> {
        Some(self)
    }
}

impl InboundHandler for Downstream {
    fn read(&mut self, _ctx: &mut HandlerContext<'_>, frame: Frame) -> Result<Option<Frame>> {
        if let Frame::Message(m) = &frame {
            self.seen.lock().unwrap().push(m.message_id());
        }
        Ok(None)
    }
}

fn request_channel(f: &Fixture) -> (Pipeline, Downstream) {
    let downstream = Downstream::default();
    let mut pipeline = Pipeline::new(ChannelInfo::new(
        sock("127.0.0.1:7700"),
        Some(sock("127.0.0.1:7701")),
        false,
    ));
    pipeline
        .add_last("request", Box::new(f.handler.clone()))
        .unwrap()
        .add_last("downstream", Box::new(downstream.clone()))
        .unwrap();
    (pipeline, downstream)
}

#[test]
fn test_inbound_request_flows_to_next_handler() {
    let f = fixture();
    let (mut pipeline, downstream) = request_channel(&f);

    let mut incoming = Message::new();
    incoming
        .set_message_id(77)
        .set_type(MessageType::Request1)
        .set_command(commands::PING)
        .set_sender(remote())
        .set_recipient(local());
    pipeline.fire_read(Frame::message(incoming));

    assert_eq!(downstream.seen.lock().unwrap().as_slice(), &[77]);
    assert!(matches!(f.handler.future().state(), FutureState::Pending));
    assert!(!pipeline.is_close_requested());
}

#[test]
fn test_reply_is_consumed_by_request_handler() {
    let f = fixture();
    let (mut pipeline, downstream) = request_channel(&f);

    pipeline.fire_read(Frame::message(reply(&f, MessageType::Ok)));

    assert!(f.handler.future().is_success());
    assert!(downstream.seen.lock().unwrap().is_empty());
    assert!(pipeline.is_close_requested());
}

/// Fails every read with a fixed error, ahead of the request handler.
#[derive(Clone)]
struct FailingRead {
    error: fn() -> ProtocolError,
}

impl ChannelHandler for FailingRead {
    fn create_new_instance(&self) -> Box<dyn ChannelHandler> {
        Box::new(self.clone())
    }

    fn as_inbound(&mut self) -> Option<&mut dyn InboundHandler> {
        Some(self)
    }
}

impl InboundHandler for FailingRead {
    fn read(&mut self, _ctx: &mut HandlerContext<'_>, _frame: Frame) -> Result<Option<Frame>> {
        Err((self.error)())
    }
}

fn fail_channel_with(error: fn() -> ProtocolError) -> Fixture {
    let f = fixture();
    let mut pipeline = Pipeline::new(ChannelInfo::new(
        sock("127.0.0.1:7700"),
        Some(sock("127.0.0.1:7701")),
        true,
    ));
    pipeline
        .add_last("failing", Box::new(FailingRead { error }))
        .unwrap()
        .add_last("request", Box::new(f.handler.clone()))
        .unwrap();
    pipeline.fire_read(Frame::message(Message::new()));
    f
}

#[test]
fn test_local_failure_not_blamed_on_peer() {
    let f = fail_channel_with(|| ProtocolError::OversizedPacket(2000));
    assert_eq!(failure_cause(&f), AbortCause::UserAbort);
    assert!(f.listener.failed.lock().unwrap().is_empty());
}

#[test]
fn test_transport_failure_reported_as_peer_error() {
    let f = fail_channel_with(|| ProtocolError::ConnectionClosed);
    assert_eq!(failure_cause(&f), AbortCause::PeerError);
    assert_eq!(
        f.listener.failed.lock().unwrap().as_slice(),
        &[(remote(), AbortCause::PeerError)]
    );
}

#[test]
fn test_error_classification() {
    for local in [
        ProtocolError::OversizedPacket(1500),
        ProtocolError::Encode("bad section".into()),
        ProtocolError::Signature("no signing key attached".into()),
        ProtocolError::State("full".into()),
    ] {
        assert!(local.is_local(), "{local}");
        assert_eq!(local.into_peer_exception().cause, AbortCause::UserAbort);
    }
    let timeout = ProtocolError::Timeout;
    assert!(!timeout.is_local());
    assert_eq!(timeout.into_peer_exception().cause, AbortCause::Timeout);
    let io = ProtocolError::from(std::io::Error::from(std::io::ErrorKind::ConnectionRefused));
    assert_eq!(io.into_peer_exception().cause, AbortCause::PeerError);
}
