//! Connection to a jsrdbg target.
//!
//! Owns outgoing request correlation (command id -> one-shot response handler)
//! and the single inbound dispatch point. Responses that answer a registered
//! request settle the caller's [`PendingReply`]; everything else goes to the
//! session [`Coordinator`].

use crate::error::Error;
use crate::protocol::{Command, Response};
use crate::transport::Transport;
use log::{debug, error, info, warn};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

/// Marker the target embeds in its own internal values; those are never
/// candidates for the encoding-recovery heuristic.
const PROTOCOL_MARKER: &str = "jsrdbg";

/// One-shot handler for the response to a single command.
pub type ResponseHandler = Box<dyn FnOnce(Response) -> anyhow::Result<Value> + Send>;

/// Session-level events a [`Coordinator`] may emit through the connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    NewContext {
        id: i64,
        name: String,
        stopped: bool,
    },
}

/// What both the real connection and test doubles look like to a coordinator.
pub trait ConnectionLike {
    fn emit(&self, event: ConnectionEvent);
    fn send_request(
        &self,
        command: Command,
        handler: Option<ResponseHandler>,
    ) -> Result<PendingReply, Error>;
    fn handle_response(&self, response: Response) -> Result<(), Error>;
    fn disconnect(&self) -> Result<(), Error>;
}

/// Owner of all session-level interpretation of unsolicited or
/// context-initiated responses.
pub trait Coordinator: Send {
    fn handle_response(&mut self, connection: &dyn ConnectionLike, response: Response);
}

struct PendingRequest {
    handler: ResponseHandler,
    reply: Sender<anyhow::Result<Value>>,
}

/// Settles once the matching response handler has run to completion, or
/// immediately for fire-and-forget requests.
pub struct PendingReply {
    rx: Receiver<anyhow::Result<Value>>,
}

impl PendingReply {
    /// Block until the reply settles. There is no timeout: a request the
    /// target never answers waits until the connection is torn down.
    pub fn wait(self) -> anyhow::Result<Value> {
        match self.rx.recv() {
            Ok(result) => result,
            Err(_) => Err(Error::ConnectionClosed.into()),
        }
    }
}

pub struct Connection {
    pending: Mutex<HashMap<String, PendingRequest>>,
    transport: Mutex<Box<dyn Transport>>,
    coordinator: Mutex<Box<dyn Coordinator>>,
    events: Mutex<Sender<ConnectionEvent>>,
}

impl Connection {
    /// Create a connection over the write half of a transport. Inbound traffic
    /// is attached separately with [`spawn_dispatch`].
    pub fn new(
        transport: Box<dyn Transport>,
        coordinator: Box<dyn Coordinator>,
    ) -> (Arc<Self>, Receiver<ConnectionEvent>) {
        let (events, events_rx) = channel();
        let connection = Arc::new(Self {
            pending: Mutex::new(HashMap::new()),
            transport: Mutex::new(transport),
            coordinator: Mutex::new(coordinator),
            events: Mutex::new(events),
        });
        (connection, events_rx)
    }

    fn register_handler(
        &self,
        command_id: &str,
        handler: ResponseHandler,
        reply: Sender<anyhow::Result<Value>>,
    ) {
        debug!(target: "connection", "register handler for command id \"{command_id}\"");
        let mut pending = self.pending.lock().unwrap();
        if pending
            .insert(command_id.to_string(), PendingRequest { handler, reply })
            .is_some()
        {
            // Last writer wins. Dropping the displaced entry settles its
            // waiter with an error instead of leaving it pending forever.
            warn!(
                target: "connection",
                "duplicate handler registration for command id \"{command_id}\""
            );
        }
    }

    /// Remove and return the pending entry for `id`, if any. A lookup hit that
    /// yields no entry means the pending table is corrupt and the dispatch
    /// must abort.
    fn take_pending(&self, id: &str) -> Result<Option<PendingRequest>, Error> {
        let mut pending = self.pending.lock().unwrap();
        if !pending.contains_key(id) {
            return Ok(None);
        }
        pending
            .remove(id)
            .map(Some)
            .ok_or_else(|| Error::CorrelationDefect(id.to_string()))
    }
}

impl ConnectionLike for Connection {
    fn emit(&self, event: ConnectionEvent) {
        _ = self.events.lock().unwrap().send(event);
    }

    /// Send `command` to the target.
    ///
    /// With a handler the reply settles only after the handler has run, and
    /// the handler's error becomes the reply's error. Without one, the reply
    /// settles right after the message is handed to the transport. Exactly one
    /// outbound message is transmitted either way.
    fn send_request(
        &self,
        command: Command,
        handler: Option<ResponseHandler>,
    ) -> Result<PendingReply, Error> {
        let (tx, rx) = channel();
        let fire_and_forget = handler.is_none();

        // Registration happens before transmission so a fast response cannot
        // race past its handler.
        if let Some(handler) = handler {
            self.register_handler(&command.id, handler, tx.clone());
        }

        let message = command.to_wire()?;
        debug!(target: "connection", "send request: {}", message.trim_end());
        self.transport.lock().unwrap().send_message(&message)?;

        if fire_and_forget {
            _ = tx.send(Ok(Value::Null));
        }
        Ok(PendingReply { rx })
    }

    /// Single dispatch point for every inbound message.
    fn handle_response(&self, mut response: Response) -> Result<(), Error> {
        debug!(
            target: "connection",
            "handle response: type={:?} subtype={:?}",
            response.r#type,
            response.subtype
        );

        repair_variable_values(&mut response);

        if let Some(id) = response.command_id().map(str::to_string) {
            if let Some(request) = self.take_pending(&id)? {
                debug!(target: "connection", "found a response handler for response id \"{id}\"");
                // The entry is already removed, handler failure cannot leave
                // it registered.
                let result = (request.handler)(response);
                _ = request.reply.send(result);
                return Ok(());
            }
        }

        // No handler registered; the coordinator owns session-level
        // interpretation of this message.
        self.coordinator
            .lock()
            .unwrap()
            .handle_response(self, response);
        Ok(())
    }

    fn disconnect(&self) -> Result<(), Error> {
        self.transport.lock().unwrap().disconnect()
    }
}

/// Pump inbound messages from `source` into the connection until the channel
/// closes or dispatch hits an unrecoverable correlation defect.
pub fn spawn_dispatch(
    connection: Arc<Connection>,
    mut source: Box<dyn Transport>,
) -> JoinHandle<()> {
    thread::spawn(move || loop {
        let response = match source.read_message() {
            Ok(response) => response,
            Err(Error::ConnectionClosed) => {
                info!(target: "connection", "target closed the connection");
                break;
            }
            Err(err) => {
                warn!(target: "connection", "inbound read failed: {err}");
                break;
            }
        };
        if let Err(err) = connection.handle_response(response) {
            error!(target: "connection", "dispatch aborted: {err}");
            break;
        }
    })
}

/// Known target defect: a `variables` response occasionally carries values
/// that already went through one UTF-8 decode, showing up as mojibake on the
/// front-end. Re-decode each nested variable value and keep the result only
/// when it is sound.
fn repair_variable_values(response: &mut Response) {
    if response.subtype.as_deref() != Some("variables") {
        return;
    }
    let Some(first) = response
        .content
        .get_mut("variables")
        .and_then(Value::as_array_mut)
        .and_then(|variables| variables.first_mut())
    else {
        return;
    };
    let Some(nested) = first.get_mut("variables").and_then(Value::as_array_mut) else {
        return;
    };

    for variable in nested {
        let Some(object) = variable.as_object_mut() else {
            continue;
        };
        let Some(value) = object.get("value").and_then(Value::as_str) else {
            continue;
        };
        if value.contains(PROTOCOL_MARKER) {
            continue;
        }
        if let Some(repaired) = undo_double_decode(value) {
            object.insert("value".to_string(), Value::String(repaired));
        }
    }
}

/// A double-decoded string only holds chars in U+0000..=U+00FF (the original
/// UTF-8 bytes read back one by one). Reinterpret the chars as bytes and
/// decode them as UTF-8; a replacement character in the result means the value
/// was fine as delivered, so the original is kept. Never fails, worst case it
/// is a no-op.
fn undo_double_decode(value: &str) -> Option<String> {
    let mut bytes = Vec::with_capacity(value.len());
    for ch in value.chars() {
        let code = u32::from(ch);
        if code > 0xFF {
            return None;
        }
        bytes.push(code as u8);
    }
    match String::from_utf8(bytes) {
        Ok(decoded) if !decoded.contains(char::REPLACEMENT_CHARACTER) => Some(decoded),
        _ => None,
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    #[derive(Default, Clone)]
    struct MockTransport {
        sent: Arc<Mutex<Vec<String>>>,
    }

    impl Transport for MockTransport {
        fn send_message(&mut self, message: &str) -> Result<(), Error> {
            self.sent.lock().unwrap().push(message.to_string());
            Ok(())
        }

        fn read_message(&mut self) -> Result<Response, Error> {
            Err(Error::ConnectionClosed)
        }

        fn disconnect(&mut self) -> Result<(), Error> {
            Ok(())
        }
    }

    #[derive(Default, Clone)]
    struct RecordingCoordinator {
        responses: Arc<Mutex<Vec<Response>>>,
    }

    impl Coordinator for RecordingCoordinator {
        fn handle_response(&mut self, _connection: &dyn ConnectionLike, response: Response) {
            self.responses.lock().unwrap().push(response);
        }
    }

    fn make_connection() -> (Arc<Connection>, MockTransport, RecordingCoordinator) {
        let transport = MockTransport::default();
        let coordinator = RecordingCoordinator::default();
        let (connection, _events) =
            Connection::new(Box::new(transport.clone()), Box::new(coordinator.clone()));
        (connection, transport, coordinator)
    }

    fn response_for(id: &str) -> Response {
        serde_json::from_value(json!({"type": "info", "content": {"id": id, "value": 42}}))
            .unwrap()
    }

    #[test]
    fn test_handler_invoked_once_then_removed() {
        let (connection, transport, coordinator) = make_connection();

        let command = Command::new("evaluate");
        let id = command.id.clone();
        let reply = connection
            .send_request(
                command,
                Some(Box::new(|response| {
                    Ok(response.content["value"].clone())
                })),
            )
            .unwrap();

        assert_eq!(transport.sent.lock().unwrap().len(), 1);

        connection.handle_response(response_for(&id)).unwrap();
        assert_eq!(reply.wait().unwrap(), json!(42));

        // Same id again: the handler is gone, the coordinator takes over.
        connection.handle_response(response_for(&id)).unwrap();
        assert_eq!(coordinator.responses.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_handler_error_propagates_and_entry_is_still_removed() {
        let (connection, _, coordinator) = make_connection();

        let command = Command::new("evaluate");
        let id = command.id.clone();
        let reply = connection
            .send_request(
                command,
                Some(Box::new(|_| anyhow::bail!("evaluation blew up"))),
            )
            .unwrap();

        connection.handle_response(response_for(&id)).unwrap();
        let err = reply.wait().unwrap_err();
        assert!(err.to_string().contains("evaluation blew up"));

        connection.handle_response(response_for(&id)).unwrap();
        assert_eq!(coordinator.responses.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_unmatched_response_goes_to_coordinator_exactly_once() {
        let (connection, _, coordinator) = make_connection();

        connection.handle_response(response_for("nobody")).unwrap();

        let responses = coordinator.responses.lock().unwrap();
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0].command_id(), Some("nobody"));
    }

    #[test]
    fn test_fire_and_forget_settles_immediately() {
        let (connection, transport, _) = make_connection();

        let reply = connection.send_request(Command::new("next"), None).unwrap();
        assert_eq!(reply.wait().unwrap(), Value::Null);
        assert_eq!(transport.sent.lock().unwrap().len(), 1);
        assert!(connection.pending.lock().unwrap().is_empty());
    }

    #[test]
    fn test_duplicate_registration_fails_displaced_waiter() {
        let (connection, _, _) = make_connection();

        let mut command = Command::new("evaluate");
        command.id = "fixed".to_string();
        let first = connection
            .send_request(command, Some(Box::new(|_| Ok(Value::Null))))
            .unwrap();

        let mut command = Command::new("evaluate");
        command.id = "fixed".to_string();
        let second = connection
            .send_request(
                command,
                Some(Box::new(|response| Ok(response.content["value"].clone()))),
            )
            .unwrap();

        // The displaced waiter errors out instead of hanging.
        assert!(first.wait().is_err());

        connection.handle_response(response_for("fixed")).unwrap();
        assert_eq!(second.wait().unwrap(), json!(42));
    }

    fn variables_response(value: &str) -> Response {
        serde_json::from_value(json!({
            "type": "info",
            "subtype": "variables",
            "content": {
                "variables": [
                    {"name": "scope", "variables": [{"name": "v", "value": value}]}
                ]
            }
        }))
        .unwrap()
    }

    fn repaired_value(response: &Response) -> &str {
        response.content["variables"][0]["variables"][0]["value"]
            .as_str()
            .unwrap()
    }

    #[test]
    fn test_heuristic_keeps_ascii_untouched() {
        let mut response = variables_response("plain ascii value");
        repair_variable_values(&mut response);
        assert_eq!(repaired_value(&response), "plain ascii value");
    }

    #[test]
    fn test_heuristic_repairs_double_decoded_text() {
        // "Grüße" double-decoded: each UTF-8 byte came back as its own char.
        let mut response = variables_response("GrÃ¼Ã\u{9f}e");
        repair_variable_values(&mut response);
        assert_eq!(repaired_value(&response), "Grüße");
    }

    #[test]
    fn test_heuristic_restores_original_on_replacement_character() {
        // Bytes 0x61 0xE9 are not valid UTF-8, the re-decode must not win.
        let mut response = variables_response("a\u{e9}");
        repair_variable_values(&mut response);
        assert_eq!(repaired_value(&response), "a\u{e9}");

        // A re-decode that lands on U+FFFD is discarded as well.
        let mut response = variables_response("\u{ef}\u{bf}\u{bd}");
        repair_variable_values(&mut response);
        assert_eq!(repaired_value(&response), "\u{ef}\u{bf}\u{bd}");
    }

    #[test]
    fn test_heuristic_skips_protocol_internal_values() {
        let mut response = variables_response("jsrdbg: GrÃ¼Ã\u{9f}e");
        repair_variable_values(&mut response);
        assert_eq!(repaired_value(&response), "jsrdbg: GrÃ¼Ã\u{9f}e");
    }

    #[test]
    fn test_heuristic_ignores_other_subtypes() {
        let mut response: Response = serde_json::from_value(json!({
            "type": "info",
            "content": {"variables": [{"variables": [{"value": "GrÃ¼Ã\u{9f}e"}]}]}
        }))
        .unwrap();
        repair_variable_values(&mut response);
        assert_eq!(repaired_value(&response), "GrÃ¼Ã\u{9f}e");
    }

    #[test]
    fn test_undo_double_decode_rejects_wide_chars() {
        // Already-correct text with chars above U+00FF cannot be byte-shaped.
        assert_eq!(undo_double_decode("日本語"), None);
    }
}
