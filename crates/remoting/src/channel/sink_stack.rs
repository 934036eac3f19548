//! Channel sink stacks
//!
//! A sink that needs its per-call state back on the reply path pushes a
//! frame before forwarding. On the way back the frame is popped and the
//! response handed to its sink.
//!
//! ```text
//!   push(A) push(B) push(C)         pop(B) discards C and returns B's state
//!   ┌───┐                           ┌───┐
//!   │ C │ top                       │ A │
//!   │ B │                           └───┘
//!   │ A │
//!   └───┘
//! ```
//!
//! On the server a sink that completes later stores its frame instead.
//! `store_and_dispatch` moves the stored frames back onto the stack, the
//! first stored ending on top, and dispatches the pending request once.
//! When the last frame has handled the response, it goes to the stack's
//! responder, if the transport registered one.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::{debug, warn};

use super::{ChannelMessage, ClientChannelSink, ServerChannelSink, SinkState};
use crate::error::{RemotingError, Result};
use crate::message::Message;
use crate::sink::{deliver, MessageControl, MessageSink};

fn same_sink<T: ?Sized>(a: &Arc<T>, b: &Arc<T>) -> bool {
    Arc::as_ptr(a).cast::<()>() == Arc::as_ptr(b).cast::<()>()
}

struct Frame<S: ?Sized> {
    sink: Arc<S>,
    state: Option<SinkState>,
}

/// Remove the topmost frame for `sink` and everything above it
fn pop_frame<S: ?Sized>(frames: &mut Vec<Frame<S>>, sink: &Arc<S>, name: &str) -> Result<Option<SinkState>> {
    if frames.is_empty() {
        return Err(RemotingError::SinkStackEmpty);
    }
    let pos = frames
        .iter()
        .rposition(|f| same_sink(&f.sink, sink))
        .ok_or_else(|| RemotingError::SinkStackFrameNotFound(name.to_string()))?;
    let discarded = frames.len() - pos - 1;
    if discarded > 0 {
        debug!(sink = name, discarded, "discarding frames above popped sink");
    }
    let mut removed = frames.split_off(pos);
    Ok(removed.swap_remove(0).state)
}

#[derive(Default)]
struct ServerFrames {
    active: Vec<Frame<dyn ServerChannelSink>>,
    remembered: Vec<Frame<dyn ServerChannelSink>>,
    pending: Option<(Message, Arc<dyn MessageSink>)>,
}

impl ServerFrames {
    /// Index of the topmost active frame for `sink`
    fn position(&self, sink: &Arc<dyn ServerChannelSink>) -> Result<usize> {
        if self.active.is_empty() {
            warn!(sink = sink.name(), "store on empty server sink stack");
            return Err(RemotingError::SinkStackEmpty);
        }
        self.active
            .iter()
            .rposition(|f| same_sink(&f.sink, sink))
            .ok_or_else(|| RemotingError::SinkStackFrameNotFound(sink.name().to_string()))
    }

    fn remember(&mut self, pos: usize, state: Option<SinkState>) {
        let frame = self.active.remove(pos);
        self.remembered.push(Frame {
            sink: frame.sink,
            state,
        });
    }
}

/// Receives the finished response of an asynchronously handled request
pub type ServerResponder = Box<dyn FnOnce(ChannelMessage) + Send>;

/// Sink stack for one request on the server side
#[derive(Default)]
pub struct ServerSinkStack {
    frames: Mutex<ServerFrames>,
    responder: Mutex<Option<ServerResponder>>,
}

impl ServerSinkStack {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Stack whose finished response goes to `responder`
    pub fn with_responder(responder: impl FnOnce(ChannelMessage) + Send + 'static) -> Arc<Self> {
        let stack = Self::default();
        *stack.responder.lock() = Some(Box::new(responder));
        Arc::new(stack)
    }

    pub fn push(&self, sink: Arc<dyn ServerChannelSink>, state: Option<SinkState>) {
        self.frames.lock().active.push(Frame { sink, state });
    }

    /// Remove `sink`'s frame, discarding frames above it, and return its state
    pub fn pop(&self, sink: &Arc<dyn ServerChannelSink>) -> Result<Option<SinkState>> {
        let result = pop_frame(&mut self.frames.lock().active, sink, sink.name());
        if let Err(e) = &result {
            warn!(sink = sink.name(), error = %e, "server sink stack misuse");
        }
        result
    }

    /// Move `sink`'s frame aside, with `state`, for an asynchronous reply
    ///
    /// Frames above it stay where they are.
    pub fn store(&self, sink: &Arc<dyn ServerChannelSink>, state: Option<SinkState>) -> Result<()> {
        let mut frames = self.frames.lock();
        let pos = frames.position(sink)?;
        frames.remember(pos, state);
        Ok(())
    }

    /// Request the next `store_and_dispatch` sends into `dispatcher`
    pub fn set_pending_dispatch(&self, request: Message, dispatcher: Arc<dyn MessageSink>) {
        self.frames.lock().pending = Some((request, dispatcher));
    }

    /// Store `sink`, restore every stored frame and dispatch the pending
    /// request
    ///
    /// The reply travels back through [`ServerSinkStack::async_process_response`].
    pub fn store_and_dispatch(
        self: &Arc<Self>,
        sink: &Arc<dyn ServerChannelSink>,
        state: Option<SinkState>,
    ) -> Result<Option<Arc<dyn MessageControl>>> {
        let (request, dispatcher) = {
            let mut frames = self.frames.lock();
            let pos = frames.position(sink)?;
            let others = frames.active.len() - 1;
            if others > 0 {
                warn!(sink = sink.name(), frames = others, "store and dispatch with other frames active");
                return Err(RemotingError::SinkStackNotEmpty(others));
            }
            let (request, dispatcher) = frames
                .pending
                .take()
                .ok_or_else(|| RemotingError::InvalidMessage("no request to dispatch".into()))?;
            frames.remember(pos, state);
            let mut remembered = std::mem::take(&mut frames.remembered);
            remembered.reverse();
            frames.active = remembered;
            (request, dispatcher)
        };

        debug!(frames = self.depth(), "dispatching stored server frames");
        let reply_sink: Option<Arc<dyn MessageSink>> = if request.is_one_way() {
            None
        } else {
            Some(Arc::new(ServerStackReplySink { stack: self.clone() }))
        };
        Ok(dispatcher.async_process_message(request, reply_sink))
    }

    /// Hand a response to the sink on top of the stack
    ///
    /// Once every frame is gone the response goes to the responder, once.
    pub fn async_process_response(self: &Arc<Self>, response: ChannelMessage) -> Result<()> {
        let frame = self.frames.lock().active.pop();
        if let Some(frame) = frame {
            return frame.sink.async_process_response(self, frame.state, response);
        }
        let responder = self.responder.lock().take();
        match responder {
            Some(respond) => {
                respond(response);
                Ok(())
            }
            None => {
                warn!("async response on empty server sink stack");
                Err(RemotingError::SinkStackEmpty)
            }
        }
    }

    /// Ask the sink on top of the stack for a response stream
    ///
    /// The frame stays on the stack.
    pub fn get_response_stream(self: &Arc<Self>, response: &ChannelMessage) -> Result<Option<Bytes>> {
        let frame = self.frames.lock().active.pop();
        let Some(frame) = frame else {
            return Err(RemotingError::SinkStackEmpty);
        };
        let stream = frame.sink.get_response_stream(self, frame.state.as_ref(), response);
        self.frames.lock().active.push(frame);
        Ok(stream)
    }

    /// Active frames
    pub fn depth(&self) -> usize {
        self.frames.lock().active.len()
    }

    /// Stored frames waiting for dispatch
    pub fn remembered_depth(&self) -> usize {
        self.frames.lock().remembered.len()
    }

    /// Sink names from the top of the active stack down
    pub fn sink_names(&self) -> Vec<&'static str> {
        self.frames.lock().active.iter().rev().map(|f| f.sink.name()).collect()
    }
}

impl fmt::Debug for ServerSinkStack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerSinkStack")
            .field("active", &self.sink_names())
            .field("remembered", &self.remembered_depth())
            .finish()
    }
}

/// Reply sink feeding a dispatched reply back into a server sink stack
pub struct ServerStackReplySink {
    stack: Arc<ServerSinkStack>,
}

impl MessageSink for ServerStackReplySink {
    fn sync_process_message(&self, msg: Message) -> Message {
        if let Err(e) = self.stack.async_process_response(ChannelMessage::from_message(msg.clone())) {
            warn!(error = %e, "async server response could not be processed");
        }
        msg
    }

    fn async_process_message(
        &self,
        msg: Message,
        reply_sink: Option<Arc<dyn MessageSink>>,
    ) -> Option<Arc<dyn MessageControl>> {
        let reply = self.sync_process_message(msg);
        deliver(reply_sink.as_ref(), reply);
        None
    }

    fn next_sink(&self) -> Option<Arc<dyn MessageSink>> {
        None
    }

    fn name(&self) -> &'static str {
        "ServerStackReplySink"
    }
}

/// Sink stack for one asynchronous request on the client side
///
/// The bottom of the stack is the reply sink of the original call; it
/// receives the reply exactly once.
pub struct ClientSinkStack {
    frames: Mutex<Vec<Frame<dyn ClientChannelSink>>>,
    reply_sink: Mutex<Option<Arc<dyn MessageSink>>>,
}

impl ClientSinkStack {
    /// `reply_sink` is `None` for one-way calls
    pub fn new(reply_sink: Option<Arc<dyn MessageSink>>) -> Arc<Self> {
        Arc::new(Self {
            frames: Mutex::new(Vec::new()),
            reply_sink: Mutex::new(reply_sink),
        })
    }

    pub fn push(&self, sink: Arc<dyn ClientChannelSink>, state: Option<SinkState>) {
        self.frames.lock().push(Frame { sink, state });
    }

    pub fn pop(&self, sink: &Arc<dyn ClientChannelSink>) -> Result<Option<SinkState>> {
        let result = pop_frame(&mut self.frames.lock(), sink, sink.name());
        if let Err(e) = &result {
            warn!(sink = sink.name(), error = %e, "client sink stack misuse");
        }
        result
    }

    /// Hand a response to the sink on top of the stack
    pub fn async_process_response(self: &Arc<Self>, response: ChannelMessage) -> Result<()> {
        let frame = self.frames.lock().pop();
        let Some(frame) = frame else {
            warn!("async response on empty client sink stack");
            return Err(RemotingError::SinkStackEmpty);
        };
        frame.sink.async_process_response(self, frame.state, response)
    }

    /// Deliver the reply to the original caller
    pub fn dispatch_reply_message(&self, reply: Message) {
        let sink = self.reply_sink.lock().take();
        deliver(sink.as_ref(), reply);
    }

    /// Deliver a failure to the original caller
    pub fn dispatch_exception(&self, error: RemotingError) {
        self.dispatch_reply_message(Message::fault(error));
    }

    pub fn depth(&self) -> usize {
        self.frames.lock().len()
    }

    /// Whether the reply has not been delivered yet
    pub fn is_pending(&self) -> bool {
        self.reply_sink.lock().is_some()
    }
}
