use spop_frame::{Actions, Message};

/// Error type returned by request handlers.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Decides which variables to set for each NOTIFY.
///
/// `handle` runs on the blocking thread pool, so it may block. A returned
/// error (or a panic) is logged and answered with an empty ACK; the
/// connection stays up.
///
/// Closures work directly. Annotate the parameter types so the closure is
/// generic over the borrow:
///
/// ```
/// use spop_agent::{Actions, Handler, HandlerError, Messages, Scope};
///
/// fn assert_handler(_: impl Handler) {}
///
/// assert_handler(|messages: Messages<'_>, actions: &mut Actions| -> Result<(), HandlerError> {
///     for message in messages {
///         if message.name == "check" {
///             actions.set_var(Scope::Session, "result", true);
///         }
///     }
///     Ok(())
/// });
/// ```
pub trait Handler: Send + Sync + 'static {
    fn handle(&self, messages: Messages<'_>, actions: &mut Actions) -> Result<(), HandlerError>;
}

impl<F> Handler for F
where
    F: Fn(Messages<'_>, &mut Actions) -> Result<(), HandlerError> + Send + Sync + 'static,
{
    fn handle(&self, messages: Messages<'_>, actions: &mut Actions) -> Result<(), HandlerError> {
        self(messages, actions)
    }
}

/// Single-pass iterator over the messages of one NOTIFY, with the ids of the
/// frame they came in.
#[derive(Debug, Clone)]
pub struct Messages<'a> {
    engine_id: &'a str,
    stream_id: u64,
    frame_id: u64,
    inner: std::slice::Iter<'a, Message>,
}

impl<'a> Messages<'a> {
    pub fn new(engine_id: &'a str, stream_id: u64, frame_id: u64, messages: &'a [Message]) -> Self {
        Self {
            engine_id,
            stream_id,
            frame_id,
            inner: messages.iter(),
        }
    }

    /// Engine id announced in HELLO; empty when the proxy sent none.
    pub fn engine_id(&self) -> &'a str {
        self.engine_id
    }

    pub fn stream_id(&self) -> u64 {
        self.stream_id
    }

    pub fn frame_id(&self) -> u64 {
        self.frame_id
    }

    /// Next message with the given name, skipping the others.
    pub fn find_named(&mut self, name: &str) -> Option<&'a Message> {
        self.inner.by_ref().find(|message| message.name == name)
    }
}

impl<'a> Iterator for Messages<'a> {
    type Item = &'a Message;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.inner.size_hint()
    }
}

impl ExactSizeIterator for Messages<'_> {}
