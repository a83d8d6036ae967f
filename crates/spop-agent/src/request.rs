use spop_frame::{Actions, Message};

/// One fully reassembled NOTIFY and the actions produced for it.
///
/// Requests come from [`Pools`](crate::pool::Pools) and go back there once
/// their ACK is written, or when they are aborted or the connection closes.
#[derive(Debug, Default)]
pub struct Request {
    pub engine_id: String,
    pub stream_id: u64,
    pub frame_id: u64,
    pub messages: Vec<Message>,
    pub actions: Actions,
}

impl Request {
    /// Whether every field is back to its initial state.
    pub fn is_clear(&self) -> bool {
        self.engine_id.is_empty()
            && self.stream_id == 0
            && self.frame_id == 0
            && self.messages.is_empty()
            && self.actions.is_empty()
    }
}
