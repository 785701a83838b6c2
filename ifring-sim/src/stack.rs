//! A network stack stand-in that forwards every upcall to a channel.

use std::sync::Arc;

use ifring::{LinkState, Packet, Stack};
use tokio::sync::mpsc;

#[derive(Debug)]
pub enum StackEvent {
    Packet { qid: u16, pkt: Packet },
    Link(LinkState),
    Hung(u16),
}

pub struct ChannelStack {
    tx: mpsc::UnboundedSender<StackEvent>,
}

impl ChannelStack {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<StackEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(ChannelStack { tx }), rx)
    }

    fn send(&self, ev: StackEvent) {
        // a closed receiver drops the event, packets included
        let _ = self.tx.send(ev);
    }
}

impl Stack for ChannelStack {
    fn deliver(&self, qid: u16, pkt: Packet) {
        self.send(StackEvent::Packet { qid, pkt });
    }

    fn link_state_changed(&self, state: LinkState) {
        self.send(StackEvent::Link(state));
    }

    fn queue_hung(&self, qid: u16) {
        self.send(StackEvent::Hung(qid));
    }
}
